use directories::ProjectDirs;
use rusqlite::{Connection, Transaction};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

mod albums;
mod images;
mod settings;
mod upload_requests;

pub use albums::*;
pub use images::*;
pub use settings::{delete_setting, get_setting, set_setting};
pub use upload_requests::*;

pub(crate) const QUALIFIER: &str = "org";
pub(crate) const ORGANIZATION: &str = "Piwigo";
pub(crate) const APPLICATION: &str = "Piwigo";
const DB_FILE_NAME: &str = "piwigo.db";

pub type StorageResult<T> = Result<T, String>;

/// 线性迁移链：第 `n` 项把 schema 版本从 `n` 升级到 `n + 1`。
/// 已发布的条目不得再修改。
const MIGRATIONS: &[&[&str]] = &[
    // 1：上传队列与键值设置表
    &[settings::SETTINGS_TABLE_SCHEMA, upload_requests::UPLOAD_TABLE_SCHEMA],
    // 2：相册缓存
    &[albums::ALBUM_TABLE_SCHEMA],
    // 3：图片缓存与相册成员关系
    &[images::IMAGE_TABLE_SCHEMA],
    // 4：按相册保存的重命名计数器
    &["ALTER TABLE albums ADD COLUMN current_counter INTEGER NOT NULL DEFAULT 1;"],
];

/// 嵌入式存储的共享句柄。所有读写都走同一个连接，批次天然串行。
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// 在平台数据目录中打开数据库。
    pub fn open_default() -> StorageResult<Self> {
        Self::open(&database_path()?)
    }

    pub fn open(path: &Path) -> StorageResult<Self> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .map_err(|e| format!("failed to create database directory {dir:?}: {e}"))?;
        }
        let conn =
            Connection::open(path).map_err(|e| format!("failed to open SQLite database: {e}"))?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| format!("failed to open in-memory database: {e}"))?;
        Self::from_connection(conn)
    }

    fn from_connection(mut conn: Connection) -> StorageResult<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .map_err(|e| format!("failed to enable foreign keys: {e}"))?;
        apply_migrations(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn with_connection<T, F>(&self, operation: F) -> StorageResult<T>
    where
        F: FnOnce(&Connection) -> StorageResult<T>,
    {
        let conn = self.lock();
        operation(&conn)
    }

    /// 在单个事务中执行 `operation`，仅在返回 `Ok` 时提交。
    pub fn with_transaction<T, F>(&self, operation: F) -> StorageResult<T>
    where
        F: FnOnce(&Transaction) -> StorageResult<T>,
    {
        let mut conn = self.lock();
        let tx = conn
            .transaction()
            .map_err(|e| format!("failed to begin transaction: {e}"))?;
        let value = operation(&tx)?;
        tx.commit()
            .map_err(|e| format!("failed to commit transaction: {e}"))?;
        Ok(value)
    }

    pub fn schema_version(&self) -> StorageResult<i64> {
        self.with_connection(|conn| read_user_version(conn))
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        match self.conn.lock() {
            Ok(guard) => guard,
            Err(poison) => {
                log::warn!("[db] connection lock poisoned; recovering");
                poison.into_inner()
            }
        }
    }
}

fn apply_migrations(conn: &mut Connection) -> StorageResult<()> {
    let current = read_user_version(conn)?;
    let target = MIGRATIONS.len() as i64;
    if current > target {
        return Err(format!(
            "database schema version {current} is newer than supported version {target}"
        ));
    }
    for (index, statements) in MIGRATIONS.iter().enumerate().skip(current as usize) {
        let version = index as i64 + 1;
        let tx = conn
            .transaction()
            .map_err(|e| format!("failed to begin migration {version}: {e}"))?;
        for statement in statements.iter() {
            tx.execute_batch(statement)
                .map_err(|e| format!("failed to apply migration {version}: {e}"))?;
        }
        tx.pragma_update(None, "user_version", version)
            .map_err(|e| format!("failed to record schema version {version}: {e}"))?;
        tx.commit()
            .map_err(|e| format!("failed to commit migration {version}: {e}"))?;
        log::info!("[db] migrated schema to version {version}");
    }
    Ok(())
}

fn read_user_version(conn: &Connection) -> StorageResult<i64> {
    conn.pragma_query_value(None, "user_version", |row| row.get(0))
        .map_err(|e| format!("failed to read schema version: {e}"))
}

fn database_path() -> StorageResult<PathBuf> {
    let dirs = ProjectDirs::from(QUALIFIER, ORGANIZATION, APPLICATION)
        .ok_or_else(|| "failed to resolve application data directory".to_string())?;
    Ok(dirs.data_dir().join(DB_FILE_NAME))
}

pub(crate) fn current_timestamp_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_database_runs_whole_migration_chain() {
        let db = Database::open_in_memory().unwrap();
        assert_eq!(db.schema_version().unwrap(), MIGRATIONS.len() as i64);
    }

    #[test]
    fn reopening_file_database_keeps_version() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("nested").join("piwigo.db");
        {
            let db = Database::open(&path).unwrap();
            set_setting(&db, "ping", "1").unwrap();
        }
        let db = Database::open(&path).unwrap();
        assert_eq!(db.schema_version().unwrap(), MIGRATIONS.len() as i64);
        assert_eq!(get_setting(&db, "ping").unwrap().as_deref(), Some("1"));
    }

    #[test]
    fn failed_transaction_is_rolled_back() {
        let db = Database::open_in_memory().unwrap();
        let result: StorageResult<()> = db.with_transaction(|tx| {
            tx.execute(
                "INSERT INTO settings (key, value, updated_at_millis) VALUES ('k', 'v', 0)",
                [],
            )
            .map_err(|e| e.to_string())?;
            Err("abort".to_string())
        });
        assert!(result.is_err());
        assert_eq!(get_setting(&db, "k").unwrap(), None);
    }
}
