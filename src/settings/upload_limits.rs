use crate::db::{self, Database};

const MAX_TRANSFERS_KEY: &str = "upload_max_transfers";
const MAX_PREPARED_KEY: &str = "upload_max_prepared";
const MAX_FAILED_KEY: &str = "upload_max_failed";
const MAX_BACKGROUND_BYTES_KEY: &str = "upload_max_background_bytes";
const CHUNK_SIZE_KEY: &str = "upload_chunk_size_kb";

pub const MIN_TRANSFERS: usize = 1;
pub const MAX_TRANSFERS: usize = 4;
const DEFAULT_TRANSFERS: usize = 1;

pub const MIN_PREPARED: usize = 1;
pub const MAX_PREPARED: usize = 50;
const DEFAULT_PREPARED: usize = 10;

pub const MIN_FAILED: usize = 1;
pub const MAX_FAILED: usize = 100;
const DEFAULT_FAILED: usize = 5;

pub const MIN_BACKGROUND_BYTES: u64 = 1024 * 1024;
pub const MAX_BACKGROUND_BYTES: u64 = 2 * 1024 * 1024 * 1024;
const DEFAULT_BACKGROUND_BYTES: u64 = 100 * 1024 * 1024;

pub const MIN_CHUNK_SIZE_KB: usize = 100;
pub const MAX_CHUNK_SIZE_KB: usize = 20_000;
const DEFAULT_CHUNK_SIZE_KB: usize = 500;

/// 每次检查追加的自动上传候选数。
pub const MAX_AUTO_UPLOADS_PER_CHECK: usize = 500;

/// 每个调度 tick 读取一次的上限集合。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadLimits {
    pub max_transfers: usize,
    pub max_prepared: usize,
    pub max_failed: usize,
    pub max_background_bytes: u64,
    pub chunk_size_kb: usize,
}

impl Default for UploadLimits {
    fn default() -> Self {
        Self {
            max_transfers: DEFAULT_TRANSFERS,
            max_prepared: DEFAULT_PREPARED,
            max_failed: DEFAULT_FAILED,
            max_background_bytes: DEFAULT_BACKGROUND_BYTES,
            chunk_size_kb: DEFAULT_CHUNK_SIZE_KB,
        }
    }
}

impl UploadLimits {
    /// 读取全部上限；读取失败时回退到默认值。
    pub fn load(db: &Database) -> Self {
        let defaults = Self::default();
        Self {
            max_transfers: get_max_transfers(db).unwrap_or(defaults.max_transfers),
            max_prepared: get_max_prepared(db).unwrap_or(defaults.max_prepared),
            max_failed: get_max_failed(db).unwrap_or(defaults.max_failed),
            max_background_bytes: get_max_background_bytes(db)
                .unwrap_or(defaults.max_background_bytes),
            chunk_size_kb: get_chunk_size_kb(db).unwrap_or(defaults.chunk_size_kb),
        }
    }

    pub fn chunk_size_bytes(&self) -> usize {
        self.chunk_size_kb * 1024
    }
}

/// 并行传输数；缺失时返回默认值，错误时透传。
pub fn get_max_transfers(db: &Database) -> Result<usize, String> {
    read_clamped(db, MAX_TRANSFERS_KEY, DEFAULT_TRANSFERS, MIN_TRANSFERS, MAX_TRANSFERS)
}

pub fn set_max_transfers(db: &Database, value: usize) -> Result<usize, String> {
    write_checked(db, MAX_TRANSFERS_KEY, value, MIN_TRANSFERS, MAX_TRANSFERS)
}

/// 在传输之前预先准备好的文件数。
pub fn get_max_prepared(db: &Database) -> Result<usize, String> {
    read_clamped(db, MAX_PREPARED_KEY, DEFAULT_PREPARED, MIN_PREPARED, MAX_PREPARED)
}

pub fn set_max_prepared(db: &Database, value: usize) -> Result<usize, String> {
    write_checked(db, MAX_PREPARED_KEY, value, MIN_PREPARED, MAX_PREPARED)
}

/// 队列停止前允许的失败上传数。
pub fn get_max_failed(db: &Database) -> Result<usize, String> {
    read_clamped(db, MAX_FAILED_KEY, DEFAULT_FAILED, MIN_FAILED, MAX_FAILED)
}

pub fn set_max_failed(db: &Database, value: usize) -> Result<usize, String> {
    write_checked(db, MAX_FAILED_KEY, value, MIN_FAILED, MAX_FAILED)
}

/// 一次后台会话的字节预算。
pub fn get_max_background_bytes(db: &Database) -> Result<u64, String> {
    read_clamped(
        db,
        MAX_BACKGROUND_BYTES_KEY,
        DEFAULT_BACKGROUND_BYTES,
        MIN_BACKGROUND_BYTES,
        MAX_BACKGROUND_BYTES,
    )
}

pub fn set_max_background_bytes(db: &Database, value: u64) -> Result<u64, String> {
    write_checked(
        db,
        MAX_BACKGROUND_BYTES_KEY,
        value,
        MIN_BACKGROUND_BYTES,
        MAX_BACKGROUND_BYTES,
    )
}

pub fn get_chunk_size_kb(db: &Database) -> Result<usize, String> {
    read_clamped(
        db,
        CHUNK_SIZE_KEY,
        DEFAULT_CHUNK_SIZE_KB,
        MIN_CHUNK_SIZE_KB,
        MAX_CHUNK_SIZE_KB,
    )
}

pub fn set_chunk_size_kb(db: &Database, value: usize) -> Result<usize, String> {
    write_checked(db, CHUNK_SIZE_KEY, value, MIN_CHUNK_SIZE_KB, MAX_CHUNK_SIZE_KB)
}

fn read_clamped<T>(db: &Database, key: &str, default: T, min: T, max: T) -> Result<T, String>
where
    T: std::str::FromStr + Ord + Copy,
    T::Err: std::fmt::Display,
{
    match db::get_setting(db, key)? {
        Some(raw) => {
            let parsed = raw
                .parse::<T>()
                .map_err(|e| format!("invalid value for {key}: {e}"))?;
            Ok(parsed.clamp(min, max))
        }
        None => Ok(default),
    }
}

fn write_checked<T>(db: &Database, key: &str, value: T, min: T, max: T) -> Result<T, String>
where
    T: ToString + Ord + Copy + std::fmt::Display,
{
    if value < min || value > max {
        return Err(format!("{key} must be between {min} and {max}"));
    }
    db::set_setting(db, key, &value.to_string())?;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_unset() {
        let db = Database::open_in_memory().unwrap();
        assert_eq!(UploadLimits::load(&db), UploadLimits::default());
        assert_eq!(get_max_prepared(&db).unwrap(), 10);
        assert_eq!(get_max_failed(&db).unwrap(), 5);
        assert_eq!(get_max_background_bytes(&db).unwrap(), 100 * 1024 * 1024);
    }

    #[test]
    fn out_of_range_writes_are_rejected() {
        let db = Database::open_in_memory().unwrap();
        assert!(set_max_transfers(&db, 0).is_err());
        assert!(set_max_transfers(&db, MAX_TRANSFERS + 1).is_err());
        assert_eq!(set_max_transfers(&db, 2).unwrap(), 2);
        assert_eq!(get_max_transfers(&db).unwrap(), 2);
    }

    #[test]
    fn stored_values_are_clamped_on_read() {
        let db = Database::open_in_memory().unwrap();
        db::set_setting(&db, MAX_PREPARED_KEY, "500").unwrap();
        assert_eq!(get_max_prepared(&db).unwrap(), MAX_PREPARED);
        db::set_setting(&db, CHUNK_SIZE_KEY, "garbage").unwrap();
        assert!(get_chunk_size_kb(&db).is_err());
        assert_eq!(UploadLimits::load(&db).chunk_size_kb, DEFAULT_CHUNK_SIZE_KB);
    }
}
