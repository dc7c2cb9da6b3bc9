use rusqlite::{params, Connection, Row};

use super::StorageResult;

pub(crate) const IMAGE_TABLE_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS images (
    row_id INTEGER PRIMARY KEY AUTOINCREMENT,
    server_path TEXT NOT NULL,
    pwg_id INTEGER NOT NULL,
    uuid TEXT NOT NULL,
    title TEXT NOT NULL DEFAULT '',
    comment TEXT NOT NULL DEFAULT '',
    visits INTEGER NOT NULL DEFAULT 0,
    rating_score REAL NOT NULL DEFAULT -1,
    file_size INTEGER NOT NULL DEFAULT 0,
    md5_sum TEXT NOT NULL DEFAULT '',
    file_name TEXT NOT NULL DEFAULT '',
    is_video INTEGER NOT NULL DEFAULT 0,
    date_created_millis INTEGER NOT NULL,
    date_posted_millis INTEGER NOT NULL,
    author TEXT NOT NULL DEFAULT '',
    privacy_level INTEGER NOT NULL DEFAULT 0,
    tag_ids TEXT NOT NULL DEFAULT '',
    latitude REAL,
    longitude REAL,
    sizes TEXT NOT NULL DEFAULT '{}',
    rank_manual INTEGER NOT NULL,
    rank_random INTEGER NOT NULL,
    updated_at_millis INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_images_scope ON images (server_path, pwg_id);
CREATE TABLE IF NOT EXISTS image_albums (
    image_row_id INTEGER NOT NULL REFERENCES images (row_id) ON DELETE CASCADE,
    server_path TEXT NOT NULL,
    username TEXT NOT NULL,
    album_id INTEGER NOT NULL,
    PRIMARY KEY (image_row_id, username, album_id)
);
CREATE INDEX IF NOT EXISTS idx_image_albums_album ON image_albums (server_path, username, album_id);";

const IMAGE_COLUMNS: &str = "
    images.row_id,
    images.server_path,
    images.pwg_id,
    images.uuid,
    images.title,
    images.comment,
    images.visits,
    images.rating_score,
    images.file_size,
    images.md5_sum,
    images.file_name,
    images.is_video,
    images.date_created_millis,
    images.date_posted_millis,
    images.author,
    images.privacy_level,
    images.tag_ids,
    images.latitude,
    images.longitude,
    images.sizes,
    images.rank_manual,
    images.rank_random,
    images.updated_at_millis";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImageRecord {
    pub row_id: i64,
    pub server_path: String,
    pub pwg_id: i64,
    pub uuid: String,
    pub title: String,
    pub comment: String,
    pub visits: i64,
    pub rating_score: f64,
    pub file_size: i64,
    pub md5_sum: String,
    pub file_name: String,
    pub is_video: bool,
    pub date_created_millis: i64,
    pub date_posted_millis: i64,
    pub author: String,
    pub privacy_level: i64,
    pub tag_ids: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    /// 每个衍生尺寸一条记录的 JSON 文档。
    pub sizes: String,
    pub rank_manual: i64,
    pub rank_random: i64,
    pub updated_at_millis: i64,
}

pub fn insert_image(conn: &Connection, record: &ImageRecord) -> StorageResult<i64> {
    conn.execute(
        "INSERT INTO images (
            server_path,
            pwg_id,
            uuid,
            title,
            comment,
            visits,
            rating_score,
            file_size,
            md5_sum,
            file_name,
            is_video,
            date_created_millis,
            date_posted_millis,
            author,
            privacy_level,
            tag_ids,
            latitude,
            longitude,
            sizes,
            rank_manual,
            rank_random,
            updated_at_millis
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        params![
            record.server_path,
            record.pwg_id,
            record.uuid,
            record.title,
            record.comment,
            record.visits,
            record.rating_score,
            record.file_size,
            record.md5_sum,
            record.file_name,
            record.is_video,
            record.date_created_millis,
            record.date_posted_millis,
            record.author,
            record.privacy_level,
            record.tag_ids,
            record.latitude,
            record.longitude,
            record.sizes,
            record.rank_manual,
            record.rank_random,
            record.updated_at_millis,
        ],
    )
    .map_err(|e| format!("failed to insert image {}: {e}", record.pwg_id))?;
    Ok(conn.last_insert_rowid())
}

pub fn update_image(conn: &Connection, record: &ImageRecord) -> StorageResult<()> {
    conn.execute(
        "UPDATE images SET
            uuid = ?,
            title = ?,
            comment = ?,
            visits = ?,
            rating_score = ?,
            file_size = ?,
            md5_sum = ?,
            file_name = ?,
            is_video = ?,
            date_created_millis = ?,
            date_posted_millis = ?,
            author = ?,
            privacy_level = ?,
            tag_ids = ?,
            latitude = ?,
            longitude = ?,
            sizes = ?,
            rank_manual = ?,
            rank_random = ?,
            updated_at_millis = ?
        WHERE row_id = ?",
        params![
            record.uuid,
            record.title,
            record.comment,
            record.visits,
            record.rating_score,
            record.file_size,
            record.md5_sum,
            record.file_name,
            record.is_video,
            record.date_created_millis,
            record.date_posted_millis,
            record.author,
            record.privacy_level,
            record.tag_ids,
            record.latitude,
            record.longitude,
            record.sizes,
            record.rank_manual,
            record.rank_random,
            record.updated_at_millis,
            record.row_id,
        ],
    )
    .map_err(|e| format!("failed to update image {}: {e}", record.pwg_id))?;
    Ok(())
}

/// 某服务器上带有 `pwg_id` 的所有行，按创建先后排序。
pub fn find_images(
    conn: &Connection,
    server_path: &str,
    pwg_id: i64,
) -> StorageResult<Vec<ImageRecord>> {
    select_images(
        conn,
        "FROM images WHERE images.server_path = ? AND images.pwg_id = ? ORDER BY images.row_id ASC",
        params![server_path, pwg_id],
    )
}

pub fn load_images_in_album(
    conn: &Connection,
    server_path: &str,
    username: &str,
    album_id: i64,
) -> StorageResult<Vec<ImageRecord>> {
    select_images(
        conn,
        "FROM images
        JOIN image_albums ON image_albums.image_row_id = images.row_id
        WHERE image_albums.server_path = ? AND image_albums.username = ? AND image_albums.album_id = ?
        ORDER BY images.row_id ASC",
        params![server_path, username, album_id],
    )
}

pub fn delete_image_rows(conn: &Connection, row_ids: &[i64]) -> StorageResult<usize> {
    let mut deleted = 0;
    for row_id in row_ids {
        deleted += conn
            .execute("DELETE FROM images WHERE row_id = ?", params![row_id])
            .map_err(|e| format!("failed to delete image row {row_id}: {e}"))?;
    }
    Ok(deleted)
}

pub fn load_image_album_ids(
    conn: &Connection,
    image_row_id: i64,
    username: &str,
) -> StorageResult<Vec<i64>> {
    let mut stmt = conn
        .prepare(
            "SELECT album_id FROM image_albums
            WHERE image_row_id = ? AND username = ?
            ORDER BY album_id ASC",
        )
        .map_err(|e| format!("failed to prepare membership query: {e}"))?;
    let rows = stmt
        .query_map(params![image_row_id, username], |row| row.get(0))
        .map_err(|e| format!("failed to query membership of image row {image_row_id}: {e}"))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| format!("failed to parse membership row: {e}"))?;
    Ok(rows)
}

pub fn count_image_memberships(conn: &Connection, image_row_id: i64) -> StorageResult<i64> {
    conn.query_row(
        "SELECT COUNT(*) FROM image_albums WHERE image_row_id = ?",
        params![image_row_id],
        |row| row.get(0),
    )
    .map_err(|e| format!("failed to count memberships of image row {image_row_id}: {e}"))
}

/// 关联此前不存在时返回 `true`。
pub fn add_image_to_album(
    conn: &Connection,
    image_row_id: i64,
    server_path: &str,
    username: &str,
    album_id: i64,
) -> StorageResult<bool> {
    let inserted = conn
        .execute(
            "INSERT OR IGNORE INTO image_albums (image_row_id, server_path, username, album_id)
            VALUES (?, ?, ?, ?)",
            params![image_row_id, server_path, username, album_id],
        )
        .map_err(|e| format!("failed to attach image row {image_row_id} to {album_id}: {e}"))?;
    Ok(inserted > 0)
}

pub fn remove_image_from_album(
    conn: &Connection,
    image_row_id: i64,
    username: &str,
    album_id: i64,
) -> StorageResult<bool> {
    let removed = conn
        .execute(
            "DELETE FROM image_albums WHERE image_row_id = ? AND username = ? AND album_id = ?",
            params![image_row_id, username, album_id],
        )
        .map_err(|e| format!("failed to detach image row {image_row_id} from {album_id}: {e}"))?;
    Ok(removed > 0)
}

/// 相册离开缓存后，解除其下所有图片的关联。
pub fn remove_album_memberships(
    conn: &Connection,
    server_path: &str,
    username: &str,
    album_id: i64,
) -> StorageResult<usize> {
    conn.execute(
        "DELETE FROM image_albums WHERE server_path = ? AND username = ? AND album_id = ?",
        params![server_path, username, album_id],
    )
    .map_err(|e| format!("failed to detach images from album {album_id}: {e}"))
}

fn select_images<P: rusqlite::Params>(
    conn: &Connection,
    from_clause: &str,
    values: P,
) -> StorageResult<Vec<ImageRecord>> {
    let sql = format!("SELECT {IMAGE_COLUMNS} {from_clause}");
    let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| format!("failed to prepare image query: {e}"))?;
    let rows = stmt
        .query_map(values, map_image)
        .map_err(|e| format!("failed to query images: {e}"))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| format!("failed to parse image row: {e}"))?;
    Ok(rows)
}

fn map_image(row: &Row) -> rusqlite::Result<ImageRecord> {
    Ok(ImageRecord {
        row_id: row.get(0)?,
        server_path: row.get(1)?,
        pwg_id: row.get(2)?,
        uuid: row.get(3)?,
        title: row.get(4)?,
        comment: row.get(5)?,
        visits: row.get(6)?,
        rating_score: row.get(7)?,
        file_size: row.get(8)?,
        md5_sum: row.get(9)?,
        file_name: row.get(10)?,
        is_video: row.get(11)?,
        date_created_millis: row.get(12)?,
        date_posted_millis: row.get(13)?,
        author: row.get(14)?,
        privacy_level: row.get(15)?,
        tag_ids: row.get(16)?,
        latitude: row.get(17)?,
        longitude: row.get(18)?,
        sizes: row.get(19)?,
        rank_manual: row.get(20)?,
        rank_random: row.get(21)?,
        updated_at_millis: row.get(22)?,
    })
}
