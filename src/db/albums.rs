use rusqlite::{params, Connection, Row};

use super::StorageResult;

pub(crate) const ALBUM_TABLE_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS albums (
    row_id INTEGER PRIMARY KEY AUTOINCREMENT,
    server_path TEXT NOT NULL,
    username TEXT NOT NULL,
    pwg_id INTEGER NOT NULL,
    uuid TEXT NOT NULL,
    name TEXT NOT NULL,
    comment TEXT NOT NULL DEFAULT '',
    global_rank TEXT NOT NULL DEFAULT '',
    parent_id INTEGER NOT NULL DEFAULT 0,
    upper_ids TEXT NOT NULL DEFAULT '',
    image_sort TEXT NOT NULL DEFAULT '',
    nb_images INTEGER NOT NULL DEFAULT 0,
    total_nb_images INTEGER NOT NULL DEFAULT 0,
    nb_sub_albums INTEGER NOT NULL DEFAULT 0,
    thumbnail_id INTEGER NOT NULL DEFAULT 0,
    thumbnail_url TEXT,
    date_last_millis INTEGER NOT NULL,
    has_upload_rights INTEGER NOT NULL DEFAULT 0,
    updated_at_millis INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_albums_scope ON albums (server_path, username, pwg_id);
CREATE INDEX IF NOT EXISTS idx_albums_parent ON albums (server_path, username, parent_id);";

const ALBUM_COLUMNS: &str = "
    row_id,
    server_path,
    username,
    pwg_id,
    uuid,
    name,
    comment,
    global_rank,
    parent_id,
    upper_ids,
    image_sort,
    nb_images,
    total_nb_images,
    nb_sub_albums,
    thumbnail_id,
    thumbnail_url,
    date_last_millis,
    has_upload_rights,
    current_counter,
    updated_at_millis";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AlbumRecord {
    pub row_id: i64,
    pub server_path: String,
    pub username: String,
    pub pwg_id: i64,
    pub uuid: String,
    pub name: String,
    pub comment: String,
    pub global_rank: String,
    pub parent_id: i64,
    pub upper_ids: String,
    pub image_sort: String,
    pub nb_images: i64,
    pub total_nb_images: i64,
    pub nb_sub_albums: i64,
    pub thumbnail_id: i64,
    pub thumbnail_url: Option<String>,
    pub date_last_millis: i64,
    pub has_upload_rights: bool,
    pub current_counter: i64,
    pub updated_at_millis: i64,
}

pub fn insert_album(conn: &Connection, record: &AlbumRecord) -> StorageResult<i64> {
    conn.execute(
        "INSERT INTO albums (
            server_path,
            username,
            pwg_id,
            uuid,
            name,
            comment,
            global_rank,
            parent_id,
            upper_ids,
            image_sort,
            nb_images,
            total_nb_images,
            nb_sub_albums,
            thumbnail_id,
            thumbnail_url,
            date_last_millis,
            has_upload_rights,
            current_counter,
            updated_at_millis
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        params![
            record.server_path,
            record.username,
            record.pwg_id,
            record.uuid,
            record.name,
            record.comment,
            record.global_rank,
            record.parent_id,
            record.upper_ids,
            record.image_sort,
            record.nb_images,
            record.total_nb_images,
            record.nb_sub_albums,
            record.thumbnail_id,
            record.thumbnail_url,
            record.date_last_millis,
            record.has_upload_rights,
            record.current_counter,
            record.updated_at_millis,
        ],
    )
    .map_err(|e| format!("failed to insert album {}: {e}", record.pwg_id))?;
    Ok(conn.last_insert_rowid())
}

pub fn update_album(conn: &Connection, record: &AlbumRecord) -> StorageResult<()> {
    conn.execute(
        "UPDATE albums SET
            pwg_id = ?,
            uuid = ?,
            name = ?,
            comment = ?,
            global_rank = ?,
            parent_id = ?,
            upper_ids = ?,
            image_sort = ?,
            nb_images = ?,
            total_nb_images = ?,
            nb_sub_albums = ?,
            thumbnail_id = ?,
            thumbnail_url = ?,
            date_last_millis = ?,
            has_upload_rights = ?,
            current_counter = ?,
            updated_at_millis = ?
        WHERE row_id = ?",
        params![
            record.pwg_id,
            record.uuid,
            record.name,
            record.comment,
            record.global_rank,
            record.parent_id,
            record.upper_ids,
            record.image_sort,
            record.nb_images,
            record.total_nb_images,
            record.nb_sub_albums,
            record.thumbnail_id,
            record.thumbnail_url,
            record.date_last_millis,
            record.has_upload_rights,
            record.current_counter,
            record.updated_at_millis,
            record.row_id,
        ],
    )
    .map_err(|e| format!("failed to update album {}: {e}", record.pwg_id))?;
    Ok(())
}

/// 带有 `pwg_id` 的所有行，按创建先后排序。
pub fn find_albums(
    conn: &Connection,
    server_path: &str,
    username: &str,
    pwg_id: i64,
) -> StorageResult<Vec<AlbumRecord>> {
    select_albums(
        conn,
        "WHERE server_path = ? AND username = ? AND pwg_id = ? ORDER BY row_id ASC",
        params![server_path, username, pwg_id],
    )
}

pub fn load_albums(
    conn: &Connection,
    server_path: &str,
    username: &str,
) -> StorageResult<Vec<AlbumRecord>> {
    select_albums(
        conn,
        "WHERE server_path = ? AND username = ? ORDER BY row_id ASC",
        params![server_path, username],
    )
}

pub fn load_child_albums(
    conn: &Connection,
    server_path: &str,
    username: &str,
    parent_id: i64,
) -> StorageResult<Vec<AlbumRecord>> {
    select_albums(
        conn,
        "WHERE server_path = ? AND username = ? AND parent_id = ? AND pwg_id != ? ORDER BY row_id ASC",
        params![server_path, username, parent_id, parent_id],
    )
}

pub fn delete_album_rows(conn: &Connection, row_ids: &[i64]) -> StorageResult<usize> {
    let mut deleted = 0;
    for row_id in row_ids {
        deleted += conn
            .execute("DELETE FROM albums WHERE row_id = ?", params![row_id])
            .map_err(|e| format!("failed to delete album row {row_id}: {e}"))?;
    }
    Ok(deleted)
}

fn select_albums<P: rusqlite::Params>(
    conn: &Connection,
    clause: &str,
    values: P,
) -> StorageResult<Vec<AlbumRecord>> {
    let sql = format!("SELECT {ALBUM_COLUMNS} FROM albums {clause}");
    let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| format!("failed to prepare album query: {e}"))?;
    let rows = stmt
        .query_map(values, map_album)
        .map_err(|e| format!("failed to query albums: {e}"))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| format!("failed to parse album row: {e}"))?;
    Ok(rows)
}

fn map_album(row: &Row) -> rusqlite::Result<AlbumRecord> {
    Ok(AlbumRecord {
        row_id: row.get(0)?,
        server_path: row.get(1)?,
        username: row.get(2)?,
        pwg_id: row.get(3)?,
        uuid: row.get(4)?,
        name: row.get(5)?,
        comment: row.get(6)?,
        global_rank: row.get(7)?,
        parent_id: row.get(8)?,
        upper_ids: row.get(9)?,
        image_sort: row.get(10)?,
        nb_images: row.get(11)?,
        total_nb_images: row.get(12)?,
        nb_sub_albums: row.get(13)?,
        thumbnail_id: row.get(14)?,
        thumbnail_url: row.get(15)?,
        date_last_millis: row.get(16)?,
        has_upload_rights: row.get(17)?,
        current_counter: row.get(18)?,
        updated_at_millis: row.get(19)?,
    })
}
