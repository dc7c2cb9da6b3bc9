use rusqlite::{params, params_from_iter, types::Value, Connection, OptionalExtension, Row};

use super::StorageResult;

pub(crate) const UPLOAD_TABLE_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS upload_requests (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    local_identifier TEXT NOT NULL,
    server_path TEXT NOT NULL,
    username TEXT NOT NULL,
    category INTEGER NOT NULL,
    server_file_types TEXT NOT NULL DEFAULT '',
    request_date_millis INTEGER NOT NULL,
    state INTEGER NOT NULL,
    request_error TEXT NOT NULL DEFAULT '',
    creation_date_millis INTEGER NOT NULL DEFAULT 0,
    file_name TEXT NOT NULL DEFAULT '',
    mime_type TEXT NOT NULL DEFAULT '',
    md5_sum TEXT NOT NULL DEFAULT '',
    is_video INTEGER NOT NULL DEFAULT 0,
    author TEXT NOT NULL DEFAULT '',
    privacy_level INTEGER NOT NULL DEFAULT 0,
    image_title TEXT NOT NULL DEFAULT '',
    comment TEXT NOT NULL DEFAULT '',
    tag_ids TEXT NOT NULL DEFAULT '',
    image_id INTEGER NOT NULL DEFAULT 0,
    strip_gps INTEGER NOT NULL DEFAULT 0,
    resize_image INTEGER NOT NULL DEFAULT 0,
    photo_max_size INTEGER NOT NULL DEFAULT 0,
    compress_image INTEGER NOT NULL DEFAULT 0,
    photo_quality INTEGER NOT NULL DEFAULT 98,
    file_name_rules TEXT NOT NULL DEFAULT '',
    delete_image_after_upload INTEGER NOT NULL DEFAULT 0,
    marked_for_auto_upload INTEGER NOT NULL DEFAULT 0,
    updated_at_millis INTEGER NOT NULL,
    UNIQUE (local_identifier, server_path, username)
);
CREATE INDEX IF NOT EXISTS idx_upload_requests_state ON upload_requests (state);
CREATE INDEX IF NOT EXISTS idx_upload_requests_date ON upload_requests (request_date_millis);";

const UPLOAD_COLUMNS: &str = "
    id,
    local_identifier,
    server_path,
    username,
    category,
    server_file_types,
    request_date_millis,
    state,
    request_error,
    creation_date_millis,
    file_name,
    mime_type,
    md5_sum,
    is_video,
    author,
    privacy_level,
    image_title,
    comment,
    tag_ids,
    image_id,
    strip_gps,
    resize_image,
    photo_max_size,
    compress_image,
    photo_quality,
    file_name_rules,
    delete_image_after_upload,
    marked_for_auto_upload,
    updated_at_millis";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UploadRequestRecord {
    pub id: i64,
    pub local_identifier: String,
    pub server_path: String,
    pub username: String,
    pub category: i64,
    pub server_file_types: String,
    pub request_date_millis: i64,
    pub state: i64,
    pub request_error: String,
    pub creation_date_millis: i64,
    pub file_name: String,
    pub mime_type: String,
    pub md5_sum: String,
    pub is_video: bool,
    pub author: String,
    pub privacy_level: i64,
    pub image_title: String,
    pub comment: String,
    pub tag_ids: String,
    pub image_id: i64,
    pub strip_gps: bool,
    pub resize_image: bool,
    pub photo_max_size: i64,
    pub compress_image: bool,
    pub photo_quality: i64,
    pub file_name_rules: String,
    pub delete_image_after_upload: bool,
    pub marked_for_auto_upload: bool,
    pub updated_at_millis: i64,
}

/// 上传队列所有读取共用的过滤条件，`None` 表示不限。
#[derive(Debug, Clone, Default)]
pub struct UploadQuery {
    pub server_path: String,
    pub username: String,
    pub states: Option<Vec<i64>>,
    pub marked_for_auto_upload: Option<bool>,
    pub delete_image_after_upload: Option<bool>,
    pub image_ids: Option<Vec<i64>>,
    pub manual_first: bool,
}

pub fn insert_upload_request(conn: &Connection, record: &UploadRequestRecord) -> StorageResult<i64> {
    conn.execute(
        "INSERT INTO upload_requests (
            local_identifier,
            server_path,
            username,
            category,
            server_file_types,
            request_date_millis,
            state,
            request_error,
            creation_date_millis,
            file_name,
            mime_type,
            md5_sum,
            is_video,
            author,
            privacy_level,
            image_title,
            comment,
            tag_ids,
            image_id,
            strip_gps,
            resize_image,
            photo_max_size,
            compress_image,
            photo_quality,
            file_name_rules,
            delete_image_after_upload,
            marked_for_auto_upload,
            updated_at_millis
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        params![
            record.local_identifier,
            record.server_path,
            record.username,
            record.category,
            record.server_file_types,
            record.request_date_millis,
            record.state,
            record.request_error,
            record.creation_date_millis,
            record.file_name,
            record.mime_type,
            record.md5_sum,
            record.is_video,
            record.author,
            record.privacy_level,
            record.image_title,
            record.comment,
            record.tag_ids,
            record.image_id,
            record.strip_gps,
            record.resize_image,
            record.photo_max_size,
            record.compress_image,
            record.photo_quality,
            record.file_name_rules,
            record.delete_image_after_upload,
            record.marked_for_auto_upload,
            record.updated_at_millis,
        ],
    )
    .map_err(|e| format!("failed to insert upload request {}: {e}", record.local_identifier))?;
    Ok(conn.last_insert_rowid())
}

/// 重写已有行的所有列。
pub fn update_upload_request(conn: &Connection, record: &UploadRequestRecord) -> StorageResult<usize> {
    conn.execute(
        "UPDATE upload_requests SET
            local_identifier = ?,
            server_path = ?,
            username = ?,
            category = ?,
            server_file_types = ?,
            request_date_millis = ?,
            state = ?,
            request_error = ?,
            creation_date_millis = ?,
            file_name = ?,
            mime_type = ?,
            md5_sum = ?,
            is_video = ?,
            author = ?,
            privacy_level = ?,
            image_title = ?,
            comment = ?,
            tag_ids = ?,
            image_id = ?,
            strip_gps = ?,
            resize_image = ?,
            photo_max_size = ?,
            compress_image = ?,
            photo_quality = ?,
            file_name_rules = ?,
            delete_image_after_upload = ?,
            marked_for_auto_upload = ?,
            updated_at_millis = ?
        WHERE id = ?",
        params![
            record.local_identifier,
            record.server_path,
            record.username,
            record.category,
            record.server_file_types,
            record.request_date_millis,
            record.state,
            record.request_error,
            record.creation_date_millis,
            record.file_name,
            record.mime_type,
            record.md5_sum,
            record.is_video,
            record.author,
            record.privacy_level,
            record.image_title,
            record.comment,
            record.tag_ids,
            record.image_id,
            record.strip_gps,
            record.resize_image,
            record.photo_max_size,
            record.compress_image,
            record.photo_quality,
            record.file_name_rules,
            record.delete_image_after_upload,
            record.marked_for_auto_upload,
            record.updated_at_millis,
            record.id,
        ],
    )
    .map_err(|e| format!("failed to update upload request {}: {e}", record.id))
}

pub fn find_upload_request_id(
    conn: &Connection,
    local_identifier: &str,
    server_path: &str,
    username: &str,
) -> StorageResult<Option<i64>> {
    conn.query_row(
        "SELECT id FROM upload_requests
        WHERE local_identifier = ? AND server_path = ? AND username = ?",
        params![local_identifier, server_path, username],
        |row| row.get(0),
    )
    .optional()
    .map_err(|e| format!("failed to look up upload request {local_identifier}: {e}"))
}

pub fn load_upload_request(conn: &Connection, id: i64) -> StorageResult<Option<UploadRequestRecord>> {
    conn.query_row(
        &format!("SELECT {UPLOAD_COLUMNS} FROM upload_requests WHERE id = ?"),
        params![id],
        map_upload_request,
    )
    .optional()
    .map_err(|e| format!("failed to read upload request {id}: {e}"))
}

pub fn query_upload_requests(
    conn: &Connection,
    query: &UploadQuery,
) -> StorageResult<Vec<UploadRequestRecord>> {
    let (clause, values) = where_clause(query);
    let order = if query.manual_first {
        "ORDER BY marked_for_auto_upload ASC, request_date_millis ASC, id ASC"
    } else {
        "ORDER BY request_date_millis ASC, id ASC"
    };
    let sql = format!("SELECT {UPLOAD_COLUMNS} FROM upload_requests {clause} {order}");
    let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| format!("failed to prepare upload request query: {e}"))?;
    let rows = stmt
        .query_map(params_from_iter(values), map_upload_request)
        .map_err(|e| format!("failed to query upload requests: {e}"))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| format!("failed to parse upload request row: {e}"))?;
    Ok(rows)
}

pub fn count_upload_requests(conn: &Connection, query: &UploadQuery) -> StorageResult<i64> {
    let (clause, values) = where_clause(query);
    let sql = format!("SELECT COUNT(*) FROM upload_requests {clause}");
    conn.query_row(&sql, params_from_iter(values), |row| row.get(0))
        .map_err(|e| format!("failed to count upload requests: {e}"))
}

/// 只写状态相关列，其他字段的并发修改得以保留。
pub fn update_upload_state(
    conn: &Connection,
    id: i64,
    state: i64,
    request_error: &str,
    updated_at_millis: i64,
) -> StorageResult<usize> {
    conn.execute(
        "UPDATE upload_requests
        SET state = ?, request_error = ?, updated_at_millis = ?
        WHERE id = ?",
        params![state, request_error, updated_at_millis, id],
    )
    .map_err(|e| format!("failed to update state of upload request {id}: {e}"))
}

pub fn update_upload_delete_flag(
    conn: &Connection,
    ids: &[i64],
    delete_image_after_upload: bool,
    updated_at_millis: i64,
) -> StorageResult<usize> {
    let mut changed = 0;
    for id in ids {
        changed += conn
            .execute(
                "UPDATE upload_requests
                SET delete_image_after_upload = ?, updated_at_millis = ?
                WHERE id = ?",
                params![delete_image_after_upload, updated_at_millis, id],
            )
            .map_err(|e| format!("failed to update deletion flag of {id}: {e}"))?;
    }
    Ok(changed)
}

pub fn mark_upload_requests_deleted(
    conn: &Connection,
    server_path: &str,
    image_ids: &[i64],
    deleted_state: i64,
    updated_at_millis: i64,
) -> StorageResult<Vec<i64>> {
    let mut marked = Vec::new();
    for image_id in image_ids {
        let mut stmt = conn
            .prepare("SELECT id FROM upload_requests WHERE server_path = ? AND image_id = ?")
            .map_err(|e| format!("failed to prepare deleted image lookup: {e}"))?;
        let ids = stmt
            .query_map(params![server_path, image_id], |row| row.get::<_, i64>(0))
            .map_err(|e| format!("failed to look up image {image_id}: {e}"))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| format!("failed to parse upload request id: {e}"))?;
        for id in ids {
            conn.execute(
                "UPDATE upload_requests SET state = ?, updated_at_millis = ? WHERE id = ?",
                params![deleted_state, updated_at_millis, id],
            )
            .map_err(|e| format!("failed to mark upload request {id} deleted: {e}"))?;
            marked.push(id);
        }
    }
    Ok(marked)
}

pub fn delete_upload_requests(conn: &Connection, ids: &[i64]) -> StorageResult<usize> {
    let mut deleted = 0;
    for id in ids {
        deleted += conn
            .execute("DELETE FROM upload_requests WHERE id = ?", params![id])
            .map_err(|e| format!("failed to delete upload request {id}: {e}"))?;
    }
    Ok(deleted)
}

fn where_clause(query: &UploadQuery) -> (String, Vec<Value>) {
    let mut conditions = vec!["server_path = ?".to_string(), "username = ?".to_string()];
    let mut values = vec![
        Value::Text(query.server_path.clone()),
        Value::Text(query.username.clone()),
    ];
    if let Some(states) = &query.states {
        conditions.push(format!("state IN ({})", placeholders(states.len())));
        values.extend(states.iter().map(|state| Value::Integer(*state)));
    }
    if let Some(flag) = query.marked_for_auto_upload {
        conditions.push("marked_for_auto_upload = ?".to_string());
        values.push(Value::Integer(flag as i64));
    }
    if let Some(flag) = query.delete_image_after_upload {
        conditions.push("delete_image_after_upload = ?".to_string());
        values.push(Value::Integer(flag as i64));
    }
    if let Some(image_ids) = &query.image_ids {
        conditions.push(format!("image_id IN ({})", placeholders(image_ids.len())));
        values.extend(image_ids.iter().map(|id| Value::Integer(*id)));
    }
    (format!("WHERE {}", conditions.join(" AND ")), values)
}

fn placeholders(count: usize) -> String {
    if count == 0 {
        // `IN ()` 是语法错误；NULL 永远不会匹配。
        return "NULL".to_string();
    }
    vec!["?"; count].join(", ")
}

fn map_upload_request(row: &Row) -> rusqlite::Result<UploadRequestRecord> {
    Ok(UploadRequestRecord {
        id: row.get(0)?,
        local_identifier: row.get(1)?,
        server_path: row.get(2)?,
        username: row.get(3)?,
        category: row.get(4)?,
        server_file_types: row.get(5)?,
        request_date_millis: row.get(6)?,
        state: row.get(7)?,
        request_error: row.get(8)?,
        creation_date_millis: row.get(9)?,
        file_name: row.get(10)?,
        mime_type: row.get(11)?,
        md5_sum: row.get(12)?,
        is_video: row.get(13)?,
        author: row.get(14)?,
        privacy_level: row.get(15)?,
        image_title: row.get(16)?,
        comment: row.get(17)?,
        tag_ids: row.get(18)?,
        image_id: row.get(19)?,
        strip_gps: row.get(20)?,
        resize_image: row.get(21)?,
        photo_max_size: row.get(22)?,
        compress_image: row.get(23)?,
        photo_quality: row.get(24)?,
        file_name_rules: row.get(25)?,
        delete_image_after_upload: row.get(26)?,
        marked_for_auto_upload: row.get(27)?,
        updated_at_millis: row.get(28)?,
    })
}
