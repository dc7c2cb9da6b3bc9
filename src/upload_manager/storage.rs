use super::counter::recover_lock;
use super::models::{
    Account, FileNameRules, UploadChange, UploadCounts, UploadId, UploadOptions, UploadProperties,
    UploadRequest,
};
use super::state::UploadState;
use crate::db::{
    count_upload_requests, current_timestamp_millis, delete_upload_requests,
    find_upload_request_id, insert_upload_request, load_upload_request,
    mark_upload_requests_deleted, query_upload_requests, update_upload_delete_flag,
    update_upload_request, update_upload_state, Database, UploadQuery, UploadRequestRecord,
};
use crate::error::UploadError;
use crate::settings;
use chrono::{DateTime, Utc};
use std::{
    fs,
    path::{Path, PathBuf},
    sync::{
        mpsc::{self, Receiver, SyncSender, TrySendError},
        Mutex,
    },
};

/// `import_requests` 每个事务合并的记录数。
pub const IMPORT_BATCH_SIZE: usize = 256;
const CHANGE_CHANNEL_CAP: usize = 64;

/// 当前账号上传队列的读取过滤条件。
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UploadFilter {
    /// `None` 匹配所有状态。
    pub states: Option<Vec<UploadState>>,
    pub marked_for_auto_upload: Option<bool>,
    pub delete_image_after_upload: Option<bool>,
    pub image_ids: Option<Vec<i64>>,
    /// 手动请求排在自动上传请求之前。
    pub manual_first: bool,
}

impl UploadFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn in_states(states: &[UploadState]) -> Self {
        Self {
            states: Some(states.to_vec()),
            ..Self::default()
        }
    }

    pub fn auto_upload(mut self, flag: bool) -> Self {
        self.marked_for_auto_upload = Some(flag);
        self
    }

    pub fn delete_after_upload(mut self, flag: bool) -> Self {
        self.delete_image_after_upload = Some(flag);
        self
    }

    pub fn manual_first(mut self) -> Self {
        self.manual_first = true;
        self
    }
}

/// 上传队列持久化接口。所有调用都限定在 [`UploadStore::set_scope`] 设置的账号内。
pub trait UploadStore: Send + Sync {
    fn scope(&self) -> Account;
    fn set_scope(&self, account: Account);
    /// 合并上传描述；返回写入的条数。
    fn import_requests(&self, properties: &[UploadProperties]) -> Result<usize, UploadError>;
    /// 只写状态与错误列。
    fn update_state(
        &self,
        id: UploadId,
        state: UploadState,
        error: Option<&str>,
    ) -> Result<(), UploadError>;
    /// 整行写入。失败只记日志，下一次变更会重试。
    fn save(&self, request: &UploadRequest);
    fn load(&self, id: UploadId) -> Result<Option<UploadRequest>, UploadError>;
    fn fetch(&self, filter: &UploadFilter) -> Result<Vec<UploadRequest>, UploadError>;
    /// 标记服务器图片已被删除的请求。
    fn mark_deleted(&self, image_ids: &[i64]) -> Result<Vec<UploadId>, UploadError>;
    fn set_delete_after_upload(&self, ids: &[UploadId], flag: bool) -> Result<(), UploadError>;
    /// 物理删除，连同暂存文件。
    fn delete(&self, ids: &[UploadId]) -> Result<usize, UploadError>;
    fn counts(&self) -> UploadCounts;
    fn subscribe(&self) -> Receiver<UploadChange>;
    /// 存放暂存文件与分享文件的目录。
    fn uploads_dir(&self) -> PathBuf;
}

pub struct SqliteUploadStore {
    db: Database,
    scope: Mutex<Account>,
    uploads_dir: PathBuf,
    subscribers: Mutex<Vec<SyncSender<UploadChange>>>,
}

impl SqliteUploadStore {
    pub fn new(db: Database, uploads_dir: PathBuf) -> Self {
        Self {
            db,
            scope: Mutex::new(Account::default()),
            uploads_dir,
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// 使用设置表中配置的暂存目录。
    pub fn with_configured_directory(db: Database) -> Result<Self, UploadError> {
        let uploads_dir = settings::get_uploads_directory(&db)?;
        Ok(Self::new(db, uploads_dir))
    }

    fn query(&self, filter: &UploadFilter) -> UploadQuery {
        let scope = self.scope();
        UploadQuery {
            server_path: scope.server_path,
            username: scope.username,
            states: filter
                .states
                .as_ref()
                .map(|states| states.iter().map(|state| state.raw_value()).collect()),
            marked_for_auto_upload: filter.marked_for_auto_upload,
            delete_image_after_upload: filter.delete_image_after_upload,
            image_ids: filter.image_ids.clone(),
            manual_first: filter.manual_first,
        }
    }

    fn count(&self, states: &[UploadState]) -> Result<i64, String> {
        let query = self.query(&UploadFilter::in_states(states));
        self.db
            .with_connection(|conn| count_upload_requests(conn, &query))
    }

    fn broadcast(&self, change: UploadChange) {
        let mut subs = recover_lock(&self.subscribers);
        subs.retain_mut(|sender| match sender.try_send(change.clone()) {
            Ok(_) => true,
            Err(TrySendError::Full(_)) => true,
            Err(TrySendError::Disconnected(_)) => false,
        });
    }

    fn remove_staged_files(&self, prefixes: &[String]) {
        if prefixes.is_empty() {
            return;
        }
        let entries = match fs::read_dir(&self.uploads_dir) {
            Ok(entries) => entries,
            Err(err) => {
                log::debug!(
                    "[upload-store] no staging directory {:?}: {err}",
                    self.uploads_dir
                );
                return;
            }
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if prefixes.iter().any(|prefix| name.starts_with(prefix.as_str())) {
                remove_file_logged(&entry.path());
            }
        }
    }
}

impl UploadStore for SqliteUploadStore {
    fn scope(&self) -> Account {
        recover_lock(&self.scope).clone()
    }

    fn set_scope(&self, account: Account) {
        log::info!(
            "[upload-store] scoped to {}@{}",
            account.username,
            account.server_path
        );
        *recover_lock(&self.scope) = account;
    }

    fn import_requests(&self, properties: &[UploadProperties]) -> Result<usize, UploadError> {
        let scope = self.scope();
        let mut imported = 0;
        for batch in properties.chunks(IMPORT_BATCH_SIZE) {
            let (inserted, updated) = self.db.with_transaction(|tx| {
                let mut inserted = Vec::new();
                let mut updated = Vec::new();
                let now = current_timestamp_millis();
                for props in batch {
                    if props.local_identifier.is_empty() || props.category == 0 {
                        log::warn!(
                            "[upload-store] skipping invalid upload request {:?} (album {})",
                            props.local_identifier,
                            props.category
                        );
                        continue;
                    }
                    let existing = find_upload_request_id(
                        tx,
                        &props.local_identifier,
                        &scope.server_path,
                        &scope.username,
                    )?;
                    match existing.map(|id| load_upload_request(tx, id)).transpose()? {
                        Some(Some(mut record)) => {
                            apply_properties(&mut record, props, now);
                            update_upload_request(tx, &record)?;
                            updated.push(record.id);
                        }
                        _ => {
                            let mut record = UploadRequestRecord {
                                local_identifier: props.local_identifier.clone(),
                                server_path: scope.server_path.clone(),
                                username: scope.username.clone(),
                                ..UploadRequestRecord::default()
                            };
                            apply_properties(&mut record, props, now);
                            inserted.push(insert_upload_request(tx, &record)?);
                        }
                    }
                }
                Ok((inserted, updated))
            })?;
            imported += inserted.len() + updated.len();
            log::debug!(
                "[upload-store] batch committed: {} inserted, {} updated",
                inserted.len(),
                updated.len()
            );
            if !inserted.is_empty() {
                self.broadcast(UploadChange::Inserted(inserted));
            }
            if !updated.is_empty() {
                self.broadcast(UploadChange::Updated(updated));
            }
        }
        Ok(imported)
    }

    fn update_state(
        &self,
        id: UploadId,
        state: UploadState,
        error: Option<&str>,
    ) -> Result<(), UploadError> {
        let changed = self.db.with_connection(|conn| {
            update_upload_state(
                conn,
                id,
                state.raw_value(),
                error.unwrap_or_default(),
                current_timestamp_millis(),
            )
        })?;
        if changed == 0 {
            return Err(UploadError::NotFound(id));
        }
        log::debug!("[upload-store] request {id} -> {state:?}");
        self.broadcast(UploadChange::Updated(vec![id]));
        Ok(())
    }

    fn save(&self, request: &UploadRequest) {
        let record = record_from_request(request);
        let result = self.db.with_connection(|conn| {
            if request.id > 0 {
                update_upload_request(conn, &record).map(|_| request.id)
            } else {
                insert_upload_request(conn, &record)
            }
        });
        match result {
            Ok(id) => {
                let change = if request.id > 0 {
                    UploadChange::Updated(vec![id])
                } else {
                    UploadChange::Inserted(vec![id])
                };
                self.broadcast(change);
            }
            Err(err) => log::error!(
                "[upload-store] failed to save request {}: {err}",
                request.local_identifier
            ),
        }
    }

    fn load(&self, id: UploadId) -> Result<Option<UploadRequest>, UploadError> {
        let record = self
            .db
            .with_connection(|conn| load_upload_request(conn, id))?;
        record.map(request_from_record).transpose()
    }

    fn fetch(&self, filter: &UploadFilter) -> Result<Vec<UploadRequest>, UploadError> {
        let query = self.query(filter);
        let records = self
            .db
            .with_connection(|conn| query_upload_requests(conn, &query))?;
        Ok(records
            .into_iter()
            .filter_map(|record| {
                let id = record.id;
                request_from_record(record)
                    .map_err(|err| log::warn!("[upload-store] skipping request {id}: {err}"))
                    .ok()
            })
            .collect())
    }

    fn mark_deleted(&self, image_ids: &[i64]) -> Result<Vec<UploadId>, UploadError> {
        if image_ids.is_empty() {
            return Ok(Vec::new());
        }
        let server_path = self.scope().server_path;
        let marked = self.db.with_transaction(|tx| {
            mark_upload_requests_deleted(
                tx,
                &server_path,
                image_ids,
                UploadState::Deleted.raw_value(),
                current_timestamp_millis(),
            )
        })?;
        if !marked.is_empty() {
            self.broadcast(UploadChange::Updated(marked.clone()));
        }
        Ok(marked)
    }

    fn set_delete_after_upload(&self, ids: &[UploadId], flag: bool) -> Result<(), UploadError> {
        if ids.is_empty() {
            return Ok(());
        }
        self.db.with_transaction(|tx| {
            update_upload_delete_flag(tx, ids, flag, current_timestamp_millis())
        })?;
        self.broadcast(UploadChange::Updated(ids.to_vec()));
        Ok(())
    }

    fn delete(&self, ids: &[UploadId]) -> Result<usize, UploadError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut deleted = 0;
        let mut prefixes = Vec::new();
        for batch in ids.chunks(IMPORT_BATCH_SIZE) {
            let (count, batch_prefixes) = self
                .db
                .with_transaction(|tx| {
                    let mut batch_prefixes = Vec::new();
                    for id in batch {
                        if let Some(record) = load_upload_request(tx, *id)? {
                            batch_prefixes.push(staged_file_prefix(&record));
                        }
                    }
                    let count = delete_upload_requests(tx, batch)?;
                    Ok((count, batch_prefixes))
                })
                .map_err(UploadError::Deletion)?;
            deleted += count;
            prefixes.extend(batch_prefixes);
        }
        self.remove_staged_files(&prefixes);
        log::info!("[upload-store] deleted {deleted} upload requests");
        self.broadcast(UploadChange::Deleted(ids.to_vec()));
        Ok(deleted)
    }

    fn counts(&self) -> UploadCounts {
        let pending_states: Vec<UploadState> = UploadState::ALL
            .into_iter()
            .filter(|state| state.is_pending() && *state != UploadState::Deleted)
            .collect();
        let pending = self.count(&pending_states).unwrap_or_else(|err| {
            log::error!("[upload-store] failed to count pending requests: {err}");
            0
        });
        let completed = self.count(&UploadState::COMPLETED).unwrap_or_else(|err| {
            log::error!("[upload-store] failed to count completed requests: {err}");
            0
        });
        UploadCounts { pending, completed }
    }

    fn subscribe(&self) -> Receiver<UploadChange> {
        let (tx, rx) = mpsc::sync_channel(CHANGE_CHANNEL_CAP);
        recover_lock(&self.subscribers).push(tx);
        rx
    }

    fn uploads_dir(&self) -> PathBuf {
        self.uploads_dir.clone()
    }
}

fn remove_file_logged(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => log::debug!("[upload-store] removed staged file {path:?}"),
        Err(err) => log::warn!("[upload-store] failed to remove staged file {path:?}: {err}"),
    }
}

fn staged_file_prefix(record: &UploadRequestRecord) -> String {
    let prefix = record.local_identifier.replace('/', "-");
    if prefix.is_empty() {
        format!("file-{}", record.creation_date_millis / 1000)
    } else {
        prefix
    }
}

fn apply_properties(record: &mut UploadRequestRecord, props: &UploadProperties, now: i64) {
    let request_date = props
        .request_date
        .map(|date| date.timestamp_millis())
        .unwrap_or(now);
    record.category = props.category;
    record.server_file_types = props.server_file_types.clone();
    record.request_date_millis = request_date;
    record.state = props.state.raw_value();
    record.request_error = String::new();
    record.creation_date_millis = props
        .creation_date
        .map(|date| date.timestamp_millis())
        .unwrap_or(request_date);
    record.file_name = props.file_name.clone();
    record.author = props.author.clone();
    record.privacy_level = props.privacy_level;
    record.image_title = props.image_title.clone();
    record.comment = props.comment.clone();
    record.tag_ids = props.tag_ids.clone();
    write_options(record, &props.options);
    record.delete_image_after_upload = props.delete_image_after_upload;
    record.marked_for_auto_upload = props.marked_for_auto_upload;
    record.updated_at_millis = now;
}

fn write_options(record: &mut UploadRequestRecord, options: &UploadOptions) {
    record.strip_gps = options.strip_gps;
    record.resize_image = options.resize_image;
    record.photo_max_size = options.photo_max_size as i64;
    record.compress_image = options.compress_image;
    record.photo_quality = options.photo_quality as i64;
    record.file_name_rules = if options.rename.is_empty() {
        String::new()
    } else {
        serde_json::to_string(&options.rename).unwrap_or_else(|err| {
            log::warn!("[upload-store] failed to encode file name rules: {err}");
            String::new()
        })
    };
}

pub(crate) fn record_from_request(request: &UploadRequest) -> UploadRequestRecord {
    let mut record = UploadRequestRecord {
        id: request.id,
        local_identifier: request.local_identifier.clone(),
        server_path: request.server_path.clone(),
        username: request.username.clone(),
        category: request.category,
        server_file_types: request.server_file_types.clone(),
        request_date_millis: request.request_date.timestamp_millis(),
        state: request.state.raw_value(),
        request_error: request.request_error.clone(),
        creation_date_millis: request.creation_date.timestamp_millis(),
        file_name: request.file_name.clone(),
        mime_type: request.mime_type.clone(),
        md5_sum: request.md5_sum.clone(),
        is_video: request.is_video,
        author: request.author.clone(),
        privacy_level: request.privacy_level,
        image_title: request.image_title.clone(),
        comment: request.comment.clone(),
        tag_ids: request.tag_ids.clone(),
        image_id: request.image_id,
        delete_image_after_upload: request.delete_image_after_upload,
        marked_for_auto_upload: request.marked_for_auto_upload,
        updated_at_millis: current_timestamp_millis(),
        ..UploadRequestRecord::default()
    };
    write_options(&mut record, &request.options);
    record
}

pub(crate) fn request_from_record(record: UploadRequestRecord) -> Result<UploadRequest, UploadError> {
    let state = UploadState::from_raw(record.state).ok_or(UploadError::MissingData)?;
    let rename = if record.file_name_rules.is_empty() {
        FileNameRules::default()
    } else {
        serde_json::from_str(&record.file_name_rules).unwrap_or_else(|err| {
            log::warn!(
                "[upload-store] ignoring unreadable file name rules of {}: {err}",
                record.id
            );
            FileNameRules::default()
        })
    };
    Ok(UploadRequest {
        id: record.id,
        local_identifier: record.local_identifier,
        server_path: record.server_path,
        username: record.username,
        category: record.category,
        server_file_types: record.server_file_types,
        request_date: datetime_from_millis(record.request_date_millis),
        state,
        request_error: record.request_error,
        creation_date: datetime_from_millis(record.creation_date_millis),
        file_name: record.file_name,
        mime_type: record.mime_type,
        md5_sum: record.md5_sum,
        is_video: record.is_video,
        author: record.author,
        privacy_level: record.privacy_level,
        image_title: record.image_title,
        comment: record.comment,
        tag_ids: record.tag_ids,
        image_id: record.image_id,
        options: UploadOptions {
            strip_gps: record.strip_gps,
            resize_image: record.resize_image,
            photo_max_size: u32::try_from(record.photo_max_size).unwrap_or(0),
            compress_image: record.compress_image,
            photo_quality: u8::try_from(record.photo_quality).unwrap_or(98),
            rename,
        },
        delete_image_after_upload: record.delete_image_after_upload,
        marked_for_auto_upload: record.marked_for_auto_upload,
    })
}

fn datetime_from_millis(millis: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(millis).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upload_manager::models::ExtensionCase;
    use tempfile::tempdir;

    fn store_in(dir: &Path) -> SqliteUploadStore {
        let db = Database::open_in_memory().expect("in-memory db");
        let store = SqliteUploadStore::new(db, dir.to_path_buf());
        store.set_scope(Account::new("https://example.org/piwigo", "alice"));
        store
    }

    #[test]
    fn import_inserts_then_updates_in_place() {
        let dir = tempdir().expect("tempdir");
        let store = store_in(dir.path());
        let mut props = UploadProperties::new("asset-1", 5);
        props.image_title = "first".to_string();
        assert_eq!(store.import_requests(&[props.clone()]).expect("import"), 1);

        props.image_title = "second".to_string();
        props.options.rename = FileNameRules {
            prefix: "trip-".to_string(),
            extension_case: ExtensionCase::Lowercase,
            ..FileNameRules::default()
        };
        assert_eq!(store.import_requests(&[props]).expect("import"), 1);

        let all = store.fetch(&UploadFilter::all()).expect("fetch");
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].image_title, "second");
        assert_eq!(all[0].options.rename.prefix, "trip-");
        assert_eq!(all[0].state, UploadState::Waiting);
    }

    #[test]
    fn invalid_records_are_skipped_without_aborting() {
        let dir = tempdir().expect("tempdir");
        let store = store_in(dir.path());
        let batch = vec![
            UploadProperties::new("", 5),
            UploadProperties::new("asset-2", 0),
            UploadProperties::new("asset-3", 5),
        ];
        assert_eq!(store.import_requests(&batch).expect("import"), 1);
        assert_eq!(store.counts().pending, 1);
    }

    #[test]
    fn large_imports_span_several_batches() {
        let dir = tempdir().expect("tempdir");
        let store = store_in(dir.path());
        let batch: Vec<_> = (0..600)
            .map(|i| UploadProperties::new(format!("asset-{i}"), 1))
            .collect();
        assert_eq!(store.import_requests(&batch).expect("import"), 600);
        assert_eq!(store.counts().pending, 600);
    }

    #[test]
    fn scope_isolates_accounts() {
        let dir = tempdir().expect("tempdir");
        let store = store_in(dir.path());
        store
            .import_requests(&[UploadProperties::new("asset-1", 5)])
            .expect("import");
        store.set_scope(Account::new("https://example.org/piwigo", "bob"));
        assert!(store.fetch(&UploadFilter::all()).expect("fetch").is_empty());
        store
            .import_requests(&[UploadProperties::new("asset-1", 7)])
            .expect("import");
        assert_eq!(store.fetch(&UploadFilter::all()).expect("fetch").len(), 1);
    }

    #[test]
    fn update_state_reports_unknown_ids() {
        let dir = tempdir().expect("tempdir");
        let store = store_in(dir.path());
        let err = store
            .update_state(404, UploadState::Preparing, None)
            .expect_err("unknown id");
        assert!(matches!(err, UploadError::NotFound(404)));
    }

    #[test]
    fn fetch_orders_manual_requests_first() {
        let dir = tempdir().expect("tempdir");
        let store = store_in(dir.path());
        let base = Utc::now();
        let mut auto = UploadProperties::new("auto", 1);
        auto.marked_for_auto_upload = true;
        auto.request_date = Some(base);
        let mut manual = UploadProperties::new("manual", 1);
        manual.request_date = Some(base + chrono::Duration::seconds(10));
        store.import_requests(&[auto, manual]).expect("import");

        let by_date = store
            .fetch(&UploadFilter::in_states(&[UploadState::Waiting]))
            .expect("fetch");
        assert_eq!(by_date[0].local_identifier, "auto");

        let manual_first = store
            .fetch(&UploadFilter::in_states(&[UploadState::Waiting]).manual_first())
            .expect("fetch");
        assert_eq!(manual_first[0].local_identifier, "manual");
    }

    #[test]
    fn mark_deleted_and_counts() {
        let dir = tempdir().expect("tempdir");
        let store = store_in(dir.path());
        store
            .import_requests(&[UploadProperties::new("a", 1), UploadProperties::new("b", 1)])
            .expect("import");
        let mut requests = store.fetch(&UploadFilter::all()).expect("fetch");
        requests[0].state = UploadState::Finished;
        requests[0].image_id = 77;
        store.save(&requests[0]);

        assert_eq!(
            store.counts(),
            UploadCounts {
                pending: 1,
                completed: 1
            }
        );
        let marked = store.mark_deleted(&[77]).expect("mark");
        assert_eq!(marked, vec![requests[0].id]);
        let reloaded = store.load(requests[0].id).expect("load").expect("present");
        assert_eq!(reloaded.state, UploadState::Deleted);
    }

    #[test]
    fn delete_removes_rows_and_staged_files() {
        let dir = tempdir().expect("tempdir");
        let store = store_in(dir.path());
        store
            .import_requests(&[UploadProperties::new("ABC/L0/001", 1)])
            .expect("import");
        let staged = dir.path().join("ABC-L0-001-img-0.jpg");
        let unrelated = dir.path().join("XYZ-img-0.jpg");
        fs::write(&staged, b"jpeg").expect("write");
        fs::write(&unrelated, b"jpeg").expect("write");

        let changes = store.subscribe();
        let ids: Vec<_> = store
            .fetch(&UploadFilter::all())
            .expect("fetch")
            .iter()
            .map(|request| request.id)
            .collect();
        assert_eq!(store.delete(&ids).expect("delete"), 1);
        assert!(!staged.exists());
        assert!(unrelated.exists());
        assert_eq!(changes.try_recv(), Ok(UploadChange::Deleted(ids)));
    }

    #[test]
    fn subscribers_receive_typed_events() {
        let dir = tempdir().expect("tempdir");
        let store = store_in(dir.path());
        let rx = store.subscribe();
        store
            .import_requests(&[UploadProperties::new("a", 1)])
            .expect("import");
        let id = match rx.try_recv() {
            Ok(UploadChange::Inserted(ids)) => ids[0],
            other => panic!("unexpected event {other:?}"),
        };
        store
            .update_state(id, UploadState::Preparing, None)
            .expect("update");
        assert_eq!(rx.try_recv(), Ok(UploadChange::Updated(vec![id])));
    }
}
