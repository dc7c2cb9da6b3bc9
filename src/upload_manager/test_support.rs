//! 上传管线测试用的内存版宿主服务与调度器测试夹具。

use super::context::UploadContext;
use super::counter::recover_lock;
use super::models::{Account, ServerProfile, UploadChange, UploadCounts, UploadId, UploadProperties, UploadRequest};
use super::ports::{DeviceStatus, Job, MediaAsset, MediaLibrary, Spawner, TransferSessions};
use super::scheduler::{Event, UploadEngine};
use super::state::UploadState;
use super::storage::{SqliteUploadStore, UploadFilter, UploadStore};
use crate::api::{
    AlbumData, ChunkProgress, ChunkUpload, ImageData, ImageInfoUpdate, ImagePage, ImageQuery,
    PiwigoApi, ServerVersion, SessionStatus, UploadedImage,
};
use crate::cache::{AlbumProvider, ImageProvider};
use crate::db::Database;
use crate::error::{MediaError, PwgError, UploadError};
use image::{DynamicImage, ImageBuffer, ImageFormat, Rgb};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fs;
use std::io::Cursor;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

const MAX_DRIVE_STEPS: usize = 10_000;

pub(crate) fn account() -> Account {
    Account::new("https://example.org/piwigo", "alice")
}

pub(crate) fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let buffer = ImageBuffer::from_fn(width, height, |x, y| Rgb([(x * 7) as u8, (y * 13) as u8, 90]));
    let mut out = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(buffer)
        .write_to(&mut out, ImageFormat::Png)
        .expect("encode png");
    out.into_inner()
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct LoungeCall {
    pub image_ids: Vec<i64>,
    pub category: i64,
}

pub(crate) struct FakeApi {
    chunks: Mutex<Vec<ChunkUpload>>,
    lounge: Mutex<Vec<LoungeCall>>,
    moderation: Mutex<Vec<LoungeCall>>,
    validated: Mutex<HashSet<i64>>,
    info_updates: Mutex<Vec<ImageInfoUpdate>>,
    upload_failure: Mutex<Option<PwgError>>,
    lounge_failure: Mutex<Option<PwgError>>,
    set_info_failure: Mutex<Option<PwgError>>,
    next_image_id: AtomicI64,
}

impl FakeApi {
    fn new() -> Self {
        Self {
            chunks: Mutex::new(Vec::new()),
            lounge: Mutex::new(Vec::new()),
            moderation: Mutex::new(Vec::new()),
            validated: Mutex::new(HashSet::new()),
            info_updates: Mutex::new(Vec::new()),
            upload_failure: Mutex::new(None),
            lounge_failure: Mutex::new(None),
            set_info_failure: Mutex::new(None),
            next_image_id: AtomicI64::new(100),
        }
    }

    /// 目前收到的分片，不含数据内容。
    pub fn chunks(&self) -> Vec<ChunkUpload> {
        recover_lock(&self.chunks).clone()
    }

    pub fn lounge_calls(&self) -> Vec<LoungeCall> {
        recover_lock(&self.lounge).clone()
    }

    pub fn moderation_calls(&self) -> Vec<LoungeCall> {
        recover_lock(&self.moderation).clone()
    }

    pub fn info_updates(&self) -> Vec<ImageInfoUpdate> {
        recover_lock(&self.info_updates).clone()
    }

    pub fn fail_uploads(&self, err: PwgError) {
        *recover_lock(&self.upload_failure) = Some(err);
    }

    pub fn fail_lounge(&self, err: PwgError) {
        *recover_lock(&self.lounge_failure) = Some(err);
    }

    pub fn fail_set_info(&self, err: PwgError) {
        *recover_lock(&self.set_info_failure) = Some(err);
    }

    /// 审核员已经通过的图片。
    pub fn validate_moderation(&self, image_ids: &[i64]) {
        recover_lock(&self.validated).extend(image_ids.iter().copied());
    }
}

impl PiwigoApi for FakeApi {
    fn get_albums(&self, _: i64, _: bool) -> Result<Vec<AlbumData>, PwgError> {
        Ok(Vec::new())
    }

    fn get_community_albums(&self, _: i64, _: bool) -> Result<Vec<AlbumData>, PwgError> {
        Ok(Vec::new())
    }

    fn get_images(&self, _: &ImageQuery) -> Result<ImagePage, PwgError> {
        Ok(ImagePage::default())
    }

    fn get_image_info(&self, _: i64) -> Result<ImageData, PwgError> {
        Err(PwgError::InvalidMethod)
    }

    fn set_image_info(&self, update: &ImageInfoUpdate) -> Result<(), PwgError> {
        if let Some(err) = recover_lock(&self.set_info_failure).clone() {
            return Err(err);
        }
        recover_lock(&self.info_updates).push(update.clone());
        Ok(())
    }

    fn upload_chunk(&self, mut chunk: ChunkUpload, progress: Option<ChunkProgress>) -> Result<Option<UploadedImage>, PwgError> {
        if let Some(err) = recover_lock(&self.upload_failure).clone() {
            return Err(err);
        }
        if let Some(mut progress) = progress {
            progress(chunk.data.len() as u64);
        }
        let last = chunk.chunk + 1 == chunk.chunks;
        chunk.data.clear();
        recover_lock(&self.chunks).push(chunk);
        if !last {
            return Ok(None);
        }
        Ok(Some(UploadedImage {
            image_id: self.next_image_id.fetch_add(1, Ordering::SeqCst) + 1,
            ..UploadedImage::default()
        }))
    }

    fn empty_lounge(&self, image_ids: &[i64], category_id: i64) -> Result<(), PwgError> {
        if let Some(err) = recover_lock(&self.lounge_failure).clone() {
            return Err(err);
        }
        recover_lock(&self.lounge).push(LoungeCall {
            image_ids: image_ids.to_vec(),
            category: category_id,
        });
        Ok(())
    }

    fn moderate_images(&self, image_ids: &[i64], category_id: i64) -> Result<Vec<i64>, PwgError> {
        recover_lock(&self.moderation).push(LoungeCall {
            image_ids: image_ids.to_vec(),
            category: category_id,
        });
        let validated = recover_lock(&self.validated);
        Ok(image_ids.iter().copied().filter(|id| validated.contains(id)).collect())
    }

    fn check_session(&self) -> Result<SessionStatus, PwgError> {
        Ok(SessionStatus::default())
    }
}

#[derive(Default)]
pub(crate) struct FakeMedia {
    assets: Mutex<HashMap<String, MediaAsset>>,
    deleted: Mutex<Vec<String>>,
    decline: AtomicBool,
    candidates: Mutex<Vec<String>>,
    candidates_failure: Mutex<Option<MediaError>>,
}

impl FakeMedia {
    pub fn add(&self, identifier: &str, file_name: &str, data: Vec<u8>) {
        let is_video = file_name.to_ascii_lowercase().ends_with(".mp4");
        recover_lock(&self.assets).insert(
            identifier.to_string(),
            MediaAsset {
                local_identifier: identifier.to_string(),
                file_name: file_name.to_string(),
                creation_date: None,
                is_video,
                data,
            },
        );
    }

    pub fn deleted(&self) -> Vec<String> {
        recover_lock(&self.deleted).clone()
    }

    pub fn decline_deletions(&self) {
        self.decline.store(true, Ordering::SeqCst);
    }

    pub fn set_candidates(&self, identifiers: &[&str]) {
        *recover_lock(&self.candidates) = identifiers.iter().map(|id| id.to_string()).collect();
    }

    pub fn fail_candidates(&self, err: MediaError) {
        *recover_lock(&self.candidates_failure) = Some(err);
    }
}

impl MediaLibrary for FakeMedia {
    fn fetch_asset(&self, local_identifier: &str) -> Result<MediaAsset, MediaError> {
        recover_lock(&self.assets)
            .get(local_identifier)
            .cloned()
            .ok_or_else(|| MediaError::AssetNotFound(local_identifier.to_string()))
    }

    fn available_assets(&self, identifiers: &[String]) -> HashSet<String> {
        let assets = recover_lock(&self.assets);
        identifiers
            .iter()
            .filter(|id| assets.contains_key(id.as_str()))
            .cloned()
            .collect()
    }

    fn delete_assets(&self, identifiers: &[String]) -> Result<(), MediaError> {
        if self.decline.load(Ordering::SeqCst) {
            return Err(MediaError::AccessDenied);
        }
        let mut assets = recover_lock(&self.assets);
        for id in identifiers {
            assets.remove(id);
        }
        recover_lock(&self.deleted).extend(identifiers.iter().cloned());
        Ok(())
    }

    fn auto_upload_candidates(&self, _: &str, _: bool) -> Result<Vec<String>, MediaError> {
        if let Some(err) = recover_lock(&self.candidates_failure).clone() {
            return Err(err);
        }
        Ok(recover_lock(&self.candidates).clone())
    }
}

pub(crate) struct FakeDevice {
    low_power: AtomicBool,
    wifi: AtomicBool,
}

impl FakeDevice {
    pub fn set_low_power(&self, value: bool) {
        self.low_power.store(value, Ordering::SeqCst);
    }

    pub fn set_wifi(&self, value: bool) {
        self.wifi.store(value, Ordering::SeqCst);
    }
}

impl DeviceStatus for FakeDevice {
    fn is_low_power_mode(&self) -> bool {
        self.low_power.load(Ordering::SeqCst)
    }

    fn is_on_wifi(&self) -> bool {
        self.wifi.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
pub(crate) struct FakeSessions {
    running: Mutex<Vec<String>>,
}

impl FakeSessions {
    pub fn set_running(&self, headers: Vec<String>) {
        *recover_lock(&self.running) = headers;
    }
}

impl TransferSessions for FakeSessions {
    fn running_upload_ids(&self) -> Vec<String> {
        recover_lock(&self.running).clone()
    }
}

/// 暂存任务，直到测试逐个执行。
#[derive(Default)]
pub(crate) struct QueuedSpawner {
    jobs: Mutex<VecDeque<Job>>,
}

impl QueuedSpawner {
    pub fn run_next(&self) -> bool {
        let job = recover_lock(&self.jobs).pop_front();
        match job {
            Some(job) => {
                job();
                true
            }
            None => false,
        }
    }

    pub fn is_idle(&self) -> bool {
        recover_lock(&self.jobs).is_empty()
    }
}

impl Spawner for QueuedSpawner {
    fn spawn(&self, job: Job) {
        recover_lock(&self.jobs).push_back(job);
    }
}

/// 记录每次写入状态的存储包装。
pub(crate) struct RecordingStore {
    inner: SqliteUploadStore,
    history: Mutex<Vec<(UploadId, UploadState)>>,
}

impl RecordingStore {
    fn record(&self, id: UploadId, state: UploadState) {
        recover_lock(&self.history).push((id, state));
    }
}

impl UploadStore for RecordingStore {
    fn scope(&self) -> Account {
        self.inner.scope()
    }

    fn set_scope(&self, account: Account) {
        self.inner.set_scope(account)
    }

    fn import_requests(&self, properties: &[UploadProperties]) -> Result<usize, UploadError> {
        self.inner.import_requests(properties)
    }

    fn update_state(&self, id: UploadId, state: UploadState, error: Option<&str>) -> Result<(), UploadError> {
        self.inner.update_state(id, state, error)?;
        self.record(id, state);
        Ok(())
    }

    fn save(&self, request: &UploadRequest) {
        self.inner.save(request);
        self.record(request.id, request.state);
    }

    fn load(&self, id: UploadId) -> Result<Option<UploadRequest>, UploadError> {
        self.inner.load(id)
    }

    fn fetch(&self, filter: &UploadFilter) -> Result<Vec<UploadRequest>, UploadError> {
        self.inner.fetch(filter)
    }

    fn mark_deleted(&self, image_ids: &[i64]) -> Result<Vec<UploadId>, UploadError> {
        self.inner.mark_deleted(image_ids)
    }

    fn set_delete_after_upload(&self, ids: &[UploadId], flag: bool) -> Result<(), UploadError> {
        self.inner.set_delete_after_upload(ids, flag)
    }

    fn delete(&self, ids: &[UploadId]) -> Result<usize, UploadError> {
        self.inner.delete(ids)
    }

    fn counts(&self) -> UploadCounts {
        self.inner.counts()
    }

    fn subscribe(&self) -> Receiver<UploadChange> {
        self.inner.subscribe()
    }

    fn uploads_dir(&self) -> PathBuf {
        self.inner.uploads_dir()
    }
}

/// 自 [`Harness::record_states`] 以来某个请求经历的状态。
pub(crate) struct StateHistory {
    store: Arc<RecordingStore>,
    id: UploadId,
    start: usize,
    initial: UploadState,
}

impl StateHistory {
    pub fn collect(&self) -> Vec<UploadState> {
        let history = recover_lock(&self.store.history);
        let mut states = vec![self.initial];
        for (id, state) in history.iter().skip(self.start) {
            if *id == self.id && states.last() != Some(state) {
                states.push(*state);
            }
        }
        states
    }
}

pub(crate) struct Harness {
    pub ctx: UploadContext,
    pub api: Arc<FakeApi>,
    pub media: Arc<FakeMedia>,
    pub sessions: Arc<FakeSessions>,
    pub spawner: Arc<QueuedSpawner>,
    pub device: Arc<FakeDevice>,
    store: Arc<RecordingStore>,
    inbox: Mutex<Option<Receiver<Event>>>,
    _dir: TempDir,
}

impl Harness {
    pub fn new() -> Self {
        Self::build(profile(&["jpg", "jpeg", "png", "mp4"], ServerVersion::new(14, 0, 0)))
    }

    pub fn with_file_types(file_types: &[&str]) -> Self {
        Self::build(profile(file_types, ServerVersion::new(14, 0, 0)))
    }

    pub fn with_version(version: ServerVersion) -> Self {
        Self::build(profile(&["jpg", "jpeg", "png", "mp4"], version))
    }

    /// 非管理员的 Community 用户。
    pub fn with_moderation() -> Self {
        let mut profile = profile(&["jpg", "jpeg", "png", "mp4"], ServerVersion::new(14, 0, 0));
        profile.community_active = true;
        Self::build(profile)
    }

    fn build(profile: ServerProfile) -> Self {
        let dir = TempDir::new().expect("tempdir");
        let uploads_dir = dir.path().join("uploads");
        let cache_dir = dir.path().join("cache");
        fs::create_dir_all(&uploads_dir).expect("uploads dir");
        fs::create_dir_all(&cache_dir).expect("cache dir");

        let db = Database::open_in_memory().expect("db");
        let store = Arc::new(RecordingStore {
            inner: SqliteUploadStore::new(db.clone(), uploads_dir),
            history: Mutex::new(Vec::new()),
        });
        store.set_scope(profile.account.clone());
        let albums = AlbumProvider::new(db.clone(), cache_dir.clone());
        let images = ImageProvider::new(db.clone(), cache_dir, albums);

        let api = Arc::new(FakeApi::new());
        let media = Arc::new(FakeMedia::default());
        let sessions = Arc::new(FakeSessions::default());
        let spawner = Arc::new(QueuedSpawner::default());
        let device = Arc::new(FakeDevice {
            low_power: AtomicBool::new(false),
            wifi: AtomicBool::new(true),
        });
        let ctx = UploadContext::new(db, store.clone(), api.clone(), media.clone(), images, profile)
            .with_device(device.clone())
            .with_sessions(sessions.clone())
            .with_spawner(spawner.clone());
        Self {
            ctx,
            api,
            media,
            sessions,
            spawner,
            device,
            store,
            inbox: Mutex::new(None),
            _dir: dir,
        }
    }

    pub fn enqueue(&self, identifier: &str, category: i64) -> UploadRequest {
        self.enqueue_with(UploadProperties::new(identifier, category))
    }

    pub fn enqueue_in_state(&self, identifier: &str, category: i64, state: UploadState) -> UploadRequest {
        let mut props = UploadProperties::new(identifier, category);
        props.state = state;
        self.enqueue_with(props)
    }

    /// 已作为 `image_id` 传输完成的请求。
    pub fn enqueue_uploaded(&self, identifier: &str, category: i64, image_id: i64, state: UploadState) -> UploadRequest {
        let mut request = self.enqueue_in_state(identifier, category, state);
        request.image_id = image_id;
        request.file_name = format!("{identifier}.jpg");
        self.ctx.store.save(&request);
        request
    }

    pub fn enqueue_with(&self, props: UploadProperties) -> UploadRequest {
        let identifier = props.local_identifier.clone();
        self.ctx.store.import_requests(&[props]).expect("import");
        self.ctx
            .store
            .fetch(&UploadFilter::all())
            .expect("fetch")
            .into_iter()
            .find(|request| request.local_identifier == identifier)
            .expect("enqueued request")
    }

    pub fn load(&self, id: UploadId) -> UploadRequest {
        self.ctx.store.load(id).expect("load").expect("request present")
    }

    pub fn state_of(&self, id: UploadId) -> UploadState {
        self.load(id).state
    }

    pub fn stage(&self, request: &UploadRequest, data: Vec<u8>) {
        fs::write(self.ctx.store.uploads_dir().join(request.staged_file_name()), data).expect("stage");
    }

    pub fn record_states(&self, id: UploadId) -> StateHistory {
        StateHistory {
            store: Arc::clone(&self.store),
            id,
            start: recover_lock(&self.store.history).len(),
            initial: self.state_of(id),
        }
    }

    /// 新的调度引擎；事件由 [`Harness::drive`] 投递。
    pub fn engine(&self) -> UploadEngine {
        let (tx, rx) = mpsc::channel();
        *recover_lock(&self.inbox) = Some(rx);
        UploadEngine::new(self.ctx.clone(), tx)
    }

    /// 投递事件并执行排队的任务，直到两者都耗尽。
    pub fn drive(&self, engine: &mut UploadEngine) {
        let inbox = recover_lock(&self.inbox);
        let inbox = inbox.as_ref().expect("engine created");
        for _ in 0..MAX_DRIVE_STEPS {
            if let Ok(event) = inbox.try_recv() {
                if !engine.handle(event) {
                    return;
                }
                continue;
            }
            if !self.spawner.run_next() {
                return;
            }
        }
        panic!("upload engine never settled");
    }
}

fn profile(file_types: &[&str], version: ServerVersion) -> ServerProfile {
    ServerProfile {
        account: account(),
        version,
        file_types: file_types.iter().map(|ext| ext.to_string()).collect(),
        community_active: false,
        is_admin: false,
        uses_upload_async: true,
    }
}
