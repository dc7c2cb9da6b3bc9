use super::context::UploadContext;
use super::models::{ServerProfile, UploadChange, UploadCounts, UploadProperties, UploadRequest};
use super::scheduler::{Event, UploadEngine};
use super::storage::UploadFilter;
use crate::error::UploadError;
use once_cell::sync::OnceCell;
use std::{
    sync::mpsc::{self, Receiver, Sender},
    thread,
};

static UPLOAD_MANAGER: OnceCell<UploadManager> = OnceCell::new();

/// 上传队列的句柄。所有命令都转发给调度线程，逐个执行。
#[derive(Clone)]
pub struct UploadManager {
    events: Sender<Event>,
    ctx: UploadContext,
}

impl UploadManager {
    /// 启动调度线程。在调用 [`UploadManager::resume_all`] 或
    /// [`UploadManager::enqueue`] 之前不会上传任何内容。
    pub fn start(ctx: UploadContext) -> Self {
        let (events, inbox) = mpsc::channel();
        let engine = UploadEngine::new(ctx.clone(), events.clone());
        thread::spawn(move || engine.run(inbox));
        Self { events, ctx }
    }

    /// 全局上传管理器，首次调用时启动。
    pub fn install_shared(ctx: UploadContext) -> Self {
        UPLOAD_MANAGER.get_or_init(|| Self::start(ctx)).clone()
    }

    pub fn shared() -> Option<Self> {
        UPLOAD_MANAGER.get().cloned()
    }

    fn send(&self, event: Event) {
        if self.events.send(event).is_err() {
            log::warn!("[upload-manager] scheduler is not running");
        }
    }

    /// 新增或刷新上传请求，然后唤醒调度器。
    pub fn enqueue(&self, properties: &[UploadProperties]) -> Result<usize, UploadError> {
        let count = self.ctx.store.import_requests(properties)?;
        log::info!("[upload-manager] enqueued {count} upload requests");
        self.send(Event::FindNext);
        Ok(count)
    }

    pub fn find_next_image_to_upload(&self) {
        self.send(Event::FindNext);
    }

    pub fn pause(&self) {
        self.send(Event::Pause);
    }

    pub fn resume(&self) {
        self.send(Event::Resume);
    }

    pub fn set_app_in_background(&self, in_background: bool) {
        self.send(Event::AppStateChanged { in_background });
    }

    /// 恢复被中断的请求并重新启动队列。
    pub fn resume_all(&self) {
        self.send(Event::ResumeAll);
    }

    /// 把队列切换到另一个会话。
    pub fn switch_profile(&self, profile: ServerProfile) {
        self.ctx.set_profile(profile);
        self.send(Event::ResumeAll);
    }

    pub fn begin_background_task(&self, auto_upload_only: bool) {
        self.send(Event::BeginBackground { auto_upload_only });
    }

    pub fn continue_background_task(&self) {
        self.send(Event::BackgroundStep);
    }

    pub fn end_background_task(&self) {
        self.send(Event::EndBackground);
    }

    pub fn append_auto_uploads(&self) {
        self.send(Event::AppendAutoUploads);
    }

    pub fn disable_auto_upload(&self) {
        self.send(Event::DisableAutoUpload);
    }

    /// 清理永久失败的请求。
    pub fn delete_impossible_uploads(&self) {
        self.send(Event::DeleteImpossible);
    }

    pub fn delete_uploads_of_deleted_images(&self, image_ids: Vec<i64>) {
        self.send(Event::DeleteUploadsOfDeletedImages(image_ids));
    }

    pub fn shutdown(&self) {
        self.send(Event::Shutdown);
    }

    pub fn counts(&self) -> UploadCounts {
        self.ctx.store.counts()
    }

    pub fn requests(&self, filter: &UploadFilter) -> Result<Vec<UploadRequest>, UploadError> {
        self.ctx.store.fetch(filter)
    }

    /// 正在上传资源的传输进度，取值 `[0, 1]`。
    pub fn progress(&self, local_identifier: &str) -> f32 {
        self.ctx.counters.progress(local_identifier)
    }

    pub fn subscribe(&self) -> Receiver<UploadChange> {
        self.ctx.store.subscribe()
    }
}
