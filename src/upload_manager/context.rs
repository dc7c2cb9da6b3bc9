use super::counter::{recover_lock, UploadCounters};
use super::models::{Account, ServerProfile};
use super::ports::{
    DeviceStatus, MediaLibrary, NoTransferSessions, Spawner, ThreadSpawner, TransferSessions,
    UnconstrainedDevice,
};
use super::storage::UploadStore;
use crate::api::PiwigoApi;
use crate::cache::ImageProvider;
use crate::db::Database;
use crate::settings::{self, UploadLimits};
use std::sync::{Arc, Mutex};

/// 调度器与各 worker 共享的全部依赖。
#[derive(Clone)]
pub struct UploadContext {
    pub db: Database,
    pub store: Arc<dyn UploadStore>,
    pub api: Arc<dyn PiwigoApi>,
    pub media: Arc<dyn MediaLibrary>,
    pub device: Arc<dyn DeviceStatus>,
    pub sessions: Arc<dyn TransferSessions>,
    pub spawner: Arc<dyn Spawner>,
    pub images: ImageProvider,
    pub counters: UploadCounters,
    profile: Arc<Mutex<ServerProfile>>,
}

impl UploadContext {
    pub fn new(
        db: Database,
        store: Arc<dyn UploadStore>,
        api: Arc<dyn PiwigoApi>,
        media: Arc<dyn MediaLibrary>,
        images: ImageProvider,
        profile: ServerProfile,
    ) -> Self {
        Self {
            db,
            store,
            api,
            media,
            device: Arc::new(UnconstrainedDevice),
            sessions: Arc::new(NoTransferSessions),
            spawner: Arc::new(ThreadSpawner),
            images,
            counters: UploadCounters::new(),
            profile: Arc::new(Mutex::new(profile)),
        }
    }

    pub fn with_device(mut self, device: Arc<dyn DeviceStatus>) -> Self {
        self.device = device;
        self
    }

    pub fn with_sessions(mut self, sessions: Arc<dyn TransferSessions>) -> Self {
        self.sessions = sessions;
        self
    }

    pub fn with_spawner(mut self, spawner: Arc<dyn Spawner>) -> Self {
        self.spawner = spawner;
        self
    }

    pub fn profile(&self) -> ServerProfile {
        recover_lock(&self.profile).clone()
    }

    /// 切换到另一个会话；队列在下次恢复时跟随切换。
    pub fn set_profile(&self, profile: ServerProfile) {
        *recover_lock(&self.profile) = profile;
    }

    pub fn account(&self) -> Account {
        recover_lock(&self.profile).account.clone()
    }

    pub fn limits(&self) -> UploadLimits {
        UploadLimits::load(&self.db)
    }

    pub fn wifi_only(&self) -> bool {
        settings::get_wifi_only(&self.db).unwrap_or_else(|err| {
            log::warn!("[upload-manager] cannot read Wi-Fi policy: {err}");
            false
        })
    }
}
