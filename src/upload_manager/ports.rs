//! 上传管线依赖的宿主服务。

use crate::error::MediaError;
use chrono::{DateTime, Utc};
use std::{collections::HashSet, thread};

/// 本地资源的原始内容。
#[derive(Debug, Clone, PartialEq)]
pub struct MediaAsset {
    pub local_identifier: String,
    /// 原始文件名，含扩展名。
    pub file_name: String,
    pub creation_date: Option<DateTime<Utc>>,
    pub is_video: bool,
    pub data: Vec<u8>,
}

pub trait MediaLibrary: Send + Sync {
    fn fetch_asset(&self, local_identifier: &str) -> Result<MediaAsset, MediaError>;
    /// `identifiers` 中仍存在于媒体库的子集。
    fn available_assets(&self, identifiers: &[String]) -> HashSet<String>;
    fn delete_assets(&self, identifiers: &[String]) -> Result<(), MediaError>;
    /// 集合内的资源 id，最新的在前，不含隐藏资源。
    fn auto_upload_candidates(
        &self,
        collection_id: &str,
        include_videos: bool,
    ) -> Result<Vec<String>, MediaError>;
}

pub trait DeviceStatus: Send + Sync {
    fn is_low_power_mode(&self) -> bool;
    fn is_on_wifi(&self) -> bool;
}

/// 没有电量与网络限制的设备。
#[derive(Debug, Clone, Copy, Default)]
pub struct UnconstrainedDevice;

impl DeviceStatus for UnconstrainedDevice {
    fn is_low_power_mode(&self) -> bool {
        false
    }

    fn is_on_wifi(&self) -> bool {
        true
    }
}

/// 正在运行的网络任务，以其 upload id 请求头标识。
pub trait TransferSessions: Send + Sync {
    fn running_upload_ids(&self) -> Vec<String>;
}

/// 不支持后台网络会话的宿主。
#[derive(Debug, Clone, Copy, Default)]
pub struct NoTransferSessions;

impl TransferSessions for NoTransferSessions {
    fn running_upload_ids(&self) -> Vec<String> {
        Vec::new()
    }
}

pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// 在调度线程之外执行 worker 任务。
pub trait Spawner: Send + Sync {
    fn spawn(&self, job: Job);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadSpawner;

impl Spawner for ThreadSpawner {
    fn spawn(&self, job: Job) {
        thread::spawn(job);
    }
}
