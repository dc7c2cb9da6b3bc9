pub mod auto_upload;
pub mod background;
pub mod context;
pub mod core;
pub mod counter;
pub mod finisher;
pub mod models;
pub mod ports;
pub mod prepare;
pub mod presentation;
pub mod resume;
pub mod scheduler;
pub mod state;
pub mod storage;
pub mod transfer;

#[cfg(test)]
pub(crate) mod test_support;

pub use context::UploadContext;
pub use core::UploadManager;
pub use counter::{UploadCounter, UploadCounters};
pub use models::{
    Account, ExtensionCase, FileNameRules, ServerProfile, UploadChange, UploadCounts, UploadId,
    UploadOptions, UploadProperties, UploadRequest,
};
pub use ports::{
    DeviceStatus, MediaAsset, MediaLibrary, NoTransferSessions, Spawner, ThreadSpawner,
    TransferSessions, UnconstrainedDevice,
};
pub use presentation::{queue_section, state_label, QueueSection};
pub use state::{recovery_reset, UploadState};
pub use storage::{SqliteUploadStore, UploadFilter, UploadStore};
