//! Piwigo 客户端的上传管线与相册/图片缓存。

pub mod api;
pub mod cache;
pub mod db;
pub mod error;
pub mod settings;
pub mod upload_manager;

pub use error::{CacheError, MediaError, PwgError, UploadError};
