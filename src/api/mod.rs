mod client;
pub mod compat;
pub mod models;

pub use client::PiwigoClient;
pub use compat::{paging_total_count, ServerVersion, LOUNGE_MIN_VERSION};
pub use models::{
    AlbumData, ChunkUpload, Derivative, IdRef, ImageData, ImageInfoUpdate, ImagePage, ImageQuery,
    ImageSort, SessionStatus, UploadedImage,
};

use crate::error::PwgError;

/// 接收当前分片已发送字节数的回调。
pub type ChunkProgress = Box<dyn FnMut(u64) + Send>;

/// 上传管线与缓存用到的 Piwigo Web 服务调用。
pub trait PiwigoApi: Send + Sync {
    fn get_albums(&self, parent_id: i64, recursive: bool) -> Result<Vec<AlbumData>, PwgError>;
    /// 启用 Community 插件时，用户可上传的相册。
    fn get_community_albums(
        &self,
        parent_id: i64,
        recursive: bool,
    ) -> Result<Vec<AlbumData>, PwgError>;
    fn get_images(&self, query: &ImageQuery) -> Result<ImagePage, PwgError>;
    fn get_image_info(&self, image_id: i64) -> Result<ImageData, PwgError>;
    fn set_image_info(&self, update: &ImageInfoUpdate) -> Result<(), PwgError>;
    /// 发送一个分片；最后一个分片的应答描述新建的图片。
    fn upload_chunk(
        &self,
        chunk: ChunkUpload,
        progress: Option<ChunkProgress>,
    ) -> Result<Option<UploadedImage>, PwgError>;
    /// 发布 lounge 中等待的图片。
    fn empty_lounge(&self, image_ids: &[i64], category_id: i64) -> Result<(), PwgError>;
    /// 通知审核员；返回已通过审核的 id。
    fn moderate_images(&self, image_ids: &[i64], category_id: i64) -> Result<Vec<i64>, PwgError>;
    fn check_session(&self) -> Result<SessionStatus, PwgError>;
}
