//! Piwigo 服务器相册与图片的本地镜像。

pub mod albums;
pub mod dates;
pub mod images;
pub mod models;

pub use albums::{AlbumProvider, ALBUM_BATCH_SIZE};
pub use images::{ImageProvider, ImportedPage, IMAGE_BATCH_SIZE};
pub use models::{smart_albums, DeleteMode, ImageSize, ImageSizes, SizeInfo};
