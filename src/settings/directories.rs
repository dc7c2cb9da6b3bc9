use crate::db::{self, Database, APPLICATION, ORGANIZATION, QUALIFIER};
use directories::ProjectDirs;
use std::path::PathBuf;

const UPLOADS_DIR_KEY: &str = "uploads_directory";
const IMAGE_CACHE_DIR_KEY: &str = "image_cache_directory";

/// 暂存目录：存放预处理后的文件，以及分享/剪贴板传入的文件。
pub fn get_uploads_directory(db: &Database) -> Result<PathBuf, String> {
    if let Some(value) = db::get_setting(db, UPLOADS_DIR_KEY)? {
        return Ok(PathBuf::from(value));
    }
    default_uploads_directory()
}

pub fn set_uploads_directory(db: &Database, path: &str) -> Result<PathBuf, String> {
    if path.trim().is_empty() {
        return Err("uploads directory cannot be empty".to_string());
    }
    db::set_setting(db, UPLOADS_DIR_KEY, path)?;
    Ok(PathBuf::from(path))
}

pub fn default_uploads_directory() -> Result<PathBuf, String> {
    project_dirs().map(|dirs| dirs.data_dir().join("Uploads"))
}

/// 衍生图缓存的根目录（`<root>/<server>/<size>/<id>`）。
pub fn get_image_cache_directory(db: &Database) -> Result<PathBuf, String> {
    if let Some(value) = db::get_setting(db, IMAGE_CACHE_DIR_KEY)? {
        return Ok(PathBuf::from(value));
    }
    default_image_cache_directory()
}

pub fn set_image_cache_directory(db: &Database, path: &str) -> Result<PathBuf, String> {
    if path.trim().is_empty() {
        return Err("image cache directory cannot be empty".to_string());
    }
    db::set_setting(db, IMAGE_CACHE_DIR_KEY, path)?;
    Ok(PathBuf::from(path))
}

pub fn default_image_cache_directory() -> Result<PathBuf, String> {
    project_dirs().map(|dirs| dirs.cache_dir().join("Images"))
}

fn project_dirs() -> Result<ProjectDirs, String> {
    ProjectDirs::from(QUALIFIER, ORGANIZATION, APPLICATION)
        .ok_or_else(|| "failed to resolve application directories".to_string())
}
