pub mod directories;
pub mod upload_limits;
pub mod upload_policy;

pub use directories::{
    default_image_cache_directory, default_uploads_directory, get_image_cache_directory,
    get_uploads_directory, set_image_cache_directory, set_uploads_directory,
};
pub use upload_limits::{
    get_chunk_size_kb, get_max_background_bytes, get_max_failed, get_max_prepared,
    get_max_transfers, set_chunk_size_kb, set_max_background_bytes, set_max_failed,
    set_max_prepared, set_max_transfers, UploadLimits, MAX_AUTO_UPLOADS_PER_CHECK,
};
pub use upload_policy::{
    get_auto_upload_config, get_last_deletion_proposal, get_wifi_only, is_auto_upload_active,
    reset_auto_upload_album, reset_auto_upload_category, set_auto_upload_active,
    set_auto_upload_config, set_last_deletion_proposal, set_wifi_only, AutoUploadConfig,
};
