use thiserror::Error;

/// Piwigo Web 服务调用失败，按上传管线的视角归类。
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PwgError {
    #[error("network connection unavailable")]
    NetworkUnavailable,
    #[error("server did not answer in time")]
    Timeout,
    #[error("authentication failed; session must be renewed")]
    AuthenticationFailed,
    #[error("invalid username or password")]
    InvalidCredentials,
    #[error("incompatible Piwigo server version")]
    IncompatibleVersion,
    #[error("invalid server URL: {0}")]
    InvalidUrl(String),
    #[error("empty JSON object")]
    EmptyJson,
    #[error("invalid JSON object: {0}")]
    InvalidJson(String),
    #[error("unexpected JSON object: {0}")]
    WrongJson(String),
    #[error("invalid method")]
    InvalidMethod,
    #[error("invalid parameter")]
    InvalidParameter,
    #[error("missing parameter")]
    MissingParameter,
    #[error("server error {code}: {message}")]
    Server { code: i64, message: String },
    #[error("server returned HTTP {0}")]
    Http(u16),
}

impl PwgError {
    /// 将 Web 服务的 `stat: fail` 应答映射为类型化错误。
    pub fn from_code(code: i64, message: &str) -> Self {
        match code {
            400 | 405 | 501 if message.is_empty() => PwgError::InvalidMethod,
            401 if message.is_empty() => PwgError::AuthenticationFailed,
            403 | 404 | 1003 if message.is_empty() => PwgError::InvalidParameter,
            1002 if message.is_empty() => PwgError::MissingParameter,
            999 if message.contains("Invalid username/password") => PwgError::InvalidCredentials,
            _ => PwgError::Server {
                code,
                message: message.to_string(),
            },
        }
    }

    /// 瞬时错误由调度器自动重试；其余错误需要服务器端变更，或本身就不受支持。
    pub fn is_transient(&self) -> bool {
        match self {
            PwgError::NetworkUnavailable | PwgError::Timeout | PwgError::AuthenticationFailed => {
                true
            }
            PwgError::Http(status) => *status >= 500 || *status == 408 || *status == 429,
            PwgError::Server { code, .. } => (500..600).contains(code) || *code == 401,
            PwgError::EmptyJson | PwgError::InvalidJson(_) => true,
            _ => false,
        }
    }
}

/// 上传管线的错误。
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("upload request is missing required data")]
    MissingData,
    #[error("asset is not available in the media library")]
    MissingAsset,
    #[error("file format not accepted by the Piwigo server")]
    WrongDataFormat,
    #[error("upload request {0} not found")]
    NotFound(i64),
    #[error("failed to delete upload requests: {0}")]
    Deletion(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("media library error: {0}")]
    Media(#[from] MediaError),
    #[error(transparent)]
    Pwg(#[from] PwgError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// 宿主媒体库上报的错误。
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MediaError {
    #[error("asset {0} not found")]
    AssetNotFound(String),
    #[error("collection {0} not accessible")]
    CollectionUnavailable(String),
    #[error("access to the media library denied")]
    AccessDenied,
    #[error("media library error: {0}")]
    Other(String),
}

/// 相册/图片缓存同步的错误。
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("storage error: {0}")]
    Storage(String),
    #[error(transparent)]
    Pwg(#[from] PwgError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<String> for CacheError {
    fn from(value: String) -> Self {
        CacheError::Storage(value)
    }
}

impl From<String> for UploadError {
    fn from(value: String) -> Self {
        UploadError::Storage(value)
    }
}
