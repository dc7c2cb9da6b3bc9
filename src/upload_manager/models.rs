use super::state::UploadState;
use crate::api::ServerVersion;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 通过分享或剪贴板传入的资源 id 前缀。
pub const INTENT_PREFIX: &str = "Intent-";
pub const CLIPBOARD_PREFIX: &str = "Clipboard-";
pub const IMAGE_SUFFIX: &str = "-img-";
pub const MOVIE_SUFFIX: &str = "-mov-";
const STAGED_EXTENSION: &str = "upload";

/// 上传请求的持久化 id。
pub type UploadId = i64;

/// 队列与缓存所有查询限定的服务器/用户组合。
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Account {
    pub server_path: String,
    pub username: String,
}

impl Account {
    pub fn new(server_path: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            server_path: server_path.into(),
            username: username.into(),
        }
    }
}

/// 上传管线掌握的当前登录会话信息。
#[derive(Debug, Clone, PartialEq)]
pub struct ServerProfile {
    pub account: Account,
    pub version: ServerVersion,
    /// 服务器接受的小写文件扩展名。
    pub file_types: Vec<String>,
    pub community_active: bool,
    pub is_admin: bool,
    pub uses_upload_async: bool,
}

impl ServerProfile {
    pub fn accepts(&self, extension: &str) -> bool {
        let extension = extension.to_ascii_lowercase();
        self.file_types.iter().any(|accepted| *accepted == extension)
    }

    /// 非管理员 Community 用户的上传需要等管理员审核。
    pub fn needs_moderation(&self) -> bool {
        self.community_active && !self.is_admin
    }

    pub fn file_types_joined(&self) -> String {
        self.file_types.join(",")
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExtensionCase {
    #[default]
    Keep,
    Lowercase,
    Uppercase,
}

/// 预处理阶段应用到文件名上的重命名规则。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileNameRules {
    #[serde(default)]
    pub prefix: String,
    #[serde(default)]
    pub suffix: String,
    #[serde(default)]
    pub replacements: Vec<(String, String)>,
    /// 追加相册计数器，例如 `-0042`。
    #[serde(default)]
    pub append_counter: bool,
    #[serde(default)]
    pub extension_case: ExtensionCase,
}

impl FileNameRules {
    pub fn is_empty(&self) -> bool {
        self.prefix.is_empty()
            && self.suffix.is_empty()
            && self.replacements.is_empty()
            && !self.append_counter
            && self.extension_case == ExtensionCase::Keep
    }
}

/// 每个请求保存的一份上传设置快照。
#[derive(Debug, Clone, PartialEq)]
pub struct UploadOptions {
    pub strip_gps: bool,
    pub resize_image: bool,
    /// 最长边像素数；0 表示保持原尺寸。
    pub photo_max_size: u32,
    pub compress_image: bool,
    pub photo_quality: u8,
    pub rename: FileNameRules,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            strip_gps: false,
            resize_image: false,
            photo_max_size: 0,
            compress_image: false,
            photo_quality: 98,
            rename: FileNameRules::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UploadRequest {
    pub id: UploadId,
    pub local_identifier: String,
    pub server_path: String,
    pub username: String,
    pub category: i64,
    pub server_file_types: String,
    pub request_date: DateTime<Utc>,
    pub state: UploadState,
    pub request_error: String,
    pub creation_date: DateTime<Utc>,
    pub file_name: String,
    pub mime_type: String,
    pub md5_sum: String,
    pub is_video: bool,
    pub author: String,
    pub privacy_level: i64,
    pub image_title: String,
    pub comment: String,
    pub tag_ids: String,
    /// 服务器图片 id，传输完成前为 0。
    pub image_id: i64,
    pub options: UploadOptions,
    pub delete_image_after_upload: bool,
    pub marked_for_auto_upload: bool,
}

impl UploadRequest {
    /// 属于该请求的所有暂存文件的名称前缀。
    pub fn file_prefix(&self) -> String {
        let prefix = self.local_identifier.replace('/', "-");
        if prefix.is_empty() {
            format!("file-{}", self.creation_date.timestamp())
        } else {
            prefix
        }
    }

    /// 上传目录中等待传输的预处理文件名。
    pub fn staged_file_name(&self) -> String {
        format!("{}.{STAGED_EXTENSION}", self.file_prefix())
    }

    /// 每个网络任务携带的 upload id 请求头的值。
    pub fn upload_header(&self) -> String {
        upload_header_value(self.id)
    }

    pub fn is_from_intent_or_clipboard(&self) -> bool {
        self.local_identifier.starts_with(INTENT_PREFIX)
            || self.local_identifier.starts_with(CLIPBOARD_PREFIX)
    }

    pub fn tag_id_list(&self) -> Vec<i64> {
        self.tag_ids
            .split(',')
            .filter_map(|raw| raw.trim().parse::<i64>().ok())
            .collect()
    }
}

const UPLOAD_HEADER_SCHEME: &str = "x-pwg-upload://";

pub fn upload_header_value(id: UploadId) -> String {
    format!("{UPLOAD_HEADER_SCHEME}{id}")
}

pub fn parse_upload_header(value: &str) -> Option<UploadId> {
    value
        .strip_prefix(UPLOAD_HEADER_SCHEME)
        .and_then(|raw| raw.parse::<UploadId>().ok())
}

/// 待入队资源的描述。
#[derive(Debug, Clone, PartialEq)]
pub struct UploadProperties {
    pub local_identifier: String,
    pub category: i64,
    pub server_file_types: String,
    pub request_date: Option<DateTime<Utc>>,
    pub state: UploadState,
    pub creation_date: Option<DateTime<Utc>>,
    pub file_name: String,
    pub author: String,
    pub privacy_level: i64,
    pub image_title: String,
    pub comment: String,
    pub tag_ids: String,
    pub options: UploadOptions,
    pub delete_image_after_upload: bool,
    pub marked_for_auto_upload: bool,
}

impl UploadProperties {
    pub fn new(local_identifier: impl Into<String>, category: i64) -> Self {
        Self {
            local_identifier: local_identifier.into(),
            category,
            server_file_types: String::new(),
            request_date: None,
            state: UploadState::Waiting,
            creation_date: None,
            file_name: String::new(),
            author: String::new(),
            privacy_level: 0,
            image_title: String::new(),
            comment: String::new(),
            tag_ids: String::new(),
            options: UploadOptions::default(),
            delete_image_after_upload: false,
            marked_for_auto_upload: false,
        }
    }
}

/// 提供给 UI 的角标计数。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UploadCounts {
    pub pending: i64,
    pub completed: i64,
}

/// 存储层发出的变更通知。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadChange {
    Inserted(Vec<UploadId>),
    Updated(Vec<UploadId>),
    Deleted(Vec<UploadId>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upload_header_round_trips() {
        assert_eq!(parse_upload_header(&upload_header_value(42)), Some(42));
        assert_eq!(parse_upload_header("42"), None);
        assert_eq!(parse_upload_header("x-pwg-upload://abc"), None);
    }

    #[test]
    fn file_prefix_replaces_slashes() {
        let mut props = UploadProperties::new("ABC/L0/001", 1);
        props.file_name = "IMG_1.JPG".to_string();
        let request = UploadRequest {
            id: 1,
            local_identifier: props.local_identifier.clone(),
            server_path: String::new(),
            username: String::new(),
            category: 1,
            server_file_types: String::new(),
            request_date: Utc::now(),
            state: UploadState::Waiting,
            request_error: String::new(),
            creation_date: Utc::now(),
            file_name: props.file_name,
            mime_type: String::new(),
            md5_sum: String::new(),
            is_video: false,
            author: String::new(),
            privacy_level: 0,
            image_title: String::new(),
            comment: String::new(),
            tag_ids: "3, 5,x".to_string(),
            image_id: 0,
            options: UploadOptions::default(),
            delete_image_after_upload: false,
            marked_for_auto_upload: false,
        };
        assert_eq!(request.file_prefix(), "ABC-L0-001");
        assert_eq!(request.staged_file_name(), "ABC-L0-001.upload");
        assert_eq!(request.tag_id_list(), vec![3, 5]);
    }
}
