use crate::api::Derivative;
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// 由服务器计算、并不真实存储的相册 id。
pub mod smart_albums {
    pub const ROOT: i64 = 0;
    pub const SEARCH: i64 = -1;
    pub const VISITS: i64 = -2;
    pub const BEST: i64 = -3;
    pub const RECENT: i64 = -4;
    pub const FAVORITES: i64 = -6;
    /// 标签 `t` 以相册 `TAGGED - t` 的形式浏览。
    pub const TAGGED: i64 = -10;

    pub fn is_smart(album_id: i64) -> bool {
        album_id < ROOT
    }

    pub fn is_tagged(album_id: i64) -> bool {
        album_id <= TAGGED
    }

    pub fn tag_id(album_id: i64) -> i64 {
        TAGGED - album_id
    }

    pub fn tagged_album(tag_id: i64) -> i64 {
        TAGGED - tag_id
    }
}

/// 删除相册时如何处理其中的图片。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteMode {
    /// 保留图片。
    None,
    /// 删除不属于其他相册的图片。
    Orphaned,
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageSize {
    Square,
    Thumb,
    XXSmall,
    XSmall,
    Small,
    Medium,
    Large,
    XLarge,
    XXLarge,
    FullRes,
}

impl ImageSize {
    pub const ALL: [ImageSize; 10] = [
        ImageSize::Square,
        ImageSize::Thumb,
        ImageSize::XXSmall,
        ImageSize::XSmall,
        ImageSize::Small,
        ImageSize::Medium,
        ImageSize::Large,
        ImageSize::XLarge,
        ImageSize::XXLarge,
        ImageSize::FullRes,
    ];

    /// 该尺寸在 Web 服务 `derivatives` 对象中的键名。
    pub fn derivative_key(self) -> Option<&'static str> {
        match self {
            ImageSize::Square => Some("square"),
            ImageSize::Thumb => Some("thumb"),
            ImageSize::XXSmall => Some("2small"),
            ImageSize::XSmall => Some("xsmall"),
            ImageSize::Small => Some("small"),
            ImageSize::Medium => Some("medium"),
            ImageSize::Large => Some("large"),
            ImageSize::XLarge => Some("xlarge"),
            ImageSize::XXLarge => Some("xxlarge"),
            ImageSize::FullRes => None,
        }
    }

    /// 该尺寸在图片缓存中的目录名。
    pub fn directory(self) -> &'static str {
        match self {
            ImageSize::Square => "square",
            ImageSize::Thumb => "thumb",
            ImageSize::XXSmall => "xxsmall",
            ImageSize::XSmall => "xsmall",
            ImageSize::Small => "small",
            ImageSize::Medium => "medium",
            ImageSize::Large => "large",
            ImageSize::XLarge => "xlarge",
            ImageSize::XXLarge => "xxlarge",
            ImageSize::FullRes => "fullres",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SizeInfo {
    pub url: String,
    pub width: i64,
    pub height: i64,
}

/// 图片的所有已知尺寸，以 JSON 形式存放在图片行中。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImageSizes(pub BTreeMap<ImageSize, SizeInfo>);

impl ImageSizes {
    pub fn from_derivatives(
        derivatives: &BTreeMap<String, Derivative>,
        full_res_url: Option<&str>,
        width: i64,
        height: i64,
    ) -> Self {
        let mut sizes = BTreeMap::new();
        for size in ImageSize::ALL {
            let Some(key) = size.derivative_key() else {
                continue;
            };
            if let Some(derivative) = derivatives.get(key) {
                if let Some(url) = derivative.url.as_deref().filter(|url| !url.is_empty()) {
                    sizes.insert(
                        size,
                        SizeInfo {
                            url: normalize_url(url),
                            width: derivative.width,
                            height: derivative.height,
                        },
                    );
                }
            }
        }
        if let Some(url) = full_res_url.filter(|url| !url.is_empty()) {
            sizes.insert(
                ImageSize::FullRes,
                SizeInfo {
                    url: normalize_url(url),
                    width,
                    height,
                },
            );
        }
        Self(sizes)
    }

    pub fn get(&self, size: ImageSize) -> Option<&SizeInfo> {
        self.0.get(&size)
    }

    pub fn full_res_url(&self) -> Option<&str> {
        self.get(ImageSize::FullRes).map(|info| info.url.as_str())
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }

    pub fn from_json(raw: &str) -> Self {
        serde_json::from_str(raw).unwrap_or_default()
    }
}

// 部分服务器在衍生图 URL 中未转义的字符。
const URL_UNSAFE: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'<')
    .add(b'>')
    .add(b'`')
    .add(b'{')
    .add(b'}')
    .add(b'|')
    .add(b'\\')
    .add(b'^');

/// 转义空格与非 ASCII 字符，已有的 `%` 序列保持不变。
pub fn normalize_url(raw: &str) -> String {
    utf8_percent_encode(raw.trim(), URL_UNSAFE).to_string()
}

const PATH_UNSAFE: &AsciiSet = &CONTROLS
    .add(b'/')
    .add(b'\\')
    .add(b':')
    .add(b'?')
    .add(b'*')
    .add(b'"')
    .add(b'<')
    .add(b'>')
    .add(b'|')
    .add(b'%')
    .add(b' ');

/// 服务器在图片缓存中的目录名。
pub fn server_directory(server_path: &str) -> String {
    let trimmed = server_path
        .trim()
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .trim_end_matches('/');
    utf8_percent_encode(trimmed, PATH_UNSAFE).to_string()
}

const VIDEO_EXTENSIONS: [&str; 9] = ["mp4", "m4v", "mov", "mpg", "mpeg", "avi", "webm", "ogv", "mkv"];

pub fn is_video_file(file_name: &str) -> bool {
    file_name
        .rsplit_once('.')
        .map(|(_, ext)| VIDEO_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// rank 字符串的数字段，例如 "3.12.4" -> [3, 12, 4]。
pub fn rank_segments(rank: &str) -> Vec<i64> {
    rank.split('.')
        .filter_map(|segment| segment.trim().parse::<i64>().ok())
        .collect()
}

pub fn join_rank(segments: &[i64]) -> String {
    segments
        .iter()
        .map(i64::to_string)
        .collect::<Vec<_>>()
        .join(".")
}
