use serde::{de, Deserialize, Deserializer};
use std::collections::BTreeMap;

/// `pwg.categories.getList` 或 `community.categories.getList` 返回的相册。
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AlbumData {
    #[serde(deserialize_with = "de_i64")]
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub global_rank: Option<String>,
    #[serde(default, rename = "id_uppercat", deserialize_with = "de_opt_i64")]
    pub parent_id: Option<i64>,
    /// 祖先链（含相册自身），例如 "1,5,7"。
    #[serde(default, rename = "uppercats")]
    pub upper_cats: Option<String>,
    #[serde(default, deserialize_with = "de_i64")]
    pub nb_images: i64,
    #[serde(default, deserialize_with = "de_i64")]
    pub total_nb_images: i64,
    #[serde(default, rename = "nb_categories", deserialize_with = "de_i64")]
    pub nb_sub_albums: i64,
    #[serde(
        default,
        rename = "representative_picture_id",
        deserialize_with = "de_opt_i64"
    )]
    pub thumbnail_id: Option<i64>,
    #[serde(default, rename = "tn_url")]
    pub thumbnail_url: Option<String>,
    #[serde(default)]
    pub date_last: Option<String>,
    #[serde(default, rename = "image_order")]
    pub image_sort: Option<String>,
    /// 合并 Community 列表时设置。
    #[serde(skip)]
    pub has_upload_rights: bool,
}

impl AlbumData {
    pub fn upper_ids(&self) -> Vec<i64> {
        split_ids(self.upper_cats.as_deref().unwrap_or_default(), ',')
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Derivative {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default, deserialize_with = "de_i64")]
    pub width: i64,
    #[serde(default, deserialize_with = "de_i64")]
    pub height: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct IdRef {
    #[serde(deserialize_with = "de_i64")]
    pub id: i64,
}

/// 列表、`pwg.images.getInfo` 与 `pwg.images.uploadAsync` 返回的图片。
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ImageData {
    #[serde(deserialize_with = "de_i64")]
    pub id: i64,
    #[serde(default, rename = "name")]
    pub title: Option<String>,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default, rename = "hit", deserialize_with = "de_i64")]
    pub visits: i64,
    #[serde(default, rename = "file")]
    pub file_name: Option<String>,
    #[serde(default, rename = "date_creation")]
    pub date_created: Option<String>,
    #[serde(default, rename = "date_available")]
    pub date_posted: Option<String>,
    #[serde(default, deserialize_with = "de_i64")]
    pub width: i64,
    #[serde(default, deserialize_with = "de_i64")]
    pub height: i64,
    #[serde(default, rename = "element_url")]
    pub full_res_url: Option<String>,
    #[serde(default)]
    pub derivatives: BTreeMap<String, Derivative>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default, rename = "level", deserialize_with = "de_i64")]
    pub privacy_level: i64,
    #[serde(default)]
    pub tags: Vec<IdRef>,
    #[serde(default, deserialize_with = "de_opt_f64")]
    pub rating_score: Option<f64>,
    /// 服务器上报的大小，单位 KB。
    #[serde(default, rename = "filesize", deserialize_with = "de_i64")]
    pub file_size_kb: i64,
    #[serde(default, rename = "md5sum")]
    pub md5_sum: Option<String>,
    #[serde(default)]
    pub categories: Vec<IdRef>,
    #[serde(default)]
    pub is_favorite: Option<bool>,
    #[serde(default, deserialize_with = "de_opt_f64")]
    pub latitude: Option<f64>,
    #[serde(default, deserialize_with = "de_opt_f64")]
    pub longitude: Option<f64>,
}

/// 图片列表的一页。
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImagePage {
    pub images: Vec<ImageData>,
    pub page: i64,
    pub per_page: i64,
    pub count: i64,
    pub total_count: Option<i64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ImageSort {
    #[default]
    Manual,
    Random,
    NameAscending,
    NameDescending,
    DateCreatedDescending,
    DateCreatedAscending,
    DatePostedDescending,
    DatePostedAscending,
    FileNameAscending,
    FileNameDescending,
    IdAscending,
    IdDescending,
}

impl ImageSort {
    pub fn param(self) -> &'static str {
        match self {
            ImageSort::Manual => "rank asc",
            ImageSort::Random => "random",
            ImageSort::NameAscending => "name asc, date_creation asc, id desc",
            ImageSort::NameDescending => "name desc, date_creation asc, id asc",
            ImageSort::DateCreatedDescending => "date_creation desc, file asc, id desc",
            ImageSort::DateCreatedAscending => "date_creation asc, file asc, id asc",
            ImageSort::DatePostedDescending => "date_available desc, file asc, id asc",
            ImageSort::DatePostedAscending => "date_available asc, file asc, id desc",
            ImageSort::FileNameAscending => "file asc, id asc",
            ImageSort::FileNameDescending => "file desc, id desc",
            ImageSort::IdAscending => "id asc",
            ImageSort::IdDescending => "id desc",
        }
    }

    /// 只能通过分页位置得知顺序的排序方式。
    pub fn ranks_by_position(self) -> bool {
        matches!(self, ImageSort::Manual | ImageSort::Random)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImageQuery {
    pub album_id: i64,
    /// 搜索智能相册的搜索词。
    pub query: Option<String>,
    pub sort: ImageSort,
    pub page: i64,
    pub per_page: i64,
}

/// `pwg.images.setInfo` 的参数。
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImageInfoUpdate {
    pub image_id: i64,
    pub file_name: String,
    pub title: String,
    pub author: String,
    /// "yyyy-MM-dd HH:mm:ss"
    pub date_creation: String,
    pub privacy_level: i64,
    pub comment: String,
    pub tag_ids: Vec<i64>,
}

/// 文件传输中的一个分片。
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChunkUpload {
    /// `X-PWG-UploadID` 请求头的值。
    pub upload_id: String,
    pub local_identifier: String,
    pub file_name: String,
    pub mime_type: String,
    pub md5_sum: String,
    pub category: i64,
    pub privacy_level: i64,
    pub title: String,
    pub author: String,
    pub comment: String,
    pub date_creation: String,
    pub tag_ids: Vec<i64>,
    pub chunk: usize,
    pub chunks: usize,
    pub data: Vec<u8>,
    /// 使用 `pwg.images.uploadAsync`，而不是旧的 `pwg.images.upload`。
    pub use_async: bool,
}

/// 服务器对传输最后一个分片的应答。
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UploadedImage {
    pub image_id: i64,
    pub square_url: Option<String>,
    pub thumb_url: Option<String>,
    /// 完整描述，仅 `pwg.images.uploadAsync` 返回。
    pub info: Option<ImageData>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SessionStatus {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub pwg_token: String,
    #[serde(default)]
    pub upload_file_types: String,
}

impl SessionStatus {
    pub fn is_admin(&self) -> bool {
        matches!(self.status.as_str(), "admin" | "webmaster")
    }

    pub fn file_types(&self) -> Vec<String> {
        self.upload_file_types
            .split(',')
            .map(|ext| ext.trim().to_ascii_lowercase())
            .filter(|ext| !ext.is_empty())
            .collect()
    }
}

pub fn split_ids(raw: &str, separator: char) -> Vec<i64> {
    raw.split(separator)
        .filter_map(|part| part.trim().parse::<i64>().ok())
        .collect()
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Lenient {
    Int(i64),
    Float(f64),
    Bool(bool),
    Text(String),
}

impl Lenient {
    fn as_i64(&self) -> Option<i64> {
        match self {
            Lenient::Int(value) => Some(*value),
            Lenient::Float(value) => Some(*value as i64),
            Lenient::Bool(value) => Some(*value as i64),
            Lenient::Text(text) if text.trim().is_empty() => None,
            Lenient::Text(text) => text.trim().parse::<i64>().ok(),
        }
    }

    fn as_f64(&self) -> Option<f64> {
        match self {
            Lenient::Int(value) => Some(*value as f64),
            Lenient::Float(value) => Some(*value),
            Lenient::Bool(_) => None,
            Lenient::Text(text) => text.trim().parse::<f64>().ok(),
        }
    }
}

// Web 服务的数字可能是 JSON 数字，也可能是字符串。
pub(crate) fn de_i64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
    match Option::<Lenient>::deserialize(deserializer)? {
        None => Ok(0),
        Some(Lenient::Text(text)) if text.trim().is_empty() => Ok(0),
        Some(value) => value
            .as_i64()
            .ok_or_else(|| de::Error::custom("expected an integer")),
    }
}

pub(crate) fn de_opt_i64<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<i64>, D::Error> {
    Ok(Option::<Lenient>::deserialize(deserializer)?.and_then(|value| value.as_i64()))
}

pub(crate) fn de_opt_f64<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<f64>, D::Error> {
    Ok(Option::<Lenient>::deserialize(deserializer)?.and_then(|value| value.as_f64()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn album_accepts_numbers_as_strings() {
        let album: AlbumData = serde_json::from_str(
            r#"{"id":"7","name":"Trips","id_uppercat":"3","uppercats":"3,7",
                "global_rank":"2.1","nb_images":"12","total_nb_images":15,
                "nb_categories":0,"representative_picture_id":"42",
                "date_last":"2023-04-01 10:00:00","tn_url":"https://x/t.jpg"}"#,
        )
        .expect("album");
        assert_eq!(album.id, 7);
        assert_eq!(album.parent_id, Some(3));
        assert_eq!(album.upper_ids(), vec![3, 7]);
        assert_eq!(album.nb_images, 12);
        assert_eq!(album.thumbnail_id, Some(42));
        assert!(!album.has_upload_rights);
    }

    #[test]
    fn root_album_has_no_parent() {
        let album: AlbumData =
            serde_json::from_str(r#"{"id":1,"name":"A","id_uppercat":null}"#).expect("album");
        assert_eq!(album.parent_id, None);
        assert_eq!(album.nb_images, 0);
    }

    #[test]
    fn album_without_id_is_rejected() {
        assert!(serde_json::from_str::<AlbumData>(r#"{"name":"A"}"#).is_err());
        assert!(serde_json::from_str::<AlbumData>(r#"{"id":"x","name":"A"}"#).is_err());
    }

    #[test]
    fn image_reads_derivatives_and_memberships() {
        let image: ImageData = serde_json::from_str(
            r#"{"id":1042,"name":"Title","hit":"3","file":"IMG.jpg",
                "date_creation":"2020-01-02 03:04:05","width":"4092","height":2048,
                "element_url":"https://x/IMG.jpg","level":"0","rating_score":null,
                "filesize":"3025","md5sum":"2141e377254a429be151900e4bedb520",
                "categories":[{"id":5},{"id":"6"}],"tags":[{"id":"9"}],
                "derivatives":{"square":{"url":"https://x/sq.jpg","width":120,"height":"120"}}}"#,
        )
        .expect("image");
        assert_eq!(image.visits, 3);
        assert_eq!(image.width, 4092);
        assert_eq!(image.rating_score, None);
        assert_eq!(image.categories.iter().map(|c| c.id).collect::<Vec<_>>(), vec![5, 6]);
        assert_eq!(image.derivatives["square"].height, 120);
    }

    #[test]
    fn session_status_lists_file_types() {
        let status = SessionStatus {
            status: "normal".to_string(),
            upload_file_types: "jpg,JPEG, png,,mp4".to_string(),
            ..SessionStatus::default()
        };
        assert!(!status.is_admin());
        assert_eq!(status.file_types(), vec!["jpg", "jpeg", "png", "mp4"]);
    }
}
