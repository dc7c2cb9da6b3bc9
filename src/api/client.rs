use super::models::{
    AlbumData, ChunkUpload, ImageData, ImageInfoUpdate, ImagePage, ImageQuery, SessionStatus,
    UploadedImage, de_i64,
};
use super::{ChunkProgress, PiwigoApi};
use crate::cache::smart_albums;
use crate::error::PwgError;
use crate::upload_manager::ports::TransferSessions;
use chrono::{Duration as ChronoDuration, Utc};
use md5::{Digest, Md5};
use reqwest::blocking::{multipart, Client, Response};
use reqwest::redirect::Policy;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashSet;
use std::io::{Cursor, Read};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use url::Url;

pub const HEADER_UPLOAD_ID: &str = "X-PWG-UploadID";
pub const HEADER_LOCAL_IDENTIFIER: &str = "X-PWG-localIdentifier";
pub const HEADER_CHUNK: &str = "X-PWG-chunk";
pub const HEADER_CHUNKS: &str = "X-PWG-chunks";
pub const HEADER_MD5_SUM: &str = "X-PWG-md5sum";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(300);
const RECENT_PERIOD_DAYS: i64 = 31 * 3;

/// Piwigo JSON Web 服务（`ws.php`）的阻塞式客户端。
pub struct PiwigoClient {
    endpoint: Url,
    http: Client,
    upload_http: Client,
    pwg_token: Mutex<String>,
    running_uploads: Arc<Mutex<HashSet<String>>>,
}

impl PiwigoClient {
    pub fn new(server_path: &str) -> Result<Self, PwgError> {
        let mut base = Url::parse(server_path.trim())
            .map_err(|e| PwgError::InvalidUrl(format!("{server_path}: {e}")))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let endpoint = base
            .join("ws.php")
            .map_err(|e| PwgError::InvalidUrl(format!("{server_path}: {e}")))?;
        Ok(Self {
            endpoint,
            http: build_blocking_client(REQUEST_TIMEOUT)?,
            upload_http: build_blocking_client(UPLOAD_TIMEOUT)?,
            pwg_token: Mutex::new(String::new()),
            running_uploads: Arc::new(Mutex::new(HashSet::new())),
        })
    }

    /// 登录并建立会话；cookie 由客户端保存。
    pub fn login(&self, username: &str, password: &str) -> Result<SessionStatus, PwgError> {
        let _: Value = self.post_form(
            "pwg.session.login",
            &[("username", username.to_string()), ("password", password.to_string())],
        )?;
        self.check_session()
    }

    fn method_url(&self, method: &str) -> Url {
        let mut url = self.endpoint.clone();
        url.query_pairs_mut()
            .append_pair("format", "json")
            .append_pair("method", method);
        url
    }

    fn token(&self) -> String {
        self.pwg_token
            .lock()
            .map(|token| token.clone())
            .unwrap_or_else(|poison| poison.into_inner().clone())
    }

    fn post_form<T: DeserializeOwned>(
        &self,
        method: &str,
        params: &[(&str, String)],
    ) -> Result<T, PwgError> {
        log::debug!("[piwigo] {method}");
        let response = self
            .http
            .post(self.method_url(method))
            .header("Accept", "application/json")
            .form(params)
            .send()
            .map_err(map_transport_error)?;
        decode_response(method, response)
    }

    fn fetch_album_list(
        &self,
        method: &str,
        parent_id: i64,
        recursive: bool,
    ) -> Result<Vec<AlbumData>, PwgError> {
        let result: CategoriesResult = self.post_form(
            method,
            &[
                ("cat_id", parent_id.to_string()),
                ("recursive", recursive.to_string()),
                ("faked_by_community", "false".to_string()),
                ("thumbnail_size", "thumb".to_string()),
            ],
        )?;
        Ok(result
            .categories
            .into_iter()
            .filter_map(|raw| match serde_json::from_value::<AlbumData>(raw) {
                Ok(album) => Some(album),
                Err(err) => {
                    log::warn!("[piwigo] dropping malformed album from {method}: {err}");
                    None
                }
            })
            .collect())
    }

    fn image_listing_params(&self, query: &ImageQuery) -> (&'static str, Vec<(&'static str, String)>) {
        let mut params = vec![
            ("per_page", query.per_page.to_string()),
            ("page", query.page.to_string()),
            ("order", query.sort.param().to_string()),
        ];
        let method = match query.album_id {
            smart_albums::SEARCH => {
                params.push(("query", query.query.clone().unwrap_or_default()));
                "pwg.images.search"
            }
            smart_albums::VISITS => {
                params[2].1 = "hit desc, id desc".to_string();
                params.push(("recursive", "true".to_string()));
                params.push(("f_min_hit", "1".to_string()));
                "pwg.categories.getImages"
            }
            smart_albums::BEST => {
                params[2].1 = "rating_score desc, id desc".to_string();
                params.push(("recursive", "true".to_string()));
                params.push(("f_min_rate", "1".to_string()));
                "pwg.categories.getImages"
            }
            smart_albums::RECENT => {
                let since = Utc::now() - ChronoDuration::days(RECENT_PERIOD_DAYS);
                params[2].1 = "date_available desc, id desc".to_string();
                params.push(("recursive", "true".to_string()));
                params.push((
                    "f_min_date_available",
                    since.format("%Y-%m-%d %H:%M:%S").to_string(),
                ));
                "pwg.categories.getImages"
            }
            smart_albums::FAVORITES => "pwg.users.favorites.getList",
            id if smart_albums::is_tagged(id) => {
                params.push(("tag_id", smart_albums::tag_id(id).to_string()));
                "pwg.tags.getImages"
            }
            id => {
                params.push(("cat_id", id.to_string()));
                "pwg.categories.getImages"
            }
        };
        (method, params)
    }
}

impl PiwigoApi for PiwigoClient {
    fn get_albums(&self, parent_id: i64, recursive: bool) -> Result<Vec<AlbumData>, PwgError> {
        self.fetch_album_list("pwg.categories.getList", parent_id, recursive)
    }

    fn get_community_albums(
        &self,
        parent_id: i64,
        recursive: bool,
    ) -> Result<Vec<AlbumData>, PwgError> {
        self.fetch_album_list("community.categories.getList", parent_id, recursive)
    }

    fn get_images(&self, query: &ImageQuery) -> Result<ImagePage, PwgError> {
        let (method, params) = self.image_listing_params(query);
        let result: ImagesResult = self.post_form(method, &params)?;
        let images = result
            .images
            .into_iter()
            .filter_map(|raw| match serde_json::from_value::<ImageData>(raw) {
                Ok(image) => Some(image),
                Err(err) => {
                    log::warn!("[piwigo] dropping malformed image from {method}: {err}");
                    None
                }
            })
            .collect();
        let paging = result.paging.unwrap_or_default();
        Ok(ImagePage {
            images,
            page: paging.page,
            per_page: paging.per_page,
            count: paging.count,
            total_count: paging.total_count,
        })
    }

    fn get_image_info(&self, image_id: i64) -> Result<ImageData, PwgError> {
        self.post_form("pwg.images.getInfo", &[("image_id", image_id.to_string())])
    }

    fn set_image_info(&self, update: &ImageInfoUpdate) -> Result<(), PwgError> {
        let tag_ids = join_ids(&update.tag_ids, ",");
        let _: Value = self.post_form(
            "pwg.images.setInfo",
            &[
                ("image_id", update.image_id.to_string()),
                ("file", update.file_name.clone()),
                ("name", update.title.clone()),
                ("author", update.author.clone()),
                ("date_creation", update.date_creation.clone()),
                ("level", update.privacy_level.to_string()),
                ("comment", update.comment.clone()),
                ("tag_ids", tag_ids),
                ("single_value_mode", "replace".to_string()),
                ("multiple_value_mode", "replace".to_string()),
                ("pwg_token", self.token()),
            ],
        )?;
        Ok(())
    }

    fn upload_chunk(
        &self,
        chunk: ChunkUpload,
        progress: Option<ChunkProgress>,
    ) -> Result<Option<UploadedImage>, PwgError> {
        let method = if chunk.use_async {
            "pwg.images.uploadAsync"
        } else {
            "pwg.images.upload"
        };
        let mut form = multipart::Form::new()
            .text("chunk", chunk.chunk.to_string())
            .text("chunks", chunk.chunks.to_string())
            .text("category", chunk.category.to_string())
            .text("level", chunk.privacy_level.to_string())
            .text("name", chunk.title.clone())
            .text("pwg_token", self.token());
        if chunk.use_async {
            let chunk_sum = format!("{:x}", Md5::digest(&chunk.data));
            form = form
                .text("chunk_sum", chunk_sum)
                .text("original_sum", chunk.md5_sum.clone())
                .text("filename", chunk.file_name.clone())
                .text("author", chunk.author.clone())
                .text("comment", chunk.comment.clone())
                .text("date_creation", chunk.date_creation.clone())
                .text("tag_ids", join_ids(&chunk.tag_ids, ","));
        }
        let length = chunk.data.len() as u64;
        let reader = ProgressReader::new(Cursor::new(chunk.data), progress);
        let part = multipart::Part::reader_with_length(reader, length)
            .file_name(chunk.file_name.clone())
            .mime_str(if chunk.mime_type.is_empty() {
                "application/octet-stream"
            } else {
                chunk.mime_type.as_str()
            })
            .map_err(|e| {
                log::warn!("[piwigo] rejected mime type {}: {e}", chunk.mime_type);
                PwgError::InvalidParameter
            })?;
        form = form.part("file", part);

        let running = RunningUpload::register(&self.running_uploads, &chunk.upload_id);
        log::debug!(
            "[piwigo] {method} chunk {}/{} of {}",
            chunk.chunk + 1,
            chunk.chunks,
            chunk.local_identifier
        );
        let response = self
            .upload_http
            .post(self.method_url(method))
            .header(HEADER_UPLOAD_ID, chunk.upload_id.as_str())
            .header(HEADER_LOCAL_IDENTIFIER, chunk.local_identifier.as_str())
            .header(HEADER_CHUNK, chunk.chunk.to_string())
            .header(HEADER_CHUNKS, chunk.chunks.to_string())
            .header(HEADER_MD5_SUM, chunk.md5_sum.as_str())
            .header("filename", chunk.file_name.as_str())
            .multipart(form)
            .send()
            .map_err(map_transport_error)?;
        let result: Value = decode_response(method, response)?;
        if chunk.chunk + 1 < chunk.chunks {
            running.keep();
        }
        Ok(uploaded_image_from(result))
    }

    fn empty_lounge(&self, image_ids: &[i64], category_id: i64) -> Result<(), PwgError> {
        self.check_session()?;
        let _: Value = self.post_form(
            "pwg.images.uploadCompleted",
            &[
                ("image_id", join_ids(image_ids, ",")),
                ("pwg_token", self.token()),
                ("category_id", category_id.to_string()),
            ],
        )?;
        Ok(())
    }

    fn moderate_images(&self, image_ids: &[i64], category_id: i64) -> Result<Vec<i64>, PwgError> {
        let result: ModerationResult = self.post_form(
            "community.images.uploadCompleted",
            &[
                ("image_id", join_ids(image_ids, ",")),
                ("pwg_token", self.token()),
                ("category_id", category_id.to_string()),
            ],
        )?;
        Ok(result
            .pending
            .into_iter()
            .filter(|entry| entry.state == "validated")
            .map(|entry| entry.id)
            .collect())
    }

    fn check_session(&self) -> Result<SessionStatus, PwgError> {
        let status: SessionStatus = self.post_form("pwg.session.getStatus", &[])?;
        if let Ok(mut token) = self.pwg_token.lock() {
            *token = status.pwg_token.clone();
        }
        Ok(status)
    }
}

impl TransferSessions for PiwigoClient {
    fn running_upload_ids(&self) -> Vec<String> {
        match self.running_uploads.lock() {
            Ok(running) => running.iter().cloned().collect(),
            Err(poison) => poison.into_inner().iter().cloned().collect(),
        }
    }
}

/// 构建统一超时、重定向与 cookie 策略的阻塞式 HTTP 客户端。
pub(crate) fn build_blocking_client(timeout: Duration) -> Result<Client, PwgError> {
    Client::builder()
        .timeout(timeout)
        .redirect(Policy::limited(10))
        .cookie_store(true)
        .build()
        .map_err(|e| PwgError::InvalidUrl(format!("failed to build HTTP client: {e}")))
}

fn map_transport_error(err: reqwest::Error) -> PwgError {
    if err.is_timeout() {
        PwgError::Timeout
    } else if let Some(status) = err.status() {
        PwgError::Http(status.as_u16())
    } else {
        log::warn!("[piwigo] transport error: {err}");
        PwgError::NetworkUnavailable
    }
}

fn decode_response<T: DeserializeOwned>(method: &str, response: Response) -> Result<T, PwgError> {
    let status = response.status();
    if status.as_u16() == 401 {
        return Err(PwgError::AuthenticationFailed);
    }
    if !status.is_success() {
        return Err(PwgError::Http(status.as_u16()));
    }
    let bytes = response.bytes().map_err(map_transport_error)?;
    decode_envelope(method, &bytes)
}

#[derive(Debug, Deserialize)]
struct Envelope {
    stat: String,
    #[serde(default)]
    result: Value,
    #[serde(default, deserialize_with = "de_i64")]
    err: i64,
    #[serde(default)]
    message: String,
}

/// 解析 `{"stat": ..., "result": ...}`，跳过部分服务器在 JSON 前输出的 PHP notice。
pub(crate) fn decode_envelope<T: DeserializeOwned>(method: &str, bytes: &[u8]) -> Result<T, PwgError> {
    let start = bytes.iter().position(|b| *b == b'{');
    let Some(start) = start else {
        return Err(if bytes.iter().all(u8::is_ascii_whitespace) {
            PwgError::EmptyJson
        } else {
            PwgError::InvalidJson(format!("{method}: no JSON object"))
        });
    };
    let envelope: Envelope = serde_json::from_slice(&bytes[start..])
        .map_err(|e| PwgError::InvalidJson(format!("{method}: {e}")))?;
    if envelope.stat != "ok" {
        return Err(PwgError::from_code(envelope.err, &envelope.message));
    }
    serde_json::from_value(envelope.result).map_err(|e| PwgError::WrongJson(format!("{method}: {e}")))
}

fn uploaded_image_from(result: Value) -> Option<UploadedImage> {
    if let Some(image_id) = result.get("image_id").and_then(value_as_i64) {
        return Some(UploadedImage {
            image_id,
            square_url: result
                .get("square_src")
                .and_then(Value::as_str)
                .map(str::to_string),
            thumb_url: result.get("src").and_then(Value::as_str).map(str::to_string),
            info: None,
        });
    }
    if result.get("id").is_some() {
        return match serde_json::from_value::<ImageData>(result) {
            Ok(info) => Some(UploadedImage {
                image_id: info.id,
                square_url: info.derivatives.get("square").and_then(|d| d.url.clone()),
                thumb_url: info.derivatives.get("thumb").and_then(|d| d.url.clone()),
                info: Some(info),
            }),
            Err(err) => {
                log::warn!("[piwigo] unreadable uploaded image description: {err}");
                None
            }
        };
    }
    None
}

fn value_as_i64(value: &Value) -> Option<i64> {
    value
        .as_i64()
        .or_else(|| value.as_str().and_then(|text| text.trim().parse().ok()))
}

fn join_ids(ids: &[i64], separator: &str) -> String {
    ids.iter()
        .map(i64::to_string)
        .collect::<Vec<_>>()
        .join(separator)
}

#[derive(Debug, Deserialize)]
struct CategoriesResult {
    #[serde(default)]
    categories: Vec<Value>,
}

#[derive(Debug, Default, Deserialize)]
struct PagingDto {
    #[serde(default, deserialize_with = "de_i64")]
    page: i64,
    #[serde(default, deserialize_with = "de_i64")]
    per_page: i64,
    #[serde(default, deserialize_with = "de_i64")]
    count: i64,
    #[serde(default, deserialize_with = "super::models::de_opt_i64")]
    total_count: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct ImagesResult {
    #[serde(default)]
    paging: Option<PagingDto>,
    #[serde(default)]
    images: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct ModerationEntry {
    #[serde(deserialize_with = "de_i64")]
    id: i64,
    #[serde(default)]
    state: String,
}

#[derive(Debug, Deserialize)]
struct ModerationResult {
    #[serde(default)]
    pending: Vec<ModerationEntry>,
}

/// reqwest 发送分片时上报请求体进度的 Reader。
struct ProgressReader<R: Read> {
    inner: R,
    sent: u64,
    progress: Option<ChunkProgress>,
}

impl<R: Read> ProgressReader<R> {
    fn new(inner: R, progress: Option<ChunkProgress>) -> Self {
        Self {
            inner,
            sent: 0,
            progress,
        }
    }
}

impl<R: Read> Read for ProgressReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let read_bytes = self.inner.read(buf)?;
        if read_bytes > 0 {
            self.sent = self.sent.saturating_add(read_bytes as u64);
            if let Some(cb) = self.progress.as_mut() {
                cb(self.sent);
            }
        }
        Ok(read_bytes)
    }
}

/// 从第一个分片开始登记 upload id，直到最后一个分片得到应答或某个分片失败。
struct RunningUpload {
    running: Arc<Mutex<HashSet<String>>>,
    upload_id: String,
    keep: bool,
}

impl RunningUpload {
    fn register(running: &Arc<Mutex<HashSet<String>>>, upload_id: &str) -> Self {
        if let Ok(mut set) = running.lock() {
            set.insert(upload_id.to_string());
        }
        Self {
            running: Arc::clone(running),
            upload_id: upload_id.to_string(),
            keep: false,
        }
    }

    /// 后面还有分片，id 继续保持登记。
    fn keep(mut self) {
        self.keep = true;
    }
}

impl Drop for RunningUpload {
    fn drop(&mut self) {
        if self.keep {
            return;
        }
        if let Ok(mut set) = self.running.lock() {
            set.remove(&self.upload_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_keeps_the_server_path() {
        let client = PiwigoClient::new("https://example.org/piwigo").expect("client");
        let url = client.method_url("pwg.session.getStatus");
        assert_eq!(url.path(), "/piwigo/ws.php");
        assert_eq!(url.query(), Some("format=json&method=pwg.session.getStatus"));
        assert!(matches!(
            PiwigoClient::new("not a url"),
            Err(PwgError::InvalidUrl(_))
        ));
    }

    #[test]
    fn envelope_maps_failures_to_typed_errors() {
        let err = decode_envelope::<Value>(
            "pwg.images.setInfo",
            br#"{"stat":"fail","err":1002,"message":""}"#,
        )
        .expect_err("fail");
        assert_eq!(err, PwgError::MissingParameter);
        assert_eq!(
            decode_envelope::<Value>("m", b"  ").expect_err("empty"),
            PwgError::EmptyJson
        );
        assert!(matches!(
            decode_envelope::<Value>("m", b"<html>").expect_err("html"),
            PwgError::InvalidJson(_)
        ));
    }

    #[test]
    fn envelope_skips_leading_php_notices() {
        let status: SessionStatus = decode_envelope(
            "pwg.session.getStatus",
            br#"Notice: undefined index<br/>{"stat":"ok","result":{"username":"alice","status":"admin","version":"14.1.0","pwg_token":"abc"}}"#,
        )
        .expect("status");
        assert_eq!(status.username, "alice");
        assert!(status.is_admin());
    }

    #[test]
    fn legacy_and_async_upload_answers_are_recognised() {
        let legacy = uploaded_image_from(serde_json::json!({
            "image_id": "12", "square_src": "https://x/sq.jpg", "src": "https://x/th.jpg"
        }))
        .expect("legacy");
        assert_eq!(legacy.image_id, 12);
        assert!(legacy.info.is_none());

        let asynchronous = uploaded_image_from(serde_json::json!({
            "id": 13, "name": "t", "derivatives": {"thumb": {"url": "https://x/t.jpg"}}
        }))
        .expect("async");
        assert_eq!(asynchronous.image_id, 13);
        assert_eq!(asynchronous.thumb_url.as_deref(), Some("https://x/t.jpg"));

        assert!(uploaded_image_from(serde_json::json!({"message": "chunks uploaded = 0"})).is_none());
    }

    #[test]
    fn upload_ids_stay_registered_between_chunks() {
        let client = PiwigoClient::new("https://example.org").expect("client");
        RunningUpload::register(&client.running_uploads, "7").keep();
        assert_eq!(client.running_upload_ids(), vec!["7".to_string()]);

        // 最后一个分片或失败的分片会释放 id。
        drop(RunningUpload::register(&client.running_uploads, "7"));
        assert!(client.running_upload_ids().is_empty());
    }

    #[test]
    fn smart_albums_select_their_method() {
        let client = PiwigoClient::new("https://example.org").expect("client");
        let query = |album_id| ImageQuery {
            album_id,
            per_page: 100,
            ..ImageQuery::default()
        };
        assert_eq!(client.image_listing_params(&query(5)).0, "pwg.categories.getImages");
        assert_eq!(
            client.image_listing_params(&query(smart_albums::FAVORITES)).0,
            "pwg.users.favorites.getList"
        );
        let (method, params) = client.image_listing_params(&query(-13));
        assert_eq!(method, "pwg.tags.getImages");
        assert!(params.contains(&("tag_id", "3".to_string())));
    }
}
