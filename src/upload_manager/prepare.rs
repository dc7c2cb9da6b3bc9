//! 把本地资源转换为服务器可接受的暂存文件。

use super::context::UploadContext;
use super::models::{ExtensionCase, FileNameRules, UploadRequest, IMAGE_SUFFIX, MOVIE_SUFFIX};
use super::ports::MediaAsset;
use super::state::UploadState;
use crate::error::{MediaError, UploadError};
use chrono::{DateTime, Utc};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat};
use md5::{Digest, Md5};
use std::fs;
use std::io::{Cursor, ErrorKind};

const DEFAULT_JPEG_QUALITY: u8 = 98;

/// 预处理结果，由调度器写回请求。
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct PreparedFile {
    pub file_name: String,
    pub mime_type: String,
    pub md5_sum: String,
    pub is_video: bool,
    pub creation_date: DateTime<Utc>,
    pub byte_count: u64,
}

/// 载入资源，转换并重命名，然后写出暂存文件。
pub(crate) fn prepare_upload(ctx: &UploadContext, request: &UploadRequest) -> Result<PreparedFile, UploadError> {
    let profile = ctx.profile();
    let asset = load_source(ctx, request)?;
    let creation_date = asset.creation_date.unwrap_or(request.creation_date);
    let is_video = asset.is_video || request.is_video;

    let original_name = if request.file_name.trim().is_empty() {
        asset.file_name.as_str()
    } else {
        request.file_name.as_str()
    };
    let (mut stem, mut extension) = split_file_name(&sanitize_file_name(original_name));
    if extension.is_empty() {
        extension = guess_extension(&asset.data, is_video);
    }
    if stem.is_empty() {
        stem = creation_date.format("%Y%m%d-%H%M%S").to_string();
    }

    let mut data = asset.data;
    if !profile.accepts(&extension) {
        if is_video || !profile.accepts("jpg") {
            return Err(UploadError::WrongDataFormat);
        }
        let decoded = image::load_from_memory(&data).map_err(|err| {
            log::warn!("[upload-prepare] cannot convert {original_name:?}: {err}");
            UploadError::WrongDataFormat
        })?;
        data = encode_jpeg(decoded, DEFAULT_JPEG_QUALITY)?;
        extension = "jpg".to_string();
        log::info!("[upload-prepare] converted {original_name:?} to JPEG");
    } else if !is_video && wants_reencoding(request) {
        data = reencode(&data, request, &extension)?;
    }

    let staged = ctx.store.uploads_dir().join(request.staged_file_name());
    if let Some(dir) = staged.parent() {
        fs::create_dir_all(dir)?;
    }
    fs::write(&staged, &data)?;

    // 放到最后再取，失败的尝试不会在编号中留下空洞。
    let counter = if request.options.rename.append_counter {
        Some(
            ctx.images
                .albums()
                .next_counter(&ctx.account(), request.category)
                .map_err(|err| UploadError::Storage(err.to_string()))?,
        )
    } else {
        None
    };
    let file_name = apply_rename_rules(&stem, &extension, &request.options.rename, counter);
    log::debug!("[upload-prepare] staged {} bytes of {file_name:?} in {staged:?}", data.len());

    Ok(PreparedFile {
        mime_type: mime_type_for(&extension).to_string(),
        md5_sum: md5_hex(&data),
        file_name,
        is_video,
        creation_date,
        byte_count: data.len() as u64,
    })
}

/// 预处理失败时记录的状态。
pub(crate) fn preparation_failure_state(err: &UploadError) -> UploadState {
    match err {
        UploadError::MissingAsset
        | UploadError::Media(MediaError::AssetNotFound(_))
        | UploadError::Media(MediaError::AccessDenied) => UploadState::PreparingFail,
        UploadError::WrongDataFormat => UploadState::FormatError,
        _ => UploadState::PreparingError,
    }
}

fn load_source(ctx: &UploadContext, request: &UploadRequest) -> Result<MediaAsset, UploadError> {
    if !request.is_from_intent_or_clipboard() {
        return ctx
            .media
            .fetch_asset(&request.local_identifier)
            .map_err(|err| match err {
                MediaError::AssetNotFound(_) => UploadError::MissingAsset,
                other => UploadError::Media(other),
            });
    }
    let path = ctx.store.uploads_dir().join(&request.local_identifier);
    let data = fs::read(&path).map_err(|err| match err.kind() {
        ErrorKind::NotFound => UploadError::MissingAsset,
        _ => UploadError::Io(err),
    })?;
    let (is_video, file_name) = intent_file_name(&request.local_identifier);
    Ok(MediaAsset {
        local_identifier: request.local_identifier.clone(),
        file_name,
        creation_date: None,
        is_video,
        data,
    })
}

/// 分享的文件命名为 `<prefix>-img-<name>` 或 `<prefix>-mov-<name>`。
fn intent_file_name(local_identifier: &str) -> (bool, String) {
    if let Some((_, name)) = local_identifier.split_once(MOVIE_SUFFIX) {
        return (true, name.to_string());
    }
    let name = local_identifier
        .split_once(IMAGE_SUFFIX)
        .map(|(_, name)| name.to_string())
        .unwrap_or_default();
    (false, name)
}

/// 只保留 utf8mb3 列能存下的字符，并去掉 Piwigo 文件名不接受的字符。
pub(crate) fn sanitize_file_name(name: &str) -> String {
    name.chars()
        .filter(|c| c.len_utf8() <= 3 && !matches!(c, ':' | '/' | '\\') && !c.is_control())
        .collect::<String>()
        .trim()
        .to_string()
}

fn split_file_name(name: &str) -> (String, String) {
    match name.rsplit_once('.') {
        Some((stem, extension)) if !extension.is_empty() && !extension.contains(' ') => {
            (stem.trim().to_string(), extension.to_string())
        }
        _ => (name.to_string(), String::new()),
    }
}

fn guess_extension(data: &[u8], is_video: bool) -> String {
    if is_video {
        return "mp4".to_string();
    }
    match image::guess_format(data) {
        Ok(ImageFormat::Png) => "png".to_string(),
        _ => "jpg".to_string(),
    }
}

pub(crate) fn apply_rename_rules(
    stem: &str,
    extension: &str,
    rules: &FileNameRules,
    counter: Option<i64>,
) -> String {
    let mut stem = stem.to_string();
    for (from, to) in &rules.replacements {
        if !from.is_empty() {
            stem = stem.replace(from.as_str(), to);
        }
    }
    let mut name = format!("{}{stem}{}", rules.prefix, rules.suffix);
    if let Some(counter) = counter {
        name.push_str(&format!("-{counter:04}"));
    }
    let extension = match rules.extension_case {
        ExtensionCase::Keep => extension.to_string(),
        ExtensionCase::Lowercase => extension.to_lowercase(),
        ExtensionCase::Uppercase => extension.to_uppercase(),
    };
    format!("{}.{extension}", sanitize_file_name(&name))
}

fn wants_reencoding(request: &UploadRequest) -> bool {
    let options = &request.options;
    options.strip_gps || options.compress_image || (options.resize_image && options.photo_max_size > 0)
}

/// 重新编码会丢弃所有元数据块，包括 GPS。
/// 无法重新编码的文件绝不会以原始形式上传。
fn reencode(data: &[u8], request: &UploadRequest, extension: &str) -> Result<Vec<u8>, UploadError> {
    let format = match ImageFormat::from_extension(extension) {
        Some(format @ (ImageFormat::Jpeg | ImageFormat::Png)) => format,
        _ => {
            log::warn!("[upload-prepare] cannot modify .{extension} files of {:?}", request.local_identifier);
            return Err(UploadError::WrongDataFormat);
        }
    };
    let mut decoded = image::load_from_memory_with_format(data, format).map_err(|err| {
        log::warn!("[upload-prepare] cannot decode {:?}: {err}", request.local_identifier);
        UploadError::WrongDataFormat
    })?;
    let options = &request.options;
    let max_size = options.photo_max_size;
    if options.resize_image && max_size > 0 && decoded.width().max(decoded.height()) > max_size {
        decoded = decoded.resize(max_size, max_size, FilterType::Lanczos3);
    }
    let encoded = match format {
        ImageFormat::Jpeg => {
            let quality = if options.compress_image {
                options.photo_quality.clamp(1, 100)
            } else {
                DEFAULT_JPEG_QUALITY
            };
            encode_jpeg(decoded, quality)
        }
        _ => encode_png(&decoded),
    };
    encoded.map_err(|err| {
        log::warn!("[upload-prepare] re-encoding {:?} failed: {err}", request.local_identifier);
        UploadError::WrongDataFormat
    })
}

fn encode_jpeg(image: DynamicImage, quality: u8) -> Result<Vec<u8>, UploadError> {
    let mut buffer = Vec::new();
    DynamicImage::ImageRgb8(image.to_rgb8())
        .write_with_encoder(JpegEncoder::new_with_quality(&mut buffer, quality))
        .map_err(|err| UploadError::Storage(format!("JPEG encoding failed: {err}")))?;
    Ok(buffer)
}

fn encode_png(image: &DynamicImage) -> Result<Vec<u8>, UploadError> {
    let mut buffer = Cursor::new(Vec::new());
    image
        .write_to(&mut buffer, ImageFormat::Png)
        .map_err(|err| UploadError::Storage(format!("PNG encoding failed: {err}")))?;
    Ok(buffer.into_inner())
}

pub(crate) fn md5_hex(data: &[u8]) -> String {
    format!("{:x}", Md5::digest(data))
}

pub(crate) fn mime_type_for(extension: &str) -> &'static str {
    match extension.to_ascii_lowercase().as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "heic" => "image/heic",
        "heif" => "image/heif",
        "tif" | "tiff" => "image/tiff",
        "bmp" => "image/bmp",
        "mp4" => "video/mp4",
        "m4v" => "video/x-m4v",
        "mov" => "video/quicktime",
        "avi" => "video/x-msvideo",
        "webm" => "video/webm",
        "mpg" | "mpeg" => "video/mpeg",
        "mkv" => "video/x-matroska",
        "pdf" => "application/pdf",
        _ => "application/octet-stream",
    }
}
