//! 暂存文件的分片传输。

use super::context::UploadContext;
use super::counter::UploadCounters;
use super::models::UploadRequest;
use super::state::UploadState;
use crate::api::{ChunkUpload, IdRef, ImageData, UploadedImage};
use crate::cache::dates::format_server_date;
use crate::error::{PwgError, UploadError};
use chrono::Utc;
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// 分片发送 `request` 的暂存文件。返回服务器确认的字节数与结果。
pub(crate) fn transfer_upload(ctx: &UploadContext, request: &UploadRequest) -> (u64, Result<UploadedImage, UploadError>) {
    let staged = ctx.store.uploads_dir().join(request.staged_file_name());
    let data = match fs::read(&staged) {
        Ok(data) => data,
        Err(err) if err.kind() == ErrorKind::NotFound => return (0, Err(UploadError::MissingAsset)),
        Err(err) => return (0, Err(UploadError::Io(err))),
    };
    if request.md5_sum.is_empty() {
        return (0, Err(UploadError::MissingData));
    }

    let profile = ctx.profile();
    let chunk_size = ctx.limits().chunk_size_bytes().max(1);
    let chunks = data.len().div_ceil(chunk_size).max(1);
    let counters = &ctx.counters;
    counters.set_total_bytes(&request.local_identifier, data.len() as u64);
    log::info!(
        "[upload-transfer] sending {:?} ({} bytes, {chunks} chunks) to album {}",
        request.file_name,
        data.len(),
        request.category
    );

    let mut sent = 0u64;
    let mut uploaded = None;
    let mut parts: Vec<&[u8]> = data.chunks(chunk_size).collect();
    if parts.is_empty() {
        parts.push(&[]);
    }
    for (index, part) in parts.into_iter().enumerate() {
        let chunk = ChunkUpload {
            upload_id: request.upload_header(),
            local_identifier: request.local_identifier.clone(),
            file_name: request.file_name.clone(),
            mime_type: request.mime_type.clone(),
            md5_sum: request.md5_sum.clone(),
            category: request.category,
            privacy_level: request.privacy_level,
            title: request.image_title.clone(),
            author: request.author.clone(),
            comment: request.comment.clone(),
            date_creation: format_server_date(request.creation_date),
            tag_ids: request.tag_id_list(),
            chunk: index,
            chunks,
            data: part.to_vec(),
            use_async: profile.uses_upload_async,
        };
        let reported = Arc::new(AtomicU64::new(0));
        let progress = progress_reporter(counters.clone(), &request.local_identifier, Arc::clone(&reported));
        match ctx.api.upload_chunk(chunk, Some(progress)) {
            Ok(answer) => {
                let remaining = (part.len() as u64).saturating_sub(reported.load(Ordering::Relaxed));
                counters.add_bytes(&request.local_identifier, remaining);
                sent += part.len() as u64;
                uploaded = answer.or(uploaded);
            }
            Err(err) => {
                log::warn!("[upload-transfer] chunk {index}/{chunks} of request {} failed: {err}", request.id);
                return (sent, Err(UploadError::Pwg(err)));
            }
        }
    }
    match uploaded {
        Some(image) => (sent, Ok(image)),
        None => (
            sent,
            Err(UploadError::Pwg(PwgError::WrongJson("no image returned after the last chunk".to_string()))),
        ),
    }
}

fn progress_reporter(
    counters: UploadCounters,
    identifier: &str,
    reported: Arc<AtomicU64>,
) -> Box<dyn FnMut(u64) + Send> {
    let identifier = identifier.to_string();
    Box::new(move |chunk_bytes| {
        let previous = reported.swap(chunk_bytes, Ordering::Relaxed);
        counters.add_bytes(&identifier, chunk_bytes.saturating_sub(previous));
    })
}

/// 传输失败时记录的状态。
pub(crate) fn transfer_failure_state(err: &UploadError) -> UploadState {
    match err {
        UploadError::MissingAsset => UploadState::PreparingFail,
        UploadError::MissingData | UploadError::WrongDataFormat => UploadState::UploadingFail,
        UploadError::Pwg(err) if err.is_transient() => UploadState::UploadingError,
        UploadError::Pwg(
            PwgError::InvalidParameter
            | PwgError::MissingParameter
            | PwgError::InvalidMethod
            | PwgError::InvalidCredentials
            | PwgError::IncompatibleVersion,
        ) => UploadState::UploadingFail,
        UploadError::Pwg(PwgError::Http(status)) if (400..500).contains(status) => UploadState::UploadingFail,
        UploadError::Pwg(PwgError::Server { code, .. }) if (400..500).contains(code) => UploadState::UploadingFail,
        _ => UploadState::UploadingError,
    }
}

/// 服务器未返回图片描述时，由请求拼出的描述。
pub(crate) fn image_from_request(request: &UploadRequest, uploaded: &UploadedImage) -> ImageData {
    let mut derivatives = BTreeMap::new();
    for (key, url) in [("square", &uploaded.square_url), ("thumb", &uploaded.thumb_url)] {
        if let Some(url) = url {
            derivatives.insert(
                key.to_string(),
                crate::api::Derivative {
                    url: Some(url.clone()),
                    ..Default::default()
                },
            );
        }
    }
    ImageData {
        id: uploaded.image_id,
        title: Some(request.image_title.clone()),
        comment: Some(request.comment.clone()),
        file_name: Some(request.file_name.clone()),
        date_created: Some(format_server_date(request.creation_date)),
        date_posted: Some(format_server_date(Utc::now())),
        derivatives,
        author: Some(request.author.clone()),
        privacy_level: request.privacy_level,
        tags: request.tag_id_list().into_iter().map(|id| IdRef { id }).collect(),
        md5_sum: Some(request.md5_sum.clone()),
        categories: vec![IdRef { id: request.category }],
        ..ImageData::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings;
    use crate::upload_manager::test_support::Harness;

    #[test]
    fn files_are_sent_in_chunks_with_progress() {
        let harness = Harness::new();
        settings::set_chunk_size_kb(&harness.ctx.db, 100).expect("chunk size");
        let mut request = harness.enqueue("asset-1", 5);
        request.file_name = "photo.jpg".to_string();
        request.md5_sum = "abc".to_string();
        harness.stage(&request, vec![7u8; 250 * 1024]);

        let (sent, result) = transfer_upload(&harness.ctx, &request);
        let uploaded = result.expect("transfer");
        assert_eq!(sent, 250 * 1024);
        assert!(uploaded.image_id > 0);
        let chunks = harness.api.chunks();
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|chunk| chunk.upload_id == request.upload_header() && chunk.chunks == 3));
        assert_eq!(harness.ctx.counters.progress("asset-1"), 1.0);
    }

    #[test]
    fn missing_checksum_or_file_fails_permanently() {
        let harness = Harness::new();
        let request = harness.enqueue("asset-1", 5);
        let (_, result) = transfer_upload(&harness.ctx, &request);
        assert_eq!(transfer_failure_state(&result.expect_err("no file")), UploadState::PreparingFail);

        harness.stage(&request, vec![1, 2, 3]);
        let (_, result) = transfer_upload(&harness.ctx, &request);
        assert_eq!(transfer_failure_state(&result.expect_err("no md5")), UploadState::UploadingFail);
        assert!(harness.api.chunks().is_empty());
    }

    #[test]
    fn failures_are_classified() {
        let transient = UploadError::Pwg(PwgError::NetworkUnavailable);
        let rejected = UploadError::Pwg(PwgError::Http(403));
        let server = UploadError::Pwg(PwgError::Http(502));
        assert_eq!(transfer_failure_state(&transient), UploadState::UploadingError);
        assert_eq!(transfer_failure_state(&rejected), UploadState::UploadingFail);
        assert_eq!(transfer_failure_state(&server), UploadState::UploadingError);
        assert_eq!(
            transfer_failure_state(&UploadError::Pwg(PwgError::InvalidParameter)),
            UploadState::UploadingFail
        );
    }
}
