use super::context::UploadContext;
use super::models::UploadRequest;
use super::state::UploadState;
use crate::api::ImageInfoUpdate;
use crate::cache::dates::format_server_date;
use crate::error::PwgError;

/// 发布一张已传输完成的图片。
///
/// 带 lounge 的服务器只需清空 lounge，清空失败也可容忍，服务器最终会自行清空；
/// 较旧的服务器通过 `pwg.images.setInfo` 写入元数据。
pub(crate) fn finish_upload(ctx: &UploadContext, request: &UploadRequest) -> Result<(), PwgError> {
    let profile = ctx.profile();
    if profile.version.uses_lounge() {
        if let Err(err) = ctx.api.empty_lounge(&[request.image_id], request.category) {
            log::warn!("[upload-finish] lounge flush for image {} failed: {err}", request.image_id);
        }
        return Ok(());
    }
    ctx.api.set_image_info(&ImageInfoUpdate {
        image_id: request.image_id,
        file_name: request.file_name.clone(),
        title: request.image_title.clone(),
        author: request.author.clone(),
        date_creation: format_server_date(request.creation_date),
        privacy_level: request.privacy_level,
        comment: request.comment.clone(),
        tag_ids: request.tag_id_list(),
    })
}

pub(crate) fn finishing_failure_state(err: &PwgError) -> UploadState {
    if err.is_transient() {
        UploadState::FinishingError
    } else {
        UploadState::FinishingFail
    }
}

/// 将同一相册的上传提交给审核员；返回服务器确认的图片 id。
pub(crate) fn moderate_uploads(ctx: &UploadContext, category: i64, requests: &[UploadRequest]) -> Result<Vec<i64>, PwgError> {
    let image_ids: Vec<i64> = requests.iter().map(|request| request.image_id).collect();
    log::info!("[upload-finish] submitting {} images of album {category} for moderation", image_ids.len());
    ctx.api.moderate_images(&image_ids, category)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ServerVersion;
    use crate::upload_manager::test_support::{Harness, LoungeCall};

    #[test]
    fn recent_servers_flush_the_lounge() {
        let harness = Harness::new();
        let mut request = harness.enqueue("asset-1", 5);
        request.image_id = 77;
        finish_upload(&harness.ctx, &request).expect("finish");
        assert_eq!(harness.api.lounge_calls(), vec![LoungeCall { image_ids: vec![77], category: 5 }]);
        assert!(harness.api.info_updates().is_empty());
    }

    #[test]
    fn lounge_errors_are_tolerated() {
        let harness = Harness::new();
        harness.api.fail_lounge(PwgError::Http(500));
        let request = harness.enqueue("asset-1", 5);
        assert!(finish_upload(&harness.ctx, &request).is_ok());
    }

    #[test]
    fn older_servers_receive_metadata() {
        let harness = Harness::with_version(ServerVersion::new(11, 5, 0));
        let mut request = harness.enqueue("asset-1", 5);
        request.image_id = 12;
        request.image_title = "Sunset".to_string();
        request.tag_ids = "4,9".to_string();
        finish_upload(&harness.ctx, &request).expect("finish");
        let updates = harness.api.info_updates();
        assert_eq!(updates.len(), 1);
        assert_eq!((updates[0].image_id, updates[0].title.as_str()), (12, "Sunset"));
        assert_eq!(updates[0].tag_ids, vec![4, 9]);

        harness.api.fail_set_info(PwgError::InvalidParameter);
        let err = finish_upload(&harness.ctx, &request).expect_err("rejected");
        assert_eq!(finishing_failure_state(&err), UploadState::FinishingFail);
        assert_eq!(finishing_failure_state(&PwgError::Timeout), UploadState::FinishingError);
    }
}
