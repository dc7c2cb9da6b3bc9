//! 启动、切换账号或回到前台后的恢复流程。

use super::models::{parse_upload_header, UploadId, UploadRequest};
use super::scheduler::UploadEngine;
use super::state::{recovery_reset, UploadState};
use super::storage::UploadFilter;
use crate::db::current_timestamp_millis;
use crate::error::UploadError;
use crate::settings;
use std::collections::HashSet;

/// 两次提议删除已上传资源之间的最短间隔。
const DELETION_PROPOSAL_INTERVAL_MILLIS: i64 = 24 * 60 * 60 * 1000;

impl UploadEngine {
    pub(crate) fn resume_all(&mut self) {
        self.state.reset();
        self.ctx.store.set_scope(self.ctx.account());
        log::info!("[upload-manager] resuming uploads of {}", self.ctx.account().username);

        if let Err(err) = self.restore_requests() {
            log::error!("[upload-manager] resume failed: {err}");
        }

        self.find_next_image_to_upload();
        if settings::is_auto_upload_active(&self.ctx.db).unwrap_or(false) {
            self.append_auto_uploads();
        } else {
            self.disable_auto_upload();
        }
    }

    fn restore_requests(&mut self) -> Result<(), UploadError> {
        let store = self.ctx.store.clone();
        let running: HashSet<UploadId> = self
            .ctx
            .sessions
            .running_upload_ids()
            .iter()
            .filter_map(|header| parse_upload_header(header))
            .collect();

        let mut interrupted = UploadState::RESUMABLE.to_vec();
        interrupted.extend([UploadState::Preparing, UploadState::Uploading, UploadState::Finishing]);
        for request in store.fetch(&UploadFilter::in_states(&interrupted))? {
            if self.state.reclaim_worker(request.id, request.state) {
                log::debug!("[upload-manager] request {} still {:?} in this process", request.id, request.state);
                continue;
            }
            if request.state == UploadState::Uploading && running.contains(&request.id) {
                self.state.uploading.insert(request.id);
                continue;
            }
            let state = recovery_reset(request.state);
            log::debug!("[upload-manager] request {} {:?} -> {state:?}", request.id, request.state);
            store.update_state(request.id, state, None)?;
        }

        if self.deletion_proposal_due() {
            self.start_asset_deletion()?;
        }
        self.purge_unavailable_assets()?;

        let deleted: Vec<UploadId> = store
            .fetch(&UploadFilter::in_states(&[UploadState::Deleted]).auto_upload(false))?
            .iter()
            .map(|request| request.id)
            .collect();
        if !deleted.is_empty() {
            store.delete(&deleted)?;
        }
        Ok(())
    }

    /// 每天最多返回一次 true。
    fn deletion_proposal_due(&self) -> bool {
        let now = current_timestamp_millis();
        let last = settings::get_last_deletion_proposal(&self.ctx.db).unwrap_or_else(|err| {
            log::warn!("[upload-manager] {err}");
            None
        });
        if matches!(last, Some(last) if now - last < DELETION_PROPOSAL_INTERVAL_MILLIS) {
            return false;
        }
        if let Err(err) = settings::set_last_deletion_proposal(&self.ctx.db, now) {
            log::warn!("[upload-manager] cannot record deletion proposal: {err}");
        }
        true
    }

    /// 删除资源已消失的请求。分享文件在上传目录中查找，
    /// 未完成的分享文件给予到达的时间。
    fn purge_unavailable_assets(&self) -> Result<(), UploadError> {
        let requests: Vec<UploadRequest> = self
            .ctx
            .store
            .fetch(&UploadFilter::all())?
            .into_iter()
            .filter(|request| request.state != UploadState::Deleted)
            .filter(|request| !(request.is_from_intent_or_clipboard() && request.state.is_pending()))
            .collect();
        if requests.is_empty() {
            return Ok(());
        }
        let identifiers: Vec<String> = requests
            .iter()
            .filter(|request| !request.is_from_intent_or_clipboard())
            .map(|request| request.local_identifier.clone())
            .collect();
        let available = self.ctx.media.available_assets(&identifiers);
        let uploads_dir = self.ctx.store.uploads_dir();
        let gone: Vec<UploadId> = requests
            .iter()
            .filter(|request| {
                if request.is_from_intent_or_clipboard() {
                    !uploads_dir.join(&request.local_identifier).exists()
                } else {
                    !available.contains(&request.local_identifier)
                }
            })
            .map(|request| request.id)
            .collect();
        if gone.is_empty() {
            return Ok(());
        }
        log::info!("[upload-manager] removing {} requests of unavailable assets", gone.len());
        self.ctx.store.delete(&gone)?;
        Ok(())
    }

    pub(crate) fn delete_impossible_uploads(&mut self) {
        let result = self
            .ctx
            .store
            .fetch(&UploadFilter::in_states(&UploadState::IMPOSSIBLE))
            .and_then(|requests| {
                let ids: Vec<UploadId> = requests.iter().map(|request| request.id).collect();
                self.ctx.store.delete(&ids)
            });
        match result {
            Ok(count) => log::info!("[upload-manager] dismissed {count} failed uploads"),
            Err(err) => log::error!("[upload-manager] cannot dismiss failed uploads: {err}"),
        }
        self.find_next_image_to_upload();
    }

    /// 服务器上已删除的图片：手动请求直接删除，自动上传请求保留为墓碑，
    /// 避免同一资源被再次上传。
    pub(crate) fn delete_uploads_of_deleted_images(&mut self, image_ids: &[i64]) {
        if image_ids.is_empty() {
            return;
        }
        let store = self.ctx.store.clone();
        let result = store
            .fetch(&UploadFilter {
                image_ids: Some(image_ids.to_vec()),
                ..UploadFilter::all()
            })
            .and_then(|requests| {
                let (auto, manual): (Vec<_>, Vec<_>) =
                    requests.into_iter().partition(|request| request.marked_for_auto_upload);
                let manual: Vec<UploadId> = manual.iter().map(|request| request.id).collect();
                store.delete(&manual)?;
                let auto: Vec<i64> = auto.iter().map(|request| request.image_id).collect();
                store.mark_deleted(&auto)?;
                Ok(())
            });
        if let Err(err) = result {
            log::error!("[upload-manager] cannot forget uploads of deleted images: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upload_manager::models::{upload_header_value, UploadProperties, INTENT_PREFIX};
    use crate::upload_manager::prepare::md5_hex;
    use crate::upload_manager::scheduler::Event;
    use crate::upload_manager::test_support::Harness;

    /// 恢复之后不让调度器启动新的工作。
    fn hold_scheduler(harness: &Harness) {
        harness.device.set_low_power(true);
    }

    fn skip_deletion_proposal(harness: &Harness) {
        settings::set_last_deletion_proposal(&harness.ctx.db, current_timestamp_millis()).expect("proposal");
    }

    #[test]
    fn interrupted_transfers_resume_from_prepared() {
        let harness = Harness::new();
        skip_deletion_proposal(&harness);
        harness.media.add("a", "a.jpg", b"a".to_vec());
        harness.media.add("b", "b.jpg", b"b".to_vec());
        let interrupted = harness.enqueue_in_state("a", 5, UploadState::Uploading);
        let finishing = harness.enqueue_uploaded("b", 5, 9, UploadState::FinishingError);

        let mut engine = harness.engine();
        hold_scheduler(&harness);
        engine.handle(Event::Pause);
        engine.handle(Event::ResumeAll);

        assert_eq!(harness.state_of(interrupted.id), UploadState::Prepared);
        assert_eq!(harness.state_of(finishing.id), UploadState::Uploaded);
        assert!(!engine.state.is_paused);
    }

    #[test]
    fn running_transfers_are_left_alone() {
        let harness = Harness::new();
        skip_deletion_proposal(&harness);
        harness.media.add("a", "a.jpg", b"a".to_vec());
        let running = harness.enqueue_in_state("a", 5, UploadState::Uploading);
        harness.sessions.set_running(vec![upload_header_value(running.id)]);

        let mut engine = harness.engine();
        hold_scheduler(&harness);
        engine.handle(Event::ResumeAll);

        assert_eq!(harness.state_of(running.id), UploadState::Uploading);
        assert!(engine.state.uploading.contains(&running.id));
    }

    #[test]
    fn transfers_running_in_this_process_are_not_restarted() {
        let harness = Harness::new();
        skip_deletion_proposal(&harness);
        harness.media.add("a", "a.jpg", b"a".to_vec());
        let mut request = harness.enqueue_in_state("a", 5, UploadState::Prepared);
        request.file_name = "a.jpg".to_string();
        request.md5_sum = md5_hex(b"a");
        harness.ctx.store.save(&request);
        harness.stage(&request, b"a".to_vec());

        let mut engine = harness.engine();
        engine.handle(Event::FindNext);
        assert_eq!(harness.state_of(request.id), UploadState::Uploading);
        engine.handle(Event::ResumeAll);
        assert_eq!(harness.state_of(request.id), UploadState::Uploading);
        assert!(engine.state.uploading.contains(&request.id));

        // 两个 worker 都会在任何完成事件到达引擎之前运行完。
        while harness.spawner.run_next() {}
        harness.drive(&mut engine);

        assert_eq!(harness.api.chunks().len(), 1);
        assert_eq!(harness.state_of(request.id), UploadState::Finished);
        assert!(engine.state.workers.is_empty());
    }

    #[test]
    fn vanished_assets_are_purged() {
        let harness = Harness::new();
        skip_deletion_proposal(&harness);
        harness.media.add("kept", "kept.jpg", b"k".to_vec());
        let kept = harness.enqueue("kept", 5);
        let gone = harness.enqueue("gone", 5);
        let shared = harness.enqueue(&format!("{INTENT_PREFIX}1-img-photo.jpg"), 5);
        let shared_done = harness.enqueue_uploaded(&format!("{INTENT_PREFIX}2-img-done.jpg"), 5, 3, UploadState::Finished);

        let mut engine = harness.engine();
        hold_scheduler(&harness);
        engine.handle(Event::ResumeAll);

        let store = &harness.ctx.store;
        assert!(store.load(kept.id).expect("load").is_some());
        assert!(store.load(gone.id).expect("load").is_none());
        assert!(store.load(shared.id).expect("load").is_some());
        assert!(store.load(shared_done.id).expect("load").is_none());
    }

    #[test]
    fn deleted_manual_requests_are_removed_but_auto_ones_stay() {
        let harness = Harness::new();
        skip_deletion_proposal(&harness);
        harness.media.add("manual", "m.jpg", b"m".to_vec());
        harness.media.add("auto", "a.jpg", b"a".to_vec());
        let manual = harness.enqueue_in_state("manual", 5, UploadState::Deleted);
        let mut props = UploadProperties::new("auto", 5);
        props.marked_for_auto_upload = true;
        props.state = UploadState::Deleted;
        let auto = harness.enqueue_with(props);

        let mut engine = harness.engine();
        hold_scheduler(&harness);
        engine.handle(Event::ResumeAll);

        assert!(harness.ctx.store.load(manual.id).expect("load").is_none());
        assert_eq!(harness.state_of(auto.id), UploadState::Deleted);
    }

    #[test]
    fn deletion_is_proposed_once_a_day() {
        let harness = Harness::new();
        harness.media.add("a", "a.jpg", b"a".to_vec());
        let request = harness.enqueue_uploaded("a", 5, 21, UploadState::Finished);
        harness.ctx.store.set_delete_after_upload(&[request.id], true).expect("flag");
        harness.media.decline_deletions();

        let mut engine = harness.engine();
        hold_scheduler(&harness);
        engine.handle(Event::ResumeAll);
        assert!(engine.state.deleting.contains(&request.id));
        harness.drive(&mut engine);
        assert!(!harness.load(request.id).delete_image_after_upload);

        harness.ctx.store.set_delete_after_upload(&[request.id], true).expect("flag");
        engine.handle(Event::ResumeAll);
        assert!(engine.state.deleting.is_empty());
    }

    #[test]
    fn impossible_uploads_are_dismissed() {
        let harness = Harness::new();
        let failed = harness.enqueue_in_state("a", 5, UploadState::FormatError);
        let resumable = harness.enqueue_in_state("b", 5, UploadState::UploadingError);
        let mut engine = harness.engine();
        engine.handle(Event::Pause);
        engine.handle(Event::DeleteImpossible);
        assert!(harness.ctx.store.load(failed.id).expect("load").is_none());
        assert_eq!(harness.state_of(resumable.id), UploadState::UploadingError);
    }

    #[test]
    fn server_deletions_reach_the_queue() {
        let harness = Harness::new();
        let manual = harness.enqueue_uploaded("manual", 5, 31, UploadState::Finished);
        let mut props = UploadProperties::new("auto", 5);
        props.marked_for_auto_upload = true;
        let mut auto = harness.enqueue_with(props);
        auto.image_id = 32;
        auto.state = UploadState::Finished;
        harness.ctx.store.save(&auto);

        let mut engine = harness.engine();
        engine.handle(Event::DeleteUploadsOfDeletedImages(vec![31, 32]));
        assert!(harness.ctx.store.load(manual.id).expect("load").is_none());
        assert_eq!(harness.state_of(auto.id), UploadState::Deleted);
    }
}
