use super::models::{UploadId, UploadProperties};
use super::scheduler::UploadEngine;
use super::state::UploadState;
use super::storage::UploadFilter;
use crate::error::{MediaError, UploadError};
use crate::settings::{self, MAX_AUTO_UPLOADS_PER_CHECK};
use std::collections::HashSet;

impl UploadEngine {
    /// 把监听集合中从未处理过的资源加入队列。
    pub(crate) fn append_auto_uploads(&mut self) {
        match self.collect_auto_uploads() {
            Ok(0) => {}
            Ok(count) => {
                log::info!("[upload-manager] appended {count} auto-upload requests");
                if self.state.background.is_none() {
                    self.state.is_paused = false;
                    self.find_next_image_to_upload();
                }
            }
            Err(err) => log::error!("[upload-manager] cannot append auto-upload requests: {err}"),
        }
    }

    fn collect_auto_uploads(&mut self) -> Result<usize, UploadError> {
        let config = settings::get_auto_upload_config(&self.ctx.db)?;
        if config.album_id.is_empty() {
            log::warn!("[upload-manager] no auto-upload source collection");
            self.forget_auto_upload_source();
            return Ok(0);
        }
        let Some(category) = config.category_id else {
            log::warn!("[upload-manager] no auto-upload destination album");
            self.disable_auto_upload();
            return Ok(0);
        };

        let profile = self.ctx.profile();
        let candidates = match self
            .ctx
            .media
            .auto_upload_candidates(&config.album_id, profile.accepts("mp4"))
        {
            Ok(candidates) => candidates,
            Err(MediaError::AccessDenied | MediaError::CollectionUnavailable(_)) => {
                log::warn!("[upload-manager] auto-upload collection {} unavailable", config.album_id);
                self.forget_auto_upload_source();
                return Ok(0);
            }
            Err(err) => return Err(err.into()),
        };

        // 服务器上已删除图片留下的墓碑也算已知。
        let known: HashSet<String> = self
            .ctx
            .store
            .fetch(&UploadFilter::all())?
            .into_iter()
            .map(|request| request.local_identifier)
            .collect();
        let server_file_types = profile.file_types_joined();
        let requests: Vec<UploadProperties> = candidates
            .into_iter()
            .filter(|identifier| !known.contains(identifier))
            .take(MAX_AUTO_UPLOADS_PER_CHECK)
            .map(|identifier| {
                let mut props = UploadProperties::new(identifier, category);
                props.server_file_types = server_file_types.clone();
                props.tag_ids = config.tag_ids.clone();
                props.comment = config.comments.clone();
                props.marked_for_auto_upload = true;
                props
            })
            .collect();
        if requests.is_empty() {
            return Ok(0);
        }
        self.ctx.store.import_requests(&requests)
    }

    fn forget_auto_upload_source(&mut self) {
        if let Err(err) = settings::reset_auto_upload_album(&self.ctx.db) {
            log::error!("[upload-manager] cannot reset auto-upload source: {err}");
        }
        self.disable_auto_upload();
    }

    /// 关闭自动上传，并删除未在运行的自动上传请求。
    pub(crate) fn disable_auto_upload(&mut self) {
        match settings::is_auto_upload_active(&self.ctx.db) {
            Ok(false) => return,
            Ok(true) => {}
            Err(err) => log::warn!("[upload-manager] cannot read auto-upload state: {err}"),
        }
        if let Err(err) = settings::set_auto_upload_active(&self.ctx.db, false) {
            log::error!("[upload-manager] cannot disable auto-upload: {err}");
        }

        let removable: Vec<UploadState> = UploadState::ALL
            .into_iter()
            .filter(|state| state.is_pending() && *state != UploadState::Deleted)
            .collect();
        let running = self.running_ids();
        let result = self
            .ctx
            .store
            .fetch(&UploadFilter::in_states(&removable).auto_upload(true))
            .and_then(|requests| {
                let ids: Vec<UploadId> = requests
                    .iter()
                    .map(|request| request.id)
                    .filter(|id| !running.contains(id))
                    .collect();
                self.ctx.store.delete(&ids)
            });
        match result {
            Ok(count) => log::info!("[upload-manager] auto-upload disabled, {count} requests dropped"),
            Err(err) => log::error!("[upload-manager] cannot drop auto-upload requests: {err}"),
        }
        if self.state.background.is_none() {
            self.find_next_image_to_upload();
        }
    }

    fn running_ids(&self) -> HashSet<UploadId> {
        let mut running: HashSet<UploadId> = self.state.uploading.iter().copied().collect();
        running.extend(self.state.preparing);
        running.extend(self.state.finishing);
        running
    }
}
