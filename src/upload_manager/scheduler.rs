//! 上传队列的单线程决策循环。
//!
//! 引擎持有所有内存标记。worker 在 spawner 上运行，只通过事件通道回报结果，
//! 因此决策不会产生竞争。

use super::background::BackgroundSession;
use super::context::UploadContext;
use super::finisher::{finish_upload, finishing_failure_state, moderate_uploads};
use super::models::{UploadId, UploadRequest};
use super::prepare::{preparation_failure_state, prepare_upload, PreparedFile};
use super::state::UploadState;
use super::storage::UploadFilter;
use super::transfer::{image_from_request, transfer_failure_state, transfer_upload};
use crate::api::UploadedImage;
use crate::error::{MediaError, PwgError, UploadError};
use crate::settings;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::sync::mpsc::{Receiver, Sender};

const INTERRUPTED_MESSAGE: &str = "Upload interrupted";

#[derive(Debug)]
pub(crate) enum Event {
    FindNext,
    Pause,
    Resume,
    AppStateChanged { in_background: bool },
    ResumeAll,
    Prepared { id: UploadId, result: Result<PreparedFile, UploadError> },
    Transferred { id: UploadId, bytes_sent: u64, result: Result<UploadedImage, UploadError> },
    Finished { id: UploadId, result: Result<(), PwgError> },
    Moderated { category: i64, ids: Vec<UploadId>, result: Result<Vec<i64>, PwgError> },
    AssetsDeleted { ids: Vec<UploadId>, result: Result<(), MediaError> },
    BeginBackground { auto_upload_only: bool },
    BackgroundStep,
    EndBackground,
    AppendAutoUploads,
    DisableAutoUpload,
    DeleteImpossible,
    DeleteUploadsOfDeletedImages(Vec<i64>),
    Shutdown,
}

/// 内存中的记账：判断哪些工作真正在运行的依据。
#[derive(Debug, Default)]
pub(crate) struct SchedulerState {
    pub is_paused: bool,
    pub app_in_background: bool,
    pub preparing: Option<UploadId>,
    pub finishing: Option<UploadId>,
    pub uploading: HashSet<UploadId>,
    pub deleting: HashSet<UploadId>,
    /// 审核请求仍在进行中的相册数。
    pub moderating: usize,
    /// 本次会话中已提交审核的请求。
    pub submitted_for_moderation: HashSet<UploadId>,
    pub background: Option<BackgroundSession>,
    /// 本引擎启动的 worker 及其所处阶段，只有对应的完成事件才会移除。
    pub workers: HashMap<UploadId, UploadState>,
}

impl SchedulerState {
    /// 清空所有瞬时标记并解除暂停。本进程中仍在运行的 worker 会保留，
    /// 以便重新认领。
    pub fn reset(&mut self) {
        let app_in_background = self.app_in_background;
        let workers = std::mem::take(&mut self.workers);
        *self = Self {
            app_in_background,
            workers,
            ..Self::default()
        };
    }

    /// 请求仍由本引擎的 worker 执行时，重新标记为运行中。
    pub fn reclaim_worker(&mut self, id: UploadId, state: UploadState) -> bool {
        if self.workers.get(&id) != Some(&state) {
            return false;
        }
        match state {
            UploadState::Preparing => self.preparing = Some(id),
            UploadState::Uploading => {
                self.uploading.insert(id);
            }
            UploadState::Finishing => self.finishing = Some(id),
            _ => return false,
        }
        true
    }
}

pub(crate) struct UploadEngine {
    pub(super) ctx: UploadContext,
    pub(super) events: Sender<Event>,
    pub(super) state: SchedulerState,
}

impl UploadEngine {
    pub(crate) fn new(ctx: UploadContext, events: Sender<Event>) -> Self {
        Self {
            ctx,
            events,
            state: SchedulerState::default(),
        }
    }

    pub(crate) fn run(mut self, inbox: Receiver<Event>) {
        log::info!("[upload-manager] scheduler started");
        while let Ok(event) = inbox.recv() {
            if !self.handle(event) {
                break;
            }
        }
        log::info!("[upload-manager] scheduler stopped");
    }

    /// 处理一个事件；引擎需要停止时返回 `false`。
    pub(crate) fn handle(&mut self, event: Event) -> bool {
        match event {
            Event::FindNext => self.find_next_image_to_upload(),
            Event::Pause => {
                log::info!("[upload-manager] paused");
                self.state.is_paused = true;
            }
            Event::Resume => {
                log::info!("[upload-manager] resumed");
                self.state.is_paused = false;
                self.find_next_image_to_upload();
            }
            Event::AppStateChanged { in_background } => {
                self.state.app_in_background = in_background;
                if !in_background {
                    self.find_next_image_to_upload();
                }
            }
            Event::ResumeAll => self.resume_all(),
            Event::Prepared { id, result } => self.did_prepare(id, result),
            Event::Transferred {
                id,
                bytes_sent,
                result,
            } => self.did_transfer(id, bytes_sent, result),
            Event::Finished { id, result } => self.did_finish(id, result),
            Event::Moderated {
                category,
                ids,
                result,
            } => self.did_moderate(category, &ids, result),
            Event::AssetsDeleted { ids, result } => self.did_delete_assets(&ids, result),
            Event::BeginBackground { auto_upload_only } => {
                self.initialise_background_task(auto_upload_only)
            }
            Event::BackgroundStep => self.background_step(),
            Event::EndBackground => self.end_background_task(),
            Event::AppendAutoUploads => self.append_auto_uploads(),
            Event::DisableAutoUpload => self.disable_auto_upload(),
            Event::DeleteImpossible => self.delete_impossible_uploads(),
            Event::DeleteUploadsOfDeletedImages(image_ids) => {
                self.delete_uploads_of_deleted_images(&image_ids)
            }
            Event::Shutdown => return false,
        }
        true
    }

    pub(super) fn notify(&self, event: Event) {
        if self.events.send(event).is_err() {
            log::debug!("[upload-manager] scheduler channel closed");
        }
    }

    /// 一次调度 tick：最多启动一个工作单元。
    pub(crate) fn find_next_image_to_upload(&mut self) {
        if let Some(reason) = self.pause_reason() {
            log::debug!("[upload-manager] not scheduling: {reason}");
            return;
        }
        if let Err(err) = self.schedule_next() {
            log::error!("[upload-manager] scheduling failed: {err}");
        }
    }

    fn pause_reason(&self) -> Option<&'static str> {
        if self.state.is_paused {
            Some("paused")
        } else if self.state.app_in_background {
            Some("app in background")
        } else if self.state.background.is_some() {
            Some("background task running")
        } else if self.ctx.device.is_low_power_mode() {
            Some("low power mode")
        } else if self.ctx.wifi_only() && !self.ctx.device.is_on_wifi() {
            Some("waiting for Wi-Fi")
        } else {
            None
        }
    }

    fn schedule_next(&mut self) -> Result<(), UploadError> {
        let store = self.ctx.store.clone();
        self.demote_stuck_requests()?;

        let limits = self.ctx.limits();
        let failed = store.fetch(&UploadFilter::in_states(&UploadState::FAILED))?.len();
        if failed >= limits.max_failed {
            log::warn!("[upload-manager] {failed} failed uploads; waiting for the user");
            return Ok(());
        }

        let manual_first = settings::is_auto_upload_active(&self.ctx.db).unwrap_or(false);
        let in_order = |states: &[UploadState]| {
            let filter = UploadFilter::in_states(states);
            if manual_first {
                filter.manual_first()
            } else {
                filter
            }
        };

        if self.state.finishing.is_none() {
            if let Some(request) = store.fetch(&in_order(&[UploadState::Uploaded]))?.into_iter().next() {
                self.start_finishing(request);
                return Ok(());
            }
        }

        let prepared = store.fetch(&in_order(&[UploadState::Prepared]))?;
        if self.state.uploading.len() < limits.max_transfers {
            if let Some(request) = prepared.first() {
                self.start_transfer(request.clone());
                return Ok(());
            }
        }

        if self.state.preparing.is_none() && prepared.len() < limits.max_prepared {
            if let Some(request) = store.fetch(&in_order(&[UploadState::Waiting]))?.into_iter().next() {
                self.start_preparing(request);
                return Ok(());
            }
        }

        if !store.fetch(&UploadFilter::in_states(&UploadState::ACTIVE))?.is_empty() {
            return Ok(());
        }

        if self.ctx.profile().needs_moderation() && self.state.moderating == 0 {
            let finished: Vec<UploadRequest> = store
                .fetch(&UploadFilter::in_states(&[UploadState::Finished]))?
                .into_iter()
                .filter(|request| !self.state.submitted_for_moderation.contains(&request.id))
                .collect();
            if !finished.is_empty() {
                self.start_moderation(finished);
                return Ok(());
            }
        }

        self.start_asset_deletion()
    }

    /// 声称处于进行中、却没有 worker 在执行的请求，降级到对应的错误状态。
    fn demote_stuck_requests(&self) -> Result<(), UploadError> {
        let in_progress = self.ctx.store.fetch(&UploadFilter::in_states(&[
            UploadState::Preparing,
            UploadState::Uploading,
            UploadState::Finishing,
        ]))?;
        for request in in_progress {
            let running = match request.state {
                UploadState::Preparing => self.state.preparing == Some(request.id),
                UploadState::Uploading => self.state.uploading.contains(&request.id),
                UploadState::Finishing => self.state.finishing == Some(request.id),
                _ => true,
            };
            if running {
                continue;
            }
            if let Some(demoted) = request.state.stuck_demotion() {
                log::warn!("[upload-manager] request {} stuck in {:?}; now {demoted:?}", request.id, request.state);
                if let Err(err) = self.ctx.store.update_state(request.id, demoted, Some(INTERRUPTED_MESSAGE)) {
                    log::error!("[upload-manager] failed to demote request {}: {err}", request.id);
                }
            }
        }
        Ok(())
    }

    pub(super) fn start_preparing(&mut self, request: UploadRequest) {
        if let Err(err) = self.ctx.store.update_state(request.id, UploadState::Preparing, None) {
            log::error!("[upload-manager] cannot start preparing request {}: {err}", request.id);
            return;
        }
        self.state.preparing = Some(request.id);
        self.state.workers.insert(request.id, UploadState::Preparing);
        log::debug!("[upload-manager] preparing request {}", request.id);
        let ctx = self.ctx.clone();
        let events = self.events.clone();
        self.ctx.spawner.spawn(Box::new(move || {
            let result = prepare_upload(&ctx, &request);
            let _ = events.send(Event::Prepared { id: request.id, result });
        }));
        self.notify(Event::FindNext);
    }

    fn did_prepare(&mut self, id: UploadId, result: Result<PreparedFile, UploadError>) {
        self.state.workers.remove(&id);
        if self.state.preparing == Some(id) {
            self.state.preparing = None;
        }
        if let Some(mut request) = self.load_in_state(id, UploadState::Preparing) {
            match result {
                Ok(file) => {
                    request.file_name = file.file_name;
                    request.mime_type = file.mime_type;
                    request.md5_sum = file.md5_sum;
                    request.is_video = file.is_video;
                    request.creation_date = file.creation_date;
                    request.request_error.clear();
                    request.state = UploadState::Prepared;
                    self.ctx.store.save(&request);
                    self.ctx.counters.init_counter(&request.local_identifier);
                    self.ctx.counters.set_total_bytes(&request.local_identifier, file.byte_count);
                    if let Some(session) = self.state.background.as_mut() {
                        session.bytes_prepared = session.bytes_prepared.saturating_add(file.byte_count);
                        session.to_transfer.push_back(id);
                    }
                }
                Err(err) => {
                    let state = preparation_failure_state(&err);
                    log::warn!("[upload-manager] preparing request {id} failed ({state:?}): {err}");
                    request.state = state;
                    request.request_error = err.to_string();
                    self.ctx.store.save(&request);
                }
            }
        }
        self.after_work();
    }

    pub(super) fn start_transfer(&mut self, request: UploadRequest) {
        if let Err(err) = self.ctx.store.update_state(request.id, UploadState::Uploading, None) {
            log::error!("[upload-manager] cannot start transfer of request {}: {err}", request.id);
            return;
        }
        self.state.uploading.insert(request.id);
        self.state.workers.insert(request.id, UploadState::Uploading);
        self.ctx.counters.init_counter(&request.local_identifier);
        log::debug!("[upload-manager] transferring request {}", request.id);
        let ctx = self.ctx.clone();
        let events = self.events.clone();
        self.ctx.spawner.spawn(Box::new(move || {
            let (bytes_sent, result) = transfer_upload(&ctx, &request);
            let _ = events.send(Event::Transferred {
                id: request.id,
                bytes_sent,
                result,
            });
        }));
        self.notify(Event::FindNext);
    }

    fn did_transfer(&mut self, id: UploadId, bytes_sent: u64, result: Result<UploadedImage, UploadError>) {
        self.state.uploading.remove(&id);
        self.state.workers.remove(&id);
        if let Some(session) = self.state.background.as_mut() {
            session.bytes_sent = session.bytes_sent.saturating_add(bytes_sent);
        }
        if let Some(mut request) = self.load_in_state(id, UploadState::Uploading) {
            self.ctx.counters.remove_counter(&request.local_identifier);
            match result {
                Ok(uploaded) => {
                    request.image_id = uploaded.image_id;
                    request.request_error.clear();
                    request.state = UploadState::Uploaded;
                    self.ctx.store.save(&request);
                    self.remove_staged_file(&request);
                    let image = uploaded
                        .info
                        .clone()
                        .unwrap_or_else(|| image_from_request(&request, &uploaded));
                    if let Err(err) = self.ctx.images.did_upload_image(&self.ctx.account(), &image, request.category) {
                        log::warn!("[upload-manager] failed to cache image {}: {err}", uploaded.image_id);
                    }
                    if let Some(session) = self.state.background.as_mut() {
                        session.to_finish.push_back(id);
                    }
                }
                Err(err) => {
                    let state = transfer_failure_state(&err);
                    log::warn!("[upload-manager] transfer of request {id} failed ({state:?}): {err}");
                    request.state = state;
                    request.request_error = err.to_string();
                    self.ctx.store.save(&request);
                }
            }
        }
        self.after_work();
    }

    pub(super) fn start_finishing(&mut self, request: UploadRequest) {
        if let Err(err) = self.ctx.store.update_state(request.id, UploadState::Finishing, None) {
            log::error!("[upload-manager] cannot start finishing request {}: {err}", request.id);
            return;
        }
        self.state.finishing = Some(request.id);
        self.state.workers.insert(request.id, UploadState::Finishing);
        let ctx = self.ctx.clone();
        let events = self.events.clone();
        self.ctx.spawner.spawn(Box::new(move || {
            let result = finish_upload(&ctx, &request);
            let _ = events.send(Event::Finished { id: request.id, result });
        }));
    }

    fn did_finish(&mut self, id: UploadId, result: Result<(), PwgError>) {
        self.state.workers.remove(&id);
        if self.state.finishing == Some(id) {
            self.state.finishing = None;
        }
        if let Some(mut request) = self.load_in_state(id, UploadState::Finishing) {
            match result {
                Ok(()) => {
                    log::info!("[upload-manager] request {id} finished (image {})", request.image_id);
                    request.request_error.clear();
                    request.state = UploadState::Finished;
                }
                Err(err) => {
                    let state = finishing_failure_state(&err);
                    log::warn!("[upload-manager] finishing request {id} failed ({state:?}): {err}");
                    request.state = state;
                    request.request_error = err.to_string();
                }
            }
            self.ctx.store.save(&request);
        }
        self.after_work();
    }

    fn start_moderation(&mut self, finished: Vec<UploadRequest>) {
        let mut by_album: BTreeMap<i64, Vec<UploadRequest>> = BTreeMap::new();
        for request in finished {
            self.state.submitted_for_moderation.insert(request.id);
            by_album.entry(request.category).or_default().push(request);
        }
        self.state.moderating = by_album.len();
        for (category, requests) in by_album {
            let ctx = self.ctx.clone();
            let events = self.events.clone();
            self.ctx.spawner.spawn(Box::new(move || {
                let result = moderate_uploads(&ctx, category, &requests);
                let ids = requests.iter().map(|request| request.id).collect();
                let _ = events.send(Event::Moderated { category, ids, result });
            }));
        }
    }

    fn did_moderate(&mut self, category: i64, ids: &[UploadId], result: Result<Vec<i64>, PwgError>) {
        self.state.moderating = self.state.moderating.saturating_sub(1);
        let acknowledged: HashSet<i64> = match result {
            Ok(image_ids) => image_ids.into_iter().collect(),
            Err(err) => {
                log::warn!("[upload-manager] moderation of album {category} failed: {err}");
                return;
            }
        };
        for id in ids {
            if let Some(mut request) = self.load_in_state(*id, UploadState::Finished) {
                if acknowledged.contains(&request.image_id) {
                    request.state = UploadState::Moderated;
                    self.ctx.store.save(&request);
                }
            }
        }
    }

    pub(super) fn start_asset_deletion(&mut self) -> Result<(), UploadError> {
        let candidates: Vec<UploadRequest> = self
            .ctx
            .store
            .fetch(&UploadFilter::in_states(&UploadState::COMPLETED).delete_after_upload(true))?
            .into_iter()
            .filter(|request| !self.state.deleting.contains(&request.id))
            .collect();
        if candidates.is_empty() {
            return Ok(());
        }
        let ids: Vec<UploadId> = candidates.iter().map(|request| request.id).collect();
        // 分享文件不在媒体库中；删除请求即删除文件。
        let identifiers: Vec<String> = candidates
            .iter()
            .filter(|request| !request.is_from_intent_or_clipboard())
            .map(|request| request.local_identifier.clone())
            .collect();
        self.state.deleting.extend(ids.iter().copied());
        log::info!("[upload-manager] deleting {} uploaded assets", identifiers.len());
        if identifiers.is_empty() {
            self.did_delete_assets(&ids, Ok(()));
            return Ok(());
        }
        let media = self.ctx.media.clone();
        let events = self.events.clone();
        self.ctx.spawner.spawn(Box::new(move || {
            let result = media.delete_assets(&identifiers);
            let _ = events.send(Event::AssetsDeleted { ids, result });
        }));
        Ok(())
    }

    fn did_delete_assets(&mut self, ids: &[UploadId], result: Result<(), MediaError>) {
        for id in ids {
            self.state.deleting.remove(id);
        }
        match result {
            Ok(()) => {
                if let Err(err) = self.ctx.store.delete(ids) {
                    log::error!("[upload-manager] failed to delete {} requests: {err}", ids.len());
                }
            }
            Err(err) => {
                log::warn!("[upload-manager] asset deletion declined: {err}");
                if let Err(err) = self.ctx.store.set_delete_after_upload(ids, false) {
                    log::error!("[upload-manager] failed to clear deletion flags: {err}");
                }
            }
        }
    }

    fn after_work(&mut self) {
        if let Some(session) = self.state.background.as_mut() {
            session.in_flight = false;
            self.background_step();
        } else {
            self.find_next_image_to_upload();
        }
    }

    /// 载入请求；若状态已被其他操作改变则忽略。
    fn load_in_state(&self, id: UploadId, expected: UploadState) -> Option<UploadRequest> {
        match self.ctx.store.load(id) {
            Ok(Some(request)) if request.state == expected => Some(request),
            Ok(Some(request)) => {
                log::debug!("[upload-manager] request {id} is now {:?}; result ignored", request.state);
                None
            }
            Ok(None) => {
                log::debug!("[upload-manager] request {id} vanished");
                None
            }
            Err(err) => {
                log::error!("[upload-manager] failed to load request {id}: {err}");
                None
            }
        }
    }

    fn remove_staged_file(&self, request: &UploadRequest) {
        let path = self.ctx.store.uploads_dir().join(request.staged_file_name());
        if let Err(err) = fs::remove_file(&path) {
            log::debug!("[upload-manager] staged file {path:?} not removed: {err}");
        }
    }
}
