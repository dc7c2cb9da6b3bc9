//! 宿主给予后台时间时，按字节预算执行的工作。

use super::models::UploadId;
use super::scheduler::UploadEngine;
use super::state::{recovery_reset, UploadState};
use super::storage::UploadFilter;
use crate::error::UploadError;
use std::collections::VecDeque;

/// 后台任务开始时选定的工作。
#[derive(Debug, Default, Clone, PartialEq)]
pub(crate) struct BackgroundSession {
    pub auto_upload_only: bool,
    pub to_finish: VecDeque<UploadId>,
    pub to_transfer: VecDeque<UploadId>,
    pub to_prepare: VecDeque<UploadId>,
    pub bytes_sent: u64,
    pub bytes_prepared: u64,
    /// 有 worker 在运行；下一步要等它的结果。
    pub in_flight: bool,
}

impl BackgroundSession {
    pub fn is_exhausted(&self) -> bool {
        !self.in_flight
            && self.to_finish.is_empty()
            && self.to_transfer.is_empty()
            && self.to_prepare.is_empty()
    }
}

impl UploadEngine {
    pub(crate) fn initialise_background_task(&mut self, auto_upload_only: bool) {
        let session = match self.select_background_work(auto_upload_only) {
            Ok(session) => session,
            Err(err) => {
                log::error!("[upload-background] cannot select work: {err}");
                BackgroundSession {
                    auto_upload_only,
                    ..BackgroundSession::default()
                }
            }
        };
        log::info!(
            "[upload-background] started: {} to finish, {} to transfer, {} to prepare",
            session.to_finish.len(),
            session.to_transfer.len(),
            session.to_prepare.len()
        );
        self.state.background = Some(session);
        self.background_step();
    }

    fn select_background_work(&self, auto_upload_only: bool) -> Result<BackgroundSession, UploadError> {
        let store = &self.ctx.store;
        let limits = self.ctx.limits();
        let scoped = |states: &[UploadState]| {
            let filter = UploadFilter::in_states(states);
            if auto_upload_only {
                filter.auto_upload(true)
            } else {
                filter
            }
        };
        let mut session = BackgroundSession {
            auto_upload_only,
            ..BackgroundSession::default()
        };

        if store.fetch(&scoped(&UploadState::FAILED))?.len() >= limits.max_failed {
            log::warn!("[upload-background] too many failed uploads, nothing to do");
            return Ok(session);
        }

        for request in store.fetch(&scoped(&UploadState::RESUMABLE))? {
            store.update_state(request.id, recovery_reset(request.state), None)?;
        }

        session.to_finish = ids(store.fetch(&scoped(&[UploadState::Uploaded]))?);
        session.to_transfer = ids(store.fetch(&scoped(&[UploadState::Prepared]))?);
        let room = limits.max_prepared.saturating_sub(session.to_transfer.len());
        session.to_prepare = ids(store.fetch(&scoped(&[UploadState::Waiting]))?)
            .into_iter()
            .take(room)
            .collect();
        Ok(session)
    }

    /// 在预算允许时启动下一个后台工作单元。
    pub(crate) fn background_step(&mut self) {
        let budget = self.ctx.limits().max_background_bytes;
        let Some(session) = self.state.background.as_mut() else {
            return;
        };
        if session.in_flight {
            return;
        }
        let store = self.ctx.store.clone();
        let pick = |queue: &mut VecDeque<UploadId>, expected: UploadState| {
            while let Some(id) = queue.pop_front() {
                match store.load(id) {
                    Ok(Some(request)) if request.state == expected => return Some(request),
                    Ok(_) => log::debug!("[upload-background] request {id} skipped"),
                    Err(err) => log::error!("[upload-background] failed to load request {id}: {err}"),
                }
            }
            None
        };

        if let Some(request) = pick(&mut session.to_finish, UploadState::Uploaded) {
            session.in_flight = true;
            self.start_finishing(request);
            return;
        }
        if session.bytes_sent < budget {
            if let Some(request) = pick(&mut session.to_transfer, UploadState::Prepared) {
                session.in_flight = true;
                self.start_transfer(request);
                return;
            }
        }
        if session.bytes_prepared < budget {
            if let Some(request) = pick(&mut session.to_prepare, UploadState::Waiting) {
                session.in_flight = true;
                self.start_preparing(request);
                return;
            }
        }
        log::info!(
            "[upload-background] idle after sending {} bytes",
            session.bytes_sent
        );
    }

    pub(crate) fn end_background_task(&mut self) {
        if let Some(session) = self.state.background.take() {
            log::info!(
                "[upload-background] ended: {} bytes sent, {} bytes prepared",
                session.bytes_sent,
                session.bytes_prepared
            );
        }
    }
}

fn ids(requests: Vec<super::models::UploadRequest>) -> VecDeque<UploadId> {
    requests.into_iter().map(|request| request.id).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings;
    use crate::upload_manager::scheduler::Event;
    use crate::upload_manager::test_support::Harness;

    #[test]
    fn resumable_failures_restart_from_their_phase() {
        let harness = Harness::new();
        let prepare = harness.enqueue_in_state("a", 5, UploadState::PreparingError);
        let transfer = harness.enqueue_in_state("b", 5, UploadState::UploadingError);
        let finish = harness.enqueue_uploaded("c", 5, 40, UploadState::FinishingError);

        let mut engine = harness.engine();
        engine.handle(Event::BeginBackground { auto_upload_only: false });

        let session = engine.state.background.clone().expect("session");
        assert!(session.in_flight);
        assert_eq!(harness.state_of(finish.id), UploadState::Finishing);
        assert_eq!(session.to_transfer, VecDeque::from(vec![transfer.id]));
        assert_eq!(session.to_prepare, VecDeque::from(vec![prepare.id]));
        assert_eq!(harness.state_of(transfer.id), UploadState::Prepared);
    }

    #[test]
    fn transfers_stop_once_the_byte_budget_is_spent() {
        let harness = Harness::new();
        settings::set_max_background_bytes(&harness.ctx.db, 1024 * 1024).expect("budget");
        let mut staged = Vec::new();
        for name in ["a", "b", "c"] {
            let mut request = harness.enqueue_in_state(name, 5, UploadState::Prepared);
            request.file_name = format!("{name}.jpg");
            request.md5_sum = "abc".to_string();
            harness.ctx.store.save(&request);
            harness.stage(&request, vec![1u8; 700 * 1024]);
            staged.push(request);
        }

        let mut engine = harness.engine();
        engine.handle(Event::BeginBackground { auto_upload_only: false });
        harness.drive(&mut engine);

        let states: Vec<UploadState> = staged.iter().map(|request| harness.state_of(request.id)).collect();
        assert_eq!(
            states,
            vec![UploadState::Finished, UploadState::Finished, UploadState::Prepared]
        );
        let session = engine.state.background.clone().expect("session");
        assert_eq!(session.bytes_sent, 2 * 700 * 1024);
        assert_eq!(session.to_transfer.len(), 1);

        engine.handle(Event::EndBackground);
        assert!(engine.state.background.is_none());
    }

    #[test]
    fn auto_upload_sessions_ignore_manual_requests() {
        let harness = Harness::new();
        let manual = harness.enqueue("manual", 5);
        let mut props = crate::upload_manager::models::UploadProperties::new("auto", 5);
        props.marked_for_auto_upload = true;
        let auto = harness.enqueue_with(props);

        let mut engine = harness.engine();
        engine.handle(Event::BeginBackground { auto_upload_only: true });
        assert_eq!(harness.state_of(auto.id), UploadState::Preparing);
        assert_eq!(harness.state_of(manual.id), UploadState::Waiting);
    }

    #[test]
    fn the_failure_cap_leaves_the_session_empty() {
        let harness = Harness::new();
        settings::set_max_failed(&harness.ctx.db, 1).expect("cap");
        harness.enqueue_in_state("bad", 5, UploadState::UploadingFail);
        let waiting = harness.enqueue("a", 5);

        let mut engine = harness.engine();
        engine.handle(Event::BeginBackground { auto_upload_only: false });
        let session = engine.state.background.clone().expect("session");
        assert!(session.is_exhausted());
        assert_eq!(harness.state_of(waiting.id), UploadState::Waiting);
    }

    #[test]
    fn foreground_scheduling_waits_for_the_background_task() {
        let harness = Harness::new();
        let waiting = harness.enqueue("a", 5);
        let mut engine = harness.engine();
        engine.state.background = Some(BackgroundSession::default());
        engine.find_next_image_to_upload();
        assert_eq!(harness.state_of(waiting.id), UploadState::Waiting);
    }
}
