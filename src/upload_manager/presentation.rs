use super::state::UploadState;
use serde::Serialize;

/// 请求所在的队列分区。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum QueueSection {
    /// 永久失败。
    Impossible,
    /// 等待重试的瞬时失败。
    Resumable,
    Queued,
    Completed,
}

struct StateInfo {
    state: UploadState,
    label: &'static str,
    section: QueueSection,
}

static STATE_TABLE: [StateInfo; 16] = [
    StateInfo { state: UploadState::Waiting, label: "Waiting...", section: QueueSection::Queued },
    StateInfo { state: UploadState::Preparing, label: "Preparing...", section: QueueSection::Queued },
    StateInfo { state: UploadState::PreparingError, label: "Preparing... Error", section: QueueSection::Resumable },
    StateInfo { state: UploadState::PreparingFail, label: "Preparing... Error", section: QueueSection::Impossible },
    StateInfo { state: UploadState::FormatError, label: "File format not accepted by Piwigo server.", section: QueueSection::Impossible },
    StateInfo { state: UploadState::Prepared, label: "Ready for upload...", section: QueueSection::Queued },
    StateInfo { state: UploadState::Uploading, label: "Uploading...", section: QueueSection::Queued },
    StateInfo { state: UploadState::UploadingError, label: "Uploading... Error", section: QueueSection::Resumable },
    StateInfo { state: UploadState::UploadingFail, label: "Uploading... Error", section: QueueSection::Impossible },
    StateInfo { state: UploadState::Uploaded, label: "Uploaded", section: QueueSection::Queued },
    StateInfo { state: UploadState::Finishing, label: "Finishing...", section: QueueSection::Queued },
    StateInfo { state: UploadState::FinishingError, label: "Finishing... Error", section: QueueSection::Resumable },
    StateInfo { state: UploadState::FinishingFail, label: "Finishing... Error", section: QueueSection::Impossible },
    StateInfo { state: UploadState::Finished, label: "Completed", section: QueueSection::Completed },
    StateInfo { state: UploadState::Moderated, label: "Awaiting moderation", section: QueueSection::Completed },
    StateInfo { state: UploadState::Deleted, label: "Deleted", section: QueueSection::Completed },
];

fn info(state: UploadState) -> &'static StateInfo {
    STATE_TABLE
        .iter()
        .find(|entry| entry.state == state)
        .unwrap_or(&STATE_TABLE[0])
}

/// 显示在请求旁的可读标签。
pub fn state_label(state: UploadState) -> &'static str {
    info(state).label
}

pub fn queue_section(state: UploadState) -> QueueSection {
    info(state).section
}
