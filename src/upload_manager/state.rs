//! 上传请求的生命周期。
//!
//! 原始值会被持久化，必须保持稳定。

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UploadState {
    Waiting,
    Preparing,
    PreparingError,
    PreparingFail,
    FormatError,
    Prepared,
    Uploading,
    UploadingError,
    UploadingFail,
    Uploaded,
    Finishing,
    FinishingError,
    FinishingFail,
    Finished,
    Moderated,
    Deleted,
}

impl UploadState {
    pub const ALL: [UploadState; 16] = [
        UploadState::Waiting,
        UploadState::Preparing,
        UploadState::PreparingError,
        UploadState::PreparingFail,
        UploadState::FormatError,
        UploadState::Prepared,
        UploadState::Uploading,
        UploadState::UploadingError,
        UploadState::UploadingFail,
        UploadState::Uploaded,
        UploadState::Finishing,
        UploadState::FinishingError,
        UploadState::FinishingFail,
        UploadState::Finished,
        UploadState::Moderated,
        UploadState::Deleted,
    ];

    /// 计入失败上限的请求。
    pub const FAILED: [UploadState; 4] = [
        UploadState::PreparingError,
        UploadState::PreparingFail,
        UploadState::UploadingError,
        UploadState::UploadingFail,
    ];

    /// 会被自动恢复的瞬时错误。
    pub const RESUMABLE: [UploadState; 3] = [
        UploadState::PreparingError,
        UploadState::UploadingError,
        UploadState::FinishingError,
    ];

    /// 留给用户手动清理的永久失败。
    pub const IMPOSSIBLE: [UploadState; 4] = [
        UploadState::PreparingFail,
        UploadState::FormatError,
        UploadState::UploadingFail,
        UploadState::FinishingFail,
    ];

    /// 后续仍有工作要做的请求。
    pub const ACTIVE: [UploadState; 6] = [
        UploadState::Waiting,
        UploadState::Preparing,
        UploadState::Prepared,
        UploadState::Uploading,
        UploadState::Uploaded,
        UploadState::Finishing,
    ];

    pub const COMPLETED: [UploadState; 2] = [UploadState::Finished, UploadState::Moderated];

    pub fn raw_value(self) -> i64 {
        match self {
            UploadState::Waiting => 0,
            UploadState::Preparing => 1,
            UploadState::PreparingError => 2,
            UploadState::PreparingFail => 3,
            UploadState::FormatError => 4,
            UploadState::Prepared => 5,
            UploadState::Uploading => 6,
            UploadState::UploadingError => 7,
            UploadState::Uploaded => 8,
            UploadState::Finishing => 9,
            UploadState::FinishingError => 10,
            UploadState::Finished => 11,
            UploadState::Moderated => 12,
            UploadState::Deleted => 13,
            UploadState::UploadingFail => 14,
            UploadState::FinishingFail => 15,
        }
    }

    pub fn from_raw(value: i64) -> Option<Self> {
        UploadState::ALL
            .into_iter()
            .find(|state| state.raw_value() == value)
    }

    pub fn is_completed(self) -> bool {
        matches!(self, UploadState::Finished | UploadState::Moderated)
    }

    pub fn is_pending(self) -> bool {
        !self.is_completed()
    }

    /// 生命周期中的有向边。恢复重置不算边，
    /// 参见 [`recovery_reset`]。
    pub fn can_transition(self, to: UploadState) -> bool {
        use UploadState::*;
        if to == Deleted {
            return self != Deleted;
        }
        matches!(
            (self, to),
            (Waiting, Preparing)
                | (Preparing, Prepared)
                | (Preparing, PreparingError)
                | (Preparing, PreparingFail)
                | (Preparing, FormatError)
                | (Prepared, Uploading)
                | (Uploading, Uploaded)
                | (Uploading, UploadingError)
                | (Uploading, UploadingFail)
                // 暂存文件在传输前消失
                | (Uploading, PreparingFail)
                | (Uploaded, Finishing)
                | (Finishing, Finished)
                | (Finishing, FinishingError)
                | (Finishing, FinishingFail)
                | (Finished, Moderated)
        )
    }

    /// 实际没有 worker 在执行时，进行中状态降级到的状态。
    pub fn stuck_demotion(self) -> Option<UploadState> {
        match self {
            UploadState::Preparing => Some(UploadState::PreparingError),
            UploadState::Uploading => Some(UploadState::UploadingError),
            UploadState::Finishing => Some(UploadState::FinishingError),
            _ => None,
        }
    }
}

/// 请求恢复时重新开始的状态。已完成的传输不会重做：
/// 收尾失败只重试收尾。
pub fn recovery_reset(state: UploadState) -> UploadState {
    match state {
        UploadState::Uploading | UploadState::UploadingError | UploadState::Uploaded => {
            UploadState::Prepared
        }
        UploadState::Finishing | UploadState::FinishingError => UploadState::Uploaded,
        _ => UploadState::Waiting,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use UploadState::*;

    #[test]
    fn raw_values_round_trip() {
        for state in UploadState::ALL {
            assert_eq!(UploadState::from_raw(state.raw_value()), Some(state));
        }
        assert_eq!(UploadState::from_raw(99), None);
        assert_eq!(Finished.raw_value(), 11);
        assert_eq!(UploadingFail.raw_value(), 14);
    }

    #[test]
    fn happy_path_follows_edges() {
        let path = [
            Waiting, Preparing, Prepared, Uploading, Uploaded, Finishing, Finished, Moderated,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition(pair[1]), "{:?} -> {:?}", pair[0], pair[1]);
        }
    }

    #[test]
    fn no_edge_skips_a_phase() {
        assert!(!Waiting.can_transition(Uploaded));
        assert!(!Waiting.can_transition(Prepared));
        assert!(!Prepared.can_transition(Finishing));
        assert!(!Uploaded.can_transition(Finished));
        assert!(!FinishingError.can_transition(Finished));
        assert!(!Deleted.can_transition(Deleted));
        for state in UploadState::ALL {
            if state != Deleted {
                assert!(state.can_transition(Deleted));
            }
        }
    }

    #[test]
    fn recovery_never_redoes_a_completed_transfer() {
        assert_eq!(recovery_reset(Uploading), Prepared);
        assert_eq!(recovery_reset(UploadingError), Prepared);
        assert_eq!(recovery_reset(Uploaded), Prepared);
        assert_eq!(recovery_reset(Finishing), Uploaded);
        assert_eq!(recovery_reset(FinishingError), Uploaded);
        assert_eq!(recovery_reset(PreparingError), Waiting);
        assert_eq!(recovery_reset(Preparing), Waiting);
    }
}
