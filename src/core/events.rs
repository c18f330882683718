use crate::core::model::{AttemptId, UpdatePhase};

#[derive(Debug, Clone)]
pub enum UpdateEvent {
    PhaseChanged {
        phase: UpdatePhase,
    },
    /// Download progress. `percent` is present exactly when the total size is
    /// known and changes at most once per value; `downloaded` always grows.
    Progress {
        attempt_id: AttemptId,
        downloaded: u64,
        total: Option<u64>,
        percent: Option<u8>,
    },
    Status {
        message: String,
    },
    /// Terminal result of the current attempt (download failure, or install
    /// success/failure). Sent strictly after the attempt's last progress event.
    Outcome {
        succeeded: bool,
        detail: String,
    },
}
