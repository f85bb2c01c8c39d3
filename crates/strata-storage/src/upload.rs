//! Upload State Machine
//!
//! Every block the shipper uploads is driven through an explicit state machine:
//!
//! ```text
//!            start               data put            size + commit ok
//! Pending ─────────▶ Uploading ─────────▶ Verifying ─────────────────▶ Done
//!    ▲                   │                    │
//!    │   backoff         │ error              │ error
//!    └───────────────────┴────────────────────┘
//!                        │ attempts exhausted
//!                        ▼
//!                     Failed(attempts)
//! ```
//!
//! The machine itself is pure: it decides what happens next and how long to wait
//! before the next attempt. The shipper performs the I/O.

use std::time::Duration;

use crate::error::Error;
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadState {
    /// Waiting for attempt number `attempt` (0-indexed)
    Pending { attempt: u32 },
    /// Data object being written
    Uploading { attempt: u32 },
    /// Checking the data object, then writing the commit marker
    Verifying { attempt: u32 },
    Done,
    Failed { attempts: u32, last_error: String },
}

impl UploadState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, UploadState::Done | UploadState::Failed { .. })
    }

    pub fn name(&self) -> &'static str {
        match self {
            UploadState::Pending { .. } => "pending",
            UploadState::Uploading { .. } => "uploading",
            UploadState::Verifying { .. } => "verifying",
            UploadState::Done => "done",
            UploadState::Failed { .. } => "failed",
        }
    }
}

/// Upload of one block
#[derive(Debug, Clone)]
pub struct BlockUpload {
    block_id: String,
    state: UploadState,
    max_attempts: u32,
    backoff: RetryPolicy,
}

impl BlockUpload {
    pub fn new(block_id: impl Into<String>, max_attempts: u32, backoff: RetryPolicy) -> Self {
        Self {
            block_id: block_id.into(),
            state: UploadState::Pending { attempt: 0 },
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    pub fn block_id(&self) -> &str {
        &self.block_id
    }

    pub fn state(&self) -> &UploadState {
        &self.state
    }

    /// Pending → Uploading
    pub fn start(&mut self) {
        if let UploadState::Pending { attempt } = self.state {
            self.state = UploadState::Uploading { attempt };
        }
    }

    /// Uploading → Verifying
    pub fn uploaded(&mut self) {
        if let UploadState::Uploading { attempt } = self.state {
            self.state = UploadState::Verifying { attempt };
        }
    }

    /// Verifying → Done
    pub fn verified(&mut self) {
        if let UploadState::Verifying { .. } = self.state {
            self.state = UploadState::Done;
        }
    }

    /// A block already committed in the archive needs no upload
    pub fn already_present(&mut self) {
        if !self.state.is_terminal() {
            self.state = UploadState::Done;
        }
    }

    /// Record a failed attempt. Returns the delay before the next attempt, or
    /// `None` once the machine has moved to `Failed`.
    pub fn failed(&mut self, error: &Error) -> Option<Duration> {
        let attempt = match self.state {
            UploadState::Uploading { attempt } | UploadState::Verifying { attempt } => attempt,
            UploadState::Pending { attempt } => attempt,
            UploadState::Done | UploadState::Failed { .. } => return None,
        };

        let attempts = attempt + 1;
        if attempts >= self.max_attempts {
            self.state = UploadState::Failed {
                attempts,
                last_error: error.to_string(),
            };
            return None;
        }

        self.state = UploadState::Pending { attempt: attempts };
        Some(self.backoff.jittered_backoff(attempt))
    }

    /// Convert a `Failed` machine into the error surfaced to callers
    pub fn into_error(self) -> Option<Error> {
        match self.state {
            UploadState::Failed {
                attempts,
                last_error,
            } => Some(Error::ShipFailed {
                block_id: self.block_id,
                attempts,
                last_error,
            }),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::ErrorKind;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(0, Duration::from_millis(100), Duration::from_secs(1), 2.0)
    }

    #[test]
    fn test_happy_path() {
        let mut upload = BlockUpload::new("b1", 3, policy());
        assert_eq!(upload.state(), &UploadState::Pending { attempt: 0 });
        upload.start();
        assert_eq!(upload.state().name(), "uploading");
        upload.uploaded();
        assert_eq!(upload.state().name(), "verifying");
        upload.verified();
        assert_eq!(upload.state(), &UploadState::Done);
        assert!(upload.into_error().is_none());
    }

    #[test]
    fn test_failure_backs_off_then_fails() {
        let mut upload = BlockUpload::new("b1", 3, policy());
        let err = Error::Internal("boom".into());

        upload.start();
        let delay = upload.failed(&err).unwrap();
        assert!(delay >= Duration::from_millis(75) && delay <= Duration::from_millis(125));
        assert_eq!(upload.state(), &UploadState::Pending { attempt: 1 });

        upload.start();
        upload.uploaded();
        let delay = upload.failed(&err).unwrap();
        assert!(delay >= Duration::from_millis(150) && delay <= Duration::from_millis(250));

        upload.start();
        assert!(upload.failed(&err).is_none());
        assert!(upload.state().is_terminal());

        let err = upload.into_error().unwrap();
        assert_eq!(err.kind(), ErrorKind::ShipFailed);
        assert!(matches!(err, Error::ShipFailed { attempts: 3, .. }));
    }

    #[test]
    fn test_transitions_ignored_out_of_order() {
        let mut upload = BlockUpload::new("b1", 1, policy());
        upload.verified();
        upload.uploaded();
        assert_eq!(upload.state(), &UploadState::Pending { attempt: 0 });
        upload.already_present();
        assert_eq!(upload.state(), &UploadState::Done);
        assert!(upload.failed(&Error::Internal("late".into())).is_none());
        assert_eq!(upload.state(), &UploadState::Done);
    }
}
