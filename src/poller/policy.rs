//! Pure polling decisions: cadence, mode selection and failure classification.
//!
//! Nothing here touches a timer or the network, so the state machine can be tested
//! without either.

use crate::error::FetchError;
use crate::model::{Mode, RunStatus};
use std::time::Duration;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(2500);
const RETRY_BASE: Duration = Duration::from_secs(5);
const RETRY_MAX: Duration = Duration::from_secs(60);

/// What to do after a successful fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cadence {
    After(Duration),
    Stop,
}

/// Why a failed fetch is shown to the user the way it is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notice {
    /// 401: the key is missing, wrong or revoked.
    Unauthorized,
    /// 429: the key's quota is used up.
    QuotaExceeded,
    /// 404 from the demo endpoint and switching to live did not help.
    NotFoundInDemo,
    /// Anything else; polling continues.
    Transient,
}

impl Notice {
    /// Persistent notices stay on screen and stop polling.
    pub fn is_persistent(self) -> bool {
        !matches!(self, Notice::Transient)
    }
}

/// What to do after a failed fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureAction {
    /// Keep the session alive and try again later.
    Retry,
    /// Stop polling and show `Notice` until the user acts.
    Halt(Notice),
    /// The run may only exist on the live endpoint; re-evaluate the mode instead of retrying.
    RecheckMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub retry_base: Duration,
    pub retry_max: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            retry_base: RETRY_BASE,
            retry_max: RETRY_MAX,
        }
    }
}

impl PollPolicy {
    pub fn with_interval(interval: Duration) -> Self {
        Self {
            interval,
            ..Self::default()
        }
    }

    /// Queued and running runs are polled again; every other status settles the session.
    pub fn next_interval(&self, status: &RunStatus) -> Cadence {
        if status.is_active() {
            Cadence::After(self.interval)
        } else {
            Cadence::Stop
        }
    }

    /// Delay before retrying after `consecutive_failures` transient errors (1-based).
    pub fn retry_delay(&self, consecutive_failures: u32) -> Duration {
        let exp = consecutive_failures.saturating_sub(1).min(16);
        self.retry_base
            .checked_mul(1u32 << exp)
            .unwrap_or(self.retry_max)
            .min(self.retry_max)
    }
}

/// Live unless the caller forces demo or there is no credential to authenticate with.
pub fn select_mode(force_demo: bool, credential_present: bool) -> Mode {
    if force_demo || !credential_present {
        Mode::Demo
    } else {
        Mode::Live
    }
}

pub fn classify(err: &FetchError, mode: Mode, credential_present: bool) -> FailureAction {
    match err.status() {
        Some(401) => FailureAction::Halt(Notice::Unauthorized),
        Some(429) => FailureAction::Halt(Notice::QuotaExceeded),
        Some(404) if mode == Mode::Demo && credential_present => FailureAction::RecheckMode,
        _ => FailureAction::Retry,
    }
}
