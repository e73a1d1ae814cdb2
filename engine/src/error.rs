//! Error kinds for the fill engine.
//!
//! Every failure path of a run funnels into [`FillError`] so the runner can
//! decide, from the kind alone, whether valves must be closed, whether the
//! run is an abort or a plain failure, and which exit code to use.

use std::fmt;
use std::path::PathBuf;

/// What tripped the safety loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trip {
    /// The O2 alarm asserted.
    O2Alarm,
    /// An LN2 emergency stop is active. The hardware has already cut power
    /// to the valve NPSs, so the abort path must not try to close valves.
    EStop,
    /// The O2 endpoint failed too many consecutive reads.
    AlertReadFailures,
}

impl fmt::Display for Trip {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::O2Alarm => write!(f, "O2 alarm active"),
            Self::EStop => write!(f, "LN2 e-stop active"),
            Self::AlertReadFailures => write!(f, "too many alert read failures"),
        }
    }
}

#[derive(Debug)]
pub enum FillError {
    /// Another fill is in progress on this host.
    LockExists(PathBuf),
    /// A pre-fill check failed before any valve was opened.
    PreCheckFailed(String),
    /// The NPS could not be reached after bounded retries.
    NpsUnreachable(String),
    /// A mutating NPS call was refused because an LN2 e-stop is active.
    EStopActive,
    /// The safety loop requested an abort.
    SafetyTripped(Trip),
    /// The operator aborted via keystroke or signal.
    OperatorAbort,
    /// An outer phase timeout was exceeded.
    PhaseTimeout(&'static str),
    /// Post-run validation of the collected data failed.
    ValidationFailed(String),
}

impl FillError {
    /// Whether the abort path for this error should command all valves off.
    /// Only an e-stop trip leaves them alone: the NPSs are unpowered.
    pub fn close_valves_on_abort(&self) -> bool {
        !matches!(self, Self::SafetyTripped(Trip::EStop))
    }

    /// Whether this error is an abort (operator or safety) rather than a
    /// plain failure. Both exit non-zero; the run record distinguishes them.
    pub fn is_abort(&self) -> bool {
        matches!(self, Self::SafetyTripped(_) | Self::OperatorAbort)
    }
}

impl fmt::Display for FillError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LockExists(path) => {
                write!(f, "lock file {} already exists", path.display())
            }
            Self::PreCheckFailed(reason) => write!(f, "pre-fill check failed: {reason}"),
            Self::NpsUnreachable(detail) => write!(f, "NPS unreachable: {detail}"),
            Self::EStopActive => {
                write!(f, "cannot operate LN2 valves: e-stops are active")
            }
            Self::SafetyTripped(trip) => write!(f, "safety trip: {trip}"),
            Self::OperatorAbort => write!(f, "aborted by operator"),
            Self::PhaseTimeout(phase) => write!(f, "{phase} phase exceeded its time limit"),
            Self::ValidationFailed(msg) => write!(f, "post-fill validation failed: {msg}"),
        }
    }
}

impl std::error::Error for FillError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estop_abort_does_not_close_valves() {
        assert!(!FillError::SafetyTripped(Trip::EStop).close_valves_on_abort());
        assert!(FillError::SafetyTripped(Trip::O2Alarm).close_valves_on_abort());
        assert!(FillError::OperatorAbort.close_valves_on_abort());
    }

    #[test]
    fn aborts_and_failures_are_distinguished() {
        assert!(FillError::OperatorAbort.is_abort());
        assert!(FillError::SafetyTripped(Trip::AlertReadFailures).is_abort());
        assert!(!FillError::PhaseTimeout("fill").is_abort());
        assert!(!FillError::PreCheckFailed("pressure".into()).is_abort());
    }
}
