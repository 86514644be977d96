//! Persistent interactive sessions.
//!
//! A [`PersistentSession`] is one long-lived pseudo-terminal per host. The
//! [`SessionRegistry`] owns them, creates them lazily and guarantees at most
//! one per host. All terminal-text heuristics live in [`dialect`].

pub mod dialect;
mod persistent;
mod registry;

pub use dialect::{strip_ansi, BashDialect, Sentinel, ShellDialect};
pub use persistent::{generate_id, PersistentSession, SessionOptions};
pub use registry::{SessionGuard, SessionRegistry};

use crate::activation::ActivationState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Connect protocol phases of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionPhase {
    Disconnected,
    PtyOpen,
    PrivilegeChecked,
    JobContainerReady,
}

impl SessionPhase {
    /// Phases only move forward one step at a time; any phase may drop back
    /// to `Disconnected`.
    pub fn can_advance_to(self, to: SessionPhase) -> bool {
        use SessionPhase::*;
        matches!(
            (self, to),
            (_, Disconnected)
                | (Disconnected, PtyOpen)
                | (PtyOpen, PrivilegeChecked)
                | (PrivilegeChecked, JobContainerReady)
        )
    }

    /// Commands may be submitted once the privilege check is done.
    pub fn is_usable(self) -> bool {
        matches!(self, SessionPhase::PrivilegeChecked | SessionPhase::JobContainerReady)
    }
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionPhase::Disconnected => "DISCONNECTED",
            SessionPhase::PtyOpen => "PTY_OPEN",
            SessionPhase::PrivilegeChecked => "PRIVILEGE_CHECKED",
            SessionPhase::JobContainerReady => "JOB_CONTAINER_READY",
        };
        write!(f, "{}", s)
    }
}

/// Point-in-time view of a host's session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionStatus {
    pub session_id: String,
    pub host: String,
    pub connected: bool,
    pub phase: SessionPhase,
    pub privileged: bool,
    pub job_container: Option<String>,
    pub activation_state: ActivationState,
    pub activated_env: Option<String>,
    /// The cached activation is still within its TTL.
    pub activation_valid: bool,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

impl SessionStatus {
    /// Status reported for a host that has no session.
    pub fn absent(host: &str) -> Self {
        let now = Utc::now();
        Self {
            session_id: String::new(),
            host: host.to_string(),
            connected: false,
            phase: SessionPhase::Disconnected,
            privileged: false,
            job_container: None,
            activation_state: ActivationState::Unknown,
            activated_env: None,
            activation_valid: false,
            created_at: now,
            last_activity: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phases_advance_in_order() {
        use SessionPhase::*;
        assert!(Disconnected.can_advance_to(PtyOpen));
        assert!(PtyOpen.can_advance_to(PrivilegeChecked));
        assert!(PrivilegeChecked.can_advance_to(JobContainerReady));
        assert!(JobContainerReady.can_advance_to(Disconnected));

        assert!(!Disconnected.can_advance_to(PrivilegeChecked));
        assert!(!PtyOpen.can_advance_to(JobContainerReady));
        assert!(!JobContainerReady.can_advance_to(PtyOpen));
    }

    #[test]
    fn only_checked_phases_are_usable() {
        assert!(!SessionPhase::Disconnected.is_usable());
        assert!(!SessionPhase::PtyOpen.is_usable());
        assert!(SessionPhase::PrivilegeChecked.is_usable());
        assert!(SessionPhase::JobContainerReady.is_usable());
    }

    #[test]
    fn phase_serializes_screaming_snake() {
        let json = serde_json::to_string(&SessionPhase::JobContainerReady).unwrap();
        assert_eq!(json, "\"JOB_CONTAINER_READY\"");
        assert_eq!(SessionPhase::PtyOpen.to_string(), "PTY_OPEN");
    }
}
