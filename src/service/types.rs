use crate::config::ServiceSpec;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status of a managed inference server.
///
/// ```text
/// Stopped ──► Starting ──► Running ──► Stopping ──► Stopped
///    ▲           │            │            │
///    │           ▼            │            ▼
///    └──────── Error ◄────────┴─────────  Error
/// ```
///
/// `Running -> Stopped` is the reconciliation path for a process that died
/// on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Status {
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Stopped => write!(f, "STOPPED"),
            Status::Starting => write!(f, "STARTING"),
            Status::Running => write!(f, "RUNNING"),
            Status::Stopping => write!(f, "STOPPING"),
            Status::Error => write!(f, "ERROR"),
        }
    }
}

impl Status {
    /// Check if a status transition is valid according to the state machine.
    ///
    /// # Examples
    ///
    /// ```
    /// use fleet_serve::service::Status;
    ///
    /// assert!(Status::Stopped.is_valid_transition(Status::Starting));
    /// assert!(Status::Starting.is_valid_transition(Status::Error));
    /// assert!(!Status::Stopped.is_valid_transition(Status::Running)); // Must go through Starting
    /// ```
    pub fn is_valid_transition(&self, to: Status) -> bool {
        use Status::*;
        match (self, to) {
            (Stopped, Starting) => true,

            (Starting, Running) => true,
            (Starting, Error) => true,
            // Start aborted before anything was launched
            (Starting, Stopped) => true,

            (Running, Stopping) => true,
            // Reconciliation found the process gone
            (Running, Stopped) => true,

            (Stopping, Stopped) => true,
            (Stopping, Error) => true,

            // Retry, or clean up what is left
            (Error, Starting) => true,
            (Error, Stopping) => true,
            (Error, Stopped) => true,

            (s1, s2) if *s1 == s2 => true,

            _ => false,
        }
    }

    /// A process may exist on the host in this state.
    pub fn is_live(&self) -> bool {
        matches!(self, Status::Starting | Status::Running | Status::Stopping)
    }

    /// Start requests are rejected in these states.
    pub fn blocks_start(&self) -> bool {
        matches!(self, Status::Starting | Status::Running)
    }
}

/// How the launch command reached the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LaunchPath {
    /// Inside the host's persistent session and its job container.
    Session,
    /// One-shot command channel with an inline activation prefix.
    Channel,
}

impl fmt::Display for LaunchPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LaunchPath::Session => write!(f, "session"),
            LaunchPath::Channel => write!(f, "channel"),
        }
    }
}

/// Desired parameters plus live state of one inference server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagedService {
    pub spec: ServiceSpec,
    pub status: Status,
    pub pid: Option<u32>,
    pub port: Option<u16>,
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub launched_via: Option<LaunchPath>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_path: Option<String>,
}

impl ManagedService {
    pub fn new(spec: ServiceSpec) -> Self {
        Self {
            spec,
            status: Status::Stopped,
            pid: None,
            port: None,
            started_at: None,
            updated_at: Utc::now(),
            last_error: None,
            launched_via: None,
            log_path: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.spec.id
    }

    pub fn host(&self) -> &str {
        &self.spec.host
    }

    /// RUNNING and STOPPING carry both pid and port; STOPPED carries neither.
    pub fn check_invariant(&self) -> bool {
        match self.status {
            Status::Running | Status::Stopping => self.pid.is_some() && self.port.is_some(),
            Status::Stopped => self.pid.is_none() && self.port.is_none(),
            Status::Starting | Status::Error => true,
        }
    }
}

/// Atomic state transition bundling status change with runtime field updates.
///
/// Applying a transition is the only way the orchestrator changes a
/// service's status, so pid/port always move together with it.
#[derive(Debug, Clone, PartialEq)]
pub struct StateTransition {
    pub status: Status,
    pub pid: Option<u32>,
    pub port: Option<u16>,
    pub launched_via: Option<LaunchPath>,
    pub log_path: Option<String>,
    pub error: Option<String>,
    /// Clear pid, port and launch details
    pub clear_runtime: bool,
}

impl StateTransition {
    fn to(status: Status) -> Self {
        Self {
            status,
            pid: None,
            port: None,
            launched_via: None,
            log_path: None,
            error: None,
            clear_runtime: false,
        }
    }

    /// Create a transition to Starting status, forgetting any previous run
    pub fn starting() -> Self {
        Self {
            clear_runtime: true,
            ..Self::to(Status::Starting)
        }
    }

    /// Stay in Starting and record the leased port
    pub fn port_leased(port: u16) -> Self {
        Self {
            port: Some(port),
            ..Self::to(Status::Starting)
        }
    }

    /// Stay in Starting and record what was launched
    pub fn launched(pid: u32, via: LaunchPath, log_path: impl Into<String>) -> Self {
        Self {
            pid: Some(pid),
            launched_via: Some(via),
            log_path: Some(log_path.into()),
            ..Self::to(Status::Starting)
        }
    }

    pub fn running() -> Self {
        Self::to(Status::Running)
    }

    pub fn stopping() -> Self {
        Self::to(Status::Stopping)
    }

    /// Create a transition to Stopped status (clears pid and port)
    pub fn stopped() -> Self {
        Self {
            clear_runtime: true,
            ..Self::to(Status::Stopped)
        }
    }

    /// Create a transition to Error, keeping pid and port for diagnosis
    pub fn error(reason: impl Into<String>) -> Self {
        Self {
            error: Some(reason.into()),
            ..Self::to(Status::Error)
        }
    }

    /// Validate this transition from the given current status.
    pub fn validate(&self, service: &str, from: Status) -> Result<()> {
        if !from.is_valid_transition(self.status) {
            return Err(Error::InvalidTransition {
                service: service.to_string(),
                from,
                to: self.status,
            });
        }
        Ok(())
    }

    /// Apply to a service record. Callers validate first.
    pub fn apply(&self, service: &mut ManagedService) {
        let now = Utc::now();
        if self.clear_runtime {
            service.pid = None;
            service.port = None;
            service.launched_via = None;
            service.started_at = None;
        }
        if self.pid.is_some() {
            service.pid = self.pid;
        }
        if self.port.is_some() {
            service.port = self.port;
        }
        if self.launched_via.is_some() {
            service.launched_via = self.launched_via;
        }
        if self.log_path.is_some() {
            service.log_path = self.log_path.clone();
        }
        match self.status {
            Status::Starting if self.clear_runtime => service.last_error = None,
            Status::Running if service.status != Status::Running => service.started_at = Some(now),
            Status::Error => service.last_error = self.error.clone(),
            _ => {}
        }
        service.status = self.status;
        service.updated_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> ManagedService {
        ManagedService::new(ServiceSpec::new("qwen", "gpu-a", "/models/qwen"))
    }

    #[test]
    fn test_valid_transitions() {
        use Status::*;
        assert!(Stopped.is_valid_transition(Starting));
        assert!(Starting.is_valid_transition(Running));
        assert!(Running.is_valid_transition(Stopping));
        assert!(Stopping.is_valid_transition(Stopped));
        assert!(Stopping.is_valid_transition(Error));
        assert!(Running.is_valid_transition(Stopped));
        assert!(Error.is_valid_transition(Starting));
    }

    #[test]
    fn test_invalid_transitions() {
        use Status::*;
        assert!(!Stopped.is_valid_transition(Running));
        assert!(!Stopped.is_valid_transition(Stopping));
        assert!(!Running.is_valid_transition(Starting));
        assert!(!Stopping.is_valid_transition(Running));
        assert!(!Running.is_valid_transition(Error));
    }

    #[test]
    fn full_lifecycle_keeps_invariant() {
        let mut svc = service();
        assert!(svc.check_invariant());

        for t in [
            StateTransition::starting(),
            StateTransition::port_leased(8001),
            StateTransition::launched(4242, LaunchPath::Session, "/tmp/fleet_qwen_8001.log"),
            StateTransition::running(),
        ] {
            t.validate(svc.id(), svc.status).unwrap();
            t.apply(&mut svc);
            assert!(svc.check_invariant(), "{:?}", svc);
        }
        assert_eq!(svc.status, Status::Running);
        assert_eq!((svc.pid, svc.port), (Some(4242), Some(8001)));
        assert!(svc.started_at.is_some());

        StateTransition::stopping().apply(&mut svc);
        assert!(svc.check_invariant());
        StateTransition::stopped().apply(&mut svc);
        assert!(svc.check_invariant());
        assert_eq!((svc.pid, svc.port, svc.started_at), (None, None, None));
        assert_eq!(svc.log_path.as_deref(), Some("/tmp/fleet_qwen_8001.log"));
    }

    #[test]
    fn error_keeps_pid_and_port() {
        let mut svc = service();
        StateTransition::starting().apply(&mut svc);
        StateTransition::port_leased(8000).apply(&mut svc);
        StateTransition::launched(77, LaunchPath::Channel, "/tmp/x.log").apply(&mut svc);
        StateTransition::error("port never bound").apply(&mut svc);

        assert_eq!(svc.status, Status::Error);
        assert_eq!((svc.pid, svc.port), (Some(77), Some(8000)));
        assert_eq!(svc.last_error.as_deref(), Some("port never bound"));

        StateTransition::starting().apply(&mut svc);
        assert_eq!(svc.last_error, None);
        assert_eq!(svc.pid, None);
    }

    #[test]
    fn validate_reports_invalid_transition() {
        let err = StateTransition::running()
            .validate("qwen", Status::Stopped)
            .unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidTransition {
                from: Status::Stopped,
                to: Status::Running,
                ..
            }
        ));
    }

    #[test]
    fn status_serializes_uppercase() {
        assert_eq!(serde_json::to_string(&Status::Running).unwrap(), "\"RUNNING\"");
        let parsed: Status = serde_json::from_str("\"STOPPING\"").unwrap();
        assert_eq!(parsed, Status::Stopping);
    }
}
