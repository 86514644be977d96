// Allow unused_assignments at module level because thiserror's generated code
// for struct variants triggers false positive warnings - the fields ARE used
// in the Display impl but rustc's lint pass doesn't see this.
#![allow(unused_assignments)]

use crate::transport::TransportError;
use miette::Diagnostic;
use std::io;
use thiserror::Error;

#[derive(Error, Diagnostic, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    #[diagnostic(code(fleet::config::invalid))]
    Validation(String),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Transport error on host '{host}': {source}")]
    #[diagnostic(
        code(fleet::transport::failed),
        help("The connection was discarded. Check the host is reachable and the credentials in fleet.yaml")
    )]
    Transport {
        host: String,
        #[source]
        source: TransportError,
    },

    #[error("Session error on host '{host}': {reason}")]
    #[diagnostic(code(fleet::session::failed))]
    Session { host: String, reason: String },

    #[error("Environment '{env}' could not be verified: {}", format_signals(.signals))]
    #[diagnostic(
        code(fleet::activation::unverified),
        help("None of the shell signals reported the requested environment")
    )]
    Activation { env: String, signals: Vec<String> },

    #[error("Service '{service}' failed to launch: {reason}")]
    #[diagnostic(code(fleet::service::launch_failed))]
    Launch { service: String, reason: String },

    #[error("Service '{service}' did not become healthy: {reason}")]
    #[diagnostic(
        code(fleet::service::health_timeout),
        help("Inspect the server log with: fleet logs {service}")
    )]
    HealthCheckTimeout {
        service: String,
        reason: String,
        log_tail: Option<String>,
    },

    #[error("Service '{service}' could not be torn down: {reason}")]
    #[diagnostic(
        code(fleet::service::teardown_failed),
        help("The process ignored both SIGTERM and SIGKILL; manual intervention is required")
    )]
    Teardown { service: String, reason: String },

    #[error("Service not found: {0}")]
    #[diagnostic(
        code(fleet::service::not_found),
        help("Check configured services with `fleet status`")
    )]
    ServiceNotFound(String),

    #[error("Host not found: {0}")]
    #[diagnostic(code(fleet::host::not_found), help("List configured hosts with `fleet hosts`"))]
    HostNotFound(String),

    #[error("Host '{0}' is disabled")]
    #[diagnostic(code(fleet::host::disabled))]
    HostDisabled(String),

    #[error("Service '{0}' is already running")]
    #[diagnostic(code(fleet::service::already_running))]
    AlreadyRunning(String),

    #[error("Service '{0}' is already stopped")]
    #[diagnostic(code(fleet::service::already_stopped))]
    AlreadyStopped(String),

    #[error("Another start or stop of service '{0}' is in progress")]
    #[diagnostic(code(fleet::service::busy))]
    OperationInProgress(String),

    #[error("No free port on host '{host}' in range {start}..{end}")]
    #[diagnostic(
        code(fleet::port::exhausted),
        help("Widen the port range or stop unused services on this host")
    )]
    NoPortAvailable { host: String, start: u16, end: u16 },

    #[error("Invalid PID {pid}: {reason}")]
    #[diagnostic(code(fleet::process::invalid_pid))]
    InvalidPid { pid: u32, reason: String },

    #[error("Invalid state transition for '{service}': {from} -> {to}")]
    #[diagnostic(code(fleet::service::invalid_transition))]
    InvalidTransition {
        service: String,
        from: crate::service::Status,
        to: crate::service::Status,
    },

    #[error("Operation cancelled: {0}")]
    Cancelled(String),
}

fn format_signals(signals: &[String]) -> String {
    if signals.is_empty() {
        "no signal produced an observation".to_string()
    } else {
        signals.join("; ")
    }
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn transport(host: impl Into<String>, source: TransportError) -> Self {
        Error::Transport {
            host: host.into(),
            source,
        }
    }

    /// Returns a helpful suggestion for resolving this error, if available.
    pub fn suggestion(&self) -> Option<String> {
        match self {
            Error::ServiceNotFound(_) => {
                Some("List configured services with: fleet status".to_string())
            }
            Error::HostNotFound(_) => Some("List configured hosts with: fleet hosts".to_string()),
            Error::HostDisabled(name) => Some(format!(
                "Set `enabled: true` for host '{}' in fleet.yaml",
                name
            )),
            Error::AlreadyRunning(name) => Some(format!(
                "Stop it first with: fleet stop {}",
                name
            )),
            Error::Transport { source, .. } => match source {
                TransportError::Auth(_) => Some(
                    "Check username, password/password_env or key_path for this host".to_string(),
                ),
                TransportError::Timeout(_) => Some(
                    "The host did not answer in time. Raise timeouts.connect or check the network"
                        .to_string(),
                ),
                _ => None,
            },
            Error::Activation { env, .. } => Some(format!(
                "Confirm the environment exists on the host with: fleet diagnose <host>\nThen retry: fleet activate <host> {}",
                env
            )),
            Error::HealthCheckTimeout { service, .. } | Error::Launch { service, .. } => {
                Some(format!("Inspect the server log with: fleet logs {}", service))
            }
            Error::NoPortAvailable { host, .. } => Some(format!(
                "See what is listening with: fleet ports {}",
                host
            )),
            Error::Config(msg) if msg.contains("Could not find") => {
                Some("Create a fleet.yaml or pass --config <path>".to_string())
            }
            Error::Config(_) | Error::Validation(_) => {
                Some("Validate your config with: fleet validate".to_string())
            }
            _ => None,
        }
    }

    /// Formats the error with its suggestion (if any) for user-friendly display.
    pub fn with_suggestion(&self) -> String {
        match self.suggestion() {
            Some(suggestion) => format!("{}\n\nHint: {}", self, suggestion),
            None => self.to_string(),
        }
    }

    /// Remote output attached to the error, for user-visible reports.
    pub fn remote_output(&self) -> Option<&str> {
        match self {
            Error::HealthCheckTimeout { log_tail, .. } => log_tail.as_deref(),
            _ => None,
        }
    }
}

/// Validates a PID before it is used in a remote signal command.
/// Returns Err for PID 0 (process group), PID 1 (init), or values > i32::MAX.
pub fn validate_pid(pid: u32, service_name: &str) -> Result<u32> {
    if pid == 0 {
        return Err(Error::InvalidPid {
            pid,
            reason: format!(
                "PID 0 is invalid for service '{}' (refers to process group, not a process)",
                service_name
            ),
        });
    }
    if pid == 1 {
        return Err(Error::InvalidPid {
            pid,
            reason: format!(
                "refusing to signal PID 1 (init) for service '{}'",
                service_name
            ),
        });
    }
    if pid > i32::MAX as u32 {
        return Err(Error::InvalidPid {
            pid,
            reason: format!(
                "PID {} exceeds i32::MAX for service '{}'",
                pid, service_name
            ),
        });
    }
    Ok(pid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_pid_rejects_reserved_values() {
        assert!(matches!(
            validate_pid(0, "svc"),
            Err(Error::InvalidPid { pid: 0, .. })
        ));
        assert!(matches!(
            validate_pid(1, "svc"),
            Err(Error::InvalidPid { pid: 1, .. })
        ));
        assert!(validate_pid(i32::MAX as u32 + 1, "svc").is_err());
    }

    #[test]
    fn validate_pid_accepts_ordinary_pids() {
        assert_eq!(validate_pid(2, "svc").unwrap(), 2);
        assert_eq!(validate_pid(48213, "svc").unwrap(), 48213);
        assert_eq!(validate_pid(i32::MAX as u32, "svc").unwrap(), i32::MAX as u32);
    }

    #[test]
    fn activation_error_lists_signals() {
        let err = Error::Activation {
            env: "vllm".to_string(),
            signals: vec![
                "prompt: observed 'base'".to_string(),
                "env_var: observed 'base'".to_string(),
            ],
        };
        let msg = err.to_string();
        assert!(msg.contains("vllm"));
        assert!(msg.contains("prompt: observed 'base'"));
        assert!(msg.contains("env_var"));
    }

    #[test]
    fn activation_error_without_observations() {
        let err = Error::Activation {
            env: "vllm".to_string(),
            signals: vec![],
        };
        assert!(err.to_string().contains("no signal produced an observation"));
    }

    #[test]
    fn suggestion_for_auth_failure() {
        let err = Error::transport("gpu-a", TransportError::Auth("rejected".to_string()));
        let hint = err.suggestion().unwrap();
        assert!(hint.contains("password"));
        assert!(err.with_suggestion().contains("Hint:"));
    }

    #[test]
    fn health_timeout_exposes_log_tail() {
        let err = Error::HealthCheckTimeout {
            service: "qwen".to_string(),
            reason: "port never bound".to_string(),
            log_tail: Some("CUDA out of memory".to_string()),
        };
        assert_eq!(err.remote_output(), Some("CUDA out of memory"));
    }
}
