//! Remote command transport.
//!
//! Three seams sit here:
//!
//! - [`Connector`] opens an authenticated [`Connection`] to a [`RemoteHost`]
//! - [`Connection`] runs one command to completion or opens an interactive
//!   [`ShellChannel`] (a pseudo-terminal)
//! - [`RemoteRunner`] is the stateless Remote Command Channel used by the
//!   orchestrator; [`ChannelPool`] implements it over pooled connections
//!
//! The SSH implementation lives in [`ssh`]. Runners never return `Err`:
//! every failure is folded into a [`CommandOutput`] carrying
//! [`FAILURE_EXIT_CODE`] and the error text in `stderr`.

mod pool;
pub mod ssh;

pub use pool::ChannelPool;
pub use ssh::SshConnector;

use crate::config::RemoteHost;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Exit code reported when the command never ran to completion.
pub const FAILURE_EXIT_CODE: i32 = -1;

/// Transport-level failures. Never crosses the runner boundary as an `Err`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("connection closed: {0}")]
    Closed(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("key error: {0}")]
    Key(String),

    /// A failure already folded into a [`CommandOutput`], carried back out.
    #[error("{0}")]
    Failed(String),
}

/// Result of one remote command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn new(exit_code: i32, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        }
    }

    pub fn ok(stdout: impl Into<String>) -> Self {
        Self::new(0, stdout, "")
    }

    /// Sentinel result for a command that could not be run.
    pub fn failure(error: impl fmt::Display) -> Self {
        Self::new(FAILURE_EXIT_CODE, "", error.to_string())
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// True when the transport failed, as opposed to the command.
    pub fn is_transport_failure(&self) -> bool {
        self.exit_code == FAILURE_EXIT_CODE
    }

    /// Non-empty trimmed stdout lines.
    pub fn lines(&self) -> impl DoubleEndedIterator<Item = &str> + '_ {
        self.stdout.lines().map(str::trim).filter(|l| !l.is_empty())
    }

    /// The transport failure behind this output, if any.
    pub fn transport_error(&self) -> Option<TransportError> {
        self.is_transport_failure()
            .then(|| TransportError::Failed(self.error_text()))
    }

    /// Best text to show a human when the command failed.
    pub fn error_text(&self) -> String {
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            stderr.to_string()
        } else if !self.stdout.trim().is_empty() {
            self.stdout.trim().to_string()
        } else {
            format!("exit code {}", self.exit_code)
        }
    }
}

/// An authenticated connection to one host.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Run `command` on a fresh exec channel and wait for it to finish.
    async fn exec(&self, command: &str) -> Result<CommandOutput, TransportError>;

    /// Open an interactive shell on a pseudo-terminal.
    async fn open_shell(&self) -> Result<Box<dyn ShellChannel>, TransportError>;

    /// Cheap round trip used to decide whether a pooled connection is usable.
    async fn probe(&self) -> bool;

    async fn close(&self);
}

/// Opens connections. Swapped for a fake in tests.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, host: &RemoteHost) -> Result<Arc<dyn Connection>, TransportError>;
}

/// A live interactive shell.
#[async_trait]
pub trait ShellChannel: Send {
    /// Write raw text to the terminal.
    async fn send(&mut self, data: &str) -> Result<(), TransportError>;

    /// Read what arrives within `wait`. `Ok(None)` means nothing arrived.
    async fn recv(&mut self, wait: Duration) -> Result<Option<String>, TransportError>;

    async fn close(&mut self);
}

/// The Remote Command Channel: run one command on a host, always get a tuple back.
#[async_trait]
pub trait RemoteRunner: Send + Sync {
    async fn run(&self, host: &RemoteHost, command: &str, timeout: Duration) -> CommandOutput;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_uses_sentinel_exit_code() {
        let out = CommandOutput::failure(TransportError::Timeout("10s".into()));
        assert_eq!(out.exit_code, -1);
        assert!(out.is_transport_failure());
        assert!(!out.success());
        assert_eq!(out.stderr, "timed out: 10s");
    }

    #[test]
    fn lines_skip_blanks() {
        let out = CommandOutput::ok("  \n4242\n\n  done \n");
        let lines: Vec<_> = out.lines().collect();
        assert_eq!(lines, vec!["4242", "done"]);
    }

    #[test]
    fn lines_can_be_read_from_the_end() {
        let out = CommandOutput::ok("/usr/bin/conda\nnoise\n/opt/miniconda3/bin/conda\n\n");
        assert_eq!(out.lines().next_back(), Some("/opt/miniconda3/bin/conda"));
        assert_eq!(
            out.lines().rev().find(|l| l.starts_with('/')),
            Some("/opt/miniconda3/bin/conda")
        );
    }

    #[test]
    fn error_text_prefers_stderr() {
        assert_eq!(CommandOutput::new(1, "out", "err").error_text(), "err");
        assert_eq!(CommandOutput::new(1, "out", " ").error_text(), "out");
        assert_eq!(CommandOutput::new(2, "", "").error_text(), "exit code 2");
    }
}
