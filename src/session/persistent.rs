//! One long-lived interactive shell per host.

use super::dialect::{strip_ansi, Sentinel, ShellDialect};
use super::{SessionPhase, SessionStatus};
use crate::activation::{ActivationRecord, ActivationState};
use crate::config::RemoteHost;
use crate::error::{Error, Result};
use crate::transport::{CommandOutput, Connection, Connector, ShellChannel, TransportError};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Longest single wait on the shell before re-checking the deadline.
const READ_SLICE: Duration = Duration::from_millis(250);

/// Quiet period that marks the end of unsolicited output (banners, redraws).
const SETTLE_QUIET: Duration = Duration::from_millis(300);

/// Upper bound on how long `settle` keeps reading.
const SETTLE_MAX: Duration = Duration::from_secs(3);

/// Behaviour switches for a session's connect protocol.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Try `su -` when the host has an escalation credential.
    pub escalate: bool,
    /// Start and attach a screen session after connecting.
    pub job_container: bool,
    /// Wait for password and shell prompts.
    pub prompt_wait: Duration,
    /// Timeout for the short bookkeeping commands of the connect protocol.
    pub command_timeout: Duration,
    pub idle_timeout: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            escalate: true,
            job_container: true,
            prompt_wait: Duration::from_secs(5),
            command_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(30 * 60),
        }
    }
}

struct Link {
    connection: Arc<dyn Connection>,
    shell: Box<dyn ShellChannel>,
}

/// A persistent interactive shell bound to one host.
///
/// The session walks `Disconnected -> PtyOpen -> PrivilegeChecked ->
/// JobContainerReady`. Privilege escalation and the job container are
/// best effort: a session that could not reach root or could not attach
/// screen is still usable once it has passed `PrivilegeChecked`.
///
/// `execute` never returns `Err`; transport failures come back as a
/// [`CommandOutput`] with exit code -1 and mark the session broken so the
/// registry replaces it on next use.
pub struct PersistentSession {
    id: String,
    host: RemoteHost,
    dialect: Arc<dyn ShellDialect>,
    options: SessionOptions,
    phase: SessionPhase,
    link: Option<Link>,
    privileged: bool,
    job_container: Option<String>,
    activation_state: ActivationState,
    activation: Option<ActivationRecord>,
    last_prompt: Option<String>,
    created_at: DateTime<Utc>,
    last_activity: DateTime<Utc>,
    last_used: Instant,
    broken: bool,
}

impl PersistentSession {
    pub fn new(host: RemoteHost, dialect: Arc<dyn ShellDialect>, options: SessionOptions) -> Self {
        let now = Utc::now();
        Self {
            id: generate_id(),
            host,
            dialect,
            options,
            phase: SessionPhase::Disconnected,
            link: None,
            privileged: false,
            job_container: None,
            activation_state: ActivationState::Unknown,
            activation: None,
            last_prompt: None,
            created_at: now,
            last_activity: now,
            last_used: Instant::now(),
            broken: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn host(&self) -> &RemoteHost {
        &self.host
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn is_privileged(&self) -> bool {
        self.privileged
    }

    pub fn job_container(&self) -> Option<&str> {
        self.job_container.as_deref()
    }

    pub fn dialect(&self) -> &dyn ShellDialect {
        self.dialect.as_ref()
    }

    /// Prompt seen in front of the most recent command echo.
    pub fn last_prompt(&self) -> Option<&str> {
        self.last_prompt.as_deref()
    }

    /// Connected, past the privilege check, and not marked broken.
    pub fn is_live(&self) -> bool {
        self.link.is_some() && !self.broken && self.phase.is_usable()
    }

    pub fn is_idle_expired(&self) -> bool {
        self.last_used.elapsed() >= self.options.idle_timeout
    }

    pub fn idle_for(&self) -> Duration {
        self.last_used.elapsed()
    }

    pub fn activation_state(&self) -> ActivationState {
        self.activation_state
    }

    pub fn activation(&self) -> Option<&ActivationRecord> {
        self.activation.as_ref()
    }

    pub(crate) fn begin_activation(&mut self) {
        self.activation_state = ActivationState::Activating;
    }

    pub(crate) fn record_activation(&mut self, record: ActivationRecord) {
        tracing::info!(
            "Session {} on {}: environment '{}' verified via {}",
            self.id,
            self.host.name,
            record.env_name,
            record.method
        );
        self.activation = Some(record);
        self.activation_state = ActivationState::Verified;
    }

    pub(crate) fn clear_activation(&mut self) {
        if let Some(old) = self.activation.take() {
            tracing::debug!(
                "Session {} on {}: dropping cached activation of '{}'",
                self.id,
                self.host.name,
                old.env_name
            );
        }
        self.activation_state = ActivationState::Unknown;
    }

    /// Run the connect protocol: PTY, privilege check, job container.
    #[tracing::instrument(skip(self, connector), fields(host = %self.host.name))]
    pub async fn connect(&mut self, connector: &dyn Connector) -> Result<()> {
        if self.link.is_some() {
            self.disconnect().await;
        }

        let connection = connector
            .connect(&self.host)
            .await
            .map_err(|e| Error::transport(&self.host.name, e))?;
        let shell = match connection.open_shell().await {
            Ok(shell) => shell,
            Err(e) => {
                connection.close().await;
                return Err(Error::transport(&self.host.name, e));
            }
        };

        self.link = Some(Link { connection, shell });
        self.broken = false;
        self.touch();
        self.advance(SessionPhase::PtyOpen)?;
        self.settle().await;

        let escalation = if self.options.escalate {
            self.host.escalation_password().map(str::to_string)
        } else {
            None
        };
        self.privileged = match escalation {
            Some(password) => self.escalate(&password).await,
            None => self.confirm_root().await,
        };
        if self.broken {
            return Err(self.broken_error("privilege check"));
        }
        self.advance(SessionPhase::PrivilegeChecked)?;

        if self.options.job_container {
            self.job_container = self.enter_job_container().await;
            if self.broken {
                return Err(self.broken_error("job container setup"));
            }
            if self.job_container.is_some() {
                self.advance(SessionPhase::JobContainerReady)?;
            }
        }

        tracing::info!(
            "Session {} ready on {} (privileged: {}, job container: {})",
            self.id,
            self.host.name,
            self.privileged,
            self.job_container.as_deref().unwrap_or("none")
        );
        Ok(())
    }

    /// Escalate with an explicit credential after connect.
    pub async fn escalate_with(&mut self, password: &str) -> bool {
        if !self.is_live() {
            return false;
        }
        if self.privileged {
            return true;
        }
        self.privileged = self.escalate(password).await;
        self.privileged
    }

    fn advance(&mut self, to: SessionPhase) -> Result<()> {
        if !self.phase.can_advance_to(to) {
            return Err(Error::Session {
                host: self.host.name.clone(),
                reason: format!("invalid session transition {} -> {}", self.phase, to),
            });
        }
        tracing::debug!("Session {}: {} -> {}", self.id, self.phase, to);
        self.phase = to;
        Ok(())
    }

    fn broken_error(&self, during: &str) -> Error {
        Error::Session {
            host: self.host.name.clone(),
            reason: format!("shell closed during {}", during),
        }
    }

    /// Run one logical command and wait for its completion marker.
    pub async fn execute(&mut self, command: &str, timeout: Duration) -> CommandOutput {
        if self.link.is_none() || self.broken {
            return CommandOutput::failure(format!("session on {} is not connected", self.host.name));
        }

        let sentinel = Sentinel::generate();
        let marker_line = sentinel.command();
        self.drain().await;
        self.last_prompt = None;

        if let Err(e) = self.send(&format!("{}\n{}\n", command, marker_line)).await {
            return CommandOutput::failure(e);
        }

        let deadline = Instant::now() + timeout;
        let mut raw = String::new();
        loop {
            if let Some((end, exit_code)) = sentinel.find(&raw) {
                let body = &raw[..end];
                if let Some(prompt) = self.dialect.prompt_before_echo(body, command) {
                    self.last_prompt = Some(prompt);
                }
                self.touch();
                let output = self.dialect.clean_output(body, &[command, &marker_line]);
                return CommandOutput::new(exit_code, output, "");
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                // Interrupt whatever still holds the foreground.
                if let Err(e) = self.send("\x03").await {
                    tracing::debug!("Interrupt on {} not delivered: {}", self.host.name, e);
                }
                let partial = self.dialect.clean_output(&raw, &[command, &marker_line]);
                return CommandOutput::new(
                    crate::transport::FAILURE_EXIT_CODE,
                    partial,
                    format!("no completion marker within {:?}", timeout),
                );
            }

            match self.recv(remaining.min(READ_SLICE)).await {
                Ok(Some(chunk)) => raw.push_str(&chunk),
                Ok(None) => {}
                Err(e) => return CommandOutput::failure(e),
            }
        }
    }

    /// Send text without waiting for a marker (dialog input, attach commands).
    pub(crate) async fn send(&mut self, text: &str) -> std::result::Result<(), TransportError> {
        let result = match self.link.as_mut() {
            Some(link) => link.shell.send(text).await,
            None => Err(TransportError::Closed("session is not connected".to_string())),
        };
        if result.is_err() {
            self.broken = true;
        }
        result
    }

    async fn recv(&mut self, wait: Duration) -> std::result::Result<Option<String>, TransportError> {
        let result = match self.link.as_mut() {
            Some(link) => link.shell.recv(wait).await,
            None => Err(TransportError::Closed("session is not connected".to_string())),
        };
        if let Err(e) = &result {
            tracing::warn!("Session {} on {} lost its shell: {}", self.id, self.host.name, e);
            self.broken = true;
        }
        result
    }

    /// Read until `done` matches the accumulated text or `wait` elapses.
    pub(crate) async fn read_until<F>(&mut self, wait: Duration, done: F) -> (String, bool)
    where
        F: Fn(&str) -> bool,
    {
        let deadline = Instant::now() + wait;
        let mut text = String::new();
        loop {
            if done(&text) {
                return (text, true);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return (text, false);
            }
            match self.recv(remaining.min(READ_SLICE)).await {
                Ok(Some(chunk)) => text.push_str(&chunk),
                Ok(None) => {}
                Err(_) => return (text, false),
            }
        }
    }

    /// Discard output until the shell goes quiet.
    async fn settle(&mut self) -> String {
        let deadline = Instant::now() + SETTLE_MAX;
        let mut text = String::new();
        while Instant::now() < deadline {
            match self.recv(SETTLE_QUIET).await {
                Ok(Some(chunk)) => text.push_str(&chunk),
                Ok(None) | Err(_) => break,
            }
        }
        text
    }

    /// Discard anything already buffered.
    async fn drain(&mut self) {
        loop {
            match self.recv(Duration::from_millis(20)).await {
                Ok(Some(chunk)) if !chunk.is_empty() => {
                    tracing::trace!("Discarding stale shell output: {:?}", strip_ansi(&chunk));
                }
                Ok(Some(_)) => {}
                Ok(None) | Err(_) => break,
            }
        }
    }

    async fn escalate(&mut self, password: &str) -> bool {
        if self.confirm_root().await {
            return true;
        }
        if self.send("su -\n").await.is_err() {
            return false;
        }

        let dialect = self.dialect.clone();
        let (_, prompted) = self
            .read_until(self.options.prompt_wait, |t| dialect.is_password_prompt(t))
            .await;
        if !prompted {
            tracing::warn!("No password prompt from `su -` on {}", self.host.name);
            if let Err(e) = self.send("\x03").await {
                tracing::debug!("Interrupt on {} not delivered: {}", self.host.name, e);
            }
            self.settle().await;
            return self.confirm_root().await;
        }

        if self.send(&format!("{}\n", password)).await.is_err() {
            return false;
        }
        let (reply, _) = self
            .read_until(self.options.prompt_wait * 2, |t| {
                dialect.is_auth_failure(t) || dialect.is_root_prompt(t)
            })
            .await;
        if dialect.is_auth_failure(&reply) {
            tracing::warn!(
                "Privilege escalation rejected on {}; continuing unprivileged",
                self.host.name
            );
            self.settle().await;
            return false;
        }

        let confirmed = self.confirm_root().await;
        if !confirmed {
            tracing::warn!("`su -` on {} did not reach root; continuing unprivileged", self.host.name);
        }
        confirmed
    }

    async fn confirm_root(&mut self) -> bool {
        let out = self.execute("whoami", self.options.command_timeout).await;
        out.success() && out.lines().last() == Some("root")
    }

    async fn enter_job_container(&mut self) -> Option<String> {
        let name = format!("fleet_{}", &generate_id()[5..13]);
        let created = self
            .execute(&format!("screen -dmS {}", name), self.options.command_timeout)
            .await;
        if !created.success() {
            tracing::warn!(
                "Cannot create screen session on {}: {}",
                self.host.name,
                created.error_text()
            );
            return None;
        }

        if self.send(&format!("screen -r {}\n", name)).await.is_err() {
            return None;
        }
        self.settle().await;

        let check = self
            .execute("echo \"STY=$STY\"", self.options.command_timeout)
            .await;
        if check.success() && check.lines().any(|l| l.starts_with("STY=") && l.ends_with(&name)) {
            Some(name)
        } else {
            tracing::warn!("Could not attach screen session {} on {}", name, self.host.name);
            None
        }
    }

    /// Close the shell and connection. The job container is left running so
    /// servers launched inside it survive.
    pub async fn disconnect(&mut self) {
        if let Some(mut link) = self.link.take() {
            link.shell.close().await;
            link.connection.close().await;
            tracing::debug!("Session {} on {} disconnected", self.id, self.host.name);
        }
        self.phase = SessionPhase::Disconnected;
        self.privileged = false;
        self.job_container = None;
        self.last_prompt = None;
        self.clear_activation();
        self.broken = false;
    }

    /// Cheap liveness check used by the eviction sweep.
    pub async fn probe(&mut self) -> bool {
        if !self.is_live() {
            return false;
        }
        // A probe is not activity; keep the idle clock where it was.
        let (last_used, last_activity) = (self.last_used, self.last_activity);
        let out = self.execute("echo ok", Duration::from_secs(5)).await;
        self.last_used = last_used;
        self.last_activity = last_activity;
        out.success() && out.lines().last() == Some("ok")
    }

    fn touch(&mut self) {
        self.last_used = Instant::now();
        self.last_activity = Utc::now();
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            session_id: self.id.clone(),
            host: self.host.name.clone(),
            connected: self.is_live(),
            phase: self.phase,
            privileged: self.privileged,
            job_container: self.job_container.clone(),
            activation_state: self.activation_state,
            activated_env: self.activation.as_ref().map(|a| a.env_name.clone()),
            activation_valid: self.activation.as_ref().is_some_and(|a| a.is_fresh()),
            created_at: self.created_at,
            last_activity: self.last_activity,
        }
    }
}

/// Generate a new random session ID
pub fn generate_id() -> String {
    use rand::Rng;

    let mut rng = rand::thread_rng();
    let high: u64 = rng.gen();
    let low: u64 = rng.gen();

    format!("sess-{:016x}{:016x}", high, low)
}
