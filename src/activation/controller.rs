use super::locate::{activate_command, env_labels, locate_command, parse_env_list, resolve_env, CondaEnv};
use super::signals::{evaluate, read_signals, verification_command, SignalReading};
use super::{ActivationRecord, Signal};
use crate::config::{ActivationConfig, Strictness};
use crate::error::{Error, Result};
use crate::session::PersistentSession;
use crate::transport::CommandOutput;
use chrono::Utc;
use std::time::Duration;
use tokio::time::Instant;

/// Drives environment activation inside a session and caches the result on
/// the session.
///
/// Failures are reported, never retried here; the caller decides whether to
/// try again.
pub struct ActivationController {
    cache_ttl: Duration,
    strictness: Strictness,
    tool_paths: Vec<String>,
    command_timeout: Duration,
}

impl ActivationController {
    pub fn new(config: &ActivationConfig, command_timeout: Duration) -> Self {
        Self {
            cache_ttl: config.cache_ttl,
            strictness: config.strictness,
            tool_paths: config.tool_paths.clone(),
            command_timeout,
        }
    }

    pub fn strictness(&self) -> Strictness {
        self.strictness
    }

    pub fn tool_paths(&self) -> &[String] {
        &self.tool_paths
    }

    /// Make `env` the session's active environment.
    ///
    /// A fresh cached activation of the same environment is trusted only
    /// after a cheap re-check of the prompt and environment variable.
    #[tracing::instrument(skip(self, session), fields(host = %session.host().name))]
    pub async fn ensure(&self, session: &mut PersistentSession, env: &str) -> Result<ActivationRecord> {
        let cached = session
            .activation()
            .filter(|r| r.env_name == env && r.is_fresh())
            .cloned();

        if let Some(record) = cached {
            let readings = self.verify(session, None, env).await;
            if evaluate(&readings, Strictness::Any) {
                tracing::debug!("Cached activation of '{}' still holds", env);
                return Ok(record);
            }
            tracing::info!(
                "Cached activation of '{}' drifted ({}); activating again",
                env,
                describe(&readings)
            );
            session.clear_activation();
        }

        session.begin_activation();
        match self.activate(session, env).await {
            Ok(record) => {
                session.record_activation(record.clone());
                Ok(record)
            }
            Err(e) => {
                session.clear_activation();
                Err(e)
            }
        }
    }

    async fn activate(&self, session: &mut PersistentSession, env: &str) -> Result<ActivationRecord> {
        let tool = self.locate_tool(session).await?;
        let envs = self.list_environments(session, &tool).await?;
        let resolved = resolve_env(&envs, env).ok_or_else(|| Error::Activation {
            env: env.to_string(),
            signals: vec![format!(
                "environment not found; available: {}",
                env_labels(&envs).join(", ")
            )],
        })?;

        tracing::debug!("Activating '{}' with {}", resolved.target, tool);
        let out = self
            .run(session, &activate_command(&tool, &resolved.target))
            .await?;
        if !out.success() {
            return Err(Error::Activation {
                env: env.to_string(),
                signals: vec![format!("activation command failed: {}", out.error_text())],
            });
        }

        let readings = self.verify(session, Some(&tool), env).await;
        if !evaluate(&readings, self.strictness) {
            tracing::warn!(
                "Activation of '{}' on {} not confirmed: {}",
                env,
                session.host().name,
                describe(&readings)
            );
            return Err(Error::Activation {
                env: env.to_string(),
                signals: readings.iter().map(ToString::to_string).collect(),
            });
        }

        let method = readings
            .iter()
            .find(|r| r.matched)
            .map(|r| r.signal)
            .unwrap_or(Signal::Prompt);

        Ok(ActivationRecord {
            env_name: env.to_string(),
            env_path: resolved.path,
            verified_at: Utc::now(),
            method,
            expires_at: Instant::now() + self.cache_ttl,
        })
    }

    /// Path of the first usable conda binary on the host.
    pub async fn locate_tool(&self, session: &mut PersistentSession) -> Result<String> {
        let out = self.run(session, &locate_command(&self.tool_paths)).await?;
        let found = out.lines().rev().find(|l| l.starts_with('/')).map(str::to_string);
        found.ok_or_else(|| Error::Session {
            host: session.host().name.clone(),
            reason: format!(
                "conda not found on PATH or in {} known locations",
                self.tool_paths.len()
            ),
        })
    }

    pub async fn list_environments(
        &self,
        session: &mut PersistentSession,
        tool: &str,
    ) -> Result<Vec<CondaEnv>> {
        let cmd = format!("{} env list", shell_escape::escape(tool.into()));
        let out = self.run(session, &cmd).await?;
        if !out.success() {
            return Err(Error::Session {
                host: session.host().name.clone(),
                reason: format!("`conda env list` failed: {}", out.error_text()),
            });
        }
        Ok(parse_env_list(&out.stdout))
    }

    /// Read every available signal for `expected`. Passing the tool adds the
    /// `conda info` signal.
    pub async fn verify(
        &self,
        session: &mut PersistentSession,
        tool: Option<&str>,
        expected: &str,
    ) -> Vec<SignalReading> {
        let out = session
            .execute(&verification_command(tool), self.command_timeout)
            .await;
        read_signals(
            &out.stdout,
            session.last_prompt(),
            expected,
            session.dialect(),
            tool.is_some(),
        )
    }

    async fn run(&self, session: &mut PersistentSession, command: &str) -> Result<CommandOutput> {
        let out = session.execute(command, self.command_timeout).await;
        if out.is_transport_failure() {
            return Err(Error::Session {
                host: session.host().name.clone(),
                reason: out.error_text(),
            });
        }
        Ok(out)
    }
}

fn describe(readings: &[SignalReading]) -> String {
    readings
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
