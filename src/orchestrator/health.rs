use super::core::LOG_TAIL_LINES;
use super::Orchestrator;
use crate::config::RemoteHost;
use crate::error::{Error, Result};
use crate::service::{CommandRoute, RemoteProcess};
use std::time::Duration;
use tokio::time::Instant;

enum Outcome {
    Healthy,
    Exited,
    Ceiling,
}

/// Bounded wait for a freshly launched server to come up.
///
/// Each round asks, over the pooled channel, whether the pid is still alive
/// and whether the port is bound. Success is the first round where both
/// hold. The wait ends early when the process disappears and never runs past
/// the ceiling, however long single commands take.
pub(super) struct HealthWaiter<'a> {
    orchestrator: &'a Orchestrator,
    interval: Duration,
    ceiling: Duration,
}

impl<'a> HealthWaiter<'a> {
    pub fn new(orchestrator: &'a Orchestrator) -> Self {
        let timeouts = &orchestrator.config.timeouts;
        Self {
            orchestrator,
            interval: timeouts.health_interval,
            ceiling: timeouts.health_ceiling,
        }
    }

    #[tracing::instrument(skip(self, host), fields(host = %host.name))]
    pub async fn wait(
        &self,
        host: &RemoteHost,
        service: &str,
        pid: u32,
        port: u16,
        log_path: &str,
    ) -> Result<()> {
        let cancel = self.orchestrator.child_token();
        let deadline = Instant::now() + self.ceiling;

        let outcome = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(Error::Cancelled(format!("health wait for '{}'", service)));
            }
            _ = tokio::time::sleep_until(deadline) => Outcome::Ceiling,
            outcome = self.poll(host, pid, port) => outcome,
        };

        let reason = match outcome {
            Outcome::Healthy => return Ok(()),
            Outcome::Exited => format!("process {} exited before binding port {}", pid, port),
            Outcome::Ceiling => format!(
                "port {} not bound by pid {} within {:?}",
                port, pid, self.ceiling
            ),
        };
        tracing::warn!("'{}' unhealthy: {}", service, reason);

        Err(Error::HealthCheckTimeout {
            service: service.to_string(),
            reason,
            log_tail: self.log_tail(host, log_path).await,
        })
    }

    /// Poll until healthy or the process is gone. Transport failures count
    /// as "not yet" and are retried next round.
    async fn poll(&self, host: &RemoteHost, pid: u32, port: u16) -> Outcome {
        let timeout = self.orchestrator.config.timeouts.command;
        let mut round = 0u32;
        loop {
            round += 1;
            let mut route = CommandRoute::Channel {
                runner: self.orchestrator.runner.as_ref(),
                host,
            };
            let mut process = RemoteProcess::new(&mut route, timeout);

            match process.is_alive(pid).await {
                Ok(false) => return Outcome::Exited,
                Ok(true) => match process.is_port_bound(port).await {
                    Ok(true) => {
                        tracing::debug!("pid {} bound port {} after {} round(s)", pid, port, round);
                        return Outcome::Healthy;
                    }
                    Ok(false) => tracing::debug!("Round {}: port {} not bound yet", round, port),
                    Err(e) => tracing::debug!("Round {}: port check failed: {}", round, e),
                },
                Err(e) => tracing::debug!("Round {}: liveness check failed: {}", round, e),
            }

            tokio::time::sleep(self.interval).await;
        }
    }

    async fn log_tail(&self, host: &RemoteHost, log_path: &str) -> Option<String> {
        let mut route = CommandRoute::Channel {
            runner: self.orchestrator.runner.as_ref(),
            host,
        };
        match RemoteProcess::new(&mut route, self.orchestrator.config.timeouts.command)
            .tail(log_path, LOG_TAIL_LINES)
            .await
        {
            Ok(tail) if !tail.trim().is_empty() => Some(tail),
            Ok(_) => None,
            Err(e) => {
                tracing::debug!("Could not read {}: {}", log_path, e);
                None
            }
        }
    }
}
