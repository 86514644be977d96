//! Recovering the pid of a freshly launched server.
//!
//! Each [`PidStrategy`] tries one source; [`resolve_pid`] walks them in
//! order and stops at the first hit.

use super::remote::CommandRoute;
use crate::port::owners::{owner_command, parse_owners};
use async_trait::async_trait;
use std::time::Duration;

/// What a strategy may look at.
#[derive(Debug, Clone)]
pub struct PidContext<'a> {
    /// Stdout of the launch command.
    pub launch_output: &'a str,
    pub pid_file: &'a str,
    pub port: u16,
    pub timeout: Duration,
}

#[async_trait]
pub trait PidStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    async fn resolve(&self, route: &mut CommandRoute<'_>, ctx: &PidContext<'_>) -> Option<u32>;
}

/// Parse a pid from text: the last line that is a bare number above 1.
pub fn parse_pid(text: &str) -> Option<u32> {
    text.lines()
        .rev()
        .map(str::trim)
        .find_map(|l| l.parse::<u32>().ok().filter(|pid| *pid > 1))
}

/// The `echo $PID` the launch command prints.
pub struct EchoedStdout;

#[async_trait]
impl PidStrategy for EchoedStdout {
    fn name(&self) -> &'static str {
        "echoed stdout"
    }

    async fn resolve(&self, _route: &mut CommandRoute<'_>, ctx: &PidContext<'_>) -> Option<u32> {
        parse_pid(ctx.launch_output)
    }
}

/// The pid file the launch command also writes.
pub struct PidFile;

#[async_trait]
impl PidStrategy for PidFile {
    fn name(&self) -> &'static str {
        "pid file"
    }

    async fn resolve(&self, route: &mut CommandRoute<'_>, ctx: &PidContext<'_>) -> Option<u32> {
        let cmd = format!(
            "cat {} 2>/dev/null",
            shell_escape::escape(ctx.pid_file.into())
        );
        let out = route.run(&cmd, ctx.timeout).await;
        out.success().then(|| parse_pid(&out.stdout)).flatten()
    }
}

/// Whoever listens on the allocated port. Only works once the server has
/// bound it.
pub struct PortOwner;

#[async_trait]
impl PidStrategy for PortOwner {
    fn name(&self) -> &'static str {
        "port owner"
    }

    async fn resolve(&self, route: &mut CommandRoute<'_>, ctx: &PidContext<'_>) -> Option<u32> {
        let out = route.run(&owner_command(ctx.port), ctx.timeout).await;
        if out.is_transport_failure() {
            return None;
        }
        parse_owners(&out.stdout)
            .into_iter()
            .map(|p| p.pid)
            .find(|pid| *pid > 1)
    }
}

pub fn default_strategies() -> Vec<Box<dyn PidStrategy>> {
    vec![Box::new(EchoedStdout), Box::new(PidFile), Box::new(PortOwner)]
}

/// Try each strategy in order. Returns the pid and the strategy that found it.
pub async fn resolve_pid(
    strategies: &[Box<dyn PidStrategy>],
    route: &mut CommandRoute<'_>,
    ctx: &PidContext<'_>,
) -> Option<(u32, &'static str)> {
    for strategy in strategies {
        if let Some(pid) = strategy.resolve(route, ctx).await {
            tracing::debug!("Resolved pid {} via {}", pid, strategy.name());
            return Some((pid, strategy.name()));
        }
        tracing::debug!("No pid from {}", strategy.name());
    }
    None
}
