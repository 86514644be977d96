//! Remote process probes and signals.

use crate::config::RemoteHost;
use crate::error::{validate_pid, Error, Result};
use crate::port::owners::{bound_check_command, owner_command, parse_owners};
use crate::port::PortUsage;
use crate::session::SessionGuard;
use crate::transport::{CommandOutput, RemoteRunner};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use std::time::Duration;

/// Where a command runs: the stateless channel, or a locked session whose
/// identity (often root) may be needed to see or signal the server.
pub enum CommandRoute<'a> {
    Channel {
        runner: &'a dyn RemoteRunner,
        host: &'a RemoteHost,
    },
    Session(&'a mut SessionGuard),
}

impl CommandRoute<'_> {
    pub fn host_name(&self) -> &str {
        match self {
            CommandRoute::Channel { host, .. } => &host.name,
            CommandRoute::Session(session) => &session.host().name,
        }
    }

    pub fn is_session(&self) -> bool {
        matches!(self, CommandRoute::Session(_))
    }

    pub async fn run(&mut self, command: &str, timeout: Duration) -> CommandOutput {
        match self {
            CommandRoute::Channel { runner, host } => runner.run(host, command, timeout).await,
            CommandRoute::Session(session) => session.execute(command, timeout).await,
        }
    }

    /// Run and turn a transport failure into an error.
    async fn run_checked(&mut self, command: &str, timeout: Duration) -> Result<CommandOutput> {
        let out = self.run(command, timeout).await;
        match out.transport_error() {
            Some(e) => Err(Error::transport(self.host_name(), e)),
            None => Ok(out),
        }
    }
}

pub fn alive_command(pid: u32) -> String {
    format!("kill -0 {pid} 2>/dev/null || ps -p {pid} >/dev/null 2>&1", pid = pid)
}

pub fn tail_command(path: &str, lines: usize) -> String {
    format!(
        "tail -n {} {} 2>/dev/null",
        lines,
        shell_escape::escape(path.into())
    )
}

/// Lists candidate inference server processes.
pub const DISCOVER_COMMAND: &str =
    "ps -eo pid=,args= | grep -E 'vllm|api_server' | grep -v grep";

/// Probes and signals for processes on one host.
pub struct RemoteProcess<'r, 'a> {
    route: &'r mut CommandRoute<'a>,
    timeout: Duration,
}

impl<'r, 'a> RemoteProcess<'r, 'a> {
    pub fn new(route: &'r mut CommandRoute<'a>, timeout: Duration) -> Self {
        Self { route, timeout }
    }

    /// `Err` means the host could not be asked, not that the process is gone.
    pub async fn is_alive(&mut self, pid: u32) -> Result<bool> {
        let out = self.route.run_checked(&alive_command(pid), self.timeout).await?;
        Ok(out.success())
    }

    pub async fn is_port_bound(&mut self, port: u16) -> Result<bool> {
        let out = self
            .route
            .run_checked(&bound_check_command(port), self.timeout)
            .await?;
        Ok(out.success())
    }

    pub async fn port_usage(&mut self, port: u16) -> Result<PortUsage> {
        let bound = self.is_port_bound(port).await?;
        let processes = if bound {
            let out = self.route.run_checked(&owner_command(port), self.timeout).await?;
            parse_owners(&out.stdout)
        } else {
            Vec::new()
        };
        Ok(PortUsage {
            host: self.route.host_name().to_string(),
            port,
            bound,
            processes,
        })
    }

    /// SIGTERM, wait `grace`, then SIGKILL if the process is still there.
    pub async fn terminate(&mut self, pid: u32, label: &str, grace: Duration) -> Result<()> {
        let pid = validate_pid(pid, label)?;

        let term = self
            .route
            .run_checked(&format!("kill -TERM {}", pid), self.timeout)
            .await?;
        if !term.success() && !self.is_alive(pid).await? {
            tracing::debug!("{}: pid {} already gone", label, pid);
            return Ok(());
        }

        tokio::time::sleep(grace).await;
        if !self.is_alive(pid).await? {
            tracing::info!("{}: pid {} exited after SIGTERM", label, pid);
            return Ok(());
        }

        tracing::warn!("{}: pid {} ignored SIGTERM, sending SIGKILL", label, pid);
        let kill = self
            .route
            .run_checked(&format!("kill -KILL {}", pid), self.timeout)
            .await?;
        tokio::time::sleep(grace.min(Duration::from_secs(1))).await;
        if self.is_alive(pid).await? {
            return Err(Error::Teardown {
                service: label.to_string(),
                reason: format!(
                    "pid {} survived SIGTERM and SIGKILL: {}",
                    pid,
                    kill.error_text()
                ),
            });
        }
        Ok(())
    }

    pub async fn tail(&mut self, path: &str, lines: usize) -> Result<String> {
        let out = self
            .route
            .run_checked(&tail_command(path, lines), self.timeout)
            .await?;
        Ok(out.stdout)
    }

    pub async fn discover(&mut self) -> Result<Vec<DiscoveredServer>> {
        let out = self.route.run_checked(DISCOVER_COMMAND, self.timeout).await?;
        Ok(parse_discovered(&out.stdout))
    }
}

/// An inference server process found in the process table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredServer {
    pub pid: u32,
    pub port: Option<u16>,
    pub model: Option<String>,
    pub command: String,
}

static PORT_FLAG_REGEX: OnceLock<Regex> = OnceLock::new();
static MODEL_FLAG_REGEX: OnceLock<Regex> = OnceLock::new();

fn port_flag_regex() -> &'static Regex {
    PORT_FLAG_REGEX
        .get_or_init(|| Regex::new(r"--port[= ](\d+)").expect("static regex pattern is valid"))
}

fn model_flag_regex() -> &'static Regex {
    MODEL_FLAG_REGEX
        .get_or_init(|| Regex::new(r"--model[= ](\S+)").expect("static regex pattern is valid"))
}

/// Parse `ps -eo pid=,args=` lines of server processes. Wrapper shells
/// (`bash -c ...`) are skipped so each server appears once.
pub fn parse_discovered(output: &str) -> Vec<DiscoveredServer> {
    output
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            let (pid, command) = line.split_once(char::is_whitespace)?;
            let pid = pid.parse::<u32>().ok()?;
            let command = command.trim();
            if command.starts_with("bash -c") || command.starts_with("sh -c") {
                return None;
            }
            if !command.contains(" -m ") && !command.contains("vllm serve") {
                return None;
            }
            Some(DiscoveredServer {
                pid,
                port: port_flag_regex()
                    .captures(command)
                    .and_then(|c| c[1].parse().ok()),
                model: model_flag_regex().captures(command).map(|c| c[1].to_string()),
                command: command.to_string(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Process that dies on SIGKILL only, or never.
    struct StubbornHost {
        alive: AtomicBool,
        killable: bool,
        log: parking_lot::Mutex<Vec<String>>,
    }

    #[async_trait]
    impl RemoteRunner for StubbornHost {
        async fn run(&self, _host: &RemoteHost, command: &str, _timeout: Duration) -> CommandOutput {
            self.log.lock().push(command.to_string());
            if command.starts_with("kill -KILL") && self.killable {
                self.alive.store(false, Ordering::SeqCst);
            }
            if command.starts_with("kill -0") {
                return CommandOutput::new(if self.alive.load(Ordering::SeqCst) { 0 } else { 1 }, "", "");
            }
            CommandOutput::ok("")
        }
    }

    #[tokio::test(start_paused = true)]
    async fn terminate_escalates_to_sigkill() {
        let runner = StubbornHost {
            alive: AtomicBool::new(true),
            killable: true,
            log: parking_lot::Mutex::new(Vec::new()),
        };
        let host = RemoteHost::new("gpu-a", "10.0.0.5", "ops");
        let mut route = CommandRoute::Channel {
            runner: &runner,
            host: &host,
        };
        RemoteProcess::new(&mut route, Duration::from_secs(5))
            .terminate(4242, "qwen", Duration::from_secs(2))
            .await
            .unwrap();

        let log = runner.log.lock();
        assert_eq!(log[0], "kill -TERM 4242");
        assert!(log.iter().any(|c| c == "kill -KILL 4242"));
    }

    #[tokio::test(start_paused = true)]
    async fn terminate_reports_unkillable_process() {
        let runner = StubbornHost {
            alive: AtomicBool::new(true),
            killable: false,
            log: parking_lot::Mutex::new(Vec::new()),
        };
        let host = RemoteHost::new("gpu-a", "10.0.0.5", "ops");
        let mut route = CommandRoute::Channel {
            runner: &runner,
            host: &host,
        };
        let err = RemoteProcess::new(&mut route, Duration::from_secs(5))
            .terminate(4242, "qwen", Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Teardown { .. }));
    }

    #[tokio::test]
    async fn terminate_refuses_init() {
        let runner = StubbornHost {
            alive: AtomicBool::new(true),
            killable: true,
            log: parking_lot::Mutex::new(Vec::new()),
        };
        let host = RemoteHost::new("gpu-a", "10.0.0.5", "ops");
        let mut route = CommandRoute::Channel {
            runner: &runner,
            host: &host,
        };
        let err = RemoteProcess::new(&mut route, Duration::from_secs(5))
            .terminate(1, "qwen", Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidPid { pid: 1, .. }));
        assert!(runner.log.lock().is_empty());
    }

    #[test]
    fn discovers_servers_from_process_table() {
        let ps = "\
 4242 /opt/miniconda3/envs/vllm/bin/python -m vllm.entrypoints.openai.api_server --model /models/qwen --port 8001
 4241 bash -c exec python -m vllm.entrypoints.openai.api_server --port 8001
 5000 vllm serve /models/llama --port=8002 --model=/models/llama
 6000 tail -f /tmp/vllm.log";
        let found = parse_discovered(ps);
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].pid, 4242);
        assert_eq!(found[0].port, Some(8001));
        assert_eq!(found[0].model.as_deref(), Some("/models/qwen"));
        assert_eq!(found[1].port, Some(8002));
    }

    #[test]
    fn alive_command_falls_back_to_ps() {
        assert_eq!(
            alive_command(42),
            "kill -0 42 2>/dev/null || ps -p 42 >/dev/null 2>&1"
        );
    }
}
