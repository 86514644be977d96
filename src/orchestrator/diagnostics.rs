//! Read-only inspection of hosts and services.

use super::Orchestrator;
use crate::activation::locate::locate_command;
use crate::activation::{parse_env_list, CondaEnv};
use crate::config::RemoteHost;
use crate::error::{Error, Result};
use crate::port::PortUsage;
use crate::service::command;
use crate::service::{CommandRoute, DiscoveredServer, RemoteProcess};
use crate::session::SessionStatus;
use crate::transport::CommandOutput;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const PYTHON_COMMAND: &str = "command -v python3 || command -v python";
const GPU_COMMAND: &str =
    "nvidia-smi --query-gpu=index,name,memory.used,memory.total --format=csv,noheader,nounits";
const LISTEN_COMMAND: &str = "ss -Htln 2>/dev/null || netstat -tln 2>/dev/null";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuInfo {
    pub index: u32,
    pub name: String,
    pub memory_used_mib: u64,
    pub memory_total_mib: u64,
}

/// What a host offers for running inference servers.
#[derive(Debug, Clone, Serialize)]
pub struct HostDiagnosis {
    pub host: String,
    pub user: String,
    pub python: Option<String>,
    pub conda: Option<String>,
    pub environments: Vec<CondaEnv>,
    pub gpus: Vec<GpuInfo>,
    pub listening_ports: Vec<u16>,
    pub session: SessionStatus,
    /// Probes that ran but gave nothing usable.
    pub notes: Vec<String>,
}

impl Orchestrator {
    /// Last `lines` lines of the service's server log.
    pub async fn service_logs(&self, id: &str, lines: usize) -> Result<String> {
        let svc = self.get_status(id)?;
        let path = match (&svc.log_path, svc.port) {
            (Some(path), _) => path.clone(),
            (None, Some(port)) => command::log_path(&self.config.launch, id, port),
            (None, None) => {
                return Err(Error::Validation(format!(
                    "Service '{}' has not been launched, so it has no log yet",
                    id
                )))
            }
        };
        let host = self.host(svc.host())?;
        let mut route = CommandRoute::Channel {
            runner: self.runner.as_ref(),
            host,
        };
        RemoteProcess::new(&mut route, self.config.timeouts.command)
            .tail(&path, lines)
            .await
    }

    /// Whether `port` is bound on `host`, and by which processes.
    pub async fn port_usage(&self, host: &str, port: u16) -> Result<PortUsage> {
        let host = self.host(host)?;
        // Owners of root processes are only visible from a root session.
        let mut session = self.sessions.acquire_live(&host.name).await;
        let mut route = match session.as_mut() {
            Some(session) => CommandRoute::Session(session),
            None => CommandRoute::Channel {
                runner: self.runner.as_ref(),
                host,
            },
        };
        RemoteProcess::new(&mut route, self.config.timeouts.command)
            .port_usage(port)
            .await
    }

    /// Inference server processes running on `host`, managed or not.
    pub async fn discover_servers(&self, host: &str) -> Result<Vec<DiscoveredServer>> {
        let host = self.host(host)?;
        let mut route = CommandRoute::Channel {
            runner: self.runner.as_ref(),
            host,
        };
        RemoteProcess::new(&mut route, self.config.timeouts.command)
            .discover()
            .await
    }

    #[tracing::instrument(skip(self))]
    pub async fn diagnose_host(&self, host: &str) -> Result<HostDiagnosis> {
        let host = self.host(host)?.clone();
        let timeout = self.config.timeouts.command;
        let mut notes = Vec::new();

        let whoami = self.run_checked(&host, "whoami", timeout).await?;
        let user = whoami.stdout.trim().to_string();

        let python = first_line(&self.runner.run(&host, PYTHON_COMMAND, timeout).await);
        if python.is_none() {
            notes.push("no python interpreter on PATH".to_string());
        }

        let conda = first_line(
            &self
                .runner
                .run(&host, &locate_command(self.activation.tool_paths()), timeout)
                .await,
        );
        let environments = match &conda {
            Some(tool) => {
                let cmd = format!("{} env list", shell_escape::escape(tool.as_str().into()));
                let out = self.runner.run(&host, &cmd, timeout).await;
                if !out.success() {
                    notes.push(format!("conda env list failed: {}", out.error_text()));
                }
                parse_env_list(&out.stdout)
            }
            None => {
                notes.push("no conda installation found".to_string());
                Vec::new()
            }
        };

        let gpu_out = self.runner.run(&host, GPU_COMMAND, timeout).await;
        let gpus = if gpu_out.success() {
            parse_gpus(&gpu_out.stdout)
        } else {
            notes.push(format!("nvidia-smi unavailable: {}", gpu_out.error_text()));
            Vec::new()
        };

        let listening_ports = parse_listening_ports(
            &self.runner.run(&host, LISTEN_COMMAND, timeout).await.stdout,
        );

        Ok(HostDiagnosis {
            session: self.sessions.status(&host.name),
            host: host.name,
            user,
            python,
            conda,
            environments,
            gpus,
            listening_ports,
            notes,
        })
    }

    pub(super) async fn run_checked(
        &self,
        host: &RemoteHost,
        cmd: &str,
        timeout: Duration,
    ) -> Result<CommandOutput> {
        let out = self.runner.run(host, cmd, timeout).await;
        match out.transport_error() {
            Some(e) => Err(Error::transport(&host.name, e)),
            None => Ok(out),
        }
    }
}

fn first_line(out: &CommandOutput) -> Option<String> {
    if !out.success() {
        return None;
    }
    out.lines().next().map(str::to_string)
}

/// Parse `nvidia-smi --format=csv,noheader,nounits` rows.
pub fn parse_gpus(output: &str) -> Vec<GpuInfo> {
    output
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split(',').map(str::trim).collect();
            if fields.len() < 4 {
                return None;
            }
            Some(GpuInfo {
                index: fields[0].parse().ok()?,
                name: fields[1].to_string(),
                memory_used_mib: fields[2].parse().ok()?,
                memory_total_mib: fields[3].parse().ok()?,
            })
        })
        .collect()
}

/// Local ports from `ss -Htln` or `netstat -tln` output, sorted.
pub fn parse_listening_ports(output: &str) -> Vec<u16> {
    let mut ports: Vec<u16> = output
        .lines()
        .filter_map(|line| {
            line.split_whitespace()
                .find(|field| field.contains(':'))
                .and_then(|local| local.rsplit(':').next())
                .and_then(|port| port.parse().ok())
        })
        .collect();
    ports.sort_unstable();
    ports.dedup();
    ports
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_gpu_rows() {
        let out = "0, NVIDIA A100-SXM4-80GB, 1024, 81920\n1, NVIDIA A100-SXM4-80GB, 70000, 81920\n";
        let gpus = parse_gpus(out);
        assert_eq!(gpus.len(), 2);
        assert_eq!(gpus[1].index, 1);
        assert_eq!(gpus[1].memory_used_mib, 70000);
        assert_eq!(gpus[0].name, "NVIDIA A100-SXM4-80GB");
    }

    #[test]
    fn parses_listening_ports_from_ss_and_netstat() {
        let ss = "LISTEN 0 128 0.0.0.0:22 0.0.0.0:*\nLISTEN 0 2048 [::]:8001 [::]:*\nLISTEN 0 128 127.0.0.1:8000 0.0.0.0:*\n";
        assert_eq!(parse_listening_ports(ss), vec![22, 8000, 8001]);

        let netstat = "Active Internet connections (only servers)\n\
Proto Recv-Q Send-Q Local Address           Foreign Address         State\n\
tcp        0      0 0.0.0.0:22              0.0.0.0:*               LISTEN\n\
tcp6       0      0 :::8002                 :::*                    LISTEN\n";
        assert_eq!(parse_listening_ports(netstat), vec![22, 8002]);
    }
}
