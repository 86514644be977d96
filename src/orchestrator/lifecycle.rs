//! Start, stop and activation.
//!
//! Each operation has a typed form returning [`Result`] and a
//! `*_service` / `activate_environment` form that folds the result into an
//! [`OperationOutcome`] for callers that only want `(ok, message)`.

use super::health::HealthWaiter;
use super::Orchestrator;
use crate::activation::{inline_activation_prefix, ActivationRecord};
use crate::config::{EnvironmentKind, RemoteHost, ServiceSpec};
use crate::error::{validate_pid, Error, Result};
use crate::service::command::{self, LaunchPlan};
use crate::service::{
    resolve_pid, CommandRoute, LaunchPath, ManagedService, PidContext, RemoteProcess,
    StateTransition, Status,
};
use crate::session::SessionGuard;
use serde::{Deserialize, Serialize};
use std::fmt;

/// `(ok, message)` result of a lifecycle operation, plus the service
/// snapshot when one is involved.
#[derive(Debug, Clone, Serialize)]
pub struct OperationOutcome {
    pub ok: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service: Option<ManagedService>,
}

impl OperationOutcome {
    pub fn success(message: impl Into<String>, service: Option<ManagedService>) -> Self {
        Self {
            ok: true,
            message: message.into(),
            service,
        }
    }

    /// Failure message carries the remote log tail when the error has one.
    pub fn failure(error: &Error, service: Option<ManagedService>) -> Self {
        let mut message = error.to_string();
        if let Some(output) = error.remote_output() {
            message.push_str("\n--- remote log ---\n");
            message.push_str(output.trim_end());
        }
        Self {
            ok: false,
            message,
            service,
        }
    }
}

/// What a stop request names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopTarget {
    Id(String),
    Pid { host: String, pid: u32 },
    Port { host: String, port: u16 },
}

impl fmt::Display for StopTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopTarget::Id(id) => write!(f, "service '{}'", id),
            StopTarget::Pid { host, pid } => write!(f, "pid {} on {}", pid, host),
            StopTarget::Port { host, port } => write!(f, "port {} on {}", port, host),
        }
    }
}

/// What a stop did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopReport {
    pub target: StopTarget,
    /// Managed service that was stopped, if the target resolved to one.
    pub service: Option<String>,
    /// Processes that were signalled.
    pub pids: Vec<u32>,
}

impl StopReport {
    /// Whether anything was actually stopped.
    pub fn stopped_anything(&self) -> bool {
        self.service.is_some() || !self.pids.is_empty()
    }
}

impl fmt::Display for StopReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.service, self.pids.as_slice()) {
            (Some(id), []) => write!(f, "Service '{}' stopped", id),
            (Some(id), pids) => write!(f, "Service '{}' stopped (pid {})", id, join(pids)),
            (None, []) => write!(f, "Nothing to stop for {}", self.target),
            (None, pids) => write!(f, "Stopped {} (pid {})", self.target, join(pids)),
        }
    }
}

fn join(pids: &[u32]) -> String {
    pids.iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Credentials supplied with an activation request.
#[derive(Clone, Default)]
pub struct Credentials {
    /// Password for privilege escalation, overriding the host's.
    pub root_password: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("root_password", &self.root_password.as_ref().map(|_| "***"))
            .finish()
    }
}

struct Launched {
    pid: u32,
    via: LaunchPath,
    log_path: String,
}

impl Orchestrator {
    /// Start a service and wait until it is healthy.
    ///
    /// Rejected without contacting the host when the service is already
    /// STARTING or RUNNING, or when another operation holds it.
    #[tracing::instrument(skip(self))]
    pub async fn start(&self, id: &str) -> Result<ManagedService> {
        let slot = self.slot(id).await?;
        let mut svc = slot
            .try_lock_owned()
            .map_err(|_| Error::OperationInProgress(id.to_string()))?;
        if svc.status.blocks_start() {
            return Err(Error::AlreadyRunning(id.to_string()));
        }
        let host = self.hosts.enabled(svc.host())?.clone();

        // A failed start may have left its server running on the host.
        if svc.status == Status::Error && (svc.pid.is_some() || svc.port.is_some()) {
            self.reap_previous_run(&svc, &host).await?;
        }

        self.transition(&mut svc, StateTransition::starting()).await?;
        match self.run_start(&mut svc, &host).await {
            Ok(()) => Ok(svc.clone()),
            Err(e) => {
                tracing::error!("Start of '{}' failed: {}", id, e);
                let mut failure = StateTransition::error(e.to_string());
                if svc.pid.is_none() {
                    // Nothing was launched, so the port is not ours to keep.
                    if let Some(port) = svc.port {
                        self.ports.release(&host.name, port);
                    }
                    failure.clear_runtime = true;
                }
                if let Err(te) = self.transition(&mut svc, failure).await {
                    tracing::error!("Could not record failure of '{}': {}", id, te);
                }
                Err(e)
            }
        }
    }

    pub async fn start_service(&self, id: &str) -> OperationOutcome {
        match self.start(id).await {
            Ok(svc) => OperationOutcome::success(
                format!(
                    "Service '{}' running on {}:{} (pid {})",
                    svc.id(),
                    svc.host(),
                    svc.port.unwrap_or_default(),
                    svc.pid.unwrap_or_default()
                ),
                Some(svc),
            ),
            Err(e) => OperationOutcome::failure(&e, self.get_status(id).ok()),
        }
    }

    async fn run_start(&self, svc: &mut ManagedService, host: &RemoteHost) -> Result<()> {
        let port = self.ports.allocate(host).await?;
        self.transition(svc, StateTransition::port_leased(port)).await?;

        let launched = self.launch(&svc.spec, host, port).await?;
        self.transition(
            svc,
            StateTransition::launched(launched.pid, launched.via, &launched.log_path),
        )
        .await?;

        HealthWaiter::new(self)
            .wait(host, svc.id(), launched.pid, port, &launched.log_path)
            .await?;

        self.ports.confirm(&host.name, port);
        self.transition(svc, StateTransition::running()).await
    }

    /// Submit the launch through an activated session when the environment
    /// needs one and a session with a job container is available, otherwise
    /// through a one-shot channel with inline activation.
    ///
    /// A session without a job container never launches: its background
    /// jobs get SIGHUP when the shell goes away.
    async fn launch(&self, spec: &ServiceSpec, host: &RemoteHost, port: u16) -> Result<Launched> {
        let launch = &self.config.launch;

        if let EnvironmentKind::Named(env) = spec.environment_kind() {
            let session = self
                .session_for_launch(host)
                .await
                .filter(|session| match session.job_container() {
                    Some(_) => true,
                    None => {
                        tracing::warn!(
                            "Session on {} has no job container, launching '{}' through a one-shot channel",
                            host.name,
                            spec.id
                        );
                        false
                    }
                });
            if let Some(mut session) = session {
                match self.activation.ensure(&mut session, &env).await {
                    Ok(record) => {
                        let plan =
                            command::session_launch(spec, port, launch, record.python_path().as_deref());
                        let mut route = CommandRoute::Session(&mut session);
                        return self
                            .submit(&mut route, &spec.id, plan, port, LaunchPath::Session)
                            .await;
                    }
                    Err(e) => tracing::warn!(
                        "Session activation of '{}' on {} failed, launching through a one-shot channel: {}",
                        env,
                        host.name,
                        e
                    ),
                }
            }
        }

        let prefix = match spec.environment_kind() {
            EnvironmentKind::Named(env) => {
                Some(inline_activation_prefix(self.activation.tool_paths(), &env))
            }
            _ => None,
        };
        let plan = command::channel_launch(spec, port, launch, prefix.as_deref());
        let mut route = CommandRoute::Channel {
            runner: self.runner.as_ref(),
            host,
        };
        self.submit(&mut route, &spec.id, plan, port, LaunchPath::Channel)
            .await
    }

    async fn session_for_launch(&self, host: &RemoteHost) -> Option<SessionGuard> {
        if !self.config.session.auto_open {
            return self.sessions.acquire_live(&host.name).await;
        }
        match self.sessions.acquire(host).await {
            Ok(session) => Some(session),
            Err(e) => {
                tracing::warn!("No session on {}: {}", host.name, e);
                None
            }
        }
    }

    async fn submit(
        &self,
        route: &mut CommandRoute<'_>,
        service: &str,
        plan: LaunchPlan,
        port: u16,
        via: LaunchPath,
    ) -> Result<Launched> {
        tracing::info!(
            "Launching '{}' on {} port {} via {}",
            service,
            route.host_name(),
            port,
            via
        );
        tracing::debug!("Launch command: {}", plan.command);

        let out = route.run(&plan.command, self.config.timeouts.launch).await;
        if let Some(e) = out.transport_error() {
            return Err(Error::transport(route.host_name(), e));
        }
        if !out.success() {
            return Err(Error::Launch {
                service: service.to_string(),
                reason: format!(
                    "launch command exited with {}: {}",
                    out.exit_code,
                    out.error_text()
                ),
            });
        }

        let ctx = PidContext {
            launch_output: &out.stdout,
            pid_file: &plan.pid_file,
            port,
            timeout: self.config.timeouts.command,
        };
        let Some((pid, strategy)) = resolve_pid(&self.pid_strategies, route, &ctx).await else {
            let tried: Vec<&str> = self.pid_strategies.iter().map(|s| s.name()).collect();
            return Err(Error::Launch {
                service: service.to_string(),
                reason: format!("no pid found (tried {})", tried.join(", ")),
            });
        };
        validate_pid(pid, service)?;

        tracing::info!("'{}' launched as pid {} (from {})", service, pid, strategy);
        Ok(Launched {
            pid,
            via,
            log_path: plan.log_path,
        })
    }

    /// Stop a managed service, or a bare pid or port on a host.
    ///
    /// A pid or port that belongs to a managed service stops that service.
    /// Stopping a STOPPED service fails with [`Error::AlreadyStopped`] and
    /// issues no remote command.
    #[tracing::instrument(skip(self), fields(target = %target))]
    pub async fn stop(&self, target: StopTarget) -> Result<StopReport> {
        let (host, pid, port) = match &target {
            StopTarget::Id(id) => {
                let pids = self.stop_managed(id).await?;
                return Ok(StopReport {
                    service: Some(id.clone()),
                    pids,
                    target,
                });
            }
            StopTarget::Pid { host, pid } => (host.as_str(), Some(*pid), None),
            StopTarget::Port { host, port } => (host.as_str(), None, Some(*port)),
        };

        let managed = self.find_managed(host, |s| {
            (pid.is_some() && s.pid == pid) || (port.is_some() && s.port == port)
        });
        if let Some(id) = managed {
            let pids = self.stop_managed(&id).await?;
            return Ok(StopReport {
                target,
                service: Some(id),
                pids,
            });
        }

        let host = self.host(host)?.clone();
        let label = target.to_string();

        // A live session may be root and able to signal what the login user cannot.
        let mut session = self.sessions.acquire_live(&host.name).await;
        let mut route = match session.as_mut() {
            Some(session) => CommandRoute::Session(session),
            None => CommandRoute::Channel {
                runner: self.runner.as_ref(),
                host: &host,
            },
        };
        let pids = self.terminate(&mut route, &label, pid, port).await?;
        Ok(StopReport {
            target,
            service: None,
            pids,
        })
    }

    pub async fn stop_service(&self, target: StopTarget) -> OperationOutcome {
        let snapshot = match &target {
            StopTarget::Id(id) => self.get_status(id).ok(),
            _ => None,
        };
        match self.stop(target).await {
            Ok(report) => OperationOutcome {
                ok: report.stopped_anything(),
                message: report.to_string(),
                service: report.service.as_deref().and_then(|id| self.get_status(id).ok()),
            },
            Err(e) => OperationOutcome::failure(&e, snapshot),
        }
    }

    fn find_managed(&self, host: &str, matches: impl Fn(&ManagedService) -> bool) -> Option<String> {
        self.list()
            .into_iter()
            .find(|s| s.host() == host && s.status != Status::Stopped && matches(s))
            .map(|s| s.spec.id)
    }

    async fn stop_managed(&self, id: &str) -> Result<Vec<u32>> {
        let slot = self.slot(id).await?;
        let mut svc = slot
            .try_lock_owned()
            .map_err(|_| Error::OperationInProgress(id.to_string()))?;
        if svc.status == Status::Stopped {
            return Err(Error::AlreadyStopped(id.to_string()));
        }
        let host = self.host(svc.host())?.clone();

        // A start that failed before launch left nothing on the host.
        if svc.pid.is_none() && svc.port.is_none() {
            self.transition(&mut svc, StateTransition::stopped()).await?;
            return Ok(Vec::new());
        }

        self.transition(&mut svc, StateTransition::stopping()).await?;

        match self.teardown(&svc, &host).await {
            Ok(pids) => {
                if let Some(port) = svc.port {
                    self.ports.release(&host.name, port);
                }
                self.transition(&mut svc, StateTransition::stopped()).await?;
                Ok(pids)
            }
            Err(e) => {
                tracing::error!("Stop of '{}' failed: {}", id, e);
                self.fail(&mut svc, &e).await;
                Err(e)
            }
        }
    }

    /// Terminate what a service record points at, through the route it was
    /// launched on.
    async fn teardown(&self, svc: &ManagedService, host: &RemoteHost) -> Result<Vec<u32>> {
        // Servers launched from a privileged session are usually root-owned.
        let mut session = match svc.launched_via {
            Some(LaunchPath::Session) => self.sessions.acquire_live(&host.name).await,
            _ => None,
        };
        let mut route = match session.as_mut() {
            Some(session) => CommandRoute::Session(session),
            None => CommandRoute::Channel {
                runner: self.runner.as_ref(),
                host,
            },
        };
        self.terminate(&mut route, svc.id(), svc.pid, svc.port).await
    }

    /// Stop the server of an ERROR record and free its lease. On failure the
    /// record is left as it was and the start is refused.
    async fn reap_previous_run(&self, svc: &ManagedService, host: &RemoteHost) -> Result<()> {
        tracing::info!(
            "Cleaning up previous run of '{}' (pid {:?}, port {:?})",
            svc.id(),
            svc.pid,
            svc.port
        );
        let pids = match self.teardown(svc, host).await {
            Ok(pids) => pids,
            Err(e) => {
                tracing::error!("Previous run of '{}' is still there: {}", svc.id(), e);
                return Err(e);
            }
        };
        if let Some(port) = svc.port {
            self.ports.release(&host.name, port);
        }
        if !pids.is_empty() {
            tracing::info!("Terminated leftover pid(s) {} of '{}'", join(&pids), svc.id());
        }
        Ok(())
    }

    /// Graceful-then-forced termination of the pid, then of whatever still
    /// owns the port. Without a pid, the port owners are the targets.
    async fn terminate(
        &self,
        route: &mut CommandRoute<'_>,
        label: &str,
        pid: Option<u32>,
        port: Option<u16>,
    ) -> Result<Vec<u32>> {
        let grace = self.config.timeouts.stop_grace;
        let mut process = RemoteProcess::new(route, self.config.timeouts.command);
        let mut signalled = Vec::new();

        if let Some(pid) = pid {
            process.terminate(pid, label, grace).await?;
            signalled.push(pid);
        }

        if let Some(port) = port {
            let owners = match process.port_usage(port).await {
                Ok(usage) => usage.pids(),
                Err(e) if pid.is_some() => {
                    tracing::warn!("{}: could not check port {} after stop: {}", label, port, e);
                    Vec::new()
                }
                Err(e) => return Err(e),
            };
            for owner in owners {
                if signalled.contains(&owner) {
                    continue;
                }
                if pid.is_some() {
                    tracing::warn!("{}: pid {} still holds port {}", label, owner, port);
                }
                process.terminate(owner, label, grace).await?;
                signalled.push(owner);
            }
        }
        Ok(signalled)
    }

    /// Make `env` the active environment of the host's session, opening
    /// the session if needed.
    #[tracing::instrument(skip(self, credentials))]
    pub async fn activate(
        &self,
        host: &str,
        env: &str,
        credentials: Option<&Credentials>,
    ) -> Result<ActivationRecord> {
        let host = self.hosts.enabled(host)?.clone();
        let mut session = self.sessions.acquire(&host).await?;

        if let Some(password) = credentials.and_then(|c| c.root_password.as_deref()) {
            if !session.is_privileged() && !session.escalate_with(password).await {
                tracing::warn!("Escalation on {} failed, continuing unprivileged", host.name);
            }
        }

        self.activation.ensure(&mut session, env).await
    }

    pub async fn activate_environment(
        &self,
        host: &str,
        env: &str,
        credentials: Option<&Credentials>,
    ) -> OperationOutcome {
        match self.activate(host, env, credentials).await {
            Ok(record) => OperationOutcome::success(
                format!(
                    "Environment '{}' active on {} (verified by {})",
                    record.env_name, host, record.method
                ),
                None,
            ),
            Err(e) => OperationOutcome::failure(&e, None),
        }
    }
}
