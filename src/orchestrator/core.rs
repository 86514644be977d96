use super::hosts::HostRegistry;
use crate::activation::ActivationController;
use crate::config::{Config, RemoteHost, ServiceSpec};
use crate::error::{Error, Result};
use crate::port::PortAllocator;
use crate::service::{ManagedService, PidStrategy, StateTransition, Status};
use crate::session::{SessionRegistry, SessionStatus};
use crate::state::StateSink;
use crate::transport::{ChannelPool, RemoteRunner};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Default interval between health polls during a start
pub const DEFAULT_HEALTH_INTERVAL: Duration = Duration::from_secs(3);

/// Default wall-clock ceiling for a start to become healthy (3 minutes)
pub const DEFAULT_HEALTH_CEILING: Duration = Duration::from_secs(180);

/// Lines of server log attached to a failed start
pub const LOG_TAIL_LINES: usize = 40;

/// Per-service record behind its own lock
pub(super) type ServiceSlot = Arc<tokio::sync::Mutex<ManagedService>>;
/// Type alias for the shared, async-safe service registry
type SharedServiceRegistry = Arc<tokio::sync::RwLock<HashMap<String, ServiceSlot>>>;
/// Last snapshot per service, readable while the service lock is held
type SharedSnapshots = Arc<parking_lot::RwLock<HashMap<String, ManagedService>>>;

/// Drives inference servers on remote hosts through their lifecycle.
///
/// The Orchestrator owns every per-host registry the lifecycle needs: the
/// pooled command channel, the persistent sessions, the activation cache and
/// the port cursors. Nothing is process-global, so independent instances can
/// coexist (tests build one per case).
///
/// # Concurrency Model
///
/// - All operations take `&self`; interior mutability is per host or per
///   service, never global
/// - A start or stop holds its service's `Mutex` for its whole duration. A
///   second operation on the same service fails fast with
///   [`Error::OperationInProgress`] instead of queueing
/// - Session commands on one host are serialized by the session lock;
///   different hosts never contend
/// - Status reads go through a snapshot map and never wait on a service lock
/// - A `CancellationToken` aborts in-flight health waits on shutdown
///
/// # Lock Ordering (to prevent deadlocks)
///
/// When acquiring multiple locks, always acquire in this order:
/// 1. `services` (RwLock), released before anything below is awaited
/// 2. Individual service `Mutex`es
/// 3. The host's session lock (via [`SessionRegistry`])
/// 4. The port allocator's per-host cursor
///
/// `snapshots` is a short, synchronous lock and may be taken at any point.
///
/// # Example
///
/// ```no_run
/// use fleet_serve::{Config, Orchestrator};
///
/// # async fn example() -> Result<(), fleet_serve::Error> {
/// let config = Config::default(); // Load from YAML in practice
/// let orchestrator = Orchestrator::builder().config(config).build().await?;
///
/// let outcome = orchestrator.start_service("qwen-7b").await;
/// println!("{}", outcome.message);
///
/// orchestrator.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct Orchestrator {
    pub(super) config: Config,
    pub(super) hosts: HostRegistry,
    pub(super) services: SharedServiceRegistry,
    snapshots: SharedSnapshots,
    pub(super) runner: Arc<dyn RemoteRunner>,
    /// Present when the orchestrator owns the pool behind `runner`
    pub(super) pool: Option<Arc<ChannelPool>>,
    pub(super) sessions: SessionRegistry,
    pub(super) activation: ActivationController,
    pub(super) ports: PortAllocator,
    pub(super) pid_strategies: Vec<Box<dyn PidStrategy>>,
    sink: Arc<dyn StateSink>,
    pub monitoring_shutdown: Arc<tokio::sync::Notify>,
    pub(super) monitoring_task: Arc<tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>>,
    pub(super) cancellation_token: CancellationToken,
}

/// Everything [`Orchestrator::assemble`] needs, resolved by the builder.
pub(super) struct Parts {
    pub config: Config,
    pub runner: Arc<dyn RemoteRunner>,
    pub pool: Option<Arc<ChannelPool>>,
    pub sessions: SessionRegistry,
    pub activation: ActivationController,
    pub ports: PortAllocator,
    pub pid_strategies: Vec<Box<dyn PidStrategy>>,
    pub sink: Arc<dyn StateSink>,
}

impl Orchestrator {
    /// Create a builder for constructing an `Orchestrator` with a fluent API.
    pub fn builder() -> crate::orchestrator::OrchestratorBuilder {
        crate::orchestrator::OrchestratorBuilder::new()
    }

    pub(super) fn assemble(parts: Parts) -> Self {
        Self {
            hosts: HostRegistry::from_config(&parts.config),
            config: parts.config,
            services: Arc::new(tokio::sync::RwLock::new(HashMap::new())),
            snapshots: Arc::new(parking_lot::RwLock::new(HashMap::new())),
            runner: parts.runner,
            pool: parts.pool,
            sessions: parts.sessions,
            activation: parts.activation,
            ports: parts.ports,
            pid_strategies: parts.pid_strategies,
            sink: parts.sink,
            monitoring_shutdown: Arc::new(tokio::sync::Notify::new()),
            monitoring_task: Arc::new(tokio::sync::Mutex::new(None)),
            cancellation_token: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn hosts(&self) -> &HostRegistry {
        &self.hosts
    }

    pub fn ports(&self) -> &PortAllocator {
        &self.ports
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    /// Add a service, or replace the desired parameters of one that is
    /// stopped or failed. Live services cannot be redefined.
    pub async fn register_service(&self, spec: ServiceSpec) -> Result<()> {
        self.config.validate_service(&spec)?;
        self.hosts.get(&spec.host)?;

        let existing = self.services.read().await.get(&spec.id).cloned();
        if let Some(slot) = existing {
            let mut svc = slot
                .try_lock()
                .map_err(|_| Error::OperationInProgress(spec.id.clone()))?;
            if matches!(svc.status, Status::Starting | Status::Running | Status::Stopping) {
                return Err(Error::AlreadyRunning(spec.id.clone()));
            }
            svc.spec = spec;
            self.publish(&svc);
            tracing::info!("Updated service '{}'", svc.id());
            return Ok(());
        }

        let svc = ManagedService::new(spec);
        tracing::info!("Registered service '{}' on {}", svc.id(), svc.host());
        self.publish(&svc);
        self.services
            .write()
            .await
            .insert(svc.id().to_string(), Arc::new(tokio::sync::Mutex::new(svc)));
        Ok(())
    }

    /// Remove a service, stopping it first when it still has a process.
    #[tracing::instrument(skip(self))]
    pub async fn delete_service(&self, id: &str) -> Result<()> {
        let status = self.get_status(id)?.status;
        if status != Status::Stopped {
            self.stop(super::StopTarget::Id(id.to_string())).await?;
        }

        let slot = self.services.write().await.remove(id);
        if let Some(slot) = slot {
            // Wait out anything that grabbed the lock between stop and removal.
            drop(slot.lock().await);
        }
        self.snapshots.write().remove(id);
        if let Err(e) = self.sink.remove(id).await {
            tracing::warn!("State sink failed to remove '{}': {}", id, e);
        }
        tracing::info!("Deleted service '{}'", id);
        Ok(())
    }

    /// Latest snapshot of a service. Never waits on an in-flight operation.
    pub fn get_status(&self, id: &str) -> Result<ManagedService> {
        self.snapshots
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::ServiceNotFound(id.to_string()))
    }

    /// Snapshots of every service, sorted by id.
    pub fn list(&self) -> Vec<ManagedService> {
        let mut all: Vec<_> = self.snapshots.read().values().cloned().collect();
        all.sort_by(|a, b| a.spec.id.cmp(&b.spec.id));
        all
    }

    /// Session state for a host, without waiting on a running command.
    pub fn get_session_status(&self, host: &str) -> Result<SessionStatus> {
        self.hosts.get(host)?;
        Ok(self.sessions.status(host))
    }

    /// Rebuild service state from persisted rows.
    ///
    /// Rows for unknown hosts are skipped. A configured service keeps its
    /// configured parameters and takes only the runtime fields from the row.
    /// STARTING rows lost the task that owned them and come back as ERROR.
    pub async fn restore(&self, rows: Vec<ManagedService>) -> usize {
        let mut restored = 0;
        for mut row in rows {
            if self.hosts.get(row.host()).is_err() {
                tracing::warn!(
                    "Skipping persisted service '{}': host '{}' is not configured",
                    row.id(),
                    row.host()
                );
                continue;
            }
            if let Some(spec) = self.config.service(row.id()) {
                row.spec = spec.clone();
            }

            let previous = row.status;
            if row.status == Status::Starting {
                StateTransition::error("controller restarted while the service was starting")
                    .apply(&mut row);
            }
            if matches!(row.status, Status::Running | Status::Stopping) {
                if let Some(port) = row.port {
                    self.ports.seed_confirmed(row.host(), port);
                }
            }

            self.publish(&row);
            if previous != row.status {
                self.record(&row, previous).await;
            }
            let slot = self.services.read().await.get(row.id()).cloned();
            match slot {
                Some(slot) => *slot.lock().await = row,
                None => {
                    self.services
                        .write()
                        .await
                        .insert(row.id().to_string(), Arc::new(tokio::sync::Mutex::new(row)));
                }
            }
            restored += 1;
        }
        tracing::info!("Restored {} service(s) from persisted state", restored);
        restored
    }

    pub(super) async fn slot(&self, id: &str) -> Result<ServiceSlot> {
        self.services
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| Error::ServiceNotFound(id.to_string()))
    }

    /// Validate, apply, publish and persist one transition.
    pub(super) async fn transition(
        &self,
        svc: &mut ManagedService,
        transition: StateTransition,
    ) -> Result<()> {
        transition.validate(svc.id(), svc.status)?;
        let previous = svc.status;
        transition.apply(svc);

        if previous != svc.status {
            tracing::info!(
                service = %svc.id(),
                host = %svc.host(),
                "{} -> {}",
                previous,
                svc.status
            );
        }
        debug_assert!(svc.check_invariant());

        self.publish(svc);
        self.record(svc, previous).await;
        Ok(())
    }

    /// Move to ERROR, logging rather than returning a second failure.
    pub(super) async fn fail(&self, svc: &mut ManagedService, error: &Error) {
        if let Err(e) = self
            .transition(svc, StateTransition::error(error.to_string()))
            .await
        {
            tracing::error!("Could not record failure of '{}': {}", svc.id(), e);
        }
    }

    fn publish(&self, svc: &ManagedService) {
        self.snapshots
            .write()
            .insert(svc.id().to_string(), svc.clone());
    }

    async fn record(&self, svc: &ManagedService, previous: Status) {
        if let Err(e) = self.sink.record(svc, previous).await {
            tracing::warn!("State sink failed for '{}': {}", svc.id(), e);
        }
    }

    /// Cancel in-flight health waits. Operations observing the token fail
    /// with [`Error::Cancelled`].
    pub fn cancel_operations(&self) {
        self.cancellation_token.cancel();
    }

    pub(super) fn child_token(&self) -> CancellationToken {
        self.cancellation_token.child_token()
    }

    pub(super) fn host(&self, name: &str) -> Result<&RemoteHost> {
        self.hosts.get(name)
    }

    /// Stop background sweeps and close every session and pooled connection.
    /// Managed servers keep running.
    pub async fn shutdown(&self) {
        self.cancellation_token.cancel();
        self.monitoring_shutdown.notify_waiters();

        let handle = self.monitoring_task.lock().await.take();
        if let Some(handle) = handle {
            if tokio::time::timeout(Duration::from_secs(5), handle)
                .await
                .is_err()
            {
                tracing::warn!("Background sweeps did not stop within 5s");
            }
        }

        self.sessions.shutdown().await;
        if let Some(pool) = &self.pool {
            pool.close_all().await;
        }
        tracing::debug!("Orchestrator shut down");
    }
}
