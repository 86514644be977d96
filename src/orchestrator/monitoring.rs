//! Background sweeps: status reconciliation and idle eviction.
//!
//! The sweeps are composed from small pieces so they can be driven directly
//! in tests:
//! - [`Orchestrator::reconcile_all`]: one reconciliation pass
//! - [`Orchestrator::evict_idle`]: one eviction pass over sessions and the pool
//! - [`Orchestrator::start_monitoring`]: both on their configured intervals

use super::core::ServiceSlot;
use super::Orchestrator;
use crate::config::RemoteHost;
use crate::error::Result;
use crate::service::{CommandRoute, ManagedService, RemoteProcess, StateTransition, Status};
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Services whose process was checked.
    pub checked: Vec<String>,
    /// Services demoted to STOPPED because their process is gone.
    pub demoted: Vec<String>,
    /// Services whose host could not be asked; left unchanged.
    pub unreachable: Vec<String>,
    /// Services skipped because a start or stop held them.
    pub busy: Vec<String>,
}

/// What the host says about a recorded process.
enum Observed {
    Present,
    Gone,
}

impl Orchestrator {
    /// Re-validate every service that is neither STOPPED nor ERROR against
    /// the host, and demote those whose process is gone to STOPPED.
    ///
    /// Services held by an in-flight start or stop are skipped; the
    /// operation owns their state. A host that cannot be reached says
    /// nothing about the process, so its services are left alone.
    #[tracing::instrument(skip(self))]
    pub async fn reconcile_all(&self) -> ReconcileReport {
        // Collect Arcs under the read lock, then release it before any
        // remote command runs.
        let slots: Vec<(String, ServiceSlot)> = {
            let services = self.services.read().await;
            services
                .iter()
                .map(|(id, slot)| (id.clone(), Arc::clone(slot)))
                .collect()
        };

        let checks = slots.into_iter().map(|(id, slot)| async move {
            let Ok(mut svc) = slot.try_lock_owned() else {
                return (id, Verdict::Busy);
            };
            if !matches!(svc.status, Status::Running | Status::Starting | Status::Stopping) {
                return (id, Verdict::Skipped);
            }
            let verdict = match self.observe(&svc).await {
                Ok(Observed::Present) => Verdict::Checked,
                Ok(Observed::Gone) => match self.demote(&mut svc).await {
                    Ok(()) => Verdict::Demoted,
                    Err(e) => {
                        tracing::warn!("Could not demote '{}': {}", id, e);
                        Verdict::Checked
                    }
                },
                Err(e) => {
                    tracing::warn!("Reconcile of '{}' inconclusive: {}", id, e);
                    Verdict::Unreachable
                }
            };
            (id, verdict)
        });

        let mut report = ReconcileReport::default();
        for (id, verdict) in futures::future::join_all(checks).await {
            match verdict {
                Verdict::Checked => report.checked.push(id),
                Verdict::Demoted => {
                    report.checked.push(id.clone());
                    report.demoted.push(id);
                }
                Verdict::Unreachable => report.unreachable.push(id),
                Verdict::Busy => report.busy.push(id),
                Verdict::Skipped => {}
            }
        }
        for list in [
            &mut report.checked,
            &mut report.demoted,
            &mut report.unreachable,
            &mut report.busy,
        ] {
            list.sort();
        }

        if !report.demoted.is_empty() {
            tracing::info!(
                "Reconciled {} service(s), demoted: {}",
                report.checked.len(),
                report.demoted.join(", ")
            );
        }
        report
    }

    async fn observe(&self, svc: &ManagedService) -> Result<Observed> {
        let host: RemoteHost = self.host(svc.host())?.clone();
        let mut route = CommandRoute::Channel {
            runner: self.runner.as_ref(),
            host: &host,
        };
        let mut process = RemoteProcess::new(&mut route, self.config.timeouts.command);

        let present = match (svc.pid, svc.port) {
            (Some(pid), _) => process.is_alive(pid).await?,
            (None, Some(port)) => process.is_port_bound(port).await?,
            // Nothing to look for: the record itself is stale.
            (None, None) => false,
        };
        Ok(if present {
            Observed::Present
        } else {
            Observed::Gone
        })
    }

    async fn demote(&self, svc: &mut ManagedService) -> Result<()> {
        tracing::info!(
            "'{}' pid {:?} is gone from {}, marking stopped",
            svc.id(),
            svc.pid,
            svc.host()
        );
        if let Some(port) = svc.port {
            self.ports.release(svc.host(), port);
        }
        self.transition(svc, StateTransition::stopped()).await
    }

    /// Close idle or dead sessions and idle pooled connections.
    pub async fn evict_idle(&self) -> usize {
        let mut evicted = self.sessions.evict_idle().await;
        if let Some(pool) = &self.pool {
            evicted += pool.evict_idle().await;
        }
        if evicted > 0 {
            tracing::debug!("Evicted {} idle connection(s)", evicted);
        }
        evicted
    }

    /// Run the reconciliation and eviction sweeps in the background until
    /// [`shutdown`](Orchestrator::shutdown).
    pub async fn start_monitoring(self: &Arc<Self>) {
        let mut task = self.monitoring_task.lock().await;
        if task.is_some() {
            return;
        }
        let handle = tokio::spawn(run_monitoring_loop(
            Arc::clone(self),
            self.child_token(),
            Arc::clone(&self.monitoring_shutdown),
        ));
        *task = Some(handle);
    }
}

enum Verdict {
    Checked,
    Demoted,
    Unreachable,
    Busy,
    Skipped,
}

/// Run both sweeps with panic recovery, so one bad pass does not end
/// monitoring for the life of the process.
async fn run_monitoring_loop(
    orchestrator: Arc<Orchestrator>,
    cancel_token: CancellationToken,
    shutdown: Arc<tokio::sync::Notify>,
) {
    use futures::FutureExt;
    use std::panic::AssertUnwindSafe;

    let mut reconcile = tokio::time::interval(orchestrator.config.reconcile.interval);
    let mut eviction = tokio::time::interval(orchestrator.config.session.eviction_interval);
    reconcile.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    eviction.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        let pass = tokio::select! {
            _ = cancel_token.cancelled() => break,
            _ = shutdown.notified() => break,
            _ = reconcile.tick() => AssertUnwindSafe(async {
                orchestrator.reconcile_all().await;
            })
            .catch_unwind()
            .await,
            _ = eviction.tick() => AssertUnwindSafe(async {
                orchestrator.evict_idle().await;
            })
            .catch_unwind()
            .await,
        };

        if let Err(panic_info) = pass {
            let panic_msg = if let Some(s) = panic_info.downcast_ref::<&str>() {
                s.to_string()
            } else if let Some(s) = panic_info.downcast_ref::<String>() {
                s.clone()
            } else {
                "Unknown panic".to_string()
            };
            tracing::error!("Monitoring sweep panicked: {}. Continuing...", panic_msg);
        }
    }
    tracing::debug!("Monitoring loop shutting down");
}
