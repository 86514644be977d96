//! Persistence callback for service state transitions.
//!
//! The orchestrator keeps no durable storage of its own. Every transition is
//! handed to a [`StateSink`]; whatever the sink keeps is what
//! [`Orchestrator::restore`](crate::orchestrator::Orchestrator::restore)
//! rebuilds from after a restart.
//!
//! # Example
//!
//! ```ignore
//! use fleet_serve::state::JsonFileStateSink;
//!
//! let sink = JsonFileStateSink::open("/var/lib/fleet/state.json")?;
//! let rows = sink.rows().await;
//! orchestrator.restore(rows).await;
//! ```

mod json;

pub use json::JsonFileStateSink;

use crate::error::Result;
use crate::service::{ManagedService, Status};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Receives every service state transition.
///
/// Errors are logged by the orchestrator and never fail the operation that
/// caused the transition.
#[async_trait]
pub trait StateSink: Send + Sync {
    async fn record(&self, snapshot: &ManagedService, previous: Status) -> Result<()>;

    /// The service was deleted.
    async fn remove(&self, _id: &str) -> Result<()> {
        Ok(())
    }
}

/// Discards everything.
pub struct NoopStateSink;

#[async_trait]
impl StateSink for NoopStateSink {
    async fn record(&self, _snapshot: &ManagedService, _previous: Status) -> Result<()> {
        Ok(())
    }
}

/// One entry of the transition history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub service: String,
    pub from: Status,
    pub to: Status,
    pub pid: Option<u32>,
    pub port: Option<u16>,
    pub at: DateTime<Utc>,
}

/// Keeps the last snapshot per service and the full transition history.
#[derive(Default)]
pub struct MemoryStateSink {
    rows: parking_lot::Mutex<HashMap<String, ManagedService>>,
    history: parking_lot::Mutex<Vec<TransitionRecord>>,
}

impl MemoryStateSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rows(&self) -> Vec<ManagedService> {
        let mut rows: Vec<_> = self.rows.lock().values().cloned().collect();
        rows.sort_by(|a, b| a.spec.id.cmp(&b.spec.id));
        rows
    }

    pub fn last(&self, id: &str) -> Option<ManagedService> {
        self.rows.lock().get(id).cloned()
    }

    pub fn history(&self) -> Vec<TransitionRecord> {
        self.history.lock().clone()
    }

    /// Statuses a service passed through, in order, starting with the first
    /// recorded `from`.
    pub fn statuses_of(&self, id: &str) -> Vec<Status> {
        let history = self.history.lock();
        let mut statuses = Vec::new();
        for record in history.iter().filter(|r| r.service == id) {
            if statuses.is_empty() {
                statuses.push(record.from);
            }
            if statuses.last() != Some(&record.to) {
                statuses.push(record.to);
            }
        }
        statuses
    }
}

#[async_trait]
impl StateSink for MemoryStateSink {
    async fn record(&self, snapshot: &ManagedService, previous: Status) -> Result<()> {
        self.history.lock().push(TransitionRecord {
            service: snapshot.spec.id.clone(),
            from: previous,
            to: snapshot.status,
            pid: snapshot.pid,
            port: snapshot.port,
            at: snapshot.updated_at,
        });
        self.rows
            .lock()
            .insert(snapshot.spec.id.clone(), snapshot.clone());
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<()> {
        self.rows.lock().remove(id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceSpec;
    use crate::service::StateTransition;

    #[tokio::test]
    async fn memory_sink_tracks_history_and_rows() {
        let sink = MemoryStateSink::new();
        let mut svc = ManagedService::new(ServiceSpec::new("qwen", "gpu-a", "/models/qwen"));

        for t in [
            StateTransition::starting(),
            StateTransition::port_leased(8000),
            StateTransition::error("boom"),
        ] {
            let previous = svc.status;
            t.apply(&mut svc);
            sink.record(&svc, previous).await.unwrap();
        }

        assert_eq!(sink.history().len(), 3);
        assert_eq!(
            sink.statuses_of("qwen"),
            vec![Status::Stopped, Status::Starting, Status::Error]
        );
        assert_eq!(sink.last("qwen").unwrap().port, Some(8000));

        sink.remove("qwen").await.unwrap();
        assert!(sink.rows().is_empty());
    }
}
