use super::{PersistentSession, SessionOptions, SessionStatus, ShellDialect};
use crate::config::RemoteHost;
use crate::error::Result;
use crate::transport::Connector;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

type SessionSlot = Arc<Mutex<PersistentSession>>;

/// Last published status per host, readable without waiting for a session
/// that is busy running a command.
type SharedStatusMap = Arc<RwLock<HashMap<String, SessionStatus>>>;

/// Per-host owner of persistent sessions.
///
/// Each host has exactly one slot. The slot's mutex is the session lock:
/// holding a [`SessionGuard`] is the only way to run commands, and connects
/// happen under the same lock, so at most one session per host is ever open.
pub struct SessionRegistry {
    connector: Arc<dyn Connector>,
    dialect: Arc<dyn ShellDialect>,
    options: SessionOptions,
    slots: parking_lot::Mutex<HashMap<String, SessionSlot>>,
    statuses: SharedStatusMap,
}

impl SessionRegistry {
    pub fn new(
        connector: Arc<dyn Connector>,
        dialect: Arc<dyn ShellDialect>,
        options: SessionOptions,
    ) -> Self {
        Self {
            connector,
            dialect,
            options,
            slots: parking_lot::Mutex::new(HashMap::new()),
            statuses: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    fn slot(&self, host: &RemoteHost) -> SessionSlot {
        self.slots
            .lock()
            .entry(host.name.clone())
            .or_insert_with(|| {
                Arc::new(Mutex::new(PersistentSession::new(
                    host.clone(),
                    self.dialect.clone(),
                    self.options.clone(),
                )))
            })
            .clone()
    }

    fn existing_slot(&self, host: &str) -> Option<SessionSlot> {
        self.slots.lock().get(host).cloned()
    }

    /// Lock the host's session, connecting or replacing it first when it is
    /// missing, broken, or idle past the timeout.
    pub async fn acquire(&self, host: &RemoteHost) -> Result<SessionGuard> {
        let slot = self.slot(host);
        let mut session = slot.lock_owned().await;

        if session.is_live() && !session.is_idle_expired() {
            return Ok(self.guard(session));
        }

        if session.is_live() {
            tracing::info!(
                "Session {} on {} idle for {:?}, recreating",
                session.id(),
                host.name,
                session.idle_for()
            );
        }
        session.disconnect().await;
        *session = PersistentSession::new(host.clone(), self.dialect.clone(), self.options.clone());

        match session.connect(self.connector.as_ref()).await {
            Ok(()) => Ok(self.guard(session)),
            Err(e) => {
                tracing::warn!("Cannot open session on {}: {}", host.name, e);
                session.disconnect().await;
                self.publish(&session);
                Err(e)
            }
        }
    }

    /// Lock the host's session only if one is already live.
    pub async fn acquire_live(&self, host: &str) -> Option<SessionGuard> {
        let slot = self.existing_slot(host)?;
        let session = slot.lock_owned().await;
        if session.is_live() && !session.is_idle_expired() {
            Some(self.guard(session))
        } else {
            None
        }
    }

    fn guard(&self, session: OwnedMutexGuard<PersistentSession>) -> SessionGuard {
        SessionGuard {
            session,
            statuses: self.statuses.clone(),
        }
    }

    fn publish(&self, session: &PersistentSession) {
        let status = session.status();
        self.statuses.write().insert(status.host.clone(), status);
    }

    /// Current status without blocking behind a running command.
    pub fn status(&self, host: &str) -> SessionStatus {
        if let Some(slot) = self.existing_slot(host) {
            if let Ok(session) = slot.try_lock() {
                return session.status();
            }
        }
        self.statuses
            .read()
            .get(host)
            .cloned()
            .unwrap_or_else(|| SessionStatus::absent(host))
    }

    /// Number of hosts with a live session.
    pub fn live_sessions(&self) -> usize {
        self.slots
            .lock()
            .values()
            .filter(|slot| slot.try_lock().map(|s| s.is_live()).unwrap_or(true))
            .count()
    }

    /// Close sessions that are idle past the timeout or fail a liveness probe.
    /// Busy sessions are skipped.
    pub async fn evict_idle(&self) -> usize {
        let slots: Vec<SessionSlot> = self.slots.lock().values().cloned().collect();
        let mut evicted = 0;

        for slot in slots {
            let Ok(mut session) = slot.try_lock_owned() else {
                continue;
            };
            if !session.is_live() {
                continue;
            }
            let reason = if session.is_idle_expired() {
                Some("idle timeout")
            } else if !session.probe().await {
                Some("liveness probe failed")
            } else {
                None
            };
            if let Some(reason) = reason {
                tracing::info!(
                    "Evicting session {} on {} ({})",
                    session.id(),
                    session.host().name,
                    reason
                );
                session.disconnect().await;
                self.publish(&session);
                evicted += 1;
            }
        }
        evicted
    }

    /// Tear down the host's session and forget it.
    pub async fn remove_host(&self, host: &str) {
        let slot = self.slots.lock().remove(host);
        if let Some(slot) = slot {
            let mut session = slot.lock().await;
            session.disconnect().await;
        }
        self.statuses.write().remove(host);
    }

    pub async fn shutdown(&self) {
        let slots: Vec<(String, SessionSlot)> = self.slots.lock().drain().collect();
        for (host, slot) in slots {
            let mut session = slot.lock().await;
            session.disconnect().await;
            tracing::debug!("Closed session on {}", host);
        }
        self.statuses.write().clear();
    }
}

/// Exclusive access to one host's session. Publishes the session status
/// when dropped.
pub struct SessionGuard {
    session: OwnedMutexGuard<PersistentSession>,
    statuses: SharedStatusMap,
}

impl Deref for SessionGuard {
    type Target = PersistentSession;

    fn deref(&self) -> &Self::Target {
        &self.session
    }
}

impl DerefMut for SessionGuard {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.session
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let status = self.session.status();
        self.statuses.write().insert(status.host.clone(), status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::BashDialect;
    use crate::transport::{Connection, TransportError};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct RefusingConnector {
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl Connector for RefusingConnector {
        async fn connect(&self, _host: &RemoteHost) -> std::result::Result<Arc<dyn Connection>, TransportError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(TransportError::Connect("connection refused".into()))
        }
    }

    #[tokio::test]
    async fn failed_connect_surfaces_transport_error() {
        let connector = Arc::new(RefusingConnector {
            attempts: AtomicUsize::new(0),
        });
        let registry = SessionRegistry::new(
            connector.clone(),
            Arc::new(BashDialect),
            SessionOptions::default(),
        );
        let host = RemoteHost::new("gpu-a", "10.0.0.5", "ops");

        let err = registry.acquire(&host).await.err().unwrap();
        assert!(err.to_string().contains("connection refused"));
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 1);

        assert!(registry.acquire_live("gpu-a").await.is_none());
        assert!(!registry.status("gpu-a").connected);
        assert_eq!(registry.live_sessions(), 0);
    }

    #[tokio::test]
    async fn unknown_host_reports_absent_status() {
        let registry = SessionRegistry::new(
            Arc::new(RefusingConnector {
                attempts: AtomicUsize::new(0),
            }),
            Arc::new(BashDialect),
            SessionOptions::default(),
        );
        let status = registry.status("nowhere");
        assert_eq!(status.host, "nowhere");
        assert!(!status.connected);
        assert!(status.session_id.is_empty());
    }
}
