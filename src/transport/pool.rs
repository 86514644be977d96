//! Pooled Remote Command Channel.

use super::{CommandOutput, Connection, Connector, RemoteRunner, TransportError};
use crate::config::RemoteHost;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Pooled connections idle longer than this are probed before reuse.
const PROBE_AFTER_IDLE: Duration = Duration::from_secs(30);

struct PooledConnection {
    connection: Arc<dyn Connection>,
    last_used: Instant,
}

/// One pool slot per host; the slot lock serializes connects, not commands.
type Slot = Arc<tokio::sync::Mutex<Option<PooledConnection>>>;

/// Remote Command Channel backed by one reusable connection per host.
///
/// Connections are evicted after `idle_timeout` of inactivity, when a
/// liveness probe fails, or when a command on them fails at the transport
/// level. Commands on the same host run concurrently on separate exec
/// channels of the shared connection.
pub struct ChannelPool {
    connector: Arc<dyn Connector>,
    idle_timeout: Duration,
    slots: parking_lot::Mutex<HashMap<String, Slot>>,
}

impl ChannelPool {
    pub fn new(connector: Arc<dyn Connector>, idle_timeout: Duration) -> Self {
        Self {
            connector,
            idle_timeout,
            slots: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    fn slot(&self, host: &str) -> Slot {
        self.slots
            .lock()
            .entry(host.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(None)))
            .clone()
    }

    async fn connection_for(&self, host: &RemoteHost) -> Result<Arc<dyn Connection>, TransportError> {
        let slot = self.slot(&host.name);
        let mut guard = slot.lock().await;

        if let Some(pooled) = guard.as_mut() {
            let idle = pooled.last_used.elapsed();
            let reusable = if idle >= self.idle_timeout {
                tracing::debug!("Pooled connection to {} idle for {:?}, replacing", host.name, idle);
                false
            } else if idle >= PROBE_AFTER_IDLE {
                pooled.connection.probe().await
            } else {
                true
            };

            if reusable {
                pooled.last_used = Instant::now();
                return Ok(pooled.connection.clone());
            }

            if let Some(stale) = guard.take() {
                stale.connection.close().await;
            }
        }

        let connection = self.connector.connect(host).await?;
        *guard = Some(PooledConnection {
            connection: connection.clone(),
            last_used: Instant::now(),
        });
        Ok(connection)
    }

    /// Drop the pooled connection for a host.
    pub async fn discard(&self, host: &str) {
        let slot = self.slots.lock().get(host).cloned();
        if let Some(slot) = slot {
            if let Some(pooled) = slot.lock().await.take() {
                tracing::debug!("Discarding pooled connection to {}", host);
                pooled.connection.close().await;
            }
        }
    }

    /// Close connections idle past the timeout. Returns how many were closed.
    pub async fn evict_idle(&self) -> usize {
        let slots: Vec<(String, Slot)> = self
            .slots
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let mut evicted = 0;
        for (host, slot) in slots {
            // A busy slot is connecting right now; it is not idle.
            let Ok(mut guard) = slot.try_lock() else {
                continue;
            };
            let expired = guard
                .as_ref()
                .is_some_and(|p| p.last_used.elapsed() >= self.idle_timeout);
            if expired {
                if let Some(pooled) = guard.take() {
                    pooled.connection.close().await;
                    evicted += 1;
                    tracing::debug!("Evicted idle connection to {}", host);
                }
            }
        }
        evicted
    }

    /// Number of hosts with an open pooled connection.
    pub fn open_connections(&self) -> usize {
        self.slots
            .lock()
            .values()
            .filter(|slot| slot.try_lock().map(|g| g.is_some()).unwrap_or(true))
            .count()
    }

    pub async fn close_all(&self) {
        let slots: Vec<Slot> = self.slots.lock().drain().map(|(_, v)| v).collect();
        for slot in slots {
            if let Some(pooled) = slot.lock().await.take() {
                pooled.connection.close().await;
            }
        }
    }
}

#[async_trait]
impl RemoteRunner for ChannelPool {
    async fn run(&self, host: &RemoteHost, command: &str, timeout: Duration) -> CommandOutput {
        let started = Instant::now();
        let connection = match tokio::time::timeout(timeout, self.connection_for(host)).await {
            Ok(Ok(c)) => c,
            Ok(Err(e)) => {
                tracing::warn!("Cannot reach {}: {}", host.name, e);
                return CommandOutput::failure(e);
            }
            Err(_) => {
                return CommandOutput::failure(TransportError::Timeout(format!(
                    "connecting to {} exceeded {:?}",
                    host.name, timeout
                )))
            }
        };

        let remaining = timeout.saturating_sub(started.elapsed());
        let result = match tokio::time::timeout(remaining, connection.exec(command)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(format!(
                "command on {} exceeded {:?}",
                host.name, timeout
            ))),
        };

        match result {
            Ok(output) => {
                tracing::trace!(
                    "{}: `{}` exited {} in {:?}",
                    host.name,
                    command,
                    output.exit_code,
                    started.elapsed()
                );
                output
            }
            Err(e) => {
                tracing::warn!("Command on {} failed at transport level: {}", host.name, e);
                self.discard(&host.name).await;
                CommandOutput::failure(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ShellChannel;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct StubConnection {
        alive: AtomicBool,
        closed: Arc<AtomicUsize>,
        hang: bool,
    }

    #[async_trait]
    impl Connection for StubConnection {
        async fn exec(&self, command: &str) -> Result<CommandOutput, TransportError> {
            if self.hang {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            Ok(CommandOutput::ok(format!("ran {}", command)))
        }

        async fn open_shell(&self) -> Result<Box<dyn ShellChannel>, TransportError> {
            Err(TransportError::Protocol("no shell".into()))
        }

        async fn probe(&self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }

        async fn close(&self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct StubConnector {
        connects: AtomicUsize,
        closed: Arc<AtomicUsize>,
        fail: bool,
        hang: bool,
    }

    impl StubConnector {
        fn new() -> Self {
            Self {
                connects: AtomicUsize::new(0),
                closed: Arc::new(AtomicUsize::new(0)),
                fail: false,
                hang: false,
            }
        }
    }

    #[async_trait]
    impl Connector for StubConnector {
        async fn connect(&self, _host: &RemoteHost) -> Result<Arc<dyn Connection>, TransportError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(TransportError::Auth("bad password".into()));
            }
            Ok(Arc::new(StubConnection {
                alive: AtomicBool::new(true),
                closed: self.closed.clone(),
                hang: self.hang,
            }))
        }
    }

    fn host() -> RemoteHost {
        RemoteHost::new("gpu-a", "10.0.0.5", "ops")
    }

    #[tokio::test]
    async fn reuses_connection_per_host() {
        let connector = Arc::new(StubConnector::new());
        let pool = ChannelPool::new(connector.clone(), Duration::from_secs(300));

        let out = pool.run(&host(), "hostname", Duration::from_secs(5)).await;
        assert_eq!(out.stdout, "ran hostname");
        pool.run(&host(), "uptime", Duration::from_secs(5)).await;

        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
        assert_eq!(pool.open_connections(), 1);
    }

    #[tokio::test]
    async fn auth_failure_becomes_sentinel_tuple() {
        let mut connector = StubConnector::new();
        connector.fail = true;
        let pool = ChannelPool::new(Arc::new(connector), Duration::from_secs(300));

        let out = pool.run(&host(), "true", Duration::from_secs(5)).await;
        assert_eq!(out.exit_code, -1);
        assert!(out.stderr.contains("bad password"));
    }

    #[tokio::test(start_paused = true)]
    async fn command_timeout_discards_connection() {
        let mut connector = StubConnector::new();
        connector.hang = true;
        let connector = Arc::new(connector);
        let pool = ChannelPool::new(connector.clone(), Duration::from_secs(300));

        let out = pool.run(&host(), "sleep 1000", Duration::from_secs(2)).await;
        assert!(out.is_transport_failure());
        assert!(out.stderr.contains("timed out"));
        assert_eq!(connector.closed.load(Ordering::SeqCst), 1);
        assert_eq!(pool.open_connections(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_connections_are_evicted() {
        let connector = Arc::new(StubConnector::new());
        let pool = ChannelPool::new(connector.clone(), Duration::from_secs(300));
        pool.run(&host(), "true", Duration::from_secs(5)).await;

        tokio::time::advance(Duration::from_secs(120)).await;
        assert_eq!(pool.evict_idle().await, 0);

        tokio::time::advance(Duration::from_secs(200)).await;
        assert_eq!(pool.evict_idle().await, 1);
        assert_eq!(connector.closed.load(Ordering::SeqCst), 1);

        pool.run(&host(), "true", Duration::from_secs(5)).await;
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
    }
}
