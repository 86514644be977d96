use super::owners::bound_check_command;
use crate::config::{Config, ExhaustionPolicy, PortRange, RemoteHost};
use crate::error::{Error, Result};
use crate::transport::RemoteRunner;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Answers "is this port already bound on this host".
#[async_trait]
pub trait PortProbe: Send + Sync {
    async fn is_bound(&self, host: &RemoteHost, port: u16) -> Result<bool>;
}

/// Probe that lists listening sockets over the Remote Command Channel.
pub struct RemoteProbe {
    runner: Arc<dyn RemoteRunner>,
    timeout: Duration,
}

impl RemoteProbe {
    pub fn new(runner: Arc<dyn RemoteRunner>, timeout: Duration) -> Self {
        Self { runner, timeout }
    }
}

#[async_trait]
impl PortProbe for RemoteProbe {
    async fn is_bound(&self, host: &RemoteHost, port: u16) -> Result<bool> {
        let out = self
            .runner
            .run(host, &bound_check_command(port), self.timeout)
            .await;
        if let Some(e) = out.transport_error() {
            return Err(Error::transport(&host.name, e));
        }
        Ok(out.success())
    }
}

/// In-memory reservation of a host/port pair.
#[derive(Debug, Clone, Serialize)]
pub struct PortLease {
    pub host: String,
    pub port: u16,
    pub leased_at: DateTime<Utc>,
    /// A process was observed bound to the port.
    pub confirmed: bool,
    #[serde(skip)]
    acquired: Instant,
}

impl PortLease {
    fn new(host: &str, port: u16, confirmed: bool) -> Self {
        Self {
            host: host.to_string(),
            port,
            leased_at: Utc::now(),
            confirmed,
            acquired: Instant::now(),
        }
    }

    fn is_active(&self, ttl: Duration) -> bool {
        self.confirmed || self.acquired.elapsed() < ttl
    }
}

type LeaseKey = (String, u16);

/// First-fit port allocation per host.
///
/// Each host has its own cursor behind its own async lock, held across the
/// probes of one scan; allocations on different hosts never wait on each
/// other. Ports under an active lease are skipped without probing.
pub struct PortAllocator {
    probe: Arc<dyn PortProbe>,
    policy: ExhaustionPolicy,
    lease_ttl: Duration,
    default_range: PortRange,
    host_ranges: HashMap<String, PortRange>,
    cursors: parking_lot::Mutex<HashMap<String, Arc<tokio::sync::Mutex<u16>>>>,
    leases: parking_lot::Mutex<HashMap<LeaseKey, PortLease>>,
}

impl PortAllocator {
    pub fn new(probe: Arc<dyn PortProbe>, default_range: PortRange) -> Self {
        Self {
            probe,
            policy: ExhaustionPolicy::default(),
            lease_ttl: Duration::from_secs(600),
            default_range,
            host_ranges: HashMap::new(),
            cursors: parking_lot::Mutex::new(HashMap::new()),
            leases: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(probe: Arc<dyn PortProbe>, config: &Config) -> Self {
        let mut allocator = Self::new(probe, config.ports.range())
            .with_policy(config.ports.on_exhaustion)
            .with_lease_ttl(config.ports.lease_ttl);
        for host in &config.hosts {
            if let Some(range) = host.port_range {
                allocator.host_ranges.insert(host.name.clone(), range);
            }
        }
        allocator
    }

    pub fn with_policy(mut self, policy: ExhaustionPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    pub fn with_host_range(mut self, host: impl Into<String>, range: PortRange) -> Self {
        self.host_ranges.insert(host.into(), range);
        self
    }

    pub fn range_for(&self, host: &str) -> PortRange {
        self.host_ranges
            .get(host)
            .copied()
            .unwrap_or(self.default_range)
    }

    fn cursor(&self, host: &str) -> Arc<tokio::sync::Mutex<u16>> {
        let start = self.range_for(host).start;
        self.cursors
            .lock()
            .entry(host.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(start)))
            .clone()
    }

    fn is_leased(&self, host: &str, port: u16) -> bool {
        let mut leases = self.leases.lock();
        let key = (host.to_string(), port);
        match leases.get(&key) {
            Some(lease) if lease.is_active(self.lease_ttl) => true,
            Some(_) => {
                tracing::debug!("Lease on {}:{} expired unconfirmed", host, port);
                leases.remove(&key);
                false
            }
            None => false,
        }
    }

    fn lease(&self, host: &str, port: u16) {
        self.leases
            .lock()
            .insert((host.to_string(), port), PortLease::new(host, port, false));
    }

    /// Lease the first free port at or after the host's cursor, wrapping
    /// once around the range.
    pub async fn allocate(&self, host: &RemoteHost) -> Result<u16> {
        let range = self.range_for(&host.name);
        let exhausted = || Error::NoPortAvailable {
            host: host.name.clone(),
            start: range.start,
            end: range.end,
        };
        if range.is_empty() {
            return Err(exhausted());
        }

        let cursor = self.cursor(&host.name);
        let mut cursor = cursor.lock().await;
        let from = if range.contains(*cursor) {
            *cursor
        } else {
            range.start
        };

        for port in (from..range.end).chain(range.start..from) {
            if self.is_leased(&host.name, port) {
                continue;
            }
            if self.probe.is_bound(host, port).await? {
                tracing::trace!("{}:{} is bound, skipping", host.name, port);
                continue;
            }
            self.lease(&host.name, port);
            *cursor = if port + 1 >= range.end {
                range.start
            } else {
                port + 1
            };
            tracing::debug!("Allocated port {} on {}", port, host.name);
            return Ok(port);
        }

        match self.policy {
            ExhaustionPolicy::Fail => Err(exhausted()),
            ExhaustionPolicy::RangeStart => {
                tracing::warn!(
                    "No free port on {} in {}; falling back to {}",
                    host.name,
                    range,
                    range.start
                );
                self.lease(&host.name, range.start);
                Ok(range.start)
            }
        }
    }

    /// Mark a lease as confirmed bound. Confirmed leases never expire.
    pub fn confirm(&self, host: &str, port: u16) {
        self.leases
            .lock()
            .entry((host.to_string(), port))
            .or_insert_with(|| PortLease::new(host, port, true))
            .confirmed = true;
    }

    /// Drop a lease. Bookkeeping only; nothing on the host is touched.
    pub fn release(&self, host: &str, port: u16) -> bool {
        let released = self.leases.lock().remove(&(host.to_string(), port)).is_some();
        if released {
            tracing::debug!("Released port {} on {}", port, host);
        }
        released
    }

    /// Record a confirmed lease recovered from persisted state.
    pub fn seed_confirmed(&self, host: &str, port: u16) {
        self.leases
            .lock()
            .insert((host.to_string(), port), PortLease::new(host, port, true));
    }

    pub fn leases(&self, host: &str) -> Vec<PortLease> {
        let mut leases: Vec<PortLease> = self
            .leases
            .lock()
            .values()
            .filter(|l| l.host == host && l.is_active(self.lease_ttl))
            .cloned()
            .collect();
        leases.sort_by_key(|l| l.port);
        leases
    }

    pub fn lease_for(&self, host: &str, port: u16) -> Option<PortLease> {
        self.leases.lock().get(&(host.to_string(), port)).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedProbe {
        bound: parking_lot::Mutex<HashSet<u16>>,
        calls: AtomicUsize,
        fail: bool,
    }

    impl FixedProbe {
        fn new(bound: impl IntoIterator<Item = u16>) -> Self {
            Self {
                bound: parking_lot::Mutex::new(bound.into_iter().collect()),
                calls: AtomicUsize::new(0),
                fail: false,
            }
        }
    }

    #[async_trait]
    impl PortProbe for FixedProbe {
        async fn is_bound(&self, host: &RemoteHost, port: u16) -> Result<bool> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(Error::transport(
                    &host.name,
                    crate::transport::TransportError::Timeout("probe".into()),
                ));
            }
            Ok(self.bound.lock().contains(&port))
        }
    }

    fn host() -> RemoteHost {
        RemoteHost::new("gpu-a", "10.0.0.5", "ops")
    }

    #[tokio::test]
    async fn skips_bound_ports() {
        let probe = Arc::new(FixedProbe::new(8000..=8004));
        let allocator = PortAllocator::new(probe, PortRange::new(8000, 8010));
        assert_eq!(allocator.allocate(&host()).await.unwrap(), 8005);
    }

    #[tokio::test]
    async fn cursor_advances_and_leases_are_skipped() {
        let probe = Arc::new(FixedProbe::new([]));
        let allocator = PortAllocator::new(probe, PortRange::new(8000, 8003));
        assert_eq!(allocator.allocate(&host()).await.unwrap(), 8000);
        assert_eq!(allocator.allocate(&host()).await.unwrap(), 8001);
        assert_eq!(allocator.allocate(&host()).await.unwrap(), 8002);

        allocator.release("gpu-a", 8001);
        // Cursor wrapped to 8000, which is still leased.
        assert_eq!(allocator.allocate(&host()).await.unwrap(), 8001);
    }

    #[tokio::test]
    async fn exhaustion_policy_decides_outcome() {
        let probe = Arc::new(FixedProbe::new(8000..8002));
        let failing = PortAllocator::new(probe.clone(), PortRange::new(8000, 8002));
        assert!(matches!(
            failing.allocate(&host()).await,
            Err(Error::NoPortAvailable { start: 8000, end: 8002, .. })
        ));

        let legacy = PortAllocator::new(probe, PortRange::new(8000, 8002))
            .with_policy(ExhaustionPolicy::RangeStart);
        assert_eq!(legacy.allocate(&host()).await.unwrap(), 8000);
    }

    #[tokio::test(start_paused = true)]
    async fn unconfirmed_leases_expire() {
        let probe = Arc::new(FixedProbe::new([]));
        let allocator = PortAllocator::new(probe, PortRange::new(8000, 8001))
            .with_lease_ttl(Duration::from_secs(60));
        assert_eq!(allocator.allocate(&host()).await.unwrap(), 8000);
        assert!(allocator.allocate(&host()).await.is_err());

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(allocator.allocate(&host()).await.unwrap(), 8000);

        allocator.confirm("gpu-a", 8000);
        tokio::time::advance(Duration::from_secs(600)).await;
        assert!(allocator.allocate(&host()).await.is_err());
        assert!(allocator.lease_for("gpu-a", 8000).unwrap().confirmed);
    }

    #[tokio::test]
    async fn probe_failure_is_an_error_not_a_free_port() {
        let mut probe = FixedProbe::new([]);
        probe.fail = true;
        let allocator = PortAllocator::new(Arc::new(probe), PortRange::new(8000, 8010));
        assert!(matches!(
            allocator.allocate(&host()).await,
            Err(Error::Transport { .. })
        ));
        assert!(allocator.leases("gpu-a").is_empty());
    }

    #[tokio::test]
    async fn host_ranges_are_independent() {
        let probe = Arc::new(FixedProbe::new([]));
        let allocator = PortAllocator::new(probe.clone(), PortRange::new(8000, 8010))
            .with_host_range("gpu-b", PortRange::new(9000, 9010));
        let b = RemoteHost::new("gpu-b", "10.0.0.6", "ops");
        assert_eq!(allocator.allocate(&host()).await.unwrap(), 8000);
        assert_eq!(allocator.allocate(&b).await.unwrap(), 9000);
        assert_eq!(allocator.leases("gpu-b").len(), 1);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 2);
    }
}
