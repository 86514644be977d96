use super::core::Parts;
use super::Orchestrator;
use crate::activation::ActivationController;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::port::{PortAllocator, PortProbe, RemoteProbe};
use crate::service::{default_strategies, PidStrategy};
use crate::session::{BashDialect, SessionOptions, SessionRegistry, ShellDialect};
use crate::state::{NoopStateSink, StateSink};
use crate::transport::{ChannelPool, Connector, RemoteRunner, SshConnector};
use std::sync::Arc;

/// Builder for constructing an `Orchestrator` with a fluent API.
///
/// Every collaborator has a production default built from the config (SSH
/// connector, pooled channel, remote port probe, no persistence). Tests
/// replace the transport seams with scripted fakes.
///
/// # Example
///
/// ```no_run
/// use fleet_serve::{Config, Orchestrator};
/// use fleet_serve::state::JsonFileStateSink;
/// use std::sync::Arc;
///
/// # async fn example() -> Result<(), fleet_serve::Error> {
/// let config = Config::default();
/// let sink = JsonFileStateSink::open("/var/lib/fleet/state.json")?;
/// let orchestrator = Orchestrator::builder()
///     .config(config)
///     .with_sink(Arc::new(sink))
///     .build()
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Default)]
pub struct OrchestratorBuilder {
    config: Option<Config>,
    connector: Option<Arc<dyn Connector>>,
    runner: Option<Arc<dyn RemoteRunner>>,
    probe: Option<Arc<dyn PortProbe>>,
    sink: Option<Arc<dyn StateSink>>,
    dialect: Option<Arc<dyn ShellDialect>>,
    pid_strategies: Option<Vec<Box<dyn PidStrategy>>>,
}

impl OrchestratorBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the configuration.
    ///
    /// This is required to build the orchestrator.
    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Transport used for persistent sessions, and for the channel pool
    /// unless [`with_runner`](Self::with_runner) is also given.
    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Replace the pooled one-shot command channel.
    pub fn with_runner(mut self, runner: Arc<dyn RemoteRunner>) -> Self {
        self.runner = Some(runner);
        self
    }

    /// Replace the "is this port bound" check used by the port allocator.
    pub fn with_probe(mut self, probe: Arc<dyn PortProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Receive every state transition.
    pub fn with_sink(mut self, sink: Arc<dyn StateSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Prompt and output scraping rules for persistent sessions.
    pub fn with_dialect(mut self, dialect: Arc<dyn ShellDialect>) -> Self {
        self.dialect = Some(dialect);
        self
    }

    /// Ordered pid recovery strategies tried after a launch.
    pub fn with_pid_strategies(mut self, strategies: Vec<Box<dyn PidStrategy>>) -> Self {
        self.pid_strategies = Some(strategies);
        self
    }

    /// Build the orchestrator and register the configured services.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - No config was provided
    /// - The config fails validation
    pub async fn build(self) -> Result<Orchestrator> {
        let config = self
            .config
            .ok_or_else(|| Error::Validation("config is required".to_string()))?;
        config.validate()?;

        let connector = self
            .connector
            .unwrap_or_else(|| Arc::new(SshConnector::new(config.timeouts.connect)));

        let (runner, pool) = match self.runner {
            Some(runner) => (runner, None),
            None => {
                let pool = Arc::new(ChannelPool::new(
                    Arc::clone(&connector),
                    config.pool.idle_timeout,
                ));
                (Arc::clone(&pool) as Arc<dyn RemoteRunner>, Some(pool))
            }
        };

        let probe = self.probe.unwrap_or_else(|| {
            Arc::new(RemoteProbe::new(Arc::clone(&runner), config.timeouts.command))
        });

        let options = SessionOptions {
            escalate: config.session.escalate,
            job_container: config.session.job_container,
            prompt_wait: config.session.prompt_wait,
            command_timeout: config.timeouts.command,
            idle_timeout: config.session.idle_timeout,
        };
        let sessions = SessionRegistry::new(
            connector,
            self.dialect.unwrap_or_else(|| Arc::new(BashDialect)),
            options,
        );

        let parts = Parts {
            activation: ActivationController::new(&config.activation, config.timeouts.command),
            ports: PortAllocator::from_config(probe, &config),
            runner,
            pool,
            sessions,
            pid_strategies: self.pid_strategies.unwrap_or_else(default_strategies),
            sink: self.sink.unwrap_or_else(|| Arc::new(NoopStateSink)),
            config,
        };

        let specs = parts.config.services.clone();
        let orchestrator = Orchestrator::assemble(parts);
        for spec in specs {
            orchestrator.register_service(spec).await?;
        }

        tracing::debug!(
            "Orchestrator ready: {} host(s), {} service(s)",
            orchestrator.hosts().len(),
            orchestrator.list().len()
        );
        Ok(orchestrator)
    }
}
