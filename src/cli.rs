use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "fleet")]
#[command(about = "Drive inference servers on remote GPU hosts over SSH")]
pub struct Cli {
    /// Config file path (defaults to fleet.yaml, searched upward)
    #[arg(short, long, env = "FLEET_CONFIG")]
    pub config: Option<PathBuf>,

    /// State file path (defaults to ~/.fleet/state.json)
    #[arg(long, env = "FLEET_STATE")]
    pub state: Option<PathBuf>,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List configured hosts
    Hosts {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Validate the config file
    Validate,
    /// Start services and wait until they are healthy
    Start {
        /// Services to start
        #[arg(required = true)]
        services: Vec<String>,
    },
    /// Stop services, or a bare pid or port on a host
    Stop {
        /// Services to stop (defaults to every live service)
        services: Vec<String>,

        /// Host of the pid or port to stop
        #[arg(long)]
        host: Option<String>,

        /// Stop this pid on --host
        #[arg(long, requires = "host", conflicts_with_all = ["port", "services"])]
        pid: Option<u32>,

        /// Stop whatever listens on this port on --host
        #[arg(long, requires = "host", conflicts_with = "services")]
        port: Option<u16>,
    },
    /// Show service status
    Status {
        /// Only this service
        service: Option<String>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Re-check live services against their hosts
    Reconcile {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Activate an environment in the host's persistent session
    Activate {
        host: String,
        env: String,

        /// Escalation password, overriding the configured one
        #[arg(long, env = "FLEET_ROOT_PASSWORD", hide_env_values = true)]
        root_password: Option<String>,
    },
    /// Show the persistent session state of a host
    Session {
        host: String,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show the tail of a service's server log
    Logs {
        service: String,

        /// Number of lines
        #[arg(short = 'n', long, default_value_t = 100)]
        lines: usize,
    },
    /// Show port leases on a host, or who owns one port
    Ports {
        host: String,
        port: Option<u16>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Find inference server processes on a host
    Discover {
        host: String,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List model checkpoints under a host's model directory
    Models {
        host: String,

        /// Directory to search instead of the host's model_root
        #[arg(long)]
        root: Option<String>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Report interpreters, environments, GPUs and listening ports of a host
    Diagnose {
        host: String,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Stop a service if needed and forget it
    Delete { service: String },
    /// Run reconciliation and eviction sweeps until Ctrl-C
    Serve,
}
