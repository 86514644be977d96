mod cli;
mod commands;
mod output;

use clap::Parser;
use cli::{Cli, Commands};
use fleet_serve::state::JsonFileStateSink;
use fleet_serve::{Error as FleetError, Orchestrator, Parser as ConfigParser};
use std::sync::Arc;

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        if let Some(fleet_error) = e.downcast_ref::<FleetError>() {
            eprintln!("Error: {}", fleet_error);
            if let Some(tail) = fleet_error.remote_output() {
                eprintln!("\n--- remote log ---\n{}", tail.trim_end());
            }
            if let Some(suggestion) = fleet_error.suggestion() {
                eprintln!("\nHint: {}", suggestion);
            }
        } else {
            eprintln!("Error: {:#}", e);
        }
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let out = output::CliOutput::new();
    let parser = ConfigParser::new();
    let config_path = match cli.config.clone() {
        Some(path) => path,
        None => parser.find_config_file()?,
    };

    // Commands that need only the config file
    match &cli.command {
        Commands::Validate => return commands::run_validate(&config_path, &out),
        Commands::Hosts { json } => {
            let config = parser.load_config(&config_path)?;
            return commands::run_hosts(&config, *json, &out);
        }
        _ => {}
    }

    let config = parser.load_config(&config_path)?;
    let state_path = match cli.state.clone() {
        Some(path) => path,
        None => JsonFileStateSink::default_path()?,
    };
    let sink = Arc::new(JsonFileStateSink::open(&state_path)?);
    tracing::debug!("State file: {}", sink.path().display());

    let orchestrator = Arc::new(
        Orchestrator::builder()
            .config(config)
            .with_sink(sink.clone())
            .build()
            .await?,
    );
    let restored = orchestrator.restore(sink.rows().await).await;
    if restored > 0 {
        tracing::debug!("Restored {} service row(s)", restored);
    }

    let result = dispatch(&orchestrator, cli.command, &out).await;
    orchestrator.shutdown().await;
    result
}

async fn dispatch(
    orchestrator: &Arc<Orchestrator>,
    command: Commands,
    out: &output::CliOutput,
) -> anyhow::Result<()> {
    match command {
        Commands::Start { services } => commands::run_start(orchestrator, services, out).await,
        Commands::Stop {
            services,
            host,
            pid,
            port,
        } => commands::run_stop(orchestrator, services, host, pid, port, out).await,
        Commands::Status { service, json } => {
            commands::run_status(orchestrator, service, json, out).await
        }
        Commands::Reconcile { json } => commands::run_reconcile(orchestrator, json, out).await,
        Commands::Activate {
            host,
            env,
            root_password,
        } => commands::run_activate(orchestrator, &host, &env, root_password, out).await,
        Commands::Session { host, json } => commands::run_session(orchestrator, &host, json, out),
        Commands::Logs { service, lines } => {
            commands::run_logs(orchestrator, &service, lines, out).await
        }
        Commands::Ports { host, port, json } => {
            commands::run_ports(orchestrator, &host, port, json, out).await
        }
        Commands::Discover { host, json } => {
            commands::run_discover(orchestrator, &host, json, out).await
        }
        Commands::Models { host, root, json } => {
            commands::run_models(orchestrator, &host, root.as_deref(), json, out).await
        }
        Commands::Diagnose { host, json } => {
            commands::run_diagnose(orchestrator, &host, json, out).await
        }
        Commands::Delete { service } => commands::run_delete(orchestrator, &service, out).await,
        Commands::Serve => commands::run_serve(orchestrator, out).await,
        Commands::Validate | Commands::Hosts { .. } => Ok(()),
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}
