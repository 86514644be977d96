use crate::output::UserOutput;
use fleet_serve::{Orchestrator, Status};
use std::sync::Arc;

/// Keep the controller resident: reconcile once, then run the background
/// sweeps until interrupted. Sessions opened here stay warm between sweeps.
pub async fn run_serve(orchestrator: &Arc<Orchestrator>, out: &dyn UserOutput) -> anyhow::Result<()> {
    let report = orchestrator.reconcile_all().await;
    if !report.demoted.is_empty() {
        out.warning(&format!(
            "Marked stopped on startup: {}",
            report.demoted.join(", ")
        ));
    }

    let live = orchestrator
        .list()
        .iter()
        .filter(|s| s.status == Status::Running)
        .count();
    out.status(&format!(
        "Watching {} service(s) on {} host(s), {} running",
        orchestrator.list().len(),
        orchestrator.hosts().len(),
        live
    ));

    orchestrator.start_monitoring().await;
    out.status("Press Ctrl+C to exit");

    tokio::signal::ctrl_c().await?;
    out.status("\nShutting down...");
    Ok(())
}
