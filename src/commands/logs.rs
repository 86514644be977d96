use crate::output::UserOutput;
use fleet_serve::Orchestrator;

pub async fn run_logs(
    orchestrator: &Orchestrator,
    service: &str,
    lines: usize,
    out: &dyn UserOutput,
) -> anyhow::Result<()> {
    let tail = orchestrator.service_logs(service, lines).await?;
    if tail.trim().is_empty() {
        out.status(&format!("No log output for {}", service));
    } else {
        out.status(tail.trim_end());
    }
    Ok(())
}
