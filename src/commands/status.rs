use crate::output::{print_json, UserOutput};
use fleet_serve::{ManagedService, Orchestrator, Status};

pub async fn run_status(
    orchestrator: &Orchestrator,
    service: Option<String>,
    json: bool,
    out: &dyn UserOutput,
) -> anyhow::Result<()> {
    let services = match service {
        Some(id) => vec![orchestrator.get_status(&id)?],
        None => orchestrator.list(),
    };

    if json {
        print_json(out, &services)?;
        return Ok(());
    }

    out.status("Service Status:");
    out.status(&format!("{:-<78}", ""));
    if services.is_empty() {
        out.status("  No services configured");
        return Ok(());
    }
    for svc in &services {
        out.status(&format!(
            "  {} {:<24} {:<9} {:<14} {:>6} {:>8}  {}",
            icon(svc.status),
            svc.id(),
            svc.status.to_string(),
            svc.host(),
            svc.port.map(|p| p.to_string()).unwrap_or_else(|| "-".into()),
            svc.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".into()),
            uptime(svc)
        ));
        if let (Status::Error, Some(err)) = (svc.status, &svc.last_error) {
            out.status(&format!("      {}", err.lines().next().unwrap_or_default()));
        }
    }
    Ok(())
}

fn icon(status: Status) -> &'static str {
    match status {
        Status::Running => "+",
        Status::Stopped => "o",
        Status::Starting | Status::Stopping => ".",
        Status::Error => "x",
    }
}

fn uptime(svc: &ManagedService) -> String {
    match (svc.status, svc.started_at) {
        (Status::Running, Some(started)) => {
            let secs = (chrono::Utc::now() - started).num_seconds().max(0);
            format!("up {}h{:02}m", secs / 3600, (secs % 3600) / 60)
        }
        _ => String::new(),
    }
}

pub async fn run_reconcile(
    orchestrator: &Orchestrator,
    json: bool,
    out: &dyn UserOutput,
) -> anyhow::Result<()> {
    let report = orchestrator.reconcile_all().await;
    if json {
        print_json(out, &report)?;
        return Ok(());
    }

    out.status(&format!("Checked {} service(s)", report.checked.len()));
    for id in &report.demoted {
        out.warning(&format!("  {} was gone, marked stopped", id));
    }
    for id in &report.unreachable {
        out.warning(&format!("  {}: host unreachable, left unchanged", id));
    }
    for id in &report.busy {
        out.status(&format!("  {}: operation in progress, skipped", id));
    }
    Ok(())
}
