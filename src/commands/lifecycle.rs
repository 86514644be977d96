use crate::output::UserOutput;
use fleet_serve::{Error, Orchestrator, Status, StopTarget};

pub async fn run_start(
    orchestrator: &Orchestrator,
    services: Vec<String>,
    out: &dyn UserOutput,
) -> anyhow::Result<()> {
    let mut failures = 0;
    for id in services {
        out.progress(&format!("  Starting {}...", id));
        match orchestrator.start(&id).await {
            Ok(svc) => out.finish_progress(&format!(
                " running on {}:{} (pid {})",
                svc.host(),
                svc.port.unwrap_or_default(),
                svc.pid.unwrap_or_default()
            )),
            Err(e @ Error::AlreadyRunning(_)) => out.finish_progress(&format!(" skipped ({})", e)),
            Err(e) => {
                out.finish_progress(" failed");
                report(&e, out);
                failures += 1;
            }
        }
    }
    if failures > 0 {
        anyhow::bail!("{} service(s) failed to start", failures);
    }
    Ok(())
}

/// Stop named services, every live service, or a bare pid/port on a host.
pub async fn run_stop(
    orchestrator: &Orchestrator,
    services: Vec<String>,
    host: Option<String>,
    pid: Option<u32>,
    port: Option<u16>,
    out: &dyn UserOutput,
) -> anyhow::Result<()> {
    let targets: Vec<StopTarget> = match (host, pid, port) {
        (Some(host), Some(pid), _) => vec![StopTarget::Pid { host, pid }],
        (Some(host), None, Some(port)) => vec![StopTarget::Port { host, port }],
        _ if !services.is_empty() => services.into_iter().map(StopTarget::Id).collect(),
        _ => {
            let live: Vec<StopTarget> = orchestrator
                .list()
                .into_iter()
                .filter(|s| s.status != Status::Stopped)
                .map(|s| StopTarget::Id(s.spec.id))
                .collect();
            if live.is_empty() {
                out.status("No live services");
                return Ok(());
            }
            out.status("Stopping all live services...");
            live
        }
    };

    let mut failures = 0;
    for target in targets {
        out.progress(&format!("  Stopping {}...", target));
        match orchestrator.stop(target).await {
            Ok(report) if report.stopped_anything() => out.finish_progress(" done"),
            Ok(report) => out.finish_progress(&format!(" nothing to do ({})", report)),
            Err(e @ Error::AlreadyStopped(_)) => out.finish_progress(&format!(" skipped ({})", e)),
            Err(e) => {
                out.finish_progress(" failed");
                report(&e, out);
                failures += 1;
            }
        }
    }
    if failures > 0 {
        anyhow::bail!("{} stop(s) failed", failures);
    }
    Ok(())
}

pub async fn run_delete(
    orchestrator: &Orchestrator,
    service: &str,
    out: &dyn UserOutput,
) -> anyhow::Result<()> {
    orchestrator.delete_service(service).await?;
    out.success(&format!("Deleted {}", service));
    Ok(())
}

fn report(error: &Error, out: &dyn UserOutput) {
    out.error(&format!("    {}", error));
    if let Some(tail) = error.remote_output() {
        out.remote_log(tail);
    }
    if let Some(hint) = error.suggestion() {
        out.status(&format!("    Hint: {}", hint));
    }
}
