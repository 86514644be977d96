use crate::output::{print_json, UserOutput};
use fleet_serve::orchestrator::Credentials;
use fleet_serve::Orchestrator;

pub async fn run_activate(
    orchestrator: &Orchestrator,
    host: &str,
    env: &str,
    root_password: Option<String>,
    out: &dyn UserOutput,
) -> anyhow::Result<()> {
    let credentials = root_password.map(|p| Credentials {
        root_password: Some(p),
    });
    out.progress(&format!("Activating {} on {}...", env, host));
    match orchestrator.activate(host, env, credentials.as_ref()).await {
        Ok(record) => {
            out.finish_progress(" verified");
            out.status(&format!("  method: {}", record.method));
            if let Some(path) = &record.env_path {
                out.status(&format!("  path:   {}", path));
            }
            Ok(())
        }
        Err(e) => {
            out.finish_progress(" failed");
            Err(e.into())
        }
    }
}

/// Session state as seen by this process. Sessions live only as long as
/// the process that opened them, so this is most useful under `fleet serve`.
pub fn run_session(
    orchestrator: &Orchestrator,
    host: &str,
    json: bool,
    out: &dyn UserOutput,
) -> anyhow::Result<()> {
    let status = orchestrator.get_session_status(host)?;
    if json {
        print_json(out, &status)?;
        return Ok(());
    }

    out.status(&format!("Session on {}", status.host));
    out.status(&format!("  connected:     {}", status.connected));
    out.status(&format!("  phase:         {}", status.phase));
    out.status(&format!("  privileged:    {}", status.privileged));
    out.status(&format!(
        "  job container: {}",
        status.job_container.as_deref().unwrap_or("-")
    ));
    out.status(&format!(
        "  environment:   {} ({}{})",
        status.activated_env.as_deref().unwrap_or("-"),
        status.activation_state,
        if status.activation_valid { ", cached" } else { "" }
    ));
    out.status(&format!("  last activity: {}", status.last_activity.to_rfc3339()));
    Ok(())
}
