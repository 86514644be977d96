use crate::output::{print_json, UserOutput};
use fleet_serve::Orchestrator;

pub async fn run_models(
    orchestrator: &Orchestrator,
    host: &str,
    root: Option<&str>,
    json: bool,
    out: &dyn UserOutput,
) -> anyhow::Result<()> {
    let models = orchestrator.discover_models(host, root).await?;
    if json {
        print_json(out, &models)?;
        return Ok(());
    }
    if models.is_empty() {
        out.status(&format!("No model checkpoints found on {}", host));
        return Ok(());
    }

    out.status(&format!(
        "{:<28} {:>9}  {:<34} {:>8}  {}",
        "NAME", "SIZE(MB)", "ARCHITECTURE", "MAX_LEN", "PATH"
    ));
    for model in &models {
        out.status(&format!(
            "{:<28} {:>9}  {:<34} {:>8}  {}",
            model.name,
            model.size_mb.map(|s| s.to_string()).unwrap_or_else(|| "-".into()),
            model.architecture.as_deref().unwrap_or("-"),
            model.max_length.map(|l| l.to_string()).unwrap_or_else(|| "-".into()),
            model.path
        ));
    }
    Ok(())
}
