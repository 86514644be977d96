use crate::output::{print_json, UserOutput};
use fleet_serve::Orchestrator;

pub async fn run_diagnose(
    orchestrator: &Orchestrator,
    host: &str,
    json: bool,
    out: &dyn UserOutput,
) -> anyhow::Result<()> {
    out.progress(&format!("Diagnosing {}...", host));
    let diagnosis = match orchestrator.diagnose_host(host).await {
        Ok(d) => {
            out.finish_progress(" done");
            d
        }
        Err(e) => {
            out.finish_progress(" unreachable");
            return Err(e.into());
        }
    };

    if json {
        print_json(out, &diagnosis)?;
        return Ok(());
    }

    out.status(&format!("Host {} (user {})", diagnosis.host, diagnosis.user));
    out.status(&format!(
        "  python: {}",
        diagnosis.python.as_deref().unwrap_or("not found")
    ));
    out.status(&format!(
        "  conda:  {}",
        diagnosis.conda.as_deref().unwrap_or("not found")
    ));

    if !diagnosis.environments.is_empty() {
        out.status("  environments:");
        for env in &diagnosis.environments {
            out.status(&format!(
                "    {} {:<20} {}",
                if env.active { "*" } else { " " },
                env.name.as_deref().unwrap_or("-"),
                env.path
            ));
        }
    }

    if diagnosis.gpus.is_empty() {
        out.status("  gpus:   none visible");
    } else {
        out.status("  gpus:");
        for gpu in &diagnosis.gpus {
            out.status(&format!(
                "    [{}] {:<28} {:>6} / {:>6} MiB",
                gpu.index, gpu.name, gpu.memory_used_mib, gpu.memory_total_mib
            ));
        }
    }

    let ports: Vec<String> = diagnosis.listening_ports.iter().map(u16::to_string).collect();
    out.status(&format!(
        "  listening: {}",
        if ports.is_empty() { "-".to_string() } else { ports.join(", ") }
    ));
    out.status(&format!(
        "  session:   {} ({})",
        diagnosis.session.phase,
        if diagnosis.session.connected { "connected" } else { "not connected" }
    ));

    for note in &diagnosis.notes {
        out.warning(&format!("  {}", note));
    }
    Ok(())
}
