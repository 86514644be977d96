use crate::output::{print_json, UserOutput};
use fleet_serve::{Config, Parser as ConfigParser};
use std::path::Path;

pub fn run_validate(config_path: &Path, out: &dyn UserOutput) -> anyhow::Result<()> {
    out.status(&format!("Validating {}...", config_path.display()));

    let config = match ConfigParser::new().load_config(config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            out.error("Configuration failed to load");
            return Err(e.into());
        }
    };
    config.validate()?;

    out.success("Configuration is valid");
    out.status("");
    out.status(&format!("Hosts: {}", config.hosts.len()));
    for host in &config.hosts {
        let state = if host.enabled { "" } else { " (disabled)" };
        out.status(&format!(
            "  - {} {}@{} gpus={}{}",
            host.name,
            host.username,
            host.socket_addr(),
            host.gpu_count,
            state
        ));
    }
    out.status(&format!("Services: {}", config.services.len()));
    for svc in &config.services {
        out.status(&format!(
            "  - {} on {} ({}, env {})",
            svc.id,
            svc.host,
            svc.model_path,
            svc.environment.as_deref().unwrap_or("none")
        ));
    }
    Ok(())
}

pub fn run_hosts(config: &Config, json: bool, out: &dyn UserOutput) -> anyhow::Result<()> {
    if json {
        let hosts: Vec<_> = config
            .hosts
            .iter()
            .map(|h| {
                serde_json::json!({
                    "name": h.name,
                    "address": h.socket_addr(),
                    "username": h.username,
                    "gpu_count": h.gpu_count,
                    "enabled": h.enabled,
                    "port_range": config.port_range_for(&h.name).to_string(),
                })
            })
            .collect();
        print_json(out, &hosts)?;
        return Ok(());
    }

    if config.hosts.is_empty() {
        out.status("No hosts configured");
        return Ok(());
    }
    out.status(&format!(
        "{:<16} {:<28} {:<12} {:>4}  {:<12} {}",
        "HOST", "ADDRESS", "USER", "GPUS", "PORTS", "ENABLED"
    ));
    for h in &config.hosts {
        out.status(&format!(
            "{:<16} {:<28} {:<12} {:>4}  {:<12} {}",
            h.name,
            h.socket_addr(),
            h.username,
            h.gpu_count,
            config.port_range_for(&h.name).to_string(),
            if h.enabled { "yes" } else { "no" }
        ));
    }
    Ok(())
}
