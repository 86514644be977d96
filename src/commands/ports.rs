use crate::output::{print_json, UserOutput};
use fleet_serve::Orchestrator;

/// Without a port: the leases this process knows of. With one: who owns it.
pub async fn run_ports(
    orchestrator: &Orchestrator,
    host: &str,
    port: Option<u16>,
    json: bool,
    out: &dyn UserOutput,
) -> anyhow::Result<()> {
    orchestrator.hosts().get(host)?;

    let Some(port) = port else {
        let leases = orchestrator.ports().leases(host);
        if json {
            print_json(out, &leases)?;
            return Ok(());
        }
        out.status(&format!(
            "Port range {} on {}",
            orchestrator.ports().range_for(host),
            host
        ));
        if leases.is_empty() {
            out.status("  No leases");
        }
        for lease in leases {
            out.status(&format!(
                "  {:>5}  {}  leased {}",
                lease.port,
                if lease.confirmed { "bound  " } else { "pending" },
                lease.leased_at.format("%Y-%m-%d %H:%M:%S")
            ));
        }
        return Ok(());
    };

    let usage = orchestrator.port_usage(host, port).await?;
    if json {
        print_json(out, &usage)?;
        return Ok(());
    }
    if !usage.bound {
        out.status(&format!("Port {} on {} is free", port, host));
        return Ok(());
    }
    out.status(&format!("Port {} on {} is bound", port, host));
    if usage.processes.is_empty() {
        out.status("  Owner not visible (try again with a privileged session)");
    }
    for p in &usage.processes {
        out.status(&format!("  pid {:<8} {}", p.pid, p.name));
    }
    Ok(())
}

pub async fn run_discover(
    orchestrator: &Orchestrator,
    host: &str,
    json: bool,
    out: &dyn UserOutput,
) -> anyhow::Result<()> {
    let found = orchestrator.discover_servers(host).await?;
    if json {
        print_json(out, &found)?;
        return Ok(());
    }
    if found.is_empty() {
        out.status(&format!("No inference servers found on {}", host));
        return Ok(());
    }

    let managed = orchestrator.list();
    for server in &found {
        let owner = managed
            .iter()
            .find(|s| s.host() == host && s.pid == Some(server.pid))
            .map(|s| format!(" [{}]", s.id()))
            .unwrap_or_default();
        out.status(&format!(
            "  pid {:<8} port {:<6} {}{}",
            server.pid,
            server
                .port
                .map(|p| p.to_string())
                .unwrap_or_else(|| "-".into()),
            server.model.as_deref().unwrap_or("?"),
            owner
        ));
    }
    Ok(())
}
