//! Who is listening on a remote port.
//!
//! Hosts differ in which socket tools they ship, so the lookup command tries
//! `lsof`, then `ss`, then `fuser`, and the parsers accept the output of any
//! of them.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A process found listening on a port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub pid: u32,
    pub name: String,
    pub command: Option<String>,
}

/// Bound state and owners of one port on one host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortUsage {
    pub host: String,
    pub port: u16,
    pub bound: bool,
    pub processes: Vec<ProcessInfo>,
}

impl PortUsage {
    pub fn pids(&self) -> Vec<u32> {
        self.processes.iter().map(|p| p.pid).collect()
    }
}

/// Exits 0 when something listens on `port`.
pub fn bound_check_command(port: u16) -> String {
    format!(
        "(ss -Htln 2>/dev/null || netstat -tln 2>/dev/null) | awk '{{print $4}}' | grep -Eq '[:.]{}$'",
        port
    )
}

/// Prints listener pids in whichever format the first available tool uses.
pub fn owner_command(port: u16) -> String {
    format!(
        "lsof -nP -iTCP:{port} -sTCP:LISTEN -F pc 2>/dev/null \
         || ss -Htlnp 'sport = :{port}' 2>/dev/null \
         || fuser {port}/tcp 2>&1",
        port = port
    )
}

/// Parse any of the formats [`owner_command`] can produce.
pub fn parse_owners(output: &str) -> Vec<ProcessInfo> {
    let lsof = parse_lsof_fields(output);
    if !lsof.is_empty() {
        return lsof;
    }
    let ss = parse_ss_users(output);
    if !ss.is_empty() {
        return ss;
    }
    parse_fuser(output)
        .into_iter()
        .map(|pid| ProcessInfo {
            pid,
            name: "unknown".to_string(),
            command: None,
        })
        .collect()
}

/// `lsof -F pc` field output: a `p<pid>` line opens each process block,
/// `c<command>` names it.
pub fn parse_lsof_fields(output: &str) -> Vec<ProcessInfo> {
    let mut processes: Vec<ProcessInfo> = Vec::new();
    let mut seen = BTreeSet::new();
    let mut current: Option<ProcessInfo> = None;

    let mut flush = |p: Option<ProcessInfo>, processes: &mut Vec<ProcessInfo>| {
        if let Some(p) = p {
            if seen.insert(p.pid) {
                processes.push(p);
            }
        }
    };

    for line in output.lines().map(str::trim) {
        if let Some(pid) = line.strip_prefix('p') {
            let Ok(pid) = pid.parse::<u32>() else {
                continue;
            };
            flush(current.take(), &mut processes);
            current = Some(ProcessInfo {
                pid,
                name: "unknown".to_string(),
                command: None,
            });
        } else if let Some(cmd) = line.strip_prefix('c') {
            if let Some(p) = current.as_mut() {
                p.name = cmd.to_string();
                p.command = Some(cmd.to_string());
            }
        }
    }
    flush(current, &mut processes);
    processes
}

/// `ss -p` users column: `users:(("python3",pid=4242,fd=12),...)`.
pub fn parse_ss_users(output: &str) -> Vec<ProcessInfo> {
    let mut processes = Vec::new();
    let mut seen = BTreeSet::new();
    for line in output.lines() {
        let Some(users) = line.find("users:(").map(|i| &line[i..]) else {
            continue;
        };
        for entry in users.split("),(") {
            let name = entry
                .split('"')
                .nth(1)
                .unwrap_or("unknown")
                .to_string();
            for part in entry.split(',') {
                let Some(pid) = part.trim_end_matches(')').strip_prefix("pid=") else {
                    continue;
                };
                if let Ok(pid) = pid.parse::<u32>() {
                    if seen.insert(pid) {
                        processes.push(ProcessInfo {
                            pid,
                            name: name.clone(),
                            command: None,
                        });
                    }
                }
            }
        }
    }
    processes
}

/// `fuser 8000/tcp` prints `8000/tcp:  4242  4243`.
pub fn parse_fuser(output: &str) -> Vec<u32> {
    let mut pids = Vec::new();
    for line in output.lines() {
        let rest = match line.split_once(':') {
            Some((label, rest)) if label.contains("/tcp") => rest,
            _ => continue,
        };
        for token in rest.split_whitespace() {
            let digits = token.trim_end_matches(|c: char| !c.is_ascii_digit());
            if let Ok(pid) = digits.parse::<u32>() {
                if !pids.contains(&pid) {
                    pids.push(pid);
                }
            }
        }
    }
    pids
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_lsof_field_blocks() {
        let out = "p4242\ncpython3\np4243\ncpython3\np4242\ncpython3\n";
        let procs = parse_lsof_fields(out);
        assert_eq!(procs.len(), 2);
        assert_eq!(procs[0].pid, 4242);
        assert_eq!(procs[0].name, "python3");
        assert_eq!(procs[1].pid, 4243);
    }

    #[test]
    fn parses_ss_users_column() {
        let out = "LISTEN 0 4096 0.0.0.0:8000 0.0.0.0:* users:((\"python3\",pid=4242,fd=12),(\"python3\",pid=4250,fd=12))";
        let procs = parse_ss_users(out);
        assert_eq!(
            procs.iter().map(|p| p.pid).collect::<Vec<_>>(),
            vec![4242, 4250]
        );
        assert_eq!(procs[0].name, "python3");
    }

    #[test]
    fn parses_fuser_output() {
        assert_eq!(parse_fuser("8000/tcp:             4242  4243e"), vec![4242, 4243]);
        assert!(parse_fuser("").is_empty());
    }

    #[test]
    fn parse_owners_falls_through_formats() {
        assert_eq!(parse_owners("p7\ncvllm\n")[0].pid, 7);
        assert_eq!(parse_owners("8000/tcp: 99")[0].pid, 99);
        assert!(parse_owners("").is_empty());
    }

    #[test]
    fn bound_check_anchors_port() {
        let cmd = bound_check_command(8000);
        assert!(cmd.ends_with("grep -Eq '[:.]8000$'"));
    }
}
