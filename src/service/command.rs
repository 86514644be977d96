//! Launch command construction.
//!
//! Session launches are only issued inside an attached job container, so a
//! plain background job is enough to outlive the command and the session's
//! own disconnect. One-shot launches have no such host and
//! detach with `nohup`; their activation runs inside a `bash -c` that
//! `exec`s the server, which keeps `$!` pointing at the server itself.

use crate::config::{EnvironmentKind, FlagValue, LaunchConfig, ServiceSpec};
use shell_escape::escape;
use std::borrow::Cow;

/// Interpreter lookup for environments that ship the server system-wide.
const BUILTIN_PYTHON: &str = "\"$(command -v python3.10 || command -v python3)\"";

/// A launch command plus the files it writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchPlan {
    pub command: String,
    pub log_path: String,
    pub pid_file: String,
}

fn quote(s: &str) -> Cow<'_, str> {
    escape(s.into())
}

pub fn log_path(launch: &LaunchConfig, service: &str, port: u16) -> String {
    format!(
        "{}/fleet_{}_{}.log",
        launch.log_dir.trim_end_matches('/'),
        sanitize(service),
        port
    )
}

pub fn pid_file(launch: &LaunchConfig, service: &str) -> String {
    format!(
        "{}/fleet_{}.pid",
        launch.log_dir.trim_end_matches('/'),
        sanitize(service)
    )
}

/// Keep service ids usable as file name fragments.
fn sanitize(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

/// Server arguments after `-m <module>`.
pub fn server_args(spec: &ServiceSpec, port: u16, launch: &LaunchConfig) -> Vec<String> {
    let mut args = vec![
        format!("--model {}", quote(&spec.model_path)),
        format!("--port {}", port),
        format!("--max-model-len {}", spec.max_model_len),
        format!("--gpu-memory-utilization {}", spec.gpu_memory_utilization),
        format!("--tensor-parallel-size {}", spec.tensor_parallel_size),
        format!("--host {}", quote(&launch.bind_address)),
    ];
    if launch.trust_remote_code {
        args.push("--trust-remote-code".to_string());
    }

    for (key, value) in &spec.extra_flags {
        let flag = quote(&format!("--{}", key.replace('_', "-"))).into_owned();
        match value {
            FlagValue::Bool(true) => args.push(flag),
            FlagValue::Bool(false) => {}
            // Counted flag in old configs: any positive value enables it.
            FlagValue::Int(n) if key == "worker_use_ray" => {
                if *n > 0 {
                    args.push(flag);
                }
            }
            other => args.push(format!("{} {}", flag, quote(&other.to_string()))),
        }
    }
    args
}

fn env_prefix(spec: &ServiceSpec) -> String {
    if spec.gpu_indices.is_empty() {
        return String::new();
    }
    let devices: Vec<String> = spec.gpu_indices.iter().map(u32::to_string).collect();
    format!("CUDA_VISIBLE_DEVICES={} ", devices.join(","))
}

fn server_invocation(python: &str, spec: &ServiceSpec, port: u16, launch: &LaunchConfig) -> String {
    format!(
        "{} -m {} {}",
        python,
        quote(&launch.module),
        server_args(spec, port, launch).join(" ")
    )
}

/// Launch inside an activated session. `python` is the environment's own
/// interpreter when known, else whatever `python` resolves to after
/// activation.
pub fn session_launch(
    spec: &ServiceSpec,
    port: u16,
    launch: &LaunchConfig,
    python: Option<&str>,
) -> LaunchPlan {
    let log = log_path(launch, &spec.id, port);
    let pid_file = pid_file(launch, &spec.id);
    let python = python.map(|p| quote(p).into_owned()).unwrap_or_else(|| "python".to_string());
    let command = format!(
        "{}{} > {} 2>&1 & PID=$!; echo $PID; echo $PID > {}",
        env_prefix(spec),
        server_invocation(&python, spec, port, launch),
        quote(&log),
        quote(&pid_file)
    );
    LaunchPlan {
        command,
        log_path: log,
        pid_file,
    }
}

/// Detached one-shot launch. `activation` is an inline prefix ending in
/// `&& ` for named environments.
pub fn channel_launch(
    spec: &ServiceSpec,
    port: u16,
    launch: &LaunchConfig,
    activation: Option<&str>,
) -> LaunchPlan {
    let log = log_path(launch, &spec.id, port);
    let pid_file = pid_file(launch, &spec.id);
    let python = match spec.environment_kind() {
        EnvironmentKind::Builtin => BUILTIN_PYTHON.to_string(),
        EnvironmentKind::Named(_) => "python".to_string(),
        EnvironmentKind::Bare => quote(&launch.python).into_owned(),
    };
    let inner = format!(
        "{}{}exec {}",
        activation.unwrap_or_default(),
        env_prefix(spec),
        server_invocation(&python, spec, port, launch)
    );
    let command = format!(
        "nohup bash -c {} > {} 2>&1 < /dev/null & PID=$!; echo $PID; echo $PID > {}",
        quote(&inner),
        quote(&log),
        quote(&pid_file)
    );
    LaunchPlan {
        command,
        log_path: log,
        pid_file,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn spec() -> ServiceSpec {
        let mut spec = ServiceSpec::new("qwen-7b", "gpu-a", "/models/Qwen2-7B");
        spec.gpu_indices = vec![0, 1];
        spec.tensor_parallel_size = 2;
        spec.environment = Some("vllm".into());
        spec
    }

    #[test]
    fn server_args_follow_desired_parameters() {
        let mut spec = spec();
        spec.extra_flags = BTreeMap::from([
            ("enforce_eager".to_string(), FlagValue::Bool(true)),
            ("disable_log_stats".to_string(), FlagValue::Bool(false)),
            ("served_model_name".to_string(), FlagValue::Text("qwen chat".into())),
            ("worker_use_ray".to_string(), FlagValue::Int(0)),
        ]);
        let args = server_args(&spec, 8001, &LaunchConfig::default());
        assert_eq!(args[0], "--model /models/Qwen2-7B");
        assert!(args.contains(&"--port 8001".to_string()));
        assert!(args.contains(&"--tensor-parallel-size 2".to_string()));
        assert!(args.contains(&"--gpu-memory-utilization 0.9".to_string()));
        assert!(args.contains(&"--trust-remote-code".to_string()));
        assert!(args.contains(&"--enforce-eager".to_string()));
        assert!(args.contains(&"--served-model-name 'qwen chat'".to_string()));
        assert!(!args.iter().any(|a| a.contains("disable-log-stats")));
        assert!(!args.iter().any(|a| a.contains("worker-use-ray")));
    }

    #[test]
    fn extra_flag_keys_are_quoted() {
        let mut spec = spec();
        spec.extra_flags = BTreeMap::from([(
            "x $(touch /tmp/owned)".to_string(),
            FlagValue::Bool(true),
        )]);
        let args = server_args(&spec, 8001, &LaunchConfig::default());
        assert_eq!(args.last().unwrap(), "'--x $(touch /tmp/owned)'");

        let plan = channel_launch(&spec, 8001, &LaunchConfig::default(), None);
        // Still one quoted word once unwrapped by `bash -c`.
        assert!(
            plan.command.contains(r"'\''--x $(touch /tmp/owned)'\''"),
            "{}",
            plan.command
        );
    }

    #[test]
    fn session_launch_backgrounds_and_writes_pid_file() {
        let plan = session_launch(
            &spec(),
            8001,
            &LaunchConfig::default(),
            Some("/opt/miniconda3/envs/vllm/bin/python"),
        );
        assert!(plan.command.starts_with(
            "CUDA_VISIBLE_DEVICES=0,1 /opt/miniconda3/envs/vllm/bin/python -m vllm.entrypoints.openai.api_server --model"
        ));
        assert!(plan
            .command
            .ends_with("> /tmp/fleet_qwen-7b_8001.log 2>&1 & PID=$!; echo $PID; echo $PID > /tmp/fleet_qwen-7b.pid"));
        assert!(!plan.command.contains("nohup"));
        assert_eq!(plan.log_path, "/tmp/fleet_qwen-7b_8001.log");
        assert_eq!(plan.pid_file, "/tmp/fleet_qwen-7b.pid");
    }

    #[test]
    fn channel_launch_detaches_and_execs_after_activation() {
        let plan = channel_launch(&spec(), 8002, &LaunchConfig::default(), Some("conda activate vllm && "));
        assert!(plan.command.starts_with("nohup bash -c '"));
        assert!(plan.command.contains("conda activate vllm && CUDA_VISIBLE_DEVICES=0,1 exec python -m"));
        assert!(plan.command.contains("< /dev/null & PID=$!; echo $PID"));
    }

    #[test]
    fn bare_and_builtin_interpreters() {
        let mut bare = spec();
        bare.environment = Some("system-python".into());
        bare.gpu_indices.clear();
        let plan = channel_launch(&bare, 8000, &LaunchConfig::default(), None);
        assert!(plan.command.contains("exec python3 -m"));
        assert!(!plan.command.contains("CUDA_VISIBLE_DEVICES"));

        let mut builtin = spec();
        builtin.environment = Some("vllm-builtin".into());
        let plan = channel_launch(&builtin, 8000, &LaunchConfig::default(), None);
        assert!(plan.command.contains("command -v python3.10 || command -v python3"));
    }

    #[test]
    fn file_names_are_sanitized() {
        let launch = LaunchConfig {
            log_dir: "/var/log/fleet/".into(),
            ..LaunchConfig::default()
        };
        assert_eq!(log_path(&launch, "team/qwen 7b", 8000), "/var/log/fleet/fleet_team_qwen_7b_8000.log");
    }
}
