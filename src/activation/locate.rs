//! Finding the environment tool and resolving environments on a host.

use serde::{Deserialize, Serialize};
use shell_escape::escape;
use std::borrow::Cow;

/// One row of `conda env list`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CondaEnv {
    /// Absent for environments outside the configured envs directories.
    pub name: Option<String>,
    pub path: String,
    pub active: bool,
}

/// A resolved activation target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedEnv {
    /// What `conda activate` is given.
    pub target: String,
    pub path: Option<String>,
}

fn quoted(s: &str) -> Cow<'_, str> {
    escape(s.into())
}

/// Shell snippet printing the first executable conda among `PATH` and the
/// well-known install locations.
pub fn locate_command(tool_paths: &[String]) -> String {
    let candidates: Vec<Cow<'_, str>> = tool_paths.iter().map(|p| quoted(p)).collect();
    format!(
        "for c in \"$(command -v conda 2>/dev/null)\" {}; do [ -n \"$c\" ] && [ -x \"$c\" ] && {{ echo \"$c\"; break; }}; done",
        candidates.join(" ")
    )
}

/// Install root of a conda binary (`/opt/miniconda3/bin/conda` -> `/opt/miniconda3`).
pub fn tool_base(tool: &str) -> &str {
    let parent = |p: &str| -> Option<usize> { p.trim_end_matches('/').rfind('/') };
    match parent(tool) {
        Some(i) => {
            let bin = &tool[..i];
            match parent(bin) {
                Some(0) => "/",
                Some(j) => &bin[..j],
                None => bin,
            }
        }
        None => tool,
    }
}

/// Parse `conda env list` output.
pub fn parse_env_list(output: &str) -> Vec<CondaEnv> {
    output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .filter_map(|line| {
            let mut fields: Vec<&str> = line.split_whitespace().collect();
            let path = fields.pop()?;
            if !path.starts_with('/') {
                return None;
            }
            let active = fields.last() == Some(&"*");
            if active {
                fields.pop();
            }
            Some(CondaEnv {
                name: fields.first().map(|n| n.to_string()),
                path: path.to_string(),
                active,
            })
        })
        .collect()
}

/// Pick the activation target for `wanted`. Absolute paths are accepted as
/// given; names match an env's name or the last segment of its path.
pub fn resolve_env(envs: &[CondaEnv], wanted: &str) -> Option<ResolvedEnv> {
    if wanted.starts_with('/') {
        return Some(ResolvedEnv {
            target: wanted.to_string(),
            path: Some(wanted.to_string()),
        });
    }
    if let Some(env) = envs.iter().find(|e| e.name.as_deref() == Some(wanted)) {
        return Some(ResolvedEnv {
            target: wanted.to_string(),
            path: Some(env.path.clone()),
        });
    }
    envs.iter()
        .find(|e| e.path.trim_end_matches('/').rsplit('/').next() == Some(wanted))
        .map(|env| ResolvedEnv {
            target: env.path.clone(),
            path: Some(env.path.clone()),
        })
}

/// Names (or paths for unnamed envs) for error messages.
pub fn env_labels(envs: &[CondaEnv]) -> Vec<String> {
    envs.iter()
        .map(|e| e.name.clone().unwrap_or_else(|| e.path.clone()))
        .collect()
}

/// Hook conda into the current shell and activate `target`.
pub fn activate_command(tool: &str, target: &str) -> String {
    let base = tool_base(tool);
    format!(
        "source {}/etc/profile.d/conda.sh 2>/dev/null || eval \"$({} shell.bash hook)\"; conda activate {}",
        quoted(base),
        quoted(tool),
        quoted(target)
    )
}

/// Self-contained activation prefix for one-shot commands, which have no
/// session state to rely on. Ends with `&&` so the launch only runs when
/// activation succeeded.
pub fn inline_activation_prefix(tool_paths: &[String], env: &str) -> String {
    let candidates: Vec<Cow<'_, str>> = tool_paths.iter().map(|p| quoted(p)).collect();
    format!(
        "for c in \"$(command -v conda 2>/dev/null)\" {}; do [ -n \"$c\" ] && [ -x \"$c\" ] && {{ CONDA_BIN=\"$c\"; break; }}; done; \
         [ -n \"$CONDA_BIN\" ] && eval \"$(\"$CONDA_BIN\" shell.bash hook)\" && conda activate {} && ",
        candidates.join(" "),
        quoted(env)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    const ENV_LIST: &str = "\
# conda environments:
#
base                  *  /opt/miniconda3
vllm                     /opt/miniconda3/envs/vllm
                         /data/shared/envs/serve
";

    #[test]
    fn parses_named_active_and_unnamed_envs() {
        let envs = parse_env_list(ENV_LIST);
        assert_eq!(envs.len(), 3);
        assert_eq!(envs[0].name.as_deref(), Some("base"));
        assert!(envs[0].active);
        assert_eq!(envs[1].path, "/opt/miniconda3/envs/vllm");
        assert!(!envs[1].active);
        assert_eq!(envs[2].name, None);
        assert_eq!(envs[2].path, "/data/shared/envs/serve");
    }

    #[test]
    fn resolves_by_name_path_segment_or_absolute_path() {
        let envs = parse_env_list(ENV_LIST);

        let by_name = resolve_env(&envs, "vllm").unwrap();
        assert_eq!(by_name.target, "vllm");
        assert_eq!(by_name.path.as_deref(), Some("/opt/miniconda3/envs/vllm"));

        let by_segment = resolve_env(&envs, "serve").unwrap();
        assert_eq!(by_segment.target, "/data/shared/envs/serve");

        let absolute = resolve_env(&[], "/srv/envs/x").unwrap();
        assert_eq!(absolute.target, "/srv/envs/x");

        assert_eq!(resolve_env(&envs, "missing"), None);
        assert_eq!(env_labels(&envs), vec!["base", "vllm", "/data/shared/envs/serve"]);
    }

    #[test]
    fn tool_base_strips_bin_conda() {
        assert_eq!(tool_base("/opt/miniconda3/bin/conda"), "/opt/miniconda3");
        assert_eq!(tool_base("/root/anaconda3/condabin/conda"), "/root/anaconda3");
        assert_eq!(tool_base("/bin/conda"), "/");
    }

    #[test]
    fn commands_quote_their_arguments() {
        let locate = locate_command(&["/opt/miniconda3/bin/conda".into(), "/my envs/bin/conda".into()]);
        assert!(locate.contains("/opt/miniconda3/bin/conda '/my envs/bin/conda'"));

        let activate = activate_command("/opt/miniconda3/bin/conda", "vllm");
        assert!(activate.starts_with("source /opt/miniconda3/etc/profile.d/conda.sh"));
        assert!(activate.ends_with("conda activate vllm"));

        let prefix = inline_activation_prefix(&["/opt/miniconda3/bin/conda".into()], "my env");
        assert!(prefix.contains("conda activate 'my env' && "));
    }
}
