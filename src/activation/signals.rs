//! Independent signals that an environment is active, and the policy that
//! combines them.

use crate::config::Strictness;
use crate::session::ShellDialect;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Where an observation of the active environment came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Signal {
    /// `(env)` prefix in the shell prompt or `$PS1`.
    Prompt,
    /// `$CONDA_DEFAULT_ENV`, falling back to the last segment of `$CONDA_PREFIX`.
    EnvVar,
    /// `conda info` "active environment" line.
    ToolInfo,
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Signal::Prompt => write!(f, "prompt"),
            Signal::EnvVar => write!(f, "environment variable"),
            Signal::ToolInfo => write!(f, "tool info"),
        }
    }
}

/// One signal's observation compared against the expected environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalReading {
    pub signal: Signal,
    pub observed: Option<String>,
    pub matched: bool,
}

impl SignalReading {
    pub fn new(signal: Signal, observed: Option<String>, expected: &str) -> Self {
        let matched = observed
            .as_deref()
            .is_some_and(|o| env_matches(o, expected));
        Self {
            signal,
            observed,
            matched,
        }
    }
}

impl fmt::Display for SignalReading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.observed {
            Some(o) if self.matched => write!(f, "{}: '{}' (match)", self.signal, o),
            Some(o) => write!(f, "{}: '{}' (mismatch)", self.signal, o),
            None => write!(f, "{}: nothing observed", self.signal),
        }
    }
}

fn last_segment(s: &str) -> &str {
    s.trim_end_matches('/').rsplit('/').next().unwrap_or(s)
}

/// An observed environment matches when it equals the expected one or when
/// their last path segments agree (`/opt/conda/envs/vllm` matches `vllm`).
pub fn env_matches(observed: &str, expected: &str) -> bool {
    let observed = observed.trim();
    let expected = expected.trim();
    if observed.is_empty() || expected.is_empty() {
        return false;
    }
    observed == expected || last_segment(observed) == last_segment(expected)
}

/// Apply a strictness policy to a set of readings.
pub fn evaluate(readings: &[SignalReading], strictness: Strictness) -> bool {
    let matched = readings.iter().filter(|r| r.matched).count();
    let observed = readings.iter().filter(|r| r.observed.is_some()).count();
    match strictness {
        Strictness::Any => matched >= 1,
        Strictness::All => observed >= 1 && matched == observed,
        Strictness::AtLeast(n) => matched >= usize::from(n.max(1)),
    }
}

/// Shell line printing what the verification parser reads. `tool` adds the
/// best-effort `conda info` signal.
pub fn verification_command(tool: Option<&str>) -> String {
    let mut cmd = String::from(
        "echo \"PS1=$PS1\"; echo \"ENV=$CONDA_DEFAULT_ENV\"; echo \"PREFIX=$CONDA_PREFIX\"",
    );
    if let Some(tool) = tool {
        cmd.push_str(&format!(
            "; {} info 2>/dev/null | grep -i 'active environment'",
            shell_escape::escape(tool.into())
        ));
    }
    cmd
}

/// Parse the output of [`verification_command`] into readings.
///
/// `prompt` is the live prompt seen in front of the command echo; it takes
/// precedence over the `$PS1` value, which some shells leave unexpanded.
pub fn read_signals(
    output: &str,
    prompt: Option<&str>,
    expected: &str,
    dialect: &dyn ShellDialect,
    with_tool: bool,
) -> Vec<SignalReading> {
    let mut ps1 = None;
    let mut env = None;
    let mut prefix = None;
    let mut tool = None;

    for line in output.lines().map(str::trim) {
        if let Some(v) = line.strip_prefix("PS1=") {
            ps1 = Some(v.to_string());
        } else if let Some(v) = line.strip_prefix("ENV=") {
            env = non_empty(v);
        } else if let Some(v) = line.strip_prefix("PREFIX=") {
            prefix = non_empty(v);
        } else if line.to_lowercase().starts_with("active environment") {
            tool = line.split_once(':').and_then(|(_, v)| non_empty(v));
        }
    }

    let prompt_env = prompt
        .and_then(|p| dialect.prompt_environment(p))
        .or_else(|| ps1.as_deref().and_then(|p| dialect.prompt_environment(p)));
    let env_var = env.or_else(|| prefix.map(|p| last_segment(&p).to_string()));

    let mut readings = vec![
        SignalReading::new(Signal::Prompt, prompt_env, expected),
        SignalReading::new(Signal::EnvVar, env_var, expected),
    ];
    if with_tool {
        readings.push(SignalReading::new(Signal::ToolInfo, tool, expected));
    }
    readings
}

fn non_empty(v: &str) -> Option<String> {
    let v = v.trim();
    (!v.is_empty()).then(|| v.to_string())
}
