//! Text-matching rules for scraping an interactive shell.
//!
//! Everything that interprets free-form terminal text sits behind
//! [`ShellDialect`], so the heuristics can be swapped or tested without a
//! session. [`BashDialect`] covers bash/zsh prompts on mainstream Linux
//! distributions, including the `(env) ` prefix conda adds.

use regex::Regex;
use std::sync::OnceLock;

/// Prefix of the completion marker echoed after every session command.
pub const SENTINEL_PREFIX: &str = "__FLEET_DONE_";

static ANSI_REGEX: OnceLock<Regex> = OnceLock::new();
static PROMPT_REGEX: OnceLock<Regex> = OnceLock::new();
static PROMPT_ENV_REGEX: OnceLock<Regex> = OnceLock::new();
static PASSWORD_PROMPT_REGEX: OnceLock<Regex> = OnceLock::new();

fn ansi_regex() -> &'static Regex {
    ANSI_REGEX.get_or_init(|| {
        Regex::new(
            r"\x1b(?:\[[0-9;?]*[ -/]*[@-~]|\][^\x07\x1b]*(?:\x07|\x1b\\)|[()][0-9A-Za-z]|[=>78DEHM])|\[\?[0-9]+[hl]",
        )
        .expect("static regex pattern is valid")
    })
}

fn prompt_regex() -> &'static Regex {
    PROMPT_REGEX.get_or_init(|| {
        Regex::new(r"^(?:\([^)]+\)\s+)?(?:[^@\s\[]+@[^:\s]+:[^$#]*|\[[^@\]\s]+@[^\]]+\])[$#] ?")
            .expect("static regex pattern is valid")
    })
}

fn prompt_env_regex() -> &'static Regex {
    PROMPT_ENV_REGEX
        .get_or_init(|| Regex::new(r"^\(([^)\s]+)\)\s").expect("static regex pattern is valid"))
}

fn password_prompt_regex() -> &'static Regex {
    PASSWORD_PROMPT_REGEX.get_or_init(|| {
        Regex::new(r"(?i)(?:password|passwort|密码)[^\n]*[:：]\s*$")
            .expect("static regex pattern is valid")
    })
}

/// Remove terminal control sequences and carriage returns.
pub fn strip_ansi(text: &str) -> String {
    ansi_regex().replace_all(text, "").replace('\r', "")
}

/// Scraping rules for one shell flavour.
pub trait ShellDialect: Send + Sync {
    /// The tail of `text` is asking for a password.
    fn is_password_prompt(&self, text: &str) -> bool;

    /// `text` reports a rejected credential.
    fn is_auth_failure(&self, text: &str) -> bool;

    /// The tail of `text` is a root shell prompt.
    fn is_root_prompt(&self, text: &str) -> bool;

    /// `line` with any leading prompt removed.
    fn strip_prompt<'a>(&self, line: &'a str) -> &'a str;

    /// Environment name shown in a prompt or PS1 value, e.g. `vllm` for
    /// `(vllm) root@gpu:~# `.
    fn prompt_environment(&self, prompt: &str) -> Option<String>;

    /// Clean captured text: strip control sequences, prompts, echoed input
    /// lines and blank lines.
    fn clean_output(&self, raw: &str, echoed: &[&str]) -> String {
        let text = strip_ansi(raw);
        let echoed: Vec<&str> = echoed
            .iter()
            .flat_map(|e| e.lines())
            .map(str::trim)
            .filter(|e| !e.is_empty())
            .collect();

        text.lines()
            .filter_map(|line| {
                let content = self.strip_prompt(line).trim_end();
                let trimmed = content.trim();
                if trimmed.is_empty() || echoed.contains(&trimmed) {
                    None
                } else {
                    Some(content.to_string())
                }
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Prompt text printed in front of the first echoed input line.
    fn prompt_before_echo(&self, raw: &str, first_input: &str) -> Option<String> {
        let first_input = first_input.lines().next()?.trim();
        if first_input.is_empty() {
            return None;
        }
        strip_ansi(raw).lines().find_map(|line| {
            let idx = line.find(first_input)?;
            let prompt = line[..idx].trim_end();
            (!prompt.is_empty()).then(|| prompt.to_string())
        })
    }
}

/// bash/zsh with the default Debian/RHEL prompt layouts.
#[derive(Debug, Default, Clone, Copy)]
pub struct BashDialect;

impl ShellDialect for BashDialect {
    fn is_password_prompt(&self, text: &str) -> bool {
        let clean = strip_ansi(text);
        password_prompt_regex().is_match(clean.trim_end_matches('\n'))
    }

    fn is_auth_failure(&self, text: &str) -> bool {
        let lower = strip_ansi(text).to_lowercase();
        ["authentication failure", "sorry", "incorrect password", "认证失败"]
            .iter()
            .any(|needle| lower.contains(needle))
    }

    fn is_root_prompt(&self, text: &str) -> bool {
        let clean = strip_ansi(text);
        let Some(last) = clean.lines().rev().find(|l| !l.trim().is_empty()) else {
            return false;
        };
        let last = last.trim_end();
        last.ends_with('#') || last.starts_with("root@") || last.contains(" root@")
    }

    fn strip_prompt<'a>(&self, line: &'a str) -> &'a str {
        match prompt_regex().find(line) {
            Some(m) => &line[m.end()..],
            None => line,
        }
    }

    fn prompt_environment(&self, prompt: &str) -> Option<String> {
        let clean = strip_ansi(prompt);
        prompt_env_regex()
            .captures(clean.trim_start())
            .map(|c| c[1].to_string())
    }
}

/// A per-command completion marker.
///
/// The echoed command line reads `echo "__FLEET_DONE_""<token>:$?"`, which
/// never contains the joined marker text, so only the shell's actual output
/// matches [`Sentinel::find`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sentinel {
    token: String,
}

impl Sentinel {
    pub fn generate() -> Self {
        use rand::Rng;
        let token: u64 = rand::thread_rng().gen();
        Self {
            token: format!("{:016x}", token),
        }
    }

    pub fn with_token(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// Shell line that prints the marker and the previous exit code.
    pub fn command(&self) -> String {
        format!("echo \"{}\"\"{}:$?\"", SENTINEL_PREFIX, self.token)
    }

    /// Locate the marker in captured text. Returns the byte offset where the
    /// marker starts and the exit code. Requires a line ending after the code
    /// so a chunk boundary inside the number is not misread.
    pub fn find(&self, text: &str) -> Option<(usize, i32)> {
        let marker = format!("{}{}:", SENTINEL_PREFIX, self.token);
        let start = text.find(&marker)?;
        let rest = &text[start + marker.len()..];
        let end = rest.find(|c: char| c == '\r' || c == '\n')?;
        let code = rest[..end].trim().parse::<i32>().ok()?;
        Some((start, code))
    }
}
