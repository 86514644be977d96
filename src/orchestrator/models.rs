//! Model checkpoints available on a host.

use super::Orchestrator;
use crate::error::{Error, Result};
use crate::transport::CommandOutput;
use serde::Serialize;
use serde_json::Value;
use shell_escape::escape;
use std::path::Path;

/// Files that mark a directory as a model checkpoint.
const MARKERS: &[&str] = &["config.json", "*.safetensors", "pytorch_model.bin"];

/// Checkpoint directories beyond this are not inspected.
const MAX_MODELS: usize = 64;

/// Keys HF configs use for the context length, in order of preference.
const LENGTH_KEYS: &[&str] = &[
    "max_position_embeddings",
    "max_sequence_length",
    "seq_length",
    "n_positions",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelKind {
    Llm,
    Chat,
    Vision,
}

/// One checkpoint directory found under a host's model root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelInfo {
    pub name: String,
    pub path: String,
    pub size_mb: Option<u64>,
    pub kind: ModelKind,
    pub model_type: Option<String>,
    pub architecture: Option<String>,
    pub max_length: Option<u64>,
}

impl ModelInfo {
    fn new(path: &str) -> Self {
        let name = Path::new(path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_string());
        Self {
            name,
            path: path.to_string(),
            size_mb: None,
            kind: ModelKind::Llm,
            model_type: None,
            architecture: None,
            max_length: None,
        }
    }

    /// Fill type, architecture and context length from a `config.json`.
    pub fn apply_config(&mut self, config: &Value) {
        self.model_type = config
            .get("model_type")
            .and_then(Value::as_str)
            .map(str::to_string);
        self.architecture = config
            .get("architectures")
            .and_then(|a| a.get(0))
            .and_then(Value::as_str)
            .map(str::to_string);
        // Multimodal configs keep the language model's settings nested.
        self.max_length = max_length(config)
            .or_else(|| config.get("text_config").and_then(max_length));

        let model_type = self.model_type.as_deref().unwrap_or_default().to_lowercase();
        self.kind = if model_type.contains("vision") || model_type.contains("_vl") {
            ModelKind::Vision
        } else if model_type.contains("chat") {
            ModelKind::Chat
        } else {
            ModelKind::Llm
        };
    }
}

fn max_length(config: &Value) -> Option<u64> {
    LENGTH_KEYS
        .iter()
        .find_map(|key| config.get(*key).and_then(Value::as_u64))
}

/// `find` over `root` for checkpoint marker files, two levels deep.
pub fn find_command(root: &str) -> String {
    let names = MARKERS
        .iter()
        .map(|m| format!("-name {}", escape((*m).into())))
        .collect::<Vec<_>>()
        .join(" -o ");
    format!(
        "find {} -maxdepth 2 -type f \\( {} \\) 2>/dev/null | sort",
        escape(root.into()),
        names
    )
}

/// Distinct parent directories of the marker files, in listing order.
pub fn parse_model_dirs(output: &str) -> Vec<String> {
    let mut dirs: Vec<String> = Vec::new();
    for line in output.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let Some(dir) = Path::new(line).parent() else {
            continue;
        };
        let dir = dir.to_string_lossy().into_owned();
        if !dir.is_empty() && !dirs.contains(&dir) {
            dirs.push(dir);
        }
    }
    dirs
}

/// Megabytes from `du -sm` output.
pub fn parse_du_megabytes(output: &str) -> Option<u64> {
    output.split_whitespace().next()?.parse().ok()
}

impl Orchestrator {
    /// Checkpoint directories under `root`, or under the host's
    /// `model_root` when no root is given.
    #[tracing::instrument(skip(self))]
    pub async fn discover_models(&self, host: &str, root: Option<&str>) -> Result<Vec<ModelInfo>> {
        let host = self.host(host)?.clone();
        let root = match root.or(host.model_root.as_deref()) {
            Some(root) => root.trim_end_matches('/').to_string(),
            None => {
                return Err(Error::Validation(format!(
                    "Host '{}' has no model_root; pass a directory to search",
                    host.name
                )))
            }
        };
        let timeout = self.config.timeouts.command;

        let listing = self.run_checked(&host, &find_command(&root), timeout).await?;
        let mut dirs = parse_model_dirs(&listing.stdout);
        if dirs.is_empty() {
            tracing::info!("No model checkpoints under {} on {}", root, host.name);
            return Ok(Vec::new());
        }
        if dirs.len() > MAX_MODELS {
            tracing::warn!(
                "{} checkpoint directories under {} on {}, inspecting the first {}",
                dirs.len(),
                root,
                host.name,
                MAX_MODELS
            );
            dirs.truncate(MAX_MODELS);
        }

        let mut models = Vec::with_capacity(dirs.len());
        for dir in dirs {
            let mut info = ModelInfo::new(&dir);
            let quoted = escape(dir.as_str().into());

            let du = self.run_checked(&host, &format!("du -sm {}", quoted), timeout).await?;
            if du.success() {
                info.size_mb = parse_du_megabytes(&du.stdout);
            }

            let config_path = format!("{}/config.json", dir);
            let cat = self
                .run_checked(&host, &format!("cat {}", escape(config_path.as_str().into())), timeout)
                .await?;
            apply_config_output(&mut info, &cat);
            models.push(info);
        }
        tracing::info!("Found {} model(s) under {} on {}", models.len(), root, host.name);
        Ok(models)
    }
}

fn apply_config_output(info: &mut ModelInfo, out: &CommandOutput) {
    if !out.success() || out.stdout.trim().is_empty() {
        return;
    }
    match serde_json::from_str::<Value>(&out.stdout) {
        Ok(config) => info.apply_config(&config),
        Err(e) => tracing::debug!("Unreadable config.json in {}: {}", info.path, e),
    }
}
