use super::StateSink;
use crate::error::{Error, Result};
use crate::service::{ManagedService, Status};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

const STATE_FILE_VERSION: u32 = 1;

#[derive(Debug, Default, Serialize, Deserialize)]
struct StateFile {
    version: u32,
    services: Vec<ManagedService>,
}

/// Last-known service rows in a JSON file, rewritten on every transition.
pub struct JsonFileStateSink {
    path: PathBuf,
    rows: tokio::sync::Mutex<BTreeMap<String, ManagedService>>,
}

impl JsonFileStateSink {
    /// Open the state file, loading existing rows. A missing file is empty.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let rows = Self::load(&path)?
            .into_iter()
            .map(|s| (s.spec.id.clone(), s))
            .collect();
        Ok(Self {
            path,
            rows: tokio::sync::Mutex::new(rows),
        })
    }

    /// Default location: `~/.fleet/state.json`.
    pub fn default_path() -> Result<PathBuf> {
        let home = dirs::home_dir()
            .ok_or_else(|| Error::Config("Could not determine home directory".to_string()))?;
        Ok(home.join(".fleet").join("state.json"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the rows persisted at `path`.
    pub fn load(path: &Path) -> Result<Vec<ManagedService>> {
        if !path.exists() {
            return Ok(Vec::new());
        }
        let contents = fs::read_to_string(path)?;
        if contents.trim().is_empty() {
            return Ok(Vec::new());
        }
        let file: StateFile = serde_json::from_str(&contents)?;
        if file.version > STATE_FILE_VERSION {
            return Err(Error::Config(format!(
                "State file {} has version {}, newer than supported version {}",
                path.display(),
                file.version,
                STATE_FILE_VERSION
            )));
        }
        Ok(file.services)
    }

    pub async fn rows(&self) -> Vec<ManagedService> {
        self.rows.lock().await.values().cloned().collect()
    }

    fn flush(&self, rows: &BTreeMap<String, ManagedService>) -> Result<()> {
        let file = StateFile {
            version: STATE_FILE_VERSION,
            services: rows.values().cloned().collect(),
        };
        let contents = serde_json::to_string_pretty(&file)?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        atomic_write(&self.path, &contents)
    }
}

/// Atomic file write using write-then-rename pattern
fn atomic_write(path: &Path, contents: &str) -> Result<()> {
    use std::io::Write;

    let temp_path = path.with_extension("tmp");
    let mut file = fs::File::create(&temp_path)
        .map_err(|e| Error::Config(format!("Failed to create temp file: {}", e)))?;

    file.write_all(contents.as_bytes())
        .map_err(|e| Error::Config(format!("Failed to write temp file: {}", e)))?;

    file.sync_all()
        .map_err(|e| Error::Config(format!("Failed to sync temp file: {}", e)))?;

    drop(file);

    fs::rename(&temp_path, path)
        .map_err(|e| Error::Config(format!("Failed to rename temp file: {}", e)))?;

    Ok(())
}

#[async_trait]
impl StateSink for JsonFileStateSink {
    async fn record(&self, snapshot: &ManagedService, _previous: Status) -> Result<()> {
        let mut rows = self.rows.lock().await;
        rows.insert(snapshot.spec.id.clone(), snapshot.clone());
        self.flush(&rows)
    }

    async fn remove(&self, id: &str) -> Result<()> {
        let mut rows = self.rows.lock().await;
        if rows.remove(id).is_some() {
            self.flush(&rows)?;
        }
        Ok(())
    }
}
