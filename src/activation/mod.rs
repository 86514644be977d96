//! Environment activation inside a persistent session.
//!
//! A session's activation moves `Unknown -> Activating -> Verified`, and
//! drops back to `Unknown` when a verification disagrees. Verification reads
//! several independent [`Signal`]s and a configurable [`Strictness`]
//! decides how many must agree.
//!
//! [`Strictness`]: crate::config::Strictness

mod controller;
pub mod locate;
pub mod signals;

pub use controller::ActivationController;
pub use locate::{inline_activation_prefix, parse_env_list, resolve_env, CondaEnv};
pub use signals::{env_matches, evaluate, Signal, SignalReading};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActivationState {
    #[default]
    Unknown,
    Activating,
    Verified,
}

impl fmt::Display for ActivationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActivationState::Unknown => write!(f, "UNKNOWN"),
            ActivationState::Activating => write!(f, "ACTIVATING"),
            ActivationState::Verified => write!(f, "VERIFIED"),
        }
    }
}

/// Cached fact that a session has a verified environment.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivationRecord {
    /// The name or path that was requested.
    pub env_name: String,
    pub env_path: Option<String>,
    pub verified_at: DateTime<Utc>,
    /// First signal that matched.
    pub method: Signal,
    pub(crate) expires_at: Instant,
}

impl ActivationRecord {
    pub fn is_fresh(&self) -> bool {
        Instant::now() < self.expires_at
    }

    /// Python interpreter inside the environment, when its path is known.
    pub fn python_path(&self) -> Option<String> {
        self.env_path
            .as_deref()
            .map(|p| format!("{}/bin/python", p.trim_end_matches('/')))
    }
}
