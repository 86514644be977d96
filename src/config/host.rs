//! Remote host descriptors.

use super::PortRange;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A GPU host reached over SSH. Immutable once loaded, identified by `name`.
#[derive(Clone, Serialize, Deserialize)]
pub struct RemoteHost {
    pub name: String,

    /// Hostname or IP address.
    #[serde(alias = "host")]
    pub address: String,

    #[serde(default = "default_ssh_port")]
    pub port: u16,

    pub username: String,

    #[serde(default, skip_serializing)]
    pub password: Option<String>,

    /// Environment variable holding the login password.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_env: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_path: Option<String>,

    #[serde(default, skip_serializing)]
    pub key_passphrase: Option<String>,

    /// Credential for `su -`. Falls back to the login password.
    #[serde(default, skip_serializing)]
    pub root_password: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_password_env: Option<String>,

    #[serde(default)]
    pub gpu_count: u32,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Per-host override of the global port range.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port_range: Option<PortRange>,

    /// Directory searched by model discovery.
    #[serde(default, alias = "model_path", skip_serializing_if = "Option::is_none")]
    pub model_root: Option<String>,
}

fn default_ssh_port() -> u16 {
    22
}

fn default_enabled() -> bool {
    true
}

impl RemoteHost {
    pub fn new(name: impl Into<String>, address: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            port: default_ssh_port(),
            username: username.into(),
            password: None,
            password_env: None,
            key_path: None,
            key_passphrase: None,
            root_password: None,
            root_password_env: None,
            gpu_count: 0,
            enabled: true,
            port_range: None,
            model_root: None,
        }
    }

    /// `address:port` suitable for `ToSocketAddrs`.
    pub fn socket_addr(&self) -> String {
        if self.address.contains(':') && !self.address.starts_with('[') {
            format!("[{}]:{}", self.address, self.port)
        } else {
            format!("{}:{}", self.address, self.port)
        }
    }

    /// Password used for privilege escalation, if any.
    pub fn escalation_password(&self) -> Option<&str> {
        self.root_password
            .as_deref()
            .or(self.password.as_deref())
    }

    /// Fill `password` / `root_password` from their `*_env` variables.
    pub fn resolve_secrets(&mut self) -> Result<()> {
        if self.password.is_none() {
            if let Some(var) = &self.password_env {
                self.password = Some(read_env(var, &self.name)?);
            }
        }
        if self.root_password.is_none() {
            if let Some(var) = &self.root_password_env {
                self.root_password = Some(read_env(var, &self.name)?);
            }
        }
        Ok(())
    }

    /// Expanded key path (`~` resolved against the home directory).
    pub fn expanded_key_path(&self) -> Option<String> {
        let path = self.key_path.as_ref()?;
        if let Some(rest) = path.strip_prefix("~/") {
            if let Some(home) = dirs::home_dir() {
                return Some(home.join(rest).to_string_lossy().into_owned());
            }
        }
        Some(path.clone())
    }
}

fn read_env(var: &str, host: &str) -> Result<String> {
    std::env::var(var).map_err(|_| {
        Error::Config(format!(
            "Host '{}' reads its credential from ${}, which is not set",
            host, var
        ))
    })
}

// Credentials stay out of logs and panic messages.
impl fmt::Debug for RemoteHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteHost")
            .field("name", &self.name)
            .field("address", &self.address)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("key_path", &self.key_path)
            .field("root_password", &self.root_password.as_ref().map(|_| "<redacted>"))
            .field("gpu_count", &self.gpu_count)
            .field("enabled", &self.enabled)
            .field("port_range", &self.port_range)
            .field("model_root", &self.model_root)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_host() {
        let yaml = r#"
name: gpu-a
host: 10.0.0.5
username: ops
gpu_count: 8
"#;
        let host: RemoteHost = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(host.name, "gpu-a");
        assert_eq!(host.address, "10.0.0.5");
        assert_eq!(host.port, 22);
        assert!(host.enabled);
        assert_eq!(host.socket_addr(), "10.0.0.5:22");
    }

    #[test]
    fn ipv6_addresses_are_bracketed() {
        let mut host = RemoteHost::new("v6", "fe80::1", "ops");
        host.port = 2222;
        assert_eq!(host.socket_addr(), "[fe80::1]:2222");
    }

    #[test]
    fn escalation_falls_back_to_login_password() {
        let mut host = RemoteHost::new("a", "h", "u");
        assert_eq!(host.escalation_password(), None);
        host.password = Some("login".into());
        assert_eq!(host.escalation_password(), Some("login"));
        host.root_password = Some("root".into());
        assert_eq!(host.escalation_password(), Some("root"));
    }

    #[test]
    fn debug_output_redacts_credentials() {
        let mut host = RemoteHost::new("a", "h", "u");
        host.password = Some("hunter2".into());
        host.root_password = Some("toor".into());
        let rendered = format!("{:?}", host);
        assert!(!rendered.contains("hunter2"));
        assert!(!rendered.contains("toor"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn missing_env_credential_is_a_config_error() {
        let mut host = RemoteHost::new("a", "h", "u");
        host.password_env = Some("FLEET_TEST_SURELY_UNSET_VAR_91823".into());
        assert!(matches!(host.resolve_secrets(), Err(Error::Config(_))));
    }
}
