use crate::config::{Config, RemoteHost};
use crate::error::{Error, Result};
use std::collections::BTreeMap;

/// Name to connection descriptor lookup, fixed at construction.
#[derive(Debug, Clone, Default)]
pub struct HostRegistry {
    hosts: BTreeMap<String, RemoteHost>,
}

impl HostRegistry {
    pub fn from_config(config: &Config) -> Self {
        Self {
            hosts: config
                .hosts
                .iter()
                .map(|h| (h.name.clone(), h.clone()))
                .collect(),
        }
    }

    pub fn get(&self, name: &str) -> Result<&RemoteHost> {
        self.hosts
            .get(name)
            .ok_or_else(|| Error::HostNotFound(name.to_string()))
    }

    /// Like [`get`](Self::get), but refuses disabled hosts.
    pub fn enabled(&self, name: &str) -> Result<&RemoteHost> {
        let host = self.get(name)?;
        if !host.enabled {
            return Err(Error::HostDisabled(name.to_string()));
        }
        Ok(host)
    }

    pub fn iter(&self) -> impl Iterator<Item = &RemoteHost> {
        self.hosts.values()
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }
}
