use super::{is_valid_flag_key, Config, ServiceSpec};
use crate::error::{Error, Result};
use std::collections::HashSet;

impl Config {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let mut host_names = HashSet::new();
        for host in &self.hosts {
            if host.name.trim().is_empty() {
                return Err(Error::Validation("Host with empty name".to_string()));
            }
            if !host_names.insert(host.name.as_str()) {
                return Err(Error::Validation(format!(
                    "Duplicate host name '{}'",
                    host.name
                )));
            }
            if let Some(range) = host.port_range {
                if range.is_empty() {
                    return Err(Error::Validation(format!(
                        "Host '{}' has an empty port range {}",
                        host.name, range
                    )));
                }
            }
        }

        if self.ports.range().is_empty() {
            return Err(Error::Validation(format!(
                "Port range {} is empty (start must be below end)",
                self.ports.range()
            )));
        }

        if self.timeouts.health_interval.is_zero() {
            return Err(Error::Validation(
                "timeouts.health_interval must be greater than zero".to_string(),
            ));
        }

        let mut service_ids = HashSet::new();
        for service in &self.services {
            if !service_ids.insert(service.id.as_str()) {
                return Err(Error::Validation(format!(
                    "Duplicate service id '{}'",
                    service.id
                )));
            }

            self.validate_service(service)?;
        }

        Ok(())
    }

    /// Check one service against its host. Used for config services and for
    /// services registered at runtime.
    pub fn validate_service(&self, service: &ServiceSpec) -> Result<()> {
        let host = self.host(&service.host).ok_or_else(|| {
            Error::Validation(format!(
                "Service '{}' references unknown host '{}'",
                service.id, service.host
            ))
        })?;

        if host.gpu_count > 0 {
            if let Some(bad) = service.gpu_indices.iter().find(|i| **i >= host.gpu_count) {
                return Err(Error::Validation(format!(
                    "Service '{}' uses GPU {} but host '{}' has {} GPU(s)",
                    service.id, bad, host.name, host.gpu_count
                )));
            }
        }

        if !(service.gpu_memory_utilization > 0.0 && service.gpu_memory_utilization <= 1.0) {
            return Err(Error::Validation(format!(
                "Service '{}' gpu_memory_utilization must be in (0, 1], got {}",
                service.id, service.gpu_memory_utilization
            )));
        }

        if let Some(bad) = service.extra_flags.keys().find(|k| !is_valid_flag_key(k)) {
            return Err(Error::Validation(format!(
                "Service '{}' has invalid extra flag '{}' (use letters, digits, '_' and '-')",
                service.id, bad
            )));
        }

        if service.tensor_parallel_size == 0 {
            return Err(Error::Validation(format!(
                "Service '{}' tensor_parallel_size must be at least 1",
                service.id
            )));
        }

        if !service.gpu_indices.is_empty()
            && service.tensor_parallel_size as usize > service.gpu_indices.len()
        {
            return Err(Error::Validation(format!(
                "Service '{}' asks for tensor_parallel_size {} but lists only {} GPU(s)",
                service.id,
                service.tensor_parallel_size,
                service.gpu_indices.len()
            )));
        }

        Ok(())
    }
}
