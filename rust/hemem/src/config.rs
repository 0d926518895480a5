//! Memory manager configuration.

use hemem_common::{Error, Result};
use serde::{Deserialize, Serialize};

use crate::kind::MemoryKind;

/// Selects the memory spaces a [`crate::MemoryManager`] is opened with.
///
/// The configuration is validated once, when the controller is built; it cannot
/// be changed while the manager is open.
///
/// ```
/// use hemem::{config::MemoryConfig, kind::MemoryKind};
///
/// let config = MemoryConfig::from_json(r#"{ "host": "host-64", "device": "device" }"#).unwrap();
/// assert_eq!(config.host, MemoryKind::Host64);
/// assert!(!config.pooled);
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MemoryConfig {
    /// Kind of host storage handed out by the manager.
    pub host: MemoryKind,
    /// Kind of device storage backing device accesses. A host kind means
    /// there is no device space and device access requests fail.
    pub device: MemoryKind,
    /// Serve host and device storage from size-class pools.
    #[serde(default)]
    pub pooled: bool,
    /// Upper bound, in bytes, on live device storage.
    #[serde(default)]
    pub device_capacity: Option<u64>,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        MemoryConfig {
            host: MemoryKind::Host,
            device: MemoryKind::Device,
            pooled: false,
            device_capacity: None,
        }
    }
}

impl MemoryConfig {
    pub fn new(host: MemoryKind, device: MemoryKind) -> MemoryConfig {
        MemoryConfig {
            host,
            device,
            ..Default::default()
        }
    }

    /// Both sides backed by unified memory.
    pub fn unified() -> MemoryConfig {
        MemoryConfig::new(MemoryKind::DeviceUnified, MemoryKind::DeviceUnified)
    }

    pub fn from_json(text: &str) -> Result<MemoryConfig> {
        serde_json::from_str(text)
            .map_err(|e| Error::configuration(format!("cannot parse memory config: {e}")))
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| Error::configuration(format!("cannot serialize memory config: {e}")))
    }

    pub fn with_host(mut self, host: MemoryKind) -> Self {
        self.host = host;
        self
    }

    pub fn with_device(mut self, device: MemoryKind) -> Self {
        self.device = device;
        self
    }

    pub fn with_pooled(mut self, pooled: bool) -> Self {
        self.pooled = pooled;
        self
    }

    pub fn with_device_capacity(mut self, capacity: u64) -> Self {
        self.device_capacity = Some(capacity);
        self
    }

    /// Whether host and device share one unified storage.
    pub fn is_unified(&self) -> bool {
        self.host.is_unified() && self.device.is_unified()
    }

    /// Checks the (host, device) pair for compatibility.
    pub fn validate(&self) -> Result<()> {
        if self.host.is_unified() != self.device.is_unified() {
            return Err(Error::configuration(format!(
                "host kind '{}' and device kind '{}' must both be unified or neither",
                self.host, self.device
            )));
        }
        if self.host == MemoryKind::Device {
            return Err(Error::configuration(
                "device memory cannot back host storage",
            ));
        }
        if self.pooled && self.is_unified() {
            return Err(Error::configuration(
                "pooled memory spaces cannot provide unified memory",
            ));
        }
        if self.pooled && self.host == MemoryKind::HostProtected {
            return Err(Error::configuration(
                "pooled memory spaces cannot protect host storage",
            ));
        }
        if self.device_capacity.is_some() && !self.device.is_device() {
            return Err(Error::configuration(
                "device capacity requires a device memory kind",
            ));
        }
        Ok(())
    }
}
