//! Memory kinds and capability classes.

use std::{fmt, str::FromStr};

use hemem_common::{Error, Result};
use serde::{Deserialize, Serialize};

/// The kind of storage backing one side of an allocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MemoryKind {
    /// Plain heap memory.
    Host,
    /// Heap memory aligned to 32 bytes.
    #[serde(rename = "host-32")]
    Host32,
    /// Heap memory aligned to 64 bytes.
    #[serde(rename = "host-64")]
    Host64,
    /// Page-mapped host memory that can be made inaccessible while stale.
    HostProtected,
    /// Accelerator memory.
    Device,
    /// Unified memory: one storage addressable from host and device.
    DeviceUnified,
}

/// The kind of access a caller requests for a pointer.
///
/// Classes are totally ordered by how demanding they are:
/// `Host < Host32 < Host64 < HostProtected < Device < DeviceUnified`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MemoryClass {
    Host,
    #[serde(rename = "host-32")]
    Host32,
    #[serde(rename = "host-64")]
    Host64,
    HostProtected,
    Device,
    DeviceUnified,
}

impl MemoryKind {
    pub const ALL: [MemoryKind; 6] = [
        MemoryKind::Host,
        MemoryKind::Host32,
        MemoryKind::Host64,
        MemoryKind::HostProtected,
        MemoryKind::Device,
        MemoryKind::DeviceUnified,
    ];

    /// The capability class this kind satisfies.
    pub fn class(self) -> MemoryClass {
        match self {
            MemoryKind::Host => MemoryClass::Host,
            MemoryKind::Host32 => MemoryClass::Host32,
            MemoryKind::Host64 => MemoryClass::Host64,
            MemoryKind::HostProtected => MemoryClass::HostProtected,
            MemoryKind::Device => MemoryClass::Device,
            MemoryKind::DeviceUnified => MemoryClass::DeviceUnified,
        }
    }

    pub fn is_host(self) -> bool {
        self.class().is_host()
    }

    pub fn is_device(self) -> bool {
        !self.is_host()
    }

    pub fn is_unified(self) -> bool {
        self == MemoryKind::DeviceUnified
    }

    pub fn name(self) -> &'static str {
        match self {
            MemoryKind::Host => "host",
            MemoryKind::Host32 => "host-32",
            MemoryKind::Host64 => "host-64",
            MemoryKind::HostProtected => "host-protected",
            MemoryKind::Device => "device",
            MemoryKind::DeviceUnified => "device-unified",
        }
    }
}

impl MemoryClass {
    pub fn is_host(self) -> bool {
        self <= MemoryClass::HostProtected
    }

    pub fn is_device(self) -> bool {
        !self.is_host()
    }

    /// Combines two requirements into the strictest class that satisfies both.
    ///
    /// ```
    /// use hemem::kind::MemoryClass;
    ///
    /// assert_eq!(MemoryClass::Host32.join(MemoryClass::Host64), MemoryClass::Host64);
    /// assert_eq!(MemoryClass::Device.join(MemoryClass::Host), MemoryClass::Device);
    /// ```
    pub fn join(self, other: MemoryClass) -> MemoryClass {
        self.max(other)
    }

    /// Required address alignment for host pointers handed out for this class.
    pub fn required_alignment(self) -> usize {
        match self {
            MemoryClass::Host32 => 32,
            MemoryClass::Host64 => 64,
            _ => 1,
        }
    }

    pub fn name(self) -> &'static str {
        memory_kind_for(self).name()
    }
}

/// The memory kind a fresh allocation needs in order to serve `class`.
pub fn memory_kind_for(class: MemoryClass) -> MemoryKind {
    match class {
        MemoryClass::Host => MemoryKind::Host,
        MemoryClass::Host32 => MemoryKind::Host32,
        MemoryClass::Host64 => MemoryKind::Host64,
        MemoryClass::HostProtected => MemoryKind::HostProtected,
        MemoryClass::Device => MemoryKind::Device,
        MemoryClass::DeviceUnified => MemoryKind::DeviceUnified,
    }
}

impl std::ops::BitOr for MemoryClass {
    type Output = MemoryClass;

    fn bitor(self, rhs: MemoryClass) -> MemoryClass {
        self.join(rhs)
    }
}

impl fmt::Display for MemoryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl fmt::Display for MemoryClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for MemoryKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<MemoryKind> {
        MemoryKind::ALL
            .into_iter()
            .find(|kind| kind.name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| Error::invalid_arg("memory kind", format!("unknown kind '{s}'")))
    }
}

impl FromStr for MemoryClass {
    type Err = Error;

    fn from_str(s: &str) -> Result<MemoryClass> {
        MemoryKind::from_str(s).map(MemoryKind::class)
    }
}
