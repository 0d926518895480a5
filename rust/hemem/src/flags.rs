use std::fmt;

use bitflags::bitflags;

bitflags! {
    /// Per-pointer state word carried by the caller alongside each pointer.
    ///
    /// The manager reads and updates these flags on every access request; it
    /// never stores them itself.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct MemoryFlags: u32 {
        /// The pointer has an entry in the ledger.
        const REGISTERED = 1 << 0;
        /// The host storage must be released by the owner of these flags.
        const OWNS_HOST = 1 << 1;
        /// The device storage must be released by the owner of these flags.
        const OWNS_DEVICE = 1 << 2;
        /// The ledger entry must be released by the owner of these flags.
        const OWNS_INTERNAL = 1 << 3;
        /// The host copy is up to date.
        const VALID_HOST = 1 << 4;
        /// The device copy is up to date.
        const VALID_DEVICE = 1 << 5;
        /// The pointer is a sub-view of another registered allocation.
        const ALIAS = 1 << 6;
        /// The data was created for, and should stay on, the device.
        const PREFERS_DEVICE = 1 << 7;
    }
}

/// Residency derived from the validity flags.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Residency {
    HostOnlyValid,
    DeviceOnlyValid,
    BothValid,
    /// Neither side holds valid data (freshly wrapped, never written).
    Invalid,
}

impl MemoryFlags {
    pub fn residency(self) -> Residency {
        match (
            self.contains(MemoryFlags::VALID_HOST),
            self.contains(MemoryFlags::VALID_DEVICE),
        ) {
            (true, true) => Residency::BothValid,
            (true, false) => Residency::HostOnlyValid,
            (false, true) => Residency::DeviceOnlyValid,
            (false, false) => Residency::Invalid,
        }
    }

    /// Host-valid and not device-valid.
    #[inline]
    pub fn host_only(self) -> bool {
        self.residency() == Residency::HostOnlyValid
    }

    #[inline]
    pub fn is_alias(self) -> bool {
        self.contains(MemoryFlags::ALIAS)
    }

    #[inline]
    pub fn is_registered(self) -> bool {
        self.contains(MemoryFlags::REGISTERED)
    }

    /// Marks host as the only valid side.
    #[inline]
    pub(crate) fn validate_host_only(&mut self) {
        self.insert(MemoryFlags::VALID_HOST);
        self.remove(MemoryFlags::VALID_DEVICE);
    }

    /// Marks device as the only valid side.
    #[inline]
    pub(crate) fn validate_device_only(&mut self) {
        self.insert(MemoryFlags::VALID_DEVICE);
        self.remove(MemoryFlags::VALID_HOST);
    }

    /// Flags for a view into the memory these flags describe. A view never
    /// owns host or device storage.
    #[inline]
    pub(crate) fn to_alias(self) -> MemoryFlags {
        (self | MemoryFlags::ALIAS) - (MemoryFlags::OWNS_HOST | MemoryFlags::OWNS_DEVICE)
    }

    /// Marks an alias as holding a reference in the ledger.
    #[inline]
    pub(crate) fn register_alias(&mut self) {
        *self = self.to_alias() | MemoryFlags::REGISTERED | MemoryFlags::OWNS_INTERNAL;
    }
}

impl fmt::Display for MemoryFlags {
    /// Prints one line per flag, in the order the flags are declared.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(MemoryFlags, &str); 8] = [
            (MemoryFlags::REGISTERED, "registered"),
            (MemoryFlags::OWNS_HOST, "owns host"),
            (MemoryFlags::OWNS_DEVICE, "owns device"),
            (MemoryFlags::OWNS_INTERNAL, "owns internal"),
            (MemoryFlags::VALID_HOST, "valid host"),
            (MemoryFlags::VALID_DEVICE, "valid device"),
            (MemoryFlags::ALIAS, "alias"),
            (MemoryFlags::PREFERS_DEVICE, "prefers device"),
        ];
        for (i, (flag, name)) in NAMES.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "   {name:<14}= {}", self.contains(*flag))?;
        }
        Ok(())
    }
}
