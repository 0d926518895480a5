//! The memory manager: lifecycle, the allocation ledger and device pointer
//! resolution.

use std::ptr::NonNull;

use hemem_common::{Error, Result};

use crate::{
    config::MemoryConfig,
    controller::Controller,
    flags::MemoryFlags,
    kind::MemoryKind,
    ledger::{AllocationId, AllocationRecord, HostStorage, Ledger},
    space::TransferStats,
};

/// Tracks host allocations, their device mirrors and aliases, and moves data
/// between the two sides on demand.
///
/// A manager is opened once with a [`MemoryConfig`] and used from one thread at
/// a time. Closing it (or dropping it) releases every device buffer still
/// registered; host storage handed out by the manager stays with its owner.
pub struct MemoryManager {
    pub(crate) controller: Controller,
    pub(crate) ledger: Ledger,
    closed: bool,
}

// SAFETY: the manager exclusively owns the ledger and the providers; the raw
// pointers it stores are only dereferenced through `&mut self`.
unsafe impl Send for MemoryManager {}

impl MemoryManager {
    pub fn open(config: MemoryConfig) -> Result<MemoryManager> {
        let controller = Controller::new(config)?;
        log::debug!("memory manager opened");
        Ok(MemoryManager {
            controller,
            ledger: Ledger::new(),
            closed: false,
        })
    }

    /// Releases every device buffer still registered and empties the ledger.
    pub fn close(mut self) -> Result<()> {
        self.closed = true;
        self.teardown()
    }

    fn teardown(&mut self) -> Result<()> {
        let aliases = self.ledger.alias_count();
        let records = self.ledger.drain();
        let allocations = records.len();
        let mut device_buffers = 0;
        let mut device_resident = 0;
        let mut first_error = None;
        for mut record in records {
            if let Err(e) = unlock_host(&self.controller, &mut record) {
                first_error.get_or_insert(e);
            }
            if !record.host_resident {
                device_resident += 1;
            }
            if let Some(device) = record.device.filter(|_| !record.managed) {
                match unsafe { self.controller.device_deallocate(device, record.bytes) } {
                    Ok(()) => device_buffers += 1,
                    Err(e) => {
                        first_error.get_or_insert(e);
                    }
                }
            }
        }
        if allocations > 0 || aliases > 0 {
            log::warn!(
                "memory manager closed with {allocations} registered allocations \
                 ({device_buffers} device buffers released, {device_resident} last \
                 transferred to the device) and {aliases} aliases"
            );
        }
        first_error.map_or(Ok(()), Err)
    }

    pub fn config(&self) -> &MemoryConfig {
        self.controller.config()
    }

    pub fn controller(&self) -> &Controller {
        &self.controller
    }

    pub fn transfer_stats(&self) -> TransferStats {
        self.controller.transfer_stats()
    }

    pub fn reset_transfer_stats(&mut self) {
        self.controller.reset_transfer_stats()
    }

    pub fn device_bytes_in_use(&self) -> u64 {
        self.controller.device_bytes_in_use()
    }

    pub fn allocation_count(&self) -> usize {
        self.ledger.len()
    }

    pub fn alias_count(&self) -> usize {
        self.ledger.alias_count()
    }

    /// Whether `ptr` is the host address of a registered allocation.
    pub fn is_registered(&self, ptr: *const u8) -> bool {
        !ptr.is_null() && self.ledger.contains(ptr as usize)
    }

    /// Whether `ptr` is the host address of a registered alias.
    pub fn is_alias(&self, ptr: *const u8) -> bool {
        !ptr.is_null() && self.ledger.is_alias(ptr as usize)
    }

    /// Registers caller-owned host storage.
    ///
    /// A null pointer with zero bytes is ignored.
    ///
    /// # Safety
    ///
    /// `host` must be valid for reads and writes of `bytes` until it is
    /// released from the manager.
    pub unsafe fn register(&mut self, host: *mut u8, bytes: usize) -> Result<()> {
        let Some(host) = non_null("host", host, bytes)? else {
            return Ok(());
        };
        self.ledger
            .insert(AllocationRecord::new(host, bytes, HostStorage::External))?;
        Ok(())
    }

    /// Registers caller-owned host storage together with an existing device
    /// buffer mirroring it.
    ///
    /// # Safety
    ///
    /// `host` must be valid for reads and writes of `bytes` until it is
    /// released. `device` must come from [`MemoryManager::allocate_device`]
    /// with the same `bytes`; the manager releases it on
    /// [`MemoryManager::release`] with `free_device` set, or when closed.
    pub unsafe fn register_with_device(
        &mut self,
        device: *mut u8,
        host: *mut u8,
        bytes: usize,
    ) -> Result<()> {
        let Some(host) = non_null("host", host, bytes)? else {
            return Ok(());
        };
        let device = NonNull::new(device)
            .ok_or_else(|| Error::invalid_arg("device", "null device pointer"))?;
        self.ledger
            .insert(AllocationRecord::new(host, bytes, HostStorage::External).with_device(device))?;
        Ok(())
    }

    /// Removes the allocation at `host` from the ledger, optionally releasing
    /// its device buffer. Host storage is left to its owner.
    pub fn release(&mut self, host: *mut u8, free_device: bool) -> Result<()> {
        if host.is_null() {
            return Ok(());
        }
        let mut record = self.ledger.remove(host as usize)?;
        self.free_record(&mut record, free_device, false)
    }

    fn free_record(
        &mut self,
        record: &mut AllocationRecord,
        free_device: bool,
        free_host: bool,
    ) -> Result<()> {
        unlock_host(&self.controller, record)?;
        if free_device && !record.managed {
            if let Some(device) = record.device.take() {
                unsafe { self.controller.device_deallocate(device, record.bytes)? };
            }
        }
        if free_host && record.host_storage == HostStorage::Provider {
            unsafe { self.controller.host_deallocate(record.host, record.bytes)? };
        }
        Ok(())
    }

    /// Registers `target` as an alias of `base`.
    ///
    /// When `base_is_alias` is set, `base` is itself an alias and the new alias
    /// is recorded against its root allocation with the offsets added; `target`
    /// may then lie before `base` as long as it starts inside the root. Aliasing
    /// the same address again with the same root and offset adds a reference.
    pub fn make_alias(&mut self, base: *const u8, target: *const u8, base_is_alias: bool) -> Result<()> {
        if base.is_null() {
            if target.is_null() {
                return Ok(());
            }
            return Err(Error::invalid_arg("base", "null base for a non-null alias"));
        }
        let delta = (target as usize).wrapping_sub(base as usize) as isize;
        let (root, offset) = self.alias_root(base as usize, base_is_alias, delta, 0)?;
        self.ledger.insert_alias(target as usize, root, offset)?;
        Ok(())
    }

    /// Resolves `base + delta .. + bytes` to its root allocation and offset.
    ///
    /// The offset into the root must satisfy `0 <= offset < root.bytes` and the
    /// range must end within the root.
    fn alias_root(
        &self,
        base: usize,
        base_is_alias: bool,
        delta: isize,
        bytes: usize,
    ) -> Result<(AllocationId, usize)> {
        let (root, base_offset) = if base_is_alias {
            let alias = self
                .ledger
                .alias(base)
                .ok_or_else(|| Error::unknown_pointer(base))?;
            (alias.base, alias.offset)
        } else {
            let id = self
                .ledger
                .lookup(base)
                .ok_or_else(|| Error::unknown_pointer(base))?;
            (id, 0)
        };
        let record = self
            .ledger
            .get(root)
            .ok_or_else(|| Error::unknown_pointer(base))?;
        match base_offset.checked_add_signed(delta) {
            Some(offset) if offset < record.bytes && bytes <= record.bytes - offset => {
                Ok((root, offset))
            }
            _ => Err(Error::invalid_arg(
                "offset",
                format!(
                    "alias at {base:#x}{delta:+} of {bytes} bytes outside {} bytes at {:#x}",
                    record.bytes,
                    record.addr()
                ),
            )),
        }
    }

    /// Drops one reference to the alias at `target`.
    pub fn release_alias(&mut self, target: *const u8) -> Result<()> {
        if target.is_null() {
            return Ok(());
        }
        self.ledger.remove_alias(target as usize)?;
        Ok(())
    }

    /// Device address of the allocation or alias at `ptr`.
    ///
    /// The device buffer is created on first use. With `copy` set, `bytes` of
    /// host data are pushed to the device first.
    pub fn resolve_device_pointer(&mut self, ptr: *const u8, bytes: usize, copy: bool) -> Result<*mut u8> {
        let Some(ptr) = non_null("ptr", ptr.cast_mut(), bytes)? else {
            return Ok(std::ptr::null_mut());
        };
        let addr = ptr.as_ptr() as usize;
        if self.ledger.contains(addr) {
            self.base_device_pointer(addr, bytes, copy)
        } else if self.ledger.is_alias(addr) {
            self.alias_device_pointer(addr, bytes, copy)
        } else {
            Err(Error::unknown_pointer(addr))
        }
    }

    /// Device address of the alias at `ptr`: the root's device buffer plus the
    /// alias offset.
    pub fn resolve_alias_device_pointer(
        &mut self,
        ptr: *const u8,
        bytes: usize,
        copy: bool,
    ) -> Result<*mut u8> {
        let Some(ptr) = non_null("ptr", ptr.cast_mut(), bytes)? else {
            return Ok(std::ptr::null_mut());
        };
        self.alias_device_pointer(ptr.as_ptr() as usize, bytes, copy)
    }

    pub(crate) fn device_pointer_for(
        &mut self,
        ptr: *const u8,
        bytes: usize,
        flags: MemoryFlags,
    ) -> Result<*mut u8> {
        if flags.is_alias() {
            self.resolve_alias_device_pointer(ptr, bytes, false)
        } else {
            self.resolve_device_pointer(ptr, bytes, false)
        }
    }

    pub(crate) fn base_device_pointer(&mut self, addr: usize, bytes: usize, copy: bool) -> Result<*mut u8> {
        let record = self.ledger.record_mut(addr)?;
        if bytes > record.bytes {
            return Err(Error::invalid_arg(
                "bytes",
                format!("{bytes} exceeds the {} registered at {addr:#x}", record.bytes),
            ));
        }
        let device = match record.device {
            Some(device) => device,
            None => {
                let device = self.controller.device_allocate(Some(record.host), record.bytes)?;
                record.device = Some(device);
                device
            }
        };
        if copy {
            unlock_host(&self.controller, record)?;
            unsafe {
                self.controller
                    .host_to_device(device.as_ptr(), record.host.as_ptr(), bytes)
            };
            record.host_resident = false;
        }
        Ok(device.as_ptr())
    }

    pub(crate) fn alias_device_pointer(&mut self, addr: usize, bytes: usize, copy: bool) -> Result<*mut u8> {
        let alias = *self
            .ledger
            .alias(addr)
            .ok_or_else(|| Error::unknown_pointer(addr))?;
        let record = self
            .ledger
            .get_mut(alias.base)
            .ok_or_else(|| Error::unknown_pointer(addr))?;
        if !record.contains(addr, bytes) {
            return Err(Error::invalid_arg(
                "bytes",
                format!("alias {addr:#x} of {bytes} bytes overruns its base"),
            ));
        }
        let device = match record.device {
            Some(device) => device,
            None => {
                let device = self.controller.device_allocate(Some(record.host), record.bytes)?;
                record.device = Some(device);
                device
            }
        };
        let device = unsafe { device.as_ptr().add(alias.offset) };
        if copy {
            unlock_host(&self.controller, record)?;
            let host = unsafe { record.host.as_ptr().add(alias.offset) };
            unsafe { self.controller.host_to_device(device, host, bytes) };
        }
        Ok(device)
    }

    /// Allocates `bytes` of host storage from the host provider and registers
    /// it. Returns the host pointer and its initial flags.
    ///
    /// A device kind marks the data as device-valid; the device buffer itself
    /// is created on first device access.
    pub fn allocate(&mut self, bytes: usize, kind: MemoryKind) -> Result<(*mut u8, MemoryFlags)> {
        let host_kind = self.controller.host_kind();
        if kind.is_host() && kind.class() > host_kind.class() {
            return Err(Error::configuration(format!(
                "'{kind}' allocation from '{host_kind}' host memory"
            )));
        }
        if kind.is_device() && !self.controller.has_device() {
            return Err(Error::configuration(format!(
                "'{kind}' allocation without a device memory space"
            )));
        }
        if kind.is_unified() && !self.controller.is_unified() {
            return Err(Error::configuration(format!(
                "'{kind}' allocation from '{}' device memory",
                self.controller.device_kind()
            )));
        }

        let host = self.controller.host_allocate(bytes)?;
        let mut record = AllocationRecord::new(host, bytes, HostStorage::Provider);
        record.managed = self.controller.is_unified();
        record.protectable = self.controller.is_protected_host();
        if let Err(e) = self.ledger.insert(record) {
            unsafe { self.controller.host_deallocate(host, bytes)? };
            return Err(e);
        }

        let mut flags = MemoryFlags::REGISTERED
            | MemoryFlags::OWNS_INTERNAL
            | MemoryFlags::OWNS_HOST
            | MemoryFlags::OWNS_DEVICE;
        match kind {
            MemoryKind::Device => {
                flags |= MemoryFlags::VALID_DEVICE | MemoryFlags::PREFERS_DEVICE;
                let addr = host.as_ptr() as usize;
                let record = self.ledger.record_mut(addr)?;
                record.host_resident = false;
                lock_host(&self.controller, record)?;
            }
            MemoryKind::DeviceUnified => flags |= MemoryFlags::VALID_HOST | MemoryFlags::VALID_DEVICE,
            _ => flags |= MemoryFlags::VALID_HOST,
        }
        Ok((host.as_ptr(), flags))
    }

    /// Allocates a standalone device buffer, for use with
    /// [`MemoryManager::register_with_device`].
    pub fn allocate_device(&mut self, bytes: usize) -> Result<*mut u8> {
        self.controller
            .device_allocate(None, bytes)
            .map(NonNull::as_ptr)
    }

    /// Registers caller-provided storage of the given kind and updates `flags`.
    ///
    /// For host kinds `ptr` is the host storage. For [`MemoryKind::Device`],
    /// `ptr` is a device buffer from [`MemoryManager::allocate_device`] and
    /// `host` the host storage it mirrors; the device side is marked valid.
    /// `own` decides whether the flags claim ownership of the registered side.
    /// Returns the host pointer.
    ///
    /// # Safety
    ///
    /// See [`MemoryManager::register`] and [`MemoryManager::register_with_device`].
    pub unsafe fn register_memory(
        &mut self,
        ptr: *mut u8,
        host: *mut u8,
        bytes: usize,
        kind: MemoryKind,
        own: bool,
        flags: &mut MemoryFlags,
    ) -> Result<*mut u8> {
        let mut next = *flags | MemoryFlags::REGISTERED | MemoryFlags::OWNS_INTERNAL;
        let host = match kind {
            MemoryKind::Device => {
                unsafe { self.register_with_device(ptr, host, bytes)? };
                next.set(MemoryFlags::OWNS_DEVICE, own);
                next |= MemoryFlags::OWNS_HOST | MemoryFlags::VALID_DEVICE;
                host
            }
            MemoryKind::DeviceUnified => {
                return Err(Error::invalid_arg(
                    "kind",
                    "unified memory must come from allocate",
                ));
            }
            _ => {
                unsafe { self.register(ptr, bytes)? };
                next.set(MemoryFlags::OWNS_HOST, own);
                next |= MemoryFlags::OWNS_DEVICE | MemoryFlags::VALID_HOST;
                ptr
            }
        };
        *flags = next;
        Ok(host)
    }

    /// Creates the flags for an alias at `base + offset` of `bytes`, registering
    /// the alias when the base is registered.
    pub fn alias_memory(
        &mut self,
        base: *const u8,
        offset: usize,
        bytes: usize,
        base_flags: MemoryFlags,
    ) -> Result<MemoryFlags> {
        let mut flags = base_flags.to_alias();
        if !base_flags.is_registered() || base.is_null() {
            return Ok(flags);
        }
        let delta = isize::try_from(offset)
            .map_err(|_| Error::invalid_arg("offset", format!("{offset} is out of range")))?;
        self.alias_root(base as usize, base_flags.is_alias(), delta, bytes)?;
        self.make_alias(base, base.wrapping_add(offset), base_flags.is_alias())?;
        flags.register_alias();
        Ok(flags)
    }

    /// Releases whatever `flags` say the caller owns: the alias reference, or
    /// the ledger entry plus owned device and provider host storage.
    pub fn delete(&mut self, ptr: *mut u8, flags: MemoryFlags) -> Result<()> {
        if ptr.is_null() || !flags.contains(MemoryFlags::REGISTERED | MemoryFlags::OWNS_INTERNAL) {
            return Ok(());
        }
        if flags.is_alias() {
            return self.release_alias(ptr);
        }
        let mut record = self.ledger.remove(ptr as usize)?;
        self.free_record(
            &mut record,
            flags.contains(MemoryFlags::OWNS_DEVICE),
            flags.contains(MemoryFlags::OWNS_HOST),
        )
    }

    /// The memory kind currently holding valid data for a pointer with `flags`.
    pub fn memory_kind_of(&self, flags: MemoryFlags) -> MemoryKind {
        if flags.contains(MemoryFlags::VALID_DEVICE) && self.controller.has_device() {
            self.controller.device_kind()
        } else {
            self.controller.host_kind()
        }
    }

    /// One line per registered allocation and alias.
    pub fn pointer_report(&self) -> String {
        let mut lines = Vec::with_capacity(self.ledger.len() + self.ledger.alias_count());
        for record in self.ledger.iter() {
            let device = record
                .device
                .map_or_else(|| "-".to_string(), |d| format!("{:p}", d));
            lines.push(format!(
                "allocation {:#x} -> device {device}, {} bytes, resident on {}{}{}",
                record.addr(),
                record.bytes,
                if record.host_resident { "host" } else { "device" },
                if record.managed { ", managed" } else { "" },
                if record.host_locked { ", locked" } else { "" }
            ));
        }
        let mut aliases: Vec<_> = self.ledger.aliases().collect();
        aliases.sort_unstable_by_key(|(addr, _)| *addr);
        for (addr, alias) in aliases {
            let base = self
                .ledger
                .get(alias.base)
                .map_or_else(|| "released".to_string(), |r| format!("{:#x}", r.addr()));
            lines.push(format!(
                "alias {addr:#x} -> base {base} + {}, {} refs",
                alias.offset, alias.refs
            ));
        }
        lines.join("\n")
    }

    pub fn log_pointers(&self) {
        log::debug!(
            "{} allocations, {} aliases\n{}",
            self.ledger.len(),
            self.ledger.alias_count(),
            self.pointer_report()
        );
    }
}

impl Drop for MemoryManager {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if let Err(e) = self.teardown() {
            log::error!("memory manager teardown failed: {e}");
        }
    }
}

impl std::fmt::Debug for MemoryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryManager")
            .field("controller", &self.controller)
            .field("ledger", &self.ledger)
            .finish()
    }
}

/// Null pointers are accepted only for empty ranges.
pub(crate) fn non_null(name: &str, ptr: *mut u8, bytes: usize) -> Result<Option<NonNull<u8>>> {
    match NonNull::new(ptr) {
        Some(ptr) => Ok(Some(ptr)),
        None if bytes == 0 => Ok(None),
        None => Err(Error::invalid_arg(
            name,
            format!("null pointer for {bytes} bytes"),
        )),
    }
}

/// Revokes host access to a protectable allocation whose host copy went stale.
pub(crate) fn lock_host(controller: &Controller, record: &mut AllocationRecord) -> Result<()> {
    if record.protectable && !record.host_locked {
        unsafe { controller.host_protect(record.host, record.bytes)? };
        record.host_locked = true;
        log::trace!("host pages of {:#x} locked", record.addr());
    }
    Ok(())
}

pub(crate) fn unlock_host(controller: &Controller, record: &mut AllocationRecord) -> Result<()> {
    if record.host_locked {
        unsafe { controller.host_unprotect(record.host, record.bytes)? };
        record.host_locked = false;
        log::trace!("host pages of {:#x} unlocked", record.addr());
    }
    Ok(())
}
