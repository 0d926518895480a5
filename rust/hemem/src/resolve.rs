//! Access resolution: turns a host pointer, its flags and a requested memory
//! class into a usable pointer, moving data between host and device when the
//! requested side is stale.

use hemem_common::{Error, Result};
use hemem_page_alloc::align::is_aligned;

use crate::{
    flags::MemoryFlags,
    kind::MemoryClass,
    ledger::{AllocationRecord, Ledger},
    manager::{MemoryManager, lock_host, non_null, unlock_host},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Access {
    Read,
    Write,
    ReadWrite,
}

impl MemoryManager {
    /// Pointer for reading `bytes` at `ptr` from `class` memory.
    ///
    /// Stale data is brought over first; the requested side becomes valid
    /// and the other side keeps its validity.
    pub fn read(
        &mut self,
        ptr: *mut u8,
        class: MemoryClass,
        bytes: usize,
        flags: &mut MemoryFlags,
    ) -> Result<*const u8> {
        self.access(Access::Read, ptr, class, bytes, flags)
            .map(|p| p.cast_const())
    }

    /// Pointer for overwriting `bytes` at `ptr` in `class` memory.
    ///
    /// No data is moved; the requested side becomes the only valid one.
    pub fn write(
        &mut self,
        ptr: *mut u8,
        class: MemoryClass,
        bytes: usize,
        flags: &mut MemoryFlags,
    ) -> Result<*mut u8> {
        self.access(Access::Write, ptr, class, bytes, flags)
    }

    /// Pointer for reading and modifying `bytes` at `ptr` in `class` memory.
    ///
    /// Stale data is brought over first; the requested side becomes the only
    /// valid one.
    pub fn read_write(
        &mut self,
        ptr: *mut u8,
        class: MemoryClass,
        bytes: usize,
        flags: &mut MemoryFlags,
    ) -> Result<*mut u8> {
        self.access(Access::ReadWrite, ptr, class, bytes, flags)
    }

    fn access(
        &mut self,
        access: Access,
        ptr: *mut u8,
        class: MemoryClass,
        bytes: usize,
        flags: &mut MemoryFlags,
    ) -> Result<*mut u8> {
        let Some(ptr) = non_null("ptr", ptr, bytes)? else {
            return Ok(std::ptr::null_mut());
        };
        if class.is_host() {
            self.host_access(access, ptr.as_ptr(), class, bytes, flags)
        } else {
            self.device_access(access, ptr.as_ptr(), class, bytes, flags)
        }
    }

    fn host_access(
        &mut self,
        access: Access,
        ptr: *mut u8,
        class: MemoryClass,
        bytes: usize,
        flags: &mut MemoryFlags,
    ) -> Result<*mut u8> {
        if !is_aligned(ptr as usize, class.required_alignment()) {
            return Err(Error::invalid_arg(
                "ptr",
                format!("{ptr:p} is not aligned for '{class}' access"),
            ));
        }
        match access {
            Access::Read | Access::ReadWrite if flags.contains(MemoryFlags::VALID_HOST) => {
                self.check_host_current(ptr, *flags)?;
            }
            Access::Read | Access::ReadWrite => self.pull(ptr, bytes, *flags)?,
            Access::Write => self.open_host(ptr, *flags)?,
        }
        match access {
            Access::Read => flags.insert(MemoryFlags::VALID_HOST),
            Access::Write | Access::ReadWrite => flags.validate_host_only(),
        }
        Ok(ptr)
    }

    fn device_access(
        &mut self,
        access: Access,
        ptr: *mut u8,
        class: MemoryClass,
        bytes: usize,
        flags: &mut MemoryFlags,
    ) -> Result<*mut u8> {
        if class == MemoryClass::DeviceUnified && !self.controller.is_unified() {
            return Err(Error::invalid_operation(format!(
                "'{class}' access with '{}' device memory",
                self.controller.device_kind()
            )));
        }
        let addr = ptr as usize;
        let copy = access != Access::Write && !flags.contains(MemoryFlags::VALID_DEVICE);
        let device = if flags.is_alias() {
            self.alias_device_pointer(addr, bytes, copy)?
        } else {
            self.base_device_pointer(addr, bytes, copy)?
        };
        match access {
            Access::Read => flags.insert(MemoryFlags::VALID_DEVICE),
            Access::Write | Access::ReadWrite => {
                if !flags.is_alias() {
                    let record = self.ledger.record_mut(addr)?;
                    lock_host(&self.controller, record)?;
                }
                flags.validate_device_only();
            }
        }
        Ok(device)
    }

    /// Brings `bytes` of device data at `ptr` back to the host.
    fn pull(&mut self, ptr: *mut u8, bytes: usize, flags: MemoryFlags) -> Result<()> {
        if !flags.is_registered() {
            return Ok(());
        }
        let addr = ptr as usize;
        let (record, offset) = if flags.is_alias() {
            alias_base_mut(&mut self.ledger, addr)?
        } else {
            (self.ledger.record_mut(addr)?, 0)
        };
        if offset.checked_add(bytes).is_none_or(|end| end > record.bytes) {
            return Err(Error::invalid_arg(
                "bytes",
                format!("{bytes} bytes at {addr:#x} overrun the registered allocation"),
            ));
        }
        unlock_host(&self.controller, record)?;
        if let Some(device) = record.device {
            unsafe {
                self.controller.device_to_host(
                    record.host.as_ptr().add(offset),
                    device.as_ptr().add(offset),
                    bytes,
                )
            };
        }
        if !flags.is_alias() {
            record.host_resident = true;
        }
        Ok(())
    }

    /// Restores host access ahead of a host write.
    fn open_host(&mut self, ptr: *mut u8, flags: MemoryFlags) -> Result<()> {
        if let Some(record) = host_record_mut(&mut self.ledger, ptr as usize, flags)? {
            unlock_host(&self.controller, record)?;
        }
        Ok(())
    }

    /// Fails with `IllegalAccess` when `flags` claim a valid host copy the
    /// ledger knows to be stale, and with `UnknownPointer` when they claim a
    /// registration the ledger no longer has.
    pub(crate) fn check_host_current(&mut self, ptr: *const u8, flags: MemoryFlags) -> Result<()> {
        let addr = ptr as usize;
        match host_record_mut(&mut self.ledger, addr, flags)? {
            Some(record) if record.host_locked => Err(Error::illegal_access(addr)),
            _ => Ok(()),
        }
    }

    /// Copies `bytes` from `src` to `dst`, each described by its host pointer
    /// and flags, using whichever side holds valid data.
    ///
    /// The source is read from the host if that is its only valid side or if the
    /// destination is host-only; the destination side is chosen the same way.
    /// Afterwards the other side of `dst` is no longer valid.
    ///
    /// # Safety
    ///
    /// Unregistered pointers must be valid for `bytes` on the host.
    pub unsafe fn copy(
        &mut self,
        dst: *mut u8,
        src: *const u8,
        bytes: usize,
        src_flags: MemoryFlags,
        dst_flags: &mut MemoryFlags,
    ) -> Result<()> {
        non_null("dst", dst, bytes)?;
        non_null("src", src.cast_mut(), bytes)?;
        let src_on_host = src_flags.contains(MemoryFlags::VALID_HOST)
            && (!src_flags.contains(MemoryFlags::VALID_DEVICE) || dst_flags.host_only());
        let dst_on_host = dst_flags.contains(MemoryFlags::VALID_HOST)
            && (!dst_flags.contains(MemoryFlags::VALID_DEVICE) || src_flags.host_only());

        if src_on_host {
            self.check_host_current(src, src_flags)?;
        }
        if dst_on_host {
            self.check_host_current(dst, *dst_flags)?;
        }
        let src_device = if src_on_host {
            std::ptr::null_mut()
        } else {
            self.device_pointer_for(src, bytes, src_flags)?
        };
        let dst_device = if dst_on_host {
            std::ptr::null_mut()
        } else {
            self.device_pointer_for(dst, bytes, *dst_flags)?
        };

        match (dst_on_host, src_on_host) {
            (true, true) => unsafe { self.controller.host_to_host(dst, src, bytes)? },
            (true, false) => unsafe { self.controller.device_to_host(dst, src_device, bytes) },
            (false, true) => unsafe { self.controller.host_to_device(dst_device, src, bytes) },
            (false, false) => unsafe {
                self.controller.device_to_device(dst_device, src_device, bytes)
            },
        }

        if dst_on_host {
            dst_flags.remove(MemoryFlags::VALID_DEVICE);
        } else {
            if dst_flags.is_registered() && !dst_flags.is_alias() {
                let record = self.ledger.record_mut(dst as usize)?;
                lock_host(&self.controller, record)?;
            }
            dst_flags.remove(MemoryFlags::VALID_HOST);
        }
        Ok(())
    }

    /// Copies `bytes` of `src` into plain host memory at `dst`, reading from the
    /// host when `src` is host-valid and from the device otherwise.
    ///
    /// # Safety
    ///
    /// `dst` must be writable for `bytes`. An unregistered `src` must be
    /// readable for `bytes` on the host.
    pub unsafe fn copy_to_host(
        &mut self,
        dst: *mut u8,
        src: *const u8,
        bytes: usize,
        src_flags: MemoryFlags,
    ) -> Result<()> {
        non_null("dst", dst, bytes)?;
        non_null("src", src.cast_mut(), bytes)?;
        if src_flags.contains(MemoryFlags::VALID_HOST) {
            self.check_host_current(src, src_flags)?;
            unsafe { self.controller.host_to_host(dst, src, bytes) }
        } else {
            let device = self.device_pointer_for(src, bytes, src_flags)?;
            unsafe { self.controller.device_to_host(dst, device, bytes) };
            Ok(())
        }
    }

    /// Copies `bytes` of plain host memory at `src` into `dst`, writing to the
    /// host when `dst` is host-valid and to the device otherwise. The other side
    /// of `dst` is no longer valid afterwards.
    ///
    /// # Safety
    ///
    /// `src` must be readable for `bytes`. An unregistered `dst` must be
    /// writable for `bytes` on the host.
    pub unsafe fn copy_from_host(
        &mut self,
        dst: *mut u8,
        src: *const u8,
        bytes: usize,
        dst_flags: &mut MemoryFlags,
    ) -> Result<()> {
        non_null("dst", dst, bytes)?;
        non_null("src", src.cast_mut(), bytes)?;
        if dst_flags.contains(MemoryFlags::VALID_HOST) {
            self.check_host_current(dst, *dst_flags)?;
            unsafe { self.controller.host_to_host(dst, src, bytes)? };
            dst_flags.remove(MemoryFlags::VALID_DEVICE);
        } else {
            let device = self.device_pointer_for(dst, bytes, *dst_flags)?;
            unsafe { self.controller.host_to_device(device, src, bytes) };
            if dst_flags.is_registered() && !dst_flags.is_alias() {
                let record = self.ledger.record_mut(dst as usize)?;
                lock_host(&self.controller, record)?;
            }
            dst_flags.remove(MemoryFlags::VALID_HOST);
        }
        Ok(())
    }

    /// Brings the alias at `alias` up to the validity of its base.
    ///
    /// An unregistered alias is registered here if the base holds valid device
    /// data, since the alias then needs a device view.
    pub fn sync_alias(
        &mut self,
        base: *const u8,
        alias: *mut u8,
        alias_bytes: usize,
        base_flags: MemoryFlags,
        alias_flags: &mut MemoryFlags,
    ) -> Result<()> {
        if !alias_flags.is_alias() {
            return Err(Error::invalid_arg("alias_flags", "not an alias"));
        }
        if !base_flags.is_registered() {
            return Ok(());
        }
        let validity = MemoryFlags::VALID_HOST | MemoryFlags::VALID_DEVICE;
        let mut next = *alias_flags;

        if base_flags.contains(MemoryFlags::VALID_HOST)
            && !next.contains(MemoryFlags::VALID_HOST)
            && next.is_registered()
        {
            self.pull(alias, alias_bytes, next)?;
        }
        if base_flags.contains(MemoryFlags::VALID_DEVICE) && !next.contains(MemoryFlags::VALID_DEVICE) {
            if !next.is_registered() {
                self.make_alias(base, alias, base_flags.is_alias())?;
                next.register_alias();
            }
            self.alias_device_pointer(alias as usize, alias_bytes, true)?;
        }
        *alias_flags = (next - validity) | (base_flags & validity);
        Ok(())
    }
}

/// The allocation holding the host storage of `addr`.
///
/// Unregistered flags have no record; registered flags must still resolve.
fn host_record_mut(
    ledger: &mut Ledger,
    addr: usize,
    flags: MemoryFlags,
) -> Result<Option<&mut AllocationRecord>> {
    if !flags.is_registered() {
        return Ok(None);
    }
    let record = if flags.is_alias() {
        alias_base_mut(ledger, addr)?.0
    } else {
        ledger.record_mut(addr)?
    };
    Ok(Some(record))
}

/// The live base of the alias at `addr` and the alias offset into it.
fn alias_base_mut(ledger: &mut Ledger, addr: usize) -> Result<(&mut AllocationRecord, usize)> {
    let alias = *ledger.alias(addr).ok_or_else(|| Error::unknown_pointer(addr))?;
    let record = ledger
        .get_mut(alias.base)
        .ok_or_else(|| Error::unknown_pointer(addr))?;
    Ok((record, alias.offset))
}
