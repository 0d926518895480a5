//! A pointer bundled with its size and flags.

use bytemuck::{AnyBitPattern, NoUninit};
use hemem_common::{Error, Result, verify_arg};

use crate::{
    flags::MemoryFlags,
    kind::{MemoryClass, MemoryKind},
    manager::MemoryManager,
};

/// Host storage, its length and the flags describing it.
///
/// A handle keeps the flags word next to the pointer so that every access goes
/// through the manager with up-to-date state. Handles do not release anything
/// on drop; call [`MemoryHandle::delete`].
#[derive(Debug)]
pub struct MemoryHandle {
    ptr: *mut u8,
    bytes: usize,
    flags: MemoryFlags,
}

impl MemoryHandle {
    /// Allocates `bytes` of `kind` storage through the manager.
    pub fn new(mm: &mut MemoryManager, bytes: usize, kind: MemoryKind) -> Result<MemoryHandle> {
        let (ptr, flags) = mm.allocate(bytes, kind)?;
        Ok(MemoryHandle { ptr, bytes, flags })
    }

    /// Registers caller-owned host storage.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for reads and writes of `bytes` until the handle is
    /// deleted.
    pub unsafe fn wrap(mm: &mut MemoryManager, ptr: *mut u8, bytes: usize) -> Result<MemoryHandle> {
        let mut flags = MemoryFlags::empty();
        let ptr = unsafe { mm.register_memory(ptr, ptr, bytes, MemoryKind::Host, false, &mut flags)? };
        Ok(MemoryHandle { ptr, bytes, flags })
    }

    /// A view of `bytes` starting `offset` bytes into this handle.
    pub fn alias(&self, mm: &mut MemoryManager, offset: usize, bytes: usize) -> Result<MemoryHandle> {
        verify_arg!(
            offset,
            offset.checked_add(bytes).is_some_and(|end| end <= self.bytes)
        );
        let flags = mm.alias_memory(self.ptr, offset, bytes, self.flags)?;
        Ok(MemoryHandle {
            ptr: self.ptr.wrapping_add(offset),
            bytes,
            flags,
        })
    }

    pub fn len(&self) -> usize {
        self.bytes
    }

    pub fn is_empty(&self) -> bool {
        self.bytes == 0
    }

    pub fn flags(&self) -> MemoryFlags {
        self.flags
    }

    /// The host address; its contents are only meaningful while the host side
    /// is valid.
    pub fn host_ptr(&self) -> *mut u8 {
        self.ptr
    }

    pub fn read(&mut self, mm: &mut MemoryManager, class: MemoryClass) -> Result<*const u8> {
        mm.read(self.ptr, class, self.bytes, &mut self.flags)
    }

    pub fn write(&mut self, mm: &mut MemoryManager, class: MemoryClass) -> Result<*mut u8> {
        mm.write(self.ptr, class, self.bytes, &mut self.flags)
    }

    pub fn read_write(&mut self, mm: &mut MemoryManager, class: MemoryClass) -> Result<*mut u8> {
        mm.read_write(self.ptr, class, self.bytes, &mut self.flags)
    }

    /// The contents as a host slice, pulled from the device if needed.
    pub fn host_slice<T: AnyBitPattern>(&mut self, mm: &mut MemoryManager) -> Result<&[T]> {
        let ptr = self.read(mm, MemoryClass::Host)?;
        let bytes = if self.bytes == 0 {
            &[][..]
        } else {
            unsafe { std::slice::from_raw_parts(ptr, self.bytes) }
        };
        bytemuck::try_cast_slice(bytes).map_err(|e| Error::invalid_arg("T", e.to_string()))
    }

    /// The contents as a mutable host slice; the device copy becomes stale.
    pub fn host_slice_mut<T: AnyBitPattern + NoUninit>(
        &mut self,
        mm: &mut MemoryManager,
    ) -> Result<&mut [T]> {
        let ptr = self.read_write(mm, MemoryClass::Host)?;
        let bytes = if self.bytes == 0 {
            &mut [][..]
        } else {
            unsafe { std::slice::from_raw_parts_mut(ptr, self.bytes) }
        };
        bytemuck::try_cast_slice_mut(bytes).map_err(|e| Error::invalid_arg("T", e.to_string()))
    }

    /// Copies the first `bytes` of `src` into this handle.
    pub fn copy_from(&mut self, mm: &mut MemoryManager, src: &MemoryHandle, bytes: usize) -> Result<()> {
        verify_arg!(bytes, bytes <= self.bytes && bytes <= src.bytes);
        unsafe { mm.copy(self.ptr, src.ptr, bytes, src.flags, &mut self.flags) }
    }

    /// Copies the contents into `dst`, which must be exactly as long.
    pub fn copy_to_host(&self, mm: &mut MemoryManager, dst: &mut [u8]) -> Result<()> {
        verify_arg!(dst, dst.len() == self.bytes);
        unsafe { mm.copy_to_host(dst.as_mut_ptr(), self.ptr, self.bytes, self.flags) }
    }

    /// Overwrites the contents with `src`, which must be exactly as long.
    pub fn copy_from_host(&mut self, mm: &mut MemoryManager, src: &[u8]) -> Result<()> {
        verify_arg!(src, src.len() == self.bytes);
        unsafe { mm.copy_from_host(self.ptr, src.as_ptr(), self.bytes, &mut self.flags) }
    }

    /// Brings `alias`, a view into this handle, up to this handle's validity.
    pub fn sync_alias(&self, mm: &mut MemoryManager, alias: &mut MemoryHandle) -> Result<()> {
        mm.sync_alias(self.ptr, alias.ptr, alias.bytes, self.flags, &mut alias.flags)
    }

    /// Releases what the handle owns.
    pub fn delete(self, mm: &mut MemoryManager) -> Result<()> {
        mm.delete(self.ptr, self.flags)
    }
}
