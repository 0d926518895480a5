use std::{alloc::Layout, ffi::c_void, ptr::NonNull};

use hemem_common::{Error, Result};
use hemem_page_alloc::{align::align_up, mmap};

use crate::{kind::MemoryKind, space::pool::PagePool};

/// Alignment of plain host allocations.
const STD_ALIGNMENT: usize = 16;

/// Provider of host storage.
///
/// The variant is fixed when the controller is built from the configured host
/// memory kind.
#[derive(Debug)]
pub enum HostSpace {
    /// Process heap.
    Std,
    /// Process heap, 32-byte aligned.
    Aligned32,
    /// Process heap, 64-byte aligned.
    Aligned64,
    /// Page mappings whose access can be revoked while the host copy is stale.
    Protected,
    /// Page mappings shared between host and device.
    Unified,
    /// Size-class pool, named `host_pool`.
    Pooled(PagePool),
}

impl HostSpace {
    pub fn new(kind: MemoryKind, pooled: bool) -> Result<HostSpace> {
        let space = match kind {
            MemoryKind::Host | MemoryKind::Host32 | MemoryKind::Host64 if pooled => {
                HostSpace::Pooled(PagePool::new("host_pool"))
            }
            MemoryKind::Host => HostSpace::Std,
            MemoryKind::Host32 => HostSpace::Aligned32,
            MemoryKind::Host64 => HostSpace::Aligned64,
            MemoryKind::HostProtected => {
                mmap::install_access_trap()
                    .map_err(|e| Error::io("installing the access trap", e))?;
                HostSpace::Protected
            }
            MemoryKind::DeviceUnified => HostSpace::Unified,
            MemoryKind::Device => {
                return Err(Error::configuration(
                    "device memory cannot back host storage",
                ));
            }
        };
        log::debug!("host memory space: {}", space.name());
        Ok(space)
    }

    pub fn name(&self) -> &'static str {
        match self {
            HostSpace::Std => "host",
            HostSpace::Aligned32 => "host-32",
            HostSpace::Aligned64 => "host-64",
            HostSpace::Protected => "host-protected",
            HostSpace::Unified => "host-unified",
            HostSpace::Pooled(pool) => pool.name(),
        }
    }

    /// Whether [`HostSpace::protect`] revokes access to the pages.
    pub fn supports_protection(&self) -> bool {
        matches!(self, HostSpace::Protected) && mmap::PROTECTION_SUPPORTED
    }

    pub fn allocate(&mut self, bytes: usize) -> Result<NonNull<u8>> {
        match self {
            HostSpace::Std => heap_alloc(bytes, STD_ALIGNMENT),
            HostSpace::Aligned32 => heap_alloc(bytes, 32),
            HostSpace::Aligned64 => heap_alloc(bytes, 64),
            HostSpace::Protected | HostSpace::Unified => {
                let (ptr, _) =
                    mmap::allocate(bytes).map_err(|e| Error::allocation_io(self.name(), bytes, e))?;
                NonNull::new(ptr.cast()).ok_or_else(|| Error::allocation(self.name(), bytes))
            }
            HostSpace::Pooled(pool) => pool.allocate(bytes),
        }
    }

    /// Releases host storage.
    ///
    /// # Safety
    ///
    /// `ptr` must come from [`HostSpace::allocate`] on this space with the same
    /// `bytes`, and must not be used afterwards.
    pub unsafe fn deallocate(&mut self, ptr: NonNull<u8>, bytes: usize) -> Result<()> {
        match self {
            HostSpace::Std => unsafe { heap_dealloc(ptr, bytes, STD_ALIGNMENT) },
            HostSpace::Aligned32 => unsafe { heap_dealloc(ptr, bytes, 32) },
            HostSpace::Aligned64 => unsafe { heap_dealloc(ptr, bytes, 64) },
            HostSpace::Protected | HostSpace::Unified => unsafe {
                mmap::free(ptr.as_ptr().cast(), mapped_len(bytes))
                    .map_err(|e| Error::io("unmapping host pages", e))
            },
            HostSpace::Pooled(pool) => pool.deallocate(ptr),
        }
    }

    /// Revokes all access to the pages of a protected allocation.
    ///
    /// # Safety
    ///
    /// `ptr` and `bytes` must describe a live allocation of this space. Any
    /// access to it before [`HostSpace::unprotect`] aborts the process.
    pub unsafe fn protect(&self, ptr: NonNull<u8>, bytes: usize) -> Result<()> {
        if !matches!(self, HostSpace::Protected) {
            return Ok(());
        }
        unsafe { mmap::protect(ptr.as_ptr().cast::<c_void>(), mapped_len(bytes)) }
            .map_err(|e| Error::io("protecting host pages", e))
    }

    /// Restores read/write access to the pages of a protected allocation.
    ///
    /// # Safety
    ///
    /// `ptr` and `bytes` must describe a live allocation of this space.
    pub unsafe fn unprotect(&self, ptr: NonNull<u8>, bytes: usize) -> Result<()> {
        if !matches!(self, HostSpace::Protected) {
            return Ok(());
        }
        unsafe { mmap::unprotect(ptr.as_ptr().cast::<c_void>(), mapped_len(bytes)) }
            .map_err(|e| Error::io("unprotecting host pages", e))
    }
}

fn mapped_len(bytes: usize) -> usize {
    align_up(bytes.max(1), mmap::get_page_size())
}

fn heap_layout(bytes: usize, align: usize) -> Result<Layout> {
    Layout::from_size_align(bytes.max(1), align)
        .map_err(|e| Error::invalid_arg("bytes", format!("{bytes}: {e}")))
}

pub(crate) fn heap_alloc(bytes: usize, align: usize) -> Result<NonNull<u8>> {
    let layout = heap_layout(bytes, align)?;
    let ptr = unsafe { std::alloc::alloc(layout) };
    NonNull::new(ptr).ok_or_else(|| Error::allocation("host heap", bytes))
}

pub(crate) fn heap_alloc_zeroed(bytes: usize, align: usize) -> Result<NonNull<u8>> {
    let layout = heap_layout(bytes, align)?;
    let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
    NonNull::new(ptr).ok_or_else(|| Error::allocation("host heap", bytes))
}

/// # Safety
///
/// `ptr` must come from [`heap_alloc`] or [`heap_alloc_zeroed`] with the same
/// `bytes` and `align`.
pub(crate) unsafe fn heap_dealloc(ptr: NonNull<u8>, bytes: usize, align: usize) -> Result<()> {
    let layout = heap_layout(bytes, align)?;
    unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
    Ok(())
}
