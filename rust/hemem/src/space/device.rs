use std::ptr::NonNull;

use hemem_common::{Error, Result};

use crate::{
    kind::MemoryKind,
    space::{
        host::{heap_alloc_zeroed, heap_dealloc},
        pool::PagePool,
    },
};

/// Alignment of device buffers.
pub const DEVICE_ALIGNMENT: usize = 256;

/// Provider of device storage.
///
/// Device memory is emulated with storage that is disjoint from every host
/// allocation, so data only reaches it through the copy provider.
#[derive(Debug)]
pub enum DeviceSpace {
    /// No device is configured; every request fails.
    None,
    /// Emulated device heap.
    Std,
    /// The device side of unified memory is the host storage itself.
    Unified,
    /// Size-class pool, named `device_pool`.
    Pooled(PagePool),
}

impl DeviceSpace {
    pub fn new(kind: MemoryKind, pooled: bool) -> DeviceSpace {
        let space = match kind {
            MemoryKind::Device if pooled => DeviceSpace::Pooled(PagePool::new("device_pool")),
            MemoryKind::Device => DeviceSpace::Std,
            MemoryKind::DeviceUnified => DeviceSpace::Unified,
            _ => DeviceSpace::None,
        };
        log::debug!("device memory space: {}", space.name());
        space
    }

    pub fn name(&self) -> &'static str {
        match self {
            DeviceSpace::None => "none",
            DeviceSpace::Std => "device",
            DeviceSpace::Unified => "device-unified",
            DeviceSpace::Pooled(pool) => pool.name(),
        }
    }

    pub fn is_available(&self) -> bool {
        !matches!(self, DeviceSpace::None)
    }

    pub fn is_unified(&self) -> bool {
        matches!(self, DeviceSpace::Unified)
    }

    /// Allocates `bytes` of device storage, zero-filled.
    ///
    /// Unified spaces hand back `host` itself and need it to be present.
    pub fn allocate(&mut self, host: Option<NonNull<u8>>, bytes: usize) -> Result<NonNull<u8>> {
        match self {
            DeviceSpace::None => Err(Error::invalid_operation(
                "device allocation without a device memory space",
            )),
            DeviceSpace::Std => heap_alloc_zeroed(bytes, DEVICE_ALIGNMENT),
            DeviceSpace::Unified => host.ok_or_else(|| {
                Error::invalid_operation("standalone device allocation in unified memory")
            }),
            DeviceSpace::Pooled(pool) => {
                let ptr = pool.allocate(bytes.max(DEVICE_ALIGNMENT))?;
                unsafe { ptr.as_ptr().write_bytes(0, bytes) };
                Ok(ptr)
            }
        }
    }

    /// Releases device storage.
    ///
    /// # Safety
    ///
    /// `ptr` must come from [`DeviceSpace::allocate`] on this space with the
    /// same `bytes`, and must not be used afterwards.
    pub unsafe fn deallocate(&mut self, ptr: NonNull<u8>, bytes: usize) -> Result<()> {
        match self {
            DeviceSpace::None => Err(Error::invalid_operation(
                "device release without a device memory space",
            )),
            DeviceSpace::Std => unsafe { heap_dealloc(ptr, bytes, DEVICE_ALIGNMENT) },
            DeviceSpace::Unified => Ok(()),
            DeviceSpace::Pooled(pool) => pool.deallocate(ptr),
        }
    }
}
