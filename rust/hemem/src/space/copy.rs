use crate::kind::MemoryKind;

/// Counters for the transfers issued through a [`CopySpace`].
///
/// Every request is counted, including those a unified space turns into a no-op;
/// `bytes_moved` only counts bytes that were physically copied.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TransferStats {
    pub host_to_device: u64,
    pub device_to_host: u64,
    pub device_to_device: u64,
    pub host_to_host: u64,
    pub bytes_moved: u64,
}

impl TransferStats {
    /// Host/device crossings, the transfers an accelerator would pay for.
    pub fn crossings(&self) -> u64 {
        self.host_to_device + self.device_to_host
    }

    pub fn total(&self) -> u64 {
        self.crossings() + self.device_to_device + self.host_to_host
    }
}

/// Moves bytes between the host and device spaces.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CopySpace {
    Std,
    /// Host and device share storage; crossings move nothing.
    Unified,
}

impl CopySpace {
    pub fn new(device: MemoryKind) -> CopySpace {
        if device.is_unified() {
            CopySpace::Unified
        } else {
            CopySpace::Std
        }
    }

    /// Copies host bytes to the device. Returns the number of bytes moved.
    ///
    /// # Safety
    ///
    /// `src` must be readable and `dst` writable for `bytes`, and the two ranges
    /// must not overlap unless they are identical.
    pub unsafe fn host_to_device(self, dst: *mut u8, src: *const u8, bytes: usize) -> usize {
        match self {
            CopySpace::Std => unsafe { move_bytes(dst, src, bytes) },
            CopySpace::Unified => 0,
        }
    }

    /// Copies device bytes to the host. Returns the number of bytes moved.
    ///
    /// # Safety
    ///
    /// Same as [`CopySpace::host_to_device`].
    pub unsafe fn device_to_host(self, dst: *mut u8, src: *const u8, bytes: usize) -> usize {
        match self {
            CopySpace::Std => unsafe { move_bytes(dst, src, bytes) },
            CopySpace::Unified => 0,
        }
    }

    /// Copies between two device buffers. The ranges may overlap.
    ///
    /// # Safety
    ///
    /// `src` must be readable and `dst` writable for `bytes`.
    pub unsafe fn device_to_device(self, dst: *mut u8, src: *const u8, bytes: usize) -> usize {
        if bytes == 0 || std::ptr::eq(dst, src) {
            return 0;
        }
        unsafe { std::ptr::copy(src, dst, bytes) };
        bytes
    }
}

unsafe fn move_bytes(dst: *mut u8, src: *const u8, bytes: usize) -> usize {
    if bytes == 0 || std::ptr::eq(dst, src) {
        return 0;
    }
    unsafe { std::ptr::copy_nonoverlapping(src, dst, bytes) };
    bytes
}
