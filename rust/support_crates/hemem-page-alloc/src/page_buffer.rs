//! Page-backed buffer with optional access protection.
//!
//! `PageBuffer` owns a run of whole pages obtained from the platform mapping
//! primitives in [`crate::mmap`]. The pages can be made inaccessible with
//! [`PageBuffer::protect`], after which any access traps (see
//! [`crate::mmap::install_access_trap`]).
//!
//! # Safety
//!
//! While `PageBuffer` implements `Send` and `Sync`, users must ensure that any data written
//! to the buffer is properly synchronized when accessed from multiple threads.

use crate::mmap;

/// A buffer of anonymous, page-aligned, zero-initialized memory.
pub struct PageBuffer {
    /// Raw pointer to the mapped region.
    ptr: *mut u8,
    /// The requested size of the buffer in bytes.
    len: usize,
    /// The mapped capacity, a whole number of pages.
    capacity: usize,
    /// Whether the pages are currently inaccessible.
    protected: bool,
}

impl PageBuffer {
    /// Returns the size of a memory page on the current system.
    pub fn page_size() -> usize {
        mmap::get_page_size()
    }

    /// Allocates a buffer of at least `size` bytes, rounded up to whole pages.
    ///
    /// # Errors
    ///
    /// Returns an error if the system cannot map the requested memory.
    pub fn allocate(size: usize) -> std::io::Result<PageBuffer> {
        let (ptr, capacity) = mmap::allocate(size.max(1))?;
        assert!((ptr as usize).is_multiple_of(Self::page_size()));
        Ok(PageBuffer {
            ptr: ptr as _,
            len: size,
            capacity,
            protected: false,
        })
    }

    /// Reassembles a buffer released with [`PageBuffer::into_raw`].
    ///
    /// # Safety
    ///
    /// `ptr` and `capacity` must come from a single `into_raw` call, `len` must not
    /// exceed `capacity`, and the pages must not have been reassembled before.
    /// The pages must be accessible (not protected).
    pub unsafe fn from_raw(ptr: *mut u8, len: usize, capacity: usize) -> PageBuffer {
        debug_assert!(len <= capacity);
        PageBuffer {
            ptr,
            len,
            capacity,
            protected: false,
        }
    }

    /// Releases ownership of the pages and returns `(ptr, capacity)`.
    ///
    /// The pages stay mapped until they are reassembled with
    /// [`PageBuffer::from_raw`] and dropped. A protected buffer is unprotected
    /// first.
    pub fn into_raw(mut self) -> std::io::Result<(*mut u8, usize)> {
        self.unprotect()?;
        let this = std::mem::ManuallyDrop::new(self);
        Ok((this.ptr, this.capacity))
    }

    /// Returns the length of the buffer in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if the buffer has a length of 0.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns the mapped capacity in bytes, always a whole number of pages.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns a raw pointer to the beginning of the mapped memory.
    #[inline]
    pub fn ptr(&self) -> *mut u8 {
        self.ptr
    }

    /// Returns the alignment of the buffer, the page size.
    #[inline]
    pub fn alignment(&self) -> usize {
        Self::page_size()
    }

    /// Returns `true` while the pages are inaccessible.
    #[inline]
    pub fn is_protected(&self) -> bool {
        self.protected
    }

    /// Makes the whole buffer inaccessible. A no-op if it is already protected.
    pub fn protect(&mut self) -> std::io::Result<()> {
        if !self.protected {
            unsafe { mmap::protect(self.ptr as _, self.capacity)? };
            self.protected = true;
        }
        Ok(())
    }

    /// Restores read and write access. A no-op if the buffer is not protected.
    pub fn unprotect(&mut self) -> std::io::Result<()> {
        if self.protected {
            unsafe { mmap::unprotect(self.ptr as _, self.capacity)? };
            self.protected = false;
        }
        Ok(())
    }

    /// Returns an immutable byte slice view of the buffer contents.
    ///
    /// # Panics
    ///
    /// Panics if the buffer is protected.
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        assert!(!self.protected, "PageBuffer is protected");
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }

    /// Returns a mutable byte slice view of the buffer contents.
    ///
    /// # Panics
    ///
    /// Panics if the buffer is protected.
    #[inline]
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        assert!(!self.protected, "PageBuffer is protected");
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }

    /// Returns an immutable slice of type `T` from the buffer's memory.
    ///
    /// # Panics
    ///
    /// Panics if the buffer's length is not evenly divisible by the size of `T`,
    /// or if the buffer is protected.
    #[inline]
    pub fn as_slice<T>(&self) -> &[T]
    where
        T: bytemuck::AnyBitPattern,
    {
        bytemuck::cast_slice(self.as_bytes())
    }

    /// Returns a mutable slice of type `T` from the buffer's memory.
    ///
    /// # Panics
    ///
    /// Panics if the buffer's length is not evenly divisible by the size of `T`,
    /// or if the buffer is protected.
    #[inline]
    pub fn as_mut_slice<T>(&mut self) -> &mut [T]
    where
        T: bytemuck::AnyBitPattern + bytemuck::NoUninit,
    {
        bytemuck::cast_slice_mut(self.as_bytes_mut())
    }
}

impl std::ops::Deref for PageBuffer {
    type Target = [u8];

    #[inline]
    fn deref(&self) -> &Self::Target {
        self.as_bytes()
    }
}

impl std::ops::DerefMut for PageBuffer {
    #[inline]
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.as_bytes_mut()
    }
}

impl Drop for PageBuffer {
    /// Releases the mapped pages back to the system.
    fn drop(&mut self) {
        if !self.ptr.is_null() {
            let _ = unsafe { mmap::free(self.ptr as _, self.capacity) };
        }
    }
}

// SAFETY: PageBuffer owns its pages and unmaps them on drop.
unsafe impl Send for PageBuffer {}

// SAFETY: shared access only hands out immutable views; users must synchronize
// writes made through raw pointers.
unsafe impl Sync for PageBuffer {}

impl std::fmt::Debug for PageBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageBuffer")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .field("capacity", &self.capacity)
            .field("protected", &self.protected)
            .finish()
    }
}
