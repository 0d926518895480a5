use std::alloc::{Layout, alloc_zeroed, dealloc};

/// Page protection is not available; protect/unprotect only validate their
/// arguments and the resolver's staleness check is the sole guard.
pub const PROTECTION_SUPPORTED: bool = false;

/// Allocates memory using standard pages (emulated).
pub fn allocate(size: usize) -> std::io::Result<(*mut std::ffi::c_void, usize)> {
    let page_size = get_page_size();
    assert!(page_size.is_power_of_two());
    let capacity = (size.max(1) + page_size - 1) & !(page_size - 1);

    let layout = Layout::from_size_align(capacity, page_size)
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "Invalid layout"))?;

    let ptr = unsafe { alloc_zeroed(layout) };
    if ptr.is_null() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::OutOfMemory,
            "Failed to allocate memory",
        ));
    }

    Ok((ptr as *mut std::ffi::c_void, capacity))
}

/// Frees memory that was allocated using standard pages.
pub unsafe fn free(ptr: *mut std::ffi::c_void, size: usize) -> std::io::Result<()> {
    let page_size = get_page_size();
    assert!(size.is_multiple_of(page_size));

    let layout = Layout::from_size_align(size, page_size)
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "Invalid layout"))?;

    unsafe {
        dealloc(ptr as *mut u8, layout);
    }
    Ok(())
}

pub unsafe fn protect(ptr: *mut std::ffi::c_void, _size: usize) -> std::io::Result<()> {
    check_page_aligned(ptr)
}

pub unsafe fn unprotect(ptr: *mut std::ffi::c_void, _size: usize) -> std::io::Result<()> {
    check_page_aligned(ptr)
}

pub fn install_access_trap() -> std::io::Result<()> {
    Ok(())
}

fn check_page_aligned(ptr: *mut std::ffi::c_void) -> std::io::Result<()> {
    if !(ptr as usize).is_multiple_of(get_page_size()) {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "address is not page-aligned",
        ));
    }
    Ok(())
}

/// Returns the "standard page" size in bytes.
pub fn get_page_size() -> usize {
    4 * 1024
}
