use std::sync::OnceLock;
use windows_sys::Win32::{
    Foundation::{EXCEPTION_ACCESS_VIOLATION, GetLastError},
    System::{
        Diagnostics::Debug::{AddVectoredExceptionHandler, EXCEPTION_POINTERS},
        Memory::{
            MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_NOACCESS, PAGE_PROTECTION_FLAGS,
            PAGE_READWRITE, VirtualAlloc, VirtualFree, VirtualProtect,
        },
        SystemInformation::{GetSystemInfo, SYSTEM_INFO},
    },
};

use crate::fault::{FAULT_MESSAGE_CAPACITY, format_fault_message};

/// Page protection is enforced by the MMU on this platform.
pub const PROTECTION_SUPPORTED: bool = true;

/// Returned by a vectored handler to let the next handler see the exception.
const EXCEPTION_CONTINUE_SEARCH: i32 = 0;

/// Allocates memory using standard pages via `VirtualAlloc`.
///
/// This function allocates `size` bytes of memory using the standard system page size,
/// which is typically 4KB on most systems. Committed pages start out zeroed.
///
/// # Arguments
///
/// * `size` - The number of bytes to allocate. The actual allocation will be rounded up
///   to the nearest page boundary.
///
/// # Returns
///
/// Returns a `Result` containing:
/// - `Ok((ptr, capacity))` - A tuple with a pointer to the allocated memory and the actual
///   capacity in bytes (which may be larger than the requested size due to page alignment)
/// - `Err(io::Error)` - An I/O error if the allocation fails
///
/// # Safety
///
/// The returned pointer must be deallocated using [`free`] with the same capacity value
/// to avoid memory leaks. The allocated memory is readable and writable.
pub fn allocate(size: usize) -> std::io::Result<(*mut std::ffi::c_void, usize)> {
    let page_size = get_page_size();
    assert!(page_size.is_power_of_two());
    let capacity = (size.max(1) + page_size - 1) & !(page_size - 1);

    unsafe {
        let ptr = VirtualAlloc(
            std::ptr::null_mut(),
            capacity,
            MEM_COMMIT | MEM_RESERVE,
            PAGE_READWRITE,
        );

        if ptr.is_null() {
            let error = GetLastError();
            return Err(std::io::Error::from_raw_os_error(error as i32));
        }

        Ok((ptr, capacity))
    }
}

/// Frees memory that was allocated using [`allocate`].
///
/// # Safety
///
/// This function is safe to call as long as:
/// - `ptr` was returned by a previous call to [`allocate`]
/// - `size` matches the capacity returned by the allocation call
/// - The memory has not already been freed
/// - No other references to the memory exist
pub unsafe fn free(ptr: *mut std::ffi::c_void, size: usize) -> std::io::Result<()> {
    assert!(size.is_multiple_of(get_page_size()));
    unsafe {
        let result = VirtualFree(ptr, 0, MEM_RELEASE);
        if result == 0 {
            let error = GetLastError();
            return Err(std::io::Error::from_raw_os_error(error as i32));
        }
    }
    Ok(())
}

/// Revokes all access to the pages spanning `[ptr, ptr + size)`.
///
/// # Safety
///
/// `ptr` must be page-aligned and the range must lie inside an allocation obtained
/// from [`allocate`]. Nothing may hold a live reference into the range while it is
/// protected.
pub unsafe fn protect(ptr: *mut std::ffi::c_void, size: usize) -> std::io::Result<()> {
    unsafe { set_protection(ptr, size, PAGE_NOACCESS) }
}

/// Restores read and write access to the pages spanning `[ptr, ptr + size)`.
///
/// # Safety
///
/// `ptr` must be page-aligned and the range must lie inside an allocation obtained
/// from [`allocate`].
pub unsafe fn unprotect(ptr: *mut std::ffi::c_void, size: usize) -> std::io::Result<()> {
    unsafe { set_protection(ptr, size, PAGE_READWRITE) }
}

unsafe fn set_protection(
    ptr: *mut std::ffi::c_void,
    size: usize,
    protection: PAGE_PROTECTION_FLAGS,
) -> std::io::Result<()> {
    let mut previous: PAGE_PROTECTION_FLAGS = 0;
    unsafe {
        if VirtualProtect(ptr, size.max(1), protection, &mut previous) == 0 {
            let error = GetLastError();
            return Err(std::io::Error::from_raw_os_error(error as i32));
        }
    }
    Ok(())
}

/// Registers a first-chance vectored exception handler that reports access
/// violations with the faulting address and aborts the process.
///
/// The installation happens once per process.
pub fn install_access_trap() -> std::io::Result<()> {
    static RESULT: OnceLock<std::io::Result<()>> = OnceLock::new();
    let res = RESULT.get_or_init(|| {
        let handle = unsafe { AddVectoredExceptionHandler(1, Some(on_access_violation)) };
        if handle.is_null() {
            let error = unsafe { GetLastError() };
            return Err(std::io::Error::from_raw_os_error(error as i32));
        }
        Ok(())
    });
    match res {
        Ok(()) => Ok(()),
        Err(e) => Err(std::io::Error::new(e.kind(), e.to_string())),
    }
}

unsafe extern "system" fn on_access_violation(info: *mut EXCEPTION_POINTERS) -> i32 {
    if info.is_null() {
        return EXCEPTION_CONTINUE_SEARCH;
    }
    let record = unsafe { (*info).ExceptionRecord };
    if record.is_null() || unsafe { (*record).ExceptionCode } != EXCEPTION_ACCESS_VIOLATION {
        return EXCEPTION_CONTINUE_SEARCH;
    }
    // ExceptionInformation[1] holds the inaccessible address.
    let addr = unsafe { (*record).ExceptionInformation[1] };
    let mut buf = [0u8; FAULT_MESSAGE_CAPACITY];
    let len = format_fault_message(&mut buf, addr);
    use std::io::Write;
    let _ = std::io::stderr().write_all(&buf[..len]);
    std::process::abort();
}

/// Gets the system's standard page size in bytes.
///
/// The value is cached after the first call. On most systems this is 4KB.
pub fn get_page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();

    *PAGE_SIZE.get_or_init(|| unsafe {
        let mut system_info: SYSTEM_INFO = std::mem::zeroed();
        GetSystemInfo(&mut system_info);
        system_info.dwPageSize as usize
    })
}
