use std::sync::OnceLock;

use crate::fault::{FAULT_MESSAGE_CAPACITY, format_fault_message};

/// Page protection is enforced by the MMU on this platform.
pub const PROTECTION_SUPPORTED: bool = true;

/// Allocates memory using standard pages via mmap.
///
/// This function allocates `size` bytes of memory using the standard system page size,
/// which is typically 4KB on most systems. The allocation is page-aligned and uses
/// anonymous memory mapping, so its contents start out zeroed.
///
/// # Arguments
///
/// * `size` - The number of bytes to allocate. The actual allocation will be rounded up
///   to the nearest page boundary. A zero size still maps one page.
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
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            capacity,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if ptr.is_null() || ptr == libc::MAP_FAILED {
        let err = std::io::Error::last_os_error();
        return Err(err);
    }
    Ok((ptr, capacity))
}

/// Frees memory that was allocated using [`allocate`].
///
/// # Arguments
///
/// * `ptr` - A pointer to the memory region to deallocate, as returned by [`allocate`]
/// * `size` - The capacity in bytes that was returned by [`allocate`]
///
/// # Safety
///
/// This function is safe to call as long as:
/// - `ptr` was returned by a previous call to [`allocate`]
/// - `size` matches the capacity returned by the allocation call
/// - The memory has not already been freed
/// - No other references to the memory exist
pub unsafe fn free(ptr: *mut std::ffi::c_void, size: usize) -> std::io::Result<()> {
    let res = unsafe { libc::munmap(ptr, size) };
    if res < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// Revokes all access to the pages spanning `[ptr, ptr + size)`.
///
/// Any subsequent read or write of these pages raises `SIGSEGV` (or `SIGBUS`),
/// which the handler installed by [`install_access_trap`] turns into an abort.
///
/// # Safety
///
/// `ptr` must be page-aligned and the range must lie inside a mapping obtained from
/// [`allocate`]. Nothing in the current process may hold a live reference into the
/// range while it is protected.
pub unsafe fn protect(ptr: *mut std::ffi::c_void, size: usize) -> std::io::Result<()> {
    let res = unsafe { libc::mprotect(ptr, size.max(1), libc::PROT_NONE) };
    if res != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// Restores read and write access to the pages spanning `[ptr, ptr + size)`.
///
/// # Safety
///
/// `ptr` must be page-aligned and the range must lie inside a mapping obtained from
/// [`allocate`].
pub unsafe fn unprotect(ptr: *mut std::ffi::c_void, size: usize) -> std::io::Result<()> {
    let res = unsafe { libc::mprotect(ptr, size.max(1), libc::PROT_READ | libc::PROT_WRITE) };
    if res != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// Installs the process-wide `SIGSEGV`/`SIGBUS` handler that reports the faulting
/// address on stderr and aborts.
///
/// The installation happens once per process; later calls return the cached
/// outcome of the first attempt.
///
/// # Note
///
/// The handler replaces any previously installed handler for these signals,
/// including the runtime's stack overflow reporter. A stack overflow still
/// aborts the process, with the trap's diagnostic instead.
pub fn install_access_trap() -> std::io::Result<()> {
    static RESULT: OnceLock<std::io::Result<()>> = OnceLock::new();
    let res = RESULT.get_or_init(|| {
        for signal in [libc::SIGSEGV, libc::SIGBUS] {
            install_handler(signal)?;
        }
        Ok(())
    });
    match res {
        Ok(()) => Ok(()),
        Err(e) => Err(std::io::Error::new(e.kind(), e.to_string())),
    }
}

fn install_handler(signal: libc::c_int) -> std::io::Result<()> {
    let mut action: libc::sigaction = unsafe { std::mem::zeroed() };
    action.sa_sigaction = on_access_violation as *const () as libc::sighandler_t;
    action.sa_flags = libc::SA_SIGINFO;
    let res = unsafe {
        libc::sigemptyset(&mut action.sa_mask);
        libc::sigaction(signal, &action, std::ptr::null_mut())
    };
    if res != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

extern "C" fn on_access_violation(
    _signal: libc::c_int,
    info: *mut libc::siginfo_t,
    _context: *mut std::ffi::c_void,
) {
    let addr = if info.is_null() {
        0
    } else {
        unsafe { (*info).si_addr() as usize }
    };
    let mut buf = [0u8; FAULT_MESSAGE_CAPACITY];
    let len = format_fault_message(&mut buf, addr);
    unsafe {
        libc::write(libc::STDERR_FILENO, buf.as_ptr() as *const libc::c_void, len);
        libc::abort();
    }
}

/// Gets the system's standard page size in bytes.
///
/// The value is cached after the first call. If the system's page size cannot be
/// determined, returns a default value of 4KB (4,096 bytes).
pub fn get_page_size() -> usize {
    static SIZE: OnceLock<usize> = OnceLock::new();
    if let Some(&size) = SIZE.get() {
        size
    } else {
        match read_page_size() {
            Ok(size) => {
                let _ = SIZE.set(size);
                size
            }
            Err(_) => 4 * 1024,
        }
    }
}

/// Reads the standard page size from the system using sysconf.
fn read_page_size() -> std::io::Result<usize> {
    let res = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if res < 0 {
        return Err(std::io::Error::last_os_error());
    }
    assert!(res < i32::MAX as _);
    Ok(res as usize)
}
