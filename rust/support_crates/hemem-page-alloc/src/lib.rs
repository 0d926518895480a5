//! Page-granular memory for the hemem memory spaces: anonymous page mappings,
//! page protection toggling, and the process-level trap that turns an access
//! to a protected page into an immediate abort.

pub mod align;
pub mod fault;
pub mod page_buffer;

#[cfg_attr(any(target_os = "linux"), path = "mmap_linux.rs")]
#[cfg_attr(windows, path = "mmap_win.rs")]
#[cfg_attr(not(any(target_os = "linux", windows)), path = "mmap_fallback.rs")]
pub mod mmap;
