/// Aligns a number up to the next multiple of the specified alignment.
///
/// # Arguments
///
/// * `n` - The number to align up
/// * `alignment` - The alignment boundary (must be a power of 2 and non-zero)
///
/// # Examples
///
/// ```
/// use hemem_page_alloc::align::align_up;
///
/// assert_eq!(align_up(0, 64), 0);
/// assert_eq!(align_up(1, 64), 64);
/// assert_eq!(align_up(64, 64), 64);
/// assert_eq!(align_up(65, 64), 128);
/// ```
///
/// # Panics
///
/// Panics in debug builds if `alignment` is 0 or not a power of 2.
#[inline]
pub fn align_up(n: usize, alignment: usize) -> usize {
    debug_assert_ne!(alignment, 0);
    debug_assert!(alignment.is_power_of_two());
    (n + alignment - 1) & !(alignment - 1)
}

/// Aligns a number down to the previous multiple of the specified alignment.
///
/// ```
/// use hemem_page_alloc::align::align_down;
///
/// assert_eq!(align_down(0, 4096), 0);
/// assert_eq!(align_down(4095, 4096), 0);
/// assert_eq!(align_down(4097, 4096), 4096);
/// ```
#[inline]
pub fn align_down(n: usize, alignment: usize) -> usize {
    debug_assert_ne!(alignment, 0);
    debug_assert!(alignment.is_power_of_two());
    n & !(alignment - 1)
}

/// Checks whether a number (typically an address) lies on an alignment boundary.
///
/// ```
/// use hemem_page_alloc::align::is_aligned;
///
/// assert!(is_aligned(0, 32));
/// assert!(is_aligned(96, 32));
/// assert!(!is_aligned(100, 32));
/// ```
#[inline]
pub fn is_aligned(n: usize, alignment: usize) -> bool {
    debug_assert_ne!(alignment, 0);
    debug_assert!(alignment.is_power_of_two());
    (n & (alignment - 1)) == 0
}

/// Returns the page-granular span `(start, len)` that covers `len` bytes at `addr`.
///
/// Page protection calls operate on whole pages; this widens an arbitrary byte
/// range to the enclosing pages.
#[inline]
pub fn page_span(addr: usize, len: usize, page_size: usize) -> (usize, usize) {
    let start = align_down(addr, page_size);
    let end = align_up(addr + len.max(1), page_size);
    (start, end - start)
}
