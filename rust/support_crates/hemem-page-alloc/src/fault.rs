//! Diagnostic formatting for the access trap.
//!
//! The trap handler runs in signal (or exception) context, where allocating or
//! taking locks is not allowed. The message is therefore assembled into a
//! caller-provided stack buffer.

const PREFIX: &[u8] = b"\nhemem: illegal memory access at address 0x";
const SUFFIX: &[u8] = b" (protected page)\n";

/// Upper bound for the formatted message length.
pub const FAULT_MESSAGE_CAPACITY: usize = PREFIX.len() + 16 + SUFFIX.len();

/// Writes the fault diagnostic for `addr` into `buf` and returns the number of
/// bytes written.
pub fn format_fault_message(buf: &mut [u8; FAULT_MESSAGE_CAPACITY], addr: usize) -> usize {
    const DIGITS: &[u8; 16] = b"0123456789abcdef";

    let mut pos = 0;
    buf[..PREFIX.len()].copy_from_slice(PREFIX);
    pos += PREFIX.len();

    let mut hex = [0u8; 16];
    let mut n = addr;
    let mut count = 0;
    loop {
        hex[count] = DIGITS[n & 0xf];
        count += 1;
        n >>= 4;
        if n == 0 {
            break;
        }
    }
    for i in (0..count).rev() {
        buf[pos] = hex[i];
        pos += 1;
    }

    buf[pos..pos + SUFFIX.len()].copy_from_slice(SUFFIX);
    pos + SUFFIX.len()
}
