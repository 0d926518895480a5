//! Memory space providers: where host and device storage come from, and how
//! bytes move between them.

pub mod copy;
pub mod device;
pub mod host;
pub mod pool;

pub use copy::{CopySpace, TransferStats};
pub use device::DeviceSpace;
pub use host::HostSpace;
pub use pool::PagePool;
