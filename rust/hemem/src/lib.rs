//! Host/device memory management.
//!
//! Every buffer lives on the host and may have a mirror in device memory. The
//! caller keeps a [`MemoryFlags`] word next to each pointer recording which side
//! is valid; the [`MemoryManager`] consults and updates it on every access and
//! moves data between the sides only when the requested side is stale.
//!
//! ```
//! use hemem::{MemoryClass, MemoryConfig, MemoryKind, MemoryManager};
//!
//! let mut mm = MemoryManager::open(MemoryConfig::default()).unwrap();
//! let (ptr, mut flags) = mm.allocate(64, MemoryKind::Host).unwrap();
//!
//! let device = mm.read_write(ptr, MemoryClass::Device, 64, &mut flags).unwrap();
//! unsafe { device.write_bytes(1, 64) };
//!
//! let host = mm.read(ptr, MemoryClass::Host, 64, &mut flags).unwrap();
//! assert_eq!(unsafe { *host }, 1);
//!
//! mm.delete(ptr, flags).unwrap();
//! mm.close().unwrap();
//! ```

pub mod budget;
pub mod config;
pub mod controller;
pub mod flags;
pub mod handle;
pub mod kind;
pub mod ledger;
pub mod manager;
pub mod resolve;
pub mod space;

pub use config::MemoryConfig;
pub use flags::{MemoryFlags, Residency};
pub use handle::MemoryHandle;
pub use hemem_common::{Error, ErrorKind, Result};
pub use kind::{MemoryClass, MemoryKind};
pub use manager::MemoryManager;
pub use space::TransferStats;
