//! The ledger: registered allocations keyed by host address, and aliases
//! keyed by their own host address.

use std::ptr::NonNull;

use ahash::AHashMap;
use hemem_common::{Error, Result};

/// Handle to an allocation record.
///
/// The generation makes a handle held by an alias go stale once its base
/// allocation is released, even if the slot is reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct AllocationId {
    index: u32,
    generation: u32,
}

/// Where the host storage of a record came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HostStorage {
    /// Caller-provided memory; never released by the manager.
    External,
    /// Allocated through the host provider.
    Provider,
}

/// One registered allocation.
#[derive(Debug)]
pub struct AllocationRecord {
    pub host: NonNull<u8>,
    pub bytes: usize,
    /// Device mirror, allocated lazily on the first device access.
    pub device: Option<NonNull<u8>>,
    pub host_storage: HostStorage,
    /// Host storage is unified memory; the device mirror is the host storage
    /// itself and is never released separately.
    pub managed: bool,
    /// The most recent transfer left valid data in host storage.
    pub host_resident: bool,
    /// Host storage comes from the protected provider.
    pub protectable: bool,
    /// Host pages are currently inaccessible.
    pub host_locked: bool,
}

impl AllocationRecord {
    pub fn new(host: NonNull<u8>, bytes: usize, host_storage: HostStorage) -> AllocationRecord {
        AllocationRecord {
            host,
            bytes,
            device: None,
            host_storage,
            managed: false,
            host_resident: true,
            protectable: false,
            host_locked: false,
        }
    }

    pub fn with_device(mut self, device: NonNull<u8>) -> Self {
        self.device = Some(device);
        self.host_resident = false;
        self
    }

    pub fn addr(&self) -> usize {
        self.host.as_ptr() as usize
    }

    /// Whether `[addr, addr + bytes)` lies within the host storage.
    pub fn contains(&self, addr: usize, bytes: usize) -> bool {
        let start = self.addr();
        addr >= start && (addr - start).checked_add(bytes).is_some_and(|end| end <= self.bytes)
    }
}

/// A sub-range view of a registered allocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AliasRecord {
    /// The root allocation; never another alias.
    pub base: AllocationId,
    /// Byte offset from the root's host address.
    pub offset: usize,
    pub refs: usize,
}

struct Slot {
    generation: u32,
    record: Option<AllocationRecord>,
}

#[derive(Default)]
pub struct Ledger {
    slots: Vec<Slot>,
    vacant: Vec<u32>,
    by_addr: AHashMap<usize, AllocationId>,
    aliases: AHashMap<usize, AliasRecord>,
}

impl Ledger {
    pub fn new() -> Ledger {
        Ledger::default()
    }

    pub fn len(&self) -> usize {
        self.by_addr.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_addr.is_empty()
    }

    pub fn alias_count(&self) -> usize {
        self.aliases.len()
    }

    pub fn insert(&mut self, record: AllocationRecord) -> Result<AllocationId> {
        let addr = record.addr();
        if self.by_addr.contains_key(&addr) {
            return Err(Error::duplicate_registration(addr));
        }
        let id = match self.vacant.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.record = Some(record);
                AllocationId {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                let index = u32::try_from(self.slots.len())
                    .map_err(|_| Error::invalid_operation("ledger is full"))?;
                self.slots.push(Slot {
                    generation: 0,
                    record: Some(record),
                });
                AllocationId {
                    index,
                    generation: 0,
                }
            }
        };
        self.by_addr.insert(addr, id);
        log::trace!("ledger: registered {addr:#x}");
        Ok(id)
    }

    /// Removes the allocation registered at `addr`.
    ///
    /// Aliases of the allocation stay in the ledger until released, but no
    /// longer resolve.
    pub fn remove(&mut self, addr: usize) -> Result<AllocationRecord> {
        let id = self
            .by_addr
            .remove(&addr)
            .ok_or_else(|| Error::unknown_pointer(addr))?;
        let slot = &mut self.slots[id.index as usize];
        let record = slot.record.take().ok_or_else(|| Error::unknown_pointer(addr))?;
        slot.generation = slot.generation.wrapping_add(1);
        self.vacant.push(id.index);
        log::trace!("ledger: released {addr:#x}");
        Ok(record)
    }

    pub fn lookup(&self, addr: usize) -> Option<AllocationId> {
        self.by_addr.get(&addr).copied()
    }

    pub fn contains(&self, addr: usize) -> bool {
        self.by_addr.contains_key(&addr)
    }

    pub fn get(&self, id: AllocationId) -> Option<&AllocationRecord> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.record.as_ref())
    }

    pub fn get_mut(&mut self, id: AllocationId) -> Option<&mut AllocationRecord> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.record.as_mut())
    }

    /// The record registered at `addr`, or `UnknownPointer`.
    pub fn record_mut(&mut self, addr: usize) -> Result<&mut AllocationRecord> {
        match self.lookup(addr) {
            Some(id) => self.get_mut(id).ok_or_else(|| Error::unknown_pointer(addr)),
            None => Err(Error::unknown_pointer(addr)),
        }
    }

    pub fn alias(&self, addr: usize) -> Option<&AliasRecord> {
        self.aliases.get(&addr)
    }

    pub fn is_alias(&self, addr: usize) -> bool {
        self.aliases.contains_key(&addr)
    }

    /// Registers an alias at `addr`, or adds a reference to an identical one.
    ///
    /// Returns the reference count after the insert.
    pub fn insert_alias(&mut self, addr: usize, base: AllocationId, offset: usize) -> Result<usize> {
        match self.aliases.get_mut(&addr) {
            Some(existing) if existing.base == base && existing.offset == offset => {
                existing.refs += 1;
                Ok(existing.refs)
            }
            Some(existing) => Err(Error::alias_conflict(addr, existing.offset, offset)),
            None => {
                self.aliases.insert(
                    addr,
                    AliasRecord {
                        base,
                        offset,
                        refs: 1,
                    },
                );
                log::trace!("ledger: alias {addr:#x} at offset {offset}");
                Ok(1)
            }
        }
    }

    /// Drops one reference to the alias at `addr`. Returns the remaining count;
    /// the alias is removed when it reaches zero.
    pub fn remove_alias(&mut self, addr: usize) -> Result<usize> {
        let alias = self
            .aliases
            .get_mut(&addr)
            .ok_or_else(|| Error::unknown_pointer(addr))?;
        alias.refs -= 1;
        let refs = alias.refs;
        if refs == 0 {
            self.aliases.remove(&addr);
            log::trace!("ledger: alias {addr:#x} released");
        }
        Ok(refs)
    }

    pub fn iter(&self) -> impl Iterator<Item = &AllocationRecord> {
        self.slots.iter().filter_map(|slot| slot.record.as_ref())
    }

    pub fn aliases(&self) -> impl Iterator<Item = (usize, &AliasRecord)> {
        self.aliases.iter().map(|(&addr, alias)| (addr, alias))
    }

    /// Empties the ledger, returning the allocation records.
    pub fn drain(&mut self) -> Vec<AllocationRecord> {
        self.by_addr.clear();
        self.aliases.clear();
        self.vacant.clear();
        std::mem::take(&mut self.slots)
            .into_iter()
            .filter_map(|slot| slot.record)
            .collect()
    }
}

impl std::fmt::Debug for Ledger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ledger")
            .field("allocations", &self.len())
            .field("aliases", &self.alias_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use hemem_common::ErrorKind;

    use super::*;

    fn record(buf: &mut [u8]) -> AllocationRecord {
        AllocationRecord::new(NonNull::new(buf.as_mut_ptr()).unwrap(), buf.len(), HostStorage::External)
    }

    #[test]
    fn test_duplicate_registration() {
        let mut buf = [0u8; 16];
        let mut ledger = Ledger::new();
        ledger.insert(record(&mut buf)).unwrap();
        let err = ledger.insert(record(&mut buf)).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::DuplicateRegistration { .. }));
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn test_remove_unknown() {
        let mut ledger = Ledger::new();
        let err = ledger.remove(0x1000).unwrap_err();
        assert_eq!(err.address(), Some(0x1000));
    }

    #[test]
    fn test_stale_ids_do_not_resolve() {
        let mut a = [0u8; 8];
        let mut b = [0u8; 8];
        let mut ledger = Ledger::new();
        let id = ledger.insert(record(&mut a)).unwrap();
        ledger.remove(a.as_ptr() as usize).unwrap();
        let reused = ledger.insert(record(&mut b)).unwrap();
        assert!(ledger.get(id).is_none());
        assert_eq!(ledger.get(reused).unwrap().addr(), b.as_ptr() as usize);
    }

    #[test]
    fn test_alias_refcount_and_conflict() {
        let mut buf = [0u8; 64];
        let mut ledger = Ledger::new();
        let id = ledger.insert(record(&mut buf)).unwrap();
        let addr = buf.as_ptr() as usize + 8;
        assert_eq!(ledger.insert_alias(addr, id, 8).unwrap(), 1);
        assert_eq!(ledger.insert_alias(addr, id, 8).unwrap(), 2);
        let err = ledger.insert_alias(addr, id, 16).unwrap_err();
        assert!(matches!(
            err.kind(),
            ErrorKind::AliasConflict {
                existing_offset: 8,
                requested_offset: 16,
                ..
            }
        ));
        assert_eq!(ledger.remove_alias(addr).unwrap(), 1);
        assert!(ledger.is_alias(addr));
        assert_eq!(ledger.remove_alias(addr).unwrap(), 0);
        assert!(!ledger.is_alias(addr));
        assert!(ledger.remove_alias(addr).is_err());
    }

    #[test]
    fn test_alias_of_released_base() {
        let mut buf = [0u8; 64];
        let mut ledger = Ledger::new();
        let id = ledger.insert(record(&mut buf)).unwrap();
        let addr = buf.as_ptr() as usize + 4;
        ledger.insert_alias(addr, id, 4).unwrap();
        let alias = *ledger.alias(addr).unwrap();
        assert!(ledger.get(alias.base).is_some());
        ledger.remove(buf.as_ptr() as usize).unwrap();
        assert!(ledger.get(alias.base).is_none());
        assert!(ledger.is_alias(addr));
        assert_eq!(ledger.remove_alias(addr).unwrap(), 0);
    }

    #[test]
    fn test_record_contains() {
        let mut buf = [0u8; 32];
        let rec = record(&mut buf);
        let base = rec.addr();
        assert!(rec.contains(base, 32));
        assert!(rec.contains(base + 16, 16));
        assert!(rec.contains(base + 32, 0));
        assert!(!rec.contains(base + 16, 17));
        assert!(!rec.contains(base - 1, 1));
    }

    #[test]
    fn test_drain() {
        let mut a = [0u8; 8];
        let mut b = [0u8; 8];
        let mut ledger = Ledger::new();
        let id = ledger.insert(record(&mut a)).unwrap();
        ledger.insert(record(&mut b)).unwrap();
        ledger.insert_alias(a.as_ptr() as usize + 1, id, 1).unwrap();
        assert_eq!(ledger.drain().len(), 2);
        assert!(ledger.is_empty());
        assert_eq!(ledger.alias_count(), 0);
    }
}
