//! The memory controller: the configured host, device and copy providers.

use std::ptr::NonNull;

use hemem_common::{Error, Result};

use crate::{
    budget::DeviceBudget,
    config::MemoryConfig,
    kind::MemoryKind,
    space::{CopySpace, DeviceSpace, HostSpace, TransferStats},
};

/// Owns the providers selected by a [`MemoryConfig`].
///
/// All storage and all transfers requested by the manager go through the
/// controller, which also enforces the device capacity and counts transfers.
#[derive(Debug)]
pub struct Controller {
    config: MemoryConfig,
    host: HostSpace,
    device: DeviceSpace,
    copy: CopySpace,
    budget: DeviceBudget,
    stats: TransferStats,
    device_bytes: u64,
}

impl Controller {
    pub fn new(config: MemoryConfig) -> Result<Controller> {
        config.validate()?;
        let host = HostSpace::new(config.host, config.pooled)?;
        let device = DeviceSpace::new(config.device, config.pooled);
        let copy = CopySpace::new(config.device);
        let budget = DeviceBudget::new(config.device_capacity);
        log::debug!(
            "memory controller: host = {} (page protection: {}), device = {}, copy = {:?}",
            host.name(),
            host.supports_protection(),
            device.name(),
            copy
        );
        Ok(Controller {
            config,
            host,
            device,
            copy,
            budget,
            stats: TransferStats::default(),
            device_bytes: 0,
        })
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    pub fn host_kind(&self) -> MemoryKind {
        self.config.host
    }

    pub fn device_kind(&self) -> MemoryKind {
        self.config.device
    }

    pub fn is_unified(&self) -> bool {
        self.device.is_unified()
    }

    pub fn has_device(&self) -> bool {
        self.device.is_available()
    }

    pub fn is_protected_host(&self) -> bool {
        matches!(self.host, HostSpace::Protected)
    }

    pub fn host_allocate(&mut self, bytes: usize) -> Result<NonNull<u8>> {
        let ptr = self.host.allocate(bytes)?;
        log::trace!("{}: allocated {bytes} bytes at {:p}", self.host.name(), ptr);
        Ok(ptr)
    }

    /// # Safety
    ///
    /// See [`HostSpace::deallocate`].
    pub unsafe fn host_deallocate(&mut self, ptr: NonNull<u8>, bytes: usize) -> Result<()> {
        log::trace!("{}: releasing {bytes} bytes at {:p}", self.host.name(), ptr);
        unsafe { self.host.deallocate(ptr, bytes) }
    }

    /// # Safety
    ///
    /// See [`HostSpace::protect`].
    pub unsafe fn host_protect(&self, ptr: NonNull<u8>, bytes: usize) -> Result<()> {
        unsafe { self.host.protect(ptr, bytes) }
    }

    /// # Safety
    ///
    /// See [`HostSpace::unprotect`].
    pub unsafe fn host_unprotect(&self, ptr: NonNull<u8>, bytes: usize) -> Result<()> {
        unsafe { self.host.unprotect(ptr, bytes) }
    }

    /// Allocates device storage for `bytes`, charging the device capacity.
    ///
    /// `host` is the host storage the device buffer will mirror, if any.
    pub fn device_allocate(&mut self, host: Option<NonNull<u8>>, bytes: usize) -> Result<NonNull<u8>> {
        if self.device.is_unified() {
            return self.device.allocate(host, bytes);
        }
        if !self.device.is_available() {
            return Err(Error::invalid_operation(format!(
                "device access with device memory kind '{}'",
                self.config.device
            )));
        }
        if !self.budget.withdraw(bytes as u64) {
            return Err(Error::allocation(
                format!("{} (capacity {})", self.device.name(), self.budget.remaining()),
                bytes,
            ));
        }
        match self.device.allocate(host, bytes) {
            Ok(ptr) => {
                self.device_bytes += bytes as u64;
                log::trace!("{}: allocated {bytes} bytes at {:p}", self.device.name(), ptr);
                Ok(ptr)
            }
            Err(e) => {
                self.budget.deposit(bytes as u64);
                Err(e)
            }
        }
    }

    /// # Safety
    ///
    /// See [`DeviceSpace::deallocate`].
    pub unsafe fn device_deallocate(&mut self, ptr: NonNull<u8>, bytes: usize) -> Result<()> {
        if self.device.is_unified() {
            return Ok(());
        }
        unsafe { self.device.deallocate(ptr, bytes)? };
        self.budget.deposit(bytes as u64);
        self.device_bytes = self.device_bytes.saturating_sub(bytes as u64);
        log::trace!("{}: released {bytes} bytes at {:p}", self.device.name(), ptr);
        Ok(())
    }

    /// # Safety
    ///
    /// See [`CopySpace::host_to_device`].
    pub unsafe fn host_to_device(&mut self, dst: *mut u8, src: *const u8, bytes: usize) {
        let moved = unsafe { self.copy.host_to_device(dst, src, bytes) };
        log::debug!("host -> device: {bytes} bytes {src:p} -> {dst:p}");
        self.stats.host_to_device += 1;
        self.stats.bytes_moved += moved as u64;
    }

    /// # Safety
    ///
    /// See [`CopySpace::device_to_host`].
    pub unsafe fn device_to_host(&mut self, dst: *mut u8, src: *const u8, bytes: usize) {
        let moved = unsafe { self.copy.device_to_host(dst, src, bytes) };
        log::debug!("device -> host: {bytes} bytes {src:p} -> {dst:p}");
        self.stats.device_to_host += 1;
        self.stats.bytes_moved += moved as u64;
    }

    /// # Safety
    ///
    /// See [`CopySpace::device_to_device`].
    pub unsafe fn device_to_device(&mut self, dst: *mut u8, src: *const u8, bytes: usize) {
        let moved = unsafe { self.copy.device_to_device(dst, src, bytes) };
        log::debug!("device -> device: {bytes} bytes {src:p} -> {dst:p}");
        self.stats.device_to_device += 1;
        self.stats.bytes_moved += moved as u64;
    }

    /// Host-to-host copy. Distinct ranges must not overlap.
    ///
    /// # Safety
    ///
    /// `src` must be readable and `dst` writable for `bytes`.
    pub unsafe fn host_to_host(&mut self, dst: *mut u8, src: *const u8, bytes: usize) -> Result<()> {
        if bytes == 0 || std::ptr::eq(dst, src) {
            self.stats.host_to_host += 1;
            return Ok(());
        }
        let (d, s) = (dst as usize, src as usize);
        if d < s.saturating_add(bytes) && s < d.saturating_add(bytes) {
            return Err(Error::overlap(d, s, bytes));
        }
        unsafe { std::ptr::copy_nonoverlapping(src, dst, bytes) };
        log::debug!("host -> host: {bytes} bytes {src:p} -> {dst:p}");
        self.stats.host_to_host += 1;
        self.stats.bytes_moved += bytes as u64;
        Ok(())
    }

    pub fn transfer_stats(&self) -> TransferStats {
        self.stats
    }

    pub fn reset_transfer_stats(&mut self) {
        self.stats = TransferStats::default();
    }

    /// Live device bytes allocated through this controller.
    pub fn device_bytes_in_use(&self) -> u64 {
        self.device_bytes
    }

    pub fn device_budget(&self) -> &DeviceBudget {
        &self.budget
    }
}
