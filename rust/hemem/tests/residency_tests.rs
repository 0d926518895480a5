use hemem::{
    ErrorKind, MemoryClass, MemoryConfig, MemoryFlags, MemoryHandle, MemoryKind, MemoryManager,
    Residency,
};

fn manager() -> MemoryManager {
    MemoryManager::open(MemoryConfig::default()).unwrap()
}

fn host_flags(mm: &mut MemoryManager, buf: &mut [u8]) -> MemoryFlags {
    let mut flags = MemoryFlags::empty();
    unsafe {
        mm.register_memory(
            buf.as_mut_ptr(),
            buf.as_mut_ptr(),
            buf.len(),
            MemoryKind::Host,
            false,
            &mut flags,
        )
        .unwrap()
    };
    flags
}

#[test]
fn test_round_trip_through_device() {
    let mut rng = fastrand::Rng::with_seed(7);
    let mut mm = manager();
    for bytes in [1usize, 7, 64, 1000, 4096 + 3] {
        let mut pattern = vec![0u8; bytes];
        rng.fill(&mut pattern);

        let mut buf = vec![0u8; bytes];
        let p = buf.as_mut_ptr();
        let mut flags = host_flags(&mut mm, &mut buf);

        let h = mm.write(p, MemoryClass::Host, bytes, &mut flags).unwrap();
        unsafe { std::ptr::copy_nonoverlapping(pattern.as_ptr(), h, bytes) };

        let d = mm.read(p, MemoryClass::Device, bytes, &mut flags).unwrap();
        let on_device = unsafe { std::slice::from_raw_parts(d, bytes) };
        assert_eq!(on_device, &pattern[..]);

        // Force the host copy stale so the final read has to come back.
        mm.read_write(p, MemoryClass::Device, bytes, &mut flags).unwrap();
        unsafe { p.write_bytes(0, bytes) };

        let h = mm.read(p, MemoryClass::Host, bytes, &mut flags).unwrap();
        assert_eq!(unsafe { std::slice::from_raw_parts(h, bytes) }, &pattern[..]);
        assert_eq!(flags.residency(), Residency::BothValid);
        mm.release(p, true).unwrap();
    }
    assert_eq!(mm.device_bytes_in_use(), 0);
}

#[test]
fn test_same_class_twice_copies_once() {
    let mut mm = manager();
    let (p, mut flags) = mm.allocate(256, MemoryKind::Host).unwrap();

    let d1 = mm.read(p, MemoryClass::Device, 256, &mut flags).unwrap();
    let d2 = mm.read(p, MemoryClass::Device, 256, &mut flags).unwrap();
    assert_eq!(d1, d2);
    assert_eq!(mm.transfer_stats().host_to_device, 1);

    mm.read_write(p, MemoryClass::Device, 256, &mut flags).unwrap();
    mm.read_write(p, MemoryClass::Device, 256, &mut flags).unwrap();
    assert_eq!(mm.transfer_stats().total(), 1);

    mm.read(p, MemoryClass::Host, 256, &mut flags).unwrap();
    mm.read(p, MemoryClass::Host, 256, &mut flags).unwrap();
    let stats = mm.transfer_stats();
    assert_eq!(stats.device_to_host, 1);
    assert_eq!(stats.total(), 2);
    mm.delete(p, flags).unwrap();
}

#[test]
fn test_host_write_invalidates_device() {
    let mut mm = manager();
    let (p, mut flags) = mm.allocate(32, MemoryKind::Host).unwrap();
    mm.read(p, MemoryClass::Device, 32, &mut flags).unwrap();
    assert_eq!(flags.residency(), Residency::BothValid);
    mm.reset_transfer_stats();

    let h = mm.write(p, MemoryClass::Host, 32, &mut flags).unwrap();
    assert_eq!(flags.residency(), Residency::HostOnlyValid);
    unsafe { h.write_bytes(0x5A, 32) };
    assert_eq!(mm.transfer_stats().total(), 0);

    let d = mm.read(p, MemoryClass::Device, 32, &mut flags).unwrap();
    assert_eq!(mm.transfer_stats().host_to_device, 1);
    assert_eq!(mm.transfer_stats().total(), 1);
    assert_eq!(unsafe { *d.add(31) }, 0x5A);
    mm.delete(p, flags).unwrap();
}

#[test]
fn test_sixty_four_byte_scenario() {
    let mut mm = manager();
    let mut storage = vec![f64::NAN; 8];
    let h = storage.as_mut_ptr().cast::<u8>();
    unsafe { mm.register(h, 64).unwrap() };
    let mut flags = MemoryFlags::REGISTERED | MemoryFlags::VALID_HOST;

    let hw = mm.write(h, MemoryClass::Host, 64, &mut flags).unwrap();
    unsafe { std::slice::from_raw_parts_mut(hw.cast::<f64>(), 8).fill(0.0) };

    assert_eq!(mm.device_bytes_in_use(), 0);
    mm.read(h, MemoryClass::Device, 64, &mut flags).unwrap();
    assert_eq!(mm.transfer_stats().host_to_device, 1);
    assert_eq!(mm.device_bytes_in_use(), 64);

    let dw = mm.write(h, MemoryClass::Device, 64, &mut flags).unwrap();
    unsafe { std::slice::from_raw_parts_mut(dw.cast::<f64>(), 8).fill(1.0) };
    assert_eq!(flags.residency(), Residency::DeviceOnlyValid);

    mm.read(h, MemoryClass::Host, 64, &mut flags).unwrap();
    let stats = mm.transfer_stats();
    assert_eq!((stats.host_to_device, stats.device_to_host), (1, 1));
    assert_eq!(storage, vec![1.0; 8]);

    mm.release(h, true).unwrap();
    assert_eq!(mm.device_bytes_in_use(), 0);
    assert!(!mm.is_registered(h));
    let err = mm.read(h, MemoryClass::Device, 64, &mut flags).unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::UnknownPointer { .. }));
    assert_eq!(err.address(), Some(h as usize));
}

#[test]
fn test_released_pointer_fails_on_every_path() {
    let mut mm = manager();
    let mut storage = vec![0u8; 64];
    let h = storage.as_mut_ptr();
    unsafe { mm.register(h, 64).unwrap() };
    let mut flags = MemoryFlags::REGISTERED | MemoryFlags::VALID_HOST;
    mm.read(h, MemoryClass::Device, 64, &mut flags).unwrap();
    mm.release(h, true).unwrap();
    let stale = flags;

    let mut out = vec![0u8; 64];
    let mut out_flags = MemoryFlags::VALID_HOST;
    let attempts = [
        mm.read(h, MemoryClass::Host, 64, &mut flags).map(drop),
        mm.write(h, MemoryClass::Host, 64, &mut flags).map(drop),
        mm.read_write(h, MemoryClass::Host, 64, &mut flags).map(drop),
        mm.write(h, MemoryClass::Device, 64, &mut flags).map(drop),
        unsafe { mm.copy(out.as_mut_ptr(), h, 64, flags, &mut out_flags) },
        unsafe { mm.copy_to_host(out.as_mut_ptr(), h, 64, flags) },
        unsafe { mm.copy_from_host(h, out.as_ptr(), 64, &mut flags) },
    ];
    for (i, result) in attempts.into_iter().enumerate() {
        let err = result.unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::UnknownPointer { .. }), "attempt {i}");
        assert_eq!(err.address(), Some(h as usize), "attempt {i}");
    }
    assert_eq!(flags, stale);
    assert_eq!(out_flags, MemoryFlags::VALID_HOST);
    assert_eq!(mm.transfer_stats().total(), 1);
}

#[test]
fn test_device_allocation_starts_device_valid() {
    let mut mm = manager();
    let mut handle = MemoryHandle::new(&mut mm, 40, MemoryKind::Device).unwrap();
    assert!(handle.flags().contains(MemoryFlags::PREFERS_DEVICE));
    assert_eq!(handle.flags().residency(), Residency::DeviceOnlyValid);

    let d = handle.read_write(&mut mm, MemoryClass::Device).unwrap();
    assert_eq!(mm.transfer_stats().total(), 0);
    unsafe { d.write_bytes(3, 40) };

    assert_eq!(handle.host_slice::<u8>(&mut mm).unwrap(), &[3u8; 40][..]);
    assert_eq!(mm.transfer_stats().device_to_host, 1);
    assert_eq!(mm.memory_kind_of(handle.flags()), MemoryKind::Device);
    handle.delete(&mut mm).unwrap();
}

#[test]
fn test_memory_kind_of_follows_validity() {
    let mut mm = manager();
    let (p, mut flags) = mm.allocate(8, MemoryKind::Host).unwrap();
    assert_eq!(mm.memory_kind_of(flags), MemoryKind::Host);
    mm.write(p, MemoryClass::Device, 8, &mut flags).unwrap();
    assert_eq!(mm.memory_kind_of(flags), MemoryKind::Device);
    mm.delete(p, flags).unwrap();
}

#[test]
fn test_failed_access_leaves_flags_untouched() {
    let mut mm = manager();
    let (p, mut flags) = mm.allocate(16, MemoryKind::Host).unwrap();
    let before = flags;
    let err = mm.read(p, MemoryClass::Device, 17, &mut flags).unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::InvalidArgument { .. }));
    assert_eq!(flags, before);
    assert_eq!(mm.device_bytes_in_use(), 0);
    mm.delete(p, flags).unwrap();
}

#[test]
fn test_null_pointer_requests() {
    let mut mm = manager();
    let mut flags = MemoryFlags::empty();
    let p = mm
        .read_write(std::ptr::null_mut(), MemoryClass::Device, 0, &mut flags)
        .unwrap();
    assert!(p.is_null());
    assert_eq!(flags, MemoryFlags::empty());
    let err = mm
        .read(std::ptr::null_mut(), MemoryClass::Host, 4, &mut flags)
        .unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::InvalidArgument { .. }));
}

#[test]
fn test_manager_is_send() {
    fn assert_send<T: Send>() {}
    assert_send::<MemoryManager>();
}

#[test]
fn test_drop_without_close_releases_device() {
    let mut buf = vec![1u8; 128];
    {
        let mut mm = manager();
        unsafe { mm.register(buf.as_mut_ptr(), 128).unwrap() };
        mm.resolve_device_pointer(buf.as_ptr(), 128, true).unwrap();
        assert_eq!(mm.device_bytes_in_use(), 128);
    }
    assert_eq!(buf, vec![1u8; 128]);
}
