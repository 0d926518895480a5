use hemem::{
    ErrorKind, MemoryClass, MemoryConfig, MemoryFlags, MemoryHandle, MemoryKind, MemoryManager,
    Residency,
};

#[test]
fn test_protected_host_rejects_stale_claims() {
    let config = MemoryConfig::new(MemoryKind::HostProtected, MemoryKind::Device);
    let mut mm = MemoryManager::open(config).unwrap();
    let (p, mut flags) = mm.allocate(100, MemoryKind::Host).unwrap();
    assert_eq!(p as usize % hemem_page_alloc::mmap::get_page_size(), 0);
    unsafe { p.write_bytes(1, 100) };

    let stale = flags;
    let d = mm.read_write(p, MemoryClass::Device, 100, &mut flags).unwrap();
    unsafe { d.write_bytes(2, 100) };
    assert!(mm.pointer_report().contains("locked"));

    let mut stale = stale;
    let err = mm.read(p, MemoryClass::Host, 100, &mut stale).unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::IllegalAccess { .. }));
    assert_eq!(err.address(), Some(p as usize));

    let h = mm.read(p, MemoryClass::HostProtected, 100, &mut flags).unwrap();
    assert!(!mm.pointer_report().contains("locked"));
    assert_eq!(unsafe { std::slice::from_raw_parts(h, 100) }, &[2u8; 100][..]);
    unsafe { p.write_bytes(3, 100) };
    mm.delete(p, flags).unwrap();
    mm.close().unwrap();
}

#[test]
fn test_protected_host_locks_after_host_upload() {
    let config = MemoryConfig::new(MemoryKind::HostProtected, MemoryKind::Device);
    let mut mm = MemoryManager::open(config).unwrap();
    let (p, mut flags) = mm.allocate(64, MemoryKind::Host).unwrap();
    mm.read(p, MemoryClass::Device, 64, &mut flags).unwrap();
    assert_eq!(flags.residency(), Residency::BothValid);

    let input: Vec<u8> = (0..64).collect();
    let mut device_only = flags - MemoryFlags::VALID_HOST;
    unsafe { mm.copy_from_host(p, input.as_ptr(), 64, &mut device_only).unwrap() };
    assert_eq!(device_only.residency(), Residency::DeviceOnlyValid);
    assert!(mm.pointer_report().contains("locked"));

    let err = mm.read(p, MemoryClass::Host, 64, &mut flags).unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::IllegalAccess { .. }));

    let h = mm.read(p, MemoryClass::Host, 64, &mut device_only).unwrap();
    assert_eq!(unsafe { std::slice::from_raw_parts(h, 64) }, &input[..]);
    assert!(!mm.pointer_report().contains("locked"));
    mm.delete(p, device_only).unwrap();
}

#[test]
fn test_protected_host_write_unlocks() {
    let config = MemoryConfig::new(MemoryKind::HostProtected, MemoryKind::Device);
    let mut mm = MemoryManager::open(config).unwrap();
    let mut handle = MemoryHandle::new(&mut mm, 4096 * 2 + 1, MemoryKind::Device).unwrap();
    assert!(mm.pointer_report().contains("locked"));

    let h = handle.write(&mut mm, MemoryClass::Host).unwrap();
    unsafe { h.add(4096 * 2).write(7) };
    assert_eq!(handle.flags().residency(), Residency::HostOnlyValid);

    handle.write(&mut mm, MemoryClass::Device).unwrap();
    let mut out = vec![0u8; handle.len()];
    handle.copy_to_host(&mut mm, &mut out).unwrap();
    handle.delete(&mut mm).unwrap();
}

#[test]
fn test_pooled_spaces() {
    let mut rng = fastrand::Rng::with_seed(5);
    let config = MemoryConfig::default()
        .with_host(MemoryKind::Host64)
        .with_pooled(true);
    let mut mm = MemoryManager::open(config).unwrap();

    let mut handles = Vec::new();
    for _ in 0..64 {
        let bytes = rng.usize(1..300_000);
        let mut handle = MemoryHandle::new(&mut mm, bytes, MemoryKind::Host64).unwrap();
        assert_eq!(handle.host_ptr() as usize % 64, 0);
        let value = rng.u8(..);
        handle.host_slice_mut::<u8>(&mut mm).unwrap().fill(value);
        let d = handle.read_write(&mut mm, MemoryClass::Device).unwrap();
        assert_eq!(unsafe { *d.add(bytes - 1) }, value);
        handles.push((handle, value));
    }
    for (mut handle, value) in handles {
        assert!(handle.host_slice::<u8>(&mut mm).unwrap().iter().all(|&b| b == value));
        handle.delete(&mut mm).unwrap();
    }
    assert_eq!(mm.device_bytes_in_use(), 0);
    assert_eq!(mm.allocation_count(), 0);
}

#[test]
fn test_unified_memory() {
    let mut mm = MemoryManager::open(MemoryConfig::unified()).unwrap();
    let (p, mut flags) = mm.allocate(64, MemoryKind::DeviceUnified).unwrap();
    assert_eq!(flags.residency(), Residency::BothValid);

    let d = mm.read_write(p, MemoryClass::DeviceUnified, 64, &mut flags).unwrap();
    assert_eq!(d, p);
    unsafe { d.write_bytes(5, 64) };

    let h = mm.read(p, MemoryClass::Host, 64, &mut flags).unwrap();
    assert_eq!(unsafe { *h.add(63) }, 5);
    let stats = mm.transfer_stats();
    assert_eq!(stats.device_to_host, 1);
    assert_eq!(stats.bytes_moved, 0);
    assert_eq!(mm.device_bytes_in_use(), 0);

    let err = mm.allocate_device(64).unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::InvalidOperation { .. }));
    mm.delete(p, flags).unwrap();
}

#[test]
fn test_device_capacity_exhaustion() {
    let config = MemoryConfig::default().with_device_capacity(1024);
    let mut mm = MemoryManager::open(config).unwrap();
    let (a, mut a_flags) = mm.allocate(800, MemoryKind::Host).unwrap();
    let (b, mut b_flags) = mm.allocate(800, MemoryKind::Host).unwrap();

    mm.read(a, MemoryClass::Device, 800, &mut a_flags).unwrap();
    let before = b_flags;
    let err = mm.read(b, MemoryClass::Device, 800, &mut b_flags).unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::AllocationFailure { bytes: 800, .. }));
    assert_eq!(b_flags, before);
    assert_eq!(mm.device_bytes_in_use(), 800);

    mm.delete(a, a_flags).unwrap();
    mm.read(b, MemoryClass::Device, 800, &mut b_flags).unwrap();
    assert_eq!(mm.controller().device_budget().remaining(), 224);
    mm.delete(b, b_flags).unwrap();
}

#[test]
fn test_host_only_configuration() {
    let config = MemoryConfig::new(MemoryKind::Host, MemoryKind::Host);
    let mut mm = MemoryManager::open(config).unwrap();
    let (p, mut flags) = mm.allocate(16, MemoryKind::Host).unwrap();
    let err = mm.read(p, MemoryClass::Device, 16, &mut flags).unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::InvalidOperation { .. }));
    assert_eq!(mm.memory_kind_of(flags | MemoryFlags::VALID_DEVICE), MemoryKind::Host);
    let err = mm.allocate(16, MemoryKind::Device).unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::Configuration { .. }));
    mm.delete(p, flags).unwrap();
}

#[test]
fn test_open_rejects_bad_configuration() {
    for text in [
        r#"{ "host": "device-unified", "device": "device" }"#,
        r#"{ "host": "device", "device": "device" }"#,
        r#"{ "host": "host", "device": "device-unified" }"#,
        r#"{ "host": "host-protected", "device": "device", "pooled": true }"#,
    ] {
        let config = MemoryConfig::from_json(text).unwrap();
        let err = MemoryManager::open(config).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Configuration { .. }), "{text}");
    }
    let err = MemoryConfig::from_json(r#"{ "host": "gpu", "device": "device" }"#).unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::Configuration { .. }));
}

#[test]
fn test_config_roundtrip_through_manager() {
    let config = MemoryConfig::from_json(
        r#"{ "host": "host-32", "device": "device", "device_capacity": 4096 }"#,
    )
    .unwrap();
    let mm = MemoryManager::open(config.clone()).unwrap();
    assert_eq!(mm.config(), &config);
    let value: serde_json::Value = serde_json::from_str(&config.to_json().unwrap()).unwrap();
    assert_eq!(value["host"], "host-32");
    assert_eq!(value["device_capacity"], 4096);
    mm.close().unwrap();
}
