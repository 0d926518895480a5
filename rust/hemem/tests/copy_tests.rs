use hemem::{
    ErrorKind, MemoryClass, MemoryConfig, MemoryFlags, MemoryHandle, MemoryKind, MemoryManager,
    Residency,
};

fn manager() -> MemoryManager {
    MemoryManager::open(MemoryConfig::default()).unwrap()
}

fn filled(mm: &mut MemoryManager, bytes: usize, value: u8) -> MemoryHandle {
    let mut handle = MemoryHandle::new(mm, bytes, MemoryKind::Host).unwrap();
    handle.host_slice_mut::<u8>(mm).unwrap().fill(value);
    handle
}

/// Moves the data to the device and leaves the host copy stale.
fn device_only(mm: &mut MemoryManager, handle: &mut MemoryHandle, value: u8) {
    let d = handle.read_write(mm, MemoryClass::Device).unwrap();
    unsafe { d.write_bytes(value, handle.len()) };
}

#[test]
fn test_host_to_host() {
    let mut mm = manager();
    let src = filled(&mut mm, 64, 1);
    let mut dst = filled(&mut mm, 64, 0);
    mm.reset_transfer_stats();

    dst.copy_from(&mut mm, &src, 64).unwrap();
    let stats = mm.transfer_stats();
    assert_eq!(stats.host_to_host, 1);
    assert_eq!(stats.crossings(), 0);
    assert_eq!(dst.flags().residency(), Residency::HostOnlyValid);
    assert_eq!(dst.host_slice::<u8>(&mut mm).unwrap(), &[1u8; 64][..]);
    src.delete(&mut mm).unwrap();
    dst.delete(&mut mm).unwrap();
}

#[test]
fn test_device_to_host() {
    let mut mm = manager();
    let mut src = filled(&mut mm, 64, 0);
    device_only(&mut mm, &mut src, 2);
    let mut dst = filled(&mut mm, 64, 0);
    mm.reset_transfer_stats();

    dst.copy_from(&mut mm, &src, 64).unwrap();
    assert_eq!(mm.transfer_stats().device_to_host, 1);
    assert_eq!(mm.transfer_stats().total(), 1);
    assert_eq!(dst.host_slice::<u8>(&mut mm).unwrap(), &[2u8; 64][..]);
    src.delete(&mut mm).unwrap();
    dst.delete(&mut mm).unwrap();
}

#[test]
fn test_host_to_device() {
    let mut mm = manager();
    let src = filled(&mut mm, 64, 3);
    let mut dst = filled(&mut mm, 64, 0);
    device_only(&mut mm, &mut dst, 0);
    mm.reset_transfer_stats();

    dst.copy_from(&mut mm, &src, 32).unwrap();
    assert_eq!(mm.transfer_stats().host_to_device, 1);
    assert_eq!(dst.flags().residency(), Residency::DeviceOnlyValid);

    let host = dst.host_slice::<u8>(&mut mm).unwrap();
    assert_eq!(&host[..32], &[3u8; 32][..]);
    assert_eq!(&host[32..], &[0u8; 32][..]);
    src.delete(&mut mm).unwrap();
    dst.delete(&mut mm).unwrap();
}

#[test]
fn test_device_to_device() {
    let mut mm = manager();
    let mut src = filled(&mut mm, 64, 0);
    device_only(&mut mm, &mut src, 4);
    let mut dst = filled(&mut mm, 64, 0);
    device_only(&mut mm, &mut dst, 0);
    mm.reset_transfer_stats();

    dst.copy_from(&mut mm, &src, 64).unwrap();
    let stats = mm.transfer_stats();
    assert_eq!(stats.device_to_device, 1);
    assert_eq!(stats.crossings(), 0);
    assert_eq!(dst.host_slice::<u8>(&mut mm).unwrap(), &[4u8; 64][..]);
    src.delete(&mut mm).unwrap();
    dst.delete(&mut mm).unwrap();
}

#[test]
fn test_host_only_destination_pulls_source_to_host() {
    let mut mm = manager();
    let mut src = filled(&mut mm, 16, 5);
    src.read(&mut mm, MemoryClass::Device).unwrap();
    assert_eq!(src.flags().residency(), Residency::BothValid);
    let mut dst = filled(&mut mm, 16, 0);
    mm.reset_transfer_stats();

    dst.copy_from(&mut mm, &src, 16).unwrap();
    assert_eq!(mm.transfer_stats().host_to_host, 1);
    assert_eq!(mm.transfer_stats().total(), 1);
    src.delete(&mut mm).unwrap();
    dst.delete(&mut mm).unwrap();
}

#[test]
fn test_overlapping_host_copy_is_rejected() {
    let mut mm = manager();
    let mut buf = vec![0u8; 64];
    let p = buf.as_mut_ptr();
    let src_flags = MemoryFlags::VALID_HOST;
    let mut dst_flags = MemoryFlags::VALID_HOST;
    unsafe {
        let err = mm
            .copy(p.add(8), p, 16, src_flags, &mut dst_flags)
            .unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Overlap { bytes: 16, .. }));
        mm.copy(p, p, 16, src_flags, &mut dst_flags).unwrap();
        mm.copy(p.add(16), p, 16, src_flags, &mut dst_flags).unwrap();
        mm.copy(p, p.add(8), 0, src_flags, &mut dst_flags).unwrap();
    }
    assert_eq!(mm.transfer_stats().host_to_host, 3);
}

#[test]
fn test_copy_to_host() {
    let mut mm = manager();
    let mut src = filled(&mut mm, 32, 0);
    let mut out = vec![0u8; 32];

    src.host_slice_mut::<u8>(&mut mm).unwrap().fill(8);
    src.copy_to_host(&mut mm, &mut out).unwrap();
    assert_eq!(out, vec![8u8; 32]);
    assert_eq!(mm.transfer_stats().crossings(), 0);

    device_only(&mut mm, &mut src, 9);
    src.copy_to_host(&mut mm, &mut out).unwrap();
    assert_eq!(out, vec![9u8; 32]);
    assert_eq!(mm.transfer_stats().device_to_host, 1);
    assert_eq!(src.flags().residency(), Residency::DeviceOnlyValid);

    let err = src.copy_to_host(&mut mm, &mut out[..8]).unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::InvalidArgument { .. }));
    src.delete(&mut mm).unwrap();
}

#[test]
fn test_copy_from_host() {
    let mut mm = manager();
    let input: Vec<u8> = (0..32).collect();

    let mut dst = filled(&mut mm, 32, 0);
    dst.read(&mut mm, MemoryClass::Device).unwrap();
    dst.copy_from_host(&mut mm, &input).unwrap();
    assert_eq!(dst.flags().residency(), Residency::HostOnlyValid);
    assert_eq!(dst.host_slice::<u8>(&mut mm).unwrap(), &input[..]);

    device_only(&mut mm, &mut dst, 0);
    mm.reset_transfer_stats();
    let reversed: Vec<u8> = input.iter().rev().copied().collect();
    dst.copy_from_host(&mut mm, &reversed).unwrap();
    assert_eq!(mm.transfer_stats().host_to_device, 1);
    assert_eq!(dst.flags().residency(), Residency::DeviceOnlyValid);
    assert_eq!(dst.host_slice::<u8>(&mut mm).unwrap(), &reversed[..]);
    dst.delete(&mut mm).unwrap();
}

#[test]
fn test_copy_between_aliases_of_one_allocation() {
    let mut rng = fastrand::Rng::with_seed(3);
    let mut mm = manager();
    let mut base = MemoryHandle::new(&mut mm, 256, MemoryKind::Host).unwrap();
    rng.fill(base.host_slice_mut::<u8>(&mut mm).unwrap());
    let expected = base.host_slice::<u8>(&mut mm).unwrap()[..64].to_vec();

    let src = base.alias(&mut mm, 0, 64).unwrap();
    let mut dst = base.alias(&mut mm, 128, 64).unwrap();
    dst.copy_from(&mut mm, &src, 64).unwrap();
    assert_eq!(&base.host_slice::<u8>(&mut mm).unwrap()[128..192], &expected[..]);

    src.delete(&mut mm).unwrap();
    dst.delete(&mut mm).unwrap();
    base.delete(&mut mm).unwrap();
}
