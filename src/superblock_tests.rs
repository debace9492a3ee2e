/// Superblock codec tests: checksum behaviour, event counter composition,
/// on-disk round trips and the compare rules assembly relies on.

#[cfg(test)]
mod superblock_codec_tests {
    use crate::superblock::fixtures::{member_superblock, write_member_image};
    use crate::superblock::{
        compare, device_sectors, new_size_sectors, sb_offset_bytes, DiskDescriptor, DiskFlags,
        LoadError, SbCompare, Superblock, MD_RESERVED_SECTORS, MD_SB_MAGIC,
    };

    const UUID: [u32; 4] = [0x01020304, 0x05060708, 0x090a0b0c, 0x0d0e0f10];

    fn sample() -> Superblock {
        member_superblock(UUID, 5, 3, 42, 0, &[(8, 1), (8, 17), (8, 33)])
    }

    #[test]
    fn test_checksum_ignores_stored_checksum() {
        let mut a = sample();
        let mut b = sample();
        a.set_sb_csum(0);
        b.set_sb_csum(0xdeadbeef);
        assert_eq!(a.checksum(), b.checksum());
    }

    #[test]
    fn test_update_checksum_validates() {
        let mut sb = sample();
        sb.set_sb_csum(12345);
        assert!(!sb.checksum_ok());
        sb.update_checksum();
        assert!(sb.checksum_ok());
    }

    #[test]
    fn test_checksum_changes_with_content() {
        let mut sb = sample();
        let before = sb.checksum();
        sb.set_events(43);
        assert_ne!(before, sb.checksum());
    }

    #[test]
    fn test_event_counter_round_trip() {
        let mut sb = Superblock::zeroed();
        for events in [0u64, 1, 41, 0xffff_ffff, 0x1_0000_0000, 0x1234_5678_9abc_def0] {
            sb.set_events(events);
            assert_eq!(sb.events(), events);
        }
    }

    #[test]
    fn test_event_counter_halves() {
        let mut sb = Superblock::zeroed();
        sb.set_events(0x1_0000_0002);
        // One update past the 32-bit boundary splits into hi=1, lo=2.
        assert_eq!(sb.events() >> 32, 1);
        assert_eq!(sb.events() & 0xffff_ffff, 2);
    }

    #[test]
    fn test_byte_round_trip() {
        let sb = sample();
        let restored = Superblock::from_bytes(&sb.to_bytes());
        assert_eq!(sb, restored);
    }

    #[test]
    fn test_store_load_round_trip() {
        let mut file = tempfile::tempfile().unwrap();
        let mut sb = sample();
        sb.update_checksum();
        write_member_image(&mut file, &sb);

        let loaded = Superblock::load(&mut file).unwrap();
        assert_eq!(sb, loaded);
        assert!(loaded.checksum_ok());
    }

    #[test]
    fn test_load_too_small() {
        let mut file = tempfile::tempfile().unwrap();
        file.set_len((MD_RESERVED_SECTORS * 2 - 1) * 512).unwrap();
        assert!(matches!(
            Superblock::load(&mut file),
            Err(LoadError::TooSmall)
        ));
    }

    #[test]
    fn test_load_bad_magic() {
        let mut file = tempfile::tempfile().unwrap();
        file.set_len(1024 * 1024).unwrap();
        assert!(matches!(
            Superblock::load(&mut file),
            Err(LoadError::BadMagic)
        ));
    }

    #[test]
    fn test_load_wrong_major_version() {
        let mut file = tempfile::tempfile().unwrap();
        let mut sb = sample();
        sb.set_major_version(1);
        sb.update_checksum();
        write_member_image(&mut file, &sb);
        assert!(matches!(
            Superblock::load(&mut file),
            Err(LoadError::WrongMajorVersion(1))
        ));
    }

    #[test]
    fn test_device_sectors_regular_file_fallback() {
        let file = tempfile::tempfile().unwrap();
        file.set_len(1024 * 1024).unwrap();
        assert_eq!(device_sectors(&file).unwrap(), 2048);
    }

    #[test]
    fn test_superblock_offset() {
        // A whole number of 64 KiB chunks: the record sits one chunk in
        // from the end.
        assert_eq!(new_size_sectors(2048), 1920);
        assert_eq!(sb_offset_bytes(2048), 1920 * 512);
        // Odd tail sectors are rounded away first.
        assert_eq!(new_size_sectors(2000), 1792);
    }

    #[test]
    fn test_compare_adopts_into_empty_reference() {
        let mut reference = Superblock::zeroed();
        let sb = sample();
        assert_eq!(compare(&mut reference, &sb), SbCompare::Same);
        assert_eq!(reference, sb);
    }

    #[test]
    fn test_compare_wrong_uuid_leaves_reference_alone() {
        let mut reference = Superblock::zeroed();
        let first = sample();
        assert_eq!(compare(&mut reference, &first), SbCompare::Same);

        let mut other = sample();
        other.set_uuid([1, 2, 3, 4]);
        other.update_checksum();
        assert_eq!(compare(&mut reference, &other), SbCompare::WrongUuid);
        assert_eq!(reference, first);
    }

    #[test]
    fn test_compare_wrong_magic() {
        let mut reference = sample();
        let mut bad = sample();
        bad.set_magic(0);
        assert_eq!(compare(&mut reference, &bad), SbCompare::WrongMagic);
    }

    #[test]
    fn test_compare_wrong_geometry() {
        let mut reference = sample();
        let mut other = sample();
        other.set_raid_disks(4);
        assert_eq!(compare(&mut reference, &other), SbCompare::WrongGeometry);

        let mut other = sample();
        other.set_ctime(reference.ctime() + 1);
        assert_eq!(compare(&mut reference, &other), SbCompare::WrongGeometry);
    }

    #[test]
    fn test_compare_same_member() {
        let mut reference = sample();
        // Another member of the same set differs in its own slot entry and
        // event count, neither of which is geometry.
        let mut other = member_superblock(UUID, 5, 3, 41, 1, &[(8, 1), (8, 17), (8, 33)]);
        other.update_checksum();
        assert_eq!(compare(&mut reference, &other), SbCompare::Same);
    }

    #[test]
    fn test_legacy_uuid_reads_one_word() {
        let mut sb = sample();
        sb.set_minor_version(89);
        assert_eq!(sb.uuid(), [UUID[0], 0, 0, 0]);
        sb.set_minor_version(90);
        assert_eq!(sb.uuid(), UUID);
    }

    #[test]
    fn test_disk_descriptor_round_trip() {
        let mut sb = Superblock::zeroed();
        let d = DiskDescriptor {
            number: 3,
            major: 8,
            minor: 49,
            raid_disk: 2,
            state: DiskFlags::ACTIVE | DiskFlags::SYNC,
        };
        sb.set_disk(3, &d);
        assert_eq!(sb.disk(3), d);
        assert_eq!(sb.disk(2), DiskDescriptor::default());

        sb.set_this_disk(&d);
        assert_eq!(sb.this_disk(), d);
    }

    #[test]
    fn test_magic_constant() {
        assert_eq!(MD_SB_MAGIC, 0xa92b4efc);
        assert_eq!(sample().magic(), MD_SB_MAGIC);
    }
}
