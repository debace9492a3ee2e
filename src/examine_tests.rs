/// Examine report tests against file-backed member images.

#[cfg(test)]
mod examine_report_tests {
    use crate::examine::examine;
    use crate::superblock::fixtures::{member_superblock, write_member_image};
    use crate::{LoadError, MdError};

    const UUID: [u32; 4] = [0x00010203, 0x04050607, 0x08090a0b, 0x0c0d0e0f];

    #[test]
    fn test_examine_member_image() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("member0");
        let sb = member_superblock(UUID, 5, 3, 42, 1, &[(8, 1), (8, 17), (8, 33)]);
        let mut file = std::fs::File::create(&path).unwrap();
        write_member_image(&mut file, &sb);

        let report = examine(&path).unwrap();
        assert_eq!(report.magic, "a92b4efc");
        assert_eq!(report.uuid, "00010203:04050607:08090a0b:0c0d0e0f");
        assert_eq!(report.level, 5);
        assert_eq!(report.raid_disks, 3);
        assert_eq!(report.events, 42);
        assert!(report.checksum_ok);
        assert_eq!(report.chunk_kib, 64);
        // this_disk leads the table, then the three slots.
        assert_eq!(report.disks.len(), 4);
        assert_eq!(report.disks[0].slot, "this");
        assert_eq!(report.disks[0].raid_disk, 1);
        assert_eq!(report.disks[2].major, 8);
        assert_eq!(report.disks[2].minor, 17);
    }

    #[test]
    fn test_examine_legacy_uuid_format() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("member0");
        let mut sb = member_superblock(UUID, 1, 2, 7, 0, &[(8, 1), (8, 17)]);
        sb.set_minor_version(60);
        sb.update_checksum();
        let mut file = std::fs::File::create(&path).unwrap();
        write_member_image(&mut file, &sb);

        let report = examine(&path).unwrap();
        assert_eq!(report.uuid, "00010203");
    }

    #[test]
    fn test_examine_blank_device() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blank");
        let file = std::fs::File::create(&path).unwrap();
        file.set_len(1024 * 1024).unwrap();

        let err = examine(&path).unwrap_err();
        assert!(matches!(
            err,
            MdError::SuperblockLoad {
                source: LoadError::BadMagic,
                ..
            }
        ));
    }
}
