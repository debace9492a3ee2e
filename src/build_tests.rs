/// Build engine tests: the superblock-less payloads, the legacy geometry
/// word, and teardown after a failed bring-up.

#[cfg(test)]
mod build_engine_tests {
    use crate::build::{build_members, BuildOptions, LegacyGeometry};
    use crate::driver::fake::{Call, FakeDriver};
    use crate::driver::DriverVersion;
    use crate::MdError;

    fn two_members() -> Vec<(String, u32, u32)> {
        vec![
            ("/dev/sda1".to_string(), 8, 1),
            ("/dev/sdb1".to_string(), 8, 17),
        ]
    }

    fn opts(level: i32, raid_disks: u32) -> BuildOptions {
        BuildOptions {
            level,
            raid_disks,
            chunk_kib: 0,
            verbose: false,
        }
    }

    #[test]
    fn test_modern_build_payloads() {
        let driver = FakeDriver::default();
        build_members("/dev/md0", &driver, 2, &two_members(), &opts(0, 2)).unwrap();

        let calls = driver.calls();
        let Call::SetArrayInfo(Some(array)) = &calls[0] else {
            panic!("expected SET_ARRAY_INFO, got {:?}", calls[0]);
        };
        // No superblocks: the array is volatile and fully active.
        assert_eq!(array.not_persistent, 1);
        assert_eq!(array.level, 0);
        assert_eq!(array.raid_disks, 2);
        assert_eq!(array.active_disks, 2);
        assert_eq!(array.working_disks, 2);
        assert_eq!(array.spare_disks, 0);
        assert_eq!(array.chunk_size, 65536);
        assert_eq!(array.md_minor, 2);

        let adds: Vec<(i32, i32, i32)> = calls
            .iter()
            .filter_map(|c| match c {
                Call::AddNewDisk(d) => Some((d.number, d.raid_disk, d.state)),
                _ => None,
            })
            .collect();
        assert_eq!(adds, vec![(0, 0, 6), (1, 1, 6)]);
        assert_eq!(*calls.last().unwrap(), Call::RunArray);
    }

    #[test]
    fn test_legacy_build_registers_then_starts() {
        let driver = FakeDriver {
            version: DriverVersion::new(0, 36, 0),
            ..FakeDriver::default()
        };
        build_members("/dev/md0", &driver, 0, &two_members(), &opts(0, 2)).unwrap();

        assert_eq!(
            driver.calls(),
            vec![
                Call::RegisterDev(8, 1),
                Call::RegisterDev(8, 17),
                Call::StartMd(0x20004),
            ]
        );
    }

    #[test]
    fn test_geometry_word_encoding() {
        // raid0 at the default 64 KiB chunk: personality 2, factor
        // log2(64K / 4K) = 4.
        assert_eq!(
            LegacyGeometry {
                level: 0,
                chunk_kib: 64
            }
            .encode(),
            0x20004
        );
        // linear at the minimum chunk has an all-zero low nibble.
        assert_eq!(
            LegacyGeometry {
                level: -1,
                chunk_kib: 4
            }
            .encode(),
            0x10000
        );
        assert_eq!(
            LegacyGeometry {
                level: 0,
                chunk_kib: 128
            }
            .encode(),
            0x20005
        );
    }

    #[test]
    fn test_raid_level_restricted() {
        let driver = FakeDriver::default();
        let err =
            build_members("/dev/md0", &driver, 0, &two_members(), &opts(5, 2)).unwrap_err();
        assert!(matches!(err, MdError::Usage(_)));
        assert!(driver.calls().is_empty());
    }

    #[test]
    fn test_device_count_must_match() {
        let driver = FakeDriver::default();
        let err =
            build_members("/dev/md0", &driver, 0, &two_members(), &opts(0, 3)).unwrap_err();
        assert!(matches!(err, MdError::Usage(_)));
    }

    #[test]
    fn test_failed_add_stops_the_array() {
        let driver = FakeDriver {
            fail_add_minors: vec![17],
            ..FakeDriver::default()
        };
        let err = build_members("/dev/md0", &driver, 0, &two_members(), &opts(0, 2)).unwrap_err();
        assert!(matches!(err, MdError::Driver(_)));
        assert_eq!(*driver.calls().last().unwrap(), Call::StopArray);
    }

    #[test]
    fn test_failed_run_stops_the_array() {
        let driver = FakeDriver {
            fail_run: true,
            ..FakeDriver::default()
        };
        let err = build_members("/dev/md0", &driver, 0, &two_members(), &opts(-1, 2)).unwrap_err();
        assert!(matches!(err, MdError::Driver(_)));
        let calls = driver.calls();
        assert_eq!(calls[calls.len() - 2], Call::RunArray);
        assert_eq!(calls[calls.len() - 1], Call::StopArray);
    }
}
