/// Config model tests: the uuid literal, the line grammar, and the
/// device/identity views the rest of the tool consumes.

#[cfg(test)]
mod config_model_tests {
    use crate::config::{
        level_from_name, level_name, parse_uuid, r5_layout_from_name, ArrayIdentity, ConfigFile,
    };

    #[test]
    fn test_parse_uuid_plain() {
        assert_eq!(
            parse_uuid("0123456789abcdef0123456789abcdef"),
            Some([0x01234567, 0x89abcdef, 0x01234567, 0x89abcdef])
        );
    }

    #[test]
    fn test_parse_uuid_separators() {
        assert_eq!(
            parse_uuid("01234567:89abcdef.01234567-89abcdef"),
            Some([0x01234567, 0x89abcdef, 0x01234567, 0x89abcdef])
        );
        assert_eq!(
            parse_uuid("01234567 89abcdef 01234567 89abcdef"),
            Some([0x01234567, 0x89abcdef, 0x01234567, 0x89abcdef])
        );
    }

    #[test]
    fn test_parse_uuid_case_insensitive() {
        assert_eq!(
            parse_uuid("ABCDEF00abcdef00ABCDEF00abcdef00"),
            Some([0xabcdef00; 4])
        );
    }

    #[test]
    fn test_parse_uuid_rejects_wrong_length() {
        assert_eq!(parse_uuid("0123456789abcdef0123456789abcde"), None);
        assert_eq!(parse_uuid("0123456789abcdef0123456789abcdef0"), None);
        assert_eq!(parse_uuid(""), None);
    }

    #[test]
    fn test_parse_uuid_rejects_bad_characters() {
        assert_eq!(parse_uuid("0123456789abcdef0123456789abcdeg"), None);
        assert_eq!(parse_uuid("0123456789abcdef/0123456789abcdef"), None);
    }

    #[test]
    fn test_device_lines_collect_patterns() {
        let config = ConfigFile::parse("DEVICE /dev/sda* /dev/hdb1\nDEVICE /dev/sdc*\n");
        // Patterns that match nothing expand to nothing.
        let _ = config.devices();
        assert_eq!(config.identities().len(), 0);
    }

    #[test]
    fn test_device_line_ignores_non_paths() {
        let config = ConfigFile::parse("DEVICE style=0 /dev/zero\n");
        assert_eq!(config.devices(), vec![std::path::PathBuf::from("/dev/zero")]);
    }

    #[test]
    fn test_array_line_full_identity() {
        let config = ConfigFile::parse(
            "ARRAY /dev/md0 uuid=0123456789abcdef0123456789abcdef level=raid5 num-devices=3 spare-group=backup\n",
        );
        let ident = config.identity_for("/dev/md0").unwrap();
        assert_eq!(
            ident.uuid,
            Some([0x01234567, 0x89abcdef, 0x01234567, 0x89abcdef])
        );
        assert_eq!(ident.level, Some(5));
        assert_eq!(ident.raid_disks, Some(3));
        assert_eq!(ident.spare_group.as_deref(), Some("backup"));
    }

    #[test]
    fn test_array_line_continuation_by_indent() {
        let config = ConfigFile::parse(
            "ARRAY /dev/md1\n   super-minor=1\n   devices=/dev/sd[ab]1\n# comment\n",
        );
        let ident = config.identity_for("/dev/md1").unwrap();
        assert_eq!(ident.super_minor, Some(1));
        assert_eq!(
            ident.device_globs,
            Some(vec!["/dev/sd[ab]1".to_string()])
        );
    }

    #[test]
    fn test_keyword_abbreviation_and_case() {
        let config = ConfigFile::parse("dev /dev/null\nARR /dev/md2 super-minor=2\n");
        assert_eq!(config.devices(), vec![std::path::PathBuf::from("/dev/null")]);
        assert!(config.identity_for("/dev/md2").is_some());
    }

    #[test]
    fn test_short_keyword_is_unknown() {
        let config = ConfigFile::parse("de /dev/null\n");
        assert!(config.devices().is_empty());
    }

    #[test]
    fn test_array_line_without_device_is_dropped() {
        let config = ConfigFile::parse("ARRAY uuid=0123456789abcdef0123456789abcdef\n");
        assert!(config.identities().is_empty());
    }

    #[test]
    fn test_array_line_without_identity_is_dropped() {
        let config = ConfigFile::parse("ARRAY /dev/md0\nARRAY /dev/md1 level=raid1\n");
        assert!(config.identities().is_empty());
    }

    #[test]
    fn test_array_line_unknown_words_are_skipped() {
        let config = ConfigFile::parse("ARRAY /dev/md0 super-minor=0 name=home frobnicate\n");
        let ident = config.identity_for("/dev/md0").unwrap();
        assert_eq!(ident.super_minor, Some(0));
    }

    #[test]
    fn test_uuid_specified_twice_keeps_first() {
        let config = ConfigFile::parse(
            "ARRAY /dev/md0 uuid=0123456789abcdef0123456789abcdef uuid=ffffffffffffffffffffffffffffffff\n",
        );
        let ident = config.identity_for("/dev/md0").unwrap();
        assert_eq!(ident.uuid.unwrap()[0], 0x01234567);
    }

    #[test]
    fn test_quoted_words() {
        let config = ConfigFile::parse("ARRAY '/dev/md disk' super-minor=3\n");
        assert!(config.identity_for("/dev/md disk").is_some());
    }

    #[test]
    fn test_comments_and_blank_lines() {
        let config = ConfigFile::parse(
            "# leading comment\n\nARRAY /dev/md0 super-minor=0 # trailing comment\n",
        );
        let ident = config.identity_for("/dev/md0").unwrap();
        assert_eq!(ident.super_minor, Some(0));
    }

    #[test]
    fn test_devices_expand_and_dedup() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["sda1", "sda2", "sdb1"] {
            std::fs::write(dir.path().join(name), b"").unwrap();
        }
        let base = dir.path().display();
        let text = format!("DEVICE {base}/sda* {base}/sd*\n");
        let config = ConfigFile::parse(&text);
        let devices = config.devices();
        // sda1 and sda2 match both patterns but appear once, in the stable
        // order the first pattern produced.
        let names: Vec<String> = devices
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["sda1", "sda2", "sdb1"]);
    }

    #[test]
    fn test_identity_name_predicate() {
        let ident = ArrayIdentity {
            device_globs: Some(vec!["/dev/sda1".to_string(), "/dev/sd[bc]1".to_string()]),
            ..ArrayIdentity::default()
        };
        assert!(ident.matches_name("/dev/sda1"));
        assert!(ident.matches_name("/dev/sdb1"));
        assert!(ident.matches_name("/dev/sdc1"));
        assert!(!ident.matches_name("/dev/sdd1"));

        let open = ArrayIdentity::default();
        assert!(open.matches_name("/dev/anything"));
    }

    #[test]
    fn test_has_discriminator() {
        assert!(!ArrayIdentity::default().has_discriminator());
        assert!(ArrayIdentity {
            super_minor: Some(0),
            ..ArrayIdentity::default()
        }
        .has_discriminator());
        // Level and disk count alone cannot identify an array.
        assert!(!ArrayIdentity {
            level: Some(5),
            raid_disks: Some(3),
            ..ArrayIdentity::default()
        }
        .has_discriminator());
    }

    #[test]
    fn test_level_names() {
        assert_eq!(level_from_name("linear"), Some(-1));
        assert_eq!(level_from_name("raid0"), Some(0));
        assert_eq!(level_from_name("stripe"), Some(0));
        assert_eq!(level_from_name("MIRROR"), Some(1));
        assert_eq!(level_from_name("5"), Some(5));
        assert_eq!(level_from_name("raid6"), None);
        assert_eq!(level_name(5), Some("raid5"));
        assert_eq!(level_name(-1), Some("linear"));
    }

    #[test]
    fn test_r5_layout_names() {
        assert_eq!(r5_layout_from_name("left_symmetric"), Some(2));
        assert_eq!(r5_layout_from_name("default"), Some(2));
        assert_eq!(r5_layout_from_name("ra"), Some(1));
        assert_eq!(r5_layout_from_name("zigzag"), None);
    }

    #[test]
    fn test_missing_config_file_is_empty() {
        let config =
            ConfigFile::load(Some(std::path::Path::new("/nonexistent/mdctl.conf"))).unwrap();
        assert!(config.devices().is_empty());
        assert!(config.identities().is_empty());
    }
}
