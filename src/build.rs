// Legacy build: linear or raid0 arrays without superblocks.
//
// There is nothing on the devices to check, so this just describes the
// array to the driver and starts it. On pre-0.90 drivers the only interface
// is REGISTER_DEV per member plus START_MD with an encoded geometry word.

use std::path::Path;

use crate::devices;
use crate::driver::{ArrayInfo, DiskInfo, DriverOps, DriverVersion};
use crate::superblock::DiskFlags;
use crate::{MdError, MdResult};

#[derive(Debug, Clone, Copy)]
pub struct BuildOptions {
    pub level: i32,
    pub raid_disks: u32,
    /// Chunk size in KiB; 0 applies the 64 KiB default.
    pub chunk_kib: u32,
    pub verbose: bool,
}

/// The START_MD argument: a personality selector with the chunk size folded
/// into the low nibble as log2(chunk / 4 KiB).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct LegacyGeometry {
    pub level: i32,
    pub chunk_kib: u32,
}

impl LegacyGeometry {
    const PERSONALITY_LINEAR: u32 = 0x10000;
    const PERSONALITY_RAID0: u32 = 0x20000;

    pub fn encode(&self) -> u32 {
        let personality = if self.level == 0 {
            Self::PERSONALITY_RAID0
        } else {
            Self::PERSONALITY_LINEAR
        };
        let factor = (self.chunk_kib as u64 * 1024 / 4096).max(1).trailing_zeros();
        personality | (factor & 0xf)
    }
}

pub fn build(
    mddev: &str,
    driver: &dyn DriverOps,
    md_minor: u32,
    member_paths: &[String],
    opts: &BuildOptions,
) -> MdResult<()> {
    // Every member must exist and be a block device before anything is
    // committed to the driver.
    let mut members = Vec::new();
    for name in member_paths {
        let (major, minor) = devices::stat_block_device(Path::new(name))?;
        members.push((name.clone(), major, minor));
    }
    build_members(mddev, driver, md_minor, &members, opts)
}

pub(crate) fn build_members(
    mddev: &str,
    driver: &dyn DriverOps,
    md_minor: u32,
    members: &[(String, u32, u32)],
    opts: &BuildOptions,
) -> MdResult<()> {
    if !matches!(opts.level, -1 | 0) {
        return Err(MdError::Usage(
            "only linear and raid0 arrays can be built without superblocks".to_string(),
        ));
    }
    if opts.raid_disks as usize != members.len() {
        return Err(MdError::Usage(format!(
            "requested {} devices in array but listed {}",
            opts.raid_disks,
            members.len()
        )));
    }

    let modern = driver.driver_version()? >= DriverVersion::MINIMUM;
    let chunk_kib = if opts.chunk_kib == 0 { 64 } else { opts.chunk_kib };
    let raid_disks = opts.raid_disks as i32;

    if modern {
        let array = ArrayInfo {
            level: opts.level,
            size: 0,
            nr_disks: raid_disks,
            raid_disks,
            md_minor: md_minor as i32,
            not_persistent: 1,
            state: 0,
            active_disks: raid_disks,
            working_disks: raid_disks,
            spare_disks: 0,
            failed_disks: 0,
            chunk_size: chunk_kib as i32 * 1024,
            ..ArrayInfo::default()
        };
        driver.set_array_info(Some(&array))?;
    }

    for (i, (name, major, minor)) in members.iter().enumerate() {
        let added = if modern {
            driver.add_new_disk(&DiskInfo {
                number: i as i32,
                raid_disk: i as i32,
                state: (DiskFlags::ACTIVE | DiskFlags::SYNC).bits() as i32,
                major: *major as i32,
                minor: *minor as i32,
            })
        } else {
            driver.register_dev(*major, *minor)
        };
        if let Err(e) = added {
            tracing::warn!("failed to add {} to {}: {}", name, mddev, e);
            return abort(driver, modern, e);
        }
        if opts.verbose {
            tracing::info!("added {} to {} as device {}", name, mddev, i);
        }
    }

    let started = if modern {
        driver.run_array()
    } else {
        let geometry = LegacyGeometry {
            level: opts.level,
            chunk_kib,
        };
        driver.start_md(geometry.encode())
    };
    if let Err(e) = started {
        tracing::warn!("failed to start {}: {}", mddev, e);
        return abort(driver, modern, e);
    }
    tracing::info!("array {} built and started", mddev);
    Ok(())
}

// Tear down whatever the driver accepted so far, then report the failure.
fn abort(driver: &dyn DriverOps, modern: bool, e: crate::DriverError) -> MdResult<()> {
    if modern {
        let _ = driver.stop_array();
    } else {
        let _ = driver.stop_md();
    }
    Err(MdError::Driver(e))
}
