// Array creation.
//
// Creation validates the requested geometry, surveys the member devices for
// size and for anything that looks worth a second thought, then describes
// the array to the driver and feeds it the members. The kernel writes the
// superblocks itself when the array first runs.

use std::fs::File;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use crate::config;
use crate::driver::{ArrayInfo, DiskInfo, DriverOps, DriverVersion};
use crate::superblock::{
    device_sectors, new_size_sectors, DiskFlags, SbStateFlags, MD_RESERVED_SECTORS, MD_SB_DISKS,
};
use crate::{MdError, MdResult};

/// Signature checks on would-be members are supplied from outside; creation
/// only cares about the names of whatever was found.
pub trait FsProbe {
    fn probe(&self, file: &mut File, name: &str) -> io::Result<Vec<String>>;
}

/// Probe used when no signature checker is wired in.
pub struct NoProbe;

impl FsProbe for NoProbe {
    fn probe(&self, _file: &mut File, _name: &str) -> io::Result<Vec<String>> {
        Ok(Vec::new())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CreateOptions {
    pub level: i32,
    pub raid_disks: u32,
    pub spare_disks: u32,
    /// Chunk size in KiB; 0 applies the 64 KiB default.
    pub chunk_kib: u32,
    pub layout: Option<i32>,
    /// Per-member size in KiB; 0 adopts the smallest device.
    pub size_kib: u32,
    /// --run: start regardless and skip the confirmation prompt.
    pub run: bool,
    pub verbose: bool,
}

struct Member {
    name: String,
    major: u32,
    minor: u32,
}

pub fn create(
    mddev: &str,
    driver: &dyn DriverOps,
    md_minor: u32,
    member_paths: &[String],
    opts: &CreateOptions,
    probe: &dyn FsProbe,
    confirm: &mut dyn FnMut(&str) -> bool,
) -> MdResult<()> {
    if driver.driver_version()? < DriverVersion::MINIMUM {
        return Err(MdError::DriverTooOld);
    }
    if config::level_name(opts.level).is_none() {
        return Err(MdError::Usage(format!(
            "invalid raid level for create: {}",
            opts.level
        )));
    }
    if opts.raid_disks < 1 {
        return Err(MdError::Usage(
            "a number of raid-disks must be given to create an array".to_string(),
        ));
    }
    if opts.raid_disks + opts.spare_disks > MD_SB_DISKS as u32 {
        return Err(MdError::Usage(format!(
            "too many disks requested: {}+{} > {}",
            opts.raid_disks, opts.spare_disks, MD_SB_DISKS
        )));
    }
    if member_paths.len() as u32 > opts.raid_disks + opts.spare_disks {
        return Err(MdError::Usage(format!(
            "you have listed more disks ({}) than are in the array ({})",
            member_paths.len(),
            opts.raid_disks + opts.spare_disks
        )));
    }

    let layout = match opts.layout {
        Some(layout) => layout,
        None => {
            if opts.level == 5 {
                if opts.verbose {
                    tracing::info!(
                        "layout defaults to {}",
                        config::r5_layout_name(config::DEFAULT_R5_LAYOUT).unwrap_or("?")
                    );
                }
                config::DEFAULT_R5_LAYOUT
            } else {
                0
            }
        }
    };
    let chunk_kib = if opts.chunk_kib == 0 {
        if opts.verbose {
            tracing::info!("chunk size defaults to 64K");
        }
        64
    } else {
        opts.chunk_kib
    };

    // Survey the members: sizes, device numbers, and anything on them that
    // a signature probe recognises.
    let mut fail = false;
    let mut warn = false;
    let mut members: Vec<Member> = Vec::new();
    let mut min_free: Option<(u64, String)> = None;
    let mut max_free: Option<(u64, String)> = None;
    for name in member_paths {
        let mut file = match File::open(name) {
            Ok(f) => f,
            Err(e) => {
                tracing::warn!("cannot open {}: {}", name, e);
                fail = true;
                continue;
            }
        };
        let sectors = match device_sectors(&file) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!("cannot get size of {}: {}", name, e);
                fail = true;
                continue;
            }
        };
        if sectors < MD_RESERVED_SECTORS * 2 {
            tracing::warn!("{} is too small: {}K", name, sectors / 2);
            fail = true;
            continue;
        }
        let freesize = new_size_sectors(sectors) / 2;
        if opts.size_kib != 0 && freesize < opts.size_kib as u64 {
            tracing::warn!(
                "{} is smaller than given size: {}K < {}K + superblock",
                name,
                freesize,
                opts.size_kib
            );
            fail = true;
            continue;
        }
        if max_free.as_ref().map_or(true, |(max, _)| freesize > *max) {
            max_free = Some((freesize, name.clone()));
        }
        if min_free.as_ref().map_or(true, |(min, _)| freesize < *min) {
            min_free = Some((freesize, name.clone()));
        }
        match probe.probe(&mut file, name) {
            Ok(signatures) => {
                for sig in signatures {
                    tracing::warn!("{} appears to contain {}", name, sig);
                    warn = true;
                }
            }
            Err(e) => tracing::warn!("cannot check {}: {}", name, e),
        }
        let rdev = file
            .metadata()
            .map_err(|source| MdError::Io {
                path: name.clone(),
                source,
            })?
            .rdev();
        members.push(Member {
            name: name.clone(),
            major: nix::sys::stat::major(rdev) as u32,
            minor: nix::sys::stat::minor(rdev) as u32,
        });
    }
    if fail {
        return Err(MdError::CreateAborted);
    }

    let size_kib = if opts.size_kib == 0 {
        let Some((min, _)) = &min_free else {
            tracing::warn!("no size and no drives given - aborting create");
            return Err(MdError::CreateAborted);
        };
        if opts.verbose {
            tracing::info!("size set to {}K", min);
        }
        *min as u32
    } else {
        opts.size_kib
    };
    if let Some((max, name)) = &max_free {
        if (max - size_kib as u64) * 100 > *max {
            tracing::warn!(
                "largest drive ({}) exceeds size ({}K) by more than 1%",
                name,
                size_kib
            );
            warn = true;
        }
    }

    if warn {
        if !opts.run {
            if !confirm("Continue creating array? ") {
                return Err(MdError::CreateAborted);
            }
        } else if opts.verbose {
            tracing::info!("creation continuing despite oddities due to --run");
        }
    }

    // raid4/5 reserve one slot for the missing parity device; the counts
    // the driver sees account for it.
    let parity = matches!(opts.level, 4 | 5) as i32;
    let raid_disks = opts.raid_disks as i32;
    let spare_disks = opts.spare_disks as i32;
    let array = ArrayInfo {
        level: opts.level,
        size: size_kib as i32,
        nr_disks: raid_disks + spare_disks + parity,
        raid_disks,
        md_minor: md_minor as i32,
        not_persistent: 0,
        state: if parity != 0 {
            SbStateFlags::CLEAN.bits() as i32
        } else {
            0
        },
        active_disks: raid_disks - parity,
        working_disks: raid_disks + spare_disks,
        spare_disks: spare_disks + parity,
        failed_disks: 0,
        layout,
        chunk_size: chunk_kib as i32 * 1024,
        ..ArrayInfo::default()
    };
    driver.set_array_info(Some(&array))?;

    for (i, member) in members.iter().enumerate() {
        let mut number = i as i32;
        if parity != 0 && number >= raid_disks - 1 {
            // Skip over the reserved parity slot.
            number += 1;
        }
        let disk = DiskInfo {
            number,
            raid_disk: number,
            state: if number < raid_disks {
                (DiskFlags::ACTIVE | DiskFlags::SYNC).bits() as i32
            } else {
                0
            },
            major: member.major as i32,
            minor: member.minor as i32,
        };
        driver.add_new_disk(&disk)?;
        if opts.verbose {
            tracing::info!("added {} as device {}", member.name, number);
        }
    }

    if opts.run || members.len() as u32 >= opts.raid_disks {
        driver.run_array()?;
        tracing::info!("array {} started", mddev);
    } else {
        tracing::warn!("not starting array {} - not enough devices", mddev);
    }
    Ok(())
}

/// Minor number of the md device at `path`, for the array description.
pub fn md_minor_of(path: &Path) -> MdResult<u32> {
    let md = std::fs::metadata(path).map_err(|source| MdError::Io {
        path: path.display().to_string(),
        source,
    })?;
    Ok(nix::sys::stat::minor(md.rdev()) as u32)
}
