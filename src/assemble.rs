// Assembly engine.
//
// Finds the devices whose superblocks say they form the array, reconciles
// disagreements between the copies, and hands the winning set to the driver
// in the right order. Scanning is a two-phase pipeline: before a device has
// passed the identity filters it may be skipped freely; once committed, any
// further problem fails the whole assembly.

use std::fs::File;
use std::path::{Path, PathBuf};

use bitflags::bitflags;

use crate::config::{ArrayIdentity, ConfigFile};
use crate::devices;
use crate::driver::{kernel_version, DiskInfo, DriverOps, DriverVersion};
use crate::superblock::{compare, DiskFlags, SbCompare, Superblock, MD_SB_DISKS};
use crate::{MdError, MdResult};

/// When assembly may start the array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPolicy {
    /// Start unconditionally.
    ForceRun,
    /// Start when enough members are present.
    Auto,
    /// Assemble but never start.
    NoRun,
}

#[derive(Debug, Clone, Copy)]
pub struct AssembleOptions {
    pub runstop: RunPolicy,
    pub force: bool,
    pub verbose: bool,
}

/// What an assembly achieved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Assembled {
    pub started: bool,
    pub okcnt: u32,
    pub sparecnt: u32,
}

bitflags! {
    /// Fixups applied to the chosen superblock during reconciliation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct Fixups: u32 {
        /// Stored device numbers no longer match the observed devices.
        const DEV_NUMBERS = 1 << 0;
        /// A FAULTY flag was cleared from a live member.
        const CLEARED_FAULTY = 1 << 1;
    }
}

/// One device that passed the identity filters.
#[derive(Debug, Clone)]
pub(crate) struct Candidate {
    pub path: PathBuf,
    pub major: u32,
    pub minor: u32,
    pub events: u64,
    #[allow(dead_code)]
    pub utime: u32,
    pub raid_disk: i32,
    pub uptodate: bool,
}

/// Whether `avail` working members are sufficient to run an array of the
/// given level and width.
pub fn enough(level: i32, raid_disks: u32, avail: u32) -> bool {
    match level {
        // linear and raid0 need every member
        -1 | 0 => avail == raid_disks,
        1 => avail >= 1,
        4 | 5 => avail + 1 >= raid_disks,
        _ => false,
    }
}

/// Assemble one array.
///
/// Candidate devices come from `explicit` when given, otherwise from the
/// config's DEVICE globs. Explicit candidates get their failures reported;
/// implicit ones fail silently unless verbose.
pub fn assemble(
    mddev: &str,
    driver: &dyn DriverOps,
    ident: &ArrayIdentity,
    explicit: Option<&[String]>,
    config: &ConfigFile,
    opts: &AssembleOptions,
) -> MdResult<Assembled> {
    let vers = driver.driver_version()?;
    if vers < DriverVersion::MINIMUM {
        return Err(MdError::DriverTooOld);
    }
    // Kernels before 2.4 cannot take per-member ADD_NEW_DISK calls; they
    // walk the on-disk table themselves after START_ARRAY.
    let legacy = matches!(kernel_version(), Some(v) if v < (2, 4, 0));

    if driver.query_array().is_ok() {
        return Err(MdError::AlreadyActive(mddev.to_string()));
    }
    // The device may be half set up from an earlier attempt; a failed stop
    // is uninteresting.
    let _ = driver.stop_array();

    let have_explicit = explicit.map_or(false, |d| !d.is_empty());
    if !have_explicit && !ident.has_discriminator() {
        return Err(MdError::NoIdentity(mddev.to_string()));
    }

    let paths: Vec<(PathBuf, bool)> = if have_explicit {
        explicit
            .unwrap()
            .iter()
            .map(|p| (PathBuf::from(p), true))
            .collect()
    } else {
        config.devices().into_iter().map(|p| (p, false)).collect()
    };

    if opts.verbose {
        tracing::info!("looking for devices for {}", mddev);
    }

    let mut first_super = Superblock::zeroed();
    let mut candidates = scan(mddev, ident, &paths, opts.verbose, &mut first_super)?;
    if candidates.is_empty() {
        return Err(MdError::NoCandidates(mddev.to_string()));
    }
    assemble_candidates(mddev, driver, &first_super, &mut candidates, legacy, opts)
}

/// Phase one: walk the candidate paths and collect committed members.
fn scan(
    mddev: &str,
    ident: &ArrayIdentity,
    paths: &[(PathBuf, bool)],
    verbose: bool,
    first_super: &mut Superblock,
) -> MdResult<Vec<Candidate>> {
    let mut candidates = Vec::new();
    for (path, explicit) in paths {
        let name = path.display().to_string();
        if !ident.matches_name(&name) {
            continue;
        }

        let loaded = match File::open(path) {
            Ok(mut file) => Superblock::load(&mut file),
            Err(e) => {
                if *explicit {
                    tracing::warn!("cannot open device {}: {}", name, e);
                } else if verbose {
                    tracing::info!("cannot open device {}: {}", name, e);
                }
                continue;
            }
        };
        let (major, minor) = match devices::member_dev_numbers(path) {
            Ok(mm) => mm,
            Err(e) => {
                tracing::warn!("{}", e);
                continue;
            }
        };
        if let Err(e) = &loaded {
            if *explicit {
                tracing::warn!("no RAID superblock on {}: {}", name, e);
            } else if verbose {
                tracing::info!("no RAID superblock on {}: {}", name, e);
            }
        }

        // Identity filters; a miss only skips this device.
        if let Some(uuid) = ident.uuid {
            if !matches!(&loaded, Ok(sb) if sb.uuid() == uuid) {
                if *explicit {
                    tracing::warn!("{} has wrong uuid.", name);
                } else if verbose {
                    tracing::info!("{} has wrong uuid.", name);
                }
                continue;
            }
        }
        if let Some(want) = ident.super_minor {
            if !matches!(&loaded, Ok(sb) if sb.md_minor() == want) {
                if *explicit {
                    tracing::warn!("{} has wrong super-minor.", name);
                } else if verbose {
                    tracing::info!("{} has wrong super-minor.", name);
                }
                continue;
            }
        }

        // Committed from here on.
        if verbose {
            tracing::info!("{} is identified as a member of {}", name, mddev);
        }
        let sb = loaded.map_err(|source| MdError::SuperblockLoad {
            path: name.clone(),
            source,
        })?;
        if compare(first_super, &sb) != SbCompare::Same {
            return Err(MdError::SuperblockMismatch(name));
        }
        if candidates.len() >= MD_SB_DISKS {
            tracing::warn!(
                "ouch - too many devices appear to be in this array, ignoring {}",
                name
            );
            continue;
        }
        candidates.push(Candidate {
            path: path.clone(),
            major,
            minor,
            events: sb.events(),
            utime: sb.utime(),
            raid_disk: sb.this_disk().raid_disk as i32,
            uptodate: false,
        });
    }
    Ok(candidates)
}

/// Best candidate per raid slot (highest event count, first seen breaks
/// ties) and the index of the most recent candidate overall.
pub(crate) fn elect(candidates: &[Candidate]) -> ([Option<usize>; MD_SB_DISKS], usize) {
    let mut best: [Option<usize>; MD_SB_DISKS] = [None; MD_SB_DISKS];
    let mut most_recent = 0usize;
    for i in 0..candidates.len() {
        if candidates[i].events > candidates[most_recent].events {
            most_recent = i;
        }
        let slot = candidates[i].raid_disk;
        if slot >= 0 && (slot as usize) < MD_SB_DISKS {
            let s = slot as usize;
            match best[s] {
                None => best[s] = Some(i),
                Some(j) if candidates[j].events < candidates[i].events => best[s] = Some(i),
                _ => {}
            }
        }
    }
    (best, most_recent)
}

/// Phase two: election, up-to-dateness, force promotion, reconciliation
/// and the driver handoff.
pub(crate) fn assemble_candidates(
    mddev: &str,
    driver: &dyn DriverOps,
    first_super: &Superblock,
    candidates: &mut [Candidate],
    legacy: bool,
    opts: &AssembleOptions,
) -> MdResult<Assembled> {
    let raid_disks = first_super.raid_disks();
    let level = first_super.level();

    let (best, most_recent) = elect(candidates);
    let max_events = candidates[most_recent].events;

    // A member one update behind the newest copy is still trustworthy.
    let mut okcnt = 0u32;
    let mut sparecnt = 0u32;
    for (s, entry) in best.iter().enumerate() {
        if let Some(j) = *entry {
            if candidates[j].events + 1 >= max_events {
                candidates[j].uptodate = true;
                if (s as u32) < raid_disks {
                    okcnt += 1;
                } else {
                    sparecnt += 1;
                }
            }
        }
    }

    while opts.force && !enough(level, raid_disks, okcnt) {
        // Promote the newest stale drive in an active slot.
        let mut pick: Option<usize> = None;
        for slot_entry in best.iter().take((raid_disks as usize).min(MD_SB_DISKS)) {
            if let Some(j) = *slot_entry {
                if !candidates[j].uptodate
                    && candidates[j].events > 0
                    && pick.map_or(true, |p| candidates[j].events > candidates[p].events)
                {
                    pick = Some(j);
                }
            }
        }
        let Some(j) = pick else { break };
        tracing::warn!(
            "forcing event count in {}({}) from {} up to {}",
            candidates[j].path.display(),
            candidates[j].raid_disk,
            candidates[j].events,
            max_events
        );
        match promote(&candidates[j].path, max_events) {
            Ok(()) => {
                candidates[j].events = max_events;
                candidates[j].uptodate = true;
                okcnt += 1;
            }
            Err(e) => {
                // Zeroing the event count takes this drive out of every
                // later selection.
                tracing::warn!("{} - not updating", e);
                candidates[j].events = 0;
            }
        }
    }

    // The first up-to-date drive in slot order supplies the superblock the
    // kernel will trust; reload it fresh from disk.
    let mut chosen: Option<(usize, Superblock)> = None;
    for entry in best.iter() {
        let Some(j) = *entry else { continue };
        if !candidates[j].uptodate {
            continue;
        }
        let name = candidates[j].path.display().to_string();
        let mut file = File::open(&candidates[j].path).map_err(|source| MdError::Io {
            path: name.clone(),
            source,
        })?;
        let sb = Superblock::load(&mut file).map_err(|source| MdError::SuperblockLoad {
            path: name,
            source,
        })?;
        chosen = Some((j, sb));
        break;
    }
    let Some((chosen, mut chosen_super)) = chosen else {
        return Err(MdError::NotEnoughDrives {
            dev: mddev.to_string(),
            okcnt: 0,
        });
    };

    // Reconcile the chosen superblock's view of the members with what was
    // actually observed on disk.
    let mut fixups = Fixups::empty();
    for (s, entry) in best.iter().enumerate() {
        let Some(j) = *entry else { continue };
        let mut slot_entry = chosen_super.disk(s);
        if candidates[j].uptodate {
            if slot_entry.major != candidates[j].major || slot_entry.minor != candidates[j].minor {
                slot_entry.major = candidates[j].major;
                slot_entry.minor = candidates[j].minor;
                chosen_super.set_disk(s, &slot_entry);
                fixups |= Fixups::DEV_NUMBERS;
            }
            if slot_entry.state.contains(DiskFlags::FAULTY) {
                if opts.force {
                    tracing::warn!(
                        "clearing FAULTY flag for device {} in {} for {}",
                        s,
                        mddev,
                        candidates[j].path.display()
                    );
                    slot_entry.state.remove(DiskFlags::FAULTY);
                    chosen_super.set_disk(s, &slot_entry);
                    fixups |= Fixups::CLEARED_FAULTY;
                } else {
                    tracing::warn!(
                        "device {} in {} is marked faulty in the superblock, but {} seems ok",
                        s,
                        mddev,
                        candidates[j].path.display()
                    );
                }
            }
        } else if !slot_entry.state.contains(DiskFlags::FAULTY) {
            tracing::warn!(
                "device {} of {} is not marked FAULTY in the superblock, but cannot be found",
                s,
                mddev
            );
        }
    }

    // Modern kernels track device-number changes themselves; old ones rely
    // on the superblock, so a stale table must be rewritten before start.
    if (opts.force && fixups.contains(Fixups::CLEARED_FAULTY))
        || (legacy && fixups.contains(Fixups::DEV_NUMBERS))
    {
        chosen_super.update_checksum();
        let name = candidates[chosen].path.display().to_string();
        let mut file = File::options()
            .read(true)
            .write(true)
            .open(&candidates[chosen].path)
            .map_err(|source| MdError::Io {
                path: name.clone(),
                source,
            })?;
        chosen_super
            .store(&mut file)
            .map_err(|source| MdError::SuperblockWrite { path: name, source })?;
    }

    if legacy {
        driver.start_array(candidates[chosen].major, candidates[chosen].minor)?;
        return Ok(Assembled {
            started: true,
            okcnt,
            sparecnt,
        });
    }

    // An empty payload tells the driver to take the array description from
    // the member superblocks.
    driver.set_array_info(None)?;

    // Add members in slot order, the chosen one last so the bring-up
    // latches its superblock.
    for i in 0..=MD_SB_DISKS {
        let j = if i < MD_SB_DISKS {
            match best[i] {
                Some(j) if j != chosen => j,
                Some(_) => continue,
                None => {
                    if opts.verbose && (i as u32) < raid_disks {
                        tracing::info!("no uptodate device for slot {} of {}", i, mddev);
                    }
                    continue;
                }
            }
        } else {
            chosen
        };
        if !candidates[j].uptodate {
            if opts.verbose && (i as u32) < raid_disks {
                tracing::info!("no uptodate device for slot {} of {}", i, mddev);
            }
            continue;
        }
        let disk = DiskInfo {
            major: candidates[j].major as i32,
            minor: candidates[j].minor as i32,
            ..DiskInfo::default()
        };
        match driver.add_new_disk(&disk) {
            Ok(()) => {
                if opts.verbose {
                    tracing::info!(
                        "added {} to {} as {}",
                        candidates[j].path.display(),
                        mddev,
                        candidates[j].raid_disk
                    );
                }
            }
            Err(e) => {
                tracing::warn!(
                    "failed to add {} to {}: {}",
                    candidates[j].path.display(),
                    mddev,
                    e
                );
                let slot = candidates[j].raid_disk;
                if slot >= 0 && (slot as u32) < raid_disks {
                    okcnt = okcnt.saturating_sub(1);
                } else {
                    sparecnt = sparecnt.saturating_sub(1);
                }
            }
        }
    }

    match opts.runstop {
        RunPolicy::ForceRun => {}
        RunPolicy::Auto if enough(level, raid_disks, okcnt) => {}
        RunPolicy::NoRun => {
            return Ok(Assembled {
                started: false,
                okcnt,
                sparecnt,
            })
        }
        RunPolicy::Auto => {
            return Err(MdError::NotEnoughDrives {
                dev: mddev.to_string(),
                okcnt,
            })
        }
    }
    driver.run_array()?;
    Ok(Assembled {
        started: true,
        okcnt,
        sparecnt,
    })
}

/// Rewrite a stale member's event counter so it counts as current again.
fn promote(path: &Path, events: u64) -> MdResult<()> {
    let name = path.display().to_string();
    let mut file = File::options()
        .read(true)
        .write(true)
        .open(path)
        .map_err(|source| MdError::Io {
            path: name.clone(),
            source,
        })?;
    let mut sb = Superblock::load(&mut file).map_err(|source| MdError::SuperblockLoad {
        path: name.clone(),
        source,
    })?;
    sb.set_events(events);
    sb.update_checksum();
    sb.store(&mut file)
        .map_err(|source| MdError::SuperblockWrite { path: name, source })?;
    Ok(())
}
