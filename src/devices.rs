// Block-device discovery helpers: glob expansion for DEVICE patterns,
// stat-based identification, and mapping a (major, minor) pair back to a
// /dev path.

use std::fs;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};

use crate::{MdError, MdResult};

/// Expand shell globs into concrete paths, keeping pattern order and the
/// sorted order glob yields within each pattern. Unreadable patterns expand
/// to nothing.
pub fn expand_globs(patterns: &[String]) -> Vec<PathBuf> {
    let mut paths = Vec::new();
    for pattern in patterns {
        match glob::glob(pattern) {
            Ok(entries) => {
                for entry in entries.flatten() {
                    paths.push(entry);
                }
            }
            Err(e) => tracing::warn!("bad device pattern {}: {}", pattern, e),
        }
    }
    paths
}

/// Stat a path and require a block device; returns its (major, minor).
pub fn stat_block_device(path: &Path) -> MdResult<(u32, u32)> {
    let md = fs::metadata(path).map_err(|source| MdError::Io {
        path: path.display().to_string(),
        source,
    })?;
    if !md.file_type().is_block_device() {
        return Err(MdError::NotBlockDevice(path.display().to_string()));
    }
    let rdev = md.rdev();
    Ok((
        nix::sys::stat::major(rdev) as u32,
        nix::sys::stat::minor(rdev) as u32,
    ))
}

/// Device numbers of an assembly candidate. Block devices report their real
/// (major, minor); a regular file stands in as a member image the same way
/// the codec's size probe treats it, and carries no device number.
pub fn member_dev_numbers(path: &Path) -> MdResult<(u32, u32)> {
    let md = fs::metadata(path).map_err(|source| MdError::Io {
        path: path.display().to_string(),
        source,
    })?;
    if md.file_type().is_file() {
        return Ok((0, 0));
    }
    if !md.file_type().is_block_device() {
        return Err(MdError::NotBlockDevice(path.display().to_string()));
    }
    let rdev = md.rdev();
    Ok((
        nix::sys::stat::major(rdev) as u32,
        nix::sys::stat::minor(rdev) as u32,
    ))
}

/// Find the /dev entry for a device number. Scans the top level of /dev,
/// which is where the interesting block devices live.
pub fn map_dev(major: u32, minor: u32) -> Option<PathBuf> {
    map_dev_in(Path::new("/dev"), major, minor)
}

fn map_dev_in(dir: &Path, major: u32, minor: u32) -> Option<PathBuf> {
    let wanted = nix::sys::stat::makedev(major as u64, minor as u64);
    let entries = fs::read_dir(dir).ok()?;
    for entry in entries.flatten() {
        let path = entry.path();
        let md = match fs::metadata(&path) {
            Ok(md) => md,
            Err(_) => continue,
        };
        if md.file_type().is_block_device() && md.rdev() == wanted {
            return Some(path);
        }
    }
    None
}
