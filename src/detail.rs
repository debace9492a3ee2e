// Detail report for a running array, built from the driver's view.

use chrono::{Local, TimeZone};
use serde::Serialize;

use crate::config;
use crate::driver::{DriverError, DriverOps, DriverVersion};
use crate::superblock::{DiskFlags, SbStateFlags};
use crate::{MdError, MdResult};

#[derive(Debug, Clone, Serialize)]
pub struct DiskReport {
    pub number: i32,
    pub major: i32,
    pub minor: i32,
    pub raid_disk: i32,
    pub state: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ArrayDetail {
    pub device: String,
    pub version: String,
    pub creation_time: String,
    pub level: String,
    pub size: i32,
    pub raid_disks: i32,
    pub total_disks: i32,
    pub preferred_minor: i32,
    pub persistent: bool,
    pub update_time: String,
    pub clean: bool,
    pub errors: bool,
    pub active_disks: i32,
    pub working_disks: i32,
    pub failed_disks: i32,
    pub spare_disks: i32,
    pub layout: Option<String>,
    pub chunk_kib: i32,
    pub disks: Vec<DiskReport>,
}

pub(crate) fn format_time(secs: i32) -> String {
    match Local.timestamp_opt(secs as i64, 0) {
        chrono::LocalResult::Single(t) => t.format("%a %b %e %H:%M:%S %Y").to_string(),
        _ => format!("@{}", secs),
    }
}

pub(crate) fn disk_state_names(state: u32) -> Vec<String> {
    DiskFlags::from_bits_retain(state)
        .iter_names()
        .map(|(name, _)| name.to_ascii_lowercase())
        .collect()
}

/// Collect the report for one running array.
pub fn detail(devname: &str, driver: &dyn DriverOps) -> MdResult<ArrayDetail> {
    if driver.driver_version()? < DriverVersion::MINIMUM {
        return Err(MdError::DriverTooOld);
    }
    let array = match driver.query_array() {
        Ok(array) => array,
        Err(DriverError::NoSuchDevice) => {
            return Err(MdError::NotActive(devname.to_string()));
        }
        Err(e) => return Err(e.into()),
    };
    let state = SbStateFlags::from_bits_retain(array.state as u32);

    let mut disks = Vec::new();
    for number in 0..array.nr_disks.max(0) {
        match driver.query_disk(number as u32) {
            Ok(disk) => disks.push(DiskReport {
                number: disk.number,
                major: disk.major,
                minor: disk.minor,
                raid_disk: disk.raid_disk,
                state: disk_state_names(disk.state as u32),
            }),
            Err(e) => {
                tracing::warn!("cannot get detail for disk {} of {}: {}", number, devname, e)
            }
        }
    }

    Ok(ArrayDetail {
        device: devname.to_string(),
        version: format!(
            "{:02}.{:02}.{:02}",
            array.major_version, array.minor_version, array.patch_version
        ),
        creation_time: format_time(array.ctime),
        level: config::level_name(array.level)
            .unwrap_or("-unknown-")
            .to_string(),
        size: array.size,
        raid_disks: array.raid_disks,
        total_disks: array.nr_disks,
        preferred_minor: array.md_minor,
        persistent: array.not_persistent == 0,
        update_time: format_time(array.utime),
        clean: state.contains(SbStateFlags::CLEAN),
        errors: state.contains(SbStateFlags::ERRORS),
        active_disks: array.active_disks,
        working_disks: array.working_disks,
        failed_disks: array.failed_disks,
        spare_disks: array.spare_disks,
        layout: if array.level == 5 {
            Some(
                config::r5_layout_name(array.layout)
                    .unwrap_or("-unknown-")
                    .to_string(),
            )
        } else {
            None
        },
        chunk_kib: array.chunk_size / 1024,
        disks,
    })
}

impl ArrayDetail {
    pub fn print_text(&self) {
        println!("{}:", self.device);
        println!("        Version : {}", self.version);
        println!("  Creation Time : {}", self.creation_time);
        println!("     Raid Level : {}", self.level);
        println!("           Size : {}", self.size);
        println!("     Raid Disks : {}", self.raid_disks);
        println!("    Total Disks : {}", self.total_disks);
        println!("Preferred Minor : {}", self.preferred_minor);
        println!(
            "    Persistence : Superblock is {}persistent",
            if self.persistent { "" } else { "not " }
        );
        println!();
        println!("    Update Time : {}", self.update_time);
        println!(
            "          State : {}, {}errors",
            if self.clean { "clean" } else { "dirty" },
            if self.errors { "" } else { "no-" }
        );
        println!("  Active Drives : {}", self.active_disks);
        println!(" Working Drives : {}", self.working_disks);
        println!("  Failed Drives : {}", self.failed_disks);
        println!("   Spare Drives : {}", self.spare_disks);
        println!();
        if let Some(layout) = &self.layout {
            println!("         Layout : {}", layout);
        }
        println!("     Chunk Size : {}K", self.chunk_kib);
        println!();
        println!("    Number   Major   Minor   RaidDisk   State");
        for d in &self.disks {
            println!(
                "   {:5}   {:5}    {:5}    {:5}      {}",
                d.number,
                d.major,
                d.minor,
                d.raid_disk,
                d.state.join(" ")
            );
        }
    }
}
