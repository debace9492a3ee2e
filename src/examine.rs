// Examine report for one member device, built straight from its
// superblock.

use std::fs::File;
use std::path::Path;

use serde::Serialize;

use crate::detail::{disk_state_names, format_time};
use crate::superblock::{SbStateFlags, Superblock};
use crate::{MdError, MdResult};

#[derive(Debug, Clone, Serialize)]
pub struct MemberDisk {
    /// "this" for the owner's own entry, otherwise the table index.
    pub slot: String,
    pub number: u32,
    pub major: u32,
    pub minor: u32,
    pub raid_disk: u32,
    pub state: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SuperblockReport {
    pub device: String,
    pub magic: String,
    pub version: String,
    pub uuid: String,
    pub creation_time: String,
    pub level: i32,
    pub size: u32,
    pub raid_disks: u32,
    pub total_disks: u32,
    pub preferred_minor: u32,
    pub update_time: String,
    pub clean: bool,
    pub errors: bool,
    pub active_disks: u32,
    pub working_disks: u32,
    pub failed_disks: u32,
    pub spare_disks: u32,
    pub checksum: String,
    pub checksum_ok: bool,
    pub events: u64,
    pub layout: u32,
    pub chunk_kib: u32,
    pub disks: Vec<MemberDisk>,
}

/// Read and describe the superblock on one device.
pub fn examine(path: &Path) -> MdResult<SuperblockReport> {
    let name = path.display().to_string();
    let mut file = File::open(path).map_err(|source| MdError::Io {
        path: name.clone(),
        source,
    })?;
    let sb = Superblock::load(&mut file).map_err(|source| MdError::SuperblockLoad {
        path: name.clone(),
        source,
    })?;
    Ok(report(&name, &sb))
}

fn report(name: &str, sb: &Superblock) -> SuperblockReport {
    let uuid = sb.uuid();
    let uuid = if sb.minor_version() >= 90 {
        format!(
            "{:08x}:{:08x}:{:08x}:{:08x}",
            uuid[0], uuid[1], uuid[2], uuid[3]
        )
    } else {
        format!("{:08x}", uuid[0])
    };
    let state = sb.state();

    let mut disks = Vec::new();
    let this = sb.this_disk();
    disks.push(MemberDisk {
        slot: "this".to_string(),
        number: this.number,
        major: this.major,
        minor: this.minor,
        raid_disk: this.raid_disk,
        state: disk_state_names(this.state.bits()),
    });
    for i in 0..sb.nr_disks().min(crate::superblock::MD_SB_DISKS as u32) {
        let d = sb.disk(i as usize);
        disks.push(MemberDisk {
            slot: i.to_string(),
            number: d.number,
            major: d.major,
            minor: d.minor,
            raid_disk: d.raid_disk,
            state: disk_state_names(d.state.bits()),
        });
    }

    SuperblockReport {
        device: name.to_string(),
        magic: format!("{:08x}", sb.magic()),
        version: format!(
            "{:02}.{:02}.{:02}",
            sb.major_version(),
            sb.minor_version(),
            sb.patch_version()
        ),
        uuid,
        creation_time: format_time(sb.ctime() as i32),
        level: sb.level(),
        size: sb.size(),
        raid_disks: sb.raid_disks(),
        total_disks: sb.nr_disks(),
        preferred_minor: sb.md_minor(),
        update_time: format_time(sb.utime() as i32),
        clean: state.contains(SbStateFlags::CLEAN),
        errors: state.contains(SbStateFlags::ERRORS),
        active_disks: sb.active_disks(),
        working_disks: sb.working_disks(),
        failed_disks: sb.failed_disks(),
        spare_disks: sb.spare_disks(),
        checksum: format!("{:08x}", sb.sb_csum()),
        checksum_ok: sb.checksum_ok(),
        events: sb.events(),
        layout: sb.layout(),
        chunk_kib: sb.chunk_size() / 1024,
        disks,
    }
}

impl SuperblockReport {
    pub fn print_text(&self) {
        println!("{}:", self.device);
        println!("          Magic : {}", self.magic);
        println!("        Version : {}", self.version);
        println!("           UUID : {}", self.uuid);
        println!("  Creation Time : {}", self.creation_time);
        println!("     Raid Level : {}", self.level);
        println!("           Size : {}", self.size);
        println!("     Raid Disks : {}", self.raid_disks);
        println!("    Total Disks : {}", self.total_disks);
        println!("Preferred Minor : {}", self.preferred_minor);
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
        println!(
            "       Checksum : {} ({})",
            self.checksum,
            if self.checksum_ok { "correct" } else { "bad" }
        );
        println!("         Events : {}", self.events);
        println!();
        println!("         Layout : {}", self.layout);
        println!("     Chunk Size : {}K", self.chunk_kib);
        println!();
        println!("      Number   Major   Minor   RaidDisk   State");
        for d in &self.disks {
            println!(
                "{:>4} {:5}   {:5}    {:5}    {:5}      {}",
                d.slot,
                d.number,
                d.major,
                d.minor,
                d.raid_disk,
                d.state.join(" ")
            );
        }
    }
}
