// Monitor loop.
//
// Polls each watched array every period, derives at most one event per
// array per poll from the count deltas, and delivers it: to an alert
// program, to a mail address for failures, or as a log line when neither is
// configured. Arrays sharing a spare-group can have a spare migrated from a
// healthy peer to a degraded one.

use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::Duration;

use crate::config::ConfigFile;
use crate::devices;
use crate::driver::{DriverOps, MdDevice};
use crate::superblock::{DiskFlags, MD_SB_DISKS};
use crate::MdResult;

const SENDMAIL: &str = "/usr/sbin/sendmail";

#[derive(Debug, Clone, Copy)]
pub struct MonitorOptions {
    pub period_secs: u64,
}

/// Where events go.
#[derive(Debug, Clone, Default)]
pub struct AlertTargets {
    pub mail: Option<String>,
    pub program: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Fail,
    FailSpare,
    ActiveSpare,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Fail => "Fail",
            EventKind::FailSpare => "FailSpare",
            EventKind::ActiveSpare => "ActiveSpare",
        }
    }

    /// Events whose name begins with "Fail" get mailed.
    fn is_failure(&self) -> bool {
        matches!(self, EventKind::Fail | EventKind::FailSpare)
    }
}

#[derive(Debug, Clone)]
pub struct Event {
    pub kind: EventKind,
    pub dev: String,
    pub member: Option<String>,
}

/// What the monitor remembers about one array between polls.
#[derive(Debug, Clone)]
pub struct ArrayState {
    pub devname: String,
    pub spare_group: Option<String>,
    pub(crate) utime: i32,
    pub(crate) seen: bool,
    /// An error already reported; repeats stay quiet until it clears.
    pub(crate) err: bool,
    pub(crate) active: i32,
    pub(crate) working: i32,
    pub(crate) spare: i32,
    pub(crate) failed: i32,
    pub(crate) raid_disks: i32,
    pub(crate) devstate: [i32; MD_SB_DISKS],
}

impl ArrayState {
    pub fn new(devname: &str, spare_group: Option<String>) -> ArrayState {
        ArrayState {
            devname: devname.to_string(),
            spare_group,
            utime: 0,
            seen: false,
            err: false,
            active: 0,
            working: 0,
            spare: 0,
            failed: 0,
            raid_disks: 0,
            devstate: [0; MD_SB_DISKS],
        }
    }

    pub(crate) fn note_error(&mut self, msg: &str) {
        if !self.err {
            tracing::warn!("{}", msg);
        }
        self.err = true;
    }

    fn degraded(&self) -> bool {
        self.seen && !self.err && self.active < self.raid_disks && self.spare == 0
    }

    fn has_spare_to_give(&self) -> bool {
        self.seen && !self.err && self.active == self.raid_disks && self.spare > 0
    }
}

/// One poll of one array. Updates the stored state and returns the event
/// this poll produced, if any.
pub(crate) fn poll_array(driver: &dyn DriverOps, st: &mut ArrayState) -> Option<Event> {
    let array = match driver.query_array() {
        Ok(array) => array,
        Err(e) => {
            st.note_error(&format!(
                "cannot get array info for {}: {}",
                st.devname, e
            ));
            return None;
        }
    };
    st.err = false;

    if st.seen && st.utime == array.utime && st.failed == array.failed_disks {
        return None;
    }

    let mut kind = None;
    if st.seen {
        if st.active > array.active_disks {
            kind = Some(EventKind::Fail);
        } else if st.working > array.working_disks {
            kind = Some(EventKind::FailSpare);
        } else if st.active < array.active_disks {
            kind = Some(EventKind::ActiveSpare);
        }
    }

    // The first slot whose state changed names the event's subject device.
    let mut member = None;
    let slots = (array.raid_disks + array.spare_disks).clamp(0, MD_SB_DISKS as i32);
    for i in 0..slots {
        if let Ok(disk) = driver.query_disk(i as u32) {
            if kind.is_some() && member.is_none() && st.devstate[i as usize] != disk.state {
                member = devices::map_dev(disk.major as u32, disk.minor as u32)
                    .map(|p| p.display().to_string());
            }
            st.devstate[i as usize] = disk.state;
        }
    }

    st.active = array.active_disks;
    st.working = array.working_disks;
    st.spare = array.spare_disks;
    st.failed = array.failed_disks;
    st.raid_disks = array.raid_disks;
    st.utime = array.utime;
    st.seen = true;

    kind.map(|kind| Event {
        kind,
        dev: st.devname.clone(),
        member,
    })
}

/// Deliver one event.
pub(crate) fn alert(event: &Event, targets: &AlertTargets) {
    if targets.program.is_none() && targets.mail.is_none() {
        let now = chrono::Local::now();
        println!(
            "{}: {} on {} {}",
            now.format("%b %e %H:%M:%S"),
            event.kind.as_str(),
            event.dev,
            event.member.as_deref().unwrap_or("unknown device")
        );
    }
    if let Some(program) = &targets.program {
        let status = Command::new(program)
            .arg(event.kind.as_str())
            .arg(&event.dev)
            .arg(event.member.as_deref().unwrap_or(""))
            .status();
        if let Err(e) = status {
            tracing::warn!("alert program {} failed: {}", program, e);
        }
    }
    if let Some(addr) = &targets.mail {
        if event.kind.is_failure() {
            if let Err(e) = send_mail(event, addr) {
                tracing::warn!("cannot mail {}: {}", addr, e);
            }
        }
    }
}

fn send_mail(event: &Event, addr: &str) -> std::io::Result<()> {
    let hostname = nix::unistd::gethostname()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "localhost".to_string());
    let mut child = Command::new(SENDMAIL)
        .arg("-t")
        .stdin(Stdio::piped())
        .spawn()?;
    if let Some(stdin) = child.stdin.as_mut() {
        // A failed write here means the transport went away; nothing more
        // to do than reap the child.
        let _ = write!(
            stdin,
            "From: {} monitoring <root>\n\
             To: {}\n\
             Subject: {} event on {}:{}\n\n\
             This is an automatically generated mail message from {}\n\
             running on {}\n\n\
             A {} event had been detected on md device {}.\n\n",
            crate::NAME,
            addr,
            event.kind.as_str(),
            event.dev,
            hostname,
            crate::NAME,
            hostname,
            event.kind.as_str(),
            event.dev
        );
        if let Some(member) = &event.member {
            let _ = write!(stdin, "It could be related to sub-device {}.\n\n", member);
        }
        let _ = write!(stdin, "Faithfully yours, etc.\n");
    }
    child.wait()?;
    Ok(())
}

/// Pick a donor for a degraded array: any peer in the same spare-group
/// with all its active slots filled and a spare going begging.
pub(crate) fn pick_donor<'a>(
    states: &'a HashMap<String, ArrayState>,
    target: &str,
) -> Option<&'a ArrayState> {
    let group = states.get(target)?.spare_group.as_ref()?;
    states.values().find(|st| {
        st.devname != target && st.spare_group.as_ref() == Some(group) && st.has_spare_to_give()
    })
}

/// A spare sits in a slot at or past raid_disks, with a device attached and
/// nothing wrong with it.
pub(crate) fn find_spare(driver: &dyn DriverOps) -> Option<(u32, u32)> {
    let array = driver.query_array().ok()?;
    let total = (array.raid_disks + array.spare_disks).clamp(0, MD_SB_DISKS as i32);
    for i in array.raid_disks..total {
        if let Ok(disk) = driver.query_disk(i as u32) {
            let flags = DiskFlags::from_bits_retain(disk.state as u32);
            if (disk.major != 0 || disk.minor != 0)
                && !flags.intersects(DiskFlags::FAULTY | DiskFlags::REMOVED)
            {
                return Some((disk.major as u32, disk.minor as u32));
            }
        }
    }
    None
}

fn migrate_spare(target: &str, donor: &str) -> MdResult<()> {
    let donor_dev = MdDevice::open(Path::new(donor))?;
    let Some((major, minor)) = find_spare(&donor_dev) else {
        return Ok(());
    };
    donor_dev.hot_remove(major, minor)?;
    drop(donor_dev);
    let target_dev = MdDevice::open(Path::new(target))?;
    target_dev.hot_add(major, minor)?;
    tracing::info!(
        "moved spare {}:{} from {} to {}",
        major,
        minor,
        donor,
        target
    );
    Ok(())
}

fn try_spare_migration(states: &HashMap<String, ArrayState>) {
    let moves: Vec<(String, String)> = states
        .values()
        .filter(|st| st.degraded() && st.spare_group.is_some())
        .filter_map(|st| {
            pick_donor(states, &st.devname).map(|donor| (st.devname.clone(), donor.devname.clone()))
        })
        .collect();
    for (target, donor) in moves {
        if let Err(e) = migrate_spare(&target, &donor) {
            tracing::warn!("cannot move spare from {} to {}: {}", donor, target, e);
        }
    }
}

fn interruptible_sleep(secs: u64) {
    for _ in 0..secs {
        if crate::is_interrupted() {
            return;
        }
        std::thread::sleep(Duration::from_secs(1));
    }
}

/// Watch a set of arrays until interrupted. An empty watch list falls back
/// to every array the config names.
pub fn monitor(
    watch: &[String],
    config: &ConfigFile,
    targets: &AlertTargets,
    opts: &MonitorOptions,
) -> MdResult<()> {
    let mut states: HashMap<String, ArrayState> = HashMap::new();
    while !crate::is_interrupted() {
        let watchlist: Vec<(String, Option<String>)> = if watch.is_empty() {
            config
                .identities()
                .iter()
                .filter_map(|id| {
                    id.device
                        .clone()
                        .map(|dev| (dev, id.spare_group.clone()))
                })
                .collect()
        } else {
            watch
                .iter()
                .map(|dev| {
                    (
                        dev.clone(),
                        config
                            .identity_for(dev)
                            .and_then(|id| id.spare_group.clone()),
                    )
                })
                .collect()
        };

        for (dev, spare_group) in &watchlist {
            let st = states
                .entry(dev.clone())
                .or_insert_with(|| ArrayState::new(dev, spare_group.clone()));
            // Open fresh each poll and drop before sleeping, so other
            // administrators can get at the device in between.
            match MdDevice::open(Path::new(dev)) {
                Ok(driver) => {
                    if let Some(event) = poll_array(&driver, st) {
                        alert(&event, targets);
                    }
                }
                Err(e) => st.note_error(&format!("cannot open {}: {}", dev, e)),
            }
        }

        try_spare_migration(&states);
        interruptible_sleep(opts.period_secs);
    }
    Ok(())
}
