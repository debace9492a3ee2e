// Manage operations: run/stop, readonly toggles, and per-member hot
// add/remove/fault. All of them are stateless wrappers over single driver
// calls, plus the one fallback dance for cold adds.

use std::path::Path;

use crate::devices;
use crate::driver::{ArrayInfo, DiskInfo, DriverOps, DriverVersion};
use crate::superblock::DiskFlags;
use crate::{MdError, MdResult};

/// Switch a running array to readonly (`readonly > 0`) or back to
/// read-write (`readonly < 0`).
pub fn ro_toggle(devname: &str, driver: &dyn DriverOps, readonly: i32) -> MdResult<()> {
    if driver.driver_version()? < DriverVersion::MINIMUM {
        return Err(MdError::DriverTooOld);
    }
    if driver.query_array().is_err() {
        return Err(MdError::NotActive(devname.to_string()));
    }
    if readonly > 0 {
        driver.stop_array_readonly()?;
    } else if readonly < 0 {
        driver.restart_readwrite()?;
    }
    Ok(())
}

/// Run (`runstop > 0`) or stop (`runstop < 0`) a configured array.
pub fn runstop(devname: &str, driver: &dyn DriverOps, runstop: i32) -> MdResult<()> {
    let vers = driver.driver_version()?;
    if vers < DriverVersion::MINIMUM {
        // The old driver can still stop.
        if runstop < 0 {
            driver.stop_md()?;
            return Ok(());
        }
        return Err(MdError::DriverTooOld);
    }
    if runstop > 0 {
        driver.run_array()?;
        tracing::info!("started {}", devname);
    } else if runstop < 0 {
        driver.stop_array()?;
        tracing::info!("stopped {}", devname);
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubdevOp {
    Add,
    Remove,
    Fault,
}

/// Apply one operation per member device.
pub fn subdevs(
    devname: &str,
    driver: &dyn DriverOps,
    ops: &[(String, SubdevOp)],
) -> MdResult<()> {
    let array = driver
        .query_array()
        .map_err(|_| MdError::NotActive(devname.to_string()))?;
    for (path, op) in ops {
        let (major, minor) = devices::stat_block_device(Path::new(path))?;
        apply_subdev(driver, &array, path, major, minor, *op)?;
    }
    Ok(())
}

pub(crate) fn apply_subdev(
    driver: &dyn DriverOps,
    array: &ArrayInfo,
    name: &str,
    major: u32,
    minor: u32,
    op: SubdevOp,
) -> MdResult<()> {
    match op {
        SubdevOp::Add => {
            if driver.hot_add(major, minor).is_ok() {
                tracing::info!("hot added {}", name);
                return Ok(());
            }
            // The driver would not hot-add; describe the disk ourselves in
            // the first slot that is empty or holds a removed device.
            let mut number = array.nr_disks;
            for j in 0..array.nr_disks.max(0) {
                match driver.query_disk(j as u32) {
                    Err(_) => {
                        number = j;
                        break;
                    }
                    Ok(disk) => {
                        if (disk.major == 0 && disk.minor == 0)
                            || DiskFlags::from_bits_retain(disk.state as u32)
                                .contains(DiskFlags::REMOVED)
                        {
                            number = j;
                            break;
                        }
                    }
                }
            }
            driver.add_new_disk(&DiskInfo {
                number,
                raid_disk: number,
                state: 0,
                major: major as i32,
                minor: minor as i32,
            })?;
            tracing::info!("added {}", name);
        }
        SubdevOp::Remove => {
            driver.hot_remove(major, minor)?;
            tracing::info!("hot removed {}", name);
        }
        SubdevOp::Fault => {
            driver.set_faulty(major, minor)?;
            tracing::info!("set {} faulty", name);
        }
    }
    Ok(())
}
