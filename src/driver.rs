// Kernel md driver interface.
//
// Every array-control operation the tool issues goes through the `DriverOps`
// trait; `MdDevice` is the real implementation, a thin layer of raw ioctls on
// an open array device. Keeping the trait between the engines and the ioctls
// lets the assembly and monitor logic run against a scripted driver in tests.

use std::fs::File;
use std::io;
use std::os::unix::fs::FileTypeExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;

use nix::sys::stat::makedev;
use thiserror::Error;

/// Device major number reserved for md arrays.
pub const MD_MAJOR: u32 = 9;

// ioctl request encoding, as <asm-generic/ioctl.h> does it.
const fn ioc(dir: u64, ty: u64, nr: u64, size: u64) -> libc::c_ulong {
    ((dir << 30) | (size << 16) | (ty << 8) | nr) as libc::c_ulong
}

const fn io(ty: u64, nr: u64) -> libc::c_ulong {
    ioc(0, ty, nr, 0)
}

const fn ior(ty: u64, nr: u64, size: u64) -> libc::c_ulong {
    ioc(2, ty, nr, size)
}

const fn iow(ty: u64, nr: u64, size: u64) -> libc::c_ulong {
    ioc(1, ty, nr, size)
}

const VERSION_BYTES: u64 = std::mem::size_of::<RawVersion>() as u64;
const ARRAY_INFO_BYTES: u64 = std::mem::size_of::<ArrayInfo>() as u64;
const DISK_INFO_BYTES: u64 = std::mem::size_of::<DiskInfo>() as u64;
const PARAM_BYTES: u64 = std::mem::size_of::<RawParam>() as u64;

const RAID_VERSION: libc::c_ulong = ior(MD_MAJOR as u64, 0x10, VERSION_BYTES);
const GET_ARRAY_INFO: libc::c_ulong = ior(MD_MAJOR as u64, 0x11, ARRAY_INFO_BYTES);
const GET_DISK_INFO: libc::c_ulong = ior(MD_MAJOR as u64, 0x12, DISK_INFO_BYTES);
const ADD_NEW_DISK: libc::c_ulong = iow(MD_MAJOR as u64, 0x21, DISK_INFO_BYTES);
const HOT_REMOVE_DISK: libc::c_ulong = io(MD_MAJOR as u64, 0x22);
const SET_ARRAY_INFO: libc::c_ulong = iow(MD_MAJOR as u64, 0x23, ARRAY_INFO_BYTES);
const HOT_ADD_DISK: libc::c_ulong = io(MD_MAJOR as u64, 0x28);
const SET_DISK_FAULTY: libc::c_ulong = io(MD_MAJOR as u64, 0x29);
const RUN_ARRAY: libc::c_ulong = iow(MD_MAJOR as u64, 0x30, PARAM_BYTES);
const START_ARRAY: libc::c_ulong = io(MD_MAJOR as u64, 0x31);
const STOP_ARRAY: libc::c_ulong = io(MD_MAJOR as u64, 0x32);
const STOP_ARRAY_RO: libc::c_ulong = io(MD_MAJOR as u64, 0x33);
const RESTART_ARRAY_RW: libc::c_ulong = io(MD_MAJOR as u64, 0x34);

// Pre-0.90 driver interface.
const REGISTER_DEV: libc::c_ulong = io(MD_MAJOR as u64, 1);
const START_MD: libc::c_ulong = io(MD_MAJOR as u64, 2);
const STOP_MD: libc::c_ulong = io(MD_MAJOR as u64, 3);

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct RawVersion {
    major: libc::c_int,
    minor: libc::c_int,
    patchlevel: libc::c_int,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct RawParam {
    personality: libc::c_int,
    chunk_size: libc::c_int,
    max_fault: libc::c_int,
}

/// Array geometry and state, as the driver reports and accepts it.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArrayInfo {
    pub major_version: i32,
    pub minor_version: i32,
    pub patch_version: i32,
    pub ctime: i32,
    pub level: i32,
    pub size: i32,
    pub nr_disks: i32,
    pub raid_disks: i32,
    pub md_minor: i32,
    pub not_persistent: i32,
    pub utime: i32,
    pub state: i32,
    pub active_disks: i32,
    pub working_disks: i32,
    pub failed_disks: i32,
    pub spare_disks: i32,
    pub layout: i32,
    pub chunk_size: i32,
}

/// One member slot, as the driver reports and accepts it.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiskInfo {
    pub number: i32,
    pub major: i32,
    pub minor: i32,
    pub raid_disk: i32,
    pub state: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct DriverVersion {
    pub major: u32,
    pub minor: u32,
    pub patchlevel: u32,
}

impl DriverVersion {
    pub const fn new(major: u32, minor: u32, patchlevel: u32) -> Self {
        DriverVersion {
            major,
            minor,
            patchlevel,
        }
    }

    /// Oldest driver that understands the metadata-aware interface.
    pub const MINIMUM: DriverVersion = DriverVersion::new(0, 90, 0);
}

impl std::fmt::Display for DriverVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patchlevel)
    }
}

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("not an md array device")]
    NotAnArrayDevice,
    #[error("permission denied")]
    Permission,
    #[error("device or resource busy")]
    Busy,
    #[error("no such device")]
    NoSuchDevice,
    #[error("md driver version {0} does not support this operation")]
    UnsupportedVersion(DriverVersion),
    #[error("{op} failed: {source}")]
    Ioctl {
        op: &'static str,
        source: io::Error,
    },
    #[error("cannot open {path}: {source}")]
    Open { path: String, source: io::Error },
}

pub type DriverResult<T> = Result<T, DriverError>;

fn os_error(op: &'static str) -> DriverError {
    let source = io::Error::last_os_error();
    match source.raw_os_error() {
        Some(libc::EBUSY) => DriverError::Busy,
        Some(libc::EACCES) | Some(libc::EPERM) => DriverError::Permission,
        Some(libc::ENODEV) => DriverError::NoSuchDevice,
        _ => DriverError::Ioctl { op, source },
    }
}

/// The closed set of array-control operations.
pub trait DriverOps {
    fn driver_version(&self) -> DriverResult<DriverVersion>;
    fn query_array(&self) -> DriverResult<ArrayInfo>;
    fn query_disk(&self, number: u32) -> DriverResult<DiskInfo>;
    fn set_array_info(&self, info: Option<&ArrayInfo>) -> DriverResult<()>;
    fn add_new_disk(&self, disk: &DiskInfo) -> DriverResult<()>;
    fn run_array(&self) -> DriverResult<()>;
    fn stop_array(&self) -> DriverResult<()>;
    fn stop_array_readonly(&self) -> DriverResult<()>;
    fn restart_readwrite(&self) -> DriverResult<()>;
    fn hot_add(&self, major: u32, minor: u32) -> DriverResult<()>;
    fn hot_remove(&self, major: u32, minor: u32) -> DriverResult<()>;
    fn set_faulty(&self, major: u32, minor: u32) -> DriverResult<()>;

    // Pre-0.90 interface. Only Build and the legacy assemble start path use
    // these.
    fn start_array(&self, major: u32, minor: u32) -> DriverResult<()>;
    fn register_dev(&self, major: u32, minor: u32) -> DriverResult<()>;
    fn start_md(&self, geometry: u32) -> DriverResult<()>;
    fn stop_md(&self) -> DriverResult<()>;
}

/// An open md array device.
pub struct MdDevice {
    file: File,
}

impl MdDevice {
    /// Open an array device read-write and verify it answers as md.
    pub fn open(path: &Path) -> DriverResult<MdDevice> {
        let file = File::options()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|source| DriverError::Open {
                path: path.display().to_string(),
                source,
            })?;
        let dev = MdDevice { file };
        dev.driver_version()?;
        Ok(dev)
    }

    fn ioctl_none(&self, op: &'static str, request: libc::c_ulong) -> DriverResult<()> {
        let rc = unsafe { libc::ioctl(self.file.as_raw_fd(), request, 0usize) };
        if rc != 0 {
            return Err(os_error(op));
        }
        Ok(())
    }

    fn ioctl_dev(
        &self,
        op: &'static str,
        request: libc::c_ulong,
        major: u32,
        minor: u32,
    ) -> DriverResult<()> {
        let dev = makedev(major as u64, minor as u64);
        let rc = unsafe { libc::ioctl(self.file.as_raw_fd(), request, dev as usize) };
        if rc != 0 {
            return Err(os_error(op));
        }
        Ok(())
    }
}

impl DriverOps for MdDevice {
    fn driver_version(&self) -> DriverResult<DriverVersion> {
        let md = self
            .file
            .metadata()
            .map_err(|source| DriverError::Ioctl {
                op: "fstat",
                source,
            })?;
        if !md.file_type().is_block_device() {
            return Err(DriverError::NotAnArrayDevice);
        }
        let mut vers = RawVersion::default();
        let rc = unsafe { libc::ioctl(self.file.as_raw_fd(), RAID_VERSION, &mut vers) };
        if rc == 0 {
            return Ok(DriverVersion::new(
                vers.major as u32,
                vers.minor as u32,
                vers.patchlevel as u32,
            ));
        }
        // A block device with the md major but no RAID_VERSION ioctl is the
        // ancient 0.36 driver.
        let rdev = std::os::unix::fs::MetadataExt::rdev(&md);
        if nix::sys::stat::major(rdev) as u32 == MD_MAJOR {
            return Ok(DriverVersion::new(0, 36, 0));
        }
        Err(DriverError::NotAnArrayDevice)
    }

    fn query_array(&self) -> DriverResult<ArrayInfo> {
        let mut info = ArrayInfo::default();
        let rc = unsafe { libc::ioctl(self.file.as_raw_fd(), GET_ARRAY_INFO, &mut info) };
        if rc != 0 {
            return Err(os_error("GET_ARRAY_INFO"));
        }
        Ok(info)
    }

    fn query_disk(&self, number: u32) -> DriverResult<DiskInfo> {
        let mut disk = DiskInfo {
            number: number as i32,
            ..DiskInfo::default()
        };
        let rc = unsafe { libc::ioctl(self.file.as_raw_fd(), GET_DISK_INFO, &mut disk) };
        if rc != 0 {
            return Err(os_error("GET_DISK_INFO"));
        }
        Ok(disk)
    }

    fn set_array_info(&self, info: Option<&ArrayInfo>) -> DriverResult<()> {
        let rc = match info {
            Some(info) => unsafe { libc::ioctl(self.file.as_raw_fd(), SET_ARRAY_INFO, info) },
            // A null payload tells the driver to take everything from the
            // member superblocks.
            None => unsafe { libc::ioctl(self.file.as_raw_fd(), SET_ARRAY_INFO, 0usize) },
        };
        if rc != 0 {
            return Err(os_error("SET_ARRAY_INFO"));
        }
        Ok(())
    }

    fn add_new_disk(&self, disk: &DiskInfo) -> DriverResult<()> {
        let rc = unsafe { libc::ioctl(self.file.as_raw_fd(), ADD_NEW_DISK, disk) };
        if rc != 0 {
            return Err(os_error("ADD_NEW_DISK"));
        }
        Ok(())
    }

    fn run_array(&self) -> DriverResult<()> {
        let param = RawParam::default();
        let rc = unsafe { libc::ioctl(self.file.as_raw_fd(), RUN_ARRAY, &param) };
        if rc != 0 {
            return Err(os_error("RUN_ARRAY"));
        }
        Ok(())
    }

    fn stop_array(&self) -> DriverResult<()> {
        self.ioctl_none("STOP_ARRAY", STOP_ARRAY)
    }

    fn stop_array_readonly(&self) -> DriverResult<()> {
        self.ioctl_none("STOP_ARRAY_RO", STOP_ARRAY_RO)
    }

    fn restart_readwrite(&self) -> DriverResult<()> {
        self.ioctl_none("RESTART_ARRAY_RW", RESTART_ARRAY_RW)
    }

    fn hot_add(&self, major: u32, minor: u32) -> DriverResult<()> {
        self.ioctl_dev("HOT_ADD_DISK", HOT_ADD_DISK, major, minor)
    }

    fn hot_remove(&self, major: u32, minor: u32) -> DriverResult<()> {
        self.ioctl_dev("HOT_REMOVE_DISK", HOT_REMOVE_DISK, major, minor)
    }

    fn set_faulty(&self, major: u32, minor: u32) -> DriverResult<()> {
        self.ioctl_dev("SET_DISK_FAULTY", SET_DISK_FAULTY, major, minor)
    }

    fn start_array(&self, major: u32, minor: u32) -> DriverResult<()> {
        self.ioctl_dev("START_ARRAY", START_ARRAY, major, minor)
    }

    fn register_dev(&self, major: u32, minor: u32) -> DriverResult<()> {
        self.ioctl_dev("REGISTER_DEV", REGISTER_DEV, major, minor)
    }

    fn start_md(&self, geometry: u32) -> DriverResult<()> {
        let rc = unsafe { libc::ioctl(self.file.as_raw_fd(), START_MD, geometry as usize) };
        if rc != 0 {
            return Err(os_error("START_MD"));
        }
        Ok(())
    }

    fn stop_md(&self) -> DriverResult<()> {
        self.ioctl_none("STOP_MD", STOP_MD)
    }
}

/// Version of the running kernel, for the pre-2.4 assembly fallback.
pub fn kernel_version() -> Option<(u32, u32, u32)> {
    let uts = nix::sys::utsname::uname().ok()?;
    let release = uts.release().to_str()?;
    let mut parts = release.split(|c: char| !c.is_ascii_digit());
    let a = parts.next()?.parse().ok()?;
    let b = parts.next()?.parse().ok()?;
    let c = parts.next()?.parse().ok()?;
    Some((a, b, c))
}

#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use std::cell::RefCell;

    /// Everything a fake driver saw, in order.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Call {
        SetArrayInfo(Option<ArrayInfo>),
        AddNewDisk(DiskInfo),
        RunArray,
        StopArray,
        StopArrayRo,
        RestartRw,
        HotAdd(u32, u32),
        HotRemove(u32, u32),
        SetFaulty(u32, u32),
        StartArray(u32, u32),
        RegisterDev(u32, u32),
        StartMd(u32),
        StopMd,
    }

    /// Scripted driver double that records the full call sequence.
    pub struct FakeDriver {
        pub version: DriverVersion,
        pub array: Option<ArrayInfo>,
        pub disks: Vec<DiskInfo>,
        pub fail_add_minors: Vec<i32>,
        pub fail_hot_add: bool,
        pub fail_run: bool,
        pub calls: RefCell<Vec<Call>>,
    }

    impl Default for FakeDriver {
        fn default() -> Self {
            FakeDriver {
                version: DriverVersion::MINIMUM,
                array: None,
                disks: Vec::new(),
                fail_add_minors: Vec::new(),
                fail_hot_add: false,
                fail_run: false,
                calls: RefCell::new(Vec::new()),
            }
        }
    }

    impl FakeDriver {
        pub fn calls(&self) -> Vec<Call> {
            self.calls.borrow().clone()
        }

        fn record(&self, call: Call) {
            self.calls.borrow_mut().push(call);
        }
    }

    impl DriverOps for FakeDriver {
        fn driver_version(&self) -> DriverResult<DriverVersion> {
            Ok(self.version)
        }

        fn query_array(&self) -> DriverResult<ArrayInfo> {
            self.array.ok_or(DriverError::NoSuchDevice)
        }

        fn query_disk(&self, number: u32) -> DriverResult<DiskInfo> {
            self.disks
                .get(number as usize)
                .copied()
                .ok_or(DriverError::NoSuchDevice)
        }

        fn set_array_info(&self, info: Option<&ArrayInfo>) -> DriverResult<()> {
            self.record(Call::SetArrayInfo(info.copied()));
            Ok(())
        }

        fn add_new_disk(&self, disk: &DiskInfo) -> DriverResult<()> {
            self.record(Call::AddNewDisk(*disk));
            if self.fail_add_minors.contains(&disk.minor) {
                return Err(DriverError::Busy);
            }
            Ok(())
        }

        fn run_array(&self) -> DriverResult<()> {
            self.record(Call::RunArray);
            if self.fail_run {
                return Err(DriverError::Busy);
            }
            Ok(())
        }

        fn stop_array(&self) -> DriverResult<()> {
            self.record(Call::StopArray);
            Ok(())
        }

        fn stop_array_readonly(&self) -> DriverResult<()> {
            self.record(Call::StopArrayRo);
            Ok(())
        }

        fn restart_readwrite(&self) -> DriverResult<()> {
            self.record(Call::RestartRw);
            Ok(())
        }

        fn hot_add(&self, major: u32, minor: u32) -> DriverResult<()> {
            self.record(Call::HotAdd(major, minor));
            if self.fail_hot_add {
                return Err(DriverError::Ioctl {
                    op: "HOT_ADD_DISK",
                    source: std::io::Error::from_raw_os_error(libc::EINVAL),
                });
            }
            Ok(())
        }

        fn hot_remove(&self, major: u32, minor: u32) -> DriverResult<()> {
            self.record(Call::HotRemove(major, minor));
            Ok(())
        }

        fn set_faulty(&self, major: u32, minor: u32) -> DriverResult<()> {
            self.record(Call::SetFaulty(major, minor));
            Ok(())
        }

        fn start_array(&self, major: u32, minor: u32) -> DriverResult<()> {
            self.record(Call::StartArray(major, minor));
            Ok(())
        }

        fn register_dev(&self, major: u32, minor: u32) -> DriverResult<()> {
            self.record(Call::RegisterDev(major, minor));
            Ok(())
        }

        fn start_md(&self, geometry: u32) -> DriverResult<()> {
            self.record(Call::StartMd(geometry));
            Ok(())
        }

        fn stop_md(&self) -> DriverResult<()> {
            self.record(Call::StopMd);
            Ok(())
        }
    }
}
