// md 0.90 on-disk superblock handling.
//
// The persistent superblock is a fixed 4 KiB record of native-endian 32-bit
// words, stored at a 64 KiB-aligned offset near the end of every member
// device. The record is the only thing that ties a set of block devices
// together as one array, so loading, comparing and rewriting it correctly is
// what assembly stands on.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::unix::io::AsRawFd;

use bitflags::bitflags;
use thiserror::Error;
use uuid::Uuid;

/// Magic number identifying an md superblock.
pub const MD_SB_MAGIC: u32 = 0xa92b_4efc;

/// Superblock size in bytes and 32-bit words.
pub const MD_SB_BYTES: usize = 4096;
pub const MD_SB_WORDS: usize = MD_SB_BYTES / 4;

/// Space reserved for the superblock at the tail of a member device.
pub const MD_RESERVED_BYTES: u64 = 64 * 1024;
pub const MD_RESERVED_SECTORS: u64 = MD_RESERVED_BYTES / 512;

/// Words per disk descriptor, and the number of slots in the disks table.
const MD_SB_DESCRIPTOR_WORDS: usize = 32;
pub const MD_SB_DISKS: usize = 27;

// Word offsets, generic constant section.
const W_MAGIC: usize = 0;
const W_MAJOR_VERSION: usize = 1;
const W_MINOR_VERSION: usize = 2;
const W_PATCH_VERSION: usize = 3;
const W_GVALID_WORDS: usize = 4;
const W_SET_UUID0: usize = 5;
const W_CTIME: usize = 6;
const W_LEVEL: usize = 7;
const W_SIZE: usize = 8;
const W_NR_DISKS: usize = 9;
const W_RAID_DISKS: usize = 10;
const W_MD_MINOR: usize = 11;
const W_NOT_PERSISTENT: usize = 12;
const W_SET_UUID1: usize = 13;
const W_SET_UUID2: usize = 14;
const W_SET_UUID3: usize = 15;

// Generic state section.
const W_UTIME: usize = 32;
const W_STATE: usize = 33;
const W_ACTIVE_DISKS: usize = 34;
const W_WORKING_DISKS: usize = 35;
const W_FAILED_DISKS: usize = 36;
const W_SPARE_DISKS: usize = 37;
const W_SB_CSUM: usize = 38;
const W_EVENTS_LO: usize = 39;
const W_EVENTS_HI: usize = 40;
const W_CP_EVENTS_LO: usize = 41;
const W_CP_EVENTS_HI: usize = 42;
const W_RECOVERY_CP: usize = 43;

// Personality section.
const W_LAYOUT: usize = 64;
const W_CHUNK_SIZE: usize = 65;
const W_ROOT_PV: usize = 66;
const W_ROOT_BLOCK: usize = 67;

// Disks table and the owner's own descriptor.
const W_DISKS: usize = 128;
const W_THIS_DISK: usize = MD_SB_WORDS - MD_SB_DESCRIPTOR_WORDS;

// Descriptor-relative word offsets.
const D_NUMBER: usize = 0;
const D_MAJOR: usize = 1;
const D_MINOR: usize = 2;
const D_RAID_DISK: usize = 3;
const D_STATE: usize = 4;

bitflags! {
    /// Per-disk state bits in a descriptor.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DiskFlags: u32 {
        const FAULTY = 1 << 0;
        const ACTIVE = 1 << 1;
        const SYNC = 1 << 2;
        const REMOVED = 1 << 3;
    }
}

bitflags! {
    /// Array state bits in the superblock.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SbStateFlags: u32 {
        const CLEAN = 1 << 0;
        const ERRORS = 1 << 1;
    }
}

/// One entry of the disks table, decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DiskDescriptor {
    pub number: u32,
    pub major: u32,
    pub minor: u32,
    pub raid_disk: u32,
    pub state: DiskFlags,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("cannot determine device size")]
    NoBlockSize(#[source] io::Error),
    #[error("device is too small for md")]
    TooSmall,
    #[error("cannot seek to superblock")]
    SeekFailed(#[source] io::Error),
    #[error("cannot read superblock")]
    ShortRead(#[source] io::Error),
    #[error("no md superblock (bad magic)")]
    BadMagic,
    #[error("unsupported superblock major version {0}")]
    WrongMajorVersion(u32),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("cannot determine device size")]
    NoBlockSize(#[source] io::Error),
    #[error("device is too small for md")]
    TooSmall,
    #[error("cannot seek to superblock")]
    SeekFailed(#[source] io::Error),
    #[error("cannot write superblock")]
    WriteFailed(#[source] io::Error),
}

/// Outcome of comparing a candidate superblock against the reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SbCompare {
    Same,
    WrongMagic,
    WrongUuid,
    WrongGeometry,
}

// BLKGETSIZE64: _IOR(0x12, 114, size_t)
const BLKGETSIZE64: libc::c_ulong = ((2u64 << 30) | (8 << 16) | (0x12 << 8) | 114) as libc::c_ulong;

/// Size of the device behind `file` in 512-byte sectors.
///
/// Regular files fall back to their metadata length so that file-backed
/// member images behave like devices.
pub fn device_sectors(file: &File) -> io::Result<u64> {
    let md = file.metadata()?;
    if md.file_type().is_file() {
        return Ok(md.len() / 512);
    }
    let mut bytes: u64 = 0;
    let rc = unsafe { libc::ioctl(file.as_raw_fd(), BLKGETSIZE64, &mut bytes) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(bytes / 512)
}

/// Usable size of a member device in sectors: the device rounded down to a
/// whole number of 64 KiB chunks, minus the final chunk that holds the
/// superblock.
pub const fn new_size_sectors(sectors: u64) -> u64 {
    (sectors & !(MD_RESERVED_SECTORS - 1)) - MD_RESERVED_SECTORS
}

/// Byte offset of the superblock on a device of the given size.
pub const fn sb_offset_bytes(sectors: u64) -> u64 {
    new_size_sectors(sectors) * 512
}

macro_rules! sb_word {
    ($(#[$doc:meta])* $get:ident, $set:ident, $off:expr) => {
        $(#[$doc])*
        pub fn $get(&self) -> u32 {
            self.words[$off]
        }
        pub fn $set(&mut self, v: u32) {
            self.words[$off] = v;
        }
    };
}

/// An md 0.90 superblock held as its 1024 words.
#[derive(Clone, PartialEq, Eq)]
pub struct Superblock {
    words: [u32; MD_SB_WORDS],
}

impl std::fmt::Debug for Superblock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Superblock")
            .field("magic", &format_args!("{:#010x}", self.magic()))
            .field("uuid", &self.uuid_display())
            .field("level", &self.level())
            .field("raid_disks", &self.raid_disks())
            .field("events", &self.events())
            .finish()
    }
}

impl Default for Superblock {
    fn default() -> Self {
        Self::zeroed()
    }
}

impl Superblock {
    pub fn zeroed() -> Self {
        Superblock {
            words: [0; MD_SB_WORDS],
        }
    }

    pub fn from_bytes(buf: &[u8; MD_SB_BYTES]) -> Self {
        let mut words = [0u32; MD_SB_WORDS];
        for (i, chunk) in buf.chunks_exact(4).enumerate() {
            words[i] = u32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        Superblock { words }
    }

    pub fn to_bytes(&self) -> [u8; MD_SB_BYTES] {
        let mut buf = [0u8; MD_SB_BYTES];
        for (i, w) in self.words.iter().enumerate() {
            buf[i * 4..i * 4 + 4].copy_from_slice(&w.to_ne_bytes());
        }
        buf
    }

    sb_word!(magic, set_magic, W_MAGIC);
    sb_word!(major_version, set_major_version, W_MAJOR_VERSION);
    sb_word!(minor_version, set_minor_version, W_MINOR_VERSION);
    sb_word!(patch_version, set_patch_version, W_PATCH_VERSION);
    sb_word!(gvalid_words, set_gvalid_words, W_GVALID_WORDS);
    sb_word!(ctime, set_ctime, W_CTIME);
    sb_word!(size, set_size, W_SIZE);
    sb_word!(nr_disks, set_nr_disks, W_NR_DISKS);
    sb_word!(raid_disks, set_raid_disks, W_RAID_DISKS);
    sb_word!(md_minor, set_md_minor, W_MD_MINOR);
    sb_word!(not_persistent, set_not_persistent, W_NOT_PERSISTENT);
    sb_word!(utime, set_utime, W_UTIME);
    sb_word!(active_disks, set_active_disks, W_ACTIVE_DISKS);
    sb_word!(working_disks, set_working_disks, W_WORKING_DISKS);
    sb_word!(failed_disks, set_failed_disks, W_FAILED_DISKS);
    sb_word!(spare_disks, set_spare_disks, W_SPARE_DISKS);
    sb_word!(sb_csum, set_sb_csum, W_SB_CSUM);
    sb_word!(recovery_cp, set_recovery_cp, W_RECOVERY_CP);
    sb_word!(layout, set_layout, W_LAYOUT);
    sb_word!(chunk_size, set_chunk_size, W_CHUNK_SIZE);
    sb_word!(root_pv, set_root_pv, W_ROOT_PV);
    sb_word!(root_block, set_root_block, W_ROOT_BLOCK);

    /// Raid level; -1 is linear.
    pub fn level(&self) -> i32 {
        self.words[W_LEVEL] as i32
    }

    pub fn set_level(&mut self, level: i32) {
        self.words[W_LEVEL] = level as u32;
    }

    pub fn state(&self) -> SbStateFlags {
        SbStateFlags::from_bits_retain(self.words[W_STATE])
    }

    pub fn set_state(&mut self, state: SbStateFlags) {
        self.words[W_STATE] = state.bits();
    }

    /// The 64-bit event counter, composed from its stored halves.
    pub fn events(&self) -> u64 {
        ((self.words[W_EVENTS_HI] as u64) << 32) | self.words[W_EVENTS_LO] as u64
    }

    pub fn set_events(&mut self, events: u64) {
        self.words[W_EVENTS_HI] = (events >> 32) as u32;
        self.words[W_EVENTS_LO] = events as u32;
    }

    pub fn cp_events(&self) -> u64 {
        ((self.words[W_CP_EVENTS_HI] as u64) << 32) | self.words[W_CP_EVENTS_LO] as u64
    }

    pub fn set_cp_events(&mut self, events: u64) {
        self.words[W_CP_EVENTS_HI] = (events >> 32) as u32;
        self.words[W_CP_EVENTS_LO] = events as u32;
    }

    /// The set UUID as four words. Pre-0.90 superblocks carry only the
    /// first word; the others read as zero.
    pub fn uuid(&self) -> [u32; 4] {
        if self.minor_version() >= 90 {
            [
                self.words[W_SET_UUID0],
                self.words[W_SET_UUID1],
                self.words[W_SET_UUID2],
                self.words[W_SET_UUID3],
            ]
        } else {
            [self.words[W_SET_UUID0], 0, 0, 0]
        }
    }

    pub fn set_uuid(&mut self, uuid: [u32; 4]) {
        self.words[W_SET_UUID0] = uuid[0];
        self.words[W_SET_UUID1] = uuid[1];
        self.words[W_SET_UUID2] = uuid[2];
        self.words[W_SET_UUID3] = uuid[3];
    }

    pub fn uuid_display(&self) -> Uuid {
        let u = self.uuid();
        let mut bytes = [0u8; 16];
        for (i, w) in u.iter().enumerate() {
            bytes[i * 4..i * 4 + 4].copy_from_slice(&w.to_be_bytes());
        }
        Uuid::from_bytes(bytes)
    }

    fn descriptor_at(&self, base: usize) -> DiskDescriptor {
        DiskDescriptor {
            number: self.words[base + D_NUMBER],
            major: self.words[base + D_MAJOR],
            minor: self.words[base + D_MINOR],
            raid_disk: self.words[base + D_RAID_DISK],
            state: DiskFlags::from_bits_retain(self.words[base + D_STATE]),
        }
    }

    fn store_descriptor(&mut self, base: usize, d: &DiskDescriptor) {
        self.words[base + D_NUMBER] = d.number;
        self.words[base + D_MAJOR] = d.major;
        self.words[base + D_MINOR] = d.minor;
        self.words[base + D_RAID_DISK] = d.raid_disk;
        self.words[base + D_STATE] = d.state.bits();
    }

    pub fn disk(&self, slot: usize) -> DiskDescriptor {
        assert!(slot < MD_SB_DISKS);
        self.descriptor_at(W_DISKS + slot * MD_SB_DESCRIPTOR_WORDS)
    }

    pub fn set_disk(&mut self, slot: usize, d: &DiskDescriptor) {
        assert!(slot < MD_SB_DISKS);
        self.store_descriptor(W_DISKS + slot * MD_SB_DESCRIPTOR_WORDS, d);
    }

    /// The owner's view of its own slot.
    pub fn this_disk(&self) -> DiskDescriptor {
        self.descriptor_at(W_THIS_DISK)
    }

    pub fn set_this_disk(&mut self, d: &DiskDescriptor) {
        self.store_descriptor(W_THIS_DISK, d);
    }

    /// Wrapping 32-bit sum of the record with the checksum field taken as
    /// zero.
    pub fn checksum(&self) -> u32 {
        let mut sum = 0u32;
        for (i, w) in self.words.iter().enumerate() {
            if i != W_SB_CSUM {
                sum = sum.wrapping_add(*w);
            }
        }
        sum
    }

    pub fn update_checksum(&mut self) {
        self.words[W_SB_CSUM] = self.checksum();
    }

    pub fn checksum_ok(&self) -> bool {
        self.sb_csum() == self.checksum()
    }

    /// Read the superblock from the tail of a member device.
    pub fn load(file: &mut File) -> Result<Superblock, LoadError> {
        let sectors = device_sectors(file).map_err(LoadError::NoBlockSize)?;
        if sectors < MD_RESERVED_SECTORS * 2 {
            return Err(LoadError::TooSmall);
        }
        file.seek(SeekFrom::Start(sb_offset_bytes(sectors)))
            .map_err(LoadError::SeekFailed)?;
        let mut buf = [0u8; MD_SB_BYTES];
        file.read_exact(&mut buf).map_err(LoadError::ShortRead)?;
        let sb = Superblock::from_bytes(&buf);
        if sb.magic() != MD_SB_MAGIC {
            return Err(LoadError::BadMagic);
        }
        if sb.major_version() != 0 {
            return Err(LoadError::WrongMajorVersion(sb.major_version()));
        }
        Ok(sb)
    }

    /// Write the superblock back at the device's derived offset.
    pub fn store(&self, file: &mut File) -> Result<(), StoreError> {
        let sectors = device_sectors(file).map_err(StoreError::NoBlockSize)?;
        if sectors < MD_RESERVED_SECTORS * 2 {
            return Err(StoreError::TooSmall);
        }
        file.seek(SeekFrom::Start(sb_offset_bytes(sectors)))
            .map_err(StoreError::SeekFailed)?;
        file.write_all(&self.to_bytes())
            .map_err(StoreError::WriteFailed)?;
        file.sync_data().map_err(StoreError::WriteFailed)?;
        Ok(())
    }
}

/// Compare a candidate superblock against the reference copy.
///
/// An empty reference (zero magic) adopts the candidate and reports `Same`;
/// the first accepted member becomes the template every later member must
/// match.
pub fn compare(reference: &mut Superblock, candidate: &Superblock) -> SbCompare {
    if candidate.magic() != MD_SB_MAGIC {
        return SbCompare::WrongMagic;
    }
    if reference.magic() != MD_SB_MAGIC {
        *reference = candidate.clone();
        return SbCompare::Same;
    }
    if reference.uuid() != candidate.uuid() {
        return SbCompare::WrongUuid;
    }
    if reference.major_version() != candidate.major_version()
        || reference.minor_version() != candidate.minor_version()
        || reference.patch_version() != candidate.patch_version()
        || reference.gvalid_words() != candidate.gvalid_words()
        || reference.ctime() != candidate.ctime()
        || reference.level() != candidate.level()
        || reference.size() != candidate.size()
        || reference.raid_disks() != candidate.raid_disks()
    {
        return SbCompare::WrongGeometry;
    }
    SbCompare::Same
}
