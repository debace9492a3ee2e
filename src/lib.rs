// mdctl - administration tool for Linux md (software RAID) arrays.
//
// The library carries the whole engine: superblock codec, config model,
// assemble/create/build flows, the monitor loop and manage operations. The
// binary in main.rs is a thin clap front-end over it.

pub mod assemble;
pub mod build;
pub mod config;
pub mod create;
pub mod detail;
pub mod devices;
pub mod driver;
pub mod examine;
pub mod manage;
pub mod monitor;
pub mod superblock;

use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;

pub use driver::DriverError;
pub use superblock::{LoadError, StoreError};

/// Program name, used to tag every user-visible diagnostic.
pub const NAME: &str = "mdctl";

// Set from the signal handler; the monitor loop checks it between polls.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Set the interrupt flag (called by the signal handler).
pub fn set_interrupted() {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

/// Check whether a termination signal has been received.
pub fn is_interrupted() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}

/// Reset the interrupt flag (primarily for testing).
pub fn reset_interrupted() {
    INTERRUPTED.store(false, Ordering::SeqCst);
}

#[derive(Debug, Error)]
pub enum MdError {
    #[error("md driver version 0.90.0 or later is required")]
    DriverTooOld,

    #[error("device {0} already active - cannot assemble it")]
    AlreadyActive(String),

    #[error("no identity information available for {0} - cannot assemble")]
    NoIdentity(String),

    #[error("no devices found for {0}")]
    NoCandidates(String),

    #[error("cannot read superblock on {path}: {source}")]
    SuperblockLoad {
        path: String,
        #[source]
        source: LoadError,
    },

    #[error("superblock on {0} doesn't match others - assembly aborted")]
    SuperblockMismatch(String),

    #[error("could not write superblock on {path}: {source}")]
    SuperblockWrite {
        path: String,
        #[source]
        source: StoreError,
    },

    #[error("{dev} assembled from {okcnt} drives - not enough to start the array")]
    NotEnoughDrives { dev: String, okcnt: u32 },

    #[error("{0} does not appear to be active")]
    NotActive(String),

    #[error("{0} is not a block device")]
    NotBlockDevice(String),

    #[error("{path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("config line {line}: {reason}")]
    ConfigParse { line: usize, reason: String },

    #[error("create aborted")]
    CreateAborted,

    #[error("{0}")]
    Usage(String),

    #[error(transparent)]
    Driver(#[from] DriverError),
}

pub type MdResult<T> = Result<T, MdError>;

#[cfg(test)]
mod build_tests;
#[cfg(test)]
mod config_tests;
#[cfg(test)]
mod examine_tests;
#[cfg(test)]
mod superblock_tests;
