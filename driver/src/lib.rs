//! Track-cached MFM floppy driver for the Amiga disk subsystem.
//!
//! The hardware reads and writes whole raw tracks through the Paula disk
//! DMA; everything at sector granularity (IBM-PC double density, 9 x 512
//! bytes per track, 80 cylinders, 1 or 2 sides) happens in software. The
//! driver keeps one raw track per drive in memory, serves sub-track reads
//! from it, stages writes into it, and flushes lazily when the head moves
//! away or the motor spins down.
//!
//! [`FloppyTask`] is the single thread of control. Interrupt and timer
//! contexts never run driver code; they post bits into the shared event
//! word and wake the task, which consumes them in its rendezvous. The
//! hardware itself is reached through the port traits in [`ports`], with
//! the memory-mapped implementation in [`chip`] and an image-backed model
//! in [`sim`] for tools and tests.

pub mod cache;
pub mod chip;
pub mod drive;
pub mod motor;
pub mod ports;
pub mod sim;
pub mod task;
pub mod trackbuf;
pub mod trackio;

pub use drive::DriveSlot;
pub use ports::{EventBoard, Events, IoKind, IovEntry, Message, Request, Source};
pub use task::FloppyTask;

use thiserror::Error;

/// Ticks per second of the clock task.
pub const HZ: u32 = 60;

/// Wait for the motor to reach full speed.
pub const MOTORON_DELAY: u32 = HZ / 2;
/// Idle time before a running motor is shut off.
pub const MOTOROFF_DELAY: u32 = 3 * HZ;
/// Watchdog on a raw track read. One rotation is 200 ms; anything beyond
/// two seconds means the DMA will never finish (no sync on the track).
pub const ROTATION_DELAY: u32 = 2 * HZ;

/// Retry budget for transient media errors.
pub const MAX_RETRIES: u32 = 7;

/// Verbose per-sector diagnostics bit in the loader `debug` argument.
pub const DEBUG_VERBOSE: u32 = 1 << 30;

/// Arguments handed over by the boot loader. Only three of the 26 letter
/// slots concern the floppy driver.
#[derive(Clone, Copy, Debug)]
pub struct LoaderArgs {
    /// `-d`: debug bitmask.
    pub debug: u32,
    /// `-r`: head step interval in tenths of a microsecond.
    pub step_rate: u32,
    /// `-t`: CIA E-clock frequency in Hz.
    pub cia_hz: u32,
}

impl Default for LoaderArgs {
    fn default() -> Self {
        Self {
            debug: 0,
            step_rate: 30_000, // 3 ms per step
            cia_hz: 715_909,   // NTSC E-clock
        }
    }
}

impl LoaderArgs {
    /// CIA timer counts per head step.
    #[must_use]
    pub fn step_timer_counts(&self) -> u16 {
        (self.cia_hz / 1000 * self.step_rate / 10_000) as u16
    }
}

/// Reply codes of the floppy task. The numeric values are the wire
/// contract with the file system.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum FloppyError {
    #[error("no such drive")]
    NoDrive,
    #[error("bad request arguments")]
    BadArgs,
    #[error("no sync mark found")]
    Sync,
    #[error("disk DMA failed")]
    Dma,
    #[error("no disk in drive")]
    NoDisk,
    #[error("sector header names another cylinder")]
    WrongCyl,
    #[error("disk is write-protected")]
    WrProt,
    #[error("CRC mismatch")]
    Crc,
    #[error("unreadable track")]
    BadDisk,
    #[error("operation timed out")]
    Timeout,
    #[error("seek failed")]
    BadSeek,
}

impl FloppyError {
    /// Map a negative reply status back to the error it encodes.
    #[must_use]
    pub fn from_code(code: i32) -> Option<Self> {
        [
            FloppyError::NoDrive,
            FloppyError::BadArgs,
            FloppyError::Sync,
            FloppyError::Dma,
            FloppyError::NoDisk,
            FloppyError::WrongCyl,
            FloppyError::WrProt,
            FloppyError::Crc,
            FloppyError::BadDisk,
            FloppyError::Timeout,
            FloppyError::BadSeek,
        ]
        .into_iter()
        .find(|e| e.code() == code)
    }

    /// The negative status code sent in the reply message.
    #[must_use]
    pub fn code(self) -> i32 {
        match self {
            FloppyError::NoDrive => -1,
            FloppyError::BadArgs => -2,
            FloppyError::Sync => -3,
            FloppyError::Dma => -4,
            FloppyError::NoDisk => -5,
            FloppyError::WrongCyl => -6,
            FloppyError::WrProt => -7,
            FloppyError::Crc => -8,
            FloppyError::BadDisk => -9,
            FloppyError::Timeout => -10,
            FloppyError::BadSeek => -11,
        }
    }
}

/// Lifetime counters, readable for diagnostics.
#[derive(Clone, Copy, Debug, Default)]
pub struct Stats {
    /// Head recalibrations after a cylinder mismatch.
    pub recalibrations: u64,
    /// Unrecoverable CRC failures (retry budget exhausted).
    pub header_crc_errors: u64,
    /// Individual sector CRC mismatches, including recovered ones.
    pub data_crc_errors: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_match_the_reply_contract() {
        assert_eq!(FloppyError::NoDrive.code(), -1);
        assert_eq!(FloppyError::WrProt.code(), -7);
        assert_eq!(FloppyError::Crc.code(), -8);
        assert_eq!(FloppyError::BadSeek.code(), -11);
    }

    #[test]
    fn default_step_timer_rate() {
        // 715 kHz E-clock at 3 ms per step.
        assert_eq!(LoaderArgs::default().step_timer_counts(), 2145);
    }
}
