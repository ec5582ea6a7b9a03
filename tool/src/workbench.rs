//! Disk images mounted behind the real driver stack.
//!
//! Every tool command goes through the floppy task proper (seeks, track
//! cache, MFM codec, deferred flushes) with the image files standing in
//! for the media. What survives a command is whatever the driver actually
//! flushed to the simulated disks.

use amfloppy::sim::{boot, SimDisk, SimHandle};
use amfloppy::{FloppyError, FloppyTask, LoaderArgs};
use anyhow::{bail, Context, Result};
use util::{NR_CYLINDERS, NR_SECTORS, NR_SIDES, SECTOR_SIZE};

/// Minor device numbers of the two double sided drives.
pub const DD0: u8 = 8;
pub const DD1: u8 = 9;

pub const DISK_BYTES: usize = NR_CYLINDERS * NR_SIDES * NR_SECTORS * SECTOR_SIZE;

/// Ticks to let deferred flushes and motor shutoff run their course.
const SETTLE_TICKS: u32 = 4 * 60;

pub struct Workbench {
    task: FloppyTask,
    sim: SimHandle,
}

fn status_err(status: i32) -> anyhow::Error {
    match FloppyError::from_code(status) {
        Some(e) => anyhow::Error::new(e),
        None => anyhow::anyhow!("unknown driver status {status}"),
    }
}

impl Workbench {
    /// Mount up to two 720K images in drives 0 and 1.
    pub fn new(drive0: Option<&[u8]>, drive1: Option<&[u8]>) -> Self {
        let (task, sim) = boot(LoaderArgs::default(), [true, true, false, false]);
        if let Some(image) = drive0 {
            sim.insert_disk(0, SimDisk::from_image(image, NR_SIDES));
        }
        if let Some(image) = drive1 {
            sim.insert_disk(1, SimDisk::from_image(image, NR_SIDES));
        }
        Self { task, sim }
    }

    pub fn read(&mut self, device: u8, offset: u64, count: u32) -> Result<Vec<u8>> {
        let (status, data) = self.sim.disk_read(&mut self.task, device, offset, count);
        if status < 0 {
            return Err(status_err(status))
                .with_context(|| format!("reading {count} bytes at offset {offset}"));
        }
        if status as u32 != count {
            bail!("short read at offset {offset}: {status} of {count} bytes");
        }
        Ok(data)
    }

    pub fn write(&mut self, device: u8, offset: u64, data: &[u8]) -> Result<()> {
        let status = self.sim.disk_write(&mut self.task, device, offset, data);
        if status < 0 {
            return Err(status_err(status))
                .with_context(|| format!("writing {} bytes at offset {offset}", data.len()));
        }
        if status as usize != data.len() {
            bail!("short write at offset {offset}: {status} of {} bytes", data.len());
        }
        Ok(())
    }

    /// Let the motor-off countdowns expire so every staged write reaches
    /// the medium.
    pub fn settle(&mut self) {
        self.sim.elapse_ticks(&mut self.task, SETTLE_TICKS);
    }

    /// The medium of `drive` as a flat image, after settling.
    pub fn export(&mut self, drive: usize) -> Result<Vec<u8>> {
        self.settle();
        self.sim
            .disk_image(drive)
            .context("no disk in the drive to export")
    }
}
