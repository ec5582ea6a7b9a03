//! Per-drive state.

use util::{Sector, ALL_SECTORS, NR_CYLINDERS};

use crate::chip::CiaB;
use crate::trackbuf::TrackBuf;

/// Motor-off countdown states; see [`DriveSlot::delay`].
pub const MOTOR_OFF: i32 = -1;

/// One physical drive on the bus.
///
/// The slot owns the drive's raw track buffer and the bookkeeping that
/// makes the track cache safe: `valid` says the buffer mirrors the disk
/// at `(cyl, side)`, `dirty` marks sectors staged for write-back, and
/// `checked` marks sectors whose CRC has been verified since the last
/// capture. `dirty != 0` implies `valid` at all times.
pub struct DriveSlot {
    pub num: u8,
    /// CIA-B select line for this drive, active low.
    pub sel: u8,
    /// Established once at init by the ready-line probe. An unconnected
    /// slot has no buffer and fails every request.
    pub connected: bool,
    pub cyl: u8,
    pub side: u8,
    pub valid: bool,
    pub dirty: u16,
    pub checked: u16,
    pub wr_prot: bool,
    /// Motor-off countdown in ticks: [`MOTOR_OFF`] = motor off, `0` =
    /// running with no shutoff pending, `> 0` = shuts off after that many
    /// ticks.
    pub delay: i32,
    pub buf: Option<TrackBuf>,
}

impl DriveSlot {
    #[must_use]
    pub fn new(num: u8) -> Self {
        Self {
            num,
            sel: CiaB::SEL0 << num,
            connected: false,
            // Past the last cylinder: the first seek steps against the
            // track-0 stop and recalibration sorts out the rest.
            cyl: NR_CYLINDERS as u8,
            side: 0,
            valid: false,
            dirty: 0,
            checked: 0,
            wr_prot: false,
            delay: MOTOR_OFF,
            buf: None,
        }
    }

    #[must_use]
    pub fn is_dirty(&self, st: Sector) -> bool {
        self.dirty & (1 << st.0) != 0
    }

    #[must_use]
    pub fn all_checked(&self) -> bool {
        self.checked == ALL_SECTORS
    }

    /// Drop every claim the cache makes about the medium. Used on disk
    /// change and after failed captures; any staged writes are gone with
    /// the disk they belonged to.
    pub fn invalidate(&mut self) {
        self.valid = false;
        self.dirty = 0;
        self.checked = 0;
    }
}
