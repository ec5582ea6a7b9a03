//! Sector-level operations on the track cache.
//!
//! Reads decode straight out of the cached raw track. Writes only ever
//! touch the buffer; the disk sees them when the buffer is flushed on the
//! next seek away, on motor-off, or by the deferred flush. Because a
//! flush rewrites the *whole* track, a write must first prove that every
//! neighbouring sector in the buffer still carries a good CRC, otherwise
//! a corruption picked up at capture time would be burned onto the disk.

use log::{debug, warn};
use util::{Sector, SECTOR_SIZE};

use crate::ports::{IoKind, PhysAddr};
use crate::task::FloppyTask;
use crate::{FloppyError, MAX_RETRIES};

impl FloppyTask {
    /// Decode sector `st` from the cache buffer, recording the CRC
    /// verdict in the drive's bookkeeping.
    fn decode_sector(
        &mut self,
        d: usize,
        st: Sector,
        out: &mut [u8; SECTOR_SIZE],
    ) -> Result<(), FloppyError> {
        let verbose = self.verbose();
        let slot = &mut self.drives[d];
        let tb = slot.buf.as_ref().expect("connected drive without track buffer");
        match tb.read_sector(st, out) {
            Ok(()) => {
                slot.checked |= 1 << st.0;
                Ok(())
            }
            Err(e) => {
                self.stats.data_crc_errors += 1;
                if verbose {
                    debug!(
                        "fd{} (cyl {}, side {}): CRC error in sector {}: {:#06x} should be {:#06x}",
                        d, slot.cyl, slot.side, st.0 + 1, e.stored, e.computed
                    );
                }
                Err(FloppyError::Crc)
            }
        }
    }

    /// Read one sector to the caller's memory, re-reading the whole
    /// track on a CRC mismatch until the retry budget runs out.
    pub(crate) fn read_block(
        &mut self,
        d: usize,
        st: Sector,
        address: PhysAddr,
    ) -> Result<(), FloppyError> {
        if !self.drives[d].valid {
            warn!(
                "fd{} (cyl {}, side {}): read_block on an invalid buffer",
                d, self.drives[d].cyl, self.drives[d].side
            );
        }

        let mut data = [0u8; SECTOR_SIZE];
        let mut result = self.decode_sector(d, st, &mut data);
        let mut retries = MAX_RETRIES;
        while result.is_err() && retries > 0 {
            retries -= 1;
            self.rdwt_track(d, IoKind::Read)?;
            result = self.decode_sector(d, st, &mut data);
        }
        if result.is_err() {
            self.stats.header_crc_errors += 1;
            warn!(
                "fd{} (cyl {}, side {}): unrecoverable read error on sector {}",
                d, self.drives[d].cyl, self.drives[d].side, st.0 + 1
            );
            return result;
        }

        self.kernel.phys_write(address, &data);
        Ok(())
    }

    /// CRC-verify every sector that has not been vouched for since the
    /// last capture, except `skip`, the one about to be overwritten.
    fn verify_track(&mut self, d: usize, skip: Sector) -> Result<(), FloppyError> {
        let mut scratch = [0u8; SECTOR_SIZE];
        for st in 0..util::NR_SECTORS as u8 {
            if st == skip.0 {
                continue;
            }
            if self.drives[d].checked & (1 << st) == 0 {
                self.decode_sector(d, Sector(st), &mut scratch)?;
            }
        }
        Ok(())
    }

    /// Stage one sector into the cache buffer and mark it dirty.
    ///
    /// The rest of the track is CRC-verified first (with the usual
    /// re-read loop); if that fails the write is refused and the sector
    /// is *not* dirtied, keeping buffer and disk consistent.
    pub(crate) fn write_block(
        &mut self,
        d: usize,
        st: Sector,
        address: PhysAddr,
    ) -> Result<(), FloppyError> {
        if !self.drives[d].all_checked() {
            let mut result = self.verify_track(d, st);
            let mut retries = MAX_RETRIES;
            while result.is_err() && retries > 0 {
                retries -= 1;
                warn!(
                    "fd{} (cyl {}, side {}): bad CRC found on write, re-reading",
                    d, self.drives[d].cyl, self.drives[d].side
                );
                self.rdwt_track(d, IoKind::Read)?;
                result = self.verify_track(d, st);
            }
            if let Err(e) = result {
                self.stats.header_crc_errors += 1;
                warn!(
                    "fd{} (cyl {}, side {}): unrecoverable CRC error on write",
                    d, self.drives[d].cyl, self.drives[d].side
                );
                return Err(e);
            }
        }

        let mut data = [0u8; SECTOR_SIZE];
        self.kernel.phys_read(address, &mut data);
        let slot = &mut self.drives[d];
        slot.buf
            .as_mut()
            .expect("connected drive without track buffer")
            .put_sector(st, &data);
        slot.dirty |= 1 << st.0;
        // Our own encoding is CRC-consistent by construction.
        slot.checked |= 1 << st.0;
        Ok(())
    }
}
