//! Whole-track transfers: one raw DMA read or write per call, plus the
//! reassembly that turns a rotated capture into the canonical buffer.

use log::{debug, warn};
use util::mfm;
use util::{Sector, NR_SECTORS};

use crate::chip::CiaB;
use crate::ports::{AlarmKind, Events, IoKind, LineOp, Precomp, Source};
use crate::task::FloppyTask;
use crate::trackbuf::{
    TrackBuf, D_SIZE, H_CYLINDER, H_SECTOR, H_SIDE, H_SIZE, GAP3_SIZE,
};
use crate::{FloppyError, MAX_RETRIES, MOTORON_DELAY, ROTATION_DELAY};

/// Bit-shift compensation kicks in on the inner cylinders.
fn precomp_for(cyl: u8) -> Precomp {
    if cyl > 39 {
        Precomp::Ns140
    } else {
        Precomp::None
    }
}

impl FloppyTask {
    /// Capture one full raw track into the scratch buffer and reassemble
    /// it into drive `d`'s cache buffer.
    ///
    /// The DMA starts at the first sync mark it sees and a track without
    /// syncs never finishes, so the rotation watchdog guards the wait.
    pub(crate) fn read_track(&mut self, d: usize) -> Result<(), FloppyError> {
        self.dma.set_sync(mfm::SYNC_WORD);
        self.dma.configure(precomp_for(self.drives[d].cyl), true);

        debug_assert!(!self.busy, "overlapping disk DMA");
        self.busy = true;
        self.dma.start_read(&mut self.readbuf);
        self.kernel.set_alarm(ROTATION_DELAY, AlarmKind::Watchdog);

        self.dma.enable_irq();
        self.rendezvous(Source::Any, Events::DMA_READY | Events::TIMED_OUT);
        self.dma.disable_irq();
        self.kernel.cancel_alarm();
        self.dma.stop();
        self.busy = false;

        if self.events.take(Events::DMA_READY) {
            self.events.take(Events::TIMED_OUT);
            return self.adjust_buffer(d);
        }
        if self.events.take(Events::TIMED_OUT) {
            warn!(
                "fd{} (cyl {}, side {}): raw read timed out",
                d, self.drives[d].cyl, self.drives[d].side
            );
            return Err(FloppyError::Dma);
        }
        warn!("fd{}: raw read finished with no event", d);
        Err(FloppyError::Dma)
    }

    /// Write drive `d`'s whole buffer, wipe prefix included, starting
    /// at the current rotational position. A write is only ever issued
    /// after a successful read, so the disk is known spinning and no
    /// watchdog is needed.
    pub(crate) fn write_track(&mut self, d: usize) -> Result<(), FloppyError> {
        self.dma.configure(precomp_for(self.drives[d].cyl), false);

        debug_assert!(!self.busy, "overlapping disk DMA");
        self.busy = true;
        let buf = self.drives[d]
            .buf
            .as_ref()
            .expect("connected drive without track buffer");
        self.dma.start_write(buf.words());
        self.dma.enable_irq();
        self.rendezvous(Source::Hardware, Events::DMA_READY);
        self.dma.disable_irq();
        self.events.take(Events::DMA_READY);
        self.dma.stop();
        self.busy = false;
        Ok(())
    }

    /// Copy the rotated capture into canonical sector slots.
    ///
    /// The capture starts wherever the first sync happened to be, so the
    /// sectors arrive in an order like `4 5 6 7 8 9 1 2 3`. Sectors with
    /// implausible numbers, a wrong side, or a duplicate appearance are
    /// skipped. Headers claiming another cylinder are counted: if the
    /// whole track agrees on a different cylinder the head is lost: adopt
    /// the observed position, re-seek, and let the caller retry.
    fn adjust_buffer(&mut self, d: usize) -> Result<(), FloppyError> {
        let expected_cyl = self.drives[d].cyl;
        let expected_side = self.drives[d].side;
        let verbose = self.verbose();

        let mut found = [false; NR_SECTORS];
        let mut count = 0usize;
        let mut nwrong = 0u32;
        let mut track_prev = expected_cyl;

        // A fresh capture invalidates every earlier CRC verdict.
        self.drives[d].checked = 0;

        {
            let readbuf = &self.readbuf[..];
            let len = readbuf.len();
            let tb = self.drives[d]
                .buf
                .as_mut()
                .expect("connected drive without track buffer");

            let mut offset = 0usize;
            while offset < len && count < NR_SECTORS {
                while offset < len && readbuf[offset] != mfm::SYNC_WORD {
                    offset += 1;
                }
                while offset < len && readbuf[offset] == mfm::SYNC_WORD {
                    offset += 1;
                }
                if offset >= len {
                    break;
                }
                if readbuf[offset] != mfm::HEADER_ID_WORD {
                    continue;
                }
                let hdr = offset;
                if hdr + H_SIZE > len {
                    break;
                }

                let st = i32::from(mfm::decode_word(readbuf[hdr + H_SECTOR])) - 1;
                if st < 0 || st >= NR_SECTORS as i32 {
                    if verbose {
                        debug!("fd{}: sector {} found", d, st + 1);
                    }
                    continue;
                }
                let st = st as usize;
                if mfm::decode_word(readbuf[hdr + H_SIDE]) != expected_side {
                    warn!(
                        "fd{}: side inconsistency: found {}",
                        d,
                        mfm::decode_word(readbuf[hdr + H_SIDE])
                    );
                    continue;
                }
                offset += H_SIZE + GAP3_SIZE;

                while offset < len && readbuf[offset] != mfm::SYNC_WORD {
                    offset += 1;
                }
                while offset < len && readbuf[offset] == mfm::SYNC_WORD {
                    offset += 1;
                }
                if offset >= len || offset + D_SIZE > len {
                    break;
                }
                if readbuf[offset] != mfm::DATA_ID_WORD {
                    continue;
                }
                if found[st] {
                    if verbose {
                        debug!("fd{}: sector {} found twice", d, st + 1);
                    }
                    continue;
                }
                found[st] = true;
                count += 1;

                let h_dst = TrackBuf::header_off(Sector(st as u8));
                tb.words_mut()[h_dst..h_dst + H_SIZE]
                    .copy_from_slice(&readbuf[hdr..hdr + H_SIZE]);
                let d_dst = TrackBuf::data_off(Sector(st as u8));
                tb.words_mut()[d_dst..d_dst + D_SIZE]
                    .copy_from_slice(&readbuf[offset..offset + D_SIZE]);

                offset += D_SIZE;
                let track_now = mfm::decode_word(readbuf[hdr + H_CYLINDER]);
                if track_now != track_prev {
                    nwrong += 1;
                    track_prev = track_now;
                }
            }
        }

        if count < NR_SECTORS {
            if verbose {
                debug!("fd{}: {} sectors found", d, count);
            }
            let tb = self.drives[d]
                .buf
                .as_mut()
                .expect("connected drive without track buffer");
            for st in 0..NR_SECTORS {
                if !found[st] {
                    tb.poison_sector(Sector(st as u8));
                }
            }
            return Err(FloppyError::BadDisk);
        }

        if nwrong > 0 {
            self.stats.recalibrations += 1;
            warn!(
                "fd{}: recalibrating, {} header disagreements, head was on {} not {}",
                d, nwrong, track_prev, expected_cyl
            );
            self.drives[d].cyl = track_prev;
            self.seek(d, expected_cyl, expected_side)?;
            return Err(FloppyError::WrongCyl);
        }
        Ok(())
    }

    /// Read or write one raw track with the standard retry loop, wrapped
    /// in motor start/stop and side selection.
    pub(crate) fn rdwt_track(&mut self, d: usize, acc: IoKind) -> Result<(), FloppyError> {
        if acc == IoKind::Read {
            self.drives[d].valid = false;
        }

        self.start_motor(d, MOTORON_DELAY as i32);
        let side_op = if self.drives[d].side == 0 {
            LineOp::Set
        } else {
            LineOp::Clear
        };
        self.port.control(side_op, CiaB::SIDE);

        // One initial try plus MAX_RETRIES retries.
        let mut result = Ok(());
        for attempt in 0..=MAX_RETRIES {
            result = match acc {
                IoKind::Read => self.read_track(d),
                IoKind::Write => self.write_track(d),
            };
            match result {
                Ok(()) => break,
                Err(e) => debug!(
                    "fd{} (cyl {}, side {}): track {:?} attempt {} failed: {}",
                    d,
                    self.drives[d].cyl,
                    self.drives[d].side,
                    acc,
                    attempt + 1,
                    e
                ),
            }
        }
        self.stop_motor(d);

        match acc {
            IoKind::Read => self.drives[d].valid = result.is_ok(),
            IoKind::Write => {
                if result.is_err() {
                    self.drives[d].valid = false;
                }
            }
        }
        self.drives[d].dirty = 0;
        result
    }
}
