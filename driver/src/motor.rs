//! Motor and head-seek control.
//!
//! Turning the motor off right after each request would cost a spin-up
//! delay on every access; leaving it on wears the diskette. So a finished
//! transfer arms a countdown instead, and the tick handler shuts the
//! motor off only if no new request showed up, flushing the track cache
//! first if the buffer still owes the disk a write-back, since a quiet
//! drive is the best moment for it.
//!
//! Motor state is latched inside the drive on the falling edge of its
//! select line, so every change is a short multi-line sequence on the
//! CIA-B peripheral register.

use log::{debug, warn};
use util::NR_DRIVES;

use crate::chip::{CiaA, CiaB};
use crate::drive::MOTOR_OFF;
use crate::ports::{AlarmKind, Events, IoKind, LineOp, Source};
use crate::task::{FloppyTask, SEEK_SETTLE};
use crate::{FloppyError, HZ, MOTORON_DELAY, MOTOROFF_DELAY};

impl FloppyTask {
    /// Latch the motor on and leave the drive selected. If the motor was
    /// off and `start_delay` ticks of spin-up are called for, arm the
    /// alarm and wait for `MOTOR_RUNNING`.
    pub(crate) fn start_motor(&mut self, d: usize, start_delay: i32) {
        let sel = self.drives[d].sel;
        self.port.control(LineOp::Set, sel);
        self.port.control(LineOp::Clear, CiaB::MOTOR);
        self.port.control(LineOp::Clear, sel);

        let needs_spin_up = self.drives[d].delay < 0 && start_delay > 0;
        self.drives[d].delay = 0;
        if needs_spin_up {
            self.kernel.set_alarm(start_delay as u32, AlarmKind::MotorSpinUp);
            self.rendezvous(Source::Clock, Events::MOTOR_RUNNING);
        }
    }

    /// Deselect and arm the motor-off countdown.
    pub(crate) fn stop_motor(&mut self, d: usize) {
        if self.drives[d].delay < 0 {
            warn!("fd{}: stop_motor with the motor already off", d);
        }
        let sel = self.drives[d].sel;
        self.port.control(LineOp::Set, sel);
        self.drives[d].delay = MOTOROFF_DELAY as i32;
    }

    /// Latch the motor off immediately.
    pub(crate) fn motor_off(&mut self, d: usize) {
        let sel = self.drives[d].sel;
        self.port.control(LineOp::Set, CiaB::MOTOR | sel);
        self.port.control(LineOp::Clear, sel);
        self.port.control(LineOp::Set, sel);
        self.drives[d].delay = MOTOR_OFF;
    }

    /// Clock tick: run the motor-off countdowns. A drive that reaches
    /// zero with a clean cache shuts off; a dirty one is queued for a
    /// deferred flush on the dispatcher's own thread of control; this
    /// runs in tick context and must not block.
    pub(crate) fn fd_timer(&mut self) {
        for d in 0..NR_DRIVES {
            if self.drives[d].delay > 0 {
                self.drives[d].delay -= 1;
                if self.drives[d].delay == 0 {
                    if self.drives[d].dirty == 0 {
                        self.motor_off(d);
                    } else {
                        self.to_flush |= 1 << d;
                        self.events.post(Events::DO_FLUSH);
                        // Motor stays on until the flush has happened.
                    }
                }
            }
        }
    }

    /// One cylinder up (`dir > 0`) or down, as an active-low pulse on the
    /// step line.
    fn movehead(&mut self, d: usize, dir: i32) {
        let sel = self.drives[d].sel;
        self.port.control(LineOp::Clear, sel);
        let dir_op = if dir > 0 { LineOp::Clear } else { LineOp::Set };
        self.port.control(dir_op, CiaB::DIREC);
        self.port.control(LineOp::Clear, CiaB::STEP);
        self.port.control(LineOp::Set, CiaB::STEP);
    }

    /// Step-timer interrupt entry: burn the settle pre-delay, then one
    /// step per fire until the offset is consumed, then stop the timer
    /// and post `SEEK_READY`.
    pub fn step_isr(&mut self) {
        self.seek.delay -= 1;
        if self.seek.delay > 0 {
            return;
        }
        let d = self.seek.drive;
        if self.seek.offset > 0 {
            self.movehead(d, 1);
            self.seek.offset -= 1;
        } else if self.seek.offset < 0 {
            self.movehead(d, -1);
            self.seek.offset += 1;
        } else {
            self.timer.stop();
            self.timer.disable_irq();
            self.events.post(Events::SEEK_READY);
        }
    }

    /// Position drive `d` on `(cyl, side)`. A dirty buffer is written
    /// back first, and the cache is invalidated before the head moves.
    /// Short seeks overlap with motor spin-up: the stepping time is taken
    /// out of the spin-up allowance.
    pub(crate) fn seek(&mut self, d: usize, cyl: u8, side: u8) -> Result<(), FloppyError> {
        if self.drives[d].cyl == cyl && self.drives[d].side == side {
            return Ok(());
        }

        if self.drives[d].dirty != 0 {
            self.rdwt_track(d, IoKind::Write)?;
        }
        self.drives[d].valid = false;

        let offset = i32::from(cyl) - i32::from(self.drives[d].cyl);
        self.seek.offset = offset;
        self.seek.delay = SEEK_SETTLE;
        self.seek.drive = d;

        let step_us = u64::from(self.args.step_rate / 10);
        let stepping_ticks =
            (u64::from(offset.unsigned_abs()) * step_us * u64::from(HZ) / 1_000_000) as i32;
        self.start_motor(d, MOTORON_DELAY as i32 - stepping_ticks);

        debug!("fd{}: seek {} -> {} (side {})", d, self.drives[d].cyl, cyl, side);
        self.timer.enable_irq();
        self.timer.start();
        self.rendezvous(Source::Hardware, Events::SEEK_READY);

        self.drives[d].wr_prot = self.port.status() & CiaA::WPROT == 0;
        self.drives[d].cyl = cyl;
        self.drives[d].side = side;
        Ok(())
    }
}
