//! The floppy task: one logical thread of control serving request
//! messages, with interrupts and timers folded in through the event
//! rendezvous.

use std::collections::VecDeque;

use log::{debug, warn};
use util::geometry;
use util::{NR_DRIVES, SECTOR_SIZE};

use crate::chip::{CiaA, CiaB};
use crate::drive::DriveSlot;
use crate::ports::{
    AlarmKind, DiskDmaPort, DrivePort, EventBoard, Events, IntSource, IoKind, IovEntry,
    KernelPort, LineOp, Message, PhysAddr, Request, Source, StepTimerPort,
};
use crate::trackbuf::RAW_T_SIZE;
use crate::{FloppyError, LoaderArgs, Stats, DEBUG_VERBOSE};

/// Head-stepping state shared with the step-timer interrupt entry.
pub(crate) struct SeekState {
    /// Signed cylinders still to go.
    pub offset: i32,
    /// Settle fires burned before the first pulse.
    pub delay: i32,
    pub drive: usize,
}

/// Timer fires spent letting the mechanics settle before stepping.
pub(crate) const SEEK_SETTLE: i32 = 4;

/// Upper bound on one scattered-I/O vector.
const MAX_IOV_ENTRIES: u32 = 64;

pub struct FloppyTask {
    pub(crate) kernel: Box<dyn KernelPort>,
    pub(crate) dma: Box<dyn DiskDmaPort>,
    pub(crate) port: Box<dyn DrivePort>,
    pub(crate) timer: Box<dyn StepTimerPort>,
    pub(crate) events: EventBoard,
    pub(crate) drives: [DriveSlot; NR_DRIVES],
    pub(crate) to_flush: u8,
    pub(crate) seek: SeekState,
    pub(crate) stats: Stats,
    pub(crate) args: LoaderArgs,
    /// Scratch capture buffer the read DMA fills.
    pub(crate) readbuf: Vec<u16>,
    /// Requests that arrived while a rendezvous was waiting for hardware.
    pending: VecDeque<Request>,
    /// One outstanding hardware operation across all drives.
    pub(crate) busy: bool,
}

impl FloppyTask {
    /// Bring up the driver: probe the bus, allocate track buffers for
    /// connected drives, park their motors and program the step timer.
    #[must_use]
    pub fn new(
        kernel: Box<dyn KernelPort>,
        dma: Box<dyn DiskDmaPort>,
        port: Box<dyn DrivePort>,
        timer: Box<dyn StepTimerPort>,
        events: EventBoard,
        args: LoaderArgs,
    ) -> Self {
        let mut task = Self {
            kernel,
            dma,
            port,
            timer,
            events,
            drives: core::array::from_fn(|i| DriveSlot::new(i as u8)),
            to_flush: 0,
            seek: SeekState {
                offset: 0,
                delay: 0,
                drive: 0,
            },
            stats: Stats::default(),
            args,
            readbuf: vec![0u16; RAW_T_SIZE],
            pending: VecDeque::new(),
            busy: false,
        };

        let step_counts = task.args.step_timer_counts();
        task.timer.set_period(step_counts);

        for d in 0..NR_DRIVES {
            if task.probe_connected(d) {
                task.drives[d].connected = true;
                task.drives[d].buf = Some(crate::trackbuf::TrackBuf::new());
                task.motor_off(d);
                let sel = task.drives[d].sel;
                task.port.control(LineOp::Set, sel);
            }
        }
        task
    }

    /// Serve messages forever.
    pub fn run(&mut self) -> ! {
        loop {
            self.poll();
        }
    }

    /// One main-loop iteration: receive, dispatch, reply, then run any
    /// deferred flushes on this thread of control.
    pub fn poll(&mut self) {
        let msg = match self.pending.pop_front() {
            Some(req) => Message::Request(req),
            None => self.kernel.receive(Source::Any),
        };
        match msg {
            Message::Request(req) => {
                let status = self.serve(&req);
                self.kernel.reply(req.caller(), req.proc_nr(), status);
            }
            other => self.dispatch_async(&other),
        }
        if self.to_flush != 0 {
            self.do_flush();
        }
    }

    fn serve(&mut self, req: &Request) -> i32 {
        match *req {
            Request::Transfer {
                kind,
                proc_nr,
                device,
                count,
                position,
                address,
                ..
            } => {
                let (bytes, err) = self.do_span(kind, device, proc_nr, position, address, count);
                finish(bytes, err)
            }
            Request::Scattered {
                proc_nr,
                device,
                count,
                address,
                ..
            } => self.do_vrdwt(device, proc_nr, count, address),
        }
    }

    /// Transfer `count` bytes sector by sector, stopping at the first
    /// error. Returns the bytes moved and the error that stopped the run.
    fn do_span(
        &mut self,
        kind: IoKind,
        device: u8,
        proc_nr: u32,
        position: u64,
        address: u32,
        count: u32,
    ) -> (u32, Option<FloppyError>) {
        if count == 0 {
            return (0, None);
        }
        if count % SECTOR_SIZE as u32 != 0 {
            return (0, Some(FloppyError::BadArgs));
        }
        let Some(base) = self.kernel.umap(proc_nr, address, count) else {
            return (0, Some(FloppyError::BadArgs));
        };

        let mut nbytes = 0u32;
        while nbytes < count {
            let pos = position + u64::from(nbytes);
            if let Err(e) = self.transfer_sector(kind, device, pos, base.offset(nbytes)) {
                return (nbytes, Some(e));
            }
            nbytes += SECTOR_SIZE as u32;
        }
        (nbytes, None)
    }

    fn transfer_sector(
        &mut self,
        kind: IoKind,
        device: u8,
        position: u64,
        phys: PhysAddr,
    ) -> Result<(), FloppyError> {
        let chs = geometry::locate(device, position).ok_or(FloppyError::BadArgs)?;
        let d = usize::from(chs.drive);
        if !self.drives[d].connected {
            return Err(FloppyError::NoDrive);
        }

        if self.disk_changed(d) {
            warn!(
                "fd{} (cyl {}, side {}): disk changed, dropping cache",
                d, self.drives[d].cyl, self.drives[d].side
            );
            self.drives[d].invalidate();
        }
        if kind == IoKind::Write && self.drives[d].wr_prot {
            warn!("fd{}: drive is write-protected", d);
            return Err(FloppyError::WrProt);
        }

        self.seek(d, chs.cyl.0, chs.side.0)?;
        if !self.drives[d].valid {
            self.rdwt_track(d, IoKind::Read)?;
        }
        match kind {
            IoKind::Read => self.read_block(d, chs.sector, phys),
            IoKind::Write => self.write_block(d, chs.sector, phys),
        }
    }

    /// `SCATTERED_IO`: fetch the request vector from the caller and run
    /// every entry through the sector loop.
    fn do_vrdwt(&mut self, device: u8, proc_nr: u32, count: u32, address: u32) -> i32 {
        if count == 0 || count > MAX_IOV_ENTRIES {
            return FloppyError::BadArgs.code();
        }
        let iov_bytes = count as usize * IovEntry::BYTES;
        let Some(iov_phys) = self.kernel.umap(proc_nr, address, iov_bytes as u32) else {
            return FloppyError::BadArgs.code();
        };
        let mut raw = vec![0u8; iov_bytes];
        self.kernel.phys_read(iov_phys, &mut raw);

        let mut total = 0u32;
        let mut failure = None;
        for chunk in raw.chunks_exact(IovEntry::BYTES) {
            let Some(entry) = IovEntry::parse(chunk) else {
                failure = Some(FloppyError::BadArgs);
                break;
            };
            let (bytes, err) = self.do_span(
                entry.kind,
                device,
                proc_nr,
                u64::from(entry.position),
                entry.address,
                entry.nbytes,
            );
            total += bytes;
            if err.is_some() {
                failure = err;
                break;
            }
        }
        finish(total, failure)
    }

    /// Write back every drive recorded in `to_flush`, then arm their
    /// motors to stop on the next tick.
    pub(crate) fn do_flush(&mut self) {
        self.events.take(Events::DO_FLUSH);
        let pending = std::mem::take(&mut self.to_flush);
        for d in 0..NR_DRIVES {
            if pending & (1 << d) == 0 {
                continue;
            }
            if let Err(e) = self.rdwt_track(d, IoKind::Write) {
                warn!(
                    "fd{} (cyl {}, side {}): deferred flush failed: {}",
                    d, self.drives[d].cyl, self.drives[d].side, e
                );
            }
            self.drives[d].delay = 1;
        }
    }

    /// Block until one of `mask` is posted by a message from `src`.
    ///
    /// Only the awaited bits are cleared on entry; anything else that was
    /// posted while we were not looking stays posted. Requests arriving
    /// in the meantime are parked for the main loop.
    pub(crate) fn rendezvous(&mut self, src: Source, mask: Events) {
        self.events.clear(mask);
        while !self.events.any(mask) {
            let msg = self.kernel.receive(src);
            self.dispatch_async(&msg);
        }
    }

    fn dispatch_async(&mut self, msg: &Message) {
        match msg {
            Message::Request(req) => self.pending.push_back(*req),
            Message::Interrupt(IntSource::DiskBlock) => self.events.post(Events::DMA_READY),
            Message::Interrupt(IntSource::StepTimer) => self.step_isr(),
            Message::Interrupt(IntSource::Index) => {
                // The index-synchronized write path is not built; a stray
                // pulse is a wiring fault, not a reason to die.
                warn!("unexpected index interrupt");
            }
            Message::Alarm(AlarmKind::MotorSpinUp) => self.events.post(Events::MOTOR_RUNNING),
            Message::Alarm(AlarmKind::Watchdog) => self.events.post(Events::TIMED_OUT),
            Message::Tick => self.fd_timer(),
        }
    }

    /// See if a drive is actually on the bus: latch its motor on and off
    /// again, then clock out the 32-bit identification on the ready line.
    /// A present double-density drive answers all zeroes.
    fn probe_connected(&mut self, d: usize) -> bool {
        if d == 0 {
            return true;
        }
        let sel = self.drives[d].sel;

        self.port.control(LineOp::Set, sel);
        self.port.control(LineOp::Clear, CiaB::MOTOR);
        self.port.control(LineOp::Clear, sel);

        self.port.control(LineOp::Set, sel | CiaB::MOTOR);
        self.port.control(LineOp::Clear, sel);

        let mut id: u32 = 0;
        for _ in 0..32 {
            self.port.control(LineOp::Clear, sel);
            id <<= 1;
            if self.port.status() & CiaA::RDY != 0 {
                id |= 1;
            }
            self.port.control(LineOp::Set, sel);
        }
        id == 0
    }

    /// Poll the change line of drive `d`, refreshing `wr_prot` along the
    /// way.
    pub(crate) fn disk_changed(&mut self, d: usize) -> bool {
        let sel = self.drives[d].sel;
        self.port.control(LineOp::Set, sel);
        let motor_op = if self.drives[d].delay > 0 {
            LineOp::Clear
        } else {
            LineOp::Set
        };
        self.port.control(motor_op, CiaB::MOTOR);
        self.port.control(LineOp::Clear, sel);
        let status = self.port.status();
        self.drives[d].wr_prot = status & CiaA::WPROT == 0;
        self.port.control(LineOp::Set, sel);
        status & CiaA::CHANGE == 0
    }

    pub(crate) fn verbose(&self) -> bool {
        self.args.debug & DEBUG_VERBOSE != 0
    }

    // Introspection for diagnostics and the test-suite.

    #[must_use]
    pub fn drive(&self, d: usize) -> &DriveSlot {
        &self.drives[d]
    }

    #[must_use]
    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    #[must_use]
    pub fn flush_pending(&self) -> u8 {
        self.to_flush
    }

    #[must_use]
    pub fn events(&self) -> &EventBoard {
        &self.events
    }
}

/// Fold a partial transfer and its stopping error into a reply status:
/// the byte count if anything moved, the error code otherwise.
fn finish(bytes: u32, err: Option<FloppyError>) -> i32 {
    if bytes > 0 {
        bytes as i32
    } else {
        match err {
            Some(e) => {
                debug!("request failed: {e}");
                e.code()
            }
            None => 0,
        }
    }
}
