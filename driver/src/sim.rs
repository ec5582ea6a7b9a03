//! An image-backed model of the disk subsystem.
//!
//! Implements all four port traits over one shared state and a virtual
//! clock: disks are per-track raw MFM images, select/motor latching
//! follows the real CIA edge behavior, and DMA completions, alarms,
//! step-timer fires and clock ticks are delivered as messages whenever
//! the task blocks in its rendezvous. Time only moves while the driver
//! waits, so every run is deterministic: a motor-off countdown "takes"
//! three seconds without anyone sleeping.
//!
//! The tools run the whole driver stack against image files through this
//! model; the integration tests use it to script media faults.

use std::cell::RefCell;
use std::collections::{BinaryHeap, VecDeque};
use std::cmp::Reverse;
use std::rc::Rc;

use log::trace;
use util::mfm;
use util::{Sector, NR_CYLINDERS, NR_SECTORS, SECTOR_SIZE};

use crate::chip::{CiaA, CiaB};
use crate::ports::{
    AlarmKind, DiskDmaPort, DrivePort, EventBoard, IntSource, IovEntry, IoKind, KernelPort,
    LineOp, Message, PhysAddr, Precomp, Request, Source, StepTimerPort,
};
use crate::task::FloppyTask;
use crate::trackbuf::{TrackBuf, D_DATA, D_OFFSET, RAW_S_SIZE, WIPE_SIZE};
use crate::{LoaderArgs, HZ};

/// Words of one canonical track on the medium (the nine sector slots,
/// without the wipe prefix).
const TRACK_WORDS: usize = RAW_S_SIZE * NR_SECTORS;

const TICK_US: u64 = 1_000_000 / HZ as u64;
/// A capture takes most of a rotation.
const READ_DMA_US: u64 = 150_000;
/// A track write covers a full rotation plus the wipe run.
const WRITE_DMA_US: u64 = 220_000;
/// Virtual-time budget for a single blocking receive; a driver that
/// waits longer than this has lost an event.
const HANG_LIMIT_US: u64 = 30_000_000;

/// Caller and process id the request helpers use.
const CALLER: u32 = 1;
const PROC_NR: u32 = 42;
/// Scratch window in simulated user memory for the request helpers.
const SCRATCH: u32 = 0x1_0000;
const IOV_ADDR: u32 = 0x8000;
const USER_MEM: usize = 1 << 20;

/// One diskette: raw MFM tracks plus the mechanical status lines.
pub struct SimDisk {
    sides: usize,
    tracks: Vec<Vec<u16>>,
    pub write_protected: bool,
}

impl SimDisk {
    /// A freshly formatted blank diskette.
    #[must_use]
    pub fn blank(sides: usize) -> Self {
        Self::from_image(
            &vec![0u8; NR_CYLINDERS * sides * NR_SECTORS * SECTOR_SIZE],
            sides,
        )
    }

    /// Build a diskette from a flat sector image (360K for one side,
    /// 720K for two). The image is padded with zeroes if short.
    #[must_use]
    pub fn from_image(bytes: &[u8], sides: usize) -> Self {
        let mut image = bytes.to_vec();
        image.resize(NR_CYLINDERS * sides * NR_SECTORS * SECTOR_SIZE, 0);

        let mut tracks = Vec::with_capacity(NR_CYLINDERS * sides);
        for cyl in 0..NR_CYLINDERS {
            for side in 0..sides {
                let mut tb = TrackBuf::new();
                for st in 0..NR_SECTORS {
                    tb.format_sector(Sector(st as u8), cyl as u8, side as u8);
                    let block = (cyl * sides + side) * NR_SECTORS + st;
                    let mut payload = [0u8; SECTOR_SIZE];
                    payload
                        .copy_from_slice(&image[block * SECTOR_SIZE..(block + 1) * SECTOR_SIZE]);
                    tb.put_sector(Sector(st as u8), &payload);
                }
                tracks.push(tb.words()[WIPE_SIZE..WIPE_SIZE + TRACK_WORDS].to_vec());
            }
        }
        Self {
            sides,
            tracks,
            write_protected: false,
        }
    }

    /// Decode the medium back into a flat sector image. Sectors that no
    /// longer carry a good CRC come out zeroed.
    #[must_use]
    pub fn to_image(&self) -> Vec<u8> {
        let mut image = vec![0u8; NR_CYLINDERS * self.sides * NR_SECTORS * SECTOR_SIZE];
        for (idx, track) in self.tracks.iter().enumerate() {
            let mut tb = TrackBuf::new();
            tb.words_mut()[WIPE_SIZE..WIPE_SIZE + TRACK_WORDS].copy_from_slice(track);
            for st in 0..NR_SECTORS {
                let mut payload = [0u8; SECTOR_SIZE];
                if tb.read_sector(Sector(st as u8), &mut payload).is_ok() {
                    let block = idx * NR_SECTORS + st;
                    image[block * SECTOR_SIZE..(block + 1) * SECTOR_SIZE]
                        .copy_from_slice(&payload);
                }
            }
        }
        image
    }

    /// Flip a data bit of one sector so its CRC no longer matches.
    pub fn corrupt_sector(&mut self, cyl: u8, side: u8, sector: Sector) {
        let track = &mut self.tracks[usize::from(cyl) * self.sides + usize::from(side)];
        let off = usize::from(sector.0) * RAW_S_SIZE + D_OFFSET + D_DATA + 5;
        track[off] ^= 0x0004;
    }
}

struct DriveUnit {
    present: bool,
    disk: Option<SimDisk>,
    motor: bool,
    head_cyl: i32,
    changed: bool,
}

/// Hardware-activity counters for assertions.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SimCounters {
    pub track_reads: u64,
    pub track_writes: u64,
    pub step_pulses: u64,
}

/// A finished request reply.
#[derive(Clone, Copy, Debug)]
pub struct Reply {
    pub caller: u32,
    pub proc_nr: u32,
    pub status: i32,
}

#[derive(Clone, Copy, Debug)]
enum SimEvent {
    Tick,
    StepFire { gen: u64 },
    Alarm { gen: u64 },
    DmaDone { gen: u64 },
}

struct Scheduled {
    at: u64,
    seq: u64,
    ev: SimEvent,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        (self.at, self.seq) == (other.at, other.seq)
    }
}
impl Eq for Scheduled {}
impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.at, self.seq).cmp(&(other.at, other.seq))
    }
}

struct SimBus {
    now_us: u64,
    seq: u64,
    sched: BinaryHeap<Reverse<Scheduled>>,
    msgs: VecDeque<Message>,
    replies: Vec<Reply>,

    drives: [DriveUnit; util::NR_DRIVES],
    /// Current CIA-B PRB line levels; all lines are active low.
    prb: u8,
    rotation: usize,

    alarm_gen: u64,
    alarm: Option<(u64, AlarmKind)>,
    step_gen: u64,
    step_running: bool,
    step_period_us: u64,
    dma_gen: u64,

    counters: SimCounters,
    user_mem: Vec<u8>,
}

impl SimBus {
    fn schedule(&mut self, delay_us: u64, ev: SimEvent) {
        self.seq += 1;
        self.sched.push(Reverse(Scheduled {
            at: self.now_us + delay_us,
            seq: self.seq,
            ev,
        }));
    }

    fn selected_drive(&self) -> Option<usize> {
        (0..util::NR_DRIVES).find(|&i| self.prb & (CiaB::SEL0 << i) == 0)
    }

    fn side(&self) -> usize {
        usize::from(self.prb & CiaB::SIDE == 0)
    }

    fn lines_changed(&mut self, old: u8, new: u8) {
        let fell = old & !new;

        for i in 0..util::NR_DRIVES {
            let sel = CiaB::SEL0 << i;
            if fell & sel != 0 {
                // A falling select edge latches the motor line into the
                // drive.
                self.drives[i].motor = new & CiaB::MOTOR == 0;
            }
        }

        if fell & CiaB::STEP != 0 {
            let inward = new & CiaB::DIREC == 0;
            for i in 0..util::NR_DRIVES {
                let sel = CiaB::SEL0 << i;
                if new & sel != 0 || !self.drives[i].present {
                    continue;
                }
                let unit = &mut self.drives[i];
                unit.head_cyl += if inward { 1 } else { -1 };
                unit.head_cyl = unit.head_cyl.clamp(0, NR_CYLINDERS as i32 + 2);
                if unit.disk.is_some() {
                    unit.changed = false;
                }
                self.counters.step_pulses += 1;
                trace!("sim: fd{} stepped to {}", i, unit.head_cyl);
            }
        }
    }

    fn pra(&self) -> u8 {
        let mut pra = 0xFFu8;
        if let Some(i) = self.selected_drive() {
            let unit = &self.drives[i];
            if unit.present {
                pra &= !CiaA::RDY;
                if unit.head_cyl == 0 {
                    pra &= !CiaA::TRACK0;
                }
                if unit.changed {
                    pra &= !CiaA::CHANGE;
                }
                if unit.disk.as_ref().is_some_and(|d| d.write_protected) {
                    pra &= !CiaA::WPROT;
                }
            }
        }
        pra
    }

    /// The drive a DMA transfer would reach, if everything on the way to
    /// the medium is in order.
    fn dma_target(&self) -> Option<(usize, usize, usize)> {
        let i = self.selected_drive()?;
        let unit = &self.drives[i];
        if !unit.present || !unit.motor {
            return None;
        }
        let disk = unit.disk.as_ref()?;
        let side = self.side();
        if side >= disk.sides {
            return None;
        }
        let cyl = unit.head_cyl.clamp(0, NR_CYLINDERS as i32 - 1) as usize;
        Some((i, cyl, side))
    }

    fn start_read_dma(&mut self, dst: &mut [u16]) {
        self.counters.track_reads += 1;
        let Some((i, cyl, side)) = self.dma_target() else {
            trace!("sim: read DMA armed with nothing to capture");
            return;
        };
        let disk = self.drives[i].disk.as_ref().expect("dma target has a disk");
        let track = &disk.tracks[cyl * disk.sides + side];

        // Captures start wherever the sync detector first locks on; walk
        // the rotation forward between reads so sector order varies.
        self.rotation = (self.rotation + 1531) % track.len();
        let mut start = self.rotation;
        while track[start % track.len()] != mfm::SYNC_WORD && start < self.rotation + track.len() {
            start += 1;
        }
        for (k, w) in dst.iter_mut().enumerate() {
            *w = track[(start + k) % track.len()];
        }

        self.dma_gen += 1;
        let gen = self.dma_gen;
        self.schedule(READ_DMA_US, SimEvent::DmaDone { gen });
    }

    fn start_write_dma(&mut self, src: &[u16]) {
        self.counters.track_writes += 1;
        let Some((i, cyl, side)) = self.dma_target() else {
            trace!("sim: write DMA armed with nothing spinning");
            return;
        };
        let disk = self.drives[i].disk.as_mut().expect("dma target has a disk");
        if !disk.write_protected {
            disk.tracks[cyl * disk.sides + side] =
                src[WIPE_SIZE..WIPE_SIZE + TRACK_WORDS].to_vec();
        }
        self.dma_gen += 1;
        let gen = self.dma_gen;
        self.schedule(WRITE_DMA_US, SimEvent::DmaDone { gen });
    }

    fn receive(&mut self, src: Source) -> Message {
        let deadline = self.now_us + HANG_LIMIT_US;
        loop {
            if let Some(pos) = self
                .msgs
                .iter()
                .position(|m| src == Source::Any || m.source() == src)
            {
                return self.msgs.remove(pos).expect("position just found");
            }

            let Some(Reverse(next)) = self.sched.pop() else {
                panic!("floppy task blocked with no pending hardware activity");
            };
            assert!(next.at < deadline, "floppy task hung in a rendezvous");
            self.now_us = next.at.max(self.now_us);
            match next.ev {
                SimEvent::Tick => {
                    self.msgs.push_back(Message::Tick);
                    self.schedule(TICK_US, SimEvent::Tick);
                }
                SimEvent::StepFire { gen } => {
                    if self.step_running && gen == self.step_gen {
                        self.msgs
                            .push_back(Message::Interrupt(IntSource::StepTimer));
                        let period = self.step_period_us;
                        self.schedule(period, SimEvent::StepFire { gen });
                    }
                }
                SimEvent::Alarm { gen } => {
                    if let Some((armed_gen, kind)) = self.alarm {
                        if armed_gen == gen {
                            self.alarm = None;
                            self.msgs.push_back(Message::Alarm(kind));
                        }
                    }
                }
                SimEvent::DmaDone { gen } => {
                    if gen == self.dma_gen {
                        self.msgs
                            .push_back(Message::Interrupt(IntSource::DiskBlock));
                    }
                }
            }
        }
    }
}

fn shared(bus: &Rc<RefCell<SimBus>>) -> Rc<RefCell<SimBus>> {
    Rc::clone(bus)
}

struct SimDrivePort(Rc<RefCell<SimBus>>);

impl DrivePort for SimDrivePort {
    fn control(&mut self, op: LineOp, mask: u8) {
        let mut bus = self.0.borrow_mut();
        let old = bus.prb;
        let new = match op {
            LineOp::Set => old | mask,
            LineOp::Clear => old & !mask,
        };
        bus.prb = new;
        bus.lines_changed(old, new);
    }

    fn status(&mut self) -> u8 {
        self.0.borrow().pra()
    }
}

struct SimDiskDma(Rc<RefCell<SimBus>>);

impl DiskDmaPort for SimDiskDma {
    fn set_sync(&mut self, word: u16) {
        debug_assert_eq!(word, mfm::SYNC_WORD);
    }

    fn configure(&mut self, _precomp: Precomp, _word_sync: bool) {}

    fn start_read(&mut self, dst: &mut [u16]) {
        self.0.borrow_mut().start_read_dma(dst);
    }

    fn start_write(&mut self, src: &[u16]) {
        self.0.borrow_mut().start_write_dma(src);
    }

    fn stop(&mut self) {}

    fn enable_irq(&mut self) {}

    fn disable_irq(&mut self) {}
}

struct SimStepTimer(Rc<RefCell<SimBus>>);

impl StepTimerPort for SimStepTimer {
    fn set_period(&mut self, counts: u16) {
        let mut bus = self.0.borrow_mut();
        // The CIA counts E-clock pulses; the default rate works out to
        // roughly 3 ms per fire.
        bus.step_period_us = u64::from(counts) * 1_000_000 / 715_909;
    }

    fn start(&mut self) {
        let mut bus = self.0.borrow_mut();
        bus.step_gen += 1;
        bus.step_running = true;
        let gen = bus.step_gen;
        let period = bus.step_period_us;
        bus.schedule(period, SimEvent::StepFire { gen });
    }

    fn stop(&mut self) {
        self.0.borrow_mut().step_running = false;
    }

    fn enable_irq(&mut self) {}

    fn disable_irq(&mut self) {}
}

struct SimKernel(Rc<RefCell<SimBus>>);

impl KernelPort for SimKernel {
    fn receive(&mut self, src: Source) -> Message {
        self.0.borrow_mut().receive(src)
    }

    fn reply(&mut self, caller: u32, proc_nr: u32, status: i32) {
        self.0.borrow_mut().replies.push(Reply {
            caller,
            proc_nr,
            status,
        });
    }

    fn set_alarm(&mut self, ticks: u32, kind: AlarmKind) {
        let mut bus = self.0.borrow_mut();
        assert!(bus.alarm.is_none(), "alarm armed while one is outstanding");
        bus.alarm_gen += 1;
        let gen = bus.alarm_gen;
        bus.alarm = Some((gen, kind));
        bus.schedule(u64::from(ticks) * TICK_US, SimEvent::Alarm { gen });
    }

    fn cancel_alarm(&mut self) {
        self.0.borrow_mut().alarm = None;
    }

    fn umap(&mut self, _proc_nr: u32, addr: u32, len: u32) -> Option<PhysAddr> {
        let bus = self.0.borrow();
        let end = addr.checked_add(len)?;
        if (end as usize) <= bus.user_mem.len() {
            Some(PhysAddr(addr))
        } else {
            None
        }
    }

    fn phys_read(&mut self, src: PhysAddr, dst: &mut [u8]) {
        let bus = self.0.borrow();
        let s = src.0 as usize;
        dst.copy_from_slice(&bus.user_mem[s..s + dst.len()]);
    }

    fn phys_write(&mut self, dst: PhysAddr, src: &[u8]) {
        let mut bus = self.0.borrow_mut();
        let d = dst.0 as usize;
        bus.user_mem[d..d + src.len()].copy_from_slice(src);
    }
}

/// Control handle over the simulated machine, alive alongside the task.
pub struct SimHandle {
    bus: Rc<RefCell<SimBus>>,
}

/// Build a machine with the given drives present and hand back the task
/// running on it plus the control handle. Drive 0 is always probed as
/// present by the driver; the sim should normally mark it present too.
#[must_use]
pub fn boot(args: LoaderArgs, present: [bool; util::NR_DRIVES]) -> (FloppyTask, SimHandle) {
    let mut bus = SimBus {
        now_us: 0,
        seq: 0,
        sched: BinaryHeap::new(),
        msgs: VecDeque::new(),
        replies: Vec::new(),
        drives: core::array::from_fn(|i| DriveUnit {
            present: present[i],
            disk: None,
            motor: false,
            head_cyl: 0,
            changed: false,
        }),
        prb: 0xFF,
        rotation: 0,
        alarm_gen: 0,
        alarm: None,
        step_gen: 0,
        step_running: false,
        step_period_us: 3000,
        dma_gen: 0,
        counters: SimCounters::default(),
        user_mem: vec![0u8; USER_MEM],
    };
    bus.schedule(TICK_US, SimEvent::Tick);
    let bus = Rc::new(RefCell::new(bus));

    let task = FloppyTask::new(
        Box::new(SimKernel(shared(&bus))),
        Box::new(SimDiskDma(shared(&bus))),
        Box::new(SimDrivePort(shared(&bus))),
        Box::new(SimStepTimer(shared(&bus))),
        EventBoard::new(),
        args,
    );
    (task, SimHandle { bus })
}

impl SimHandle {
    pub fn insert_disk(&self, drive: usize, disk: SimDisk) {
        let mut bus = self.bus.borrow_mut();
        bus.drives[drive].disk = Some(disk);
        bus.drives[drive].changed = true;
    }

    pub fn eject_disk(&self, drive: usize) -> Option<SimDisk> {
        let mut bus = self.bus.borrow_mut();
        bus.drives[drive].changed = true;
        bus.drives[drive].disk.take()
    }

    /// Export the medium in drive `drive` as a flat sector image.
    #[must_use]
    pub fn disk_image(&self, drive: usize) -> Option<Vec<u8>> {
        self.bus.borrow().drives[drive].disk.as_ref().map(SimDisk::to_image)
    }

    pub fn set_write_protect(&self, drive: usize, protected: bool) {
        if let Some(disk) = self.bus.borrow_mut().drives[drive].disk.as_mut() {
            disk.write_protected = protected;
        }
    }

    /// Raise the change line without touching the medium.
    pub fn flag_disk_change(&self, drive: usize) {
        self.bus.borrow_mut().drives[drive].changed = true;
    }

    pub fn corrupt_sector(&self, drive: usize, cyl: u8, side: u8, sector: Sector) {
        if let Some(disk) = self.bus.borrow_mut().drives[drive].disk.as_mut() {
            disk.corrupt_sector(cyl, side, sector);
        }
    }

    #[must_use]
    pub fn counters(&self) -> SimCounters {
        self.bus.borrow().counters
    }

    #[must_use]
    pub fn now_us(&self) -> u64 {
        self.bus.borrow().now_us
    }

    pub fn write_user(&self, addr: u32, bytes: &[u8]) {
        let mut bus = self.bus.borrow_mut();
        let a = addr as usize;
        bus.user_mem[a..a + bytes.len()].copy_from_slice(bytes);
    }

    #[must_use]
    pub fn read_user(&self, addr: u32, len: usize) -> Vec<u8> {
        let bus = self.bus.borrow();
        bus.user_mem[addr as usize..addr as usize + len].to_vec()
    }

    pub fn submit(&self, req: Request) {
        self.bus.borrow_mut().msgs.push_back(Message::Request(req));
    }

    #[must_use]
    pub fn take_replies(&self) -> Vec<Reply> {
        std::mem::take(&mut self.bus.borrow_mut().replies)
    }

    /// Submit a request and poll the task until its reply lands.
    pub fn transact(&self, task: &mut FloppyTask, req: Request) -> Reply {
        self.submit(req);
        let before = self.bus.borrow().replies.len();
        while self.bus.borrow().replies.len() == before {
            task.poll();
        }
        *self.bus.borrow().replies.last().expect("reply just landed")
    }

    /// `DISK_READ` through the scratch window; returns the status and
    /// the bytes that made it.
    pub fn disk_read(
        &self,
        task: &mut FloppyTask,
        device: u8,
        position: u64,
        count: u32,
    ) -> (i32, Vec<u8>) {
        let reply = self.transact(
            task,
            Request::Transfer {
                kind: IoKind::Read,
                caller: CALLER,
                proc_nr: PROC_NR,
                device,
                count,
                position,
                address: SCRATCH,
            },
        );
        let got = if reply.status > 0 {
            self.read_user(SCRATCH, reply.status as usize)
        } else {
            Vec::new()
        };
        (reply.status, got)
    }

    /// `DISK_WRITE` of `data` through the scratch window.
    pub fn disk_write(
        &self,
        task: &mut FloppyTask,
        device: u8,
        position: u64,
        data: &[u8],
    ) -> i32 {
        self.write_user(SCRATCH, data);
        self.transact(
            task,
            Request::Transfer {
                kind: IoKind::Write,
                caller: CALLER,
                proc_nr: PROC_NR,
                device,
                count: data.len() as u32,
                position,
                address: SCRATCH,
            },
        )
        .status
    }

    /// `SCATTERED_IO` with the given vector; buffers live wherever the
    /// entries point.
    pub fn scattered(&self, task: &mut FloppyTask, device: u8, entries: &[IovEntry]) -> i32 {
        let mut raw = Vec::with_capacity(entries.len() * IovEntry::BYTES);
        for e in entries {
            raw.extend_from_slice(&e.to_bytes());
        }
        self.write_user(IOV_ADDR, &raw);
        self.transact(
            task,
            Request::Scattered {
                caller: CALLER,
                proc_nr: PROC_NR,
                device,
                count: entries.len() as u32,
                address: IOV_ADDR,
            },
        )
        .status
    }

    /// Let `ticks` clock ticks pass, with the task serving whatever the
    /// machine throws at it.
    pub fn elapse_ticks(&self, task: &mut FloppyTask, ticks: u32) {
        let target = self.bus.borrow().now_us + u64::from(ticks) * TICK_US;
        while self.bus.borrow().now_us < target {
            task.poll();
        }
    }
}
