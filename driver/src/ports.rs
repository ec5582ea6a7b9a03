//! Seams between the driver task and the rest of the machine.
//!
//! The task owns one trait object per hardware block plus one for the
//! kernel services it consumes. Real hardware lives in [`crate::chip`],
//! the image-backed model in [`crate::sim`]; both are injected at
//! construction, the driver never knows which one it is talking to.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use bitflags::bitflags;

bitflags! {
    /// Event bits posted by interrupt and timer contexts and consumed by
    /// the task rendezvous.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Events: u32 {
        const MOTOR_RUNNING = 1 << 0;
        const TIMED_OUT = 1 << 1;
        /// Index-hole pulse. Defined for completeness; the index-synchronized
        /// write path is not implemented and nothing ever awaits this bit.
        const INDEX_FOUND = 1 << 2;
        const DMA_READY = 1 << 3;
        const SEEK_READY = 1 << 4;
        const DO_FLUSH = 1 << 5;
    }
}

/// The shared event word. Interrupt handlers only ever touch this one
/// atomic; everything else belongs to the task.
#[derive(Clone, Debug, Default)]
pub struct EventBoard(Arc<AtomicU32>);

impl EventBoard {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn post(&self, ev: Events) {
        self.0.fetch_or(ev.bits(), Ordering::SeqCst);
    }

    pub fn clear(&self, ev: Events) {
        self.0.fetch_and(!ev.bits(), Ordering::SeqCst);
    }

    #[must_use]
    pub fn any(&self, ev: Events) -> bool {
        self.0.load(Ordering::SeqCst) & ev.bits() != 0
    }

    /// Clear `ev` and report whether any of its bits were set.
    pub fn take(&self, ev: Events) -> bool {
        self.0.fetch_and(!ev.bits(), Ordering::SeqCst) & ev.bits() != 0
    }
}

/// Sender filter for a blocking receive.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Source {
    Any,
    Hardware,
    Clock,
}

/// Interrupt lines promoted to messages.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IntSource {
    /// Paula DSKBLK: disk DMA finished.
    DiskBlock,
    /// CIA-B timer B: time for the next step pulse.
    StepTimer,
    /// CIA-B flag line: index hole. Unused, see [`Events::INDEX_FOUND`].
    Index,
}

/// What an armed alarm means when it fires.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AlarmKind {
    /// Motor spin-up time reached.
    MotorSpinUp,
    /// A raw track read overran the rotation watchdog.
    Watchdog,
}

/// Transfer direction of a request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IoKind {
    Read,
    Write,
}

/// A request message, already split by kind.
#[derive(Clone, Copy, Debug)]
pub enum Request {
    /// `DISK_READ` / `DISK_WRITE`.
    Transfer {
        kind: IoKind,
        caller: u32,
        proc_nr: u32,
        device: u8,
        count: u32,
        position: u64,
        address: u32,
    },
    /// `SCATTERED_IO`: `count` iovec entries at `address` in the caller's
    /// space.
    Scattered {
        caller: u32,
        proc_nr: u32,
        device: u8,
        count: u32,
        address: u32,
    },
}

impl Request {
    #[must_use]
    pub fn caller(&self) -> u32 {
        match *self {
            Request::Transfer { caller, .. } | Request::Scattered { caller, .. } => caller,
        }
    }

    #[must_use]
    pub fn proc_nr(&self) -> u32 {
        match *self {
            Request::Transfer { proc_nr, .. } | Request::Scattered { proc_nr, .. } => proc_nr,
        }
    }
}

/// One entry of a scattered-I/O vector, 16 bytes in the caller's space:
/// position, buffer address, byte count, direction (0 read, 1 write).
#[derive(Clone, Copy, Debug)]
pub struct IovEntry {
    pub position: u32,
    pub address: u32,
    pub nbytes: u32,
    pub kind: IoKind,
}

impl IovEntry {
    pub const BYTES: usize = 16;

    /// The caller-side layout, for building request vectors.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::BYTES] {
        let mut raw = [0u8; Self::BYTES];
        raw[0..4].copy_from_slice(&self.position.to_ne_bytes());
        raw[4..8].copy_from_slice(&self.address.to_ne_bytes());
        raw[8..12].copy_from_slice(&self.nbytes.to_ne_bytes());
        let kind: u32 = match self.kind {
            IoKind::Read => 0,
            IoKind::Write => 1,
        };
        raw[12..16].copy_from_slice(&kind.to_ne_bytes());
        raw
    }

    #[must_use]
    pub fn parse(raw: &[u8]) -> Option<Self> {
        let word = |i: usize| {
            u32::from_ne_bytes([raw[i], raw[i + 1], raw[i + 2], raw[i + 3]])
        };
        if raw.len() < Self::BYTES {
            return None;
        }
        Some(Self {
            position: word(0),
            address: word(4),
            nbytes: word(8),
            kind: if word(12) == 0 { IoKind::Read } else { IoKind::Write },
        })
    }
}

/// Everything the task can receive.
#[derive(Clone, Copy, Debug)]
pub enum Message {
    Request(Request),
    Interrupt(IntSource),
    Alarm(AlarmKind),
    /// One tick of the clock task.
    Tick,
}

impl Message {
    /// The sender a receive filter matches this message against.
    #[must_use]
    pub fn source(&self) -> Source {
        match self {
            Message::Request(_) => Source::Any,
            Message::Interrupt(_) => Source::Hardware,
            Message::Alarm(_) | Message::Tick => Source::Clock,
        }
    }
}

/// A select-line operation on the CIA-B peripheral register, mirroring the
/// set/clear convention of the hardware.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LineOp {
    Set,
    Clear,
}

/// Write precompensation applied by the DMA engine on inner cylinders.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Precomp {
    None,
    Ns140,
}

/// The slow drive-control lines: CIA-B PRB out, CIA-A PRA in. All lines
/// are active low; masks are the `cia` constants in [`crate::chip`].
pub trait DrivePort {
    fn control(&mut self, op: LineOp, mask: u8);
    fn status(&mut self) -> u8;
}

/// The Paula disk DMA block. At most one transfer may be in flight at any
/// instant, across all drives.
pub trait DiskDmaPort {
    fn set_sync(&mut self, word: u16);
    fn configure(&mut self, precomp: Precomp, word_sync: bool);
    /// Arm a raw read of `dst.len()` words; completion arrives as a
    /// [`IntSource::DiskBlock`] interrupt.
    fn start_read(&mut self, dst: &mut [u16]);
    /// Arm a raw write of the whole buffer.
    fn start_write(&mut self, src: &[u16]);
    fn stop(&mut self);
    fn enable_irq(&mut self);
    fn disable_irq(&mut self);
}

/// CIA-B timer B, programmed once with the step interval and fired
/// repeatedly while a seek is in progress.
pub trait StepTimerPort {
    fn set_period(&mut self, counts: u16);
    fn start(&mut self);
    fn stop(&mut self);
    fn enable_irq(&mut self);
    fn disable_irq(&mut self);
}

/// A physical address obtained from `umap`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PhysAddr(pub u32);

impl PhysAddr {
    #[must_use]
    pub fn offset(self, bytes: u32) -> Self {
        PhysAddr(self.0 + bytes)
    }
}

/// Kernel services: the message rendezvous, alarms, and user-memory
/// access.
pub trait KernelPort {
    /// Block until a message from `src` arrives. Messages from other
    /// senders are queued, never lost.
    fn receive(&mut self, src: Source) -> Message;
    /// Send the `TASK_REPLY` for a finished request.
    fn reply(&mut self, caller: u32, proc_nr: u32, status: i32);
    /// Arm the single alarm slot; an armed alarm must be cancelled before
    /// the next one is set.
    fn set_alarm(&mut self, ticks: u32, kind: AlarmKind);
    fn cancel_alarm(&mut self);
    /// Translate `len` bytes at `addr` in the caller's space, or `None`
    /// if the range is not mapped.
    fn umap(&mut self, proc_nr: u32, addr: u32, len: u32) -> Option<PhysAddr>;
    fn phys_read(&mut self, src: PhysAddr, dst: &mut [u8]);
    fn phys_write(&mut self, dst: PhysAddr, src: &[u8]);
}
