//! End-to-end scenarios against the image-backed machine model.

use amfloppy::sim::{boot, SimDisk, SimHandle};
use amfloppy::{FloppyError, FloppyTask, IoKind, IovEntry, LoaderArgs};
use rstest::rstest;
use util::{Sector, NR_SECTORS, SECTOR_SIZE};

const DD0: u8 = 8; // double sided 720K, drive 0
const BLOCKS_720K: usize = 80 * 2 * NR_SECTORS;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A 720K image where every byte of block `b` is `b & 0xFF`.
fn patterned_image() -> Vec<u8> {
    let mut image = vec![0u8; BLOCKS_720K * SECTOR_SIZE];
    for (b, chunk) in image.chunks_mut(SECTOR_SIZE).enumerate() {
        chunk.fill(b as u8);
    }
    image
}

fn boot_with_disk() -> (FloppyTask, SimHandle) {
    init_logging();
    let (task, sim) = boot(LoaderArgs::default(), [true, true, false, false]);
    sim.insert_disk(0, SimDisk::from_image(&patterned_image(), 2));
    (task, sim)
}

#[test]
fn fresh_read_returns_the_first_two_sectors() {
    let (mut task, sim) = boot_with_disk();

    let (status, data) = sim.disk_read(&mut task, DD0, 0, 1024);
    assert_eq!(status, 1024);
    assert!(data[..512].iter().all(|&b| b == 0));
    assert!(data[512..].iter().all(|&b| b == 1));

    let drive = task.drive(0);
    assert_eq!((drive.cyl, drive.side), (0, 0));
    assert!(drive.valid);
    assert_eq!(drive.dirty, 0);
    assert!(drive.delay > 0, "motor-off countdown should be armed");
    assert_eq!(sim.counters().track_reads, 1, "one capture serves both sectors");
}

#[test]
fn write_is_flushed_on_motor_off_and_reads_back() {
    let (mut task, sim) = boot_with_disk();

    let payload = [0xA5u8; SECTOR_SIZE];
    // Offset 4608 is block 9: cylinder 0, side 1, sector 1.
    let status = sim.disk_write(&mut task, DD0, 4608, &payload);
    assert_eq!(status, 512);
    assert_ne!(task.drive(0).dirty, 0, "write is staged, not on disk yet");
    assert!(task.drive(0).valid);
    assert_eq!(sim.counters().track_writes, 0);

    // Let the motor-off countdown expire: the tick handler queues the
    // flush, the dispatcher writes the track, and one tick later the
    // motor stops.
    sim.elapse_ticks(&mut task, 200);
    assert_eq!(sim.counters().track_writes, 1, "exactly one deferred flush");
    assert_eq!(task.drive(0).dirty, 0);
    assert!(task.drive(0).valid, "write-back does not invalidate the cache");
    assert_eq!(task.drive(0).delay, -1, "motor shut off after the flush");

    let reads_before = sim.counters().track_reads;
    let (status, data) = sim.disk_read(&mut task, DD0, 4608, 512);
    assert_eq!(status, 512);
    assert_eq!(&data[..], &payload[..]);
    assert_eq!(
        sim.counters().track_reads,
        reads_before,
        "read-back is served from the cache"
    );

    // The medium itself carries the new data.
    let image = sim.disk_image(0).unwrap();
    assert_eq!(&image[4608..4608 + 512], &payload[..]);
}

#[test]
fn scattered_io_walks_cylinders_and_sides() {
    let (mut task, sim) = boot_with_disk();

    let entries = [
        IovEntry {
            position: 0,
            address: 0x2_0000,
            nbytes: 512,
            kind: IoKind::Read,
        },
        IovEntry {
            position: 512 * 9,
            address: 0x2_1000,
            nbytes: 512,
            kind: IoKind::Read,
        },
        IovEntry {
            position: 512 * 18,
            address: 0x2_2000,
            nbytes: 512,
            kind: IoKind::Read,
        },
    ];
    let status = sim.scattered(&mut task, DD0, &entries);
    assert_eq!(status, 1536);

    // Blocks 0, 9 and 18 of a double sided diskette live on (cyl 0,
    // side 0), (cyl 0, side 1) and (cyl 1, side 0).
    assert!(sim.read_user(0x2_0000, 512).iter().all(|&b| b == 0));
    assert!(sim.read_user(0x2_1000, 512).iter().all(|&b| b == 9));
    assert!(sim.read_user(0x2_2000, 512).iter().all(|&b| b == 18));

    assert_eq!(sim.counters().track_reads, 3);
    assert_eq!(sim.counters().track_writes, 0, "nothing was dirty, no write-back");
    // 80 recalibration pulses against the track-0 stop, a side switch
    // with no movement, then a single step to cylinder 1.
    assert_eq!(sim.counters().step_pulses, 81);
    assert_eq!(task.drive(0).cyl, 1);
}

#[test]
fn crc_error_retries_the_whole_track_then_surfaces() {
    let (mut task, sim) = boot_with_disk();
    // Sector 3 (1-based) of cylinder 0, side 0.
    sim.corrupt_sector(0, 0, 0, Sector(2));

    let (status, _) = sim.disk_read(&mut task, DD0, 2 * 512, 512);
    assert_eq!(status, FloppyError::Crc.code());
    assert_eq!(
        sim.counters().track_reads,
        8,
        "initial capture plus seven full re-reads"
    );
    assert_eq!(task.stats().data_crc_errors, 8);
    assert_eq!(task.stats().header_crc_errors, 1);
    assert_eq!(task.drive(0).dirty, 0);

    // The neighbouring sectors are still served.
    let (status, data) = sim.disk_read(&mut task, DD0, 0, 512);
    assert_eq!(status, 512);
    assert!(data.iter().all(|&b| b == 0));
}

#[test]
fn corrupt_neighbour_blocks_a_write_without_dirtying() {
    let (mut task, sim) = boot_with_disk();
    sim.corrupt_sector(0, 0, 0, Sector(7));

    let status = sim.disk_write(&mut task, DD0, 0, &[0x11u8; SECTOR_SIZE]);
    assert_eq!(status, FloppyError::Crc.code());
    assert_eq!(task.drive(0).dirty, 0, "refused write must not dirty the cache");

    // Nothing gets flushed later either.
    sim.elapse_ticks(&mut task, 200);
    assert_eq!(sim.counters().track_writes, 0);
}

#[test]
fn unaligned_requests_fail_before_touching_hardware() {
    let (mut task, sim) = boot_with_disk();

    let (status, _) = sim.disk_read(&mut task, DD0, 100, 512);
    assert_eq!(status, FloppyError::BadArgs.code());
    let (status, _) = sim.disk_read(&mut task, DD0, 0, 700);
    assert_eq!(status, FloppyError::BadArgs.code());

    let c = sim.counters();
    assert_eq!((c.track_reads, c.track_writes, c.step_pulses), (0, 0, 0));
}

#[test]
fn the_last_block_is_legal_and_one_past_is_not() {
    let (mut task, sim) = boot_with_disk();

    let last = (BLOCKS_720K as u64 - 1) * 512;
    let (status, data) = sim.disk_read(&mut task, DD0, last, 512);
    assert_eq!(status, 512);
    assert!(data.iter().all(|&b| b == (BLOCKS_720K - 1) as u8));
    assert_eq!(task.drive(0).cyl, 79);

    let (status, _) = sim.disk_read(&mut task, DD0, last + 512, 512);
    assert_eq!(status, FloppyError::BadArgs.code());
}

#[test]
fn a_span_past_the_end_reports_the_partial_byte_count() {
    let (mut task, sim) = boot_with_disk();

    let last = (BLOCKS_720K as u64 - 1) * 512;
    let (status, data) = sim.disk_read(&mut task, DD0, last, 1024);
    assert_eq!(status, 512, "one sector made it before the end of the medium");
    assert_eq!(data.len(), 512);
}

#[test]
fn write_protect_is_refused_before_any_track_read() {
    let (mut task, sim) = boot_with_disk();
    sim.set_write_protect(0, true);

    let status = sim.disk_write(&mut task, DD0, 0, &[0u8; SECTOR_SIZE]);
    assert_eq!(status, FloppyError::WrProt.code());
    assert_eq!(sim.counters().track_reads, 0);

    // Reading is still fine.
    let (status, _) = sim.disk_read(&mut task, DD0, 0, 512);
    assert_eq!(status, 512);
}

#[test]
fn disk_change_invalidates_the_cache() {
    let (mut task, sim) = boot_with_disk();

    let (status, _) = sim.disk_read(&mut task, DD0, 0, 512);
    assert_eq!(status, 512);
    assert_eq!(sim.counters().track_reads, 1);

    // A hit while nothing changed stays in the cache.
    let (status, _) = sim.disk_read(&mut task, DD0, 512, 512);
    assert_eq!(status, 512);
    assert_eq!(sim.counters().track_reads, 1);

    sim.flag_disk_change(0);
    let (status, _) = sim.disk_read(&mut task, DD0, 512, 512);
    assert_eq!(status, 512);
    assert_eq!(sim.counters().track_reads, 2, "change forces a fresh capture");
}

#[test]
fn a_missing_disk_times_out_through_the_watchdog() {
    init_logging();
    let (mut task, sim) = boot(LoaderArgs::default(), [true, false, false, false]);

    let started = sim.now_us();
    let (status, _) = sim.disk_read(&mut task, DD0, 0, 512);
    assert_eq!(status, FloppyError::Dma.code());
    assert_eq!(
        sim.counters().track_reads,
        8,
        "the initial try and every retry armed the DMA again"
    );
    // Eight two-second watchdog rounds of virtual time.
    assert!(sim.now_us() - started >= 16_000_000);
}

#[test]
fn a_lost_head_recalibrates_from_the_sector_headers() {
    let (mut task, sim) = boot_with_disk();

    // First request after boot believes the head is past the last
    // cylinder; the capture of cylinder 5 initially comes from wherever
    // the head really is.
    let block = 5 * 18; // cylinder 5, side 0, sector 1
    let (status, data) = sim.disk_read(&mut task, DD0, block as u64 * 512, 512);
    assert_eq!(status, 512);
    assert!(data.iter().all(|&b| b == block as u8));
    assert_eq!(task.stats().recalibrations, 1);
    assert_eq!(task.drive(0).cyl, 5);
}

#[rstest]
#[case::absent_drive(8 + 2, FloppyError::NoDrive)]
#[case::absent_drive_single_sided(3, FloppyError::NoDrive)]
#[case::reserved_minor(4, FloppyError::BadArgs)]
#[case::reserved_minor_high(7, FloppyError::BadArgs)]
fn requests_for_missing_drives_and_reserved_minors_fail(
    #[case] device: u8,
    #[case] expected: FloppyError,
) {
    let (mut task, sim) = boot_with_disk();
    let (status, _) = sim.disk_read(&mut task, device, 0, 512);
    assert_eq!(status, expected.code());
}

#[test]
fn a_corrupt_sector_can_still_be_overwritten() {
    let (mut task, sim) = boot_with_disk();
    sim.corrupt_sector(0, 0, 0, Sector(2));

    // The damaged sector itself is exempt from the write-safety check;
    // its replacement is about to make it whole again.
    let status = sim.disk_write(&mut task, DD0, 2 * 512, &[0x77u8; SECTOR_SIZE]);
    assert_eq!(status, 512);

    sim.elapse_ticks(&mut task, 200);
    let (status, data) = sim.disk_read(&mut task, DD0, 2 * 512, 512);
    assert_eq!(status, 512);
    assert!(data.iter().all(|&b| b == 0x77));
}

#[test]
fn single_sided_minor_sees_only_side_zero() {
    init_logging();
    let (mut task, sim) = boot(LoaderArgs::default(), [true, false, false, false]);
    sim.insert_disk(0, SimDisk::from_image(&patterned_image()[..80 * 9 * 512], 1));

    // Block 9 of the single sided minor is cylinder 1, side 0.
    let (status, data) = sim.disk_read(&mut task, 0, 9 * 512, 512);
    assert_eq!(status, 512);
    assert!(data.iter().all(|&b| b == 9));
    assert_eq!(task.drive(0).side, 0);

    // Past the 360K end.
    let (status, _) = sim.disk_read(&mut task, 0, 80 * 9 * 512, 512);
    assert_eq!(status, FloppyError::BadArgs.code());
}

#[test]
fn mixed_scattered_io_stops_at_the_first_failure() {
    let (mut task, sim) = boot_with_disk();
    sim.write_user(0x3_0000, &[0x5Au8; SECTOR_SIZE]);

    let entries = [
        IovEntry {
            position: 0,
            address: 0x3_0000,
            nbytes: 512,
            kind: IoKind::Write,
        },
        IovEntry {
            position: 99, // unaligned: this one fails
            address: 0x3_1000,
            nbytes: 512,
            kind: IoKind::Read,
        },
        IovEntry {
            position: 512,
            address: 0x3_2000,
            nbytes: 512,
            kind: IoKind::Read,
        },
    ];
    let status = sim.scattered(&mut task, DD0, &entries);
    assert_eq!(status, 512, "the write landed, the bad entry stopped the run");
    assert!(
        sim.read_user(0x3_2000, 512).iter().all(|&b| b == 0),
        "the entry behind the failure was never executed"
    );
}

#[test]
fn dirty_cache_is_flushed_before_seeking_away() {
    let (mut task, sim) = boot_with_disk();

    let status = sim.disk_write(&mut task, DD0, 0, &[0xEEu8; SECTOR_SIZE]);
    assert_eq!(status, 512);
    assert_ne!(task.drive(0).dirty, 0);

    // A read on another cylinder forces the write-back first.
    let (status, _) = sim.disk_read(&mut task, DD0, 18 * 512, 512);
    assert_eq!(status, 512);
    assert_eq!(sim.counters().track_writes, 1);
    assert_eq!(task.drive(0).dirty, 0);

    let image = sim.disk_image(0).unwrap();
    assert!(image[..512].iter().all(|&b| b == 0xEE));
}
