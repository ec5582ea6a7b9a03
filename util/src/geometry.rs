//! Minor-device decoding and block-to-CHS mapping.
//!
//! Minors 0..3 are single sided 360K diskettes in drive 0..3, minors
//! 8..11 the double sided 720K variant. Minors 4..7 are reserved for a
//! future format and rejected.

use crate::{Cylinder, Sector, Side, NR_CYLINDERS, NR_SECTORS, SECTOR_SIZE};

const DRIVE_MASK: u8 = 0x03;
const DOUBLE_SIDED: u8 = 0x08;

/// Physical location of one sector.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Chs {
    pub drive: u8,
    pub cyl: Cylinder,
    pub side: Side,
    pub sector: Sector,
}

/// Number of sides encoded in a minor device number, or `None` for a
/// reserved minor.
#[must_use]
pub fn sides_of_device(device: u8) -> Option<u8> {
    match device & !DRIVE_MASK {
        0 => Some(1),
        DOUBLE_SIDED => Some(2),
        _ => None,
    }
}

/// Capacity of the device in bytes.
#[must_use]
pub fn device_size(device: u8) -> Option<u64> {
    let sides = sides_of_device(device)?;
    Some((NR_CYLINDERS * usize::from(sides) * NR_SECTORS * SECTOR_SIZE) as u64)
}

/// Convert a byte offset on a minor device to drive, cylinder, side and
/// sector. `None` for reserved minors, unaligned offsets and offsets at
/// or past the end of the medium.
#[must_use]
pub fn locate(device: u8, offset: u64) -> Option<Chs> {
    let sides = usize::from(sides_of_device(device)?);
    if offset % SECTOR_SIZE as u64 != 0 {
        return None;
    }
    let block = (offset / SECTOR_SIZE as u64) as usize;
    if block >= NR_CYLINDERS * sides * NR_SECTORS {
        return None;
    }

    Some(Chs {
        drive: device & DRIVE_MASK,
        cyl: Cylinder((block / (sides * NR_SECTORS)) as u8),
        side: Side(((block % (sides * NR_SECTORS)) / NR_SECTORS) as u8),
        sector: Sector((block % NR_SECTORS) as u8),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_block_of_each_drive() {
        for dev in 0..4u8 {
            let chs = locate(dev, 0).unwrap();
            assert_eq!(chs.drive, dev);
            assert_eq!(chs.cyl, Cylinder(0));
            assert_eq!(chs.side, Side(0));
            assert_eq!(chs.sector, Sector(0));
        }
    }

    #[test]
    fn double_sided_interleaves_sides_within_a_cylinder() {
        // Block 9 of a 720K diskette is sector 0 on the second side of
        // cylinder 0, not cylinder 1.
        let chs = locate(8, 9 * 512).unwrap();
        assert_eq!((chs.cyl, chs.side, chs.sector), (Cylinder(0), Side(1), Sector(0)));

        let chs = locate(8, 18 * 512).unwrap();
        assert_eq!((chs.cyl, chs.side, chs.sector), (Cylinder(1), Side(0), Sector(0)));
    }

    #[test]
    fn single_sided_advances_cylinders_every_nine_blocks() {
        let chs = locate(1, 9 * 512).unwrap();
        assert_eq!((chs.cyl, chs.side, chs.sector), (Cylinder(1), Side(0), Sector(0)));
    }

    #[test]
    fn unaligned_offset_is_rejected() {
        assert_eq!(locate(8, 100), None);
        assert_eq!(locate(8, 511), None);
    }

    #[test]
    fn last_block_is_legal_one_past_is_not() {
        let last = (80 * 2 * 9 - 1) as u64 * 512;
        assert!(locate(8, last).is_some());
        assert_eq!(locate(8, last + 512), None);

        let last_ss = (80 * 9 - 1) as u64 * 512;
        assert!(locate(0, last_ss).is_some());
        assert_eq!(locate(0, last_ss + 512), None);
    }

    #[test]
    fn reserved_minors_are_rejected() {
        for dev in 4..8u8 {
            assert_eq!(sides_of_device(dev), None);
            assert_eq!(locate(dev, 0), None);
        }
        assert_eq!(sides_of_device(12), None);
    }

    #[test]
    fn device_sizes() {
        assert_eq!(device_size(0), Some(368_640));
        assert_eq!(device_size(8), Some(737_280));
    }
}
