//! The raw-MFM track buffer and its fixed field layout.
//!
//! One track is nine repetitions of
//!
//! ```text
//! [GAP1 70w][GAP2 12w][SYNC 3w][HEADER 7w]
//! [GAP3 22w][GAP4 12w][SYNC 3w][DATA 515w]
//! ```
//!
//! preceded by a wipe region of gap words that erases stale flux when the
//! buffer is written back to disk. The gap and sync framing is laid down
//! once at construction and survives every capture; only the header and
//! data fields are ever rewritten.

use util::mfm;
use util::{Sector, NR_SECTORS, SECTOR_SIZE};

pub const GAP1_SIZE: usize = 70;
pub const GAP2_SIZE: usize = 12;
pub const GAP3_SIZE: usize = 22;
pub const GAP4_SIZE: usize = 12;
pub const SYNC_SIZE: usize = 3;

/// Word offsets within a header field.
pub const H_ID: usize = 0;
pub const H_CYLINDER: usize = 1;
pub const H_SIDE: usize = 2;
pub const H_SECTOR: usize = 3;
pub const H_LENGTH: usize = 4;
pub const H_CRC: usize = 5;
pub const H_SIZE: usize = 7;

/// Word offsets within a data field.
pub const D_ID: usize = 0;
pub const D_DATA: usize = 1;
pub const D_CRC: usize = 513;
pub const D_SIZE: usize = 515;

/// Offset of the header field within one sector's slot.
pub const H_OFFSET: usize = GAP1_SIZE + GAP2_SIZE + SYNC_SIZE;
/// Offset of the data field within one sector's slot.
pub const D_OFFSET: usize = H_OFFSET + H_SIZE + GAP3_SIZE + GAP4_SIZE + SYNC_SIZE;

/// One sector's slot in words.
pub const RAW_S_SIZE: usize = D_OFFSET + D_SIZE;

/// Words captured by a raw track read: comfortably more than one
/// rotation, so every sector appears at least once.
pub const RAW_T_SIZE: usize = 0x1D00;

/// Gap run written ahead of the first sector to wipe stale flux.
pub const WIPE_SIZE: usize = 0x400;

/// Whole buffer in words.
pub const BUF_WORDS: usize = WIPE_SIZE + RAW_S_SIZE * NR_SECTORS + 2;

/// Size code stored in sector headers for 512-byte sectors.
pub const SIZE_CODE_512: u8 = 2;

/// The write-behavior workaround word stored right after a freshly
/// encoded data CRC; the drive mangles the flux cell following the last
/// written bit, so a sacrificial word absorbs the damage.
pub const CRC_GUARD_WORD: u16 = 0x5254;

/// A sector decode that failed its CRC.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CrcMismatch {
    pub stored: u16,
    pub computed: u16,
}

/// An owned raw track image with the IBM framing in place.
pub struct TrackBuf {
    words: Vec<u16>,
}

impl TrackBuf {
    /// Word offset of sector `st`'s header field in the buffer.
    #[must_use]
    pub fn header_off(st: Sector) -> usize {
        WIPE_SIZE + usize::from(st.0) * RAW_S_SIZE + H_OFFSET
    }

    /// Word offset of sector `st`'s data field in the buffer.
    #[must_use]
    pub fn data_off(st: Sector) -> usize {
        WIPE_SIZE + usize::from(st.0) * RAW_S_SIZE + D_OFFSET
    }

    /// Allocate a buffer and lay down the gap and sync framing. Header
    /// and data fields start out zeroed; they are filled by the first
    /// capture (or by [`TrackBuf::format_sector`] when building a blank
    /// disk image).
    #[must_use]
    pub fn new() -> Self {
        fn fill(words: &mut [u16], p: &mut usize, val: u16, n: usize) {
            words[*p..*p + n].fill(val);
            *p += n;
        }

        let mut words = vec![0u16; BUF_WORDS];
        let mut p = 0;
        fill(&mut words, &mut p, mfm::GAP_WORD, WIPE_SIZE);
        for _ in 0..NR_SECTORS {
            fill(&mut words, &mut p, mfm::GAP_WORD, GAP1_SIZE);
            fill(&mut words, &mut p, mfm::ZERO_WORD, GAP2_SIZE);
            fill(&mut words, &mut p, mfm::SYNC_WORD, SYNC_SIZE);
            p += H_SIZE;
            fill(&mut words, &mut p, mfm::GAP_WORD, GAP3_SIZE);
            fill(&mut words, &mut p, mfm::ZERO_WORD, GAP4_SIZE);
            fill(&mut words, &mut p, mfm::SYNC_WORD, SYNC_SIZE);
            p += D_SIZE;
        }
        words[p..].fill(mfm::GAP_WORD);
        Self { words }
    }

    #[must_use]
    pub fn words(&self) -> &[u16] {
        &self.words
    }

    #[must_use]
    pub fn words_mut(&mut self) -> &mut [u16] {
        &mut self.words
    }

    fn encode_at(&mut self, offset: usize, byte: u8) {
        self.words[offset] = mfm::encode_word(self.words[offset - 1], byte);
    }

    /// MFM-encode a payload into sector `st`'s data field, including the
    /// CRC and the guard word behind it. The address mark is left alone:
    /// it either came from a capture or from [`TrackBuf::format_sector`].
    pub fn put_sector(&mut self, st: Sector, payload: &[u8; SECTOR_SIZE]) {
        let off = Self::data_off(st);
        for (i, &b) in payload.iter().enumerate() {
            self.encode_at(off + D_DATA + i, b);
        }
        let crc = mfm::data_crc(payload);
        self.encode_at(off + D_CRC, (crc >> 8) as u8);
        self.encode_at(off + D_CRC + 1, (crc & 0xFF) as u8);
        self.words[off + D_CRC + 2] = CRC_GUARD_WORD;
    }

    /// Decode sector `st`'s data field and verify its CRC. On a mismatch
    /// the output contents are unspecified.
    pub fn read_sector(
        &self,
        st: Sector,
        out: &mut [u8; SECTOR_SIZE],
    ) -> Result<(), CrcMismatch> {
        let off = Self::data_off(st);
        for (i, b) in out.iter_mut().enumerate() {
            *b = mfm::decode_word(self.words[off + D_DATA + i]);
        }
        let stored = (u16::from(mfm::decode_word(self.words[off + D_CRC])) << 8)
            | u16::from(mfm::decode_word(self.words[off + D_CRC + 1]));
        let computed = mfm::data_crc(out);
        if stored == computed {
            Ok(())
        } else {
            Err(CrcMismatch { stored, computed })
        }
    }

    /// Cylinder number claimed by sector `st`'s captured header.
    #[must_use]
    pub fn header_cylinder(&self, st: Sector) -> u8 {
        mfm::decode_word(self.words[Self::header_off(st) + H_CYLINDER])
    }

    /// Write a complete header and address marks for sector `st`, as a
    /// formatter would. Capture normally provides these; this exists to
    /// build blank formatted media.
    pub fn format_sector(&mut self, st: Sector, cyl: u8, side: u8) {
        let h = Self::header_off(st);
        self.words[h + H_ID] = mfm::HEADER_ID_WORD;
        self.encode_at(h + H_CYLINDER, cyl);
        self.encode_at(h + H_SIDE, side);
        self.encode_at(h + H_SECTOR, st.0 + 1);
        self.encode_at(h + H_LENGTH, SIZE_CODE_512);
        let crc = mfm::header_crc(cyl, side, st.0 + 1, SIZE_CODE_512);
        self.encode_at(h + H_CRC, (crc >> 8) as u8);
        self.encode_at(h + H_CRC + 1, (crc & 0xFF) as u8);

        self.words[Self::data_off(st) + D_ID] = mfm::DATA_ID_WORD;
        self.put_sector(st, &[0u8; SECTOR_SIZE]);
    }

    /// Ruin sector `st` so the next decode fails its CRC. Used to mark
    /// sectors that never showed up in a capture.
    pub fn poison_sector(&mut self, st: Sector) {
        let off = Self::data_off(st) + D_DATA;
        self.words[off] = self.words[off].wrapping_add(1);
    }
}

impl Default for TrackBuf {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};

    fn payload(seed: u64) -> [u8; SECTOR_SIZE] {
        let mut rng = SmallRng::seed_from_u64(seed);
        let mut p = [0u8; SECTOR_SIZE];
        rng.fill(&mut p[..]);
        p
    }

    #[test]
    fn framing_is_laid_down_once() {
        let buf = TrackBuf::new();
        for st in 0..NR_SECTORS as u8 {
            let base = WIPE_SIZE + usize::from(st) * RAW_S_SIZE;
            assert_eq!(buf.words()[base], mfm::GAP_WORD);
            assert_eq!(buf.words()[base + GAP1_SIZE + GAP2_SIZE], mfm::SYNC_WORD);
            assert_eq!(
                buf.words()[TrackBuf::header_off(Sector(st)) - 1],
                mfm::SYNC_WORD
            );
            assert_eq!(
                buf.words()[TrackBuf::data_off(Sector(st)) - 1],
                mfm::SYNC_WORD
            );
        }
        assert_eq!(buf.words().len(), BUF_WORDS);
    }

    #[test]
    fn sector_round_trip() {
        let mut buf = TrackBuf::new();
        for st in 0..NR_SECTORS as u8 {
            buf.format_sector(Sector(st), 7, 1);
        }
        for st in 0..NR_SECTORS as u8 {
            let p = payload(u64::from(st) + 1);
            buf.put_sector(Sector(st), &p);
            let mut back = [0u8; SECTOR_SIZE];
            buf.read_sector(Sector(st), &mut back).unwrap();
            assert_eq!(back, p);
        }
    }

    #[test]
    fn guard_word_follows_the_crc() {
        let mut buf = TrackBuf::new();
        buf.format_sector(Sector(4), 0, 0);
        buf.put_sector(Sector(4), &payload(99));
        let off = TrackBuf::data_off(Sector(4));
        assert_eq!(buf.words()[off + D_CRC + 2], CRC_GUARD_WORD);
    }

    #[test]
    fn poisoning_breaks_the_crc() {
        let mut buf = TrackBuf::new();
        buf.format_sector(Sector(2), 0, 0);
        buf.put_sector(Sector(2), &payload(3));
        buf.poison_sector(Sector(2));
        let mut back = [0u8; SECTOR_SIZE];
        assert!(buf.read_sector(Sector(2), &mut back).is_err());
    }

    #[test]
    fn formatted_header_names_the_sector() {
        let mut buf = TrackBuf::new();
        buf.format_sector(Sector(5), 40, 1);
        assert_eq!(buf.header_cylinder(Sector(5)), 40);
        let h = TrackBuf::header_off(Sector(5));
        assert_eq!(mfm::decode_word(buf.words()[h + H_SECTOR]), 6);
        assert_eq!(mfm::decode_word(buf.words()[h + H_LENGTH]), 2);
    }
}
