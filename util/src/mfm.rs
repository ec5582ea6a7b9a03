//! IBM-PC compatible MFM word codec.
//!
//! Every payload byte occupies one 16 bit word on disk: the eight data
//! bits sit at the even bit positions, the odd positions carry clock
//! ("tag") bits. A tag bit is set wherever two consecutive data bits are
//! both zero, which keeps the flux transitions dense enough for the data
//! separator without ever producing the sync pattern by accident.

/*
 Sync word 0x4489
 Data  1 0 1 0 0 0 0 1   0xA1
 Clk  0 0 0 0 1 1 1 0
 MFM  0100010010101001   0x44A9 as it would be if encoded correctly
 Sync 0100010010001001   0x4489 is damaged to be detected separate to normal data.

 Gap byte 0x4E as MFM word 0x9254
 Data  0 1 0 0 1 1 1 0
 Clk  1 0 0 1 0 0 0 0
 MFM  1001001001010100
*/

/// The sync mark the disk DMA locks onto: `0xA1` with a missing clock bit.
pub const SYNC_WORD: u16 = 0x4489;
pub const SYNC_BYTE: u8 = 0xA1;

/// Sector header address mark, `0xFE`.
pub const HEADER_ID_WORD: u16 = 0x5554;
pub const HEADER_ID_BYTE: u8 = 0xFE;

/// Data field address mark, `0xFB`.
pub const DATA_ID_WORD: u16 = 0x5545;
pub const DATA_ID_BYTE: u8 = 0xFB;

/// Gap filler `0x4E` as recorded between fields.
pub const GAP_WORD: u16 = 0x9254;
/// Pre-sync filler `0x00`; all-zero data encodes to pure clock bits.
pub const ZERO_WORD: u16 = 0xAAAA;

/// Recover the payload byte of an MFM word by selecting the data bits.
#[must_use]
pub fn decode_word(code: u16) -> u8 {
    let mut bin = 0u8;
    for k in 0..8 {
        if code & (1 << (2 * k)) != 0 {
            bin |= 1 << k;
        }
    }
    bin
}

/// Encode one byte as an MFM word.
///
/// The tag bit between the first transmitted data bit and the last data
/// bit of the preceding word depends on `prev`, so encoding a field is a
/// running fold over the buffer.
#[must_use]
pub fn encode_word(prev: u16, byte: u8) -> u16 {
    // Bit 8 of `pair` is the lowest (last transmitted) data bit of `prev`.
    let pair = u16::from(byte) | (prev << 8);
    let mut code = 0u16;
    for k in 0..8 {
        if pair & (1 << k) != 0 {
            code |= 1 << (2 * k);
        }
        if pair & (0b11 << k) == 0 {
            code |= 1 << (2 * k + 1);
        }
    }
    code
}

fn field_crc(id_byte: u8, payload: &[u8]) -> u16 {
    let mut crc = crc16::State::<crc16::CCITT_FALSE>::new();
    crc.update(&[SYNC_BYTE, SYNC_BYTE, SYNC_BYTE, id_byte]);
    crc.update(payload);
    crc.get()
}

/// CRC of a data field: covers the three sync bytes, the `0xFB` mark and
/// the 512 payload bytes, but not the two CRC bytes themselves.
#[must_use]
pub fn data_crc(payload: &[u8]) -> u16 {
    field_crc(DATA_ID_BYTE, payload)
}

/// CRC of a sector header. `sector` is the 1-based on-disk number and
/// `length` the size code (2 for 512-byte sectors).
#[must_use]
pub fn header_crc(cylinder: u8, side: u8, sector: u8, length: u8) -> u16 {
    field_crc(HEADER_ID_BYTE, &[cylinder, side, sector, length])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_encode_round_trip_any_prev() {
        for prev in [0u16, 1, SYNC_WORD, GAP_WORD, 0xFFFF] {
            for byte in 0..=255u8 {
                assert_eq!(decode_word(encode_word(prev, byte)), byte);
            }
        }
    }

    #[test]
    fn known_words() {
        // Address marks and gap fillers as laid down by PC formatters.
        // The marks follow a word whose last data bit is set.
        assert_eq!(encode_word(SYNC_WORD, HEADER_ID_BYTE), HEADER_ID_WORD);
        assert_eq!(encode_word(SYNC_WORD, DATA_ID_BYTE), DATA_ID_WORD);
        assert_eq!(encode_word(GAP_WORD, 0x4E), GAP_WORD);
        assert_eq!(encode_word(ZERO_WORD, 0x00), ZERO_WORD);
    }

    #[test]
    fn encoder_never_emits_the_sync_word() {
        // 0xA1 encodes with its clock bit intact; only the hardware writes
        // the damaged 0x4489 pattern.
        assert_eq!(encode_word(SYNC_WORD, SYNC_BYTE), 0x44A9);
        for prev in [0u16, 0xFFFF, GAP_WORD] {
            for byte in 0..=255u8 {
                assert_ne!(encode_word(prev, byte), SYNC_WORD);
            }
        }
    }

    #[test]
    fn crc_reference_vector() {
        // CCITT_FALSE check value for "123456789".
        let mut crc = crc16::State::<crc16::CCITT_FALSE>::new();
        crc.update(b"123456789");
        assert_eq!(crc.get(), 0x29B1);
    }

    #[test]
    fn data_crc_depends_on_the_address_mark() {
        let payload = [0u8; 4];
        assert_ne!(data_crc(&payload), header_crc(0, 0, 1, 2));
    }
}
