//! Register-level frame codec
//!
//! Translates between [`CanFrame`] values and the PeliCAN buffer layout:
//!
//! ```text
//! offset  16     17    18    19    20    21..28
//! ext     info   id0   id1   id2   id3   data0..7
//! std     info   id0   id1   data0..7
//! ```
//!
//! The frame information byte carries the format tag in bit 7 and the data
//! length code in the low nibble.

use tracing::{debug, trace, warn};

use crate::frame::{
    CanFrame, ERROR_DLC_CLAMPED, EXTENDED_FLAG, EXTENDED_ID_MASK, MAX_DATA_LEN, STANDARD_ID_MASK,
};
use crate::registers::{Command, Register, RegisterBlock};

/// Frame information byte followed by the 12 identifier/data bytes
pub type RawFrame = [u8; 13];

const INFO_EXTENDED: u8 = 0x80;
const INFO_DLC_MASK: u8 = 0x0F;
const EXTENDED_ID_BYTES: usize = 4;
const STANDARD_ID_BYTES: usize = 2;

fn id_bytes(extended: bool) -> usize {
    if extended {
        EXTENDED_ID_BYTES
    } else {
        STANDARD_ID_BYTES
    }
}

/// Payload length from a frame information byte
///
/// DLC values 9..=15 are clamped to 8 bytes, which is what the chip puts on
/// the wire for them.
pub fn data_len(info: u8) -> usize {
    let dlc = usize::from(info & INFO_DLC_MASK);
    if dlc > MAX_DATA_LEN {
        debug!("Clamping out-of-range DLC {} to {}", dlc, MAX_DATA_LEN);
    }
    dlc.min(MAX_DATA_LEN)
}

/// Decode a raw buffer image into a frame
///
/// A DLC above 8 still yields 8 payload bytes, flagged with
/// [`ERROR_DLC_CLAMPED`].
pub fn decode(raw: &RawFrame) -> CanFrame {
    let info = raw[0];
    let extended = info & INFO_EXTENDED != 0;
    let len = data_len(info);
    let ids = &raw[1..];

    let id = if extended {
        (u32::from(ids[0]) << 21)
            | (u32::from(ids[1]) << 13)
            | (u32::from(ids[2]) << 5)
            | (u32::from(ids[3]) >> 3)
    } else {
        (u32::from(ids[0]) << 3) | (u32::from(ids[1]) >> 5)
    };

    let offset = id_bytes(extended);
    let mut frame = CanFrame {
        id: if extended { id | EXTENDED_FLAG } else { id },
        len: len as u8,
        ..CanFrame::default()
    };
    if usize::from(info & INFO_DLC_MASK) > MAX_DATA_LEN {
        frame.error |= ERROR_DLC_CLAMPED;
    }
    frame.data[..len].copy_from_slice(&ids[offset..offset + len]);
    frame
}

/// Encode a frame into a raw buffer image; unused bytes are zero
pub fn encode(frame: &CanFrame) -> RawFrame {
    let mut raw = [0u8; 13];
    let extended = frame.is_extended();
    let len = frame.data().len();
    raw[0] = (if extended { INFO_EXTENDED } else { 0 }) | len as u8;

    if extended {
        let id = frame.id & EXTENDED_ID_MASK;
        raw[1] = (id >> 21) as u8;
        raw[2] = (id >> 13) as u8;
        raw[3] = (id >> 5) as u8;
        raw[4] = (id << 3) as u8;
    } else {
        let id = frame.id & STANDARD_ID_MASK;
        raw[1] = (id >> 3) as u8;
        raw[2] = (id << 5) as u8;
    }

    let offset = 1 + id_bytes(extended);
    raw[offset..offset + len].copy_from_slice(frame.data());
    raw
}

/// Number of buffer bytes after the information byte a frame occupies
pub fn encoded_len(frame: &CanFrame) -> usize {
    id_bytes(frame.is_extended()) + frame.data().len()
}

/// Read the frame at the head of the receive FIFO
///
/// Only the bytes the frame actually uses are read. The caller releases the
/// receive buffer afterwards.
pub fn read_frame<R: RegisterBlock + ?Sized>(regs: &mut R) -> CanFrame {
    let mut raw = [0u8; 13];
    raw[0] = regs.read(Register::FRAME_INFO);
    let used = id_bytes(raw[0] & INFO_EXTENDED != 0) + data_len(raw[0]);
    for (slot, reg) in raw[1..=used].iter_mut().zip(Register::BUFFER.iter()) {
        *slot = regs.read(*reg);
    }
    let frame = decode(&raw);
    trace!(
        "RX id=0x{:X} ext={} len={} data={:02X?}",
        frame.id(),
        frame.is_extended(),
        frame.len,
        frame.data()
    );
    frame
}

/// Load a frame into the transmit buffer and request transmission
pub fn write_frame<R: RegisterBlock + ?Sized>(regs: &mut R, frame: &CanFrame) {
    let raw = encode(frame);
    regs.write(Register::FRAME_INFO, raw[0]);
    let used = encoded_len(frame);
    for (value, reg) in raw[1..=used].iter().zip(Register::BUFFER.iter()) {
        regs.write(*reg, *value);
    }
    regs.write(Register::COMMAND, Command::TRANSMIT_REQUEST.bits());
    trace!(
        "TX id=0x{:X} ext={} len={} data={:02X?}",
        frame.id(),
        frame.is_extended(),
        frame.len,
        frame.data()
    );
}

/// Program acceptance code and mask, most significant byte first.
/// The chip must be in reset mode.
pub fn write_acceptance<R: RegisterBlock + ?Sized>(regs: &mut R, code: u32, mask: u32) {
    for (reg, byte) in Register::ACCEPTANCE_CODE.iter().zip(code.to_be_bytes()) {
        regs.write(*reg, byte);
    }
    for (reg, byte) in Register::ACCEPTANCE_MASK.iter().zip(mask.to_be_bytes()) {
        regs.write(*reg, byte);
    }
}

/// BTR0/BTR1 values for a 16 MHz oscillator, keyed by kbit/s
const BIT_TIMING_TABLE: [(u32, u8, u8); 9] = [
    (10, 0x31, 0x1C),
    (20, 0x18, 0x1C),
    (50, 0x09, 0x1C),
    (100, 0x04, 0x1C),
    (125, 0x03, 0x1C),
    (250, 0x01, 0x1C),
    (500, 0x00, 0x1C),
    (800, 0x00, 0x16),
    (1000, 0x00, 0x14),
];

/// Bus timing register pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitTiming {
    /// One of the calibrated standard rates
    Standard { btr0: u8, btr1: u8 },
    /// Raw split of an unlisted value; best effort only, since an arbitrary
    /// integer does not map onto real BTR0/BTR1 semantics
    Custom { btr0: u8, btr1: u8 },
}

impl BitTiming {
    pub fn for_bitrate(kbps: u32) -> Self {
        match BIT_TIMING_TABLE.iter().find(|(rate, _, _)| *rate == kbps) {
            Some(&(_, btr0, btr1)) => BitTiming::Standard { btr0, btr1 },
            None => BitTiming::Custom {
                btr0: (kbps >> 8) as u8,
                btr1: kbps as u8,
            },
        }
    }

    pub fn registers(self) -> (u8, u8) {
        match self {
            BitTiming::Standard { btr0, btr1 } | BitTiming::Custom { btr0, btr1 } => (btr0, btr1),
        }
    }

    pub fn is_standard(self) -> bool {
        matches!(self, BitTiming::Standard { .. })
    }
}

/// Bit rates with calibrated timing values, in kbit/s
pub fn standard_bitrates() -> impl Iterator<Item = u32> {
    BIT_TIMING_TABLE.iter().map(|(rate, _, _)| *rate)
}

/// Program bus timing for `kbps`. The chip must be in reset mode.
pub fn write_timing<R: RegisterBlock + ?Sized>(regs: &mut R, kbps: u32) -> BitTiming {
    let timing = BitTiming::for_bitrate(kbps);
    if !timing.is_standard() {
        warn!(
            "Bit rate {} kbit/s has no calibrated timing, writing raw value",
            kbps
        );
    }
    let (btr0, btr1) = timing.registers();
    regs.write(Register::BUS_TIMING_0, btr0);
    regs.write(Register::BUS_TIMING_1, btr1);
    timing
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registers::MemoryRegisters;

    fn extended_raw(id: u32, data: &[u8]) -> RawFrame {
        let mut raw = [0u8; 13];
        raw[0] = 0x80 | data.len() as u8;
        raw[1..5].copy_from_slice(&(id << 3).to_be_bytes());
        raw[5..5 + data.len()].copy_from_slice(data);
        raw
    }

    fn standard_raw(id: u32, data: &[u8]) -> RawFrame {
        let mut raw = [0u8; 13];
        raw[0] = data.len() as u8;
        raw[1..3].copy_from_slice(&((id << 5) as u16).to_be_bytes());
        raw[3..3 + data.len()].copy_from_slice(data);
        raw
    }

    #[test]
    fn test_extended_frame_round_trip() {
        let frame = CanFrame::extended(0x1ABC_DEF, &[10, 20, 30]).unwrap();
        let raw = encode(&frame);
        assert_eq!(raw[0], 0x83);
        assert_eq!(decode(&raw), frame);
    }

    #[test]
    fn test_extended_raw_round_trip() {
        let ids = [0, 1, 0x7FF, 0x800, 0x1ABC_DEF, 0x1555_5555, EXTENDED_ID_MASK];
        for &id in &ids {
            for len in 0..=8usize {
                let data: Vec<u8> = (0..len as u8).map(|b| b.wrapping_mul(37)).collect();
                let raw = extended_raw(id, &data);
                let frame = decode(&raw);
                assert!(frame.is_extended());
                assert_eq!(frame.id(), id);
                assert_eq!(encode(&frame), raw, "id=0x{:X} len={}", id, len);
            }
        }
    }

    #[test]
    fn test_standard_raw_round_trip() {
        for &id in &[0u32, 1, 0x123, 0x555, STANDARD_ID_MASK] {
            for len in 0..=8usize {
                let data = vec![0xA5; len];
                let raw = standard_raw(id, &data);
                let frame = decode(&raw);
                assert!(!frame.is_extended());
                assert_eq!(frame.id(), id);
                assert_eq!(frame.data(), &data[..]);
                assert_eq!(encode(&frame), raw);
            }
        }
    }

    #[test]
    fn test_decode_fragment_layout() {
        // (b0<<21)|(b1<<13)|(b2<<5)|(b3>>3)
        let mut raw = [0u8; 13];
        raw[0] = 0x80;
        raw[1..5].copy_from_slice(&[0x01, 0x02, 0x03, 0x08]);
        assert_eq!(decode(&raw).id(), (1 << 21) | (2 << 13) | (3 << 5) | 1);

        // (b0<<3)|(b1>>5)
        let mut raw = [0u8; 13];
        raw[1..3].copy_from_slice(&[0x24, 0x60]);
        assert_eq!(decode(&raw).id(), (0x24 << 3) | 3);
    }

    #[test]
    fn test_decode_clamps_dlc() {
        let mut raw = standard_raw(0x10, &[1, 2, 3, 4, 5, 6, 7, 8]);
        raw[0] = 0x0F;
        let frame = decode(&raw);
        assert_eq!(frame.len, 8);
        assert_eq!(frame.data(), &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert!(!frame.is_valid());
        assert_eq!(frame.error, ERROR_DLC_CLAMPED);

        raw[0] = 0x08;
        assert!(decode(&raw).is_valid());
    }

    #[test]
    fn test_write_frame_loads_buffer_and_requests_transmission() {
        let mut regs = MemoryRegisters::new();
        let frame = CanFrame::standard(0x321, &[0xAA, 0xBB]).unwrap();
        write_frame(&mut regs, &frame);

        let bytes = regs.bytes();
        assert_eq!(bytes[16], 0x02);
        assert_eq!(bytes[17..19], [0x64, 0x20]);
        assert_eq!(bytes[19..21], [0xAA, 0xBB]);
        assert_eq!(bytes[1], Command::TRANSMIT_REQUEST.bits());
    }

    #[test]
    fn test_read_frame_from_registers() {
        let mut regs = MemoryRegisters::new();
        let raw = extended_raw(0x18FE_F100, &[1, 2, 3, 4]);
        regs.write(Register::FRAME_INFO, raw[0]);
        for (reg, byte) in Register::BUFFER.iter().zip(&raw[1..]) {
            regs.write(*reg, *byte);
        }
        let frame = read_frame(&mut regs);
        assert_eq!(frame.id(), 0x18FE_F100);
        assert_eq!(frame.data(), &[1, 2, 3, 4]);
    }

    #[test]
    fn test_acceptance_bytes_big_endian() {
        let mut regs = MemoryRegisters::new();
        write_acceptance(&mut regs, 0x1122_3344, 0xFFFF_FFFF);
        assert_eq!(regs.bytes()[16..20], [0x11, 0x22, 0x33, 0x44]);
        assert_eq!(regs.bytes()[20..24], [0xFF; 4]);
    }

    #[test]
    fn test_standard_bit_timing_table() {
        assert_eq!(standard_bitrates().count(), 9);
        assert_eq!(
            BitTiming::for_bitrate(500),
            BitTiming::Standard {
                btr0: 0x00,
                btr1: 0x1C
            }
        );
        assert_eq!(BitTiming::for_bitrate(1000).registers(), (0x00, 0x14));
        assert_eq!(BitTiming::for_bitrate(10).registers(), (0x31, 0x1C));
    }

    #[test]
    fn test_custom_bit_timing_is_raw_split() {
        let timing = BitTiming::for_bitrate(0x1234);
        assert!(!timing.is_standard());
        assert_eq!(timing.registers(), (0x12, 0x34));

        let mut regs = MemoryRegisters::new();
        write_timing(&mut regs, 0x1234);
        assert_eq!(regs.bytes()[6..8], [0x12, 0x34]);
    }
}
