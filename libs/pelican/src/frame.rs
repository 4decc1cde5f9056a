//! CAN frame and acceptance filter values
//!
//! The identifier field packs the format tag into bit 31: a set bit marks an
//! extended (29-bit) identifier, a clear bit a standard (11-bit) one. Callers
//! use [`CanFrame::id`] to get the bare identifier and
//! [`CanFrame::is_extended`] to test the format.

use serde::{Deserialize, Serialize};

use crate::error::{CanError, Result};

/// Bit 31 of the identifier field marks extended format
pub const EXTENDED_FLAG: u32 = 0x8000_0000;

/// Largest 11-bit identifier
pub const STANDARD_ID_MASK: u32 = 0x0000_07FF;

/// Largest 29-bit identifier
pub const EXTENDED_ID_MASK: u32 = 0x1FFF_FFFF;

/// Maximum classic CAN payload
pub const MAX_DATA_LEN: usize = 8;

/// [`CanFrame::error`] bit: received with a DLC above 8, payload clamped
pub const ERROR_DLC_CLAMPED: u8 = 0x01;

/// One CAN message as stored in the frame buffers
///
/// Frames are plain values: they are copied into and out of the ring
/// buffers and never shared.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanFrame {
    /// Identifier with the extended tag in bit 31
    pub id: u32,
    /// Payload length, 0..=8
    pub len: u8,
    /// Payload; bytes past `len` are zero
    pub data: [u8; 8],
    /// Zero for a clean frame, otherwise `ERROR_*` bits set on receive
    pub error: u8,
}

impl CanFrame {
    /// Build a standard (11-bit) data frame
    pub fn standard(id: u32, data: &[u8]) -> Result<Self> {
        if id > STANDARD_ID_MASK {
            return Err(CanError::InvalidIdentifier {
                id,
                extended: false,
            });
        }
        Self::with_raw_id(id, data)
    }

    /// Build an extended (29-bit) data frame
    pub fn extended(id: u32, data: &[u8]) -> Result<Self> {
        if id > EXTENDED_ID_MASK {
            return Err(CanError::InvalidIdentifier { id, extended: true });
        }
        Self::with_raw_id(id | EXTENDED_FLAG, data)
    }

    /// Build a frame from a packed identifier (extended tag in bit 31)
    pub fn new(raw_id: u32, data: &[u8]) -> Result<Self> {
        if raw_id & EXTENDED_FLAG != 0 {
            Self::extended(raw_id & !EXTENDED_FLAG, data)
        } else {
            Self::standard(raw_id, data)
        }
    }

    fn with_raw_id(id: u32, data: &[u8]) -> Result<Self> {
        if data.len() > MAX_DATA_LEN {
            return Err(CanError::InvalidLength(data.len()));
        }
        let mut frame = Self {
            id,
            len: data.len() as u8,
            ..Self::default()
        };
        frame.data[..data.len()].copy_from_slice(data);
        Ok(frame)
    }

    /// Identifier with the format tag masked off
    #[inline]
    pub fn id(&self) -> u32 {
        if self.is_extended() {
            self.id & EXTENDED_ID_MASK
        } else {
            self.id & STANDARD_ID_MASK
        }
    }

    #[inline]
    pub fn is_extended(&self) -> bool {
        self.id & EXTENDED_FLAG != 0
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.error == 0
    }

    /// Payload bytes up to `len` (clamped to 8)
    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.data[..usize::from(self.len).min(MAX_DATA_LEN)]
    }

    /// Same identifier and payload, re-tagged as extended format
    pub fn into_extended(mut self) -> Self {
        if !self.is_extended() {
            self.id = (self.id & STANDARD_ID_MASK) | EXTENDED_FLAG;
        }
        self
    }
}

/// Software acceptance filter applied to every received frame
///
/// A frame passes iff `(filter.id & filter.mask) == (frame.id & filter.mask)`,
/// where `frame.id` is the packed identifier as decoded. A zero mask
/// accepts everything.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    pub id: u32,
    pub mask: u32,
}

impl Filter {
    pub const ACCEPT_ALL: Filter = Filter { id: 0, mask: 0 };

    pub fn new(id: u32, mask: u32) -> Self {
        Self { id, mask }
    }

    #[inline]
    pub fn accepts(&self, frame: &CanFrame) -> bool {
        (self.id & self.mask) == (frame.id & self.mask)
    }
}
