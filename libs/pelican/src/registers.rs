//! PeliCAN register map and raw register access
//!
//! Registers are addressed through a named offset table instead of a packed
//! struct overlay, so the layout does not depend on struct packing. Every
//! [`Register`] constant is inside [`REGISTER_WINDOW`], and the window length
//! is checked once when a block is constructed.

use bitflags::bitflags;
use std::fmt;
use std::ptr::NonNull;

use crate::error::{CanError, Result};

/// Bytes of address space the PeliCAN register map occupies
pub const REGISTER_WINDOW: usize = 32;

/// A named register, identified by its byte offset in the window
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Register(u8);

impl Register {
    pub const MODE: Register = Register(0);
    pub const COMMAND: Register = Register(1);
    pub const STATUS: Register = Register(2);
    pub const INTERRUPT: Register = Register(3);
    pub const INTERRUPT_ENABLE: Register = Register(4);
    pub const BUS_TIMING_0: Register = Register(6);
    pub const BUS_TIMING_1: Register = Register(7);
    pub const OUTPUT_CONTROL: Register = Register(8);
    pub const ARBITRATION_LOST: Register = Register(11);
    pub const ERROR_CODE: Register = Register(12);
    pub const ERROR_WARNING_LIMIT: Register = Register(13);
    pub const RX_ERROR_COUNTER: Register = Register(14);
    pub const TX_ERROR_COUNTER: Register = Register(15);
    /// Frame information byte of the receive/transmit buffer (operating mode)
    pub const FRAME_INFO: Register = Register(16);
    pub const RX_MESSAGE_COUNTER: Register = Register(29);
    pub const RX_BUFFER_START: Register = Register(30);
    pub const CLOCK_DIVIDER: Register = Register(31);

    /// Identifier and data bytes following the frame information byte.
    /// Reads address the receive FIFO, writes the transmit buffer.
    pub const BUFFER: [Register; 12] = [
        Register(17),
        Register(18),
        Register(19),
        Register(20),
        Register(21),
        Register(22),
        Register(23),
        Register(24),
        Register(25),
        Register(26),
        Register(27),
        Register(28),
    ];

    /// Acceptance code bytes, most significant first (reset mode only)
    pub const ACCEPTANCE_CODE: [Register; 4] =
        [Register(16), Register(17), Register(18), Register(19)];

    /// Acceptance mask bytes, most significant first (reset mode only)
    pub const ACCEPTANCE_MASK: [Register; 4] =
        [Register(20), Register(21), Register(22), Register(23)];

    #[inline]
    pub const fn offset(self) -> usize {
        self.0 as usize
    }

    pub fn name(self) -> &'static str {
        match self.0 {
            0 => "MOD",
            1 => "CMR",
            2 => "SR",
            3 => "IR",
            4 => "IER",
            6 => "BTR0",
            7 => "BTR1",
            8 => "OCR",
            11 => "ALC",
            12 => "ECC",
            13 => "EWLR",
            14 => "RXERR",
            15 => "TXERR",
            16 => "SFF/ACR0",
            17..=28 => "BUF",
            29 => "RMC",
            30 => "RBSA",
            31 => "CDR",
            _ => "RSVD",
        }
    }
}

impl fmt::Debug for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name(), self.0)
    }
}

bitflags! {
    /// Mode register (MOD)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Mode: u8 {
        const RESET = 0x01;
        const LISTEN_ONLY = 0x02;
        const SELF_TEST = 0x04;
        const SINGLE_FILTER = 0x08;
        const SLEEP = 0x10;
    }

    /// Command register (CMR), write-only
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Command: u8 {
        const TRANSMIT_REQUEST = 0x01;
        const ABORT_TRANSMISSION = 0x02;
        const RELEASE_RECEIVE_BUFFER = 0x04;
        const CLEAR_DATA_OVERRUN = 0x08;
        const SELF_RECEPTION_REQUEST = 0x10;
    }

    /// Status register (SR), read-only
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Status: u8 {
        const RECEIVE_BUFFER = 0x01;
        const DATA_OVERRUN = 0x02;
        const TRANSMIT_BUFFER = 0x04;
        const TRANSMISSION_COMPLETE = 0x08;
        const RECEIVING = 0x10;
        const TRANSMITTING = 0x20;
        const ERROR = 0x40;
        const BUS_OFF = 0x80;
    }

    /// Interrupt register (IR) and interrupt enable register (IER)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Interrupt: u8 {
        const RECEIVE = 0x01;
        const TRANSMIT = 0x02;
        const ERROR_WARNING = 0x04;
        const DATA_OVERRUN = 0x08;
        const WAKE_UP = 0x10;
        const ERROR_PASSIVE = 0x20;
        const ARBITRATION_LOST = 0x40;
        const BUS_ERROR = 0x80;
    }
}

/// Byte-addressable access to a register window
///
/// `read` takes `&mut self` because reading some registers (IR) has side
/// effects on the chip.
pub trait RegisterBlock: Send {
    fn read(&mut self, reg: Register) -> u8;

    fn write(&mut self, reg: Register, value: u8);

    fn set_bits(&mut self, reg: Register, bits: u8) {
        let value = self.read(reg);
        self.write(reg, value | bits);
    }

    fn clear_bits(&mut self, reg: Register, bits: u8) {
        let value = self.read(reg);
        self.write(reg, value & !bits);
    }
}

impl<R: RegisterBlock + ?Sized> RegisterBlock for Box<R> {
    fn read(&mut self, reg: Register) -> u8 {
        (**self).read(reg)
    }

    fn write(&mut self, reg: Register, value: u8) {
        (**self).write(reg, value)
    }
}

/// Volatile access to a memory-mapped register window
pub struct MmioRegisters {
    base: NonNull<u8>,
}

// The window is owned exclusively by the driver that holds this value.
unsafe impl Send for MmioRegisters {}

impl MmioRegisters {
    /// Wrap a mapped window of `len` bytes starting at `base`.
    ///
    /// # Safety
    ///
    /// `base` must point to a mapping of at least `len` bytes that stays
    /// valid for the lifetime of the returned value and is not accessed
    /// through any other handle.
    pub unsafe fn new(base: *mut u8, len: usize) -> Result<Self> {
        if len < REGISTER_WINDOW {
            return Err(CanError::RegisterWindow {
                len,
                required: REGISTER_WINDOW,
            });
        }
        let base = NonNull::new(base).ok_or(CanError::RegisterWindow {
            len: 0,
            required: REGISTER_WINDOW,
        })?;
        Ok(Self { base })
    }
}

impl RegisterBlock for MmioRegisters {
    fn read(&mut self, reg: Register) -> u8 {
        // SAFETY: offset < REGISTER_WINDOW <= mapped length, checked in `new`
        unsafe { self.base.as_ptr().add(reg.offset()).read_volatile() }
    }

    fn write(&mut self, reg: Register, value: u8) {
        // SAFETY: offset < REGISTER_WINDOW <= mapped length, checked in `new`
        unsafe { self.base.as_ptr().add(reg.offset()).write_volatile(value) }
    }
}

/// Plain in-memory register window with no chip behaviour
#[derive(Debug, Clone, Default)]
pub struct MemoryRegisters {
    bytes: [u8; REGISTER_WINDOW],
}

impl MemoryRegisters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bytes(&self) -> &[u8; REGISTER_WINDOW] {
        &self.bytes
    }
}

impl RegisterBlock for MemoryRegisters {
    fn read(&mut self, reg: Register) -> u8 {
        self.bytes[reg.offset()]
    }

    fn write(&mut self, reg: Register, value: u8) {
        self.bytes[reg.offset()] = value;
    }
}
