//! Simulated SJA1000 register window
//!
//! Behaves like the chip at the register level: separate receive FIFO and
//! transmit buffer behind offsets 16..=28, acceptance registers in reset mode,
//! a read-to-clear interrupt register, and the RRB/TR/CDO commands. Tests keep
//! a clone of the handle to inject bus traffic and inspect what was sent.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, trace};

use crate::codec::{self, RawFrame};
use crate::frame::CanFrame;
use crate::registers::{Command, Interrupt, Mode, Register, RegisterBlock, Status, REGISTER_WINDOW};

/// Frames the simulated receive FIFO holds before overrunning
pub const DEFAULT_FIFO_FRAMES: usize = 8;

const BUFFER_START: usize = 16;
const BUFFER_END: usize = 28;

#[derive(Debug)]
struct SimState {
    regs: [u8; REGISTER_WINDOW],
    acceptance: [u8; 8],
    tx_buffer: RawFrame,
    rx_fifo: VecDeque<RawFrame>,
    fifo_capacity: usize,
    latched: Interrupt,
    overrun: bool,
    bus_off: bool,
    error_warning: bool,
    tx_in_progress: bool,
    auto_complete: bool,
    rx_error: u8,
    tx_error: u8,
    transmitted: Vec<CanFrame>,
    resets: usize,
}

impl SimState {
    fn new(fifo_capacity: usize) -> Self {
        let mut regs = [0u8; REGISTER_WINDOW];
        // Hardware reset leaves the chip in reset mode
        regs[Register::MODE.offset()] = Mode::RESET.bits();
        Self {
            regs,
            acceptance: [0, 0, 0, 0, 0xFF, 0xFF, 0xFF, 0xFF],
            tx_buffer: [0; 13],
            rx_fifo: VecDeque::with_capacity(fifo_capacity),
            fifo_capacity,
            latched: Interrupt::empty(),
            overrun: false,
            bus_off: false,
            error_warning: false,
            tx_in_progress: false,
            auto_complete: false,
            rx_error: 0,
            tx_error: 0,
            transmitted: Vec::new(),
            resets: 0,
        }
    }

    fn mode(&self) -> Mode {
        Mode::from_bits_retain(self.regs[Register::MODE.offset()])
    }

    fn in_reset(&self) -> bool {
        self.mode().contains(Mode::RESET)
    }

    fn enabled(&self) -> Interrupt {
        Interrupt::from_bits_retain(self.regs[Register::INTERRUPT_ENABLE.offset()])
    }

    /// Latch a source if its enable bit is set
    fn latch(&mut self, irq: Interrupt) {
        self.latched |= irq & self.enabled();
    }

    fn status(&self) -> Status {
        let mut status = Status::empty();
        status.set(Status::RECEIVE_BUFFER, !self.rx_fifo.is_empty());
        status.set(Status::DATA_OVERRUN, self.overrun);
        status.set(Status::TRANSMIT_BUFFER, !self.tx_in_progress);
        status.set(Status::TRANSMISSION_COMPLETE, !self.tx_in_progress);
        status.set(Status::TRANSMITTING, self.tx_in_progress);
        status.set(Status::ERROR, self.error_warning || self.bus_off);
        status.set(Status::BUS_OFF, self.bus_off);
        status
    }

    fn read_interrupts(&mut self) -> u8 {
        let mut sources = std::mem::replace(&mut self.latched, Interrupt::empty());
        // RI follows the FIFO and is not cleared by reading IR
        if !self.in_reset()
            && !self.rx_fifo.is_empty()
            && self.enabled().contains(Interrupt::RECEIVE)
        {
            sources |= Interrupt::RECEIVE;
        }
        sources.bits()
    }

    fn read_buffer(&self, offset: usize) -> u8 {
        if self.in_reset() {
            match offset {
                16..=23 => self.acceptance[offset - BUFFER_START],
                _ => self.regs[offset],
            }
        } else {
            self.rx_fifo
                .front()
                .map(|raw| raw[offset - BUFFER_START])
                .unwrap_or(0)
        }
    }

    fn write_buffer(&mut self, offset: usize, value: u8) {
        if self.in_reset() {
            match offset {
                16..=23 => self.acceptance[offset - BUFFER_START] = value,
                _ => self.regs[offset] = value,
            }
        } else {
            self.tx_buffer[offset - BUFFER_START] = value;
        }
    }

    fn write_mode(&mut self, value: u8) {
        let entering_reset = !self.in_reset() && value & Mode::RESET.bits() != 0;
        self.regs[Register::MODE.offset()] = value;
        if entering_reset {
            self.rx_fifo.clear();
            self.latched = Interrupt::empty();
            self.overrun = false;
            self.bus_off = false;
            self.error_warning = false;
            self.tx_in_progress = false;
            self.rx_error = 0;
            self.tx_error = 0;
            self.resets += 1;
            debug!("Simulated chip entered reset ({} so far)", self.resets);
        }
    }

    fn command(&mut self, value: u8) {
        if self.in_reset() {
            return;
        }
        let command = Command::from_bits_retain(value);

        if command.contains(Command::TRANSMIT_REQUEST) {
            let frame = codec::decode(&self.tx_buffer);
            trace!("Simulated bus carries id=0x{:X}", frame.id());
            self.transmitted.push(frame);
            if self.auto_complete {
                self.latch(Interrupt::TRANSMIT);
            } else {
                self.tx_in_progress = true;
            }
        }
        if command.contains(Command::ABORT_TRANSMISSION) {
            self.tx_in_progress = false;
        }
        if command.contains(Command::RELEASE_RECEIVE_BUFFER) {
            self.rx_fifo.pop_front();
        }
        if command.contains(Command::CLEAR_DATA_OVERRUN) {
            self.overrun = false;
        }
    }

    /// Single-filter acceptance check over the first four identifier bytes
    fn accepts(&self, raw: &RawFrame) -> bool {
        raw[1..5]
            .iter()
            .zip(&self.acceptance[..4])
            .zip(&self.acceptance[4..])
            .all(|((byte, code), mask)| (byte ^ code) & !mask == 0)
    }
}

/// Shared handle to a simulated chip; clones address the same chip
#[derive(Debug, Clone)]
pub struct SimulatedSja1000 {
    state: Arc<Mutex<SimState>>,
}

impl Default for SimulatedSja1000 {
    fn default() -> Self {
        Self::new(DEFAULT_FIFO_FRAMES)
    }
}

impl SimulatedSja1000 {
    pub fn new(fifo_capacity: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState::new(fifo_capacity))),
        }
    }

    /// Put a frame on the bus as if another node sent it.
    ///
    /// Returns `false` when the chip is in reset, the acceptance filter
    /// rejects the frame, or the FIFO overruns.
    pub fn inject(&self, frame: &CanFrame) -> bool {
        let mut state = self.state.lock();
        if state.in_reset() {
            return false;
        }
        let raw = codec::encode(frame);
        if !state.accepts(&raw) {
            return false;
        }
        if state.rx_fifo.len() >= state.fifo_capacity {
            state.overrun = true;
            state.latch(Interrupt::DATA_OVERRUN);
            return false;
        }
        state.rx_fifo.push_back(raw);
        true
    }

    /// Finish the frame currently on the wire and raise TI
    pub fn complete_transmission(&self) -> bool {
        let mut state = self.state.lock();
        if !state.tx_in_progress {
            return false;
        }
        state.tx_in_progress = false;
        state.latch(Interrupt::TRANSMIT);
        true
    }

    /// Transmit error counter overflow: bus-off with an error interrupt
    pub fn raise_bus_off(&self) {
        let mut state = self.state.lock();
        state.bus_off = true;
        state.tx_error = 255;
        state.latch(Interrupt::ERROR_WARNING);
    }

    pub fn raise_error_warning(&self, rx_error: u8, tx_error: u8) {
        let mut state = self.state.lock();
        state.error_warning = true;
        state.rx_error = rx_error;
        state.tx_error = tx_error;
        state.latch(Interrupt::ERROR_WARNING);
    }

    /// Latch interrupt sources regardless of the enable register
    pub fn raise(&self, sources: Interrupt) {
        self.state.lock().latched |= sources;
    }

    pub fn set_auto_complete(&self, enabled: bool) {
        self.state.lock().auto_complete = enabled;
    }

    /// Every frame that went out on the bus, in order
    pub fn transmitted(&self) -> Vec<CanFrame> {
        self.state.lock().transmitted.clone()
    }

    pub fn take_transmitted(&self) -> Vec<CanFrame> {
        std::mem::take(&mut self.state.lock().transmitted)
    }

    pub fn tx_in_progress(&self) -> bool {
        self.state.lock().tx_in_progress
    }

    pub fn rx_pending(&self) -> usize {
        self.state.lock().rx_fifo.len()
    }

    /// Times the chip has entered reset mode from operating mode
    pub fn reset_count(&self) -> usize {
        self.state.lock().resets
    }

    pub fn mode(&self) -> Mode {
        self.state.lock().mode()
    }

    pub fn interrupt_enable(&self) -> Interrupt {
        self.state.lock().enabled()
    }

    /// Programmed acceptance code and mask
    pub fn acceptance(&self) -> (u32, u32) {
        let state = self.state.lock();
        let word = |bytes: &[u8]| u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        (word(&state.acceptance[..4]), word(&state.acceptance[4..]))
    }

    pub fn bus_timing(&self) -> [u8; 2] {
        let state = self.state.lock();
        [
            state.regs[Register::BUS_TIMING_0.offset()],
            state.regs[Register::BUS_TIMING_1.offset()],
        ]
    }

    pub fn output_control(&self) -> u8 {
        self.state.lock().regs[Register::OUTPUT_CONTROL.offset()]
    }
}

impl RegisterBlock for SimulatedSja1000 {
    fn read(&mut self, reg: Register) -> u8 {
        let mut state = self.state.lock();
        match reg.offset() {
            1 => 0xFF,
            2 => state.status().bits(),
            3 => state.read_interrupts(),
            14 => state.rx_error,
            15 => state.tx_error,
            offset @ BUFFER_START..=BUFFER_END => state.read_buffer(offset),
            29 => state.rx_fifo.len() as u8,
            offset => state.regs[offset],
        }
    }

    fn write(&mut self, reg: Register, value: u8) {
        let mut state = self.state.lock();
        match reg.offset() {
            0 => state.write_mode(value),
            1 => state.command(value),
            // Read-only
            2 | 3 | 29 => {}
            offset @ BUFFER_START..=BUFFER_END => state.write_buffer(offset, value),
            offset => state.regs[offset] = value,
        }
    }
}
