//! Chip driver seam and the SJA1000 (PeliCAN mode) implementation
//!
//! Lifecycle: `Uninitialized -> Reset -> Running`, with a
//! `Running -> Reset -> Running` cycle on bus-off recovery.

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, error, info, warn};

use crate::codec;
use crate::error::{CanError, Result};
use crate::frame::CanFrame;
use crate::registers::{Command, Interrupt, Mode, Register, RegisterBlock, Status};

/// PeliCAN mode select in the clock divider register
pub const CDR_PELICAN: u8 = 0x80;
/// CLKOUT pin disabled
pub const CDR_CLOCK_OFF: u8 = 0x08;

/// Interrupt sources the driver runs with
pub const ENABLED_INTERRUPTS: Interrupt = Interrupt::RECEIVE
    .union(Interrupt::TRANSMIT)
    .union(Interrupt::ERROR_WARNING)
    .union(Interrupt::DATA_OVERRUN);

/// Interrupt-loop passes allowed on top of the receive message counter
const EXTRA_SERVICE_PASSES: usize = 2;

/// Mode register polls before giving up on a reset request
const RESET_POLL_LIMIT: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChipState {
    Uninitialized,
    Reset,
    Running,
}

impl ChipState {
    pub fn as_str(self) -> &'static str {
        match self {
            ChipState::Uninitialized => "uninitialized",
            ChipState::Reset => "reset",
            ChipState::Running => "running",
        }
    }
}

impl fmt::Display for ChipState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Values programmed into the chip on every reset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChipSettings {
    pub bitrate_kbps: u32,
    pub acceptance_code: u32,
    pub acceptance_mask: u32,
    /// Board-specific output control byte
    pub output_control: u8,
}

impl Default for ChipSettings {
    fn default() -> Self {
        Self {
            bitrate_kbps: 250,
            acceptance_code: 0,
            // Mask bits set mean "don't care": accept everything
            acceptance_mask: 0xFFFF_FFFF,
            output_control: 0xDA,
        }
    }
}

/// Decoded bus health
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusStatus {
    pub bus_off: bool,
    pub error_warning: bool,
    pub transmitting: bool,
    pub receiving: bool,
    pub rx_error_counter: u8,
    pub tx_error_counter: u8,
}

/// Result of one interrupt service call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServiceOutcome {
    /// At least one frame was taken from the chip
    pub received: bool,
    /// Passes through the interrupt-source loop
    pub iterations: usize,
    /// The pass budget ran out with sources still pending
    pub pending: bool,
    /// The call ended in a bus-off recovery
    pub bus_off: bool,
}

/// Device-side reactions to interrupt sources
pub trait InterruptHandler {
    fn on_receive(&mut self, frame: CanFrame);

    fn on_overrun(&mut self);

    /// The chip finished sending the head frame. Returns the next frame to
    /// load into the transmit buffer, if any.
    fn on_transmit_complete(&mut self) -> Option<CanFrame>;

    /// Called before the chip is reset out of bus-off
    fn on_bus_off(&mut self);
}

/// Hardware-specific half of a CAN device
pub trait ChipDriver: Send {
    fn state(&self) -> ChipState;

    fn settings(&self) -> ChipSettings;

    /// Replace the settings used by the next reset
    fn configure(&mut self, settings: ChipSettings);

    fn reset(&mut self) -> Result<()>;

    fn start(&mut self) -> Result<()>;

    fn stop(&mut self) -> Result<()>;

    /// Load `frame` into the transmit buffer and request transmission
    fn send(&mut self, frame: &CanFrame) -> Result<()>;

    fn service_interrupt(&mut self, handler: &mut dyn InterruptHandler) -> ServiceOutcome;

    fn bus_status(&mut self) -> BusStatus;
}

/// SJA1000 in PeliCAN mode over any register window
pub struct Sja1000<R> {
    regs: R,
    settings: ChipSettings,
    state: ChipState,
}

impl<R: RegisterBlock> Sja1000<R> {
    /// Wrap a register window without touching the chip
    pub fn new(regs: R, settings: ChipSettings) -> Self {
        Self {
            regs,
            settings,
            state: ChipState::Uninitialized,
        }
    }

    /// Wrap the window, then Reset and Start the chip
    pub fn init(regs: R, settings: ChipSettings) -> Result<Self> {
        let mut chip = Self::new(regs, settings);
        chip.reset()?;
        chip.start()?;
        info!(
            "SJA1000 running at {} kbit/s, acceptance 0x{:08X}/0x{:08X}",
            settings.bitrate_kbps, settings.acceptance_code, settings.acceptance_mask
        );
        Ok(chip)
    }

    pub fn registers(&self) -> &R {
        &self.regs
    }

    fn require_running(&self) -> Result<()> {
        if self.state == ChipState::Running {
            Ok(())
        } else {
            Err(CanError::InvalidState {
                expected: ChipState::Running.as_str(),
                actual: self.state.as_str(),
            })
        }
    }

    fn recover_from_bus_off(&mut self) {
        if let Err(e) = self.reset().and_then(|()| self.start()) {
            error!("Bus-off recovery failed: {}", e);
        }
    }
}

impl<R: RegisterBlock> ChipDriver for Sja1000<R> {
    fn state(&self) -> ChipState {
        self.state
    }

    fn settings(&self) -> ChipSettings {
        self.settings
    }

    fn configure(&mut self, settings: ChipSettings) {
        self.settings = settings;
    }

    fn reset(&mut self) -> Result<()> {
        self.regs
            .write(Register::MODE, (Mode::RESET | Mode::SINGLE_FILTER).bits());
        // Once requested, the chip may already map ACR/AMR over the buffer
        if self.state == ChipState::Running {
            self.state = ChipState::Reset;
        }
        let acknowledged = (0..RESET_POLL_LIMIT).any(|_| {
            std::hint::spin_loop();
            Mode::from_bits_retain(self.regs.read(Register::MODE)).contains(Mode::RESET)
        });
        if !acknowledged {
            return Err(CanError::ResetNotAcknowledged {
                polls: RESET_POLL_LIMIT,
            });
        }

        self.regs
            .write(Register::CLOCK_DIVIDER, CDR_PELICAN | CDR_CLOCK_OFF);
        self.regs
            .write(Register::OUTPUT_CONTROL, self.settings.output_control);
        codec::write_timing(&mut self.regs, self.settings.bitrate_kbps);
        codec::write_acceptance(
            &mut self.regs,
            self.settings.acceptance_code,
            self.settings.acceptance_mask,
        );

        self.state = ChipState::Reset;
        debug!("SJA1000 in reset mode");
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        if self.state == ChipState::Uninitialized {
            return Err(CanError::InvalidState {
                expected: ChipState::Reset.as_str(),
                actual: self.state.as_str(),
            });
        }
        // Reading IR clears stale sources
        let _ = self.regs.read(Register::INTERRUPT);
        self.regs
            .write(Register::INTERRUPT_ENABLE, ENABLED_INTERRUPTS.bits());
        self.regs.clear_bits(Register::MODE, Mode::RESET.bits());

        self.state = ChipState::Running;
        debug!("SJA1000 in operating mode");
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.regs.set_bits(Register::MODE, Mode::RESET.bits());
        if self.state == ChipState::Running {
            self.state = ChipState::Reset;
        }
        debug!("SJA1000 stopped");
        Ok(())
    }

    fn send(&mut self, frame: &CanFrame) -> Result<()> {
        self.require_running()?;
        codec::write_frame(&mut self.regs, frame);
        Ok(())
    }

    fn service_interrupt(&mut self, handler: &mut dyn InterruptHandler) -> ServiceOutcome {
        let mut outcome = ServiceOutcome::default();
        if self.state != ChipState::Running {
            return outcome;
        }

        let budget =
            usize::from(self.regs.read(Register::RX_MESSAGE_COUNTER)) + EXTRA_SERVICE_PASSES;

        loop {
            let sources = Interrupt::from_bits_retain(self.regs.read(Register::INTERRUPT));
            if sources.is_empty() {
                break;
            }
            if outcome.iterations == budget {
                outcome.pending = true;
                break;
            }
            let status = Status::from_bits_retain(self.regs.read(Register::STATUS));
            outcome.iterations += 1;

            if sources.contains(Interrupt::RECEIVE) {
                let frame = codec::read_frame(&mut self.regs);
                self.regs
                    .write(Register::COMMAND, Command::RELEASE_RECEIVE_BUFFER.bits());
                handler.on_receive(frame);
                outcome.received = true;
            }

            if sources.contains(Interrupt::DATA_OVERRUN) {
                self.regs
                    .write(Register::COMMAND, Command::CLEAR_DATA_OVERRUN.bits());
                warn!("Receive overrun, message lost");
                handler.on_overrun();
            }

            if sources.contains(Interrupt::TRANSMIT) {
                if let Some(next) = handler.on_transmit_complete() {
                    codec::write_frame(&mut self.regs, &next);
                }
            }

            if sources.contains(Interrupt::ERROR_WARNING) {
                if status.contains(Status::BUS_OFF) {
                    error!("Bus-off, resetting controller");
                    handler.on_bus_off();
                    self.recover_from_bus_off();
                    outcome.bus_off = true;
                    return outcome;
                }
                if status.contains(Status::ERROR) {
                    warn!(
                        "Error warning limit reached (rx={}, tx={})",
                        self.regs.read(Register::RX_ERROR_COUNTER),
                        self.regs.read(Register::TX_ERROR_COUNTER)
                    );
                }
            }

            if sources.contains(Interrupt::ERROR_PASSIVE) {
                warn!("Controller entered error-passive state");
            }

            if sources.contains(Interrupt::WAKE_UP) {
                warn!("Unexpected wake-up interrupt, sleep mode is never requested");
            }
        }

        outcome
    }

    fn bus_status(&mut self) -> BusStatus {
        let status = Status::from_bits_retain(self.regs.read(Register::STATUS));
        BusStatus {
            bus_off: status.contains(Status::BUS_OFF),
            error_warning: status.contains(Status::ERROR),
            transmitting: status.contains(Status::TRANSMITTING),
            receiving: status.contains(Status::RECEIVING),
            rx_error_counter: self.regs.read(Register::RX_ERROR_COUNTER),
            tx_error_counter: self.regs.read(Register::TX_ERROR_COUNTER),
        }
    }
}
