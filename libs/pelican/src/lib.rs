//! Interrupt-driven message pipeline for SJA1000-style PeliCAN CAN controllers
//!
//! The crate sits between a memory-mapped controller and the sessions of a
//! host process:
//!
//! - [`registers`] and [`codec`] speak the chip's register protocol
//! - [`driver`] runs the chip lifecycle and services its interrupts
//! - [`device`] owns the frame buffers, filter, counters and notification
//!   slot, and exposes the session operations
//! - [`sim`] is a register-level chip model for tests and host development
//!
//! ```ignore
//! let sim = SimulatedSja1000::default();
//! let device = DeviceManager::init(
//!     sim.clone(),
//!     &DeviceConfig::default(),
//!     Arc::new(SystemClock::new()),
//!     Arc::new(DiscardSink),
//! )?;
//! let session = device.open_session();
//! device.write_frame(session, CanFrame::standard(0x123, &[1, 2, 3])?)?;
//! ```

pub mod clock;
pub mod codec;
pub mod config;
pub mod device;
pub mod driver;
pub mod error;
pub mod frame;
pub mod notify;
pub mod registers;
pub mod ring;
pub mod scheduler;
pub mod sim;
pub mod stats;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::DeviceConfig;
pub use device::{DeviceManager, DeviceState, SessionId};
pub use driver::{BusStatus, ChipDriver, ChipSettings, ChipState, Sja1000};
pub use error::{CanError, Result};
pub use frame::{CanFrame, Filter};
pub use notify::{ChannelSink, DiscardSink, EventSink, NotifyEvent, ReceiverId};
pub use registers::{MemoryRegisters, MmioRegisters, RegisterBlock};
pub use ring::CircularBuffer;
pub use scheduler::WriteReport;
pub use sim::SimulatedSja1000;
pub use stats::ErrorCounters;
