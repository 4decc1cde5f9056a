//! Device manager
//!
//! Ties one chip to its inbound and outbound frame buffers, the software
//! filter, the notification slot and the error counters. Everything the
//! host needs goes through a shared `&DeviceManager`: interrupt dispatch
//! calls [`DeviceManager::handle_interrupt`], session handlers call the
//! read/write/configuration operations.
//!
//! # Locking
//!
//! Each shared resource has its own lock. When more than one is needed they
//! are taken in the order chip, outbound, inbound. The filter is copied once
//! per service call and counters are atomics, so neither joins the order.
//! The session set is only locked on its own or after the chip.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

use crate::clock::Clock;
use crate::config::DeviceConfig;
use crate::driver::{BusStatus, ChipDriver, ChipSettings, ChipState, InterruptHandler, Sja1000};
use crate::error::{CanError, Result};
use crate::frame::{CanFrame, Filter};
use crate::notify::{EventSink, NotificationBridge, NotifyEvent, ReceiverId, Registration};
use crate::registers::RegisterBlock;
use crate::ring::CircularBuffer;
use crate::scheduler::{TransmitScheduler, WriteReport};
use crate::stats::{DeviceStats, ErrorCounters};

/// Handle for one open client session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Point-in-time view of a device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceState {
    pub chip: ChipState,
    pub bitrate_kbps: u32,
    pub acceptance_code: u32,
    pub acceptance_mask: u32,
    pub extended: bool,
    pub filter: Filter,
    /// Clock time of the last push into the transmit buffer
    pub last_send_ms: Option<u64>,
    pub counters: ErrorCounters,
    pub inbound_depth: usize,
    pub outbound_depth: usize,
    pub sessions: usize,
}

pub struct DeviceManager<D> {
    chip: Mutex<D>,
    tx: Mutex<TransmitScheduler>,
    inbound: Mutex<CircularBuffer<CanFrame>>,
    filter: RwLock<Filter>,
    notifier: NotificationBridge,
    stats: DeviceStats,
    sessions: Mutex<BTreeSet<SessionId>>,
    next_session: AtomicU64,
    clock: Arc<dyn Clock>,
    extended: bool,
}

impl<R: RegisterBlock> DeviceManager<Sja1000<R>> {
    /// Bring up an SJA1000 behind `regs` and wrap it in a device
    pub fn init(
        regs: R,
        config: &DeviceConfig,
        clock: Arc<dyn Clock>,
        sink: Arc<dyn EventSink>,
    ) -> Result<Self> {
        config.validate()?;
        let chip = Sja1000::init(regs, config.chip_settings())?;
        Ok(Self::new(chip, config, clock, sink))
    }
}

impl<D: ChipDriver> DeviceManager<D> {
    /// Wrap an already configured chip
    pub fn new(
        chip: D,
        config: &DeviceConfig,
        clock: Arc<dyn Clock>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            chip: Mutex::new(chip),
            tx: Mutex::new(TransmitScheduler::new(
                config.tx_capacity,
                config.heartbeat_ms,
                config.backlog_limit,
            )),
            inbound: Mutex::new(CircularBuffer::new(config.rx_capacity)),
            filter: RwLock::new(Filter::ACCEPT_ALL),
            notifier: NotificationBridge::new(sink),
            stats: DeviceStats::default(),
            sessions: Mutex::new(BTreeSet::new()),
            next_session: AtomicU64::new(1),
            clock,
            extended: config.extended,
        }
    }

    // ---------------------------------------------------------------
    // Sessions
    // ---------------------------------------------------------------

    pub fn open_session(&self) -> SessionId {
        let session = SessionId(self.next_session.fetch_add(1, Ordering::Relaxed));
        let mut sessions = self.sessions.lock();
        sessions.insert(session);
        debug!("Session {} opened ({} open)", session, sessions.len());
        session
    }

    /// Release a session and any notification registration it owns
    pub fn close_session(&self, session: SessionId) -> Result<()> {
        let remaining = {
            let mut sessions = self.sessions.lock();
            if !sessions.remove(&session) {
                return Err(CanError::UnknownSession(session));
            }
            sessions.len()
        };
        if self.notifier.disarm(session) {
            debug!("Session {} notification disarmed", session);
        }
        debug!("Session {} closed ({} open)", session, remaining);
        Ok(())
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    fn check_session(&self, session: SessionId) -> Result<()> {
        if self.sessions.lock().contains(&session) {
            Ok(())
        } else {
            Err(CanError::UnknownSession(session))
        }
    }

    // ---------------------------------------------------------------
    // Data path
    // ---------------------------------------------------------------

    /// Pop the oldest received frame
    pub fn read_frame(&self, session: SessionId) -> Result<Option<CanFrame>> {
        self.check_session(session)?;
        Ok(self.inbound.lock().pop_first())
    }

    /// Queue a frame for transmission
    ///
    /// Only an unknown session fails a write. Queue pressure and a chip
    /// that refuses the push show up in the [`WriteReport`] instead: the
    /// frame stays queued (`held`) until the chip runs again or the
    /// backlog flush drops it.
    pub fn write_frame(&self, session: SessionId, frame: CanFrame) -> Result<WriteReport> {
        self.check_session(session)?;
        let frame = if self.extended {
            frame.into_extended()
        } else {
            frame
        };
        let now = self.clock.now_millis();

        let mut chip = self.chip.lock();
        let mut tx = self.tx.lock();
        Ok(tx.write(frame, now, &self.stats, |f| chip.send(f)))
    }

    /// Discard all buffered input, returning how many frames were dropped
    pub fn flush_input(&self) -> usize {
        let flushed = self.inbound.lock().drain_all();
        if flushed > 0 {
            debug!("Flushed {} stale inbound frames", flushed);
        }
        flushed
    }

    /// Replace the software filter; frames already buffered are kept
    pub fn set_filter(&self, filter: Filter) {
        debug!("Filter set to id=0x{:X} mask=0x{:X}", filter.id, filter.mask);
        *self.filter.write() = filter;
    }

    pub fn filter(&self) -> Filter {
        *self.filter.read()
    }

    // ---------------------------------------------------------------
    // Notification
    // ---------------------------------------------------------------

    /// Register `receiver` to get `event` on every receive, replacing any
    /// earlier registration on this device
    pub fn arm(&self, session: SessionId, receiver: ReceiverId, event: NotifyEvent) -> Result<()> {
        self.check_session(session)?;
        if let Some(previous) = self.notifier.arm(Registration {
            session,
            receiver,
            event,
        }) {
            trace!("Replaced registration of {}", previous.receiver);
        }
        Ok(())
    }

    /// Deliver the armed event, if any
    pub fn notify(&self) -> bool {
        self.notifier.notify(&self.stats)
    }

    // ---------------------------------------------------------------
    // Interrupts
    // ---------------------------------------------------------------

    /// Service pending chip interrupts. Returns `true` if any frame was
    /// received, meaning the client should be notified.
    pub fn service_interrupt(&self) -> bool {
        let now = self.clock.now_millis();
        let filter = *self.filter.read();

        let mut chip = self.chip.lock();
        let mut tx = self.tx.lock();
        let outcome = {
            let mut inbound = self.inbound.lock();
            let mut ctx = IsrContext {
                tx: &mut tx,
                inbound: &mut inbound,
                filter,
                stats: &self.stats,
                now_ms: now,
            };
            chip.service_interrupt(&mut ctx)
        };

        if outcome.iterations > 1 {
            DeviceStats::bump(&self.stats.interrupt_reentries);
        }
        if outcome.pending {
            DeviceStats::bump(&self.stats.nonzero_unmasks);
            debug!(
                "Interrupt budget exhausted after {} passes",
                outcome.iterations
            );
        }
        if outcome.bus_off {
            // Only a chip that came back to operating mode may take the next
            // frame; in reset mode the transmit buffer aliases the
            // acceptance registers.
            if chip.state() != ChipState::Running {
                warn!(
                    "Chip left in {} after bus-off, {} frames held",
                    chip.state(),
                    tx.depth()
                );
            } else if let Err(e) = tx.send(now, |f| chip.send(f)) {
                warn!("Failed to resume transmission after bus-off: {}", e);
            }
        }

        outcome.received
    }

    /// Platform interrupt entry: service the chip, then notify on receive
    pub fn handle_interrupt(&self) -> bool {
        let received = self.service_interrupt();
        if received {
            self.notify();
        }
        received
    }

    // ---------------------------------------------------------------
    // Counters and state
    // ---------------------------------------------------------------

    pub fn get_error_counters(&self) -> ErrorCounters {
        self.stats.snapshot()
    }

    /// Read-and-clear: returns the counters as they were before zeroing
    pub fn clear_error_counters(&self) -> ErrorCounters {
        self.stats.take()
    }

    pub fn device_state(&self) -> DeviceState {
        let (chip, settings) = {
            let chip = self.chip.lock();
            (chip.state(), chip.settings())
        };
        let (last_send_ms, outbound_depth) = {
            let tx = self.tx.lock();
            (tx.last_send_ms(), tx.depth())
        };
        DeviceState {
            chip,
            bitrate_kbps: settings.bitrate_kbps,
            acceptance_code: settings.acceptance_code,
            acceptance_mask: settings.acceptance_mask,
            extended: self.extended,
            filter: self.filter(),
            last_send_ms,
            counters: self.stats.snapshot(),
            inbound_depth: self.inbound.lock().count(),
            outbound_depth,
            sessions: self.session_count(),
        }
    }

    pub fn bus_status(&self) -> BusStatus {
        self.chip.lock().bus_status()
    }

    // ---------------------------------------------------------------
    // Configuration
    // ---------------------------------------------------------------

    /// Change the bus bit rate
    ///
    /// Refused with [`CanError::ConfigurationBusy`] while more than one
    /// session is open and the rate differs from the current one; the
    /// previous rate stays in effect.
    pub fn set_bitrate(&self, bitrate_kbps: u32) -> Result<()> {
        let mut chip = self.chip.lock();
        let mut settings = chip.settings();
        if settings.bitrate_kbps == bitrate_kbps {
            return Ok(());
        }
        let sessions = self.session_count();
        if sessions > 1 {
            warn!(
                "Refusing bit rate change {} -> {} kbit/s with {} sessions open",
                settings.bitrate_kbps, bitrate_kbps, sessions
            );
            return Err(CanError::ConfigurationBusy {
                sessions,
                current: settings.bitrate_kbps,
                requested: bitrate_kbps,
            });
        }
        settings.bitrate_kbps = bitrate_kbps;
        self.reconfigure(&mut chip, settings)
    }

    /// Reprogram the chip's hardware acceptance code and mask
    pub fn set_acceptance(&self, code: u32, mask: u32) -> Result<()> {
        let mut chip = self.chip.lock();
        let settings = ChipSettings {
            acceptance_code: code,
            acceptance_mask: mask,
            ..chip.settings()
        };
        self.reconfigure(&mut chip, settings)
    }

    /// Take the chip off the bus
    pub fn stop(&self) -> Result<()> {
        self.chip.lock().stop()?;
        info!("Device stopped");
        Ok(())
    }

    /// Reset and start the chip with its current settings
    pub fn restart(&self) -> Result<()> {
        let mut chip = self.chip.lock();
        let settings = chip.settings();
        self.reconfigure(&mut chip, settings)
    }

    fn reconfigure(&self, chip: &mut D, settings: ChipSettings) -> Result<()> {
        chip.configure(settings);
        chip.reset()?;
        chip.start()?;
        info!(
            "Device running at {} kbit/s, acceptance 0x{:08X}/0x{:08X}",
            settings.bitrate_kbps, settings.acceptance_code, settings.acceptance_mask
        );
        // Reset dropped whatever was in the transmit buffer
        let now = self.clock.now_millis();
        self.tx.lock().send(now, |f| chip.send(f))?;
        Ok(())
    }
}

/// Interrupt-time view of the device, built once per service call
struct IsrContext<'a> {
    tx: &'a mut TransmitScheduler,
    inbound: &'a mut CircularBuffer<CanFrame>,
    filter: Filter,
    stats: &'a DeviceStats,
    now_ms: u64,
}

impl InterruptHandler for IsrContext<'_> {
    fn on_receive(&mut self, frame: CanFrame) {
        DeviceStats::bump(&self.stats.rx_interrupts);
        if !self.filter.accepts(&frame) {
            trace!("Filtered id=0x{:X}", frame.id());
            return;
        }
        if self.inbound.add(frame) {
            DeviceStats::bump(&self.stats.shadow_evictions);
        }
    }

    fn on_overrun(&mut self) {
        DeviceStats::bump(&self.stats.rx_lost);
    }

    fn on_transmit_complete(&mut self) -> Option<CanFrame> {
        DeviceStats::bump(&self.stats.tx_interrupts);
        self.tx.complete(self.now_ms)
    }

    fn on_bus_off(&mut self) {
        DeviceStats::bump(&self.stats.bus_off_resets);
        if let Some(lost) = self.tx.abandon_head() {
            warn!("Frame id=0x{:X} lost to bus-off", lost.id());
        }
    }
}
