//! Per-device error and activity counters
//!
//! Counters are touched from interrupt context and process context alike, so
//! each one is an atomic. Counters only grow until [`DeviceStats::take`]
//! swaps them back to zero.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters owned by a device
#[derive(Debug, Default)]
pub struct DeviceStats {
    /// Service calls whose interrupt loop ran more than once
    pub interrupt_reentries: AtomicU64,
    /// Frames taken from the chip receive FIFO
    pub rx_interrupts: AtomicU64,
    /// Transmit-complete interrupts serviced
    pub tx_interrupts: AtomicU64,
    /// Frames lost to chip data overrun
    pub rx_lost: AtomicU64,
    /// Frames evicted from a full inbound buffer
    pub shadow_evictions: AtomicU64,
    /// Heartbeat re-pushes on write
    pub timeouts: AtomicU64,
    /// Frames discarded by backlog flushes
    pub forced_flushes: AtomicU64,
    /// Failed client notification deliveries
    pub notify_failures: AtomicU64,
    /// Service calls that returned with interrupts still pending
    pub nonzero_unmasks: AtomicU64,
    /// Bus-off recoveries
    pub bus_off_resets: AtomicU64,
}

impl DeviceStats {
    #[inline]
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Get a snapshot of current counters
    pub fn snapshot(&self) -> ErrorCounters {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        ErrorCounters {
            interrupt_reentries: load(&self.interrupt_reentries),
            rx_interrupts: load(&self.rx_interrupts),
            tx_interrupts: load(&self.tx_interrupts),
            rx_lost: load(&self.rx_lost),
            shadow_evictions: load(&self.shadow_evictions),
            timeouts: load(&self.timeouts),
            forced_flushes: load(&self.forced_flushes),
            notify_failures: load(&self.notify_failures),
            nonzero_unmasks: load(&self.nonzero_unmasks),
            bus_off_resets: load(&self.bus_off_resets),
        }
    }

    /// Read-and-clear: every counter is swapped to zero and its prior value
    /// returned, so no increment is lost between the read and the reset
    pub fn take(&self) -> ErrorCounters {
        let take = |c: &AtomicU64| c.swap(0, Ordering::Relaxed);
        ErrorCounters {
            interrupt_reentries: take(&self.interrupt_reentries),
            rx_interrupts: take(&self.rx_interrupts),
            tx_interrupts: take(&self.tx_interrupts),
            rx_lost: take(&self.rx_lost),
            shadow_evictions: take(&self.shadow_evictions),
            timeouts: take(&self.timeouts),
            forced_flushes: take(&self.forced_flushes),
            notify_failures: take(&self.notify_failures),
            nonzero_unmasks: take(&self.nonzero_unmasks),
            bus_off_resets: take(&self.bus_off_resets),
        }
    }
}

/// Snapshot of device counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorCounters {
    pub interrupt_reentries: u64,
    pub rx_interrupts: u64,
    pub tx_interrupts: u64,
    pub rx_lost: u64,
    pub shadow_evictions: u64,
    pub timeouts: u64,
    pub forced_flushes: u64,
    pub notify_failures: u64,
    pub nonzero_unmasks: u64,
    pub bus_off_resets: u64,
}

impl ErrorCounters {
    pub fn is_zero(&self) -> bool {
        *self == Self::default()
    }
}
