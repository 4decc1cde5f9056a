//! Client notification bridge
//!
//! A consumer that wants to sleep until data arrives arms the device with a
//! receiver id and an event. Every receive serviced afterwards delivers that
//! event through the platform [`EventSink`]. There is at most one
//! registration per device; arming again replaces it.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::device::SessionId;
use crate::error::{CanError, Result};
use crate::stats::DeviceStats;

/// Opaque identifier of the process or channel to wake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReceiverId(pub u64);

impl fmt::Display for ReceiverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rcvid:{}", self.0)
    }
}

/// Event payload handed back to the receiver, opaque to the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifyEvent {
    pub code: i32,
    pub value: u64,
}

/// Platform delivery mechanism
pub trait EventSink: Send + Sync {
    fn deliver(&self, receiver: ReceiverId, event: &NotifyEvent) -> Result<()>;
}

/// The single armed client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registration {
    pub session: SessionId,
    pub receiver: ReceiverId,
    pub event: NotifyEvent,
}

pub struct NotificationBridge {
    slot: Mutex<Option<Registration>>,
    sink: Arc<dyn EventSink>,
}

impl NotificationBridge {
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self {
            slot: Mutex::new(None),
            sink,
        }
    }

    /// Store the registration, returning the one it replaced
    pub fn arm(&self, registration: Registration) -> Option<Registration> {
        debug!(
            "Session {} armed notification for {}",
            registration.session, registration.receiver
        );
        self.slot.lock().replace(registration)
    }

    /// Drop the registration if `session` owns it
    pub fn disarm(&self, session: SessionId) -> bool {
        let mut slot = self.slot.lock();
        if slot.map(|r| r.session) == Some(session) {
            *slot = None;
            true
        } else {
            false
        }
    }

    pub fn registration(&self) -> Option<Registration> {
        *self.slot.lock()
    }

    /// Deliver the armed event, if any. The registration stays in place.
    /// Returns `true` if an event was delivered.
    pub fn notify(&self, stats: &DeviceStats) -> bool {
        // Copy out so the sink never runs under the slot lock
        let Some(registration) = self.registration() else {
            return false;
        };
        match self
            .sink
            .deliver(registration.receiver, &registration.event)
        {
            Ok(()) => true,
            Err(e) => {
                DeviceStats::bump(&stats.notify_failures);
                warn!("Notify {} failed: {}", registration.receiver, e);
                false
            }
        }
    }
}

/// A delivered notification as seen by a [`ChannelSink`] receiver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub receiver: ReceiverId,
    pub event: NotifyEvent,
}

/// Delivers events over a bounded tokio channel without blocking
///
/// A full or closed channel counts as a delivery failure.
#[derive(Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<Delivery>,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Delivery>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn deliver(&self, receiver: ReceiverId, event: &NotifyEvent) -> Result<()> {
        self.tx
            .try_send(Delivery {
                receiver,
                event: *event,
            })
            .map_err(|e| CanError::NotificationFailed(e.to_string()))
    }
}

/// Sink that drops every event, for hosts that never arm
#[derive(Debug, Clone, Copy, Default)]
pub struct DiscardSink;

impl EventSink for DiscardSink {
    fn deliver(&self, _receiver: ReceiverId, _event: &NotifyEvent) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registration(session: u64, receiver: u64) -> Registration {
        Registration {
            session: SessionId(session),
            receiver: ReceiverId(receiver),
            event: NotifyEvent {
                code: 1,
                value: receiver,
            },
        }
    }

    struct FailingSink;

    impl EventSink for FailingSink {
        fn deliver(&self, receiver: ReceiverId, _event: &NotifyEvent) -> Result<()> {
            Err(CanError::NotificationFailed(format!("{} gone", receiver)))
        }
    }

    #[test]
    fn test_notify_without_registration() {
        let (sink, mut rx) = ChannelSink::new(4);
        let bridge = NotificationBridge::new(Arc::new(sink));
        let stats = DeviceStats::default();

        assert!(!bridge.notify(&stats));
        assert!(rx.try_recv().is_err());
        assert_eq!(stats.snapshot().notify_failures, 0);
    }

    #[test]
    fn test_registration_is_reused() {
        let (sink, mut rx) = ChannelSink::new(4);
        let bridge = NotificationBridge::new(Arc::new(sink));
        let stats = DeviceStats::default();

        bridge.arm(registration(1, 10));
        assert!(bridge.notify(&stats));
        assert!(bridge.notify(&stats));

        for _ in 0..2 {
            let delivery = rx.try_recv().unwrap();
            assert_eq!(delivery.receiver, ReceiverId(10));
            assert_eq!(delivery.event.value, 10);
        }
    }

    #[test]
    fn test_rearm_overwrites() {
        let bridge = NotificationBridge::new(Arc::new(DiscardSink));
        assert_eq!(bridge.arm(registration(1, 10)), None);
        let replaced = bridge.arm(registration(2, 20));
        assert_eq!(replaced, Some(registration(1, 10)));
        assert_eq!(bridge.registration(), Some(registration(2, 20)));
    }

    #[test]
    fn test_disarm_only_by_owner() {
        let bridge = NotificationBridge::new(Arc::new(DiscardSink));
        bridge.arm(registration(1, 10));
        assert!(!bridge.disarm(SessionId(2)));
        assert!(bridge.registration().is_some());
        assert!(bridge.disarm(SessionId(1)));
        assert!(bridge.registration().is_none());
    }

    #[test]
    fn test_delivery_failure_is_counted() {
        let bridge = NotificationBridge::new(Arc::new(FailingSink));
        let stats = DeviceStats::default();
        bridge.arm(registration(1, 10));

        assert!(!bridge.notify(&stats));
        assert!(!bridge.notify(&stats));
        assert_eq!(stats.snapshot().notify_failures, 2);
        // Registration survives the failure
        assert!(bridge.registration().is_some());
    }

    #[test]
    fn test_full_channel_fails_delivery() {
        let (sink, _rx) = ChannelSink::new(1);
        let bridge = NotificationBridge::new(Arc::new(sink));
        let stats = DeviceStats::default();
        bridge.arm(registration(1, 10));

        assert!(bridge.notify(&stats));
        assert!(!bridge.notify(&stats));
        assert_eq!(stats.snapshot().notify_failures, 1);
    }

    #[tokio::test]
    async fn test_channel_sink_wakes_async_receiver() {
        let (sink, mut rx) = ChannelSink::new(4);
        let bridge = Arc::new(NotificationBridge::new(Arc::new(sink)));
        bridge.arm(registration(3, 30));

        let waiter = tokio::spawn(async move { rx.recv().await });
        let stats = DeviceStats::default();
        assert!(bridge.notify(&stats));

        let delivery = waiter.await.unwrap().unwrap();
        assert_eq!(delivery.receiver, ReceiverId(30));
    }
}
