//! Transmit scheduler
//!
//! Owns the outbound queue. The head of the queue is always the frame the
//! chip is (or should be) transmitting; it is only popped when the chip
//! reports transmit-complete, so a delayed interrupt never reorders frames.

use tracing::{trace, warn};

use crate::error::Result;
use crate::frame::CanFrame;
use crate::ring::CircularBuffer;
use crate::stats::DeviceStats;

/// What a single `write` did besides queueing
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteReport {
    /// The head frame was pushed into hardware
    pub pushed: bool,
    /// The push was a heartbeat re-trigger
    pub timed_out: bool,
    /// A push was due but the chip refused it; the frame stays queued
    pub held: bool,
    /// Frames discarded by a backlog flush
    pub flushed: usize,
}

#[derive(Debug)]
pub struct TransmitScheduler {
    queue: CircularBuffer<CanFrame>,
    last_send_ms: Option<u64>,
    heartbeat_ms: u64,
    backlog_limit: usize,
}

impl TransmitScheduler {
    pub fn new(capacity: usize, heartbeat_ms: u64, backlog_limit: usize) -> Self {
        Self {
            queue: CircularBuffer::new(capacity),
            last_send_ms: None,
            heartbeat_ms,
            backlog_limit,
        }
    }

    /// Queue `frame` and decide whether hardware needs a push
    ///
    /// * queue was empty: push the new head now
    /// * last push older than the heartbeat: re-push the head, covering a
    ///   lost transmit-complete interrupt, and count a timeout once the
    ///   re-push lands
    /// * depth above the backlog limit: drop the whole queue
    ///
    /// A refused push never fails the write. The frame is already queued,
    /// so the report marks it `held` and it goes out on the next
    /// successful push.
    pub fn write<F>(
        &mut self,
        frame: CanFrame,
        now_ms: u64,
        stats: &DeviceStats,
        push: F,
    ) -> WriteReport
    where
        F: FnOnce(&CanFrame) -> Result<()>,
    {
        let mut report = WriteReport::default();
        self.queue.add(frame);

        let heartbeat = self.queue.count() > 1
            && self
                .last_send_ms
                .is_some_and(|last| now_ms.saturating_sub(last) > self.heartbeat_ms);
        let stale_ms = self
            .last_send_ms
            .map_or(0, |last| now_ms.saturating_sub(last));

        if self.queue.count() == 1 || heartbeat {
            match self.send(now_ms, push) {
                Ok(pushed) => {
                    report.pushed = pushed;
                    if heartbeat && pushed {
                        DeviceStats::bump(&stats.timeouts);
                        warn!(
                            "No transmit-complete for {} ms, re-pushed head ({} queued)",
                            stale_ms,
                            self.queue.count()
                        );
                        report.timed_out = true;
                    }
                }
                Err(e) => {
                    warn!("Push refused, {} frames held: {}", self.queue.count(), e);
                    report.held = true;
                }
            }
        }

        if self.queue.count() > self.backlog_limit {
            let drained = self.queue.drain_all();
            DeviceStats::add(&stats.forced_flushes, drained as u64);
            warn!("Transmit backlog over {}, flushed {} frames", self.backlog_limit, drained);
            report.flushed = drained;
        }

        report
    }

    /// Push the head frame into hardware without removing it
    pub fn send<F>(&mut self, now_ms: u64, push: F) -> Result<bool>
    where
        F: FnOnce(&CanFrame) -> Result<()>,
    {
        let Some(head) = self.queue.read_first() else {
            return Ok(false);
        };
        push(&head)?;
        self.last_send_ms = Some(now_ms);
        trace!("Pushed head id=0x{:X}, {} queued", head.id(), self.queue.count());
        Ok(true)
    }

    /// Transmit-complete: retire the head and return the next frame to push
    pub fn complete(&mut self, now_ms: u64) -> Option<CanFrame> {
        self.queue.pop_first();
        let next = self.queue.read_first()?;
        self.last_send_ms = Some(now_ms);
        Some(next)
    }

    /// Drop the in-flight head without pushing a successor (bus-off)
    pub fn abandon_head(&mut self) -> Option<CanFrame> {
        self.queue.pop_first()
    }

    pub fn depth(&self) -> usize {
        self.queue.count()
    }

    pub fn head(&self) -> Option<CanFrame> {
        self.queue.read_first()
    }

    pub fn last_send_ms(&self) -> Option<u64> {
        self.last_send_ms
    }

    pub fn flush(&mut self) -> usize {
        self.queue.drain_all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CanError;

    fn frame(id: u32) -> CanFrame {
        CanFrame::standard(id, &[id as u8]).unwrap()
    }

    fn scheduler() -> TransmitScheduler {
        TransmitScheduler::new(64, 1_000, 10)
    }

    #[test]
    fn test_first_write_pushes_immediately() {
        let mut sched = scheduler();
        let stats = DeviceStats::default();
        let mut pushed = Vec::new();

        let report = sched.write(frame(1), 0, &stats, |f| {
            pushed.push(f.id());
            Ok(())
        });
        assert!(report.pushed);
        assert_eq!(pushed, vec![1]);
        assert_eq!(sched.last_send_ms(), Some(0));
        assert_eq!(sched.depth(), 1);
    }

    #[test]
    fn test_second_write_waits_for_completion() {
        let mut sched = scheduler();
        let stats = DeviceStats::default();
        sched.write(frame(1), 0, &stats, |_| Ok(()));

        let report = sched.write(frame(2), 10, &stats, |_| panic!("must not push"));
        assert_eq!(report, WriteReport::default());
        assert_eq!(sched.depth(), 2);

        assert_eq!(sched.complete(20).map(|f| f.id()), Some(2));
        assert_eq!(sched.last_send_ms(), Some(20));
        assert_eq!(sched.complete(30), None);
        assert_eq!(sched.depth(), 0);
    }

    #[test]
    fn test_heartbeat_repush_counts_once_per_call() {
        let mut sched = scheduler();
        let stats = DeviceStats::default();
        sched.write(frame(1), 0, &stats, |_| Ok(()));
        sched.write(frame(2), 100, &stats, |_| Ok(()));

        let mut pushed = Vec::new();
        let report = sched.write(frame(3), 1_101, &stats, |f| {
            pushed.push(f.id());
            Ok(())
        });
        assert!(report.timed_out);
        assert_eq!(pushed, vec![1]);
        assert_eq!(stats.snapshot().timeouts, 1);

        // Push refreshed the timestamp, so no second timeout right away
        let report = sched.write(frame(4), 1_200, &stats, |_| Ok(()));
        assert!(!report.timed_out);
        assert_eq!(stats.snapshot().timeouts, 1);
    }

    #[test]
    fn test_exactly_heartbeat_is_not_a_timeout() {
        let mut sched = scheduler();
        let stats = DeviceStats::default();
        sched.write(frame(1), 0, &stats, |_| Ok(()));
        let report = sched.write(frame(2), 1_000, &stats, |_| Ok(()));
        assert!(!report.timed_out);
    }

    #[test]
    fn test_backlog_flush_on_eleventh_write() {
        let mut sched = scheduler();
        let stats = DeviceStats::default();
        for id in 1..=10 {
            let report = sched.write(frame(id), 0, &stats, |_| Ok(()));
            assert_eq!(report.flushed, 0);
        }
        let report = sched.write(frame(11), 0, &stats, |_| Ok(()));
        assert_eq!(report.flushed, 11);
        assert_eq!(sched.depth(), 0);
        assert_eq!(stats.snapshot().forced_flushes, 11);
    }

    fn refused(_: &CanFrame) -> Result<()> {
        Err(CanError::InvalidState {
            expected: "running",
            actual: "reset",
        })
    }

    #[test]
    fn test_refused_push_holds_frame() {
        let mut sched = scheduler();
        let stats = DeviceStats::default();
        let report = sched.write(frame(1), 0, &stats, refused);
        assert!(report.held);
        assert!(!report.pushed);
        assert_eq!(sched.depth(), 1);
        assert_eq!(sched.last_send_ms(), None);

        // The held head goes out on the next successful push
        let mut pushed = Vec::new();
        assert!(sched
            .send(50, |f| {
                pushed.push(f.id());
                Ok(())
            })
            .unwrap());
        assert_eq!(pushed, vec![1]);
    }

    #[test]
    fn test_refused_heartbeat_still_flushes_backlog() {
        let mut sched = scheduler();
        let stats = DeviceStats::default();
        sched.write(frame(1), 0, &stats, |_| Ok(()));

        // Chip stops accepting pushes and the heartbeat has long expired
        let mut flushed = 0;
        for id in 2..=30 {
            let report = sched.write(frame(id), 2_000 + u64::from(id), &stats, refused);
            assert!(report.held);
            assert!(!report.timed_out);
            flushed += report.flushed;
            assert!(sched.depth() <= 10);
        }

        let counters = stats.snapshot();
        assert_eq!(counters.timeouts, 0);
        assert!(flushed > 0);
        assert_eq!(counters.forced_flushes, flushed as u64);
    }
}
