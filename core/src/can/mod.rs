//! C1 — CAN Adapter: a bounded-queue, non-blocking SocketCAN sender with
//! exponential backoff, persistent-failure dequeue and whole-interface
//! reset as the last-resort recovery path.
//!
//! Grounded on `CanComm::onTxPump` / `tryResetInterface` in the original
//! source; the backoff/reset constants below are taken from there verbatim.

pub mod codec;
pub mod socketcan_sink;
pub mod transport;

use crate::clock::Clock;
use crate::error::{CoreError, CoreResult};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use transport::{is_backpressure, CanSink, LinkResetter, RawFrame};

/// Max queued-but-unsent frames before `send_frame` starts refusing work.
pub const MAX_TX_QUEUE_SIZE: usize = 512;
/// TX pump tick interval.
pub const TX_INTERVAL_MS: u64 = 2;
/// Base backoff delay; doubled per retry up to the multiplier cap.
pub const TX_BACKOFF_MS: u64 = 10;
/// Backoff multiplier cap — `TX_BACKOFF_MS * 2^5 = 320ms` max backoff.
pub const MAX_BACKOFF_MULTIPLIER: u32 = 5;
/// Consecutive max-backoff cycles before the head frame is sacrificed.
pub const MAX_CONSECUTIVE_MAX_BACKOFF_RETRIES: u32 = 3;
/// Dropped-frame count that triggers an interface reset attempt.
pub const RESET_THRESHOLD: u32 = 3;
/// Reset attempts allowed between successes.
pub const MAX_RESET_ATTEMPTS: u32 = 3;
/// Cooldown between reset attempts.
pub const RESET_COOLDOWN_MS: i64 = 30_000;
/// Timeout for each `ip link` invocation during reset.
pub const PROCESS_TIMEOUT_MS: u64 = 5_000;
/// A device is considered online while its last frame is newer than this.
pub const ONLINE_TIMEOUT_MS: i64 = 30_000;

/// Diagnostic counters, mirroring the original's `stats()` accessor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AdapterStats {
    pub dropped_frames: u32,
    pub tx_queue_len: usize,
    pub reset_attempt_count: u32,
    pub last_reset_ms: Option<i64>,
    pub backoff_multiplier: u32,
}

/// Non-blocking, bounded-queue CAN adapter. Generic over the transport so
/// tests can inject a mock instead of a real socket.
pub struct CanAdapter<S: CanSink> {
    ifname: String,
    sink: Option<S>,
    tx_queue: VecDeque<RawFrame>,
    backoff_ms: u64,
    backoff_multiplier: u32,
    consecutive_max_backoff: u32,
    diag_logged: bool,
    dropped_frames: u32,
    reset_attempt_count: u32,
    last_reset_ms: Option<i64>,
    resetting: bool,
    clock: Arc<dyn Clock>,
}

impl<S: CanSink> CanAdapter<S> {
    /// Construct an adapter bound to `ifname`, not yet open.
    pub fn new(ifname: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        Self {
            ifname: ifname.into(),
            sink: None,
            tx_queue: VecDeque::new(),
            backoff_ms: 0,
            backoff_multiplier: 0,
            consecutive_max_backoff: 0,
            diag_logged: false,
            dropped_frames: 0,
            reset_attempt_count: 0,
            last_reset_ms: None,
            resetting: false,
            clock,
        }
    }

    pub fn is_open(&self) -> bool {
        self.sink.is_some()
    }

    /// Open the bus. Idempotent while already open. Non-fatal on failure —
    /// the caller decides whether to continue running with the bus down.
    pub fn open(&mut self) -> CoreResult<()> {
        if self.is_open() {
            return Ok(());
        }
        let sink = S::open(&self.ifname).map_err(|e| {
            tracing::warn!(ifname = %self.ifname, error = %e, "failed to open CAN interface");
            CoreError::IoError(e)
        })?;
        self.sink = Some(sink);
        Ok(())
    }

    /// Close the bus, clearing the TX queue and transient backoff state.
    /// `dropped_frames`, `reset_attempt_count` and `last_reset_ms`
    /// deliberately persist — they drive the reset policy across
    /// close/open pairs.
    pub fn close(&mut self) {
        self.sink = None;
        self.tx_queue.clear();
        self.backoff_ms = 0;
        self.backoff_multiplier = 0;
        self.consecutive_max_backoff = 0;
        self.diag_logged = false;
    }

    /// Enqueue a frame for the TX pump to send. Never blocks.
    pub fn send_frame(&mut self, can_id: u32, payload: &[u8], extended: bool, rtr: bool) -> bool {
        if !self.is_open() || payload.len() > 8 || self.tx_queue.len() >= MAX_TX_QUEUE_SIZE {
            return false;
        }
        self.tx_queue.push_back(RawFrame::new(can_id, extended, rtr, payload));
        true
    }

    pub fn tx_queue_len(&self) -> usize {
        self.tx_queue.len()
    }

    pub fn stats(&self) -> AdapterStats {
        AdapterStats {
            dropped_frames: self.dropped_frames,
            tx_queue_len: self.tx_queue.len(),
            reset_attempt_count: self.reset_attempt_count,
            last_reset_ms: self.last_reset_ms,
            backoff_multiplier: self.backoff_multiplier,
        }
    }

    /// One TX pump cycle; call every [`TX_INTERVAL_MS`] while the queue is
    /// non-empty. Returns `true` if an interface reset should be attempted.
    pub fn tx_pump_tick(&mut self) -> bool {
        if self.backoff_ms > 0 {
            self.backoff_ms = self.backoff_ms.saturating_sub(TX_INTERVAL_MS);
            return false;
        }

        let Some(frame) = self.tx_queue.front().copied() else {
            return false;
        };

        let Some(sink) = self.sink.as_ref() else {
            return false;
        };

        match sink.try_send(&frame) {
            Ok(()) => {
                self.tx_queue.pop_front();
                self.backoff_multiplier = 0;
                self.diag_logged = false;
                self.consecutive_max_backoff = 0;
                self.dropped_frames = 0;
                false
            }
            Err(err) if is_backpressure(&err) => {
                self.backoff_ms = TX_BACKOFF_MS * (1u64 << self.backoff_multiplier);
                if self.backoff_multiplier < MAX_BACKOFF_MULTIPLIER {
                    self.backoff_multiplier += 1;
                }
                if self.backoff_multiplier == MAX_BACKOFF_MULTIPLIER {
                    self.consecutive_max_backoff += 1;
                    if !self.diag_logged {
                        self.diag_logged = true;
                        tracing::warn!(
                            ifname = %self.ifname,
                            "CAN TX stuck at max backoff — check for missing ACK peer, \
                             bitrate mismatch, missing 120 ohm termination, or bad wiring"
                        );
                    }
                }
                self.maybe_drop_and_reset()
            }
            Err(err) => {
                tracing::warn!(ifname = %self.ifname, error = %err, "CAN TX dropped a frame");
                self.tx_queue.pop_front();
                false
            }
        }
    }

    fn maybe_drop_and_reset(&mut self) -> bool {
        if self.consecutive_max_backoff < MAX_CONSECUTIVE_MAX_BACKOFF_RETRIES {
            return false;
        }
        self.tx_queue.pop_front();
        self.dropped_frames += 1;
        self.backoff_ms = 0;
        self.backoff_multiplier = 0;
        self.consecutive_max_backoff = 0;
        self.diag_logged = false;
        self.dropped_frames >= RESET_THRESHOLD
    }

    /// Drain every frame currently readable, without blocking.
    pub fn drain_readable(&self) -> Vec<RawFrame> {
        let Some(sink) = self.sink.as_ref() else {
            return Vec::new();
        };
        let mut frames = Vec::new();
        loop {
            match sink.try_recv() {
                Ok(frame) => frames.push(frame),
                Err(_) => break,
            }
        }
        frames
    }

    /// Reset the interface: close, `ip link down`, `ip link up`, reopen.
    /// Guarded by a cooldown, an attempt cap, and a re-entry flag.
    pub async fn try_reset_interface(&mut self, resetter: &dyn LinkResetter) -> CoreResult<()> {
        if self.resetting {
            return Ok(());
        }
        let now = self.clock.now_ms();
        if let Some(last) = self.last_reset_ms {
            if now - last < RESET_COOLDOWN_MS {
                return Ok(());
            }
        }
        if self.reset_attempt_count >= MAX_RESET_ATTEMPTS {
            return Ok(());
        }

        self.resetting = true;
        self.reset_attempt_count += 1;
        let timeout = Duration::from_millis(PROCESS_TIMEOUT_MS);

        let result = async {
            self.close();
            resetter.set_link_down(&self.ifname, timeout).await?;
            resetter.set_link_up(&self.ifname, timeout).await?;
            self.open()
        }
        .await;

        self.resetting = false;
        self.last_reset_ms = Some(now);

        match result {
            Ok(()) => {
                self.reset_attempt_count = 0;
                Ok(())
            }
            Err(err) => {
                // Zero the drop counter so the policy doesn't spin on a
                // dead interface; the cooldown still bounds retry rate.
                self.dropped_frames = 0;
                tracing::error!(ifname = %self.ifname, error = %err, "interface reset failed");
                Err(CoreError::ResetFailed(err.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::transport::mock::MockSink;
    use super::*;
    use crate::clock::SteppingClock;
    use rstest::rstest;
    use std::io;

    fn adapter() -> CanAdapter<MockSink> {
        let clock: Arc<dyn Clock> = Arc::new(SteppingClock::new(0));
        let mut a = CanAdapter::<MockSink>::new("can0", clock);
        a.open().unwrap();
        a
    }

    #[test]
    fn send_frame_rejects_when_closed() {
        let clock: Arc<dyn Clock> = Arc::new(SteppingClock::new(0));
        let mut a = CanAdapter::<MockSink>::new("can0", clock);
        assert!(!a.send_frame(0x101, &[1, 2, 3], false, false));
    }

    #[test]
    fn send_frame_rejects_oversized_payload() {
        let mut a = adapter();
        assert!(!a.send_frame(0x101, &[0u8; 9], false, false));
    }

    #[test]
    fn send_frame_rejects_at_capacity() {
        let mut a = adapter();
        for _ in 0..MAX_TX_QUEUE_SIZE {
            assert!(a.send_frame(0x101, &[0], false, false));
        }
        assert!(!a.send_frame(0x101, &[0], false, false));
    }

    #[rstest]
    fn successful_write_drains_queue_and_resets_backoff() {
        let mut a = adapter();
        a.send_frame(0x101, &[1, 2, 3], false, false);
        let reset_needed = a.tx_pump_tick();
        assert!(!reset_needed);
        assert_eq!(a.tx_queue_len(), 0);
    }

    #[test]
    fn persistent_enobufs_drops_after_max_consecutive_backoff_and_signals_reset() {
        let mut a = adapter();
        a.send_frame(0x101, &[1], false, false);

        for _ in 0..MAX_CONSECUTIVE_MAX_BACKOFF_RETRIES * 2 {
            a.sink.as_ref().unwrap().push_send_result(Err(io::Error::from_raw_os_error(libc::ENOBUFS)));
        }

        let mut reset_signalled = false;
        // Drive the multiplier all the way to the cap, then to the
        // consecutive-retry cap — each tick either backs off or, once
        // backoff has expired, re-attempts.
        for _ in 0..(MAX_BACKOFF_MULTIPLIER + MAX_CONSECUTIVE_MAX_BACKOFF_RETRIES + 2) {
            if a.tx_pump_tick() {
                reset_signalled = true;
                break;
            }
            // fast-forward past whatever backoff was just armed
            while a.backoff_ms > 0 {
                a.tx_pump_tick();
            }
        }

        assert!(reset_signalled, "reset threshold should have been reached");
        assert_eq!(a.tx_queue_len(), 0, "the stuck frame should have been dropped");
    }

    #[test]
    fn close_preserves_dropped_frame_and_reset_counters() {
        let mut a = adapter();
        a.dropped_frames = 7;
        a.reset_attempt_count = 2;
        a.last_reset_ms = Some(1_234);
        a.close();
        assert_eq!(a.dropped_frames, 7);
        assert_eq!(a.reset_attempt_count, 2);
        assert_eq!(a.last_reset_ms, Some(1_234));
        assert!(!a.is_open());
    }

    #[test]
    fn drain_readable_stops_at_would_block() {
        let a = adapter();
        a.sink.as_ref().unwrap().push_recv_frame(RawFrame::new(0x201, false, false, &[1]));
        a.sink.as_ref().unwrap().push_recv_frame(RawFrame::new(0x202, false, false, &[2]));
        let frames = a.drain_readable();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].can_id, 0x201);
        assert_eq!(frames[1].can_id, 0x202);
    }
}
