//! Adaptive send-side audio buffering.
//!
//! Device media frames arrive at an unpredictable cadence, and the provider
//! stalls when fed too granularly while large gulps hurt latency. The buffer
//! keeps the provider fed with coherent ~100 ms windows and refuses to pile
//! up more than ~1 s of unsent audio:
//!
//! - min-flush threshold `T_min` (1 600 bytes ≈ 100 ms @ 16 kHz mono s16le)
//! - max buffer `T_max` (16 000 bytes ≈ 1 s); excess chunks are dropped
//! - min inter-send interval `I` (100 ms)
//! - in-flight flag with stuck-flight timeout `S` (5 s)
//!
//! [`UploadBuffer`] is a pure state machine (the clock and the in-flight
//! elapsed time are passed in), so the boundary behavior is unit-testable;
//! [`spawn_upload_pump`] is the single writer task that drives it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::link::AiLinkSender;

#[derive(Debug, Clone)]
pub struct UploadConfig {
    pub min_flush: usize,
    pub max_buffer: usize,
    pub min_interval: Duration,
    pub stuck_flight: Duration,
    /// Capacity of the non-blocking ingress handoff.
    pub ingress_capacity: usize,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            min_flush: 1_600,
            max_buffer: 16_000,
            min_interval: Duration::from_millis(100),
            stuck_flight: Duration::from_secs(5),
            ingress_capacity: 64,
        }
    }
}

/// What a tick decided to do.
#[derive(Debug, PartialEq)]
pub enum TickAction {
    Idle,
    Flush(Vec<u8>),
    /// The previous send was stuck past `S`; the flag was force-cleared and
    /// the whole buffer drains in one gulp.
    StallRecovery(Vec<u8>),
}

pub struct UploadBuffer {
    cfg: UploadConfig,
    buf: Vec<u8>,
    last_flush: Option<Instant>,
    pub dropped_chunks: u64,
}

impl UploadBuffer {
    pub fn new(cfg: UploadConfig) -> Self {
        Self {
            cfg,
            buf: Vec::new(),
            last_flush: None,
            dropped_chunks: 0,
        }
    }

    pub fn pending_len(&self) -> usize {
        self.buf.len()
    }

    fn interval_ok(&self, now: Instant) -> bool {
        match self.last_flush {
            Some(at) => now.duration_since(at) >= self.cfg.min_interval,
            None => true,
        }
    }

    fn drain(&mut self, now: Instant) -> Vec<u8> {
        self.last_flush = Some(now);
        std::mem::take(&mut self.buf)
    }

    /// Append an incoming chunk. Returns bytes to send when the buffer
    /// reached `T_min` with no send outstanding (and `I` has elapsed, so the
    /// provider never sees two flushes closer than the floor).
    pub fn push(
        &mut self,
        chunk: &[u8],
        in_flight: Option<Duration>,
        now: Instant,
    ) -> Option<Vec<u8>> {
        if self.buf.len() + chunk.len() > self.cfg.max_buffer {
            self.dropped_chunks += 1;
            return None;
        }
        self.buf.extend_from_slice(chunk);

        if self.buf.len() >= self.cfg.min_flush && in_flight.is_none() && self.interval_ok(now) {
            return Some(self.drain(now));
        }
        None
    }

    /// Periodic (100 ms) pass: flush whatever is pending once `I` elapsed,
    /// unless a send is in flight, and break a flight stuck past `S`.
    pub fn tick(&mut self, in_flight: Option<Duration>, now: Instant) -> TickAction {
        if self.buf.is_empty() || !self.interval_ok(now) {
            return TickAction::Idle;
        }
        match in_flight {
            None => TickAction::Flush(self.drain(now)),
            Some(elapsed) if elapsed > self.cfg.stuck_flight => {
                TickAction::StallRecovery(self.drain(now))
            }
            Some(_) => TickAction::Idle,
        }
    }

    /// Cancellation path: whatever is left goes out once, best-effort.
    pub fn take_pending(&mut self) -> Option<Vec<u8>> {
        if self.buf.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.buf))
        }
    }
}

/// Shared in-flight flag. The upload pump marks it on every send; the demux
/// task clears it on every upstream response; transport errors clear it too.
#[derive(Default)]
pub struct Flight {
    since: Mutex<Option<Instant>>,
}

impl Flight {
    pub fn mark(&self, now: Instant) {
        *self.since.lock().unwrap_or_else(|e| e.into_inner()) = Some(now);
    }

    pub fn clear(&self) {
        *self.since.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    pub fn elapsed(&self, now: Instant) -> Option<Duration> {
        self.since
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .map(|since| now.duration_since(since))
    }
}

/// Ingress side of the upload path, handed to the device reader. `offer`
/// never blocks: a saturated pump loses the chunk and counts it.
#[derive(Clone)]
pub struct UploadHandle {
    tx: mpsc::Sender<Vec<u8>>,
    dropped: Arc<AtomicU64>,
}

impl UploadHandle {
    pub fn offer(&self, chunk: Vec<u8>) {
        if self.tx.try_send(chunk).is_err() {
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            if dropped % 50 == 1 {
                warn!(dropped, "Upload ingress saturated, dropping audio chunks");
            }
        }
    }

    #[cfg(test)]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Single writer task (U): drains the buffer toward the provider under the
/// flush rules. Ends on cancellation or when the upstream write side dies
/// (which trips the session token).
pub fn spawn_upload_pump(
    sender: Arc<AiLinkSender>,
    flight: Arc<Flight>,
    cancel: CancellationToken,
    cfg: UploadConfig,
) -> UploadHandle {
    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(cfg.ingress_capacity);
    let handle = UploadHandle {
        tx,
        dropped: Arc::new(AtomicU64::new(0)),
    };

    tokio::spawn(async move {
        let mut buffer = UploadBuffer::new(cfg);
        let mut ticker = tokio::time::interval(Duration::from_millis(100));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    if let Some(bytes) = buffer.take_pending() {
                        let _ = sender.send_audio(&bytes).await;
                    }
                    break;
                }
                maybe_chunk = rx.recv() => {
                    let Some(chunk) = maybe_chunk else { break };
                    let now = Instant::now();
                    if let Some(bytes) = buffer.push(&chunk, flight.elapsed(now), now) {
                        if send_flush(&sender, &flight, &bytes).await.is_err() {
                            cancel.cancel();
                            break;
                        }
                    }
                }
                _ = ticker.tick() => {
                    let now = Instant::now();
                    let action = buffer.tick(flight.elapsed(now), now);
                    let bytes = match action {
                        TickAction::Idle => continue,
                        TickAction::Flush(bytes) => bytes,
                        TickAction::StallRecovery(bytes) => {
                            warn!("Upstream send stuck past timeout, forcing progress");
                            flight.clear();
                            bytes
                        }
                    };
                    if send_flush(&sender, &flight, &bytes).await.is_err() {
                        cancel.cancel();
                        break;
                    }
                }
            }
        }
        debug!(dropped = buffer.dropped_chunks, "Upload pump finished");
    });

    handle
}

async fn send_flush(
    sender: &Arc<AiLinkSender>,
    flight: &Arc<Flight>,
    bytes: &[u8],
) -> anyhow::Result<()> {
    flight.mark(Instant::now());
    match sender.send_audio(bytes).await {
        Ok(()) => Ok(()),
        Err(e) => {
            flight.clear();
            warn!("Upstream audio send failed: {}", e);
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> UploadConfig {
        UploadConfig::default()
    }

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn below_min_flush_accumulates() {
        let mut buffer = UploadBuffer::new(cfg());
        let now = Instant::now();
        assert!(buffer.push(&[0u8; 320], None, now).is_none());
        assert!(buffer.push(&[0u8; 320], None, now).is_none());
        assert_eq!(buffer.pending_len(), 640);
    }

    #[test]
    fn exactly_min_flush_flushes_immediately() {
        let mut buffer = UploadBuffer::new(cfg());
        let now = Instant::now();
        for _ in 0..4 {
            assert!(buffer.push(&[0u8; 320], None, now).is_none());
        }
        let flushed = buffer.push(&[0u8; 320], None, now).expect("T_min reached");
        assert_eq!(flushed.len(), 1_600);
        assert_eq!(buffer.pending_len(), 0);
    }

    #[test]
    fn in_flight_blocks_push_flush() {
        let mut buffer = UploadBuffer::new(cfg());
        let now = Instant::now();
        assert!(buffer.push(&[0u8; 1_600], Some(ms(50)), now).is_none());
        assert_eq!(buffer.pending_len(), 1_600);
    }

    #[test]
    fn flushes_respect_min_interval() {
        let mut buffer = UploadBuffer::new(cfg());
        let start = Instant::now();
        assert!(buffer.push(&[0u8; 1_600], None, start).is_some());

        // 50 ms later another T_min worth arrives: too soon.
        let soon = start + ms(50);
        assert!(buffer.push(&[0u8; 1_600], None, soon).is_none());

        // At the interval floor it goes out.
        let later = start + ms(100);
        assert_eq!(buffer.tick(None, later), TickAction::Flush(vec![0u8; 1_600]));
    }

    #[test]
    fn tick_flushes_leftover_after_interval() {
        let mut buffer = UploadBuffer::new(cfg());
        let start = Instant::now();
        buffer.push(&[0u8; 300], None, start);

        // Buffer non-empty but nothing flushed yet; first tick may flush
        // immediately (no previous flush to space against).
        match buffer.tick(None, start + ms(100)) {
            TickAction::Flush(bytes) => assert_eq!(bytes.len(), 300),
            other => panic!("expected flush, got {:?}", other),
        }
    }

    #[test]
    fn tick_idle_while_in_flight_within_timeout() {
        let mut buffer = UploadBuffer::new(cfg());
        let start = Instant::now();
        buffer.push(&[0u8; 300], Some(ms(10)), start);
        assert_eq!(buffer.tick(Some(secs(3)), start + ms(200)), TickAction::Idle);
    }

    #[test]
    fn stuck_flight_past_timeout_drains_in_one_gulp() {
        let mut buffer = UploadBuffer::new(cfg());
        let start = Instant::now();

        // Fill to exactly T_max while a send is stuck.
        for _ in 0..50 {
            buffer.push(&[0u8; 320], Some(secs(1)), start);
        }
        assert_eq!(buffer.pending_len(), 16_000);

        // At exactly S the flight is not yet considered stuck.
        assert_eq!(
            buffer.tick(Some(secs(5)), start + secs(5)),
            TickAction::Idle
        );

        // Past S the whole buffer drains in one gulp.
        match buffer.tick(Some(secs(5) + ms(1)), start + secs(5)) {
            TickAction::StallRecovery(bytes) => assert_eq!(bytes.len(), 16_000),
            other => panic!("expected stall recovery, got {:?}", other),
        }
        assert_eq!(buffer.pending_len(), 0);
    }

    #[test]
    fn max_buffer_drops_excess_chunks() {
        let mut buffer = UploadBuffer::new(cfg());
        let start = Instant::now();
        for _ in 0..60 {
            buffer.push(&[0u8; 320], Some(secs(1)), start);
        }
        // 50 chunks fit exactly; 10 were refused.
        assert_eq!(buffer.pending_len(), 16_000);
        assert_eq!(buffer.dropped_chunks, 10);
    }

    #[test]
    fn no_flush_ever_exceeds_max_buffer() {
        let mut buffer = UploadBuffer::new(cfg());
        let mut now = Instant::now();
        let mut biggest = 0usize;
        // Stream 16 chunks/s of 320 B for a synthetic 3 s with a stuck
        // flight, then recover.
        for i in 0..48 {
            now += ms(20);
            if let Some(bytes) = buffer.push(&[0u8; 320], Some(ms(20 * i)), now) {
                biggest = biggest.max(bytes.len());
            }
        }
        if let TickAction::StallRecovery(bytes) = buffer.tick(Some(secs(6)), now + ms(100)) {
            biggest = biggest.max(bytes.len());
        }
        assert!(biggest <= 16_000, "flush of {} exceeded T_max", biggest);
    }

    #[test]
    fn take_pending_empties_the_buffer_once() {
        let mut buffer = UploadBuffer::new(cfg());
        buffer.push(&[0u8; 300], None, Instant::now());
        assert_eq!(buffer.take_pending().map(|b| b.len()), Some(300));
        assert!(buffer.take_pending().is_none());
    }

    #[test]
    fn flight_marks_and_clears() {
        let flight = Flight::default();
        let now = Instant::now();
        assert!(flight.elapsed(now).is_none());
        flight.mark(now);
        assert_eq!(flight.elapsed(now + secs(2)), Some(secs(2)));
        flight.clear();
        assert!(flight.elapsed(now).is_none());
    }

    #[tokio::test]
    async fn offer_drops_when_ingress_saturated() {
        let (tx, rx) = mpsc::channel(2);
        let handle = UploadHandle {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        };
        // Nobody drains rx; the third offer must not block.
        handle.offer(vec![0u8; 10]);
        handle.offer(vec![0u8; 10]);
        handle.offer(vec![0u8; 10]);
        assert_eq!(handle.dropped(), 1);
        drop(rx);
    }
}
