use crate::engine::client::ServerClient;
use crate::engine::pacing::Pacer;
use crate::engine::streams::{StreamHandle, StreamManager};
use crate::error::EngineError;
use crate::model::{Direction, StreamId};
use bytes::Bytes;
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use rand::{Rng, RngCore, SeedableRng};
use reqwest::StatusCode;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

/// Error streak on one stream that triggers a pending reduction.
const MAX_CONSECUTIVE_ERRORS: u32 = 3;
/// Delay multiplier cap under back-pressure.
const MAX_DELAY_MS: u64 = 500;
/// Smallest chunk the 413 path will shrink to.
const MIN_CHUNK_BYTES: u64 = 64 * 1024;
/// Granularity of body production; counting happens per sub-chunk.
const BODY_SUBCHUNK: usize = 64 * 1024;
/// Maximum jitter added between consecutive POSTs on one stream.
const POST_JITTER_MS: u64 = 20;
/// Minimum spacing between latency-driven reductions.
const RTT_RECOVERY_WINDOW: Duration = Duration::from_millis(500);
/// Response-time samples in the "recent" window.
const RECENT_RESPONSES: usize = 5;
/// Response-time samples in the trailing comparison window.
const TRAILING_RESPONSES: usize = 20;

/// Pre-generated random upload payloads, shared by every stream.
///
/// Buffers are filled once per test from a deterministically-seeded PRNG
/// (seeded from OS entropy) and handed out as cheap `Bytes` slices, so no
/// request pays allocation or PRNG cost.
pub struct ChunkPool {
    slots: Vec<Bytes>,
    slot_bytes: usize,
}

impl ChunkPool {
    pub fn generate(slots: usize, slot_bytes: usize) -> Self {
        let seed: u64 = rand::thread_rng().gen();
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        let slots = (0..slots)
            .map(|_| {
                let mut buf = vec![0u8; slot_bytes];
                rng.fill_bytes(&mut buf);
                Bytes::from(buf)
            })
            .collect();
        Self { slots, slot_bytes }
    }

    /// Cyclic lookup; `len` is clamped to the slot size.
    pub fn chunk(&self, index: usize, len: u64) -> Bytes {
        let slot = &self.slots[index % self.slots.len()];
        let len = (len as usize).min(self.slot_bytes);
        slot.slice(..len)
    }

    pub fn slot_bytes(&self) -> usize {
        self.slot_bytes
    }
}

#[derive(Default)]
struct ResponseTimes {
    window: VecDeque<f64>,
}

impl ResponseTimes {
    fn push(&mut self, ms: f64) {
        self.window.push_back(ms);
        while self.window.len() > RECENT_RESPONSES + TRAILING_RESPONSES {
            self.window.pop_front();
        }
    }

    /// (recent mean, trailing mean), once both windows are populated.
    fn means(&self) -> Option<(f64, f64)> {
        if self.window.len() < RECENT_RESPONSES + TRAILING_RESPONSES {
            return None;
        }
        let n = self.window.len();
        let recent: f64 =
            self.window.iter().skip(n - RECENT_RESPONSES).sum::<f64>() / RECENT_RESPONSES as f64;
        let trailing: f64 = self
            .window
            .iter()
            .take(n - RECENT_RESPONSES)
            .sum::<f64>()
            / (n - RECENT_RESPONSES) as f64;
        Some((recent, trailing))
    }
}

/// Live upload knobs, shared between the run task (policy) and the spawned
/// stream workers (consumers). All adjustments respect the frozen flag so
/// the bidirectional phase runs on exactly the discovered parameters.
pub struct UploadTuning {
    pending: AtomicUsize,
    delay_ms: AtomicU64,
    base_delay_ms: AtomicU64,
    chunk_size: AtomicU64,
    frozen: AtomicBool,
    responses: Mutex<ResponseTimes>,
}

impl UploadTuning {
    pub fn new(pending: usize, delay_ms: u64, chunk_size: u64) -> Arc<Self> {
        Arc::new(Self {
            pending: AtomicUsize::new(pending.max(1)),
            delay_ms: AtomicU64::new(delay_ms),
            base_delay_ms: AtomicU64::new(delay_ms),
            chunk_size: AtomicU64::new(chunk_size.max(MIN_CHUNK_BYTES)),
            frozen: AtomicBool::new(false),
            responses: Mutex::new(ResponseTimes::default()),
        })
    }

    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Relaxed)
    }

    pub fn delay_ms(&self) -> u64 {
        self.delay_ms.load(Ordering::Relaxed)
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size.load(Ordering::Relaxed)
    }

    pub fn set_frozen(&self, frozen: bool) {
        self.frozen.store(frozen, Ordering::Relaxed);
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::Relaxed)
    }

    /// Replace every knob at once; used when adopting warmup output.
    pub fn adopt(&self, pending: usize, delay_ms: u64, chunk_size: u64) {
        self.pending.store(pending.max(1), Ordering::Relaxed);
        self.delay_ms.store(delay_ms, Ordering::Relaxed);
        self.base_delay_ms.store(delay_ms, Ordering::Relaxed);
        self.chunk_size
            .store(chunk_size.max(MIN_CHUNK_BYTES), Ordering::Relaxed);
    }

    fn reduce_pending(&self, by: usize) {
        let _ = self
            .pending
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |p| {
                Some(p.saturating_sub(by).max(1))
            });
    }

    fn double_delay(&self) {
        let _ = self
            .delay_ms
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |d| {
                Some((d.max(1) * 2).min(MAX_DELAY_MS))
            });
    }

    /// Server rejected or failed a request: halve the pending window and
    /// double the delay; an oversized-body rejection also halves the chunk.
    pub fn on_backpressure(&self, status: StatusCode) {
        if self.is_frozen() {
            return;
        }
        let _ = self
            .pending
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |p| {
                Some((p / 2).max(1))
            });
        self.double_delay();
        if status == StatusCode::PAYLOAD_TOO_LARGE {
            let _ = self
                .chunk_size
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |c| {
                    Some((c / 2).max(MIN_CHUNK_BYTES))
                });
        }
        tracing::debug!(
            status = status.as_u16(),
            pending = self.pending(),
            delay_ms = self.delay_ms(),
            chunk = self.chunk_size(),
            "upload back-pressure applied"
        );
    }

    /// A stream hit `MAX_CONSECUTIVE_ERRORS`: shed one pending slot.
    pub fn on_error_streak(&self) {
        if self.is_frozen() {
            return;
        }
        self.reduce_pending(1);
    }

    /// Track a server response time and react when the recent mean runs
    /// 1.5x above an already-slow trailing mean.
    pub fn record_response_time(&self, ms: f64) {
        let slow = {
            let mut r = self.responses.lock().unwrap();
            r.push(ms);
            matches!(r.means(), Some((recent, trailing))
                if trailing > 100.0 && recent > 1.5 * trailing)
        };
        if slow && !self.is_frozen() {
            self.reduce_pending(1);
            let _ = self
                .delay_ms
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |d| {
                    Some(((d.max(1) as f64 * 1.2) as u64).min(MAX_DELAY_MS))
                });
            tracing::debug!(
                pending = self.pending(),
                delay_ms = self.delay_ms(),
                "server responses slowing; shedding upload pressure"
            );
        }
    }

    /// Generic force-backoff: scale the pending window down by `factor`.
    pub fn apply_backoff(&self, factor: f64) {
        if self.is_frozen() {
            return;
        }
        let _ = self
            .pending
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |p| {
                Some(((p as f64 * factor).floor() as usize).max(1))
            });
        self.double_delay();
    }

    /// Ease the delay back toward its base once pressure clears.
    fn relax_delay(&self) {
        let base = self.base_delay_ms.load(Ordering::Relaxed);
        let _ = self
            .delay_ms
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |d| {
                Some(((d as f64 * 0.9) as u64).max(base))
            });
    }
}

/// Latency-aware pacing state; lives on the run task.
pub struct LatencyGovernor {
    last_reduction: Option<Instant>,
    last_breach: Option<Instant>,
}

impl LatencyGovernor {
    pub fn new() -> Self {
        Self {
            last_reduction: None,
            last_breach: None,
        }
    }

    /// Feed one RTT observation. Above the threshold: geometric delay
    /// growth and one pending reduction, rate-limited to the recovery
    /// window. Below it for a full window: relax the delay.
    pub fn on_latency(&mut self, tuning: &UploadTuning, rtt_ms: f64, threshold_ms: f64) {
        if tuning.is_frozen() {
            return;
        }
        let now = Instant::now();
        if rtt_ms > threshold_ms {
            self.last_breach = Some(now);
            let due = match self.last_reduction {
                None => true,
                Some(t) => now.saturating_duration_since(t) >= RTT_RECOVERY_WINDOW,
            };
            if due {
                tuning.reduce_pending(1);
                tuning.double_delay();
                self.last_reduction = Some(now);
                tracing::debug!(
                    rtt_ms,
                    threshold_ms,
                    pending = tuning.pending(),
                    "rtt over threshold; reducing upload pressure"
                );
            }
        } else if let Some(breach) = self.last_breach {
            if now.saturating_duration_since(breach) >= RTT_RECOVERY_WINDOW {
                tuning.relax_delay();
            }
        }
    }
}

impl Default for LatencyGovernor {
    fn default() -> Self {
        Self::new()
    }
}

/// Maintains up to `pending` concurrent POSTs per stream from the shared
/// chunk pool, with delay-and-jitter pacing between launches.
pub struct UploadEngine {
    client: ServerClient,
    pool: Arc<ChunkPool>,
    tuning: Arc<UploadTuning>,
    pacer: Arc<Pacer>,
    max_body_bytes: u64,
}

impl UploadEngine {
    pub fn new(
        client: ServerClient,
        pool: Arc<ChunkPool>,
        tuning: Arc<UploadTuning>,
        pacer: Arc<Pacer>,
        max_body_bytes: u64,
    ) -> Self {
        Self {
            client,
            pool,
            tuning,
            pacer,
            max_body_bytes,
        }
    }

    pub fn tuning(&self) -> &Arc<UploadTuning> {
        &self.tuning
    }

    pub fn swap_pacer(&mut self, pacer: Arc<Pacer>) {
        self.pacer = pacer;
    }

    pub fn spawn_streams(
        &self,
        mgr: &mut StreamManager,
        count: usize,
        request_timeout: Option<Duration>,
    ) -> Vec<StreamId> {
        (0..count)
            .map(|_| self.spawn_stream(mgr, request_timeout))
            .collect()
    }

    pub fn spawn_stream(
        &self,
        mgr: &mut StreamManager,
        request_timeout: Option<Duration>,
    ) -> StreamId {
        let handle = mgr.create(Direction::Upload);
        let id = handle.id;
        let worker = StreamWorker {
            handle,
            client: self.client.clone(),
            pool: self.pool.clone(),
            tuning: self.tuning.clone(),
            pacer: self.pacer.clone(),
            max_body_bytes: self.max_body_bytes,
            request_timeout,
        };
        let task = tokio::spawn(worker.run());
        mgr.attach_task(id, Direction::Upload, task);
        id
    }
}

struct StreamWorker {
    handle: StreamHandle,
    client: ServerClient,
    pool: Arc<ChunkPool>,
    tuning: Arc<UploadTuning>,
    pacer: Arc<Pacer>,
    max_body_bytes: u64,
    request_timeout: Option<Duration>,
}

impl StreamWorker {
    async fn run(self) {
        let mut in_flight = FuturesUnordered::new();
        let mut chunk_idx = 0usize;
        let mut consecutive_errors = 0u32;

        'outer: loop {
            if self.handle.is_cancelled() {
                break;
            }

            // Top up the pending window.
            while in_flight.len() < self.tuning.pending() {
                if self.handle.is_cancelled() {
                    break 'outer;
                }
                let body_len = self.tuning.chunk_size().min(self.max_body_bytes);
                if let Some(wait) = self.pacer.debit(body_len) {
                    tokio::time::sleep(wait).await;
                }
                in_flight.push(self.send_one(chunk_idx, body_len));
                chunk_idx += 1;

                let delay = self.tuning.delay_ms()
                    + rand::thread_rng().gen_range(0..=POST_JITTER_MS);
                if delay > 0 {
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
            }

            tokio::select! {
                res = in_flight.next(), if !in_flight.is_empty() => {
                    match res {
                        Some(Ok((status, elapsed_ms))) => {
                            if status.is_success() {
                                consecutive_errors = 0;
                                self.tuning.record_response_time(elapsed_ms);
                            } else {
                                if matches!(
                                    status,
                                    StatusCode::PAYLOAD_TOO_LARGE
                                        | StatusCode::TOO_MANY_REQUESTS
                                        | StatusCode::INTERNAL_SERVER_ERROR
                                        | StatusCode::SERVICE_UNAVAILABLE
                                ) {
                                    let err = EngineError::ServerBackpressure {
                                        status: status.as_u16(),
                                    };
                                    tracing::debug!(stream_id = %self.handle.id, error = %err, "upload rejected");
                                    self.tuning.on_backpressure(status);
                                }
                                consecutive_errors += 1;
                            }
                        }
                        Some(Err(e)) => {
                            if self.handle.is_cancelled() {
                                tracing::debug!(stream_id = %self.handle.id, "upload cancelled");
                                break 'outer;
                            }
                            tracing::warn!(stream_id = %self.handle.id, error = %e, "upload request failed");
                            consecutive_errors += 1;
                        }
                        None => {}
                    }
                    if consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                        self.tuning.on_error_streak();
                        consecutive_errors = 0;
                    }
                }
                // Cancellation poll while the window is full or idle.
                _ = tokio::time::sleep(Duration::from_millis(10)) => {}
            }
        }
        // Dropping in_flight aborts any outstanding request bodies.
    }

    /// Issue one POST whose body streams the pooled chunk in sub-chunks,
    /// counting bytes as they are produced for the wire.
    fn send_one(
        &self,
        chunk_idx: usize,
        body_len: u64,
    ) -> impl std::future::Future<Output = Result<(StatusCode, f64), reqwest::Error>> {
        let chunk = self.pool.chunk(chunk_idx, body_len);
        let handle = self.handle.clone();
        let client = self.client.load.clone();
        let url = self.client.upload_url();
        let timeout = self.request_timeout;

        async move {
            let counted = futures::stream::iter(
                (0..chunk.len())
                    .step_by(BODY_SUBCHUNK)
                    .map(move |off| {
                        let end = (off + BODY_SUBCHUNK).min(chunk.len());
                        chunk.slice(off..end)
                    })
                    .collect::<Vec<_>>(),
            )
            .map(move |piece| {
                handle.record_bytes(piece.len() as u64);
                Ok::<Bytes, std::io::Error>(piece)
            });

            let body = reqwest::Body::wrap_stream(counted);
            let started = Instant::now();
            let mut req = client
                .post(url)
                .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
                .body(body);
            if let Some(t) = timeout {
                req = req.timeout(t);
            }
            let resp = req.send().await?;
            let status = resp.status();
            // Drain and drop; the body carries nothing the client uses.
            let _ = resp.bytes().await;
            Ok((status, started.elapsed().as_secs_f64() * 1000.0))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_pool_slices_cyclically() {
        let pool = ChunkPool::generate(4, 1024);
        let a = pool.chunk(0, 512);
        let b = pool.chunk(4, 512);
        assert_eq!(a.len(), 512);
        // Index 4 wraps to slot 0; identical contents.
        assert_eq!(a, b);
        // Oversized requests clamp to the slot.
        assert_eq!(pool.chunk(1, 10_000).len(), 1024);
    }

    #[test]
    fn pool_slots_are_random_but_stable() {
        let pool = ChunkPool::generate(2, 256);
        let first = pool.chunk(0, 256);
        let again = pool.chunk(0, 256);
        assert_eq!(first, again);
        // Slots differ from each other (256 identical bytes would mean a
        // broken fill).
        assert_ne!(pool.chunk(0, 256), pool.chunk(1, 256));
    }

    #[test]
    fn backpressure_halves_pending_and_doubles_delay() {
        let t = UploadTuning::new(8, 20, 1024 * 1024);
        t.on_backpressure(StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(t.pending(), 4);
        assert_eq!(t.delay_ms(), 40);
        // Chunk untouched for non-413.
        assert_eq!(t.chunk_size(), 1024 * 1024);

        t.on_backpressure(StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(t.pending(), 2);
        assert_eq!(t.chunk_size(), 512 * 1024);
    }

    #[test]
    fn backpressure_floors_and_caps() {
        let t = UploadTuning::new(1, 400, MIN_CHUNK_BYTES);
        for _ in 0..5 {
            t.on_backpressure(StatusCode::PAYLOAD_TOO_LARGE);
        }
        assert_eq!(t.pending(), 1);
        assert_eq!(t.delay_ms(), MAX_DELAY_MS);
        assert_eq!(t.chunk_size(), MIN_CHUNK_BYTES);
    }

    #[test]
    fn repeated_413_converges_under_128k() {
        let t = UploadTuning::new(8, 0, 1024 * 1024);
        for _ in 0..4 {
            t.on_backpressure(StatusCode::PAYLOAD_TOO_LARGE);
        }
        assert!(t.chunk_size() <= 128 * 1024);
        assert_eq!(t.pending(), 1);
    }

    #[test]
    fn frozen_tuning_ignores_all_adjustments() {
        let t = UploadTuning::new(8, 20, 1024 * 1024);
        t.set_frozen(true);
        t.on_backpressure(StatusCode::SERVICE_UNAVAILABLE);
        t.on_error_streak();
        t.apply_backoff(0.5);
        assert_eq!(t.pending(), 8);
        assert_eq!(t.delay_ms(), 20);
        assert_eq!(t.chunk_size(), 1024 * 1024);
    }

    #[test]
    fn error_streak_sheds_one_slot() {
        let t = UploadTuning::new(5, 0, 1024 * 1024);
        t.on_error_streak();
        assert_eq!(t.pending(), 4);
        // Floors at one.
        for _ in 0..10 {
            t.on_error_streak();
        }
        assert_eq!(t.pending(), 1);
    }

    #[test]
    fn slow_responses_shed_pressure() {
        let t = UploadTuning::new(6, 10, 1024 * 1024);
        // Trailing window: comfortably slow baseline above 100 ms.
        for _ in 0..TRAILING_RESPONSES {
            t.record_response_time(150.0);
        }
        // Recent window: 2x the trailing mean.
        for _ in 0..RECENT_RESPONSES {
            t.record_response_time(300.0);
        }
        assert!(t.pending() < 6);
        assert!(t.delay_ms() > 10);
    }

    #[test]
    fn fast_responses_do_not_trigger() {
        let t = UploadTuning::new(6, 10, 1024 * 1024);
        for _ in 0..(TRAILING_RESPONSES + RECENT_RESPONSES) {
            t.record_response_time(20.0);
        }
        assert_eq!(t.pending(), 6);
    }

    #[test]
    fn force_backoff_scales_pending() {
        let t = UploadTuning::new(10, 10, 1024 * 1024);
        t.apply_backoff(0.85);
        assert_eq!(t.pending(), 8);
        t.apply_backoff(0.1);
        assert_eq!(t.pending(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn governor_rate_limits_reductions() {
        let t = UploadTuning::new(10, 10, 1024 * 1024);
        let mut gov = LatencyGovernor::new();

        gov.on_latency(&t, 900.0, 100.0);
        assert_eq!(t.pending(), 9);

        // Immediately after, a second breach is absorbed.
        gov.on_latency(&t, 900.0, 100.0);
        assert_eq!(t.pending(), 9);

        // After the recovery window another reduction is allowed.
        tokio::time::advance(RTT_RECOVERY_WINDOW).await;
        gov.on_latency(&t, 900.0, 100.0);
        assert_eq!(t.pending(), 8);
    }

    #[tokio::test(start_paused = true)]
    async fn governor_relaxes_after_recovery() {
        let t = UploadTuning::new(10, 10, 1024 * 1024);
        let mut gov = LatencyGovernor::new();
        gov.on_latency(&t, 900.0, 100.0);
        let inflated = t.delay_ms();
        assert!(inflated > 10);

        tokio::time::advance(RTT_RECOVERY_WINDOW * 2).await;
        gov.on_latency(&t, 50.0, 100.0);
        assert!(t.delay_ms() <= inflated);
    }

    #[tokio::test(start_paused = true)]
    async fn governor_is_inert_when_frozen() {
        let t = UploadTuning::new(10, 10, 1024 * 1024);
        t.set_frozen(true);
        let mut gov = LatencyGovernor::new();
        gov.on_latency(&t, 900.0, 100.0);
        assert_eq!(t.pending(), 10);
        assert_eq!(t.delay_ms(), 10);
    }

    #[test]
    fn adopt_replaces_all_knobs() {
        let t = UploadTuning::new(1, 50, MIN_CHUNK_BYTES);
        t.adopt(20, 5, 4 * 1024 * 1024);
        assert_eq!(t.pending(), 20);
        assert_eq!(t.delay_ms(), 5);
        assert_eq!(t.chunk_size(), 4 * 1024 * 1024);
    }
}
