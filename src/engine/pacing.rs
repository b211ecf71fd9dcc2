use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Shortest pause a paced sender will take.
pub const MIN_WAIT_MS: u64 = 5;
/// Longest pause a paced sender will take, regardless of deficit.
pub const MAX_WAIT_MS: u64 = 50;

/// Bucket capacity in milliseconds of target throughput.
const CAPACITY_MS: f64 = 3000.0;

/// Fraction of the discovered peak granted to saturation load; the rest is
/// reserved for the latency probe.
pub const BASE_HEADROOM: f64 = 0.95;
/// Headroom floor under sustained RTT breaches.
const MIN_HEADROOM: f64 = 0.6;
/// Multiplicative step applied to the headroom per adjustment.
const HEADROOM_STEP: f64 = 0.9;
/// Minimum spacing between reservation adjustments.
const ADJUST_WINDOW: Duration = Duration::from_millis(500);

/// Token-bucket pacer shared by the transfer workers of one direction.
///
/// Reserves headroom for the latency probe: when a target rate is set the
/// workers withhold data once the bucket drains, with waits clamped to
/// [MIN_WAIT_MS, MAX_WAIT_MS]. With no target the pacer is a no-op.
#[derive(Debug)]
pub struct Pacer {
    inner: Option<Mutex<Bucket>>,
}

#[derive(Debug)]
struct Bucket {
    rate_bytes_per_ms: f64,
    capacity_bytes: f64,
    tokens: f64,
    last_refill: Instant,
}

impl Pacer {
    /// Unpaced: every `debit` returns no wait.
    pub fn unlimited() -> Self {
        Self { inner: None }
    }

    pub fn with_target(target_bytes_per_ms: f64) -> Self {
        if target_bytes_per_ms <= 0.0 {
            return Self::unlimited();
        }
        let capacity = target_bytes_per_ms * CAPACITY_MS;
        Self {
            inner: Some(Mutex::new(Bucket {
                rate_bytes_per_ms: target_bytes_per_ms,
                capacity_bytes: capacity,
                tokens: capacity,
                last_refill: Instant::now(),
            })),
        }
    }

    /// Pacer targeting `mbps` megabits per second.
    pub fn with_target_mbps(mbps: f64) -> Self {
        Self::with_target(mbps * 1e6 / 8.0 / 1000.0)
    }

    pub fn is_limited(&self) -> bool {
        self.inner.is_some()
    }

    /// Charge `bytes` against the bucket; returns how long the caller must
    /// sleep before sending, if the bucket is under-filled.
    pub fn debit(&self, bytes: u64) -> Option<Duration> {
        self.debit_at(bytes, Instant::now())
    }

    fn debit_at(&self, bytes: u64, now: Instant) -> Option<Duration> {
        let inner = self.inner.as_ref()?;
        let mut b = inner.lock().unwrap();

        let elapsed_ms = now.saturating_duration_since(b.last_refill).as_secs_f64() * 1000.0;
        b.tokens = (b.tokens + elapsed_ms * b.rate_bytes_per_ms).min(b.capacity_bytes);
        b.last_refill = now;

        b.tokens -= bytes as f64;
        if b.tokens >= 0.0 {
            return None;
        }
        let deficit_ms = -b.tokens / b.rate_bytes_per_ms;
        let wait_ms = (deficit_ms.ceil() as u64).clamp(MIN_WAIT_MS, MAX_WAIT_MS);
        Some(Duration::from_millis(wait_ms))
    }

    /// Retarget a limited pacer while senders keep drawing from it. The
    /// capacity scales with the new rate and banked tokens are clamped so a
    /// shrink takes effect immediately. No-op on an unlimited pacer.
    pub fn set_rate(&self, target_bytes_per_ms: f64) {
        let Some(inner) = self.inner.as_ref() else {
            return;
        };
        if target_bytes_per_ms <= 0.0 {
            return;
        }
        let mut b = inner.lock().unwrap();
        b.rate_bytes_per_ms = target_bytes_per_ms;
        b.capacity_bytes = target_bytes_per_ms * CAPACITY_MS;
        b.tokens = b.tokens.min(b.capacity_bytes);
    }

    pub fn set_rate_mbps(&self, mbps: f64) {
        self.set_rate(mbps * 1e6 / 8.0 / 1000.0);
    }

    /// Current target in Mbps; `None` when unlimited.
    pub fn target_mbps(&self) -> Option<f64> {
        let inner = self.inner.as_ref()?;
        let b = inner.lock().unwrap();
        Some(b.rate_bytes_per_ms * 8.0 * 1000.0 / 1e6)
    }
}

/// RTT-driven probe reservation for one direction's saturation pacer.
///
/// The pacer starts at [`BASE_HEADROOM`] of the discovered peak. While RTT
/// breaches the latency threshold the headroom steps down (growing the
/// share reserved for the probe), floored at 60% of peak; once RTT stays
/// under the threshold for a full window it eases back toward the base.
/// Adjustments are rate-limited so one bad probe cannot whipsaw the target.
pub struct ReservationController {
    peak_mbps: f64,
    headroom: f64,
    last_adjust: Option<Instant>,
    last_breach: Option<Instant>,
}

impl ReservationController {
    pub fn new(peak_mbps: f64) -> Self {
        Self {
            peak_mbps,
            headroom: BASE_HEADROOM,
            last_adjust: None,
            last_breach: None,
        }
    }

    pub fn headroom(&self) -> f64 {
        self.headroom
    }

    /// Feed one RTT observation and retarget the pacer if warranted.
    pub fn on_latency(&mut self, pacer: &Pacer, rtt_ms: f64, threshold_ms: f64) {
        if !pacer.is_limited() || self.peak_mbps <= 0.0 {
            return;
        }
        let now = Instant::now();
        let due = self
            .last_adjust
            .map(|t| now.saturating_duration_since(t) >= ADJUST_WINDOW)
            .unwrap_or(true);

        if rtt_ms > threshold_ms {
            self.last_breach = Some(now);
            if due {
                self.headroom = (self.headroom * HEADROOM_STEP).max(MIN_HEADROOM);
                pacer.set_rate_mbps(self.peak_mbps * self.headroom);
                self.last_adjust = Some(now);
                tracing::debug!(
                    rtt_ms,
                    threshold_ms,
                    headroom = self.headroom,
                    "rtt over threshold; growing probe reservation"
                );
            }
        } else if self.headroom < BASE_HEADROOM {
            let recovered = self
                .last_breach
                .map(|t| now.saturating_duration_since(t) >= ADJUST_WINDOW)
                .unwrap_or(true);
            if recovered && due {
                self.headroom = (self.headroom / HEADROOM_STEP).min(BASE_HEADROOM);
                pacer.set_rate_mbps(self.peak_mbps * self.headroom);
                self.last_adjust = Some(now);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unlimited_never_waits() {
        let p = Pacer::unlimited();
        assert!(!p.is_limited());
        assert!(p.debit(u64::MAX / 2).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn full_bucket_absorbs_a_burst() {
        // 1000 bytes/ms target -> 3 MB capacity.
        let p = Pacer::with_target(1000.0);
        assert!(p.debit(1_000_000).is_none());
        assert!(p.debit(1_000_000).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn drained_bucket_clamps_waits() {
        let p = Pacer::with_target(10.0); // 10 bytes/ms, 30 KB capacity
        let now = Instant::now();
        // Drain the bucket plus a deep deficit in one shot.
        let wait = p.debit_at(1_000_000, now).unwrap();
        assert_eq!(wait, Duration::from_millis(MAX_WAIT_MS));

        // A tiny overdraft waits at least the floor.
        let p = Pacer::with_target(10.0);
        let now = Instant::now();
        p.debit_at(30_000, now);
        let wait = p.debit_at(1, now).unwrap();
        assert!(wait >= Duration::from_millis(MIN_WAIT_MS));
        assert!(wait <= Duration::from_millis(MAX_WAIT_MS));
    }

    #[tokio::test(start_paused = true)]
    async fn bucket_refills_linearly() {
        let p = Pacer::with_target(100.0); // 100 bytes/ms
        let start = Instant::now();
        // Empty the bucket (capacity 300_000).
        assert!(p.debit_at(300_000, start).is_none());
        assert!(p.debit_at(1000, start).is_some());

        // After 100 ms, 10_000 bytes of credit exist again.
        let later = start + Duration::from_millis(100);
        assert!(p.debit_at(9_000, later).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn set_rate_changes_refill_speed_in_place() {
        let p = Pacer::with_target(100.0);
        let start = Instant::now();
        assert!(p.debit_at(300_000, start).is_none()); // drained

        // Ten times the rate: 10 ms now banks 10_000 bytes.
        p.set_rate(1000.0);
        let later = start + Duration::from_millis(10);
        assert!(p.debit_at(9_000, later).is_none());
    }

    #[test]
    fn set_rate_on_unlimited_is_a_noop() {
        let u = Pacer::unlimited();
        u.set_rate(5.0);
        assert!(!u.is_limited());
        assert!(u.target_mbps().is_none());
        assert!(u.debit(u64::MAX / 4).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn target_mbps_round_trips() {
        let p = Pacer::with_target_mbps(80.0);
        assert!((p.target_mbps().unwrap() - 80.0).abs() < 1e-9);
        p.set_rate_mbps(40.0);
        assert!((p.target_mbps().unwrap() - 40.0).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn reservation_grows_on_breach_and_is_rate_limited() {
        let pacer = Pacer::with_target_mbps(100.0 * BASE_HEADROOM);
        let mut res = ReservationController::new(100.0);
        let base_target = pacer.target_mbps().unwrap();

        res.on_latency(&pacer, 900.0, 120.0);
        let shrunk = pacer.target_mbps().unwrap();
        assert!(shrunk < base_target);
        assert!((res.headroom() - BASE_HEADROOM * 0.9).abs() < 1e-9);

        // An immediate second breach is absorbed by the window.
        res.on_latency(&pacer, 900.0, 120.0);
        assert!((pacer.target_mbps().unwrap() - shrunk).abs() < 1e-9);

        // After the window a further breach shrinks again.
        tokio::time::advance(Duration::from_millis(500)).await;
        res.on_latency(&pacer, 900.0, 120.0);
        assert!(pacer.target_mbps().unwrap() < shrunk);
    }

    #[tokio::test(start_paused = true)]
    async fn reservation_floors_then_recovers() {
        let pacer = Pacer::with_target_mbps(100.0 * BASE_HEADROOM);
        let mut res = ReservationController::new(100.0);

        // Sustained breaches walk the headroom to its floor.
        for _ in 0..20 {
            res.on_latency(&pacer, 900.0, 120.0);
            tokio::time::advance(Duration::from_millis(500)).await;
        }
        assert!((res.headroom() - 0.6).abs() < 1e-9);
        let floored = pacer.target_mbps().unwrap();
        assert!((floored - 60.0).abs() < 0.5);

        // Quiet RTT for a full window eases the target back up.
        res.on_latency(&pacer, 30.0, 120.0);
        assert!(pacer.target_mbps().unwrap() > floored);
        assert!(res.headroom() <= BASE_HEADROOM);
    }

    #[tokio::test(start_paused = true)]
    async fn reservation_ignores_unlimited_pacers() {
        let pacer = Pacer::unlimited();
        let mut res = ReservationController::new(100.0);
        res.on_latency(&pacer, 900.0, 120.0);
        assert!((res.headroom() - BASE_HEADROOM).abs() < 1e-9);
        assert!(pacer.target_mbps().is_none());
    }
}
