use crate::engine::streams::StreamManager;
use crate::model::{Direction, Phase, StreamId, TestEvent, ThroughputSample};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::Instant;

/// Raw samples kept in the moving-average window.
const SMOOTHING_WINDOW: usize = 5;
/// Exponential moving average weight for the newest windowed value.
const EMA_ALPHA: f64 = 0.3;
/// Raw readings above this multiple of the previous smoothed value clamp.
const OUTLIER_FACTOR: f64 = 5.0;
/// Outlier capping only engages once the smoothed value clears this floor.
const OUTLIER_FLOOR_MBPS: f64 = 1.0;
/// Zero-byte ticks tolerated before interpolation kicks in.
const MAX_ZERO_TICKS: u32 = 3;
/// Per-tick decay applied to the last valid value while interpolating.
const INTERPOLATION_DECAY: f64 = 0.9;

#[derive(Default)]
struct DirState {
    prev_streams: HashMap<StreamId, u64>,
    prev_retired: u64,
    raw_window: VecDeque<f64>,
    smoothed: Option<f64>,
    zero_ticks: u32,
    last_valid_mbps: f64,
    last_elapsed_ms: f64,
}

/// Reads per-stream byte counters at a fixed cadence and publishes
/// smoothed, phase-tagged throughput samples.
///
/// Phase transitions never reset the accounting: session byte totals and
/// per-stream deltas carry straight across a boundary.
pub struct ThroughputSampler {
    test_start: Instant,
    last_tick: Instant,
    dirs: [DirState; 2],
    event_tx: UnboundedSender<TestEvent>,
}

impl ThroughputSampler {
    pub fn new(test_start: Instant, event_tx: UnboundedSender<TestEvent>) -> Self {
        Self {
            test_start,
            last_tick: Instant::now(),
            dirs: [DirState::default(), DirState::default()],
            event_tx,
        }
    }

    /// One sampling pass over both directions. Returns the emitted samples
    /// so the run task can bucket them into TestData.
    pub fn tick(&mut self, mgr: &StreamManager, phase: Phase) -> Vec<ThroughputSample> {
        let now = Instant::now();
        let dt = now.saturating_duration_since(self.last_tick);
        self.last_tick = now;
        if dt.is_zero() {
            return Vec::new();
        }

        let mut out = Vec::with_capacity(2);
        for direction in [Direction::Download, Direction::Upload] {
            if let Some(sample) = self.sample_direction(mgr, phase, direction, dt) {
                out.push(sample.clone());
                let _ = self.event_tx.send(TestEvent::Throughput { direction, sample });
            }
        }
        out
    }

    fn dir_state(&mut self, direction: Direction) -> &mut DirState {
        match direction {
            Direction::Download => &mut self.dirs[0],
            Direction::Upload => &mut self.dirs[1],
        }
    }

    fn sample_direction(
        &mut self,
        mgr: &StreamManager,
        phase: Phase,
        direction: Direction,
        dt: Duration,
    ) -> Option<ThroughputSample> {
        let snapshot = mgr.snapshot(direction);
        let retired = mgr.retired_bytes(direction);
        let session_bytes = mgr.session_bytes(direction);
        let elapsed_ms = self.test_start.elapsed().as_secs_f64() * 1000.0;

        let state = self.dir_state(direction);

        let mut interval_bytes: u64 = 0;
        let mut seen: HashMap<StreamId, u64> = HashMap::with_capacity(snapshot.len());
        for (id, total) in &snapshot {
            let delta = match state.prev_streams.get(id) {
                // Counter reset: the current total is the delta.
                Some(prev) if total < prev => *total,
                Some(prev) => total - prev,
                None => *total,
            };
            interval_bytes += delta;
            seen.insert(*id, *total);
        }

        // Streams removed since the last tick: their final totals moved
        // into the retired accumulator; count only the part this sampler
        // had not observed yet.
        let retired_delta = retired.saturating_sub(state.prev_retired);
        let observed_of_removed: u64 = state
            .prev_streams
            .iter()
            .filter(|(id, _)| !seen.contains_key(id))
            .map(|(_, b)| *b)
            .sum();
        interval_bytes += retired_delta.saturating_sub(observed_of_removed);

        state.prev_streams = seen;
        state.prev_retired = retired;

        let dt_s = dt.as_secs_f64();
        let mut raw_mbps = (interval_bytes as f64) * 8.0 / (dt_s * 1e6);

        // Outlier cap against the previous smoothed value.
        if let Some(prev) = state.smoothed {
            if prev > OUTLIER_FLOOR_MBPS && raw_mbps > OUTLIER_FACTOR * prev {
                raw_mbps = OUTLIER_FACTOR * prev;
            }
        }

        let out_of_phase = !phase.expects_traffic(direction);

        // Silence handling: after the tolerance, synthesize decayed samples
        // to keep the timeline continuous.
        if interval_bytes == 0 {
            state.zero_ticks += 1;
            if state.zero_ticks > MAX_ZERO_TICKS {
                let n = state.zero_ticks - MAX_ZERO_TICKS;
                let decayed =
                    state.last_valid_mbps * INTERPOLATION_DECAY.powi(n as i32);
                state.smoothed = Some(decayed);
                let elapsed_ms = Self::monotone(state, elapsed_ms);
                return Some(ThroughputSample {
                    elapsed_ms,
                    direction,
                    phase,
                    raw_mbps: decayed,
                    smoothed_mbps: decayed,
                    out_of_phase,
                    interpolated: true,
                    session_bytes,
                });
            }
        } else {
            state.zero_ticks = 0;
        }

        // Moving average over the recent raw window, then EMA.
        state.raw_window.push_back(raw_mbps);
        while state.raw_window.len() > SMOOTHING_WINDOW {
            state.raw_window.pop_front();
        }
        let ma =
            state.raw_window.iter().sum::<f64>() / state.raw_window.len() as f64;
        let smoothed = match state.smoothed {
            Some(prev) => EMA_ALPHA * ma + (1.0 - EMA_ALPHA) * prev,
            None => ma,
        };
        state.smoothed = Some(smoothed);
        if interval_bytes > 0 {
            state.last_valid_mbps = smoothed;
        }

        let elapsed_ms = Self::monotone(state, elapsed_ms);
        Some(ThroughputSample {
            elapsed_ms,
            direction,
            phase,
            raw_mbps,
            smoothed_mbps: smoothed,
            out_of_phase,
            interpolated: false,
            session_bytes,
        })
    }

    /// Elapsed timestamps must be strictly increasing within a direction.
    fn monotone(state: &mut DirState, elapsed_ms: f64) -> f64 {
        let stamped = if elapsed_ms <= state.last_elapsed_ms {
            state.last_elapsed_ms + 0.001
        } else {
            elapsed_ms
        };
        state.last_elapsed_ms = stamped;
        stamped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::streams::StreamManager;
    use tokio::sync::mpsc;

    fn setup() -> (
        ThroughputSampler,
        StreamManager,
        mpsc::UnboundedReceiver<TestEvent>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let start = Instant::now();
        let mgr = StreamManager::new(Duration::from_secs(1), start, tx.clone());
        (ThroughputSampler::new(start, tx), mgr, rx)
    }

    fn dl(samples: &[ThroughputSample]) -> &ThroughputSample {
        samples
            .iter()
            .find(|s| s.direction == Direction::Download)
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn raw_mbps_from_interval_bytes() {
        let (mut sampler, mut mgr, _rx) = setup();
        let h = mgr.create(Direction::Download);

        tokio::time::advance(Duration::from_millis(500)).await;
        // 625_000 bytes in 500 ms = 10 Mbps.
        h.record_bytes(625_000);
        let samples = sampler.tick(&mgr, Phase::Download);
        let s = dl(&samples);
        assert!((s.raw_mbps - 10.0).abs() < 0.01);
        assert!(!s.out_of_phase);
        assert!(!s.interpolated);
        assert_eq!(s.session_bytes, 625_000);
    }

    #[tokio::test(start_paused = true)]
    async fn counter_reset_recovers_with_nonnegative_delta() {
        let (mut sampler, mut mgr, _rx) = setup();
        let h = mgr.create(Direction::Download);
        h.record_bytes(5_000_000);

        tokio::time::advance(Duration::from_millis(500)).await;
        sampler.tick(&mgr, Phase::Download);

        // Counter drops from 5 MB to 0: the next delta is the current
        // total (zero here), never negative.
        h.set_bytes_for_test(0);
        tokio::time::advance(Duration::from_millis(500)).await;
        let samples = sampler.tick(&mgr, Phase::Download);
        let s = dl(&samples);
        assert_eq!(s.raw_mbps, 0.0);

        // Counting resumes from the post-reset total.
        h.set_bytes_for_test(250_000);
        tokio::time::advance(Duration::from_millis(500)).await;
        let samples = sampler.tick(&mgr, Phase::Download);
        let s = dl(&samples);
        assert!(s.raw_mbps > 0.0);

        // Subsequent ticks are back to plain deltas.
        h.record_bytes(625_000);
        tokio::time::advance(Duration::from_millis(500)).await;
        let samples = sampler.tick(&mgr, Phase::Download);
        assert!((dl(&samples).raw_mbps - 10.0).abs() < 0.5);
    }

    #[tokio::test(start_paused = true)]
    async fn outlier_capped_at_five_times_previous_smoothed() {
        let (mut sampler, mut mgr, _rx) = setup();
        let h = mgr.create(Direction::Download);

        // Establish a smoothed value above the 1 Mbps floor.
        for _ in 0..5 {
            tokio::time::advance(Duration::from_millis(500)).await;
            h.record_bytes(625_000); // 10 Mbps per tick
            sampler.tick(&mgr, Phase::Download);
        }

        // A 100x burst must clamp to 5x the previous smoothed value.
        tokio::time::advance(Duration::from_millis(500)).await;
        h.record_bytes(62_500_000);
        let samples = sampler.tick(&mgr, Phase::Download);
        let s = dl(&samples);
        assert!(s.raw_mbps <= 5.0 * 10.0 + 0.5, "raw={}", s.raw_mbps);
    }

    #[tokio::test(start_paused = true)]
    async fn out_of_phase_tagging_follows_the_table() {
        let (mut sampler, mut mgr, _rx) = setup();
        mgr.create(Direction::Download);
        mgr.create(Direction::Upload);

        tokio::time::advance(Duration::from_millis(500)).await;
        let samples = sampler.tick(&mgr, Phase::Baseline);
        assert!(samples.iter().all(|s| s.out_of_phase));

        tokio::time::advance(Duration::from_millis(500)).await;
        let samples = sampler.tick(&mgr, Phase::Download);
        for s in &samples {
            assert_eq!(s.out_of_phase, s.direction == Direction::Upload);
        }

        tokio::time::advance(Duration::from_millis(500)).await;
        let samples = sampler.tick(&mgr, Phase::Bidirectional);
        assert!(samples.iter().all(|s| !s.out_of_phase));
    }

    #[tokio::test(start_paused = true)]
    async fn silence_interpolates_with_decay() {
        let (mut sampler, mut mgr, _rx) = setup();
        let h = mgr.create(Direction::Download);

        // Valid traffic to seed last_valid.
        for _ in 0..5 {
            tokio::time::advance(Duration::from_millis(500)).await;
            h.record_bytes(625_000);
            sampler.tick(&mgr, Phase::Download);
        }

        // Three zero ticks tolerated without interpolation.
        for _ in 0..3 {
            tokio::time::advance(Duration::from_millis(500)).await;
            let samples = sampler.tick(&mgr, Phase::Download);
            assert!(!dl(&samples).interpolated);
        }

        // Fourth zero tick interpolates with geometric decay.
        tokio::time::advance(Duration::from_millis(500)).await;
        let samples = sampler.tick(&mgr, Phase::Download);
        let first = dl(&samples).clone();
        assert!(first.interpolated);
        assert!(first.smoothed_mbps > 0.0);

        tokio::time::advance(Duration::from_millis(500)).await;
        let samples = sampler.tick(&mgr, Phase::Download);
        let second = dl(&samples).clone();
        assert!(second.interpolated);
        let ratio = second.smoothed_mbps / first.smoothed_mbps;
        assert!((ratio - INTERPOLATION_DECAY).abs() < 1e-6);
    }

    #[tokio::test(start_paused = true)]
    async fn traffic_resumption_ends_interpolation() {
        let (mut sampler, mut mgr, _rx) = setup();
        let h = mgr.create(Direction::Download);
        tokio::time::advance(Duration::from_millis(500)).await;
        h.record_bytes(625_000);
        sampler.tick(&mgr, Phase::Download);

        for _ in 0..6 {
            tokio::time::advance(Duration::from_millis(500)).await;
            sampler.tick(&mgr, Phase::Download);
        }

        tokio::time::advance(Duration::from_millis(500)).await;
        h.record_bytes(625_000);
        let samples = sampler.tick(&mgr, Phase::Download);
        assert!(!dl(&samples).interpolated);
    }

    #[tokio::test(start_paused = true)]
    async fn elapsed_is_strictly_increasing_per_direction() {
        let (mut sampler, mut mgr, _rx) = setup();
        let h = mgr.create(Direction::Download);
        let mut prev = -1.0;
        for _ in 0..10 {
            tokio::time::advance(Duration::from_millis(500)).await;
            h.record_bytes(10_000);
            let samples = sampler.tick(&mgr, Phase::Download);
            let s = dl(&samples);
            assert!(s.elapsed_ms > prev);
            prev = s.elapsed_ms;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn terminated_stream_bytes_still_counted_once() {
        let (mut sampler, mut mgr, _rx) = setup();
        let h = mgr.create(Direction::Download);
        h.record_bytes(1_000_000);

        tokio::time::advance(Duration::from_millis(500)).await;
        let samples = sampler.tick(&mgr, Phase::Download);
        let first_bytes_mbps = dl(&samples).raw_mbps;
        assert!(first_bytes_mbps > 0.0);

        // The stream transfers a little more, then dies before the next
        // tick; the unobserved remainder must still be attributed.
        h.record_bytes(250_000);
        let task = tokio::spawn(async {});
        mgr.attach_task(h.id, Direction::Download, task);
        mgr.terminate(h.id).await;

        tokio::time::advance(Duration::from_millis(500)).await;
        let samples = sampler.tick(&mgr, Phase::Download);
        let s = dl(&samples);
        // 250_000 bytes in 500 ms = 4 Mbps.
        assert!((s.raw_mbps - 4.0).abs() < 0.1, "raw={}", s.raw_mbps);
        assert_eq!(s.session_bytes, 1_250_000);
    }
}
