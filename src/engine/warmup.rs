use crate::model::{Direction, OptimalParams, SpeedTier};
use std::time::Duration;
use tokio::time::Instant;

/// Streams used throughout warmup discovery.
pub const WARMUP_STREAMS: usize = 3;

/// Upload probe chunk at the start of speed classification.
const EST_CHUNK_START: u64 = 2 * 1024 * 1024;
/// Upload probe chunk ceiling during speed classification.
const EST_CHUNK_MAX: u64 = 10 * 1024 * 1024;
/// Download probe body during speed classification: one large GET.
const EST_DOWNLOAD_BODY: u64 = 32 * 1024 * 1024;

/// Consecutive guardrail breaches required before backing off.
const BREACH_LIMIT: u32 = 5;
/// Relative throughput gain treated as an improvement.
const IMPROVEMENT_RATIO: f64 = 1.03;

/// Conservative result when classification sees no bytes at all.
const FALLBACK_CHUNK: u64 = 256 * 1024;

/// Starting row for a tier; Stage C explores within the row's bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierParams {
    pub stream_count: usize,
    pub start_chunk: u64,
    pub max_chunk: u64,
    pub pending_start: usize,
    pub pending_max: usize,
    pub delay_ms: u64,
}

pub fn tier_params(direction: Direction, tier: SpeedTier) -> TierParams {
    const KIB: u64 = 1024;
    const MIB: u64 = 1024 * 1024;
    match direction {
        Direction::Download => {
            let (start_chunk, max_chunk) = match tier {
                SpeedTier::Slow => (256 * KIB, MIB),
                SpeedTier::Medium => (MIB, 2 * MIB),
                SpeedTier::Fast => (2 * MIB, 4 * MIB),
                SpeedTier::Gigabit => (4 * MIB, 8 * MIB),
                SpeedTier::Ultragig => (8 * MIB, 12 * MIB),
            };
            TierParams {
                stream_count: WARMUP_STREAMS,
                start_chunk,
                max_chunk,
                pending_start: 1,
                pending_max: 1,
                delay_ms: 0,
            }
        }
        Direction::Upload => {
            let (chunk, pending_start, pending_max, delay_ms) = match tier {
                SpeedTier::Slow => (256 * KIB, 1, 2, 50),
                SpeedTier::Medium => (MIB, 4, 8, 20),
                SpeedTier::Fast => (2 * MIB, 8, 16, 10),
                SpeedTier::Gigabit => (4 * MIB, 20, 32, 5),
                SpeedTier::Ultragig => (4 * MIB, 40, 40, 0),
            };
            TierParams {
                stream_count: WARMUP_STREAMS,
                start_chunk: chunk,
                max_chunk: chunk,
                pending_start,
                pending_max,
                delay_ms,
            }
        }
    }
}

/// Working-latency guardrail. Grows logarithmically with link speed so fast
/// links tolerate proportionally more induced delay; floored at +100 ms.
pub fn latency_threshold_ms(baseline_ms: f64, speed_mbps: f64) -> f64 {
    let speed = speed_mbps.max(1.0);
    baseline_ms + (baseline_ms * (0.5 + 0.25 * speed.log10())).max(100.0)
}

/// Blend of throughput attainment and latency headroom, weighted 85/15.
pub fn score_configuration(
    throughput_mbps: f64,
    estimated_mbps: f64,
    latency_ms: f64,
    baseline_ms: f64,
    threshold_ms: f64,
) -> f64 {
    let attainment = if estimated_mbps > 0.0 {
        (throughput_mbps / estimated_mbps).min(1.0)
    } else {
        0.0
    };
    let latency_score = if latency_ms <= baseline_ms {
        1.0
    } else if threshold_ms > baseline_ms {
        (1.0 - (latency_ms / baseline_ms).ln() / (threshold_ms / baseline_ms).ln()).max(0.0)
    } else {
        0.0
    };
    0.85 * attainment + 0.15 * latency_score
}

/// What the run loop should do after feeding the optimizer a tick.
#[derive(Debug, Clone, PartialEq)]
pub enum WarmupAction {
    None,
    /// Download knob changed: sized probe requests use this body size.
    ApplyDownload { chunk_size: u64 },
    /// Upload knobs changed: adopt into the shared tuning.
    ApplyUpload {
        pending: usize,
        delay_ms: u64,
        chunk_size: u64,
    },
    /// Discovery is over; saturate with these parameters.
    Finish(OptimalParams),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dimension {
    Pending,
    Chunk,
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    score: f64,
    pending: usize,
    chunk: u64,
    delay_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Classify,
    Converge,
    Done,
}

/// Per-direction parameter discovery: a short speed-classification pass,
/// tier-table seeding, then ramp-and-converge until the phase deadline.
///
/// Driven by the run loop: `on_tick` consumes one sampler tick worth of
/// observations and answers with the knob changes to apply. The optimizer
/// never touches I/O itself.
pub struct WarmupOptimizer {
    direction: Direction,
    baseline_ms: f64,
    deadline: Instant,
    stage_a_until: Instant,
    iteration: Duration,
    known_download_peak: Option<f64>,

    stage: Stage,
    peak_mbps: f64,
    est_chunk: u64,

    tier: Option<SpeedTier>,
    bounds: TierParams,
    cur_pending: usize,
    cur_chunk: u64,
    cur_delay: u64,

    iter_until: Instant,
    iter_sum_mbps: f64,
    iter_sum_rtt: f64,
    iter_samples: u32,
    last_iter_mbps: Option<f64>,
    dimension: Dimension,
    breaches: u32,
    best: Option<Candidate>,
}

impl WarmupOptimizer {
    /// `phase_duration` is the full warmup window; roughly the first 30%
    /// is spent classifying and the rest converging.
    pub fn new(
        direction: Direction,
        baseline_ms: f64,
        phase_duration: Duration,
        known_download_peak: Option<f64>,
    ) -> Self {
        let now = Instant::now();
        let stage_a = phase_duration.mul_f64(0.3);
        let iteration = phase_duration
            .mul_f64(0.2)
            .min(Duration::from_millis(2500))
            .max(Duration::from_millis(1));
        let bounds = tier_params(direction, SpeedTier::Slow);
        Self {
            direction,
            baseline_ms,
            deadline: now + phase_duration,
            stage_a_until: now + stage_a,
            iteration,
            known_download_peak,
            stage: Stage::Classify,
            peak_mbps: 0.0,
            est_chunk: EST_CHUNK_START,
            tier: None,
            bounds,
            cur_pending: bounds.pending_start,
            cur_chunk: bounds.start_chunk,
            cur_delay: bounds.delay_ms,
            iter_until: now + stage_a + iteration,
            iter_sum_mbps: 0.0,
            iter_sum_rtt: 0.0,
            iter_samples: 0,
            last_iter_mbps: None,
            dimension: match direction {
                Direction::Upload => Dimension::Pending,
                Direction::Download => Dimension::Chunk,
            },
            breaches: 0,
            best: None,
        }
    }

    /// Knobs the engine should start the probing streams with.
    pub fn initial_action(&self) -> WarmupAction {
        match self.direction {
            Direction::Download => WarmupAction::ApplyDownload {
                chunk_size: EST_DOWNLOAD_BODY,
            },
            Direction::Upload => WarmupAction::ApplyUpload {
                pending: 2,
                delay_ms: 0,
                chunk_size: self.est_chunk,
            },
        }
    }

    pub fn is_done(&self) -> bool {
        self.stage == Stage::Done
    }

    fn threshold(&self) -> f64 {
        latency_threshold_ms(self.baseline_ms, self.peak_mbps)
    }

    /// One sampler tick: the direction's current raw and smoothed Mbps and
    /// the most recent RTT, if any probe landed since the last tick.
    pub fn on_tick(
        &mut self,
        raw_mbps: f64,
        smoothed_mbps: f64,
        rtt_ms: Option<f64>,
    ) -> WarmupAction {
        if self.stage == Stage::Done {
            return WarmupAction::None;
        }
        let now = Instant::now();
        self.peak_mbps = self.peak_mbps.max(raw_mbps);

        if now >= self.deadline {
            return WarmupAction::Finish(self.finish_now());
        }

        match self.stage {
            Stage::Classify => self.tick_classify(now),
            Stage::Converge => self.tick_converge(now, smoothed_mbps, rtt_ms),
            Stage::Done => WarmupAction::None,
        }
    }

    fn tick_classify(&mut self, now: Instant) -> WarmupAction {
        if now < self.stage_a_until {
            // Upload probing grows its chunk exponentially through the
            // estimation window; download rides one large body.
            if self.direction == Direction::Upload && self.est_chunk < EST_CHUNK_MAX {
                self.est_chunk = (self.est_chunk * 2).min(EST_CHUNK_MAX);
                return WarmupAction::ApplyUpload {
                    pending: 2,
                    delay_ms: 0,
                    chunk_size: self.est_chunk,
                };
            }
            return WarmupAction::None;
        }

        // Classification window over.
        if self.peak_mbps <= 0.0 {
            tracing::warn!(direction = %self.direction, "no bytes during speed classification");
            self.stage = Stage::Done;
            return WarmupAction::Finish(OptimalParams {
                direction: self.direction,
                stream_count: WARMUP_STREAMS,
                pending_per_stream: 1,
                chunk_size_bytes: FALLBACK_CHUNK,
                upload_delay_ms: tier_params(self.direction, SpeedTier::Slow).delay_ms,
                peak_mbps: 0.0,
                tier: SpeedTier::Slow,
            });
        }

        let tier = SpeedTier::classify(self.direction, self.peak_mbps);
        tracing::info!(
            direction = %self.direction,
            peak_mbps = self.peak_mbps,
            tier = ?tier,
            "speed classified"
        );

        // Asymmetric links skip convergence: a thin uplink next to a fat
        // downlink gets the tier defaults straight away.
        if self.direction == Direction::Upload {
            if let Some(down) = self.known_download_peak {
                if down > 100.0 && self.peak_mbps <= 0.2 * down {
                    tracing::info!(
                        upload_peak = self.peak_mbps,
                        download_peak = down,
                        "asymmetric link; short-circuiting convergence"
                    );
                    self.tier = Some(tier);
                    self.bounds = tier_params(self.direction, tier);
                    self.stage = Stage::Done;
                    return WarmupAction::Finish(self.tier_default(tier));
                }
            }
        }

        self.tier = Some(tier);
        self.bounds = tier_params(self.direction, tier);
        self.cur_pending = self.bounds.pending_start;
        self.cur_chunk = self.bounds.start_chunk;
        self.cur_delay = self.bounds.delay_ms;
        self.stage = Stage::Converge;
        self.iter_until = now + self.iteration;
        self.iter_sum_mbps = 0.0;
        self.iter_sum_rtt = 0.0;
        self.iter_samples = 0;

        self.apply_current()
    }

    fn tick_converge(
        &mut self,
        now: Instant,
        smoothed_mbps: f64,
        rtt_ms: Option<f64>,
    ) -> WarmupAction {
        self.iter_sum_mbps += smoothed_mbps;
        self.iter_samples += 1;
        if let Some(rtt) = rtt_ms {
            self.iter_sum_rtt += rtt;
            if rtt > self.threshold() {
                self.breaches += 1;
            } else {
                self.breaches = 0;
            }
        }

        // Guardrail: sustained breaches back the active dimension off
        // immediately, without waiting for the iteration boundary.
        if self.breaches >= BREACH_LIMIT {
            self.breaches = 0;
            self.step_down();
            return self.apply_current();
        }

        if now < self.iter_until {
            return WarmupAction::None;
        }

        // Iteration boundary: evaluate the configuration that just ran.
        let avg_mbps = if self.iter_samples > 0 {
            self.iter_sum_mbps / self.iter_samples as f64
        } else {
            0.0
        };
        let avg_rtt = if self.iter_samples > 0 && self.iter_sum_rtt > 0.0 {
            self.iter_sum_rtt / self.iter_samples as f64
        } else {
            self.baseline_ms
        };
        let threshold = self.threshold();
        let acceptable = avg_rtt <= threshold;
        if acceptable {
            let score = score_configuration(
                avg_mbps,
                self.peak_mbps,
                avg_rtt,
                self.baseline_ms,
                threshold,
            );
            let better = self.best.map(|b| score > b.score).unwrap_or(true);
            if better {
                self.best = Some(Candidate {
                    score,
                    pending: self.cur_pending,
                    chunk: self.cur_chunk,
                    delay_ms: self.cur_delay,
                });
            }
        }

        let improved = self
            .last_iter_mbps
            .map(|prev| avg_mbps > prev * IMPROVEMENT_RATIO)
            .unwrap_or(true);
        self.last_iter_mbps = Some(avg_mbps);

        if improved && acceptable {
            self.step_up();
        } else {
            self.step_down();
        }

        self.iter_until = now + self.iteration;
        self.iter_sum_mbps = 0.0;
        self.iter_sum_rtt = 0.0;
        self.iter_samples = 0;

        self.apply_current()
    }

    /// Double the active dimension, bounded by the tier row.
    fn step_up(&mut self) {
        match self.dimension {
            Dimension::Pending => {
                let next = (self.cur_pending * 2).min(self.bounds.pending_max);
                if next == self.cur_pending {
                    // Saturated this dimension; try the other one.
                    self.dimension = Dimension::Chunk;
                    self.cur_chunk = (self.cur_chunk * 2).min(self.bounds.max_chunk);
                } else {
                    self.cur_pending = next;
                }
            }
            Dimension::Chunk => {
                let next = (self.cur_chunk * 2).min(self.bounds.max_chunk);
                if next == self.cur_chunk && self.direction == Direction::Upload {
                    self.dimension = Dimension::Pending;
                    self.cur_pending = (self.cur_pending * 2).min(self.bounds.pending_max);
                } else {
                    self.cur_chunk = next;
                }
            }
        }
    }

    /// Halve the active dimension, floored at the minimum useful value.
    fn step_down(&mut self) {
        match self.dimension {
            Dimension::Pending => {
                self.cur_pending = (self.cur_pending / 2).max(1);
            }
            Dimension::Chunk => {
                self.cur_chunk = (self.cur_chunk / 2).max(64 * 1024);
            }
        }
    }

    fn apply_current(&self) -> WarmupAction {
        match self.direction {
            Direction::Download => WarmupAction::ApplyDownload {
                chunk_size: self.cur_chunk,
            },
            Direction::Upload => WarmupAction::ApplyUpload {
                pending: self.cur_pending,
                delay_ms: self.cur_delay,
                chunk_size: self.cur_chunk,
            },
        }
    }

    fn tier_default(&self, tier: SpeedTier) -> OptimalParams {
        let row = tier_params(self.direction, tier);
        OptimalParams {
            direction: self.direction,
            stream_count: row.stream_count,
            pending_per_stream: row.pending_start,
            chunk_size_bytes: row.start_chunk,
            upload_delay_ms: row.delay_ms,
            peak_mbps: self.peak_mbps,
            tier,
        }
    }

    /// Close out discovery with the best acceptable configuration, or the
    /// tier default when nothing qualified. Deadline exits land here too.
    pub fn finish_now(&mut self) -> OptimalParams {
        self.stage = Stage::Done;
        let tier = self
            .tier
            .unwrap_or_else(|| SpeedTier::classify(self.direction, self.peak_mbps));
        match self.best {
            Some(b) => OptimalParams {
                direction: self.direction,
                stream_count: WARMUP_STREAMS,
                pending_per_stream: b.pending,
                chunk_size_bytes: b.chunk,
                upload_delay_ms: b.delay_ms,
                peak_mbps: self.peak_mbps,
                tier,
            },
            None => self.tier_default(tier),
        }
    }
}
