use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// RTT recorded for a probe attempt that never came back.
pub const TIMEOUT_SENTINEL_MS: f64 = 1000.0;

/// Baseline latency used when the baseline bucket is empty.
pub const DEFAULT_BASELINE_LATENCY_MS: f64 = 20.0;

/// Hard cap on a single upload request body.
pub const MAX_UPLOAD_BODY_BYTES: u64 = 4 * 1024 * 1024;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum Phase {
    Baseline,
    DownloadWarmup,
    Download,
    UploadWarmup,
    Upload,
    Bidirectional,
    Complete,
}

impl Phase {
    /// Fixed wall-clock duration of the phase in the canonical timeline.
    /// `Complete` has no duration.
    pub fn default_duration(self) -> Option<Duration> {
        let secs = match self {
            Phase::Baseline => 4,
            Phase::DownloadWarmup => 7,
            Phase::Download => 12,
            Phase::UploadWarmup => 13,
            Phase::Upload => 12,
            Phase::Bidirectional => 12,
            Phase::Complete => return None,
        };
        Some(Duration::from_secs(secs))
    }

    /// The phase that follows in the fixed sequence.
    pub fn successor(self) -> Option<Phase> {
        match self {
            Phase::Baseline => Some(Phase::DownloadWarmup),
            Phase::DownloadWarmup => Some(Phase::Download),
            Phase::Download => Some(Phase::UploadWarmup),
            Phase::UploadWarmup => Some(Phase::Upload),
            Phase::Upload => Some(Phase::Bidirectional),
            Phase::Bidirectional => Some(Phase::Complete),
            Phase::Complete => None,
        }
    }

    /// Whether traffic in `direction` is expected while this phase runs.
    /// Samples for an unexpected direction are tagged out-of-phase.
    pub fn expects_traffic(self, direction: Direction) -> bool {
        match self {
            Phase::Baseline | Phase::Complete => false,
            Phase::DownloadWarmup | Phase::Download => direction == Direction::Download,
            Phase::UploadWarmup | Phase::Upload => direction == Direction::Upload,
            Phase::Bidirectional => true,
        }
    }

    /// Query-string tag attached to latency probes issued during load, so
    /// the server can distinguish loaded from idle probes.
    pub fn as_query_str(self) -> Option<&'static str> {
        match self {
            Phase::DownloadWarmup | Phase::Download => Some("download"),
            Phase::UploadWarmup | Phase::Upload => Some("upload"),
            Phase::Bidirectional => Some("bidirectional"),
            _ => None,
        }
    }

    /// Phases whose saturation parameters are frozen: no adaptive backoff
    /// may be applied while they run.
    pub fn params_frozen(self) -> bool {
        matches!(self, Phase::Bidirectional)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Direction {
    Download,
    Upload,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Download => write!(f, "download"),
            Direction::Upload => write!(f, "upload"),
        }
    }
}

/// Identifier for a managed stream. Monotonic within a direction; never
/// reused for the lifetime of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StreamId(pub u64);

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamState {
    Creating,
    Active,
    Draining,
    Terminated,
}

/// Coarse classification of a direction's capacity; selects the starting
/// parameter row for the warmup optimizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SpeedTier {
    Slow,
    Medium,
    Fast,
    Gigabit,
    Ultragig,
}

impl SpeedTier {
    /// Classify a peak throughput into a tier. Bounds differ per direction
    /// and upload classification never reads download speed.
    pub fn classify(direction: Direction, peak_mbps: f64) -> SpeedTier {
        match direction {
            Direction::Upload => match peak_mbps {
                m if m < 10.0 => SpeedTier::Slow,
                m if m < 100.0 => SpeedTier::Medium,
                m if m < 300.0 => SpeedTier::Fast,
                m if m < 800.0 => SpeedTier::Gigabit,
                _ => SpeedTier::Ultragig,
            },
            Direction::Download => match peak_mbps {
                m if m < 25.0 => SpeedTier::Slow,
                m if m < 200.0 => SpeedTier::Medium,
                m if m < 600.0 => SpeedTier::Fast,
                m if m < 700.0 => SpeedTier::Gigabit,
                _ => SpeedTier::Ultragig,
            },
        }
    }
}

/// Parameter set discovered by the warmup optimizer for one direction.
/// Immutable once emitted; the saturation phases consume it verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimalParams {
    pub direction: Direction,
    pub stream_count: usize,
    /// Concurrent POSTs outstanding per stream. Always 1 for download.
    pub pending_per_stream: usize,
    pub chunk_size_bytes: u64,
    pub upload_delay_ms: u64,
    pub peak_mbps: f64,
    pub tier: SpeedTier,
}

/// One smoothed throughput observation, published every sampler tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThroughputSample {
    /// Milliseconds since the test started, monotonic clock.
    pub elapsed_ms: f64,
    pub direction: Direction,
    pub phase: Phase,
    pub raw_mbps: f64,
    pub smoothed_mbps: f64,
    /// Traffic in a direction the current phase does not expect.
    pub out_of_phase: bool,
    /// Synthesized from decay because the direction went silent.
    pub interpolated: bool,
    /// Cumulative per-direction bytes at the sample instant. Monotonic
    /// across phase boundaries for the whole session.
    pub session_bytes: u64,
}

/// One latency probe outcome, loaded or idle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatencyMeasurement {
    pub elapsed_ms: f64,
    pub phase: Phase,
    pub rtt_ms: f64,
    pub is_timeout: bool,
    /// Run length of timeouts at the instant this measurement was recorded.
    pub consecutive_timeouts: u32,
}

impl LatencyMeasurement {
    pub fn is_valid(&self) -> bool {
        !self.is_timeout && self.rtt_ms.is_finite() && self.rtt_ms > 0.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PhaseChangeKind {
    Start,
    End,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamLifecycleKind {
    Created,
    Terminated,
}

/// Events published by the engine, serialized in emission order on the run
/// task. Presentation and analysis layers subscribe to this channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TestEvent {
    TestStarted,
    PhaseChange {
        kind: PhaseChangeKind,
        phase: Phase,
        elapsed_ms: f64,
    },
    StreamLifecycle {
        kind: StreamLifecycleKind,
        stream_id: StreamId,
        direction: Direction,
        elapsed_ms: f64,
    },
    /// Emergency cleanup ran; all registries were force-cleared.
    StreamReset { elapsed_ms: f64 },
    Throughput {
        direction: Direction,
        sample: ThroughputSample,
    },
    Latency(LatencyMeasurement),
    /// Adaptive backoff fired. `direction: None` is the generic variant.
    Backoff {
        direction: Option<Direction>,
        factor: f64,
    },
    OptimalParamsReady(OptimalParams),
    RunCompleted {
        // Boxed to keep TestEvent small; TestReport carries every bucket.
        report: Box<TestReport>,
    },
}

/// Commands consumed by a running engine.
#[derive(Debug, Clone)]
pub enum EngineControl {
    /// Abort the run. The phase sequence jumps straight to `Complete` and
    /// streams are torn down.
    Cancel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LatencySummary {
    pub sent: u64,
    pub received: u64,
    pub loss: f64,
    pub min_ms: Option<f64>,
    pub mean_ms: Option<f64>,
    pub p50_ms: Option<f64>,
    pub p90_ms: Option<f64>,
    pub p99_ms: Option<f64>,
    pub max_ms: Option<f64>,
    pub jitter_ms: Option<f64>,
}

impl Default for LatencySummary {
    fn default() -> Self {
        Self {
            sent: 0,
            received: 0,
            loss: 0.0,
            min_ms: None,
            mean_ms: None,
            p50_ms: None,
            p90_ms: None,
            p99_ms: None,
            max_ms: None,
            jitter_ms: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ThroughputSummary {
    pub bytes: u64,
    pub duration_ms: u64,
    pub mean_mbps: Option<f64>,
    pub median_mbps: Option<f64>,
    pub p25_mbps: Option<f64>,
    pub p75_mbps: Option<f64>,
}

/// Per-phase measurement buckets. Sole writer is the run task; frozen into
/// a `TestReport` when the run completes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TestData {
    pub latency: BTreeMap<Phase, Vec<LatencyMeasurement>>,
    pub download_throughput: BTreeMap<Phase, Vec<ThroughputSample>>,
    pub upload_throughput: BTreeMap<Phase, Vec<ThroughputSample>>,
    pub baseline_latency_ms: Option<f64>,
    pub download_params: Option<OptimalParams>,
    pub upload_params: Option<OptimalParams>,
}

impl TestData {
    pub fn record_latency(&mut self, m: LatencyMeasurement) {
        self.latency.entry(m.phase).or_default().push(m);
    }

    pub fn record_throughput(&mut self, s: ThroughputSample) {
        let bucket = match s.direction {
            Direction::Download => &mut self.download_throughput,
            Direction::Upload => &mut self.upload_throughput,
        };
        bucket.entry(s.phase).or_default().push(s);
    }

    /// Arithmetic mean of valid baseline RTTs, clamped to >= 1 ms. An empty
    /// bucket yields the 20 ms default.
    pub fn compute_baseline_latency(&mut self) -> f64 {
        let baseline = self
            .latency
            .get(&Phase::Baseline)
            .map(|v| {
                v.iter()
                    .filter(|m| m.is_valid())
                    .map(|m| m.rtt_ms)
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();

        let avg = if baseline.is_empty() {
            DEFAULT_BASELINE_LATENCY_MS
        } else {
            (baseline.iter().sum::<f64>() / baseline.len() as f64).max(1.0)
        };
        self.baseline_latency_ms = Some(avg);
        avg
    }

    /// Clear every bucket and discovered parameter.
    pub fn reset(&mut self) {
        *self = TestData::default();
    }

    pub fn throughput_bucket(&self, direction: Direction, phase: Phase) -> &[ThroughputSample] {
        let buckets = match direction {
            Direction::Download => &self.download_throughput,
            Direction::Upload => &self.upload_throughput,
        };
        buckets.get(&phase).map(|v| v.as_slice()).unwrap_or(&[])
    }
}

/// Frozen result of a completed run: the raw buckets plus per-phase
/// summaries. Readers attach after `RunCompleted`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestReport {
    #[serde(default)]
    pub timestamp_utc: String,
    pub base_url: String,
    pub baseline_latency_ms: f64,
    pub data: TestData,
    pub latency_summaries: BTreeMap<Phase, LatencySummary>,
    pub download_summaries: BTreeMap<Phase, ThroughputSummary>,
    pub upload_summaries: BTreeMap<Phase, ThroughputSummary>,
    /// Optional payload from the server-discovery endpoint.
    pub server_info: Option<serde_json::Value>,
    /// Streams force-removed after the per-stream hard timeout.
    pub leaked_streams: usize,
    pub aborted: bool,
}
