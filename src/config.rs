use crate::error::EngineError;
use crate::model::{Phase, MAX_UPLOAD_BODY_BYTES};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Parameters for a single measurement run.
///
/// Defaults reproduce the canonical 60 s timeline. Tests shrink the phase
/// durations and termination windows to keep runs fast.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Base URL of the measurement server, e.g. `http://192.0.2.10:8080`.
    pub base_url: String,

    pub user_agent: String,

    /// Per-phase durations; `None` uses `Phase::default_duration()`.
    #[serde(default, with = "humantime_serde::option")]
    pub baseline_duration: Option<Duration>,
    #[serde(default, with = "humantime_serde::option")]
    pub download_warmup_duration: Option<Duration>,
    #[serde(default, with = "humantime_serde::option")]
    pub download_duration: Option<Duration>,
    #[serde(default, with = "humantime_serde::option")]
    pub upload_warmup_duration: Option<Duration>,
    #[serde(default, with = "humantime_serde::option")]
    pub upload_duration: Option<Duration>,
    #[serde(default, with = "humantime_serde::option")]
    pub bidirectional_duration: Option<Duration>,

    /// Throughput sampler cadence.
    #[serde(with = "humantime_serde")]
    pub measurement_interval: Duration,

    /// Gap between consecutive latency probes.
    #[serde(with = "humantime_serde")]
    pub probe_interval: Duration,

    /// Per-attempt latency probe timeout. Timeouts are recorded with the
    /// 1000 ms sentinel regardless of this window.
    #[serde(with = "humantime_serde")]
    pub probe_timeout: Duration,

    /// Graceful per-stream termination cap before the stream counts as
    /// leaked and is force-removed.
    #[serde(with = "humantime_serde")]
    pub stream_termination_timeout: Duration,

    /// Window granted to `terminate_all` before emergency cleanup fires.
    #[serde(with = "humantime_serde")]
    pub termination_grace: Duration,

    /// Per-request timeout applied while the optimizer estimates speed.
    /// Steady-state saturation requests run without one.
    #[serde(with = "humantime_serde")]
    pub estimation_request_timeout: Duration,

    /// Hard cap on a single upload request body.
    pub max_upload_body_bytes: u64,

    /// Number of random buffers in the shared upload chunk pool.
    pub chunk_pool_slots: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            user_agent: format!("bloatmeter/{}", env!("CARGO_PKG_VERSION")),
            baseline_duration: None,
            download_warmup_duration: None,
            download_duration: None,
            upload_warmup_duration: None,
            upload_duration: None,
            bidirectional_duration: None,
            measurement_interval: Duration::from_millis(500),
            probe_interval: Duration::from_millis(250),
            probe_timeout: Duration::from_millis(1000),
            stream_termination_timeout: Duration::from_secs(30),
            termination_grace: Duration::from_millis(100),
            estimation_request_timeout: Duration::from_secs(3),
            max_upload_body_bytes: MAX_UPLOAD_BODY_BYTES,
            chunk_pool_slots: 8,
        }
    }
}

impl EngineConfig {
    /// Effective duration of a phase, honoring per-run overrides.
    pub fn phase_duration(&self, phase: Phase) -> Option<Duration> {
        let override_d = match phase {
            Phase::Baseline => self.baseline_duration,
            Phase::DownloadWarmup => self.download_warmup_duration,
            Phase::Download => self.download_duration,
            Phase::UploadWarmup => self.upload_warmup_duration,
            Phase::Upload => self.upload_duration,
            Phase::Bidirectional => self.bidirectional_duration,
            Phase::Complete => None,
        };
        override_d.or_else(|| phase.default_duration())
    }

    /// Validate once at engine construction; a bad config never reaches the
    /// run loop.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.base_url.is_empty() {
            return Err(EngineError::InvalidConfig("base_url is empty".into()));
        }
        reqwest::Url::parse(&self.base_url)
            .map_err(|e| EngineError::InvalidConfig(format!("base_url: {e}")))?;

        for phase in [
            Phase::Baseline,
            Phase::DownloadWarmup,
            Phase::Download,
            Phase::UploadWarmup,
            Phase::Upload,
            Phase::Bidirectional,
        ] {
            match self.phase_duration(phase) {
                Some(d) if !d.is_zero() => {}
                _ => {
                    return Err(EngineError::InvalidConfig(format!(
                        "{phase} duration must be non-zero"
                    )))
                }
            }
        }

        if self.measurement_interval.is_zero() {
            return Err(EngineError::InvalidConfig(
                "measurement_interval must be non-zero".into(),
            ));
        }
        if self.probe_interval.is_zero() || self.probe_timeout.is_zero() {
            return Err(EngineError::InvalidConfig(
                "probe interval and timeout must be non-zero".into(),
            ));
        }
        if self.max_upload_body_bytes == 0 {
            return Err(EngineError::InvalidConfig(
                "max_upload_body_bytes must be non-zero".into(),
            ));
        }
        if self.chunk_pool_slots == 0 {
            return Err(EngineError::InvalidConfig(
                "chunk_pool_slots must be non-zero".into(),
            ));
        }
        Ok(())
    }
}
