use crate::config::EngineConfig;
use crate::engine::client::ServerClient;
use crate::error::EngineError;
use crate::model::{Phase, TIMEOUT_SENTINEL_MS};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Raw outcome of one probe attempt, sent to the run task. The run task
/// owns the consecutive-timeout counter and turns reports into
/// `LatencyMeasurement`s.
#[derive(Debug, Clone, Copy)]
pub struct ProbeReport {
    pub rtt_ms: f64,
    pub is_timeout: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeState {
    Idle,
    Running,
    TempBackoff,
    Stopped,
}

const STATE_IDLE: u8 = 0;
const STATE_RUNNING: u8 = 1;
const STATE_BACKOFF: u8 = 2;
const STATE_STOPPED: u8 = 3;

const TAG_NONE: u8 = 0;
const TAG_DOWNLOAD: u8 = 1;
const TAG_UPLOAD: u8 = 2;
const TAG_BIDIRECTIONAL: u8 = 3;

fn encode_tag(phase: Option<Phase>) -> u8 {
    match phase.and_then(|p| p.as_query_str()) {
        None => TAG_NONE,
        Some("download") => TAG_DOWNLOAD,
        Some("upload") => TAG_UPLOAD,
        Some("bidirectional") => TAG_BIDIRECTIONAL,
        Some(_) => TAG_NONE,
    }
}

fn decode_tag(tag: u8) -> Option<&'static str> {
    match tag {
        TAG_DOWNLOAD => Some("download"),
        TAG_UPLOAD => Some("upload"),
        TAG_BIDIRECTIONAL => Some("bidirectional"),
        _ => None,
    }
}

/// Serial RTT prober on its own OS thread.
///
/// The thread runs a current-thread tokio runtime and a `reqwest::Client`
/// that shares nothing with the load clients, so saturated send queues on
/// the main runtime cannot starve the probe. Communication with the run
/// task is one report channel plus two atomics (stop flag, phase tag).
pub struct LatencyProbe {
    stop: Arc<AtomicBool>,
    state: Arc<AtomicU8>,
    tag: Arc<AtomicU8>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl LatencyProbe {
    /// Start probing immediately. Reports arrive on the returned channel
    /// until `stop` is called or the engine drops the receiver.
    pub fn spawn(cfg: &EngineConfig) -> (Self, mpsc::UnboundedReceiver<ProbeReport>) {
        let (report_tx, report_rx) = mpsc::unbounded_channel();
        let stop = Arc::new(AtomicBool::new(false));
        let state = Arc::new(AtomicU8::new(STATE_IDLE));
        let tag = Arc::new(AtomicU8::new(TAG_NONE));

        let cfg = cfg.clone();
        let stop2 = stop.clone();
        let state2 = state.clone();
        let tag2 = tag.clone();

        let thread = std::thread::Builder::new()
            .name("latency-probe".into())
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        tracing::error!(error = %e, "latency probe runtime failed to start");
                        state2.store(STATE_STOPPED, Ordering::Relaxed);
                        return;
                    }
                };
                rt.block_on(probe_loop(cfg, report_tx, stop2, state2, tag2));
            })
            .expect("spawn latency probe thread");

        (
            Self {
                stop,
                state,
                tag,
                thread: Some(thread),
            },
            report_rx,
        )
    }

    /// Tag subsequent probes with the phase currently generating load.
    pub fn set_phase(&self, phase: Option<Phase>) {
        self.tag.store(encode_tag(phase), Ordering::Relaxed);
    }

    pub fn state(&self) -> ProbeState {
        match self.state.load(Ordering::Relaxed) {
            STATE_IDLE => ProbeState::Idle,
            STATE_RUNNING => ProbeState::Running,
            STATE_BACKOFF => ProbeState::TempBackoff,
            _ => ProbeState::Stopped,
        }
    }

    /// Request shutdown. The probe thread notices between attempts and
    /// exits on its own; `join` is bounded by one probe timeout plus one
    /// interval.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    /// Blocking join, for teardown paths that must observe the exit.
    pub fn join(&mut self) {
        self.stop();
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
    }
}

impl Drop for LatencyProbe {
    fn drop(&mut self) {
        self.stop();
        // Detach; the thread exits after its in-flight attempt.
        self.thread.take();
    }
}

async fn probe_loop(
    cfg: EngineConfig,
    report_tx: mpsc::UnboundedSender<ProbeReport>,
    stop: Arc<AtomicBool>,
    state: Arc<AtomicU8>,
    tag: Arc<AtomicU8>,
) {
    let client = match ServerClient::new(&cfg) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, "latency probe client failed to build");
            state.store(STATE_STOPPED, Ordering::Relaxed);
            return;
        }
    };

    state.store(STATE_RUNNING, Ordering::Relaxed);
    while !stop.load(Ordering::Relaxed) {
        let during = decode_tag(tag.load(Ordering::Relaxed));
        let report = match client.probe_latency_ms(during, cfg.probe_timeout).await {
            Ok(ms) => ProbeReport {
                rtt_ms: ms,
                is_timeout: false,
            },
            Err(e) => {
                let err = EngineError::LatencyTimeout {
                    timeout_ms: cfg.probe_timeout.as_millis() as u64,
                };
                tracing::debug!(error = %err, cause = %e, "latency probe attempt failed");
                ProbeReport {
                    rtt_ms: TIMEOUT_SENTINEL_MS,
                    is_timeout: true,
                }
            }
        };
        let timed_out = report.is_timeout;
        if report_tx.send(report).is_err() {
            // Receiver gone; the run is over.
            break;
        }

        // A failed attempt earns a longer pause before the next one.
        if timed_out {
            state.store(STATE_BACKOFF, Ordering::Relaxed);
            tokio::time::sleep(cfg.probe_interval * 2).await;
            state.store(STATE_RUNNING, Ordering::Relaxed);
        } else {
            tokio::time::sleep(cfg.probe_interval).await;
        }
    }
    state.store(STATE_STOPPED, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn unreachable_cfg() -> EngineConfig {
        EngineConfig {
            // Reserved port; connections fail fast.
            base_url: "http://127.0.0.1:1".into(),
            probe_interval: Duration::from_millis(10),
            probe_timeout: Duration::from_millis(50),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn unreachable_endpoint_reports_timeouts_with_sentinel() {
        let (mut probe, mut rx) = LatencyProbe::spawn(&unreachable_cfg());
        let report = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("probe should report within 5s")
            .expect("channel open");
        assert!(report.is_timeout);
        assert_eq!(report.rtt_ms, TIMEOUT_SENTINEL_MS);
        probe.join();
        assert_eq!(probe.state(), ProbeState::Stopped);
    }

    #[tokio::test]
    async fn stop_terminates_the_thread() {
        let (mut probe, mut rx) = LatencyProbe::spawn(&unreachable_cfg());
        // Wait for the loop to come alive.
        let _ = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await;
        probe.join();
        assert_eq!(probe.state(), ProbeState::Stopped);
        // Channel drains then closes.
        while rx.try_recv().is_ok() {}
    }

    #[test]
    fn phase_tags_round_trip() {
        assert_eq!(decode_tag(encode_tag(Some(Phase::Download))), Some("download"));
        assert_eq!(decode_tag(encode_tag(Some(Phase::UploadWarmup))), Some("upload"));
        assert_eq!(
            decode_tag(encode_tag(Some(Phase::Bidirectional))),
            Some("bidirectional")
        );
        assert_eq!(decode_tag(encode_tag(Some(Phase::Baseline))), None);
        assert_eq!(decode_tag(encode_tag(None)), None);
    }
}
