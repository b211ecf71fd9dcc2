pub mod client;
pub mod download;
pub mod latency;
pub mod pacing;
pub mod phase;
pub mod sampler;
pub mod streams;
pub mod upload;
pub mod warmup;

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::metrics;
use crate::model::{
    Direction, EngineControl, LatencyMeasurement, OptimalParams, Phase, TestData, TestEvent,
    TestReport,
};
use crate::stats;
use anyhow::{Context, Result};
use client::{fetch_server_info, ServerClient};
use download::DownloadEngine;
use latency::{LatencyProbe, ProbeReport};
use pacing::{Pacer, ReservationController};
use phase::PhaseController;
use sampler::ThroughputSampler;
use std::collections::BTreeMap;
use std::sync::Arc;
use streams::StreamManager;
use tokio::sync::mpsc;
use tokio::time::Instant;
use upload::{ChunkPool, LatencyGovernor, UploadEngine, UploadTuning};
use warmup::{WarmupAction, WarmupOptimizer};

/// What the phase loop does on each sampler tick.
enum PhaseMode {
    /// No load; latency only.
    Idle,
    /// Warmup discovery drives the knobs.
    Warmup(WarmupOptimizer),
    /// Saturation on frozen or adaptive parameters.
    Saturate,
}

/// The measurement engine: wires the phase controller, stream manager,
/// engines, sampler, probe and warmup optimizers into one run.
///
/// All state mutation happens on the task running `run`; spawned transfer
/// workers only touch their stream atomics, and the latency probe lives on
/// its own thread, reporting through a channel.
pub struct TestEngine {
    cfg: EngineConfig,
}

impl TestEngine {
    pub fn new(cfg: EngineConfig) -> Result<Self, EngineError> {
        cfg.validate()?;
        Ok(Self { cfg })
    }

    /// Execute the full phase sequence, publishing events as it goes.
    /// Resolves with the frozen report; `Err` only on a fatal error.
    pub async fn run(
        self,
        event_tx: mpsc::UnboundedSender<TestEvent>,
        control_rx: mpsc::UnboundedReceiver<EngineControl>,
    ) -> Result<TestReport> {
        let client = ServerClient::new(&self.cfg)?;
        let test_start = Instant::now();
        let _ = event_tx.send(TestEvent::TestStarted);

        let server_info = fetch_server_info(&client).await;

        let (probe, probe_rx) = LatencyProbe::spawn(&self.cfg);
        let chunk_pool = Arc::new(ChunkPool::generate(
            self.cfg.chunk_pool_slots,
            self.cfg.max_upload_body_bytes as usize,
        ));
        let tuning = UploadTuning::new(1, 0, 1024 * 1024);

        let mut ctx = RunCtx {
            phases: PhaseController::new(test_start, event_tx.clone()),
            mgr: StreamManager::new(
                self.cfg.stream_termination_timeout,
                test_start,
                event_tx.clone(),
            ),
            sampler: ThroughputSampler::new(test_start, event_tx.clone()),
            dl_engine: DownloadEngine::new(client.clone(), Arc::new(Pacer::unlimited())),
            ul_engine: UploadEngine::new(
                client,
                chunk_pool,
                tuning,
                Arc::new(Pacer::unlimited()),
                self.cfg.max_upload_body_bytes,
            ),
            governor: LatencyGovernor::new(),
            dl_pacer: Arc::new(Pacer::unlimited()),
            ul_pacer: Arc::new(Pacer::unlimited()),
            dl_reservation: ReservationController::new(0.0),
            ul_reservation: ReservationController::new(0.0),
            probe,
            probe_rx,
            control_rx,
            event_tx: event_tx.clone(),
            cfg: self.cfg,
            data: TestData::default(),
            test_start,
            baseline_ms: crate::model::DEFAULT_BASELINE_LATENCY_MS,
            consecutive_timeouts: 0,
            last_rtt: None,
            cancelled: false,
        };

        let outcome = ctx.run_sequence().await;
        let report = ctx.finish(server_info).await?;
        let _ = event_tx.send(TestEvent::RunCompleted {
            report: Box::new(report.clone()),
        });

        match outcome {
            Ok(()) => Ok(report),
            Err(e) if e.is_fatal() => Err(e).context("measurement run aborted"),
            Err(_) => Ok(report),
        }
    }
}

struct RunCtx {
    phases: PhaseController,
    mgr: StreamManager,
    sampler: ThroughputSampler,
    dl_engine: DownloadEngine,
    ul_engine: UploadEngine,
    governor: LatencyGovernor,
    dl_pacer: Arc<Pacer>,
    ul_pacer: Arc<Pacer>,
    dl_reservation: ReservationController,
    ul_reservation: ReservationController,
    probe: LatencyProbe,
    probe_rx: mpsc::UnboundedReceiver<ProbeReport>,
    control_rx: mpsc::UnboundedReceiver<EngineControl>,
    event_tx: mpsc::UnboundedSender<TestEvent>,
    cfg: EngineConfig,
    data: TestData,
    test_start: Instant,
    baseline_ms: f64,
    consecutive_timeouts: u32,
    last_rtt: Option<f64>,
    cancelled: bool,
}

impl RunCtx {
    async fn run_sequence(&mut self) -> Result<(), EngineError> {
        self.run_baseline().await?;

        if !self.cancelled {
            let params = self.run_warmup(Phase::DownloadWarmup, Direction::Download).await?;
            self.data.download_params = Some(params);
        }
        if !self.cancelled {
            self.run_saturation(Phase::Download).await?;
        }
        if !self.cancelled {
            let params = self.run_warmup(Phase::UploadWarmup, Direction::Upload).await?;
            self.data.upload_params = Some(params);
        }
        if !self.cancelled {
            self.run_saturation(Phase::Upload).await?;
        }
        if !self.cancelled {
            self.run_saturation(Phase::Bidirectional).await?;
        }
        Ok(())
    }

    async fn run_baseline(&mut self) -> Result<(), EngineError> {
        self.phase_loop(Phase::Baseline, PhaseMode::Idle).await?;
        self.baseline_ms = self.data.compute_baseline_latency();
        tracing::info!(baseline_ms = self.baseline_ms, "baseline latency established");
        Ok(())
    }

    async fn run_warmup(
        &mut self,
        phase: Phase,
        direction: Direction,
    ) -> Result<OptimalParams, EngineError> {
        let duration = self
            .cfg
            .phase_duration(phase)
            .expect("warmup phases always have a duration");
        let known_download_peak = self
            .data
            .download_params
            .as_ref()
            .map(|p| p.peak_mbps)
            .filter(|_| direction == Direction::Upload);
        let opt = WarmupOptimizer::new(direction, self.baseline_ms, duration, known_download_peak);

        // Probing streams come up on the optimizer's starting knobs.
        self.apply_warmup_action(opt.initial_action(), direction);
        match direction {
            Direction::Download => {
                self.dl_engine.spawn_streams(
                    &mut self.mgr,
                    warmup::WARMUP_STREAMS,
                    true,
                    None,
                );
            }
            Direction::Upload => {
                self.ul_engine.spawn_streams(
                    &mut self.mgr,
                    warmup::WARMUP_STREAMS,
                    Some(self.cfg.estimation_request_timeout),
                );
            }
        }

        let mode = self.phase_loop(phase, PhaseMode::Warmup(opt)).await?;
        self.teardown_phase_streams().await;

        let params = match mode {
            PhaseMode::Warmup(mut opt) if !opt.is_done() => opt.finish_now(),
            PhaseMode::Warmup(opt) => {
                // Finished during the loop; the stored params are on data.
                drop(opt);
                match direction {
                    Direction::Download => self.data.download_params.take(),
                    Direction::Upload => self.data.upload_params.take(),
                }
                .expect("finished optimizer stored params")
            }
            _ => unreachable!("warmup loop returns its mode"),
        };

        tracing::info!(
            direction = %direction,
            tier = ?params.tier,
            peak_mbps = params.peak_mbps,
            streams = params.stream_count,
            pending = params.pending_per_stream,
            chunk = params.chunk_size_bytes,
            "warmup complete"
        );
        let _ = self
            .event_tx
            .send(TestEvent::OptimalParamsReady(params.clone()));
        Ok(params)
    }

    async fn run_saturation(&mut self, phase: Phase) -> Result<(), EngineError> {
        let frozen = phase.params_frozen();
        if frozen {
            self.ul_engine.tuning().set_frozen(true);
        }

        if phase.expects_traffic(Direction::Download) {
            let params = self
                .data
                .download_params
                .clone()
                .expect("download warmup ran before saturation");
            let pacer = if params.peak_mbps > 0.0 {
                Arc::new(Pacer::with_target_mbps(
                    params.peak_mbps * pacing::BASE_HEADROOM,
                ))
            } else {
                Arc::new(Pacer::unlimited())
            };
            self.dl_pacer = pacer.clone();
            self.dl_reservation = ReservationController::new(params.peak_mbps);
            self.dl_engine.swap_pacer(pacer);
            self.dl_engine.set_chunk_size(params.chunk_size_bytes);
            // Saturation downloads ride unbounded bodies.
            self.dl_engine
                .spawn_streams(&mut self.mgr, params.stream_count, false, None);
        }
        if phase.expects_traffic(Direction::Upload) {
            let params = self
                .data
                .upload_params
                .clone()
                .expect("upload warmup ran before saturation");
            let pacer = if params.peak_mbps > 0.0 {
                Arc::new(Pacer::with_target_mbps(
                    params.peak_mbps * pacing::BASE_HEADROOM,
                ))
            } else {
                Arc::new(Pacer::unlimited())
            };
            self.ul_pacer = pacer.clone();
            self.ul_reservation = ReservationController::new(params.peak_mbps);
            self.ul_engine.swap_pacer(pacer);
            let was_frozen = self.ul_engine.tuning().is_frozen();
            if was_frozen {
                // Adoption itself is exempt; the knobs being adopted are
                // exactly the discovered ones.
                self.ul_engine.tuning().set_frozen(false);
            }
            self.ul_engine.tuning().adopt(
                params.pending_per_stream,
                params.upload_delay_ms,
                params.chunk_size_bytes,
            );
            if was_frozen {
                self.ul_engine.tuning().set_frozen(true);
            }
            // No per-request timeout in steady state.
            self.ul_engine
                .spawn_streams(&mut self.mgr, params.stream_count, None);
        }

        self.phase_loop(phase, PhaseMode::Saturate).await?;
        self.teardown_phase_streams().await;

        if frozen {
            self.ul_engine.tuning().set_frozen(false);
        }
        Ok(())
    }

    /// The per-phase select loop: sampler ticks, probe reports, control
    /// commands, phase deadline. Returns the mode so warmup callers can
    /// recover their optimizer.
    async fn phase_loop(
        &mut self,
        phase: Phase,
        mut mode: PhaseMode,
    ) -> Result<PhaseMode, EngineError> {
        self.phases.start_phase(phase)?;
        self.probe.set_phase(Some(phase));

        let duration = self
            .cfg
            .phase_duration(phase)
            .ok_or(EngineError::InvalidTransition {
                from: self.phases.current_phase(),
                to: phase,
            })?;
        let deadline = Instant::now() + duration;
        let mut ticker = tokio::time::interval_at(
            Instant::now() + self.cfg.measurement_interval,
            self.cfg.measurement_interval,
        );
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        enum LoopEvent {
            Deadline,
            Tick,
            Probe(Option<ProbeReport>),
            Control(Option<EngineControl>),
        }

        let mut probe_open = true;
        let mut control_open = true;
        loop {
            let ev = tokio::select! {
                _ = tokio::time::sleep_until(deadline) => LoopEvent::Deadline,
                _ = ticker.tick() => LoopEvent::Tick,
                r = self.probe_rx.recv(), if probe_open => LoopEvent::Probe(r),
                c = self.control_rx.recv(), if control_open => LoopEvent::Control(c),
            };
            match ev {
                LoopEvent::Deadline => break,
                LoopEvent::Tick => {
                    let samples = self.sampler.tick(&self.mgr, phase);
                    for s in &samples {
                        self.data.record_throughput(s.clone());
                    }
                    if let PhaseMode::Warmup(opt) = &mut mode {
                        let dir_sample = samples
                            .iter()
                            .find(|s| phase.expects_traffic(s.direction));
                        let (raw, smoothed) = dir_sample
                            .map(|s| (s.raw_mbps, s.smoothed_mbps))
                            .unwrap_or((0.0, 0.0));
                        let rtt = self.last_rtt.take();
                        let action = opt.on_tick(raw, smoothed, rtt);
                        let direction = match phase {
                            Phase::DownloadWarmup => Direction::Download,
                            _ => Direction::Upload,
                        };
                        let finished = matches!(action, WarmupAction::Finish(_));
                        self.apply_warmup_action(action, direction);
                        if finished {
                            tracing::debug!(phase = %phase, "warmup finished before deadline");
                        }
                    }
                }
                LoopEvent::Probe(Some(report)) => self.on_probe_report(phase, report),
                LoopEvent::Probe(None) => {
                    // Probe thread died; keep running on load alone.
                    tracing::warn!("latency probe channel closed");
                    probe_open = false;
                }
                LoopEvent::Control(Some(EngineControl::Cancel)) => {
                    tracing::info!(phase = %phase, "cancel requested");
                    self.cancelled = true;
                    break;
                }
                LoopEvent::Control(None) => {
                    // Controller dropped; nothing further can arrive.
                    control_open = false;
                }
            }
        }
        Ok(mode)
    }

    fn apply_warmup_action(&mut self, action: WarmupAction, direction: Direction) {
        match action {
            WarmupAction::None => {}
            WarmupAction::ApplyDownload { chunk_size } => {
                self.dl_engine.set_chunk_size(chunk_size);
            }
            WarmupAction::ApplyUpload {
                pending,
                delay_ms,
                chunk_size,
            } => {
                self.ul_engine.tuning().adopt(pending, delay_ms, chunk_size);
            }
            WarmupAction::Finish(params) => match direction {
                Direction::Download => self.data.download_params = Some(params),
                Direction::Upload => self.data.upload_params = Some(params),
            },
        }
    }

    /// Record one probe outcome, publish it, and run the per-phase timeout
    /// policy.
    fn on_probe_report(&mut self, phase: Phase, report: ProbeReport) {
        if report.is_timeout {
            self.consecutive_timeouts += 1;
        } else {
            self.consecutive_timeouts = 0;
        }

        let m = LatencyMeasurement {
            elapsed_ms: self.test_start.elapsed().as_secs_f64() * 1000.0,
            phase,
            rtt_ms: report.rtt_ms,
            is_timeout: report.is_timeout,
            consecutive_timeouts: self.consecutive_timeouts,
        };
        self.data.record_latency(m.clone());
        self.last_rtt = Some(report.rtt_ms);
        let _ = self.event_tx.send(TestEvent::Latency(m));

        if report.is_timeout {
            // Per-phase thresholds; bidirectional parameters are frozen and
            // exempt from backoff entirely.
            let policy = match phase {
                Phase::UploadWarmup => Some((10, 0.85, Some(Direction::Upload))),
                Phase::DownloadWarmup => Some((5, 0.75, Some(Direction::Download))),
                Phase::Bidirectional => None,
                _ => Some((4, 0.7, None)),
            };
            if let Some((limit, factor, direction)) = policy {
                if self.consecutive_timeouts >= limit {
                    tracing::warn!(
                        phase = %phase,
                        timeouts = self.consecutive_timeouts,
                        factor,
                        "probe timeout threshold reached; forcing backoff"
                    );
                    let _ = self.event_tx.send(TestEvent::Backoff { direction, factor });
                    self.apply_backoff(direction, factor);
                    self.consecutive_timeouts = 0;
                }
            }
        } else {
            // RTT feedback into the saturation load: elevated RTT grows the
            // probe reservation by shrinking the pacer target; Upload also
            // tunes its pending window. Warmups run the optimizer's own
            // guardrail and Bidirectional is frozen.
            match phase {
                Phase::Download => {
                    let peak = self
                        .data
                        .download_params
                        .as_ref()
                        .map(|p| p.peak_mbps)
                        .unwrap_or(0.0);
                    let threshold = warmup::latency_threshold_ms(self.baseline_ms, peak);
                    self.dl_reservation
                        .on_latency(&self.dl_pacer, report.rtt_ms, threshold);
                }
                Phase::Upload => {
                    let peak = self
                        .data
                        .upload_params
                        .as_ref()
                        .map(|p| p.peak_mbps)
                        .unwrap_or(0.0);
                    let threshold = warmup::latency_threshold_ms(self.baseline_ms, peak);
                    self.governor
                        .on_latency(self.ul_engine.tuning(), report.rtt_ms, threshold);
                    self.ul_reservation
                        .on_latency(&self.ul_pacer, report.rtt_ms, threshold);
                }
                _ => {}
            }
        }
    }

    fn apply_backoff(&mut self, direction: Option<Direction>, factor: f64) {
        let downscale_download = |engine: &DownloadEngine| {
            let cur = engine.chunk_size();
            let next = ((cur as f64 * factor) as u64).max(64 * 1024);
            engine.set_chunk_size(next);
        };
        match direction {
            Some(Direction::Upload) => self.ul_engine.tuning().apply_backoff(factor),
            Some(Direction::Download) => downscale_download(&self.dl_engine),
            None => {
                self.ul_engine.tuning().apply_backoff(factor);
                downscale_download(&self.dl_engine);
            }
        }
    }

    /// Phase-end teardown: graceful stop, then the emergency path if
    /// anything lingers.
    async fn teardown_phase_streams(&mut self) {
        let residual = self.mgr.terminate_all(self.cfg.termination_grace).await;
        if residual > 0 {
            tracing::warn!(
                residual,
                "{}",
                EngineError::LeakedStream { count: residual }
            );
            self.mgr.emergency_cleanup();
        }
    }

    /// Enter `Complete`, tear everything down, freeze the report.
    async fn finish(mut self, server_info: Option<serde_json::Value>) -> Result<TestReport> {
        // Complete is reachable from any state, including after a fatal
        // transition error.
        let _ = self.phases.start_phase(Phase::Complete);
        self.probe.set_phase(None);
        self.probe.stop();

        self.teardown_phase_streams().await;
        debug_assert_eq!(self.mgr.active_counts(), (0, 0));
        self.phases.end_phase();

        if self.data.baseline_latency_ms.is_none() {
            self.baseline_ms = self.data.compute_baseline_latency();
        }

        let mut latency_summaries = BTreeMap::new();
        for (phase, bucket) in &self.data.latency {
            latency_summaries.insert(*phase, stats::latency_summary_from_bucket(bucket));
        }
        let mut download_summaries = BTreeMap::new();
        for (phase, bucket) in &self.data.download_throughput {
            download_summaries.insert(*phase, metrics::summarize_phase(bucket));
        }
        let mut upload_summaries = BTreeMap::new();
        for (phase, bucket) in &self.data.upload_throughput {
            upload_summaries.insert(*phase, metrics::summarize_phase(bucket));
        }

        let timestamp_utc = time::OffsetDateTime::now_utc()
            .format(&time::format_description::well_known::Rfc3339)
            .unwrap_or_else(|_| "now".into());

        Ok(TestReport {
            timestamp_utc,
            base_url: self.cfg.base_url.clone(),
            baseline_latency_ms: self.baseline_ms,
            latency_summaries,
            download_summaries,
            upload_summaries,
            server_info,
            leaked_streams: self.mgr.leaked_count(),
            aborted: self.cancelled,
            data: self.data,
        })
    }
}
