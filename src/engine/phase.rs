use crate::error::EngineError;
use crate::model::{Phase, PhaseChangeKind, TestEvent};
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::Instant;

/// One completed or in-flight phase in the history.
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseRecord {
    pub phase: Phase,
    pub start_elapsed_ms: f64,
    pub end_elapsed_ms: Option<f64>,
}

#[derive(Debug)]
struct ActivePhase {
    phase: Phase,
    started: Instant,
}

/// Advances the run through the fixed phase sequence.
///
/// Owned by the run task; the sampler and probe read the current phase
/// through it, so a transition is observed atomically (either the old phase
/// or the new one, never an in-between).
pub struct PhaseController {
    test_start: Instant,
    active: Option<ActivePhase>,
    history: Vec<PhaseRecord>,
    event_tx: UnboundedSender<TestEvent>,
}

impl PhaseController {
    pub fn new(test_start: Instant, event_tx: UnboundedSender<TestEvent>) -> Self {
        Self {
            test_start,
            active: None,
            history: Vec::new(),
            event_tx,
        }
    }

    pub fn current_phase(&self) -> Option<Phase> {
        self.active.as_ref().map(|a| a.phase)
    }

    pub fn phase_history(&self) -> &[PhaseRecord] {
        &self.history
    }

    pub fn elapsed_ms(&self) -> f64 {
        self.test_start.elapsed().as_secs_f64() * 1000.0
    }

    /// Time spent in the current phase.
    pub fn phase_elapsed(&self) -> Option<std::time::Duration> {
        self.active.as_ref().map(|a| a.started.elapsed())
    }

    /// End the current phase (if any) and begin `phase`.
    ///
    /// Ordering is forward-only: a target must come after the current phase
    /// in the sequence. `Complete` is reachable from anywhere, which is how
    /// aborts land. Anything else is `InvalidTransition` and fatal.
    pub fn start_phase(&mut self, phase: Phase) -> Result<(), EngineError> {
        let current = self.current_phase();
        let legal = match current {
            None => true,
            Some(_) if phase == Phase::Complete => true,
            Some(cur) => phase > cur,
        };
        if !legal {
            return Err(EngineError::InvalidTransition {
                from: current,
                to: phase,
            });
        }

        self.end_phase();

        let now = self.elapsed_ms();
        self.active = Some(ActivePhase {
            phase,
            started: Instant::now(),
        });
        self.history.push(PhaseRecord {
            phase,
            start_elapsed_ms: now,
            end_elapsed_ms: None,
        });
        tracing::info!(phase = %phase, elapsed_ms = now, "phase started");
        let _ = self.event_tx.send(TestEvent::PhaseChange {
            kind: PhaseChangeKind::Start,
            phase,
            elapsed_ms: now,
        });
        Ok(())
    }

    /// End the current phase without starting a successor.
    pub fn end_phase(&mut self) {
        if let Some(active) = self.active.take() {
            let now = self.elapsed_ms();
            if let Some(rec) = self
                .history
                .iter_mut()
                .rev()
                .find(|r| r.phase == active.phase)
            {
                rec.end_elapsed_ms = Some(now);
            }
            tracing::info!(phase = %active.phase, elapsed_ms = now, "phase ended");
            let _ = self.event_tx.send(TestEvent::PhaseChange {
                kind: PhaseChangeKind::End,
                phase: active.phase,
                elapsed_ms: now,
            });
        }
    }
}
