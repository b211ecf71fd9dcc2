//! Run lifecycle controller.
//!
//! Owns start/cancel/restart orchestration and emits events for the
//! embedding shell.

use crate::config::EngineConfig;
use crate::engine::TestEngine;
use crate::model::{EngineControl, TestEvent, TestReport};
use anyhow::Result;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::time::Duration;

/// Commands a shell can send to control the running test.
#[derive(Debug, Clone)]
pub enum RunCommand {
    /// Start a run now (no-op while one is active).
    Start,
    /// Cancel the active run, then start a fresh one.
    Restart,
    /// Cancel the active run and exit the controller.
    Quit,
}

/// Internal handle for a running test task.
struct RunCtx {
    ctrl_tx: UnboundedSender<EngineControl>,
    handle: Option<tokio::task::JoinHandle<Result<TestReport>>>,
}

/// Spawn a new test run and return its control handle.
fn start_run(cfg: &EngineConfig, event_tx: UnboundedSender<TestEvent>) -> Result<RunCtx> {
    let (ctrl_tx, ctrl_rx) = tokio::sync::mpsc::unbounded_channel::<EngineControl>();
    let engine = TestEngine::new(cfg.clone())?;
    let handle = tokio::spawn(async move { engine.run(event_tx, ctrl_rx).await });
    Ok(RunCtx {
        ctrl_tx,
        handle: Some(handle),
    })
}

/// Orchestrate test runs based on commands and forward events back to the
/// shell. Restart is serialized: the active run is cancelled first and the
/// replacement starts once completion is observed, so runs never overlap.
pub async fn run_controller(
    cfg: EngineConfig,
    event_tx: UnboundedSender<TestEvent>,
    mut cmd_rx: UnboundedReceiver<RunCommand>,
    start_immediately: bool,
) -> Result<()> {
    let mut run_ctx = if start_immediately {
        Some(start_run(&cfg, event_tx.clone())?)
    } else {
        None
    };
    let mut restart_pending = false;
    let mut quit_pending = false;
    // Cancel watchdog: if a cancel takes too long, log to keep the shell
    // informed.
    let mut cancel_deadline: Option<tokio::time::Instant> = None;
    let mut watchdog = tokio::time::interval(Duration::from_millis(500));

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(RunCommand::Start) => {
                        if run_ctx.is_none() {
                            run_ctx = Some(start_run(&cfg, event_tx.clone())?);
                        }
                    }
                    Some(RunCommand::Restart) => {
                        restart_pending = true;
                        if let Some(ctx) = &run_ctx {
                            let _ = ctx.ctrl_tx.send(EngineControl::Cancel);
                            tracing::info!("cancelling active run for restart");
                            cancel_deadline = Some(tokio::time::Instant::now() + Duration::from_secs(3));
                        } else {
                            run_ctx = Some(start_run(&cfg, event_tx.clone())?);
                            restart_pending = false;
                        }
                    }
                    Some(RunCommand::Quit) | None => {
                        // Quit waits for the current run to wind down so
                        // stream teardown completes.
                        quit_pending = true;
                        if let Some(ctx) = &run_ctx {
                            let _ = ctx.ctrl_tx.send(EngineControl::Cancel);
                            cancel_deadline = Some(tokio::time::Instant::now() + Duration::from_secs(3));
                        } else {
                            break Ok(());
                        }
                    }
                }
            }
            // Do not take the JoinHandle before this branch wins; otherwise it can be dropped
            // if another select branch is chosen, and we'll never observe completion.
            maybe_done = async {
                if let Some(ctx) = &mut run_ctx {
                    if let Some(h) = ctx.handle.as_mut() {
                        return Some(h.await);
                    }
                }
                futures::future::pending().await
            } => {
                if let Some(join_res) = maybe_done {
                    if let Some(ctx) = &mut run_ctx {
                        ctx.handle.take();
                    }
                    match join_res {
                        Ok(Ok(_report)) => {
                            // RunCompleted already went out on the event
                            // channel from inside the engine.
                        }
                        Ok(Err(e)) => {
                            tracing::error!(error = %format!("{e:#}"), "run failed");
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "run task join failed");
                        }
                    }
                    run_ctx = None;
                    cancel_deadline = None;
                    if quit_pending {
                        break Ok(());
                    }
                    if restart_pending {
                        run_ctx = Some(start_run(&cfg, event_tx.clone())?);
                        restart_pending = false;
                    }
                }
            }
            // If cancel stalls (e.g., network op in flight), keep logging.
            _ = watchdog.tick() => {
                if let Some(deadline) = cancel_deadline {
                    if tokio::time::Instant::now() >= deadline && run_ctx.is_some() {
                        tracing::warn!("run cancellation is taking longer than expected");
                        cancel_deadline = None;
                    }
                }
            }
        }
    }
}
