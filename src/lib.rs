//! Bufferbloat measurement engine.
//!
//! Saturates a link in each direction with HTTP load while a dedicated
//! probe thread measures round-trip latency, so working latency under load
//! can be compared against the unloaded baseline. The engine walks a fixed
//! phase sequence (baseline, per-direction warmup and saturation, then
//! bidirectional), discovers per-link parameters during the warmups, and
//! publishes every measurement on an event channel.
//!
//! The crate is a library: embedders construct an [`EngineConfig`], spawn
//! a [`TestEngine`] run (or drive it through
//! [`orchestrator::run_controller`]), and consume [`model::TestEvent`]s.

pub mod config;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod model;
pub mod orchestrator;
pub mod stats;

pub use config::EngineConfig;
pub use engine::TestEngine;
pub use error::EngineError;
pub use model::{
    Direction, EngineControl, LatencyMeasurement, OptimalParams, Phase, SpeedTier, TestData,
    TestEvent, TestReport, ThroughputSample,
};
