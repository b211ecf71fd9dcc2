//! Application-level orchestration utilities.
//!
//! This module owns run lifecycle control (start/cancel/restart) so that
//! embedding shells only deal with commands in and events out.

mod controller;

pub use controller::{run_controller, RunCommand};
