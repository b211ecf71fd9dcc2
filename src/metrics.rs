use crate::model::{ThroughputSample, ThroughputSummary};
use std::time::Duration;

/// Compute (mean, median, p25, p75) from raw sample values.
pub fn compute_metrics(samples: &[f64]) -> Option<(f64, f64, f64, f64)> {
    if samples.len() < 2 {
        return None;
    }
    let mut sorted = samples.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let n = sorted.len();
    let mean = samples.iter().sum::<f64>() / samples.len() as f64;
    let median = sorted[n / 2];
    let p25 = sorted[n / 4];
    let p75 = sorted[3 * n / 4];
    Some((mean, median, p25, p75))
}

/// Drop the ramp-up head of a phase before summarizing: ignore the first
/// 20% of the window (at least one second) so the summary reflects steady
/// state. Falls back to the full window for short or sparse sample sets.
pub fn estimate_steady_window(
    samples: &[(Duration, u64)],
    total_duration: Duration,
) -> Option<(u64, Duration)> {
    if samples.len() < 2 {
        return None;
    }
    let ignore = total_duration.mul_f64(0.20).max(Duration::from_secs(1));
    let start_idx = samples.iter().position(|(t, _)| *t >= ignore).unwrap_or(0);
    let (t_start, b_start) = samples[start_idx];
    let (t_end, b_end) = *samples.last().unwrap();
    let dt = t_end.saturating_sub(t_start);
    if dt.as_millis() < 200 {
        return None;
    }
    Some((b_end.saturating_sub(b_start), dt))
}

/// Summarize one phase bucket of throughput samples.
pub fn summarize_phase(samples: &[ThroughputSample]) -> ThroughputSummary {
    if samples.is_empty() {
        return ThroughputSummary::default();
    }

    let first = samples.first().unwrap();
    let last = samples.last().unwrap();
    let duration_ms = (last.elapsed_ms - first.elapsed_ms).max(0.0) as u64;
    let bytes = last.session_bytes.saturating_sub(first.session_bytes);

    let raw: Vec<f64> = samples
        .iter()
        .filter(|s| !s.interpolated)
        .map(|s| s.raw_mbps)
        .collect();
    let (mean, median, p25, p75) = match compute_metrics(&raw) {
        Some(m) => m,
        None => {
            let secs = (duration_ms as f64 / 1000.0).max(1e-9);
            let mbps = (bytes as f64 * 8.0) / (secs * 1e6);
            (mbps, mbps, mbps, mbps)
        }
    };

    ThroughputSummary {
        bytes,
        duration_ms,
        mean_mbps: Some(mean),
        median_mbps: Some(median),
        p25_mbps: Some(p25),
        p75_mbps: Some(p75),
    }
}
