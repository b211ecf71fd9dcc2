use crate::model::{LatencyMeasurement, LatencySummary};
use hdrhistogram::Histogram;

/// Welford running mean/variance; used for jitter without keeping a second
/// copy of the sample list.
#[derive(Debug, Default, Clone)]
pub struct OnlineStats {
    n: u64,
    mean: f64,
    m2: f64,
}

impl OnlineStats {
    pub fn push(&mut self, x: f64) {
        self.n += 1;
        let delta = x - self.mean;
        self.mean += delta / (self.n as f64);
        let delta2 = x - self.mean;
        self.m2 += delta * delta2;
    }

    pub fn mean(&self) -> Option<f64> {
        if self.n == 0 {
            None
        } else {
            Some(self.mean)
        }
    }

    pub fn stddev(&self) -> Option<f64> {
        if self.n < 2 {
            None
        } else {
            Some((self.m2 / ((self.n - 1) as f64)).sqrt())
        }
    }
}

/// Summarize a phase bucket of latency measurements. Timeouts count toward
/// `sent` and loss but never enter the histogram.
pub fn latency_summary_from_bucket(bucket: &[LatencyMeasurement]) -> LatencySummary {
    let sent = bucket.len() as u64;
    let mut online = OnlineStats::default();
    let samples: Vec<f64> = bucket
        .iter()
        .filter(|m| m.is_valid())
        .map(|m| {
            online.push(m.rtt_ms);
            m.rtt_ms
        })
        .collect();
    let received = samples.len() as u64;

    let loss = if sent == 0 {
        0.0
    } else {
        ((sent - received) as f64) / (sent as f64)
    };

    if samples.is_empty() {
        return LatencySummary {
            sent,
            received,
            loss,
            ..Default::default()
        };
    }

    // HDRHistogram wants integer values; store microseconds to preserve precision.
    let mut h = Histogram::<u64>::new_with_bounds(1, 60_000_000, 3).unwrap();
    for &ms in &samples {
        let us = (ms * 1000.0).round().clamp(1.0, 60_000_000.0) as u64;
        let _ = h.record(us);
    }

    LatencySummary {
        sent,
        received,
        loss,
        min_ms: Some((h.min() as f64) / 1000.0),
        mean_ms: online.mean(),
        p50_ms: Some((h.value_at_quantile(0.50) as f64) / 1000.0),
        p90_ms: Some((h.value_at_quantile(0.90) as f64) / 1000.0),
        p99_ms: Some((h.value_at_quantile(0.99) as f64) / 1000.0),
        max_ms: Some((h.max() as f64) / 1000.0),
        jitter_ms: online.stddev(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Phase, TIMEOUT_SENTINEL_MS};

    fn m(rtt_ms: f64, is_timeout: bool) -> LatencyMeasurement {
        LatencyMeasurement {
            elapsed_ms: 0.0,
            phase: Phase::Download,
            rtt_ms,
            is_timeout,
            consecutive_timeouts: 0,
        }
    }

    #[test]
    fn online_stats_welford() {
        let mut s = OnlineStats::default();
        for x in [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0] {
            s.push(x);
        }
        assert!((s.mean().unwrap() - 5.0).abs() < 1e-9);
        // Sample stddev of the classic series is ~2.138.
        assert!((s.stddev().unwrap() - 2.138).abs() < 0.01);
    }

    #[test]
    fn timeouts_count_as_loss_not_latency() {
        let bucket = vec![m(10.0, false), m(TIMEOUT_SENTINEL_MS, true), m(20.0, false)];
        let s = latency_summary_from_bucket(&bucket);
        assert_eq!(s.sent, 3);
        assert_eq!(s.received, 2);
        assert!((s.loss - 1.0 / 3.0).abs() < 1e-9);
        // The 1000 ms sentinel must not leak into max.
        assert!(s.max_ms.unwrap() < 100.0);
    }

    #[test]
    fn all_timeout_bucket_has_full_loss() {
        let bucket = vec![m(TIMEOUT_SENTINEL_MS, true); 4];
        let s = latency_summary_from_bucket(&bucket);
        assert_eq!(s.received, 0);
        assert_eq!(s.loss, 1.0);
        assert!(s.p50_ms.is_none());
    }

    #[test]
    fn empty_bucket_is_zeroes() {
        let s = latency_summary_from_bucket(&[]);
        assert_eq!(s.sent, 0);
        assert_eq!(s.loss, 0.0);
    }

    #[test]
    fn percentiles_are_ordered() {
        let bucket: Vec<_> = (1..=100).map(|i| m(i as f64, false)).collect();
        let s = latency_summary_from_bucket(&bucket);
        let p50 = s.p50_ms.unwrap();
        let p90 = s.p90_ms.unwrap();
        let p99 = s.p99_ms.unwrap();
        assert!(p50 <= p90 && p90 <= p99);
        assert!(s.min_ms.unwrap() <= p50);
        assert!(p99 <= s.max_ms.unwrap());
    }
}
