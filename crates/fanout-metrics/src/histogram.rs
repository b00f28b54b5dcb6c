use crate::summary::LatencyDistribution;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Decades covered, 1µs up to ~115 days.
const DECADES: usize = 13;
/// One bin for zero, then nine bins per decade keyed by leading digit.
const NUM_BINS: usize = 1 + DECADES * 9;

/// Lock-free log-linear latency histogram.
///
/// Every power of ten is split into nine bins by leading digit, so each
/// estimate is within about 10% of the true value at any scale. Recording is
/// a handful of relaxed atomic increments and is safe from any task.
///
/// Bin layout (microseconds):
/// - Bin 0: 0
/// - Bins 1-9: 1, 2, ..., 9
/// - Bins 10-18: 10-19, 20-29, ..., 90-99
/// - Bins 19-27: 100-199, ..., 900-999
/// - and so on, one group of nine per decade
#[derive(Debug)]
pub struct LatencyHistogram {
    bins: [AtomicU64; NUM_BINS],
    total_latency: AtomicU64,
    sample_count: AtomicU64,
    min: AtomicU64,
    max: AtomicU64,
}

impl LatencyHistogram {
    pub fn new() -> Self {
        Self {
            bins: std::array::from_fn(|_| AtomicU64::new(0)),
            total_latency: AtomicU64::new(0),
            sample_count: AtomicU64::new(0),
            min: AtomicU64::new(u64::MAX),
            max: AtomicU64::new(0),
        }
    }

    pub fn record(&self, latency: Duration) {
        let latency_us = u64::try_from(latency.as_micros()).unwrap_or(u64::MAX);
        self.record_us(latency_us);
    }

    pub fn record_us(&self, latency_us: u64) {
        self.bins[Self::bin_for(latency_us)].fetch_add(1, Ordering::Relaxed);
        self.total_latency.fetch_add(latency_us, Ordering::Relaxed);
        self.sample_count.fetch_add(1, Ordering::Relaxed);
        self.min.fetch_min(latency_us, Ordering::Relaxed);
        self.max.fetch_max(latency_us, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.sample_count.load(Ordering::Relaxed)
    }

    fn bin_for(latency_us: u64) -> usize {
        if latency_us == 0 {
            return 0;
        }
        let decade = latency_us.ilog10() as usize;
        if decade >= DECADES {
            return NUM_BINS - 1;
        }
        let leading = (latency_us / 10u64.pow(decade as u32)) as usize;
        1 + decade * 9 + (leading - 1)
    }

    /// Lower and upper bound of a bin.
    fn bin_bounds(bin: usize) -> (u64, u64) {
        if bin == 0 {
            return (0, 1);
        }
        let decade = (bin - 1) / 9;
        let leading = ((bin - 1) % 9 + 1) as u64;
        let unit = 10u64.pow(decade as u32);
        (leading * unit, (leading + 1) * unit)
    }

    /// Estimated value at `percentile` (0-100), interpolated inside its bin
    /// and clamped to the observed range. Zero when empty.
    pub fn percentile(&self, percentile: f64) -> u64 {
        let total = self.count();
        if total == 0 {
            return 0;
        }

        let rank = ((percentile.clamp(0.0, 100.0) / 100.0) * total as f64).ceil().max(1.0) as u64;
        let min = self.min.load(Ordering::Relaxed);
        let max = self.max.load(Ordering::Relaxed);

        let mut cumulative = 0;
        for (bin, counter) in self.bins.iter().enumerate() {
            let count = counter.load(Ordering::Relaxed);
            if count == 0 {
                continue;
            }
            if cumulative + count >= rank {
                let (low, high) = Self::bin_bounds(bin);
                let fraction = (rank - cumulative) as f64 / count as f64;
                let estimate = low as f64 + fraction * (high - low) as f64;
                return (estimate as u64).clamp(min, max);
            }
            cumulative += count;
        }

        max
    }

    /// Summary statistics, or `None` if nothing was recorded.
    pub fn distribution(&self) -> Option<LatencyDistribution> {
        let samples = self.count();
        if samples == 0 {
            return None;
        }

        Some(LatencyDistribution {
            samples,
            min_us: self.min.load(Ordering::Relaxed),
            max_us: self.max.load(Ordering::Relaxed),
            mean_us: self.total_latency.load(Ordering::Relaxed) / samples,
            p50_us: self.percentile(50.0),
            p90_us: self.percentile(90.0),
            p99_us: self.percentile(99.0),
        })
    }
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self::new()
    }
}
