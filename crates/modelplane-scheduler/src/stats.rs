//! Bounded duration samples and their summary statistics

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Summary of the samples currently held
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DurationStats {
    pub count: usize,
    pub min: f64,
    pub max: f64,
    pub average: f64,
    pub p50: f64,
    pub p90: f64,
    pub p99: f64,
}

/// Ring buffer of durations in milliseconds; the oldest sample is dropped
/// once `max_samples` is reached
#[derive(Debug, Clone)]
pub struct DurationSamples {
    samples: VecDeque<f64>,
    max_samples: usize,
}

impl DurationSamples {
    pub fn new(max_samples: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(max_samples.min(1024)),
            max_samples,
        }
    }

    pub fn push(&mut self, value: f64) {
        if self.max_samples == 0 {
            return;
        }
        while self.samples.len() >= self.max_samples {
            self.samples.pop_front();
        }
        self.samples.push_back(value);
    }

    /// Change the bound, dropping the oldest samples if needed
    pub fn resize(&mut self, max_samples: usize) {
        self.max_samples = max_samples;
        while self.samples.len() > max_samples {
            self.samples.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn max_samples(&self) -> usize {
        self.max_samples
    }

    /// Samples from oldest to newest
    pub fn iter(&self) -> impl Iterator<Item = &f64> {
        self.samples.iter()
    }

    /// Statistics over the held samples; `None` when empty
    pub fn stats(&self) -> Option<DurationStats> {
        if self.samples.is_empty() {
            return None;
        }
        let mut sorted: Vec<f64> = self.samples.iter().copied().collect();
        sorted.sort_by(f64::total_cmp);

        let count = sorted.len();
        let sum: f64 = sorted.iter().sum();
        Some(DurationStats {
            count,
            min: sorted[0],
            max: sorted[count - 1],
            average: sum / count as f64,
            p50: percentile(&sorted, 50.0),
            p90: percentile(&sorted, 90.0),
            p99: percentile(&sorted, 99.0),
        })
    }
}

/// Nearest-rank percentile of a sorted, non-empty slice
fn percentile(sorted: &[f64], p: f64) -> f64 {
    let rank = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keeps_most_recent_samples() {
        let mut samples = DurationSamples::new(100);
        for i in 0..1000 {
            samples.push(i as f64);
        }
        assert_eq!(samples.len(), 100);
        let held: Vec<f64> = samples.iter().copied().collect();
        let expected: Vec<f64> = (900..1000).map(|i| i as f64).collect();
        assert_eq!(held, expected);

        let stats = samples.stats().unwrap();
        assert_eq!(stats.count, 100);
        assert_eq!(stats.min, 900.0);
        assert_eq!(stats.max, 999.0);
        assert_eq!(stats.average, 949.5);
        assert_eq!(stats.p50, 949.0);
        assert_eq!(stats.p90, 989.0);
        assert_eq!(stats.p99, 998.0);
    }

    #[test]
    fn test_percentiles_small_sample() {
        let mut samples = DurationSamples::new(10);
        for v in [5.0, 1.0, 3.0] {
            samples.push(v);
        }
        let stats = samples.stats().unwrap();
        assert_eq!(stats.p50, 3.0);
        assert_eq!(stats.p99, 5.0);
        assert_eq!(stats.min, 1.0);
    }

    #[test]
    fn test_resize_drops_oldest() {
        let mut samples = DurationSamples::new(10);
        for i in 0..10 {
            samples.push(i as f64);
        }
        samples.resize(3);
        let held: Vec<f64> = samples.iter().copied().collect();
        assert_eq!(held, vec![7.0, 8.0, 9.0]);

        samples.push(10.0);
        assert_eq!(samples.len(), 3);
    }

    #[test]
    fn test_empty() {
        let mut samples = DurationSamples::new(0);
        samples.push(1.0);
        assert!(samples.is_empty());
        assert!(samples.stats().is_none());
    }
}
