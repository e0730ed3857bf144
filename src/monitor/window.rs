//! Per-target rolling window and its derived statistics.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use tdigests::TDigest;

/// A single value held in a rolling window.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowEntry {
    pub metric: String,
    pub value: f64,
    pub observed_at: DateTime<Utc>,
}

/// Summary of one metric over the window.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WindowStats {
    pub count: usize,
    pub min: f64,
    pub max: f64,
    pub avg: f64,
    pub p50: f64,
    pub p95: f64,
}

/// Bounded sequence of recent samples, limited by count and by time horizon.
#[derive(Debug, Clone)]
pub struct RollingWindow {
    entries: VecDeque<WindowEntry>,
    max_samples: usize,
    horizon: ChronoDuration,
    newest: Option<DateTime<Utc>>,
}

impl RollingWindow {
    pub fn new(max_samples: usize, horizon: ChronoDuration) -> Self {
        Self {
            entries: VecDeque::with_capacity(max_samples.min(64)),
            max_samples: max_samples.max(1),
            horizon,
            newest: None,
        }
    }

    /// Append an entry and evict whatever falls outside the bounds.
    ///
    /// The horizon is measured back from the newest observation in the window.
    /// Returns the number of evicted entries.
    pub fn push(&mut self, entry: WindowEntry) -> usize {
        let newest = match self.newest {
            Some(t) if t >= entry.observed_at => t,
            _ => entry.observed_at,
        };
        self.newest = Some(newest);
        self.entries.push_back(entry);

        let mut evicted = match newest.checked_sub_signed(self.horizon) {
            Some(cutoff) => self.evict_older_than(cutoff),
            None => 0,
        };
        while self.entries.len() > self.max_samples {
            self.entries.pop_front();
            evicted += 1;
        }
        evicted
    }

    /// Drop entries observed before `cutoff`.
    pub fn evict_older_than(&mut self, cutoff: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|e| e.observed_at >= cutoff);
        if self.entries.is_empty() {
            self.newest = None;
        }
        before - self.entries.len()
    }

    pub fn horizon(&self) -> ChronoDuration {
        self.horizon
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &WindowEntry> {
        self.entries.iter()
    }

    /// Recompute per-metric statistics.
    pub fn stats(&self) -> BTreeMap<String, WindowStats> {
        let mut by_metric: BTreeMap<String, Vec<f64>> = BTreeMap::new();
        for entry in &self.entries {
            by_metric
                .entry(entry.metric.clone())
                .or_default()
                .push(entry.value);
        }

        by_metric
            .into_iter()
            .map(|(metric, values)| (metric, summarize(values)))
            .collect()
    }
}

/// Compute min/max/avg exactly and percentiles from a t-digest.
pub fn summarize(values: Vec<f64>) -> WindowStats {
    if values.is_empty() {
        return WindowStats::default();
    }

    let count = values.len();
    let mut min = f64::MAX;
    let mut max = f64::MIN;
    let mut sum = 0.0;
    for &v in &values {
        min = min.min(v);
        max = max.max(v);
        sum += v;
    }

    let digest = TDigest::from_values(values);

    WindowStats {
        count,
        min,
        max,
        avg: sum / count as f64,
        p50: sanitize_float(digest.estimate_quantile(0.50)),
        p95: sanitize_float(digest.estimate_quantile(0.95)),
    }
}

fn sanitize_float(f: f64) -> f64 {
    if f.is_nan() || f.is_infinite() {
        0.0
    } else {
        f
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn entry(metric: &str, value: f64, secs: i64) -> WindowEntry {
        WindowEntry {
            metric: metric.to_string(),
            value,
            observed_at: Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
                + ChronoDuration::seconds(secs),
        }
    }

    #[test]
    fn test_horizon_eviction() {
        let mut window = RollingWindow::new(100, ChronoDuration::seconds(60));
        window.push(entry("latency_ms", 1.0, 0));
        window.push(entry("latency_ms", 2.0, 30));
        assert_eq!(window.len(), 2);

        // 61s after the first entry pushes it out of the horizon
        let evicted = window.push(entry("latency_ms", 3.0, 61));
        assert_eq!(evicted, 1);
        assert_eq!(window.len(), 2);

        let newest = entry("x", 0.0, 61).observed_at;
        assert!(window.iter().all(|e| e.observed_at >= newest - window.horizon()));
    }

    #[test]
    fn test_late_sample_outside_horizon_is_dropped() {
        let mut window = RollingWindow::new(100, ChronoDuration::seconds(60));
        window.push(entry("latency_ms", 1.0, 120));
        let evicted = window.push(entry("latency_ms", 2.0, 0));
        assert_eq!(evicted, 1);
        assert_eq!(window.len(), 1);
        assert_eq!(window.iter().next().map(|e| e.value), Some(1.0));
    }

    #[test]
    fn test_horizon_beyond_calendar_range() {
        // a million years reaches past the earliest representable date
        let mut window = RollingWindow::new(100, ChronoDuration::weeks(52_000_000));
        window.push(entry("latency_ms", 1.0, 0));
        assert_eq!(window.push(entry("latency_ms", 2.0, 60)), 0);
        assert_eq!(window.len(), 2);
    }

    #[test]
    fn test_size_bound() {
        let mut window = RollingWindow::new(3, ChronoDuration::seconds(3600));
        for i in 0..10 {
            window.push(entry("latency_ms", i as f64, i));
        }
        assert_eq!(window.len(), 3);
        let values: Vec<f64> = window.iter().map(|e| e.value).collect();
        assert_eq!(values, vec![7.0, 8.0, 9.0]);
    }

    #[test]
    fn test_stats_per_metric() {
        let mut window = RollingWindow::new(100, ChronoDuration::seconds(3600));
        for (i, v) in [10.0, 20.0, 30.0].iter().enumerate() {
            window.push(entry("latency_ms", *v, i as i64));
        }
        window.push(entry("up", 1.0, 5));

        let stats = window.stats();
        assert_eq!(stats.len(), 2);

        let latency = &stats["latency_ms"];
        assert_eq!(latency.count, 3);
        assert_eq!(latency.min, 10.0);
        assert_eq!(latency.max, 30.0);
        assert!((latency.avg - 20.0).abs() < 1e-9);
        assert!(latency.p50 >= 10.0 && latency.p50 <= 30.0);

        assert_eq!(stats["up"].count, 1);
    }

    #[test]
    fn test_empty_summary() {
        assert_eq!(summarize(vec![]), WindowStats::default());
    }
}
