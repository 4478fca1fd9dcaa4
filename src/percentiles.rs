//! Nearest-rank percentile statistics over recorded latencies.
//!
//! Latencies are kept exactly (in microseconds) for the lifetime of a run, so
//! percentiles here are not approximations: p(N) is the smallest recorded
//! value such that at least N% of values are less than or equal to it.

use serde::Serialize;
use std::collections::HashMap;

/// Percentile statistics for a set of latency measurements.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PercentileStats {
    /// Number of samples
    pub count: u64,

    /// Minimum value (microseconds)
    pub min: u64,

    /// Maximum value (microseconds)
    pub max: u64,

    /// Mean/average value (microseconds)
    pub mean: f64,

    /// 50th percentile - median (microseconds)
    pub p50: u64,

    /// 90th percentile (microseconds)
    pub p90: u64,

    /// 95th percentile (microseconds)
    pub p95: u64,

    /// 99th percentile (microseconds)
    pub p99: u64,

    /// 99.9th percentile (microseconds)
    pub p99_9: u64,
}

impl PercentileStats {
    /// Computes statistics from values sorted ascending.
    ///
    /// Returns None for an empty slice.
    pub fn from_sorted(sorted_us: &[u64]) -> Option<Self> {
        let (&min, &max) = (sorted_us.first()?, sorted_us.last()?);
        let sum: u128 = sorted_us.iter().map(|v| *v as u128).sum();
        let rank = |p: f64| nearest_rank(sorted_us, p).unwrap_or(max);

        Some(Self {
            count: sorted_us.len() as u64,
            min,
            max,
            mean: sum as f64 / sorted_us.len() as f64,
            p50: rank(50.0),
            p90: rank(90.0),
            p95: rank(95.0),
            p99: rank(99.0),
            p99_9: rank(99.9),
        })
    }

    /// Format statistics as a human-readable string.
    pub fn format(&self) -> String {
        format!(
            "count={}, min={:.2}ms, max={:.2}ms, mean={:.2}ms, p50={:.2}ms, p90={:.2}ms, p95={:.2}ms, p99={:.2}ms, p99.9={:.2}ms",
            self.count,
            us_to_ms(self.min),
            us_to_ms(self.max),
            self.mean / 1000.0,
            us_to_ms(self.p50),
            us_to_ms(self.p90),
            us_to_ms(self.p95),
            us_to_ms(self.p99),
            us_to_ms(self.p99_9),
        )
    }

    /// Format statistics as a compact table row.
    pub fn format_table_row(&self, label: &str) -> String {
        format!(
            "{:<30} {:>8} {:>8.2} {:>8.2} {:>8.2} {:>8.2} {:>8.2} {:>8.2} {:>8.2}",
            label,
            self.count,
            us_to_ms(self.p50),
            us_to_ms(self.p90),
            us_to_ms(self.p95),
            us_to_ms(self.p99),
            us_to_ms(self.p99_9),
            self.mean / 1000.0,
            us_to_ms(self.max),
        )
    }
}

/// Nearest-rank percentile of values sorted ascending.
///
/// `percentile` is clamped to [0, 100]; p0 yields the minimum.
pub fn nearest_rank(sorted: &[u64], percentile: f64) -> Option<u64> {
    if sorted.is_empty() {
        return None;
    }
    let p = if percentile.is_nan() {
        100.0
    } else {
        percentile.clamp(0.0, 100.0)
    };
    let n = sorted.len();
    // multiply before dividing: (99.9 / 100.0) * 1000.0 lands just above 999
    let rank = (p * n as f64 / 100.0).ceil() as usize;
    Some(sorted[rank.clamp(1, n) - 1])
}

pub fn us_to_ms(us: u64) -> f64 {
    us as f64 / 1000.0
}

/// Format percentile statistics as a table.
///
/// Labels without any latency data are listed with a dash row.
pub fn format_percentile_table(
    title: &str,
    labels: &[String],
    stats_map: &HashMap<String, PercentileStats>,
) -> String {
    if labels.is_empty() {
        return format!("## {}\n\nNo data available.\n", title);
    }

    let mut output = String::new();
    output.push_str(&format!("\n## {}\n\n", title));
    output.push_str(&format!(
        "{:<30} {:>8} {:>8} {:>8} {:>8} {:>8} {:>8} {:>8} {:>8}\n",
        "Scenario", "Count", "P50", "P90", "P95", "P99", "P99.9", "Mean", "Max"
    ));
    output.push_str(&format!(
        "{:<30} {:>8} {:>8} {:>8} {:>8} {:>8} {:>8} {:>8} {:>8}\n",
        "", "", "(ms)", "(ms)", "(ms)", "(ms)", "(ms)", "(ms)", "(ms)"
    ));
    output.push_str(&"-".repeat(110));
    output.push('\n');

    for label in labels {
        match stats_map.get(label) {
            Some(stats) => output.push_str(&stats.format_table_row(label)),
            None => output.push_str(&format!("{:<30} {:>8} {:>8}", label, 0, "-")),
        }
        output.push('\n');
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nearest_rank_basic() {
        let values: Vec<u64> = (1..=10).map(|v| v * 10).collect();
        assert_eq!(nearest_rank(&values, 50.0), Some(50));
        assert_eq!(nearest_rank(&values, 90.0), Some(90));
        assert_eq!(nearest_rank(&values, 95.0), Some(100));
        assert_eq!(nearest_rank(&values, 0.0), Some(10));
        assert_eq!(nearest_rank(&values, 100.0), Some(100));
        assert_eq!(nearest_rank(&values, 250.0), Some(100));
    }

    #[test]
    fn test_nearest_rank_empty() {
        assert_eq!(nearest_rank(&[], 50.0), None);
        assert!(PercentileStats::from_sorted(&[]).is_none());
    }

    #[test]
    fn test_stats_from_sorted() {
        let values: Vec<u64> = (1..=1000).collect();
        let stats = PercentileStats::from_sorted(&values).unwrap();
        assert_eq!(stats.count, 1000);
        assert_eq!(stats.min, 1);
        assert_eq!(stats.max, 1000);
        assert_eq!(stats.p50, 500);
        assert_eq!(stats.p95, 950);
        assert_eq!(stats.p99_9, 999);
        assert!((stats.mean - 500.5).abs() < 1e-9);
    }

    #[test]
    fn test_single_value() {
        let stats = PercentileStats::from_sorted(&[5_000]).unwrap();
        assert_eq!(stats.p50, 5_000);
        assert_eq!(stats.p99, 5_000);
        assert!(stats.format().contains("p95=5.00ms"));
    }

    #[test]
    fn test_format_percentile_table() {
        let mut stats_map = HashMap::new();
        stats_map.insert(
            "yarp".to_string(),
            PercentileStats::from_sorted(&[1_000, 2_000, 3_000]).unwrap(),
        );
        let labels = vec!["yarp".to_string(), "ocelot".to_string()];

        let table = format_percentile_table("Latency", &labels, &stats_map);
        assert!(table.contains("Latency"));
        assert!(table.contains("yarp"));
        assert!(table.contains("ocelot"));
        assert!(table.contains("P95"));
    }

    #[test]
    fn test_format_percentile_table_empty() {
        let table = format_percentile_table("Empty", &[], &HashMap::new());
        assert!(table.contains("No data available"));
    }
}
