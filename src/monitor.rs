//! Per-stream step statistics.

use crate::error::Result;
use serde::Serialize;
use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::time::{Duration, Instant};

/// Steps kept for the windowed throughput figure.
const WINDOW_STEPS: usize = 16;

/// Snapshot produced by [`StepMonitor::report`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonitorReport {
    pub steps: u64,
    pub total_bytes: u64,
    pub elapsed_secs: f64,
    pub steps_per_second: f64,
    /// MB/s over the whole stream.
    pub total_rate_mbps: f64,
    /// MB/s over the last few steps.
    pub window_rate_mbps: f64,
    pub average_latency_ms: Option<f64>,
    pub max_latency_ms: Option<f64>,
    pub dropped_steps: u64,
    pub drop_rate: f64,
}

#[derive(Debug)]
pub struct StepMonitor {
    started: Instant,
    steps: u64,
    total_bytes: u64,
    dropped_steps: u64,
    window: VecDeque<(Instant, u64)>,
    latency_sum_ms: f64,
    latency_max_ms: Option<f64>,
    latency_samples: u64,
}

impl Default for StepMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl StepMonitor {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            steps: 0,
            total_bytes: 0,
            dropped_steps: 0,
            window: VecDeque::with_capacity(WINDOW_STEPS + 1),
            latency_sum_ms: 0.0,
            latency_max_ms: None,
            latency_samples: 0,
        }
    }

    pub fn end_step(&mut self, bytes: u64) {
        self.steps += 1;
        self.total_bytes += bytes;
        self.window.push_back((Instant::now(), bytes));
        if self.window.len() > WINDOW_STEPS {
            self.window.pop_front();
        }
    }

    /// Steps that were never observed (skipped or lost).
    pub fn record_dropped(&mut self, steps: u64) {
        self.dropped_steps += steps;
    }

    /// End-to-end latency of a step stamped `timestamp_ms` by its producer.
    pub fn record_timestamp(&mut self, timestamp_ms: i64) {
        let now = chrono::Utc::now().timestamp_millis();
        let latency = (now - timestamp_ms).max(0) as f64;
        self.latency_sum_ms += latency;
        self.latency_samples += 1;
        self.latency_max_ms = Some(self.latency_max_ms.map_or(latency, |m| m.max(latency)));
    }

    pub fn report(&self) -> MonitorReport {
        let elapsed = self.started.elapsed().as_secs_f64();
        let per_second = |value: f64, secs: f64| if secs > 0.0 { value / secs } else { 0.0 };

        let window_rate = match (self.window.front(), self.window.back()) {
            (Some((first, _)), Some((last, _))) if self.window.len() > 1 => {
                let span = last.duration_since(*first).max(Duration::from_micros(1));
                // The first entry only marks the start of the window.
                let bytes: u64 = self.window.iter().skip(1).map(|(_, b)| *b).sum();
                per_second(bytes as f64, span.as_secs_f64()) / 1e6
            }
            _ => 0.0,
        };
        let observed = self.steps + self.dropped_steps;

        MonitorReport {
            steps: self.steps,
            total_bytes: self.total_bytes,
            elapsed_secs: elapsed,
            steps_per_second: per_second(self.steps as f64, elapsed),
            total_rate_mbps: per_second(self.total_bytes as f64, elapsed) / 1e6,
            window_rate_mbps: window_rate,
            average_latency_ms: (self.latency_samples > 0)
                .then(|| self.latency_sum_ms / self.latency_samples as f64),
            max_latency_ms: self.latency_max_ms,
            dropped_steps: self.dropped_steps,
            drop_rate: if observed > 0 {
                self.dropped_steps as f64 / observed as f64
            } else {
                0.0
            },
        }
    }

    /// Write the current report as pretty JSON.
    pub fn write_report(&self, path: &Path) -> Result<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(&mut writer, &self.report()).map_err(std::io::Error::from)?;
        writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_and_drop_rate() {
        let mut monitor = StepMonitor::new();
        monitor.end_step(1000);
        monitor.end_step(3000);
        monitor.record_dropped(2);
        let report = monitor.report();
        assert_eq!(report.steps, 2);
        assert_eq!(report.total_bytes, 4000);
        assert_eq!(report.dropped_steps, 2);
        assert!((report.drop_rate - 0.5).abs() < 1e-9);
        assert!(report.average_latency_ms.is_none());
    }

    #[test]
    fn test_latency_from_timestamp() {
        let mut monitor = StepMonitor::new();
        let then = chrono::Utc::now().timestamp_millis() - 40;
        monitor.record_timestamp(then);
        let report = monitor.report();
        assert!(report.average_latency_ms.unwrap() >= 40.0);
        assert_eq!(report.max_latency_ms, report.average_latency_ms);
    }

    #[test]
    fn test_write_report() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("monitor.json");
        let mut monitor = StepMonitor::new();
        monitor.end_step(64);
        monitor.write_report(&path)?;

        let json: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path)?)?;
        assert_eq!(json["steps"], 1);
        assert_eq!(json["total_bytes"], 64);
        Ok(())
    }
}
