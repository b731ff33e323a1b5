//! Per-operation health tracking with a rolling failure window.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

/// Smoothing factor for the response-time moving average.
const RESPONSE_TIME_ALPHA: f64 = 0.2;

#[derive(Debug, Default)]
struct OperationEntry {
    total: u64,
    successes: u64,
    failures: u64,
    avg_response_ms: f64,
    last_failure_at: Option<DateTime<Utc>>,
    last_failure_reason: Option<String>,
    breaker_open: bool,
    /// Rolling window of (when, success) outcomes.
    window: Vec<(Instant, bool)>,
}

/// Point-in-time health snapshot for one operation.
#[derive(Debug, Clone)]
pub struct HealthReport {
    pub operation: String,
    pub total: u64,
    pub successes: u64,
    pub failures: u64,
    /// Failure rate over the rolling window, in [0, 1].
    pub failure_rate: f64,
    pub avg_response_ms: f64,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_failure_reason: Option<String>,
    pub breaker_open: bool,
}

/// Records per-operation success/failure counts and a rolling window.
///
/// Counters live behind a single short-critical-section mutex; window
/// trimming happens inline on record and via [`HealthMonitor::trim`].
pub struct HealthMonitor {
    retention: Duration,
    entries: Mutex<HashMap<String, OperationEntry>>,
}

impl HealthMonitor {
    pub fn new(retention: Duration) -> Self {
        Self {
            retention,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn record_success(&self, operation: &str, elapsed: Duration) {
        let mut entries = self.entries.lock().expect("health lock poisoned");
        let entry = entries.entry(operation.to_string()).or_default();
        entry.total += 1;
        entry.successes += 1;
        Self::fold_response_time(entry, elapsed);
        entry.window.push((Instant::now(), true));
        Self::trim_entry(entry, self.retention);
    }

    pub fn record_failure(&self, operation: &str, elapsed: Duration, reason: &str) {
        let mut entries = self.entries.lock().expect("health lock poisoned");
        let entry = entries.entry(operation.to_string()).or_default();
        entry.total += 1;
        entry.failures += 1;
        Self::fold_response_time(entry, elapsed);
        entry.last_failure_at = Some(Utc::now());
        entry.last_failure_reason = Some(reason.to_string());
        entry.window.push((Instant::now(), false));
        Self::trim_entry(entry, self.retention);
    }

    pub fn note_breaker_open(&self, operation: &str, open: bool) {
        let mut entries = self.entries.lock().expect("health lock poisoned");
        entries.entry(operation.to_string()).or_default().breaker_open = open;
    }

    /// Failure rate over the rolling window, in [0, 1].
    pub fn failure_rate(&self, operation: &str) -> f64 {
        let entries = self.entries.lock().expect("health lock poisoned");
        entries
            .get(operation)
            .map(Self::window_failure_rate)
            .unwrap_or(0.0)
    }

    /// Unhealthy iff the breaker is open or the windowed failure rate
    /// reaches the threshold.
    pub fn is_unhealthy(&self, operation: &str, threshold: f64) -> bool {
        let entries = self.entries.lock().expect("health lock poisoned");
        match entries.get(operation) {
            Some(entry) => entry.breaker_open || Self::window_failure_rate(entry) >= threshold,
            None => false,
        }
    }

    pub fn report(&self, operation: &str) -> Option<HealthReport> {
        let entries = self.entries.lock().expect("health lock poisoned");
        entries.get(operation).map(|entry| HealthReport {
            operation: operation.to_string(),
            total: entry.total,
            successes: entry.successes,
            failures: entry.failures,
            failure_rate: Self::window_failure_rate(entry),
            avg_response_ms: entry.avg_response_ms,
            last_failure_at: entry.last_failure_at,
            last_failure_reason: entry.last_failure_reason.clone(),
            breaker_open: entry.breaker_open,
        })
    }

    pub fn reports(&self) -> Vec<HealthReport> {
        let entries = self.entries.lock().expect("health lock poisoned");
        let mut names: Vec<_> = entries.keys().cloned().collect();
        names.sort();
        drop(entries);
        names.into_iter().filter_map(|n| self.report(&n)).collect()
    }

    /// Drop window entries older than the retention cutoff.
    pub fn trim(&self) {
        let mut entries = self.entries.lock().expect("health lock poisoned");
        for entry in entries.values_mut() {
            Self::trim_entry(entry, self.retention);
        }
    }

    fn fold_response_time(entry: &mut OperationEntry, elapsed: Duration) {
        let ms = elapsed.as_secs_f64() * 1000.0;
        if entry.total == 1 {
            entry.avg_response_ms = ms;
        } else {
            entry.avg_response_ms =
                entry.avg_response_ms * (1.0 - RESPONSE_TIME_ALPHA) + ms * RESPONSE_TIME_ALPHA;
        }
    }

    fn trim_entry(entry: &mut OperationEntry, retention: Duration) {
        let cutoff = Instant::now().checked_sub(retention);
        if let Some(cutoff) = cutoff {
            entry.window.retain(|(at, _)| *at >= cutoff);
        }
    }

    fn window_failure_rate(entry: &OperationEntry) -> f64 {
        if entry.window.is_empty() {
            return 0.0;
        }
        let failures = entry.window.iter().filter(|(_, ok)| !ok).count();
        failures as f64 / entry.window.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_and_rate() {
        let monitor = HealthMonitor::new(Duration::from_secs(60));
        monitor.record_success("ping", Duration::from_millis(5));
        monitor.record_failure("ping", Duration::from_millis(10), "timeout");
        monitor.record_failure("ping", Duration::from_millis(10), "timeout");

        let report = monitor.report("ping").unwrap();
        assert_eq!(report.total, 3);
        assert_eq!(report.successes, 1);
        assert_eq!(report.failures, 2);
        assert!((report.failure_rate - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(report.last_failure_reason.as_deref(), Some("timeout"));
    }

    #[test]
    fn test_unhealthy_thresholds() {
        let monitor = HealthMonitor::new(Duration::from_secs(60));
        monitor.record_failure("db", Duration::from_millis(1), "reset");
        assert!(monitor.is_unhealthy("db", 0.5));
        assert!(!monitor.is_unhealthy("db", 1.1));

        monitor.note_breaker_open("db", true);
        assert!(monitor.is_unhealthy("db", 10.0));
    }

    #[test]
    fn test_unknown_operation_is_healthy() {
        let monitor = HealthMonitor::new(Duration::from_secs(60));
        assert!(!monitor.is_unhealthy("nothing", 0.0));
        assert_eq!(monitor.failure_rate("nothing"), 0.0);
        assert!(monitor.report("nothing").is_none());
    }

    #[test]
    fn test_trim_drops_old_entries() {
        let monitor = HealthMonitor::new(Duration::from_millis(0));
        monitor.record_failure("op", Duration::from_millis(1), "x");
        monitor.trim();
        // Window emptied; lifetime counters survive.
        assert_eq!(monitor.failure_rate("op"), 0.0);
        assert_eq!(monitor.report("op").unwrap().failures, 1);
    }
}
