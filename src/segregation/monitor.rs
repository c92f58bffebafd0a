//! Rolling per-operation execution statistics

use dashmap::DashMap;
use std::fmt;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

/// Normalized statement text used to group executions of the same operation
///
/// Whitespace is collapsed, keywords are lower-cased and numeric or quoted
/// literals become `?`, so `SELECT * FROM t WHERE id = 7` and
/// `select * from t where id=  9` share a signature.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OperationSignature(String);

impl OperationSignature {
    #[must_use]
    pub fn of(sql: &str) -> Self {
        let mut out = String::with_capacity(sql.len());
        let mut chars = sql.trim().chars().peekable();
        let mut pending_space = false;

        while let Some(c) = chars.next() {
            if c.is_whitespace() {
                pending_space = !out.is_empty();
                continue;
            }
            if pending_space {
                out.push(' ');
                pending_space = false;
            }
            match c {
                '\'' | '"' => {
                    // Skip to the closing quote
                    for next in chars.by_ref() {
                        if next == c {
                            break;
                        }
                    }
                    out.push('?');
                }
                d if d.is_ascii_digit() && !ends_in_identifier(&out) => {
                    while chars
                        .peek()
                        .is_some_and(|n| n.is_ascii_digit() || *n == '.')
                    {
                        chars.next();
                    }
                    out.push('?');
                }
                other => out.extend(other.to_lowercase()),
            }
        }
        Self(out)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn ends_in_identifier(s: &str) -> bool {
    s.chars()
        .last()
        .is_some_and(|c| c.is_alphanumeric() || c == '_')
}

impl fmt::Display for OperationSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy)]
struct OperationRecord {
    average_ms: f64,
    executions: u64,
}

#[derive(Debug)]
struct OverallAverage {
    average_ms: f64,
    refreshed_at: Instant,
}

/// Tracks execution times and classifies operations as slow or fast
#[derive(Debug)]
pub struct PerformanceMonitor {
    records: DashMap<OperationSignature, OperationRecord>,
    overall: Mutex<OverallAverage>,
    refresh_interval: Duration,
    slow_threshold: Option<Duration>,
}

impl PerformanceMonitor {
    /// `refresh_interval` of zero recomputes the overall average on every sample
    pub fn new(refresh_interval: Duration, slow_threshold: Option<Duration>) -> Self {
        Self {
            records: DashMap::new(),
            overall: Mutex::new(OverallAverage {
                average_ms: 0.0,
                refreshed_at: Instant::now(),
            }),
            refresh_interval,
            slow_threshold,
        }
    }

    /// Fold one execution into the rolling average for `signature`
    pub fn record(&self, signature: &OperationSignature, elapsed: Duration) {
        let sample = elapsed.as_secs_f64() * 1000.0;
        let mut is_new = false;
        let average = {
            let mut record = self
                .records
                .entry(signature.clone())
                .and_modify(|r| {
                    r.average_ms = (r.average_ms * 4.0 + sample) / 5.0;
                    r.executions += 1;
                })
                .or_insert_with(|| {
                    is_new = true;
                    OperationRecord {
                        average_ms: sample,
                        executions: 1,
                    }
                });
            record.value_mut().average_ms
        };

        let refresh = {
            let overall = self.overall.lock().unwrap_or_else(PoisonError::into_inner);
            self.refresh_interval.is_zero()
                || is_new
                || overall.refreshed_at.elapsed() >= self.refresh_interval
        };
        if refresh {
            self.refresh_overall();
        }

        trace!(operation = %signature, sample_ms = sample, average_ms = average, "Recorded execution");
    }

    fn refresh_overall(&self) {
        let (sum, count) = self
            .records
            .iter()
            .fold((0.0, 0usize), |(sum, count), r| (sum + r.average_ms, count + 1));
        let mut overall = self.overall.lock().unwrap_or_else(PoisonError::into_inner);
        overall.average_ms = if count == 0 { 0.0 } else { sum / count as f64 };
        overall.refreshed_at = Instant::now();
    }

    /// Rolling average for `signature`, 0 when never seen
    #[must_use]
    pub fn average_ms(&self, signature: &OperationSignature) -> f64 {
        self.records.get(signature).map_or(0.0, |r| r.average_ms)
    }

    #[must_use]
    pub fn overall_average_ms(&self) -> f64 {
        self.overall
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .average_ms
    }

    /// Slow when at or above the configured threshold, otherwise when at or
    /// above twice the overall average (and that average exceeds 1ms)
    #[must_use]
    pub fn is_slow(&self, signature: &OperationSignature) -> bool {
        let Some(record) = self.records.get(signature).map(|r| *r) else {
            return false;
        };
        match self.slow_threshold {
            Some(threshold) => record.average_ms >= threshold.as_secs_f64() * 1000.0,
            None => {
                let overall = self.overall_average_ms();
                overall > 1.0 && record.average_ms >= overall * 2.0
            }
        }
    }

    #[must_use]
    pub fn tracked_operations(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn total_executions(&self) -> u64 {
        self.records.iter().map(|r| r.executions).sum()
    }
}
