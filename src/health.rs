//! Chain health counters surfaced on `/health`.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

/// Recent block intervals kept for the average-block-time figure.
const INTERVAL_WINDOW: usize = 64;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthStats {
    pub uptime: String,
    pub uptime_seconds: u64,
    pub total_blocks: u64,
    pub avg_block_seconds: f64,
    pub blocks_per_hour: f64,
    pub last_block_time: Option<String>,
}

#[derive(Debug)]
struct HealthInner {
    total_blocks: u64,
    last_block_at: Option<(Instant, DateTime<Utc>)>,
    intervals: VecDeque<Duration>,
}

#[derive(Debug)]
pub struct ChainHealth {
    started_at: Instant,
    inner: Mutex<HealthInner>,
}

impl ChainHealth {
    pub fn new() -> Self {
        ChainHealth {
            started_at: Instant::now(),
            inner: Mutex::new(HealthInner {
                total_blocks: 0,
                last_block_at: None,
                intervals: VecDeque::with_capacity(INTERVAL_WINDOW),
            }),
        }
    }

    pub fn record_block(&self) {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        if let Some((prev, _)) = inner.last_block_at {
            if inner.intervals.len() == INTERVAL_WINDOW {
                inner.intervals.pop_front();
            }
            inner.intervals.push_back(now - prev);
        }
        inner.last_block_at = Some((now, Utc::now()));
        inner.total_blocks += 1;
    }

    pub fn total_blocks(&self) -> u64 {
        self.inner.lock().total_blocks
    }

    pub fn stats(&self) -> HealthStats {
        let inner = self.inner.lock();
        let uptime = self.started_at.elapsed();
        let avg = if inner.intervals.is_empty() {
            0.0
        } else {
            inner.intervals.iter().map(|d| d.as_secs_f64()).sum::<f64>()
                / inner.intervals.len() as f64
        };
        let blocks_per_hour = if avg > 0.0 { 3600.0 / avg } else { 0.0 };
        HealthStats {
            uptime: format!("{}s", uptime.as_secs()),
            uptime_seconds: uptime.as_secs(),
            total_blocks: inner.total_blocks,
            avg_block_seconds: avg,
            blocks_per_hour,
            last_block_time: inner.last_block_at.map(|(_, utc)| utc.to_rfc3339()),
        }
    }
}

impl Default for ChainHealth {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_blocks_and_reports_last_time() {
        let health = ChainHealth::new();
        assert_eq!(health.stats().total_blocks, 0);
        assert!(health.stats().last_block_time.is_none());

        health.record_block();
        health.record_block();
        let stats = health.stats();
        assert_eq!(stats.total_blocks, 2);
        assert!(stats.last_block_time.is_some());
    }
}
