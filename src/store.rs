//! Advisory cache of historical task timings.
//!
//! Keys are normalized command fingerprints under the `task:timing:`
//! namespace; values hold a bounded rolling list of recent durations plus
//! success/failure counts. Entries expire after a TTL and are pruned lazily.
//! The store is purely advisory: absence of data never blocks execution, and
//! every operation is synchronous with a short critical section.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Maximum number of recent durations retained per task key.
const MAX_RECENT_DURATIONS: usize = 10;

/// Aggregate statistics for one task key.
#[derive(Debug, Clone, PartialEq)]
pub struct TimingStats {
    pub mean_duration: f64,
    pub sample_count: usize,
    pub success_rate: f64,
}

#[derive(Debug)]
struct TimingEntry {
    recent_durations: Vec<f64>,
    success_count: u64,
    failure_count: u64,
    last_seen: Instant,
}

/// Process-wide, in-memory timing cache with TTL-based expiry.
#[derive(Debug, Clone)]
pub struct TimingStore {
    entries: Arc<Mutex<HashMap<String, TimingEntry>>>,
    ttl: Duration,
}

impl TimingStore {
    /// Create a store whose entries expire after `ttl`.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            ttl,
        }
    }

    /// Look up aggregate statistics for a task key.
    ///
    /// Returns `None` when there is no (unexpired) data.
    #[must_use]
    pub fn lookup(&self, task_key: &str) -> Option<TimingStats> {
        let entries = self.entries.lock().ok()?;
        let entry = entries.get(task_key)?;

        if entry.last_seen.elapsed() >= self.ttl || entry.recent_durations.is_empty() {
            return None;
        }

        let total = entry.success_count + entry.failure_count;
        let mean =
            entry.recent_durations.iter().sum::<f64>() / entry.recent_durations.len() as f64;
        Some(TimingStats {
            mean_duration: mean,
            sample_count: entry.recent_durations.len(),
            success_rate: if total > 0 {
                entry.success_count as f64 / total as f64
            } else {
                0.0
            },
        })
    }

    /// Record an execution duration for a task key.
    ///
    /// Keeps a bounded rolling list of recent durations; older samples fall
    /// off the front. Expired entries across the whole map are pruned here.
    pub fn record(&self, task_key: &str, duration_secs: f64, success: bool) {
        let Ok(mut entries) = self.entries.lock() else {
            tracing::warn!("timing store lock poisoned, dropping sample");
            return;
        };

        let ttl = self.ttl;
        entries.retain(|_, e| e.last_seen.elapsed() < ttl);

        let entry = entries.entry(task_key.to_string()).or_insert(TimingEntry {
            recent_durations: Vec::new(),
            success_count: 0,
            failure_count: 0,
            last_seen: Instant::now(),
        });

        entry.recent_durations.push(duration_secs);
        if entry.recent_durations.len() > MAX_RECENT_DURATIONS {
            entry.recent_durations.remove(0);
        }
        if success {
            entry.success_count += 1;
        } else {
            entry.failure_count += 1;
        }
        entry.last_seen = Instant::now();

        tracing::debug!(
            task_key,
            duration_secs,
            success,
            samples = entry.recent_durations.len(),
            "recorded task timing"
        );
    }

    /// Number of unexpired entries (for observability).
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .map(|e| {
                e.values()
                    .filter(|entry| entry.last_seen.elapsed() < self.ttl)
                    .count()
            })
            .unwrap_or(0)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for TimingStore {
    fn default() -> Self {
        Self::new(Duration::from_secs(7 * 24 * 3600))
    }
}
