//! Timeout estimation from command shape, history, and system load.
//!
//! A command is classified into (category, complexity, fingerprint); a
//! heuristic base timeout from textual cues is combined with historical
//! timings for the same fingerprint, clamped to hard floors, and finally
//! scaled by the resource monitor's load multiplier.

use crate::monitor::ResourceMonitor;
use crate::store::TimingStore;
use std::hash::{DefaultHasher, Hash, Hasher};

/// Historical means below this are treated as suspect and ignored.
const SANITY_FLOOR_SECS: f64 = 10.0;

/// No estimate ever goes below this.
const MIN_TIMEOUT_SECS: f64 = 60.0;

/// Verbs that indicate a long-running, generative task.
const COMPLEXITY_KEYWORDS: &[&str] = &[
    "create", "build", "implement", "design", "develop", "full", "complete",
    "comprehensive", "test", "suite",
];

/// Markers of LLM or external-tool invocations that add latency.
const LLM_MARKERS: &[&str] = &["claude", "llm", "mcp"];

/// Complexity class of a command, judged from its text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Complexity {
    Simple,
    Medium,
    Complex,
}

impl std::fmt::Display for Complexity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Simple => write!(f, "simple"),
            Self::Medium => write!(f, "medium"),
            Self::Complex => write!(f, "complex"),
        }
    }
}

/// Classification of one command.
#[derive(Debug, Clone)]
pub struct TaskClass {
    /// Tool name: the first word of the command.
    pub category: String,
    pub complexity: Complexity,
    /// Timing-store key derived from the normalized command text.
    pub fingerprint: String,
}

/// The estimator's output. `rationale` is diagnostic only.
#[derive(Debug, Clone)]
pub struct Estimate {
    pub expected_secs: u64,
    pub max_secs: u64,
    pub rationale: String,
}

/// Chooses planned timeouts for execution requests.
#[derive(Debug, Clone)]
pub struct TimeoutEstimator {
    store: TimingStore,
    monitor: ResourceMonitor,
    /// Hard floor for the max timeout.
    hard_floor_secs: f64,
}

impl TimeoutEstimator {
    #[must_use]
    pub fn new(store: TimingStore, monitor: ResourceMonitor, hard_floor_secs: u64) -> Self {
        Self {
            store,
            monitor,
            hard_floor_secs: hard_floor_secs as f64,
        }
    }

    /// Classify a command into category, complexity, and fingerprint.
    #[must_use]
    pub fn classify(&self, command: &str) -> TaskClass {
        let normalized = normalize(command);
        let category = normalized
            .split_whitespace()
            .next()
            .unwrap_or("unknown")
            .to_string();

        let complexity = if command.len() < 50 {
            Complexity::Simple
        } else if command.len() < 200 {
            Complexity::Medium
        } else {
            Complexity::Complex
        };

        let mut hasher = DefaultHasher::new();
        normalized.hash(&mut hasher);
        TaskClass {
            category,
            complexity,
            fingerprint: format!("task:timing:{:016x}", hasher.finish()),
        }
    }

    /// Heuristic base timeout from textual cues alone.
    #[must_use]
    pub fn heuristic_base(&self, command: &str) -> f64 {
        if command.len() < 50 {
            return 30.0;
        }
        if command.len() < 200 {
            return 60.0;
        }

        let lower = command.to_lowercase();
        let mut base = 120.0;
        let keywords = COMPLEXITY_KEYWORDS
            .iter()
            .filter(|kw| lower.contains(*kw))
            .count();
        base += keywords as f64 * 30.0;
        if LLM_MARKERS.iter().any(|m| lower.contains(m)) {
            base += 60.0;
        }
        base
    }

    /// Estimate (expected, max) timeouts for a command.
    ///
    /// Reads the load multiplier exactly once and applies it to the final
    /// values, per the resource monitor's contract.
    pub async fn estimate(&self, command: &str) -> Estimate {
        let class = self.classify(command);
        let heuristic = self.heuristic_base(command);

        let (expected, based_on) = match self.store.lookup(&class.fingerprint) {
            Some(stats) if stats.sample_count >= 1 && stats.mean_duration >= SANITY_FLOOR_SECS => {
                (
                    (stats.mean_duration * 1.2).max(MIN_TIMEOUT_SECS),
                    format!(
                        "history ({} samples, mean {:.1}s, success rate {:.0}%)",
                        stats.sample_count,
                        stats.mean_duration,
                        stats.success_rate * 100.0
                    ),
                )
            }
            Some(_) => (
                heuristic.max(MIN_TIMEOUT_SECS),
                "heuristic (history below sanity floor)".to_string(),
            ),
            None => (
                heuristic.max(MIN_TIMEOUT_SECS),
                "heuristic (no history)".to_string(),
            ),
        };

        let max = heuristic.max(expected).max(self.hard_floor_secs);

        let multiplier = self.monitor.timeout_multiplier().await;
        let expected = expected * multiplier;
        let max = max * multiplier;

        let estimate = Estimate {
            expected_secs: expected.round() as u64,
            max_secs: max.round() as u64,
            rationale: format!(
                "category={} complexity={} based_on={} load_multiplier={}",
                class.category, class.complexity, based_on, multiplier
            ),
        };
        tracing::info!(
            expected = estimate.expected_secs,
            max = estimate.max_secs,
            rationale = %estimate.rationale,
            "estimated timeout"
        );
        estimate
    }

    /// Record a finished execution in the timing store.
    pub fn record(&self, command: &str, duration_secs: f64, success: bool) {
        let class = self.classify(command);
        self.store.record(&class.fingerprint, duration_secs, success);
    }
}

/// Normalize a command for fingerprinting: lowercase, collapsed whitespace.
fn normalize(command: &str) -> String {
    command
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}
