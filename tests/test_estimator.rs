//! Unit tests for command classification and timeout estimation.

use execd::estimator::{Complexity, TimeoutEstimator};
use execd::monitor::ResourceMonitor;
use execd::store::TimingStore;
use std::time::Duration;

/// Estimator with a load threshold no real machine reaches, so the
/// multiplier is always 1.0 and assertions stay deterministic.
fn estimator(store: TimingStore) -> TimeoutEstimator {
    TimeoutEstimator::new(store, ResourceMonitor::with_threshold(1e9), 300)
}

fn fresh_estimator() -> TimeoutEstimator {
    estimator(TimingStore::new(Duration::from_secs(3600)))
}

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

#[test]
fn test_classify_category_is_first_token() {
    let est = fresh_estimator();
    assert_eq!(est.classify("echo hello").category, "echo");
    assert_eq!(est.classify("  python script.py  ").category, "python");
}

#[test]
fn test_classify_complexity_by_length() {
    let est = fresh_estimator();
    assert_eq!(est.classify("ls").complexity, Complexity::Simple);
    assert_eq!(
        est.classify(&format!("echo {}", "x".repeat(60))).complexity,
        Complexity::Medium
    );
    assert_eq!(
        est.classify(&format!("echo {}", "x".repeat(250))).complexity,
        Complexity::Complex
    );
}

#[test]
fn test_fingerprint_normalizes_case_and_whitespace() {
    let est = fresh_estimator();
    let a = est.classify("Echo   Hello").fingerprint;
    let b = est.classify("echo hello").fingerprint;
    let c = est.classify("echo goodbye").fingerprint;
    assert_eq!(a, b);
    assert_ne!(a, c);
    assert!(a.starts_with("task:timing:"));
}

// ---------------------------------------------------------------------------
// Heuristic base
// ---------------------------------------------------------------------------

#[test]
fn test_heuristic_base_scales_with_length() {
    let est = fresh_estimator();
    assert_eq!(est.heuristic_base("ls"), 30.0);
    assert_eq!(est.heuristic_base(&"x".repeat(100)), 60.0);
    // Long command without any complexity verbs.
    assert_eq!(est.heuristic_base(&"z ".repeat(150)), 120.0);
}

#[test]
fn test_heuristic_base_adds_for_complexity_verbs() {
    let est = fresh_estimator();
    let command = format!(
        "please create and build and implement the thing {}",
        "pad ".repeat(50)
    );
    // 120 base + 3 verbs x 30.
    assert_eq!(est.heuristic_base(&command), 210.0);
}

#[test]
fn test_heuristic_base_adds_for_llm_markers() {
    let est = fresh_estimator();
    let command = format!("claude -p 'summarize' {}", "pad ".repeat(60));
    assert!(est.heuristic_base(&command) >= 180.0);
}

// ---------------------------------------------------------------------------
// Estimation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_estimate_without_history_uses_floors() {
    let est = fresh_estimator();
    let estimate = est.estimate("echo hello").await;
    // Heuristic 30s is lifted to the 60s expected floor and 300s max floor.
    assert_eq!(estimate.expected_secs, 60);
    assert_eq!(estimate.max_secs, 300);
    assert!(estimate.rationale.contains("no history"));
}

#[tokio::test]
async fn test_estimate_uses_history_with_margin() {
    let store = TimingStore::new(Duration::from_secs(3600));
    let est = estimator(store);
    for _ in 0..3 {
        est.record("echo hello", 100.0, true);
    }

    let estimate = est.estimate("echo hello").await;
    // mean 100s x 1.2 margin.
    assert_eq!(estimate.expected_secs, 120);
    assert_eq!(estimate.max_secs, 300);
    assert!(estimate.rationale.contains("history"));
}

#[tokio::test]
async fn test_estimate_history_can_raise_max_above_floor() {
    let est = fresh_estimator();
    est.record("echo hello", 400.0, true);

    let estimate = est.estimate("echo hello").await;
    assert_eq!(estimate.expected_secs, 480);
    assert_eq!(estimate.max_secs, 480);
}

#[tokio::test]
async fn test_estimate_ignores_suspiciously_fast_history() {
    let est = fresh_estimator();
    // Below the 10s sanity floor: treated as no data.
    est.record("echo hello", 2.0, true);

    let estimate = est.estimate("echo hello").await;
    assert_eq!(estimate.expected_secs, 60);
    assert!(estimate.rationale.contains("sanity floor"));
}

#[tokio::test]
async fn test_estimate_never_below_minimums() {
    let est = fresh_estimator();
    let estimate = est.estimate("true").await;
    assert!(estimate.expected_secs >= 60);
    assert!(estimate.max_secs >= 300);
}
