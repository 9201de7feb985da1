//! The coverage tracker contract: an external collaborator the engine drives
//! around each spec's execution but never implements the instrumentation for
//! (the core has no idea how to hook a real coverage engine — it only knows
//! the start/stop/snapshot protocol).

use std::collections::BTreeSet;

use async_trait::async_trait;
use dashmap::DashMap;

/// A point-in-time coverage snapshot, opaque to the core beyond these two
/// sets. Concrete trackers populate them; the engine only diffs two
/// snapshots via the tracker itself.
#[derive(Debug, Clone, Default)]
pub struct CoverageSnapshot {
    pub files_covered: BTreeSet<String>,
    pub lines_hit: BTreeSet<String>,
}

/// External collaborator contract for coverage instrumentation (C6's
/// `Coverage` built-in drives this around a spec's execution).
#[async_trait]
pub trait CoverageTracker: Send + Sync {
    async fn start(&self);
    async fn stop(&self);
    async fn is_active(&self) -> bool;
    async fn snapshot(&self) -> CoverageSnapshot;
}

/// A coverage tracker that records nothing; used when no real tracker is
/// wired in but the `Coverage` middleware is still exercised (tests, or a
/// pipeline shared across environments where coverage is conditionally on).
#[derive(Default)]
pub struct NullCoverageTracker;

#[async_trait]
impl CoverageTracker for NullCoverageTracker {
    async fn start(&self) {}
    async fn stop(&self) {}
    async fn is_active(&self) -> bool {
        false
    }
    async fn snapshot(&self) -> CoverageSnapshot {
        CoverageSnapshot::default()
    }
}

/// Per-spec coverage delta, attached to a `SpecResult` when the `Coverage`
/// middleware ran.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CoverageInfo {
    pub spec_id: String,
    pub files_covered: BTreeSet<String>,
    pub summary: String,
}

impl CoverageInfo {
    pub fn diff(spec_id: &str, before: &CoverageSnapshot, after: &CoverageSnapshot) -> Self {
        let files_covered: BTreeSet<String> = after
            .files_covered
            .difference(&before.files_covered)
            .cloned()
            .collect();
        let lines_hit: BTreeSet<String> = after
            .lines_hit
            .difference(&before.lines_hit)
            .cloned()
            .collect();
        let summary = format!(
            "{} line(s) across {} file(s)",
            lines_hit.len(),
            files_covered.len()
        );
        Self {
            spec_id: spec_id.to_string(),
            files_covered,
            summary,
        }
    }
}

/// Process-wide aggregation of per-spec coverage deltas, keyed by a spec
/// identity string (context path joined with the description). Shared via
/// `Arc` across concurrently running specs in parallel mode, so it is backed
/// by `DashMap` rather than a `Mutex<HashMap<..>>`.
#[derive(Default)]
pub struct CoverageIndex {
    entries: DashMap<String, CoverageInfo>,
}

impl CoverageIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, spec_key: &str, info: CoverageInfo) {
        self.entries.insert(spec_key.to_string(), info);
    }

    pub fn get(&self, spec_key: &str) -> Option<CoverageInfo> {
        self.entries.get(spec_key).map(|e| e.clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn null_tracker_is_inert() {
        let tracker = NullCoverageTracker;
        tracker.start().await;
        assert!(!tracker.is_active().await);
        assert!(tracker.snapshot().await.lines_hit.is_empty());
    }

    #[test]
    fn diff_reports_newly_covered_files_and_a_summary() {
        let mut before = CoverageSnapshot::default();
        before.files_covered.insert("a.rs".to_string());
        before.lines_hit.insert("a.rs:1".to_string());
        let mut after = before.clone();
        after.files_covered.insert("b.rs".to_string());
        after.lines_hit.insert("a.rs:2".to_string());
        after.lines_hit.insert("b.rs:1".to_string());

        let info = CoverageInfo::diff("root::it works", &before, &after);
        assert_eq!(info.spec_id, "root::it works");
        assert_eq!(
            info.files_covered,
            BTreeSet::from(["b.rs".to_string()])
        );
        assert_eq!(info.summary, "2 line(s) across 1 file(s)");
    }

    #[test]
    fn index_records_per_spec() {
        let index = CoverageIndex::new();
        index.record(
            "root/child::it works",
            CoverageInfo {
                spec_id: "root/child::it works".to_string(),
                files_covered: BTreeSet::from(["a.rs".to_string()]),
                summary: "1 line(s) across 1 file(s)".to_string(),
            },
        );
        assert_eq!(index.len(), 1);
        assert!(index.get("root/child::it works").is_some());
    }
}
