//! The report model (C1): the canonical, serializable shape of a run's
//! results. Internal [`SpecResult`]s are rich (durations, retry/coverage
//! info, a typed error); the public [`Report`]/[`SpecResultReport`] types are
//! the camelCase JSON external collaborators (formatters, CI integrations)
//! actually consume.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::coverage::CoverageInfo;
use crate::error::SpecError;
use crate::tree::{ContextId, SpecId, Tree};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SpecStatus {
    Passed,
    Failed,
    Pending,
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
pub struct RetryInfo {
    pub attempts: u32,
    pub max_retries: u32,
}

/// The result of running (or not running) a single spec.
#[derive(Debug, Clone)]
pub struct SpecResult {
    pub(crate) spec_id: SpecId,
    pub description: String,
    pub context_path: Vec<String>,
    pub status: SpecStatus,
    pub body_duration: Duration,
    pub before_each_duration: Duration,
    pub after_each_duration: Duration,
    pub total_duration: Duration,
    pub error: Option<SpecError>,
    pub retry_info: Option<RetryInfo>,
    pub coverage_info: Option<CoverageInfo>,
}

impl SpecResult {
    pub(crate) fn new(
        spec_id: SpecId,
        description: &str,
        context_path: &[String],
        status: SpecStatus,
        error: Option<SpecError>,
    ) -> Self {
        Self {
            spec_id,
            description: description.to_string(),
            context_path: context_path.to_vec(),
            status,
            body_duration: Duration::ZERO,
            before_each_duration: Duration::ZERO,
            after_each_duration: Duration::ZERO,
            total_duration: Duration::ZERO,
            error,
            retry_info: None,
            coverage_info: None,
        }
    }

    pub(crate) fn passed(tree: &Tree, spec_id: SpecId, context_path: &[String]) -> Self {
        Self::new(
            spec_id,
            &tree.spec(spec_id).description,
            context_path,
            SpecStatus::Passed,
            None,
        )
    }

    pub(crate) fn failed(
        tree: &Tree,
        spec_id: SpecId,
        context_path: &[String],
        error: SpecError,
    ) -> Self {
        Self::new(
            spec_id,
            &tree.spec(spec_id).description,
            context_path,
            SpecStatus::Failed,
            Some(error),
        )
    }

    pub(crate) fn skipped(tree: &Tree, spec_id: SpecId, context_path: &[String]) -> Self {
        Self::new(
            spec_id,
            &tree.spec(spec_id).description,
            context_path,
            SpecStatus::Skipped,
            None,
        )
    }

    pub(crate) fn pending(tree: &Tree, spec_id: SpecId, context_path: &[String]) -> Self {
        Self::new(
            spec_id,
            &tree.spec(spec_id).description,
            context_path,
            SpecStatus::Pending,
            None,
        )
    }

    pub(crate) fn hook_failure(
        tree: &Tree,
        spec_id: SpecId,
        context_path: &[String],
        error: SpecError,
    ) -> Self {
        Self::failed(tree, spec_id, context_path, error)
    }

    pub(crate) fn cancelled(tree: &Tree, spec_id: SpecId, context_path: &[String]) -> Self {
        Self::new(
            spec_id,
            &tree.spec(spec_id).description,
            context_path,
            SpecStatus::Skipped,
            Some(SpecError::Cancelled {
                reason: "run was cancelled".to_string(),
            }),
        )
    }

    /// Builds a passing result without a `Tree` reference, for middleware
    /// that only has a [`crate::executor::SpecExecutionContext`] in hand.
    pub(crate) fn synthesize_pass(
        spec_id: SpecId,
        description: &str,
        context_path: &[String],
    ) -> Self {
        Self::new(spec_id, description, context_path, SpecStatus::Passed, None)
    }

    /// As `synthesize_pass`, for a failure synthesized by middleware (a
    /// timeout, a rejecting filter) rather than produced by running hooks.
    pub(crate) fn synthesize_failure(
        spec_id: SpecId,
        description: &str,
        context_path: &[String],
        error: SpecError,
    ) -> Self {
        Self::new(
            spec_id,
            description,
            context_path,
            SpecStatus::Failed,
            Some(error),
        )
    }

    /// As `synthesize_pass`, for a spec skipped by a `Filter` middleware.
    pub(crate) fn synthesize_skip(
        spec_id: SpecId,
        description: &str,
        context_path: &[String],
    ) -> Self {
        Self::new(spec_id, description, context_path, SpecStatus::Skipped, None)
    }

    /// Applied when an `after_all` hook fails: the error is attached to the
    /// last spec result reported for that context, per the spec's "cascades
    /// to the last-run spec in the context" rule.
    pub(crate) fn apply_after_all_error(&mut self, error: SpecError) {
        self.status = SpecStatus::Failed;
        self.error = Some(error);
    }
}

/// A nested context in a [`Report`], mirroring the tree's shape but carrying
/// only what a formatter needs.
#[derive(Debug, Clone, Serialize)]
pub struct ContextReport {
    pub description: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub contexts: Vec<ContextReport>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub specs: Vec<SpecResultReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SpecResultReport {
    pub description: String,
    pub status: SpecStatus,
    #[serde(rename = "durationMs", skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(rename = "errorKind", skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<&'static str>,
    #[serde(rename = "retryAttempts", skip_serializing_if = "Option::is_none")]
    pub retry_attempts: Option<u32>,
}

impl From<&SpecResult> for SpecResultReport {
    fn from(result: &SpecResult) -> Self {
        Self {
            description: result.description.clone(),
            status: result.status,
            duration_ms: (result.total_duration > Duration::ZERO)
                .then(|| result.total_duration.as_secs_f64() * 1000.0),
            error: result.error.as_ref().map(|e| e.detail()),
            error_kind: result.error.as_ref().map(|e| e.kind_label()),
            retry_attempts: result.retry_info.as_ref().map(|r| r.attempts),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Summary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub pending: usize,
    pub skipped: usize,
    #[serde(rename = "durationMs")]
    pub duration_ms: f64,
}

impl Summary {
    fn accumulate(&mut self, result: &SpecResult) {
        self.total += 1;
        match result.status {
            SpecStatus::Passed => self.passed += 1,
            SpecStatus::Failed => self.failed += 1,
            SpecStatus::Pending => self.pending += 1,
            SpecStatus::Skipped => self.skipped += 1,
        }
        self.duration_ms += result.total_duration.as_secs_f64() * 1000.0;
    }
}

/// The canonical, serializable run report. External collaborators (CLI
/// formatters, CI uploaders) consume only this shape.
#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub timestamp: DateTime<Utc>,
    pub source: String,
    pub summary: Summary,
    pub contexts: Vec<ContextReport>,
}

impl Report {
    /// Builds a `Report` from the tree that was executed and the results of
    /// running it, grouping results back into the tree's own nesting rather
    /// than re-deriving structure from path strings (which would collapse
    /// same-named sibling contexts).
    pub fn from_tree(
        tree: &Tree,
        results: &[SpecResult],
        source: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let mut by_spec: HashMap<SpecId, &SpecResult> = HashMap::with_capacity(results.len());
        let mut summary = Summary::default();
        for result in results {
            summary.accumulate(result);
            by_spec.insert(result.spec_id, result);
        }

        let contexts = Self::build_context_children(tree, tree.root(), &by_spec);

        Self {
            timestamp,
            source: source.into(),
            summary,
            contexts,
        }
    }

    fn build_context_children(
        tree: &Tree,
        id: ContextId,
        by_spec: &HashMap<SpecId, &SpecResult>,
    ) -> Vec<ContextReport> {
        tree.context(id)
            .children
            .iter()
            .map(|&child_id| Self::build_context(tree, child_id, by_spec))
            .collect()
    }

    fn build_context(
        tree: &Tree,
        id: ContextId,
        by_spec: &HashMap<SpecId, &SpecResult>,
    ) -> ContextReport {
        let node = tree.context(id);
        let specs = node
            .specs
            .iter()
            .filter_map(|&spec_id| by_spec.get(&spec_id).map(|r| SpecResultReport::from(*r)))
            .collect();
        let contexts = Self::build_context_children(tree, id, by_spec);
        ContextReport {
            description: node.description.clone(),
            contexts,
            specs,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn to_json_pretty(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

/// Streaming observer: invoked once per spec as its result becomes
/// available, before the whole-run `Report` is assembled. Lets a CLI show
/// live progress without waiting for the run to finish.
pub trait Observer: Send + Sync {
    fn on_result(&self, result: &SpecResult);
}
