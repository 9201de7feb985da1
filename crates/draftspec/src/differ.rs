//! The incremental differ (C7): compares a static parse of a source file
//! against the previously recorded one, to decide which specs a watch-mode
//! run actually needs to re-execute.
//!
//! `StaticParseResult` is an external collaborator's output — the core never
//! parses source itself (that's explicitly out of scope); it only consumes
//! whatever shape a static parser hands it.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StaticSpecType {
    Regular,
    Focused,
    Skipped,
}

/// One spec as discovered by a static source parser, before anything has run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticSpec {
    pub description: String,
    pub context_path: Vec<String>,
    pub line_number: u32,
    pub spec_type: StaticSpecType,
    pub is_pending: bool,
}

/// The full output of parsing one source file. `is_complete` is false when
/// the parser gave up (dynamically generated specs it couldn't enumerate) —
/// in that case the differ can't trust identity matching and must ask for a
/// full run instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticParseResult {
    pub specs: Vec<StaticSpec>,
    pub is_complete: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Added,
    Modified,
    Deleted,
}

#[derive(Debug, Clone, Serialize)]
pub struct SpecChange {
    pub description: String,
    pub context_path: Vec<String>,
    pub change_type: ChangeType,
    pub old_line: Option<u32>,
    pub new_line: Option<u32>,
}

/// The result of diffing one file's current parse against its prior one.
#[derive(Debug, Clone, Serialize)]
pub struct SpecChangeSet {
    pub file_path: String,
    pub changes: Vec<SpecChange>,
    pub has_dynamic_specs: bool,
    pub dependency_changed: bool,
}

impl SpecChangeSet {
    /// When true, identity-based incremental matching can't be trusted
    /// (dynamic specs, or a dependency changed) and the whole file's specs
    /// should be re-run rather than just the ones this change set names.
    pub fn requires_full_run(&self) -> bool {
        self.has_dynamic_specs || self.dependency_changed
    }

    pub fn specs_to_run(&self) -> impl Iterator<Item = &SpecChange> {
        self.changes.iter().filter(|c| c.change_type != ChangeType::Deleted)
    }
}

/// Disambiguates same-named specs under the same context path within a
/// single file by first-occurrence order: the first `it "works"` under
/// `describe "math"` always matches the first occurrence on the next parse,
/// the second always matches the second, and so on.
type IdentityKey = (Vec<String>, String, usize);

fn index_specs(specs: &[StaticSpec]) -> HashMap<IdentityKey, &StaticSpec> {
    let mut counts: HashMap<(Vec<String>, String), usize> = HashMap::new();
    let mut index = HashMap::with_capacity(specs.len());
    for spec in specs {
        let base = (spec.context_path.clone(), spec.description.clone());
        let ordinal = *counts.get(&base).unwrap_or(&0);
        counts.insert(base.clone(), ordinal + 1);
        index.insert((base.0, base.1, ordinal), spec);
    }
    index
}

/// Computes the change set between a prior parse (if any) and the current
/// one. `dependency_changed` comes from the caller's dependency tracking
/// (see [`SnapshotTracker::has_dependency_changed`]) since the differ itself
/// has no notion of cross-file dependencies.
pub fn diff(
    file_path: &str,
    prior: Option<&StaticParseResult>,
    current: &StaticParseResult,
    dependency_changed: bool,
) -> SpecChangeSet {
    let dynamic = !current.is_complete || prior.map(|p| !p.is_complete).unwrap_or(false);
    if dynamic {
        tracing::trace!(file = file_path, "dynamic specs detected, skipping identity diff");
        return SpecChangeSet {
            file_path: file_path.to_string(),
            changes: Vec::new(),
            has_dynamic_specs: true,
            dependency_changed,
        };
    }

    let Some(prior) = prior else {
        let changes = current
            .specs
            .iter()
            .map(|s| SpecChange {
                description: s.description.clone(),
                context_path: s.context_path.clone(),
                change_type: ChangeType::Added,
                old_line: None,
                new_line: Some(s.line_number),
            })
            .collect();
        return SpecChangeSet {
            file_path: file_path.to_string(),
            changes,
            has_dynamic_specs: false,
            dependency_changed,
        };
    };

    let prior_index = index_specs(&prior.specs);
    let current_index = index_specs(&current.specs);
    let mut changes = Vec::new();

    for (key, spec) in &current_index {
        match prior_index.get(key) {
            None => changes.push(SpecChange {
                description: spec.description.clone(),
                context_path: spec.context_path.clone(),
                change_type: ChangeType::Added,
                old_line: None,
                new_line: Some(spec.line_number),
            }),
            Some(old) => {
                if old.line_number != spec.line_number
                    || old.spec_type != spec.spec_type
                    || old.is_pending != spec.is_pending
                {
                    tracing::trace!(
                        file = file_path,
                        description = %spec.description,
                        "spec modified"
                    );
                    changes.push(SpecChange {
                        description: spec.description.clone(),
                        context_path: spec.context_path.clone(),
                        change_type: ChangeType::Modified,
                        old_line: Some(old.line_number),
                        new_line: Some(spec.line_number),
                    });
                }
            }
        }
    }

    for (key, spec) in &prior_index {
        if !current_index.contains_key(key) {
            changes.push(SpecChange {
                description: spec.description.clone(),
                context_path: spec.context_path.clone(),
                change_type: ChangeType::Deleted,
                old_line: Some(spec.line_number),
                new_line: None,
            });
        }
    }

    SpecChangeSet {
        file_path: file_path.to_string(),
        changes,
        has_dynamic_specs: false,
        dependency_changed,
    }
}

struct DependencyState {
    last_seen: DateTime<Utc>,
    changed: bool,
}

/// Per-file state the differ needs across runs: the previous parse, and the
/// last-known timestamp of anything the file depends on (a shared fixture
/// module, say). Safe to share across concurrently watched files via `Arc`.
#[derive(Default)]
pub struct SnapshotTracker {
    snapshots: dashmap::DashMap<String, StaticParseResult>,
    dependencies: dashmap::DashMap<String, DependencyState>,
}

impl SnapshotTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn norm(path: &str) -> String {
        path.to_lowercase()
    }

    pub fn has_state(&self, path: &str) -> bool {
        self.snapshots.contains_key(&Self::norm(path))
    }

    pub fn record_state(&self, path: &str, result: StaticParseResult) {
        self.snapshots.insert(Self::norm(path), result);
    }

    pub fn clear(&self, path: &str) {
        let key = Self::norm(path);
        self.snapshots.remove(&key);
        self.dependencies.remove(&key);
    }

    /// Records a dependency's last-modified timestamp. A strictly newer
    /// timestamp than the one previously recorded marks the dependency
    /// "changed" until the next [`Self::get_changes`] call consumes it;
    /// equal or older timestamps are not treated as changes.
    pub fn record_dependency(&self, path: &str, timestamp: DateTime<Utc>) {
        let key = Self::norm(path);
        match self.dependencies.get_mut(&key) {
            Some(mut state) => {
                if timestamp > state.last_seen {
                    state.last_seen = timestamp;
                    state.changed = true;
                }
            }
            None => {
                self.dependencies.insert(
                    key,
                    DependencyState {
                        last_seen: timestamp,
                        changed: false,
                    },
                );
            }
        }
    }

    pub fn has_dependency_changed(&self, path: &str) -> bool {
        self.dependencies
            .get(&Self::norm(path))
            .map(|s| s.changed)
            .unwrap_or(false)
    }

    /// Diffs `current` against whatever was last recorded for `path`, then
    /// clears the dependency-changed flag (a one-shot signal consumed by
    /// this diff cycle).
    pub fn get_changes(&self, path: &str, current: &StaticParseResult) -> SpecChangeSet {
        let key = Self::norm(path);
        let prior = self.snapshots.get(&key).map(|r| r.clone());
        let dependency_changed = self.has_dependency_changed(path);
        if let Some(mut state) = self.dependencies.get_mut(&key) {
            state.changed = false;
        }
        diff(path, prior.as_ref(), current, dependency_changed)
    }
}
