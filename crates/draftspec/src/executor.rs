//! The executor (C5): walks the spec tree, runs hooks and bodies through the
//! middleware pipeline, and collects results in DSL order — sequentially by
//! default, or with bounded parallelism across sibling specs/contexts.

use std::any::Any;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures::future::BoxFuture;
use tokio::sync::{Notify, Semaphore};

use crate::error::SpecError;
use crate::middleware::{BaseFn, MiddlewarePipeline};
use crate::report::{Observer, SpecResult};
use crate::tree::{BodyFn, ContextId, SpecId, Tree};

/// Cooperative cancellation signal shared across a whole run. Middleware
/// (the `Timeout` built-in) and the executor itself both observe and set it.
#[derive(Clone)]
pub struct CancellationHandle(Arc<CancellationInner>);

struct CancellationInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl Default for CancellationHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellationHandle {
    pub fn new() -> Self {
        Self(Arc::new(CancellationInner {
            cancelled: AtomicBool::new(false),
            notify: Notify::new(),
        }))
    }

    pub fn cancel(&self) {
        self.0.cancelled.store(true, Ordering::SeqCst);
        self.0.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.cancelled.load(Ordering::SeqCst)
    }

    pub async fn cancelled(&self) {
        if !self.is_cancelled() {
            self.0.notify.notified().await;
        }
    }
}

/// Per-spec scratchpad handed to middleware and hooks: the spec's identity,
/// its context path, whether the run has a focus anywhere, the run's
/// cancellation handle, and a type-erased bag for middleware to stash data
/// in (e.g. a retry count a custom middleware wants to read back later).
#[derive(Clone)]
pub struct SpecExecutionContext {
    pub(crate) spec_id: SpecId,
    pub description: String,
    pub context_path: Vec<String>,
    pub tags: BTreeSet<String>,
    pub has_focused: bool,
    pub cancellation: CancellationHandle,
    items: Arc<DashMap<String, Arc<dyn Any + Send + Sync>>>,
}

impl SpecExecutionContext {
    pub fn full_path_string(&self) -> String {
        if self.context_path.is_empty() {
            self.description.clone()
        } else {
            format!("{}::{}", self.context_path.join("/"), self.description)
        }
    }

    pub fn set<T: Send + Sync + 'static>(&self, key: &str, value: T) {
        self.items.insert(key.to_string(), Arc::new(value));
    }

    pub fn get<T: Send + Sync + Clone + 'static>(&self, key: &str) -> Option<T> {
        self.items
            .get(key)
            .and_then(|v| v.downcast_ref::<T>().cloned())
    }

    /// Builds a standalone execution context outside a real run — used by
    /// middleware's own unit tests, which exercise a pipeline without a tree.
    #[cfg(test)]
    pub(crate) fn for_test(spec_id: SpecId, description: &str) -> Self {
        Self {
            spec_id,
            description: description.to_string(),
            context_path: Vec::new(),
            tags: BTreeSet::new(),
            has_focused: false,
            cancellation: CancellationHandle::new(),
            items: Arc::new(DashMap::new()),
        }
    }
}

enum Classification {
    Skipped,
    Pending,
    Run,
}

fn classify_spec(tree: &Tree, spec_id: SpecId, has_focused: bool) -> Classification {
    if tree.ancestor_or_self_skipped(spec_id) {
        return Classification::Skipped;
    }
    if tree.spec(spec_id).body.is_none() {
        return Classification::Pending;
    }
    if has_focused && !tree.ancestor_or_self_focused(spec_id) {
        return Classification::Skipped;
    }
    Classification::Run
}

fn is_runnable(tree: &Tree, ctx_id: ContextId, has_focused: bool) -> bool {
    let node = tree.context(ctx_id);
    for &spec_id in &node.specs {
        if matches!(
            classify_spec(tree, spec_id, has_focused),
            Classification::Run
        ) {
            return true;
        }
    }
    node.children
        .iter()
        .any(|&child_id| is_runnable(tree, child_id, has_focused))
}

async fn run_hook(hook: &BodyFn) -> Result<(), SpecError> {
    hook().await.map_err(|e| match e {
        SpecError::HookError { .. } => e,
        other => SpecError::HookError {
            message: other.first_line(),
            stack: None,
        },
    })
}

/// Recursively marks every spec in a context's subtree as failed with the
/// same hook error, without running any of them — used when a `before_all`
/// fails and the whole subtree is abandoned.
fn fail_subtree(
    tree: &Tree,
    ctx_id: ContextId,
    path: &[String],
    error: &SpecError,
    out: &mut Vec<SpecResult>,
) {
    let node = tree.context(ctx_id);
    for &spec_id in &node.specs {
        out.push(SpecResult::hook_failure(tree, spec_id, path, error.clone()));
    }
    let mut child_path = path.to_vec();
    for &child_id in &node.children {
        child_path.push(tree.context(child_id).description.clone());
        fail_subtree(tree, child_id, &child_path, error, out);
        child_path.pop();
    }
}

/// Walks the tree (C2), dispatching each runnable spec through the
/// middleware pipeline (C6), sequentially or in bounded parallel.
#[derive(Clone)]
pub struct Executor {
    pipeline: Arc<MiddlewarePipeline>,
    parallel: bool,
    semaphore: Arc<Semaphore>,
    observer: Option<Arc<dyn Observer>>,
}

impl Executor {
    pub fn new(pipeline: MiddlewarePipeline, parallel: bool, max_parallelism: Option<usize>) -> Self {
        let max_parallelism = max_parallelism.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        });
        Self {
            pipeline: Arc::new(pipeline),
            parallel,
            semaphore: Arc::new(Semaphore::new(max_parallelism.max(1))),
            observer: None,
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observer = Some(observer);
        self
    }

    #[tracing::instrument(skip(self, tree, cancellation))]
    pub async fn run(&self, tree: Arc<Tree>, cancellation: CancellationHandle) -> Vec<SpecResult> {
        let has_focused = tree.has_focused();
        let root = tree.root();
        let (results, _) =
            run_context(self.clone(), tree, root, Vec::new(), has_focused, cancellation).await;
        results
    }

    /// Convenience for callers not already inside a tokio runtime: builds a
    /// runtime sized for the chosen execution mode and blocks on `run`.
    pub fn run_blocking(&self, tree: Tree, cancellation: CancellationHandle) -> Vec<SpecResult> {
        let tree = Arc::new(tree);
        let runtime = if self.parallel {
            tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
        } else {
            tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
        }
        .expect("failed to build tokio runtime");
        runtime.block_on(self.run(tree, cancellation))
    }
}

/// A sibling spec's pending outcome: either spawned onto the runtime (for a
/// spec that will actually run, bounded by `executor.semaphore`) or already
/// known without awaiting anything (skipped/pending/cancelled).
enum SpecTask {
    Spawned(tokio::task::JoinHandle<SpecResult>),
    Immediate(SpecResult),
}

fn run_context(
    executor: Executor,
    tree: Arc<Tree>,
    ctx_id: ContextId,
    mut path: Vec<String>,
    has_focused: bool,
    cancellation: CancellationHandle,
) -> BoxFuture<'static, (Vec<SpecResult>, bool)> {
    Box::pin(async move {
        let node_description = tree.context(ctx_id).description.clone();
        if ctx_id != tree.root() {
            path.push(node_description);
        }

        let mut results = Vec::new();
        let runnable = is_runnable(&tree, ctx_id, has_focused);
        let mut before_all_ran = false;

        if runnable {
            if let Some(hook) = tree.context(ctx_id).before_all.clone() {
                match run_hook(&hook).await {
                    Ok(()) => before_all_ran = true,
                    Err(e) => {
                        tracing::error!(context = %path.join("/"), error = %e, "before_all failed");
                        fail_subtree(&tree, ctx_id, &path, &e, &mut results);
                        for r in &results {
                            notify(&executor, r);
                        }
                        return (results, false);
                    }
                }
            }
        }

        let mut any_ran = false;
        let spec_ids: Vec<SpecId> = tree.context(ctx_id).specs.clone();
        if executor.parallel && spec_ids.len() > 1 {
            let mut tasks = Vec::with_capacity(spec_ids.len());
            for spec_id in spec_ids {
                if cancellation.is_cancelled() {
                    tasks.push(SpecTask::Immediate(SpecResult::cancelled(&tree, spec_id, &path)));
                    continue;
                }
                match classify_spec(&tree, spec_id, has_focused) {
                    Classification::Skipped => {
                        tasks.push(SpecTask::Immediate(SpecResult::skipped(&tree, spec_id, &path)))
                    }
                    Classification::Pending => {
                        tasks.push(SpecTask::Immediate(SpecResult::pending(&tree, spec_id, &path)))
                    }
                    Classification::Run => {
                        any_ran = true;
                        let executor = executor.clone();
                        let tree = Arc::clone(&tree);
                        let path = path.clone();
                        let cancellation = cancellation.clone();
                        let permit = Arc::clone(&executor.semaphore);
                        tasks.push(SpecTask::Spawned(tokio::spawn(async move {
                            let _permit = permit.acquire_owned().await.expect("semaphore closed");
                            run_one_spec(&executor, &tree, ctx_id, spec_id, &path, has_focused, &cancellation)
                                .await
                        })));
                    }
                }
            }
            for task in tasks {
                let result = match task {
                    SpecTask::Spawned(handle) => handle.await.expect("spec task panicked"),
                    SpecTask::Immediate(result) => result,
                };
                notify(&executor, &result);
                results.push(result);
            }
        } else {
            for spec_id in spec_ids {
                let result = if cancellation.is_cancelled() {
                    SpecResult::cancelled(&tree, spec_id, &path)
                } else {
                    match classify_spec(&tree, spec_id, has_focused) {
                        Classification::Skipped => SpecResult::skipped(&tree, spec_id, &path),
                        Classification::Pending => SpecResult::pending(&tree, spec_id, &path),
                        Classification::Run => {
                            any_ran = true;
                            run_one_spec(&executor, &tree, ctx_id, spec_id, &path, has_focused, &cancellation)
                                .await
                        }
                    }
                };
                notify(&executor, &result);
                results.push(result);
            }
        }

        let children: Vec<ContextId> = tree.context(ctx_id).children.clone();
        if executor.parallel && children.len() > 1 {
            let mut handles = Vec::with_capacity(children.len());
            for child_id in children {
                let executor = executor.clone();
                let tree = Arc::clone(&tree);
                let path = path.clone();
                let cancellation = cancellation.clone();
                let permit = Arc::clone(&executor.semaphore);
                handles.push(tokio::spawn(async move {
                    let _permit = permit.acquire_owned().await.expect("semaphore closed");
                    run_context(executor, tree, child_id, path, has_focused, cancellation).await
                }));
            }
            for handle in handles {
                let (child_results, child_any) =
                    handle.await.expect("child context task panicked");
                any_ran |= child_any;
                results.extend(child_results);
            }
        } else {
            for child_id in children {
                let (child_results, child_any) = run_context(
                    executor.clone(),
                    Arc::clone(&tree),
                    child_id,
                    path.clone(),
                    has_focused,
                    cancellation.clone(),
                )
                .await;
                any_ran |= child_any;
                results.extend(child_results);
            }
        }

        if before_all_ran || any_ran {
            if let Some(hook) = tree.context(ctx_id).after_all.clone() {
                if let Err(e) = run_hook(&hook).await {
                    tracing::error!(context = %path.join("/"), error = %e, "after_all failed");
                    if let Some(last) = results.last_mut() {
                        last.apply_after_all_error(e);
                        notify(&executor, last);
                    }
                }
            }
        }

        (results, any_ran)
    })
}

fn notify(executor: &Executor, result: &SpecResult) {
    if let Some(observer) = &executor.observer {
        observer.on_result(result);
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_one_spec(
    executor: &Executor,
    tree: &Arc<Tree>,
    ctx_id: ContextId,
    spec_id: SpecId,
    path: &[String],
    has_focused: bool,
    cancellation: &CancellationHandle,
) -> SpecResult {
    let node = tree.spec(spec_id);
    let exec_ctx = SpecExecutionContext {
        spec_id,
        description: node.description.clone(),
        context_path: path.to_vec(),
        tags: tree.effective_tags(spec_id),
        has_focused,
        cancellation: cancellation.clone(),
        items: Arc::new(DashMap::new()),
    };

    let base = make_base_fn(Arc::clone(tree), ctx_id, spec_id);
    executor.pipeline.dispatch(exec_ctx, base).await
}

/// Builds the innermost action the middleware pipeline ultimately invokes:
/// the spec's `before_each` chain, its body, then its `after_each` chain
/// (innermost context first), each phase timed independently.
fn make_base_fn(tree: Arc<Tree>, ctx_id: ContextId, spec_id: SpecId) -> BaseFn {
    Arc::new(move |ctx: SpecExecutionContext| {
        let tree = Arc::clone(&tree);
        Box::pin(async move {
            let before_chain = tree.before_each_chain(ctx_id);
            let after_chain = tree.after_each_chain(ctx_id);

            let mut before_each_duration = Duration::ZERO;
            for &c in before_chain.iter() {
                if let Some(hook) = tree.context(c).before_each.clone() {
                    let start = Instant::now();
                    let result = run_hook(&hook).await;
                    before_each_duration += start.elapsed();
                    if let Err(e) = result {
                        let mut result = SpecResult::hook_failure(
                            &tree,
                            spec_id,
                            &ctx.context_path,
                            e,
                        );
                        result.before_each_duration = before_each_duration;
                        run_after_each_best_effort(&tree, &after_chain, &mut result).await;
                        return result;
                    }
                }
            }

            let body_start = Instant::now();
            let body_result = match &tree.spec(spec_id).body {
                Some(body) => body().await,
                None => Ok(()),
            };
            let body_duration = body_start.elapsed();

            let mut result = match body_result {
                Ok(()) => SpecResult::passed(&tree, spec_id, &ctx.context_path),
                Err(e) => SpecResult::failed(&tree, spec_id, &ctx.context_path, e),
            };
            result.before_each_duration = before_each_duration;
            result.body_duration = body_duration;

            run_after_each_best_effort(&tree, &after_chain, &mut result).await;
            result.total_duration = result.before_each_duration + result.body_duration + result.after_each_duration;
            result
        }) as BoxFuture<'static, SpecResult>
    })
}

/// Runs every `after_each` hook regardless of earlier failures (best-effort
/// teardown): a teardown error is only recorded if the spec had otherwise
/// passed, so a genuine body failure is never masked by a teardown error.
async fn run_after_each_best_effort(
    tree: &Arc<Tree>,
    chain: &[ContextId],
    result: &mut SpecResult,
) {
    let start = Instant::now();
    for &c in chain {
        if let Some(hook) = tree.context(c).after_each.clone() {
            if let Err(e) = run_hook(&hook).await {
                tracing::warn!(error = %e, "after_each hook failed");
                if result.error.is_none() {
                    result.status = crate::report::SpecStatus::Failed;
                    result.error = Some(e);
                }
            }
        }
    }
    result.after_each_duration = start.elapsed();
}
