//! The middleware pipeline (C6): an onion of composable wrappers around each
//! spec's execution, plus the built-ins (`Retry`, `Timeout`, `Filter`,
//! `Coverage`).

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::BoxFuture;
use regex::Regex;

use crate::coverage::{CoverageIndex, CoverageInfo, CoverageTracker};
use crate::error::SpecError;
use crate::executor::SpecExecutionContext;
use crate::report::{SpecResult, SpecStatus};
use crate::tree::SpecId;

/// The innermost action a pipeline ultimately calls: the spec's hooks + body.
pub type BaseFn = Arc<dyn Fn(SpecExecutionContext) -> BoxFuture<'static, SpecResult> + Send + Sync>;

/// A single layer of the onion. Implementations must either call `next`
/// exactly once and return its (possibly modified) result, or short-circuit
/// by returning a synthesized `SpecResult` without calling `next` at all.
/// The `Retry` built-in is the one documented exception: it may call `next`
/// more than once.
#[async_trait]
pub trait Middleware: Send + Sync {
    async fn handle(&self, ctx: SpecExecutionContext, next: Next<'_>) -> SpecResult;
}

/// The remaining portion of the pipeline, handed to a middleware so it can
/// continue the chain. Cheaply `Clone`, so built-ins like `Retry` that need
/// to invoke it more than once can do so.
#[derive(Clone)]
pub struct Next<'a> {
    pipeline: &'a MiddlewarePipeline,
    idx: usize,
    base: BaseFn,
}

impl<'a> Next<'a> {
    pub async fn run(self, ctx: SpecExecutionContext) -> SpecResult {
        self.pipeline.dispatch_at(self.idx, ctx, self.base).await
    }
}

/// The assembled, ordered stack of middleware wrapping every spec's execution.
pub struct MiddlewarePipeline {
    layers: Vec<Arc<dyn Middleware>>,
}

impl MiddlewarePipeline {
    pub fn new(layers: Vec<Arc<dyn Middleware>>) -> Self {
        Self { layers }
    }

    #[tracing::instrument(skip(self, ctx, base))]
    pub async fn dispatch(&self, ctx: SpecExecutionContext, base: BaseFn) -> SpecResult {
        self.dispatch_at(0, ctx, base).await
    }

    fn dispatch_at<'a>(
        &'a self,
        idx: usize,
        ctx: SpecExecutionContext,
        base: BaseFn,
    ) -> BoxFuture<'a, SpecResult> {
        Box::pin(async move {
            match self.layers.get(idx) {
                None => base(ctx).await,
                Some(layer) => {
                    let layer = Arc::clone(layer);
                    let next = Next {
                        pipeline: self,
                        idx: idx + 1,
                        base,
                    };
                    layer.handle(ctx, next).await
                }
            }
        })
    }
}

// --- Retry -----------------------------------------------------------------

pub struct RetryMiddleware {
    pub max_retries: u32,
}

#[async_trait]
impl Middleware for RetryMiddleware {
    async fn handle(&self, ctx: SpecExecutionContext, next: Next<'_>) -> SpecResult {
        let mut attempts = 1u32;
        let mut result = next.clone().run(ctx.clone()).await;
        while result.status == SpecStatus::Failed && attempts <= self.max_retries {
            attempts += 1;
            tracing::warn!(spec = %ctx.full_path_string(), attempt = attempts, "retrying failed spec");
            result = next.clone().run(ctx.clone()).await;
        }
        if self.max_retries > 0 {
            result.retry_info = Some(crate::report::RetryInfo {
                attempts,
                max_retries: self.max_retries,
            });
        }
        result
    }
}

// --- Timeout -----------------------------------------------------------------

pub struct TimeoutMiddleware {
    pub duration: Duration,
}

impl TimeoutMiddleware {
    pub fn new(duration: Duration) -> Result<Self, SpecError> {
        if duration.is_zero() {
            return Err(SpecError::InvalidArgument(
                "timeout duration must be greater than zero".to_string(),
            ));
        }
        Ok(Self { duration })
    }
}

#[async_trait]
impl Middleware for TimeoutMiddleware {
    async fn handle(&self, ctx: SpecExecutionContext, next: Next<'_>) -> SpecResult {
        let budget = self.duration;
        let start = Instant::now();
        let cancellation = ctx.cancellation.clone();
        let spec_path = ctx.full_path_string();
        match tokio::time::timeout(budget, next.run(ctx.clone())).await {
            Ok(result) => result,
            Err(_) => {
                cancellation.cancel();
                let elapsed = start.elapsed().max(budget);
                tracing::warn!(spec = %spec_path, budget_ms = budget.as_millis() as u64, "spec timed out");
                let mut result = synthesize_failure(
                    &ctx,
                    SpecError::Timeout {
                        elapsed_ms: elapsed.as_millis() as u64,
                        budget_ms: budget.as_millis() as u64,
                    },
                );
                result.total_duration = elapsed;
                result
            }
        }
    }
}

// --- Filter -----------------------------------------------------------------

type FilterPredicate =
    Arc<dyn Fn(&SpecExecutionContext) -> BoxFuture<'static, Result<bool, SpecError>> + Send + Sync>;

/// Decides whether a spec should run at all. `Ok(false)` skips it (without
/// running hooks/body); `Err` surfaces as a failure rather than silently
/// dropping the spec.
pub struct FilterMiddleware {
    predicate: FilterPredicate,
}

impl FilterMiddleware {
    pub fn new<F, Fut>(predicate: F) -> Self
    where
        F: Fn(&SpecExecutionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<bool, SpecError>> + Send + 'static,
    {
        Self {
            predicate: Arc::new(move |ctx| Box::pin(predicate(ctx))),
        }
    }

    pub fn from_sync<F>(predicate: F) -> Self
    where
        F: Fn(&SpecExecutionContext) -> bool + Send + Sync + 'static,
    {
        Self::new(move |ctx| {
            let matched = predicate(ctx);
            async move { Ok(matched) }
        })
    }

    /// Matches a spec's full context path + description against a regex,
    /// with a fixed ~100ms per-match budget (the `regex` crate has no native
    /// cancellation, so the match itself runs on a blocking thread and is
    /// raced against a timeout). A pattern that blows its budget surfaces as
    /// `PatternTimeout` rather than hanging the run.
    pub fn name_regex(pattern: &str, exclude: bool) -> Result<Self, SpecError> {
        let re = Regex::new(pattern).map_err(|e| SpecError::InvalidArgument(e.to_string()))?;
        Ok(Self::new(move |ctx: &SpecExecutionContext| {
            let re = re.clone();
            let full_path = ctx.full_path_string();
            async move {
                let budget = Duration::from_millis(100);
                let matched = tokio::time::timeout(
                    budget,
                    tokio::task::spawn_blocking(move || re.is_match(&full_path)),
                )
                .await
                .map_err(|_| SpecError::PatternTimeout)?
                .map_err(|e| SpecError::UserError {
                    message: e.to_string(),
                    stack: None,
                })?;
                Ok(if exclude { !matched } else { matched })
            }
        }))
    }

    /// Tag include filter: matches if the spec carries at least one of the
    /// given tags (case-insensitive "any of" semantics). An empty tag list
    /// is rejected — an include filter that can never match is a
    /// configuration mistake, not a valid "run nothing" request.
    pub fn tags_include(tags: &[String]) -> Result<Self, SpecError> {
        if tags.is_empty() {
            return Err(SpecError::InvalidArgument(
                "tag include filter must not be empty".to_string(),
            ));
        }
        let tags: Vec<String> = tags.iter().map(|t| t.to_lowercase()).collect();
        Ok(Self::from_sync(move |ctx| {
            ctx.tags.iter().any(|t| tags.contains(&t.to_lowercase()))
        }))
    }

    pub fn tags_exclude(tags: &[String]) -> Self {
        let tags: Vec<String> = tags.iter().map(|t| t.to_lowercase()).collect();
        Self::from_sync(move |ctx| !ctx.tags.iter().any(|t| tags.contains(&t.to_lowercase())))
    }

    pub fn context_path_include(patterns: &[String]) -> Self {
        let patterns = patterns.to_vec();
        Self::from_sync(move |ctx| {
            let joined = ctx.context_path.join("/");
            patterns.iter().any(|p| joined.contains(p.as_str()))
        })
    }

    pub fn context_path_exclude(patterns: &[String]) -> Self {
        let patterns = patterns.to_vec();
        Self::from_sync(move |ctx| {
            let joined = ctx.context_path.join("/");
            !patterns.iter().any(|p| joined.contains(p.as_str()))
        })
    }
}

#[async_trait]
impl Middleware for FilterMiddleware {
    async fn handle(&self, ctx: SpecExecutionContext, next: Next<'_>) -> SpecResult {
        match (self.predicate)(&ctx).await {
            Ok(true) => next.run(ctx).await,
            Ok(false) => {
                SpecResult::synthesize_skip(ctx.spec_id, &ctx.description, &ctx.context_path)
            }
            Err(e) => synthesize_failure(&ctx, e),
        }
    }
}

// --- Coverage -----------------------------------------------------------------

pub struct CoverageMiddleware {
    tracker: Arc<dyn CoverageTracker>,
    index: Arc<CoverageIndex>,
}

impl CoverageMiddleware {
    pub fn new(tracker: Arc<dyn CoverageTracker>, index: Arc<CoverageIndex>) -> Self {
        Self { tracker, index }
    }
}

#[async_trait]
impl Middleware for CoverageMiddleware {
    async fn handle(&self, ctx: SpecExecutionContext, next: Next<'_>) -> SpecResult {
        self.tracker.start().await;
        let before = self.tracker.snapshot().await;
        let mut result = next.run(ctx.clone()).await;
        let after = self.tracker.snapshot().await;
        self.tracker.stop().await;
        let info = CoverageInfo::diff(&ctx.full_path_string(), &before, &after);
        self.index.record(&ctx.full_path_string(), info.clone());
        result.coverage_info = Some(info);
        result
    }
}

fn synthesize_failure(ctx: &SpecExecutionContext, error: SpecError) -> SpecResult {
    SpecResult::synthesize_failure(ctx.spec_id, &ctx.description, &ctx.context_path, error)
}

// --- Configuration -----------------------------------------------------------

/// Plain data describing a pipeline; the shape callers (a future CLI, an
/// embedding host) actually configure. `max_parallelism` defaults to
/// `std::thread::available_parallelism()` when left unset.
#[derive(Debug, Default, Clone)]
pub struct PipelineConfig {
    pub retry: Option<u32>,
    pub timeout_ms: Option<u64>,
    pub filter_name: Option<String>,
    pub exclude_name: Option<String>,
    pub filter_tags: Vec<String>,
    pub exclude_tags: Vec<String>,
    pub filter_context: Vec<String>,
    pub exclude_context: Vec<String>,
    pub parallel_execution: bool,
    pub max_parallelism: Option<usize>,
}

/// Fluent assembly of a [`MiddlewarePipeline`] via a chained builder style.
/// Built-ins are wired in a fixed order — filters
/// outermost (so a rejected spec never pays for retry/timeout setup), then
/// retry, then timeout, then any custom layers closest to the body.
#[derive(Default)]
pub struct PipelineBuilder {
    config: PipelineConfig,
    custom: Vec<Arc<dyn Middleware>>,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn retry(mut self, max_retries: u32) -> Self {
        self.config.retry = Some(max_retries);
        self
    }

    pub fn timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.config.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn filter_name(mut self, pattern: impl Into<String>) -> Self {
        self.config.filter_name = Some(pattern.into());
        self
    }

    pub fn exclude_name(mut self, pattern: impl Into<String>) -> Self {
        self.config.exclude_name = Some(pattern.into());
        self
    }

    pub fn filter_tags(mut self, tags: impl IntoIterator<Item = String>) -> Self {
        self.config.filter_tags = tags.into_iter().collect();
        self
    }

    pub fn exclude_tags(mut self, tags: impl IntoIterator<Item = String>) -> Self {
        self.config.exclude_tags = tags.into_iter().collect();
        self
    }

    pub fn filter_context(mut self, patterns: impl IntoIterator<Item = String>) -> Self {
        self.config.filter_context = patterns.into_iter().collect();
        self
    }

    pub fn exclude_context(mut self, patterns: impl IntoIterator<Item = String>) -> Self {
        self.config.exclude_context = patterns.into_iter().collect();
        self
    }

    pub fn parallel(mut self, max_parallelism: Option<usize>) -> Self {
        self.config.parallel_execution = true;
        self.config.max_parallelism = max_parallelism;
        self
    }

    pub fn coverage(mut self, tracker: Arc<dyn CoverageTracker>, index: Arc<CoverageIndex>) -> Self {
        self.custom.push(Arc::new(CoverageMiddleware::new(tracker, index)));
        self
    }

    /// Attaches a custom middleware, innermost among custom layers (added
    /// last, closest to the body, relative to other `custom` calls).
    pub fn custom(mut self, middleware: impl Middleware + 'static) -> Self {
        self.custom.push(Arc::new(middleware));
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn build(self) -> Result<MiddlewarePipeline, SpecError> {
        let mut layers: Vec<Arc<dyn Middleware>> = Vec::new();

        if let Some(pattern) = &self.config.filter_name {
            layers.push(Arc::new(FilterMiddleware::name_regex(pattern, false)?));
        }
        if let Some(pattern) = &self.config.exclude_name {
            layers.push(Arc::new(FilterMiddleware::name_regex(pattern, true)?));
        }
        if !self.config.filter_tags.is_empty() {
            layers.push(Arc::new(FilterMiddleware::tags_include(
                &self.config.filter_tags,
            )?));
        }
        if !self.config.exclude_tags.is_empty() {
            layers.push(Arc::new(FilterMiddleware::tags_exclude(
                &self.config.exclude_tags,
            )));
        }
        if !self.config.filter_context.is_empty() {
            layers.push(Arc::new(FilterMiddleware::context_path_include(
                &self.config.filter_context,
            )));
        }
        if !self.config.exclude_context.is_empty() {
            layers.push(Arc::new(FilterMiddleware::context_path_exclude(
                &self.config.exclude_context,
            )));
        }
        if let Some(max_retries) = self.config.retry {
            layers.push(Arc::new(RetryMiddleware { max_retries }));
        }
        if let Some(timeout_ms) = self.config.timeout_ms {
            layers.push(Arc::new(TimeoutMiddleware::new(Duration::from_millis(
                timeout_ms,
            ))?));
        }
        layers.extend(self.custom);

        Ok(MiddlewarePipeline::new(layers))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::TreeBuilder;

    fn base_passing(spec_id: SpecId) -> BaseFn {
        Arc::new(move |ctx: SpecExecutionContext| {
            Box::pin(async move {
                SpecResult::synthesize_pass(spec_id, &ctx.description, &ctx.context_path)
            })
        })
    }

    fn base_failing(spec_id: SpecId) -> BaseFn {
        Arc::new(move |ctx: SpecExecutionContext| {
            Box::pin(async move {
                SpecResult::synthesize_failure(
                    spec_id,
                    &ctx.description,
                    &ctx.context_path,
                    SpecError::UserError {
                        message: "always fails".to_string(),
                        stack: None,
                    },
                )
            })
        })
    }

    fn test_spec_id() -> SpecId {
        let mut builder = TreeBuilder::new();
        let root = builder.root();
        builder
            .add_spec(root, "spec", None, false, false)
            .unwrap()
    }

    #[tokio::test]
    async fn retry_stops_after_max_retries_and_attaches_info() {
        let pipeline = MiddlewarePipeline::new(vec![Arc::new(RetryMiddleware { max_retries: 3 })]);
        let spec_id = test_spec_id();
        let ctx = SpecExecutionContext::for_test(spec_id, "spec");
        let result = pipeline.dispatch(ctx, base_failing(spec_id)).await;
        assert_eq!(result.status, SpecStatus::Failed);
        assert_eq!(result.retry_info.unwrap().attempts, 4);
    }

    #[tokio::test]
    async fn retry_with_zero_attaches_no_info_on_pass() {
        let pipeline = MiddlewarePipeline::new(vec![Arc::new(RetryMiddleware { max_retries: 0 })]);
        let spec_id = test_spec_id();
        let ctx = SpecExecutionContext::for_test(spec_id, "spec");
        let result = pipeline.dispatch(ctx, base_passing(spec_id)).await;
        assert_eq!(result.status, SpecStatus::Passed);
        assert!(result.retry_info.is_none());
    }

    #[tokio::test]
    async fn timeout_rejects_nonpositive_duration() {
        assert!(TimeoutMiddleware::new(Duration::ZERO).is_err());
    }

    #[tokio::test]
    async fn filter_name_regex_skips_nonmatching_specs() {
        let filter = FilterMiddleware::name_regex("nonexistent", false).unwrap();
        let pipeline = MiddlewarePipeline::new(vec![Arc::new(filter)]);
        let spec_id = test_spec_id();
        let ctx = SpecExecutionContext::for_test(spec_id, "spec");
        let result = pipeline.dispatch(ctx, base_passing(spec_id)).await;
        assert_eq!(result.status, SpecStatus::Skipped);
    }

    #[tokio::test]
    async fn tag_include_filter_rejects_empty_list() {
        assert!(FilterMiddleware::tags_include(&[]).is_err());
    }

    #[tokio::test]
    async fn builder_rejects_invalid_timeout() {
        let result = PipelineBuilder::new().timeout_ms(0).build();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn builder_composes_retry_and_timeout() {
        let pipeline = PipelineBuilder::new().retry(2).timeout_ms(1000).build().unwrap();
        let spec_id = test_spec_id();
        let ctx = SpecExecutionContext::for_test(spec_id, "spec");
        let result = pipeline.dispatch(ctx, base_passing(spec_id)).await;
        assert_eq!(result.status, SpecStatus::Passed);
    }
}
