//! # draftspec — a BDD-style in-process spec engine for Rust
//!
//! Write expressive, structured tests using a closure-based API with
//! `describe`/`context`/`given`/`when`/`then`, lifecycle hooks, a fluent
//! expectation library, and a composable async middleware pipeline (retry,
//! timeout, filtering, coverage).
//!
//! ## Quick example
//!
//! ```rust,no_run
//! use draftspec::{describe, expect, Executor, PipelineBuilder, CancellationHandle};
//!
//! fn main() {
//!     let tree = describe("Calculator", |ctx| {
//!         ctx.describe("addition", |ctx| {
//!             ctx.it("adds two numbers", || {
//!                 expect!(2 + 3).to_be(5);
//!             });
//!         });
//!     })
//!     .unwrap();
//!
//!     let pipeline = PipelineBuilder::new().build().unwrap();
//!     let executor = Executor::new(pipeline, false, None);
//!     let results = executor.run_blocking(tree, CancellationHandle::new());
//!     assert!(results.iter().all(|r| r.status == draftspec::SpecStatus::Passed));
//! }
//! ```

pub mod coverage;
pub mod differ;
mod dsl;
pub mod error;
pub mod executor;
pub mod expect;
pub mod middleware;
pub mod report;
mod tree;

pub use dsl::{describe, Context};
pub use error::SpecError;
pub use executor::{CancellationHandle, Executor, SpecExecutionContext};
pub use expect::{expect, Expectation};
pub use middleware::{
    CoverageMiddleware, FilterMiddleware, Middleware, MiddlewarePipeline, PipelineBuilder,
    PipelineConfig, RetryMiddleware, TimeoutMiddleware,
};
pub use report::{Observer, Report, SpecResult, SpecStatus};
pub use tree::Tree;

use std::cell::RefCell;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};

/// A drop guard that runs cleanup code even if the spec body panics. Prefer
/// [`defer_cleanup`] when the cleanup doesn't need to be tied to a specific
/// scope.
pub struct Guard<F: FnOnce()> {
    f: Option<F>,
}

impl<F: FnOnce()> Guard<F> {
    pub fn new(f: F) -> Self {
        Guard { f: Some(f) }
    }
}

impl<F: FnOnce()> Drop for Guard<F> {
    fn drop(&mut self) {
        if let Some(f) = self.f.take() {
            f();
        }
    }
}

thread_local! {
    static CLEANUP_STACK: RefCell<Vec<Box<dyn FnOnce()>>> = const { RefCell::new(Vec::new()) };
}

/// Registers a cleanup function to run after the current spec body finishes,
/// regardless of whether it panicked. Cleanups run in LIFO order via
/// [`run_deferred_cleanups`], which the executor calls once per spec as part
/// of its `after_each` handling.
pub fn defer_cleanup(f: impl FnOnce() + 'static) {
    CLEANUP_STACK.with(|stack| {
        stack.borrow_mut().push(Box::new(f));
    });
}

/// Runs and clears every cleanup registered via `defer_cleanup` since the
/// last call. Safe to call even when nothing was deferred.
pub fn run_deferred_cleanups() {
    CLEANUP_STACK.with(|stack| {
        let mut cleanups: Vec<Box<dyn FnOnce()>> = stack.borrow_mut().drain(..).collect();
        cleanups.reverse();
        for cleanup in cleanups {
            cleanup();
        }
    });
}

/// Panics if the given tree has any focused spec or context. Intended as a
/// CI guard step: a real run left `fit`/`fdescribe` in place by mistake.
pub fn check_fail_on_focus(tree: &Tree) {
    if tree.has_focused() {
        panic!(
            "draftspec: focused specs detected in a run that forbids them. \
             Remove fit/fdescribe before pushing."
        );
    }
}

/// Documents a step within a spec body. Prints to stderr; has no effect on
/// the spec's outcome.
pub fn by(description: &str) {
    eprintln!("  STEP: {description}");
}

/// Documents a step within a spec body (macro form, so the call site reads
/// like a sentence).
#[macro_export]
macro_rules! by {
    ($description:expr) => {
        $crate::by($description);
    };
}

/// Skips the current spec body at runtime with a reason, returning from the
/// enclosing function immediately. Distinct from `xit`: this is a body-level
/// decision made after the spec has already started running.
pub fn skip(reason: &str) {
    eprintln!("  SKIPPED: {reason}");
}

#[macro_export]
macro_rules! skip {
    ($reason:expr) => {{
        $crate::skip($reason);
        return;
    }};
}

/// Runs `f`, retrying synchronously up to `retries` additional times on
/// panic. A lower-level escape hatch for call sites that can't go through the
/// middleware pipeline (e.g. a hook); prefer [`RetryMiddleware`] for specs.
pub fn with_retries(retries: u32, f: impl Fn()) {
    let max_attempts = retries + 1;
    let mut last_panic = None;

    for attempt in 1..=max_attempts {
        match catch_unwind(AssertUnwindSafe(&f)) {
            Ok(()) => return,
            Err(e) => {
                if attempt < max_attempts {
                    eprintln!("  attempt {attempt}/{max_attempts} failed, retrying...");
                }
                last_panic = Some(e);
            }
        }
    }

    if let Some(e) = last_panic {
        resume_unwind(e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_runs_on_success() {
        use std::sync::atomic::{AtomicBool, Ordering};
        static RAN: AtomicBool = AtomicBool::new(false);

        {
            let _g = Guard::new(|| RAN.store(true, Ordering::SeqCst));
        }
        assert!(RAN.load(Ordering::SeqCst));
    }

    #[test]
    fn guard_runs_on_panic() {
        use std::sync::atomic::{AtomicBool, Ordering};
        static RAN: AtomicBool = AtomicBool::new(false);

        let result = catch_unwind(AssertUnwindSafe(|| {
            let _g = Guard::new(|| RAN.store(true, Ordering::SeqCst));
            panic!("boom");
        }));
        assert!(result.is_err());
        assert!(RAN.load(Ordering::SeqCst));
    }

    #[test]
    fn deferred_cleanups_run_in_lifo_order() {
        use std::sync::{Arc, Mutex};
        let order = Arc::new(Mutex::new(Vec::new()));
        let a = Arc::clone(&order);
        let b = Arc::clone(&order);
        defer_cleanup(move || a.lock().unwrap().push(1));
        defer_cleanup(move || b.lock().unwrap().push(2));
        run_deferred_cleanups();
        assert_eq!(*order.lock().unwrap(), vec![2, 1]);
    }

    #[test]
    fn with_retries_eventual_success() {
        use std::sync::atomic::{AtomicU32, Ordering};
        static ATTEMPTS: AtomicU32 = AtomicU32::new(0);
        ATTEMPTS.store(0, Ordering::SeqCst);

        with_retries(3, || {
            let n = ATTEMPTS.fetch_add(1, Ordering::SeqCst);
            if n < 2 {
                panic!("not yet");
            }
        });

        assert_eq!(ATTEMPTS.load(Ordering::SeqCst), 3);
    }

    #[test]
    #[should_panic(expected = "focused specs detected")]
    fn check_fail_on_focus_panics_when_focused() {
        let tree = describe("root", |ctx| {
            ctx.fit("focused", || {});
        })
        .unwrap();
        check_fail_on_focus(&tree);
    }
}
