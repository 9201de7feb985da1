//! End-to-end scenario tests against the public `draftspec` facade.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::{Duration, Instant};

use draftspec::{
    describe, differ, expect, CancellationHandle, Executor, PipelineBuilder, SpecStatus,
};

static TRACING_INIT: Once = Once::new();

/// Installs a `tracing` subscriber once per test binary so `RUST_LOG` can
/// surface the executor/middleware/differ spans while debugging a failure.
fn init_tracing() {
    TRACING_INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init()
            .ok();
    });
}

fn run(tree: draftspec::Tree, executor: Executor) -> Vec<draftspec::SpecResult> {
    init_tracing();
    executor.run_blocking(tree, CancellationHandle::new())
}

#[test]
fn s1_basic_pass() {
    let tree = describe("A", |ctx| {
        ctx.it("t", || {});
    })
    .unwrap();
    let executor = Executor::new(PipelineBuilder::new().build().unwrap(), false, Some(1));
    let results = run(tree, executor);
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].status, SpecStatus::Passed);
}

#[test]
fn s2_assertion_fail() {
    let tree = describe("A", |ctx| {
        ctx.it("t", || {
            expect!(1).to_be(2);
        });
    })
    .unwrap();
    let executor = Executor::new(PipelineBuilder::new().build().unwrap(), false, Some(1));
    let results = run(tree, executor);
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].status, SpecStatus::Failed);
    let message = results[0].error.as_ref().unwrap().to_string();
    assert!(message.contains("to be 2"));
    assert!(message.contains("but was 1"));
}

#[test]
fn s3_focus() {
    let tree = describe("A", |ctx| {
        ctx.it("x", || {});
        ctx.fit("y", || {});
    })
    .unwrap();
    let executor = Executor::new(PipelineBuilder::new().build().unwrap(), false, Some(1));
    let results = run(tree, executor);
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].status, SpecStatus::Skipped);
    assert_eq!(results[1].status, SpecStatus::Passed);
}

#[test]
fn s4_hook_order() {
    let log: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
    let after_log: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

    let tree = {
        let log = Arc::clone(&log);
        let after_log = Arc::clone(&after_log);
        describe("A", move |ctx| {
            let before_parent = Arc::clone(&log);
            ctx.before_each(move || before_parent.lock().unwrap().push("p"));
            let after_parent = Arc::clone(&after_log);
            ctx.after_each(move || after_parent.lock().unwrap().push("p"));

            ctx.context("child", move |ctx| {
                let before_child = Arc::clone(&log);
                ctx.before_each(move || before_child.lock().unwrap().push("c"));
                let after_child = Arc::clone(&after_log);
                ctx.after_each(move || after_child.lock().unwrap().push("c"));

                let asserted = Arc::clone(&log);
                ctx.it("checks the log", move || {
                    expect!(asserted.lock().unwrap().clone()).to_be(vec!["p", "c"]);
                });
            });
        })
    }
    .unwrap();

    let executor = Executor::new(PipelineBuilder::new().build().unwrap(), false, Some(1));
    let results = run(tree, executor);
    assert_eq!(results[0].status, SpecStatus::Passed);
    assert_eq!(*after_log.lock().unwrap(), vec!["c", "p"]);
}

#[test]
fn s5_retry_flake() {
    static ATTEMPTS: AtomicU32 = AtomicU32::new(0);
    ATTEMPTS.store(0, Ordering::SeqCst);

    let tree = describe("A", |ctx| {
        ctx.it("flaky", || {
            let n = ATTEMPTS.fetch_add(1, Ordering::SeqCst);
            if n < 2 {
                panic!("not yet");
            }
        });
    })
    .unwrap();

    let pipeline = PipelineBuilder::new().retry(3).build().unwrap();
    let executor = Executor::new(pipeline, false, Some(1));
    let results = run(tree, executor);
    assert_eq!(results[0].status, SpecStatus::Passed);
    let retry_info = results[0].retry_info.as_ref().unwrap();
    assert_eq!(retry_info.attempts, 3);
    assert_eq!(retry_info.max_retries, 3);
}

#[test]
fn s6_timeout() {
    let tree = describe("A", |ctx| {
        ctx.it_async("slow", || async {
            tokio::time::sleep(Duration::from_millis(300)).await;
            Ok(())
        });
    })
    .unwrap();

    let pipeline = PipelineBuilder::new().timeout_ms(20).build().unwrap();
    let executor = Executor::new(pipeline, false, Some(1));
    let results = run(tree, executor);
    assert_eq!(results[0].status, SpecStatus::Failed);
    assert_eq!(results[0].error.as_ref().unwrap().kind_label(), "timeout");
    assert!(results[0].total_duration >= Duration::from_millis(20));
}

#[test]
fn s7_differ() {
    fn spec(desc: &str, line: u32) -> differ::StaticSpec {
        differ::StaticSpec {
            description: desc.to_string(),
            context_path: vec!["suite".to_string()],
            line_number: line,
            spec_type: differ::StaticSpecType::Regular,
            is_pending: false,
        }
    }

    let prior = differ::StaticParseResult {
        specs: vec![spec("A", 10), spec("B", 20), spec("C", 30)],
        is_complete: true,
    };
    let current = differ::StaticParseResult {
        specs: vec![spec("A", 10), spec("B", 25), spec("D", 40)],
        is_complete: true,
    };

    let change_set = differ::diff("file.rs", Some(&prior), &current, false);
    assert!(!change_set.requires_full_run());

    let modified = change_set
        .changes
        .iter()
        .find(|c| c.description == "B")
        .unwrap();
    assert_eq!(modified.change_type, differ::ChangeType::Modified);
    assert_eq!(modified.old_line, Some(20));
    assert_eq!(modified.new_line, Some(25));

    assert!(change_set
        .changes
        .iter()
        .any(|c| c.description == "C" && c.change_type == differ::ChangeType::Deleted));
    assert!(change_set
        .changes
        .iter()
        .any(|c| c.description == "D" && c.change_type == differ::ChangeType::Added));

    let to_run: Vec<_> = change_set.specs_to_run().map(|c| c.description.as_str()).collect();
    assert!(!to_run.contains(&"C"));
}

#[test]
fn skipped_spec_never_runs_body_or_hooks() {
    let ran = Arc::new(Mutex::new(false));
    let hook_ran = Arc::new(Mutex::new(false));
    let tree = {
        let ran = Arc::clone(&ran);
        let hook_ran = Arc::clone(&hook_ran);
        describe("A", move |ctx| {
            ctx.xdescribe("skipped section", move |ctx| {
                let hook_ran = Arc::clone(&hook_ran);
                ctx.before_each(move || *hook_ran.lock().unwrap() = true);
                let ran = Arc::clone(&ran);
                ctx.it("never runs", move || *ran.lock().unwrap() = true);
            });
        })
    }
    .unwrap();

    let executor = Executor::new(PipelineBuilder::new().build().unwrap(), false, Some(1));
    let results = run(tree, executor);
    assert_eq!(results[0].status, SpecStatus::Skipped);
    assert!(!*ran.lock().unwrap());
    assert!(!*hook_ran.lock().unwrap());
}

#[test]
fn pending_spec_reports_pending_and_runs_no_hooks() {
    let hook_ran = Arc::new(Mutex::new(false));
    let tree = {
        let hook_ran = Arc::clone(&hook_ran);
        describe("A", move |ctx| {
            let hook_ran = Arc::clone(&hook_ran);
            ctx.before_each(move || *hook_ran.lock().unwrap() = true);
            ctx.pending("someday");
        })
    }
    .unwrap();

    let executor = Executor::new(PipelineBuilder::new().build().unwrap(), false, Some(1));
    let results = run(tree, executor);
    assert_eq!(results[0].status, SpecStatus::Pending);
    assert!(!*hook_ran.lock().unwrap());
}

#[test]
fn parallel_mode_runs_sibling_specs_concurrently() {
    let starts: Arc<Mutex<Vec<Instant>>> = Arc::new(Mutex::new(Vec::new()));

    let tree = {
        let starts = Arc::clone(&starts);
        describe("A", move |ctx| {
            for _ in 0..2 {
                let starts = Arc::clone(&starts);
                ctx.it_async("slow", move || {
                    let starts = Arc::clone(&starts);
                    async move {
                        starts.lock().unwrap().push(Instant::now());
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        Ok(())
                    }
                });
            }
        })
    }
    .unwrap();

    let executor = Executor::new(PipelineBuilder::new().build().unwrap(), true, Some(4));
    let results = run(tree, executor);
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|r| r.status == SpecStatus::Passed));

    let starts = starts.lock().unwrap();
    assert_eq!(starts.len(), 2);
    let gap = if starts[0] > starts[1] {
        starts[0] - starts[1]
    } else {
        starts[1] - starts[0]
    };
    assert!(
        gap < Duration::from_millis(50),
        "sibling specs did not start concurrently: gap={gap:?}"
    );
}

#[test]
fn determinism_across_sequential_runs() {
    // Property 1: two sequential runs of equivalent trees with no
    // time-dependent user code produce the same result shape (modulo
    // durations/timestamps, which `SpecResult` doesn't assert on here).
    fn build() -> draftspec::Tree {
        describe("A", |ctx| {
            ctx.before_each(|| {});
            ctx.it("t", || {});
        })
        .unwrap()
    }

    let executor = Executor::new(PipelineBuilder::new().build().unwrap(), false, Some(1));
    let first = run(build(), executor.clone());
    let second = run(build(), executor);
    assert_eq!(first.len(), second.len());
    assert_eq!(first[0].status, second[0].status);
    assert_eq!(first[0].description, second[0].description);
}
