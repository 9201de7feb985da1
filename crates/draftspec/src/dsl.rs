//! The DSL facade (C4): the ergonomic method-chaining API spec bodies are
//! actually written against. A thread-local `TreeBuilder` accumulates the
//! tree while a top-level [`describe`] call's body closure runs; `Context`
//! is a cheap `Copy` handle into that in-progress tree.
//!
//! DSL misuse (a `Context` method called after its `describe` body returned,
//! a duplicate hook, a blank description) panics immediately rather than
//! returning a `Result` — a programmer error at the call site should
//! propagate to the host, not get swallowed into a spec result.

use std::cell::RefCell;
use std::future::Future;

use crate::error::SpecError;
use crate::tree::{async_body, sync_body, sync_fallible_body, ContextId, Tree, TreeBuilder};

struct SuiteState {
    builder: TreeBuilder,
}

thread_local! {
    static CURRENT: RefCell<Option<SuiteState>> = RefCell::new(None);
}

fn with_builder<R>(f: impl FnOnce(&mut TreeBuilder) -> Result<R, SpecError>) -> R {
    CURRENT.with(|cell| {
        let mut guard = cell.borrow_mut();
        let state = guard.as_mut().unwrap_or_else(|| {
            panic!(
                "{}",
                SpecError::DslMisuse(
                    "Context used outside of a describe() body".to_string()
                )
            )
        });
        f(&mut state.builder).unwrap_or_else(|e| panic!("{e}"))
    })
}

/// A lightweight, `Copy` handle into the tree currently being built. Never
/// valid once the `describe` call that produced it has returned.
#[derive(Clone, Copy)]
pub struct Context {
    id: ContextId,
}

impl Context {
    fn nested(&self, name: &str, focused: bool, skipped: bool, body: impl FnOnce(Context)) {
        let parent = self.id;
        let child_id = with_builder(|b| b.add_context(parent, name, focused, skipped));
        body(Context { id: child_id });
    }

    pub fn describe(&self, name: &str, body: impl FnOnce(Context)) {
        self.nested(name, false, false, body);
    }

    pub fn fdescribe(&self, name: &str, body: impl FnOnce(Context)) {
        self.nested(name, true, false, body);
    }

    pub fn xdescribe(&self, name: &str, body: impl FnOnce(Context)) {
        self.nested(name, false, true, body);
    }

    pub fn context(&self, name: &str, body: impl FnOnce(Context)) {
        self.describe(name, body);
    }

    /// Cucumber-style alias for `describe`/`context`.
    pub fn given(&self, name: &str, body: impl FnOnce(Context)) {
        self.describe(name, body);
    }

    /// Cucumber-style alias for `describe`/`context`.
    pub fn when(&self, name: &str, body: impl FnOnce(Context)) {
        self.describe(name, body);
    }

    /// Cucumber-style alias for `describe`/`context`.
    pub fn then(&self, name: &str, body: impl FnOnce(Context)) {
        self.describe(name, body);
    }

    fn register_spec(&self, name: &str, body: Option<crate::tree::BodyFn>, focused: bool, skipped: bool) {
        let parent = self.id;
        with_builder(|b| b.add_spec(parent, name, body, focused, skipped).map(|_| ()));
    }

    pub fn it(&self, name: &str, body: impl Fn() + Send + Sync + 'static) {
        self.register_spec(name, Some(sync_body(body)), false, false);
    }

    pub fn fit(&self, name: &str, body: impl Fn() + Send + Sync + 'static) {
        self.register_spec(name, Some(sync_body(body)), true, false);
    }

    pub fn xit(&self, name: &str, body: impl Fn() + Send + Sync + 'static) {
        self.register_spec(name, Some(sync_body(body)), false, true);
    }

    /// Registers a spec with no body at all: always reported `Pending`.
    pub fn pending(&self, name: &str) {
        self.register_spec(name, None, false, false);
    }

    /// As `it`, for a body that returns a `Result` explicitly rather than
    /// panicking on failure.
    pub fn it_result(&self, name: &str, body: impl Fn() -> Result<(), SpecError> + Send + Sync + 'static) {
        self.register_spec(name, Some(sync_fallible_body(body)), false, false);
    }

    /// As `it`, for a genuinely asynchronous body.
    pub fn it_async<F, Fut>(&self, name: &str, body: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), SpecError>> + Send + 'static,
    {
        self.register_spec(name, Some(async_body(body)), false, false);
    }

    pub fn before_all(&self, hook: impl Fn() + Send + Sync + 'static) {
        let id = self.id;
        with_builder(|b| b.set_before_all(id, sync_body(hook)));
    }

    pub fn before_all_async<F, Fut>(&self, hook: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), SpecError>> + Send + 'static,
    {
        let id = self.id;
        with_builder(|b| b.set_before_all(id, async_body(hook)));
    }

    pub fn after_all(&self, hook: impl Fn() + Send + Sync + 'static) {
        let id = self.id;
        with_builder(|b| b.set_after_all(id, sync_body(hook)));
    }

    pub fn after_all_async<F, Fut>(&self, hook: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), SpecError>> + Send + 'static,
    {
        let id = self.id;
        with_builder(|b| b.set_after_all(id, async_body(hook)));
    }

    pub fn before_each(&self, hook: impl Fn() + Send + Sync + 'static) {
        let id = self.id;
        with_builder(|b| b.set_before_each(id, sync_body(hook)));
    }

    pub fn before_each_async<F, Fut>(&self, hook: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), SpecError>> + Send + 'static,
    {
        let id = self.id;
        with_builder(|b| b.set_before_each(id, async_body(hook)));
    }

    pub fn after_each(&self, hook: impl Fn() + Send + Sync + 'static) {
        let id = self.id;
        with_builder(|b| b.set_after_each(id, sync_body(hook)));
    }

    pub fn after_each_async<F, Fut>(&self, hook: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), SpecError>> + Send + 'static,
    {
        let id = self.id;
        with_builder(|b| b.set_after_each(id, async_body(hook)));
    }

    /// Tags this context; specs nested under it inherit the tag for the
    /// purposes of the `Filter` middleware's tag matching (via ancestor
    /// walk at classification time — tags themselves live on the context,
    /// not copied onto each spec).
    pub fn tag(&self, tag: &str) {
        let id = self.id;
        with_builder(|b| {
            b.add_tag(id, tag);
            Ok(())
        });
    }
}

/// Builds a spec tree from a top-level suite body. This is the one entry
/// point that creates a fresh tree; everything else (`describe`/`context`/
/// `it`/hooks/`tag`) is a `Context` method called from inside `body`.
pub fn describe(description: &str, body: impl FnOnce(Context)) -> Result<Tree, SpecError> {
    let mut builder = TreeBuilder::new();
    let root_ctx = builder.add_context(builder.root(), description, false, false)?;

    CURRENT.with(|cell| {
        *cell.borrow_mut() = Some(SuiteState { builder });
    });

    body(Context { id: root_ctx });

    let state = CURRENT
        .with(|cell| cell.borrow_mut().take())
        .expect("suite state was present for the duration of the describe body");
    Ok(state.builder.build())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_a_tree_with_nested_contexts_and_specs() {
        let tree = describe("math", |ctx| {
            ctx.describe("addition", |ctx| {
                ctx.it("adds two numbers", || {
                    crate::expect!(2 + 2).to_be(4);
                });
            });
        })
        .unwrap();
        assert!(!tree.has_focused());
    }

    #[test]
    fn given_when_then_are_describe_aliases() {
        let tree = describe("a stack", |ctx| {
            ctx.given("an empty stack", |ctx| {
                ctx.when("an item is pushed", |ctx| {
                    ctx.then("the stack is not empty", || {});
                });
            });
        });
        assert!(tree.is_ok());
    }

    #[test]
    #[should_panic(expected = "DSL misuse")]
    fn context_used_outside_describe_panics() {
        // Build a context handle the legitimate way, then use it again
        // after its describe body (and thus the thread-local state) is gone.
        let mut escaped: Option<Context> = None;
        let _ = describe("root", |ctx| {
            escaped = Some(ctx);
        });
        escaped.unwrap().it("too late", || {});
    }

    #[test]
    #[should_panic(expected = "before_each already defined")]
    fn duplicate_hook_panics() {
        let _ = describe("root", |ctx| {
            ctx.before_each(|| {});
            ctx.before_each(|| {});
        });
    }

    #[test]
    fn pending_spec_has_no_body() {
        let tree = describe("root", |ctx| {
            ctx.pending("someday");
        })
        .unwrap();
        let spec_id = tree.context(tree.root()).specs[0];
        assert!(tree.spec(spec_id).body.is_none());
    }
}
