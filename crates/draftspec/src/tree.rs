//! The spec tree (C2): an immutable-after-build arena of contexts and specs.
//!
//! Contexts form a rooted tree via non-owning `ContextId` handles into the
//! arena rather than `Rc`/`Weak` parent pointers — an "index, don't point"
//! approach scaled up from a flat sequence of node ids to a whole tree.

use std::collections::BTreeSet;
use std::sync::{Arc, OnceLock};

use futures::future::BoxFuture;

use crate::error::SpecError;

/// A hook or spec body. Sync closures are adapted via [`sync_body`]/
/// [`sync_fallible_body`]; genuinely async bodies via [`async_body`].
pub type BodyFn = Arc<dyn Fn() -> BoxFuture<'static, Result<(), SpecError>> + Send + Sync>;

/// Handle to a context node. Stable for the lifetime of the [`Tree`] that
/// produced it; never reused across trees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId(pub(crate) usize);

/// Handle to a spec (leaf) node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SpecId(pub(crate) usize);

pub(crate) struct ContextNode {
    pub description: String,
    pub parent: Option<ContextId>,
    pub children: Vec<ContextId>,
    pub specs: Vec<SpecId>,
    pub before_all: Option<BodyFn>,
    pub after_all: Option<BodyFn>,
    pub before_each: Option<BodyFn>,
    pub after_each: Option<BodyFn>,
    pub tags: BTreeSet<String>,
    pub is_focused: bool,
    pub is_skipped: bool,
    before_each_chain: OnceLock<Arc<Vec<ContextId>>>,
    after_each_chain: OnceLock<Arc<Vec<ContextId>>>,
}

pub(crate) struct SpecNode {
    pub description: String,
    pub parent: ContextId,
    pub body: Option<BodyFn>,
    pub is_focused: bool,
    pub is_skipped: bool,
    pub tags: BTreeSet<String>,
}

/// The built tree. Read-only once construction (via [`TreeBuilder`]) finishes.
pub struct Tree {
    contexts: Vec<ContextNode>,
    specs: Vec<SpecNode>,
    root: ContextId,
}

impl Tree {
    pub fn root(&self) -> ContextId {
        self.root
    }

    pub(crate) fn context(&self, id: ContextId) -> &ContextNode {
        &self.contexts[id.0]
    }

    pub(crate) fn spec(&self, id: SpecId) -> &SpecNode {
        &self.specs[id.0]
    }

    /// Root-to-leaf description path for a context, excluding the anonymous root.
    pub fn context_path(&self, id: ContextId) -> Vec<String> {
        let mut path = Vec::new();
        let mut cur = Some(id);
        while let Some(c) = cur {
            let node = self.context(c);
            if node.parent.is_some() || !node.description.is_empty() {
                path.push(node.description.clone());
            }
            cur = node.parent;
        }
        path.reverse();
        path
    }

    /// Whether any spec anywhere in the tree is focused (`fit`) or lives under
    /// a focused context (`fdescribe`).
    pub fn has_focused(&self) -> bool {
        self.specs.iter().any(|s| s.is_focused)
            || self.contexts.iter().any(|c| c.is_focused)
    }

    pub(crate) fn ancestor_or_self_skipped(&self, spec_id: SpecId) -> bool {
        let spec = self.spec(spec_id);
        if spec.is_skipped {
            return true;
        }
        let mut cur = Some(spec.parent);
        while let Some(c) = cur {
            let node = self.context(c);
            if node.is_skipped {
                return true;
            }
            cur = node.parent;
        }
        false
    }

    /// A spec's own tags plus every tag attached to an ancestor context, so
    /// `ctx.tag(...)` on a `describe` block reaches specs nested under it.
    pub(crate) fn effective_tags(&self, spec_id: SpecId) -> BTreeSet<String> {
        let spec = self.spec(spec_id);
        let mut tags = spec.tags.clone();
        let mut cur = Some(spec.parent);
        while let Some(c) = cur {
            let node = self.context(c);
            tags.extend(node.tags.iter().cloned());
            cur = node.parent;
        }
        tags
    }

    pub(crate) fn ancestor_or_self_focused(&self, spec_id: SpecId) -> bool {
        let spec = self.spec(spec_id);
        if spec.is_focused {
            return true;
        }
        let mut cur = Some(spec.parent);
        while let Some(c) = cur {
            let node = self.context(c);
            if node.is_focused {
                return true;
            }
            cur = node.parent;
        }
        false
    }

    /// The chain of contexts (outermost first) from the root down to `id`
    /// that define a `before_each` hook. Memoized: repeated calls for the
    /// same `id` return the same `Arc`.
    pub(crate) fn before_each_chain(&self, id: ContextId) -> Arc<Vec<ContextId>> {
        self.context(id)
            .before_each_chain
            .get_or_init(|| Arc::new(self.hook_chain(id, |c| c.before_each.is_some())))
            .clone()
    }

    /// As `before_each_chain`, but innermost-first — `after_each` hooks run
    /// from the spec's immediate context outward.
    pub(crate) fn after_each_chain(&self, id: ContextId) -> Arc<Vec<ContextId>> {
        self.context(id)
            .after_each_chain
            .get_or_init(|| {
                let mut chain = self.hook_chain(id, |c| c.after_each.is_some());
                chain.reverse();
                Arc::new(chain)
            })
            .clone()
    }

    fn hook_chain(&self, id: ContextId, has_hook: impl Fn(&ContextNode) -> bool) -> Vec<ContextId> {
        let mut chain = Vec::new();
        let mut stack = Vec::new();
        let mut cur = Some(id);
        while let Some(c) = cur {
            stack.push(c);
            cur = self.context(c).parent;
        }
        for c in stack.into_iter().rev() {
            if has_hook(self.context(c)) {
                chain.push(c);
            }
        }
        chain
    }
}

/// Fallible builder for a [`Tree`]. The DSL facade (`dsl.rs`) drives this;
/// it can also be used directly to construct a tree without the thread-local
/// DSL state machine (handy for tests and tooling).
pub struct TreeBuilder {
    contexts: Vec<ContextNode>,
    specs: Vec<SpecNode>,
}

impl Default for TreeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TreeBuilder {
    pub fn new() -> Self {
        let root = ContextNode {
            description: String::new(),
            parent: None,
            children: Vec::new(),
            specs: Vec::new(),
            before_all: None,
            after_all: None,
            before_each: None,
            after_each: None,
            tags: BTreeSet::new(),
            is_focused: false,
            is_skipped: false,
            before_each_chain: OnceLock::new(),
            after_each_chain: OnceLock::new(),
        };
        Self {
            contexts: vec![root],
            specs: Vec::new(),
        }
    }

    pub fn root(&self) -> ContextId {
        ContextId(0)
    }

    fn validate_description(description: &str) -> Result<(), SpecError> {
        if description.trim().is_empty() {
            return Err(SpecError::DslMisuse(
                "description must not be empty or whitespace".to_string(),
            ));
        }
        Ok(())
    }

    pub fn add_context(
        &mut self,
        parent: ContextId,
        description: &str,
        focused: bool,
        skipped: bool,
    ) -> Result<ContextId, SpecError> {
        Self::validate_description(description)?;
        let id = ContextId(self.contexts.len());
        self.contexts.push(ContextNode {
            description: description.to_string(),
            parent: Some(parent),
            children: Vec::new(),
            specs: Vec::new(),
            before_all: None,
            after_all: None,
            before_each: None,
            after_each: None,
            tags: BTreeSet::new(),
            is_focused: focused,
            is_skipped: skipped,
            before_each_chain: OnceLock::new(),
            after_each_chain: OnceLock::new(),
        });
        self.contexts[parent.0].children.push(id);
        Ok(id)
    }

    pub fn add_spec(
        &mut self,
        parent: ContextId,
        description: &str,
        body: Option<BodyFn>,
        focused: bool,
        skipped: bool,
    ) -> Result<SpecId, SpecError> {
        Self::validate_description(description)?;
        let id = SpecId(self.specs.len());
        self.specs.push(SpecNode {
            description: description.to_string(),
            parent,
            body,
            is_focused: focused,
            is_skipped: skipped,
            tags: BTreeSet::new(),
        });
        self.contexts[parent.0].specs.push(id);
        Ok(id)
    }

    pub fn set_before_all(&mut self, ctx: ContextId, hook: BodyFn) -> Result<(), SpecError> {
        if self.contexts[ctx.0].before_all.is_some() {
            return Err(SpecError::DslMisuse(
                "before_all already defined for this context".to_string(),
            ));
        }
        self.contexts[ctx.0].before_all = Some(hook);
        Ok(())
    }

    pub fn set_after_all(&mut self, ctx: ContextId, hook: BodyFn) -> Result<(), SpecError> {
        if self.contexts[ctx.0].after_all.is_some() {
            return Err(SpecError::DslMisuse(
                "after_all already defined for this context".to_string(),
            ));
        }
        self.contexts[ctx.0].after_all = Some(hook);
        Ok(())
    }

    pub fn set_before_each(&mut self, ctx: ContextId, hook: BodyFn) -> Result<(), SpecError> {
        if self.contexts[ctx.0].before_each.is_some() {
            return Err(SpecError::DslMisuse(
                "before_each already defined for this context".to_string(),
            ));
        }
        self.contexts[ctx.0].before_each = Some(hook);
        Ok(())
    }

    pub fn set_after_each(&mut self, ctx: ContextId, hook: BodyFn) -> Result<(), SpecError> {
        if self.contexts[ctx.0].after_each.is_some() {
            return Err(SpecError::DslMisuse(
                "after_each already defined for this context".to_string(),
            ));
        }
        self.contexts[ctx.0].after_each = Some(hook);
        Ok(())
    }

    pub fn add_tag(&mut self, ctx: ContextId, tag: impl Into<String>) {
        self.contexts[ctx.0].tags.insert(tag.into());
    }

    pub fn add_spec_tag(&mut self, spec: SpecId, tag: impl Into<String>) {
        self.specs[spec.0].tags.insert(tag.into());
    }

    pub fn build(self) -> Tree {
        Tree {
            root: ContextId(0),
            contexts: self.contexts,
            specs: self.specs,
        }
    }
}

/// Wraps a synchronous, infallible closure as a [`BodyFn`]. Panics are
/// captured by the executor via [`SpecError::from_panic`], not here.
pub fn sync_body<F>(f: F) -> BodyFn
where
    F: Fn() + Send + Sync + 'static,
{
    Arc::new(move || {
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(&f))
            .map_err(SpecError::from_panic);
        Box::pin(futures::future::ready(result))
    })
}

/// Wraps a synchronous closure that returns a `Result` as a [`BodyFn`].
pub fn sync_fallible_body<F>(f: F) -> BodyFn
where
    F: Fn() -> Result<(), SpecError> + Send + Sync + 'static,
{
    Arc::new(move || {
        let result =
            std::panic::catch_unwind(std::panic::AssertUnwindSafe(&f)).unwrap_or_else(|p| {
                Err(SpecError::from_panic(p))
            });
        Box::pin(futures::future::ready(result))
    })
}

/// Wraps a genuinely asynchronous body (a closure returning a future) as a
/// [`BodyFn`], catching panics raised during the future's execution.
pub fn async_body<F, Fut>(f: F) -> BodyFn
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<(), SpecError>> + Send + 'static,
{
    use futures::FutureExt;
    Arc::new(move || {
        let fut = std::panic::AssertUnwindSafe(f())
            .catch_unwind()
            .map(|result| match result {
                Ok(inner) => inner,
                Err(payload) => Err(SpecError::from_panic(payload)),
            });
        Box::pin(fut)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_blank_descriptions() {
        let mut builder = TreeBuilder::new();
        let root = builder.root();
        assert!(builder.add_context(root, "   ", false, false).is_err());
        assert!(builder.add_spec(root, "", None, false, false).is_err());
    }

    #[test]
    fn duplicate_hooks_are_rejected() {
        let mut builder = TreeBuilder::new();
        let root = builder.root();
        builder
            .set_before_each(root, sync_body(|| {}))
            .expect("first before_each registers");
        let err = builder
            .set_before_each(root, sync_body(|| {}))
            .unwrap_err();
        assert!(matches!(err, SpecError::DslMisuse(_)));
    }

    #[test]
    fn before_each_chain_is_outer_to_inner_and_memoized() {
        let mut builder = TreeBuilder::new();
        let root = builder.root();
        builder.set_before_each(root, sync_body(|| {})).unwrap();
        let child = builder.add_context(root, "child", false, false).unwrap();
        builder.set_before_each(child, sync_body(|| {})).unwrap();
        let tree = builder.build();

        let chain_a = tree.before_each_chain(child);
        let chain_b = tree.before_each_chain(child);
        assert_eq!(*chain_a, vec![root, child]);
        assert!(Arc::ptr_eq(&chain_a, &chain_b));
    }

    #[test]
    fn after_each_chain_is_inner_to_outer() {
        let mut builder = TreeBuilder::new();
        let root = builder.root();
        builder.set_after_each(root, sync_body(|| {})).unwrap();
        let child = builder.add_context(root, "child", false, false).unwrap();
        builder.set_after_each(child, sync_body(|| {})).unwrap();
        let tree = builder.build();

        assert_eq!(*tree.after_each_chain(child), vec![child, root]);
    }

    #[test]
    fn context_path_excludes_anonymous_root() {
        let mut builder = TreeBuilder::new();
        let root = builder.root();
        let child = builder.add_context(root, "outer", false, false).unwrap();
        let grandchild = builder.add_context(child, "inner", false, false).unwrap();
        let tree = builder.build();
        assert_eq!(
            tree.context_path(grandchild),
            vec!["outer".to_string(), "inner".to_string()]
        );
    }
}
