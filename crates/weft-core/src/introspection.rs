//! Traversal and type-querying over a step's unwrap graph.

use crate::step::{StepId, StepRef};

/// What to do after visiting one node during a [`traverse`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraverseDecision {
    /// Keep descending into this node's children.
    Continue,
    /// Don't descend into this node's children.
    SkipSubtree,
}

/// Pre-order visit over `root`'s unwrap graph, including `root` itself.
/// `visit` receives the path from the root (exclusive of the current node)
/// and the current node, and decides whether to descend into it.
pub fn traverse<F>(root: &StepRef, mut visit: F)
where
    F: FnMut(&[StepRef], &StepRef) -> TraverseDecision,
{
    let mut path = Vec::new();
    traverse_inner(root, &mut path, &mut visit);
}

fn traverse_inner<F>(node: &StepRef, path: &mut Vec<StepRef>, visit: &mut F)
where
    F: FnMut(&[StepRef], &StepRef) -> TraverseDecision,
{
    if visit(path, node) == TraverseDecision::SkipSubtree {
        return;
    }
    path.push(node.clone());
    if let Some(inner) = node.unwrap_one() {
        traverse_inner(&inner, path, visit);
    }
    if let Some(children) = node.unwrap_many() {
        for child in &children {
            traverse_inner(child, path, visit);
        }
    }
    path.pop();
}

/// True iff any node in `step`'s unwrap graph (including `step` itself) is a
/// `T`.
pub fn is<T: 'static>(step: &StepRef) -> bool {
    let mut found = false;
    traverse(step, |_path, node| {
        if node.as_any().downcast_ref::<T>().is_some() {
            found = true;
        }
        TraverseDecision::Continue
    });
    found
}

/// Every node in `step`'s unwrap graph that is a `T`, in pre-order.
///
/// Since Rust trait objects can't be downcast to an owned concrete value
/// without the type also being `Clone`, this returns the matching nodes as
/// [`StepRef`]s rather than owned `T`s; callers that need the concrete type
/// can `.as_any().downcast_ref::<T>()` on the result.
pub fn as_nodes<T: 'static>(step: &StepRef) -> Vec<StepRef> {
    let mut found = Vec::new();
    traverse(step, |_path, node| {
        if node.as_any().downcast_ref::<T>().is_some() {
            found.push(node.clone());
        }
        TraverseDecision::Continue
    });
    found
}

/// True iff `target` appears somewhere inside `parent`'s unwrap graph.
pub fn is_step(parent: &StepRef, target: &StepRef) -> bool {
    let target_id = StepId::of(target);
    let mut found = false;
    traverse(parent, |_path, node| {
        if StepId::of(node) == target_id {
            found = true;
        }
        TraverseDecision::Continue
    });
    found
}

/// A human-readable name for `step`: its own name if it overrides the
/// default, else the name of what it single-wraps, else a bracketed list of
/// what it multi-wraps, else the default tag.
pub fn display_name(step: &StepRef) -> String {
    let name = step.name();
    if name != "step" {
        return name;
    }
    if let Some(inner) = step.unwrap_one() {
        return display_name(&inner);
    }
    if let Some(children) = step.unwrap_many() {
        let parts: Vec<String> = children.iter().map(display_name).collect();
        return format!("[{}]", parts.join(", "));
    }
    "step".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::RunContext;
    use crate::error::StepError;
    use crate::step::Step;
    use async_trait::async_trait;
    use std::sync::Arc;

    struct Named(&'static str);

    #[async_trait]
    impl Step for Named {
        async fn run(&self, _ctx: &RunContext) -> Result<(), StepError> {
            Ok(())
        }
        fn name(&self) -> String {
            self.0.to_string()
        }
    }

    struct Wrapper(StepRef);

    #[async_trait]
    impl Step for Wrapper {
        async fn run(&self, _ctx: &RunContext) -> Result<(), StepError> {
            Ok(())
        }
        fn unwrap_one(&self) -> Option<StepRef> {
            Some(self.0.clone())
        }
    }

    struct Branch(Vec<StepRef>);

    #[async_trait]
    impl Step for Branch {
        async fn run(&self, _ctx: &RunContext) -> Result<(), StepError> {
            Ok(())
        }
        fn name(&self) -> String {
            "branch".to_string()
        }
        fn unwrap_many(&self) -> Option<Vec<StepRef>> {
            Some(self.0.clone())
        }
    }

    #[test]
    fn is_finds_wrapped_type() {
        let leaf: StepRef = Arc::new(Named("leaf"));
        let wrapped: StepRef = Arc::new(Wrapper(leaf));
        assert!(is::<Named>(&wrapped));
        assert!(!is::<Branch>(&wrapped));
    }

    #[test]
    fn as_nodes_collects_every_match_in_pre_order() {
        let a: StepRef = Arc::new(Named("a"));
        let b: StepRef = Arc::new(Named("b"));
        let branch: StepRef = Arc::new(Branch(vec![a.clone(), b.clone()]));

        let found = as_nodes::<Named>(&branch);
        assert_eq!(found.len(), 2);
    }

    #[test]
    fn is_step_checks_membership_in_unwrap_graph() {
        let leaf: StepRef = Arc::new(Named("leaf"));
        let wrapped: StepRef = Arc::new(Wrapper(leaf.clone()));
        let other: StepRef = Arc::new(Named("other"));

        assert!(is_step(&wrapped, &leaf));
        assert!(!is_step(&wrapped, &other));
    }

    #[test]
    fn display_name_falls_back_through_wrap_chain() {
        let leaf: StepRef = Arc::new(Named("leaf"));
        let wrapped: StepRef = Arc::new(Wrapper(leaf));
        assert_eq!(display_name(&wrapped), "leaf");
    }

    #[test]
    fn display_name_renders_branch_as_bracketed_list() {
        let a: StepRef = Arc::new(Named("a"));
        let b: StepRef = Arc::new(Named("b"));
        let branch: StepRef = Arc::new(Branch(vec![a, b]));
        assert_eq!(display_name(&branch), "branch");
    }
}
