//! The step tree: reconciles nested/composite steps so each user-added step
//! is orchestrated exactly once, at its outermost known wrapping.

use std::collections::HashMap;

use crate::error::WorkflowError;
use crate::step::{StepId, StepRef};

struct Node {
    step: StepRef,
    root: StepId,
}

/// Maps every step discovered so far (roots, branches, leaves) to its
/// workflow-visible root.
#[derive(Default)]
pub struct StepTree {
    nodes: HashMap<StepId, Node>,
}

impl StepTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, id: StepId) -> bool {
        self.nodes.contains_key(&id)
    }

    /// The workflow-visible root of `id`, if known.
    pub fn root_of(&self, id: StepId) -> Option<StepId> {
        self.nodes.get(&id).map(|n| n.root)
    }

    pub fn step_ref(&self, id: StepId) -> Option<&StepRef> {
        self.nodes.get(&id).map(|n| &n.step)
    }

    /// All steps currently orchestrated directly (their own root).
    pub fn roots(&self) -> Vec<StepRef> {
        self.nodes
            .values()
            .filter(|n| n.root == StepId::of(&n.step))
            .map(|n| n.step.clone())
            .collect()
    }

    /// Adds `step` to the tree, descending its unwrap graph and grafting
    /// newly-discovered descendants onto it. Returns the set of previously
    /// independent roots that this addition demoted (now subsumed by
    /// `step`'s subtree).
    pub fn add(&mut self, step: &StepRef) -> Result<Vec<StepId>, WorkflowError> {
        let id = StepId::of(step);
        if self.nodes.contains_key(&id) {
            return Ok(Vec::new());
        }
        self.nodes.insert(
            id,
            Node {
                step: step.clone(),
                root: id,
            },
        );
        let mut demoted = Vec::new();
        self.descend(step, id, &mut demoted)?;
        Ok(demoted)
    }

    /// Descends `node`'s unwrap graph. `effective_root` is the closest
    /// multi-wrap ancestor seen so far (or the originally-added step, if
    /// none); single-wrap chains keep inheriting it, multi-wrap nodes
    /// become the new effective root for their own children.
    fn descend(
        &mut self,
        node: &StepRef,
        effective_root: StepId,
        demoted: &mut Vec<StepId>,
    ) -> Result<(), WorkflowError> {
        if let Some(inner) = node.unwrap_one() {
            self.visit(&inner, effective_root, demoted)?;
        }
        if let Some(children) = node.unwrap_many() {
            let node_id = StepId::of(node);
            for child in &children {
                self.visit(child, node_id, demoted)?;
            }
        }
        Ok(())
    }

    fn visit(
        &mut self,
        descendant: &StepRef,
        root: StepId,
        demoted: &mut Vec<StepId>,
    ) -> Result<(), WorkflowError> {
        let did = StepId::of(descendant);
        let existing_root = self.nodes.get(&did).map(|n| n.root);

        match existing_root {
            None => {
                self.nodes.insert(
                    did,
                    Node {
                        step: descendant.clone(),
                        root,
                    },
                );
                self.descend(descendant, root, demoted)?;
            }
            Some(r) if r == root => {
                // Already grafted under this exact root; subtree already recorded.
            }
            Some(r) if r == did => {
                // `descendant` was itself a standalone root; demote it.
                if let Some(n) = self.nodes.get_mut(&did) {
                    n.root = root;
                }
                demoted.push(did);
                self.descend(descendant, root, demoted)?;
            }
            Some(r) if demoted.contains(&r) => {
                // Its prior root was already subsumed earlier in this same
                // `add` call; re-parent without treating it as a conflict.
                if let Some(n) = self.nodes.get_mut(&did) {
                    n.root = root;
                }
                self.descend(descendant, root, demoted)?;
            }
            Some(other_root) => {
                let leaf_name = descendant.name();
                let first_name = self
                    .nodes
                    .get(&other_root)
                    .map(|n| n.step.name())
                    .unwrap_or_else(|| "<unknown>".to_string());
                let second_name = self
                    .nodes
                    .get(&root)
                    .map(|n| n.step.name())
                    .unwrap_or_else(|| "<unknown>".to_string());
                return Err(WorkflowError::TreeConflict {
                    leaf: leaf_name,
                    first: first_name,
                    second: second_name,
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::RunContext;
    use crate::error::StepError;
    use crate::step::Step;
    use async_trait::async_trait;
    use std::sync::Arc;

    struct Leaf(&'static str);

    #[async_trait]
    impl Step for Leaf {
        async fn run(&self, _ctx: &RunContext) -> Result<(), StepError> {
            Ok(())
        }
        fn name(&self) -> String {
            self.0.to_string()
        }
    }

    struct SingleWrap(&'static str, StepRef);

    #[async_trait]
    impl Step for SingleWrap {
        async fn run(&self, _ctx: &RunContext) -> Result<(), StepError> {
            Ok(())
        }
        fn name(&self) -> String {
            self.0.to_string()
        }
        fn unwrap_one(&self) -> Option<StepRef> {
            Some(self.1.clone())
        }
    }

    struct MultiWrap(&'static str, Vec<StepRef>);

    #[async_trait]
    impl Step for MultiWrap {
        async fn run(&self, _ctx: &RunContext) -> Result<(), StepError> {
            Ok(())
        }
        fn name(&self) -> String {
            self.0.to_string()
        }
        fn unwrap_many(&self) -> Option<Vec<StepRef>> {
            Some(self.1.clone())
        }
    }

    #[test]
    fn single_step_is_its_own_root() {
        let mut tree = StepTree::new();
        let a: StepRef = Arc::new(Leaf("a"));
        tree.add(&a).unwrap();
        assert_eq!(tree.root_of(StepId::of(&a)), Some(StepId::of(&a)));
    }

    #[test]
    fn nested_wrap_roots_under_outermost_multi_wrap() {
        // a is a leaf, A = wrap(a), ab = multi(A, b): a nested single-wrap
        // chain grafted under an outer multi-wrap root.
        let a: StepRef = Arc::new(Leaf("a"));
        let big_a: StepRef = Arc::new(SingleWrap("A", a.clone()));
        let b: StepRef = Arc::new(Leaf("b"));
        let ab: StepRef = Arc::new(MultiWrap("ab", vec![big_a.clone(), b.clone()]));

        let mut tree = StepTree::new();
        tree.add(&ab).unwrap();

        let ab_id = StepId::of(&ab);
        assert_eq!(tree.root_of(StepId::of(&a)), Some(ab_id));
        assert_eq!(tree.root_of(StepId::of(&big_a)), Some(ab_id));
        assert_eq!(tree.root_of(StepId::of(&b)), Some(ab_id));
        assert_eq!(tree.root_of(ab_id), Some(ab_id));

        let roots = tree.roots();
        assert_eq!(roots.len(), 1);
    }

    #[test]
    fn adding_in_any_order_converges_to_same_tree() {
        let a: StepRef = Arc::new(Leaf("a"));
        let big_a: StepRef = Arc::new(SingleWrap("A", a.clone()));
        let b: StepRef = Arc::new(Leaf("b"));
        let ab: StepRef = Arc::new(MultiWrap("ab", vec![big_a.clone(), b.clone()]));

        let mut tree = StepTree::new();
        tree.add(&ab).unwrap();
        tree.add(&big_a).unwrap();
        tree.add(&a).unwrap();

        let ab_id = StepId::of(&ab);
        assert_eq!(tree.root_of(StepId::of(&a)), Some(ab_id));
        assert_eq!(tree.root_of(StepId::of(&big_a)), Some(ab_id));
        assert_eq!(tree.roots().len(), 1);
    }

    #[test]
    fn conflicting_multi_wrap_ownership_fails() {
        let leaf: StepRef = Arc::new(Leaf("shared"));
        let left: StepRef = Arc::new(MultiWrap("left", vec![leaf.clone()]));
        let right: StepRef = Arc::new(MultiWrap("right", vec![leaf.clone()]));

        let mut tree = StepTree::new();
        tree.add(&left).unwrap();
        let err = tree.add(&right).unwrap_err();
        assert!(matches!(err, WorkflowError::TreeConflict { .. }));
    }
}
