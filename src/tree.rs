//! Arena holding every attached stage of one progress bar
//!
//! Nodes refer to each other by [`StageId`]. The arena is only ever touched
//! through the progress bar's mutex, so nothing in here synchronizes.

use std::sync::Arc;

use tracing::trace;

use crate::stage::StageData;
use crate::{InvalidReason, ProgressVector, StageState};

/// Index of a node in its tree's arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct StageId(usize);

impl StageId {
    pub(crate) const ROOT: StageId = StageId(0);
}

pub(crate) struct Node<M> {
    pub(crate) data: Arc<StageData<M>>,
    pub(crate) parent: Option<StageId>,
    pub(crate) children: Vec<StageId>,
    pub(crate) tree_weight: u64,
    pub(crate) state: StageState,
}

pub(crate) struct Tree<M> {
    nodes: Vec<Node<M>>,
    done: u64,
    failed: u64,
    completed: Vec<StageId>,
}

impl<M> Tree<M> {
    pub(crate) fn new(root: Arc<StageData<M>>) -> Self {
        let tree_weight = root.weight;

        Self {
            nodes: vec![Node {
                data: root,
                parent: None,
                children: Vec::new(),
                tree_weight,
                state: StageState::Initial,
            }],
            done: 0,
            failed: 0,
            completed: Vec::new(),
        }
    }

    pub(crate) fn node(&self, id: StageId) -> &Node<M> {
        &self.nodes[id.0]
    }

    fn node_mut(&mut self, id: StageId) -> &mut Node<M> {
        &mut self.nodes[id.0]
    }

    pub(crate) fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Id the next inserted stage will receive
    pub(crate) fn next_id(&self) -> StageId {
        StageId(self.nodes.len())
    }

    pub(crate) fn check_attachable(&self, parent: StageId) -> Result<(), InvalidReason> {
        let state = self.node(parent).state;
        if !state.accepts_children() {
            return Err(InvalidReason::ParentClosed(state));
        }
        Ok(())
    }

    /// Appends `data` under `parent` and rolls its weight up to the root
    pub(crate) fn insert(&mut self, parent: StageId, data: Arc<StageData<M>>) -> StageId {
        let id = self.next_id();
        let weight = data.weight;

        self.nodes.push(Node {
            data,
            parent: Some(parent),
            children: Vec::new(),
            tree_weight: weight,
            state: StageState::Initial,
        });
        self.node_mut(parent).children.push(id);

        if weight > 0 {
            let mut cursor = Some(parent);
            while let Some(ancestor) = cursor {
                let node = self.node_mut(ancestor);
                node.tree_weight = node.tree_weight.saturating_add(weight);
                cursor = node.parent;
            }
        }

        id
    }

    pub(crate) fn check_resolvable(&self, id: StageId) -> Result<(), InvalidReason> {
        let node = self.node(id);
        if node.state != StageState::Initial {
            return Err(InvalidReason::AlreadyResolved(node.state));
        }

        if let Some(parent) = node.parent {
            let parent_state = self.node(parent).state;
            if parent_state != StageState::Done {
                return Err(InvalidReason::ParentNotDone(parent_state));
            }
        }

        Ok(())
    }

    /// Marks `id` done and credits its own weight
    pub(crate) fn mark_done(&mut self, id: StageId) -> ProgressVector {
        let node = self.node_mut(id);
        node.state = StageState::Done;
        let weight = node.data.weight;

        self.done = self.done.saturating_add(weight);
        self.completed.push(id);
        self.progress()
    }

    /// Marks `id` failed, cancels its whole subtree and charges the subtree
    /// weight to the failed counter
    pub(crate) fn mark_failed(&mut self, id: StageId) -> ProgressVector {
        let subtree = self.subtree(id);

        for &member in &subtree {
            let node = self.node_mut(member);
            if member == id {
                node.state = StageState::Fail;
            } else {
                trace!(stage = %node.data.name, previous = ?node.state, "stage cancelled");
                node.state = StageState::Cancel;
            }
            node.data.cancel_token.cancel();
        }

        self.failed = self.failed.saturating_add(self.node(id).tree_weight);
        self.completed.extend(subtree);

        self.progress()
    }

    /// Pre-order ids of `id` and all of its descendants
    pub(crate) fn subtree(&self, id: StageId) -> Vec<StageId> {
        let mut ids = Vec::new();
        let mut stack = vec![id];

        while let Some(current) = stack.pop() {
            ids.push(current);
            stack.extend(self.node(current).children.iter().rev().copied());
        }

        ids
    }

    pub(crate) fn progress(&self) -> ProgressVector {
        ProgressVector {
            done: self.done,
            total: self.node(StageId::ROOT).tree_weight,
            failed: self.failed,
        }
    }

    /// Ids of resolved stages in resolution order
    pub(crate) fn completed(&self) -> &[StageId] {
        &self.completed
    }
}
