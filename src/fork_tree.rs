// SPDX-FileCopyrightText: 2025 Ledger https://www.ledger.com - INSTITUT MINES TELECOM
//
// SPDX-License-Identifier: Apache-2.0

//! Forest of fork trees, one per exploration root. Leaves hold live
//! states; internal nodes are historical fork points. Random-path searchers
//! walk the forest restricted to the nodes they own; ownership is an
//! explicit per-node bitmask, so up to eight independent random-path
//! searchers can share one forest.

use crate::manager::{ActionResult, Subscriber, Universe};
use crate::state::StateId;
use log::trace;
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// Maximum number of independent random-path owners of one forest.
pub const MAX_OWNERS: u32 = 8;

#[derive(Debug)]
struct ForkNode {
    parent: Option<NodeId>,
    left: Option<NodeId>,
    right: Option<NodeId>,
    state: Option<StateId>,
    owners: u8,
}

#[derive(Debug, Default)]
pub struct ForkForest {
    nodes: BTreeMap<NodeId, ForkNode>,
    /// Tree index -> root node.
    trees: BTreeMap<u32, NodeId>,
    state_nodes: BTreeMap<StateId, NodeId>,
    registered_owners: u32,
    next_node: u32,
    next_tree: u32,
}

impl ForkForest {
    pub fn new() -> Self {
        ForkForest::default()
    }

    /// Claim a fresh ownership bit for one random-path searcher.
    pub fn next_owner_id(&mut self) -> u8 {
        assert!(
            self.registered_owners < MAX_OWNERS,
            "fork forest supports at most {} random-path searchers",
            MAX_OWNERS
        );
        let mask = 1u8 << self.registered_owners;
        self.registered_owners += 1;
        mask
    }

    fn new_node(&mut self, parent: Option<NodeId>, state: Option<StateId>, owners: u8) -> NodeId {
        let id = NodeId(self.next_node);
        self.next_node += 1;
        self.nodes.insert(
            id,
            ForkNode {
                parent,
                left: None,
                right: None,
                state,
                owners,
            },
        );
        if let Some(state) = state {
            self.state_nodes.insert(state, id);
        }
        id
    }

    pub fn add_root(&mut self, state: StateId) {
        if self.state_nodes.contains_key(&state) {
            return;
        }
        let node = self.new_node(None, Some(state), 0);
        let tree = self.next_tree;
        self.next_tree += 1;
        self.trees.insert(tree, node);
        trace!("fork forest: new root {} for {}", node, state);
    }

    /// Turn `current`'s leaf into a fork point with the continuation on the
    /// right and the new branch on the left. Both children inherit the
    /// fork point's ownership.
    pub fn attach(&mut self, current: StateId, branched: StateId) {
        let node = *self
            .state_nodes
            .get(&current)
            .unwrap_or_else(|| panic!("fork forest: {} has no node", current));
        let owners = self.nodes[&node].owners;
        let left = self.new_node(Some(node), Some(branched), owners);
        let right = self.new_node(Some(node), Some(current), owners);
        let fork_point = self.nodes.get_mut(&node).unwrap();
        fork_point.state = None;
        fork_point.left = Some(left);
        fork_point.right = Some(right);
        self.state_nodes.insert(current, right);
        trace!(
            "fork forest: {} forked, {} -> ({}, {})",
            current,
            node,
            left,
            right
        );
    }

    /// Drop a destroyed state's leaf, pruning childless fork points and
    /// recomputing ownership on the way up.
    pub fn remove_state(&mut self, state: StateId) {
        let Some(leaf) = self.state_nodes.remove(&state) else {
            return;
        };
        let mut dead = Some(leaf);
        while let Some(id) = dead {
            let node = self.nodes.remove(&id).expect("fork node arena out of sync");
            dead = None;
            if let Some(parent_id) = node.parent {
                let parent = self.nodes.get_mut(&parent_id).unwrap();
                if parent.left == Some(id) {
                    parent.left = None;
                }
                if parent.right == Some(id) {
                    parent.right = None;
                }
                if parent.left.is_none() && parent.right.is_none() && parent.state.is_none() {
                    dead = Some(parent_id);
                } else {
                    self.recompute_owners_upward(parent_id);
                }
            } else {
                self.trees.retain(|_, root| *root != id);
            }
        }
    }

    fn recompute_owners_upward(&mut self, from: NodeId) {
        let mut cursor = Some(from);
        while let Some(id) = cursor {
            let node = &self.nodes[&id];
            if node.state.is_some() {
                // leaves keep the bits their owners set explicitly
                cursor = node.parent;
                continue;
            }
            let mut owners = 0u8;
            if let Some(left) = node.left {
                owners |= self.nodes[&left].owners;
            }
            if let Some(right) = node.right {
                owners |= self.nodes[&right].owners;
            }
            let node = self.nodes.get_mut(&id).unwrap();
            if node.owners == owners {
                break;
            }
            node.owners = owners;
            cursor = node.parent;
        }
    }

    /// Withdraw `mask`'s claim on a state's leaf, shrinking the owned spine
    /// above it. Used when a searcher pauses a state without destroying it.
    pub fn clear_owned(&mut self, state: StateId, mask: u8) {
        let Some(&leaf) = self.state_nodes.get(&state) else {
            return;
        };
        let node = self.nodes.get_mut(&leaf).unwrap();
        node.owners &= !mask;
        if let Some(parent) = node.parent {
            self.recompute_owners_upward(parent);
        }
    }

    /// Mark a state's leaf (and the spine above it) as owned by `mask`.
    pub fn mark_owned(&mut self, state: StateId, mask: u8) -> bool {
        let Some(&leaf) = self.state_nodes.get(&state) else {
            return false;
        };
        let mut cursor = Some(leaf);
        while let Some(id) = cursor {
            let node = self.nodes.get_mut(&id).unwrap();
            if node.owners & mask != 0 {
                break;
            }
            node.owners |= mask;
            cursor = node.parent;
        }
        true
    }

    pub fn has_owned_root(&self, mask: u8) -> bool {
        self.trees
            .values()
            .any(|root| self.nodes[root].owners & mask != 0)
    }

    pub fn owned_roots(&self, mask: u8) -> Vec<NodeId> {
        self.trees
            .values()
            .copied()
            .filter(|root| self.nodes[root].owners & mask != 0)
            .collect()
    }

    /// Random walk from `root` over nodes owned by `mask`, driven by the
    /// caller's bit source. A dead end here means ownership maintenance is
    /// broken, which is a bug rather than a recoverable condition.
    pub fn walk<F: FnMut() -> bool>(&self, root: NodeId, mask: u8, mut flip: F) -> StateId {
        let mut node = &self.nodes[&root];
        loop {
            if let Some(state) = node.state {
                return state;
            }
            let left = node
                .left
                .filter(|id| self.nodes[id].owners & mask != 0);
            let right = node
                .right
                .filter(|id| self.nodes[id].owners & mask != 0);
            let next = match (left, right) {
                (Some(l), Some(r)) => {
                    if flip() {
                        l
                    } else {
                        r
                    }
                }
                (Some(l), None) => l,
                (None, Some(r)) => r,
                (None, None) => panic!(
                    "fork forest: no owned child under mask {:#04x}; ownership out of sync",
                    mask
                ),
            };
            node = &self.nodes[&next];
        }
    }

    pub fn contains_state(&self, state: StateId) -> bool {
        self.state_nodes.contains_key(&state)
    }

    pub fn tree_count(&self) -> usize {
        self.trees.len()
    }
}

impl Subscriber for ForkForest {
    fn update(&mut self, _universe: &Universe, result: &ActionResult) {
        match result {
            ActionResult::Forward(r) => {
                self.apply_fork_diff(r.current, &r.added, &r.removed);
            }
            ActionResult::Branch(r) => {
                self.apply_fork_diff(r.current, &r.added, &r.removed);
            }
            ActionResult::Initialize(r) => {
                self.add_root(r.state);
            }
            ActionResult::Backward(_) | ActionResult::Reached(_) | ActionResult::Terminate(_) => {}
        }
    }

    fn add_root(&mut self, _universe: &Universe, state: StateId) {
        ForkForest::add_root(self, state);
    }
}

impl ForkForest {
    fn apply_fork_diff(&mut self, current: Option<StateId>, added: &[StateId], removed: &[StateId]) {
        for state in added {
            if self.contains_state(*state) {
                continue;
            }
            match current {
                Some(parent) if self.contains_state(parent) => self.attach(parent, *state),
                _ => self.add_root(*state),
            }
        }
        for state in removed {
            self.remove_state(*state);
        }
    }
}
