// SPDX-FileCopyrightText: 2025 Ledger https://www.ledger.com - INSTITUT MINES TELECOM
//
// SPDX-License-Identifier: Apache-2.0

//! Forward exploration strategies. Each searcher implements one
//! state-selection policy over the same contract; composites own their
//! inner searchers and form decorator chains.

use crate::config::{BatchingConfig, SearchConfig, SearcherKind};
use crate::fork_tree::ForkForest;
use crate::manager::Universe;
use crate::program::{BlockId, FunctionId, Program, Target};
use crate::state::{ExecutionState, StateId};
use log::debug;
use rand::rngs::StdRng;
use rand::Rng;
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::rc::Rc;
use std::time::{Duration, Instant};

/// Shared run counters the batching searcher reads. The driver bumps
/// `instructions` as it retires them.
#[derive(Debug, Default)]
pub struct SearchStats {
    pub instructions: Cell<u64>,
}

/// Selects states for further exploration. `select_state` is never called
/// when `empty` holds; `update` reports each step's effects and is the only
/// place references to removed states may be dropped.
pub trait ForwardSearcher {
    fn select_state(&mut self, universe: &Universe) -> StateId;

    fn update(
        &mut self,
        universe: &Universe,
        current: Option<StateId>,
        added: &[StateId],
        removed: &[StateId],
    );

    fn empty(&self) -> bool;

    fn name(&self) -> String;
}

/// Weighted sampling over states; the backing structure for the weighted
/// and targeted searchers.
#[derive(Debug, Default)]
pub struct DiscretePdf {
    entries: Vec<(StateId, f64)>,
    index: BTreeMap<StateId, usize>,
}

impl DiscretePdf {
    pub fn insert(&mut self, id: StateId, weight: f64) {
        assert!(
            !self.index.contains_key(&id),
            "{} already present in pdf",
            id
        );
        self.index.insert(id, self.entries.len());
        self.entries.push((id, weight.max(0.0)));
    }

    pub fn update(&mut self, id: StateId, weight: f64) {
        let at = self.index[&id];
        self.entries[at].1 = weight.max(0.0);
    }

    pub fn remove(&mut self, id: StateId) {
        if let Some(at) = self.index.remove(&id) {
            self.entries.swap_remove(at);
            if at < self.entries.len() {
                self.index.insert(self.entries[at].0, at);
            }
        }
    }

    pub fn contains(&self, id: StateId) -> bool {
        self.index.contains_key(&id)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Pick by cumulative weight at point `p` in [0, 1). Zero total weight
    /// degrades to the first entry, keeping selection total.
    pub fn choose(&self, p: f64) -> StateId {
        assert!(!self.entries.is_empty(), "choose on empty pdf");
        let total: f64 = self.entries.iter().map(|(_, w)| w).sum();
        if total <= 0.0 {
            return self.entries[0].0;
        }
        let mut mark = p.clamp(0.0, 1.0) * total;
        for (id, w) in &self.entries {
            if mark < *w {
                return *id;
            }
            mark -= w;
        }
        self.entries.last().unwrap().0
    }
}

/// Depth-first: most recently added state first.
#[derive(Debug, Default)]
pub struct DfsSearcher {
    states: Vec<StateId>,
}

impl DfsSearcher {
    pub fn new() -> Self {
        DfsSearcher::default()
    }
}

impl ForwardSearcher for DfsSearcher {
    fn select_state(&mut self, _universe: &Universe) -> StateId {
        *self.states.last().expect("select on empty DFS searcher")
    }

    fn update(
        &mut self,
        _universe: &Universe,
        _current: Option<StateId>,
        added: &[StateId],
        removed: &[StateId],
    ) {
        self.states.extend_from_slice(added);
        for state in removed {
            if self.states.last() == Some(state) {
                self.states.pop();
            } else {
                let at = self
                    .states
                    .iter()
                    .position(|s| s == state)
                    .unwrap_or_else(|| panic!("invalid state {} removed", state));
                self.states.remove(at);
            }
        }
    }

    fn empty(&self) -> bool {
        self.states.is_empty()
    }

    fn name(&self) -> String {
        "DfsSearcher".to_string()
    }
}

/// Breadth-first: oldest state first. A state that forked is re-enqueued at
/// the back, since adding constraints made it a new frontier entry.
#[derive(Debug, Default)]
pub struct BfsSearcher {
    states: VecDeque<StateId>,
}

impl BfsSearcher {
    pub fn new() -> Self {
        BfsSearcher::default()
    }
}

impl ForwardSearcher for BfsSearcher {
    fn select_state(&mut self, _universe: &Universe) -> StateId {
        *self.states.front().expect("select on empty BFS searcher")
    }

    fn update(
        &mut self,
        _universe: &Universe,
        current: Option<StateId>,
        added: &[StateId],
        removed: &[StateId],
    ) {
        if let Some(current) = current {
            if !added.is_empty() && !removed.contains(&current) {
                let at = self
                    .states
                    .iter()
                    .position(|s| *s == current)
                    .expect("current state missing from BFS queue");
                self.states.remove(at);
                self.states.push_back(current);
            }
        }
        self.states.extend(added.iter().copied());
        for state in removed {
            if self.states.front() == Some(state) {
                self.states.pop_front();
            } else {
                let at = self
                    .states
                    .iter()
                    .position(|s| s == state)
                    .unwrap_or_else(|| panic!("invalid state {} removed", state));
                self.states.remove(at);
            }
        }
    }

    fn empty(&self) -> bool {
        self.states.is_empty()
    }

    fn name(&self) -> String {
        "BfsSearcher".to_string()
    }
}

/// Uniform random selection.
pub struct RandomSearcher {
    states: Vec<StateId>,
    rng: Rc<RefCell<StdRng>>,
}

impl RandomSearcher {
    pub fn new(rng: Rc<RefCell<StdRng>>) -> Self {
        RandomSearcher {
            states: Vec::new(),
            rng,
        }
    }
}

impl ForwardSearcher for RandomSearcher {
    fn select_state(&mut self, _universe: &Universe) -> StateId {
        let at = self.rng.borrow_mut().gen_range(0..self.states.len());
        self.states[at]
    }

    fn update(
        &mut self,
        _universe: &Universe,
        _current: Option<StateId>,
        added: &[StateId],
        removed: &[StateId],
    ) {
        self.states.extend_from_slice(added);
        for state in removed {
            let at = self
                .states
                .iter()
                .position(|s| s == state)
                .unwrap_or_else(|| panic!("invalid state {} removed", state));
            self.states.swap_remove(at);
        }
    }

    fn empty(&self) -> bool {
        self.states.is_empty()
    }

    fn name(&self) -> String {
        "RandomSearcher".to_string()
    }
}

/// Weight functions for non-uniform random search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightKind {
    Depth,
    /// 1 / 2^depth.
    Rp,
    InstCount,
    CpInstCount,
    QueryCost,
    MinDistToUncovered,
    CoveringNew,
}

pub struct WeightedRandomSearcher {
    states: DiscretePdf,
    rng: Rc<RefCell<StdRng>>,
    kind: WeightKind,
    update_weights: bool,
}

impl WeightedRandomSearcher {
    pub fn new(kind: WeightKind, rng: Rc<RefCell<StdRng>>) -> Self {
        let update_weights = match kind {
            WeightKind::Depth | WeightKind::Rp => false,
            WeightKind::InstCount
            | WeightKind::CpInstCount
            | WeightKind::QueryCost
            | WeightKind::MinDistToUncovered
            | WeightKind::CoveringNew => true,
        };
        WeightedRandomSearcher {
            states: DiscretePdf::default(),
            rng,
            kind,
            update_weights,
        }
    }

    fn weight(&self, state: &ExecutionState) -> f64 {
        match self.kind {
            WeightKind::Depth => state.depth as f64,
            WeightKind::Rp => 0.5f64.powi(state.depth.min(1000) as i32),
            WeightKind::InstCount => {
                let inv = 1.0 / state.stepped_instructions.max(1) as f64;
                inv * inv
            }
            WeightKind::CpInstCount => 1.0 / state.stepped_instructions.max(1) as f64,
            WeightKind::QueryCost => {
                if state.query_cost < 0.1 {
                    1.0
                } else {
                    1.0 / state.query_cost
                }
            }
            WeightKind::MinDistToUncovered | WeightKind::CoveringNew => {
                let md2u = if state.min_dist_to_uncovered == 0 {
                    10000
                } else {
                    state.min_dist_to_uncovered
                };
                let inv_md2u = 1.0 / md2u as f64;
                if self.kind == WeightKind::CoveringNew {
                    let inv_cov_new = if state.insts_since_cov_new > 0 {
                        1.0 / (state.insts_since_cov_new.saturating_sub(1000)).max(1) as f64
                    } else {
                        0.0
                    };
                    inv_cov_new * inv_cov_new + inv_md2u * inv_md2u
                } else {
                    inv_md2u * inv_md2u
                }
            }
        }
    }
}

impl ForwardSearcher for WeightedRandomSearcher {
    fn select_state(&mut self, _universe: &Universe) -> StateId {
        let p = self.rng.borrow_mut().gen::<f64>();
        self.states.choose(p)
    }

    fn update(
        &mut self,
        universe: &Universe,
        current: Option<StateId>,
        added: &[StateId],
        removed: &[StateId],
    ) {
        if let Some(current) = current {
            if self.update_weights && !removed.contains(&current) && self.states.contains(current) {
                self.states.update(current, self.weight(universe.state(current)));
            }
        }
        for state in added {
            self.states.insert(*state, self.weight(universe.state(*state)));
        }
        for state in removed {
            self.states.remove(*state);
        }
    }

    fn empty(&self) -> bool {
        self.states.is_empty()
    }

    fn name(&self) -> String {
        format!("WeightedRandomSearcher::{:?}", self.kind)
    }
}

/// Unbiased random walk over the fork forest, restricted to the subset of
/// nodes this searcher owns. Ownership bits are claimed lazily because the
/// forest (a late-tier subscriber) sees new states after the searchers do.
pub struct RandomPathSearcher {
    forest: Rc<RefCell<ForkForest>>,
    rng: Rc<RefCell<StdRng>>,
    id_bit_mask: u8,
    pending: RefCell<Vec<StateId>>,
}

impl RandomPathSearcher {
    pub fn new(forest: Rc<RefCell<ForkForest>>, rng: Rc<RefCell<StdRng>>) -> Self {
        let id_bit_mask = forest.borrow_mut().next_owner_id();
        RandomPathSearcher {
            forest,
            rng,
            id_bit_mask,
            pending: RefCell::new(Vec::new()),
        }
    }

    fn flush_pending(&self) {
        let mut pending = self.pending.borrow_mut();
        if pending.is_empty() {
            return;
        }
        let mut forest = self.forest.borrow_mut();
        for state in pending.drain(..) {
            // a state removed in the same cycle never grew a node; skip it
            forest.mark_owned(state, self.id_bit_mask);
        }
    }
}

impl ForwardSearcher for RandomPathSearcher {
    fn select_state(&mut self, _universe: &Universe) -> StateId {
        self.flush_pending();
        let forest = self.forest.borrow();
        let roots = forest.owned_roots(self.id_bit_mask);
        assert!(!roots.is_empty(), "select on empty random-path searcher");
        let mut rng = self.rng.borrow_mut();
        let root = roots[rng.gen_range(0..roots.len())];
        forest.walk(root, self.id_bit_mask, || rng.gen::<bool>())
    }

    fn update(
        &mut self,
        _universe: &Universe,
        _current: Option<StateId>,
        added: &[StateId],
        removed: &[StateId],
    ) {
        self.pending.borrow_mut().extend_from_slice(added);
        // withdraw ownership immediately: a removal may be a pause, leaving
        // the leaf alive but no longer selectable here
        let mut pending = self.pending.borrow_mut();
        let mut forest = self.forest.borrow_mut();
        for state in removed {
            pending.retain(|s| s != state);
            forest.clear_owned(*state, self.id_bit_mask);
        }
    }

    fn empty(&self) -> bool {
        self.flush_pending();
        !self.forest.borrow().has_owned_root(self.id_bit_mask)
    }

    fn name(&self) -> String {
        "RandomPathSearcher".to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightResult {
    Continue,
    Done,
    Miss,
}

/// Distance-to-target-weighted search for one target. States that arrive
/// are collected in `reached_on_last_update`; states that can no longer
/// reach the target drop out with `Miss`.
pub struct TargetedSearcher {
    program: Rc<Program>,
    target: Target,
    states: DiscretePdf,
    states_set: BTreeSet<StateId>,
    distance_to_target_function: Rc<BTreeMap<FunctionId, u32>>,
    pub reached_on_last_update: Vec<StateId>,
    rng: Rc<RefCell<StdRng>>,
}

impl TargetedSearcher {
    pub fn new(program: Rc<Program>, target: Target, rng: Rc<RefCell<StdRng>>) -> Self {
        let target_function = program.function_of_block(target.block);
        let distance_to_target_function = program.backward_function_distance(target_function);
        TargetedSearcher {
            program,
            target,
            states: DiscretePdf::default(),
            states_set: BTreeSet::new(),
            distance_to_target_function,
            reached_on_last_update: Vec::new(),
            rng,
        }
    }

    fn distance_in_call_graph(&self, function: FunctionId, block: BlockId) -> Option<u32> {
        let dist = self.program.block_distance(block);
        let target_function = self.program.function_of_block(self.target.block);
        if function == target_function && dist.contains_key(&self.target.block) {
            return Some(0);
        }
        let mut best: Option<u32> = None;
        for call_block in self.program.call_blocks(function) {
            if !dist.contains_key(&call_block) {
                continue;
            }
            if let crate::program::BlockKind::Call(crate::program::Callee::Declared(callee)) =
                &self.program.block(call_block).kind
            {
                if let Some(d) = self.distance_to_target_function.get(callee) {
                    let candidate = d + 1;
                    if best.map_or(true, |b| candidate < b) {
                        best = Some(candidate);
                    }
                }
            }
        }
        best
    }

    fn local_weight(
        &self,
        state: &ExecutionState,
        local_targets: &[BlockId],
    ) -> (WeightResult, f64) {
        let current = state.current_block(&self.program);
        let dist = self.program.block_distance(current);
        let mut local: Option<u32> = None;
        for end in local_targets {
            if let Some(d) = dist.get(end) {
                local = Some(local.map_or(*d, |l| l.min(*d)));
            }
        }
        let Some(local) = local else {
            return (WeightResult::Miss, 0.0);
        };
        if local == 0 {
            return (WeightResult::Done, 0.0);
        }
        let weight = (state.stepped_instructions + local as u64) as f64 * (1.0 / 4294967296.0);
        (WeightResult::Continue, weight)
    }

    fn target_weight(&self, state: &ExecutionState) -> (WeightResult, f64) {
        let (res, weight) = self.local_weight(state, &[self.target.block]);
        // number on the [0, 0.5) band: closest to the target wins overall
        (res, weight * 0.5)
    }

    fn pre_target_weight(&self, state: &ExecutionState, function: FunctionId) -> (WeightResult, f64) {
        let local_targets: Vec<BlockId> = self
            .program
            .call_blocks(function)
            .into_iter()
            .filter(|b| {
                matches!(
                    &self.program.block(*b).kind,
                    crate::program::BlockKind::Call(crate::program::Callee::Declared(callee))
                        if self.distance_to_target_function.contains_key(callee)
                )
            })
            .collect();
        if local_targets.is_empty() {
            return (WeightResult::Miss, 0.0);
        }
        let (res, weight) = self.local_weight(state, &local_targets);
        let res = if res == WeightResult::Done {
            WeightResult::Continue
        } else {
            res
        };
        // [0.5, 1) band: still has calls to make before the target
        (res, 0.5 + weight * 0.5)
    }

    fn post_target_weight(&self, state: &ExecutionState, function: FunctionId) -> (WeightResult, f64) {
        let local_targets = self.program.function(function).returns.clone();
        if local_targets.is_empty() {
            return (WeightResult::Miss, 0.0);
        }
        let (res, weight) = self.local_weight(state, &local_targets);
        let res = if res == WeightResult::Done {
            WeightResult::Continue
        } else {
            res
        };
        (res, 0.5 + weight * 0.5)
    }

    fn try_weight(&self, state: &ExecutionState) -> (WeightResult, f64) {
        if state.stack.is_empty() {
            return (WeightResult::Miss, 0.0);
        }
        let mut block = state.current_block(&self.program);
        let mut min_call_weight = u32::MAX;
        let mut min_frame = u32::MAX;
        for (frame_index, frame) in state.stack.iter().rev().enumerate() {
            let frame_num = frame_index as u32;
            if let Some(call_weight) = self.distance_in_call_graph(frame.function, block) {
                let weighted = call_weight * 2 + frame_num;
                if weighted < min_call_weight {
                    min_call_weight = weighted;
                    min_frame = frame_num;
                }
            }
            if let Some(caller) = frame.caller {
                block = self.program.block_of(caller);
            }
        }

        let innermost_function = state.stack.last().unwrap().function;
        if min_call_weight == 0 {
            self.target_weight(state)
        } else if min_frame == 0 {
            self.pre_target_weight(state, innermost_function)
        } else if min_frame != u32::MAX {
            self.post_target_weight(state, innermost_function)
        } else {
            (WeightResult::Miss, 0.0)
        }
    }

    pub fn contains(&self, state: StateId) -> bool {
        self.states_set.contains(&state)
    }
}

impl ForwardSearcher for TargetedSearcher {
    fn select_state(&mut self, _universe: &Universe) -> StateId {
        let p = self.rng.borrow_mut().gen::<f64>();
        self.states.choose(p)
    }

    fn update(
        &mut self,
        universe: &Universe,
        current: Option<StateId>,
        added: &[StateId],
        removed: &[StateId],
    ) {
        self.reached_on_last_update.clear();

        if let Some(current) = current {
            if !removed.contains(&current) {
                match self.try_weight(universe.state(current)) {
                    (WeightResult::Continue, weight) => {
                        if self.states.contains(current) {
                            self.states.update(current, weight);
                        } else {
                            self.states.insert(current, weight);
                            self.states_set.insert(current);
                        }
                    }
                    (WeightResult::Done, _) => {
                        self.states.remove(current);
                        self.states_set.remove(&current);
                        self.reached_on_last_update.push(current);
                    }
                    (WeightResult::Miss, _) => {
                        self.states.remove(current);
                        self.states_set.remove(&current);
                    }
                }
            }
        }

        for state in added {
            match self.try_weight(universe.state(*state)) {
                (WeightResult::Continue, weight) => {
                    if !self.states.contains(*state) {
                        self.states.insert(*state, weight);
                        self.states_set.insert(*state);
                    }
                }
                (WeightResult::Done, _) => {
                    self.reached_on_last_update.push(*state);
                }
                (WeightResult::Miss, _) => {}
            }
        }

        for state in removed {
            self.states.remove(*state);
            self.states_set.remove(state);
        }
    }

    fn empty(&self) -> bool {
        self.states.is_empty()
    }

    fn name(&self) -> String {
        format!("TargetedSearcher({})", self.target)
    }
}

/// Fan-out of per-target searchers plus a base searcher, selected
/// round-robin. Targeted searchers that reached their goal or drained are
/// dropped; reached states accumulate until collected.
pub struct GuidedSearcher {
    program: Rc<Program>,
    base: Box<dyn ForwardSearcher>,
    targeted: BTreeMap<Target, TargetedSearcher>,
    rng: Rc<RefCell<StdRng>>,
    index: usize,
    reached: Vec<StateId>,
}

impl GuidedSearcher {
    pub fn new(
        program: Rc<Program>,
        base: Box<dyn ForwardSearcher>,
        rng: Rc<RefCell<StdRng>>,
    ) -> Self {
        GuidedSearcher {
            program,
            base,
            targeted: BTreeMap::new(),
            rng,
            index: 0,
            reached: Vec::new(),
        }
    }

    fn add_target(&mut self, target: Target) {
        self.targeted.insert(
            target,
            TargetedSearcher::new(self.program.clone(), target, self.rng.clone()),
        );
    }

    /// Drain the states that arrived at their targets since the last call.
    pub fn collect_and_clear_reached(&mut self) -> Vec<StateId> {
        std::mem::take(&mut self.reached)
    }
}

impl ForwardSearcher for GuidedSearcher {
    fn select_state(&mut self, universe: &Universe) -> StateId {
        let slots = self.targeted.len() + 1;
        for _ in 0..slots {
            self.index = (self.index + 1) % slots;
            if self.index == self.targeted.len() {
                if !self.base.empty() {
                    return self.base.select_state(universe);
                }
            } else {
                let target = *self.targeted.keys().nth(self.index).unwrap();
                let searcher = self.targeted.get_mut(&target).unwrap();
                if !searcher.empty() {
                    return searcher.select_state(universe);
                }
            }
        }
        panic!("select on empty guided searcher");
    }

    fn update(
        &mut self,
        universe: &Universe,
        current: Option<StateId>,
        added: &[StateId],
        removed: &[StateId],
    ) {
        let mut added_per_target: BTreeMap<Target, Vec<StateId>> = BTreeMap::new();
        let mut removed_per_target: BTreeMap<Target, Vec<StateId>> = BTreeMap::new();
        let mut touched: BTreeSet<Target> = BTreeSet::new();

        for state in added {
            for target in &universe.state(*state).targets {
                touched.insert(*target);
                added_per_target.entry(*target).or_default().push(*state);
            }
        }
        for state in removed {
            for target in &universe.state(*state).targets {
                touched.insert(*target);
                removed_per_target.entry(*target).or_default().push(*state);
            }
        }
        if let Some(current) = current {
            if universe.has_state(current) {
                for target in &universe.state(current).targets {
                    touched.insert(*target);
                }
            }
        }

        for target in touched {
            let current_for_target = current.filter(|c| {
                universe.has_state(*c) && universe.state(*c).targets.contains(&target)
            });
            if !self.targeted.contains_key(&target) {
                self.add_target(target);
            }
            let searcher = self.targeted.get_mut(&target).unwrap();
            searcher.update(
                universe,
                current_for_target,
                added_per_target.get(&target).map_or(&[], |v| v.as_slice()),
                removed_per_target.get(&target).map_or(&[], |v| v.as_slice()),
            );
            let reached_now = !searcher.reached_on_last_update.is_empty();
            self.reached.extend(searcher.reached_on_last_update.drain(..));
            if reached_now || searcher.empty() {
                self.targeted.remove(&target);
            }
        }

        self.base.update(universe, current, added, removed);
    }

    fn empty(&self) -> bool {
        self.base.empty() && self.targeted.values().all(|s| s.empty())
    }

    fn name(&self) -> String {
        format!(
            "GuidedSearcher[{} targets, base {}]",
            self.targeted.len(),
            self.base.name()
        )
    }
}

/// Keeps one selected state running for a time or instruction budget before
/// re-selecting. A budget that keeps being blown grows to fit.
pub struct BatchingSearcher {
    base: Box<dyn ForwardSearcher>,
    time_budget: Duration,
    instruction_budget: u64,
    stats: Rc<SearchStats>,
    last_state: Option<StateId>,
    last_start_time: Instant,
    last_start_instructions: u64,
}

impl BatchingSearcher {
    pub fn new(
        base: Box<dyn ForwardSearcher>,
        config: &BatchingConfig,
        stats: Rc<SearchStats>,
    ) -> Self {
        BatchingSearcher {
            base,
            time_budget: Duration::from_millis(config.time_budget_ms),
            instruction_budget: config.instruction_budget,
            stats,
            last_state: None,
            last_start_time: Instant::now(),
            last_start_instructions: 0,
        }
    }

    fn budget_exceeded(&self) -> bool {
        if !self.time_budget.is_zero() && self.last_start_time.elapsed() > self.time_budget {
            return true;
        }
        self.instruction_budget > 0
            && self.stats.instructions.get() - self.last_start_instructions
                > self.instruction_budget
    }
}

impl ForwardSearcher for BatchingSearcher {
    fn select_state(&mut self, universe: &Universe) -> StateId {
        if let Some(last) = self.last_state {
            if !self.budget_exceeded() {
                return last;
            }
            // repeatedly blowing the budget means one selection period is
            // just that long; grow to fit
            let elapsed = self.last_start_time.elapsed();
            if !self.time_budget.is_zero() && elapsed > self.time_budget.mul_f64(1.1) {
                debug!(
                    "batching: time budget grown from {:?} to {:?}",
                    self.time_budget, elapsed
                );
                self.time_budget = elapsed;
            }
        }
        let state = self.base.select_state(universe);
        self.last_state = Some(state);
        self.last_start_time = Instant::now();
        self.last_start_instructions = self.stats.instructions.get();
        state
    }

    fn update(
        &mut self,
        universe: &Universe,
        current: Option<StateId>,
        added: &[StateId],
        removed: &[StateId],
    ) {
        if let Some(last) = self.last_state {
            if removed.contains(&last) {
                self.last_state = None;
            }
        }
        self.base.update(universe, current, added, removed);
    }

    fn empty(&self) -> bool {
        self.base.empty()
    }

    fn name(&self) -> String {
        format!(
            "BatchingSearcher[{:?}/{} insts, base {}]",
            self.time_budget,
            self.instruction_budget,
            self.base.name()
        )
    }
}

/// Time-based iterative deepening: states that exceed the current budget
/// are paused; when the underlying searcher drains, the budget doubles and
/// every paused state revives.
pub struct IterativeDeepeningTimeSearcher {
    base: Box<dyn ForwardSearcher>,
    start_time: Instant,
    budget: Duration,
    paused: BTreeSet<StateId>,
}

impl IterativeDeepeningTimeSearcher {
    pub fn new(base: Box<dyn ForwardSearcher>) -> Self {
        Self::with_budget(base, Duration::from_secs(1))
    }

    pub fn with_budget(base: Box<dyn ForwardSearcher>, budget: Duration) -> Self {
        IterativeDeepeningTimeSearcher {
            base,
            start_time: Instant::now(),
            budget,
            paused: BTreeSet::new(),
        }
    }
}

impl ForwardSearcher for IterativeDeepeningTimeSearcher {
    fn select_state(&mut self, universe: &Universe) -> StateId {
        let state = self.base.select_state(universe);
        self.start_time = Instant::now();
        state
    }

    fn update(
        &mut self,
        universe: &Universe,
        current: Option<StateId>,
        added: &[StateId],
        removed: &[StateId],
    ) {
        let elapsed = self.start_time.elapsed();

        if removed.is_empty() {
            self.base.update(universe, current, added, removed);
        } else {
            // paused states are unknown to the base searcher; filter them
            let mut base_removed = removed.to_vec();
            base_removed.retain(|s| !self.paused.remove(s));
            self.base.update(universe, current, added, &base_removed);
        }

        if let Some(current) = current {
            if !removed.contains(&current) && elapsed > self.budget {
                self.paused.insert(current);
                self.base.update(universe, None, &[], &[current]);
            }
        }

        if self.base.empty() && !self.paused.is_empty() {
            self.budget *= 2;
            debug!("iterative deepening: budget doubled to {:?}", self.budget);
            let revived: Vec<StateId> = self.paused.iter().copied().collect();
            self.paused.clear();
            self.base.update(universe, None, &revived, &[]);
        }
    }

    fn empty(&self) -> bool {
        self.base.empty() && self.paused.is_empty()
    }

    fn name(&self) -> String {
        format!("IterativeDeepeningTimeSearcher[base {}]", self.base.name())
    }
}

/// Round-robin over a fixed list of independent searchers that all observe
/// the same state population.
pub struct InterleavedSearcher {
    searchers: Vec<Box<dyn ForwardSearcher>>,
    index: usize,
}

impl InterleavedSearcher {
    pub fn new(searchers: Vec<Box<dyn ForwardSearcher>>) -> Self {
        assert!(!searchers.is_empty(), "interleaving nothing");
        InterleavedSearcher {
            searchers,
            index: 0,
        }
    }
}

impl ForwardSearcher for InterleavedSearcher {
    fn select_state(&mut self, universe: &Universe) -> StateId {
        let at = self.index;
        self.index = (self.index + 1) % self.searchers.len();
        self.searchers[at].select_state(universe)
    }

    fn update(
        &mut self,
        universe: &Universe,
        current: Option<StateId>,
        added: &[StateId],
        removed: &[StateId],
    ) {
        for searcher in &mut self.searchers {
            searcher.update(universe, current, added, removed);
        }
    }

    fn empty(&self) -> bool {
        self.searchers[0].empty()
    }

    fn name(&self) -> String {
        let inner: Vec<String> = self.searchers.iter().map(|s| s.name()).collect();
        format!("InterleavedSearcher[{}]", inner.join(", "))
    }
}

/// Partitions states into two pools by a predicate and always prefers the
/// first pool. The shipped predicate separates isolated states.
pub struct BinaryRankedSearcher {
    rank: fn(&ExecutionState) -> bool,
    first: Box<dyn ForwardSearcher>,
    second: Box<dyn ForwardSearcher>,
}

pub fn isolation_rank(state: &ExecutionState) -> bool {
    state.isolated
}

impl BinaryRankedSearcher {
    pub fn new(
        rank: fn(&ExecutionState) -> bool,
        first: Box<dyn ForwardSearcher>,
        second: Box<dyn ForwardSearcher>,
    ) -> Self {
        BinaryRankedSearcher {
            rank,
            first,
            second,
        }
    }
}

impl ForwardSearcher for BinaryRankedSearcher {
    fn select_state(&mut self, universe: &Universe) -> StateId {
        if self.first.empty() {
            self.second.select_state(universe)
        } else {
            self.first.select_state(universe)
        }
    }

    fn update(
        &mut self,
        universe: &Universe,
        current: Option<StateId>,
        added: &[StateId],
        removed: &[StateId],
    ) {
        let rank = self.rank;
        let split = |ids: &[StateId]| -> (Vec<StateId>, Vec<StateId>) {
            let mut first = Vec::new();
            let mut second = Vec::new();
            for id in ids {
                if rank(universe.state(*id)) {
                    first.push(*id);
                } else {
                    second.push(*id);
                }
            }
            (first, second)
        };
        let (first_added, second_added) = split(added);
        let (first_removed, second_removed) = split(removed);
        let (first_current, second_current) = match current {
            Some(c) if universe.has_state(c) && rank(universe.state(c)) => (Some(c), None),
            Some(c) => (None, Some(c)),
            None => (None, None),
        };
        self.first
            .update(universe, first_current, &first_added, &first_removed);
        self.second
            .update(universe, second_current, &second_added, &second_removed);
    }

    fn empty(&self) -> bool {
        self.first.empty() && self.second.empty()
    }

    fn name(&self) -> String {
        format!(
            "BinaryRankedSearcher[{}, {}]",
            self.first.name(),
            self.second.name()
        )
    }
}

/// One merge rendezvous: the partners expected to arrive and those already
/// waiting.
#[derive(Debug)]
struct MergeGroup {
    id: u64,
    expected: BTreeSet<StateId>,
    arrived: BTreeSet<StateId>,
}

impl MergeGroup {
    fn complete(&self) -> bool {
        !self.expected.is_empty() && self.arrived == self.expected
    }
}

/// Pauses states waiting for a merge rendezvous. Selection releases a group
/// whose partners have all arrived; if none, the longest-waiting group with
/// any arrivals is force-released so progress never stalls.
pub struct MergingSearcher {
    base: Box<dyn ForwardSearcher>,
    paused: BTreeSet<StateId>,
    groups: Vec<MergeGroup>,
    next_group: u64,
}

impl MergingSearcher {
    pub fn new(base: Box<dyn ForwardSearcher>) -> Self {
        MergingSearcher {
            base,
            paused: BTreeSet::new(),
            groups: Vec::new(),
            next_group: 0,
        }
    }

    /// Declare a rendezvous among partner states. Returns the group handle.
    pub fn open_merge(&mut self, partners: BTreeSet<StateId>) -> u64 {
        let id = self.next_group;
        self.next_group += 1;
        self.groups.push(MergeGroup {
            id,
            expected: partners,
            arrived: BTreeSet::new(),
        });
        id
    }

    /// A partner arrived at the rendezvous: freeze it until its group is
    /// released.
    pub fn reach_rendezvous(&mut self, universe: &Universe, group: u64, state: StateId) {
        let g = self
            .groups
            .iter_mut()
            .find(|g| g.id == group)
            .unwrap_or_else(|| panic!("unknown merge group {}", group));
        assert!(
            g.expected.contains(&state),
            "{} is not a partner of merge group {}",
            state,
            group
        );
        g.arrived.insert(state);
        if self.paused.insert(state) {
            self.base.update(universe, None, &[], &[state]);
        }
    }

    fn release_group(&mut self, universe: &Universe, at: usize) -> Vec<StateId> {
        let group = self.groups.remove(at);
        let released: Vec<StateId> = group.arrived.iter().copied().collect();
        for state in &released {
            self.paused.remove(state);
        }
        self.base.update(universe, None, &released, &[]);
        released
    }

    pub fn waiting(&self) -> usize {
        self.paused.len()
    }
}

impl ForwardSearcher for MergingSearcher {
    fn select_state(&mut self, universe: &Universe) -> StateId {
        if let Some(at) = self.groups.iter().position(|g| g.complete()) {
            let released = self.release_group(universe, at);
            debug!("merge group released with {} states", released.len());
            return released[0];
        }
        if self.base.empty() {
            // nothing else can run; force the oldest waiting group
            let at = self
                .groups
                .iter()
                .position(|g| !g.arrived.is_empty())
                .expect("select on empty merging searcher");
            let released = self.release_group(universe, at);
            debug!(
                "merge rendezvous timed out, force-released {} states",
                released.len()
            );
            return released[0];
        }
        self.base.select_state(universe)
    }

    fn update(
        &mut self,
        universe: &Universe,
        current: Option<StateId>,
        added: &[StateId],
        removed: &[StateId],
    ) {
        // partners that die never arrive; forget them
        for state in removed {
            for group in &mut self.groups {
                group.expected.remove(state);
                group.arrived.remove(state);
            }
        }
        self.groups.retain(|g| !g.expected.is_empty());

        let mut base_removed = removed.to_vec();
        base_removed.retain(|s| !self.paused.remove(s));
        let current = current.filter(|c| !self.paused.contains(c));
        self.base.update(universe, current, added, &base_removed);
    }

    fn empty(&self) -> bool {
        self.base.empty() && self.paused.is_empty()
    }

    fn name(&self) -> String {
        format!("MergingSearcher[base {}]", self.base.name())
    }
}

impl ForwardSearcher for Rc<RefCell<MergingSearcher>> {
    fn select_state(&mut self, universe: &Universe) -> StateId {
        self.borrow_mut().select_state(universe)
    }

    fn update(
        &mut self,
        universe: &Universe,
        current: Option<StateId>,
        added: &[StateId],
        removed: &[StateId],
    ) {
        self.borrow_mut().update(universe, current, added, removed);
    }

    fn empty(&self) -> bool {
        self.borrow().empty()
    }

    fn name(&self) -> String {
        self.borrow().name()
    }
}

/// The constructed searcher stack, plus a handle to the merging layer when
/// one was requested (the driver needs it to open rendezvous).
pub struct SearcherStack {
    pub searcher: Box<dyn ForwardSearcher>,
    pub merging: Option<Rc<RefCell<MergingSearcher>>>,
}

fn new_searcher(
    kind: SearcherKind,
    forest: &Rc<RefCell<ForkForest>>,
    rng: &Rc<RefCell<StdRng>>,
) -> Box<dyn ForwardSearcher> {
    match kind {
        SearcherKind::Dfs => Box::new(DfsSearcher::new()),
        SearcherKind::Bfs => Box::new(BfsSearcher::new()),
        SearcherKind::RandomState => Box::new(RandomSearcher::new(rng.clone())),
        SearcherKind::RandomPath => Box::new(RandomPathSearcher::new(forest.clone(), rng.clone())),
        SearcherKind::NursDepth => {
            Box::new(WeightedRandomSearcher::new(WeightKind::Depth, rng.clone()))
        }
        SearcherKind::NursRp => Box::new(WeightedRandomSearcher::new(WeightKind::Rp, rng.clone())),
        SearcherKind::NursInstCount => Box::new(WeightedRandomSearcher::new(
            WeightKind::InstCount,
            rng.clone(),
        )),
        SearcherKind::NursCpInstCount => Box::new(WeightedRandomSearcher::new(
            WeightKind::CpInstCount,
            rng.clone(),
        )),
        SearcherKind::NursQueryCost => Box::new(WeightedRandomSearcher::new(
            WeightKind::QueryCost,
            rng.clone(),
        )),
        SearcherKind::NursMinDistToUncovered => Box::new(WeightedRandomSearcher::new(
            WeightKind::MinDistToUncovered,
            rng.clone(),
        )),
        SearcherKind::NursCovNew => Box::new(WeightedRandomSearcher::new(
            WeightKind::CoveringNew,
            rng.clone(),
        )),
    }
}

/// Build the configured searcher composition: the ordered kinds interleave,
/// then the batching, iterative-deepening and merging decorators wrap in
/// that order.
pub fn construct_forward_searcher(
    kinds: &[SearcherKind],
    config: &SearchConfig,
    forest: &Rc<RefCell<ForkForest>>,
    rng: &Rc<RefCell<StdRng>>,
    stats: &Rc<SearchStats>,
) -> SearcherStack {
    assert!(!kinds.is_empty(), "no searcher kinds configured");
    let mut searcher: Box<dyn ForwardSearcher> = if kinds.len() == 1 {
        new_searcher(kinds[0], forest, rng)
    } else {
        let inner: Vec<Box<dyn ForwardSearcher>> = kinds
            .iter()
            .map(|k| new_searcher(*k, forest, rng))
            .collect();
        Box::new(InterleavedSearcher::new(inner))
    };

    if let Some(batching) = &config.batching {
        searcher = Box::new(BatchingSearcher::new(searcher, batching, stats.clone()));
    }
    if config.iterative_deepening {
        searcher = Box::new(IterativeDeepeningTimeSearcher::new(searcher));
    }

    let mut merging = None;
    if config.enable_merging {
        let shared = Rc::new(RefCell::new(MergingSearcher::new(searcher)));
        merging = Some(shared.clone());
        searcher = Box::new(shared);
    }

    debug!("searcher composition: {}", searcher.name());
    SearcherStack { searcher, merging }
}
