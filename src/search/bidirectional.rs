// SPDX-FileCopyrightText: 2025 Ledger https://www.ledger.com - INSTITUT MINES TELECOM
//
// SPDX-License-Identifier: Apache-2.0

use crate::config::SearchConfig;
use crate::fork_tree::ForkForest;
use crate::manager::{
    ActionResult, BidirectionalAction, ObjectManager, Subscriber, Universe,
};
use crate::pob::{PobId, ProofObligation};
use crate::program::Program;
use crate::search::backward::RecencyRankedSearcher;
use crate::search::forward::{
    construct_forward_searcher, ForwardSearcher, GuidedSearcher, MergingSearcher, SearchStats,
};
use crate::search::initializer::ConflictCoreInitializer;
use crate::state::StateId;
use log::{debug, info};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::cell::RefCell;
use std::collections::BTreeSet;
use std::rc::Rc;

/// Weighted round-robin over the three steppable kinds (forward, branch,
/// backward): each kind is handed out `weight` times before moving on.
#[derive(Debug)]
pub struct Ticker {
    weights: Vec<u32>,
    index: usize,
    counter: u32,
}

impl Ticker {
    pub fn new(weights: Vec<u32>) -> Self {
        assert!(
            weights.iter().any(|w| *w > 0),
            "ticker weights must not all be zero"
        );
        let mut ticker = Ticker {
            weights,
            index: 0,
            counter: 0,
        };
        // settle on the first kind with a non-zero share
        if ticker.weights[0] == 0 {
            ticker.move_on();
        }
        ticker
    }

    pub fn current(&self) -> usize {
        self.index
    }

    /// Consume one tick of the current kind's share.
    pub fn tick(&mut self) {
        self.counter += 1;
        if self.counter >= self.weights[self.index] {
            self.move_on();
        }
    }

    /// Skip to the next kind with a non-zero share.
    pub fn move_on(&mut self) {
        self.counter = 0;
        loop {
            self.index = (self.index + 1) % self.weights.len();
            if self.weights[self.index] > 0 {
                return;
            }
        }
    }
}

/// The top-level scheduler: owns the component searchers, subscribes to the
/// object manager, and decides the next action kind each cycle.
pub struct BidirectionalSearcher {
    forward: GuidedSearcher,
    branch: GuidedSearcher,
    backward: RecencyRankedSearcher,
    initializer: ConflictCoreInitializer,
    ticker: Ticker,
    pobs: BTreeSet<PobId>,
    paused_states: Vec<StateId>,
    reached_pending: Vec<StateId>,
    closed_pob_recently: bool,
    terminated: bool,
    /// Present when merging was configured; the driver opens rendezvous
    /// through this handle.
    pub merging: Option<Rc<RefCell<MergingSearcher>>>,
}

impl BidirectionalSearcher {
    pub fn new(
        program: Rc<Program>,
        config: &SearchConfig,
        forest: Rc<RefCell<ForkForest>>,
        stats: Rc<SearchStats>,
    ) -> Self {
        let rng = Rc::new(RefCell::new(StdRng::seed_from_u64(config.random_seed)));
        let forward_stack =
            construct_forward_searcher(&config.forward, config, &forest, &rng, &stats);
        let branch_stack = construct_forward_searcher(&config.branch, config, &forest, &rng, &stats);
        let forward = GuidedSearcher::new(program.clone(), forward_stack.searcher, rng.clone());
        let branch = GuidedSearcher::new(program.clone(), branch_stack.searcher, rng.clone());
        BidirectionalSearcher {
            initializer: ConflictCoreInitializer::new(program),
            forward,
            branch,
            backward: RecencyRankedSearcher::new(),
            ticker: Ticker::new(config.ticker.clone()),
            pobs: BTreeSet::new(),
            paused_states: Vec::new(),
            reached_pending: Vec::new(),
            closed_pob_recently: false,
            terminated: false,
            merging: forward_stack.merging,
        }
    }

    /// Register a root proof obligation for a reachability target. Goes
    /// through the manager so lemmas can prune it and the canonical set
    /// stays consistent.
    pub fn add_root_pob(
        &mut self,
        manager: &mut ObjectManager,
        pob: ProofObligation,
    ) -> Option<PobId> {
        let id = manager.seed_pob(pob)?;
        self.pobs.insert(id);
        self.initializer.add_pob(id);
        Some(id)
    }

    /// Decide the next action. Returns `None` once the single Terminate
    /// action has been handed out.
    pub fn select_action(&mut self, manager: &mut ObjectManager) -> Option<BidirectionalAction> {
        if self.terminated {
            return None;
        }

        if !self.reached_pending.is_empty() {
            let states = std::mem::take(&mut self.reached_pending);
            return Some(BidirectionalAction::ReachedStates { states });
        }

        // a freshly closed obligation means unreached goals want new entry
        // points before the regular rotation continues
        if self.closed_pob_recently && !self.initializer.empty() && !self.pobs.is_empty() {
            let (location, targets) = self.initializer.select_action();
            if self.initializer.empty() {
                self.closed_pob_recently = false;
            }
            return Some(BidirectionalAction::Initialize { location, targets });
        }

        let mut attempts = 0;
        while attempts < 3 {
            let kind = self.ticker.current();
            let action = match kind {
                0 if !self.forward.empty() => {
                    let state = self.forward.select_state(&manager.universe);
                    Some(BidirectionalAction::Forward { state })
                }
                1 if !self.branch.empty() => {
                    let state = self.branch.select_state(&manager.universe);
                    Some(BidirectionalAction::Branch { state })
                }
                2 if !self.backward.empty() => {
                    let (pob, state) = self.backward.select_action(&manager.universe);
                    manager.note_propagation_attempt(state, pob);
                    Some(BidirectionalAction::Backward { state, pob })
                }
                _ => None,
            };
            match action {
                Some(action) => {
                    self.ticker.tick();
                    return Some(action);
                }
                None => {
                    self.ticker.move_on();
                    attempts += 1;
                }
            }
        }

        // every searcher drained; unreached obligations can still grow new
        // isolated entries
        if !self.pobs.is_empty() && !self.initializer.empty() {
            let (location, targets) = self.initializer.select_action();
            return Some(BidirectionalAction::Initialize { location, targets });
        }

        if !self.pobs.is_empty() {
            info!(
                "terminating with {} obligation(s) unanswered",
                self.pobs.len()
            );
        }
        self.terminated = true;
        Some(BidirectionalAction::Terminate)
    }

    /// Structurally suspend a state: it leaves its searcher's candidate
    /// pool but stays owned by the object manager.
    pub fn pause_state(&mut self, universe: &Universe, state: StateId) {
        if self.paused_states.contains(&state) {
            return;
        }
        if universe.state(state).isolated {
            self.branch.update(universe, None, &[], &[state]);
        } else {
            self.forward.update(universe, None, &[], &[state]);
        }
        self.paused_states.push(state);
    }

    /// Re-insert a paused state into its searcher.
    pub fn resume_state(&mut self, universe: &Universe, state: StateId) {
        let Some(at) = self.paused_states.iter().position(|s| *s == state) else {
            return;
        };
        self.paused_states.swap_remove(at);
        if universe.state(state).isolated {
            self.branch.update(universe, None, &[state], &[]);
        } else {
            self.forward.update(universe, None, &[state], &[]);
        }
    }

    /// Paused states are unknown to the component searchers; keep them out
    /// of a removal diff and forget the ones that die.
    fn strip_paused(&mut self, removed: &[StateId]) -> Vec<StateId> {
        let mut filtered = removed.to_vec();
        filtered.retain(|s| {
            match self.paused_states.iter().position(|p| p == s) {
                Some(at) => {
                    self.paused_states.swap_remove(at);
                    false
                }
                None => true,
            }
        });
        filtered
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    pub fn pending_pobs(&self) -> usize {
        self.pobs.len()
    }
}

impl Subscriber for BidirectionalSearcher {
    fn update(&mut self, universe: &Universe, result: &ActionResult) {
        match result {
            ActionResult::Forward(r) => {
                let removed = self.strip_paused(&r.removed);
                self.forward.update(universe, r.current, &r.added, &removed);
                if let Some(conflict) = &r.targeted_conflict {
                    debug!("forward step surfaced a conflict at {}", conflict.target);
                    self.initializer
                        .add_conflict_init(&conflict.conflict, conflict.target);
                }
                self.backward
                    .update_propagations(&r.added_propagations, &r.removed_propagations);
                self.reached_pending
                    .extend(self.forward.collect_and_clear_reached());
            }
            ActionResult::Branch(r) => {
                let removed = self.strip_paused(&r.removed);
                self.branch.update(universe, r.current, &r.added, &removed);
                self.backward
                    .update_propagations(&r.added_propagations, &r.removed_propagations);
                self.reached_pending
                    .extend(self.branch.collect_and_clear_reached());
            }
            ActionResult::Backward(r) => {
                for pob in &r.new_pobs {
                    if universe.try_pob(*pob).is_some() {
                        self.pobs.insert(*pob);
                        self.initializer.add_pob(*pob);
                    }
                }
                self.backward
                    .update_propagations(&r.added_propagations, &r.removed_propagations);
            }
            ActionResult::Initialize(r) => {
                self.branch.update(universe, None, &[r.state], &[]);
            }
            ActionResult::Reached(r) => {
                self.backward.update_propagations(&r.added_propagations, &[]);
            }
            ActionResult::Terminate(_) => {}
        }
    }

    fn close_proof_obligation(&mut self, _universe: &Universe, pob: PobId) {
        debug!("obligation {} closed", pob);
        self.pobs.remove(&pob);
        self.backward.remove_pob(pob);
        self.initializer.remove_pob(pob);
        self.closed_pob_recently = true;
    }
}
