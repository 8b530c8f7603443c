// SPDX-FileCopyrightText: 2025 Ledger https://www.ledger.com - INSTITUT MINES TELECOM
//
// SPDX-License-Identifier: Apache-2.0

pub mod action;

pub use action::{
    ActionKind, ActionResult, BackwardResult, BidirectionalAction, BranchResult, Conflict,
    ForwardResult, InitializeResult, ReachedResult, TargetedConflict, TerminateResult,
};

use crate::config::SearchConfig;
use crate::expr::Satisfiability;
use crate::pob::{check_stack, Lemma, PobId, ProofObligation, Propagation};
use crate::program::{Program, Target};
use crate::state::{ExecutionState, StateId};
use log::debug;
use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;

/// Receives every action result before the diff commits. Components must
/// drop references to removed entities inside these callbacks; that is the
/// only place removal is observable before the entities are destroyed.
pub trait Subscriber {
    fn update(&mut self, universe: &Universe, result: &ActionResult);

    fn close_proof_obligation(&mut self, _universe: &Universe, _pob: PobId) {}

    fn add_root(&mut self, _universe: &Universe, _state: StateId) {}
}

/// The canonical collections. The object manager is the sole owner; every
/// other component holds ids into these maps and resolves them on demand.
#[derive(Debug, Default)]
pub struct Universe {
    pub(crate) arena: BTreeMap<StateId, ExecutionState>,
    /// Main forward sweep membership.
    pub states: BTreeSet<StateId>,
    /// Isolated (backward-seeded) membership.
    pub isolated_states: BTreeSet<StateId>,
    pub pobs: BTreeMap<PobId, ProofObligation>,
    pub propagations: Vec<Propagation>,
    /// States that arrived at a target; candidates for backward pairing.
    pub reached: BTreeSet<StateId>,
    pub lemmas: Vec<Lemma>,
}

impl Universe {
    pub fn state(&self, id: StateId) -> &ExecutionState {
        self.arena
            .get(&id)
            .unwrap_or_else(|| panic!("unknown state {}", id))
    }

    pub fn state_mut(&mut self, id: StateId) -> &mut ExecutionState {
        self.arena
            .get_mut(&id)
            .unwrap_or_else(|| panic!("unknown state {}", id))
    }

    pub fn try_state(&self, id: StateId) -> Option<&ExecutionState> {
        self.arena.get(&id)
    }

    pub fn has_state(&self, id: StateId) -> bool {
        self.arena.contains_key(&id)
    }

    pub fn pob(&self, id: PobId) -> &ProofObligation {
        self.pobs
            .get(&id)
            .unwrap_or_else(|| panic!("unknown proof obligation {}", id))
    }

    pub fn try_pob(&self, id: PobId) -> Option<&ProofObligation> {
        self.pobs.get(&id)
    }

    pub fn live_states(&self) -> impl Iterator<Item = &ExecutionState> {
        self.arena.values()
    }

    /// Insert a state into the arena without set membership; membership is
    /// decided by the commit that references it. Standalone searcher tests
    /// populate a universe this way.
    pub fn insert_state(&mut self, state: ExecutionState) -> StateId {
        let id = state.id;
        self.arena.insert(id, state);
        id
    }
}

/// Owns the canonical sets and applies one action at a time: record the
/// action, produce propagations, build the result, broadcast it to the two
/// subscriber tiers, then commit the diff. Commit-phase inconsistencies are
/// scheduler bugs and abort the run with context.
pub struct ObjectManager {
    program: Rc<Program>,
    pub universe: Universe,
    subscribers: Vec<Rc<RefCell<dyn Subscriber>>>,
    subscribers_after_all: Vec<Rc<RefCell<dyn Subscriber>>>,

    action: Option<BidirectionalAction>,
    targeted_conflict: Option<TargetedConflict>,
    added_states: Vec<StateId>,
    removed_states: Vec<StateId>,
    added_pobs: Vec<PobId>,
    added_propagations: Vec<Propagation>,
    removed_propagations: Vec<Propagation>,
    result: Option<ActionResult>,

    initial_state: Option<ExecutionState>,
    empty_state: Option<ExecutionState>,

    rewrite_equalities: bool,
    max_propagations: u32,
    replay_from_pob: bool,
}

impl ObjectManager {
    pub fn new(program: Rc<Program>, config: &SearchConfig) -> Self {
        ObjectManager {
            program,
            universe: Universe::default(),
            subscribers: Vec::new(),
            subscribers_after_all: Vec::new(),
            action: None,
            targeted_conflict: None,
            added_states: Vec::new(),
            removed_states: Vec::new(),
            added_pobs: Vec::new(),
            added_propagations: Vec::new(),
            removed_propagations: Vec::new(),
            result: None,
            initial_state: None,
            empty_state: None,
            rewrite_equalities: config.rewrite_equalities,
            max_propagations: config.max_propagations,
            replay_from_pob: config.replay_state_from_pob,
        }
    }

    pub fn program(&self) -> &Rc<Program> {
        &self.program
    }

    pub fn subscribe(&mut self, s: Rc<RefCell<dyn Subscriber>>) {
        self.subscribers.push(s);
    }

    /// Late tier: notified after every primary subscriber has reacted.
    pub fn subscribe_after_all(&mut self, s: Rc<RefCell<dyn Subscriber>>) {
        self.subscribers_after_all.push(s);
    }

    /// Remember the run's entry state: a pristine copy for replays plus an
    /// "empty" template (no stack, isolated) marking the program entry that
    /// closes proof obligations.
    pub fn set_initial_and_empty_state(&mut self, state: &ExecutionState) {
        self.initial_state = Some(state.copy());
        let mut empty = state.copy();
        empty.stack.clear();
        empty.isolated = true;
        self.empty_state = Some(empty);
    }

    /// Insert a bootstrap state outside the action cycle and announce it as
    /// a fork-tree root.
    pub fn seed(&mut self, state: ExecutionState) -> StateId {
        let id = state.id;
        let isolated = state.isolated;
        self.universe.arena.insert(id, state);
        self.broadcast_add_root(id);
        let result = if isolated {
            ActionResult::Branch(BranchResult {
                current: None,
                added: vec![id],
                removed: Vec::new(),
                added_propagations: Vec::new(),
                removed_propagations: Vec::new(),
            })
        } else {
            ActionResult::Forward(ForwardResult {
                current: None,
                added: vec![id],
                removed: Vec::new(),
                targeted_conflict: None,
                added_propagations: Vec::new(),
                removed_propagations: Vec::new(),
            })
        };
        self.broadcast_and_commit(result);
        id
    }

    // --- the per-cycle contract -------------------------------------------

    pub fn set_action(&mut self, action: BidirectionalAction) {
        assert!(
            self.action.is_none(),
            "action {} set while {} is still uncommitted",
            action.kind(),
            self.action.as_ref().unwrap().kind()
        );
        self.action = Some(action);
    }

    pub fn set_targeted_conflict(&mut self, conflict: TargetedConflict) {
        self.targeted_conflict = Some(conflict);
    }

    /// Record a state produced by the current step. Commit decides the
    /// destination set from the result kind.
    pub fn add_state(&mut self, state: ExecutionState) -> StateId {
        let id = state.id;
        self.universe.arena.insert(id, state);
        self.added_states.push(id);
        id
    }

    /// Flag a state for removal. Rewinds its pc to the last executed
    /// instruction, mirroring that the in-flight instruction never retired.
    pub fn remove_state(&mut self, id: StateId) -> bool {
        if self.removed_states.contains(&id) {
            return false;
        }
        let state = self.universe.state_mut(id);
        state.pc = state.prev_pc;
        self.removed_states.push(id);
        true
    }

    /// Record a new proof obligation within the current cycle. Returns None
    /// when a stored lemma already proves it redundant.
    pub fn add_pob(&mut self, pob: ProofObligation) -> Option<PobId> {
        let id = self.insert_pob_checked(pob)?;
        self.added_pobs.push(id);
        Some(id)
    }

    /// Insert a root obligation outside the action cycle (startup targets,
    /// checkpoint restore).
    pub fn seed_pob(&mut self, pob: ProofObligation) -> Option<PobId> {
        self.insert_pob_checked(pob)
    }

    /// Lemma pruning plus the tree invariants; violating the latter is a
    /// composition bug.
    fn insert_pob_checked(&mut self, pob: ProofObligation) -> Option<PobId> {
        if let Some(lemma) = self.universe.lemmas.iter().find(|l| l.subsumes(&pob)) {
            debug!(
                "{} at {} subsumed by lemma over path {}",
                pob.id, pob.location, lemma.path
            );
            return None;
        }
        assert_eq!(
            pob.path.initial_block(),
            Some(pob.location),
            "{}: path must start at the obligation's location",
            pob.id
        );
        if let Some(parent) = pob.parent {
            let parent_pob = self.universe.pob(parent);
            assert_eq!(
                pob.path.final_block(),
                Some(parent_pob.location),
                "{}: path must chain into parent {} at {}",
                pob.id,
                parent,
                parent_pob.location
            );
            assert_eq!(pob.root, parent_pob.root, "{}: root mismatch", pob.id);
        }
        let id = pob.id;
        self.universe.pobs.insert(id, pob);
        Some(id)
    }

    pub fn add_lemma(&mut self, lemma: Lemma) {
        // sweep obligations the new fact already answers
        let subsumed: Vec<PobId> = self
            .universe
            .pobs
            .values()
            .filter(|p| lemma.subsumes(p))
            .map(|p| p.id)
            .collect();
        self.universe.lemmas.push(lemma);
        for id in subsumed {
            debug!("{} subsumed by new lemma", id);
            self.discard_pob(id);
        }
    }

    /// Apply the propagation production rule, scoped to the current action
    /// kind. Re-running it for the same unchanged action adds nothing.
    pub fn create_propagations(&mut self) {
        let action = self
            .action
            .clone()
            .expect("create_propagations called with no action set");
        match &action {
            BidirectionalAction::Forward { state } | BidirectionalAction::Branch { state } => {
                let mut candidates: Vec<StateId> = Vec::new();
                if !self.removed_states.contains(state) && self.universe.has_state(*state) {
                    candidates.push(*state);
                }
                candidates.extend(self.added_states.iter().copied());
                let pob_ids: Vec<PobId> = self.universe.pobs.keys().copied().collect();
                for sid in candidates {
                    for pid in &pob_ids {
                        self.try_propagation(sid, *pid);
                    }
                }
            }
            BidirectionalAction::Backward { .. } => {
                let reached: Vec<StateId> = self.universe.reached.iter().copied().collect();
                for pid in self.added_pobs.clone() {
                    for sid in &reached {
                        self.try_propagation(*sid, pid);
                    }
                }
            }
            BidirectionalAction::ReachedStates { states } => {
                let pob_ids: Vec<PobId> = self.universe.pobs.keys().copied().collect();
                for sid in states.clone() {
                    for pid in &pob_ids {
                        self.try_propagation(sid, *pid);
                    }
                }
            }
            BidirectionalAction::Initialize { .. } | BidirectionalAction::Terminate => {}
        }

        // every propagation whose state dies this cycle dies with it
        for sid in &self.removed_states {
            for p in self
                .universe
                .propagations
                .iter()
                .filter(|p| p.state == *sid)
            {
                if !self.removed_propagations.contains(p) {
                    self.removed_propagations.push(*p);
                }
            }
        }
    }

    fn try_propagation(&mut self, sid: StateId, pid: PobId) {
        let state = self.universe.state(sid);
        let pob = self.universe.pob(pid);
        if state.current_block(&self.program) != pob.location {
            return;
        }
        if !check_stack(state, pob) {
            return;
        }
        if state.path.final_block() != pob.path.initial_block() {
            return;
        }
        if state.propagation_count.get(&pid).copied().unwrap_or(0) >= self.max_propagations {
            return;
        }
        let p = Propagation {
            state: sid,
            pob: pid,
        };
        if self.universe.propagations.contains(&p) || self.added_propagations.contains(&p) {
            return;
        }
        debug!("new propagation {}", p);
        self.added_propagations.push(p);
    }

    /// Build the result matching the recorded action, carrying this cycle's
    /// diff of states, obligations and propagations.
    pub fn set_result(&mut self) {
        let action = self
            .action
            .clone()
            .expect("set_result called with no action set");
        let result = match action {
            BidirectionalAction::Forward { state } => ActionResult::Forward(ForwardResult {
                current: Some(state),
                added: self.added_states.clone(),
                removed: self.removed_states.clone(),
                targeted_conflict: self.targeted_conflict.take(),
                added_propagations: self.added_propagations.clone(),
                removed_propagations: self.removed_propagations.clone(),
            }),
            BidirectionalAction::Branch { state } => ActionResult::Branch(BranchResult {
                current: Some(state),
                added: self.added_states.clone(),
                removed: self.removed_states.clone(),
                added_propagations: self.added_propagations.clone(),
                removed_propagations: self.removed_propagations.clone(),
            }),
            BidirectionalAction::Backward { pob, .. } => ActionResult::Backward(BackwardResult {
                new_pobs: self.added_pobs.clone(),
                old_pob: pob,
                added_propagations: self.added_propagations.clone(),
                removed_propagations: self.removed_propagations.clone(),
            }),
            BidirectionalAction::Initialize { location, .. } => {
                assert_eq!(
                    self.added_states.len(),
                    1,
                    "initialize must add exactly one state, got {}",
                    self.added_states.len()
                );
                ActionResult::Initialize(InitializeResult {
                    location,
                    state: self.added_states[0],
                })
            }
            BidirectionalAction::ReachedStates { states } => ActionResult::Reached(ReachedResult {
                reached: states,
                added_propagations: self.added_propagations.clone(),
            }),
            BidirectionalAction::Terminate => ActionResult::Terminate(TerminateResult),
        };
        self.result = Some(result);
    }

    /// Broadcast the result to both subscriber tiers, then commit the diff
    /// into the canonical sets. Returns the result for the driver.
    pub fn update_result(&mut self) -> ActionResult {
        let result = self
            .result
            .take()
            .expect("update_result called before set_result");
        let result = self.broadcast_and_commit(result);
        self.action = None;
        self.added_states.clear();
        self.removed_states.clear();
        self.added_pobs.clear();
        self.added_propagations.clear();
        self.removed_propagations.clear();
        result
    }

    /// Replay a synthetic population result; checkpoint restore uses this
    /// to rebuild subscriber indices.
    pub(crate) fn broadcast_restored(&mut self, result: ActionResult) {
        self.broadcast_and_commit(result);
    }

    fn broadcast_and_commit(&mut self, result: ActionResult) -> ActionResult {
        let primary: Vec<_> = self.subscribers.to_vec();
        let late: Vec<_> = self.subscribers_after_all.to_vec();
        for s in primary {
            s.borrow_mut().update(&self.universe, &result);
        }
        for s in late {
            s.borrow_mut().update(&self.universe, &result);
        }
        self.commit(&result);
        result
    }

    fn commit(&mut self, result: &ActionResult) {
        match result {
            ActionResult::Forward(r) => {
                for id in &r.added {
                    assert!(
                        self.universe.has_state(*id),
                        "commit(forward): added state {} not alive",
                        id
                    );
                    self.universe.states.insert(*id);
                }
                for id in &r.removed {
                    self.destroy_state(*id, "forward");
                }
            }
            ActionResult::Branch(r) => {
                for id in &r.added {
                    assert!(
                        self.universe.has_state(*id),
                        "commit(branch): added state {} not alive",
                        id
                    );
                    self.universe.isolated_states.insert(*id);
                }
                for id in &r.removed {
                    self.destroy_state(*id, "branch");
                }
            }
            ActionResult::Backward(r) => {
                for id in &r.new_pobs {
                    let parent = self.universe.pob(*id).parent;
                    if let Some(parent) = parent {
                        self.universe
                            .pobs
                            .get_mut(&parent)
                            .unwrap_or_else(|| {
                                panic!("commit(backward): {} has dead parent {}", id, parent)
                            })
                            .children
                            .insert(*id);
                    }
                }
            }
            ActionResult::Initialize(r) => {
                assert!(
                    self.universe.has_state(r.state),
                    "commit(initialize): state {} not alive",
                    r.state
                );
                self.universe.isolated_states.insert(r.state);
            }
            ActionResult::Reached(r) => {
                for id in &r.reached {
                    assert!(
                        self.universe.has_state(*id),
                        "commit(reached): state {} not alive",
                        id
                    );
                    self.universe.reached.insert(*id);
                }
            }
            ActionResult::Terminate(_) => {}
        }

        for p in result.added_propagations() {
            assert!(
                !self.universe.propagations.contains(p),
                "commit: duplicate propagation {}",
                p
            );
            self.universe.propagations.push(*p);
        }
        for p in result.removed_propagations() {
            let position = self
                .universe
                .propagations
                .iter()
                .position(|q| q == p)
                .unwrap_or_else(|| panic!("commit: removed propagation {} not present", p));
            self.universe.propagations.remove(position);
        }
    }

    fn destroy_state(&mut self, id: StateId, phase: &str) {
        let in_states = self.universe.states.remove(&id);
        let in_isolated = self.universe.isolated_states.remove(&id);
        assert!(
            in_states || in_isolated,
            "commit({}): removed state {} was in no canonical set",
            phase,
            id
        );
        self.universe.reached.remove(&id);
        self.universe
            .arena
            .remove(&id)
            .unwrap_or_else(|| panic!("commit({}): removed state {} not alive", phase, id));
    }

    // --- obligation closing -----------------------------------------------

    /// After a backward cycle, close every new obligation that reached the
    /// program entry: optionally replay a state from it, notify subscribers,
    /// and detach it from its tree.
    pub fn close_proof_obligations(&mut self, result: &ActionResult) -> Vec<PobId> {
        let ActionResult::Backward(r) = result else {
            return Vec::new();
        };
        let empty_init = self
            .empty_state
            .as_ref()
            .expect("initial and empty states must be set before backward steps")
            .init_pc;
        let mut closed = Vec::new();
        for id in &r.new_pobs {
            let Some(pob) = self.universe.try_pob(*id) else {
                continue;
            };
            let first_instr = self.program.block(pob.location).first_instruction();
            if first_instr != empty_init {
                continue;
            }
            if self.replay_from_pob {
                self.replay_state_from_pob(*id);
            }
            let primary: Vec<_> = self.subscribers.to_vec();
            let late: Vec<_> = self.subscribers_after_all.to_vec();
            for s in primary {
                s.borrow_mut().close_proof_obligation(&self.universe, *id);
            }
            for s in late {
                s.borrow_mut().close_proof_obligation(&self.universe, *id);
            }
            self.discard_pob(*id);
            closed.push(*id);
        }
        closed
    }

    /// Replay the pristine initial state under an obligation's constraints,
    /// targeting the obligation tree's root. The replay joins the main
    /// forward sweep through a synthetic forward result.
    fn replay_state_from_pob(&mut self, pob_id: PobId) {
        let pob = self.universe.pob(pob_id).clone();
        let mut replay = self
            .initial_state
            .as_ref()
            .expect("initial state must be set before replay")
            .copy();
        for var in &pob.symbolics {
            replay.add_symbolic(var.clone());
        }
        let mut feasible = true;
        for e in pob.constraints.iter() {
            let sat = replay.add_constraint(
                e.clone(),
                pob.constraints.location_of(e),
                self.rewrite_equalities,
            );
            if sat == Satisfiability::Unsatisfiable {
                feasible = false;
            }
        }
        if !feasible {
            debug!("replay from {} infeasible, dropped", pob_id);
            return;
        }
        let root_location = self.universe.pob(pob.root).location;
        replay.targets.insert(Target::new(root_location));

        let id = replay.id;
        debug!("replaying {} from {}", id, pob_id);
        self.universe.arena.insert(id, replay);
        self.broadcast_add_root(id);
        let result = ActionResult::Forward(ForwardResult {
            current: None,
            added: vec![id],
            removed: Vec::new(),
            targeted_conflict: None,
            added_propagations: Vec::new(),
            removed_propagations: Vec::new(),
        });
        self.broadcast_and_commit(result);
    }

    /// Remove an obligation with parent-detachment and drop its
    /// propagations. Children keep their parent id recorded but the tree no
    /// longer reaches them from above; they are answered separately.
    fn discard_pob(&mut self, id: PobId) {
        let parent = match self.universe.pobs.remove(&id) {
            Some(pob) => pob.parent,
            None => panic!("discarding unknown proof obligation {}", id),
        };
        if let Some(parent) = parent {
            if let Some(parent_pob) = self.universe.pobs.get_mut(&parent) {
                parent_pob.children.remove(&id);
            }
        }
        self.universe.propagations.retain(|p| p.pob != id);
    }

    fn broadcast_add_root(&mut self, id: StateId) {
        let primary: Vec<_> = self.subscribers.to_vec();
        let late: Vec<_> = self.subscribers_after_all.to_vec();
        for s in primary {
            s.borrow_mut().add_root(&self.universe, id);
        }
        for s in late {
            s.borrow_mut().add_root(&self.universe, id);
        }
    }

    // --- queries ----------------------------------------------------------

    pub fn empty_states(&self) -> bool {
        self.universe.states.is_empty()
    }

    pub fn empty_isolated_states(&self) -> bool {
        self.universe.isolated_states.is_empty()
    }

    pub fn size_states(&self) -> usize {
        self.universe.states.len()
    }

    pub fn empty_pobs(&self) -> bool {
        self.universe.pobs.is_empty()
    }

    /// Bump the attempt counter for a propagation pair about to be tried.
    pub fn note_propagation_attempt(&mut self, state: StateId, pob: PobId) {
        let counter = self
            .universe
            .state_mut(state)
            .propagation_count
            .entry(pob)
            .or_insert(0);
        *counter += 1;
    }
}
