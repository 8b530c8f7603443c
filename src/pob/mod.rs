// SPDX-FileCopyrightText: 2025 Ledger https://www.ledger.com - INSTITUT MINES TELECOM
//
// SPDX-License-Identifier: Apache-2.0

use crate::expr::{Constraints, ExprRef, SymVar};
use crate::program::{BlockId, InstrId, Path};
use crate::state::ExecutionState;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

static NEXT_POB_ID: AtomicU32 = AtomicU32::new(0);

/// Monotonically assigned proof-obligation identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PobId(pub u32);

impl PobId {
    pub fn fresh() -> Self {
        PobId(NEXT_POB_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Keep freshly assigned ids above everything restored from a checkpoint.
    pub fn advance_watermark(floor: u32) {
        NEXT_POB_ID.fetch_max(floor, Ordering::Relaxed);
    }
}

impl fmt::Display for PobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pob{}", self.0)
    }
}

/// A backward reachability goal: the recorded constraints must be
/// satisfiable along a path ending at `location` under the call context in
/// `stack`. Obligations form a tree as they are refined; the root is the
/// obligation reached by following parent links all the way up.
#[derive(Debug, Clone)]
pub struct ProofObligation {
    pub id: PobId,
    pub location: BlockId,
    pub constraints: Constraints,
    /// Call-site instructions identifying the calling chain, innermost first.
    pub stack: Vec<InstrId>,
    /// The block trace from this obligation's location toward its parent's.
    pub path: Path,
    pub root: PobId,
    pub parent: Option<PobId>,
    pub children: BTreeSet<PobId>,
    pub symbolics: BTreeSet<SymVar>,
}

impl ProofObligation {
    /// A root obligation: its own id is the root of its (so far singleton)
    /// tree.
    pub fn new_root(location: BlockId) -> Self {
        let id = PobId::fresh();
        ProofObligation {
            id,
            location,
            constraints: Constraints::new(),
            stack: Vec::new(),
            path: Path::new(vec![location]),
            root: id,
            parent: None,
            children: BTreeSet::new(),
            symbolics: BTreeSet::new(),
        }
    }

    /// A refinement of `parent` pushed back to `location` along `path`.
    /// The caller registers the child id in the parent's children set when
    /// it owns both (the object manager does this on commit).
    pub fn derive(parent: &ProofObligation, location: BlockId, path: Path) -> Self {
        ProofObligation {
            id: PobId::fresh(),
            location,
            constraints: parent.constraints.clone(),
            stack: parent.stack.clone(),
            path,
            root: parent.root,
            parent: Some(parent.id),
            children: BTreeSet::new(),
            symbolics: parent.symbolics.clone(),
        }
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    pub fn push_call_context(&mut self, call_site: InstrId) {
        self.stack.push(call_site);
    }
}

impl fmt::Display for ProofObligation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} at {} (root {}, {} constraints)",
            self.id,
            self.location,
            self.root,
            self.constraints.len()
        )
    }
}

/// A non-owning pairing of one execution state and one proof obligation
/// whose program point, call context and path segment are compatible. The
/// unit of work for a backward step; derived, never authoritative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Propagation {
    pub state: crate::state::StateId,
    pub pob: PobId,
}

impl fmt::Display for Propagation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.state, self.pob)
    }
}

/// Call-context compatibility: walking both stacks from the innermost
/// frame, the state contributes each frame's call-site instruction and the
/// obligation contributes its recorded entries; over the comparable range
/// all pairs must agree. An empty state stack matches trivially.
pub fn check_stack(state: &ExecutionState, pob: &ProofObligation) -> bool {
    if state.stack.is_empty() {
        return true;
    }
    let range = std::cmp::min(state.stack.len() - 1, pob.stack.len());
    for i in 0..range {
        let frame = &state.stack[state.stack.len() - 1 - i];
        if frame.caller != Some(pob.stack[i]) {
            return false;
        }
    }
    true
}

/// A proven "this path cannot reach the target under these constraints"
/// fact, reused to prune identical future obligations. Indexed by the
/// object manager both by terminal location and by full path.
#[derive(Debug, Clone)]
pub struct Lemma {
    pub path: Path,
    pub constraints: Vec<ExprRef>,
}

impl Lemma {
    pub fn new(path: Path, constraints: Vec<ExprRef>) -> Self {
        Lemma { path, constraints }
    }

    pub fn terminal_location(&self) -> Option<BlockId> {
        self.path.final_block()
    }

    /// Does this lemma prove the given obligation redundant? The path must
    /// be identical and the constraint sets equal as sets.
    pub fn subsumes(&self, pob: &ProofObligation) -> bool {
        if self.path != pob.path {
            return false;
        }
        if self.constraints.len() != pob.constraints.len() {
            return false;
        }
        self.constraints.iter().all(|e| pob.constraints.contains(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::{BlockKind, Program};

    fn two_function_program() -> (Program, crate::program::FunctionId, crate::program::FunctionId) {
        let mut p = Program::new();
        let f = p.add_function("f", 2);
        let g = p.add_function("g", 2);
        p.add_block(f, BlockKind::Basic, 2);
        p.add_block(g, BlockKind::Basic, 2);
        (p, f, g)
    }

    #[test]
    fn empty_state_stack_matches_any_context() {
        let (p, f, _) = two_function_program();
        let mut state = ExecutionState::new(&p, f);
        state.stack.clear();
        let mut pob = ProofObligation::new_root(p.entry_block(f));
        pob.push_call_context(InstrId(40));
        assert!(check_stack(&state, &pob));
    }

    #[test]
    fn innermost_caller_must_agree() {
        let (p, f, g) = two_function_program();
        let call_site_f = p.entry_instruction(f);
        let call_site_g = p.entry_instruction(g);

        // state whose innermost frame was entered from f's call site
        let mut state = ExecutionState::new(&p, f);
        state.push_frame(Some(call_site_f), g, 2);

        let mut pob = ProofObligation::new_root(p.entry_block(g));
        pob.push_call_context(call_site_f);
        assert!(check_stack(&state, &pob));

        let mut wrong = ProofObligation::new_root(p.entry_block(g));
        wrong.push_call_context(call_site_g);
        assert!(!check_stack(&state, &wrong));
    }

    #[test]
    fn comparison_stops_at_the_shorter_side() {
        let (p, f, g) = two_function_program();
        let call_site = p.entry_instruction(f);

        let mut state = ExecutionState::new(&p, f);
        state.push_frame(Some(call_site), g, 2);

        // obligation records a deeper context than the state has frames;
        // only the comparable range is checked
        let mut pob = ProofObligation::new_root(p.entry_block(g));
        pob.push_call_context(call_site);
        pob.push_call_context(InstrId(99));
        pob.push_call_context(InstrId(100));
        assert!(check_stack(&state, &pob));
    }

    #[test]
    fn lemma_subsumption_requires_identical_path_and_constraints() {
        let (p, f, _) = two_function_program();
        let entry = p.entry_block(f);
        let mut pob = ProofObligation::new_root(entry);
        let x = crate::expr::Expr::var("x", 64);
        pob.symbolics.insert(SymVar::new("x", 64));
        pob.constraints.insert(x.clone(), None);

        let lemma = Lemma::new(Path::new(vec![entry]), vec![x]);
        assert!(lemma.subsumes(&pob));

        let other = Lemma::new(Path::new(vec![entry]), vec![crate::expr::Expr::var("y", 1)]);
        assert!(!other.subsumes(&pob));
    }
}
