// SPDX-FileCopyrightText: 2025 Ledger https://www.ledger.com - INSTITUT MINES TELECOM
//
// SPDX-License-Identifier: Apache-2.0

use crate::expr::ExprRef;
use crate::pob::{PobId, Propagation};
use crate::program::{BlockId, InstrId, Path, Target};
use crate::state::StateId;
use std::collections::BTreeSet;
use std::fmt;

/// What the scheduler decided to do next. Every variant names the entities
/// the external driver needs to act on; the driver reports back through the
/// object manager, which builds the matching result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BidirectionalAction {
    /// Step a state of the main forward sweep.
    Forward { state: StateId },
    /// Step an isolated state.
    Branch { state: StateId },
    /// Propagate an obligation backward through a compatible state.
    Backward { state: StateId, pob: PobId },
    /// Seed a fresh isolated state at a location, aimed at targets.
    Initialize {
        location: InstrId,
        targets: BTreeSet<Target>,
    },
    /// Register states that arrived at a target.
    ReachedStates { states: Vec<StateId> },
    /// Producers are exhausted; the run is over.
    Terminate,
}

impl BidirectionalAction {
    pub fn kind(&self) -> ActionKind {
        match self {
            BidirectionalAction::Forward { .. } => ActionKind::Forward,
            BidirectionalAction::Branch { .. } => ActionKind::Branch,
            BidirectionalAction::Backward { .. } => ActionKind::Backward,
            BidirectionalAction::Initialize { .. } => ActionKind::Initialize,
            BidirectionalAction::ReachedStates { .. } => ActionKind::ReachedStates,
            BidirectionalAction::Terminate => ActionKind::Terminate,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    Forward,
    Branch,
    Backward,
    Initialize,
    ReachedStates,
    Terminate,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ActionKind::Forward => "forward",
            ActionKind::Branch => "branch",
            ActionKind::Backward => "backward",
            ActionKind::Initialize => "initialize",
            ActionKind::ReachedStates => "reached-states",
            ActionKind::Terminate => "terminate",
        };
        write!(f, "{}", s)
    }
}

/// An infeasibility core discovered by the stepper: the constraints that
/// contradict each other, with their source attribution, and the path along
/// which they were collected.
#[derive(Debug, Clone)]
pub struct Conflict {
    pub path: Path,
    pub core: Vec<(ExprRef, Option<InstrId>)>,
}

/// A conflict aimed at a block the exploration failed to reach; feeds the
/// conflict-core initializer.
#[derive(Debug, Clone)]
pub struct TargetedConflict {
    pub conflict: Conflict,
    pub target: BlockId,
}

#[derive(Debug, Clone, Default)]
pub struct ForwardResult {
    pub current: Option<StateId>,
    pub added: Vec<StateId>,
    pub removed: Vec<StateId>,
    pub targeted_conflict: Option<TargetedConflict>,
    pub added_propagations: Vec<Propagation>,
    pub removed_propagations: Vec<Propagation>,
}

#[derive(Debug, Clone, Default)]
pub struct BranchResult {
    pub current: Option<StateId>,
    pub added: Vec<StateId>,
    pub removed: Vec<StateId>,
    pub added_propagations: Vec<Propagation>,
    pub removed_propagations: Vec<Propagation>,
}

#[derive(Debug, Clone)]
pub struct BackwardResult {
    pub new_pobs: Vec<PobId>,
    pub old_pob: PobId,
    pub added_propagations: Vec<Propagation>,
    pub removed_propagations: Vec<Propagation>,
}

#[derive(Debug, Clone)]
pub struct InitializeResult {
    pub location: InstrId,
    pub state: StateId,
}

#[derive(Debug, Clone, Default)]
pub struct ReachedResult {
    pub reached: Vec<StateId>,
    pub added_propagations: Vec<Propagation>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TerminateResult;

/// Broadcast to every subscriber after each action, before the diff commits.
#[derive(Debug, Clone)]
pub enum ActionResult {
    Forward(ForwardResult),
    Branch(BranchResult),
    Backward(BackwardResult),
    Initialize(InitializeResult),
    Reached(ReachedResult),
    Terminate(TerminateResult),
}

impl ActionResult {
    pub fn added_propagations(&self) -> &[Propagation] {
        match self {
            ActionResult::Forward(r) => &r.added_propagations,
            ActionResult::Branch(r) => &r.added_propagations,
            ActionResult::Backward(r) => &r.added_propagations,
            ActionResult::Reached(r) => &r.added_propagations,
            _ => &[],
        }
    }

    pub fn removed_propagations(&self) -> &[Propagation] {
        match self {
            ActionResult::Forward(r) => &r.removed_propagations,
            ActionResult::Branch(r) => &r.removed_propagations,
            ActionResult::Backward(r) => &r.removed_propagations,
            _ => &[],
        }
    }
}
