// SPDX-FileCopyrightText: 2025 Ledger https://www.ledger.com - INSTITUT MINES TELECOM
//
// SPDX-License-Identifier: Apache-2.0

use crate::expr::{ConstraintManager, Constraints, Expr, ExprRef, Satisfiability, SymVar};
use crate::pob::PobId;
use crate::program::{BlockId, FunctionId, InstrId, Path, Program, Target};
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

static NEXT_STATE_ID: AtomicU32 = AtomicU32::new(0);

/// Monotonically assigned state identity. All orderings over states fall
/// back to this id, which makes schedules deterministic for identical input
/// sequences.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StateId(pub u32);

impl StateId {
    pub fn fresh() -> Self {
        StateId(NEXT_STATE_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Keep freshly assigned ids above everything restored from a checkpoint.
    pub fn advance_watermark(floor: u32) {
        NEXT_STATE_ID.fetch_max(floor, Ordering::Relaxed);
    }
}

impl fmt::Display for StateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "st{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectId(pub u32);

/// Byte-granular symbolic contents of one memory object, as far as the
/// merge protocol needs them. The full object model lives in the external
/// memory subsystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectState {
    pub bytes: Vec<ExprRef>,
}

impl ObjectState {
    pub fn concrete(values: &[u64]) -> Self {
        ObjectState {
            bytes: values.iter().map(|v| Expr::int_const(*v)).collect(),
        }
    }
}

/// One activation record: the instruction that made the call (None for the
/// bottom frame), the callee, and its local register file.
#[derive(Debug, Clone)]
pub struct StackFrame {
    pub caller: Option<InstrId>,
    pub function: FunctionId,
    pub locals: Vec<Option<ExprRef>>,
}

impl StackFrame {
    pub fn new(caller: Option<InstrId>, function: FunctionId, num_registers: u32) -> Self {
        StackFrame {
            caller,
            function,
            locals: vec![None; num_registers as usize],
        }
    }
}

/// A forkable unit of exploration: program counters, call stack, path
/// condition, symbolic inputs, and scheduling metadata.
#[derive(Debug, Clone)]
pub struct ExecutionState {
    pub id: StateId,
    pub init_pc: InstrId,
    pub pc: InstrId,
    pub prev_pc: InstrId,
    pub stack: Vec<StackFrame>,
    pub constraints: Constraints,
    pub symbolics: BTreeSet<SymVar>,
    pub objects: BTreeMap<ObjectId, ObjectState>,
    pub depth: u32,
    pub path: Path,
    pub targets: BTreeSet<Target>,
    /// Seeded for backward-directed exploration rather than the main sweep.
    pub isolated: bool,
    pub covered_new: bool,
    pub insts_since_cov_new: u64,
    pub stepped_instructions: u64,
    pub query_cost: f64,
    /// Static distance to the nearest uncovered code, maintained by the
    /// external coverage tracker; 0 means unknown.
    pub min_dist_to_uncovered: u64,
    /// How many times this state has been tried against each obligation.
    pub propagation_count: BTreeMap<PobId, u32>,
}

impl ExecutionState {
    /// A state positioned at a function's entry, with one bottom frame.
    pub fn new(program: &Program, function: FunctionId) -> Self {
        let entry = program.entry_block(function);
        let pc = program.block(entry).first_instruction();
        let mut state = ExecutionState::raw(pc, entry);
        state.push_frame(None, function, program.function(function).num_registers);
        state
    }

    /// An isolated state seeded at an arbitrary block, used to grow fresh
    /// forward attempts toward backward goals.
    pub fn with_block(program: &Program, block: BlockId) -> Self {
        let function = program.function_of_block(block);
        let pc = program.block(block).first_instruction();
        let mut state = ExecutionState::raw(pc, block);
        state.isolated = true;
        state.push_frame(None, function, program.function(function).num_registers);
        state
    }

    fn raw(pc: InstrId, block: BlockId) -> Self {
        ExecutionState {
            id: StateId::fresh(),
            init_pc: pc,
            pc,
            prev_pc: pc,
            stack: Vec::new(),
            constraints: Constraints::new(),
            symbolics: BTreeSet::new(),
            objects: BTreeMap::new(),
            depth: 0,
            path: Path::new(vec![block]),
            targets: BTreeSet::new(),
            isolated: false,
            covered_new: false,
            insts_since_cov_new: 0,
            stepped_instructions: 0,
            query_cost: 0.0,
            min_dist_to_uncovered: 0,
            propagation_count: BTreeMap::new(),
        }
    }

    /// A verbatim copy under a fresh identity (checkpoint replay, templates).
    pub fn copy(&self) -> Self {
        let mut copy = self.clone();
        copy.id = StateId::fresh();
        copy
    }

    /// Branch at a fork point. The call stack is deep-copied frame by frame
    /// (each register file is duplicated), the constraint history is shared
    /// by value, and coverage tracking restarts on the new branch.
    pub fn fork(&mut self) -> ExecutionState {
        self.depth += 1;
        let mut branched = self.clone();
        branched.id = StateId::fresh();
        branched.covered_new = false;
        branched.insts_since_cov_new = 0;
        branched
    }

    pub fn push_frame(&mut self, caller: Option<InstrId>, function: FunctionId, num_registers: u32) {
        self.stack
            .push(StackFrame::new(caller, function, num_registers));
    }

    pub fn pop_frame(&mut self) -> Option<StackFrame> {
        self.stack.pop()
    }

    pub fn current_block(&self, program: &Program) -> BlockId {
        program.block_of(self.pc)
    }

    pub fn prev_block(&self, program: &Program) -> BlockId {
        program.block_of(self.prev_pc)
    }

    pub fn init_block(&self, program: &Program) -> BlockId {
        program.block_of(self.init_pc)
    }

    /// Move the program counter, extending the recorded path on block
    /// transitions. The stepper drives this; tests use it directly.
    pub fn advance_to(&mut self, program: &Program, next: InstrId) {
        self.prev_pc = self.pc;
        self.pc = next;
        self.stepped_instructions += 1;
        self.insts_since_cov_new += 1;
        let next_block = program.block_of(next);
        if self.path.final_block() != Some(next_block) {
            self.path.push(next_block);
        }
    }

    pub fn add_symbolic(&mut self, var: SymVar) {
        self.symbolics.insert(var);
    }

    /// Add one constraint to the path condition. The recorded symbolic
    /// inputs must already cover the expression's variables; a gap there is
    /// a stepper bug, not a recoverable condition.
    pub fn add_constraint(
        &mut self,
        e: ExprRef,
        location: Option<InstrId>,
        rewrite_equalities: bool,
    ) -> Satisfiability {
        let mut vars = BTreeSet::new();
        e.free_vars(&mut vars);
        for v in &vars {
            assert!(
                self.symbolics.contains(v),
                "state {}: constraint mentions unregistered symbolic '{}'",
                self.id,
                v
            );
        }
        ConstraintManager::new(&mut self.constraints, rewrite_equalities).add_constraint(e, location)
    }

    pub fn set_local(&mut self, frame: usize, register: usize, value: ExprRef) {
        self.stack[frame].locals[register] = Some(value);
    }

    pub fn local(&self, frame: usize, register: usize) -> Option<&ExprRef> {
        self.stack[frame].locals[register].as_ref()
    }

    /// Try to merge `other` into `self`. Returns false (leaving `self`
    /// untouched) when the states are not at the same point, do not share
    /// symbolic inputs, have diverging call stacks, or bind different object
    /// sets. Merge is an optimization: a false here just means exploration
    /// continues as two states.
    pub fn merge(&mut self, other: &ExecutionState, rewrite_equalities: bool) -> bool {
        if self.pc != other.pc {
            return false;
        }
        if self.symbolics != other.symbolics {
            return false;
        }
        if self.stack.len() != other.stack.len() {
            return false;
        }
        for (a, b) in self.stack.iter().zip(other.stack.iter()) {
            if a.caller != b.caller || a.function != b.function {
                return false;
            }
        }
        // objects created or freed on only one side make addresses resolve
        // differently; such states must stay separate
        if !self.objects.keys().eq(other.objects.keys()) {
            return false;
        }

        let common: Vec<ExprRef> = self
            .constraints
            .iter()
            .filter(|e| other.constraints.contains(*e))
            .cloned()
            .collect();
        let a_suffix: Vec<ExprRef> = self
            .constraints
            .iter()
            .filter(|e| !other.constraints.contains(*e))
            .cloned()
            .collect();
        let b_suffix: Vec<ExprRef> = other
            .constraints
            .iter()
            .filter(|e| !self.constraints.contains(*e))
            .cloned()
            .collect();

        let mut in_a = Expr::bool_const(true);
        for e in &a_suffix {
            in_a = Expr::and(in_a, e.clone());
        }
        let mut in_b = Expr::bool_const(true);
        for e in &b_suffix {
            in_b = Expr::and(in_b, e.clone());
        }

        // rebuild the path condition first; an infeasible combination
        // abandons the merge before any register is touched
        let mut merged = Constraints::new();
        let mut sat = Satisfiability::Satisfiable;
        {
            let mut manager = ConstraintManager::new(&mut merged, rewrite_equalities);
            for e in &common {
                if !manager
                    .add_constraint(e.clone(), self.constraints.location_of(e))
                    .is_sat()
                {
                    sat = Satisfiability::Unsatisfiable;
                }
            }
            if !manager
                .add_constraint(Expr::or(in_a.clone(), in_b), None)
                .is_sat()
            {
                sat = Satisfiability::Unsatisfiable;
            }
        }
        if !sat.is_sat() {
            debug!(
                "merge of {} and {} abandoned: combined condition infeasible",
                self.id, other.id
            );
            return false;
        }

        for (frame, other_frame) in self.stack.iter_mut().zip(other.stack.iter()) {
            for (local, other_local) in frame.locals.iter_mut().zip(other_frame.locals.iter()) {
                match (local.as_ref(), other_local) {
                    (Some(av), Some(bv)) => {
                        *local = Some(Expr::select(in_a.clone(), av.clone(), bv.clone()));
                    }
                    // one side never bound this register at this pc; the
                    // merged state cannot reuse it
                    _ => {}
                }
            }
        }

        for (id, object) in self.objects.iter_mut() {
            let other_object = &other.objects[id];
            if object == other_object {
                continue;
            }
            for (byte, other_byte) in object.bytes.iter_mut().zip(other_object.bytes.iter()) {
                *byte = Expr::select(in_a.clone(), byte.clone(), other_byte.clone());
            }
        }

        self.constraints = merged;
        debug!("merged {} into {}", other.id, self.id);
        true
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} pc={} depth={} frames={}{}",
            self.id,
            self.pc,
            self.depth,
            self.stack.len(),
            if self.isolated { " isolated" } else { "" }
        )
    }
}
