// SPDX-FileCopyrightText: 2025 Ledger https://www.ledger.com - INSTITUT MINES TELECOM
//
// SPDX-License-Identifier: Apache-2.0

use super::{substitute, BinOp, Expr, ExprRef};
use crate::program::InstrId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Outcome of adding a constraint. Infeasibility is an expected result in
/// speculative contexts (merge, replay), so it travels as a value, never as
/// a panic and never through the error channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Satisfiability {
    Satisfiable,
    Unsatisfiable,
}

impl Satisfiability {
    pub fn is_sat(&self) -> bool {
        matches!(self, Satisfiability::Satisfiable)
    }
}

/// An ordered set of constraint expressions, the shape passed to the solver.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConstraintSet {
    items: Vec<ExprRef>,
}

impl ConstraintSet {
    pub fn iter(&self) -> impl Iterator<Item = &ExprRef> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn contains(&self, e: &ExprRef) -> bool {
        self.items.contains(e)
    }

    fn push(&mut self, e: ExprRef) {
        if !self.items.contains(&e) {
            self.items.push(e);
        }
    }
}

/// A constraint set plus per-constraint source-instruction attribution.
/// Every execution state and every proof obligation owns one.
#[derive(Debug, Clone, Default)]
pub struct Constraints {
    set: ConstraintSet,
    locations: HashMap<ExprRef, Option<InstrId>>,
}

impl Constraints {
    pub fn new() -> Self {
        Constraints::default()
    }

    pub fn insert(&mut self, e: ExprRef, location: Option<InstrId>) {
        self.locations.entry(e.clone()).or_insert(location);
        self.set.push(e);
    }

    pub fn location_of(&self, e: &ExprRef) -> Option<InstrId> {
        self.locations.get(e).copied().flatten()
    }

    pub fn set(&self) -> &ConstraintSet {
        &self.set
    }

    pub fn iter(&self) -> impl Iterator<Item = &ExprRef> {
        self.set.iter()
    }

    pub fn len(&self) -> usize {
        self.set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }

    pub fn contains(&self, e: &ExprRef) -> bool {
        self.set.contains(e)
    }

    fn take(&mut self) -> (Vec<ExprRef>, HashMap<ExprRef, Option<InstrId>>) {
        let items = std::mem::take(&mut self.set.items);
        let locations = std::mem::take(&mut self.locations);
        (items, locations)
    }
}

impl PartialEq for Constraints {
    // Attribution is bookkeeping; equality is over the constraint set only.
    fn eq(&self, other: &Self) -> bool {
        self.set == other.set
    }
}

impl Eq for Constraints {}

impl fmt::Display for Constraints {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for e in self.iter() {
            writeln!(f, "{}", e)?;
        }
        Ok(())
    }
}

/// Adds constraints to a referenced set, simplifying and rewriting the
/// existing set as it goes.
pub struct ConstraintManager<'a> {
    constraints: &'a mut Constraints,
    rewrite_equalities: bool,
}

impl<'a> ConstraintManager<'a> {
    pub fn new(constraints: &'a mut Constraints, rewrite_equalities: bool) -> Self {
        ConstraintManager {
            constraints,
            rewrite_equalities,
        }
    }

    /// Simplify `e` against the equality index of `set`: every `const == x`
    /// constraint substitutes the constant for `x`, every other constraint
    /// substitutes `true` for itself.
    pub fn simplify_expr(set: &ConstraintSet, e: &ExprRef) -> ExprRef {
        if e.is_const() {
            return e.clone();
        }
        let mut equalities: HashMap<ExprRef, ExprRef> = HashMap::new();
        for c in set.iter() {
            match &**c {
                Expr::Binary(BinOp::Eq, l, r) if l.is_const() => {
                    equalities.insert(r.clone(), l.clone());
                }
                _ => {
                    equalities.insert(c.clone(), Expr::bool_const(true));
                }
            }
        }
        substitute(e, &equalities)
    }

    /// Simplify, split conjunctions, rewrite equalities, insert. Returns
    /// `Unsatisfiable` when the addition reduced to a constant `false`.
    pub fn add_constraint(&mut self, e: ExprRef, location: Option<InstrId>) -> Satisfiability {
        let simplified = Self::simplify_expr(self.constraints.set(), &e);
        let mut sat = Satisfiability::Satisfiable;
        self.add_internal(simplified, location, &mut sat);
        sat
    }

    fn add_internal(&mut self, e: ExprRef, location: Option<InstrId>, sat: &mut Satisfiability) {
        match &*e {
            Expr::Const(_) => {
                if e.is_false() {
                    *sat = Satisfiability::Unsatisfiable;
                }
                // a constant true carries no information; drop it
            }
            // split conjunctions so independence analysis and equality
            // rewriting see the finest-grained constraints
            Expr::Binary(BinOp::And, l, r) => {
                self.add_internal(l.clone(), location, sat);
                self.add_internal(r.clone(), location, sat);
            }
            Expr::Binary(BinOp::Eq, l, r) if l.is_const() => {
                if self.rewrite_equalities {
                    self.rewrite_constraints(r.clone(), l.clone(), sat);
                }
                self.constraints.insert(e, location);
            }
            _ => {
                self.constraints.insert(e, location);
            }
        }
    }

    /// Substitute `src -> dst` across the whole existing set, re-adding any
    /// changed constraint so that further reductions can fire. Fixed point
    /// is reached through the recursion in `add_internal`.
    fn rewrite_constraints(&mut self, src: ExprRef, dst: ExprRef, sat: &mut Satisfiability) -> bool {
        let mut replacements = HashMap::new();
        replacements.insert(src, dst);

        let (old_items, old_locations) = self.constraints.take();
        let mut changed = false;
        for c in old_items {
            let location = old_locations.get(&c).copied().flatten();
            let rewritten = substitute(&c, &replacements);
            if rewritten != c {
                self.add_internal(rewritten, location, sat);
                changed = true;
            } else {
                self.constraints.insert(c, location);
            }
        }
        changed
    }
}
