// SPDX-FileCopyrightText: 2025 Ledger https://www.ledger.com - INSTITUT MINES TELECOM
//
// SPDX-License-Identifier: Apache-2.0

pub mod constraints;

pub use constraints::{ConstraintManager, ConstraintSet, Constraints, Satisfiability};

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::rc::Rc;

/// Reference-counted expression handle. Expressions are immutable once
/// built, so sharing subtrees across constraint sets and states is safe.
pub type ExprRef = Rc<Expr>;

/// A concrete value carried by a constant expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Value {
    Bool(bool),
    Int(u64),
}

impl Value {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            Value::Int(_) => None,
        }
    }

    pub fn as_int(&self) -> Option<u64> {
        match self {
            Value::Bool(_) => None,
            Value::Int(v) => Some(*v),
        }
    }
}

/// A named symbolic input together with its bit width.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SymVar {
    pub name: Rc<str>,
    pub width: u32,
}

impl SymVar {
    pub fn new(name: &str, width: u32) -> Self {
        SymVar {
            name: Rc::from(name),
            width,
        }
    }
}

impl fmt::Display for SymVar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum BinOp {
    And,
    Or,
    Eq,
    Ult,
    Add,
    Sub,
    Mul,
}

impl fmt::Display for BinOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BinOp::And => "and",
            BinOp::Or => "or",
            BinOp::Eq => "==",
            BinOp::Ult => "<u",
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
        };
        write!(f, "{}", s)
    }
}

/// Symbolic expression tree. The full instruction semantics live in the
/// external stepper; the core only needs the fragment that constraint
/// simplification and state merging manipulate.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Expr {
    Const(Value),
    Var(SymVar),
    Not(ExprRef),
    Binary(BinOp, ExprRef, ExprRef),
    /// `Select(cond, a, b)` is `a` when `cond` holds, `b` otherwise.
    Select(ExprRef, ExprRef, ExprRef),
}

impl Expr {
    pub fn bool_const(v: bool) -> ExprRef {
        Rc::new(Expr::Const(Value::Bool(v)))
    }

    pub fn int_const(v: u64) -> ExprRef {
        Rc::new(Expr::Const(Value::Int(v)))
    }

    pub fn var(name: &str, width: u32) -> ExprRef {
        Rc::new(Expr::Var(SymVar::new(name, width)))
    }

    pub fn not(e: ExprRef) -> ExprRef {
        match &*e {
            Expr::Const(Value::Bool(b)) => Expr::bool_const(!b),
            Expr::Not(inner) => inner.clone(),
            _ => Rc::new(Expr::Not(e)),
        }
    }

    pub fn and(a: ExprRef, b: ExprRef) -> ExprRef {
        match (&*a, &*b) {
            (Expr::Const(Value::Bool(true)), _) => b,
            (_, Expr::Const(Value::Bool(true))) => a,
            (Expr::Const(Value::Bool(false)), _) | (_, Expr::Const(Value::Bool(false))) => {
                Expr::bool_const(false)
            }
            _ if a == b => a,
            _ => Rc::new(Expr::Binary(BinOp::And, a, b)),
        }
    }

    pub fn or(a: ExprRef, b: ExprRef) -> ExprRef {
        match (&*a, &*b) {
            (Expr::Const(Value::Bool(false)), _) => b,
            (_, Expr::Const(Value::Bool(false))) => a,
            (Expr::Const(Value::Bool(true)), _) | (_, Expr::Const(Value::Bool(true))) => {
                Expr::bool_const(true)
            }
            // g \/ !g and !g \/ g collapse to true
            (_, Expr::Not(nb)) if *nb == a => Expr::bool_const(true),
            (Expr::Not(na), _) if *na == b => Expr::bool_const(true),
            _ if a == b => a,
            _ => Rc::new(Expr::Binary(BinOp::Or, a, b)),
        }
    }

    /// Equality with the constant operand canonicalized to the left, so the
    /// equality index in the constraint manager only has to look at one side.
    pub fn eq(a: ExprRef, b: ExprRef) -> ExprRef {
        match (&*a, &*b) {
            (Expr::Const(x), Expr::Const(y)) => Expr::bool_const(x == y),
            _ if a == b => Expr::bool_const(true),
            (_, Expr::Const(_)) => Rc::new(Expr::Binary(BinOp::Eq, b, a)),
            _ => Rc::new(Expr::Binary(BinOp::Eq, a, b)),
        }
    }

    pub fn ult(a: ExprRef, b: ExprRef) -> ExprRef {
        match (&*a, &*b) {
            (Expr::Const(Value::Int(x)), Expr::Const(Value::Int(y))) => Expr::bool_const(x < y),
            _ => Rc::new(Expr::Binary(BinOp::Ult, a, b)),
        }
    }

    pub fn add(a: ExprRef, b: ExprRef) -> ExprRef {
        match (&*a, &*b) {
            (Expr::Const(Value::Int(x)), Expr::Const(Value::Int(y))) => {
                Expr::int_const(x.wrapping_add(*y))
            }
            _ => Rc::new(Expr::Binary(BinOp::Add, a, b)),
        }
    }

    pub fn sub(a: ExprRef, b: ExprRef) -> ExprRef {
        match (&*a, &*b) {
            (Expr::Const(Value::Int(x)), Expr::Const(Value::Int(y))) => {
                Expr::int_const(x.wrapping_sub(*y))
            }
            _ => Rc::new(Expr::Binary(BinOp::Sub, a, b)),
        }
    }

    pub fn mul(a: ExprRef, b: ExprRef) -> ExprRef {
        match (&*a, &*b) {
            (Expr::Const(Value::Int(x)), Expr::Const(Value::Int(y))) => {
                Expr::int_const(x.wrapping_mul(*y))
            }
            _ => Rc::new(Expr::Binary(BinOp::Mul, a, b)),
        }
    }

    pub fn select(cond: ExprRef, a: ExprRef, b: ExprRef) -> ExprRef {
        match &*cond {
            Expr::Const(Value::Bool(true)) => a,
            Expr::Const(Value::Bool(false)) => b,
            _ if a == b => a,
            _ => Rc::new(Expr::Select(cond, a, b)),
        }
    }

    pub fn is_const(&self) -> bool {
        matches!(self, Expr::Const(_))
    }

    pub fn as_const_bool(&self) -> Option<bool> {
        match self {
            Expr::Const(v) => v.as_bool(),
            _ => None,
        }
    }

    pub fn is_false(&self) -> bool {
        self.as_const_bool() == Some(false)
    }

    pub fn is_true(&self) -> bool {
        self.as_const_bool() == Some(true)
    }

    /// Collect the symbolic inputs mentioned anywhere in the expression.
    pub fn free_vars(&self, out: &mut BTreeSet<SymVar>) {
        match self {
            Expr::Const(_) => {}
            Expr::Var(v) => {
                out.insert(v.clone());
            }
            Expr::Not(e) => e.free_vars(out),
            Expr::Binary(_, a, b) => {
                a.free_vars(out);
                b.free_vars(out);
            }
            Expr::Select(c, a, b) => {
                c.free_vars(out);
                a.free_vars(out);
                b.free_vars(out);
            }
        }
    }
}

/// Bottom-up substitution. Children are rebuilt through the folding
/// constructors, so replacing `x` with a constant collapses everything the
/// constant makes decidable (`y == x + 1` becomes `y == 6` under `x -> 5`).
pub fn substitute(e: &ExprRef, replacements: &HashMap<ExprRef, ExprRef>) -> ExprRef {
    if let Some(dst) = replacements.get(e) {
        return dst.clone();
    }
    let rebuilt = match &**e {
        Expr::Const(_) | Expr::Var(_) => e.clone(),
        Expr::Not(inner) => Expr::not(substitute(inner, replacements)),
        Expr::Binary(op, a, b) => {
            let a = substitute(a, replacements);
            let b = substitute(b, replacements);
            match op {
                BinOp::And => Expr::and(a, b),
                BinOp::Or => Expr::or(a, b),
                BinOp::Eq => Expr::eq(a, b),
                BinOp::Ult => Expr::ult(a, b),
                BinOp::Add => Expr::add(a, b),
                BinOp::Sub => Expr::sub(a, b),
                BinOp::Mul => Expr::mul(a, b),
            }
        }
        Expr::Select(c, a, b) => Expr::select(
            substitute(c, replacements),
            substitute(a, replacements),
            substitute(b, replacements),
        ),
    };
    match replacements.get(&rebuilt) {
        Some(dst) => dst.clone(),
        None => rebuilt,
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Const(Value::Bool(b)) => write!(f, "{}", b),
            Expr::Const(Value::Int(v)) => write!(f, "{}", v),
            Expr::Var(v) => write!(f, "{}", v),
            Expr::Not(e) => write!(f, "(not {})", e),
            Expr::Binary(op, a, b) => write!(f, "({} {} {})", a, op, b),
            Expr::Select(c, a, b) => write!(f, "(select {} {} {})", c, a, b),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_folding_in_constructors() {
        let five = Expr::int_const(5);
        let also_five = Expr::int_const(5);
        assert!(Expr::eq(five.clone(), also_five).is_true());

        let x = Expr::var("x", 64);
        assert_eq!(Expr::and(Expr::bool_const(true), x.clone()), x);
        assert!(Expr::and(Expr::bool_const(false), x.clone()).is_false());
        assert!(Expr::or(x.clone(), Expr::not(x.clone())).is_true());
        assert!(Expr::or(Expr::not(x.clone()), x.clone()).is_true());

        let g = Expr::var("g", 1);
        let sel = Expr::select(g, five.clone(), Expr::int_const(5));
        assert_eq!(sel, five);
    }

    #[test]
    fn eq_canonicalizes_constant_left() {
        let x = Expr::var("x", 64);
        let e = Expr::eq(x.clone(), Expr::int_const(7));
        match &*e {
            Expr::Binary(BinOp::Eq, l, r) => {
                assert!(l.is_const());
                assert_eq!(*r, x);
            }
            other => panic!("unexpected shape: {:?}", other),
        }
    }

    #[test]
    fn substitution_cascades_through_folding() {
        let x = Expr::var("x", 64);
        let y = Expr::var("y", 64);
        // y == x + 1 under x -> 5 must fold to y == 6
        let e = Expr::eq(y.clone(), Expr::add(x.clone(), Expr::int_const(1)));
        let mut map = HashMap::new();
        map.insert(x, Expr::int_const(5));
        let rewritten = substitute(&e, &map);
        assert_eq!(rewritten, Expr::eq(y, Expr::int_const(6)));
    }

    #[test]
    fn free_vars_walks_all_operands() {
        let e = Expr::select(
            Expr::var("g", 1),
            Expr::add(Expr::var("x", 64), Expr::int_const(1)),
            Expr::var("y", 64),
        );
        let mut vars = BTreeSet::new();
        e.free_vars(&mut vars);
        let names: Vec<&str> = vars.iter().map(|v| &*v.name).collect();
        assert_eq!(names, vec!["g", "x", "y"]);
    }
}
