// SPDX-FileCopyrightText: 2025 Ledger https://www.ledger.com - INSTITUT MINES TELECOM
//
// SPDX-License-Identifier: Apache-2.0

//! Scheduling core of a bidirectional symbolic-execution test generator.
//!
//! Forward exploration (state stepping) and backward goal-directed
//! reasoning (proof-obligation propagation) are kept mutually consistent by
//! a single object manager that owns every canonical collection and applies
//! one action per cycle. The instruction stepper, the constraint solver,
//! the memory model and program loading are external collaborators.

pub mod config;
pub mod database;
pub mod expr;
pub mod fork_tree;
pub mod manager;
pub mod pob;
pub mod program;
pub mod search;
pub mod state;

pub use config::{SearchConfig, SearcherKind};
pub use expr::{Expr, ExprRef, Satisfiability};
pub use manager::{BidirectionalAction, ObjectManager};
pub use pob::{check_stack, ProofObligation, Propagation};
pub use search::BidirectionalSearcher;
pub use state::ExecutionState;
