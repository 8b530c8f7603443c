// SPDX-FileCopyrightText: 2025 Ledger https://www.ledger.com - INSTITUT MINES TELECOM
//
// SPDX-License-Identifier: Apache-2.0

use std::rc::Rc;
use svarog::config::SearchConfig;
use svarog::manager::{BidirectionalAction, ObjectManager};
use svarog::pob::{ProofObligation, Propagation};
use svarog::program::{BlockId, BlockKind, Callee, FunctionId, Path, Program};
use svarog::state::ExecutionState;

fn line_program() -> (Rc<Program>, FunctionId, BlockId, BlockId) {
    let mut p = Program::new();
    let f = p.add_function("main", 2);
    let entry = p.add_block(f, BlockKind::Basic, 1);
    let exit = p.add_block(f, BlockKind::Return, 1);
    p.add_edge(entry, exit);
    (Rc::new(p), f, entry, exit)
}

fn manager_for(program: &Rc<Program>) -> ObjectManager {
    ObjectManager::new(program.clone(), &SearchConfig::default())
}

fn run_forward_cycle(manager: &mut ObjectManager, state: svarog::state::StateId) -> Vec<Propagation> {
    manager.set_action(BidirectionalAction::Forward { state });
    manager.create_propagations();
    manager.set_result();
    let result = manager.update_result();
    result.added_propagations().to_vec()
}

#[test]
fn propagation_created_iff_location_and_stack_and_path_agree() {
    let (program, f, entry, exit) = line_program();
    let mut manager = manager_for(&program);

    let mut state = ExecutionState::new(&program, f);
    state.advance_to(&program, program.block(exit).first_instruction());
    let sid = manager.seed(state);

    // obligation at a different block: no propagation
    let elsewhere = ProofObligation::new_root(entry);
    let _ = manager.seed_pob(elsewhere).unwrap();
    let added = run_forward_cycle(&mut manager, sid);
    assert!(added.is_empty());

    // obligation at the state's block with a matching path start: exactly one
    let matching = ProofObligation::new_root(exit);
    let pid = manager.seed_pob(matching).unwrap();
    let added = run_forward_cycle(&mut manager, sid);
    assert_eq!(added, vec![Propagation { state: sid, pob: pid }]);
    assert_eq!(manager.universe.propagations.len(), 1);
}

#[test]
fn call_context_gates_propagation() {
    let mut p = Program::new();
    let main = p.add_function("main", 2);
    let other = p.add_function("other", 2);
    let callee = p.add_function("callee", 2);
    let m0 = p.add_block(main, BlockKind::Call(Callee::Declared(callee)), 1);
    let o0 = p.add_block(other, BlockKind::Call(Callee::Declared(callee)), 1);
    let c0 = p.add_block(callee, BlockKind::Return, 1);
    let program = Rc::new(p);
    let mut manager = manager_for(&program);

    let call_site_main = program.block(m0).first_instruction();
    let call_site_other = program.block(o0).first_instruction();

    // state entered the callee from main's call site
    let mut state = ExecutionState::new(&program, main);
    state.push_frame(Some(call_site_main), callee, 2);
    state.advance_to(&program, program.block(c0).first_instruction());
    let sid = manager.seed(state);

    // incompatible context: the obligation was discovered under `other`
    let mut wrong = ProofObligation::new_root(c0);
    wrong.push_call_context(call_site_other);
    let _ = manager.seed_pob(wrong).unwrap();
    assert!(run_forward_cycle(&mut manager, sid).is_empty());

    // compatible context: innermost caller matches
    let mut right = ProofObligation::new_root(c0);
    right.push_call_context(call_site_main);
    let pid = manager.seed_pob(right).unwrap();
    let added = run_forward_cycle(&mut manager, sid);
    assert_eq!(added, vec![Propagation { state: sid, pob: pid }]);
}

#[test]
fn create_propagations_is_idempotent() {
    let (program, f, _, exit) = line_program();
    let mut manager = manager_for(&program);

    let mut state = ExecutionState::new(&program, f);
    state.advance_to(&program, program.block(exit).first_instruction());
    let sid = manager.seed(state);
    manager.seed_pob(ProofObligation::new_root(exit)).unwrap();

    manager.set_action(BidirectionalAction::Forward { state: sid });
    manager.create_propagations();
    manager.create_propagations();
    manager.set_result();
    let result = manager.update_result();
    assert_eq!(result.added_propagations().len(), 1);
    assert_eq!(manager.universe.propagations.len(), 1);

    // a second unchanged cycle adds nothing either
    let added = run_forward_cycle(&mut manager, sid);
    assert!(added.is_empty());
    assert_eq!(manager.universe.propagations.len(), 1);
}

#[test]
fn propagations_die_with_their_state() {
    let (program, f, _, exit) = line_program();
    let mut manager = manager_for(&program);

    let mut state = ExecutionState::new(&program, f);
    state.advance_to(&program, program.block(exit).first_instruction());
    let sid = manager.seed(state);
    manager.seed_pob(ProofObligation::new_root(exit)).unwrap();
    run_forward_cycle(&mut manager, sid);
    assert_eq!(manager.universe.propagations.len(), 1);

    manager.set_action(BidirectionalAction::Forward { state: sid });
    assert!(manager.remove_state(sid));
    manager.create_propagations();
    manager.set_result();
    let result = manager.update_result();
    assert_eq!(result.removed_propagations().len(), 1);
    assert!(manager.universe.propagations.is_empty());
    assert!(!manager.universe.has_state(sid));
}

#[test]
fn attempt_cap_stops_reproduction() {
    let (program, f, _, exit) = line_program();
    let mut config = SearchConfig::default();
    config.max_propagations = 1;
    let mut manager = ObjectManager::new(program.clone(), &config);

    let mut state = ExecutionState::new(&program, f);
    state.advance_to(&program, program.block(exit).first_instruction());
    let sid = manager.seed(state);
    let pid = manager
        .seed_pob(ProofObligation::new_root(exit))
        .unwrap();

    assert_eq!(run_forward_cycle(&mut manager, sid).len(), 1);

    // the pair was tried once; with the cap at 1 it must not come back
    manager.note_propagation_attempt(sid, pid);
    manager.universe.propagations.clear();
    assert!(run_forward_cycle(&mut manager, sid).is_empty());
}

#[test]
fn lemma_subsumes_new_obligation() {
    let (program, _, _, exit) = line_program();
    let mut manager = manager_for(&program);

    let pob = ProofObligation::new_root(exit);
    let lemma = svarog::pob::Lemma::new(Path::new(vec![exit]), Vec::new());
    manager.add_lemma(lemma);
    assert!(manager.seed_pob(pob).is_none());
    assert!(manager.empty_pobs());
}
