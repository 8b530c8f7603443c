// SPDX-FileCopyrightText: 2025 Ledger https://www.ledger.com - INSTITUT MINES TELECOM
//
// SPDX-License-Identifier: Apache-2.0

use std::rc::Rc;
use svarog::config::SearchConfig;
use svarog::database::JsonDatabase;
use svarog::expr::{Expr, SymVar};
use svarog::manager::ObjectManager;
use svarog::pob::{Lemma, ProofObligation};
use svarog::program::{BlockId, BlockKind, FunctionId, Path, Program};
use svarog::state::ExecutionState;

fn chain_program() -> (Rc<Program>, FunctionId, Vec<BlockId>) {
    let mut p = Program::new();
    let f = p.add_function("main", 2);
    let a = p.add_block(f, BlockKind::Basic, 1);
    let b = p.add_block(f, BlockKind::Basic, 1);
    let c = p.add_block(f, BlockKind::Return, 1);
    p.add_edge(a, b);
    p.add_edge(b, c);
    (Rc::new(p), f, vec![a, b, c])
}

/// Build an obligation tree of the given depth rooted at the last block of
/// the chain, each child one block earlier, and register it with the
/// manager, links included.
fn build_pob_chain(manager: &mut ObjectManager, blocks: &[BlockId], depth: usize) -> Vec<ProofObligation> {
    let mut root = ProofObligation::new_root(blocks[blocks.len() - 1]);
    root.push_call_context(svarog::program::InstrId(17));
    let mut tree = vec![root.clone()];
    for level in 1..=depth {
        let parent = tree.last().unwrap().clone();
        let location = blocks[blocks.len() - 1 - level];
        let path = Path::new(vec![location, parent.location]);
        let child = ProofObligation::derive(&parent, location, path);
        tree.last_mut().unwrap().children.insert(child.id);
        tree.push(child);
    }
    for pob in &tree {
        manager.universe.pobs.insert(pob.id, pob.clone());
    }
    tree
}

#[test]
fn obligation_tree_round_trips_with_identical_links() {
    let (program, _, blocks) = chain_program();
    let config = SearchConfig::default();
    let mut manager = ObjectManager::new(program.clone(), &config);
    let tree = build_pob_chain(&mut manager, &blocks, 2);

    let dir = tempfile::tempdir().unwrap();
    let mut db = JsonDatabase::open(dir.path()).unwrap();
    manager.checkpoint(&mut db).unwrap();
    db.flush().unwrap();

    let mut db = JsonDatabase::open(dir.path()).unwrap();
    let mut restored = ObjectManager::new(program, &config);
    restored.restore(&mut db).unwrap();

    assert_eq!(restored.universe.pobs.len(), tree.len());
    for original in &tree {
        let reloaded = restored.universe.pob(original.id);
        assert_eq!(reloaded.parent, original.parent);
        assert_eq!(reloaded.root, original.root);
        assert_eq!(reloaded.children, original.children);
        assert_eq!(reloaded.location, original.location);
        assert_eq!(reloaded.stack, original.stack);
        assert_eq!(reloaded.path, original.path);
    }
}

#[test]
fn states_round_trip_with_constraints_and_frames() {
    let (program, f, blocks) = chain_program();
    let config = SearchConfig::default();
    let mut manager = ObjectManager::new(program.clone(), &config);

    let mut state = ExecutionState::new(&program, f);
    state.add_symbolic(SymVar::new("x", 64));
    let x = Expr::var("x", 64);
    assert!(state
        .add_constraint(Expr::eq(x, Expr::int_const(5)), None, true)
        .is_sat());
    state.advance_to(&program, program.block(blocks[1]).first_instruction());
    let sid = manager.seed(state);

    let mut isolated = ExecutionState::with_block(&program, blocks[2]);
    isolated.depth = 3;
    let iid = isolated.id;
    manager.set_action(svarog::manager::BidirectionalAction::Initialize {
        location: program.block(blocks[2]).first_instruction(),
        targets: Default::default(),
    });
    manager.add_state(isolated);
    manager.create_propagations();
    manager.set_result();
    manager.update_result();

    let dir = tempfile::tempdir().unwrap();
    let mut db = JsonDatabase::open(dir.path()).unwrap();
    manager.checkpoint(&mut db).unwrap();
    db.flush().unwrap();

    let mut db = JsonDatabase::open(dir.path()).unwrap();
    let mut restored = ObjectManager::new(program.clone(), &config);
    restored.restore(&mut db).unwrap();

    assert!(restored.universe.states.contains(&sid));
    assert!(restored.universe.isolated_states.contains(&iid));

    let state = restored.universe.state(sid);
    let original = manager.universe.state(sid);
    assert_eq!(state.constraints, original.constraints);
    assert_eq!(state.stack.len(), original.stack.len());
    assert_eq!(state.path, original.path);
    assert_eq!(state.pc, original.pc);
    assert_eq!(restored.universe.state(iid).depth, 3);

    // fresh identities allocated after a restore stay above the reloaded ones
    let fresh = ExecutionState::with_block(&program, blocks[0]);
    assert!(fresh.id > iid);
}

#[test]
fn lemmas_prune_obligations_after_restore() {
    let (program, _, blocks) = chain_program();
    let config = SearchConfig::default();
    let mut manager = ObjectManager::new(program.clone(), &config);
    manager.add_lemma(Lemma::new(Path::new(vec![blocks[2]]), Vec::new()));

    let dir = tempfile::tempdir().unwrap();
    let mut db = JsonDatabase::open(dir.path()).unwrap();
    manager.checkpoint(&mut db).unwrap();
    db.flush().unwrap();

    let mut db = JsonDatabase::open(dir.path()).unwrap();
    let mut restored = ObjectManager::new(program, &config);
    restored.restore(&mut db).unwrap();

    // the reloaded lemma still short-circuits an identical obligation
    let pob = ProofObligation::new_root(blocks[2]);
    assert!(restored.seed_pob(pob).is_none());
}
