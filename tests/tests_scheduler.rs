// SPDX-FileCopyrightText: 2025 Ledger https://www.ledger.com - INSTITUT MINES TELECOM
//
// SPDX-License-Identifier: Apache-2.0

use std::cell::RefCell;
use std::rc::Rc;
use svarog::config::{SearchConfig, SearcherKind};
use svarog::fork_tree::ForkForest;
use svarog::manager::{BidirectionalAction, ObjectManager, Subscriber};
use svarog::pob::ProofObligation;
use svarog::program::{BlockId, BlockKind, FunctionId, Path, Program, Target};
use svarog::search::{BidirectionalSearcher, SearchStats};
use svarog::state::ExecutionState;

struct Harness {
    program: Rc<Program>,
    function: FunctionId,
    entry: BlockId,
    exit: BlockId,
    manager: ObjectManager,
    searcher: Rc<RefCell<BidirectionalSearcher>>,
}

fn setup(config: SearchConfig) -> Harness {
    let _ = simplelog::SimpleLogger::init(
        simplelog::LevelFilter::Debug,
        simplelog::Config::default(),
    );
    let mut p = Program::new();
    let f = p.add_function("main", 2);
    let entry = p.add_block(f, BlockKind::Basic, 1);
    let exit = p.add_block(f, BlockKind::Return, 1);
    p.add_edge(entry, exit);
    let program = Rc::new(p);

    let mut manager = ObjectManager::new(program.clone(), &config);
    let forest = Rc::new(RefCell::new(ForkForest::new()));
    let stats = Rc::new(SearchStats::default());
    let searcher = Rc::new(RefCell::new(BidirectionalSearcher::new(
        program.clone(),
        &config,
        forest.clone(),
        stats,
    )));
    manager.subscribe(searcher.clone());
    manager.subscribe_after_all(forest);

    Harness {
        program,
        function: f,
        entry,
        exit,
        manager,
        searcher,
    }
}

fn dfs_config() -> SearchConfig {
    SearchConfig {
        forward: vec![SearcherKind::Dfs],
        branch: vec![SearcherKind::Dfs],
        ticker: vec![1, 1, 1],
        ..SearchConfig::default()
    }
}

#[test]
fn exhausted_run_yields_exactly_one_terminate() {
    let mut h = setup(dfs_config());
    let action = h.searcher.borrow_mut().select_action(&mut h.manager);
    assert!(matches!(action, Some(BidirectionalAction::Terminate)));
    // the terminate is final: no further actions of any kind
    assert!(h.searcher.borrow_mut().select_action(&mut h.manager).is_none());
    assert!(h.searcher.borrow().is_terminated());
}

#[test]
fn forward_step_forks_and_both_states_stay_selectable() {
    let mut h = setup(dfs_config());
    let seed = ExecutionState::new(&h.program, h.function);
    h.manager.set_initial_and_empty_state(&seed);
    let sid = h.manager.seed(seed);

    let state = match h.searcher.borrow_mut().select_action(&mut h.manager).unwrap() {
        BidirectionalAction::Forward { state } => state,
        other => panic!("expected a forward action, got {:?}", other),
    };
    assert_eq!(state, sid);

    // the driver steps the state: it forks at the branch and both sides
    // advance to the exit block
    h.manager.set_action(BidirectionalAction::Forward { state });
    let exit_instr = h.program.block(h.exit).first_instruction();
    let forked = {
        let st = h.manager.universe.state_mut(state);
        let mut forked = st.fork();
        st.advance_to(&h.program, exit_instr);
        forked.advance_to(&h.program, exit_instr);
        forked
    };
    let forked_id = h.manager.add_state(forked);
    h.manager.create_propagations();
    h.manager.set_result();
    h.manager.update_result();

    assert_eq!(h.manager.size_states(), 2);
    assert!(h.manager.universe.states.contains(&forked_id));

    // DFS must now hand out the most recently added state
    let action = h.searcher.borrow_mut().select_action(&mut h.manager).unwrap();
    assert!(matches!(
        action,
        BidirectionalAction::Forward { state } if state == forked_id
    ));
}

#[test]
fn backward_cycle_closes_entry_obligation_and_replays() {
    let mut config = dfs_config();
    config.replay_state_from_pob = true;
    let mut h = setup(config);

    let seed = ExecutionState::new(&h.program, h.function);
    h.manager.set_initial_and_empty_state(&seed);
    let sid = h.manager.seed(seed);

    // the backward goal: reach the exit block
    let root = ProofObligation::new_root(h.exit);
    let root_id = h
        .searcher
        .borrow_mut()
        .add_root_pob(&mut h.manager, root)
        .unwrap();

    // forward step: the state reaches the obligation's block, producing a
    // propagation
    let state = match h.searcher.borrow_mut().select_action(&mut h.manager).unwrap() {
        BidirectionalAction::Forward { state } => state,
        other => panic!("expected forward, got {:?}", other),
    };
    h.manager.set_action(BidirectionalAction::Forward { state });
    let exit_instr = h.program.block(h.exit).first_instruction();
    h.manager
        .universe
        .state_mut(state)
        .advance_to(&h.program, exit_instr);
    h.manager.create_propagations();
    h.manager.set_result();
    let result = h.manager.update_result();
    assert_eq!(result.added_propagations().len(), 1);

    // the rotation reaches the backward step with the produced pair
    let action = loop {
        let action = h.searcher.borrow_mut().select_action(&mut h.manager).unwrap();
        match action {
            BidirectionalAction::Backward { .. } => break action,
            BidirectionalAction::Forward { state } => {
                // nothing new: an empty forward cycle
                h.manager.set_action(BidirectionalAction::Forward { state });
                h.manager.create_propagations();
                h.manager.set_result();
                h.manager.update_result();
            }
            other => panic!("unexpected action {:?}", other),
        }
    };
    let BidirectionalAction::Backward { state, pob } = action else {
        unreachable!();
    };
    assert_eq!(state, sid);
    assert_eq!(pob, root_id);
    assert_eq!(
        h.manager
            .universe
            .state(state)
            .propagation_count
            .get(&root_id),
        Some(&1)
    );

    // the backward composition pushes the obligation to the program entry
    let child = {
        let parent = h.manager.universe.pob(pob).clone();
        ProofObligation::derive(&parent, h.entry, Path::new(vec![h.entry, h.exit]))
    };
    h.manager.set_action(BidirectionalAction::Backward { state, pob });
    let child_id = h.manager.add_pob(child).unwrap();
    h.manager.create_propagations();
    h.manager.set_result();
    let result = h.manager.update_result();

    // an obligation at the entry closes: a replay state joins the forward
    // sweep, targeting the root's location
    let closed = h.manager.close_proof_obligations(&result);
    assert_eq!(closed, vec![child_id]);
    assert!(h.manager.universe.try_pob(child_id).is_none());
    assert!(h.manager.universe.try_pob(root_id).is_some());

    let replays: Vec<_> = h
        .manager
        .universe
        .states
        .iter()
        .filter(|id| **id != sid)
        .collect();
    assert_eq!(replays.len(), 1);
    let replay = h.manager.universe.state(*replays[0]);
    assert!(replay.targets.contains(&Target::new(h.exit)));
}

#[test]
fn reached_states_feed_new_obligations() {
    let mut h = setup(dfs_config());
    let seed = ExecutionState::new(&h.program, h.function);
    h.manager.set_initial_and_empty_state(&seed);
    let sid = h.manager.seed(seed);

    // the driver reports the state as having arrived at a target
    h.manager.set_action(BidirectionalAction::ReachedStates { states: vec![sid] });
    h.manager.create_propagations();
    h.manager.set_result();
    h.manager.update_result();
    assert!(h.manager.universe.reached.contains(&sid));

    // a later backward cycle pairs a brand-new obligation with the already
    // reached state
    let other = {
        let st = h.manager.universe.state(sid);
        ProofObligation::new_root(st.current_block(&h.program))
    };
    let dummy_parent = h
        .searcher
        .borrow_mut()
        .add_root_pob(&mut h.manager, ProofObligation::new_root(h.exit))
        .unwrap();
    h.manager.set_action(BidirectionalAction::Backward {
        state: sid,
        pob: dummy_parent,
    });
    let new_id = h.manager.add_pob(other).unwrap();
    h.manager.create_propagations();
    h.manager.set_result();
    let result = h.manager.update_result();
    assert_eq!(
        result.added_propagations(),
        &[svarog::pob::Propagation {
            state: sid,
            pob: new_id
        }]
    );
}

#[test]
fn paused_states_leave_the_rotation_until_resumed() {
    let mut h = setup(dfs_config());
    let seed = ExecutionState::new(&h.program, h.function);
    h.manager.set_initial_and_empty_state(&seed);
    let sid = h.manager.seed(seed);

    h.searcher
        .borrow_mut()
        .pause_state(&h.manager.universe, sid);
    // the only state is suspended: the scheduler runs dry
    let action = h.searcher.borrow_mut().select_action(&mut h.manager);
    assert!(matches!(action, Some(BidirectionalAction::Terminate)));

    // resuming after termination is pointless; fresh setup instead
    let mut h = setup(dfs_config());
    let seed = ExecutionState::new(&h.program, h.function);
    h.manager.set_initial_and_empty_state(&seed);
    let sid = h.manager.seed(seed);
    h.searcher
        .borrow_mut()
        .pause_state(&h.manager.universe, sid);
    h.searcher
        .borrow_mut()
        .resume_state(&h.manager.universe, sid);
    let action = h.searcher.borrow_mut().select_action(&mut h.manager).unwrap();
    assert!(matches!(action, BidirectionalAction::Forward { state } if state == sid));
}

#[test]
fn searcher_observes_states_only_through_updates() {
    // a subscriber that counts what it is shown; documents that nothing
    // reaches a component outside the update callbacks
    #[derive(Default)]
    struct Counter {
        seen_added: usize,
        seen_removed: usize,
    }
    impl Subscriber for Counter {
        fn update(&mut self, _u: &svarog::manager::Universe, r: &svarog::manager::ActionResult) {
            if let svarog::manager::ActionResult::Forward(r) = r {
                self.seen_added += r.added.len();
                self.seen_removed += r.removed.len();
            }
        }
    }

    let mut h = setup(dfs_config());
    let counter = Rc::new(RefCell::new(Counter::default()));
    h.manager.subscribe(counter.clone());

    let seed = ExecutionState::new(&h.program, h.function);
    let sid = h.manager.seed(seed);
    assert_eq!(counter.borrow().seen_added, 1);

    h.manager.set_action(BidirectionalAction::Forward { state: sid });
    h.manager.remove_state(sid);
    h.manager.create_propagations();
    h.manager.set_result();
    h.manager.update_result();
    assert_eq!(counter.borrow().seen_removed, 1);
    assert!(h.manager.empty_states());
}
