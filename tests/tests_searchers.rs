use std::cell::RefCell;
use std::collections::BTreeSet;
use std::rc::Rc;
use std::time::Duration;
use svarog::config::BatchingConfig;
use svarog::fork_tree::ForkForest;
use svarog::manager::Universe;
use svarog::program::{BlockKind, FunctionId, Program};
use svarog::search::{
    BfsSearcher, BinaryRankedSearcher, DfsSearcher, ForwardSearcher, InterleavedSearcher,
    IterativeDeepeningTimeSearcher, MergingSearcher, RandomPathSearcher, SearchStats,
};
use svarog::state::{ExecutionState, StateId};

fn single_block_program() -> (Rc<Program>, FunctionId) {
    let mut p = Program::new();
    let f = p.add_function("main", 2);
    p.add_block(f, BlockKind::Return, 1);
    (Rc::new(p), f)
}

fn populate(universe: &mut Universe, program: &Program, f: FunctionId, count: usize) -> Vec<StateId> {
    let mut ids = Vec::new();
    for _ in 0..count {
        let state = ExecutionState::new(program, f);
        let id = state.id;
        universe.insert_state(state);
        ids.push(id);
    }
    ids
}

#[test]
fn dfs_is_lifo_and_bfs_is_fifo() {
    let (program, f) = single_block_program();
    let mut universe = Universe::default();
    let ids = populate(&mut universe, &program, f, 3);

    let mut dfs = DfsSearcher::new();
    dfs.update(&universe, None, &ids, &[]);
    assert_eq!(dfs.select_state(&universe), ids[2]);

    let mut bfs = BfsSearcher::new();
    bfs.update(&universe, None, &ids, &[]);
    assert_eq!(bfs.select_state(&universe), ids[0]);

    dfs.update(&universe, None, &[], &[ids[2]]);
    assert_eq!(dfs.select_state(&universe), ids[1]);
}

#[test]
fn interleaved_rotates_between_policies() {
    let (program, f) = single_block_program();
    let mut universe = Universe::default();
    let ids = populate(&mut universe, &program, f, 2);

    let mut searcher = InterleavedSearcher::new(vec![
        Box::new(DfsSearcher::new()),
        Box::new(BfsSearcher::new()),
    ]);
    searcher.update(&universe, None, &ids, &[]);

    // DFS slot gives the newest, BFS slot the oldest
    assert_eq!(searcher.select_state(&universe), ids[1]);
    assert_eq!(searcher.select_state(&universe), ids[0]);
    assert_eq!(searcher.select_state(&universe), ids[1]);
}

#[test]
fn binary_ranked_prefers_the_first_pool() {
    let (program, f) = single_block_program();
    let mut universe = Universe::default();

    let regular = ExecutionState::new(&program, f);
    let regular_id = regular.id;
    let mut isolated = ExecutionState::new(&program, f);
    isolated.isolated = true;
    let isolated_id = isolated.id;
    universe.insert_state(regular);
    universe.insert_state(isolated);

    let mut searcher = BinaryRankedSearcher::new(
        svarog::search::forward::isolation_rank,
        Box::new(DfsSearcher::new()),
        Box::new(DfsSearcher::new()),
    );
    searcher.update(&universe, None, &[regular_id, isolated_id], &[]);
    assert_eq!(searcher.select_state(&universe), isolated_id);

    searcher.update(&universe, None, &[], &[isolated_id]);
    assert_eq!(searcher.select_state(&universe), regular_id);
}

#[test]
fn batching_pins_a_selection_until_the_budget_runs_out() {
    let (program, f) = single_block_program();
    let mut universe = Universe::default();
    let first = populate(&mut universe, &program, f, 1);

    let stats = Rc::new(SearchStats::default());
    let mut searcher = svarog::search::BatchingSearcher::new(
        Box::new(DfsSearcher::new()),
        &BatchingConfig {
            time_budget_ms: 0,
            instruction_budget: 10,
        },
        stats.clone(),
    );
    searcher.update(&universe, None, &first, &[]);
    assert_eq!(searcher.select_state(&universe), first[0]);

    // a newer state arrives, but the pinned selection holds within budget
    let second = populate(&mut universe, &program, f, 1);
    searcher.update(&universe, Some(first[0]), &second, &[]);
    stats.instructions.set(5);
    assert_eq!(searcher.select_state(&universe), first[0]);

    // blowing the instruction budget re-selects through the base (DFS: newest)
    stats.instructions.set(20);
    assert_eq!(searcher.select_state(&universe), second[0]);
}

#[test]
fn iterative_deepening_pauses_and_revives_with_doubled_budget() {
    let (program, f) = single_block_program();
    let mut universe = Universe::default();
    let ids = populate(&mut universe, &program, f, 1);

    let mut searcher =
        IterativeDeepeningTimeSearcher::with_budget(Box::new(DfsSearcher::new()), Duration::ZERO);
    searcher.update(&universe, None, &ids, &[]);
    assert_eq!(searcher.select_state(&universe), ids[0]);

    // the zero budget is immediately exceeded: the state pauses, the base
    // drains, and the revival brings it back
    searcher.update(&universe, Some(ids[0]), &[], &[]);
    assert!(!searcher.empty());
    assert_eq!(searcher.select_state(&universe), ids[0]);
}

#[test]
fn merge_rendezvous_releases_when_all_partners_arrive() {
    let (program, f) = single_block_program();
    let mut universe = Universe::default();
    let ids = populate(&mut universe, &program, f, 3);

    let mut searcher = MergingSearcher::new(Box::new(DfsSearcher::new()));
    searcher.update(&universe, None, &ids, &[]);

    let partners: BTreeSet<StateId> = [ids[0], ids[1]].into_iter().collect();
    let group = searcher.open_merge(partners);
    searcher.reach_rendezvous(&universe, group, ids[0]);

    // one partner waits; the others keep running
    assert_eq!(searcher.waiting(), 1);
    assert_eq!(searcher.select_state(&universe), ids[2]);

    searcher.reach_rendezvous(&universe, group, ids[1]);
    let released = searcher.select_state(&universe);
    assert!(released == ids[0] || released == ids[1]);
    assert_eq!(searcher.waiting(), 0);
}

#[test]
fn merge_rendezvous_force_releases_when_nothing_else_runs() {
    let (program, f) = single_block_program();
    let mut universe = Universe::default();
    let ids = populate(&mut universe, &program, f, 2);

    let mut searcher = MergingSearcher::new(Box::new(DfsSearcher::new()));
    searcher.update(&universe, None, &ids, &[]);

    let partners: BTreeSet<StateId> = ids.iter().copied().collect();
    let group = searcher.open_merge(partners);
    searcher.reach_rendezvous(&universe, group, ids[0]);

    // the other partner dies; the searcher must not deadlock on the waiter
    searcher.update(&universe, None, &[], &[ids[1]]);
    assert!(!searcher.empty());
    assert_eq!(searcher.select_state(&universe), ids[0]);
}

#[test]
fn random_path_only_selects_owned_states() {
    let (program, f) = single_block_program();
    let mut universe = Universe::default();
    let ids = populate(&mut universe, &program, f, 1);

    let forest = Rc::new(RefCell::new(ForkForest::new()));
    let rng = Rc::new(RefCell::new(<rand::rngs::StdRng as rand::SeedableRng>::seed_from_u64(7)));
    let mut owner = RandomPathSearcher::new(forest.clone(), rng.clone());
    let other = RandomPathSearcher::new(forest.clone(), rng);

    // the forest learns about the state (late tier), the searcher claims it
    forest.borrow_mut().add_root(ids[0]);
    owner.update(&universe, None, &ids, &[]);
    assert!(!owner.empty());
    assert_eq!(owner.select_state(&universe), ids[0]);

    // the second searcher never claimed anything
    assert!(other.empty());
}
