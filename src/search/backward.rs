// SPDX-FileCopyrightText: 2025 Ledger https://www.ledger.com - INSTITUT MINES TELECOM
//
// SPDX-License-Identifier: Apache-2.0

use crate::manager::Universe;
use crate::pob::{PobId, Propagation};
use crate::state::StateId;
use std::collections::{BTreeMap, BTreeSet};

/// Chooses the next (obligation, state) propagation to advance, preferring
/// states that have been tried against the obligation least often so no
/// single state starves the others. The candidate index is maintained
/// incrementally from propagation diffs.
#[derive(Debug, Default)]
pub struct RecencyRankedSearcher {
    propagate: BTreeMap<PobId, BTreeSet<StateId>>,
}

impl RecencyRankedSearcher {
    pub fn new() -> Self {
        RecencyRankedSearcher::default()
    }

    /// Pick the first obligation in deterministic id order, then its
    /// least-tried compatible state; the chosen state leaves the candidate
    /// set until a fresh propagation re-adds it.
    pub fn select_action(&mut self, universe: &Universe) -> (PobId, StateId) {
        let (&pob, states) = self
            .propagate
            .iter()
            .next()
            .expect("select on empty backward searcher");
        let mut least_used: Option<(u32, StateId)> = None;
        for &sid in states {
            let count = universe
                .state(sid)
                .propagation_count
                .get(&pob)
                .copied()
                .unwrap_or(0);
            if least_used.map_or(true, |(best, _)| count < best) {
                least_used = Some((count, sid));
            }
        }
        let (_, state) = least_used.expect("candidate set empty for obligation");
        let states = self.propagate.get_mut(&pob).unwrap();
        states.remove(&state);
        if states.is_empty() {
            self.propagate.remove(&pob);
        }
        (pob, state)
    }

    pub fn update_propagations(&mut self, added: &[Propagation], removed: &[Propagation]) {
        for p in added {
            self.propagate.entry(p.pob).or_default().insert(p.state);
        }
        for p in removed {
            if let Some(states) = self.propagate.get_mut(&p.pob) {
                states.remove(&p.state);
                if states.is_empty() {
                    self.propagate.remove(&p.pob);
                }
            }
        }
    }

    pub fn remove_pob(&mut self, pob: PobId) {
        self.propagate.remove(&pob);
    }

    pub fn empty(&self) -> bool {
        self.propagate.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::{BlockKind, Program};
    use crate::state::ExecutionState;

    #[test]
    fn index_tracks_propagation_diffs() {
        let mut searcher = RecencyRankedSearcher::new();
        let p1 = Propagation {
            state: StateId(1),
            pob: PobId(1),
        };
        let p2 = Propagation {
            state: StateId(2),
            pob: PobId(1),
        };
        searcher.update_propagations(&[p1, p2], &[]);
        assert!(!searcher.empty());

        searcher.update_propagations(&[], &[p1, p2]);
        assert!(searcher.empty());
    }

    #[test]
    fn least_tried_state_is_selected_first() {
        let mut program = Program::new();
        let f = program.add_function("main", 1);
        program.add_block(f, BlockKind::Return, 1);

        let mut universe = Universe::default();
        let tried = ExecutionState::new(&program, f);
        let fresh = ExecutionState::new(&program, f);
        let pob = PobId::fresh();
        let tried_id = tried.id;
        let fresh_id = fresh.id;
        universe.arena.insert(tried_id, tried);
        universe.arena.insert(fresh_id, fresh);
        universe
            .state_mut(tried_id)
            .propagation_count
            .insert(pob, 1);

        let mut searcher = RecencyRankedSearcher::new();
        searcher.update_propagations(
            &[
                Propagation {
                    state: tried_id,
                    pob,
                },
                Propagation {
                    state: fresh_id,
                    pob,
                },
            ],
            &[],
        );

        let (selected_pob, selected_state) = searcher.select_action(&universe);
        assert_eq!(selected_pob, pob);
        assert_eq!(selected_state, fresh_id);

        // the tried state remains as the only candidate
        let (_, second) = searcher.select_action(&universe);
        assert_eq!(second, tried_id);
        assert!(searcher.empty());
    }
}
