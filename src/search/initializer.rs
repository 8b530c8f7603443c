// SPDX-FileCopyrightText: 2025 Ledger https://www.ledger.com - INSTITUT MINES TELECOM
//
// SPDX-License-Identifier: Apache-2.0

use crate::manager::Conflict;
use crate::pob::PobId;
use crate::program::{BlockId, BlockKind, Callee, FunctionId, InstrId, Program, Target};
use log::debug;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::rc::Rc;

/// Turns discovered infeasibility cores into fresh isolated entry points:
/// the functions along the conflicting path are dismantled into linear
/// segments, and each segment start becomes a seed aimed at the segment
/// end. Seeds are deduplicated for the lifetime of the run.
pub struct ConflictCoreInitializer {
    program: Rc<Program>,
    inits: VecDeque<(InstrId, BTreeSet<Target>)>,
    initialized: BTreeMap<InstrId, BTreeSet<Target>>,
    dismantled_functions: BTreeSet<FunctionId>,
}

impl ConflictCoreInitializer {
    pub fn new(program: Rc<Program>) -> Self {
        ConflictCoreInitializer {
            program,
            inits: VecDeque::new(),
            initialized: BTreeMap::new(),
            dismantled_functions: BTreeSet::new(),
        }
    }

    pub fn select_action(&mut self) -> (InstrId, BTreeSet<Target>) {
        self.inits
            .pop_front()
            .expect("select on empty initializer")
    }

    pub fn empty(&self) -> bool {
        self.inits.is_empty()
    }

    pub fn add_pob(&mut self, _pob: PobId) {}

    pub fn remove_pob(&mut self, _pob: PobId) {}

    /// Split the blocks reachable from `from` into linear segments. A
    /// segment ends at a branching block, a call block, or one of `ends`;
    /// each (start, end) pair is one candidate seed.
    fn dismantle(&self, from: BlockId, ends: &BTreeSet<BlockId>) -> Vec<(BlockId, BlockId)> {
        let mut result = Vec::new();
        let mut visited = BTreeSet::new();
        let mut starts = VecDeque::from([from]);
        while let Some(start) = starts.pop_front() {
            if !visited.insert(start) {
                continue;
            }
            let mut cursor = start;
            loop {
                let block = self.program.block(cursor);
                let at_end = ends.contains(&cursor);
                let is_joint = at_end || block.successors.len() != 1 || block.is_call();
                if is_joint {
                    if cursor != start || at_end || block.is_call() {
                        result.push((start, cursor));
                    }
                    if !at_end {
                        for succ in &block.successors {
                            starts.push_back(*succ);
                        }
                    }
                    break;
                }
                cursor = block.successors[0];
            }
        }
        result
    }

    /// Register seeds for a conflict: dismantle every function the
    /// conflicting path visits (once per run), aim call-block seeds at the
    /// callee entry, and finally aim the path's last block at the
    /// unreached target itself.
    pub fn add_conflict_init(&mut self, conflict: &Conflict, target: BlockId) {
        assert!(
            !conflict.core.is_empty(),
            "conflict aimed at {} has an empty core",
            target
        );
        let path = &conflict.path;
        let mut inits: BTreeSet<(InstrId, Target)> = BTreeSet::new();

        let mut visited: BTreeSet<FunctionId> = BTreeSet::new();
        for i in 1..path.len() {
            let prev = self.program.function_of_block(path.get(i - 1).unwrap());
            let here = self.program.function_of_block(path.get(i).unwrap());
            if here != prev && !self.dismantled_functions.contains(&here) {
                visited.insert(here);
            }
        }

        for function in visited {
            self.dismantled_functions.insert(function);
            let ends: BTreeSet<BlockId> = self
                .program
                .function(function)
                .returns
                .iter()
                .copied()
                .collect();
            for (start, end) in self.dismantle(self.program.entry_block(function), &ends) {
                let target = if ends.contains(&end) {
                    Target::at_return(end)
                } else {
                    Target::new(end)
                };
                inits.insert((self.program.block(start).first_instruction(), target));
                if let BlockKind::Call(Callee::Declared(callee)) = &self.program.block(end).kind {
                    inits.insert((
                        self.program.block(end).first_instruction(),
                        Target::new(self.program.entry_block(*callee)),
                    ));
                }
            }
        }

        if let Some(final_block) = path.final_block() {
            inits.insert((
                self.program.block(final_block).first_instruction(),
                Target::new(target),
            ));
        }

        let mut grouped: BTreeMap<InstrId, BTreeSet<Target>> = BTreeMap::new();
        for (instr, t) in inits {
            // a seed already standing on its own target is pointless
            if !t.at_return && self.program.block_of(instr) == t.block {
                continue;
            }
            if self
                .initialized
                .get(&instr)
                .map_or(false, |seen| seen.contains(&t))
            {
                continue;
            }
            self.initialized.entry(instr).or_default().insert(t);
            grouped.entry(instr).or_default().insert(t);
        }
        for (instr, targets) in grouped {
            debug!(
                "conflict seeds {} aimed at {} target(s)",
                instr,
                targets.len()
            );
            self.inits.push_back((instr, targets));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::Expr;
    use crate::program::Path;

    fn call_chain_program() -> (Program, FunctionId, FunctionId, Vec<BlockId>) {
        let mut p = Program::new();
        let main = p.add_function("main", 2);
        let helper = p.add_function("helper", 2);
        let m0 = p.add_block(main, BlockKind::Basic, 1);
        let m1 = p.add_block(main, BlockKind::Call(Callee::Declared(helper)), 1);
        let m2 = p.add_block(main, BlockKind::Return, 1);
        let h0 = p.add_block(helper, BlockKind::Basic, 1);
        let h1 = p.add_block(helper, BlockKind::Return, 1);
        p.add_edge(m0, m1);
        p.add_edge(m1, m2);
        p.add_edge(h0, h1);
        (p, main, helper, vec![m0, m1, m2, h0, h1])
    }

    fn conflict_over(path: &[BlockId]) -> Conflict {
        Conflict {
            path: Path::new(path.to_vec()),
            core: vec![(Expr::bool_const(false), None)],
        }
    }

    #[test]
    fn conflicting_path_seeds_visited_functions() {
        let (p, _, _, blocks) = call_chain_program();
        let program = Rc::new(p);
        let mut initializer = ConflictCoreInitializer::new(program.clone());
        assert!(initializer.empty());

        // path crosses from main into helper and back
        let conflict = conflict_over(&[blocks[0], blocks[1], blocks[3], blocks[4], blocks[2]]);
        initializer.add_conflict_init(&conflict, blocks[2]);
        assert!(!initializer.empty());

        let mut seeds = Vec::new();
        while !initializer.empty() {
            seeds.push(initializer.select_action());
        }
        // helper was dismantled: its entry aims at its return
        let helper_entry = program.block(blocks[3]).first_instruction();
        assert!(seeds
            .iter()
            .any(|(instr, targets)| *instr == helper_entry
                && targets.contains(&Target::at_return(blocks[4]))));
        // the final path block aims at the unreached target
        let final_instr = program.block(blocks[2]).first_instruction();
        assert!(seeds.iter().any(|(instr, _)| *instr == final_instr));
    }

    #[test]
    fn seeds_are_deduplicated_across_conflicts() {
        let (p, _, _, blocks) = call_chain_program();
        let mut initializer = ConflictCoreInitializer::new(Rc::new(p));
        let conflict = conflict_over(&[blocks[0], blocks[1], blocks[3]]);
        initializer.add_conflict_init(&conflict, blocks[2]);
        let first: usize = {
            let mut n = 0;
            while !initializer.empty() {
                initializer.select_action();
                n += 1;
            }
            n
        };
        assert!(first > 0);

        // the same conflict again produces nothing new
        initializer.add_conflict_init(&conflict, blocks[2]);
        assert!(initializer.empty());
    }
}
