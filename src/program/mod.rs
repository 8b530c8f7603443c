// SPDX-FileCopyrightText: 2025 Ledger https://www.ledger.com - INSTITUT MINES TELECOM
//
// SPDX-License-Identifier: Apache-2.0

//! Arena-style program representation. Loading the program (from whatever
//! frontend produced it) is an external concern; the core only needs the
//! location vocabulary — functions, blocks, instructions — plus the static
//! distances that targeted search runs on. All cross-references are integer
//! identities into the arenas, never pointers.

use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::rc::Rc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FunctionId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InstrId(pub u32);

impl fmt::Display for FunctionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fn{}", self.0)
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bb{}", self.0)
    }
}

impl fmt::Display for InstrId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "i{}", self.0)
    }
}

/// What a call block calls: a function in this program or an external stub
/// known only by name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Callee {
    Declared(FunctionId),
    External(Rc<str>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockKind {
    Basic,
    Call(Callee),
    Return,
}

#[derive(Debug, Clone)]
pub struct Instruction {
    pub id: InstrId,
    pub block: BlockId,
    /// Position within the owning block.
    pub index: u32,
}

#[derive(Debug, Clone)]
pub struct Block {
    pub id: BlockId,
    pub function: FunctionId,
    pub kind: BlockKind,
    pub instructions: Vec<InstrId>,
    pub successors: Vec<BlockId>,
    pub predecessors: Vec<BlockId>,
}

impl Block {
    pub fn first_instruction(&self) -> InstrId {
        *self
            .instructions
            .first()
            .unwrap_or_else(|| panic!("block {} has no instructions", self.id))
    }

    pub fn is_call(&self) -> bool {
        matches!(self.kind, BlockKind::Call(_))
    }
}

#[derive(Debug, Clone)]
pub struct Function {
    pub id: FunctionId,
    pub name: Rc<str>,
    pub entry: Option<BlockId>,
    pub blocks: Vec<BlockId>,
    pub returns: Vec<BlockId>,
    pub num_registers: u32,
}

/// A forward-search goal: reach `block`, optionally only counting arrival
/// at its terminating return.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Target {
    pub block: BlockId,
    pub at_return: bool,
}

impl Target {
    pub fn new(block: BlockId) -> Self {
        Target {
            block,
            at_return: false,
        }
    }

    pub fn at_return(block: BlockId) -> Self {
        Target {
            block,
            at_return: true,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.at_return {
            write!(f, "{}@ret", self.block)
        } else {
            write!(f, "{}", self.block)
        }
    }
}

/// A block trace. States record the trace they executed; proof obligations
/// record the trace their constraints must hold along.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Path {
    blocks: Vec<BlockId>,
}

impl Path {
    pub fn new(blocks: Vec<BlockId>) -> Self {
        Path { blocks }
    }

    pub fn initial_block(&self) -> Option<BlockId> {
        self.blocks.first().copied()
    }

    pub fn final_block(&self) -> Option<BlockId> {
        self.blocks.last().copied()
    }

    pub fn push(&mut self, block: BlockId) {
        self.blocks.push(block);
    }

    pub fn get(&self, index: usize) -> Option<BlockId> {
        self.blocks.get(index).copied()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = BlockId> + '_ {
        self.blocks.iter().copied()
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for b in self.iter() {
            if !first {
                write!(f, " -> ")?;
            }
            write!(f, "{}", b)?;
            first = false;
        }
        Ok(())
    }
}

/// The program arena plus cached static distances.
#[derive(Debug, Default)]
pub struct Program {
    functions: Vec<Function>,
    blocks: Vec<Block>,
    instructions: Vec<Instruction>,
    block_distances: RefCell<BTreeMap<BlockId, Rc<BTreeMap<BlockId, u32>>>>,
    backward_distances: RefCell<BTreeMap<FunctionId, Rc<BTreeMap<FunctionId, u32>>>>,
}

impl Program {
    pub fn new() -> Self {
        Program::default()
    }

    pub fn add_function(&mut self, name: &str, num_registers: u32) -> FunctionId {
        let id = FunctionId(self.functions.len() as u32);
        self.functions.push(Function {
            id,
            name: Rc::from(name),
            entry: None,
            blocks: Vec::new(),
            returns: Vec::new(),
            num_registers,
        });
        id
    }

    /// Append a block with `instr_count` fresh instructions to a function.
    /// The first block added becomes the function entry; a `Return` block is
    /// also recorded in the function's return list.
    pub fn add_block(&mut self, function: FunctionId, kind: BlockKind, instr_count: u32) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        let mut instructions = Vec::with_capacity(instr_count as usize);
        for index in 0..instr_count.max(1) {
            let iid = InstrId(self.instructions.len() as u32);
            self.instructions.push(Instruction {
                id: iid,
                block: id,
                index,
            });
            instructions.push(iid);
        }
        let is_return = matches!(kind, BlockKind::Return);
        self.blocks.push(Block {
            id,
            function,
            kind,
            instructions,
            successors: Vec::new(),
            predecessors: Vec::new(),
        });
        let f = &mut self.functions[function.0 as usize];
        if f.entry.is_none() {
            f.entry = Some(id);
        }
        f.blocks.push(id);
        if is_return {
            f.returns.push(id);
        }
        self.invalidate_caches();
        id
    }

    pub fn add_edge(&mut self, from: BlockId, to: BlockId) {
        self.blocks[from.0 as usize].successors.push(to);
        self.blocks[to.0 as usize].predecessors.push(from);
        self.invalidate_caches();
    }

    fn invalidate_caches(&mut self) {
        self.block_distances.borrow_mut().clear();
        self.backward_distances.borrow_mut().clear();
    }

    pub fn function(&self, id: FunctionId) -> &Function {
        self.functions
            .get(id.0 as usize)
            .unwrap_or_else(|| panic!("unknown function {}", id))
    }

    pub fn block(&self, id: BlockId) -> &Block {
        self.blocks
            .get(id.0 as usize)
            .unwrap_or_else(|| panic!("unknown block {}", id))
    }

    pub fn instruction(&self, id: InstrId) -> &Instruction {
        self.instructions
            .get(id.0 as usize)
            .unwrap_or_else(|| panic!("unknown instruction {}", id))
    }

    pub fn block_of(&self, instr: InstrId) -> BlockId {
        self.instruction(instr).block
    }

    pub fn function_of_block(&self, block: BlockId) -> FunctionId {
        self.block(block).function
    }

    pub fn entry_block(&self, function: FunctionId) -> BlockId {
        self.function(function)
            .entry
            .unwrap_or_else(|| panic!("function {} has no blocks", function))
    }

    pub fn entry_instruction(&self, function: FunctionId) -> InstrId {
        self.block(self.entry_block(function)).first_instruction()
    }

    pub fn functions(&self) -> impl Iterator<Item = &Function> {
        self.functions.iter()
    }

    pub fn call_blocks(&self, function: FunctionId) -> Vec<BlockId> {
        self.function(function)
            .blocks
            .iter()
            .copied()
            .filter(|b| self.block(*b).is_call())
            .collect()
    }

    /// Distances from `from` to every block reachable inside its function
    /// (edge count, BFS). Cached; the cache is cleared on structural edits.
    pub fn block_distance(&self, from: BlockId) -> Rc<BTreeMap<BlockId, u32>> {
        if let Some(cached) = self.block_distances.borrow().get(&from) {
            return cached.clone();
        }
        let function = self.block(from).function;
        let mut dist = BTreeMap::new();
        dist.insert(from, 0u32);
        let mut queue = VecDeque::from([from]);
        while let Some(b) = queue.pop_front() {
            let d = dist[&b];
            for succ in &self.block(b).successors {
                if self.block(*succ).function == function && !dist.contains_key(succ) {
                    dist.insert(*succ, d + 1);
                    queue.push_back(*succ);
                }
            }
        }
        let dist = Rc::new(dist);
        self.block_distances.borrow_mut().insert(from, dist.clone());
        dist
    }

    /// Backward call-graph distance: for every function, how many call edges
    /// away `target` is when walking callers-to-callees. Cached.
    pub fn backward_function_distance(&self, target: FunctionId) -> Rc<BTreeMap<FunctionId, u32>> {
        if let Some(cached) = self.backward_distances.borrow().get(&target) {
            return cached.clone();
        }
        // reverse call edges: callee -> callers
        let mut callers: BTreeMap<FunctionId, Vec<FunctionId>> = BTreeMap::new();
        for block in &self.blocks {
            if let BlockKind::Call(Callee::Declared(callee)) = &block.kind {
                callers.entry(*callee).or_default().push(block.function);
            }
        }
        let mut dist = BTreeMap::new();
        dist.insert(target, 0u32);
        let mut queue = VecDeque::from([target]);
        while let Some(f) = queue.pop_front() {
            let d = dist[&f];
            if let Some(cs) = callers.get(&f) {
                for caller in cs {
                    if !dist.contains_key(caller) {
                        dist.insert(*caller, d + 1);
                        queue.push_back(*caller);
                    }
                }
            }
        }
        let dist = Rc::new(dist);
        self.backward_distances
            .borrow_mut()
            .insert(target, dist.clone());
        dist
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn diamond() -> (Program, FunctionId, [BlockId; 4]) {
        let mut p = Program::new();
        let f = p.add_function("main", 4);
        let a = p.add_block(f, BlockKind::Basic, 2);
        let b = p.add_block(f, BlockKind::Basic, 1);
        let c = p.add_block(f, BlockKind::Basic, 1);
        let d = p.add_block(f, BlockKind::Return, 1);
        p.add_edge(a, b);
        p.add_edge(a, c);
        p.add_edge(b, d);
        p.add_edge(c, d);
        (p, f, [a, b, c, d])
    }

    #[test]
    fn entry_and_returns_are_tracked() {
        let (p, f, [a, _, _, d]) = diamond();
        assert_eq!(p.entry_block(f), a);
        assert_eq!(p.function(f).returns, vec![d]);
        assert_eq!(p.block_of(p.entry_instruction(f)), a);
    }

    #[test]
    fn block_distance_is_shortest_edge_count() {
        let (p, _, [a, b, _, d]) = diamond();
        let dist = p.block_distance(a);
        assert_eq!(dist[&a], 0);
        assert_eq!(dist[&b], 1);
        assert_eq!(dist[&d], 2);
    }

    #[test]
    fn backward_distance_walks_the_call_graph() {
        let mut p = Program::new();
        let main = p.add_function("main", 2);
        let helper = p.add_function("helper", 2);
        let leaf = p.add_function("leaf", 2);
        let m0 = p.add_block(main, BlockKind::Call(Callee::Declared(helper)), 1);
        let h0 = p.add_block(helper, BlockKind::Call(Callee::Declared(leaf)), 1);
        let _l0 = p.add_block(leaf, BlockKind::Return, 1);
        let _ = (m0, h0);

        let dist = p.backward_function_distance(leaf);
        assert_eq!(dist[&leaf], 0);
        assert_eq!(dist[&helper], 1);
        assert_eq!(dist[&main], 2);
    }
}
