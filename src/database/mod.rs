// SPDX-FileCopyrightText: 2025 Ledger https://www.ledger.com - INSTITUT MINES TELECOM
//
// SPDX-License-Identifier: Apache-2.0

//! Checkpoint/resume persistence. The store is external in spirit: the core
//! only speaks the narrow record vocabulary below, at explicit checkpoint
//! boundaries, never mid-cycle. The shipped backend serializes each table
//! to a JSON file.

use crate::expr::{Constraints, ExprRef, SymVar};
use crate::manager::{ActionResult, BranchResult, ForwardResult, ObjectManager};
use crate::pob::{Lemma, PobId, ProofObligation, Propagation};
use crate::program::{BlockId, FunctionId, InstrId, Path, Target};
use crate::state::{ExecutionState, StackFrame, StateId};
use anyhow::Context;
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path as FsPath, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConstraintRecord {
    pub expr: ExprRef,
    pub location: Option<InstrId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameRecord {
    pub caller: Option<InstrId>,
    pub function: FunctionId,
    pub locals: Vec<Option<ExprRef>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateRecord {
    pub id: StateId,
    pub init_pc: InstrId,
    pub pc: InstrId,
    pub prev_pc: InstrId,
    pub frames: Vec<FrameRecord>,
    pub constraints: Vec<ConstraintRecord>,
    pub symbolics: Vec<SymVar>,
    pub path: Path,
    pub targets: Vec<Target>,
    pub isolated: bool,
    pub depth: u32,
    pub propagation_count: Vec<(PobId, u32)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObligationRecord {
    pub id: PobId,
    pub root: PobId,
    pub parent: Option<PobId>,
    pub children: Vec<PobId>,
    pub location: BlockId,
    pub stack: Vec<InstrId>,
    pub path: Path,
    pub constraints: Vec<ConstraintRecord>,
    pub symbolics: Vec<SymVar>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LemmaRecord {
    pub path: Path,
    pub constraints: Vec<ExprRef>,
}

/// Identity watermarks, written so a resumed run keeps allocating above
/// everything it reloads.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct MaxIds {
    pub state: u32,
    pub pob: u32,
}

fn constraints_to_records(constraints: &Constraints) -> Vec<ConstraintRecord> {
    constraints
        .iter()
        .map(|e| ConstraintRecord {
            expr: e.clone(),
            location: constraints.location_of(e),
        })
        .collect()
}

fn records_to_constraints(records: &[ConstraintRecord]) -> Constraints {
    let mut constraints = Constraints::new();
    for r in records {
        constraints.insert(r.expr.clone(), r.location);
    }
    constraints
}

impl From<&ExecutionState> for StateRecord {
    fn from(state: &ExecutionState) -> Self {
        StateRecord {
            id: state.id,
            init_pc: state.init_pc,
            pc: state.pc,
            prev_pc: state.prev_pc,
            frames: state
                .stack
                .iter()
                .map(|f| FrameRecord {
                    caller: f.caller,
                    function: f.function,
                    locals: f.locals.clone(),
                })
                .collect(),
            constraints: constraints_to_records(&state.constraints),
            symbolics: state.symbolics.iter().cloned().collect(),
            path: state.path.clone(),
            targets: state.targets.iter().copied().collect(),
            isolated: state.isolated,
            depth: state.depth,
            propagation_count: state
                .propagation_count
                .iter()
                .map(|(k, v)| (*k, *v))
                .collect(),
        }
    }
}

impl From<&ProofObligation> for ObligationRecord {
    fn from(pob: &ProofObligation) -> Self {
        ObligationRecord {
            id: pob.id,
            root: pob.root,
            parent: pob.parent,
            children: pob.children.iter().copied().collect(),
            location: pob.location,
            stack: pob.stack.clone(),
            path: pob.path.clone(),
            constraints: constraints_to_records(&pob.constraints),
            symbolics: pob.symbolics.iter().cloned().collect(),
        }
    }
}

impl StateRecord {
    /// Rebuild the state. The memory object map lives in the external
    /// memory model and is reloaded by it, not here; coverage counters
    /// restart from zero.
    pub fn instantiate_state(&self) -> ExecutionState {
        ExecutionState {
            id: self.id,
            init_pc: self.init_pc,
            pc: self.pc,
            prev_pc: self.prev_pc,
            stack: self
                .frames
                .iter()
                .map(|f| StackFrame {
                    caller: f.caller,
                    function: f.function,
                    locals: f.locals.clone(),
                })
                .collect(),
            constraints: records_to_constraints(&self.constraints),
            symbolics: self.symbolics.iter().cloned().collect(),
            objects: BTreeMap::new(),
            depth: self.depth,
            path: self.path.clone(),
            targets: self.targets.iter().copied().collect(),
            isolated: self.isolated,
            covered_new: false,
            insts_since_cov_new: 0,
            stepped_instructions: 0,
            query_cost: 0.0,
            min_dist_to_uncovered: 0,
            propagation_count: self.propagation_count.iter().copied().collect(),
        }
    }
}

impl ObligationRecord {
    pub fn instantiate(&self) -> ProofObligation {
        ProofObligation {
            id: self.id,
            location: self.location,
            constraints: records_to_constraints(&self.constraints),
            stack: self.stack.clone(),
            path: self.path.clone(),
            root: self.root,
            parent: self.parent,
            children: self.children.iter().copied().collect(),
            symbolics: self.symbolics.iter().cloned().collect(),
        }
    }
}

impl From<&Lemma> for LemmaRecord {
    fn from(lemma: &Lemma) -> Self {
        LemmaRecord {
            path: lemma.path.clone(),
            constraints: lemma.constraints.clone(),
        }
    }
}

impl LemmaRecord {
    pub fn instantiate(&self) -> Lemma {
        Lemma::new(self.path.clone(), self.constraints.clone())
    }
}

/// The narrow persistence interface the core consumes. Write operations are
/// keyed by the records' monotonically increasing integer identities.
pub trait Database {
    fn write_state(&mut self, record: &StateRecord) -> anyhow::Result<()>;
    fn write_obligation(&mut self, record: &ObligationRecord) -> anyhow::Result<()>;
    fn write_lemma(&mut self, record: &LemmaRecord) -> anyhow::Result<()>;
    fn write_propagation(&mut self, record: &Propagation) -> anyhow::Result<()>;
    fn write_max_ids(&mut self, ids: MaxIds) -> anyhow::Result<()>;

    fn retrieve_states(&mut self) -> anyhow::Result<Vec<StateRecord>>;
    fn retrieve_obligations(&mut self) -> anyhow::Result<Vec<ObligationRecord>>;
    fn retrieve_lemmas(&mut self) -> anyhow::Result<Vec<LemmaRecord>>;
    fn retrieve_propagations(&mut self) -> anyhow::Result<Vec<Propagation>>;
    fn retrieve_max_ids(&mut self) -> anyhow::Result<MaxIds>;
}

/// File-backed implementation: one JSON file per table under a root
/// directory, loaded eagerly on open and flushed explicitly.
pub struct JsonDatabase {
    root: PathBuf,
    states: Vec<StateRecord>,
    obligations: Vec<ObligationRecord>,
    lemmas: Vec<LemmaRecord>,
    propagations: Vec<Propagation>,
    max_ids: MaxIds,
}

impl JsonDatabase {
    pub fn open<P: AsRef<FsPath>>(root: P) -> anyhow::Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)
            .with_context(|| format!("creating database directory {}", root.display()))?;
        let mut db = JsonDatabase {
            root,
            states: Vec::new(),
            obligations: Vec::new(),
            lemmas: Vec::new(),
            propagations: Vec::new(),
            max_ids: MaxIds::default(),
        };
        db.states = db.load_table("states.json")?;
        db.obligations = db.load_table("obligations.json")?;
        db.lemmas = db.load_table("lemmas.json")?;
        db.propagations = db.load_table("propagations.json")?;
        if db.table_path("max_ids.json").exists() {
            let content = fs::read_to_string(db.table_path("max_ids.json"))?;
            db.max_ids = serde_json::from_str(&content).context("parsing max_ids.json")?;
        }
        Ok(db)
    }

    fn table_path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    fn load_table<T: for<'de> Deserialize<'de>>(&self, name: &str) -> anyhow::Result<Vec<T>> {
        let path = self.table_path(name);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content =
            fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("parsing {}", path.display()))
    }

    fn store_table<T: Serialize>(&self, name: &str, rows: &[T]) -> anyhow::Result<()> {
        let path = self.table_path(name);
        let content = serde_json::to_string_pretty(rows)?;
        fs::write(&path, content).with_context(|| format!("writing {}", path.display()))
    }

    /// Write every table out to disk.
    pub fn flush(&self) -> anyhow::Result<()> {
        self.store_table("states.json", &self.states)?;
        self.store_table("obligations.json", &self.obligations)?;
        self.store_table("lemmas.json", &self.lemmas)?;
        self.store_table("propagations.json", &self.propagations)?;
        let content = serde_json::to_string_pretty(&self.max_ids)?;
        fs::write(self.table_path("max_ids.json"), content)?;
        Ok(())
    }

    /// Drop all in-memory rows (a fresh checkpoint overwrites, not appends).
    pub fn clear(&mut self) {
        self.states.clear();
        self.obligations.clear();
        self.lemmas.clear();
        self.propagations.clear();
        self.max_ids = MaxIds::default();
    }
}

impl Database for JsonDatabase {
    fn write_state(&mut self, record: &StateRecord) -> anyhow::Result<()> {
        self.states.push(record.clone());
        Ok(())
    }

    fn write_obligation(&mut self, record: &ObligationRecord) -> anyhow::Result<()> {
        self.obligations.push(record.clone());
        Ok(())
    }

    fn write_lemma(&mut self, record: &LemmaRecord) -> anyhow::Result<()> {
        self.lemmas.push(record.clone());
        Ok(())
    }

    fn write_propagation(&mut self, record: &Propagation) -> anyhow::Result<()> {
        self.propagations.push(*record);
        Ok(())
    }

    fn write_max_ids(&mut self, ids: MaxIds) -> anyhow::Result<()> {
        self.max_ids = ids;
        Ok(())
    }

    fn retrieve_states(&mut self) -> anyhow::Result<Vec<StateRecord>> {
        Ok(self.states.clone())
    }

    fn retrieve_obligations(&mut self) -> anyhow::Result<Vec<ObligationRecord>> {
        Ok(self.obligations.clone())
    }

    fn retrieve_lemmas(&mut self) -> anyhow::Result<Vec<LemmaRecord>> {
        Ok(self.lemmas.clone())
    }

    fn retrieve_propagations(&mut self) -> anyhow::Result<Vec<Propagation>> {
        Ok(self.propagations.clone())
    }

    fn retrieve_max_ids(&mut self) -> anyhow::Result<MaxIds> {
        Ok(self.max_ids)
    }
}

impl ObjectManager {
    /// Persist the whole universe at a cycle boundary.
    pub fn checkpoint(&self, db: &mut dyn Database) -> anyhow::Result<()> {
        let mut max_state = 0u32;
        for state in self.universe.live_states() {
            db.write_state(&StateRecord::from(state))?;
            max_state = max_state.max(state.id.0 + 1);
        }
        let mut max_pob = 0u32;
        for pob in self.universe.pobs.values() {
            db.write_obligation(&ObligationRecord::from(pob))?;
            max_pob = max_pob.max(pob.id.0 + 1);
        }
        for lemma in &self.universe.lemmas {
            db.write_lemma(&LemmaRecord::from(lemma))?;
        }
        for propagation in &self.universe.propagations {
            db.write_propagation(propagation)?;
        }
        db.write_max_ids(MaxIds {
            state: max_state,
            pob: max_pob,
        })?;
        debug!("checkpoint written");
        Ok(())
    }

    /// Rebuild the universe from a store into this (fresh) manager and
    /// re-announce everything to subscribers, so searcher indices come back
    /// consistent.
    pub fn restore(&mut self, db: &mut dyn Database) -> anyhow::Result<()> {
        assert!(
            self.universe.arena.is_empty() && self.universe.pobs.is_empty(),
            "restore into a non-empty manager"
        );

        let mut main_states = Vec::new();
        let mut isolated_states = Vec::new();
        for record in db.retrieve_states()? {
            let state = record.instantiate_state();
            if state.isolated {
                isolated_states.push(state.id);
            } else {
                main_states.push(state.id);
            }
            self.universe.arena.insert(state.id, state);
        }

        for record in db.retrieve_obligations()? {
            let pob = record.instantiate();
            self.universe.pobs.insert(pob.id, pob);
        }
        for record in db.retrieve_lemmas()? {
            self.universe.lemmas.push(record.instantiate());
        }

        let propagations = db.retrieve_propagations()?;
        for p in &propagations {
            assert!(
                self.universe.has_state(p.state) && self.universe.pobs.contains_key(&p.pob),
                "restored propagation {} references missing entities",
                p
            );
        }

        let ids = db.retrieve_max_ids()?;
        StateId::advance_watermark(ids.state);
        PobId::advance_watermark(ids.pob);

        // replay the population as two synthetic results; commit fills the
        // canonical sets and subscribers rebuild their indices
        let result = ActionResult::Forward(ForwardResult {
            current: None,
            added: main_states,
            removed: Vec::new(),
            targeted_conflict: None,
            added_propagations: propagations
                .iter()
                .filter(|p| !self.universe.state(p.state).isolated)
                .copied()
                .collect(),
            removed_propagations: Vec::new(),
        });
        self.broadcast_restored(result);
        let result = ActionResult::Branch(BranchResult {
            current: None,
            added: isolated_states,
            removed: Vec::new(),
            added_propagations: propagations
                .iter()
                .filter(|p| self.universe.state(p.state).isolated)
                .copied()
                .collect(),
            removed_propagations: Vec::new(),
        });
        self.broadcast_restored(result);
        debug!("restore complete");
        Ok(())
    }
}
