// SPDX-FileCopyrightText: 2025 Ledger https://www.ledger.com - INSTITUT MINES TELECOM
//
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// One forward-search heuristic in the interleaved composition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SearcherKind {
    Dfs,
    Bfs,
    RandomState,
    RandomPath,
    NursDepth,
    NursRp,
    NursInstCount,
    NursCpInstCount,
    NursQueryCost,
    NursMinDistToUncovered,
    NursCovNew,
}

/// Batching budgets: keep one selected state running for a time span or an
/// instruction count before re-selecting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchingConfig {
    #[serde(default = "default_batch_time_ms")]
    pub time_budget_ms: u64,
    #[serde(default = "default_batch_instructions")]
    pub instruction_budget: u64,
}

fn default_batch_time_ms() -> u64 {
    5000
}

fn default_batch_instructions() -> u64 {
    10000
}

impl Default for BatchingConfig {
    fn default() -> Self {
        BatchingConfig {
            time_budget_ms: default_batch_time_ms(),
            instruction_budget: default_batch_instructions(),
        }
    }
}

/// Static search configuration, consumed once at startup and passed by
/// reference into the searcher construction factory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Ordered forward-searcher composition; more than one entry means
    /// round-robin interleaving.
    #[serde(default = "default_forward")]
    pub forward: Vec<SearcherKind>,
    /// Base searcher for the isolated-state (branch) sweep.
    #[serde(default = "default_branch")]
    pub branch: Vec<SearcherKind>,
    /// Weighted round-robin shares for forward / branch / backward steps.
    #[serde(default = "default_ticker")]
    pub ticker: Vec<u32>,
    #[serde(default)]
    pub batching: Option<BatchingConfig>,
    #[serde(default)]
    pub iterative_deepening: bool,
    #[serde(default)]
    pub enable_merging: bool,
    /// Rewrite existing constraints when an equality with a constant is
    /// added.
    #[serde(default = "default_true")]
    pub rewrite_equalities: bool,
    /// Cap on backward attempts per (state, obligation) pair.
    #[serde(default = "default_max_propagations")]
    pub max_propagations: u32,
    /// Grow a fresh forward state out of every obligation that reaches the
    /// program entry.
    #[serde(default)]
    pub replay_state_from_pob: bool,
    #[serde(default = "default_seed")]
    pub random_seed: u64,
}

fn default_forward() -> Vec<SearcherKind> {
    vec![SearcherKind::RandomPath, SearcherKind::NursCovNew]
}

fn default_branch() -> Vec<SearcherKind> {
    vec![SearcherKind::Dfs]
}

fn default_ticker() -> Vec<u32> {
    vec![4, 1, 1]
}

fn default_true() -> bool {
    true
}

fn default_max_propagations() -> u32 {
    10
}

fn default_seed() -> u64 {
    0x5eed
}

impl Default for SearchConfig {
    fn default() -> Self {
        SearchConfig {
            forward: default_forward(),
            branch: default_branch(),
            ticker: default_ticker(),
            batching: None,
            iterative_deepening: false,
            enable_merging: false,
            rewrite_equalities: true,
            max_propagations: default_max_propagations(),
            replay_state_from_pob: false,
            random_seed: default_seed(),
        }
    }
}

impl SearchConfig {
    /// Load configuration from a JSON file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: SearchConfig = serde_json::from_str(&content)?;
        config.validate().map_err(anyhow::Error::msg)?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.forward.is_empty() {
            return Err("at least one forward searcher is required".to_string());
        }
        if self.branch.is_empty() {
            return Err("at least one branch searcher is required".to_string());
        }
        if self.ticker.len() != 3 {
            return Err(format!(
                "ticker needs exactly 3 weights (forward, branch, backward), got {}",
                self.ticker.len()
            ));
        }
        if self.ticker.iter().all(|w| *w == 0) {
            return Err("ticker weights must not all be zero".to_string());
        }
        if self.max_propagations == 0 {
            return Err("max_propagations must be at least 1".to_string());
        }
        if let Some(batching) = &self.batching {
            if batching.time_budget_ms == 0 && batching.instruction_budget == 0 {
                return Err("batching enabled but both budgets are zero".to_string());
            }
        }
        Ok(())
    }
}
