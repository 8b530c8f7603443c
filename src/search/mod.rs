// SPDX-FileCopyrightText: 2025 Ledger https://www.ledger.com - INSTITUT MINES TELECOM
//
// SPDX-License-Identifier: Apache-2.0

pub mod backward;
pub mod bidirectional;
pub mod forward;
pub mod initializer;

pub use backward::RecencyRankedSearcher;
pub use bidirectional::{BidirectionalSearcher, Ticker};
pub use forward::{
    construct_forward_searcher, BatchingSearcher, BfsSearcher, BinaryRankedSearcher, DfsSearcher,
    DiscretePdf, ForwardSearcher, GuidedSearcher, InterleavedSearcher,
    IterativeDeepeningTimeSearcher, MergingSearcher, RandomPathSearcher, RandomSearcher,
    SearchStats, SearcherStack, TargetedSearcher, WeightKind, WeightResult,
    WeightedRandomSearcher,
};
pub use initializer::ConflictCoreInitializer;
