// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Turns the pages fetched from each partition into the single stream of results the caller sees.
//!
//! Nothing here suspends. The execution loop receives pages from the partition workers and hands them to a producer,
//! which decides which results come next and what continuation resumes the query after them.

mod order_by;
mod sorting;
mod state;
mod unordered;

pub use order_by::{MergeStep, OrderByMerger};
pub use sorting::SortKey;
pub use state::PartitionState;
pub use unordered::UnorderedProducer;
