// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::query::PartitionKeyRange;

/// Represents the current stage of pagination for a partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaginationState {
    /// No page has been received yet.
    Initial,

    /// The partition has a pending continuation. When the current page is exhausted, the continuation fetches more data.
    Continuing(String),

    /// The partition has been exhausted. When the current page is exhausted, the partition is done.
    Done,
}

#[derive(Debug)]
pub struct PartitionState {
    /// The index of the partition in the pkranges list used by the execution.
    pub index: usize,
    /// The partition key range this state is for.
    pub pkrange: PartitionKeyRange,
    /// The current stage of pagination for this partition.
    pub stage: PaginationState,
    /// The continuation that fetches the page holding this partition's next undelivered item.
    pub resume: Option<String>,
}

impl PartitionState {
    /// Initializes a partition state that starts from `resume`, or from the start of the partition if that's `None`.
    pub fn new(index: usize, pkrange: PartitionKeyRange, resume: Option<String>) -> Self {
        Self {
            index,
            pkrange,
            stage: PaginationState::Initial,
            resume,
        }
    }

    /// Initializes the state of a partition that an earlier page of the query already exhausted.
    pub fn finished(index: usize, pkrange: PartitionKeyRange) -> Self {
        Self {
            index,
            pkrange,
            stage: PaginationState::Done,
            resume: None,
        }
    }

    pub fn update_state(&mut self, continuation: Option<String>) {
        match continuation {
            Some(token) => {
                self.stage = PaginationState::Continuing(token);
            }
            None => {
                self.stage = PaginationState::Done;
            }
        }
    }

    /// The continuation for the page after the one most recently received, if there is one.
    pub fn next_continuation(&self) -> Option<String> {
        match &self.stage {
            PaginationState::Continuing(token) => Some(token.clone()),
            PaginationState::Initial | PaginationState::Done => None,
        }
    }

    pub fn done(&self) -> bool {
        matches!(self.stage, PaginationState::Done)
    }
}
