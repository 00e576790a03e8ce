// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::{
    query::{
        producer::state::PartitionState, CompositeContinuationToken, ContinuationToken,
        PartitionPage, QueryResult,
    },
    ErrorKind,
};

/// Produces results from partitions without any ordering across them.
///
/// Pages are handed out whole, in whatever order they arrive. Within one partition, pages arrive in the order the partition returned them.
pub struct UnorderedProducer {
    partitions: Vec<PartitionState>,
}

impl UnorderedProducer {
    /// Creates a producer over the given partitions, which must be in index order.
    pub fn new(partitions: Vec<PartitionState>) -> Self {
        Self { partitions }
    }

    /// The indexes of the partitions that may still return results, lowest first.
    pub fn active(&self) -> Vec<usize> {
        self.partitions
            .iter()
            .filter(|p| !p.done())
            .map(|p| p.index)
            .collect()
    }

    pub fn is_exhausted(&self) -> bool {
        self.partitions.iter().all(|p| p.done())
    }

    /// Accepts the next page of a partition, returning its results.
    pub fn accept_page(
        &mut self,
        index: usize,
        page: PartitionPage,
    ) -> crate::Result<Vec<QueryResult>> {
        let partition = self.partitions.get_mut(index).ok_or_else(|| {
            ErrorKind::InternalError.with_message(format!("no partition at index {index}"))
        })?;
        if partition.done() {
            return Err(ErrorKind::InternalError.with_message(format!(
                "received a page for partition {}, which is already exhausted",
                partition.pkrange.id()
            )));
        }

        partition.resume = page.continuation.clone();
        partition.update_state(page.continuation);
        if partition.done() {
            tracing::trace!(
                pkrange_id = partition.pkrange.id(),
                "partition exhausted, removing from list"
            );
        }
        Ok(page.results)
    }

    /// Builds the continuation that resumes every partition after the pages accepted so far, or `None` if every partition is exhausted.
    pub fn continuation(&self) -> Option<ContinuationToken> {
        let tokens: Vec<_> = self
            .partitions
            .iter()
            .filter(|p| !p.done())
            .map(|p| CompositeContinuationToken::for_pkrange(&p.pkrange, p.resume.clone()))
            .collect();
        (!tokens.is_empty()).then_some(ContinuationToken::Composite(tokens))
    }
}
