// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::{cmp::Ordering, collections::VecDeque};

use crate::{
    query::{
        producer::{
            sorting::{SortKey, Sorting},
            state::PartitionState,
        },
        CompositeContinuationToken, ContinuationToken, OrderByContinuationToken, PartitionPage,
        QueryResult, SortOrder,
    },
    ErrorKind,
};

/// What the merge needs to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStep {
    /// The head of this partition is the next result in the global order. Take it with [`OrderByMerger::pop`].
    Ready(usize),

    /// This partition has no buffered results but isn't exhausted. Its next page must be provided before the merge can continue.
    NeedsData(usize),

    /// Every partition has been drained.
    Exhausted,
}

struct MergePartition {
    state: PartitionState,
    buffer: VecDeque<QueryResult>,

    /// Results at or before this key were produced before the query was resumed, and are dropped as they arrive.
    resume_filter: Option<SortKey>,
}

impl MergePartition {
    fn retired(&self) -> bool {
        self.buffer.is_empty() && self.state.done()
    }
}

/// Merges the locally ordered result streams of several partitions into one globally ordered stream.
///
/// The merger never suspends. It holds the current page of each partition, and asks for the next page of a partition (via [`MergeStep::NeedsData`])
/// whenever that partition's page has been drained, because no result can be produced until every live partition has a head to compare.
/// Ties between partitions with equal sort keys and resource IDs go to the partition with the lowest index.
pub struct OrderByMerger {
    sorting: Sorting,
    partitions: Vec<MergePartition>,

    /// The key of the most recently produced result.
    last: Option<SortKey>,
}

impl OrderByMerger {
    /// Creates a merger over the given partitions, which must be in index order.
    pub fn new(ordering: Vec<SortOrder>, partitions: Vec<PartitionState>) -> Self {
        Self {
            sorting: Sorting::new(ordering),
            partitions: partitions
                .into_iter()
                .map(|state| MergePartition {
                    state,
                    buffer: VecDeque::new(),
                    resume_filter: None,
                })
                .collect(),
            last: None,
        }
    }

    /// Resumes a partition past `anchor`, the key of the last result produced before the query was paused.
    pub fn resume_after(&mut self, index: usize, anchor: SortKey) -> crate::Result<()> {
        self.sorting.check(&anchor.items)?;
        let partition = self.partition_mut(index)?;
        partition.resume_filter = Some(anchor);
        Ok(())
    }

    /// Determines the next step of the merge, without consuming anything.
    pub fn poll(&self) -> crate::Result<MergeStep> {
        let mut best: Option<(usize, &QueryResult)> = None;
        for (index, partition) in self.partitions.iter().enumerate() {
            let Some(head) = partition.buffer.front() else {
                if partition.state.done() {
                    continue;
                }
                return Ok(MergeStep::NeedsData(index));
            };

            let replace = match best {
                None => true,
                Some((_, current)) => {
                    self.sorting.compare(
                        &head.order_by_items,
                        head.rid(),
                        &current.order_by_items,
                        current.rid(),
                    )? == Ordering::Less
                }
            };
            if replace {
                best = Some((index, head));
            }
        }

        Ok(best.map_or(MergeStep::Exhausted, |(index, _)| {
            MergeStep::Ready(index)
        }))
    }

    /// Removes the head of a partition's buffer, recording it as the last produced result.
    pub fn pop(&mut self, index: usize) -> crate::Result<QueryResult> {
        let partition = self.partition_mut(index)?;
        let item = partition.buffer.pop_front().ok_or_else(|| {
            ErrorKind::InternalError.with_message(format!(
                "partition {index} has no buffered results to merge"
            ))
        })?;
        if partition.buffer.is_empty() {
            partition.state.resume = partition.state.next_continuation();
        }

        self.last = Some(SortKey {
            items: item.order_by_items.clone(),
            rid: item.rid().to_string(),
            inclusive: false,
        });
        Ok(item)
    }

    /// Provides the next page of a partition that asked for data.
    pub fn push_page(&mut self, index: usize, page: PartitionPage) -> crate::Result<()> {
        for item in &page.results {
            self.sorting.check(&item.order_by_items)?;
        }

        let sorting = &self.sorting;
        let partition = self
            .partitions
            .get_mut(index)
            .ok_or_else(|| unknown_partition(index))?;
        if !partition.buffer.is_empty() || partition.state.done() {
            return Err(ErrorKind::InternalError.with_message(format!(
                "partition {} received a page it did not ask for",
                partition.state.pkrange.id()
            )));
        }

        let mut items = VecDeque::from(page.results);
        if let Some(anchor) = &partition.resume_filter {
            while let Some(head) = items.front() {
                if sorting.follows(&head.order_by_items, head.rid(), anchor)? {
                    break;
                }
                items.pop_front();
            }
            if !items.is_empty() {
                partition.resume_filter = None;
            }
        }

        partition.state.resume = if items.is_empty() {
            page.continuation.clone()
        } else {
            page.request_continuation
        };
        partition.state.update_state(page.continuation);
        partition.buffer = items;
        if partition.retired() {
            tracing::trace!(
                pkrange_id = partition.state.pkrange.id(),
                "partition drained, retiring it from the merge"
            );
        }
        Ok(())
    }

    /// Builds the continuation that resumes the merge after the last produced result, or `None` if every partition has been drained.
    pub fn continuation(&self) -> crate::Result<Option<ContinuationToken>> {
        let tokens = self
            .partitions
            .iter()
            .filter(|p| !p.retired())
            .map(|p| {
                let anchor = self
                    .last
                    .as_ref()
                    .or(p.resume_filter.as_ref())
                    .ok_or_else(|| {
                        ErrorKind::InternalError
                            .with_message("cannot resume an ORDER BY query before it has produced a result")
                    })?;
                Ok(OrderByContinuationToken {
                    composite_token: CompositeContinuationToken::for_pkrange(
                        &p.state.pkrange,
                        p.state.resume.clone(),
                    ),
                    order_by_items: anchor.items.clone(),
                    rid: anchor.rid.clone(),
                    inclusive: anchor.inclusive,
                })
            })
            .collect::<crate::Result<Vec<_>>>()?;

        Ok((!tokens.is_empty()).then_some(ContinuationToken::OrderBy(tokens)))
    }

    fn partition_mut(&mut self, index: usize) -> crate::Result<&mut MergePartition> {
        self.partitions
            .get_mut(index)
            .ok_or_else(|| unknown_partition(index))
    }
}

fn unknown_partition(index: usize) -> crate::Error {
    ErrorKind::InternalError.with_message(format!("no partition at index {index}"))
}
