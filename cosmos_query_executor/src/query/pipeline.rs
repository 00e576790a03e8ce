// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::sync::Arc;

use futures::{future::select_all, stream::BoxStream, StreamExt};
use tokio::{
    sync::{
        mpsc::{self, error::TryRecvError},
        Semaphore,
    },
    task::JoinSet,
};
use tokio_util::sync::CancellationToken;

use crate::{
    query::{
        partition::{run_partition_worker, WorkerMessage},
        producer::{MergeStep, OrderByMerger, PartitionState, SortKey, UnorderedProducer},
        ContinuationCodec, ContinuationToken, DataRequest, DistinctType, PartitionCursor,
        PartitionFetcher, PartitionKeyRange, PartitionPage, QueryFeature, QueryOptions, QueryPage,
        QueryPlan, QueryRange, QueryResultShape, TakeLimiter,
    },
    ErrorKind,
};

/// Holds a list of [`QueryFeature`]s and a string representation suitable for being passed to the gateway when requesting a query plan.
pub struct SupportedFeatures {
    supported_features: &'static [QueryFeature],
    supported_features_str: &'static str,
}

impl SupportedFeatures {
    /// Gets a slice of [`QueryFeature`] values representing the features supported by this engine.
    pub const fn as_slice(&self) -> &'static [QueryFeature] {
        self.supported_features
    }

    /// Gets a comma-separated list of the supported features, suitable for being passed to the gateway when requesting a query plan.
    pub const fn as_str(&self) -> &'static str {
        self.supported_features_str
    }
}

macro_rules! supported_features {
    ($first:ident $(, $feature:ident)*) => {
        #[doc = "A [`SupportedFeatures`](SupportedFeatures) describing the features supported by this query engine."]
        pub const SUPPORTED_FEATURES: SupportedFeatures = SupportedFeatures {
            supported_features: &[QueryFeature::$first $(, QueryFeature::$feature)*],
            supported_features_str: concat!(stringify!($first) $(, ",", stringify!($feature))*),
        };
    };
}

supported_features!(OffsetAndLimit, OrderBy, MultipleOrderBy, Top);

/// Executes queries across the partition key ranges of a container.
///
/// ## Overview
///
/// To perform a cross-partition query, a client has to perform separate queries against each individual partition, then merge the results.
/// For example, consider the query `SELECT * FROM c ORDER BY c.foo`, where `foo` is not the partition key.
/// To execute this query correctly, a client must:
///
/// 1. Request a query plan from the gateway, to identify that it contains an `ORDER BY` operation and what property is being ordered.
/// 2. Fetch the list of Partition Key Ranges (PK Ranges) for the container.
/// 3. Execute the query separately against each PK Range, retrieving a set of _single-partition_ results that are each correctly ordered.
/// 4. Merge the separate single-partition result streams into a single stream, respecting the ordering as you go.
///
/// The caller handles the first two stages: the [`QueryPlan`] type can be deserialized from the gateway's query plan response,
/// and the [`PartitionKeyRange`] type from each PK Range returned by the `/dbs/{dbname}/colls/{containername}/pkranges` REST API.
/// The coordinator handles the last two, issuing single-partition requests through a [`PartitionFetcher`].
///
/// ## Query Rewriting
///
/// The gateway may rewrite the query while generating a query plan, for example to project the `ORDER BY` values next to each document.
/// When the plan has a rewritten query, that is what gets sent to each partition. [`QueryExecution::query`] returns the query actually in use.
pub struct QueryCoordinator {
    fetcher: Arc<dyn PartitionFetcher>,
    pkranges: Vec<PartitionKeyRange>,
}

impl QueryCoordinator {
    /// Creates a coordinator for a container with the given partition key ranges.
    pub fn new(
        fetcher: Arc<dyn PartitionFetcher>,
        pkranges: impl IntoIterator<Item = PartitionKeyRange>,
    ) -> Self {
        let mut pkranges: Vec<PartitionKeyRange> = pkranges.into_iter().collect();
        pkranges.sort_by(|a, b| a.min_inclusive.cmp(&b.min_inclusive));
        Self { fetcher, pkranges }
    }

    /// The partition key ranges of the container, ordered by `minInclusive`.
    pub fn pkranges(&self) -> &[PartitionKeyRange] {
        &self.pkranges
    }

    /// Prepares a query for execution.
    ///
    /// No request is issued until the first page is requested from the returned [`QueryExecution`].
    /// Everything that can be checked without talking to the service (the plan, the options, cross-partition gating, and the continuation) is checked here.
    ///
    /// # Parameters
    /// * `query` - The ORIGINAL query specified by the user. If the [`QueryPlan`] has a `rewritten_query`, the execution will use that instead.
    /// * `plan` - The query plan the gateway produced for the query.
    /// * `options` - The [`QueryOptions`] controlling the execution.
    pub fn execute(
        &self,
        query: &str,
        plan: QueryPlan,
        options: QueryOptions,
    ) -> crate::Result<QueryExecution> {
        let activity_id: Arc<str> = uuid::Uuid::new_v4().to_string().into();
        self.create_execution(query, plan, options, activity_id.clone())
            .map_err(|e| e.or_activity_id(&activity_id))
    }

    #[tracing::instrument(level = "debug", skip_all, err, fields(%activity_id))]
    fn create_execution(
        &self,
        query: &str,
        plan: QueryPlan,
        options: QueryOptions,
        activity_id: Arc<str>,
    ) -> crate::Result<QueryExecution> {
        tracing::trace!(?query, ?plan, ?options, "creating query execution");
        options.validate()?;
        validate_plan(&plan)?;

        let pkranges = self.target_pkranges(&plan.query_ranges, &options)?;
        if pkranges.len() > 1 && !options.enable_cross_partition_query {
            return Err(ErrorKind::CrossPartitionDisabled.with_message(format!(
                "the query spans {} partition key ranges, but cross-partition queries are not enabled",
                pkranges.len()
            )));
        }

        let query_info = plan.query_info;
        let ordered = !query_info.order_by.is_empty();
        let mut limiter = query_info
            .take()
            .map(|take| TakeLimiter::new(take, query_info.offset.unwrap_or_default()));
        let (partitions, anchors) = resume_partitions(
            options.request_continuation.as_deref(),
            pkranges,
            limiter.as_mut(),
            ordered.then_some(query_info.order_by.len()),
        )?;

        let query: Arc<str> = if query_info.rewritten_query.is_empty() {
            query.into()
        } else {
            let rewritten = format_query(&query_info.rewritten_query);
            tracing::debug!(
                original = ?query,
                ?rewritten,
                "rewrote query, per gateway query plan"
            );
            rewritten.into()
        };

        let page_size = options.page_size();
        let template = DataRequest {
            pkrange_id: "".into(),
            continuation: None,
            page_size_hint: page_size,
            query: query.clone(),
            partition_key: options.partition_key.clone(),
            activity_id: activity_id.clone(),
        };
        let shape = if ordered {
            QueryResultShape::OrderBy
        } else {
            QueryResultShape::RawPayload
        };
        let cursors = partitions
            .iter()
            .map(|state| {
                (!state.done()).then(|| {
                    let mut cursor = PartitionCursor::new(
                        state.index,
                        state.pkrange.clone(),
                        self.fetcher.clone(),
                        template.clone(),
                        shape,
                        options.request_timeout,
                    );
                    cursor.start(state.resume.clone());
                    cursor
                })
            })
            .collect::<Vec<_>>();

        let mode = if ordered {
            tracing::debug!(order_by = ?query_info.order_by, "using streaming ORDER BY execution");
            let mut merger = OrderByMerger::new(query_info.order_by, partitions);
            for (index, anchor) in anchors.into_iter().enumerate() {
                if let Some(anchor) = anchor {
                    merger.resume_after(index, anchor)?;
                }
            }
            ExecutionMode::OrderBy(merger)
        } else {
            tracing::debug!("using unordered execution");
            ExecutionMode::Unordered(UnorderedState {
                producer: UnorderedProducer::new(partitions),
                staged: None,
                pending_charge: 0.0,
            })
        };
        if let Some(limiter) = &limiter {
            tracing::debug!(
                remaining = limiter.remaining(),
                "limiting results, per TOP/LIMIT clause"
            );
        }

        let cancel = CancellationToken::new();
        let permits = options.concurrency(cursors.iter().flatten().count());
        Ok(QueryExecution {
            query,
            activity_id,
            page_size,
            mode,
            limiter,
            workers: PartitionWorkers {
                receivers: cursors.iter().map(|_| None).collect(),
                cursors,
                tasks: JoinSet::new(),
                permits,
                cancel: cancel.child_token(),
                started: false,
            },
            cancel,
            finished: false,
            pages_emitted: 0,
        })
    }

    /// Selects the partition key ranges the query must run against, in order.
    fn target_pkranges(
        &self,
        query_ranges: &[QueryRange],
        options: &QueryOptions,
    ) -> crate::Result<Vec<PartitionKeyRange>> {
        let mut pkranges = self.pkranges.clone();
        get_overlapping_pk_ranges(&mut pkranges, query_ranges);

        if let Some(pkrange_id) = options.partition_key_range_id.as_deref() {
            if !self.pkranges.iter().any(|p| p.id == pkrange_id) {
                return Err(ErrorKind::UnknownPartitionKeyRange
                    .with_message(format!("unknown partition key range ID: {pkrange_id}")));
            }
            pkranges.retain(|p| p.id == pkrange_id);
        }

        if let Some(partition_key) = options.partition_key.as_deref() {
            pkranges.retain(|p| p.contains(partition_key));
        }

        tracing::debug!(
            pkranges = pkranges.len(),
            "selected partition key ranges for query"
        );
        Ok(pkranges)
    }
}

fn validate_plan(plan: &QueryPlan) -> crate::Result<()> {
    let info = &plan.query_info;
    if !info.aggregates.is_empty() {
        return Err(
            ErrorKind::UnsupportedQueryPlan.with_message("aggregate queries are not supported")
        );
    }
    if !info.group_by_expressions.is_empty() {
        return Err(
            ErrorKind::UnsupportedQueryPlan.with_message("GROUP BY queries are not supported")
        );
    }
    if info.distinct_type != DistinctType::None {
        return Err(
            ErrorKind::UnsupportedQueryPlan.with_message("DISTINCT queries are not supported")
        );
    }
    if info.has_non_streaming_order_by {
        return Err(ErrorKind::UnsupportedQueryPlan
            .with_message("non-streaming ORDER BY queries are not supported"));
    }
    if info.offset.is_some() && info.limit.is_none() {
        return Err(ErrorKind::UnsupportedQueryPlan.with_message("OFFSET requires a LIMIT"));
    }
    Ok(())
}

/// Builds the starting state of each targeted partition, resuming from `continuation` if there is one.
///
/// `order_by_terms` is the number of `ORDER BY` terms, or `None` for unordered queries.
/// Alongside each partition, this returns the key of the last result produced before an `ORDER BY` query was paused.
fn resume_partitions(
    continuation: Option<&str>,
    pkranges: Vec<PartitionKeyRange>,
    limiter: Option<&mut TakeLimiter>,
    order_by_terms: Option<usize>,
) -> crate::Result<(Vec<PartitionState>, Vec<Option<SortKey>>)> {
    let Some(continuation) = continuation else {
        let anchors = pkranges.iter().map(|_| None).collect();
        let partitions = pkranges
            .into_iter()
            .enumerate()
            .map(|(index, pkrange)| PartitionState::new(index, pkrange, None))
            .collect();
        return Ok((partitions, anchors));
    };

    let expected = match (order_by_terms.is_some(), limiter.is_some()) {
        (true, true) => "TOP/LIMIT over ORDER BY",
        (false, true) => "TOP/LIMIT",
        (true, false) => "ORDER BY",
        (false, false) => "unordered",
    };
    let mismatch = |found: &ContinuationToken| {
        ErrorKind::MalformedContinuation.with_message(format!(
            "a {} continuation cannot resume a {expected} query",
            found.shape()
        ))
    };

    let token = match (ContinuationToken::parse(continuation)?, limiter) {
        (ContinuationToken::Take(take), Some(limiter)) => {
            limiter.resume(&take)?;
            match ContinuationToken::parse(&take.source_token)? {
                ContinuationToken::Take(_) => {
                    return Err(ErrorKind::MalformedContinuation
                        .with_message("TOP/LIMIT continuations cannot be nested"))
                }
                source => source,
            }
        }
        (token @ ContinuationToken::Take(_), None) | (token, Some(_)) => {
            return Err(mismatch(&token))
        }
        (token, None) => token,
    };

    // Each entry is the resume token and anchor for a range, consumed as it's matched to a partition key range.
    let mut resumes: Vec<(QueryRange, Option<String>, Option<SortKey>)> =
        match (token, order_by_terms) {
            (ContinuationToken::Composite(tokens), None) => tokens
                .into_iter()
                .map(|t| (t.range, t.token, None))
                .collect(),
            (ContinuationToken::OrderBy(tokens), Some(terms)) => tokens
                .into_iter()
                .map(|t| {
                    if t.order_by_items.len() != terms {
                        return Err(ErrorKind::MalformedContinuation.with_message(format!(
                            "continuation has {} order by items, but the query orders by {terms}",
                            t.order_by_items.len()
                        )));
                    }
                    let anchor = SortKey {
                        items: t.order_by_items,
                        rid: t.rid,
                        inclusive: t.inclusive,
                    };
                    Ok((t.composite_token.range, t.composite_token.token, Some(anchor)))
                })
                .collect::<crate::Result<_>>()?,
            (token, _) => return Err(mismatch(&token)),
        };

    let mut partitions = Vec::with_capacity(pkranges.len());
    let mut anchors = Vec::with_capacity(pkranges.len());
    for (index, pkrange) in pkranges.into_iter().enumerate() {
        let range = pkrange.range();
        match resumes.iter().position(|(r, _, _)| *r == range) {
            Some(position) => {
                let (_, token, anchor) = resumes.swap_remove(position);
                tracing::trace!(pkrange_id = pkrange.id(), ?token, "resuming partition");
                partitions.push(PartitionState::new(index, pkrange, token));
                anchors.push(anchor);
            }
            None => {
                partitions.push(PartitionState::finished(index, pkrange));
                anchors.push(None);
            }
        }
    }

    if let Some((range, _, _)) = resumes.first() {
        return Err(ErrorKind::MalformedContinuation.with_message(format!(
            "continuation refers to the range [{}, {}), which is not a partition key range targeted by the query",
            range.min, range.max
        )));
    }
    Ok((partitions, anchors))
}

enum ExecutionMode {
    Unordered(UnorderedState),
    OrderBy(OrderByMerger),
}

struct UnorderedState {
    producer: UnorderedProducer,

    /// The next page to return. It's held back until the page after it is known, so that the last page of the query is marked as such.
    staged: Option<QueryPage>,

    /// Request charges of pages that produced no results, waiting to be added to the next page returned.
    pending_charge: f64,
}

enum Staged {
    Page(QueryPage),
    Exhausted,
    Cancelled,
}

/// The partition workers of an execution, and the channels they deliver pages on.
struct PartitionWorkers {
    /// Cursors waiting for their worker to be started. `None` for partitions an earlier page already exhausted.
    cursors: Vec<Option<PartitionCursor>>,
    receivers: Vec<Option<mpsc::Receiver<WorkerMessage>>>,
    tasks: JoinSet<()>,
    permits: usize,
    cancel: CancellationToken,
    started: bool,
}

impl PartitionWorkers {
    fn start(&mut self) {
        if self.started {
            return;
        }
        self.started = true;

        let permits = Arc::new(Semaphore::new(self.permits));
        for (index, cursor) in self.cursors.iter_mut().enumerate() {
            let Some(cursor) = cursor.take() else {
                continue;
            };
            // A single slot keeps each worker at most one page ahead of the merge.
            let (sender, receiver) = mpsc::channel(1);
            self.receivers[index] = Some(receiver);
            self.tasks.spawn(run_partition_worker(
                cursor,
                sender,
                permits.clone(),
                self.cancel.clone(),
            ));
        }
        tracing::debug!(
            workers = self.tasks.len(),
            permits = self.permits,
            "started partition workers"
        );
    }

    /// Waits for the next page of one partition. Returns `Ok(None)` if the execution was cancelled.
    async fn receive(&mut self, index: usize) -> crate::Result<Option<PartitionPage>> {
        let receiver = self
            .receivers
            .get_mut(index)
            .and_then(Option::as_mut)
            .ok_or_else(|| {
                ErrorKind::InternalError.with_message(format!("no worker for partition {index}"))
            })?;
        let message = receiver.recv().await;
        self.settle(index, message)
    }

    /// Waits for the next page of any of the `active` partitions, preferring the lowest partition among pages that are already waiting.
    async fn receive_any(
        &mut self,
        active: &[usize],
    ) -> crate::Result<Option<(usize, PartitionPage)>> {
        for &index in active {
            let Some(receiver) = self.receivers.get_mut(index).and_then(Option::as_mut) else {
                continue;
            };
            let message = match receiver.try_recv() {
                Ok(message) => Some(message),
                Err(TryRecvError::Empty) => continue,
                Err(TryRecvError::Disconnected) => None,
            };
            return Ok(self.settle(index, message)?.map(|page| (index, page)));
        }

        let (index, message) = {
            let waits: Vec<_> = self
                .receivers
                .iter_mut()
                .enumerate()
                .filter(|(index, _)| active.contains(index))
                .filter_map(|(index, receiver)| {
                    receiver
                        .as_mut()
                        .map(|r| Box::pin(async move { (index, r.recv().await) }))
                })
                .collect();
            if waits.is_empty() {
                return Err(ErrorKind::InternalError
                    .with_message("no partition workers are available to receive from"));
            }
            let ((index, message), _, _) = select_all(waits).await;
            (index, message)
        };
        Ok(self.settle(index, message)?.map(|page| (index, page)))
    }

    fn settle(
        &self,
        index: usize,
        message: Option<WorkerMessage>,
    ) -> crate::Result<Option<PartitionPage>> {
        match message {
            Some(Ok(page)) => Ok(Some(page)),
            Some(Err(err)) => Err(err),
            None if self.cancel.is_cancelled() => Ok(None),
            None => Err(ErrorKind::InternalError.with_message(format!(
                "the worker for partition {index} stopped unexpectedly"
            ))),
        }
    }
}

/// A running query, producing pages of results for the caller.
///
/// Each partition targeted by the query is fetched by its own worker task, started when the first page is requested.
/// Workers run at most one page ahead of the caller, and at most [`QueryOptions::max_degree_of_parallelism`] of them have a request in flight at once.
///
/// Dropping the execution (or the stream returned by [`QueryExecution::into_stream`]) cancels any outstanding requests.
pub struct QueryExecution {
    query: Arc<str>,
    activity_id: Arc<str>,
    page_size: usize,
    mode: ExecutionMode,
    limiter: Option<TakeLimiter>,
    workers: PartitionWorkers,
    cancel: CancellationToken,

    // Set once the execution has returned its last page or an error.
    finished: bool,
    pages_emitted: usize,
}

impl QueryExecution {
    /// Retrieves the, possibly rewritten, query that is sent to each partition.
    pub fn query(&self) -> &str {
        &self.query
    }

    /// The activity ID sent with every request made on behalf of this execution.
    pub fn activity_id(&self) -> &str {
        &self.activity_id
    }

    /// Indicates if the execution has returned its last page.
    pub fn complete(&self) -> bool {
        self.finished
    }

    /// Stops the execution. In-flight requests are abandoned, and no further requests are issued.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// A token that cancels this execution when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Produces the next page of results.
    ///
    /// Returns `Ok(None)` once the query has completed, failed, or been cancelled.
    /// The page with a `continuation` of `None` is the last page of the query.
    /// Any error is terminal, and all later calls return `Ok(None)`.
    #[tracing::instrument(level = "debug", skip_all, err, fields(activity_id = %self.activity_id))]
    pub async fn next_page(&mut self) -> crate::Result<Option<QueryPage>> {
        if self.finished {
            return Ok(None);
        }
        if self.cancel.is_cancelled() {
            tracing::debug!("query cancelled");
            self.finish();
            return Ok(None);
        }

        // A query limited to nothing (TOP 0, or resumed with nothing left) completes without fetching.
        if !self.limiter.as_ref().is_some_and(|l| l.is_exhausted()) {
            self.workers.start();
        }
        let result = match &mut self.mode {
            ExecutionMode::OrderBy(merger) => {
                next_ordered_page(
                    merger,
                    &mut self.workers,
                    self.limiter.as_mut(),
                    self.page_size,
                )
                .await
            }
            ExecutionMode::Unordered(state) => {
                next_unordered_page(state, &mut self.workers, self.limiter.as_mut()).await
            }
        };

        if self.cancel.is_cancelled() {
            tracing::debug!("query cancelled, discarding undelivered results");
            self.finish();
            return Ok(None);
        }

        match result {
            Ok(Some(page)) => {
                if page.is_terminal() {
                    self.finish();
                    if page.results.is_empty() && self.pages_emitted > 0 {
                        return Ok(None);
                    }
                }
                self.pages_emitted += 1;
                tracing::debug!(
                    items = page.results.len(),
                    continuation = page.continuation.as_deref(),
                    request_charge = page.request_charge,
                    "returning page"
                );
                Ok(Some(page))
            }
            Ok(None) => {
                self.finish();
                Ok(None)
            }
            Err(err) => {
                self.finish();
                Err(err.or_activity_id(&self.activity_id))
            }
        }
    }

    /// Converts the execution into a stream of pages, ending after the last page or the first error.
    pub fn into_stream(self) -> BoxStream<'static, crate::Result<QueryPage>> {
        futures::stream::try_unfold(self, |mut execution| async move {
            Ok(execution.next_page().await?.map(|page| (page, execution)))
        })
        .boxed()
    }

    fn finish(&mut self) {
        self.finished = true;
        // Stops the workers, without cancelling the caller-visible token.
        self.workers.cancel.cancel();
    }
}

impl Drop for QueryExecution {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Merges the next page of an `ORDER BY` query.
///
/// The page is only cut short of `page_size` when the query has no more results, so the merge looks one result past a full page to find out whether it's the last.
async fn next_ordered_page(
    merger: &mut OrderByMerger,
    workers: &mut PartitionWorkers,
    mut limiter: Option<&mut TakeLimiter>,
    page_size: usize,
) -> crate::Result<Option<QueryPage>> {
    let mut results = Vec::new();
    let mut request_charge = 0.0;
    let terminal = loop {
        if limiter.as_ref().is_some_and(|l| l.is_exhausted()) {
            break true;
        }
        match merger.poll()? {
            MergeStep::Exhausted => break true,
            MergeStep::NeedsData(index) => {
                let Some(page) = workers.receive(index).await? else {
                    return Ok(None);
                };
                request_charge += page.request_charge;
                merger.push_page(index, page)?;
            }
            MergeStep::Ready(_) if results.len() >= page_size => break false,
            MergeStep::Ready(index) => {
                let item = merger.pop(index)?;
                if limiter.as_mut().map_or(true, |l| l.admit()) {
                    results.push(item.payload);
                }
            }
        }
    };

    let continuation = if terminal {
        None
    } else {
        encode_continuation(merger.continuation()?, limiter.as_deref())?
    };
    Ok(Some(QueryPage {
        results,
        continuation,
        request_charge,
    }))
}

/// Produces the next page of an unordered query, one partition page at a time.
async fn next_unordered_page(
    state: &mut UnorderedState,
    workers: &mut PartitionWorkers,
    mut limiter: Option<&mut TakeLimiter>,
) -> crate::Result<Option<QueryPage>> {
    let mut page = match state.staged.take() {
        Some(page) => page,
        None => match stage_unordered_page(state, workers, limiter.as_deref_mut()).await? {
            Staged::Page(page) => page,
            Staged::Exhausted => {
                return Ok(Some(QueryPage {
                    results: Vec::new(),
                    continuation: None,
                    request_charge: std::mem::take(&mut state.pending_charge),
                }))
            }
            Staged::Cancelled => return Ok(None),
        },
    };

    if !page.is_terminal() {
        match stage_unordered_page(state, workers, limiter.as_deref_mut()).await? {
            Staged::Page(next) => state.staged = Some(next),
            Staged::Exhausted => {
                page.continuation = None;
                page.request_charge += std::mem::take(&mut state.pending_charge);
            }
            Staged::Cancelled => return Ok(None),
        }
    }
    Ok(Some(page))
}

/// Receives partition pages until one has results for the caller.
///
/// The continuation of the staged page is captured as soon as it's received, since later pages move the producer on.
async fn stage_unordered_page(
    state: &mut UnorderedState,
    workers: &mut PartitionWorkers,
    mut limiter: Option<&mut TakeLimiter>,
) -> crate::Result<Staged> {
    loop {
        if state.producer.is_exhausted() || limiter.as_ref().is_some_and(|l| l.is_exhausted()) {
            return Ok(Staged::Exhausted);
        }

        let active = state.producer.active();
        let Some((index, page)) = workers.receive_any(&active).await? else {
            return Ok(Staged::Cancelled);
        };
        state.pending_charge += page.request_charge;
        let mut results = state.producer.accept_page(index, page)?;
        if let Some(limiter) = limiter.as_deref_mut() {
            results = limiter.limit_page(results);
        }
        if results.is_empty() {
            continue;
        }

        let continuation = encode_continuation(state.producer.continuation(), limiter.as_deref())?;
        return Ok(Staged::Page(QueryPage {
            results: results.into_iter().map(|r| r.payload).collect(),
            continuation,
            request_charge: std::mem::take(&mut state.pending_charge),
        }));
    }
}

fn encode_continuation(
    token: Option<ContinuationToken>,
    limiter: Option<&TakeLimiter>,
) -> crate::Result<Option<String>> {
    let Some(token) = token else {
        return Ok(None);
    };
    let source = token.serialize_token()?;
    match limiter {
        Some(limiter) => limiter.wrap_continuation(Some(source)),
        None => Ok(Some(source)),
    }
}

/// Rewrites the incoming query by replacing tokens within it.
fn format_query(original: &str) -> String {
    original.replace("{documentdb-formattableorderbyquery-filter}", "true")
}

/// Filters the partition key ranges to include only those that overlap with the query ranges.
/// If no query ranges are provided, all partition key ranges are retained.
fn get_overlapping_pk_ranges(pkranges: &mut Vec<PartitionKeyRange>, query_ranges: &[QueryRange]) {
    if query_ranges.is_empty() {
        return;
    }

    debug_assert!(
        pkranges.is_sorted_by_key(|pkrange| pkrange.min_inclusive.clone()),
        "partition key ranges must be sorted by minInclusive"
    );

    debug_assert!(
        query_ranges.is_sorted_by_key(|query_range| query_range.min.clone()),
        "query ranges must be sorted by min"
    );

    // Walks through both lists, keeping the pkranges that overlap any query range.
    let mut query_idx = 0;
    pkranges.retain(|pkrange| {
        // Skip query ranges that end before this pkrange starts. Later pkranges start even further on.
        while let Some(query_range) = query_ranges.get(query_idx) {
            if query_range.max < pkrange.min_inclusive
                || (query_range.max == pkrange.min_inclusive && !query_range.is_max_inclusive)
            {
                query_idx += 1;
            } else {
                break;
            }
        }

        query_ranges[query_idx..]
            .iter()
            .take_while(|query_range| query_range.min < pkrange.max_exclusive)
            .any(|query_range| pkrange_overlaps_query_range(pkrange, query_range))
    });
}

/// Determines if a partition key range overlaps with a query range.
/// PartitionKeyRange is always [min_inclusive, max_exclusive).
fn pkrange_overlaps_query_range(pkrange: &PartitionKeyRange, query_range: &QueryRange) -> bool {
    // PKRange ends before query starts
    if pkrange.max_exclusive < query_range.min {
        return false;
    }
    if pkrange.max_exclusive == query_range.min && !query_range.is_min_inclusive {
        return false;
    }

    // Query ends before PKRange starts
    if query_range.max < pkrange.min_inclusive {
        return false;
    }
    if query_range.max == pkrange.min_inclusive && !query_range.is_max_inclusive {
        return false;
    }

    true
}
