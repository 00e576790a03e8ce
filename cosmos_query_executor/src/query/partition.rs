// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::{sync::Arc, time::Duration};

use futures::future::BoxFuture;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::{
    query::{DataRequest, PartitionKeyRange, QueryResult, QueryResultShape},
    Error, ErrorKind,
};

/// A single page returned by the service for one partition key range.
#[derive(Clone, Debug, Default)]
pub struct PartitionResponse {
    /// The raw response body, in the gateway's `{"Documents": [...]}` format.
    pub body: Vec<u8>,

    /// The partition-native continuation, or `None` if the partition has no more data.
    pub continuation: Option<String>,

    pub request_charge: f64,
}

/// Fetches pages of single-partition results from the service.
///
/// This is the boundary between the query engine and the transport.
/// Implementations issue the request described by the [`DataRequest`] and return the response, or an [`Error`] built with [`Error::upstream`] if the service rejected it.
/// Retries are the implementation's concern; the engine never retries a failed request.
pub trait PartitionFetcher: Send + Sync {
    fn fetch_page(&self, request: DataRequest) -> BoxFuture<'_, crate::Result<PartitionResponse>>;
}

/// The stage a [`PartitionCursor`] is in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CursorState {
    /// No request has been issued since the cursor was started.
    Idle,

    /// A request is in flight.
    Fetching,

    /// The last request returned a page, and the partition has more data.
    HasPage,

    /// The partition has no more data.
    Exhausted,

    /// The last request failed. The cursor can't be used again.
    Failed,
}

/// A decoded page of results from one partition key range.
#[derive(Clone, Debug)]
pub struct PartitionPage {
    pub results: Vec<QueryResult>,

    /// The continuation that was used to request this page.
    pub request_continuation: Option<String>,

    /// The continuation for the next page of this partition, or `None` if this was the last page.
    pub continuation: Option<String>,

    pub request_charge: f64,
}

/// Tracks fetch progress against exactly one partition key range.
pub struct PartitionCursor {
    index: usize,
    pkrange: PartitionKeyRange,
    state: CursorState,
    continuation: Option<String>,
    fetcher: Arc<dyn PartitionFetcher>,
    template: DataRequest,
    shape: QueryResultShape,
    timeout: Option<Duration>,
}

impl PartitionCursor {
    pub(crate) fn new(
        index: usize,
        pkrange: PartitionKeyRange,
        fetcher: Arc<dyn PartitionFetcher>,
        template: DataRequest,
        shape: QueryResultShape,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            index,
            pkrange,
            state: CursorState::Idle,
            continuation: None,
            fetcher,
            template,
            shape,
            timeout,
        }
    }

    /// Positions the cursor at the start of the partition, or at the given partition-native continuation.
    pub fn start(&mut self, resume_token: Option<String>) {
        self.continuation = resume_token;
        self.state = CursorState::Idle;
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn pkrange(&self) -> &PartitionKeyRange {
        &self.pkrange
    }

    pub fn state(&self) -> CursorState {
        self.state
    }

    /// Fetches the next page of the partition.
    ///
    /// Returns `Ok(None)` if `cancel` fires before the page arrives, in which case nothing is emitted and the cursor stays where it was.
    #[tracing::instrument(level = "debug", skip_all, err, fields(pkrange_id = self.pkrange.id(), continuation = self.continuation.as_deref()))]
    pub async fn next_page(
        &mut self,
        cancel: &CancellationToken,
    ) -> crate::Result<Option<PartitionPage>> {
        match self.state {
            CursorState::Exhausted | CursorState::Failed | CursorState::Fetching => {
                return Err(ErrorKind::InternalError.with_message(format!(
                    "partition cursor for {} cannot fetch while {:?}",
                    self.pkrange.id(),
                    self.state
                )));
            }
            CursorState::Idle | CursorState::HasPage => {}
        }

        let request = DataRequest {
            pkrange_id: self.pkrange.id().to_string().into(),
            continuation: self.continuation.clone(),
            ..self.template.clone()
        };

        self.state = CursorState::Fetching;
        let fetch = self.fetcher.fetch_page(request);
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::debug!("fetch cancelled");
                self.state = if self.continuation.is_some() { CursorState::HasPage } else { CursorState::Idle };
                return Ok(None);
            }
            response = with_timeout(fetch, self.timeout, &self.template.activity_id) => response,
        };

        let response = match response.and_then(|r| self.decode(r)) {
            Ok(page) => page,
            Err(err) => {
                self.state = CursorState::Failed;
                return Err(err);
            }
        };

        self.state = match response.continuation {
            Some(_) => CursorState::HasPage,
            None => CursorState::Exhausted,
        };
        self.continuation = response.continuation.clone();
        tracing::trace!(
            items = response.results.len(),
            next = response.continuation.as_deref(),
            "received partition page"
        );
        Ok(Some(response))
    }

    fn decode(&self, response: PartitionResponse) -> crate::Result<PartitionPage> {
        let results = self.shape.results_from_slice(&response.body)?;
        Ok(PartitionPage {
            results,
            request_continuation: self.continuation.clone(),
            continuation: response.continuation,
            request_charge: response.request_charge,
        })
    }
}

async fn with_timeout(
    fetch: BoxFuture<'_, crate::Result<PartitionResponse>>,
    timeout: Option<Duration>,
    activity_id: &str,
) -> crate::Result<PartitionResponse> {
    match timeout {
        Some(timeout) => tokio::time::timeout(timeout, fetch).await.map_err(|_| {
            Error::upstream(
                408,
                activity_id,
                format!("partition request timed out after {timeout:?}"),
            )
        })?,
        None => fetch.await,
    }
}

/// The message a partition worker hands to the merge loop.
pub(crate) type WorkerMessage = crate::Result<PartitionPage>;

/// Drives a [`PartitionCursor`] until its partition is exhausted, handing each page to the merge loop.
///
/// A slot in `pages` is reserved before each fetch is issued, so a worker never runs more than one page ahead of the consumer.
/// `permits` bounds how many partitions fetch at once.
pub(crate) async fn run_partition_worker(
    mut cursor: PartitionCursor,
    pages: mpsc::Sender<WorkerMessage>,
    permits: Arc<Semaphore>,
    cancel: CancellationToken,
) {
    let pkrange_id = cursor.pkrange().id().to_string();
    loop {
        let slot = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            slot = pages.reserve() => match slot {
                Ok(slot) => slot,
                // The merge loop is gone, so nobody needs this partition any more.
                Err(_) => break,
            },
        };

        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            permit = permits.acquire() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let result = cursor.next_page(&cancel).await;
        drop(permit);

        match result {
            Ok(Some(page)) => {
                let done = page.continuation.is_none();
                slot.send(Ok(page));
                if done {
                    tracing::trace!(
                        pkrange_id = pkrange_id.as_str(),
                        "partition exhausted, worker stopping"
                    );
                    break;
                }
            }
            Ok(None) => break,
            Err(err) => {
                slot.send(Err(err));
                break;
            }
        }
    }
}
