// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! This module contains a kind of simulated Cosmos DB backend that can be used to test the query engine.
//!
//! The backend here is VERY simple and depends on a few assumptions:
//! * Partitions are all "physical", there are no logical partitions.
//! * If testing an ORDER BY query, the data in each partition is ALREADY sorted by the ORDER BY field(s), and already filtered by any `WHERE` clause.
//! * Partitions are "ordered" by their ID, and the EPK space is divided evenly among them in that order.

#![allow(dead_code)]

use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use cosmos_query_executor::{
    query::{
        DataRequest, OrderByValue, PartitionFetcher, PartitionKeyRange, PartitionResponse,
        QueryCoordinator, QueryExecution, QueryOptions, QueryPage, QueryPlan, QueryResult,
        QueryResultShape,
    },
    Error, ErrorKind,
};
use futures::{future::BoxFuture, FutureExt};
use tracing_subscriber::EnvFilter;

/// The query text used by tests that don't care about it. The mock backend ignores the query.
pub const QUERY: &str = "SELECT * FROM c";

/// The activity ID the mock backend reports for requests it fails.
pub const BACKEND_ACTIVITY_ID: &str = "00000000-0000-0000-0000-00000000b0e5";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Builds a result as a partition returns it for an `ORDER BY` query.
pub fn order_by_result(
    rid: impl Into<String>,
    order_by_items: Vec<serde_json::Value>,
    payload: serde_json::Value,
) -> QueryResult {
    QueryResult {
        rid: Some(rid.into()),
        order_by_items: order_by_items.into_iter().map(OrderByValue::from).collect(),
        payload: serde_json::value::to_raw_value(&payload).unwrap(),
    }
}

/// Builds a result as a partition returns it for an unordered query.
pub fn raw_result(payload: serde_json::Value) -> QueryResult {
    QueryResult::from_payload(serde_json::value::to_raw_value(&payload).unwrap())
}

/// Equivalent of [`QueryPage`], but with the raw items as [`Value`](serde_json::Value) for easier testing.
#[derive(Clone, Debug, PartialEq)]
pub struct EnginePage {
    pub items: Vec<serde_json::Value>,
    pub continuation: Option<String>,
    pub request_charge: f64,
}

impl From<QueryPage> for EnginePage {
    fn from(page: QueryPage) -> Self {
        EnginePage {
            items: page
                .results
                .iter()
                .map(|r| serde_json::from_str(r.get()).unwrap())
                .collect(),
            continuation: page.continuation,
            request_charge: page.request_charge,
        }
    }
}

/// Flattens pages into the items they returned, in order.
pub fn items(pages: &[EnginePage]) -> Vec<serde_json::Value> {
    pages.iter().flat_map(|p| p.items.iter().cloned()).collect()
}

/// Runs queries against a [`Container`].
pub struct Engine {
    container: Arc<Container>,
    coordinator: QueryCoordinator,
}

impl Engine {
    pub fn new(container: Container) -> Self {
        init_tracing();
        let pkranges = container.pkranges();
        let container = Arc::new(container);
        let coordinator = QueryCoordinator::new(container.clone(), pkranges);
        Engine {
            container,
            coordinator,
        }
    }

    pub fn container(&self) -> &Container {
        &self.container
    }

    pub fn coordinator(&self) -> &QueryCoordinator {
        &self.coordinator
    }

    pub fn execute(
        &self,
        plan: &QueryPlan,
        options: QueryOptions,
    ) -> Result<QueryExecution, Error> {
        self.coordinator.execute(QUERY, plan.clone(), options)
    }

    /// Executes the query, returning every page it produces.
    pub async fn run(&self, plan: &QueryPlan, options: QueryOptions) -> Result<Vec<EnginePage>, Error> {
        let mut execution = self.execute(plan, options)?;
        let mut pages = Vec::new();
        while let Some(page) = execution.next_page().await? {
            pages.push(page.into());
        }
        assert!(execution.complete());
        Ok(pages)
    }

    /// Executes the query one page at a time, starting a new execution from the continuation of every page.
    pub async fn run_resuming(
        &self,
        plan: &QueryPlan,
        options: QueryOptions,
    ) -> Result<Vec<EnginePage>, Error> {
        let mut pages: Vec<EnginePage> = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let options = match continuation.take() {
                Some(continuation) => options.clone().with_continuation(continuation),
                None => options.clone(),
            };
            let mut execution = self.execute(plan, options)?;
            let Some(page) = execution.next_page().await? else {
                break;
            };
            continuation = page.continuation.clone();
            pages.push(page.into());
            if continuation.is_none() {
                break;
            }
            assert!(pages.len() < 10_000, "query never terminated");
        }
        Ok(pages)
    }
}

pub struct Page {
    pub items: Vec<QueryResult>,
    pub continuation: Option<String>,
}

/// Represents a container in the simulated Cosmos DB backend.
///
/// Because we don't need to simulate Database or Account operations, this is the root of the simulated engine.
/// The container also records what the engine asked of it, so tests can check how requests were issued.
pub struct Container {
    partitions: BTreeMap<String, Partition>,
    latency: Option<Duration>,
    failures: HashMap<String, u16>,
    fetches: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    items_served: AtomicUsize,
    charge_served: Mutex<f64>,
    requests: Mutex<Vec<DataRequest>>,
}

impl Container {
    pub fn new() -> Self {
        Container {
            partitions: BTreeMap::new(),
            latency: None,
            failures: HashMap::new(),
            fetches: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            items_served: AtomicUsize::new(0),
            charge_served: Mutex::new(0.0),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn insert(
        &mut self,
        pkrange_id: impl Into<String>,
        items: impl IntoIterator<Item = QueryResult>,
    ) {
        self.partitions
            .entry(pkrange_id.into())
            .or_insert_with(Partition::new)
            .extend(items);
    }

    /// Delays every response by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Fails every request to the given partition with `status`.
    pub fn with_failure(mut self, pkrange_id: impl Into<String>, status: u16) -> Self {
        self.failures.insert(pkrange_id.into(), status);
        self
    }

    /// Divides the EPK space evenly among the partitions, in ID order.
    pub fn pkranges(&self) -> Vec<PartitionKeyRange> {
        const MAX_EPK: u64 = 0x1_0000_0000;
        let count = self.partitions.len() as u64;
        let epks_per_partition = MAX_EPK / count.max(1);
        self.partitions
            .keys()
            .enumerate()
            .map(|(index, pkrange_id)| {
                let index = index as u64;
                let min = format!("{:08X}", index * epks_per_partition);
                let max = if index == count - 1 {
                    // Last partition gets the rest of the range
                    "FFFFFFFF".to_string()
                } else {
                    format!("{:08X}", (index + 1) * epks_per_partition)
                };
                PartitionKeyRange::new(pkrange_id.clone(), min, max)
            })
            .collect()
    }

    pub fn get_data(&self, pkrange_id: &str, continuation: Option<&str>, max_page_size: usize) -> Option<Page> {
        self.partitions
            .get(pkrange_id)
            .map(|p| p.get_data(continuation, max_page_size))
    }

    /// The number of requests issued, including any still in flight.
    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    /// The largest number of requests that were in flight at the same time.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// The number of items returned by completed requests.
    pub fn items_served(&self) -> usize {
        self.items_served.load(Ordering::SeqCst)
    }

    /// The total request charge of completed requests.
    pub fn charge_served(&self) -> f64 {
        *self.charge_served.lock().unwrap()
    }

    pub fn requests(&self) -> Vec<DataRequest> {
        self.requests.lock().unwrap().clone()
    }

    async fn serve(&self, request: DataRequest) -> Result<PartitionResponse, Error> {
        self.requests.lock().unwrap().push(request.clone());
        self.fetches.fetch_add(1, Ordering::SeqCst);

        {
            let _in_flight = InFlight::enter(self);
            if let Some(latency) = self.latency {
                tokio::time::sleep(latency).await;
            } else {
                tokio::task::yield_now().await;
            }
        }

        if let Some(status) = self.failures.get(request.pkrange_id.as_ref()) {
            return Err(Error::upstream(
                *status,
                BACKEND_ACTIVITY_ID,
                format!("request to partition {} failed", request.pkrange_id),
            ));
        }

        let page = self
            .get_data(
                &request.pkrange_id,
                request.continuation.as_deref(),
                request.page_size_hint,
            )
            .ok_or_else(|| {
                ErrorKind::UnknownPartitionKeyRange
                    .with_message(format!("no partition {}", request.pkrange_id))
            })?;
        let shape = if page.items.iter().any(|i| i.rid.is_some()) {
            QueryResultShape::OrderBy
        } else {
            QueryResultShape::RawPayload
        };
        let request_charge = 1.0 + page.items.len() as f64 * 0.25;
        self.items_served
            .fetch_add(page.items.len(), Ordering::SeqCst);
        *self.charge_served.lock().unwrap() += request_charge;
        Ok(PartitionResponse {
            body: shape.results_to_vec(&page.items)?,
            continuation: page.continuation,
            request_charge,
        })
    }
}

impl PartitionFetcher for Container {
    fn fetch_page(&self, request: DataRequest) -> BoxFuture<'_, Result<PartitionResponse, Error>> {
        self.serve(request).boxed()
    }
}

/// Counts a request as in flight until dropped, including when the engine abandons it.
struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(container: &'a Container) -> Self {
        let now = container.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        container.max_in_flight.fetch_max(now, Ordering::SeqCst);
        InFlight(&container.in_flight)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct Partition {
    items: Vec<QueryResult>,
}

impl Partition {
    pub fn new() -> Self {
        Partition { items: Vec::new() }
    }

    pub fn extend(&mut self, items: impl IntoIterator<Item = QueryResult>) {
        self.items.extend(items);
    }

    /// Returns up to `max_page_size` items, starting at the offset encoded in `continuation`.
    pub fn get_data(&self, continuation: Option<&str>, max_page_size: usize) -> Page {
        let index = continuation.map_or(0, |c| c.parse::<usize>().unwrap());
        let end = (index + max_page_size).min(self.items.len());
        let items = self.items[index..end].to_vec();
        let continuation = (end < self.items.len()).then(|| end.to_string());
        Page {
            items,
            continuation,
        }
    }
}
