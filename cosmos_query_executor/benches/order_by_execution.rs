//! Benchmarks draining a query across many partitions, with and without an `ORDER BY` merge.
//!
//! Partitions are served from memory, so this measures the engine's own overhead: decoding pages, merging, and moving pages between workers and the caller.

use std::{hint::black_box, sync::Arc};

use cosmos_query_executor::{
    query::{
        DataRequest, PartitionFetcher, PartitionKeyRange, PartitionResponse, QueryCoordinator,
        QueryInfo, QueryOptions, QueryPlan, QueryResult, QueryResultShape, SortOrder,
    },
    Error,
};
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use futures::{future::BoxFuture, FutureExt};

const ITEMS_PER_PARTITION: usize = 500;
const PAGE_SIZE: usize = 100;

/// Serves pre-encoded pages. The continuation is the index of the next page.
struct InMemoryPartitions {
    pages: Vec<Vec<Vec<u8>>>,
}

impl InMemoryPartitions {
    fn new(partitions: usize, ordered: bool) -> Self {
        let shape = if ordered {
            QueryResultShape::OrderBy
        } else {
            QueryResultShape::RawPayload
        };
        let pages = (0..partitions)
            .map(|partition| {
                let results: Vec<QueryResult> = (0..ITEMS_PER_PARTITION)
                    .map(|i| {
                        // Interleave the partitions, so the merge has to switch between them constantly.
                        let key = i * partitions + partition;
                        let payload = serde_json::json!({
                            "id": format!("item{key}"),
                            "partitionKey": format!("partition{partition}"),
                            "value": key,
                        });
                        QueryResult {
                            rid: Some(format!("{key:08}")),
                            order_by_items: vec![serde_json::json!(key).into()],
                            payload: serde_json::value::to_raw_value(&payload).unwrap(),
                        }
                    })
                    .collect();
                results
                    .chunks(PAGE_SIZE)
                    .map(|page| shape.results_to_vec(page).unwrap())
                    .collect()
            })
            .collect();
        Self { pages }
    }

    fn pkranges(&self) -> Vec<PartitionKeyRange> {
        let count = self.pages.len() as u64;
        let step = 0x1_0000_0000u64 / count;
        (0..count)
            .map(|i| {
                let max = if i == count - 1 {
                    "FFFFFFFF".to_string()
                } else {
                    format!("{:08X}", (i + 1) * step)
                };
                PartitionKeyRange::new(i.to_string(), format!("{:08X}", i * step), max)
            })
            .collect()
    }
}

impl PartitionFetcher for InMemoryPartitions {
    fn fetch_page(&self, request: DataRequest) -> BoxFuture<'_, Result<PartitionResponse, Error>> {
        async move {
            let partition = &self.pages[request.pkrange_id.parse::<usize>().unwrap()];
            let index = request
                .continuation
                .as_deref()
                .map_or(0, |c| c.parse::<usize>().unwrap());
            Ok(PartitionResponse {
                body: partition[index].clone(),
                continuation: (index + 1 < partition.len()).then(|| (index + 1).to_string()),
                request_charge: 1.0,
            })
        }
        .boxed()
    }
}

fn plan(ordered: bool) -> QueryPlan {
    QueryPlan {
        query_info: QueryInfo {
            order_by: if ordered {
                vec![SortOrder::Ascending]
            } else {
                vec![]
            },
            ..Default::default()
        },
        ..Default::default()
    }
}

async fn drain(coordinator: &QueryCoordinator, plan: &QueryPlan) -> usize {
    let options = QueryOptions::default()
        .with_cross_partition_query(true)
        .with_max_degree_of_parallelism(-1)
        .with_max_item_count(PAGE_SIZE);
    let mut execution = coordinator
        .execute("SELECT * FROM c", plan.clone(), options)
        .unwrap();
    let mut items = 0;
    while let Some(page) = execution.next_page().await.unwrap() {
        items += black_box(page.results).len();
    }
    items
}

fn benchmark_execution(c: &mut Criterion) {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap();

    let mut group = c.benchmark_group("query_execution");
    for ordered in [false, true] {
        for partitions in [2, 8, 32] {
            let fetcher = Arc::new(InMemoryPartitions::new(partitions, ordered));
            let pkranges = fetcher.pkranges();
            let coordinator = QueryCoordinator::new(fetcher, pkranges);
            let plan = plan(ordered);

            group.throughput(Throughput::Elements((partitions * ITEMS_PER_PARTITION) as u64));
            let name = if ordered { "order_by" } else { "unordered" };
            group.bench_with_input(
                BenchmarkId::new(name, partitions),
                &(coordinator, plan),
                |b, (coordinator, plan)| {
                    b.to_async(&runtime).iter(|| drain(coordinator, plan));
                },
            );
        }
    }
    group.finish();
}

criterion_group!(benches, benchmark_execution);
criterion_main!(benches);
