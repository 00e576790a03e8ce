// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::BTreeSet;

use cosmos_query_executor::{
    query::{QueryOptions, QueryPlan, QueryRange},
    ErrorKind,
};
use pretty_assertions::assert_eq;
use serde_json::json;

use mock_engine::{items, raw_result, Container, Engine};

mod mock_engine;

/// Four partitions of three items each. Partition N covers the EPK range [N * 40000000, (N + 1) * 40000000).
fn container() -> Container {
    let mut container = Container::new();
    for partition in 0..4 {
        container.insert(
            format!("partition{partition}"),
            (0..3).map(|i| raw_result(json!(format!("partition{partition}/item{i}")))),
        );
    }
    container
}

fn plan(query_ranges: Vec<QueryRange>) -> QueryPlan {
    QueryPlan {
        partitioned_query_execution_info_version: 1,
        query_ranges,
        ..Default::default()
    }
}

fn partitions_requested(engine: &Engine) -> BTreeSet<String> {
    engine
        .container()
        .requests()
        .into_iter()
        .map(|r| r.pkrange_id.into_owned())
        .collect()
}

#[tokio::test]
pub async fn pkranges_filtered_by_query_ranges() -> Result<(), Box<dyn std::error::Error>> {
    let engine = Engine::new(container());
    assert_eq!(
        vec!["00000000", "40000000", "80000000", "C0000000"],
        engine
            .coordinator()
            .pkranges()
            .iter()
            .map(|p| p.min_inclusive())
            .collect::<Vec<_>>()
    );

    // Only partition1 overlaps the query range, so this isn't a cross-partition query.
    let pages = engine
        .run(
            &plan(vec![QueryRange::new("40000000", "7FFFFFFF", true, true)]),
            QueryOptions::default(),
        )
        .await?;

    assert_eq!(
        vec![
            json!("partition1/item0"),
            json!("partition1/item1"),
            json!("partition1/item2"),
        ],
        items(&pages)
    );
    assert_eq!(
        BTreeSet::from(["partition1".to_string()]),
        partitions_requested(&engine)
    );

    Ok(())
}

#[tokio::test]
pub async fn multiple_query_ranges() -> Result<(), Box<dyn std::error::Error>> {
    let engine = Engine::new(container());
    let plan = plan(vec![
        QueryRange::new("10000000", "20000000", true, true),
        QueryRange::new("90000000", "A0000000", true, false),
    ]);

    let err = engine
        .execute(&plan, QueryOptions::default())
        .err()
        .unwrap();
    assert_eq!(ErrorKind::CrossPartitionDisabled, err.kind());

    let pages = engine
        .run_resuming(
            &plan,
            QueryOptions::default()
                .with_cross_partition_query(true)
                .with_max_item_count(2),
        )
        .await?;
    let returned: BTreeSet<_> = items(&pages)
        .into_iter()
        .map(|v| v.as_str().unwrap().to_string())
        .collect();
    let expected: BTreeSet<_> = ["partition0", "partition2"]
        .iter()
        .flat_map(|p| (0..3).map(move |i| format!("{p}/item{i}")))
        .collect();
    assert_eq!(expected, returned);
    assert_eq!(
        BTreeSet::from(["partition0".to_string(), "partition2".to_string()]),
        partitions_requested(&engine)
    );

    Ok(())
}

#[tokio::test]
pub async fn cross_partition_queries_issue_no_requests_unless_enabled(
) -> Result<(), Box<dyn std::error::Error>> {
    let engine = Engine::new(container());
    let err = engine
        .execute(&QueryPlan::default(), QueryOptions::default())
        .err()
        .unwrap();

    assert_eq!(ErrorKind::CrossPartitionDisabled, err.kind());
    assert_eq!(400, err.status_code());
    assert!(err.activity_id().is_some());
    assert_eq!(0, engine.container().fetches());

    Ok(())
}

#[tokio::test]
pub async fn unknown_pkrange_ids_issue_no_requests() -> Result<(), Box<dyn std::error::Error>> {
    let engine = Engine::new(container());
    let err = engine
        .execute(
            &QueryPlan::default(),
            QueryOptions::default().with_partition_key_range_id("partition9"),
        )
        .err()
        .unwrap();

    assert_eq!(ErrorKind::UnknownPartitionKeyRange, err.kind());
    assert_eq!(0, engine.container().fetches());

    Ok(())
}
