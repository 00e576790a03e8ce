// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use serde::{Deserialize, Serialize};

/// The query plan produced by the gateway for a query.
///
/// Planning is not performed by this crate. The caller requests a plan from the gateway (advertising [`SUPPORTED_FEATURES`](super::SUPPORTED_FEATURES))
/// and hands the deserialized plan to [`QueryCoordinator::execute`](super::QueryCoordinator::execute).
#[derive(Clone, Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct QueryPlan {
    #[serde(default)]
    pub partitioned_query_execution_info_version: usize,
    #[serde(default)]
    pub query_info: QueryInfo,
    #[serde(default)]
    pub query_ranges: Vec<QueryRange>,
}

#[derive(Clone, Debug, Deserialize, Default, PartialEq, Eq)]
pub enum DistinctType {
    #[default]
    None,
    Ordered,
    Unordered,
}

#[derive(Clone, Debug, Deserialize, Default)]
#[serde(default)]
#[serde(rename_all = "camelCase")]
pub struct QueryInfo {
    pub distinct_type: DistinctType,
    pub top: Option<u64>,
    pub offset: Option<u64>,
    pub limit: Option<u64>,
    pub order_by: Vec<SortOrder>,
    pub order_by_expressions: Vec<String>,
    pub group_by_expressions: Vec<String>,
    pub aggregates: Vec<String>,
    pub rewritten_query: String,
    pub has_select_value: bool,
    pub has_non_streaming_order_by: bool,
}

impl QueryInfo {
    /// The number of items the query may return, combining `TOP` and `LIMIT`.
    pub fn take(&self) -> Option<u64> {
        match (self.top, self.limit) {
            (Some(top), Some(limit)) => Some(top.min(limit)),
            (top, limit) => top.or(limit),
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    Descending,
}

/// A range over the effective partition key space.
///
/// Query plans use these to describe the parts of the key space a query can touch, and continuation tokens use them to identify the partition key range they resume.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct QueryRange {
    pub min: String,
    pub max: String,
    pub is_min_inclusive: bool,
    pub is_max_inclusive: bool,
}

impl QueryRange {
    pub fn new(
        min: impl Into<String>,
        max: impl Into<String>,
        is_min_inclusive: bool,
        is_max_inclusive: bool,
    ) -> Self {
        Self {
            min: min.into(),
            max: max.into(),
            is_min_inclusive,
            is_max_inclusive,
        }
    }

    /// Indicates if the bounds are correctly ordered.
    pub fn is_valid(&self) -> bool {
        self.min <= self.max
    }
}
