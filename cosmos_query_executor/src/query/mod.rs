// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::{borrow::Cow, sync::Arc};

use serde::{de::DeserializeOwned, Deserialize};

use crate::ErrorKind;

mod continuation;
mod options;
mod partition;
mod pipeline;
mod plan;
mod producer;
mod query_result;
mod take;

pub use continuation::{
    CompositeContinuationToken, ContinuationCodec, ContinuationToken, OrderByContinuationToken,
    TakeContinuationToken,
};
pub use options::{QueryOptions, DEFAULT_MAX_ITEM_COUNT};
pub use partition::{
    CursorState, PartitionCursor, PartitionFetcher, PartitionPage, PartitionResponse,
};
pub use pipeline::{QueryCoordinator, QueryExecution, SupportedFeatures, SUPPORTED_FEATURES};
pub use plan::{DistinctType, QueryInfo, QueryPlan, QueryRange, SortOrder};
pub use query_result::{OrderByValue, OrderByValueKind, QueryResult, QueryResultShape};
pub use take::TakeLimiter;

/// Features that may be required by the Query Engine.
///
/// The engine provides the caller a list of features that it can support, using these values.
/// The caller can then forward that information to the gateway when generating a query plan, which allows the gateway to reject queries that the engine cannot support.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueryFeature {
    OffsetAndLimit,
    OrderBy,
    MultipleOrderBy,
    Top,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PartitionKeyRange {
    id: String,
    min_inclusive: String,
    max_exclusive: String,
}

impl PartitionKeyRange {
    pub fn new(
        id: impl Into<String>,
        min_inclusive: impl Into<String>,
        max_exclusive: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            min_inclusive: min_inclusive.into(),
            max_exclusive: max_exclusive.into(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn min_inclusive(&self) -> &str {
        &self.min_inclusive
    }

    pub fn max_exclusive(&self) -> &str {
        &self.max_exclusive
    }

    /// The range of effective partition keys covered by this partition key range.
    pub fn range(&self) -> QueryRange {
        QueryRange::new(&self.min_inclusive, &self.max_exclusive, true, false)
    }

    /// Indicates if the given effective partition key falls within this partition key range.
    pub fn contains(&self, effective_partition_key: &str) -> bool {
        self.min_inclusive.as_str() <= effective_partition_key
            && effective_partition_key < self.max_exclusive.as_str()
    }
}

/// Describes a request for a page of data from a single partition key range.
///
/// The query engine hands these to the [`PartitionFetcher`], which is responsible for issuing the actual request to the service.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DataRequest {
    pub pkrange_id: Cow<'static, str>,
    pub continuation: Option<String>,

    /// The maximum number of items the service should return in the page.
    pub page_size_hint: usize,

    /// The, possibly rewritten, query to execute against the partition.
    pub query: Arc<str>,

    /// The effective partition key the query is scoped to, if any.
    pub partition_key: Option<String>,

    /// The activity ID of the query execution, to correlate requests made on its behalf.
    pub activity_id: Arc<str>,
}

/// A page of results delivered to the caller.
///
/// A `continuation` of `None` marks the last page of the query.
#[derive(Clone, Debug)]
pub struct QueryPage<T = Box<serde_json::value::RawValue>> {
    pub results: Vec<T>,
    pub continuation: Option<String>,
    pub request_charge: f64,
}

impl<T> QueryPage<T> {
    pub fn is_terminal(&self) -> bool {
        self.continuation.is_none()
    }

    pub fn map_results<U, F>(self, f: F) -> QueryPage<U>
    where
        F: FnMut(T) -> U,
    {
        QueryPage {
            results: self.results.into_iter().map(f).collect(),
            continuation: self.continuation,
            request_charge: self.request_charge,
        }
    }
}

impl QueryPage {
    /// Deserializes the raw payloads in this page into the caller's item type.
    pub fn into_typed<T: DeserializeOwned>(self) -> crate::Result<QueryPage<T>> {
        let results = self
            .results
            .iter()
            .map(|raw| {
                serde_json::from_str(raw.get())
                    .map_err(|e| ErrorKind::DeserializationError.with_source(e))
            })
            .collect::<crate::Result<Vec<T>>>()?;
        Ok(QueryPage {
            results,
            continuation: self.continuation,
            request_charge: self.request_charge,
        })
    }
}
