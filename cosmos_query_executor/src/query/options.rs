// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::ErrorKind;

/// The page size used when [`QueryOptions::max_item_count`] is not set.
pub const DEFAULT_MAX_ITEM_COUNT: usize = 100;

/// Options controlling how a query is executed.
///
/// Options can be built in code, or deserialized from JSON configuration using the camel-cased names the Cosmos SDKs use (`enableCrossPartitionQuery`, `maxDegreeOfParallelism`, and so on).
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct QueryOptions {
    /// Allows the query to span more than one partition key range.
    pub enable_cross_partition_query: bool,

    /// How many partitions may have a request in flight at once.
    ///
    /// `-1` lets every partition fetch concurrently, `0` and `1` fetch one partition at a time.
    pub max_degree_of_parallelism: i32,

    /// The number of items in each page returned to the caller, also passed to each partition as a page size hint.
    pub max_item_count: Option<usize>,

    /// Restricts the query to the partition key range containing this effective partition key.
    pub partition_key: Option<String>,

    /// Restricts the query to a single partition key range.
    pub partition_key_range_id: Option<String>,

    /// A continuation token returned by an earlier page of the same query.
    pub request_continuation: Option<String>,

    /// Fails any single partition request that takes longer than this.
    #[serde(deserialize_with = "deserialize_millis")]
    pub request_timeout: Option<Duration>,
}

fn deserialize_millis<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<Duration>, D::Error> {
    let millis: Option<u64> = Deserialize::deserialize(deserializer)?;
    Ok(millis.map(Duration::from_millis))
}

impl QueryOptions {
    pub fn with_cross_partition_query(mut self, enabled: bool) -> Self {
        self.enable_cross_partition_query = enabled;
        self
    }

    pub fn with_max_degree_of_parallelism(mut self, dop: i32) -> Self {
        self.max_degree_of_parallelism = dop;
        self
    }

    pub fn with_max_item_count(mut self, count: usize) -> Self {
        self.max_item_count = Some(count);
        self
    }

    pub fn with_partition_key(mut self, effective_partition_key: impl Into<String>) -> Self {
        self.partition_key = Some(effective_partition_key.into());
        self
    }

    pub fn with_partition_key_range_id(mut self, pkrange_id: impl Into<String>) -> Self {
        self.partition_key_range_id = Some(pkrange_id.into());
        self
    }

    pub fn with_continuation(mut self, continuation: impl Into<String>) -> Self {
        self.request_continuation = Some(continuation.into());
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub(crate) fn validate(&self) -> crate::Result<()> {
        if self.max_degree_of_parallelism < -1 {
            return Err(ErrorKind::InvalidArgument.with_message(format!(
                "maxDegreeOfParallelism must be -1 or greater, but was {}",
                self.max_degree_of_parallelism
            )));
        }
        if self.max_item_count == Some(0) {
            return Err(ErrorKind::InvalidArgument
                .with_message("maxItemCount must be greater than zero"));
        }
        if self.partition_key.is_some() && self.partition_key_range_id.is_some() {
            return Err(ErrorKind::InvalidArgument.with_message(
                "partitionKey and partitionKeyRangeId cannot both be specified",
            ));
        }
        Ok(())
    }

    pub(crate) fn page_size(&self) -> usize {
        self.max_item_count.unwrap_or(DEFAULT_MAX_ITEM_COUNT)
    }

    /// The number of partitions that may fetch concurrently, given the number of partitions targeted.
    pub(crate) fn concurrency(&self, partition_count: usize) -> usize {
        match self.max_degree_of_parallelism {
            -1 => partition_count.max(1),
            0 | 1 => 1,
            n => (n as usize).min(partition_count.max(1)),
        }
    }
}
