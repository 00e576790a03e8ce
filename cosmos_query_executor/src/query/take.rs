// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::{
    query::{ContinuationCodec, TakeContinuationToken},
    ErrorKind,
};

/// Enforces `TOP n`, `LIMIT n` and `OFFSET m` on the stream of results produced for the caller.
///
/// The limiter sits at the outside of the execution, so `OFFSET` skips items without affecting the number the query may return.
/// Once the query has returned all the items it may, the limiter is exhausted and the query ends, even if partitions have more data.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TakeLimiter {
    take: u64,
    offset: u64,

    /// The number of items that may still be returned.
    remaining_take: u64,

    /// The number of items that must still be skipped before any are returned.
    remaining_skip: u64,
}

impl TakeLimiter {
    pub fn new(take: u64, offset: u64) -> Self {
        Self {
            take,
            offset,
            remaining_take: take,
            remaining_skip: offset,
        }
    }

    /// Picks up counting from where an earlier page of the same query left off.
    ///
    /// A token that claims more items remain than the query allows did not come from this query, and is rejected.
    pub fn resume(&mut self, token: &TakeContinuationToken) -> crate::Result<()> {
        if token.take_count > self.take || token.skip_count > self.offset {
            return Err(ErrorKind::MalformedContinuation.with_message(format!(
                "continuation allows {} more items after skipping {}, but the query only allows {} after skipping {}",
                token.take_count, token.skip_count, self.take, self.offset
            )));
        }
        self.remaining_take = token.take_count;
        self.remaining_skip = token.skip_count;
        Ok(())
    }

    pub fn remaining(&self) -> u64 {
        self.remaining_take
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining_take == 0
    }

    /// Counts one item from upstream, returning `true` if it should be returned to the caller.
    pub fn admit(&mut self) -> bool {
        if self.remaining_skip > 0 {
            self.remaining_skip -= 1;
            return false;
        }
        if self.remaining_take == 0 {
            return false;
        }

        self.remaining_take -= 1;
        if self.remaining_take == 0 {
            tracing::debug!("limit reached, terminating query");
        }
        true
    }

    /// Applies the limits to a whole page of upstream items.
    pub fn limit_page<T>(&mut self, items: Vec<T>) -> Vec<T> {
        items.into_iter().filter(|_| self.admit()).collect()
    }

    /// Wraps the continuation of the limited query so that a resumed query keeps counting from here.
    ///
    /// Returns `None` once the limiter is exhausted, since a query that returned everything it may is never resumed.
    pub fn wrap_continuation(&self, source_token: Option<String>) -> crate::Result<Option<String>> {
        match source_token {
            Some(source_token) if !self.is_exhausted() => TakeContinuationToken {
                take_count: self.remaining_take,
                skip_count: self.remaining_skip,
                source_token,
            }
            .serialize_token()
            .map(Some),
            _ => Ok(None),
        }
    }
}
