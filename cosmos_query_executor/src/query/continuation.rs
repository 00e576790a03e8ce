// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Continuation tokens, and the codec that turns them into the opaque strings handed to callers.
//!
//! A resumable query hands the caller a continuation string with every page that isn't the last.
//! There are three token shapes:
//!
//! * [`CompositeContinuationToken`]: resume one partition key range from a partition-native continuation.
//!   Unordered queries use a list of these, one per partition that isn't exhausted.
//! * [`OrderByContinuationToken`]: a composite token plus the sort key and resource ID of the last item consumed by the merge.
//!   `ORDER BY` queries use a list of these, one per partition that isn't exhausted.
//! * [`TakeContinuationToken`]: wraps the serialized form of one of the other tokens for `TOP`/`LIMIT` queries, remembering how many items may still be returned.
//!
//! The tokens are JSON. Field names are stable, and unknown fields are rejected so that a string produced by something else is never mistaken for a token.

use std::collections::HashSet;

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::{
    query::{OrderByValue, OrderByValueKind, PartitionKeyRange, QueryRange},
    ErrorKind,
};

/// Serialization and parsing shared by all continuation token shapes.
pub trait ContinuationCodec: Serialize + DeserializeOwned {
    /// Checks the invariants that the JSON shape alone doesn't express.
    fn is_valid(&self) -> bool;

    /// Serializes the token into the opaque string handed to callers.
    fn serialize_token(&self) -> crate::Result<String> {
        serde_json::to_string(self).map_err(|e| ErrorKind::InternalError.with_source(e))
    }

    /// Parses a token, returning `None` if the string is not a structurally valid token of this shape.
    ///
    /// This never fails in any other way, whatever the input.
    fn try_parse(value: &str) -> Option<Self> {
        let token: Self = serde_json::from_str(value).ok()?;
        token.is_valid().then_some(token)
    }

    /// Parses a token, reporting an invalid string as [`ErrorKind::MalformedContinuation`].
    fn parse(value: &str) -> crate::Result<Self> {
        Self::try_parse(value).ok_or_else(|| {
            ErrorKind::MalformedContinuation
                .with_message(format!("invalid continuation token: {value}"))
        })
    }
}

/// Resumes fetching the partition key range identified by `range`, using the partition-native continuation `token`.
///
/// A missing `token` means "start of partition".
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CompositeContinuationToken {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    pub range: QueryRange,
}

impl CompositeContinuationToken {
    pub fn new(token: Option<String>, range: QueryRange) -> Self {
        Self { token, range }
    }

    pub fn for_pkrange(pkrange: &PartitionKeyRange, token: Option<String>) -> Self {
        Self::new(token, pkrange.range())
    }

    /// Indicates if this token refers to the given partition key range.
    pub fn targets(&self, pkrange: &PartitionKeyRange) -> bool {
        self.range == pkrange.range()
    }
}

impl ContinuationCodec for CompositeContinuationToken {
    fn is_valid(&self) -> bool {
        self.range.is_valid()
    }
}

/// Resumes the `ORDER BY` merge for one partition key range.
///
/// Items from the partition that sort before the anchor (`order_by_items` and `rid`) were already consumed and are skipped on resume.
/// An item exactly matching the anchor is re-emitted only when `inclusive` is set.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct OrderByContinuationToken {
    pub composite_token: CompositeContinuationToken,
    pub order_by_items: Vec<OrderByValue>,
    pub rid: String,
    pub inclusive: bool,
}

impl ContinuationCodec for OrderByContinuationToken {
    fn is_valid(&self) -> bool {
        self.composite_token.is_valid()
            && !self.order_by_items.is_empty()
            && self
                .order_by_items
                .iter()
                .all(|i| i.kind() != OrderByValueKind::NonPrimitive)
    }
}

/// Limits a resumed `TOP`/`LIMIT` query to the items it may still return.
///
/// `source_token` is the serialized continuation of the query being limited. `skip_count` is the part of an `OFFSET` not yet skipped.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TakeContinuationToken {
    pub take_count: u64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub skip_count: u64,
    pub source_token: String,
}

fn is_zero(value: &u64) -> bool {
    *value == 0
}

impl ContinuationCodec for TakeContinuationToken {
    fn is_valid(&self) -> bool {
        !self.source_token.is_empty()
    }
}

/// Any continuation token produced by the engine.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ContinuationToken {
    Take(TakeContinuationToken),
    OrderBy(Vec<OrderByContinuationToken>),
    Composite(Vec<CompositeContinuationToken>),
}

impl ContinuationToken {
    /// Describes the shape of the token, for error messages.
    pub fn shape(&self) -> &'static str {
        match self {
            ContinuationToken::Take(_) => "TOP/LIMIT",
            ContinuationToken::OrderBy(_) => "ORDER BY",
            ContinuationToken::Composite(_) => "unordered",
        }
    }
}

fn distinct_ranges<'a>(ranges: impl Iterator<Item = &'a QueryRange>) -> bool {
    let mut seen = HashSet::new();
    ranges.into_iter().all(|r| seen.insert(r))
}

impl ContinuationCodec for ContinuationToken {
    fn is_valid(&self) -> bool {
        match self {
            ContinuationToken::Take(token) => token.is_valid(),
            ContinuationToken::OrderBy(tokens) => {
                let Some(first) = tokens.first() else {
                    return false;
                };
                tokens.iter().all(|t| {
                    t.is_valid() && t.order_by_items.len() == first.order_by_items.len()
                }) && distinct_ranges(tokens.iter().map(|t| &t.composite_token.range))
            }
            ContinuationToken::Composite(tokens) => {
                !tokens.is_empty()
                    && tokens.iter().all(|t| t.is_valid())
                    && distinct_ranges(tokens.iter().map(|t| &t.range))
            }
        }
    }
}
