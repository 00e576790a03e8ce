// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::{cmp::Ordering, fmt::Display};

use crate::ErrorKind;

/// Helper struct for wrapping document results in the gateway format
#[derive(Deserialize, Serialize)]
struct DocumentResult<T> {
    #[serde(rename = "Documents")]
    documents: Vec<T>,
}

/// Helper struct for ORDER BY query results
#[derive(Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct OrderByRow {
    #[serde(rename = "_rid")]
    rid: String,
    order_by_items: Vec<OrderByValue>,
    payload: Box<serde_json::value::RawValue>,
}

/// Describes the expected shape of the query result.
///
/// The results the gateway gives us can vary in shape depending on the type of query executed.
/// However, to properly move through the pipeline, we want a normalized representation of the results.
/// This enum describes the expected shape, and provides deserialization logic to convert from the raw gateway response into a list of normalized [`QueryResult`]s.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueryResultShape {
    /// The result will be just the raw payload, with no additional metadata.
    RawPayload,

    /// The payload is the result of a rewritten `ORDER BY` query: `{"_rid": ..., "orderByItems": [...], "payload": ...}`.
    OrderBy,
}

impl QueryResultShape {
    pub fn results_from_slice(self, buffer: &[u8]) -> crate::Result<Vec<QueryResult>> {
        match self {
            QueryResultShape::RawPayload => {
                let results: DocumentResult<Box<serde_json::value::RawValue>> =
                    serde_json::from_slice(buffer)
                        .map_err(|e| ErrorKind::InvalidGatewayResponse.with_source(e))?;
                Ok(results
                    .documents
                    .into_iter()
                    .map(QueryResult::from_payload)
                    .collect())
            }
            QueryResultShape::OrderBy => {
                let results: DocumentResult<OrderByRow> = serde_json::from_slice(buffer)
                    .map_err(|e| ErrorKind::InvalidGatewayResponse.with_source(e))?;
                Ok(results
                    .documents
                    .into_iter()
                    .map(|row| QueryResult {
                        rid: Some(row.rid),
                        order_by_items: row.order_by_items,
                        payload: row.payload,
                    })
                    .collect())
            }
        }
    }

    /// Serializes a list of [`QueryResult`]s back into the JSON format returned by the gateway.
    ///
    /// This is primarily useful for transports and tests that need to simulate gateway responses.
    pub fn results_to_vec(self, results: &[QueryResult]) -> crate::Result<Vec<u8>> {
        match self {
            QueryResultShape::RawPayload => {
                let documents = results.iter().map(|r| r.payload.clone()).collect();
                serde_json::to_vec(&DocumentResult { documents })
                    .map_err(|e| ErrorKind::InternalError.with_source(e))
            }
            QueryResultShape::OrderBy => {
                let documents = results
                    .iter()
                    .map(|r| {
                        let rid = r.rid.clone().ok_or_else(|| {
                            ErrorKind::InternalError
                                .with_message("ORDER BY results must have a resource id")
                        })?;
                        Ok(OrderByRow {
                            rid,
                            order_by_items: r.order_by_items.clone(),
                            payload: r.payload.clone(),
                        })
                    })
                    .collect::<crate::Result<Vec<_>>>()?;
                serde_json::to_vec(&DocumentResult { documents })
                    .map_err(|e| ErrorKind::InternalError.with_source(e))
            }
        }
    }
}

/// Represents a single result produced by one partition.
///
/// When a query has an `ORDER BY` clause, the gateway rewrites it so that each result carries the values of its sort terms and its resource ID next to the actual payload.
#[derive(Clone, Debug)]
pub struct QueryResult {
    /// The resource ID of the document, used to break ties between results with equal sort keys.
    pub rid: Option<String>,

    /// The values used for ordering the results, one per `ORDER BY` term.
    pub order_by_items: Vec<OrderByValue>,

    /// The actual payload of the query result.
    pub payload: Box<serde_json::value::RawValue>,
}

impl QueryResult {
    pub fn from_payload(payload: Box<serde_json::value::RawValue>) -> Self {
        Self {
            rid: None,
            order_by_items: Vec::new(),
            payload,
        }
    }

    pub fn rid(&self) -> &str {
        self.rid.as_deref().unwrap_or_default()
    }
}

/// The type of an [`OrderByValue`], in sort order.
///
/// When values of different types are compared, the type decides the order: `undefined` sorts before `null`, which sorts before booleans, then numbers, then strings.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum OrderByValueKind {
    Undefined,
    Null,
    Boolean,
    Number,
    String,
    NonPrimitive,
}

impl Display for OrderByValueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderByValueKind::Undefined => write!(f, "undefined"),
            OrderByValueKind::Null => write!(f, "null"),
            OrderByValueKind::Boolean => write!(f, "boolean"),
            OrderByValueKind::Number => write!(f, "number"),
            OrderByValueKind::String => write!(f, "string"),
            OrderByValueKind::NonPrimitive => write!(f, "object or array"),
        }
    }
}

/// The value of a single `ORDER BY` term for one result.
///
/// On the wire, these are `{"item": <value>}` objects, where a missing `item` property means the term was undefined for that document.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum OrderByValue {
    #[default]
    Undefined,
    Null,
    Boolean(bool),
    Number(serde_json::Number),
    String(String),

    /// An object or array. These are carried through deserialization so that they can be reported, but they cannot be compared.
    NonPrimitive(serde_json::Value),
}

impl OrderByValue {
    pub fn kind(&self) -> OrderByValueKind {
        match self {
            OrderByValue::Undefined => OrderByValueKind::Undefined,
            OrderByValue::Null => OrderByValueKind::Null,
            OrderByValue::Boolean(_) => OrderByValueKind::Boolean,
            OrderByValue::Number(_) => OrderByValueKind::Number,
            OrderByValue::String(_) => OrderByValueKind::String,
            OrderByValue::NonPrimitive(_) => OrderByValueKind::NonPrimitive,
        }
    }

    /// Compares two [`OrderByValue`]s based on the ordering rules defined for Cosmos DB.
    ///
    /// We can't just implement [`PartialOrd`] here, because we need to be able to return an error.
    pub fn compare(&self, other: &Self) -> crate::Result<Ordering> {
        let (left_kind, right_kind) = (self.kind(), other.kind());
        if left_kind == OrderByValueKind::NonPrimitive
            || right_kind == OrderByValueKind::NonPrimitive
        {
            return Err(ErrorKind::UnsupportedComparison
                .with_message("cannot compare non-primitive values"));
        }
        if left_kind != right_kind {
            return Ok(left_kind.cmp(&right_kind));
        }

        match (self, other) {
            (OrderByValue::Undefined, OrderByValue::Undefined)
            | (OrderByValue::Null, OrderByValue::Null) => Ok(Ordering::Equal),
            (OrderByValue::Boolean(left), OrderByValue::Boolean(right)) => Ok(left.cmp(right)),
            (OrderByValue::String(left), OrderByValue::String(right)) => Ok(left.cmp(right)),
            (OrderByValue::Number(left), OrderByValue::Number(right)) => {
                compare_numbers(left, right)
            }
            _ => Err(ErrorKind::InternalError.with_message(
                "encountered different types after comparing type ordinal, this shouldn't be possible",
            )),
        }
    }
}

fn compare_numbers(left: &serde_json::Number, right: &serde_json::Number) -> crate::Result<Ordering> {
    // Try integer comparison first, so large integers don't lose precision.
    if let (Some(l), Some(r)) = (left.as_i64(), right.as_i64()) {
        return Ok(l.cmp(&r));
    }
    if let (Some(l), Some(r)) = (left.as_u64(), right.as_u64()) {
        return Ok(l.cmp(&r));
    }

    let not_comparable = || {
        ErrorKind::InvalidGatewayResponse
            .with_message("encountered NaN or Infinity while comparing floats")
    };
    let l = left.as_f64().ok_or_else(not_comparable)?;
    let r = right.as_f64().ok_or_else(not_comparable)?;
    l.partial_cmp(&r).ok_or_else(not_comparable)
}

impl From<serde_json::Value> for OrderByValue {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => OrderByValue::Null,
            serde_json::Value::Bool(b) => OrderByValue::Boolean(b),
            serde_json::Value::Number(n) => OrderByValue::Number(n),
            serde_json::Value::String(s) => OrderByValue::String(s),
            value => OrderByValue::NonPrimitive(value),
        }
    }
}

impl OrderByValue {
    /// Converts this value back to JSON, returning `None` for [`OrderByValue::Undefined`].
    pub fn to_json(&self) -> Option<serde_json::Value> {
        match self {
            OrderByValue::Undefined => None,
            OrderByValue::Null => Some(serde_json::Value::Null),
            OrderByValue::Boolean(b) => Some(serde_json::Value::Bool(*b)),
            OrderByValue::Number(n) => Some(serde_json::Value::Number(n.clone())),
            OrderByValue::String(s) => Some(serde_json::Value::String(s.clone())),
            OrderByValue::NonPrimitive(v) => Some(v.clone()),
        }
    }
}

/// The `{"item": <value>}` form used by the gateway.
#[derive(Deserialize, Serialize)]
struct ClauseItem {
    #[serde(
        default,
        deserialize_with = "deserialize_item",
        skip_serializing_if = "Option::is_none"
    )]
    item: Option<serde_json::Value>,
}

// Based on https://github.com/serde-rs/serde/issues/984#issuecomment-314143738
// This will deserialize a missing field to `None`, a present-but-null field to `Some(serde_json::Value::Null)` and a present-non-null field to `Some(value)`.
fn deserialize_item<'de, T, D>(deserializer: D) -> Result<Option<T>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Deserialize::deserialize(deserializer).map(Some)
}

impl Serialize for OrderByValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let clause = ClauseItem {
            item: self.to_json(),
        };
        clause.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for OrderByValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let clause = ClauseItem::deserialize(deserializer)?;
        Ok(clause.item.map(OrderByValue::from).unwrap_or_default())
    }
}
