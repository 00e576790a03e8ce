// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::{cmp::Ordering, sync::Arc};

use crate::{
    query::{OrderByValue, OrderByValueKind, SortOrder},
    ErrorKind,
};

/// The sort key of one result: its `ORDER BY` values and its resource ID.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SortKey {
    pub items: Vec<OrderByValue>,
    pub rid: String,

    /// Set when a result equal to this key should still be produced on resume.
    pub inclusive: bool,
}

/// Compares results according to the `ORDER BY` clause of a query.
///
/// Each term may only ever hold values of one type.
/// The first value seen for a term fixes its type, and [`Sorting::check`] rejects any value of another type,
/// since mixing types (including documents where the term is undefined) would silently produce an order the user didn't ask for.
#[derive(Clone, Debug)]
pub struct Sorting {
    orders: Arc<[SortOrder]>,
    kinds: Vec<Option<OrderByValueKind>>,
}

impl Sorting {
    pub fn new(ordering: Vec<SortOrder>) -> Self {
        let kinds = vec![None; ordering.len()];
        Self {
            orders: Arc::from(ordering),
            kinds,
        }
    }

    /// Validates the sort values of an incoming result, locking in the type of each term the first time it's seen.
    pub fn check(&mut self, items: &[OrderByValue]) -> crate::Result<()> {
        if items.len() != self.orders.len() {
            return Err(ErrorKind::InvalidGatewayResponse.with_message(format!(
                "expected {} order by items, but the result has {}",
                self.orders.len(),
                items.len()
            )));
        }

        for (position, (item, locked)) in items.iter().zip(self.kinds.iter_mut()).enumerate() {
            let kind = item.kind();
            if kind == OrderByValueKind::NonPrimitive {
                return Err(ErrorKind::UnsupportedComparison.with_message(format!(
                    "ORDER BY term {position} has an {kind} value, which cannot be compared"
                )));
            }
            match locked {
                None => *locked = Some(kind),
                Some(expected) if *expected == kind => {}
                Some(expected) => {
                    return Err(ErrorKind::UnsupportedComparison.with_message(format!(
                        "ORDER BY term {position} mixes {expected} and {kind} values across documents"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Compares two sort keys, returning [`Ordering::Less`] if `left` must be produced before `right`.
    ///
    /// Each term is compared in its own direction. Results with equal terms are ordered by resource ID, ascending.
    pub fn compare(
        &self,
        left: &[OrderByValue],
        left_rid: &str,
        right: &[OrderByValue],
        right_rid: &str,
    ) -> crate::Result<Ordering> {
        if left.len() != right.len() || left.len() != self.orders.len() {
            return Err(ErrorKind::InvalidGatewayResponse
                .with_message("items have inconsistent numbers of order by items"));
        }

        let items = left.iter().zip(right.iter()).zip(self.orders.iter());
        for ((left, right), ordering) in items {
            let order = match ordering {
                SortOrder::Ascending => left.compare(right)?,
                SortOrder::Descending => left.compare(right)?.reverse(),
            };
            if order != Ordering::Equal {
                return Ok(order);
            }
        }

        Ok(left_rid.cmp(right_rid))
    }

    /// Compares a result against a resume anchor, returning `true` if the result has not been produced yet.
    pub fn follows(
        &self,
        items: &[OrderByValue],
        rid: &str,
        anchor: &SortKey,
    ) -> crate::Result<bool> {
        Ok(
            match self.compare(items, rid, &anchor.items, &anchor.rid)? {
                Ordering::Greater => true,
                Ordering::Equal => anchor.inclusive,
                Ordering::Less => false,
            },
        )
    }
}
