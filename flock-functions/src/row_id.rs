//! Validation of `flock_row_id` values returned by the provider.

use flock_core::{ColumnBatch, FlockResult, ResponseError};
use serde_json::Value;
use std::collections::HashSet;

/// The ids a tagged batch was sent with.
pub(crate) fn valid_ids(tagged: &ColumnBatch) -> HashSet<String> {
    tagged.row_ids().into_iter().collect()
}

/// Map one returned id back to a row index.
///
/// Integers and integer strings are accepted; the id must be one of
/// `valid`.
pub(crate) fn parse_row_id(item: &Value, valid: &HashSet<String>) -> FlockResult<usize> {
    let id = match item {
        Value::Number(n) if n.is_i64() || n.is_u64() => n.to_string(),
        Value::String(s) => s.clone(),
        other => {
            return Err(ResponseError::UnexpectedIdType {
                value: other.to_string(),
            }
            .into())
        }
    };
    if !valid.contains(&id) {
        return Err(ResponseError::UnknownRowId { id }.into());
    }
    id.parse::<usize>()
        .map_err(|_| ResponseError::UnknownRowId { id }.into())
}

/// Validate a full ranking of `expected` rows: known ids, no duplicates,
/// every row ranked.
pub(crate) fn parse_ranking(items: &[Value], valid: &HashSet<String>, expected: usize) -> FlockResult<Vec<usize>> {
    let mut seen = HashSet::with_capacity(items.len());
    let mut order = Vec::with_capacity(items.len());
    for item in items {
        let index = parse_row_id(item, valid)?;
        if !seen.insert(index) {
            return Err(ResponseError::DuplicateRowId {
                id: index.to_string(),
            }
            .into());
        }
        order.push(index);
    }
    if order.len() != expected {
        return Err(ResponseError::IncompleteRanking {
            expected,
            got: order.len(),
        }
        .into());
    }
    Ok(order)
}
