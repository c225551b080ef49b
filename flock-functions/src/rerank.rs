//! `llm_rerank`: sliding-window tournament ranking of a group's rows.

use crate::batch::{retry_on_overflow, BatchSizePolicy};
use crate::bind::Invocation;
use crate::row_id::{parse_ranking, valid_ids};
use flock_core::{ColumnBatch, FlockResult, DEFAULT_BATCH_SIZE};
use flock_llm::{CompletionRequest, OutputType};

/// Rank every row of `batch`, returning the rows in ranked order.
///
/// A window holds the rows carried over from the previous window followed
/// by as many new rows as fit in the batch size. The provider ranks the
/// whole window; the lower half of the returned order is final and
/// appended to the output as returned, the upper half is carried into the
/// next window. Once every row has been admitted the remaining carry is
/// flushed to the output.
///
/// Only the default batch size is clamped to the row count.
pub fn rerank(inv: &mut Invocation<'_>, batch: &ColumnBatch) -> FlockResult<ColumnBatch> {
    let rows = batch.row_count();
    if rows <= 1 {
        return Ok(batch.clone());
    }

    let batch = inv.transcribe(batch)?;
    let configured = inv.batch_size();
    let configured = if configured == i64::from(DEFAULT_BATCH_SIZE) {
        configured.min(i64::try_from(rows).unwrap_or(i64::MAX))
    } else {
        configured
    };
    let mut policy = BatchSizePolicy::new(configured)?;

    let mut ranked = batch.empty_like();
    let mut carry = batch.empty_like();
    let mut start = 0;

    while start < rows || !carry.is_empty() {
        // The carry is only replaced after a successful ranking, so an
        // overflow retries the same window contents with less intake.
        let (window, end, order) = retry_on_overflow(&mut policy, |size| {
            let room = size.saturating_sub(carry.row_count());
            let end = start.saturating_add(room).min(rows);
            let mut window = carry.clone();
            window.append(batch.slice(start, end - start));
            let order = rank_window(inv, &window)?;
            Ok((window, end, order))
        })?;

        let half = order.len() / 2;
        ranked.append(window.select_rows(&order[half..]));
        carry = window.select_rows(&order[..half]);
        start = end;

        tracing::debug!(
            window = window.row_count(),
            finalized = order.len() - half,
            carried = half,
            admitted = start,
            "Ranked window"
        );

        if start >= rows && !carry.is_empty() {
            ranked.append(std::mem::replace(&mut carry, batch.empty_like()));
        }
    }

    Ok(ranked)
}

/// Provider ranking of `window` as row indices, best first.
fn rank_window(inv: &mut Invocation<'_>, window: &ColumnBatch) -> FlockResult<Vec<usize>> {
    let rows = window.row_count();
    if rows <= 1 {
        return Ok((0..rows).collect());
    }
    let tagged = window.with_row_ids();
    let valid = valid_ids(&tagged);
    let rendered = inv.render(&tagged)?;
    let request = CompletionRequest::new(rendered.prompt, rows, OutputType::Integer).with_media(rendered.media);
    let items = inv.model.complete(request)?.into_items()?;
    parse_ranking(&items, &valid, rows)
}
