//! `llm_first` / `llm_last`: pick the single most (or least) relevant row.

use crate::batch::{for_each_batch, BatchSizePolicy};
use crate::bind::Invocation;
use crate::row_id::{parse_row_id, valid_ids};
use flock_core::{ColumnBatch, FlockResult, ResponseError, ValidationError};
use flock_llm::{CompletionRequest, OutputType};

/// Select the winning row of `batch`, returned as a one-row batch.
///
/// Groups of at most one row are returned as is without a provider call.
/// Otherwise the rows are walked in sub-batches and a running champion is
/// kept: each window is the current champion followed by the next
/// sub-batch, tagged with fresh `flock_row_id`s, and the provider picks one
/// id from it.
pub fn first_or_last(inv: &mut Invocation<'_>, batch: &ColumnBatch) -> FlockResult<ColumnBatch> {
    let rows = batch.row_count();
    if rows <= 1 {
        return Ok(batch.slice(0, 1));
    }
    if inv.user_prompt.is_empty() {
        return Err(ValidationError::EmptyPrompt.into());
    }

    let batch = inv.transcribe(batch)?;
    let mut policy = BatchSizePolicy::clamped(inv.batch_size(), rows)?;

    let mut champion: Option<ColumnBatch> = None;
    for_each_batch(&batch, &mut policy, |sub_batch| {
        let window = match &champion {
            Some(current) => {
                let mut window = current.clone();
                window.append(sub_batch);
                window
            }
            None => sub_batch,
        };
        let winner = select_winner(inv, &window)?;
        champion = Some(window.row(winner));
        Ok(())
    })?;

    Ok(champion.unwrap_or_else(|| batch.slice(0, 1)))
}

/// Index of the row the provider picks from `window`.
fn select_winner(inv: &mut Invocation<'_>, window: &ColumnBatch) -> FlockResult<usize> {
    if window.row_count() <= 1 {
        return Ok(0);
    }
    let tagged = window.with_row_ids();
    let valid = valid_ids(&tagged);
    let rendered = inv.render(&tagged)?;
    let request = CompletionRequest::new(rendered.prompt, 1, OutputType::Integer).with_media(rendered.media);
    let items = inv.model.complete(request)?.into_items()?;
    let first = items
        .first()
        .ok_or(ResponseError::TooFewItems { expected: 1, got: 0 })?;
    let winner = parse_row_id(first, &valid)?;
    tracing::debug!(window = window.row_count(), winner, "Selected row");
    Ok(winner)
}
