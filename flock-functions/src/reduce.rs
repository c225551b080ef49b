//! `llm_reduce`: summarize a group batch by batch, carrying the summary.

use crate::batch::{for_each_batch, BatchSizePolicy};
use crate::bind::Invocation;
use flock_core::{ColumnBatch, FlockResult, ResponseError};
use flock_llm::{pretty_json, CompletionRequest, OutputType};
use serde_json::{json, Value};

/// Key under which the running summary is appended to each prompt.
pub const SUMMARY_KEY: &str = "Previous Batch Summary";

/// Reduce every row of `batch` to a single value.
///
/// Sub-batches are processed strictly in row order. Each prompt carries
/// `{"Previous Batch Summary": <last item>}` (empty for the first batch)
/// and asks for exactly one item; the last batch's item is the result.
pub fn reduce(inv: &mut Invocation<'_>, batch: &ColumnBatch) -> FlockResult<Value> {
    let batch = inv.transcribe(batch)?;
    let mut policy = BatchSizePolicy::clamped(inv.batch_size(), batch.row_count())?;

    let mut summary = json!({ SUMMARY_KEY: "" });
    for_each_batch(&batch, &mut policy, |sub_batch| {
        let item = reduce_batch(inv, &sub_batch, &summary)?;
        summary = json!({ SUMMARY_KEY: item });
        Ok(())
    })?;

    Ok(summary
        .as_object_mut()
        .and_then(|map| map.remove(SUMMARY_KEY))
        .unwrap_or(Value::Null))
}

fn reduce_batch(inv: &mut Invocation<'_>, sub_batch: &ColumnBatch, summary: &Value) -> FlockResult<Value> {
    let rendered = inv.render(sub_batch)?;
    let prompt = format!("{}\n\n{}", rendered.prompt, pretty_json(summary));
    let request = CompletionRequest::new(prompt, 1, OutputType::String).with_media(rendered.media);
    inv.model
        .complete(request)?
        .into_items()?
        .into_iter()
        .next()
        .ok_or_else(|| ResponseError::TooFewItems { expected: 1, got: 0 }.into())
}
