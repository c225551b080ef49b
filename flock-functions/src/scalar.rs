//! Row-wise functions: `llm_complete`, `llm_filter` and `llm_embedding`.

use crate::batch::{for_each_batch, BatchSizePolicy};
use crate::bind::{FunctionBinding, FunctionContext, Invocation};
use flock_core::{
    ColumnBatch, ContextInput, FlockResult, FunctionKind, LlmError, ValidationError, CONTEXT_COLUMNS_KEY,
};
use flock_llm::{CompletionRequest, OutputType};
use flock_metrics::StateId;
use serde_json::Value;
use std::time::Instant;

// ============================================================================
// BATCH AND COMPLETE
// ============================================================================

/// Output type requested for one row of `kind`.
fn output_type(kind: FunctionKind) -> OutputType {
    match kind {
        FunctionKind::Filter => OutputType::Bool,
        _ => OutputType::String,
    }
}

/// One completion for `sub_batch`, asking for one item per row.
pub fn complete(inv: &mut Invocation<'_>, sub_batch: &ColumnBatch) -> FlockResult<Vec<Value>> {
    let rendered = inv.render(sub_batch)?;
    let request = CompletionRequest::new(rendered.prompt, sub_batch.row_count(), output_type(inv.kind))
        .with_media(rendered.media);
    inv.model.complete(request)?.into_items()
}

/// Complete every row of `batch`, one returned value per row.
///
/// Rows are sent in sub-batches of the model's batch size (clamped to the
/// row count). A sub-batch whose response has too few items is padded with
/// nulls and one with too many is truncated, so the result always has
/// exactly `batch.row_count()` entries.
pub fn batch_and_complete(inv: &mut Invocation<'_>, batch: &ColumnBatch) -> FlockResult<Vec<Value>> {
    let rows = batch.row_count();
    if rows == 0 {
        return Ok(Vec::new());
    }
    let batch = inv.transcribe(batch)?;
    let mut policy = BatchSizePolicy::clamped(inv.batch_size(), rows)?;

    let mut results = Vec::with_capacity(rows);
    for_each_batch(&batch, &mut policy, |sub_batch| {
        let mut items = complete(inv, &sub_batch)?;
        fit_to_rows(&mut items, sub_batch.row_count());
        results.extend(items);
        Ok(())
    })?;
    Ok(results)
}

fn fit_to_rows(items: &mut Vec<Value>, rows: usize) {
    if items.len() != rows {
        tracing::warn!(
            expected = rows,
            got = items.len(),
            "Provider item count does not match row count"
        );
        items.resize(rows, Value::Null);
    }
}

// ============================================================================
// SQL FUNCTIONS
// ============================================================================

/// Run `op` as one metrics-tracked invocation of `binding`.
fn tracked<T, F>(ctx: &FunctionContext, binding: &FunctionBinding, op: F) -> FlockResult<T>
where
    F: FnOnce(&mut Invocation<'_>) -> FlockResult<T>,
{
    let session = ctx.metrics.start_invocation(StateId::next(), binding.kind);
    let started = Instant::now();
    let mut inv = binding.invocation(ctx, Some(session.clone()))?;
    let output = op(&mut inv)?;
    session.add_execution_time(started.elapsed());
    Ok(output)
}

/// Items for each row of `prompt_rows`, or a single bare-prompt answer
/// broadcast to every row when the prompt struct has no context columns.
fn complete_rows(inv: &mut Invocation<'_>, prompt_rows: &[Value]) -> FlockResult<Vec<Value>> {
    if prompt_rows.is_empty() {
        return Ok(Vec::new());
    }
    match ContextInput::from_rows(prompt_rows)?.columns {
        Some(columns) if columns.column_count() > 0 => batch_and_complete(inv, &columns),
        _ => {
            let request = CompletionRequest::new(inv.user_prompt, 1, output_type(inv.kind));
            let answer = inv
                .model
                .complete(request)?
                .into_items()?
                .into_iter()
                .next()
                .unwrap_or(Value::Null);
            Ok(vec![answer; prompt_rows.len()])
        }
    }
}

/// `llm_complete(model, prompt)`: one text answer per row.
///
/// String items are returned as is; any other item is JSON-encoded.
pub fn llm_complete(
    ctx: &FunctionContext,
    binding: &FunctionBinding,
    prompt_rows: &[Value],
) -> FlockResult<Vec<String>> {
    tracked(ctx, binding, |inv| {
        Ok(complete_rows(inv, prompt_rows)?
            .into_iter()
            .map(|item| match item {
                Value::String(text) => text,
                other => other.to_string(),
            })
            .collect())
    })
}

/// `llm_filter(model, prompt)`: one boolean per row. A null item counts
/// as `true`.
pub fn llm_filter(ctx: &FunctionContext, binding: &FunctionBinding, prompt_rows: &[Value]) -> FlockResult<Vec<bool>> {
    tracked(ctx, binding, |inv| {
        let provider = inv.model.details().provider_name.clone();
        complete_rows(inv, prompt_rows)?
            .into_iter()
            .map(|item| filter_verdict(&item, &provider))
            .collect()
    })
}

fn filter_verdict(item: &Value, provider: &str) -> FlockResult<bool> {
    match item {
        Value::Null => Ok(true),
        Value::Bool(verdict) => Ok(*verdict),
        Value::String(text) if text.eq_ignore_ascii_case("true") => Ok(true),
        Value::String(text) if text.eq_ignore_ascii_case("false") => Ok(false),
        other => Err(LlmError::InvalidResponse {
            provider: provider.to_string(),
            reason: format!("expected a boolean filter verdict, got {}", other),
        }
        .into()),
    }
}

/// `llm_embedding(model, inputs)`: one embedding vector per row.
///
/// The input struct may only hold `context_columns`, and image columns are
/// rejected. Each row is embedded as its column values joined by spaces.
pub fn llm_embedding(
    ctx: &FunctionContext,
    binding: &FunctionBinding,
    input_rows: &[Value],
) -> FlockResult<Vec<Vec<f64>>> {
    for row in input_rows {
        if let Some(object) = row.as_object() {
            if let Some(key) = object.keys().find(|key| key.as_str() != CONTEXT_COLUMNS_KEY) {
                return Err(ValidationError::UnexpectedInputKey { key: key.clone() }.into());
            }
        }
    }
    let columns = ContextInput::from_rows(input_rows)?.require_columns()?;
    if columns.columns().iter().any(|c| c.is_image()) {
        return Err(ValidationError::ImageEmbeddingUnsupported.into());
    }

    tracked(ctx, binding, |inv| {
        let columns = inv.transcribe(&columns)?;
        let inputs = embedding_inputs(&columns);
        if inputs.is_empty() {
            return Ok(Vec::new());
        }

        let chunk = match usize::try_from(inv.batch_size()) {
            Ok(size) if size > 0 && size <= inputs.len() => size,
            _ => inputs.len(),
        };
        for chunk_inputs in inputs.chunks(chunk) {
            inv.model.add_embedding_request(chunk_inputs.to_vec());
        }

        let provider = inv.model.details().provider_name.clone();
        let mut embeddings = Vec::with_capacity(inputs.len());
        for response in inv.model.collect_embeddings()? {
            let vectors = response.body.as_array().ok_or_else(|| LlmError::InvalidResponse {
                provider: provider.clone(),
                reason: "embedding response is not an array".to_string(),
            })?;
            for vector in vectors {
                embeddings.push(parse_embedding(vector, &provider)?);
            }
        }
        if embeddings.len() != inputs.len() {
            return Err(LlmError::ResponseCountMismatch {
                expected: inputs.len(),
                got: embeddings.len(),
            }
            .into());
        }
        Ok(embeddings)
    })
}

/// Per-row embedding input: each column's value followed by a space.
fn embedding_inputs(columns: &ColumnBatch) -> Vec<String> {
    (0..columns.row_count())
        .map(|row| {
            columns
                .columns()
                .iter()
                .map(|column| match column.data.get(row) {
                    Some(Value::String(text)) => format!("{} ", text),
                    Some(Value::Null) | None => " ".to_string(),
                    Some(other) => format!("{} ", other),
                })
                .collect()
        })
        .collect()
}

fn parse_embedding(vector: &Value, provider: &str) -> FlockResult<Vec<f64>> {
    let invalid = || LlmError::InvalidResponse {
        provider: provider.to_string(),
        reason: format!("embedding is not an array of numbers: {}", vector),
    };
    vector
        .as_array()
        .ok_or_else(invalid)?
        .iter()
        .map(|x| x.as_f64().ok_or_else(invalid).map_err(Into::into))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use flock_core::{Column, ColumnType, FlockError};
    use flock_test_utils::{fixtures, ScriptedFactory, ScriptedReply};
    use serde_json::json;
    use std::sync::Arc;

    fn setup(kind: FunctionKind, batch_size: i32, prompt: Value) -> (ScriptedFactory, FunctionContext, FunctionBinding) {
        let factory = ScriptedFactory::new();
        let ctx = FunctionContext::new(factory.as_factory(), Arc::new(fixtures::config_store()));
        let binding = FunctionBinding::bind(kind, &[fixtures::model_args(batch_size), prompt], &ctx).unwrap();
        (factory, ctx, binding)
    }

    #[test]
    fn test_complete_batches_rows() {
        let (factory, ctx, binding) = setup(FunctionKind::Complete, 2, fixtures::prompt_arg("Describe"));
        let rows = fixtures::prompt_rows("Describe", &fixtures::text_batch(5));

        let out = llm_complete(&ctx, &binding, &rows).unwrap();
        assert_eq!(
            out,
            vec!["response_0", "response_1", "response_0", "response_1", "response_0"]
        );

        let requests = factory.requests();
        assert_eq!(
            requests.iter().map(|r| r.num_output_tuples).collect::<Vec<_>>(),
            vec![2, 2, 1]
        );
        assert!(requests.iter().all(|r| r.output_type == OutputType::String));
        assert!(requests[1].prompt.contains("row 3"));
        assert!(!requests[1].prompt.contains("row 4"));
        assert_eq!(factory.providers_created(), 1);
    }

    #[test]
    fn test_complete_pads_and_truncates() {
        let (factory, ctx, binding) = setup(FunctionKind::Complete, 2, fixtures::prompt_arg("Describe"));
        factory
            .push_items(vec![json!("only one")])
            .push_items(vec![json!("a"), json!("b"), json!("c")]);
        let rows = fixtures::prompt_rows("Describe", &fixtures::text_batch(4));

        let out = llm_complete(&ctx, &binding, &rows).unwrap();
        assert_eq!(out, vec!["only one", "null", "a", "b"]);
    }

    #[test]
    fn test_complete_without_context_broadcasts() {
        let (factory, ctx, binding) = setup(FunctionKind::Complete, 8, json!({ "prompt": "Say hi" }));
        factory.push_items(vec![json!({ "greeting": "hi" })]);
        let rows = vec![json!({ "prompt": "Say hi" }); 3];

        let out = llm_complete(&ctx, &binding, &rows).unwrap();
        assert_eq!(out, vec![r#"{"greeting":"hi"}"#; 3]);

        let requests = factory.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].prompt, "Say hi");
        assert_eq!(requests[0].num_output_tuples, 1);
    }

    #[test]
    fn test_complete_overflow_shrinks_batch() {
        let (factory, ctx, binding) = setup(FunctionKind::Complete, 4, fixtures::prompt_arg("Describe"));
        factory.push_overflow();
        let rows = fixtures::prompt_rows("Describe", &fixtures::text_batch(4));

        let out = llm_complete(&ctx, &binding, &rows).unwrap();
        assert_eq!(out.len(), 4);
        assert_eq!(
            factory
                .requests()
                .iter()
                .map(|r| r.num_output_tuples)
                .collect::<Vec<_>>(),
            vec![4, 3, 1]
        );
    }

    #[test]
    fn test_filter_verdicts() {
        let (factory, ctx, binding) = setup(FunctionKind::Filter, 8, fixtures::prompt_arg("Is it good?"));
        factory.push_items(vec![json!(true), json!(false), Value::Null, json!("FALSE")]);
        let rows = fixtures::prompt_rows("Is it good?", &fixtures::text_batch(4));

        let out = llm_filter(&ctx, &binding, &rows).unwrap();
        assert_eq!(out, vec![true, false, true, false]);
        assert_eq!(factory.requests()[0].output_type, OutputType::Bool);
    }

    #[test]
    fn test_filter_rejects_non_boolean() {
        let (factory, ctx, binding) = setup(FunctionKind::Filter, 8, fixtures::prompt_arg("Is it good?"));
        factory.push_items(vec![json!("maybe")]);
        let rows = fixtures::prompt_rows("Is it good?", &fixtures::text_batch(1));
        assert!(matches!(
            llm_filter(&ctx, &binding, &rows),
            Err(FlockError::Llm(LlmError::InvalidResponse { .. }))
        ));
    }

    #[test]
    fn test_transcription_model_without_type_fails_before_any_call() {
        let (factory, ctx, binding) = setup(FunctionKind::Complete, 8, fixtures::prompt_arg("Describe"));
        let rows = vec![json!({
            "prompt": "Describe",
            "context_columns": [{ "data": "a.mp3", "transcription_model": "whisper" }]
        })];

        let result = llm_complete(&ctx, &binding, &rows);
        assert!(matches!(
            result,
            Err(FlockError::Validation(ValidationError::TranscriptionModelNotSupported { .. }))
        ));
        assert_eq!(factory.completion_count(), 0);
        assert!(factory.transcription_requests().is_empty());
    }

    #[test]
    fn test_audio_columns_are_transcribed_first() {
        let (factory, ctx, binding) = setup(FunctionKind::Complete, 8, fixtures::prompt_arg("Describe"));
        let batch = ColumnBatch::new(vec![Column::new("clip", vec![json!("a.mp3"), json!("b.mp3")])
            .with_type(ColumnType::Audio)
            .with_transcription_model(fixtures::TRANSCRIPTION_MODEL)]);
        let rows = fixtures::prompt_rows("Describe", &batch);

        llm_complete(&ctx, &binding, &rows).unwrap();
        assert_eq!(factory.transcription_requests(), vec![json!("a.mp3"), json!("b.mp3")]);
        let prompt = &factory.requests()[0].prompt;
        assert!(prompt.contains("transcription_of_clip"));
        assert!(prompt.contains("transcript of a.mp3"));
    }

    #[test]
    fn test_complete_records_one_invocation() {
        let (_factory, ctx, binding) = setup(FunctionKind::Complete, 2, fixtures::prompt_arg("Describe"));
        let rows = fixtures::prompt_rows("Describe", &fixtures::text_batch(3));
        llm_complete(&ctx, &binding, &rows).unwrap();

        let metrics = ctx.metrics.get_metrics();
        let entry = &metrics["llm_complete_1"];
        assert_eq!(entry["api_calls"], json!(2));
        assert_eq!(entry["input_tokens"], json!(20));
        assert_eq!(entry["output_tokens"], json!(10));
        assert_eq!(entry["model_name"], json!(fixtures::TEST_MODEL));
    }

    #[test]
    fn test_embedding_chunks_and_flattens() {
        let (factory, ctx, binding) = setup(FunctionKind::Embedding, 2, json!({ "context_columns": [] }));
        let batch = fixtures::text_batch(3);
        let rows: Vec<Value> = fixtures::prompt_rows("", &batch)
            .into_iter()
            .map(|row| json!({ "context_columns": row["context_columns"] }))
            .collect();

        let out = llm_embedding(&ctx, &binding, &rows).unwrap();
        assert_eq!(out.len(), 3);
        // "0 row 0 " -> 8 chars, 3 words
        assert_eq!(out[0], vec![8.0, 3.0]);

        let requests = factory.embedding_requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0], vec!["0 row 0 ".to_string(), "1 row 1 ".to_string()]);
        assert_eq!(requests[1].len(), 1);
    }

    #[test]
    fn test_embedding_count_mismatch_fails() {
        let (factory, ctx, binding) = setup(FunctionKind::Embedding, 2048, json!({ "context_columns": [] }));
        factory.push_embedding_body(json!([[1.0, 2.0]]));
        let rows: Vec<Value> = fixtures::prompt_rows("", &fixtures::text_batch(3))
            .into_iter()
            .map(|row| json!({ "context_columns": row["context_columns"] }))
            .collect();

        assert!(matches!(
            llm_embedding(&ctx, &binding, &rows),
            Err(FlockError::Llm(LlmError::ResponseCountMismatch { expected: 3, got: 1 }))
        ));
        assert_eq!(factory.embedding_requests().len(), 1);
    }

    #[test]
    fn test_embedding_validation() {
        let (factory, ctx, binding) = setup(FunctionKind::Embedding, 2, json!({ "context_columns": [] }));

        let extra_key = vec![json!({ "prompt": "x", "context_columns": [{ "data": "a" }] })];
        assert!(matches!(
            llm_embedding(&ctx, &binding, &extra_key),
            Err(FlockError::Validation(ValidationError::UnexpectedInputKey { .. }))
        ));

        let image = vec![json!({ "context_columns": [{ "data": "a.png", "type": "image" }] })];
        assert!(matches!(
            llm_embedding(&ctx, &binding, &image),
            Err(FlockError::Validation(ValidationError::ImageEmbeddingUnsupported))
        ));
        assert!(factory.embedding_requests().is_empty());
    }

    #[test]
    fn test_request_failure_propagates() {
        let (factory, ctx, binding) = setup(FunctionKind::Complete, 2, fixtures::prompt_arg("Describe"));
        factory.push_reply(ScriptedReply::Fail("503".to_string()));
        let rows = fixtures::prompt_rows("Describe", &fixtures::text_batch(3));
        assert!(matches!(
            llm_complete(&ctx, &binding, &rows),
            Err(FlockError::Llm(LlmError::RequestFailed { .. }))
        ));
        assert_eq!(factory.completion_count(), 1);
    }
}
