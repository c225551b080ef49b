//! Flock Test Utilities
//!
//! Centralized test infrastructure for the Flock workspace:
//! - Scripted mock provider and factory
//! - Test fixtures for models, prompts and column batches
//! - Proptest generators for batches and token counts
//! - Custom assertions for Flock-specific errors

// Re-export core types for convenience
pub use flock_core::{
    BatchError, Column, ColumnBatch, ColumnType, FlockConfig, FlockError, FlockResult, FunctionKind,
    InMemoryConfigStore, LlmError, ModelDetails, ResponseError, TupleFormat, ValidationError,
};
pub use flock_llm::{CompletionRequest, OutputType, Provider, ProviderFactory, ProviderResponse, TokenUsage};

use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

// ============================================================================
// MOCK PROVIDERS
// ============================================================================

/// A scripted answer for the next completion request.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptedReply {
    /// Respond with `{"items": [...]}`.
    Items(Vec<Value>),
    /// Respond with this exact body.
    Body(Value),
    /// Fail with `LlmError::OutputLengthExceeded`.
    Overflow,
    /// Fail with `LlmError::RequestFailed`.
    Fail(String),
}

/// A completion request as the provider saw it.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedRequest {
    pub prompt: String,
    pub num_output_tuples: usize,
    pub output_type: OutputType,
    pub image_count: usize,
}

impl From<&CompletionRequest> for RecordedRequest {
    fn from(request: &CompletionRequest) -> Self {
        Self {
            prompt: request.prompt.clone(),
            num_output_tuples: request.num_output_tuples,
            output_type: request.output_type,
            image_count: request.media.image_refs().count(),
        }
    }
}

type Responder = dyn Fn(&CompletionRequest) -> Vec<Value> + Send + Sync;

#[derive(Debug, Default)]
struct Script {
    replies: VecDeque<ScriptedReply>,
    embedding_replies: VecDeque<Value>,
    requests: Vec<RecordedRequest>,
    embedding_requests: Vec<Vec<String>>,
    transcription_requests: Vec<Value>,
    providers_created: usize,
}

/// Provider factory whose providers replay scripted replies.
///
/// All providers built by one factory share the same script and request log,
/// so a test can inspect every call made during an invocation. When the
/// script runs dry, completions fall back to the responder:
/// - `Integer` outputs get the identity ranking `0..n`
/// - `Bool` outputs get `true` for each tuple
/// - everything else gets `"response_<i>"`
#[derive(Clone)]
pub struct ScriptedFactory {
    script: Arc<Mutex<Script>>,
    responder: Arc<Responder>,
    usage: TokenUsage,
}

impl ScriptedFactory {
    pub fn new() -> Self {
        Self {
            script: Arc::new(Mutex::new(Script::default())),
            responder: Arc::new(default_items),
            usage: TokenUsage {
                input_tokens: 10,
                output_tokens: 5,
            },
        }
    }

    /// Replace the fallback used when no scripted reply is queued.
    pub fn with_responder<F>(mut self, responder: F) -> Self
    where
        F: Fn(&CompletionRequest) -> Vec<Value> + Send + Sync + 'static,
    {
        self.responder = Arc::new(responder);
        self
    }

    /// Token usage reported on every response.
    pub fn with_usage(mut self, input_tokens: i64, output_tokens: i64) -> Self {
        self.usage = TokenUsage {
            input_tokens,
            output_tokens,
        };
        self
    }

    pub fn push_reply(&self, reply: ScriptedReply) -> &Self {
        self.lock().replies.push_back(reply);
        self
    }

    pub fn push_items(&self, items: Vec<Value>) -> &Self {
        self.push_reply(ScriptedReply::Items(items))
    }

    pub fn push_overflow(&self) -> &Self {
        self.push_reply(ScriptedReply::Overflow)
    }

    /// Body for the next embedding request, in place of one
    /// [`mock_embedding`] per input.
    pub fn push_embedding_body(&self, body: Value) -> &Self {
        self.lock().embedding_replies.push_back(body);
        self
    }

    /// Every completion request seen so far, in call order.
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.lock().requests.clone()
    }

    pub fn completion_count(&self) -> usize {
        self.lock().requests.len()
    }

    pub fn embedding_requests(&self) -> Vec<Vec<String>> {
        self.lock().embedding_requests.clone()
    }

    pub fn transcription_requests(&self) -> Vec<Value> {
        self.lock().transcription_requests.clone()
    }

    pub fn providers_created(&self) -> usize {
        self.lock().providers_created
    }

    /// Scripted replies not consumed yet.
    pub fn pending_replies(&self) -> usize {
        self.lock().replies.len()
    }

    pub fn as_factory(&self) -> Arc<dyn ProviderFactory> {
        Arc::new(self.clone())
    }

    fn lock(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn response(&self, body: Value) -> ProviderResponse {
        ProviderResponse::new(body).with_usage(self.usage.input_tokens, self.usage.output_tokens)
    }
}

impl Default for ScriptedFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ScriptedFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedFactory")
            .field("script", &*self.lock())
            .field("usage", &self.usage)
            .finish()
    }
}

impl ProviderFactory for ScriptedFactory {
    fn create(&self, _details: &ModelDetails) -> FlockResult<Box<dyn Provider>> {
        self.lock().providers_created += 1;
        Ok(Box::new(ScriptedProvider {
            factory: self.clone(),
            completions: Vec::new(),
            embeddings: Vec::new(),
            transcriptions: Vec::new(),
        }))
    }
}

fn default_items(request: &CompletionRequest) -> Vec<Value> {
    (0..request.num_output_tuples)
        .map(|i| match request.output_type {
            OutputType::Integer => json!(i),
            OutputType::Bool => json!(true),
            _ => json!(format!("response_{}", i)),
        })
        .collect()
}

/// Deterministic stand-in embedding: `[char count, word count]`.
pub fn mock_embedding(input: &str) -> Vec<f64> {
    vec![input.chars().count() as f64, input.split_whitespace().count() as f64]
}

/// Provider built by [`ScriptedFactory`].
pub struct ScriptedProvider {
    factory: ScriptedFactory,
    completions: Vec<CompletionRequest>,
    embeddings: Vec<Vec<String>>,
    transcriptions: Vec<Value>,
}

impl Provider for ScriptedProvider {
    fn add_completion_request(&mut self, request: CompletionRequest) {
        self.completions.push(request);
    }

    fn add_embedding_request(&mut self, inputs: Vec<String>) {
        self.embeddings.push(inputs);
    }

    fn add_transcription_request(&mut self, audio_refs: Vec<Value>) {
        self.transcriptions.extend(audio_refs);
    }

    fn collect_completions(&mut self) -> FlockResult<Vec<ProviderResponse>> {
        let pending = std::mem::take(&mut self.completions);
        let mut responses = Vec::with_capacity(pending.len());
        for request in pending {
            let reply = {
                let mut script = self.factory.lock();
                script.requests.push(RecordedRequest::from(&request));
                script.replies.pop_front()
            };
            let body = match reply {
                Some(ScriptedReply::Items(items)) => json!({ "items": items }),
                Some(ScriptedReply::Body(body)) => body,
                Some(ScriptedReply::Overflow) => return Err(LlmError::OutputLengthExceeded.into()),
                Some(ScriptedReply::Fail(message)) => {
                    return Err(LlmError::RequestFailed {
                        provider: "scripted".to_string(),
                        message,
                    }
                    .into())
                }
                None => json!({ "items": (self.factory.responder)(&request) }),
            };
            responses.push(self.factory.response(body));
        }
        Ok(responses)
    }

    fn collect_embeddings(&mut self) -> FlockResult<Vec<ProviderResponse>> {
        let pending = std::mem::take(&mut self.embeddings);
        let mut script = self.factory.lock();
        script.embedding_requests.extend(pending.iter().cloned());
        let bodies: Vec<Value> = pending
            .iter()
            .map(|inputs| {
                script.embedding_replies.pop_front().unwrap_or_else(|| {
                    let vectors: Vec<Vec<f64>> = inputs.iter().map(|input| mock_embedding(input)).collect();
                    json!(vectors)
                })
            })
            .collect();
        drop(script);
        Ok(bodies.into_iter().map(|body| self.factory.response(body)).collect())
    }

    fn collect_transcriptions(&mut self) -> FlockResult<Vec<ProviderResponse>> {
        let pending = std::mem::take(&mut self.transcriptions);
        self.factory.lock().transcription_requests.extend(pending.iter().cloned());
        Ok(pending
            .iter()
            .map(|audio| {
                let text = format!("transcript of {}", audio.as_str().unwrap_or_default());
                self.factory.response(json!({ "text": text }))
            })
            .collect())
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built models, stores and batches for common scenarios.

    use super::*;
    use serde_json::Map;
    use std::collections::HashMap;

    pub const TEST_MODEL: &str = "test-model";
    pub const TRANSCRIPTION_MODEL: &str = "test-whisper";
    pub const TEST_PROMPT_NAME: &str = "summarize";

    /// Model details as they come out of bind-time resolution.
    pub fn model_details(batch_size: i32) -> ModelDetails {
        ModelDetails {
            model_name: TEST_MODEL.to_string(),
            model: "gpt-4o-mini".to_string(),
            provider_name: "openai".to_string(),
            secret: HashMap::from([("api_key".to_string(), "sk-test".to_string())]),
            tuple_format: TupleFormat::Xml,
            batch_size,
            model_parameters: json!({}),
        }
    }

    /// A store holding the test model, a transcription model, the default
    /// OpenAI secret and one versioned prompt.
    pub fn config_store() -> InMemoryConfigStore {
        let store = InMemoryConfigStore::new();
        store.insert_model(TEST_MODEL, "gpt-4o-mini", "openai", Map::new());
        store.insert_model(TRANSCRIPTION_MODEL, "whisper-1", "openai", Map::new());
        store.insert_secret(
            "__default_openai",
            HashMap::from([("api_key".to_string(), "sk-test".to_string())]),
        );
        store.insert_prompt(TEST_PROMPT_NAME, "Summarize the rows");
        store
    }

    /// Model argument struct naming the stored test model.
    pub fn model_args(batch_size: i32) -> Value {
        json!({ "model_name": TEST_MODEL, "batch_size": batch_size })
    }

    /// `rows` rows with an integer `id` column and a text `text` column.
    pub fn text_batch(rows: usize) -> ColumnBatch {
        ColumnBatch::new(vec![
            Column::new("id", (0..rows).map(|i| json!(i)).collect()),
            Column::new("text", (0..rows).map(|i| json!(format!("row {}", i))).collect()),
        ])
    }

    /// One prompt struct per row, as the host hands them to a function.
    pub fn prompt_rows(prompt: &str, batch: &ColumnBatch) -> Vec<Value> {
        (0..batch.row_count())
            .map(|row| {
                let columns: Vec<Value> = batch
                    .columns()
                    .iter()
                    .map(|column| {
                        let mut definition = serde_json::to_value(column.empty_like())
                            .ok()
                            .and_then(|v| v.as_object().cloned())
                            .unwrap_or_default();
                        definition.insert("data".to_string(), column.data[row].clone());
                        Value::Object(definition)
                    })
                    .collect();
                json!({ "prompt": prompt, "context_columns": columns })
            })
            .collect()
    }

    /// Prompt struct with context columns, for binding.
    pub fn prompt_arg(prompt: &str) -> Value {
        json!({ "prompt": prompt, "context_columns": [] })
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for Flock data.

    use super::*;
    use proptest::prelude::*;

    /// A scalar cell value.
    pub fn arb_value() -> impl Strategy<Value = Value> {
        prop_oneof![
            "[a-z ]{0,12}".prop_map(Value::String),
            any::<i32>().prop_map(|n| json!(n)),
            any::<bool>().prop_map(Value::Bool),
            Just(Value::Null),
        ]
    }

    /// A batch of 1-3 named columns of arbitrary cells with `0..=max_rows` rows.
    pub fn arb_column_batch(max_rows: usize) -> impl Strategy<Value = ColumnBatch> {
        (1usize..=3, 0..=max_rows)
            .prop_flat_map(|(columns, rows)| {
                proptest::collection::vec(proptest::collection::vec(arb_value(), rows), columns)
            })
            .prop_map(|columns| {
                ColumnBatch::new(
                    columns
                        .into_iter()
                        .enumerate()
                        .map(|(i, data)| Column::new(format!("col_{}", i), data))
                        .collect(),
                )
            })
    }

    /// A configured batch size.
    pub fn arb_batch_size() -> impl Strategy<Value = i32> {
        1i32..=64
    }

    /// Per-call `(input, output)` token counts.
    pub fn arb_token_updates(max_calls: usize) -> impl Strategy<Value = Vec<(i64, i64)>> {
        proptest::collection::vec((0i64..10_000, 0i64..10_000), 1..=max_calls)
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions for Flock-specific error variants.

    use super::*;

    /// Assert that a FlockResult is a Validation error.
    #[track_caller]
    pub fn assert_validation_error<T: std::fmt::Debug>(result: &FlockResult<T>) {
        match result {
            Err(FlockError::Validation(_)) => {}
            other => panic!("Expected Validation error, got: {:?}", other),
        }
    }

    /// Assert that a FlockResult is the batch-exhausted error.
    #[track_caller]
    pub fn assert_batch_exhausted<T: std::fmt::Debug>(result: &FlockResult<T>) {
        match result {
            Err(FlockError::Batch(BatchError::Exhausted)) => {}
            other => panic!("Expected Exhausted batch error, got: {:?}", other),
        }
    }

    /// Assert that a FlockResult is a Response error.
    #[track_caller]
    pub fn assert_response_error<T: std::fmt::Debug>(result: &FlockResult<T>) {
        match result {
            Err(FlockError::Response(_)) => {}
            other => panic!("Expected Response error, got: {:?}", other),
        }
    }

    /// Assert that `metrics` (the `flock_get_metrics` object) has exactly
    /// the given keys.
    #[track_caller]
    pub fn assert_metric_keys(metrics: &Value, expected: &[&str]) {
        let mut keys: Vec<&str> = metrics
            .as_object()
            .map(|m| m.keys().map(String::as_str).collect())
            .unwrap_or_default();
        keys.sort_unstable();
        let mut expected = expected.to_vec();
        expected.sort_unstable();
        assert_eq!(keys, expected, "Metric keys mismatch in {}", metrics);
    }
}
