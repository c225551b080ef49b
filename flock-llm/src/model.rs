//! Per-invocation model: a fresh provider plus the metrics it records into.

use crate::{CompletionRequest, Provider, ProviderFactory, ProviderResponse};
use flock_core::{FlockResult, LlmError, ModelDetails};
use flock_metrics::MetricsSession;
use serde_json::Value;
use std::time::Instant;

/// A provider instance bound to resolved model details.
///
/// Built once per logical invocation so that provider-side state is never
/// shared between concurrent calls. Every collect records token usage, API
/// duration and one API call per response into the attached session.
pub struct Model {
    details: ModelDetails,
    provider: Box<dyn Provider>,
    metrics: Option<MetricsSession>,
}

impl Model {
    pub fn new(details: ModelDetails, factory: &dyn ProviderFactory) -> FlockResult<Self> {
        let provider = factory.create(&details)?;
        Ok(Self {
            details,
            provider,
            metrics: None,
        })
    }

    /// Attach a metrics session and stamp it with this model's identity.
    pub fn with_metrics(mut self, session: MetricsSession) -> Self {
        session.set_model_info(&self.details.model_name, &self.details.provider_name);
        self.metrics = Some(session);
        self
    }

    pub fn details(&self) -> &ModelDetails {
        &self.details
    }

    pub fn metrics(&self) -> Option<&MetricsSession> {
        self.metrics.as_ref()
    }

    pub fn add_completion_request(&mut self, request: CompletionRequest) {
        self.provider.add_completion_request(request);
    }

    pub fn add_embedding_request(&mut self, inputs: Vec<String>) {
        self.provider.add_embedding_request(inputs);
    }

    pub fn add_transcription_request(&mut self, audio_refs: Vec<Value>) {
        self.provider.add_transcription_request(audio_refs);
    }

    pub fn collect_completions(&mut self) -> FlockResult<Vec<ProviderResponse>> {
        let started = Instant::now();
        let responses = self.provider.collect_completions()?;
        self.record(&responses, started, true);
        Ok(responses)
    }

    pub fn collect_embeddings(&mut self) -> FlockResult<Vec<ProviderResponse>> {
        let started = Instant::now();
        let responses = self.provider.collect_embeddings()?;
        self.record(&responses, started, true);
        Ok(responses)
    }

    /// Transcriptions count API calls and duration but not tokens.
    pub fn collect_transcriptions(&mut self) -> FlockResult<Vec<ProviderResponse>> {
        let started = Instant::now();
        let responses = self.provider.collect_transcriptions()?;
        self.record(&responses, started, false);
        Ok(responses)
    }

    /// Issue a single completion request and return its response.
    pub fn complete(&mut self, request: CompletionRequest) -> FlockResult<ProviderResponse> {
        self.add_completion_request(request);
        let mut responses = self.collect_completions()?;
        if responses.is_empty() {
            return Err(LlmError::ResponseCountMismatch {
                expected: 1,
                got: 0,
            }
            .into());
        }
        Ok(responses.swap_remove(0))
    }

    fn record(&self, responses: &[ProviderResponse], started: Instant, count_tokens: bool) {
        let Some(session) = &self.metrics else {
            return;
        };
        if count_tokens {
            let (input, output) = responses.iter().fold((0, 0), |(i, o), r| {
                (i + r.usage.input_tokens, o + r.usage.output_tokens)
            });
            session.update_tokens(input, output);
        }
        session.add_api_duration(started.elapsed());
        for _ in responses {
            session.increment_api_calls();
        }
    }
}

impl std::fmt::Debug for Model {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Model")
            .field("model_name", &self.details.model_name)
            .field("provider", &self.details.provider_name)
            .field("metrics", &self.metrics.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::OutputType;
    use flock_core::{FunctionKind, TupleFormat};
    use flock_metrics::{MetricsLedger, StateId};
    use serde_json::json;

    struct FixedProvider {
        queued: usize,
    }

    impl Provider for FixedProvider {
        fn add_completion_request(&mut self, _request: CompletionRequest) {
            self.queued += 1;
        }
        fn add_embedding_request(&mut self, _inputs: Vec<String>) {
            self.queued += 1;
        }
        fn add_transcription_request(&mut self, audio_refs: Vec<Value>) {
            self.queued += audio_refs.len();
        }
        fn collect_completions(&mut self) -> FlockResult<Vec<ProviderResponse>> {
            Ok(self.drain(json!({"items": ["ok"]})))
        }
        fn collect_embeddings(&mut self) -> FlockResult<Vec<ProviderResponse>> {
            Ok(self.drain(json!([[0.5, 0.25]])))
        }
        fn collect_transcriptions(&mut self) -> FlockResult<Vec<ProviderResponse>> {
            Ok(self.drain(json!("hello")))
        }
    }

    impl FixedProvider {
        fn drain(&mut self, body: Value) -> Vec<ProviderResponse> {
            let responses = (0..self.queued)
                .map(|_| ProviderResponse::new(body.clone()).with_usage(10, 4))
                .collect();
            self.queued = 0;
            responses
        }
    }

    fn details() -> ModelDetails {
        ModelDetails {
            model_name: "summarizer".to_string(),
            model: "gpt-4o-mini".to_string(),
            provider_name: "openai".to_string(),
            secret: Default::default(),
            tuple_format: TupleFormat::Xml,
            batch_size: 2048,
            model_parameters: json!({}),
        }
    }

    fn fixed_factory(_: &ModelDetails) -> FlockResult<Box<dyn Provider>> {
        Ok(Box::new(FixedProvider { queued: 0 }))
    }

    #[test]
    fn test_complete_records_metrics() {
        let ledger = MetricsLedger::new();
        let state = StateId::next();
        let session = ledger.start_invocation(state, FunctionKind::Complete);
        let mut model = Model::new(details(), &fixed_factory).unwrap().with_metrics(session);

        let response = model
            .complete(CompletionRequest::new("p", 1, OutputType::String))
            .unwrap();
        assert_eq!(response.items().unwrap(), &[json!("ok")]);

        model.add_completion_request(CompletionRequest::new("a", 1, OutputType::String));
        model.add_completion_request(CompletionRequest::new("b", 1, OutputType::String));
        assert_eq!(model.collect_completions().unwrap().len(), 2);

        let entry = ledger.entry(state, FunctionKind::Complete).unwrap();
        assert_eq!(entry.input_tokens, 30);
        assert_eq!(entry.output_tokens, 12);
        assert_eq!(entry.api_calls, 3);
        assert_eq!(entry.model_name.as_deref(), Some("summarizer"));
        assert_eq!(entry.provider.as_deref(), Some("openai"));
    }

    #[test]
    fn test_transcriptions_skip_tokens() {
        let ledger = MetricsLedger::new();
        let state = StateId::next();
        let session = ledger.start_invocation(state, FunctionKind::Reduce);
        let mut model = Model::new(details(), &fixed_factory).unwrap().with_metrics(session);

        model.add_transcription_request(vec![json!("a.mp3"), json!("b.mp3")]);
        assert_eq!(model.collect_transcriptions().unwrap().len(), 2);

        let entry = ledger.entry(state, FunctionKind::Reduce).unwrap();
        assert_eq!(entry.total_tokens(), 0);
        assert_eq!(entry.api_calls, 2);
    }

    #[test]
    fn test_without_metrics_is_silent() {
        let mut model = Model::new(details(), &fixed_factory).unwrap();
        model.add_embedding_request(vec!["x".to_string()]);
        assert_eq!(model.collect_embeddings().unwrap().len(), 1);
        assert!(model.metrics().is_none());
    }
}
