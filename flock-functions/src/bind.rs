//! Bind-time resolution and the per-call execution context.

use flock_core::{
    ColumnBatch, ConfigStore, FlockConfig, FlockResult, FunctionKind, ModelDetails, PromptDetails,
    ValidationError, CONTEXT_COLUMNS_KEY,
};
use flock_llm::{
    transcribe_audio_columns, Model, ModelTranscriber, PromptRenderer, ProviderFactory, RenderedPrompt,
    TemplateRenderer,
};
use flock_metrics::{MetricsLedger, MetricsSession};
use serde_json::{Map, Value};
use std::sync::Arc;

// ============================================================================
// FUNCTION CONTEXT
// ============================================================================

/// Collaborators every LLM function runs against.
///
/// The provider factory is injected here rather than read from process-wide
/// state, so concurrent callers (and tests) never share a mock.
#[derive(Clone)]
pub struct FunctionContext {
    pub provider_factory: Arc<dyn ProviderFactory>,
    pub metrics: Arc<MetricsLedger>,
    pub renderer: Arc<dyn PromptRenderer>,
    pub store: Arc<dyn ConfigStore>,
    pub config: FlockConfig,
}

impl FunctionContext {
    /// Context with a fresh ledger, the template renderer and default config.
    pub fn new(provider_factory: Arc<dyn ProviderFactory>, store: Arc<dyn ConfigStore>) -> Self {
        Self {
            provider_factory,
            metrics: Arc::new(MetricsLedger::new()),
            renderer: Arc::new(TemplateRenderer::new()),
            store,
            config: FlockConfig::default(),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsLedger>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_renderer(mut self, renderer: Arc<dyn PromptRenderer>) -> Self {
        self.renderer = renderer;
        self
    }

    pub fn with_config(mut self, config: FlockConfig) -> Self {
        self.config = config;
        self
    }
}

impl std::fmt::Debug for FunctionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionContext")
            .field("metrics", &self.metrics)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// FUNCTION BINDING
// ============================================================================

/// Model and prompt resolved once per query bind.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionBinding {
    pub kind: FunctionKind,
    pub model: ModelDetails,
    /// Empty for `llm_embedding`, which takes no prompt.
    pub prompt: String,
}

impl FunctionBinding {
    /// Validate the `(model, prompt)` arguments of an LLM function call and
    /// resolve them against the configuration store.
    ///
    /// # Arguments
    /// * `kind` - The function being bound
    /// * `args` - The call's constant arguments: model struct, prompt struct
    /// * `ctx` - Store and defaults used for resolution
    pub fn bind(kind: FunctionKind, args: &[Value], ctx: &FunctionContext) -> FlockResult<Self> {
        if args.len() != 2 {
            return Err(ValidationError::ArgumentCount {
                function: kind.to_string(),
                got: args.len(),
            }
            .into());
        }
        if !args[0].is_object() {
            return Err(invalid(kind, "First argument must be model (struct type)"));
        }
        let prompt_struct = args[1]
            .as_object()
            .ok_or_else(|| invalid(kind, "Second argument must be prompt with context_columns (struct type)"))?;

        if kind.is_aggregate() && !prompt_struct.contains_key(CONTEXT_COLUMNS_KEY) {
            return Err(invalid(kind, "Second argument must contain 'context_columns' field"));
        }

        let model = ModelDetails::resolve(&args[0], ctx.store.as_ref(), &ctx.config)?;

        let prompt = if kind == FunctionKind::Embedding {
            String::new()
        } else {
            let fields: Map<String, Value> = prompt_struct
                .iter()
                .filter(|(key, _)| key.as_str() != CONTEXT_COLUMNS_KEY)
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect();
            PromptDetails::resolve(&fields, ctx.store.as_ref())?.prompt
        };

        tracing::debug!(
            function = %kind,
            model_name = %model.model_name,
            provider = %model.provider_name,
            batch_size = model.batch_size,
            "Bound LLM function"
        );

        Ok(Self { kind, model, prompt })
    }

    /// Fresh model for one logical invocation.
    pub fn create_model(&self, ctx: &FunctionContext, metrics: Option<MetricsSession>) -> FlockResult<Model> {
        let model = Model::new(self.model.clone(), ctx.provider_factory.as_ref())?;
        Ok(match metrics {
            Some(session) => model.with_metrics(session),
            None => model,
        })
    }

    /// Everything an engine needs for one invocation.
    pub fn invocation<'a>(
        &'a self,
        ctx: &'a FunctionContext,
        metrics: Option<MetricsSession>,
    ) -> FlockResult<Invocation<'a>> {
        Ok(Invocation {
            model: self.create_model(ctx, metrics.clone())?,
            kind: self.kind,
            user_prompt: &self.prompt,
            ctx,
            metrics,
        })
    }
}

fn invalid(kind: FunctionKind, reason: &str) -> flock_core::FlockError {
    ValidationError::InvalidArgument {
        function: kind.to_string(),
        reason: reason.to_string(),
    }
    .into()
}

// ============================================================================
// INVOCATION
// ============================================================================

/// One logical call: a fresh model plus the prompt and renderer it uses.
pub struct Invocation<'a> {
    pub model: Model,
    pub kind: FunctionKind,
    pub user_prompt: &'a str,
    ctx: &'a FunctionContext,
    metrics: Option<MetricsSession>,
}

impl Invocation<'_> {
    /// Configured batch size of the bound model.
    pub fn batch_size(&self) -> i64 {
        i64::from(self.model.details().batch_size)
    }

    /// Render `batch` for this invocation's function kind.
    pub fn render(&self, batch: &ColumnBatch) -> FlockResult<RenderedPrompt> {
        self.ctx
            .renderer
            .render(self.user_prompt, batch, self.kind, self.model.details().tuple_format)
    }

    /// Replace audio columns by their transcriptions. Transcription calls
    /// are recorded into this invocation's metrics.
    pub fn transcribe(&self, batch: &ColumnBatch) -> FlockResult<ColumnBatch> {
        if !batch.columns().iter().any(|c| c.is_audio()) {
            return Ok(batch.clone());
        }
        let transcriber = ModelTranscriber::new(
            self.ctx.provider_factory.as_ref(),
            self.ctx.store.as_ref(),
            &self.ctx.config,
        )
        .with_metrics(self.metrics.clone());
        transcribe_audio_columns(batch, &transcriber)
    }
}

impl std::fmt::Debug for Invocation<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Invocation")
            .field("model", &self.model)
            .field("kind", &self.kind)
            .field("user_prompt", &self.user_prompt)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flock_core::{ConfigError, FlockError};
    use flock_test_utils::assertions::assert_validation_error;
    use flock_test_utils::{fixtures, ScriptedFactory};
    use serde_json::json;

    fn context() -> FunctionContext {
        FunctionContext::new(ScriptedFactory::new().as_factory(), Arc::new(fixtures::config_store()))
    }

    #[test]
    fn test_bind_resolves_model_and_prompt() {
        let ctx = context();
        let binding = FunctionBinding::bind(
            FunctionKind::Reduce,
            &[fixtures::model_args(16), fixtures::prompt_arg("Summarize")],
            &ctx,
        )
        .unwrap();
        assert_eq!(binding.model.model, "gpt-4o-mini");
        assert_eq!(binding.model.batch_size, 16);
        assert_eq!(binding.prompt, "Summarize");
    }

    #[test]
    fn test_bind_named_prompt() {
        let ctx = context();
        let binding = FunctionBinding::bind(
            FunctionKind::Complete,
            &[
                fixtures::model_args(4),
                json!({ "prompt_name": fixtures::TEST_PROMPT_NAME }),
            ],
            &ctx,
        )
        .unwrap();
        assert_eq!(binding.prompt, "Summarize the rows");
    }

    #[test]
    fn test_bind_argument_count() {
        let ctx = context();
        let err = FunctionBinding::bind(FunctionKind::Rerank, &[fixtures::model_args(4)], &ctx).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Validation error: llm_rerank requires 2 arguments: (1) model, (2) prompt with context_columns. Got 1"
        );
    }

    #[test]
    fn test_bind_aggregate_requires_context_columns() {
        let ctx = context();
        let result = FunctionBinding::bind(
            FunctionKind::First,
            &[fixtures::model_args(4), json!({ "prompt": "pick" })],
            &ctx,
        );
        assert_validation_error(&result);

        // Scalar functions may omit them.
        assert!(FunctionBinding::bind(
            FunctionKind::Complete,
            &[fixtures::model_args(4), json!({ "prompt": "hello" })],
            &ctx,
        )
        .is_ok());
    }

    #[test]
    fn test_bind_unknown_model() {
        let ctx = context();
        let result = FunctionBinding::bind(
            FunctionKind::Complete,
            &[json!({ "model_name": "missing" }), json!({ "prompt": "hello" })],
            &ctx,
        );
        assert!(matches!(
            result,
            Err(FlockError::Config(ConfigError::ModelNotFound { .. }))
        ));
    }

    #[test]
    fn test_bind_embedding_skips_prompt() {
        let ctx = context();
        let binding = FunctionBinding::bind(
            FunctionKind::Embedding,
            &[fixtures::model_args(4), json!({ "context_columns": [] })],
            &ctx,
        )
        .unwrap();
        assert!(binding.prompt.is_empty());
    }
}
