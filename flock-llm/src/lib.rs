//! Flock LLM - provider seam, model wrapper and prompt rendering
//!
//! Concrete HTTP adapters live outside this crate. Engines talk to a
//! [`Model`], which owns a fresh [`Provider`] built by an injected
//! [`ProviderFactory`] and records usage into a metrics session.

mod model;
mod prompt;
mod provider;
mod registry;
mod transcribe;

pub use model::Model;
pub use prompt::{pretty_json, render_tuples, PromptRenderer, RenderedPrompt, TemplateRenderer, META_PROMPT};
pub use provider::{
    CompletionRequest, MediaPayload, OutputType, Provider, ProviderFactory, ProviderKind, ProviderResponse,
    TokenUsage,
};
pub use registry::ProviderRegistry;
pub use transcribe::{transcribe_audio_columns, transcription_column_name, ModelTranscriber, Transcriber};
