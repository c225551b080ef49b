//! Provider seam: the request/collect contract every LLM backend implements.

use flock_core::{Column, ConfigError, FlockResult, ModelDetails, ResponseError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

// ============================================================================
// REQUEST TYPES
// ============================================================================

/// Shape of each structured output item requested from the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputType {
    String,
    Object,
    Bool,
    Integer,
}

impl OutputType {
    /// JSON schema type name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Object => "object",
            Self::Bool => "boolean",
            Self::Integer => "integer",
        }
    }
}

/// Image and audio columns kept out of the textual tuple table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MediaPayload {
    pub image: Vec<Column>,
    pub audio: Vec<Column>,
}

impl MediaPayload {
    pub fn is_empty(&self) -> bool {
        self.image.is_empty() && self.audio.is_empty()
    }

    /// Non-null image references across all image columns, in row order.
    pub fn image_refs(&self) -> impl Iterator<Item = &Value> {
        self.image
            .iter()
            .flat_map(|column| column.data.iter())
            .filter(|value| !value.is_null())
    }
}

/// One completion request.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub prompt: String,
    /// Number of `items` the provider must return.
    pub num_output_tuples: usize,
    pub output_type: OutputType,
    pub media: MediaPayload,
}

impl CompletionRequest {
    pub fn new(prompt: impl Into<String>, num_output_tuples: usize, output_type: OutputType) -> Self {
        Self {
            prompt: prompt.into(),
            num_output_tuples,
            output_type,
            media: MediaPayload::default(),
        }
    }

    pub fn with_media(mut self, media: MediaPayload) -> Self {
        self.media = media;
        self
    }
}

// ============================================================================
// RESPONSE TYPES
// ============================================================================

/// Token usage reported for one request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: i64,
    pub output_tokens: i64,
}

/// One provider response, in the order its request was enqueued.
///
/// Completion bodies are `{"items": [...]}`; embedding bodies are an array
/// of vectors; transcription bodies are the transcribed text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderResponse {
    pub body: Value,
    #[serde(default)]
    pub usage: TokenUsage,
}

impl ProviderResponse {
    pub fn new(body: Value) -> Self {
        Self {
            body,
            usage: TokenUsage::default(),
        }
    }

    pub fn with_usage(mut self, input_tokens: i64, output_tokens: i64) -> Self {
        self.usage = TokenUsage {
            input_tokens,
            output_tokens,
        };
        self
    }

    /// The `items` array of a completion response.
    pub fn items(&self) -> FlockResult<&[Value]> {
        self.body
            .get("items")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .ok_or_else(|| ResponseError::MissingItems.into())
    }

    /// Take ownership of the `items` array.
    pub fn into_items(self) -> FlockResult<Vec<Value>> {
        match self.body {
            Value::Object(mut map) => match map.remove("items") {
                Some(Value::Array(items)) => Ok(items),
                _ => Err(ResponseError::MissingItems.into()),
            },
            _ => Err(ResponseError::MissingItems.into()),
        }
    }
}

// ============================================================================
// PROVIDER TRAITS
// ============================================================================

/// An LLM backend.
///
/// Requests are queued by the `add_*` methods and executed by the matching
/// `collect_*` call, which returns one response per queued request in queue
/// order. A provider that refuses to emit a response because it would
/// exceed its output limit returns `LlmError::OutputLengthExceeded`.
///
/// Instances are never shared across concurrent calls; see
/// [`ProviderFactory`].
pub trait Provider: Send {
    fn add_completion_request(&mut self, request: CompletionRequest);

    fn add_embedding_request(&mut self, inputs: Vec<String>);

    /// Queue one transcription request per audio reference.
    fn add_transcription_request(&mut self, audio_refs: Vec<Value>);

    fn collect_completions(&mut self) -> FlockResult<Vec<ProviderResponse>>;

    fn collect_embeddings(&mut self) -> FlockResult<Vec<ProviderResponse>>;

    fn collect_transcriptions(&mut self) -> FlockResult<Vec<ProviderResponse>>;
}

/// Builds a fresh [`Provider`] for each logical invocation.
pub trait ProviderFactory: Send + Sync {
    fn create(&self, details: &ModelDetails) -> FlockResult<Box<dyn Provider>>;
}

impl<F> ProviderFactory for F
where
    F: Fn(&ModelDetails) -> FlockResult<Box<dyn Provider>> + Send + Sync,
{
    fn create(&self, details: &ModelDetails) -> FlockResult<Box<dyn Provider>> {
        self(details)
    }
}

// ============================================================================
// PROVIDER KIND
// ============================================================================

/// Supported provider backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    OpenAi,
    Azure,
    Ollama,
    Anthropic,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Azure => "azure",
            Self::Ollama => "ollama",
            Self::Anthropic => "anthropic",
        }
    }
}

impl FromStr for ProviderKind {
    type Err = ConfigError;

    /// `default` and the empty string select OpenAI.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "openai" | "default" | "" => Ok(Self::OpenAi),
            "azure" => Ok(Self::Azure),
            "ollama" => Ok(Self::Ollama),
            "anthropic" => Ok(Self::Anthropic),
            _ => Err(ConfigError::ProviderNotSupported {
                provider: s.to_string(),
            }),
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flock_core::FlockError;
    use serde_json::json;

    #[test]
    fn test_provider_kind_parse() {
        assert_eq!("openai".parse::<ProviderKind>().unwrap(), ProviderKind::OpenAi);
        assert_eq!("default".parse::<ProviderKind>().unwrap(), ProviderKind::OpenAi);
        assert_eq!("".parse::<ProviderKind>().unwrap(), ProviderKind::OpenAi);
        assert_eq!("Azure".parse::<ProviderKind>().unwrap(), ProviderKind::Azure);
        assert_eq!("ollama".parse::<ProviderKind>().unwrap(), ProviderKind::Ollama);
        assert_eq!("anthropic".parse::<ProviderKind>().unwrap(), ProviderKind::Anthropic);
        assert!(matches!(
            "bedrock".parse::<ProviderKind>(),
            Err(ConfigError::ProviderNotSupported { .. })
        ));
    }

    #[test]
    fn test_output_type_names() {
        assert_eq!(OutputType::Bool.as_str(), "boolean");
        assert_eq!(OutputType::Integer.as_str(), "integer");
    }

    #[test]
    fn test_response_items() {
        let response = ProviderResponse::new(json!({"items": [1, 2]}));
        assert_eq!(response.items().unwrap(), &[json!(1), json!(2)]);
        assert_eq!(response.into_items().unwrap(), vec![json!(1), json!(2)]);

        let missing = ProviderResponse::new(json!({"text": "x"}));
        assert!(matches!(
            missing.items(),
            Err(FlockError::Response(ResponseError::MissingItems))
        ));
    }

    #[test]
    fn test_media_image_refs_skip_nulls() {
        let media = MediaPayload {
            image: vec![Column::new("img", vec![json!("a.png"), Value::Null, json!("b.png")])],
            audio: vec![],
        };
        let refs: Vec<_> = media.image_refs().collect();
        assert_eq!(refs, vec![&json!("a.png"), &json!("b.png")]);
    }
}
