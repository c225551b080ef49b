//! Configuration types and bind-time resolution of models and prompts.

use crate::{ConfigError, FlockError, FlockResult, ValidationError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Batch size used when neither the call nor the stored model sets one.
pub const DEFAULT_BATCH_SIZE: i32 = 2048;

// ============================================================================
// TUPLE FORMAT
// ============================================================================

/// Serialization of the tuple table embedded in prompts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TupleFormat {
    #[default]
    Xml,
    Json,
    Markdown,
}

impl TupleFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Xml => "XML",
            Self::Json => "JSON",
            Self::Markdown => "MARKDOWN",
        }
    }
}

impl FromStr for TupleFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "XML" => Ok(Self::Xml),
            "JSON" => Ok(Self::Json),
            "MARKDOWN" => Ok(Self::Markdown),
            _ => Err(ConfigError::InvalidTupleFormat {
                value: s.to_string(),
            }),
        }
    }
}

impl fmt::Display for TupleFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// FLOCK CONFIG
// ============================================================================

/// Extension-wide defaults applied during model resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlockConfig {
    pub default_batch_size: i32,
    pub default_tuple_format: TupleFormat,
}

impl Default for FlockConfig {
    fn default() -> Self {
        Self {
            default_batch_size: DEFAULT_BATCH_SIZE,
            default_tuple_format: TupleFormat::Xml,
        }
    }
}

impl FlockConfig {
    pub fn validate(&self) -> FlockResult<()> {
        if self.default_batch_size <= 0 {
            return Err(FlockError::Config(ConfigError::InvalidValue {
                field: "default_batch_size".to_string(),
                value: self.default_batch_size.to_string(),
                reason: "default_batch_size must be greater than 0".to_string(),
            }));
        }
        Ok(())
    }
}

// ============================================================================
// CONFIG STORE
// ============================================================================

/// A model row as kept by the configuration store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredModel {
    pub model: String,
    pub provider: String,
    /// Stored extra arguments (tuple_format, batch_size, model_parameters).
    pub args: Map<String, Value>,
}

/// A versioned prompt as kept by the configuration store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredPrompt {
    pub prompt: String,
    pub version: i32,
}

/// Bind-time lookup of named models, prompts and secrets.
pub trait ConfigStore: Send + Sync {
    fn model(&self, model_name: &str) -> Option<StoredModel>;

    /// `version = None` selects the latest version.
    fn prompt(&self, prompt_name: &str, version: Option<i32>) -> Option<StoredPrompt>;

    fn secret(&self, secret_name: &str) -> Option<HashMap<String, String>>;
}

#[derive(Debug, Default)]
struct StoreTables {
    models: HashMap<String, StoredModel>,
    prompts: HashMap<String, Vec<StoredPrompt>>,
    secrets: HashMap<String, HashMap<String, String>>,
}

/// Thread-safe in-memory [`ConfigStore`].
#[derive(Debug, Default)]
pub struct InMemoryConfigStore {
    tables: RwLock<StoreTables>,
}

impl InMemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    // Every write is a single map insert, so a poisoned lock still guards
    // consistent tables.
    fn read(&self) -> RwLockReadGuard<'_, StoreTables> {
        self.tables.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, StoreTables> {
        self.tables.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn insert_model(
        &self,
        model_name: impl Into<String>,
        model: impl Into<String>,
        provider: impl Into<String>,
        args: Map<String, Value>,
    ) {
        self.write().models.insert(
            model_name.into(),
            StoredModel {
                model: model.into(),
                provider: provider.into(),
                args,
            },
        );
    }

    /// Store a new version of `prompt_name`, returning its version number.
    pub fn insert_prompt(&self, prompt_name: impl Into<String>, prompt: impl Into<String>) -> i32 {
        let mut tables = self.write();
        let versions = tables.prompts.entry(prompt_name.into()).or_default();
        let version = versions.iter().map(|p| p.version).max().unwrap_or(0) + 1;
        versions.push(StoredPrompt {
            prompt: prompt.into(),
            version,
        });
        version
    }

    pub fn insert_secret(&self, secret_name: impl Into<String>, secret: HashMap<String, String>) {
        self.write().secrets.insert(secret_name.into(), secret);
    }
}

impl ConfigStore for InMemoryConfigStore {
    fn model(&self, model_name: &str) -> Option<StoredModel> {
        self.read().models.get(model_name).cloned()
    }

    fn prompt(&self, prompt_name: &str, version: Option<i32>) -> Option<StoredPrompt> {
        let tables = self.read();
        let versions = tables.prompts.get(prompt_name)?;
        match version {
            Some(v) => versions.iter().find(|p| p.version == v).cloned(),
            None => versions.iter().max_by_key(|p| p.version).cloned(),
        }
    }

    fn secret(&self, secret_name: &str) -> Option<HashMap<String, String>> {
        self.read().secrets.get(secret_name).cloned()
    }
}

// ============================================================================
// MODEL DETAILS
// ============================================================================

/// Fully resolved model configuration, computed once per query bind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDetails {
    pub model_name: String,
    pub model: String,
    pub provider_name: String,
    pub secret: HashMap<String, String>,
    pub tuple_format: TupleFormat,
    pub batch_size: i32,
    pub model_parameters: Value,
}

impl ModelDetails {
    /// Resolve the model argument struct of an LLM function call.
    ///
    /// # Arguments
    /// * `args` - The user supplied model struct (must contain `model_name`)
    /// * `store` - Lookup for named models and secrets
    /// * `config` - Defaults for tuple format and batch size
    pub fn resolve(args: &Value, store: &dyn ConfigStore, config: &FlockConfig) -> FlockResult<Self> {
        let args = args.as_object().ok_or_else(|| ValidationError::InvalidArgument {
            function: "model".to_string(),
            reason: "Model details must be a struct.".to_string(),
        })?;

        let model_name = string_arg(args, "model_name")?.unwrap_or_default();
        if model_name.is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "model_name".to_string(),
            }
            .into());
        }

        let already_resolved = ["model", "provider", "secret", "tuple_format", "batch_size"]
            .iter()
            .all(|key| args.contains_key(*key));

        if already_resolved {
            return Ok(Self {
                model: string_arg(args, "model")?.unwrap_or_default(),
                provider_name: string_arg(args, "provider")?.unwrap_or_default(),
                secret: secret_arg(args)?.unwrap_or_default(),
                tuple_format: tuple_format_arg(args)?.unwrap_or(config.default_tuple_format),
                batch_size: batch_size_arg(args)?.unwrap_or(config.default_batch_size),
                model_parameters: model_parameters_arg(args)?.unwrap_or_else(empty_object),
                model_name,
            });
        }

        let stored = store.model(&model_name).ok_or_else(|| ConfigError::ModelNotFound {
            model_name: model_name.clone(),
        })?;

        let model = string_arg(args, "model")?.unwrap_or(stored.model);
        let provider_name = string_arg(args, "provider")?.unwrap_or(stored.provider);

        let secret = match secret_arg(args)? {
            Some(secret) => secret,
            None => {
                let secret_name = match string_arg(args, "secret_name")? {
                    Some(name) => name,
                    None => default_secret_name(&provider_name),
                };
                store
                    .secret(&secret_name)
                    .ok_or(ConfigError::SecretNotFound { secret_name })?
            }
        };

        let model_parameters = match model_parameters_arg(args)? {
            Some(params) => params,
            None => model_parameters_arg(&stored.args)?.unwrap_or_else(empty_object),
        };
        let tuple_format = match tuple_format_arg(args)? {
            Some(format) => format,
            None => tuple_format_arg(&stored.args)?.unwrap_or(config.default_tuple_format),
        };
        let batch_size = match batch_size_arg(args)? {
            Some(size) => size,
            None => batch_size_arg(&stored.args)?.unwrap_or(config.default_batch_size),
        };

        Ok(Self {
            model_name,
            model,
            provider_name,
            secret,
            tuple_format,
            batch_size,
            model_parameters,
        })
    }
}

/// Secret looked up when the call names none: `__default_<provider>`,
/// with an `_llm` suffix for Azure.
pub fn default_secret_name(provider_name: &str) -> String {
    let mut name = format!("__default_{}", provider_name);
    if provider_name == "azure" {
        name.push_str("_llm");
    }
    name
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

fn invalid(field: &str, value: &Value, reason: &str) -> FlockError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
    .into()
}

fn string_arg(args: &Map<String, Value>, key: &str) -> FlockResult<Option<String>> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(other) => Err(invalid(key, other, "expected a string")),
    }
}

fn secret_arg(args: &Map<String, Value>) -> FlockResult<Option<HashMap<String, String>>> {
    match args.get("secret") {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Object(map)) => map
            .iter()
            .map(|(k, v)| match v {
                Value::String(s) => Ok((k.clone(), s.clone())),
                other => Err(invalid("secret", other, "secret values must be strings")),
            })
            .collect::<FlockResult<HashMap<_, _>>>()
            .map(Some),
        Some(other) => Err(invalid("secret", other, "expected a struct")),
    }
}

fn tuple_format_arg(args: &Map<String, Value>) -> FlockResult<Option<TupleFormat>> {
    match string_arg(args, "tuple_format")? {
        Some(value) => Ok(Some(value.parse()?)),
        None => Ok(None),
    }
}

fn batch_size_arg(args: &Map<String, Value>) -> FlockResult<Option<i32>> {
    match args.get("batch_size") {
        None | Some(Value::Null) => Ok(None),
        Some(value) => {
            let parsed = match value {
                Value::Number(n) => n.as_i64(),
                Value::String(s) => s.trim().parse::<i64>().ok(),
                _ => None,
            };
            parsed
                .and_then(|n| i32::try_from(n).ok())
                .map(Some)
                .ok_or_else(|| invalid("batch_size", value, "expected an integer"))
        }
    }
}

fn model_parameters_arg(args: &Map<String, Value>) -> FlockResult<Option<Value>> {
    match args.get("model_parameters") {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(raw)) => serde_json::from_str(raw)
            .map(Some)
            .map_err(|e| invalid("model_parameters", &Value::String(raw.clone()), &e.to_string())),
        Some(other) => Ok(Some(other.clone())),
    }
}

// ============================================================================
// PROMPT DETAILS
// ============================================================================

/// A resolved user prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptDetails {
    pub prompt_name: Option<String>,
    pub prompt: String,
    pub version: Option<i32>,
}

impl PromptDetails {
    /// Resolve `{prompt}` or `{prompt_name[, version]}`. `fields` must not
    /// include `context_columns`.
    pub fn resolve(fields: &Map<String, Value>, store: &dyn ConfigStore) -> FlockResult<Self> {
        if let Some(name) = fields.get("prompt_name") {
            let has_version = fields.contains_key("version");
            let allowed = if has_version { 2 } else { 1 };
            if fields.len() > allowed {
                return Err(ValidationError::InvalidPromptDetails.into());
            }
            let prompt_name = name
                .as_str()
                .ok_or(ValidationError::InvalidPromptDetails)?
                .to_string();

            let version = match fields.get("version") {
                None => None,
                Some(Value::Number(n)) => n.as_i64().and_then(|v| i32::try_from(v).ok()),
                Some(Value::String(s)) => s.trim().parse::<i32>().ok(),
                Some(_) => None,
            };
            if has_version && version.is_none() {
                return Err(ValidationError::InvalidPromptDetails.into());
            }

            let stored = store.prompt(&prompt_name, version).ok_or_else(|| {
                let detail = match version {
                    Some(v) => format!("with version {} not found", v),
                    None => "not found".to_string(),
                };
                ConfigError::PromptNotFound {
                    prompt_name: prompt_name.clone(),
                    detail,
                }
            })?;

            return Ok(Self {
                prompt_name: Some(prompt_name),
                prompt: stored.prompt,
                version: Some(stored.version),
            });
        }

        if let Some(prompt) = fields.get("prompt") {
            if fields.len() > 1 {
                return Err(ValidationError::InvalidPromptDetails.into());
            }
            let prompt = prompt.as_str().ok_or(ValidationError::InvalidPromptDetails)?;
            if prompt.is_empty() {
                return Err(ValidationError::EmptyPrompt.into());
            }
            return Ok(Self {
                prompt_name: None,
                prompt: prompt.to_string(),
                version: None,
            });
        }

        Err(ValidationError::InvalidPromptDetails.into())
    }
}

// ============================================================================
// TESTS
// ============================================================================
