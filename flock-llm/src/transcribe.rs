//! Audio transcription: audio columns become derived text columns.

use crate::{Model, ProviderFactory};
use flock_core::{Column, ColumnBatch, ConfigStore, FlockConfig, FlockResult, LlmError, ModelDetails};
use flock_metrics::MetricsSession;
use serde_json::{json, Value};

/// Turns audio references into text.
pub trait Transcriber {
    /// Transcribe each reference with the named model, one result per input.
    fn transcribe(&self, model_name: &str, audio_refs: &[Value]) -> FlockResult<Vec<Value>>;
}

/// [`Transcriber`] that resolves the transcription model by name and calls
/// it through a fresh provider.
pub struct ModelTranscriber<'a> {
    factory: &'a dyn ProviderFactory,
    store: &'a dyn ConfigStore,
    config: &'a FlockConfig,
    metrics: Option<MetricsSession>,
}

impl<'a> ModelTranscriber<'a> {
    pub fn new(factory: &'a dyn ProviderFactory, store: &'a dyn ConfigStore, config: &'a FlockConfig) -> Self {
        Self {
            factory,
            store,
            config,
            metrics: None,
        }
    }

    /// Record transcription calls into the enclosing invocation.
    pub fn with_metrics(mut self, session: Option<MetricsSession>) -> Self {
        self.metrics = session;
        self
    }
}

impl Transcriber for ModelTranscriber<'_> {
    fn transcribe(&self, model_name: &str, audio_refs: &[Value]) -> FlockResult<Vec<Value>> {
        let details = ModelDetails::resolve(&json!({ "model_name": model_name }), self.store, self.config)?;
        let mut model = Model::new(details, self.factory)?;
        if let Some(session) = &self.metrics {
            model = model.with_metrics(session.clone());
        }
        model.add_transcription_request(audio_refs.to_vec());
        let responses = model.collect_transcriptions()?;
        Ok(responses.into_iter().map(|r| transcription_text(r.body)).collect())
    }
}

/// Plain text of a transcription body: a string, or `{"text": ...}`.
fn transcription_text(body: Value) -> Value {
    match body {
        Value::Object(mut map) if map.contains_key("text") => map.remove("text").unwrap_or(Value::Null),
        other => other,
    }
}

/// Name of the text column derived from an audio column.
pub fn transcription_column_name(column: &Column) -> String {
    match &column.name {
        Some(name) if !name.is_empty() => format!("transcription_of_{}", name),
        _ => "transcription".to_string(),
    }
}

/// Replace every audio column carrying a transcription model by its
/// transcription, in place and row for row. Null references stay null
/// and are not sent.
pub fn transcribe_audio_columns(batch: &ColumnBatch, transcriber: &dyn Transcriber) -> FlockResult<ColumnBatch> {
    let mut columns = Vec::with_capacity(batch.column_count());
    for column in batch.columns() {
        let Some(model_name) = column.transcription_model.as_deref().filter(|_| column.is_audio()) else {
            columns.push(column.clone());
            continue;
        };

        let refs: Vec<Value> = column.data.iter().filter(|v| !v.is_null()).cloned().collect();
        let texts = if refs.is_empty() {
            Vec::new()
        } else {
            transcriber.transcribe(model_name, &refs)?
        };
        if texts.len() != refs.len() {
            return Err(LlmError::ResponseCountMismatch {
                expected: refs.len(),
                got: texts.len(),
            }
            .into());
        }

        tracing::debug!(
            column = %transcription_column_name(column),
            rows = column.data.len(),
            transcribed = refs.len(),
            "Transcribed audio column"
        );

        let mut texts = texts.into_iter();
        let data = column
            .data
            .iter()
            .map(|v| if v.is_null() { Value::Null } else { texts.next().unwrap_or(Value::Null) })
            .collect();
        columns.push(Column::new(transcription_column_name(column), data));
    }
    Ok(ColumnBatch::new(columns))
}

#[cfg(test)]
mod tests {
    use super::*;
    use flock_core::ColumnType;
    use std::cell::RefCell;

    struct UpperTranscriber {
        calls: RefCell<Vec<(String, usize)>>,
    }

    impl Transcriber for UpperTranscriber {
        fn transcribe(&self, model_name: &str, audio_refs: &[Value]) -> FlockResult<Vec<Value>> {
            self.calls
                .borrow_mut()
                .push((model_name.to_string(), audio_refs.len()));
            Ok(audio_refs
                .iter()
                .map(|v| json!(v.as_str().unwrap_or_default().to_uppercase()))
                .collect())
        }
    }

    fn audio_batch(name: Option<&str>) -> ColumnBatch {
        let mut audio = Column::unnamed(vec![json!("a.mp3"), Value::Null, json!("c.mp3")])
            .with_type(ColumnType::Audio)
            .with_transcription_model("whisper");
        audio.name = name.map(str::to_string);
        ColumnBatch::new(vec![
            Column::new("id", vec![json!(1), json!(2), json!(3)]),
            audio,
        ])
    }

    #[test]
    fn test_audio_column_is_replaced_in_place() {
        let transcriber = UpperTranscriber {
            calls: RefCell::new(Vec::new()),
        };
        let out = transcribe_audio_columns(&audio_batch(Some("clip")), &transcriber).unwrap();

        assert_eq!(out.column_count(), 2);
        let derived = &out.columns()[1];
        assert_eq!(derived.name.as_deref(), Some("transcription_of_clip"));
        assert_eq!(derived.column_type, None);
        assert_eq!(derived.data, vec![json!("A.MP3"), Value::Null, json!("C.MP3")]);
        assert_eq!(transcriber.calls.borrow().as_slice(), &[("whisper".to_string(), 2)]);
    }

    #[test]
    fn test_unnamed_audio_column() {
        let transcriber = UpperTranscriber {
            calls: RefCell::new(Vec::new()),
        };
        let out = transcribe_audio_columns(&audio_batch(None), &transcriber).unwrap();
        assert_eq!(out.columns()[1].name.as_deref(), Some("transcription"));
    }

    #[test]
    fn test_text_columns_untouched() {
        let batch = ColumnBatch::new(vec![Column::new("t", vec![json!("x")])]);
        let transcriber = UpperTranscriber {
            calls: RefCell::new(Vec::new()),
        };
        let out = transcribe_audio_columns(&batch, &transcriber).unwrap();
        assert_eq!(out, batch);
        assert!(transcriber.calls.borrow().is_empty());
    }

    #[test]
    fn test_transcription_text_unwraps_object() {
        assert_eq!(transcription_text(json!({"text": "hi"})), json!("hi"));
        assert_eq!(transcription_text(json!("hi")), json!("hi"));
    }
}
