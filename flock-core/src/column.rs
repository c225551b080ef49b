//! Column-oriented row representation.
//!
//! A [`ColumnBatch`] holds N logical rows as parallel `data` arrays, one per
//! named column. `data[i]` across all columns is row `i`.

use crate::{FlockResult, ValidationError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Reserved prompt-struct field carrying the context columns.
pub const CONTEXT_COLUMNS_KEY: &str = "context_columns";

/// Synthetic id column appended before ranking/selection requests.
pub const ROW_ID_COLUMN: &str = "flock_row_id";

/// Keys a context column definition may carry.
pub const ALLOWED_COLUMN_KEYS: [&str; 5] = ["name", "data", "type", "detail", "transcription_model"];

// ============================================================================
// COLUMN
// ============================================================================

/// Kind of data a column carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Text,
    Image,
    Audio,
}

impl ColumnType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::Audio => "audio",
        }
    }

    /// Parse a user supplied type. `tabular` is accepted as an alias of text.
    pub fn parse(value: &str) -> Result<Self, ValidationError> {
        match value.to_ascii_lowercase().as_str() {
            "text" | "tabular" => Ok(Self::Text),
            "image" => Ok(Self::Image),
            "audio" => Ok(Self::Audio),
            _ => Err(ValidationError::UnsupportedColumnType {
                value: value.to_string(),
            }),
        }
    }
}

/// One named column with its per-row values and optional metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Column {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub data: Vec<Value>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub column_type: Option<ColumnType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transcription_model: Option<String>,
}

impl Column {
    pub fn new(name: impl Into<String>, data: Vec<Value>) -> Self {
        Self {
            name: Some(name.into()),
            data,
            ..Self::default()
        }
    }

    pub fn unnamed(data: Vec<Value>) -> Self {
        Self {
            data,
            ..Self::default()
        }
    }

    pub fn with_type(mut self, column_type: ColumnType) -> Self {
        self.column_type = Some(column_type);
        self
    }

    pub fn with_transcription_model(mut self, model_name: impl Into<String>) -> Self {
        self.transcription_model = Some(model_name.into());
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Build a column from a context column definition object, validating
    /// its keys and metadata. The returned column has empty `data`.
    pub fn from_definition(definition: &Map<String, Value>) -> FlockResult<Self> {
        for key in definition.keys() {
            if !ALLOWED_COLUMN_KEYS.contains(&key.as_str()) {
                return Err(ValidationError::UnexpectedContextKey { key: key.clone() }.into());
            }
        }
        if !definition.contains_key("data") {
            return Err(ValidationError::MissingContextKey {
                key: "data".to_string(),
            }
            .into());
        }

        let column_type = match optional_string(definition.get("type")) {
            Some(value) => Some(ColumnType::parse(&value)?),
            None => None,
        };
        let column = Self {
            name: optional_string(definition.get("name")),
            data: Vec::new(),
            column_type,
            detail: optional_string(definition.get("detail")),
            transcription_model: optional_string(definition.get("transcription_model")),
        };
        column.validate()?;
        Ok(column)
    }

    /// Check the audio/transcription metadata pairing.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let is_audio = self.column_type == Some(ColumnType::Audio);
        if self.transcription_model.is_some() && !is_audio {
            let data_type = self
                .column_type
                .map(|t| t.as_str().to_string())
                .unwrap_or_else(|| "tabular".to_string());
            return Err(ValidationError::TranscriptionModelNotSupported { data_type });
        }
        if is_audio && self.transcription_model.is_none() {
            return Err(ValidationError::TranscriptionModelRequired);
        }
        Ok(())
    }

    /// Copy of this column's metadata with no data.
    pub fn empty_like(&self) -> Self {
        Self {
            name: self.name.clone(),
            data: Vec::new(),
            column_type: self.column_type,
            detail: self.detail.clone(),
            transcription_model: self.transcription_model.clone(),
        }
    }

    /// Fill metadata that is still unset from `other`. First write wins.
    pub fn absorb_metadata(&mut self, other: &Column) {
        if self.name.is_none() {
            self.name = other.name.clone();
        }
        if self.column_type.is_none() {
            self.column_type = other.column_type;
        }
        if self.detail.is_none() {
            self.detail = other.detail.clone();
        }
        if self.transcription_model.is_none() {
            self.transcription_model = other.transcription_model.clone();
        }
    }

    pub fn is_named(&self, name: &str) -> bool {
        self.name.as_deref() == Some(name)
    }

    pub fn is_image(&self) -> bool {
        self.column_type == Some(ColumnType::Image)
    }

    pub fn is_audio(&self) -> bool {
        self.column_type == Some(ColumnType::Audio)
    }
}

/// Optional metadata value: absent, JSON null and the literal "NULL" all prune.
fn optional_string(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::Null => None,
        Value::String(s) if s == "NULL" => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

// ============================================================================
// COLUMN BATCH
// ============================================================================

/// Ordered set of columns with equal-length data arrays.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ColumnBatch {
    columns: Vec<Column>,
}

impl ColumnBatch {
    pub fn new(columns: Vec<Column>) -> Self {
        Self { columns }
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn into_columns(self) -> Vec<Column> {
        self.columns
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    /// Number of logical rows, taken from the first column.
    pub fn row_count(&self) -> usize {
        self.columns.first().map(|c| c.data.len()).unwrap_or(0)
    }

    /// True when there are no columns or no rows.
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty() || self.row_count() == 0
    }

    /// Columns with metadata but no rows.
    pub fn empty_like(&self) -> Self {
        Self::new(self.columns.iter().map(Column::empty_like).collect())
    }

    /// Rows `[start, start + len)`, clamped to the batch.
    pub fn slice(&self, start: usize, len: usize) -> Self {
        let columns = self
            .columns
            .iter()
            .map(|column| {
                let end = start.saturating_add(len).min(column.data.len());
                let begin = start.min(end);
                Column {
                    data: column.data[begin..end].to_vec(),
                    ..column.empty_like()
                }
            })
            .collect();
        Self::new(columns)
    }

    /// A single row as a one-row batch.
    pub fn row(&self, index: usize) -> Self {
        self.slice(index, 1)
    }

    /// Rows at `indices`, in that order.
    pub fn select_rows(&self, indices: &[usize]) -> Self {
        let columns = self
            .columns
            .iter()
            .map(|column| Column {
                data: indices
                    .iter()
                    .map(|&i| column.data.get(i).cloned().unwrap_or(Value::Null))
                    .collect(),
                ..column.empty_like()
            })
            .collect();
        Self::new(columns)
    }

    /// Append `other`'s rows column by column (positional). Columns missing
    /// here are created; metadata already present is kept.
    pub fn append(&mut self, other: ColumnBatch) {
        for (idx, column) in other.columns.into_iter().enumerate() {
            if self.columns.len() <= idx {
                self.columns.push(column.empty_like());
            }
            let target = &mut self.columns[idx];
            target.absorb_metadata(&column);
            target.data.extend(column.data);
        }
    }

    /// Copy with a trailing `flock_row_id` column holding "0".."n-1".
    pub fn with_row_ids(&self) -> Self {
        let mut tagged = self.clone();
        let ids = (0..self.row_count())
            .map(|i| Value::String(i.to_string()))
            .collect();
        tagged.columns.push(Column::new(ROW_ID_COLUMN, ids));
        tagged
    }

    /// String ids carried by the `flock_row_id` column, if present.
    pub fn row_ids(&self) -> Vec<String> {
        self.columns
            .iter()
            .find(|c| c.is_named(ROW_ID_COLUMN))
            .map(|c| {
                c.data
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(&self.columns).unwrap_or(Value::Array(Vec::new()))
    }
}

impl From<Vec<Column>> for ColumnBatch {
    fn from(columns: Vec<Column>) -> Self {
        Self::new(columns)
    }
}

// ============================================================================
// CONTEXT INPUT PARSING
// ============================================================================

/// Prompt struct values for a chunk of rows, split into the scalar prompt
/// fields and the fanned-out context columns.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContextInput {
    /// Non-column fields of the prompt struct (prompt, prompt_name, ...).
    pub prompt_fields: Map<String, Value>,
    /// Context columns, `None` when the struct had no `context_columns`.
    pub columns: Option<ColumnBatch>,
}

impl ContextInput {
    /// Parse one prompt struct per row. Column definitions are validated
    /// once, from the first row; later rows only contribute data.
    pub fn from_rows(rows: &[Value]) -> FlockResult<Self> {
        let mut input = ContextInput::default();

        for (row_idx, row) in rows.iter().enumerate() {
            let object = row.as_object().ok_or_else(|| ValidationError::InvalidArgument {
                function: "context".to_string(),
                reason: "Prompt details must be a struct.".to_string(),
            })?;

            for (key, value) in object {
                if key == CONTEXT_COLUMNS_KEY {
                    input.push_context_row(row_idx, value)?;
                } else if row_idx == 0 {
                    input.prompt_fields.insert(key.clone(), value.clone());
                }
            }
        }

        Ok(input)
    }

    /// Columns, failing when the struct had no `context_columns`.
    pub fn require_columns(self) -> FlockResult<ColumnBatch> {
        self.columns
            .ok_or_else(|| ValidationError::MissingContextColumns.into())
    }

    fn push_context_row(&mut self, row_idx: usize, value: &Value) -> FlockResult<()> {
        let definitions = value.as_array().ok_or_else(|| ValidationError::InvalidArgument {
            function: "context".to_string(),
            reason: "Expected 'context_columns' to be a list.".to_string(),
        })?;

        let batch = self.columns.get_or_insert_with(ColumnBatch::default);
        if row_idx == 0 || batch.column_count() != definitions.len() {
            if row_idx != 0 {
                return Err(ValidationError::InvalidArgument {
                    function: "context".to_string(),
                    reason: format!(
                        "row {} has {} context columns, expected {}",
                        row_idx,
                        definitions.len(),
                        batch.column_count()
                    ),
                }
                .into());
            }
            for definition in definitions {
                let object = definition.as_object().ok_or_else(|| ValidationError::InvalidArgument {
                    function: "context".to_string(),
                    reason: "Each context column must be a struct.".to_string(),
                })?;
                let mut column = Column::from_definition(object)?;
                column.data.push(object.get("data").cloned().unwrap_or(Value::Null));
                batch.columns.push(column);
            }
            return Ok(());
        }

        for (column, definition) in batch.columns.iter_mut().zip(definitions) {
            column
                .data
                .push(definition.get("data").cloned().unwrap_or(Value::Null));
        }
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FlockError;
    use serde_json::json;

    fn sample_batch() -> ColumnBatch {
        ColumnBatch::new(vec![
            Column::new("name", vec![json!("a"), json!("b"), json!("c"), json!("d")]),
            Column::new("score", vec![json!(1), json!(2), json!(3), json!(4)]),
        ])
    }

    #[test]
    fn test_row_count_and_slice() {
        let batch = sample_batch();
        assert_eq!(batch.row_count(), 4);

        let slice = batch.slice(1, 2);
        assert_eq!(slice.row_count(), 2);
        assert_eq!(slice.columns()[0].data, vec![json!("b"), json!("c")]);
        assert_eq!(slice.columns()[1].name.as_deref(), Some("score"));

        let tail = batch.slice(3, 10);
        assert_eq!(tail.row_count(), 1);
        assert!(batch.slice(9, 2).is_empty());
    }

    #[test]
    fn test_select_rows_preserves_order() {
        let batch = sample_batch();
        let picked = batch.select_rows(&[3, 0]);
        assert_eq!(picked.columns()[0].data, vec![json!("d"), json!("a")]);
        assert_eq!(picked.columns()[1].data, vec![json!(4), json!(1)]);
    }

    #[test]
    fn test_row_ids_roundtrip() {
        let tagged = sample_batch().with_row_ids();
        assert_eq!(tagged.column_count(), 3);
        assert_eq!(tagged.row_ids(), vec!["0", "1", "2", "3"]);

        assert!(tagged.columns()[2].is_named(ROW_ID_COLUMN));
        assert_eq!(&tagged.columns()[..2], sample_batch().columns());
    }

    #[test]
    fn test_append_is_positional_and_first_write_wins() {
        let mut target = ColumnBatch::new(vec![Column::new("x", vec![json!(1)])]);
        let source = ColumnBatch::new(vec![Column::new("renamed", vec![json!(2)]).with_detail("low")]);
        target.append(source);

        let column = &target.columns()[0];
        assert_eq!(column.name.as_deref(), Some("x"));
        assert_eq!(column.detail.as_deref(), Some("low"));
        assert_eq!(column.data, vec![json!(1), json!(2)]);
    }

    #[test]
    fn test_serializes_like_context_columns() {
        let batch = ColumnBatch::new(vec![Column::new("d", vec![json!("x")])]);
        assert_eq!(batch.to_json(), json!([{"name": "d", "data": ["x"]}]));
    }

    #[test]
    fn test_context_input_fans_out_rows() {
        let rows = vec![
            json!({"prompt": "p", "context_columns": [{"name": "d", "data": "r0", "type": "NULL"}]}),
            json!({"prompt": "p", "context_columns": [{"name": "d", "data": "r1", "type": "NULL"}]}),
        ];
        let input = ContextInput::from_rows(&rows).unwrap();
        assert_eq!(input.prompt_fields.get("prompt"), Some(&json!("p")));

        let columns = input.require_columns().unwrap();
        assert_eq!(columns.row_count(), 2);
        assert_eq!(columns.columns()[0].column_type, None);
        assert_eq!(columns.columns()[0].data, vec![json!("r0"), json!("r1")]);
    }

    #[test]
    fn test_transcription_model_without_type_is_rejected() {
        let rows = vec![json!({
            "context_columns": [{"data": "clip.mp3", "transcription_model": "whisper"}]
        })];
        let err = ContextInput::from_rows(&rows).unwrap_err();
        assert!(matches!(
            err,
            FlockError::Validation(ValidationError::TranscriptionModelNotSupported { ref data_type })
                if data_type == "tabular"
        ));
    }

    #[test]
    fn test_audio_without_transcription_model_is_rejected() {
        let rows = vec![json!({"context_columns": [{"data": "clip.mp3", "type": "audio"}]})];
        let err = ContextInput::from_rows(&rows).unwrap_err();
        assert!(matches!(
            err,
            FlockError::Validation(ValidationError::TranscriptionModelRequired)
        ));
    }

    #[test]
    fn test_unknown_context_key_is_rejected() {
        let rows = vec![json!({"context_columns": [{"data": "x", "colour": "red"}]})];
        let err = ContextInput::from_rows(&rows).unwrap_err();
        assert!(matches!(
            err,
            FlockError::Validation(ValidationError::UnexpectedContextKey { ref key }) if key == "colour"
        ));
    }

    #[test]
    fn test_missing_context_columns() {
        let rows = vec![json!({"prompt": "p"})];
        let input = ContextInput::from_rows(&rows).unwrap();
        assert!(input.columns.is_none());
        assert!(input.require_columns().is_err());
    }

    #[test]
    fn test_validation_runs_on_first_row_only() {
        // Second row carries an unknown key; only the first row's definition is validated.
        let rows = vec![
            json!({"context_columns": [{"data": "a"}]}),
            json!({"context_columns": [{"data": "b", "colour": "red"}]}),
        ];
        let columns = ContextInput::from_rows(&rows).unwrap().require_columns().unwrap();
        assert_eq!(columns.row_count(), 2);
    }
}
