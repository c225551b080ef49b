//! Prompt rendering: meta prompt template plus the serialized tuple table.

use crate::MediaPayload;
use flock_core::{Column, ColumnBatch, FlockResult, FunctionKind, TupleFormat, ValidationError};
use serde_json::{Map, Value};

const USER_PROMPT: &str = "{{USER_PROMPT}}";
const TUPLES: &str = "{{TUPLES}}";
const INSTRUCTIONS: &str = "{{INSTRUCTIONS}}";
const RESPONSE_FORMAT: &str = "{{RESPONSE_FORMAT}}";
const RELEVANCE: &str = "{{RELEVANCE}}";

pub const META_PROMPT: &str = "# System Setup\n\
You are **FlockMTL**, a semantic analysis tool for DBMS that can process both **text and image-derived data**.\n\
Your task is to reason over a structured dataset where **some columns originate from text and others come from external sources** like images or separate dictionaries.\n\
\n\
## Table Context\n\
- The section labeled **\"Table Data\"** includes all rows (rows).\n\
- Each row may contain standard fields, extra textual columns (converted from images or separated text), and image-related columns (e.g., image references or external attachments).\n\
- **Treat all these columns as part of the same table context.**\n\
\n\
## Processing Instructions\n\
1. Interpret the user's prompt precisely for each row.\n\
2. Consider **every column**, including those derived from external content or images.\n\
3. If the prompt involves images, **reason about them in the context of the row's other data**.\n\
\n\
## User's Task\n\
**User Prompt**:\n\
```\n\
{{USER_PROMPT}}\n\
```\n\
\n\
## Table Data\n\
```\n\
{{TUPLES}}\n\
```\n\
*Some columns may be embedded as text; others may reference external images; treat them all equally.*\n\
\n\
## Instructions\n\
```\n\
{{INSTRUCTIONS}}\n\
```\n\
- Emphasize that external columns must be merged into the logical row.\n\
- Clarify how to balance reasoning across different column types.\n\
- Encourage a **step-by-step reasoning** process where appropriate.\n\
\n\
## Output Format\n\
```\n\
{{RESPONSE_FORMAT}}\n\
```\n\
Ensure your results follow this format exactly, with **no extra commentary**.\n";

const SCALAR_INSTRUCTIONS: &str = "- Treat each row independently as if it were a standalone record.\n\
- Answer the user prompt specifically for that row, without referencing other rows.\n\
- Do not include extra formatting or explanations; return only the relevant answer.\n\
- Ensure the output is concise, meaningful, and context-aware.";

const AGGREGATE_INSTRUCTIONS: &str = "- First, analyze each row according to the user prompt.\n\
- Then, aggregate the results into a single answer that addresses the prompt as a whole.\n\
- Aggregation may include summarizing, calculating, counting, ranking, or selecting.\n\
- Treat all columns (including those reconstructed from images or text with separators) as part of the table.\n\
- Return the aggregated answer in the expected response format, without additional commentary.";

const COMPLETE_FORMAT: &str = "For each row in the provided table, respond directly to the user's prompt. \
Ensure that each row is addressed individually and that no row is omitted. \
Each response should be concise, relevant, and based solely on the information within the respective row.";

const FILTER_FORMAT: &str = "For each row in the provided table, determine whether it satisfies the user's prompt. \
Return 'true' if the row meets the criteria, and 'false' otherwise. \
Ensure that each row is evaluated independently and that no row is skipped.";

const REDUCE_FORMAT: &str = "Analyze each row in the provided table to extract the most pertinent information related to the user's prompt. \
Synthesize these individual insights into a single, coherent response that encapsulates the collective relevance of all rows.";

const FIRST_OR_LAST_FORMAT: &str = "Identify the row that is {{RELEVANCE}} relevant to the user's prompt. \
Return only the single index number of this row from the `flock_row_id` field, indicating its position within the provided table. \
The response should be a single integer value, not an array. \
Ensure that the relevance assessment is based solely on the information within each row.";

const RERANK_FORMAT: &str = "Evaluate the relevance of each row in the provided table concerning the user's prompt. \
Rank the rows in descending order of relevance and return a flat array of the row indices in this order. \
Use the `flock_row_id` values and return them as a simple array of integers, not nested arrays. \
Each row should be considered independently, and the ranking should reflect the individual pertinence of each row.";

/// A rendered prompt and the media kept out of its tuple table.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedPrompt {
    pub prompt: String,
    pub media: MediaPayload,
}

/// Turns a user prompt and a batch of rows into provider input.
///
/// Rendering is pure. Image columns are routed to the media payload; audio
/// columns are expected to have been transcribed already and are skipped.
pub trait PromptRenderer: Send + Sync {
    fn render(
        &self,
        user_prompt: &str,
        batch: &ColumnBatch,
        kind: FunctionKind,
        format: TupleFormat,
    ) -> FlockResult<RenderedPrompt>;
}

/// Default renderer built on [`META_PROMPT`].
#[derive(Debug, Clone, Copy, Default)]
pub struct TemplateRenderer;

impl TemplateRenderer {
    pub fn new() -> Self {
        Self
    }

    /// Meta prompt with instructions and response format filled in.
    pub fn template(kind: FunctionKind) -> FlockResult<String> {
        let (instructions, response_format) = match kind {
            FunctionKind::Complete => (SCALAR_INSTRUCTIONS, COMPLETE_FORMAT.to_string()),
            FunctionKind::Filter => (SCALAR_INSTRUCTIONS, FILTER_FORMAT.to_string()),
            FunctionKind::Reduce => (AGGREGATE_INSTRUCTIONS, REDUCE_FORMAT.to_string()),
            FunctionKind::Rerank => (AGGREGATE_INSTRUCTIONS, RERANK_FORMAT.to_string()),
            FunctionKind::First => (
                AGGREGATE_INSTRUCTIONS,
                FIRST_OR_LAST_FORMAT.replace(RELEVANCE, "most"),
            ),
            FunctionKind::Last => (
                AGGREGATE_INSTRUCTIONS,
                FIRST_OR_LAST_FORMAT.replace(RELEVANCE, "least"),
            ),
            FunctionKind::Embedding => {
                return Err(ValidationError::InvalidArgument {
                    function: kind.to_string(),
                    reason: "embedding requests do not use a prompt template".to_string(),
                }
                .into())
            }
        };
        Ok(META_PROMPT
            .replace(INSTRUCTIONS, instructions)
            .replace(RESPONSE_FORMAT, &response_format))
    }
}

impl PromptRenderer for TemplateRenderer {
    fn render(
        &self,
        user_prompt: &str,
        batch: &ColumnBatch,
        kind: FunctionKind,
        format: TupleFormat,
    ) -> FlockResult<RenderedPrompt> {
        let mut media = MediaPayload::default();
        let mut tabular = Vec::new();
        for column in batch.columns() {
            if column.is_image() {
                media.image.push(column.clone());
            } else if column.is_audio() {
                tracing::debug!(column = ?column.name, "Skipping untranscribed audio column");
            } else {
                tabular.push(column.clone());
            }
        }

        let tuples = if tabular.is_empty() {
            String::new()
        } else {
            render_tuples(&tabular, format)
        };
        let prompt = fill_placeholders(&Self::template(kind)?, &[(USER_PROMPT, user_prompt), (TUPLES, &tuples)]);

        Ok(RenderedPrompt { prompt, media })
    }
}

/// Substitute every placeholder in one left-to-right pass. Inserted values
/// are never scanned again.
fn fill_placeholders(template: &str, values: &[(&str, &str)]) -> String {
    let mut filled = String::with_capacity(template.len());
    let mut rest = template;
    while let Some((at, placeholder, value)) = values
        .iter()
        .filter_map(|&(placeholder, value)| rest.find(placeholder).map(|at| (at, placeholder, value)))
        .min_by_key(|&(at, _, _)| at)
    {
        filled.push_str(&rest[..at]);
        filled.push_str(value);
        rest = &rest[at + placeholder.len()..];
    }
    filled.push_str(rest);
    filled
}

// ============================================================================
// TUPLE TABLE
// ============================================================================

/// Serialize the tuple table with its "Number of Tuples" preamble.
pub fn render_tuples(columns: &[Column], format: TupleFormat) -> String {
    let num_tuples = columns.first().map(|c| c.data.len()).unwrap_or(0);
    let mut out = format!(
        "- The Number of Tuples to Generate Responses for: {}\n\n",
        num_tuples
    );
    match format {
        TupleFormat::Xml => {
            out.push_str(&xml_header(columns));
            out.push_str(&xml_rows(columns));
        }
        TupleFormat::Markdown => {
            out.push_str(&markdown_header(columns));
            out.push_str(&markdown_rows(columns));
        }
        TupleFormat::Json => out.push_str(&json_table(columns)),
    }
    out
}

/// Column display names; unnamed columns are numbered `COLUMN n` in order.
fn column_names(columns: &[Column]) -> Vec<(String, bool)> {
    let mut unnamed = 0;
    columns
        .iter()
        .map(|column| match &column.name {
            Some(name) => (name.clone(), true),
            None => {
                unnamed += 1;
                (format!("COLUMN {}", unnamed), false)
            }
        })
        .collect()
}

fn xml_header(columns: &[Column]) -> String {
    let mut header = String::from("<header>");
    for (name, _) in column_names(columns) {
        header.push_str(&format!("<column>{}</column>", name));
    }
    header.push_str("</header>\n");
    header
}

fn xml_value(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn xml_rows(columns: &[Column]) -> String {
    let rows = columns.first().map(|c| c.data.len()).unwrap_or(0);
    if rows == 0 {
        return "<row></row>\n".to_string();
    }
    let mut out = String::new();
    for i in 0..rows {
        out.push_str("<row>");
        for column in columns {
            let value = column.data.get(i).map(xml_value).unwrap_or_default();
            out.push_str(&format!("<column>{}</column>", value));
        }
        out.push_str("</row>\n");
    }
    out
}

fn markdown_header(columns: &[Column]) -> String {
    let names = column_names(columns);
    let mut header = String::from(" | ");
    for (name, named) in &names {
        if *named {
            header.push_str(&format!("COLUMN_{} | ", name));
        } else {
            header.push_str(&format!("{} | ", name));
        }
    }
    header.push_str("\n | ");
    for (name, _) in &names {
        header.push_str(&format!("{} | ", "-".repeat(name.len())));
    }
    header.push('\n');
    header
}

fn markdown_rows(columns: &[Column]) -> String {
    let rows = columns.first().map(|c| c.data.len()).unwrap_or(0);
    let mut out = String::new();
    for i in 0..rows {
        out.push_str(" | ");
        for column in columns {
            let value = column.data.get(i).cloned().unwrap_or(Value::Null);
            out.push_str(&format!("{} | ", value));
        }
        out.push('\n');
    }
    out
}

fn json_table(columns: &[Column]) -> String {
    let mut table = Map::new();
    for ((name, _), column) in column_names(columns).into_iter().zip(columns) {
        table.insert(name, Value::Array(column.data.clone()));
    }
    let mut out = pretty_json(&Value::Object(table));
    out.push('\n');
    out
}

/// JSON with four-space indentation.
pub fn pretty_json(value: &Value) -> String {
    use serde::Serialize;

    let mut buf = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut serializer = serde_json::Serializer::with_formatter(&mut buf, formatter);
    match value.serialize(&mut serializer) {
        Ok(()) => String::from_utf8(buf).unwrap_or_else(|_| value.to_string()),
        Err(_) => value.to_string(),
    }
}
