//! Aggregate accumulator lifecycle for `llm_reduce`, `llm_rerank`,
//! `llm_first` and `llm_last`.

use crate::bind::{FunctionBinding, FunctionContext};
use crate::first_or_last::first_or_last;
use crate::reduce::reduce;
use crate::rerank::rerank;
use flock_core::{ColumnBatch, ContextInput, FlockResult, FunctionKind, ValidationError};
use flock_metrics::StateId;
use serde_json::Value;
use std::time::Instant;

// ============================================================================
// ACCUMULATOR STATE
// ============================================================================

/// Per-group accumulator.
///
/// Rows are appended column by column. Column metadata is first-write-wins:
/// rows of one group are expected to share it.
///
/// Not `Clone`: the id keys this state's metrics and must stay unique.
#[derive(Debug, PartialEq)]
pub struct AccumulatorState {
    id: StateId,
    value: Option<ColumnBatch>,
    initialized: bool,
}

impl AccumulatorState {
    /// Uninitialized state with a fresh identity.
    pub fn new() -> Self {
        Self {
            id: StateId::next(),
            value: None,
            initialized: false,
        }
    }

    /// Identity used to key this state's metrics.
    pub fn id(&self) -> StateId {
        self.id
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn value(&self) -> Option<&ColumnBatch> {
        self.value.as_ref()
    }

    /// True when no rows have been accumulated.
    pub fn is_empty(&self) -> bool {
        self.value.as_ref().map_or(true, ColumnBatch::is_empty)
    }

    pub fn initialize(&mut self) {
        self.value = Some(ColumnBatch::default());
        self.initialized = true;
    }

    /// Append `rows`, creating columns on first sight.
    pub fn update(&mut self, rows: ColumnBatch) {
        self.initialized = true;
        self.value.get_or_insert_with(ColumnBatch::default).append(rows);
    }

    /// Merge a partial state of the same group. Columns are matched by
    /// position; `source` is left untouched.
    pub fn combine(&mut self, source: &AccumulatorState) {
        if self.value.is_none() {
            self.initialize();
        }
        if let (Some(target), Some(rows)) = (self.value.as_mut(), source.value.as_ref()) {
            target.append(rows.clone());
        }
    }

    /// Release the accumulated rows.
    pub fn destroy(&mut self) {
        self.value = None;
        self.initialized = false;
    }
}

impl Default for AccumulatorState {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// AGGREGATE FUNCTION
// ============================================================================

/// A bound aggregate LLM function.
#[derive(Debug, Clone)]
pub struct AggregateFunction {
    binding: FunctionBinding,
    ctx: FunctionContext,
}

impl AggregateFunction {
    /// Bind an aggregate call.
    ///
    /// # Arguments
    /// * `kind` - One of reduce, rerank, first, last
    /// * `args` - Model struct and prompt struct (which must name `context_columns`)
    /// * `ctx` - Collaborators used at bind and finalize time
    pub fn bind(kind: FunctionKind, args: &[Value], ctx: FunctionContext) -> FlockResult<Self> {
        if !kind.is_aggregate() {
            return Err(ValidationError::InvalidArgument {
                function: kind.to_string(),
                reason: "not an aggregate function".to_string(),
            }
            .into());
        }
        let binding = FunctionBinding::bind(kind, args, &ctx)?;
        Ok(Self { binding, ctx })
    }

    pub fn kind(&self) -> FunctionKind {
        self.binding.kind
    }

    pub fn binding(&self) -> &FunctionBinding {
        &self.binding
    }

    pub fn initialize(&self, state: &mut AccumulatorState) {
        state.initialize();
    }

    /// Feed one chunk of prompt structs into a single state.
    pub fn update(&self, state: &mut AccumulatorState, prompt_rows: &[Value]) -> FlockResult<()> {
        if prompt_rows.is_empty() {
            return Ok(());
        }
        let columns = ContextInput::from_rows(prompt_rows)?.require_columns()?;
        state.update(columns);
        Ok(())
    }

    /// Feed one chunk of prompt structs, row `i` going to
    /// `states[targets[i]]`.
    pub fn scatter_update(
        &self,
        states: &mut [AccumulatorState],
        prompt_rows: &[Value],
        targets: &[usize],
    ) -> FlockResult<()> {
        if targets.len() != prompt_rows.len() {
            return Err(self.invalid(format!(
                "{} rows but {} target states",
                prompt_rows.len(),
                targets.len()
            )));
        }
        if prompt_rows.is_empty() {
            return Ok(());
        }
        if let Some(&bad) = targets.iter().find(|&&t| t >= states.len()) {
            return Err(self.invalid(format!("target state {} out of range", bad)));
        }

        let columns = ContextInput::from_rows(prompt_rows)?.require_columns()?;
        for (row, &target) in targets.iter().enumerate() {
            states[target].update(columns.row(row));
        }
        Ok(())
    }

    pub fn combine(&self, source: &AccumulatorState, target: &mut AccumulatorState) {
        target.combine(source);
    }

    pub fn destroy(&self, state: &mut AccumulatorState) {
        state.destroy();
    }

    /// One result per state: `None` for an empty group, otherwise the
    /// engine output as text.
    ///
    /// Every state that reaches an engine opens its own metrics invocation;
    /// afterwards they are merged into a single logical entry for this call.
    /// Any engine error aborts the whole finalize.
    pub fn finalize(&self, states: &[AccumulatorState]) -> FlockResult<Vec<Option<String>>> {
        let kind = self.binding.kind;
        let mut results = Vec::with_capacity(states.len());
        let mut processed = Vec::new();

        for state in states {
            let Some(batch) = state.value().filter(|batch| !batch.is_empty()) else {
                results.push(None);
                continue;
            };

            if matches!(kind, FunctionKind::First | FunctionKind::Last) && batch.row_count() <= 1 {
                results.push(Some(batch.slice(0, 1).to_json().to_string()));
                continue;
            }

            processed.push(state.id());
            let session = self.ctx.metrics.start_invocation(state.id(), kind);
            let started = Instant::now();
            let mut inv = self.binding.invocation(&self.ctx, Some(session.clone()))?;

            let output = match kind {
                FunctionKind::Reduce => match reduce(&mut inv, batch)? {
                    Value::String(text) => text,
                    other => other.to_string(),
                },
                FunctionKind::Rerank => rerank(&mut inv, batch)?.to_json().to_string(),
                FunctionKind::First | FunctionKind::Last => first_or_last(&mut inv, batch)?.to_json().to_string(),
                FunctionKind::Complete | FunctionKind::Filter | FunctionKind::Embedding => {
                    return Err(self.invalid("not an aggregate function".to_string()));
                }
            };

            session.add_execution_time(started.elapsed());
            results.push(Some(output));
        }

        if !processed.is_empty() {
            let details = &self.binding.model;
            self.ctx
                .metrics
                .merge_aggregate_metrics(&processed, kind, &details.model_name, &details.provider_name);
        }
        Ok(results)
    }

    fn invalid(&self, reason: String) -> flock_core::FlockError {
        ValidationError::InvalidArgument {
            function: self.binding.kind.to_string(),
            reason,
        }
        .into()
    }
}
