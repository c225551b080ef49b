//! Metrics cells and the session handle that writes into them.

use flock_core::FunctionKind;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

static NEXT_STATE_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of one logical invocation (an aggregate state or a scalar call).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StateId(u64);

impl StateId {
    /// Allocate a process-unique id.
    pub fn next() -> Self {
        Self(NEXT_STATE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for StateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// METRICS CELL
// ============================================================================

/// Counters for one (thread, state, function kind) slot.
#[derive(Default)]
pub struct MetricsCell {
    model_info: OnceCell<(String, String)>,
    input_tokens: AtomicI64,
    output_tokens: AtomicI64,
    api_calls: AtomicI64,
    api_duration_us: AtomicI64,
    execution_time_us: AtomicI64,
}

impl MetricsCell {
    pub(crate) fn from_snapshot(snapshot: &MetricsSnapshot) -> Self {
        let cell = Self {
            model_info: OnceCell::new(),
            input_tokens: AtomicI64::new(snapshot.input_tokens),
            output_tokens: AtomicI64::new(snapshot.output_tokens),
            api_calls: AtomicI64::new(snapshot.api_calls),
            api_duration_us: AtomicI64::new(snapshot.api_duration_us),
            execution_time_us: AtomicI64::new(snapshot.execution_time_us),
        };
        if let Some(model_name) = &snapshot.model_name {
            let provider = snapshot.provider.clone().unwrap_or_default();
            let _ = cell.model_info.set((model_name.clone(), provider));
        }
        cell
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let (model_name, provider) = match self.model_info.get() {
            Some((model, provider)) => (non_empty(model), non_empty(provider)),
            None => (None, None),
        };
        MetricsSnapshot {
            model_name,
            provider,
            input_tokens: self.input_tokens.load(Ordering::Relaxed),
            output_tokens: self.output_tokens.load(Ordering::Relaxed),
            api_calls: self.api_calls.load(Ordering::Relaxed),
            api_duration_us: self.api_duration_us.load(Ordering::Relaxed),
            execution_time_us: self.execution_time_us.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Debug for MetricsCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricsCell")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

fn non_empty(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

// ============================================================================
// METRICS SNAPSHOT
// ============================================================================

/// Point-in-time copy of one metrics entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub model_name: Option<String>,
    pub provider: Option<String>,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub api_calls: i64,
    pub api_duration_us: i64,
    pub execution_time_us: i64,
}

impl MetricsSnapshot {
    pub fn total_tokens(&self) -> i64 {
        self.input_tokens + self.output_tokens
    }

    /// Model info alone does not make an entry non-empty.
    pub fn is_empty(&self) -> bool {
        self.input_tokens == 0
            && self.output_tokens == 0
            && self.api_calls == 0
            && self.api_duration_us == 0
            && self.execution_time_us == 0
    }

    /// Sum counters; keep the first non-empty model name and provider.
    pub fn absorb(&mut self, other: &MetricsSnapshot) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.api_calls += other.api_calls;
        self.api_duration_us += other.api_duration_us;
        self.execution_time_us += other.execution_time_us;
        if self.model_name.is_none() {
            self.model_name = other.model_name.clone();
        }
        if self.provider.is_none() {
            self.provider = other.provider.clone();
        }
    }

    pub fn to_json(&self) -> Value {
        let mut value = json!({
            "input_tokens": self.input_tokens,
            "output_tokens": self.output_tokens,
            "total_tokens": self.total_tokens(),
            "api_calls": self.api_calls,
            "api_duration_ms": self.api_duration_us as f64 / 1000.0,
            "execution_time_ms": self.execution_time_us as f64 / 1000.0,
        });
        if let Some(map) = value.as_object_mut() {
            if let Some(model_name) = &self.model_name {
                map.insert("model_name".to_string(), json!(model_name));
            }
            if let Some(provider) = &self.provider {
                map.insert("provider".to_string(), json!(provider));
            }
        }
        value
    }
}

// ============================================================================
// METRICS SESSION
// ============================================================================

/// Handle returned by [`crate::MetricsLedger::start_invocation`].
///
/// Writes go straight to the registered cell's atomics; no ledger lock is
/// taken after the session is created.
#[derive(Debug, Clone)]
pub struct MetricsSession {
    state: StateId,
    kind: FunctionKind,
    cell: Arc<MetricsCell>,
}

impl MetricsSession {
    pub(crate) fn new(state: StateId, kind: FunctionKind, cell: Arc<MetricsCell>) -> Self {
        Self { state, kind, cell }
    }

    pub fn state(&self) -> StateId {
        self.state
    }

    pub fn kind(&self) -> FunctionKind {
        self.kind
    }

    /// First call wins.
    pub fn set_model_info(&self, model_name: &str, provider: &str) {
        let _ = self
            .cell
            .model_info
            .set((model_name.to_string(), provider.to_string()));
    }

    pub fn update_tokens(&self, input: i64, output: i64) {
        self.cell.input_tokens.fetch_add(input, Ordering::Relaxed);
        self.cell.output_tokens.fetch_add(output, Ordering::Relaxed);
    }

    pub fn increment_api_calls(&self) {
        self.cell.api_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_api_duration(&self, duration: Duration) {
        self.cell
            .api_duration_us
            .fetch_add(duration_us(duration), Ordering::Relaxed);
    }

    pub fn add_execution_time(&self, duration: Duration) {
        self.cell
            .execution_time_us
            .fetch_add(duration_us(duration), Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.cell.snapshot()
    }
}

fn duration_us(duration: Duration) -> i64 {
    i64::try_from(duration.as_micros()).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_ids_are_unique() {
        let a = StateId::next();
        let b = StateId::next();
        assert_ne!(a, b);
    }

    #[test]
    fn test_session_accumulates() {
        let session = MetricsSession::new(StateId::next(), FunctionKind::Complete, Arc::default());
        session.update_tokens(10, 5);
        session.update_tokens(1, 2);
        session.increment_api_calls();
        session.add_api_duration(Duration::from_millis(3));
        session.add_execution_time(Duration::from_micros(1500));

        let snapshot = session.snapshot();
        assert_eq!(snapshot.input_tokens, 11);
        assert_eq!(snapshot.output_tokens, 7);
        assert_eq!(snapshot.api_calls, 1);
        assert_eq!(snapshot.api_duration_us, 3000);
        assert_eq!(snapshot.execution_time_us, 1500);
    }

    #[test]
    fn test_model_info_first_write_wins() {
        let session = MetricsSession::new(StateId::next(), FunctionKind::Reduce, Arc::default());
        session.set_model_info("gpt-4o", "openai");
        session.set_model_info("llama3", "ollama");
        let snapshot = session.snapshot();
        assert_eq!(snapshot.model_name.as_deref(), Some("gpt-4o"));
        assert_eq!(snapshot.provider.as_deref(), Some("openai"));
    }

    #[test]
    fn test_snapshot_json_shape() {
        let snapshot = MetricsSnapshot {
            model_name: Some("gpt-4o".to_string()),
            provider: None,
            input_tokens: 100,
            output_tokens: 50,
            api_calls: 2,
            api_duration_us: 2500,
            execution_time_us: 0,
        };
        let value = snapshot.to_json();
        assert_eq!(value["total_tokens"], 150);
        assert_eq!(value["api_duration_ms"], 2.5);
        assert_eq!(value["model_name"], "gpt-4o");
        assert!(value.get("provider").is_none());
    }

    #[test]
    fn test_model_info_alone_is_empty() {
        let snapshot = MetricsSnapshot {
            model_name: Some("m".to_string()),
            ..MetricsSnapshot::default()
        };
        assert!(snapshot.is_empty());
    }
}
