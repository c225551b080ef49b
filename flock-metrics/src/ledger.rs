//! Thread-partitioned metrics ledger.

use crate::{MetricsCell, MetricsSession, MetricsSnapshot, StateId};
use flock_core::FunctionKind;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::thread::{self, ThreadId};

type StateCells = [Arc<MetricsCell>; FunctionKind::COUNT];

fn fresh_cells() -> StateCells {
    std::array::from_fn(|_| Arc::new(MetricsCell::default()))
}

#[derive(Debug, Default)]
struct LedgerState {
    /// thread -> state -> one cell per function kind
    threads: HashMap<ThreadId, HashMap<StateId, StateCells>>,
    registration_order: HashMap<(StateId, FunctionKind), usize>,
    counters: HashMap<(ThreadId, FunctionKind), usize>,
}

impl LedgerState {
    fn cell(&mut self, thread: ThreadId, state: StateId, kind: FunctionKind) -> Arc<MetricsCell> {
        let cells = self
            .threads
            .entry(thread)
            .or_default()
            .entry(state)
            .or_insert_with(fresh_cells);
        Arc::clone(&cells[kind.index()])
    }

    fn register(&mut self, thread: ThreadId, state: StateId, kind: FunctionKind) -> Arc<MetricsCell> {
        if !self.registration_order.contains_key(&(state, kind)) {
            let counter = self.counters.entry((thread, kind)).or_insert(0);
            *counter += 1;
            self.registration_order.insert((state, kind), *counter);
        }
        self.cell(thread, state, kind)
    }
}

/// Usage accounting for every LLM function invocation in one database.
///
/// Entries are keyed by `(thread, state, function kind)`. Writes happen
/// through [`MetricsSession`] handles and never take the ledger lock; the
/// lock guards registration, reads, merge and reset.
#[derive(Debug, Default)]
pub struct MetricsLedger {
    state: RwLock<LedgerState>,
}

impl MetricsLedger {
    pub fn new() -> Self {
        Self::default()
    }

    // Metrics must never fail a query, so a poisoned lock is recovered.
    fn read(&self) -> RwLockReadGuard<'_, LedgerState> {
        self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, LedgerState> {
        self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register `(state, kind)` on the calling thread and return the session
    /// that records into it.
    ///
    /// The registration order is assigned the first time the pair is seen;
    /// later calls reuse it.
    pub fn start_invocation(&self, state: StateId, kind: FunctionKind) -> MetricsSession {
        let cell = self.write().register(thread::current().id(), state, kind);
        MetricsSession::new(state, kind, cell)
    }

    /// Snapshot of `(state, kind)` as recorded on the calling thread.
    pub fn entry(&self, state: StateId, kind: FunctionKind) -> Option<MetricsSnapshot> {
        let guard = self.read();
        let cells = guard.threads.get(&thread::current().id())?.get(&state)?;
        Some(cells[kind.index()].snapshot())
    }

    /// Flattened view: `"<function>_<n>"` -> metrics.
    ///
    /// Entries sharing `(kind, registration order)` across threads are one
    /// logical invocation and are summed. Ordinals are renumbered from 1 per
    /// kind in registration order.
    pub fn get_metrics(&self) -> Value {
        let guard = self.read();
        let mut merged: HashMap<(FunctionKind, usize), MetricsSnapshot> = HashMap::new();

        for states in guard.threads.values() {
            for (state, cells) in states {
                for kind in FunctionKind::ALL {
                    let snapshot = cells[kind.index()].snapshot();
                    if snapshot.is_empty() {
                        continue;
                    }
                    let order = guard
                        .registration_order
                        .get(&(*state, kind))
                        .copied()
                        .unwrap_or(usize::MAX);
                    merged.entry((kind, order)).or_default().absorb(&snapshot);
                }
            }
        }

        let mut entries: Vec<_> = merged.into_iter().collect();
        entries.sort_by_key(|((kind, order), _)| (*kind, *order));

        let mut result = Map::new();
        let mut ordinals: HashMap<FunctionKind, usize> = HashMap::new();
        for ((kind, _), snapshot) in entries {
            let ordinal = ordinals.entry(kind).or_insert(0);
            *ordinal += 1;
            result.insert(format!("{}_{}", kind, ordinal), snapshot.to_json());
        }
        Value::Object(result)
    }

    /// Nested view preserving thread and state partitioning.
    pub fn get_debug_metrics(&self) -> Value {
        let guard = self.read();
        let mut threads = Map::new();

        for (thread, states) in &guard.threads {
            let mut thread_data = Map::new();
            for (state, cells) in states {
                let mut state_data = Map::new();
                for kind in FunctionKind::ALL {
                    let snapshot = cells[kind.index()].snapshot();
                    if snapshot.is_empty() {
                        continue;
                    }
                    let order = guard
                        .registration_order
                        .get(&(*state, kind))
                        .copied()
                        .unwrap_or(0);
                    let mut function_data = snapshot.to_json();
                    if let Some(map) = function_data.as_object_mut() {
                        map.insert("registration_order".to_string(), json!(order));
                    }
                    state_data.insert(kind.to_string(), function_data);
                }
                if !state_data.is_empty() {
                    thread_data.insert(state.to_string(), Value::Object(state_data));
                }
            }
            if !thread_data.is_empty() {
                threads.insert(format!("{:?}", thread), Value::Object(thread_data));
            }
        }

        let thread_count = threads.len();
        json!({
            "threads": Value::Object(threads),
            "thread_count": thread_count,
        })
    }

    /// Fold the metrics of `states` into the first one so a group processed
    /// by several partial states reports as one invocation.
    ///
    /// The first state is (re)registered; its counters become the sum over
    /// all states and the others are cleared. `model_name`/`provider`, when
    /// non-empty, take precedence over recorded model info.
    pub fn merge_aggregate_metrics(
        &self,
        states: &[StateId],
        kind: FunctionKind,
        model_name: &str,
        provider: &str,
    ) {
        let Some(&merged_state) = states.first() else {
            return;
        };
        let thread = thread::current().id();
        let mut guard = self.write();
        guard.register(thread, merged_state, kind);

        let mut total = MetricsSnapshot {
            model_name: (!model_name.is_empty()).then(|| model_name.to_string()),
            provider: (!model_name.is_empty() && !provider.is_empty()).then(|| provider.to_string()),
            ..MetricsSnapshot::default()
        };
        for state in states {
            let snapshot = guard.cell(thread, *state, kind).snapshot();
            if snapshot.is_empty() {
                continue;
            }
            if total.model_name.is_none() && snapshot.model_name.is_some() {
                total.model_name = snapshot.model_name.clone();
                total.provider = snapshot.provider.clone();
            }
            let counters = MetricsSnapshot {
                model_name: None,
                provider: None,
                ..snapshot
            };
            total.absorb(&counters);
        }

        tracing::debug!(
            kind = %kind,
            merged_state = %merged_state,
            state_count = states.len(),
            input_tokens = total.input_tokens,
            output_tokens = total.output_tokens,
            api_calls = total.api_calls,
            "Merged aggregate metrics"
        );

        if let Some(cells) = guard
            .threads
            .get_mut(&thread)
            .and_then(|by_state| by_state.get_mut(&merged_state))
        {
            cells[kind.index()] = Arc::new(MetricsCell::from_snapshot(&total));
        }
        for state in &states[1..] {
            if *state == merged_state {
                continue;
            }
            if let Some(cells) = guard
                .threads
                .get_mut(&thread)
                .and_then(|by_state| by_state.get_mut(state))
            {
                cells[kind.index()] = Arc::new(MetricsCell::default());
            }
        }
    }

    /// Drop every entry and registration counter.
    pub fn reset(&self) {
        let mut guard = self.write();
        *guard = LedgerState::default();
        tracing::debug!("Metrics ledger reset");
    }
}

// ============================================================================
// TESTS
// ============================================================================
