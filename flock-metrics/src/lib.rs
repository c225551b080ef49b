//! Flock Metrics - usage accounting for LLM function invocations
//!
//! A [`MetricsLedger`] keeps token, call and latency counters per
//! `(thread, state, function kind)`. Callers obtain a [`MetricsSession`]
//! from [`MetricsLedger::start_invocation`] and record through it.

mod ledger;
mod session;

pub use ledger::MetricsLedger;
pub use session::{MetricsCell, MetricsSession, MetricsSnapshot, StateId};
