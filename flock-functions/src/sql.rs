//! Metrics functions exposed to SQL.

use crate::bind::FunctionContext;
use serde_json::Value;

pub const RESET_CONFIRMATION: &str = "Metrics reset successfully";

/// `flock_get_metrics()`: `"<function>_<n>"` -> metrics object.
pub fn flock_get_metrics(ctx: &FunctionContext) -> Value {
    ctx.metrics.get_metrics()
}

/// `flock_get_debug_metrics()`: per-thread, per-state breakdown.
pub fn flock_get_debug_metrics(ctx: &FunctionContext) -> Value {
    ctx.metrics.get_debug_metrics()
}

/// `flock_reset_metrics()`
pub fn flock_reset_metrics(ctx: &FunctionContext) -> &'static str {
    ctx.metrics.reset();
    RESET_CONFIRMATION
}
