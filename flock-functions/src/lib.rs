//! Flock Functions - batching engines and the SQL-level LLM functions
//!
//! Scalar functions (`llm_complete`, `llm_filter`, `llm_embedding`) run a
//! whole execution chunk at once. Aggregates (`llm_reduce`, `llm_rerank`,
//! `llm_first`, `llm_last`) collect rows into an [`AccumulatorState`] per
//! group and run their engine at finalize time. Every engine splits its
//! input through [`BatchSizePolicy`], shrinking the batch when the provider
//! reports an output overflow.

mod aggregate;
mod batch;
mod bind;
mod first_or_last;
mod reduce;
mod rerank;
mod row_id;
mod scalar;
mod sql;

pub use aggregate::{AccumulatorState, AggregateFunction};
pub use batch::{for_each_batch, retry_on_overflow, BatchSizePolicy};
pub use bind::{FunctionBinding, FunctionContext, Invocation};
pub use first_or_last::first_or_last;
pub use reduce::{reduce, SUMMARY_KEY};
pub use rerank::rerank;
pub use scalar::{batch_and_complete, complete, llm_complete, llm_embedding, llm_filter};
pub use sql::{flock_get_debug_metrics, flock_get_metrics, flock_reset_metrics, RESET_CONFIRMATION};
