//! Flock Core - Shared types for the Flock LLM functions
//!
//! Column-oriented row batches, the error taxonomy, function kinds and
//! bind-time configuration. No I/O lives here.

mod column;
mod config;
mod error;
mod function;

pub use column::*;
pub use config::*;
pub use error::*;
pub use function::*;
