//! Property and end-to-end tests for the batching engines.

use flock_core::FunctionKind;
use flock_functions::{
    llm_complete, rerank, AccumulatorState, AggregateFunction, BatchSizePolicy, FunctionBinding, FunctionContext,
};
use flock_llm::{CompletionRequest, OutputType};
use flock_test_utils::assertions::assert_batch_exhausted;
use flock_test_utils::generators::arb_batch_size;
use flock_test_utils::{fixtures, ScriptedFactory};
use proptest::prelude::*;
use serde_json::{json, Value};
use std::sync::Arc;

fn context(factory: &ScriptedFactory) -> FunctionContext {
    FunctionContext::new(factory.as_factory(), Arc::new(fixtures::config_store()))
}

fn bind(kind: FunctionKind, batch_size: i32, ctx: &FunctionContext) -> FunctionBinding {
    FunctionBinding::bind(kind, &[fixtures::model_args(batch_size), fixtures::prompt_arg("Rank by length")], ctx)
        .unwrap()
}

fn reversed_ranking(request: &CompletionRequest) -> Vec<Value> {
    match request.output_type {
        OutputType::Integer => (0..request.num_output_tuples).rev().map(|i| json!(i)).collect(),
        _ => (0..request.num_output_tuples).map(|i| json!(format!("response_{}", i))).collect(),
    }
}

fn ranked_ids(factory: &ScriptedFactory, rows: usize, batch_size: i32) -> Vec<i64> {
    let ctx = context(factory);
    let binding = bind(FunctionKind::Rerank, batch_size, &ctx);
    let mut inv = binding.invocation(&ctx, None).unwrap();
    let ranked = rerank(&mut inv, &fixtures::text_batch(rows)).unwrap();
    assert_eq!(ranked.column_count(), 2);
    ranked.columns()[0].data.iter().filter_map(Value::as_i64).collect()
}

#[test]
fn test_rerank_conserves_rows_for_fixed_sizes() {
    for rows in [2usize, 3, 10, 100] {
        for batch_size in [2, 3, 7] {
            let mut ids = ranked_ids(&ScriptedFactory::new(), rows, batch_size);
            assert_eq!(ids.len(), rows, "rows={} batch_size={}", rows, batch_size);
            ids.sort_unstable();
            assert_eq!(ids, (0..rows as i64).collect::<Vec<_>>());
        }
    }
}

#[test]
fn test_rerank_single_window_follows_provider_order() {
    let factory = ScriptedFactory::new().with_responder(reversed_ranking);
    // The default batch size is clamped to the row count: one window, whose
    // bottom half comes out first followed by the carried top half.
    let ids = ranked_ids(&factory, 6, 2048);
    assert_eq!(ids, vec![2, 1, 0, 5, 4, 3]);
    assert_eq!(factory.completion_count(), 1);
}

#[test]
fn test_reduce_end_to_end_over_parallel_partitions() {
    let factory = ScriptedFactory::new();
    factory
        .push_items(vec![json!("s1")])
        .push_items(vec![json!("s2")])
        .push_items(vec![json!("final")]);
    let ctx = context(&factory);
    let function = AggregateFunction::bind(
        FunctionKind::Reduce,
        &[fixtures::model_args(2), fixtures::prompt_arg("Summarize")],
        ctx.clone(),
    )
    .unwrap();

    let rows = fixtures::prompt_rows("Summarize", &fixtures::text_batch(5));
    let mut partition_a = vec![AccumulatorState::new()];
    let mut partition_b = vec![AccumulatorState::new()];
    function.scatter_update(&mut partition_a, &rows[..2], &[0, 0]).unwrap();
    function.scatter_update(&mut partition_b, &rows[2..], &[0, 0, 0]).unwrap();

    let mut group = AccumulatorState::new();
    function.initialize(&mut group);
    function.combine(&partition_a[0], &mut group);
    function.combine(&partition_b[0], &mut group);
    function.destroy(&mut partition_a[0]);
    function.destroy(&mut partition_b[0]);

    let results = function.finalize(&[group]).unwrap();
    assert_eq!(results, vec![Some("final".to_string())]);

    let requests = factory.requests();
    assert_eq!(requests.len(), 3);
    assert!(requests[0].prompt.contains("row 0") && requests[0].prompt.contains("row 1"));
    assert!(requests[1].prompt.contains("\"s1\""));
    assert!(requests[2].prompt.contains("row 4"));

    let metrics = ctx.metrics.get_metrics();
    assert_eq!(metrics["llm_reduce_1"]["api_calls"], json!(3));
}

#[test]
fn test_scalar_fails_once_batch_size_exhausted() {
    let factory = ScriptedFactory::new();
    factory.push_overflow().push_overflow();
    let ctx = context(&factory);
    let binding = bind(FunctionKind::Complete, 2, &ctx);
    let rows = fixtures::prompt_rows("Describe", &fixtures::text_batch(3));

    // 2 -> 1 -> 0
    assert_batch_exhausted(&llm_complete(&ctx, &binding, &rows));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Every input row appears exactly once in the ranked output.
    #[test]
    fn prop_rerank_is_a_permutation(rows in 2usize..60, batch_size in arb_batch_size(), reverse in any::<bool>()) {
        let factory = if reverse {
            ScriptedFactory::new().with_responder(reversed_ranking)
        } else {
            ScriptedFactory::new()
        };
        let mut ids = ranked_ids(&factory, rows, batch_size);
        prop_assert_eq!(ids.len(), rows);
        ids.sort_unstable();
        prop_assert_eq!(ids, (0..rows as i64).collect::<Vec<_>>());
    }

    /// The scalar processor yields one value per row whatever item count
    /// the provider returns.
    #[test]
    fn prop_scalar_preserves_row_count(rows in 1usize..40, batch_size in arb_batch_size(), skew in -3i64..4) {
        let factory = ScriptedFactory::new().with_responder(move |request: &CompletionRequest| {
            let count = (request.num_output_tuples as i64 + skew).max(0) as usize;
            (0..count).map(|i| json!(format!("item {}", i))).collect()
        });
        let ctx = context(&factory);
        let binding = bind(FunctionKind::Complete, batch_size, &ctx);
        let prompt_rows = fixtures::prompt_rows("Describe", &fixtures::text_batch(rows));

        let out = llm_complete(&ctx, &binding, &prompt_rows).unwrap();
        prop_assert_eq!(out.len(), rows);
    }

    /// Overflows before exhaustion never lose or duplicate rows.
    #[test]
    fn prop_overflow_keeps_row_coverage(rows in 4usize..30, batch_size in 4i32..16, overflows in 0usize..4) {
        let factory = ScriptedFactory::new();
        for _ in 0..overflows {
            factory.push_overflow();
        }
        let ctx = context(&factory);
        let binding = bind(FunctionKind::Complete, batch_size, &ctx);
        let prompt_rows = fixtures::prompt_rows("Describe", &fixtures::text_batch(rows));

        let out = llm_complete(&ctx, &binding, &prompt_rows).unwrap();
        prop_assert_eq!(out.len(), rows);
        let dispatched: usize = factory.requests().iter().skip(overflows).map(|r| r.num_output_tuples).sum();
        prop_assert_eq!(dispatched, rows);
    }

    /// Shrinking strictly decreases the size until it fails with Exhausted.
    #[test]
    fn prop_shrink_is_monotonic(start in 1i64..5000) {
        let mut policy = BatchSizePolicy::new(start).unwrap();
        let mut previous = policy.size();
        loop {
            match policy.shrink() {
                Ok(size) => {
                    prop_assert!(size < previous);
                    prop_assert!(size > 0);
                    previous = size;
                }
                Err(err) => {
                    assert_batch_exhausted::<usize>(&Err(err));
                    break;
                }
            }
        }
    }
}
