//! Batch splitting with overflow-driven shrinking, shared by every engine.

use flock_core::{BatchError, ColumnBatch, FlockResult};

/// Numerator/denominator of the shrink factor applied on overflow (x0.9).
const SHRINK_NUMERATOR: usize = 9;
const SHRINK_DENOMINATOR: usize = 10;

/// Current batch size of one engine invocation.
///
/// Created fresh per invocation and only mutated by the overflow retry
/// loop. Never reaches zero: a shrink that would leave it at zero fails
/// with [`BatchError::Exhausted`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchSizePolicy {
    size: usize,
}

impl BatchSizePolicy {
    /// Policy starting at `configured` rows per batch.
    ///
    /// # Returns
    /// * `Ok(BatchSizePolicy)` - When `configured` is positive
    /// * `Err(FlockError::Batch(BatchError::NonPositive))` - Otherwise
    pub fn new(configured: i64) -> FlockResult<Self> {
        if configured <= 0 {
            return Err(BatchError::NonPositive { configured }.into());
        }
        let size = usize::try_from(configured).map_err(|_| BatchError::NonPositive { configured })?;
        Ok(Self { size })
    }

    /// Policy starting at `min(configured, rows)`.
    pub fn clamped(configured: i64, rows: usize) -> FlockResult<Self> {
        let rows = i64::try_from(rows).unwrap_or(i64::MAX);
        Self::new(configured.min(rows))
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Shrink to `floor(size * 0.9)`.
    ///
    /// # Returns
    /// * `Ok(usize)` - The new, strictly smaller size
    /// * `Err(FlockError::Batch(BatchError::Exhausted))` - If it reached zero
    pub fn shrink(&mut self) -> FlockResult<usize> {
        let previous = self.size;
        self.size = self.size * SHRINK_NUMERATOR / SHRINK_DENOMINATOR;
        if self.size == 0 {
            return Err(BatchError::Exhausted.into());
        }
        tracing::warn!(
            previous,
            batch_size = self.size,
            "Provider output exceeded its length limit, shrinking batch"
        );
        Ok(self.size)
    }
}

/// Run `op` with the current batch size, shrinking and retrying while it
/// fails with the provider overflow signal. Any other error propagates.
pub fn retry_on_overflow<T, F>(policy: &mut BatchSizePolicy, mut op: F) -> FlockResult<T>
where
    F: FnMut(usize) -> FlockResult<T>,
{
    loop {
        match op(policy.size()) {
            Err(err) if err.is_output_overflow() => {
                policy.shrink()?;
            }
            other => return other,
        }
    }
}

/// Feed `batch` to `f` in consecutive sub-batches of at most
/// `policy.size()` rows, in row order.
///
/// An overflowing sub-batch is retried from the same start row with a
/// smaller size, so `f` may see a row more than once but only one
/// successful call covers it.
pub fn for_each_batch<F>(batch: &ColumnBatch, policy: &mut BatchSizePolicy, mut f: F) -> FlockResult<()>
where
    F: FnMut(ColumnBatch) -> FlockResult<()>,
{
    let rows = batch.row_count();
    let mut start = 0;
    while start < rows {
        let consumed = retry_on_overflow(policy, |size| {
            let sub_batch = batch.slice(start, size);
            let len = sub_batch.row_count();
            tracing::debug!(start, rows = len, "Dispatching sub-batch");
            f(sub_batch).map(|_| len)
        })?;
        start += consumed;
    }
    Ok(())
}
