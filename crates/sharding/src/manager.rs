//! Scoped sharding manager protocol
//!
//! Every cross-boundary computation runs inside a sharding manager
//! scope: enter converts layout, preprocess reshapes the input batch,
//! the numeric work runs, postprocess restores the output layout, and
//! exit reverses the conversion. Exit runs on every path, including
//! when the wrapped work fails.

use async_trait::async_trait;
use std::future::Future;

use data_batch::TensorBatch;
use runtime_core::error::Result;

/// Layout conversion scope around a protected computation
#[async_trait]
pub trait ShardingManager: Send + Sync {
    /// Acquires the scope, converting resource layout as needed
    async fn enter(&self) -> Result<()>;

    /// Releases the scope, reversing what enter did
    async fn exit(&self) -> Result<()>;

    /// Reshapes an input batch into the layout the computation expects
    async fn preprocess(&self, batch: TensorBatch) -> Result<TensorBatch>;

    /// Restores an output batch to the caller's layout
    async fn postprocess(&self, batch: TensorBatch) -> Result<TensorBatch>;
}

/// Runs `op` inside the manager's scope with the full
/// preprocess / compute / postprocess pipeline, carrying a side value
/// out of the computation.
///
/// Exit always runs; the first error wins when both the work and exit
/// fail.
pub async fn run_scoped_with<T, Op, Fut>(
    manager: &dyn ShardingManager,
    batch: TensorBatch,
    op: Op,
) -> Result<(TensorBatch, T)>
where
    T: Send,
    Op: FnOnce(TensorBatch) -> Fut + Send,
    Fut: Future<Output = Result<(TensorBatch, T)>> + Send,
{
    manager.enter().await?;
    let result = async {
        let prepared = manager.preprocess(batch).await?;
        let (out, side) = op(prepared).await?;
        let restored = manager.postprocess(out).await?;
        Ok((restored, side))
    }
    .await;
    let exit_result = manager.exit().await;
    match (result, exit_result) {
        (Ok(value), Ok(())) => Ok(value),
        (Err(e), _) => Err(e),
        (Ok(_), Err(e)) => Err(e),
    }
}

/// [`run_scoped_with`] for computations that only produce a batch
pub async fn run_scoped<Op, Fut>(
    manager: &dyn ShardingManager,
    batch: TensorBatch,
    op: Op,
) -> Result<TensorBatch>
where
    Op: FnOnce(TensorBatch) -> Fut + Send,
    Fut: Future<Output = Result<TensorBatch>> + Send,
{
    let (batch, ()) = run_scoped_with(manager, batch, |b| async {
        let out = op(b).await?;
        Ok((out, ()))
    })
    .await?;
    Ok(batch)
}
