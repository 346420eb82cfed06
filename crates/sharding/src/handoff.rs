//! Training to inference hand-off sharding manager
//!
//! Generation runs on a separate engine with its own weight layout.
//! Entering the scope loads offloaded training parameters if needed,
//! publishes them to the inference engine, then applies the configured
//! offload so that training state does not sit on the accelerator
//! while generation runs. Exiting withdraws the inference copy. When
//! offload is configured, net accelerator memory after exit returns to
//! its pre-entry level.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

use data_batch::TensorBatch;
use runtime_core::error::{Error, Result};
use runtime_core::offload::{OffloadController, Residency};

use crate::manager::ShardingManager;

/// Converts training-sharded weights into an inference engine's
/// layout and back.
///
/// Publish is called with training parameters resident; it claims
/// whatever memory the inference copy needs. Withdraw releases that
/// copy. Conversion failures are fatal to the operation.
pub trait WeightBridge: Send + Sync {
    /// Makes the current training weights visible to the inference
    /// engine
    fn publish(&self) -> Result<()>;

    /// Drops the inference engine's weight copy
    fn withdraw(&self) -> Result<()>;
}

/// Scoped hand-off between the training representation and the
/// inference engine
pub struct HandoffShardingManager {
    bridge: Arc<dyn WeightBridge>,
    offload: Arc<OffloadController>,

    /// Offload parameters after publishing, per worker configuration
    offload_params: bool,

    /// Offload optimizer state after publishing
    offload_optimizer: bool,

    entered: AtomicBool,
}

impl HandoffShardingManager {
    pub fn new(
        bridge: Arc<dyn WeightBridge>,
        offload: Arc<OffloadController>,
        offload_params: bool,
        offload_optimizer: bool,
    ) -> Self {
        Self {
            bridge,
            offload,
            offload_params,
            offload_optimizer,
            entered: AtomicBool::new(false),
        }
    }
}

impl HandoffShardingManager {
    fn enter_inner(&self) -> Result<()> {
        // Publishing needs the training weights resident
        if self.offload.params_residency() == Residency::Host {
            self.offload.load_params()?;
        }
        self.bridge.publish()?;
        info!("Published training weights to inference engine");

        // Training state leaves the accelerator for the duration of
        // generation
        if self.offload_params {
            self.offload.offload_params()?;
        }
        if self.offload_optimizer
            && self.offload.optimizer_residency() == Some(Residency::Accelerator)
        {
            self.offload.offload_optimizer()?;
        }
        Ok(())
    }
}

#[async_trait]
impl ShardingManager for HandoffShardingManager {
    async fn enter(&self) -> Result<()> {
        if self.entered.swap(true, Ordering::SeqCst) {
            return Err(Error::Internal {
                message: "hand-off scope entered twice".to_string(),
            });
        }
        let result = self.enter_inner();
        if result.is_err() {
            self.entered.store(false, Ordering::SeqCst);
        }
        result
    }

    async fn exit(&self) -> Result<()> {
        if !self.entered.swap(false, Ordering::SeqCst) {
            return Err(Error::Internal {
                message: "hand-off scope exited without entering".to_string(),
            });
        }
        self.bridge.withdraw()?;
        debug!("Withdrew inference engine weights");
        Ok(())
    }

    async fn preprocess(&self, batch: TensorBatch) -> Result<TensorBatch> {
        Ok(batch)
    }

    async fn postprocess(&self, batch: TensorBatch) -> Result<TensorBatch> {
        Ok(batch)
    }
}
