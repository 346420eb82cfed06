//! Parameter and optimizer state offloading
//!
//! Workers configured for offload keep model state in host memory
//! between operations. Each operation loads what it needs on entry and
//! offloads again before returning, so idle workers hold no
//! accelerator memory. Loading twice or offloading twice is a caller
//! bug and fails loudly.

use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

use crate::error::{Error, Result};
use crate::memory::AcceleratorPool;
use crate::types::ResourceKind;

/// Where a managed resource currently lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Residency {
    /// Resident on the accelerator
    Accelerator,

    /// Offloaded to host memory
    Host,
}

#[derive(Debug)]
struct ResourceState {
    bytes: u64,
    residency: Residency,
}

/// Tracks accelerator residency for a worker's parameters and
/// optimizer state.
///
/// Construction claims accelerator memory for everything it manages,
/// mirroring model build; callers that configure offload move state to
/// host immediately afterwards.
#[derive(Debug)]
pub struct OffloadController {
    pool: Arc<AcceleratorPool>,
    label: String,
    params: Mutex<ResourceState>,
    optimizer: Mutex<Option<ResourceState>>,
}

impl OffloadController {
    /// Controller for a worker without optimizer state
    pub fn new(pool: Arc<AcceleratorPool>, label: impl Into<String>, param_bytes: u64) -> Result<Self> {
        let label = label.into();
        pool.claim(&Self::param_label(&label), param_bytes)?;
        Ok(Self {
            pool,
            label,
            params: Mutex::new(ResourceState {
                bytes: param_bytes,
                residency: Residency::Accelerator,
            }),
            optimizer: Mutex::new(None),
        })
    }

    /// Controller for a worker that also holds optimizer state
    pub fn with_optimizer(
        pool: Arc<AcceleratorPool>,
        label: impl Into<String>,
        param_bytes: u64,
        optimizer_bytes: u64,
    ) -> Result<Self> {
        let label = label.into();
        pool.claim(&Self::param_label(&label), param_bytes)?;
        if let Err(e) = pool.claim(&Self::optim_label(&label), optimizer_bytes) {
            pool.release(&Self::param_label(&label), param_bytes);
            return Err(e);
        }
        Ok(Self {
            pool,
            label,
            params: Mutex::new(ResourceState {
                bytes: param_bytes,
                residency: Residency::Accelerator,
            }),
            optimizer: Mutex::new(Some(ResourceState {
                bytes: optimizer_bytes,
                residency: Residency::Accelerator,
            })),
        })
    }

    fn param_label(label: &str) -> String {
        format!("{}.params", label)
    }

    fn optim_label(label: &str) -> String {
        format!("{}.optimizer", label)
    }

    /// Current residency of the parameters
    pub fn params_residency(&self) -> Residency {
        self.params.lock().residency
    }

    /// Current residency of the optimizer state, if any is managed
    pub fn optimizer_residency(&self) -> Option<Residency> {
        self.optimizer.lock().as_ref().map(|s| s.residency)
    }

    /// Moves parameters to host, releasing their accelerator bytes
    pub fn offload_params(&self) -> Result<()> {
        let mut params = self.params.lock();
        if params.residency == Residency::Host {
            return Err(Error::NotResident {
                resource: ResourceKind::Params,
            });
        }
        params.residency = Residency::Host;
        self.pool.release(&Self::param_label(&self.label), params.bytes);
        debug!(label = %self.label, bytes = params.bytes, "Offloaded params to host");
        Ok(())
    }

    /// Moves parameters back to the accelerator, claiming their bytes
    pub fn load_params(&self) -> Result<()> {
        let mut params = self.params.lock();
        if params.residency == Residency::Accelerator {
            return Err(Error::AlreadyResident {
                resource: ResourceKind::Params,
            });
        }
        self.pool.claim(&Self::param_label(&self.label), params.bytes)?;
        params.residency = Residency::Accelerator;
        debug!(label = %self.label, bytes = params.bytes, "Loaded params to accelerator");
        Ok(())
    }

    /// Moves optimizer state to host
    pub fn offload_optimizer(&self) -> Result<()> {
        let mut optimizer = self.optimizer.lock();
        let state = optimizer.as_mut().ok_or(Error::NotResident {
            resource: ResourceKind::Optimizer,
        })?;
        if state.residency == Residency::Host {
            return Err(Error::NotResident {
                resource: ResourceKind::Optimizer,
            });
        }
        state.residency = Residency::Host;
        self.pool.release(&Self::optim_label(&self.label), state.bytes);
        debug!(label = %self.label, bytes = state.bytes, "Offloaded optimizer to host");
        Ok(())
    }

    /// Moves optimizer state back to the accelerator
    pub fn load_optimizer(&self) -> Result<()> {
        let mut optimizer = self.optimizer.lock();
        let state = optimizer.as_mut().ok_or(Error::NotResident {
            resource: ResourceKind::Optimizer,
        })?;
        if state.residency == Residency::Accelerator {
            return Err(Error::AlreadyResident {
                resource: ResourceKind::Optimizer,
            });
        }
        self.pool.claim(&Self::optim_label(&self.label), state.bytes)?;
        state.residency = Residency::Accelerator;
        debug!(label = %self.label, bytes = state.bytes, "Loaded optimizer to accelerator");
        Ok(())
    }

    /// Fails unless the parameters are on the accelerator
    pub fn require_params_resident(&self) -> Result<()> {
        match self.params.lock().residency {
            Residency::Accelerator => Ok(()),
            Residency::Host => Err(Error::NotResident {
                resource: ResourceKind::Params,
            }),
        }
    }
}

impl Drop for OffloadController {
    fn drop(&mut self) {
        let params = self.params.lock();
        if params.residency == Residency::Accelerator {
            self.pool.release(&Self::param_label(&self.label), params.bytes);
        }
        if let Some(state) = self.optimizer.lock().as_ref() {
            if state.residency == Residency::Accelerator {
                self.pool.release(&Self::optim_label(&self.label), state.bytes);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offload_load_round_trip() {
        let pool = AcceleratorPool::new(1000);
        let ctrl = OffloadController::with_optimizer(Arc::clone(&pool), "actor", 400, 200).unwrap();
        assert_eq!(pool.allocated(), 600);
        assert_eq!(ctrl.params_residency(), Residency::Accelerator);

        ctrl.offload_params().unwrap();
        ctrl.offload_optimizer().unwrap();
        assert_eq!(pool.allocated(), 0);
        assert_eq!(ctrl.params_residency(), Residency::Host);
        assert_eq!(ctrl.optimizer_residency(), Some(Residency::Host));

        pool.empty_cache();
        ctrl.load_params().unwrap();
        ctrl.load_optimizer().unwrap();
        assert_eq!(pool.allocated(), 600);
        assert_eq!(ctrl.params_residency(), Residency::Accelerator);
    }

    #[test]
    fn test_double_load_rejected() {
        let pool = AcceleratorPool::new(1000);
        let ctrl = OffloadController::new(pool, "ref", 100).unwrap();
        let err = ctrl.load_params().unwrap_err();
        assert!(matches!(
            err,
            Error::AlreadyResident {
                resource: ResourceKind::Params
            }
        ));
    }

    #[test]
    fn test_double_offload_rejected() {
        let pool = AcceleratorPool::new(1000);
        let ctrl = OffloadController::new(pool, "ref", 100).unwrap();
        ctrl.offload_params().unwrap();
        let err = ctrl.offload_params().unwrap_err();
        assert!(matches!(
            err,
            Error::NotResident {
                resource: ResourceKind::Params
            }
        ));
    }

    #[test]
    fn test_optimizer_ops_require_optimizer() {
        let pool = AcceleratorPool::new(1000);
        let ctrl = OffloadController::new(pool, "ref", 100).unwrap();
        assert_eq!(ctrl.optimizer_residency(), None);
        assert!(ctrl.load_optimizer().is_err());
        assert!(ctrl.offload_optimizer().is_err());
    }

    #[test]
    fn test_load_fails_when_pool_exhausted() {
        let pool = AcceleratorPool::new(500);
        let ctrl = OffloadController::new(Arc::clone(&pool), "actor", 400).unwrap();
        ctrl.offload_params().unwrap();
        // Another engine fills the pool while params are on host
        pool.empty_cache();
        pool.claim("rollout", 300).unwrap();
        let err = ctrl.load_params().unwrap_err();
        assert!(matches!(err, Error::AllocationFailed { .. }));
        assert_eq!(ctrl.params_residency(), Residency::Host);
    }

    #[test]
    fn test_drop_releases_resident_bytes() {
        let pool = AcceleratorPool::new(1000);
        {
            let _ctrl = OffloadController::with_optimizer(Arc::clone(&pool), "critic", 300, 100).unwrap();
            assert_eq!(pool.allocated(), 400);
        }
        assert_eq!(pool.allocated(), 0);
    }

    #[test]
    fn test_require_params_resident() {
        let pool = AcceleratorPool::new(1000);
        let ctrl = OffloadController::new(pool, "actor", 100).unwrap();
        assert!(ctrl.require_params_resident().is_ok());
        ctrl.offload_params().unwrap();
        assert!(ctrl.require_params_resident().is_err());
    }
}
