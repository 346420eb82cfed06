//! Device mesh construction for worker process groups
//!
//! A mesh is an immutable view of how the world of ranks is factored
//! into named axes. Workers receive their meshes at construction and
//! pass them to sharding managers explicitly.

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Error, Result};

/// Axis name for the flat fully-sharded group
pub const AXIS_FSDP: &str = "fsdp";

/// Axis name for the data-parallel dimension of the sequence parallel
/// mesh
pub const AXIS_DP: &str = "dp";

/// Axis name for the sequence-parallel dimension
pub const AXIS_SP: &str = "sp";

/// A single named mesh axis
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshAxis {
    /// Axis name
    pub name: String,

    /// Number of ranks along this axis
    pub size: usize,
}

/// An immutable topology handle: named axes over a contiguous range of
/// ranks, plus the linear rank of the owning process.
///
/// Ranks are laid out row-major, so the last axis varies fastest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceMesh {
    axes: Vec<MeshAxis>,
    rank: usize,
}

impl DeviceMesh {
    /// Builds a mesh from named axes, validating the rank against the
    /// product of the axis sizes
    pub fn new(axes: Vec<MeshAxis>, rank: usize) -> Result<Self> {
        if axes.is_empty() || axes.iter().any(|a| a.size == 0) {
            return Err(Error::InvalidConfig {
                message: "device mesh axes must be non-empty with positive sizes".to_string(),
            });
        }
        let world: usize = axes.iter().map(|a| a.size).product();
        if rank >= world {
            return Err(Error::InvalidConfig {
                message: format!("rank {} out of range for world size {}", rank, world),
            });
        }
        Ok(Self { axes, rank })
    }

    /// Linear rank of the owning process
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Total number of ranks in the mesh
    pub fn world_size(&self) -> usize {
        self.axes.iter().map(|a| a.size).product()
    }

    /// Number of axes
    pub fn ndim(&self) -> usize {
        self.axes.len()
    }

    /// Axis sizes in declaration order
    pub fn shape(&self) -> Vec<usize> {
        self.axes.iter().map(|a| a.size).collect()
    }

    /// Size of the named axis
    pub fn axis_size(&self, name: &str) -> Option<usize> {
        self.axes.iter().find(|a| a.name == name).map(|a| a.size)
    }

    /// Coordinate of the owning rank along the named axis
    pub fn coordinate(&self, name: &str) -> Option<usize> {
        let idx = self.axes.iter().position(|a| a.name == name)?;
        let mut remaining = self.rank;
        // Row-major: divide off the strides of the trailing axes
        for axis in self.axes.iter().skip(idx + 1) {
            remaining /= axis.size;
        }
        Some(remaining % self.axes[idx].size)
    }

    /// Coordinates of the owning rank along every axis
    pub fn coordinates(&self) -> Vec<usize> {
        self.axes
            .iter()
            .map(|a| self.coordinate(&a.name).unwrap_or(0))
            .collect()
    }
}

/// Builds the model sharding mesh.
///
/// A shard group size that is negative or at least the world size
/// selects one flat group over all ranks. Any other value would split
/// the world into hybrid shard groups, which is not supported.
pub fn build_fsdp_mesh(rank: usize, world_size: usize, fsdp_size: i64) -> Result<DeviceMesh> {
    if fsdp_size < 0 || fsdp_size as usize >= world_size {
        let mesh = DeviceMesh::new(
            vec![MeshAxis {
                name: AXIS_FSDP.to_string(),
                size: world_size,
            }],
            rank,
        )?;
        info!(rank, world_size, "Built flat fsdp mesh");
        return Ok(mesh);
    }
    Err(Error::UnsupportedTopology {
        world_size,
        fsdp_size,
    })
}

/// Builds the two-axis sequence parallel mesh, shaped
/// (world / sp, sp) with axes (dp, sp).
///
/// Returns None when the sequence parallel size is 1; callers skip
/// sequence parallel resharding entirely in that case.
pub fn build_sequence_parallel_mesh(
    rank: usize,
    world_size: usize,
    sequence_parallel_size: usize,
) -> Result<Option<DeviceMesh>> {
    if sequence_parallel_size == 0 {
        return Err(Error::InvalidConfig {
            message: "ulysses_sequence_parallel_size must be at least 1".to_string(),
        });
    }
    if sequence_parallel_size == 1 {
        return Ok(None);
    }
    if world_size % sequence_parallel_size != 0 {
        return Err(Error::InvalidConfig {
            message: format!(
                "ulysses_sequence_parallel_size {} does not divide world size {}",
                sequence_parallel_size, world_size
            ),
        });
    }
    let dp = world_size / sequence_parallel_size;
    let mesh = DeviceMesh::new(
        vec![
            MeshAxis {
                name: AXIS_DP.to_string(),
                size: dp,
            },
            MeshAxis {
                name: AXIS_SP.to_string(),
                size: sequence_parallel_size,
            },
        ],
        rank,
    )?;
    info!(
        rank,
        dp,
        sp = sequence_parallel_size,
        "Built sequence parallel mesh"
    );
    Ok(Some(mesh))
}
