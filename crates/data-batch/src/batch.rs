//! Named tensor batches
//!
//! The unit of data exchanged between workers: a map of named 2-D or
//! 3-D arrays sharing a leading batch dimension, plus a typed metadata
//! map. Batches track which device their storage is accounted against
//! so operations can move them on and off the accelerator explicitly.

use ndarray::{concatenate, s, Array2, Array3, Axis};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::Arc;

use runtime_core::error::{Error, Result};
use runtime_core::memory::{AcceleratorPool, MemoryClaim};

/// Well-known tensor names
pub mod names {
    pub const PROMPTS: &str = "prompts";
    pub const RESPONSES: &str = "responses";
    pub const INPUT_IDS: &str = "input_ids";
    pub const ATTENTION_MASK: &str = "attention_mask";
    pub const POSITION_IDS: &str = "position_ids";
    pub const OLD_LOG_PROBS: &str = "old_log_probs";
    pub const REF_LOG_PROB: &str = "ref_log_prob";
    pub const VALUES: &str = "values";
    pub const RM_SCORES: &str = "rm_scores";
}

/// Well-known metadata keys
pub mod keys {
    pub const MICRO_BATCH_SIZE: &str = "micro_batch_size";
    pub const MAX_TOKEN_LEN: &str = "max_token_len";
    pub const USE_DYNAMIC_BSZ: &str = "use_dynamic_bsz";
    pub const TEMPERATURE: &str = "temperature";
    pub const EOS_TOKEN_ID: &str = "eos_token_id";
    pub const PAD_TOKEN_ID: &str = "pad_token_id";
    pub const GLOBAL_TOKEN_NUM: &str = "global_token_num";
}

/// A single named tensor in a batch.
///
/// The first axis is always the batch dimension; the second is the
/// token dimension for the 2-D variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Tensor {
    /// Token ids, masks, and positions
    Int(Array2<i64>),

    /// Log-probs, values, and scores
    Float(Array2<f32>),

    /// Boolean masks
    Bool(Array2<bool>),

    /// Per-token class outputs such as classifier logits
    Float3(Array3<f32>),
}

impl Tensor {
    /// Size of the batch dimension
    pub fn rows(&self) -> usize {
        match self {
            Tensor::Int(a) => a.nrows(),
            Tensor::Float(a) => a.nrows(),
            Tensor::Bool(a) => a.nrows(),
            Tensor::Float3(a) => a.shape()[0],
        }
    }

    /// Size of the token dimension
    pub fn cols(&self) -> usize {
        match self {
            Tensor::Int(a) => a.ncols(),
            Tensor::Float(a) => a.ncols(),
            Tensor::Bool(a) => a.ncols(),
            Tensor::Float3(a) => a.shape()[1],
        }
    }

    /// Full shape
    pub fn shape(&self) -> Vec<usize> {
        match self {
            Tensor::Int(a) => a.shape().to_vec(),
            Tensor::Float(a) => a.shape().to_vec(),
            Tensor::Bool(a) => a.shape().to_vec(),
            Tensor::Float3(a) => a.shape().to_vec(),
        }
    }

    /// Storage size in bytes
    pub fn byte_size(&self) -> u64 {
        match self {
            Tensor::Int(a) => (a.len() * std::mem::size_of::<i64>()) as u64,
            Tensor::Float(a) => (a.len() * std::mem::size_of::<f32>()) as u64,
            Tensor::Bool(a) => a.len() as u64,
            Tensor::Float3(a) => (a.len() * std::mem::size_of::<f32>()) as u64,
        }
    }

    /// Short dtype name for error messages
    pub fn dtype_name(&self) -> &'static str {
        match self {
            Tensor::Int(_) => "int",
            Tensor::Float(_) => "float",
            Tensor::Bool(_) => "bool",
            Tensor::Float3(_) => "float3",
        }
    }

    fn select_rows(&self, indices: &[usize]) -> Tensor {
        match self {
            Tensor::Int(a) => Tensor::Int(a.select(Axis(0), indices)),
            Tensor::Float(a) => Tensor::Float(a.select(Axis(0), indices)),
            Tensor::Bool(a) => Tensor::Bool(a.select(Axis(0), indices)),
            Tensor::Float3(a) => Tensor::Float3(a.select(Axis(0), indices)),
        }
    }

    fn slice_rows(&self, range: Range<usize>) -> Tensor {
        match self {
            Tensor::Int(a) => Tensor::Int(a.slice(s![range, ..]).to_owned()),
            Tensor::Float(a) => Tensor::Float(a.slice(s![range, ..]).to_owned()),
            Tensor::Bool(a) => Tensor::Bool(a.slice(s![range, ..]).to_owned()),
            Tensor::Float3(a) => Tensor::Float3(a.slice(s![range, .., ..]).to_owned()),
        }
    }

    fn slice_cols(&self, range: Range<usize>) -> Tensor {
        match self {
            Tensor::Int(a) => Tensor::Int(a.slice(s![.., range]).to_owned()),
            Tensor::Float(a) => Tensor::Float(a.slice(s![.., range]).to_owned()),
            Tensor::Bool(a) => Tensor::Bool(a.slice(s![.., range]).to_owned()),
            Tensor::Float3(a) => Tensor::Float3(a.slice(s![.., range, ..]).to_owned()),
        }
    }

    fn pad_cols(&self, target: usize) -> Tensor {
        match self {
            Tensor::Int(a) => {
                let mut out = Array2::zeros((a.nrows(), target));
                out.slice_mut(s![.., ..a.ncols()]).assign(a);
                Tensor::Int(out)
            }
            Tensor::Float(a) => {
                let mut out = Array2::zeros((a.nrows(), target));
                out.slice_mut(s![.., ..a.ncols()]).assign(a);
                Tensor::Float(out)
            }
            Tensor::Bool(a) => {
                let mut out = Array2::from_elem((a.nrows(), target), false);
                out.slice_mut(s![.., ..a.ncols()]).assign(a);
                Tensor::Bool(out)
            }
            Tensor::Float3(a) => {
                let shape = a.shape();
                let mut out = Array3::zeros((shape[0], target, shape[2]));
                out.slice_mut(s![.., ..shape[1], ..]).assign(a);
                Tensor::Float3(out)
            }
        }
    }

    fn concat_cols(name: &str, parts: &[&Tensor]) -> Result<Tensor> {
        let mismatch = |message: String| Error::ShapeMismatch {
            name: name.to_string(),
            message,
        };
        let first = parts
            .first()
            .ok_or_else(|| mismatch("cannot concat zero tensors".to_string()))?;
        match first {
            Tensor::Int(_) => {
                let views = parts
                    .iter()
                    .map(|t| match t {
                        Tensor::Int(a) => Ok(a.view()),
                        other => Err(mismatch(format!("dtype mix: int vs {}", other.dtype_name()))),
                    })
                    .collect::<Result<Vec<_>>>()?;
                concatenate(Axis(1), &views)
                    .map(Tensor::Int)
                    .map_err(|e| mismatch(e.to_string()))
            }
            Tensor::Float(_) => {
                let views = parts
                    .iter()
                    .map(|t| match t {
                        Tensor::Float(a) => Ok(a.view()),
                        other => Err(mismatch(format!("dtype mix: float vs {}", other.dtype_name()))),
                    })
                    .collect::<Result<Vec<_>>>()?;
                concatenate(Axis(1), &views)
                    .map(Tensor::Float)
                    .map_err(|e| mismatch(e.to_string()))
            }
            Tensor::Bool(_) => {
                let views = parts
                    .iter()
                    .map(|t| match t {
                        Tensor::Bool(a) => Ok(a.view()),
                        other => Err(mismatch(format!("dtype mix: bool vs {}", other.dtype_name()))),
                    })
                    .collect::<Result<Vec<_>>>()?;
                concatenate(Axis(1), &views)
                    .map(Tensor::Bool)
                    .map_err(|e| mismatch(e.to_string()))
            }
            Tensor::Float3(_) => {
                let views = parts
                    .iter()
                    .map(|t| match t {
                        Tensor::Float3(a) => Ok(a.view()),
                        other => Err(mismatch(format!("dtype mix: float3 vs {}", other.dtype_name()))),
                    })
                    .collect::<Result<Vec<_>>>()?;
                concatenate(Axis(1), &views)
                    .map(Tensor::Float3)
                    .map_err(|e| mismatch(e.to_string()))
            }
        }
    }

    fn concat(name: &str, parts: &[&Tensor]) -> Result<Tensor> {
        let mismatch = |message: String| Error::ShapeMismatch {
            name: name.to_string(),
            message,
        };
        let first = parts.first().ok_or_else(|| mismatch("cannot concat zero tensors".to_string()))?;
        match first {
            Tensor::Int(_) => {
                let views = parts
                    .iter()
                    .map(|t| match t {
                        Tensor::Int(a) => Ok(a.view()),
                        other => Err(mismatch(format!("dtype mix: int vs {}", other.dtype_name()))),
                    })
                    .collect::<Result<Vec<_>>>()?;
                concatenate(Axis(0), &views)
                    .map(Tensor::Int)
                    .map_err(|e| mismatch(e.to_string()))
            }
            Tensor::Float(_) => {
                let views = parts
                    .iter()
                    .map(|t| match t {
                        Tensor::Float(a) => Ok(a.view()),
                        other => Err(mismatch(format!("dtype mix: float vs {}", other.dtype_name()))),
                    })
                    .collect::<Result<Vec<_>>>()?;
                concatenate(Axis(0), &views)
                    .map(Tensor::Float)
                    .map_err(|e| mismatch(e.to_string()))
            }
            Tensor::Bool(_) => {
                let views = parts
                    .iter()
                    .map(|t| match t {
                        Tensor::Bool(a) => Ok(a.view()),
                        other => Err(mismatch(format!("dtype mix: bool vs {}", other.dtype_name()))),
                    })
                    .collect::<Result<Vec<_>>>()?;
                concatenate(Axis(0), &views)
                    .map(Tensor::Bool)
                    .map_err(|e| mismatch(e.to_string()))
            }
            Tensor::Float3(_) => {
                let views = parts
                    .iter()
                    .map(|t| match t {
                        Tensor::Float3(a) => Ok(a.view()),
                        other => Err(mismatch(format!("dtype mix: float3 vs {}", other.dtype_name()))),
                    })
                    .collect::<Result<Vec<_>>>()?;
                concatenate(Axis(0), &views)
                    .map(Tensor::Float3)
                    .map_err(|e| mismatch(e.to_string()))
            }
        }
    }
}

impl From<Array2<i64>> for Tensor {
    fn from(a: Array2<i64>) -> Self {
        Tensor::Int(a)
    }
}

impl From<Array2<f32>> for Tensor {
    fn from(a: Array2<f32>) -> Self {
        Tensor::Float(a)
    }
}

impl From<Array2<bool>> for Tensor {
    fn from(a: Array2<bool>) -> Self {
        Tensor::Bool(a)
    }
}

impl From<Array3<f32>> for Tensor {
    fn from(a: Array3<f32>) -> Self {
        Tensor::Float3(a)
    }
}

/// A typed metadata value attached to a batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MetaValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    IntList(Vec<i64>),
    FloatList(Vec<f64>),
}

impl MetaValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            MetaValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            MetaValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MetaValue::Float(f) => Some(*f),
            MetaValue::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetaValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int_list(&self) -> Option<&[i64]> {
        match self {
            MetaValue::IntList(v) => Some(v),
            _ => None,
        }
    }
}

impl From<bool> for MetaValue {
    fn from(v: bool) -> Self {
        MetaValue::Bool(v)
    }
}

impl From<i64> for MetaValue {
    fn from(v: i64) -> Self {
        MetaValue::Int(v)
    }
}

impl From<usize> for MetaValue {
    fn from(v: usize) -> Self {
        MetaValue::Int(v as i64)
    }
}

impl From<f64> for MetaValue {
    fn from(v: f64) -> Self {
        MetaValue::Float(v)
    }
}

impl From<&str> for MetaValue {
    fn from(v: &str) -> Self {
        MetaValue::Str(v.to_string())
    }
}

impl From<String> for MetaValue {
    fn from(v: String) -> Self {
        MetaValue::Str(v)
    }
}

impl From<Vec<i64>> for MetaValue {
    fn from(v: Vec<i64>) -> Self {
        MetaValue::IntList(v)
    }
}

impl From<Vec<f64>> for MetaValue {
    fn from(v: Vec<f64>) -> Self {
        MetaValue::FloatList(v)
    }
}

/// Where a batch's storage is currently accounted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Device {
    /// Claimed against the accelerator pool
    Accelerator,

    /// Host memory, no accelerator claim
    #[default]
    Host,
}

/// A batch of named tensors with shared batch dimension and metadata
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct TensorBatch {
    tensors: BTreeMap<String, Tensor>,
    meta: BTreeMap<String, MetaValue>,

    #[serde(skip)]
    device: Device,
    #[serde(skip)]
    claim: Option<MemoryClaim>,
}

impl TensorBatch {
    /// Creates an empty host batch
    pub fn new() -> Self {
        Self::default()
    }

    /// Size of the shared batch dimension, zero when empty
    pub fn batch_size(&self) -> usize {
        self.tensors.values().next().map(Tensor::rows).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Tensor names in deterministic order
    pub fn names(&self) -> Vec<&str> {
        self.tensors.keys().map(String::as_str).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tensors.contains_key(name)
    }

    /// Inserts or replaces a tensor, enforcing batch dimension
    /// alignment with the tensors already present
    pub fn insert(&mut self, name: impl Into<String>, tensor: impl Into<Tensor>) -> Result<()> {
        let name = name.into();
        let tensor = tensor.into();
        if !self.tensors.is_empty() && !self.tensors.contains_key(&name) {
            let expected = self.batch_size();
            if tensor.rows() != expected {
                return Err(Error::MisalignedBatch {
                    name,
                    expected,
                    actual: tensor.rows(),
                });
            }
        } else if let Some(existing) = self.tensors.get(&name) {
            // Replacement must keep the batch dimension
            if tensor.rows() != existing.rows() {
                return Err(Error::MisalignedBatch {
                    name,
                    expected: existing.rows(),
                    actual: tensor.rows(),
                });
            }
        }
        self.tensors.insert(name, tensor);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<&Tensor> {
        self.tensors.get(name).ok_or_else(|| Error::TensorNotFound {
            name: name.to_string(),
        })
    }

    /// Removes and returns a tensor
    pub fn pop(&mut self, name: &str) -> Result<Tensor> {
        self.tensors.remove(name).ok_or_else(|| Error::TensorNotFound {
            name: name.to_string(),
        })
    }

    pub fn get_int(&self, name: &str) -> Result<&Array2<i64>> {
        match self.get(name)? {
            Tensor::Int(a) => Ok(a),
            other => Err(Error::ShapeMismatch {
                name: name.to_string(),
                message: format!("expected int tensor, found {}", other.dtype_name()),
            }),
        }
    }

    pub fn get_float(&self, name: &str) -> Result<&Array2<f32>> {
        match self.get(name)? {
            Tensor::Float(a) => Ok(a),
            other => Err(Error::ShapeMismatch {
                name: name.to_string(),
                message: format!("expected float tensor, found {}", other.dtype_name()),
            }),
        }
    }

    pub fn get_bool(&self, name: &str) -> Result<&Array2<bool>> {
        match self.get(name)? {
            Tensor::Bool(a) => Ok(a),
            other => Err(Error::ShapeMismatch {
                name: name.to_string(),
                message: format!("expected bool tensor, found {}", other.dtype_name()),
            }),
        }
    }

    pub fn get_float3(&self, name: &str) -> Result<&Array3<f32>> {
        match self.get(name)? {
            Tensor::Float3(a) => Ok(a),
            other => Err(Error::ShapeMismatch {
                name: name.to_string(),
                message: format!("expected float3 tensor, found {}", other.dtype_name()),
            }),
        }
    }

    /// Sets a metadata entry
    pub fn set_meta(&mut self, key: impl Into<String>, value: impl Into<MetaValue>) {
        self.meta.insert(key.into(), value.into());
    }

    pub fn get_meta(&self, key: &str) -> Option<&MetaValue> {
        self.meta.get(key)
    }

    pub fn remove_meta(&mut self, key: &str) -> Option<MetaValue> {
        self.meta.remove(key)
    }

    pub fn meta_bool(&self, key: &str) -> Option<bool> {
        self.meta.get(key).and_then(MetaValue::as_bool)
    }

    pub fn meta_i64(&self, key: &str) -> Option<i64> {
        self.meta.get(key).and_then(MetaValue::as_i64)
    }

    pub fn meta_usize(&self, key: &str) -> Option<usize> {
        self.meta_i64(key).map(|v| v as usize)
    }

    pub fn meta_f64(&self, key: &str) -> Option<f64> {
        self.meta.get(key).and_then(MetaValue::as_f64)
    }

    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.meta.get(key).and_then(MetaValue::as_str)
    }

    pub fn meta_int_list(&self, key: &str) -> Option<&[i64]> {
        self.meta.get(key).and_then(MetaValue::as_int_list)
    }

    /// Copies all metadata entries from another batch
    pub fn copy_meta_from(&mut self, other: &TensorBatch) {
        for (k, v) in &other.meta {
            self.meta.insert(k.clone(), v.clone());
        }
    }

    /// Total tensor storage in bytes
    pub fn byte_size(&self) -> u64 {
        self.tensors.values().map(Tensor::byte_size).sum()
    }

    pub fn device(&self) -> Device {
        self.device
    }

    /// Claims accelerator memory for this batch. Idempotent when the
    /// batch is already on the accelerator.
    pub fn to_accelerator(&mut self, pool: &Arc<AcceleratorPool>, label: &str) -> Result<()> {
        if self.device == Device::Accelerator {
            return Ok(());
        }
        let claim = MemoryClaim::new(Arc::clone(pool), label, self.byte_size())?;
        self.claim = Some(claim);
        self.device = Device::Accelerator;
        Ok(())
    }

    /// Releases any accelerator claim held by this batch
    pub fn to_host(&mut self) {
        self.claim = None;
        self.device = Device::Host;
    }

    /// Selects rows by index, in the given order
    pub fn select(&self, indices: &[usize]) -> Result<TensorBatch> {
        let size = self.batch_size();
        if let Some(&bad) = indices.iter().find(|&&i| i >= size) {
            return Err(Error::Internal {
                message: format!("select index {} out of range for batch of {}", bad, size),
            });
        }
        let mut out = TensorBatch::new();
        for (name, tensor) in &self.tensors {
            out.tensors.insert(name.clone(), tensor.select_rows(indices));
        }
        out.meta = self.meta.clone();
        Ok(out)
    }

    /// Slices a contiguous row range
    pub fn slice(&self, range: Range<usize>) -> Result<TensorBatch> {
        let size = self.batch_size();
        if range.start > range.end || range.end > size {
            return Err(Error::Internal {
                message: format!("slice {:?} out of range for batch of {}", range, size),
            });
        }
        let mut out = TensorBatch::new();
        for (name, tensor) in &self.tensors {
            out.tensors.insert(name.clone(), tensor.slice_rows(range.clone()));
        }
        out.meta = self.meta.clone();
        Ok(out)
    }

    /// Splits into `chunks` equal parts along the batch dimension
    pub fn chunk(&self, chunks: usize) -> Result<Vec<TensorBatch>> {
        let size = self.batch_size();
        if chunks == 0 || size % chunks != 0 {
            return Err(Error::BatchSizeIndivisible {
                name: "batch_size".to_string(),
                value: size,
                divisor: chunks.max(1),
            });
        }
        let per = size / chunks;
        (0..chunks).map(|i| self.slice(i * per..(i + 1) * per)).collect()
    }

    /// Concatenates batches along the batch dimension. All inputs must
    /// carry the same tensor names and dtypes; metadata is taken from
    /// the first batch.
    pub fn concat(batches: &[TensorBatch]) -> Result<TensorBatch> {
        let Some(first) = batches.first() else {
            return Ok(TensorBatch::new());
        };
        let mut out = TensorBatch::new();
        for name in first.tensors.keys() {
            let parts = batches
                .iter()
                .map(|b| b.get(name))
                .collect::<Result<Vec<_>>>()?;
            out.tensors.insert(name.clone(), Tensor::concat(name, &parts)?);
        }
        // A later batch with extra tensors is a caller bug
        for batch in batches {
            if batch.tensors.len() != first.tensors.len() {
                let extra = batch
                    .tensors
                    .keys()
                    .find(|k| !first.tensors.contains_key(*k))
                    .cloned()
                    .unwrap_or_default();
                return Err(Error::TensorNotFound { name: extra });
            }
        }
        out.meta = first.meta.clone();
        Ok(out)
    }

    /// Concatenates batches along the token axis, in the given order.
    /// Used to reassemble sequence-parallel shards; metadata is taken
    /// from the first batch.
    pub fn concat_cols(batches: &[TensorBatch]) -> Result<TensorBatch> {
        let Some(first) = batches.first() else {
            return Ok(TensorBatch::new());
        };
        let mut out = TensorBatch::new();
        for name in first.tensors.keys() {
            let parts = batches
                .iter()
                .map(|b| b.get(name))
                .collect::<Result<Vec<_>>>()?;
            out.tensors
                .insert(name.clone(), Tensor::concat_cols(name, &parts)?);
        }
        out.meta = first.meta.clone();
        Ok(out)
    }

    /// Merges another batch's tensors into this one. Duplicate names
    /// are rejected; metadata entries are merged with the other batch
    /// taking precedence.
    pub fn union(&mut self, other: TensorBatch) -> Result<()> {
        if !self.tensors.is_empty() && !other.tensors.is_empty() {
            let expected = self.batch_size();
            let actual = other.batch_size();
            if expected != actual {
                return Err(Error::MisalignedBatch {
                    name: "union".to_string(),
                    expected,
                    actual,
                });
            }
        }
        for name in other.tensors.keys() {
            if self.tensors.contains_key(name) {
                return Err(Error::DuplicateTensor { name: name.clone() });
            }
        }
        for (name, tensor) in other.tensors {
            self.tensors.insert(name, tensor);
        }
        for (key, value) in other.meta {
            self.meta.insert(key, value);
        }
        Ok(())
    }

    /// Zero-pads every tensor's token axis out to `target` columns
    pub fn pad_cols(&self, target: usize) -> Result<TensorBatch> {
        let mut out = TensorBatch::new();
        for (name, tensor) in &self.tensors {
            if tensor.cols() > target {
                return Err(Error::ShapeMismatch {
                    name: name.clone(),
                    message: format!("cannot pad {} cols down to {}", tensor.cols(), target),
                });
            }
            out.tensors.insert(name.clone(), tensor.pad_cols(target));
        }
        out.meta = self.meta.clone();
        Ok(out)
    }

    /// Slices every tensor's token axis to the given column range
    pub fn slice_cols(&self, range: Range<usize>) -> Result<TensorBatch> {
        let mut out = TensorBatch::new();
        for (name, tensor) in &self.tensors {
            if range.start > range.end || range.end > tensor.cols() {
                return Err(Error::ShapeMismatch {
                    name: name.clone(),
                    message: format!("col slice {:?} out of range for {} cols", range, tensor.cols()),
                });
            }
            out.tensors.insert(name.clone(), tensor.slice_cols(range.clone()));
        }
        out.meta = self.meta.clone();
        Ok(out)
    }

    /// Token axis length shared by all tensors, or an error when the
    /// tensors disagree
    pub fn uniform_cols(&self) -> Result<usize> {
        let mut cols = None;
        for (name, tensor) in &self.tensors {
            match cols {
                None => cols = Some(tensor.cols()),
                Some(c) if c != tensor.cols() => {
                    return Err(Error::ShapeMismatch {
                        name: name.clone(),
                        message: format!("token axis {} differs from {}", tensor.cols(), c),
                    })
                }
                _ => {}
            }
        }
        Ok(cols.unwrap_or(0))
    }
}
