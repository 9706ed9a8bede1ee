//! Typed evaluation dispatch.
//!
//! Each operation owns a lookup table of type-specialized kernel functions,
//! built once behind a lazy static and selected by a single match at call
//! time. A runtime element type outside an operation's supported set fails
//! with [`EngineError::UnsupportedType`] before anything is written to the
//! output buffer.

mod convert;
mod fill;
mod kernels;

use crate::element::{ElementType, Shape, TensorSpec};
use crate::error::{EngineError, EngineResult, StructuralCode};
use crate::graph::infer::broadcast_shapes;
use crate::graph::{BroadcastPolicy, OpKind};

pub use convert::convert_buffer;
pub use fill::fill_deterministic;

/// Elementwise binary operations the evaluator dispatches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Multiply,
    Maximum,
}

impl BinaryOp {
    pub fn name(self) -> &'static str {
        match self {
            BinaryOp::Add => "Add",
            BinaryOp::Multiply => "Multiply",
            BinaryOp::Maximum => "Maximum",
        }
    }

    pub fn from_kind(kind: OpKind) -> Option<Self> {
        match kind {
            OpKind::Add => Some(BinaryOp::Add),
            OpKind::Multiply => Some(BinaryOp::Multiply),
            OpKind::Maximum => Some(BinaryOp::Maximum),
            _ => None,
        }
    }
}

/// Elementwise unary operations the evaluator dispatches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    HSigmoid,
}

impl UnaryOp {
    pub fn name(self) -> &'static str {
        match self {
            UnaryOp::HSigmoid => "HSigmoid",
        }
    }
}

/// Read-only view over a typed byte buffer.
#[derive(Debug, Clone, Copy)]
pub struct TensorView<'a> {
    spec: &'a TensorSpec,
    bytes: &'a [u8],
}

impl<'a> TensorView<'a> {
    /// The spec must be fully static and the buffer long enough to hold it.
    pub fn new(spec: &'a TensorSpec, bytes: &'a [u8]) -> EngineResult<Self> {
        let byte_len = require_static_len(spec)?;
        if bytes.len() < byte_len {
            return Err(EngineError::execution(format!(
                "buffer holds {} bytes, spec {spec:?} needs {byte_len}",
                bytes.len()
            )));
        }
        Ok(Self { spec, bytes })
    }

    pub fn spec(&self) -> &TensorSpec {
        self.spec
    }

    pub fn dtype(&self) -> ElementType {
        self.spec.dtype
    }

    pub fn shape(&self) -> &Shape {
        &self.spec.shape
    }

    pub fn bytes(&self) -> &'a [u8] {
        self.bytes
    }

    pub fn element_count(&self) -> usize {
        self.spec.element_count().unwrap_or(0)
    }

    /// Copies the buffer out as `i32` values; the view must be `I32`.
    pub fn to_i32_vec(&self) -> EngineResult<Vec<i32>> {
        if self.dtype() != ElementType::I32 {
            return Err(EngineError::structural(
                StructuralCode::DTypeMismatch,
                format!("expected i32 buffer, got {}", self.dtype()),
            ));
        }
        let count = self.element_count();
        let mut values = Vec::with_capacity(count);
        for index in 0..count {
            let at = index * 4;
            let mut raw = [0u8; 4];
            raw.copy_from_slice(&self.bytes[at..at + 4]);
            values.push(i32::from_le_bytes(raw));
        }
        Ok(values)
    }
}

/// Mutable view over a pre-shaped output buffer.
#[derive(Debug)]
pub struct TensorViewMut<'a> {
    spec: &'a TensorSpec,
    bytes: &'a mut [u8],
}

impl<'a> TensorViewMut<'a> {
    pub fn new(spec: &'a TensorSpec, bytes: &'a mut [u8]) -> EngineResult<Self> {
        let byte_len = require_static_len(spec)?;
        if bytes.len() < byte_len {
            return Err(EngineError::execution(format!(
                "output buffer holds {} bytes, spec {spec:?} needs {byte_len}",
                bytes.len()
            )));
        }
        Ok(Self { spec, bytes })
    }

    pub fn spec(&self) -> &TensorSpec {
        self.spec
    }

    pub fn dtype(&self) -> ElementType {
        self.spec.dtype
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        self.bytes
    }
}

fn require_static_len(spec: &TensorSpec) -> EngineResult<usize> {
    spec.byte_len().ok_or_else(|| {
        EngineError::structural(
            StructuralCode::DynamicDimensionUnresolved,
            format!("{spec:?} cannot be evaluated with symbolic dimensions"),
        )
    })
}

/// Executes an elementwise binary operation for the runtime element type.
///
/// The output shape is resolved from both input shapes and the policy before
/// any allocation or write; the caller supplies the output buffer already
/// shaped to that result.
pub fn evaluate_binary(
    op: BinaryOp,
    policy: BroadcastPolicy,
    lhs: &TensorView<'_>,
    rhs: &TensorView<'_>,
    out: &mut TensorViewMut<'_>,
) -> EngineResult<()> {
    if lhs.dtype() != rhs.dtype() || lhs.dtype() != out.dtype() {
        return Err(EngineError::structural(
            StructuralCode::DTypeMismatch,
            format!(
                "{} operands must share one element type, got {} {} -> {}",
                op.name(),
                lhs.dtype(),
                rhs.dtype(),
                out.dtype()
            ),
        ));
    }
    let expected = broadcast_shapes(policy, lhs.shape(), rhs.shape())?;
    if out.spec().shape != expected {
        return Err(EngineError::execution(format!(
            "output shaped {} but broadcast resolves to {expected}",
            out.spec().shape
        )));
    }

    let kernel = kernels::binary_kernel(op, lhs.dtype())
        .ok_or_else(|| EngineError::unsupported_type(op.name(), lhs.dtype()))?;

    let out_dims = expected.static_dims().unwrap_or_default();
    let lhs_map = build_index_map(&lhs.shape().static_dims().unwrap_or_default(), &out_dims);
    let rhs_map = build_index_map(&rhs.shape().static_dims().unwrap_or_default(), &out_dims);
    kernel(lhs.bytes(), rhs.bytes(), out.bytes_mut(), &lhs_map, &rhs_map);
    Ok(())
}

/// Executes an elementwise unary operation for the runtime element type.
pub fn evaluate_unary(
    op: UnaryOp,
    input: &TensorView<'_>,
    out: &mut TensorViewMut<'_>,
) -> EngineResult<()> {
    if input.dtype() != out.dtype() {
        return Err(EngineError::structural(
            StructuralCode::DTypeMismatch,
            format!(
                "{} output element type {} does not match input {}",
                op.name(),
                out.dtype(),
                input.dtype()
            ),
        ));
    }
    if out.spec().shape != *input.shape() {
        return Err(EngineError::execution(format!(
            "output shaped {} but input is {}",
            out.spec().shape,
            input.shape()
        )));
    }
    let kernel = kernels::unary_kernel(op, input.dtype())
        .ok_or_else(|| EngineError::unsupported_type(op.name(), input.dtype()))?;
    kernel(input.bytes(), out.bytes_mut(), input.element_count());
    Ok(())
}

/// Inputs to the segment-sum gather reference computation.
pub struct SegmentSumRequest<'a> {
    pub table: TensorView<'a>,
    pub indices: &'a [i32],
    pub offsets: &'a [i32],
    pub default_index: Option<i32>,
    pub weights: Option<TensorView<'a>>,
}

/// Sums variable-length segments of table rows selected by the
/// indices/offsets pair. All bounds are validated before the first write,
/// so a failed call leaves the output buffer untouched.
pub fn evaluate_segment_sum(
    request: &SegmentSumRequest<'_>,
    out: &mut TensorViewMut<'_>,
) -> EngineResult<()> {
    let dtype = request.table.dtype();
    if out.dtype() != dtype {
        return Err(EngineError::structural(
            StructuralCode::DTypeMismatch,
            format!(
                "segment sum output must be {dtype}, got {}",
                out.dtype()
            ),
        ));
    }
    let table_dims = request
        .table
        .shape()
        .static_dims()
        .unwrap_or_default();
    let rows = table_dims.first().copied().unwrap_or(0);
    let row_len: usize = table_dims.iter().skip(1).product();

    if let Some(weights) = &request.weights {
        if weights.dtype() != dtype {
            return Err(EngineError::structural(
                StructuralCode::DTypeMismatch,
                format!(
                    "per-sample weights must be {dtype}, got {}",
                    weights.dtype()
                ),
            ));
        }
        if weights.element_count() != request.indices.len() {
            return Err(EngineError::structural(
                StructuralCode::RankMismatch,
                "per-sample weights must have one value per index".to_string(),
            ));
        }
    }

    let expected_out = request.offsets.len() * row_len;
    if out.spec().element_count().unwrap_or(0) != expected_out {
        return Err(EngineError::execution(format!(
            "segment sum output holds {} elements, expected {expected_out}",
            out.spec().element_count().unwrap_or(0)
        )));
    }

    let kernel = kernels::segment_kernel(dtype)
        .ok_or_else(|| EngineError::unsupported_type("SegmentSumGather", dtype))?;
    let args = kernels::SegmentSumArgs {
        table: request.table.bytes(),
        rows,
        row_len,
        indices: request.indices,
        offsets: request.offsets,
        default_index: request.default_index,
        weights: request.weights.as_ref().map(|w| w.bytes()),
    };
    kernel(&args, out.bytes_mut())
}

fn row_major_strides(dims: &[usize]) -> Vec<usize> {
    let mut strides = vec![1usize; dims.len()];
    for axis in (0..dims.len().saturating_sub(1)).rev() {
        strides[axis] = strides[axis + 1] * dims[axis + 1];
    }
    strides
}

// Per-element input offsets for broadcast iteration: expanded (size-1 or
// missing) axes contribute stride 0.
fn build_index_map(input_dims: &[usize], out_dims: &[usize]) -> Vec<usize> {
    let out_count: usize = out_dims.iter().product();
    let offset = out_dims.len() - input_dims.len();
    let in_strides = row_major_strides(input_dims);
    let out_strides = row_major_strides(out_dims);

    (0..out_count)
        .map(|flat| {
            let mut rem = flat;
            let mut index = 0usize;
            for (axis, stride) in out_strides.iter().enumerate() {
                let coord = rem / stride;
                rem %= stride;
                if axis >= offset && input_dims[axis - offset] != 1 {
                    index += coord * in_strides[axis - offset];
                }
            }
            index
        })
        .collect()
}
