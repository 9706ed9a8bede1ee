//! Shape/type inference run at node construction and, for graphs carrying
//! symbolic dimensions, again per execution with concrete input specs.

use crate::element::{Dim, ElementType, Shape, TensorSpec};
use crate::error::{EngineError, EngineResult, StructuralCode};
use crate::graph::node::{BroadcastPolicy, OpKind};

/// Resolves the output shape of an elementwise binary operation under the
/// given policy. Computed once, before any buffer allocation.
pub fn broadcast_shapes(
    policy: BroadcastPolicy,
    lhs: &Shape,
    rhs: &Shape,
) -> EngineResult<Shape> {
    match policy {
        BroadcastPolicy::None => {
            if lhs != rhs {
                return Err(EngineError::structural(
                    StructuralCode::BroadcastIncompatible,
                    format!("policy none requires equal shapes, got {lhs} and {rhs}"),
                ));
            }
            Ok(lhs.clone())
        }
        BroadcastPolicy::Numpy => {
            let rank = lhs.rank().max(rhs.rank());
            let mut dims = Vec::with_capacity(rank);
            for axis in 0..rank {
                let a = trailing_dim(lhs, rank, axis);
                let b = trailing_dim(rhs, rank, axis);
                dims.push(merge_dims(a, b, lhs, rhs)?);
            }
            Ok(Shape::new(dims))
        }
    }
}

// Trailing alignment: missing leading axes behave as size 1.
fn trailing_dim(shape: &Shape, rank: usize, axis: usize) -> Option<&Dim> {
    let offset = rank - shape.rank();
    if axis < offset {
        None
    } else {
        Some(&shape.dims()[axis - offset])
    }
}

fn merge_dims(a: Option<&Dim>, b: Option<&Dim>, lhs: &Shape, rhs: &Shape) -> EngineResult<Dim> {
    let incompatible = || {
        EngineError::structural(
            StructuralCode::BroadcastIncompatible,
            format!("shapes {lhs} and {rhs} do not broadcast"),
        )
    };
    match (a, b) {
        (None, None) => Ok(Dim::Static(1)),
        (Some(dim), None) | (None, Some(dim)) => Ok(dim.clone()),
        (Some(Dim::Static(1)), Some(dim)) | (Some(dim), Some(Dim::Static(1))) => Ok(dim.clone()),
        (Some(Dim::Static(x)), Some(Dim::Static(y))) => {
            if x == y {
                Ok(Dim::Static(*x))
            } else {
                Err(incompatible())
            }
        }
        // A symbolic extent only resolves at execution; keep it symbolic and
        // let the per-execution re-inference check the concrete sizes.
        (Some(Dim::Dynamic(symbol)), Some(_)) | (Some(_), Some(Dim::Dynamic(symbol))) => {
            Ok(Dim::Dynamic(symbol.clone()))
        }
    }
}

/// Infers the output specs for a node from its resolved input specs.
pub fn infer_output_specs(
    kind: OpKind,
    inputs: &[TensorSpec],
    broadcast: BroadcastPolicy,
) -> EngineResult<Vec<TensorSpec>> {
    match kind {
        OpKind::Parameter => Err(EngineError::structural(
            StructuralCode::InvalidAttribute,
            "parameters are added through add_parameter".to_string(),
        )),
        OpKind::Add | OpKind::Multiply | OpKind::Maximum => {
            let (lhs, rhs) = (&inputs[0], &inputs[1]);
            if lhs.dtype != rhs.dtype {
                return Err(EngineError::structural(
                    StructuralCode::DTypeMismatch,
                    format!(
                        "{} inputs must share an element type, got {} and {}",
                        kind.name(),
                        lhs.dtype,
                        rhs.dtype
                    ),
                ));
            }
            let shape = broadcast_shapes(broadcast, &lhs.shape, &rhs.shape)?;
            Ok(vec![TensorSpec::new(lhs.dtype, shape)])
        }
        OpKind::HSigmoid => {
            let input = &inputs[0];
            if !input.dtype.is_float() {
                return Err(EngineError::structural(
                    StructuralCode::DTypeMismatch,
                    format!("HSigmoid requires a float element type, got {}", input.dtype),
                ));
            }
            Ok(vec![input.clone()])
        }
        OpKind::SegmentSumGather => infer_segment_sum(inputs),
    }
}

const TABLE_PORT: usize = 0;
const INDICES_PORT: usize = 1;
const OFFSETS_PORT: usize = 2;
const DEFAULT_INDEX_PORT: usize = 3;
const WEIGHTS_PORT: usize = 4;

fn infer_segment_sum(inputs: &[TensorSpec]) -> EngineResult<Vec<TensorSpec>> {
    let table = &inputs[TABLE_PORT];
    if table.shape.rank() < 1 {
        return Err(EngineError::structural(
            StructuralCode::RankMismatch,
            "segment gather table must have rank >= 1".to_string(),
        ));
    }
    require_index_like(&inputs[INDICES_PORT], "indices", 1)?;
    require_index_like(&inputs[OFFSETS_PORT], "offsets", 1)?;
    if let Some(default_index) = inputs.get(DEFAULT_INDEX_PORT) {
        require_index_like(default_index, "default index", 0)?;
    }
    if let Some(weights) = inputs.get(WEIGHTS_PORT) {
        if weights.dtype != table.dtype {
            return Err(EngineError::structural(
                StructuralCode::DTypeMismatch,
                format!(
                    "per-sample weights must match table type {}, got {}",
                    table.dtype, weights.dtype
                ),
            ));
        }
        if weights.shape != inputs[INDICES_PORT].shape {
            return Err(EngineError::structural(
                StructuralCode::RankMismatch,
                "per-sample weights must be shaped like indices".to_string(),
            ));
        }
    }

    // One output row per segment, rows shaped like the table rows.
    let mut dims = vec![inputs[OFFSETS_PORT].shape.dims()[0].clone()];
    dims.extend_from_slice(&table.shape.dims()[1..]);
    Ok(vec![TensorSpec::new(table.dtype, Shape::new(dims))])
}

fn require_index_like(spec: &TensorSpec, what: &str, rank: usize) -> EngineResult<()> {
    if spec.shape.rank() != rank {
        return Err(EngineError::structural(
            StructuralCode::RankMismatch,
            format!("{what} must have rank {rank}, got {}", spec.shape.rank()),
        ));
    }
    if spec.dtype != ElementType::I32 {
        return Err(EngineError::structural(
            StructuralCode::DTypeMismatch,
            format!("{what} must be i32, got {}", spec.dtype),
        ));
    }
    Ok(())
}
