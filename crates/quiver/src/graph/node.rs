use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::element::TensorSpec;
use crate::error::{EngineError, EngineResult, StructuralCode};

/// Stable node identity within one graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u32);

/// Reference to one output of a producer node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InputEdge {
    pub producer: NodeId,
    pub output: usize,
}

impl InputEdge {
    pub fn new(producer: NodeId, output: usize) -> Self {
        Self { producer, output }
    }
}

impl From<NodeId> for InputEdge {
    fn from(producer: NodeId) -> Self {
        InputEdge {
            producer,
            output: 0,
        }
    }
}

/// Rule governing how mismatched input shapes reconcile into one output
/// shape for elementwise operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BroadcastPolicy {
    /// Shapes must match exactly.
    None,
    /// Trailing dimensions aligned, size-1 dimensions expand.
    Numpy,
}

/// Scalar attribute value attached to a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttrValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

/// Closed set of operation kinds this engine executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpKind {
    /// Graph input; carries its spec, takes no inputs.
    Parameter,
    Add,
    Multiply,
    Maximum,
    /// `y = min(max(x + 3, 0), 6) / 6`, float element types only.
    HSigmoid,
    /// Segment-sum gather over a table using offset/index buffers, with an
    /// optional default index and optional per-sample weights.
    ///
    /// Ports: 0 table, 1 indices, 2 offsets, 3 default index (optional),
    /// 4 per-sample weights (optional).
    SegmentSumGather,
}

impl OpKind {
    pub fn name(self) -> &'static str {
        match self {
            OpKind::Parameter => "Parameter",
            OpKind::Add => "Add",
            OpKind::Multiply => "Multiply",
            OpKind::Maximum => "Maximum",
            OpKind::HSigmoid => "HSigmoid",
            OpKind::SegmentSumGather => "SegmentSumGather",
        }
    }

    /// Inclusive (min, max) input count for the kind.
    pub fn arity(self) -> (usize, usize) {
        match self {
            OpKind::Parameter => (0, 0),
            OpKind::Add | OpKind::Multiply | OpKind::Maximum => (2, 2),
            OpKind::HSigmoid => (1, 1),
            OpKind::SegmentSumGather => (3, 5),
        }
    }

    pub fn is_elementwise_binary(self) -> bool {
        matches!(self, OpKind::Add | OpKind::Multiply | OpKind::Maximum)
    }
}

pub(crate) fn validate_arity(kind: OpKind, count: usize) -> EngineResult<()> {
    let (min, max) = kind.arity();
    if count < min || count > max {
        return Err(EngineError::structural(
            StructuralCode::ArityMismatch,
            format!("{} expects {min}..={max} inputs, got {count}", kind.name()),
        ));
    }
    Ok(())
}

/// One validated operation in a graph.
#[derive(Debug, Clone)]
pub struct OperationNode {
    id: NodeId,
    kind: OpKind,
    inputs: Vec<InputEdge>,
    attrs: BTreeMap<String, AttrValue>,
    broadcast: BroadcastPolicy,
    outputs: Vec<TensorSpec>,
}

impl OperationNode {
    pub(crate) fn new(
        id: NodeId,
        kind: OpKind,
        inputs: Vec<InputEdge>,
        attrs: BTreeMap<String, AttrValue>,
        broadcast: BroadcastPolicy,
        outputs: Vec<TensorSpec>,
    ) -> Self {
        Self {
            id,
            kind,
            inputs,
            attrs,
            broadcast,
            outputs,
        }
    }

    pub(crate) fn new_parameter(
        id: NodeId,
        attrs: BTreeMap<String, AttrValue>,
        spec: TensorSpec,
    ) -> Self {
        Self {
            id,
            kind: OpKind::Parameter,
            inputs: Vec::new(),
            attrs,
            broadcast: BroadcastPolicy::None,
            outputs: vec![spec],
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn kind(&self) -> OpKind {
        self.kind
    }

    pub fn inputs(&self) -> &[InputEdge] {
        &self.inputs
    }

    pub fn attrs(&self) -> &BTreeMap<String, AttrValue> {
        &self.attrs
    }

    pub fn broadcast(&self) -> BroadcastPolicy {
        self.broadcast
    }

    pub fn output_specs(&self) -> &[TensorSpec] {
        &self.outputs
    }

    pub fn output_spec(&self, index: usize) -> EngineResult<&TensorSpec> {
        self.outputs.get(index).ok_or_else(|| {
            EngineError::structural(
                StructuralCode::OutputIndexOutOfRange,
                format!(
                    "node {} has {} outputs, requested {index}",
                    self.id.0,
                    self.outputs.len()
                ),
            )
        })
    }

    pub fn attr(&self, key: &str) -> Option<&AttrValue> {
        self.attrs.get(key)
    }
}
