//! Validated DAG of operations with construction-time shape/type inference.
//!
//! Acyclicity is by construction: an edge may only reference a node already
//! inserted into the graph, so insertion order is a topological order.
//! Violations of arity, rank, or broadcast compatibility are raised when the
//! node is added, never at execution time.

pub mod infer;
mod node;

use std::collections::BTreeMap;

use tracing::debug;

use crate::element::TensorSpec;
use crate::error::{EngineError, EngineResult, StructuralCode};

pub use node::{AttrValue, BroadcastPolicy, InputEdge, NodeId, OpKind, OperationNode};

/// Acyclic set of operation nodes in topological (insertion) order.
#[derive(Debug, Default)]
pub struct OperationGraph {
    nodes: Vec<OperationNode>,
    outputs: Vec<InputEdge>,
}

impl OperationGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a graph input carrying the given spec. The `name` attribute is
    /// kept for diagnostics and feed lookup by external loaders.
    pub fn add_parameter(&mut self, name: impl Into<String>, spec: TensorSpec) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        let mut attrs = BTreeMap::new();
        attrs.insert("name".to_string(), AttrValue::Str(name.into()));
        self.nodes.push(OperationNode::new_parameter(id, attrs, spec));
        id
    }

    /// Adds an operation node, validating arity and structural constraints
    /// and inferring output specs before the node becomes visible.
    pub fn add_node(
        &mut self,
        kind: OpKind,
        inputs: Vec<InputEdge>,
        attrs: BTreeMap<String, AttrValue>,
        broadcast: BroadcastPolicy,
    ) -> EngineResult<NodeId> {
        let id = NodeId(self.nodes.len() as u32);
        let input_specs = self.resolve_input_specs(id, &inputs)?;
        node::validate_arity(kind, inputs.len())?;
        let outputs = infer::infer_output_specs(kind, &input_specs, broadcast)?;
        debug!(node = id.0, kind = kind.name(), "graph node added");
        self.nodes
            .push(OperationNode::new(id, kind, inputs, attrs, broadcast, outputs));
        Ok(id)
    }

    /// Returns a node identical in kind and attributes but rebound to new
    /// input edges, appended to the graph. Re-validates exactly as
    /// construction does; used by external graph-rewriting passes.
    pub fn clone_node_with_new_inputs(
        &mut self,
        node: NodeId,
        new_inputs: Vec<InputEdge>,
    ) -> EngineResult<NodeId> {
        let source = self.node(node)?;
        let kind = source.kind();
        let attrs = source.attrs().clone();
        let broadcast = source.broadcast();
        self.add_node(kind, new_inputs, attrs, broadcast)
    }

    /// Marks an edge as a graph output; execution returns marked outputs in
    /// marking order.
    pub fn mark_output(&mut self, edge: InputEdge) -> EngineResult<()> {
        let next = NodeId(self.nodes.len() as u32);
        self.check_edge(next, &edge)?;
        self.outputs.push(edge);
        Ok(())
    }

    pub fn outputs(&self) -> &[InputEdge] {
        &self.outputs
    }

    pub fn node(&self, id: NodeId) -> EngineResult<&OperationNode> {
        self.nodes.get(id.0 as usize).ok_or_else(|| {
            EngineError::structural(
                StructuralCode::NodeOutOfOrder,
                format!("node {} does not exist", id.0),
            )
        })
    }

    /// Nodes in topological order.
    pub fn nodes(&self) -> &[OperationNode] {
        &self.nodes
    }

    /// Spec of the value carried by an edge.
    pub fn edge_spec(&self, edge: &InputEdge) -> EngineResult<&TensorSpec> {
        let producer = self.node(edge.producer)?;
        producer.output_spec(edge.output)
    }

    /// `true` when any node output carries a symbolic dimension, requiring
    /// per-execution re-inference.
    pub fn has_dynamic_shapes(&self) -> bool {
        self.nodes
            .iter()
            .any(|node| node.output_specs().iter().any(|spec| !spec.shape.is_static()))
    }

    fn check_edge(&self, consumer: NodeId, edge: &InputEdge) -> EngineResult<()> {
        if edge.producer.0 >= consumer.0 {
            return Err(EngineError::structural(
                StructuralCode::NodeOutOfOrder,
                format!(
                    "edge from node {} cannot feed node {}",
                    edge.producer.0, consumer.0
                ),
            ));
        }
        let producer = self.node(edge.producer)?;
        if edge.output >= producer.output_specs().len() {
            return Err(EngineError::structural(
                StructuralCode::OutputIndexOutOfRange,
                format!(
                    "node {} has {} outputs, edge references output {}",
                    edge.producer.0,
                    producer.output_specs().len(),
                    edge.output
                ),
            ));
        }
        Ok(())
    }

    fn resolve_input_specs(
        &self,
        consumer: NodeId,
        inputs: &[InputEdge],
    ) -> EngineResult<Vec<TensorSpec>> {
        let mut specs = Vec::with_capacity(inputs.len());
        for edge in inputs {
            self.check_edge(consumer, edge)?;
            specs.push(self.edge_spec(edge)?.clone());
        }
        Ok(specs)
    }
}
