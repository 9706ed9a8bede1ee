//! Backend SPI: compiled primitive instances and the compiler that builds
//! them.
//!
//! A backend family implements [`BackendCompiler`] plus
//! [`crate::memory::DeviceContext`] and registers nothing else; the graph
//! and evaluator core stay untouched when a new family is added.

use std::sync::Arc;

use crate::element::{ElementType, TensorSpec};
use crate::error::{EngineError, EngineResult};
use crate::graph::{NodeId, OperationGraph, OperationNode};
use crate::memory::{DeviceContext, RemoteTensor};

/// Physical arrangement of a port's elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryLayout {
    /// Dense row-major, the reference layout.
    RowMajor,
    /// Channel-blocked accelerator layout.
    ChannelBlocked { block: usize },
}

/// Negotiated memory/precision configuration for one port.
///
/// `precision` is the element type the kernel computes in; the port's buffer
/// keeps the declared element type and is converted at the boundary when the
/// two differ. `byte_len` tracks the buffer size and is the only field that
/// changes after creation (resized for symbolic shapes).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortDescriptor {
    pub precision: ElementType,
    pub layout: MemoryLayout,
    pub byte_len: Option<usize>,
}

impl PortDescriptor {
    pub fn new(precision: ElementType, layout: MemoryLayout) -> Self {
        Self {
            precision,
            layout,
            byte_len: None,
        }
    }
}

/// Descriptor set chosen by `init_supported_descriptors`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrimitiveDescriptors {
    pub inputs: Vec<PortDescriptor>,
    pub outputs: Vec<PortDescriptor>,
}

/// Explicit, testable precision-promotion table for one backend.
///
/// A declared precision is kept when native, widened through the first
/// matching promotion rule otherwise, and rejected when no rule covers it.
#[derive(Debug, Clone, Copy)]
pub struct PrecisionTable {
    pub native: &'static [ElementType],
    pub promotions: &'static [(ElementType, ElementType)],
}

impl PrecisionTable {
    pub const fn new(
        native: &'static [ElementType],
        promotions: &'static [(ElementType, ElementType)],
    ) -> Self {
        Self { native, promotions }
    }

    pub fn resolve(
        &self,
        backend: &'static str,
        declared: ElementType,
    ) -> EngineResult<ElementType> {
        if self.native.contains(&declared) {
            return Ok(declared);
        }
        self.promotions
            .iter()
            .find(|(from, _)| *from == declared)
            .map(|(_, to)| *to)
            .ok_or_else(|| EngineError::unsupported_precision(backend, declared))
    }
}

/// A backend-specific, executable binding of one graph operation to concrete
/// memory descriptors. The node binding and backend are immutable after
/// creation; only the descriptors' byte lengths change over the instance's
/// life.
pub trait PrimitiveInstance {
    type Context: DeviceContext;

    fn node_id(&self) -> NodeId;

    /// Negotiates per-port precision and layout. Idempotent: a no-op once
    /// descriptors are chosen. Fails with `UnsupportedPrecision` when the
    /// node's precision is outside the backend's table.
    fn init_supported_descriptors(&mut self) -> EngineResult<()>;

    fn descriptors(&self) -> Option<&PrimitiveDescriptors>;

    /// `true` when the instance's output shapes depend on symbolic
    /// dimensions and `prepare_params` must run before every execution.
    fn is_dynamic(&self) -> bool;

    /// Re-derives per-invocation sizes from the current input tensors and
    /// resizes descriptors/output specs accordingly.
    fn prepare_params(
        &mut self,
        inputs: &[RemoteTensor<<Self::Context as DeviceContext>::Buffer>],
    ) -> EngineResult<()>;

    /// Resolved output specs for the coming execution (post
    /// `prepare_params` for dynamic instances).
    fn output_specs(&self) -> EngineResult<Vec<TensorSpec>>;

    /// `false` when the instance is legitimately skipped, e.g. a required
    /// but optional input is present yet holds zero elements. Not an error.
    fn is_executable(
        &self,
        inputs: &[RemoteTensor<<Self::Context as DeviceContext>::Buffer>],
    ) -> bool;

    /// Reads the input buffers, performs the node's algorithm, writes the
    /// pre-sized output buffers. Nothing is written on failure.
    fn execute(
        &mut self,
        context: &Self::Context,
        inputs: &[RemoteTensor<<Self::Context as DeviceContext>::Buffer>],
        outputs: &[RemoteTensor<<Self::Context as DeviceContext>::Buffer>],
    ) -> EngineResult<()>;
}

/// Per-backend compiler producing one primitive instance per node.
pub trait BackendCompiler {
    type Context: DeviceContext;
    type Primitive: PrimitiveInstance<Context = Self::Context>;

    fn backend_name(&self) -> &'static str;

    /// `true` when the backend's runtime support is present in this build.
    fn is_available(&self) -> bool;

    /// Creates an explicit device context; never a process-wide singleton.
    fn acquire_context(&self) -> EngineResult<Arc<Self::Context>>;

    fn precision_table(&self) -> &'static PrecisionTable;

    fn compile_node(
        &self,
        graph: &OperationGraph,
        node: &OperationNode,
        context: &Arc<Self::Context>,
        options: &crate::config::OptionMap,
    ) -> EngineResult<Self::Primitive>;
}
