//! Reference host backend.
//!
//! Every primitive executes through the core typed evaluator against
//! host-resident byte buffers. This backend is always available and serves
//! as the semantic baseline the accelerator families are checked against.

mod context;
mod elementwise;
mod segment_sum;

use std::sync::Arc;

use quiver::backend::{BackendCompiler, PrecisionTable, PrimitiveDescriptors, PrimitiveInstance};
use quiver::config::OptionMap;
use quiver::element::{ElementType, TensorSpec};
use quiver::error::{EngineError, EngineResult};
use quiver::graph::{NodeId, OpKind, OperationGraph, OperationNode};
use quiver::memory::RemoteTensor;
use tracing::debug;

pub use context::{HostBuffer, HostContext};
pub use elementwise::ElementwisePrimitive;
pub use segment_sum::SegmentSumPrimitive;

/// Precisions the host kernels run natively, and the promotions applied to
/// the rest. Narrow floats widen to f32; nothing narrows.
pub static HOST_PRECISIONS: PrecisionTable = PrecisionTable::new(
    &[
        ElementType::F32,
        ElementType::I64,
        ElementType::I32,
        ElementType::I8,
        ElementType::U64,
        ElementType::U32,
        ElementType::U8,
    ],
    &[
        (ElementType::F16, ElementType::F32),
        (ElementType::Bf16, ElementType::F32),
    ],
);

pub const BACKEND_NAME: &str = "host";

/// Compiler for the reference host backend.
#[derive(Debug, Default)]
pub struct HostBackend;

impl HostBackend {
    pub fn new() -> Self {
        Self
    }
}

impl BackendCompiler for HostBackend {
    type Context = HostContext;
    type Primitive = HostPrimitive;

    fn backend_name(&self) -> &'static str {
        BACKEND_NAME
    }

    fn is_available(&self) -> bool {
        true
    }

    fn acquire_context(&self) -> EngineResult<Arc<HostContext>> {
        Ok(Arc::new(HostContext::new()))
    }

    fn precision_table(&self) -> &'static PrecisionTable {
        &HOST_PRECISIONS
    }

    fn compile_node(
        &self,
        _graph: &OperationGraph,
        node: &OperationNode,
        _context: &Arc<HostContext>,
        _options: &OptionMap,
    ) -> EngineResult<HostPrimitive> {
        debug!(node = node.id().0, kind = node.kind().name(), "compiling host primitive");
        match node.kind() {
            OpKind::Add | OpKind::Multiply | OpKind::Maximum | OpKind::HSigmoid => {
                Ok(HostPrimitive::Elementwise(ElementwisePrimitive::new(
                    node,
                    &HOST_PRECISIONS,
                    BACKEND_NAME,
                )))
            }
            OpKind::SegmentSumGather => Ok(HostPrimitive::SegmentSum(SegmentSumPrimitive::new(
                node,
                &HOST_PRECISIONS,
                BACKEND_NAME,
            ))),
            OpKind::Parameter => Err(EngineError::execution(
                "parameters are bound to buffers, not compiled".to_string(),
            )),
        }
    }
}

/// Compiled host primitive; one variant per kernel family.
pub enum HostPrimitive {
    Elementwise(ElementwisePrimitive<HostContext>),
    SegmentSum(SegmentSumPrimitive<HostContext>),
}

impl PrimitiveInstance for HostPrimitive {
    type Context = HostContext;

    fn node_id(&self) -> NodeId {
        match self {
            HostPrimitive::Elementwise(p) => p.node_id(),
            HostPrimitive::SegmentSum(p) => p.node_id(),
        }
    }

    fn init_supported_descriptors(&mut self) -> EngineResult<()> {
        match self {
            HostPrimitive::Elementwise(p) => p.init_supported_descriptors(),
            HostPrimitive::SegmentSum(p) => p.init_supported_descriptors(),
        }
    }

    fn descriptors(&self) -> Option<&PrimitiveDescriptors> {
        match self {
            HostPrimitive::Elementwise(p) => p.descriptors(),
            HostPrimitive::SegmentSum(p) => p.descriptors(),
        }
    }

    fn is_dynamic(&self) -> bool {
        match self {
            HostPrimitive::Elementwise(p) => p.is_dynamic(),
            HostPrimitive::SegmentSum(p) => p.is_dynamic(),
        }
    }

    fn prepare_params(&mut self, inputs: &[RemoteTensor<HostBuffer>]) -> EngineResult<()> {
        match self {
            HostPrimitive::Elementwise(p) => p.prepare_params(inputs),
            HostPrimitive::SegmentSum(p) => p.prepare_params(inputs),
        }
    }

    fn output_specs(&self) -> EngineResult<Vec<TensorSpec>> {
        match self {
            HostPrimitive::Elementwise(p) => p.output_specs(),
            HostPrimitive::SegmentSum(p) => p.output_specs(),
        }
    }

    fn is_executable(&self, inputs: &[RemoteTensor<HostBuffer>]) -> bool {
        match self {
            HostPrimitive::Elementwise(p) => p.is_executable(inputs),
            HostPrimitive::SegmentSum(p) => p.is_executable(inputs),
        }
    }

    fn execute(
        &mut self,
        context: &HostContext,
        inputs: &[RemoteTensor<HostBuffer>],
        outputs: &[RemoteTensor<HostBuffer>],
    ) -> EngineResult<()> {
        match self {
            HostPrimitive::Elementwise(p) => p.execute(context, inputs, outputs),
            HostPrimitive::SegmentSum(p) => p.execute(context, inputs, outputs),
        }
    }
}
