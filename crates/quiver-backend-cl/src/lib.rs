//! OpenCL-family accelerator backend.
//!
//! The driver library is loaded dynamically at backend construction;
//! compilation against an absent runtime fails with `DeviceUnavailable`.
//! Elementwise nodes run generated device kernels where the shapes allow
//! it, and the segment gather is served through the reference primitive
//! over mapped device memory.

mod context;
mod driver;
mod elementwise;

use std::sync::Arc;

use quiver::backend::{BackendCompiler, PrecisionTable, PrimitiveDescriptors, PrimitiveInstance};
use quiver::config::OptionMap;
use quiver::element::{ElementType, TensorSpec};
use quiver::error::{EngineError, EngineResult};
use quiver::graph::{NodeId, OpKind, OperationGraph, OperationNode};
use quiver::memory::RemoteTensor;
use quiver_backend_host::SegmentSumPrimitive;
use tracing::warn;

pub use context::{ClBuffer, ClContext};
pub use driver::ClDriver;
pub use elementwise::ClElementwisePrimitive;

pub const BACKEND_NAME: &str = "cl";

/// Precisions the generated kernels and mapped reference path accept
/// natively; bf16 has no OpenCL C representation and widens to f32.
pub static CL_PRECISIONS: PrecisionTable = PrecisionTable::new(
    &[
        ElementType::F32,
        ElementType::F16,
        ElementType::I64,
        ElementType::I32,
        ElementType::I8,
        ElementType::U64,
        ElementType::U32,
        ElementType::U8,
    ],
    &[(ElementType::Bf16, ElementType::F32)],
);

/// Compiler for the OpenCL accelerator family.
pub struct ClBackend {
    driver: Option<Arc<ClDriver>>,
}

impl ClBackend {
    /// Probes the driver library once; an absent runtime leaves the backend
    /// constructed but unavailable.
    pub fn new() -> Self {
        let driver = match ClDriver::load() {
            Ok(driver) => Some(driver),
            Err(err) => {
                warn!("OpenCL runtime not loaded: {err}");
                None
            }
        };
        Self { driver }
    }
}

impl Default for ClBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl BackendCompiler for ClBackend {
    type Context = ClContext;
    type Primitive = ClPrimitive;

    fn backend_name(&self) -> &'static str {
        BACKEND_NAME
    }

    fn is_available(&self) -> bool {
        self.driver.is_some()
    }

    fn acquire_context(&self) -> EngineResult<Arc<ClContext>> {
        let driver = self.driver.as_ref().ok_or_else(|| {
            EngineError::device_unavailable(BACKEND_NAME, "OpenCL driver library not found")
        })?;
        Ok(Arc::new(ClContext::new(driver.create_context_state()?)))
    }

    fn precision_table(&self) -> &'static PrecisionTable {
        &CL_PRECISIONS
    }

    fn compile_node(
        &self,
        _graph: &OperationGraph,
        node: &OperationNode,
        context: &Arc<ClContext>,
        _options: &OptionMap,
    ) -> EngineResult<ClPrimitive> {
        match node.kind() {
            OpKind::Add | OpKind::Multiply | OpKind::Maximum | OpKind::HSigmoid => Ok(
                ClPrimitive::Elementwise(ClElementwisePrimitive::new(node, Arc::clone(context))),
            ),
            OpKind::SegmentSumGather => Ok(ClPrimitive::SegmentSum(SegmentSumPrimitive::new(
                node,
                &CL_PRECISIONS,
                BACKEND_NAME,
            ))),
            OpKind::Parameter => Err(EngineError::execution(
                "parameters are bound to buffers, not compiled".to_string(),
            )),
        }
    }
}

/// Compiled accelerator primitive; one variant per kernel family.
pub enum ClPrimitive {
    Elementwise(ClElementwisePrimitive),
    SegmentSum(SegmentSumPrimitive<ClContext>),
}

impl PrimitiveInstance for ClPrimitive {
    type Context = ClContext;

    fn node_id(&self) -> NodeId {
        match self {
            ClPrimitive::Elementwise(p) => p.node_id(),
            ClPrimitive::SegmentSum(p) => p.node_id(),
        }
    }

    fn init_supported_descriptors(&mut self) -> EngineResult<()> {
        match self {
            ClPrimitive::Elementwise(p) => p.init_supported_descriptors(),
            ClPrimitive::SegmentSum(p) => p.init_supported_descriptors(),
        }
    }

    fn descriptors(&self) -> Option<&PrimitiveDescriptors> {
        match self {
            ClPrimitive::Elementwise(p) => p.descriptors(),
            ClPrimitive::SegmentSum(p) => p.descriptors(),
        }
    }

    fn is_dynamic(&self) -> bool {
        match self {
            ClPrimitive::Elementwise(p) => p.is_dynamic(),
            ClPrimitive::SegmentSum(p) => p.is_dynamic(),
        }
    }

    fn prepare_params(&mut self, inputs: &[RemoteTensor<ClBuffer>]) -> EngineResult<()> {
        match self {
            ClPrimitive::Elementwise(p) => p.prepare_params(inputs),
            ClPrimitive::SegmentSum(p) => p.prepare_params(inputs),
        }
    }

    fn output_specs(&self) -> EngineResult<Vec<TensorSpec>> {
        match self {
            ClPrimitive::Elementwise(p) => p.output_specs(),
            ClPrimitive::SegmentSum(p) => p.output_specs(),
        }
    }

    fn is_executable(&self, inputs: &[RemoteTensor<ClBuffer>]) -> bool {
        match self {
            ClPrimitive::Elementwise(p) => p.is_executable(inputs),
            ClPrimitive::SegmentSum(p) => p.is_executable(inputs),
        }
    }

    fn execute(
        &mut self,
        context: &ClContext,
        inputs: &[RemoteTensor<ClBuffer>],
        outputs: &[RemoteTensor<ClBuffer>],
    ) -> EngineResult<()> {
        match self {
            ClPrimitive::Elementwise(p) => p.execute(context, inputs, outputs),
            ClPrimitive::SegmentSum(p) => p.execute(context, inputs, outputs),
        }
    }
}
