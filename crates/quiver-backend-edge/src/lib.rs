//! Embedded-NPU accelerator backend.
//!
//! Half-precision-centric: f16 and f32 run natively, everything else widens
//! per the promotion table. Data ports use the NPU's channel-blocked layout
//! unless the compile-time reorder switch keeps them row-major. The runtime
//! library is loaded dynamically; compiling against an absent runtime fails
//! with `DeviceUnavailable`.

mod options;
mod runtime;

use std::sync::Arc;

use quiver::backend::{
    BackendCompiler, MemoryLayout, PrecisionTable, PrimitiveDescriptors, PrimitiveInstance,
};
use quiver::config::OptionMap;
use quiver::element::{ElementType, TensorSpec};
use quiver::error::{EngineError, EngineResult};
use quiver::graph::{NodeId, OpKind, OperationGraph, OperationNode};
use quiver::memory::RemoteTensor;
use quiver_backend_host::{ElementwisePrimitive, SegmentSumPrimitive};
use tracing::warn;

pub use options::DisableLayoutReorderOption;
pub use runtime::{EdgeBuffer, EdgeContext, EdgeRuntime};

pub const BACKEND_NAME: &str = "edge";

/// Width of the NPU's native channel blocking.
const CHANNEL_BLOCK: usize = 16;

/// The NPU computes in f16/f32/i32; every narrower type widens and 64-bit
/// types are rejected outright.
pub static EDGE_PRECISIONS: PrecisionTable = PrecisionTable::new(
    &[ElementType::F16, ElementType::F32, ElementType::I32],
    &[
        (ElementType::Bf16, ElementType::F32),
        (ElementType::I8, ElementType::I32),
        (ElementType::U8, ElementType::I32),
        (ElementType::I16, ElementType::I32),
        (ElementType::U16, ElementType::I32),
    ],
);

/// Compiler for the edge NPU family.
pub struct EdgeBackend {
    runtime: Option<Arc<EdgeRuntime>>,
}

impl EdgeBackend {
    /// Probes the runtime library once; an absent runtime leaves the
    /// backend constructed but unavailable.
    pub fn new() -> Self {
        let runtime = match EdgeRuntime::load() {
            Ok(runtime) => Some(runtime),
            Err(err) => {
                warn!("edge runtime not loaded: {err}");
                None
            }
        };
        Self { runtime }
    }
}

impl Default for EdgeBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl BackendCompiler for EdgeBackend {
    type Context = EdgeContext;
    type Primitive = EdgePrimitive;

    fn backend_name(&self) -> &'static str {
        BACKEND_NAME
    }

    fn is_available(&self) -> bool {
        self.runtime.is_some()
    }

    fn acquire_context(&self) -> EngineResult<Arc<EdgeContext>> {
        let runtime = self.runtime.as_ref().ok_or_else(|| {
            EngineError::device_unavailable(BACKEND_NAME, "edge runtime library not found")
        })?;
        Ok(Arc::new(EdgeContext::open(Arc::clone(runtime))?))
    }

    fn precision_table(&self) -> &'static PrecisionTable {
        &EDGE_PRECISIONS
    }

    fn compile_node(
        &self,
        _graph: &OperationGraph,
        node: &OperationNode,
        _context: &Arc<EdgeContext>,
        options: &OptionMap,
    ) -> EngineResult<EdgePrimitive> {
        let data_layout = data_layout_for(options)?;
        let inner = match node.kind() {
            OpKind::Add | OpKind::Multiply | OpKind::Maximum | OpKind::HSigmoid => {
                EdgeKernel::Elementwise(ElementwisePrimitive::new(
                    node,
                    &EDGE_PRECISIONS,
                    BACKEND_NAME,
                ))
            }
            OpKind::SegmentSumGather => EdgeKernel::SegmentSum(SegmentSumPrimitive::new(
                node,
                &EDGE_PRECISIONS,
                BACKEND_NAME,
            )),
            OpKind::Parameter => {
                return Err(EngineError::execution(
                    "parameters are bound to buffers, not compiled".to_string(),
                ))
            }
        };
        Ok(EdgePrimitive {
            inner,
            data_layout,
            descriptors: None,
        })
    }
}

/// Layout negotiated for float data ports under the given options.
pub fn data_layout_for(options: &OptionMap) -> EngineResult<MemoryLayout> {
    Ok(if options.get::<DisableLayoutReorderOption>()? {
        MemoryLayout::RowMajor
    } else {
        MemoryLayout::ChannelBlocked {
            block: CHANNEL_BLOCK,
        }
    })
}

enum EdgeKernel {
    Elementwise(ElementwisePrimitive<EdgeContext>),
    SegmentSum(SegmentSumPrimitive<EdgeContext>),
}

/// Compiled edge primitive: the mapped-memory kernel plus the NPU layout
/// negotiated for its data ports.
pub struct EdgePrimitive {
    inner: EdgeKernel,
    data_layout: MemoryLayout,
    descriptors: Option<PrimitiveDescriptors>,
}

impl EdgePrimitive {
    pub fn data_layout(&self) -> MemoryLayout {
        self.data_layout
    }

    fn inner_descriptors(&self) -> Option<&PrimitiveDescriptors> {
        match &self.inner {
            EdgeKernel::Elementwise(p) => p.descriptors(),
            EdgeKernel::SegmentSum(p) => p.descriptors(),
        }
    }
}

impl PrimitiveInstance for EdgePrimitive {
    type Context = EdgeContext;

    fn node_id(&self) -> NodeId {
        match &self.inner {
            EdgeKernel::Elementwise(p) => p.node_id(),
            EdgeKernel::SegmentSum(p) => p.node_id(),
        }
    }

    fn init_supported_descriptors(&mut self) -> EngineResult<()> {
        if self.descriptors.is_some() {
            return Ok(());
        }
        match &mut self.inner {
            EdgeKernel::Elementwise(p) => p.init_supported_descriptors()?,
            EdgeKernel::SegmentSum(p) => p.init_supported_descriptors()?,
        }
        // Float data ports take the negotiated NPU layout; integer index
        // ports stay row-major.
        let mut descriptors = self
            .inner_descriptors()
            .cloned()
            .ok_or_else(|| EngineError::execution("descriptor negotiation failed".to_string()))?;
        for descriptor in descriptors
            .inputs
            .iter_mut()
            .chain(descriptors.outputs.iter_mut())
        {
            if descriptor.precision.is_float() {
                descriptor.layout = self.data_layout;
            }
        }
        self.descriptors = Some(descriptors);
        Ok(())
    }

    fn descriptors(&self) -> Option<&PrimitiveDescriptors> {
        self.descriptors.as_ref()
    }

    fn is_dynamic(&self) -> bool {
        match &self.inner {
            EdgeKernel::Elementwise(p) => p.is_dynamic(),
            EdgeKernel::SegmentSum(p) => p.is_dynamic(),
        }
    }

    fn prepare_params(&mut self, inputs: &[RemoteTensor<EdgeBuffer>]) -> EngineResult<()> {
        match &mut self.inner {
            EdgeKernel::Elementwise(p) => p.prepare_params(inputs)?,
            EdgeKernel::SegmentSum(p) => p.prepare_params(inputs)?,
        }
        let sizes = self.inner_descriptors_sizes();
        if let (Some(descriptors), Some(sizes)) = (self.descriptors.as_mut(), sizes) {
            for (descriptor, byte_len) in descriptors
                .inputs
                .iter_mut()
                .chain(descriptors.outputs.iter_mut())
                .zip(sizes)
            {
                descriptor.byte_len = byte_len;
            }
        }
        Ok(())
    }

    fn output_specs(&self) -> EngineResult<Vec<TensorSpec>> {
        match &self.inner {
            EdgeKernel::Elementwise(p) => p.output_specs(),
            EdgeKernel::SegmentSum(p) => p.output_specs(),
        }
    }

    fn is_executable(&self, inputs: &[RemoteTensor<EdgeBuffer>]) -> bool {
        match &self.inner {
            EdgeKernel::Elementwise(p) => p.is_executable(inputs),
            EdgeKernel::SegmentSum(p) => p.is_executable(inputs),
        }
    }

    fn execute(
        &mut self,
        context: &EdgeContext,
        inputs: &[RemoteTensor<EdgeBuffer>],
        outputs: &[RemoteTensor<EdgeBuffer>],
    ) -> EngineResult<()> {
        match &mut self.inner {
            EdgeKernel::Elementwise(p) => p.execute(context, inputs, outputs),
            EdgeKernel::SegmentSum(p) => p.execute(context, inputs, outputs),
        }
    }
}

impl EdgePrimitive {
    fn inner_descriptors_sizes(&self) -> Option<Vec<Option<usize>>> {
        self.inner_descriptors().map(|descriptors| {
            descriptors
                .inputs
                .iter()
                .chain(descriptors.outputs.iter())
                .map(|descriptor| descriptor.byte_len)
                .collect()
        })
    }
}
