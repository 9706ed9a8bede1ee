//! Elementwise primitive with a generated device kernel.
//!
//! The kernel source is built per (operation, precision) pair and compiled
//! at descriptor-init time; the kernel handle lives as long as the
//! primitive. Invocations that the 1-D kernel cannot serve (broadcast
//! shapes, promoted precision) fall back to the reference primitive over
//! mapped memory.

use std::sync::Arc;

use quiver::backend::{PrimitiveDescriptors, PrimitiveInstance};
use quiver::element::{ElementType, TensorSpec};
use quiver::error::{EngineError, EngineResult};
use quiver::graph::{NodeId, OpKind, OperationNode};
use quiver::memory::RemoteTensor;
use quiver_backend_host::ElementwisePrimitive;
use tracing::trace;

use crate::context::{ClBuffer, ClContext};
use crate::driver::ClContextState;
use crate::{BACKEND_NAME, CL_PRECISIONS};

/// Compiled program/kernel pair released with the primitive.
struct KernelHandle {
    state: Arc<ClContextState>,
    program: usize,
    kernel: usize,
}

impl Drop for KernelHandle {
    fn drop(&mut self) {
        self.state.driver.release_kernel(self.kernel);
        self.state.driver.release_program(self.program);
    }
}

/// Accelerator binding of one elementwise node.
pub struct ClElementwisePrimitive {
    kind: OpKind,
    declared: ElementType,
    context: Arc<ClContext>,
    reference: ElementwisePrimitive<ClContext>,
    kernel: Option<KernelHandle>,
}

impl ClElementwisePrimitive {
    pub fn new(node: &OperationNode, context: Arc<ClContext>) -> Self {
        Self {
            kind: node.kind(),
            declared: node.output_specs()[0].dtype,
            context,
            reference: ElementwisePrimitive::new(node, &CL_PRECISIONS, BACKEND_NAME),
            kernel: None,
        }
    }

    // The 1-D kernel indexes all ports with one global id; any broadcast or
    // boundary conversion goes through the reference path instead.
    fn device_serves(
        &self,
        inputs: &[RemoteTensor<ClBuffer>],
        output: &RemoteTensor<ClBuffer>,
    ) -> bool {
        self.kernel.is_some()
            && self.reference.compute_precision() == Some(self.declared)
            && inputs
                .iter()
                .all(|tensor| tensor.spec().shape == output.spec().shape)
    }
}

impl PrimitiveInstance for ClElementwisePrimitive {
    type Context = ClContext;

    fn node_id(&self) -> NodeId {
        self.reference.node_id()
    }

    fn init_supported_descriptors(&mut self) -> EngineResult<()> {
        self.reference.init_supported_descriptors()?;
        if self.kernel.is_some() {
            return Ok(());
        }
        // A promoted precision means boundary conversion on every port; the
        // generated kernel only covers the native-precision path.
        if self.reference.compute_precision() != Some(self.declared) {
            return Ok(());
        }
        let source = kernel_source(self.kind, self.declared)?;
        let state = Arc::clone(&self.context.state);
        let program = state
            .driver
            .build_program(state.context, state.device, &source)?;
        let kernel = match state
            .driver
            .create_kernel(program, &kernel_name(self.kind, self.declared))
        {
            Ok(kernel) => kernel,
            Err(err) => {
                state.driver.release_program(program);
                return Err(err);
            }
        };
        self.kernel = Some(KernelHandle {
            state,
            program,
            kernel,
        });
        Ok(())
    }

    fn descriptors(&self) -> Option<&PrimitiveDescriptors> {
        self.reference.descriptors()
    }

    fn is_dynamic(&self) -> bool {
        self.reference.is_dynamic()
    }

    fn prepare_params(&mut self, inputs: &[RemoteTensor<ClBuffer>]) -> EngineResult<()> {
        self.reference.prepare_params(inputs)
    }

    fn output_specs(&self) -> EngineResult<Vec<TensorSpec>> {
        self.reference.output_specs()
    }

    fn is_executable(&self, inputs: &[RemoteTensor<ClBuffer>]) -> bool {
        self.reference.is_executable(inputs)
    }

    fn execute(
        &mut self,
        context: &ClContext,
        inputs: &[RemoteTensor<ClBuffer>],
        outputs: &[RemoteTensor<ClBuffer>],
    ) -> EngineResult<()> {
        let output = outputs
            .first()
            .ok_or_else(|| EngineError::execution("elementwise node lost its output".to_string()))?;
        if !self.device_serves(inputs, output) {
            trace!(node = self.node_id().0, "serving elementwise through mapped reference path");
            return self.reference.execute(context, inputs, outputs);
        }
        let handle = self
            .kernel
            .as_ref()
            .ok_or_else(|| EngineError::execution("kernel handle missing".to_string()))?;
        let driver = &handle.state.driver;
        for (index, tensor) in inputs.iter().enumerate() {
            driver.set_kernel_arg_mem(handle.kernel, index as u32, tensor.buffer().mem())?;
        }
        driver.set_kernel_arg_mem(handle.kernel, inputs.len() as u32, output.buffer().mem())?;
        // Enqueued asynchronously; the graph-level synchronize observes
        // completion before any host read.
        driver.enqueue_kernel(
            handle.state.queue,
            handle.kernel,
            output.element_count().max(1),
        )
    }
}

fn c_type(dtype: ElementType) -> EngineResult<&'static str> {
    match dtype {
        ElementType::F32 => Ok("float"),
        ElementType::F16 => Ok("half"),
        ElementType::I64 => Ok("long"),
        ElementType::I32 => Ok("int"),
        ElementType::U64 => Ok("ulong"),
        ElementType::U32 => Ok("uint"),
        ElementType::I8 => Ok("char"),
        ElementType::U8 => Ok("uchar"),
        other => Err(EngineError::unsupported_precision(BACKEND_NAME, other)),
    }
}

pub(crate) fn kernel_name(kind: OpKind, dtype: ElementType) -> String {
    format!("eltwise_{}_{}", kind.name().to_lowercase(), dtype.name())
}

pub(crate) fn kernel_source(kind: OpKind, dtype: ElementType) -> EngineResult<String> {
    let ty = c_type(dtype)?;
    let name = kernel_name(kind, dtype);
    let pragma = if dtype == ElementType::F16 {
        "#pragma OPENCL EXTENSION cl_khr_fp16 : enable\n\n"
    } else {
        ""
    };
    let source = match kind {
        OpKind::Add | OpKind::Multiply | OpKind::Maximum => {
            let expr = match (kind, dtype.is_float()) {
                (OpKind::Add, _) => "a[i] + b[i]".to_string(),
                (OpKind::Multiply, _) => "a[i] * b[i]".to_string(),
                (OpKind::Maximum, true) => "fmax(a[i], b[i])".to_string(),
                (OpKind::Maximum, false) => "max(a[i], b[i])".to_string(),
                _ => unreachable!(),
            };
            format!(
                "{pragma}__kernel void {name}(__global const {ty}* a, __global const {ty}* b, __global {ty}* y) {{\n\
                 \x20   size_t i = get_global_id(0);\n\
                 \x20   y[i] = {expr};\n\
                 }}\n"
            )
        }
        OpKind::HSigmoid => format!(
            "{pragma}__kernel void {name}(__global const {ty}* x, __global {ty}* y) {{\n\
             \x20   size_t i = get_global_id(0);\n\
             \x20   y[i] = ({ty})(clamp((float)x[i] + 3.0f, 0.0f, 6.0f) / 6.0f);\n\
             }}\n"
        ),
        other => {
            return Err(EngineError::execution(format!(
                "no generated kernel for {}",
                other.name()
            )))
        }
    };
    Ok(source)
}
