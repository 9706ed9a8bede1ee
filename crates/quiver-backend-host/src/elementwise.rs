//! Elementwise binary/unary reference primitive dispatching through the
//! typed evaluator.
//!
//! Generic over the device context: the host backend binds it to host
//! memory, and accelerator families reuse it as their mapped fallback for
//! operations without a device kernel.

use std::marker::PhantomData;

use quiver::backend::{MemoryLayout, PortDescriptor, PrecisionTable, PrimitiveDescriptors};
use quiver::element::{ElementType, TensorSpec};
use quiver::error::{EngineError, EngineResult};
use quiver::eval::{
    convert_buffer, evaluate_binary, evaluate_unary, BinaryOp, TensorView, TensorViewMut, UnaryOp,
};
use quiver::graph::{infer, BroadcastPolicy, NodeId, OpKind, OperationNode};
use quiver::memory::{with_mapped, DeviceContext, MapAccess, RemoteTensor};

/// Reference binding of one elementwise node.
pub struct ElementwisePrimitive<C: DeviceContext> {
    node: NodeId,
    kind: OpKind,
    policy: BroadcastPolicy,
    declared: ElementType,
    dynamic: bool,
    precisions: &'static PrecisionTable,
    backend: &'static str,
    compute: Option<ElementType>,
    descriptors: Option<PrimitiveDescriptors>,
    resolved_outputs: Option<Vec<TensorSpec>>,
    _context: PhantomData<C>,
}

impl<C: DeviceContext> ElementwisePrimitive<C> {
    pub fn new(
        node: &OperationNode,
        precisions: &'static PrecisionTable,
        backend: &'static str,
    ) -> Self {
        let declared = node.output_specs()[0].dtype;
        let dynamic = node
            .output_specs()
            .iter()
            .any(|spec| !spec.shape.is_static());
        Self {
            node: node.id(),
            kind: node.kind(),
            policy: node.broadcast(),
            declared,
            dynamic,
            precisions,
            backend,
            compute: None,
            descriptors: None,
            resolved_outputs: None,
            _context: PhantomData,
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node
    }

    /// Negotiated compute precision, available after descriptor init.
    pub fn compute_precision(&self) -> Option<ElementType> {
        self.compute
    }

    pub fn init_supported_descriptors(&mut self) -> EngineResult<()> {
        if self.descriptors.is_some() {
            return Ok(());
        }
        let compute = self.precisions.resolve(self.backend, self.declared)?;
        let port = || PortDescriptor::new(compute, MemoryLayout::RowMajor);
        let input_count = match self.kind {
            OpKind::HSigmoid => 1,
            _ => 2,
        };
        self.descriptors = Some(PrimitiveDescriptors {
            inputs: (0..input_count).map(|_| port()).collect(),
            outputs: vec![port()],
        });
        self.compute = Some(compute);
        Ok(())
    }

    pub fn descriptors(&self) -> Option<&PrimitiveDescriptors> {
        self.descriptors.as_ref()
    }

    pub fn is_dynamic(&self) -> bool {
        self.dynamic
    }

    pub fn prepare_params(&mut self, inputs: &[RemoteTensor<C::Buffer>]) -> EngineResult<()> {
        let concrete: Vec<TensorSpec> = inputs.iter().map(|t| t.spec().clone()).collect();
        let outputs = infer::infer_output_specs(self.kind, &concrete, self.policy)?;
        if let Some(descriptors) = self.descriptors.as_mut() {
            for (descriptor, tensor) in descriptors.inputs.iter_mut().zip(inputs) {
                descriptor.byte_len = tensor.spec().byte_len();
            }
            for (descriptor, spec) in descriptors.outputs.iter_mut().zip(&outputs) {
                descriptor.byte_len = spec.byte_len();
            }
        }
        self.resolved_outputs = Some(outputs);
        Ok(())
    }

    pub fn output_specs(&self) -> EngineResult<Vec<TensorSpec>> {
        self.resolved_outputs
            .clone()
            .ok_or_else(|| EngineError::execution("prepare_params has not run".to_string()))
    }

    pub fn is_executable(&self, _inputs: &[RemoteTensor<C::Buffer>]) -> bool {
        true
    }

    pub fn execute(
        &mut self,
        _context: &C,
        inputs: &[RemoteTensor<C::Buffer>],
        outputs: &[RemoteTensor<C::Buffer>],
    ) -> EngineResult<()> {
        let compute = self
            .compute
            .ok_or_else(|| EngineError::execution("descriptors not initialised".to_string()))?;

        // Widen each operand into the compute precision; buffers keep the
        // declared element type.
        let mut operands = Vec::with_capacity(inputs.len());
        for tensor in inputs {
            operands.push(widened_operand(tensor, compute)?);
        }

        let out_declared = outputs
            .first()
            .ok_or_else(|| EngineError::execution("elementwise node lost its output".to_string()))?;
        let out_count = out_declared.element_count();
        let out_spec = TensorSpec::new(compute, out_declared.spec().shape.clone());
        let mut out_bytes = vec![0u8; compute.byte_len(out_count)];
        {
            let mut out_view = TensorViewMut::new(&out_spec, &mut out_bytes)?;
            match BinaryOp::from_kind(self.kind) {
                Some(op) => {
                    let lhs = TensorView::new(&operands[0].0, &operands[0].1)?;
                    let rhs = TensorView::new(&operands[1].0, &operands[1].1)?;
                    evaluate_binary(op, self.policy, &lhs, &rhs, &mut out_view)?;
                }
                None => {
                    let input = TensorView::new(&operands[0].0, &operands[0].1)?;
                    evaluate_unary(UnaryOp::HSigmoid, &input, &mut out_view)?;
                }
            }
        }

        with_mapped(out_declared.buffer().as_ref(), MapAccess::Write, |bytes| {
            if compute == self.declared {
                bytes[..out_bytes.len()].copy_from_slice(&out_bytes);
                Ok(())
            } else {
                convert_buffer(compute, self.declared, &out_bytes, bytes, out_count)
            }
        })
    }
}

/// Reads a tensor out and widens it to the compute precision when needed.
pub(crate) fn widened_operand<B: quiver::memory::DeviceBuffer>(
    tensor: &RemoteTensor<B>,
    compute: ElementType,
) -> EngineResult<(TensorSpec, Vec<u8>)> {
    let raw = tensor.read_to_vec()?;
    let count = tensor.element_count();
    let spec = TensorSpec::new(compute, tensor.spec().shape.clone());
    let bytes = if tensor.dtype() == compute {
        raw
    } else {
        let mut widened = vec![0u8; compute.byte_len(count)];
        convert_buffer(tensor.dtype(), compute, &raw, &mut widened, count)?;
        widened
    };
    Ok((spec, bytes))
}
