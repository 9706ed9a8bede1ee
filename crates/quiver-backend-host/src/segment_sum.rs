//! Segment-sum gather over a table selected by offset/index buffers.
//!
//! Port layout: 0 table, 1 indices, 2 offsets, 3 default index (optional),
//! 4 per-sample weights (optional). Segment `i` covers the index range
//! `[offsets[i], offsets[i+1])`; the last segment extends to the end of the
//! indices buffer. An empty segment gathers the configured default row, or
//! contributes nothing.
//!
//! Generic over the device context so accelerator families can serve the
//! operation through mapped memory.

use std::marker::PhantomData;

use quiver::backend::{MemoryLayout, PortDescriptor, PrecisionTable, PrimitiveDescriptors};
use quiver::element::{ElementType, Shape, TensorSpec};
use quiver::error::{EngineError, EngineResult};
use quiver::eval::{
    convert_buffer, evaluate_segment_sum, SegmentSumRequest, TensorView, TensorViewMut,
};
use quiver::graph::{NodeId, OperationNode};
use quiver::memory::{with_mapped, DeviceContext, MapAccess, RemoteTensor};

use crate::elementwise::widened_operand;

const TABLE_PORT: usize = 0;
const INDICES_PORT: usize = 1;
const OFFSETS_PORT: usize = 2;
const DEFAULT_INDEX_PORT: usize = 3;
const WEIGHTS_PORT: usize = 4;

/// Reference binding of one segment-sum gather node.
pub struct SegmentSumPrimitive<C: DeviceContext> {
    node: NodeId,
    declared: ElementType,
    input_count: usize,
    dynamic: bool,
    precisions: &'static PrecisionTable,
    backend: &'static str,
    compute: Option<ElementType>,
    descriptors: Option<PrimitiveDescriptors>,
    // Re-derived from current input memory by prepare_params.
    indices_len: usize,
    offsets_len: usize,
    table_dims: Vec<usize>,
    resolved_outputs: Option<Vec<TensorSpec>>,
    _context: PhantomData<C>,
}

impl<C: DeviceContext> SegmentSumPrimitive<C> {
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
            declared,
            input_count: node.inputs().len(),
            dynamic,
            precisions,
            backend,
            compute: None,
            descriptors: None,
            indices_len: 0,
            offsets_len: 0,
            table_dims: Vec::new(),
            resolved_outputs: None,
            _context: PhantomData,
        }
    }

    fn has_default(&self) -> bool {
        self.input_count > DEFAULT_INDEX_PORT
    }

    fn has_weights(&self) -> bool {
        self.input_count > WEIGHTS_PORT
    }

    pub fn node_id(&self) -> NodeId {
        self.node
    }

    pub fn init_supported_descriptors(&mut self) -> EngineResult<()> {
        if self.descriptors.is_some() {
            return Ok(());
        }
        let compute = self.precisions.resolve(self.backend, self.declared)?;
        let data = PortDescriptor::new(compute, MemoryLayout::RowMajor);
        let index = PortDescriptor::new(ElementType::I32, MemoryLayout::RowMajor);
        let mut inputs = vec![data.clone(), index.clone(), index.clone()];
        if self.has_default() {
            inputs.push(index);
        }
        if self.has_weights() {
            inputs.push(data.clone());
        }
        self.descriptors = Some(PrimitiveDescriptors {
            inputs,
            outputs: vec![data],
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

    /// Re-derives the actual indices/offsets lengths and table extent from
    /// the tensors bound for this invocation.
    pub fn prepare_params(&mut self, inputs: &[RemoteTensor<C::Buffer>]) -> EngineResult<()> {
        let table = required(inputs, TABLE_PORT)?;
        let indices = required(inputs, INDICES_PORT)?;
        let offsets = required(inputs, OFFSETS_PORT)?;

        self.table_dims = table
            .spec()
            .shape
            .static_dims()
            .ok_or_else(|| EngineError::execution("table shape unresolved".to_string()))?;
        self.indices_len = indices.element_count();
        self.offsets_len = offsets.element_count();

        let mut out_dims = vec![self.offsets_len];
        out_dims.extend_from_slice(&self.table_dims[1..]);
        let out_spec = TensorSpec::new(self.declared, Shape::from_static(&out_dims));

        if let Some(descriptors) = self.descriptors.as_mut() {
            for (descriptor, tensor) in descriptors.inputs.iter_mut().zip(inputs) {
                descriptor.byte_len = tensor.spec().byte_len();
            }
            descriptors.outputs[0].byte_len = out_spec.byte_len();
        }
        self.resolved_outputs = Some(vec![out_spec]);
        Ok(())
    }

    pub fn output_specs(&self) -> EngineResult<Vec<TensorSpec>> {
        self.resolved_outputs
            .clone()
            .ok_or_else(|| EngineError::execution("prepare_params has not run".to_string()))
    }

    /// A zero-length indices buffer with no default row configured makes
    /// every segment empty; the instance is skipped rather than failed.
    pub fn is_executable(&self, inputs: &[RemoteTensor<C::Buffer>]) -> bool {
        match inputs.get(INDICES_PORT) {
            Some(indices) => indices.element_count() > 0 || self.has_default(),
            None => false,
        }
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

        let (table_spec, table_bytes) = widened_operand(required(inputs, TABLE_PORT)?, compute)?;
        let indices = read_i32(required(inputs, INDICES_PORT)?)?;
        let offsets = read_i32(required(inputs, OFFSETS_PORT)?)?;
        // Concurrent executions with differing shapes require external
        // serialization; a length drift here means that contract was broken.
        if indices.len() != self.indices_len || offsets.len() != self.offsets_len {
            return Err(EngineError::execution(
                "index buffer lengths changed since prepare_params".to_string(),
            ));
        }

        let default_index = if self.has_default() {
            let values = read_i32(required(inputs, DEFAULT_INDEX_PORT)?)?;
            values.first().copied()
        } else {
            None
        };

        let weighted;
        let weights = if self.has_weights() {
            weighted = widened_operand(required(inputs, WEIGHTS_PORT)?, compute)?;
            Some(TensorView::new(&weighted.0, &weighted.1)?)
        } else {
            None
        };

        let out_declared = outputs
            .first()
            .ok_or_else(|| EngineError::execution("segment sum node lost its output".to_string()))?;
        let out_count = out_declared.element_count();
        let out_spec = TensorSpec::new(compute, out_declared.spec().shape.clone());
        let mut out_bytes = vec![0u8; compute.byte_len(out_count)];
        {
            let request = SegmentSumRequest {
                table: TensorView::new(&table_spec, &table_bytes)?,
                indices: &indices,
                offsets: &offsets,
                default_index,
                weights,
            };
            let mut out_view = TensorViewMut::new(&out_spec, &mut out_bytes)?;
            evaluate_segment_sum(&request, &mut out_view)?;
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

fn required<B: quiver::memory::DeviceBuffer>(
    inputs: &[RemoteTensor<B>],
    port: usize,
) -> EngineResult<&RemoteTensor<B>> {
    inputs
        .get(port)
        .ok_or_else(|| EngineError::execution(format!("segment sum input port {port} missing")))
}

pub(crate) fn read_i32<B: quiver::memory::DeviceBuffer>(
    tensor: &RemoteTensor<B>,
) -> EngineResult<Vec<i32>> {
    let raw = tensor.read_to_vec()?;
    TensorView::new(tensor.spec(), &raw)?.to_i32_vec()
}
