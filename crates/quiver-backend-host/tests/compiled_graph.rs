use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use anyhow::Result;
use half::f16;
use quiver::backend::{BackendCompiler, PrimitiveInstance};
use quiver::config::OptionMap;
use quiver::element::{Dim, DimSymbol, ElementType, Shape, TensorSpec};
use quiver::error::EngineError;
use quiver::exec::CompiledGraph;
use quiver::graph::{BroadcastPolicy, NodeId, OpKind, OperationGraph};
use quiver::memory::{with_mapped, DeviceContext, MapAccess, RemoteTensor};
use quiver_backend_host::{HostBackend, HostBuffer, HostContext, HOST_PRECISIONS};

fn feed_tensor(
    context: &Arc<HostContext>,
    spec: TensorSpec,
    bytes: &[u8],
) -> Result<RemoteTensor<HostBuffer>> {
    let buffer = context.allocate(bytes.len())?;
    with_mapped(buffer.as_ref(), MapAccess::Write, |dst| {
        dst[..bytes.len()].copy_from_slice(bytes);
        Ok(())
    })?;
    Ok(RemoteTensor::new(buffer, spec)?)
}

fn f32_bytes(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn i32_bytes(values: &[i32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn read_f32(tensor: &RemoteTensor<HostBuffer>) -> Result<Vec<f32>> {
    let bytes = tensor.read_to_vec()?;
    Ok(bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

#[test]
fn maximum_with_numpy_broadcast_end_to_end() -> Result<()> {
    let mut graph = OperationGraph::new();
    let a = graph.add_parameter("a", TensorSpec::from_static(ElementType::F32, &[2, 3]));
    let b = graph.add_parameter("b", TensorSpec::from_static(ElementType::F32, &[3]));
    let max = graph.add_node(
        OpKind::Maximum,
        vec![a.into(), b.into()],
        BTreeMap::new(),
        BroadcastPolicy::Numpy,
    )?;
    graph.mark_output(max.into())?;

    let backend = HostBackend::new();
    let mut compiled = CompiledGraph::compile(&backend, Arc::new(graph), &OptionMap::new())?;
    let mut exec = compiled.new_execution(&OptionMap::new())?;

    let context = Arc::clone(compiled.context());
    let mut feeds = HashMap::new();
    feeds.insert(
        a,
        feed_tensor(
            &context,
            TensorSpec::from_static(ElementType::F32, &[2, 3]),
            &f32_bytes(&[1.0, 5.0, 2.0, -1.0, 0.5, 9.0]),
        )?,
    );
    feeds.insert(
        b,
        feed_tensor(
            &context,
            TensorSpec::from_static(ElementType::F32, &[3]),
            &f32_bytes(&[2.0, 2.0, 2.0]),
        )?,
    );

    let outputs = compiled.execute(&mut exec, &feeds)?;
    assert_eq!(outputs.len(), 1);
    assert_eq!(read_f32(&outputs[0])?, vec![2.0, 5.0, 2.0, 2.0, 2.0, 9.0]);
    Ok(())
}

struct SegmentGraph {
    graph: Arc<OperationGraph>,
    table: NodeId,
    indices: NodeId,
    offsets: NodeId,
    default_index: Option<NodeId>,
}

fn segment_graph(with_default: bool, dynamic_lengths: bool) -> Result<SegmentGraph> {
    let mut graph = OperationGraph::new();
    let table = graph.add_parameter("table", TensorSpec::from_static(ElementType::F32, &[4, 1]));
    let index_shape = |symbol: &str, len: usize| {
        if dynamic_lengths {
            Shape::new(vec![Dim::Dynamic(DimSymbol::new(symbol))])
        } else {
            Shape::from_static(&[len])
        }
    };
    let indices = graph.add_parameter(
        "indices",
        TensorSpec::new(ElementType::I32, index_shape("n", 4)),
    );
    let offsets = graph.add_parameter(
        "offsets",
        TensorSpec::new(ElementType::I32, index_shape("b", 2)),
    );
    let mut inputs = vec![table.into(), indices.into(), offsets.into()];
    let default_index = if with_default {
        let node =
            graph.add_parameter("default", TensorSpec::new(ElementType::I32, Shape::scalar()));
        inputs.push(node.into());
        Some(node)
    } else {
        None
    };
    let gather = graph.add_node(
        OpKind::SegmentSumGather,
        inputs,
        BTreeMap::new(),
        BroadcastPolicy::None,
    )?;
    graph.mark_output(gather.into())?;
    Ok(SegmentGraph {
        graph: Arc::new(graph),
        table,
        indices,
        offsets,
        default_index,
    })
}

fn segment_feeds(
    context: &Arc<HostContext>,
    fixture: &SegmentGraph,
    indices: &[i32],
    offsets: &[i32],
    default_row: Option<i32>,
) -> Result<HashMap<NodeId, RemoteTensor<HostBuffer>>> {
    let mut feeds = HashMap::new();
    feeds.insert(
        fixture.table,
        feed_tensor(
            context,
            TensorSpec::from_static(ElementType::F32, &[4, 1]),
            &f32_bytes(&[10.0, 20.0, 30.0, 40.0]),
        )?,
    );
    feeds.insert(
        fixture.indices,
        feed_tensor(
            context,
            TensorSpec::from_static(ElementType::I32, &[indices.len()]),
            &i32_bytes(indices),
        )?,
    );
    feeds.insert(
        fixture.offsets,
        feed_tensor(
            context,
            TensorSpec::from_static(ElementType::I32, &[offsets.len()]),
            &i32_bytes(offsets),
        )?,
    );
    if let (Some(node), Some(row)) = (fixture.default_index, default_row) {
        feeds.insert(
            node,
            feed_tensor(
                context,
                TensorSpec::new(ElementType::I32, Shape::scalar()),
                &i32_bytes(&[row]),
            )?,
        );
    }
    Ok(feeds)
}

#[test]
fn segment_sum_gather_end_to_end() -> Result<()> {
    let fixture = segment_graph(false, false)?;
    let backend = HostBackend::new();
    let mut compiled =
        CompiledGraph::compile(&backend, Arc::clone(&fixture.graph), &OptionMap::new())?;
    let mut exec = compiled.new_execution(&OptionMap::new())?;
    let context = Arc::clone(compiled.context());

    let feeds = segment_feeds(&context, &fixture, &[0, 1, 2, 3], &[0, 2], None)?;
    let outputs = compiled.execute(&mut exec, &feeds)?;
    assert_eq!(read_f32(&outputs[0])?, vec![30.0, 70.0]);
    Ok(())
}

#[test]
fn empty_trailing_segment_uses_the_default_row() -> Result<()> {
    let fixture = segment_graph(true, false)?;
    let backend = HostBackend::new();
    let mut compiled =
        CompiledGraph::compile(&backend, Arc::clone(&fixture.graph), &OptionMap::new())?;
    let mut exec = compiled.new_execution(&OptionMap::new())?;
    let context = Arc::clone(compiled.context());

    let feeds = segment_feeds(&context, &fixture, &[0, 1, 2, 3], &[0, 4], Some(2))?;
    let outputs = compiled.execute(&mut exec, &feeds)?;
    assert_eq!(read_f32(&outputs[0])?, vec![100.0, 30.0]);
    Ok(())
}

#[test]
fn out_of_range_index_aborts_without_output() -> Result<()> {
    let fixture = segment_graph(false, false)?;
    let backend = HostBackend::new();
    let mut compiled =
        CompiledGraph::compile(&backend, Arc::clone(&fixture.graph), &OptionMap::new())?;
    let mut exec = compiled.new_execution(&OptionMap::new())?;
    let context = Arc::clone(compiled.context());

    let feeds = segment_feeds(&context, &fixture, &[0, 1, 9, 3], &[0, 2], None)?;
    let err = compiled.execute(&mut exec, &feeds).unwrap_err();
    assert!(matches!(err, EngineError::Bounds { .. }));
    Ok(())
}

#[test]
fn empty_indices_skip_instead_of_failing() -> Result<()> {
    let fixture = segment_graph(false, true)?;
    let backend = HostBackend::new();
    let mut compiled =
        CompiledGraph::compile(&backend, Arc::clone(&fixture.graph), &OptionMap::new())?;
    let mut exec = compiled.new_execution(&OptionMap::new())?;
    let context = Arc::clone(compiled.context());

    let feeds = segment_feeds(&context, &fixture, &[], &[0, 0], None)?;
    let outputs = compiled.execute(&mut exec, &feeds)?;
    assert_eq!(read_f32(&outputs[0])?, vec![0.0, 0.0]);
    Ok(())
}

#[test]
fn dynamic_lengths_resize_the_output_buffer() -> Result<()> {
    let fixture = segment_graph(false, true)?;
    let backend = HostBackend::new();
    let mut compiled =
        CompiledGraph::compile(&backend, Arc::clone(&fixture.graph), &OptionMap::new())?;
    let mut exec = compiled.new_execution(&OptionMap::new())?;
    let context = Arc::clone(compiled.context());

    let feeds = segment_feeds(&context, &fixture, &[0, 1, 2, 3], &[0, 2], None)?;
    let first = compiled.execute(&mut exec, &feeds)?;
    assert_eq!(read_f32(&first[0])?, vec![30.0, 70.0]);

    // Same compiled instances, new per-invocation lengths.
    let feeds = segment_feeds(&context, &fixture, &[3, 3], &[0], None)?;
    let second = compiled.execute(&mut exec, &feeds)?;
    assert_eq!(read_f32(&second[0])?, vec![80.0]);
    assert!(
        !Arc::ptr_eq(first[0].buffer(), second[0].buffer()),
        "shrinking the segment count must replace the output buffer"
    );

    // And back to the original lengths: the pool allocates afresh again.
    let feeds = segment_feeds(&context, &fixture, &[0, 1, 2, 3], &[0, 2], None)?;
    let third = compiled.execute(&mut exec, &feeds)?;
    assert_eq!(read_f32(&third[0])?, vec![30.0, 70.0]);
    Ok(())
}

#[test]
fn stable_shapes_reuse_the_output_buffer() -> Result<()> {
    let fixture = segment_graph(false, false)?;
    let backend = HostBackend::new();
    let mut compiled =
        CompiledGraph::compile(&backend, Arc::clone(&fixture.graph), &OptionMap::new())?;
    let mut exec = compiled.new_execution(&OptionMap::new())?;
    let context = Arc::clone(compiled.context());

    let feeds = segment_feeds(&context, &fixture, &[0, 1, 2, 3], &[0, 2], None)?;
    let first = compiled.execute(&mut exec, &feeds)?;
    let second = compiled.execute(&mut exec, &feeds)?;
    assert!(
        Arc::ptr_eq(first[0].buffer(), second[0].buffer()),
        "stable shapes must reuse the same allocation"
    );
    Ok(())
}

#[test]
fn f16_promotes_to_f32_compute() -> Result<()> {
    let mut graph = OperationGraph::new();
    let a = graph.add_parameter("a", TensorSpec::from_static(ElementType::F16, &[2]));
    let b = graph.add_parameter("b", TensorSpec::from_static(ElementType::F16, &[2]));
    let max = graph.add_node(
        OpKind::Maximum,
        vec![a.into(), b.into()],
        BTreeMap::new(),
        BroadcastPolicy::None,
    )?;
    graph.mark_output(max.into())?;

    let backend = HostBackend::new();
    let mut compiled = CompiledGraph::compile(&backend, Arc::new(graph), &OptionMap::new())?;
    let mut exec = compiled.new_execution(&OptionMap::new())?;
    let context = Arc::clone(compiled.context());

    let halves = |values: &[f32]| -> Vec<u8> {
        values
            .iter()
            .flat_map(|v| f16::from_f32(*v).to_le_bytes())
            .collect()
    };
    let mut feeds = HashMap::new();
    feeds.insert(
        a,
        feed_tensor(
            &context,
            TensorSpec::from_static(ElementType::F16, &[2]),
            &halves(&[1.5, -2.0]),
        )?,
    );
    feeds.insert(
        b,
        feed_tensor(
            &context,
            TensorSpec::from_static(ElementType::F16, &[2]),
            &halves(&[0.25, 4.0]),
        )?,
    );

    let outputs = compiled.execute(&mut exec, &feeds)?;
    let bytes = outputs[0].read_to_vec()?;
    let values: Vec<f32> = bytes
        .chunks_exact(2)
        .map(|c| f16::from_le_bytes([c[0], c[1]]).to_f32())
        .collect();
    assert_eq!(values, vec![1.5, 4.0]);
    assert_eq!(outputs[0].dtype(), ElementType::F16);
    Ok(())
}

#[test]
fn i16_has_no_host_promotion_rule() -> Result<()> {
    let mut graph = OperationGraph::new();
    let a = graph.add_parameter("a", TensorSpec::from_static(ElementType::I16, &[2]));
    let b = graph.add_parameter("b", TensorSpec::from_static(ElementType::I16, &[2]));
    graph.add_node(
        OpKind::Add,
        vec![a.into(), b.into()],
        BTreeMap::new(),
        BroadcastPolicy::None,
    )?;

    let backend = HostBackend::new();
    let err = CompiledGraph::compile(&backend, Arc::new(graph), &OptionMap::new()).unwrap_err();
    assert!(matches!(err, EngineError::UnsupportedPrecision { .. }));
    Ok(())
}

#[test]
fn descriptor_init_is_idempotent() -> Result<()> {
    let mut graph = OperationGraph::new();
    let a = graph.add_parameter("a", TensorSpec::from_static(ElementType::F16, &[2]));
    let b = graph.add_parameter("b", TensorSpec::from_static(ElementType::F16, &[2]));
    let node = graph.add_node(
        OpKind::Add,
        vec![a.into(), b.into()],
        BTreeMap::new(),
        BroadcastPolicy::None,
    )?;

    let backend = HostBackend::new();
    let context = backend.acquire_context()?;
    let mut primitive =
        backend.compile_node(&graph, graph.node(node)?, &context, &OptionMap::new())?;
    primitive.init_supported_descriptors()?;
    let negotiated = primitive.descriptors().cloned();
    assert!(negotiated.is_some());
    assert_eq!(
        negotiated.as_ref().unwrap().outputs[0].precision,
        ElementType::F32,
        "f16 must widen to f32 on the host"
    );

    primitive.init_supported_descriptors()?;
    assert_eq!(primitive.descriptors().cloned(), negotiated);
    Ok(())
}

#[test]
fn unfed_parameters_fill_deterministically() -> Result<()> {
    let mut graph = OperationGraph::new();
    let a = graph.add_parameter("a", TensorSpec::from_static(ElementType::F32, &[8]));
    let b = graph.add_parameter("b", TensorSpec::from_static(ElementType::F32, &[8]));
    let sum = graph.add_node(
        OpKind::Add,
        vec![a.into(), b.into()],
        BTreeMap::new(),
        BroadcastPolicy::None,
    )?;
    graph.mark_output(sum.into())?;
    let graph = Arc::new(graph);

    let backend = HostBackend::new();
    let run = |graph: &Arc<OperationGraph>| -> Result<Vec<u8>> {
        let mut compiled = CompiledGraph::compile(&backend, Arc::clone(graph), &OptionMap::new())?;
        let mut exec = compiled.new_execution(&OptionMap::new())?;
        let outputs = compiled.execute(&mut exec, &HashMap::new())?;
        Ok(outputs[0].read_to_vec()?)
    };

    assert_eq!(run(&graph)?, run(&graph)?, "benchmark fill must reproduce");
    Ok(())
}

#[test]
fn fed_tensor_must_satisfy_the_parameter_spec() -> Result<()> {
    let mut graph = OperationGraph::new();
    let a = graph.add_parameter("a", TensorSpec::from_static(ElementType::F32, &[2]));
    let b = graph.add_parameter("b", TensorSpec::from_static(ElementType::F32, &[2]));
    let sum = graph.add_node(
        OpKind::Add,
        vec![a.into(), b.into()],
        BTreeMap::new(),
        BroadcastPolicy::None,
    )?;
    graph.mark_output(sum.into())?;

    let backend = HostBackend::new();
    let mut compiled = CompiledGraph::compile(&backend, Arc::new(graph), &OptionMap::new())?;
    let mut exec = compiled.new_execution(&OptionMap::new())?;
    let context = Arc::clone(compiled.context());

    let mut feeds = HashMap::new();
    feeds.insert(
        a,
        feed_tensor(
            &context,
            TensorSpec::from_static(ElementType::F32, &[3]),
            &f32_bytes(&[1.0, 2.0, 3.0]),
        )?,
    );
    let err = compiled.execute(&mut exec, &feeds).unwrap_err();
    assert!(matches!(err, EngineError::Structural(_)));
    Ok(())
}

#[test]
fn host_promotion_table_is_explicit() {
    assert_eq!(
        HOST_PRECISIONS.resolve("host", ElementType::F16).unwrap(),
        ElementType::F32
    );
    assert_eq!(
        HOST_PRECISIONS.resolve("host", ElementType::Bf16).unwrap(),
        ElementType::F32
    );
    assert_eq!(
        HOST_PRECISIONS.resolve("host", ElementType::F32).unwrap(),
        ElementType::F32
    );
    assert!(HOST_PRECISIONS.resolve("host", ElementType::I16).is_err());
    assert!(HOST_PRECISIONS.resolve("host", ElementType::Boolean).is_err());
}
