//! Compiling a validated graph for one backend and executing it.
//!
//! Node execution order follows the DAG's dependency (insertion) order; the
//! engine mandates nothing else about scheduling. Buffer reuse lives in the
//! per-execution [`ExecutionContext`] and must not be shared across
//! concurrently in-flight executions.

use std::collections::HashMap;

use std::sync::Arc;

use tracing::{debug, trace};

use crate::backend::{BackendCompiler, PrimitiveInstance};
use crate::config::{FillSeedOption, OptionMap};
use crate::element::{Dim, TensorSpec};
use crate::error::{EngineError, EngineResult, StructuralCode};
use crate::eval::fill_deterministic;
use crate::graph::{NodeId, OpKind, OperationGraph};
use crate::memory::{with_mapped, BufferPool, DeviceContext, MapAccess, PortKey, RemoteTensor};

/// Per-execution state: the buffer pool and the fill seed for unfed
/// parameters. Created on first need, destroyed with the execution scope.
pub struct ExecutionContext<C: DeviceContext> {
    pool: BufferPool<C>,
    fill_seed: u64,
}

impl<C: DeviceContext> ExecutionContext<C> {
    pub fn new(context: Arc<C>, options: &OptionMap) -> EngineResult<Self> {
        Ok(Self {
            pool: BufferPool::new(context),
            fill_seed: options.get::<FillSeedOption>()?,
        })
    }

    pub fn pool(&self) -> &BufferPool<C> {
        &self.pool
    }
}

type BufferOf<B> = <<B as BackendCompiler>::Context as DeviceContext>::Buffer;

/// One compiled primitive per non-parameter node, bound to one backend for
/// the compiled model's lifetime.
pub struct CompiledGraph<B: BackendCompiler> {
    graph: Arc<OperationGraph>,
    context: Arc<B::Context>,
    primitives: Vec<B::Primitive>,
    prepared: Vec<bool>,
}

impl<B: BackendCompiler> std::fmt::Debug for CompiledGraph<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledGraph")
            .field("primitives", &self.primitives.len())
            .field("prepared", &self.prepared)
            .finish()
    }
}

impl<B: BackendCompiler> CompiledGraph<B> {
    /// Compiles every node and negotiates descriptors up front. Fails with
    /// `DeviceUnavailable` when the backend's runtime is absent from this
    /// build.
    pub fn compile(
        backend: &B,
        graph: Arc<OperationGraph>,
        options: &OptionMap,
    ) -> EngineResult<Self> {
        if !backend.is_available() {
            return Err(EngineError::device_unavailable(
                backend.backend_name(),
                "runtime support is not present in the running build",
            ));
        }
        let context = backend.acquire_context()?;
        let mut primitives = Vec::new();
        for node in graph.nodes() {
            if node.kind() == OpKind::Parameter {
                continue;
            }
            let mut primitive = backend.compile_node(&graph, node, &context, options)?;
            primitive.init_supported_descriptors()?;
            primitives.push(primitive);
        }
        debug!(
            backend = backend.backend_name(),
            nodes = primitives.len(),
            "graph compiled"
        );
        let prepared = vec![false; primitives.len()];
        Ok(Self {
            graph,
            context,
            primitives,
            prepared,
        })
    }

    pub fn context(&self) -> &Arc<B::Context> {
        &self.context
    }

    pub fn graph(&self) -> &Arc<OperationGraph> {
        &self.graph
    }

    /// Creates a fresh execution scope against this compiled graph's
    /// context.
    pub fn new_execution(&self, options: &OptionMap) -> EngineResult<ExecutionContext<B::Context>> {
        ExecutionContext::new(Arc::clone(&self.context), options)
    }

    /// Runs the graph once. Parameters present in `feeds` alias the
    /// caller's tensors; the rest are pool-allocated and populated with the
    /// deterministic fill. Returns the marked graph outputs after the
    /// blocking device wait.
    pub fn execute(
        &mut self,
        exec: &mut ExecutionContext<B::Context>,
        feeds: &HashMap<NodeId, RemoteTensor<BufferOf<B>>>,
    ) -> EngineResult<Vec<RemoteTensor<BufferOf<B>>>> {
        let mut values: HashMap<PortKey, RemoteTensor<BufferOf<B>>> = HashMap::new();

        for node in self.graph.nodes() {
            if node.kind() != OpKind::Parameter {
                continue;
            }
            let declared = &node.output_specs()[0];
            let key = PortKey::new(node.id(), 0);
            match feeds.get(&node.id()) {
                Some(fed) => {
                    check_feed(declared, fed.spec())?;
                    values.insert(key, fed.clone());
                }
                None => {
                    let byte_len = declared.byte_len().ok_or_else(|| {
                        EngineError::structural(
                            StructuralCode::DynamicDimensionUnresolved,
                            format!(
                                "parameter {} carries symbolic dimensions and must be fed",
                                node.id().0
                            ),
                        )
                    })?;
                    let buffer = exec.pool.acquire(key, byte_len, declared.dtype)?;
                    // Seed varies per parameter so two inputs of the same
                    // spec do not receive identical data.
                    let seed = exec.fill_seed.wrapping_add(u64::from(node.id().0));
                    with_mapped(buffer.as_ref(), MapAccess::Write, |bytes| {
                        fill_deterministic(declared.dtype, seed, bytes)
                    })?;
                    values.insert(key, RemoteTensor::new(buffer, declared.clone())?);
                }
            }
        }

        for (primitive, prepared) in self.primitives.iter_mut().zip(self.prepared.iter_mut()) {
            let node = self.graph.node(primitive.node_id())?;
            let mut inputs = Vec::with_capacity(node.inputs().len());
            for edge in node.inputs() {
                let tensor = values
                    .get(&PortKey::new(edge.producer, edge.output))
                    .cloned()
                    .ok_or_else(|| {
                        EngineError::execution(format!(
                            "value for node {} output {} not produced yet",
                            edge.producer.0, edge.output
                        ))
                    })?;
                inputs.push(tensor);
            }

            // Dynamic instances re-derive sizes from current memory before
            // every execution; static ones only on their first run.
            if primitive.is_dynamic() || !*prepared {
                primitive.prepare_params(&inputs)?;
                *prepared = true;
            }

            let out_specs = primitive.output_specs()?;
            let mut outputs = Vec::with_capacity(out_specs.len());
            for (port, spec) in out_specs.iter().enumerate() {
                let byte_len = spec.byte_len().ok_or_else(|| {
                    EngineError::execution(format!(
                        "node {} output {port} still symbolic after prepare_params",
                        node.id().0
                    ))
                })?;
                let buffer = exec
                    .pool
                    .acquire(PortKey::new(node.id(), port), byte_len, spec.dtype)?;
                outputs.push(RemoteTensor::new(buffer, spec.clone())?);
            }

            if primitive.is_executable(&inputs) {
                primitive.execute(self.context.as_ref(), &inputs, &outputs)?;
            } else {
                trace!(node = node.id().0, "primitive skipped, zero-filling outputs");
                for tensor in &outputs {
                    with_mapped(tensor.buffer().as_ref(), MapAccess::Write, |bytes| {
                        bytes.fill(0);
                        Ok(())
                    })?;
                }
            }

            for (port, tensor) in outputs.into_iter().enumerate() {
                values.insert(PortKey::new(node.id(), port), tensor);
            }
        }

        // The single suspension point: wait for enqueued device work before
        // host code reads outputs.
        self.context.synchronize()?;

        let mut results = Vec::with_capacity(self.graph.outputs().len());
        for edge in self.graph.outputs() {
            let tensor = values
                .get(&PortKey::new(edge.producer, edge.output))
                .cloned()
                .ok_or_else(|| {
                    EngineError::execution(format!(
                        "marked output of node {} was never produced",
                        edge.producer.0
                    ))
                })?;
            results.push(tensor);
        }
        Ok(results)
    }
}

// A fed tensor must match the declared spec exactly on static axes; symbolic
// axes accept any concrete extent.
fn check_feed(declared: &TensorSpec, concrete: &TensorSpec) -> EngineResult<()> {
    let mismatch = || {
        EngineError::structural(
            StructuralCode::DTypeMismatch,
            format!("fed tensor {concrete:?} does not satisfy parameter {declared:?}"),
        )
    };
    if declared.dtype != concrete.dtype
        || declared.shape.rank() != concrete.shape.rank()
        || !concrete.shape.is_static()
    {
        return Err(mismatch());
    }
    for (want, got) in declared.shape.dims().iter().zip(concrete.shape.dims()) {
        match (want, got) {
            (Dim::Static(want), Dim::Static(got)) if want != got => return Err(mismatch()),
            _ => {}
        }
    }
    Ok(())
}
