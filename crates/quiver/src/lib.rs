//! Multi-backend execution engine for neural-network computation graphs.
//!
//! The engine turns a hardware-agnostic [`graph::OperationGraph`] into
//! backend-specific compiled primitives and runs them against host or
//! accelerator memory:
//!
//! ```text
//! model loader (external)
//!         |
//!         | add_parameter / add_node
//!         v
//! OperationGraph  -- shape/type inference at construction
//!         |
//!         | BackendCompiler::compile_node, one primitive per node
//!         v
//! CompiledGraph<B>
//!         |
//!         | BufferPool / RemoteTensor bridge
//!         v
//! PrimitiveInstance::execute  -- typed evaluator or device kernel
//! ```
//!
//! Backend crates implement [`backend::BackendCompiler`] and
//! [`memory::DeviceContext`]; nothing in this crate changes when a new
//! backend family is added.

pub mod backend;
pub mod config;
pub mod element;
pub mod error;
pub mod eval;
pub mod exec;
pub mod graph;
pub mod memory;

pub use element::{Dim, DimSymbol, ElementType, Shape, TensorSpec};
pub use error::{EngineError, EngineResult};
pub use graph::{BroadcastPolicy, NodeId, OperationGraph};
