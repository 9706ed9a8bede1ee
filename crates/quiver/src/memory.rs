//! Memory/tensor bridge between compiled primitives and device buffers.
//!
//! Every buffer and kernel call goes through an explicit [`DeviceContext`];
//! there is no process-wide device state. Reads and writes of
//! device-resident memory happen inside a scoped map that unmaps on every
//! exit path, including failure.

use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::Arc;

use tracing::{debug, trace};

use crate::element::{ElementType, TensorSpec};
use crate::error::{EngineError, EngineResult, StructuralCode};
use crate::graph::NodeId;

/// Access requested when mapping a buffer into host-visible memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapAccess {
    Read,
    Write,
    ReadWrite,
}

/// Where a buffer's bytes live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Residency {
    Host,
    Accelerator,
}

/// Backend-native buffer handle.
///
/// `map` blocks until the bytes are host-visible and returns a pointer valid
/// until the matching `unmap`. Implementations must reject a second map
/// while one is outstanding; the engine only maps through [`ScopedMap`].
pub trait DeviceBuffer: Send + Sync {
    fn byte_len(&self) -> usize;
    fn residency(&self) -> Residency;
    fn map(&self, access: MapAccess) -> EngineResult<NonNull<u8>>;
    fn unmap(&self) -> EngineResult<()>;
}

/// Explicit device context threaded through every buffer and kernel call.
pub trait DeviceContext: Send + Sync + 'static {
    type Buffer: DeviceBuffer + 'static;

    fn backend_name(&self) -> &str;

    fn allocate(&self, byte_len: usize) -> EngineResult<Arc<Self::Buffer>>;

    /// Blocks until device-side work submitted so far has completed. The
    /// single suspension point before host code reads outputs.
    fn synchronize(&self) -> EngineResult<()>;
}

/// RAII mapping of a device buffer; the unmap runs unconditionally on drop.
pub struct ScopedMap<'a> {
    buffer: &'a dyn DeviceBuffer,
    ptr: NonNull<u8>,
    len: usize,
}

impl<'a> ScopedMap<'a> {
    pub fn new(buffer: &'a dyn DeviceBuffer, access: MapAccess) -> EngineResult<Self> {
        let ptr = buffer.map(access)?;
        Ok(Self {
            buffer,
            ptr,
            len: buffer.byte_len(),
        })
    }

    pub fn bytes(&self) -> &[u8] {
        // SAFETY: The pointer stays valid until unmap, which only happens in
        // drop, and the buffer reported this length at map time.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: As above; &mut self guarantees exclusive access to the view.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for ScopedMap<'_> {
    fn drop(&mut self) {
        // An unmap failure cannot be surfaced from drop; the buffer is left
        // for its owner to release.
        let _ = self.buffer.unmap();
    }
}

/// Runs `f` over the mapped bytes of `buffer`, unmapping on every exit path.
pub fn with_mapped<R>(
    buffer: &dyn DeviceBuffer,
    access: MapAccess,
    f: impl FnOnce(&mut [u8]) -> EngineResult<R>,
) -> EngineResult<R> {
    let mut mapped = ScopedMap::new(buffer, access)?;
    f(mapped.bytes_mut())
}

/// Identifies the buffer binding for one port of one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortKey {
    pub node: NodeId,
    pub port: usize,
}

impl PortKey {
    pub fn new(node: NodeId, port: usize) -> Self {
        Self { node, port }
    }
}

/// Lazily allocates buffers per port and reuses them while sizes are stable.
///
/// Reallocation on every stable-shape invocation would be prohibitively
/// expensive for accelerator memory, so a binding is only replaced when its
/// byte length or element type changes; the old buffer is released then.
pub struct BufferPool<C: DeviceContext> {
    context: Arc<C>,
    bindings: HashMap<PortKey, (ElementType, Arc<C::Buffer>)>,
}

impl<C: DeviceContext> BufferPool<C> {
    pub fn new(context: Arc<C>) -> Self {
        Self {
            context,
            bindings: HashMap::new(),
        }
    }

    pub fn context(&self) -> &Arc<C> {
        &self.context
    }

    /// Returns a buffer of at least `byte_len` bytes bound to `key`.
    pub fn acquire(
        &mut self,
        key: PortKey,
        byte_len: usize,
        dtype: ElementType,
    ) -> EngineResult<Arc<C::Buffer>> {
        if let Some((bound_dtype, existing)) = self.bindings.get(&key) {
            if *bound_dtype == dtype && existing.byte_len() == byte_len {
                trace!(node = key.node.0, port = key.port, byte_len, "buffer reused");
                return Ok(Arc::clone(existing));
            }
            debug!(
                node = key.node.0,
                port = key.port,
                old = existing.byte_len(),
                new = byte_len,
                "buffer released on size change"
            );
            self.bindings.remove(&key);
        }
        let buffer = self.context.allocate(byte_len)?;
        self.bindings.insert(key, (dtype, Arc::clone(&buffer)));
        Ok(buffer)
    }

    /// Drops every binding; buffers die with their last tensor reference.
    pub fn clear(&mut self) {
        self.bindings.clear();
    }
}

/// A `(buffer handle, shape, element type)` view that aliases, never copies,
/// the underlying buffer. The buffer must outlive the tensor's use; wrapping
/// an externally owned handle leaves ownership with the caller.
pub struct RemoteTensor<B: DeviceBuffer> {
    buffer: Arc<B>,
    spec: TensorSpec,
}

impl<B: DeviceBuffer> std::fmt::Debug for RemoteTensor<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteTensor").field("spec", &self.spec).finish()
    }
}

impl<B: DeviceBuffer> Clone for RemoteTensor<B> {
    fn clone(&self) -> Self {
        Self {
            buffer: Arc::clone(&self.buffer),
            spec: self.spec.clone(),
        }
    }
}

impl<B: DeviceBuffer> RemoteTensor<B> {
    /// Wraps a buffer handle with shape/type metadata. The spec must be
    /// fully static and fit within the buffer.
    pub fn new(buffer: Arc<B>, spec: TensorSpec) -> EngineResult<Self> {
        let needed = spec.byte_len().ok_or_else(|| {
            EngineError::structural(
                StructuralCode::DynamicDimensionUnresolved,
                format!("remote tensor spec {spec:?} must be static"),
            )
        })?;
        if buffer.byte_len() < needed {
            return Err(EngineError::execution(format!(
                "buffer of {} bytes cannot hold {spec:?} ({needed} bytes)",
                buffer.byte_len()
            )));
        }
        Ok(Self { buffer, spec })
    }

    pub fn spec(&self) -> &TensorSpec {
        &self.spec
    }

    pub fn dtype(&self) -> ElementType {
        self.spec.dtype
    }

    pub fn element_count(&self) -> usize {
        self.spec.element_count().unwrap_or(0)
    }

    pub fn buffer(&self) -> &Arc<B> {
        &self.buffer
    }

    /// Reads the tensor's bytes out through a scoped map.
    pub fn read_to_vec(&self) -> EngineResult<Vec<u8>> {
        let len = self.spec.byte_len().unwrap_or(0);
        with_mapped(self.buffer.as_ref(), MapAccess::Read, |bytes| {
            Ok(bytes[..len].to_vec())
        })
    }
}
