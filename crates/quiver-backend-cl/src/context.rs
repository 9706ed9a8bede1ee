//! Device-resident buffers and the explicit context owning them.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use quiver::error::{EngineError, EngineResult};
use quiver::memory::{DeviceBuffer, DeviceContext, MapAccess, Residency};
use tracing::trace;

use crate::driver::ClContextState;
use crate::BACKEND_NAME;

/// Accelerator buffer reached through blocking map/unmap.
///
/// `owned` is false for externally supplied handles wrapped zero-copy; those
/// are never released here and the caller's allocation must outlive every
/// use of the tensor built over it.
pub struct ClBuffer {
    state: Arc<ClContextState>,
    mem: usize,
    byte_len: usize,
    owned: bool,
    // Host pointer of the outstanding mapping, 0 when unmapped.
    mapped: AtomicUsize,
}

impl ClBuffer {
    pub(crate) fn new(state: Arc<ClContextState>, byte_len: usize) -> EngineResult<Self> {
        let mem = state.driver.create_buffer(state.context, byte_len)?;
        Ok(Self {
            state,
            mem,
            byte_len,
            owned: true,
            mapped: AtomicUsize::new(0),
        })
    }

    /// Wraps a caller-owned `cl_mem` handle without taking ownership.
    pub fn from_external(context: &ClContext, mem: usize, byte_len: usize) -> Self {
        Self {
            state: Arc::clone(&context.state),
            mem,
            byte_len,
            owned: false,
            mapped: AtomicUsize::new(0),
        }
    }

    pub(crate) fn mem(&self) -> usize {
        self.mem
    }
}

impl Drop for ClBuffer {
    fn drop(&mut self) {
        if self.owned {
            self.state.driver.release_buffer(self.mem);
        }
    }
}

impl DeviceBuffer for ClBuffer {
    fn byte_len(&self) -> usize {
        self.byte_len
    }

    fn residency(&self) -> Residency {
        Residency::Accelerator
    }

    fn map(&self, access: MapAccess) -> EngineResult<NonNull<u8>> {
        if self.mapped.load(Ordering::Acquire) != 0 {
            return Err(EngineError::execution(
                "device buffer is already mapped".to_string(),
            ));
        }
        let ptr = self
            .state
            .driver
            .map_buffer(self.state.queue, self.mem, self.byte_len, access)?;
        self.mapped.store(ptr.as_ptr() as usize, Ordering::Release);
        Ok(ptr)
    }

    fn unmap(&self) -> EngineResult<()> {
        let ptr = self.mapped.swap(0, Ordering::AcqRel);
        let ptr = NonNull::new(ptr as *mut u8).ok_or_else(|| {
            EngineError::execution("device buffer unmapped without a mapping".to_string())
        })?;
        self.state
            .driver
            .unmap_buffer(self.state.queue, self.mem, ptr)
    }
}

/// Explicit device context: one OpenCL context plus an in-order queue.
pub struct ClContext {
    pub(crate) state: Arc<ClContextState>,
}

impl ClContext {
    pub(crate) fn new(state: ClContextState) -> Self {
        Self {
            state: Arc::new(state),
        }
    }
}

impl DeviceContext for ClContext {
    type Buffer = ClBuffer;

    fn backend_name(&self) -> &str {
        BACKEND_NAME
    }

    fn allocate(&self, byte_len: usize) -> EngineResult<Arc<ClBuffer>> {
        trace!(byte_len, "allocating device buffer");
        Ok(Arc::new(ClBuffer::new(Arc::clone(&self.state), byte_len)?))
    }

    fn synchronize(&self) -> EngineResult<()> {
        self.state.driver.finish(self.state.queue)
    }
}
