//! Host-resident buffers and the context that allocates them.

use std::cell::UnsafeCell;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use quiver::error::{EngineError, EngineResult};
use quiver::memory::{DeviceBuffer, DeviceContext, MapAccess, Residency};

use crate::BACKEND_NAME;

/// Byte buffer in ordinary host memory.
///
/// Mapping is a bookkeeping operation here, but the one-outstanding-map
/// contract is still enforced so the host backend exercises the same scoped
/// access discipline as the accelerator families.
pub struct HostBuffer {
    bytes: UnsafeCell<Box<[u8]>>,
    byte_len: usize,
    mapped: AtomicBool,
}

// SAFETY: The bytes are only reachable through map/unmap, and the `mapped`
// flag grants at most one outstanding mapping at a time.
unsafe impl Send for HostBuffer {}
unsafe impl Sync for HostBuffer {}

impl HostBuffer {
    pub fn zeroed(byte_len: usize) -> Self {
        Self {
            bytes: UnsafeCell::new(vec![0u8; byte_len].into_boxed_slice()),
            byte_len,
            mapped: AtomicBool::new(false),
        }
    }
}

impl DeviceBuffer for HostBuffer {
    fn byte_len(&self) -> usize {
        self.byte_len
    }

    fn residency(&self) -> Residency {
        Residency::Host
    }

    fn map(&self, _access: MapAccess) -> EngineResult<NonNull<u8>> {
        if self.mapped.swap(true, Ordering::AcqRel) {
            return Err(EngineError::execution(
                "host buffer is already mapped".to_string(),
            ));
        }
        // SAFETY: The flag above grants exclusive access until unmap.
        let ptr = unsafe { (*self.bytes.get()).as_mut_ptr() };
        NonNull::new(ptr)
            .ok_or_else(|| EngineError::execution("host buffer storage is null".to_string()))
    }

    fn unmap(&self) -> EngineResult<()> {
        if !self.mapped.swap(false, Ordering::AcqRel) {
            return Err(EngineError::execution(
                "host buffer unmapped without a mapping".to_string(),
            ));
        }
        Ok(())
    }
}

/// Explicit allocation context for host memory.
#[derive(Debug, Default)]
pub struct HostContext;

impl HostContext {
    pub fn new() -> Self {
        Self
    }
}

impl DeviceContext for HostContext {
    type Buffer = HostBuffer;

    fn backend_name(&self) -> &str {
        BACKEND_NAME
    }

    fn allocate(&self, byte_len: usize) -> EngineResult<Arc<HostBuffer>> {
        Ok(Arc::new(HostBuffer::zeroed(byte_len)))
    }

    fn synchronize(&self) -> EngineResult<()> {
        // Host kernels run synchronously; there is nothing to wait for.
        Ok(())
    }
}
