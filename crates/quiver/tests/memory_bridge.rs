use std::cell::UnsafeCell;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use quiver::element::{ElementType, TensorSpec};
use quiver::error::{EngineError, EngineResult};
use quiver::graph::NodeId;
use quiver::memory::{
    with_mapped, BufferPool, DeviceBuffer, DeviceContext, MapAccess, PortKey, RemoteTensor,
    Residency, ScopedMap,
};

/// Accelerator stand-in that counts map/unmap calls.
struct MockBuffer {
    bytes: UnsafeCell<Box<[u8]>>,
    byte_len: usize,
    mapped: AtomicBool,
    maps: AtomicUsize,
    unmaps: AtomicUsize,
}

// SAFETY: The mapped flag grants at most one outstanding mapping.
unsafe impl Send for MockBuffer {}
unsafe impl Sync for MockBuffer {}

impl MockBuffer {
    fn new(byte_len: usize) -> Self {
        Self {
            bytes: UnsafeCell::new(vec![0u8; byte_len].into_boxed_slice()),
            byte_len,
            mapped: AtomicBool::new(false),
            maps: AtomicUsize::new(0),
            unmaps: AtomicUsize::new(0),
        }
    }
}

impl DeviceBuffer for MockBuffer {
    fn byte_len(&self) -> usize {
        self.byte_len
    }

    fn residency(&self) -> Residency {
        Residency::Accelerator
    }

    fn map(&self, _access: MapAccess) -> EngineResult<NonNull<u8>> {
        if self.mapped.swap(true, Ordering::AcqRel) {
            return Err(EngineError::execution("already mapped".to_string()));
        }
        self.maps.fetch_add(1, Ordering::SeqCst);
        // SAFETY: The flag above grants exclusive access until unmap.
        let ptr = unsafe { (*self.bytes.get()).as_mut_ptr() };
        NonNull::new(ptr).ok_or_else(|| EngineError::execution("null storage".to_string()))
    }

    fn unmap(&self) -> EngineResult<()> {
        if !self.mapped.swap(false, Ordering::AcqRel) {
            return Err(EngineError::execution("not mapped".to_string()));
        }
        self.unmaps.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
struct MockContext {
    allocations: AtomicUsize,
}

impl DeviceContext for MockContext {
    type Buffer = MockBuffer;

    fn backend_name(&self) -> &str {
        "mock"
    }

    fn allocate(&self, byte_len: usize) -> EngineResult<Arc<MockBuffer>> {
        self.allocations.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MockBuffer::new(byte_len)))
    }

    fn synchronize(&self) -> EngineResult<()> {
        Ok(())
    }
}

#[test]
fn acquire_with_stable_size_reuses_the_allocation() -> Result<()> {
    let context = Arc::new(MockContext::default());
    let mut pool = BufferPool::new(Arc::clone(&context));
    let key = PortKey::new(NodeId(3), 0);

    let first = pool.acquire(key, 64, ElementType::F32)?;
    let second = pool.acquire(key, 64, ElementType::F32)?;
    assert!(Arc::ptr_eq(&first, &second), "same size must reuse");
    assert_eq!(context.allocations.load(Ordering::SeqCst), 1);
    Ok(())
}

#[test]
fn acquire_with_new_size_releases_and_reallocates() -> Result<()> {
    let context = Arc::new(MockContext::default());
    let mut pool = BufferPool::new(Arc::clone(&context));
    let key = PortKey::new(NodeId(3), 0);

    let first = pool.acquire(key, 64, ElementType::F32)?;
    let second = pool.acquire(key, 128, ElementType::F32)?;
    assert!(!Arc::ptr_eq(&first, &second));
    assert_eq!(context.allocations.load(Ordering::SeqCst), 2);

    // Only the test handle keeps the old allocation alive now.
    assert_eq!(Arc::strong_count(&first), 1);
    Ok(())
}

#[test]
fn distinct_ports_get_distinct_buffers() -> Result<()> {
    let context = Arc::new(MockContext::default());
    let mut pool = BufferPool::new(Arc::clone(&context));

    let a = pool.acquire(PortKey::new(NodeId(1), 0), 32, ElementType::F32)?;
    let b = pool.acquire(PortKey::new(NodeId(1), 1), 32, ElementType::F32)?;
    assert!(!Arc::ptr_eq(&a, &b));
    Ok(())
}

#[test]
fn failed_fill_leaves_map_counts_balanced() {
    let buffer = MockBuffer::new(16);
    let outcome: EngineResult<()> = with_mapped(&buffer, MapAccess::Write, |bytes| {
        bytes[0] = 1;
        Err(EngineError::execution("simulated mid-fill failure".to_string()))
    });
    assert!(outcome.is_err());
    assert_eq!(
        buffer.maps.load(Ordering::SeqCst),
        buffer.unmaps.load(Ordering::SeqCst),
        "every map needs its unmap, even on failure"
    );
}

#[test]
fn scoped_map_unmaps_on_drop() -> Result<()> {
    let buffer = MockBuffer::new(8);
    {
        let mut mapped = ScopedMap::new(&buffer, MapAccess::ReadWrite)?;
        mapped.bytes_mut()[0] = 0x7f;
    }
    assert_eq!(buffer.maps.load(Ordering::SeqCst), 1);
    assert_eq!(buffer.unmaps.load(Ordering::SeqCst), 1);

    // And the write went through to the storage.
    let read = with_mapped(&buffer, MapAccess::Read, |bytes| Ok(bytes[0]))?;
    assert_eq!(read, 0x7f);
    Ok(())
}

#[test]
fn second_map_while_mapped_is_rejected() -> Result<()> {
    let buffer = MockBuffer::new(8);
    let mapped = ScopedMap::new(&buffer, MapAccess::Read)?;
    assert!(ScopedMap::new(&buffer, MapAccess::Read).is_err());
    drop(mapped);
    assert!(ScopedMap::new(&buffer, MapAccess::Read).is_ok());
    Ok(())
}

#[test]
fn remote_tensor_requires_a_fitting_buffer() -> Result<()> {
    let context = MockContext::default();
    let small = context.allocate(8)?;
    let spec = TensorSpec::from_static(ElementType::F32, &[2, 2]);
    assert!(RemoteTensor::new(small, spec.clone()).is_err());

    let fitting = context.allocate(16)?;
    let tensor = RemoteTensor::new(fitting, spec)?;
    assert_eq!(tensor.element_count(), 4);
    assert_eq!(tensor.read_to_vec()?.len(), 16);
    Ok(())
}

#[test]
fn remote_tensor_aliases_the_buffer() -> Result<()> {
    let context = MockContext::default();
    let buffer = context.allocate(4)?;
    let spec = TensorSpec::from_static(ElementType::U8, &[4]);
    let tensor = RemoteTensor::new(Arc::clone(&buffer), spec)?;

    with_mapped(buffer.as_ref(), MapAccess::Write, |bytes| {
        bytes.copy_from_slice(&[9, 8, 7, 6]);
        Ok(())
    })?;
    assert_eq!(tensor.read_to_vec()?, vec![9, 8, 7, 6]);
    Ok(())
}
