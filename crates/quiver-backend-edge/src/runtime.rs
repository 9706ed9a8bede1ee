//! Dynamically loaded edge-NPU runtime and the context built over it.

use std::ffi::c_void;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use libloading::Library;
use quiver::error::{EngineError, EngineResult};
use quiver::memory::{DeviceBuffer, DeviceContext, MapAccess, Residency};

use crate::BACKEND_NAME;

type RtStatus = i32;
const RT_OK: RtStatus = 0;

type OpenFn = unsafe extern "C" fn(device: *mut *mut c_void) -> RtStatus;
type CloseFn = unsafe extern "C" fn(device: *mut c_void) -> RtStatus;
type AllocFn =
    unsafe extern "C" fn(device: *mut c_void, size: usize, mem: *mut *mut c_void) -> RtStatus;
type FreeFn = unsafe extern "C" fn(device: *mut c_void, mem: *mut c_void) -> RtStatus;
type MapFn = unsafe extern "C" fn(
    device: *mut c_void,
    mem: *mut c_void,
    writable: u32,
    ptr: *mut *mut c_void,
) -> RtStatus;
type UnmapFn = unsafe extern "C" fn(device: *mut c_void, mem: *mut c_void) -> RtStatus;
type WaitFn = unsafe extern "C" fn(device: *mut c_void) -> RtStatus;

struct RuntimeFns {
    open: OpenFn,
    close: CloseFn,
    alloc: AllocFn,
    free: FreeFn,
    map: MapFn,
    unmap: UnmapFn,
    wait: WaitFn,
}

/// Loaded edge runtime entry points.
pub struct EdgeRuntime {
    _lib: Library,
    fns: RuntimeFns,
}

// SAFETY: The runtime library's entry points are documented thread-safe;
// the struct holds no mutable state.
unsafe impl Send for EdgeRuntime {}
unsafe impl Sync for EdgeRuntime {}

impl EdgeRuntime {
    pub fn load() -> EngineResult<Arc<Self>> {
        let lib = load_runtime_library()?;
        // SAFETY: Symbol types match the edge runtime C API.
        let fns = unsafe {
            RuntimeFns {
                open: load_symbol(&lib, b"edgert_open\0")?,
                close: load_symbol(&lib, b"edgert_close\0")?,
                alloc: load_symbol(&lib, b"edgert_alloc\0")?,
                free: load_symbol(&lib, b"edgert_free\0")?,
                map: load_symbol(&lib, b"edgert_map\0")?,
                unmap: load_symbol(&lib, b"edgert_unmap\0")?,
                wait: load_symbol(&lib, b"edgert_wait\0")?,
            }
        };
        Ok(Arc::new(Self { _lib: lib, fns }))
    }
}

fn load_runtime_library() -> EngineResult<Library> {
    let candidates = ["libedgert.so.1", "libedgert.so", "edgert.dll"];
    for candidate in candidates {
        // SAFETY: Library probe only; no symbols are invoked at this stage.
        if let Ok(lib) = unsafe { Library::new(candidate) } {
            return Ok(lib);
        }
    }
    Err(EngineError::execution(
        "failed to load edge runtime library (tried libedgert.so.1, libedgert.so, edgert.dll)",
    ))
}

// SAFETY: Caller provides the expected symbol type from the runtime C API.
unsafe fn load_symbol<T: Copy>(lib: &Library, name: &'static [u8]) -> EngineResult<T> {
    let sym = lib.get::<T>(name).map_err(|err| {
        EngineError::execution(format!(
            "failed to resolve edge runtime symbol {}: {err}",
            String::from_utf8_lossy(name)
        ))
    })?;
    Ok(*sym)
}

fn check_rt(code: RtStatus, op: &str) -> EngineResult<()> {
    if code == RT_OK {
        Ok(())
    } else {
        Err(EngineError::execution(format!(
            "edge runtime call {op} failed with status {code}"
        )))
    }
}

/// One opened device handle; closed on drop.
pub struct EdgeContext {
    runtime: Arc<EdgeRuntime>,
    device: usize,
}

impl EdgeContext {
    pub(crate) fn open(runtime: Arc<EdgeRuntime>) -> EngineResult<Self> {
        let mut device: *mut c_void = std::ptr::null_mut();
        // SAFETY: Out pointer is valid for a single write.
        unsafe {
            check_rt((runtime.fns.open)(&mut device), "edgert_open")?;
        }
        Ok(Self {
            runtime,
            device: device as usize,
        })
    }

    fn device(&self) -> *mut c_void {
        self.device as *mut c_void
    }
}

impl Drop for EdgeContext {
    fn drop(&mut self) {
        // SAFETY: The device was opened by this context and is closed once.
        unsafe {
            let _ = (self.runtime.fns.close)(self.device());
        }
    }
}

impl DeviceContext for EdgeContext {
    type Buffer = EdgeBuffer;

    fn backend_name(&self) -> &str {
        BACKEND_NAME
    }

    fn allocate(&self, byte_len: usize) -> EngineResult<Arc<EdgeBuffer>> {
        let mut mem: *mut c_void = std::ptr::null_mut();
        // SAFETY: Device is open; out pointer is valid for a single write.
        unsafe {
            check_rt(
                (self.runtime.fns.alloc)(self.device(), byte_len.max(1), &mut mem),
                "edgert_alloc",
            )?;
        }
        Ok(Arc::new(EdgeBuffer {
            runtime: Arc::clone(&self.runtime),
            device: self.device,
            mem: mem as usize,
            byte_len,
            mapped: AtomicUsize::new(0),
        }))
    }

    fn synchronize(&self) -> EngineResult<()> {
        // SAFETY: Device is open for the lifetime of this context.
        unsafe { check_rt((self.runtime.fns.wait)(self.device()), "edgert_wait") }
    }
}

/// NPU-resident buffer reached through blocking map/unmap.
pub struct EdgeBuffer {
    runtime: Arc<EdgeRuntime>,
    device: usize,
    mem: usize,
    byte_len: usize,
    mapped: AtomicUsize,
}

impl Drop for EdgeBuffer {
    fn drop(&mut self) {
        // SAFETY: The handle was allocated on this device and is freed once.
        unsafe {
            let _ = (self.runtime.fns.free)(self.device as *mut c_void, self.mem as *mut c_void);
        }
    }
}

impl DeviceBuffer for EdgeBuffer {
    fn byte_len(&self) -> usize {
        self.byte_len
    }

    fn residency(&self) -> Residency {
        Residency::Accelerator
    }

    fn map(&self, access: MapAccess) -> EngineResult<NonNull<u8>> {
        if self.mapped.load(Ordering::Acquire) != 0 {
            return Err(EngineError::execution(
                "edge buffer is already mapped".to_string(),
            ));
        }
        let writable = u32::from(!matches!(access, MapAccess::Read));
        let mut ptr: *mut c_void = std::ptr::null_mut();
        // SAFETY: Device and buffer handles are live; out pointer is valid.
        unsafe {
            check_rt(
                (self.runtime.fns.map)(
                    self.device as *mut c_void,
                    self.mem as *mut c_void,
                    writable,
                    &mut ptr,
                ),
                "edgert_map",
            )?;
        }
        let ptr = NonNull::new(ptr as *mut u8)
            .ok_or_else(|| EngineError::execution("edgert_map returned null"))?;
        self.mapped.store(ptr.as_ptr() as usize, Ordering::Release);
        Ok(ptr)
    }

    fn unmap(&self) -> EngineResult<()> {
        if self.mapped.swap(0, Ordering::AcqRel) == 0 {
            return Err(EngineError::execution(
                "edge buffer unmapped without a mapping".to_string(),
            ));
        }
        // SAFETY: A mapping was outstanding on this buffer.
        unsafe {
            check_rt(
                (self.runtime.fns.unmap)(self.device as *mut c_void, self.mem as *mut c_void),
                "edgert_unmap",
            )
        }
    }
}
