//! Dynamically loaded OpenCL driver.
//!
//! The driver library is resolved at backend construction and threaded
//! through every context explicitly; there is no process-wide driver state.
//! Only the entry points this backend calls are loaded.

use std::ffi::{c_void, CString};
use std::ptr::NonNull;
use std::sync::Arc;

use libloading::Library;
use quiver::error::{EngineError, EngineResult};
use quiver::memory::MapAccess;

type ClInt = i32;
type ClUint = u32;
type ClBitfield = u64;
type ClPlatformId = *mut c_void;
type ClDeviceId = *mut c_void;
type ClContextHandle = *mut c_void;
type ClQueueHandle = *mut c_void;
type ClMemHandle = *mut c_void;
type ClProgramHandle = *mut c_void;
type ClKernelHandle = *mut c_void;

const CL_SUCCESS: ClInt = 0;
const CL_TRUE: ClUint = 1;
const CL_DEVICE_TYPE_DEFAULT: ClBitfield = 1;
const CL_MEM_READ_WRITE: ClBitfield = 1;
const CL_MAP_READ: ClBitfield = 1;
const CL_MAP_WRITE: ClBitfield = 2;

type GetPlatformIdsFn =
    unsafe extern "C" fn(num_entries: ClUint, platforms: *mut ClPlatformId, num: *mut ClUint) -> ClInt;
type GetDeviceIdsFn = unsafe extern "C" fn(
    platform: ClPlatformId,
    device_type: ClBitfield,
    num_entries: ClUint,
    devices: *mut ClDeviceId,
    num: *mut ClUint,
) -> ClInt;
type CreateContextFn = unsafe extern "C" fn(
    properties: *const isize,
    num_devices: ClUint,
    devices: *const ClDeviceId,
    notify: *mut c_void,
    user_data: *mut c_void,
    errcode: *mut ClInt,
) -> ClContextHandle;
type ReleaseContextFn = unsafe extern "C" fn(context: ClContextHandle) -> ClInt;
type CreateCommandQueueFn = unsafe extern "C" fn(
    context: ClContextHandle,
    device: ClDeviceId,
    properties: ClBitfield,
    errcode: *mut ClInt,
) -> ClQueueHandle;
type ReleaseCommandQueueFn = unsafe extern "C" fn(queue: ClQueueHandle) -> ClInt;
type CreateBufferFn = unsafe extern "C" fn(
    context: ClContextHandle,
    flags: ClBitfield,
    size: usize,
    host_ptr: *mut c_void,
    errcode: *mut ClInt,
) -> ClMemHandle;
type ReleaseMemObjectFn = unsafe extern "C" fn(mem: ClMemHandle) -> ClInt;
type EnqueueMapBufferFn = unsafe extern "C" fn(
    queue: ClQueueHandle,
    buffer: ClMemHandle,
    blocking: ClUint,
    map_flags: ClBitfield,
    offset: usize,
    size: usize,
    num_events: ClUint,
    wait_list: *const c_void,
    event: *mut c_void,
    errcode: *mut ClInt,
) -> *mut c_void;
type EnqueueUnmapMemObjectFn = unsafe extern "C" fn(
    queue: ClQueueHandle,
    mem: ClMemHandle,
    mapped_ptr: *mut c_void,
    num_events: ClUint,
    wait_list: *const c_void,
    event: *mut c_void,
) -> ClInt;
type FinishFn = unsafe extern "C" fn(queue: ClQueueHandle) -> ClInt;
type CreateProgramWithSourceFn = unsafe extern "C" fn(
    context: ClContextHandle,
    count: ClUint,
    strings: *const *const i8,
    lengths: *const usize,
    errcode: *mut ClInt,
) -> ClProgramHandle;
type BuildProgramFn = unsafe extern "C" fn(
    program: ClProgramHandle,
    num_devices: ClUint,
    devices: *const ClDeviceId,
    options: *const i8,
    notify: *mut c_void,
    user_data: *mut c_void,
) -> ClInt;
type ReleaseProgramFn = unsafe extern "C" fn(program: ClProgramHandle) -> ClInt;
type CreateKernelFn = unsafe extern "C" fn(
    program: ClProgramHandle,
    name: *const i8,
    errcode: *mut ClInt,
) -> ClKernelHandle;
type ReleaseKernelFn = unsafe extern "C" fn(kernel: ClKernelHandle) -> ClInt;
type SetKernelArgFn = unsafe extern "C" fn(
    kernel: ClKernelHandle,
    index: ClUint,
    size: usize,
    value: *const c_void,
) -> ClInt;
type EnqueueNdRangeKernelFn = unsafe extern "C" fn(
    queue: ClQueueHandle,
    kernel: ClKernelHandle,
    work_dim: ClUint,
    global_offset: *const usize,
    global_size: *const usize,
    local_size: *const usize,
    num_events: ClUint,
    wait_list: *const c_void,
    event: *mut c_void,
) -> ClInt;

struct DriverFns {
    get_platform_ids: GetPlatformIdsFn,
    get_device_ids: GetDeviceIdsFn,
    create_context: CreateContextFn,
    release_context: ReleaseContextFn,
    create_command_queue: CreateCommandQueueFn,
    release_command_queue: ReleaseCommandQueueFn,
    create_buffer: CreateBufferFn,
    release_mem_object: ReleaseMemObjectFn,
    enqueue_map_buffer: EnqueueMapBufferFn,
    enqueue_unmap_mem_object: EnqueueUnmapMemObjectFn,
    finish: FinishFn,
    create_program_with_source: CreateProgramWithSourceFn,
    build_program: BuildProgramFn,
    release_program: ReleaseProgramFn,
    create_kernel: CreateKernelFn,
    release_kernel: ReleaseKernelFn,
    set_kernel_arg: SetKernelArgFn,
    enqueue_nd_range_kernel: EnqueueNdRangeKernelFn,
}

/// Loaded OpenCL entry points plus the library keeping them alive.
pub struct ClDriver {
    _lib: Library,
    fns: DriverFns,
}

// SAFETY: OpenCL entry points are thread-safe per the specification; the
// driver holds no mutable state of its own.
unsafe impl Send for ClDriver {}
unsafe impl Sync for ClDriver {}

/// Raw handles of one context/queue pair. Stored as usize so owners can
/// satisfy Send/Sync bounds.
pub(crate) struct ClContextState {
    pub driver: Arc<ClDriver>,
    pub context: usize,
    pub queue: usize,
    pub device: usize,
}

impl Drop for ClContextState {
    fn drop(&mut self) {
        // SAFETY: Handles were created by this driver and are released once.
        unsafe {
            let _ = (self.driver.fns.release_command_queue)(self.queue as ClQueueHandle);
            let _ = (self.driver.fns.release_context)(self.context as ClContextHandle);
        }
    }
}

impl ClDriver {
    pub fn load() -> EngineResult<Arc<Self>> {
        let lib = load_cl_library()?;
        // SAFETY: Symbol types match the OpenCL 1.2 C API.
        let fns = unsafe {
            DriverFns {
                get_platform_ids: load_symbol(&lib, b"clGetPlatformIDs\0")?,
                get_device_ids: load_symbol(&lib, b"clGetDeviceIDs\0")?,
                create_context: load_symbol(&lib, b"clCreateContext\0")?,
                release_context: load_symbol(&lib, b"clReleaseContext\0")?,
                create_command_queue: load_symbol(&lib, b"clCreateCommandQueue\0")?,
                release_command_queue: load_symbol(&lib, b"clReleaseCommandQueue\0")?,
                create_buffer: load_symbol(&lib, b"clCreateBuffer\0")?,
                release_mem_object: load_symbol(&lib, b"clReleaseMemObject\0")?,
                enqueue_map_buffer: load_symbol(&lib, b"clEnqueueMapBuffer\0")?,
                enqueue_unmap_mem_object: load_symbol(&lib, b"clEnqueueUnmapMemObject\0")?,
                finish: load_symbol(&lib, b"clFinish\0")?,
                create_program_with_source: load_symbol(&lib, b"clCreateProgramWithSource\0")?,
                build_program: load_symbol(&lib, b"clBuildProgram\0")?,
                release_program: load_symbol(&lib, b"clReleaseProgram\0")?,
                create_kernel: load_symbol(&lib, b"clCreateKernel\0")?,
                release_kernel: load_symbol(&lib, b"clReleaseKernel\0")?,
                set_kernel_arg: load_symbol(&lib, b"clSetKernelArg\0")?,
                enqueue_nd_range_kernel: load_symbol(&lib, b"clEnqueueNDRangeKernel\0")?,
            }
        };
        Ok(Arc::new(Self { _lib: lib, fns }))
    }

    /// Creates a fresh context and in-order queue on the default device.
    pub(crate) fn create_context_state(self: &Arc<Self>) -> EngineResult<ClContextState> {
        let mut platform: ClPlatformId = std::ptr::null_mut();
        let mut device: ClDeviceId = std::ptr::null_mut();
        let mut count: ClUint = 0;
        // SAFETY: Out pointers are valid for single-element writes.
        unsafe {
            check_cl(
                (self.fns.get_platform_ids)(1, &mut platform, &mut count),
                "clGetPlatformIDs",
            )?;
            if count == 0 {
                return Err(EngineError::execution("no OpenCL platform reported"));
            }
            check_cl(
                (self.fns.get_device_ids)(platform, CL_DEVICE_TYPE_DEFAULT, 1, &mut device, &mut count),
                "clGetDeviceIDs",
            )?;
            if count == 0 {
                return Err(EngineError::execution("no OpenCL device reported"));
            }
        }

        let mut err: ClInt = CL_SUCCESS;
        // SAFETY: Device handle is valid; errcode out pointer is valid.
        let context = unsafe {
            (self.fns.create_context)(
                std::ptr::null(),
                1,
                &device,
                std::ptr::null_mut(),
                std::ptr::null_mut(),
                &mut err,
            )
        };
        check_cl(err, "clCreateContext")?;
        // SAFETY: Context was just created; errcode out pointer is valid.
        let queue = unsafe { (self.fns.create_command_queue)(context, device, 0, &mut err) };
        if let Err(failure) = check_cl(err, "clCreateCommandQueue") {
            // SAFETY: Context is released once on the failure path.
            unsafe {
                let _ = (self.fns.release_context)(context);
            }
            return Err(failure);
        }
        Ok(ClContextState {
            driver: Arc::clone(self),
            context: context as usize,
            queue: queue as usize,
            device: device as usize,
        })
    }

    pub(crate) fn create_buffer(&self, context: usize, byte_len: usize) -> EngineResult<usize> {
        let mut err: ClInt = CL_SUCCESS;
        // Zero-sized allocations are rejected by the driver; round up.
        let size = byte_len.max(1);
        // SAFETY: Context handle is live while its state exists.
        let mem = unsafe {
            (self.fns.create_buffer)(
                context as ClContextHandle,
                CL_MEM_READ_WRITE,
                size,
                std::ptr::null_mut(),
                &mut err,
            )
        };
        check_cl(err, "clCreateBuffer")?;
        Ok(mem as usize)
    }

    pub(crate) fn release_buffer(&self, mem: usize) {
        // SAFETY: The handle was created by this driver and is released once.
        unsafe {
            let _ = (self.fns.release_mem_object)(mem as ClMemHandle);
        }
    }

    /// Blocking map of a buffer range into host memory.
    pub(crate) fn map_buffer(
        &self,
        queue: usize,
        mem: usize,
        byte_len: usize,
        access: MapAccess,
    ) -> EngineResult<NonNull<u8>> {
        let flags = match access {
            MapAccess::Read => CL_MAP_READ,
            MapAccess::Write => CL_MAP_WRITE,
            MapAccess::ReadWrite => CL_MAP_READ | CL_MAP_WRITE,
        };
        let mut err: ClInt = CL_SUCCESS;
        // SAFETY: Queue and buffer handles are live; blocking map returns a
        // host pointer valid until the matching unmap.
        let ptr = unsafe {
            (self.fns.enqueue_map_buffer)(
                queue as ClQueueHandle,
                mem as ClMemHandle,
                CL_TRUE,
                flags,
                0,
                byte_len.max(1),
                0,
                std::ptr::null(),
                std::ptr::null_mut(),
                &mut err,
            )
        };
        check_cl(err, "clEnqueueMapBuffer")?;
        NonNull::new(ptr as *mut u8)
            .ok_or_else(|| EngineError::execution("clEnqueueMapBuffer returned null"))
    }

    pub(crate) fn unmap_buffer(
        &self,
        queue: usize,
        mem: usize,
        ptr: NonNull<u8>,
    ) -> EngineResult<()> {
        // SAFETY: The pointer came from a map on this queue/buffer pair.
        unsafe {
            check_cl(
                (self.fns.enqueue_unmap_mem_object)(
                    queue as ClQueueHandle,
                    mem as ClMemHandle,
                    ptr.as_ptr() as *mut c_void,
                    0,
                    std::ptr::null(),
                    std::ptr::null_mut(),
                ),
                "clEnqueueUnmapMemObject",
            )
        }
    }

    /// Blocks until all enqueued work on the queue has completed.
    pub(crate) fn finish(&self, queue: usize) -> EngineResult<()> {
        // SAFETY: Queue handle is live while its state exists.
        unsafe { check_cl((self.fns.finish)(queue as ClQueueHandle), "clFinish") }
    }

    pub(crate) fn build_program(
        &self,
        context: usize,
        device: usize,
        source: &str,
    ) -> EngineResult<usize> {
        let c_source = CString::new(source)
            .map_err(|_| EngineError::execution("kernel source contains NUL byte"))?;
        let mut err: ClInt = CL_SUCCESS;
        let strings = [c_source.as_ptr()];
        // SAFETY: The source pointer array is valid for the call duration.
        let program = unsafe {
            (self.fns.create_program_with_source)(
                context as ClContextHandle,
                1,
                strings.as_ptr(),
                std::ptr::null(),
                &mut err,
            )
        };
        check_cl(err, "clCreateProgramWithSource")?;
        let device_handle = device as ClDeviceId;
        // SAFETY: Program and device handles are live.
        let status = unsafe {
            (self.fns.build_program)(
                program,
                1,
                &device_handle,
                std::ptr::null(),
                std::ptr::null_mut(),
                std::ptr::null_mut(),
            )
        };
        if let Err(failure) = check_cl(status, "clBuildProgram") {
            // SAFETY: Program is released once on the failure path.
            unsafe {
                let _ = (self.fns.release_program)(program);
            }
            return Err(failure);
        }
        Ok(program as usize)
    }

    pub(crate) fn release_program(&self, program: usize) {
        // SAFETY: The handle was created by this driver and is released once.
        unsafe {
            let _ = (self.fns.release_program)(program as ClProgramHandle);
        }
    }

    pub(crate) fn create_kernel(&self, program: usize, name: &str) -> EngineResult<usize> {
        let c_name = CString::new(name)
            .map_err(|_| EngineError::execution("kernel name contains NUL byte"))?;
        let mut err: ClInt = CL_SUCCESS;
        // SAFETY: Program handle is live; name is NUL-terminated.
        let kernel = unsafe {
            (self.fns.create_kernel)(program as ClProgramHandle, c_name.as_ptr(), &mut err)
        };
        check_cl(err, "clCreateKernel")?;
        Ok(kernel as usize)
    }

    pub(crate) fn release_kernel(&self, kernel: usize) {
        // SAFETY: The handle was created by this driver and is released once.
        unsafe {
            let _ = (self.fns.release_kernel)(kernel as ClKernelHandle);
        }
    }

    pub(crate) fn set_kernel_arg_mem(
        &self,
        kernel: usize,
        index: u32,
        mem: usize,
    ) -> EngineResult<()> {
        let handle = mem as ClMemHandle;
        // SAFETY: The argument points at a live cl_mem handle.
        unsafe {
            check_cl(
                (self.fns.set_kernel_arg)(
                    kernel as ClKernelHandle,
                    index,
                    std::mem::size_of::<ClMemHandle>(),
                    &handle as *const ClMemHandle as *const c_void,
                ),
                "clSetKernelArg",
            )
        }
    }

    /// Enqueues a 1-D kernel launch; completion is observed via `finish`.
    pub(crate) fn enqueue_kernel(
        &self,
        queue: usize,
        kernel: usize,
        global_size: usize,
    ) -> EngineResult<()> {
        let global = [global_size];
        // SAFETY: Queue and kernel handles are live; global size is valid.
        unsafe {
            check_cl(
                (self.fns.enqueue_nd_range_kernel)(
                    queue as ClQueueHandle,
                    kernel as ClKernelHandle,
                    1,
                    std::ptr::null(),
                    global.as_ptr(),
                    std::ptr::null(),
                    0,
                    std::ptr::null(),
                    std::ptr::null_mut(),
                ),
                "clEnqueueNDRangeKernel",
            )
        }
    }
}

fn load_cl_library() -> EngineResult<Library> {
    let candidates = [
        "libOpenCL.so.1",
        "libOpenCL.so",
        "OpenCL.dll",
        "/System/Library/Frameworks/OpenCL.framework/OpenCL",
    ];
    for candidate in candidates {
        // SAFETY: Library probe only; no symbols are invoked at this stage.
        if let Ok(lib) = unsafe { Library::new(candidate) } {
            return Ok(lib);
        }
    }
    Err(EngineError::execution(
        "failed to load OpenCL driver library (tried libOpenCL.so.1, libOpenCL.so, OpenCL.dll, OpenCL.framework)",
    ))
}

// SAFETY: Caller provides the expected symbol type from the OpenCL C API.
unsafe fn load_symbol<T: Copy>(lib: &Library, name: &'static [u8]) -> EngineResult<T> {
    let sym = lib.get::<T>(name).map_err(|err| {
        EngineError::execution(format!(
            "failed to resolve OpenCL symbol {}: {err}",
            String::from_utf8_lossy(name)
        ))
    })?;
    Ok(*sym)
}

fn check_cl(code: ClInt, op: &str) -> EngineResult<()> {
    if code == CL_SUCCESS {
        Ok(())
    } else {
        Err(EngineError::execution(format!(
            "OpenCL call {op} failed with code {code}"
        )))
    }
}
