//! The native verbs capability table.
//!
//! Every handle and operation in this crate receives the table as an explicit
//! [`Arc<dyn Verbs>`](Verbs) dependency rather than calling a linked symbol,
//! so the same code runs against the installed `libibverbs` or against a
//! substitute table in tests.

use crate::ffi::{
    __be64, ibv_context, ibv_cq, ibv_device, ibv_gid, ibv_mr, ibv_pd, ibv_port_attr, ibv_qp,
    ibv_qp_attr, ibv_qp_init_attr, ibv_srq, ibv_srq_init_attr,
};
use libc::{c_char, c_int, c_void};
use scopeguard::{guard, ScopeGuard};
use std::ffi::CStr;
use std::ptr::NonNull;
use std::sync::Arc;
use std::{io, mem};
use tracing::debug;

/// The set of native verbs entry points this crate depends on.
///
/// Calling conventions, fixed for every implementation:
/// * pointer-returning operations return null on failure and leave the native
///   error code in `errno`;
/// * status-returning operations return `0` on success or a positive native
///   error code.
///
/// All methods are unsafe for the usual FFI reason: pointers passed in must
/// have been produced by the corresponding creation call on the *same* table
/// and not yet released.
#[allow(clippy::missing_safety_doc)]
pub trait Verbs: Send + Sync {
    /// Enumerate the adapters visible to the process.
    unsafe fn get_device_list(&self, num_devices: *mut c_int) -> *mut *mut ibv_device;
    /// Release an enumeration buffer returned by `get_device_list`.
    unsafe fn free_device_list(&self, list: *mut *mut ibv_device);
    /// Kernel name of an adapter.
    unsafe fn get_device_name(&self, device: *mut ibv_device) -> *const c_char;
    /// Node GUID of an adapter, in network byte order.
    unsafe fn get_device_guid(&self, device: *mut ibv_device) -> __be64;
    /// Open an adapter.
    unsafe fn open_device(&self, device: *mut ibv_device) -> *mut ibv_context;
    /// Close an open adapter.
    unsafe fn close_device(&self, context: *mut ibv_context) -> c_int;
    /// Query the attributes of one port of an open adapter.
    unsafe fn query_port(
        &self,
        context: *mut ibv_context,
        port_num: u8,
        port_attr: *mut ibv_port_attr,
    ) -> c_int;
    /// Read one entry of a port's GID table.
    unsafe fn query_gid(
        &self,
        context: *mut ibv_context,
        port_num: u8,
        index: c_int,
        gid: *mut ibv_gid,
    ) -> c_int;
    /// Allocate a protection domain.
    unsafe fn alloc_pd(&self, context: *mut ibv_context) -> *mut ibv_pd;
    /// Deallocate a protection domain.
    unsafe fn dealloc_pd(&self, pd: *mut ibv_pd) -> c_int;
    /// Create a completion queue with at least `cqe` entries.
    unsafe fn create_cq(
        &self,
        context: *mut ibv_context,
        cqe: c_int,
        cq_context: *mut c_void,
        channel: *mut c_void,
        comp_vector: c_int,
    ) -> *mut ibv_cq;
    /// Destroy a completion queue.
    unsafe fn destroy_cq(&self, cq: *mut ibv_cq) -> c_int;
    /// Create a shared receive queue.
    unsafe fn create_srq(&self, pd: *mut ibv_pd, init_attr: *mut ibv_srq_init_attr)
        -> *mut ibv_srq;
    /// Destroy a shared receive queue.
    unsafe fn destroy_srq(&self, srq: *mut ibv_srq) -> c_int;
    /// Register a memory region.
    unsafe fn reg_mr(
        &self,
        pd: *mut ibv_pd,
        addr: *mut c_void,
        length: usize,
        access: c_int,
    ) -> *mut ibv_mr;
    /// Deregister a memory region.
    unsafe fn dereg_mr(&self, mr: *mut ibv_mr) -> c_int;
    /// Create a queue pair.
    unsafe fn create_qp(&self, pd: *mut ibv_pd, init_attr: *mut ibv_qp_init_attr) -> *mut ibv_qp;
    /// Destroy a queue pair.
    unsafe fn destroy_qp(&self, qp: *mut ibv_qp) -> c_int;
    /// Move a queue pair between states; `attr_mask` names exactly the
    /// attributes in `attr` being applied.
    unsafe fn modify_qp(&self, qp: *mut ibv_qp, attr: *mut ibv_qp_attr, attr_mask: c_int)
        -> c_int;
}

/// Shared object names probed by [`VerbsLibrary::load`], in order.
static SONAMES: [&[u8]; 2] = [b"libibverbs.so.1\0", b"libibverbs.so\0"];

/// [`Verbs`] implementation backed by the installed `libibverbs`, loaded with
/// `dlopen` so that no link-time dependency on RDMA packages exists.
pub struct VerbsLibrary {
    /// `dlopen` handle, kept for the lifetime of the table
    lib: NonNull<c_void>,
    get_device_list: unsafe extern "C" fn(*mut c_int) -> *mut *mut ibv_device,
    free_device_list: unsafe extern "C" fn(*mut *mut ibv_device),
    get_device_name: unsafe extern "C" fn(*mut ibv_device) -> *const c_char,
    get_device_guid: unsafe extern "C" fn(*mut ibv_device) -> __be64,
    open_device: unsafe extern "C" fn(*mut ibv_device) -> *mut ibv_context,
    close_device: unsafe extern "C" fn(*mut ibv_context) -> c_int,
    query_port: unsafe extern "C" fn(*mut ibv_context, u8, *mut ibv_port_attr) -> c_int,
    query_gid: unsafe extern "C" fn(*mut ibv_context, u8, c_int, *mut ibv_gid) -> c_int,
    alloc_pd: unsafe extern "C" fn(*mut ibv_context) -> *mut ibv_pd,
    dealloc_pd: unsafe extern "C" fn(*mut ibv_pd) -> c_int,
    create_cq:
        unsafe extern "C" fn(*mut ibv_context, c_int, *mut c_void, *mut c_void, c_int) -> *mut ibv_cq,
    destroy_cq: unsafe extern "C" fn(*mut ibv_cq) -> c_int,
    create_srq: unsafe extern "C" fn(*mut ibv_pd, *mut ibv_srq_init_attr) -> *mut ibv_srq,
    destroy_srq: unsafe extern "C" fn(*mut ibv_srq) -> c_int,
    reg_mr: unsafe extern "C" fn(*mut ibv_pd, *mut c_void, usize, c_int) -> *mut ibv_mr,
    dereg_mr: unsafe extern "C" fn(*mut ibv_mr) -> c_int,
    create_qp: unsafe extern "C" fn(*mut ibv_pd, *mut ibv_qp_init_attr) -> *mut ibv_qp,
    destroy_qp: unsafe extern "C" fn(*mut ibv_qp) -> c_int,
    modify_qp: unsafe extern "C" fn(*mut ibv_qp, *mut ibv_qp_attr, c_int) -> c_int,
}

/// SAFETY: the handle and the resolved entry points are process-global and
/// immutable once loaded
unsafe impl Send for VerbsLibrary {}
/// SAFETY: same as above
unsafe impl Sync for VerbsLibrary {}

impl VerbsLibrary {
    /// Load `libibverbs` and resolve every entry point of the table.
    ///
    /// `ibv_fork_init` is invoked right after loading, before any other verbs
    /// call can be made through the table, as the library requires.
    ///
    /// # Errors
    ///
    /// `NotFound` if the shared object or one of its symbols is missing;
    /// a host without RDMA support installed lands here.
    pub fn load() -> io::Result<Arc<Self>> {
        let mut last_err = None;
        for soname in SONAMES {
            // SAFETY: ffi, soname is nul-terminated
            let lib =
                unsafe { libc::dlopen(soname.as_ptr().cast(), libc::RTLD_NOW | libc::RTLD_LOCAL) };
            match NonNull::new(lib) {
                Some(lib) => return Self::resolve(lib),
                None => last_err = Some(dlerror_to_io()),
            }
        }
        Err(last_err
            .unwrap_or_else(|| io::Error::new(io::ErrorKind::NotFound, "libibverbs not found")))
    }

    /// Resolve all symbols out of an open library handle.
    fn resolve(lib: NonNull<c_void>) -> io::Result<Arc<Self>> {
        // SAFETY: ffi; closing the handle on any resolution failure
        unsafe {
            let lib = guard(lib, |lib| {
                let _ = libc::dlclose(lib.as_ptr());
            });
            let fork_init: unsafe extern "C" fn() -> c_int = sym(*lib, b"ibv_fork_init\0")?;
            let this = Self {
                get_device_list: sym(*lib, b"ibv_get_device_list\0")?,
                free_device_list: sym(*lib, b"ibv_free_device_list\0")?,
                get_device_name: sym(*lib, b"ibv_get_device_name\0")?,
                get_device_guid: sym(*lib, b"ibv_get_device_guid\0")?,
                open_device: sym(*lib, b"ibv_open_device\0")?,
                close_device: sym(*lib, b"ibv_close_device\0")?,
                query_port: sym(*lib, b"ibv_query_port\0")?,
                query_gid: sym(*lib, b"ibv_query_gid\0")?,
                alloc_pd: sym(*lib, b"ibv_alloc_pd\0")?,
                dealloc_pd: sym(*lib, b"ibv_dealloc_pd\0")?,
                create_cq: sym(*lib, b"ibv_create_cq\0")?,
                destroy_cq: sym(*lib, b"ibv_destroy_cq\0")?,
                create_srq: sym(*lib, b"ibv_create_srq\0")?,
                destroy_srq: sym(*lib, b"ibv_destroy_srq\0")?,
                reg_mr: sym(*lib, b"ibv_reg_mr\0")?,
                dereg_mr: sym(*lib, b"ibv_dereg_mr\0")?,
                create_qp: sym(*lib, b"ibv_create_qp\0")?,
                destroy_qp: sym(*lib, b"ibv_destroy_qp\0")?,
                modify_qp: sym(*lib, b"ibv_modify_qp\0")?,
                lib: *lib,
            };
            let _ = ScopeGuard::into_inner(lib);
            // Must run before any other verbs call in the process; harmless
            // if the kernel lacks fork support, so the status is only logged.
            let rv = fork_init();
            if rv != 0_i32 {
                debug!("ibv_fork_init returned {rv}");
            }
            Ok(Arc::new(this))
        }
    }
}

impl Drop for VerbsLibrary {
    fn drop(&mut self) {
        // SAFETY: ffi, handle came from dlopen
        let _ = unsafe { libc::dlclose(self.lib.as_ptr()) };
    }
}

impl Verbs for VerbsLibrary {
    unsafe fn get_device_list(&self, num_devices: *mut c_int) -> *mut *mut ibv_device {
        (self.get_device_list)(num_devices)
    }

    unsafe fn free_device_list(&self, list: *mut *mut ibv_device) {
        (self.free_device_list)(list);
    }

    unsafe fn get_device_name(&self, device: *mut ibv_device) -> *const c_char {
        (self.get_device_name)(device)
    }

    unsafe fn get_device_guid(&self, device: *mut ibv_device) -> __be64 {
        (self.get_device_guid)(device)
    }

    unsafe fn open_device(&self, device: *mut ibv_device) -> *mut ibv_context {
        (self.open_device)(device)
    }

    unsafe fn close_device(&self, context: *mut ibv_context) -> c_int {
        (self.close_device)(context)
    }

    unsafe fn query_port(
        &self,
        context: *mut ibv_context,
        port_num: u8,
        port_attr: *mut ibv_port_attr,
    ) -> c_int {
        (self.query_port)(context, port_num, port_attr)
    }

    unsafe fn query_gid(
        &self,
        context: *mut ibv_context,
        port_num: u8,
        index: c_int,
        gid: *mut ibv_gid,
    ) -> c_int {
        (self.query_gid)(context, port_num, index, gid)
    }

    unsafe fn alloc_pd(&self, context: *mut ibv_context) -> *mut ibv_pd {
        (self.alloc_pd)(context)
    }

    unsafe fn dealloc_pd(&self, pd: *mut ibv_pd) -> c_int {
        (self.dealloc_pd)(pd)
    }

    unsafe fn create_cq(
        &self,
        context: *mut ibv_context,
        cqe: c_int,
        cq_context: *mut c_void,
        channel: *mut c_void,
        comp_vector: c_int,
    ) -> *mut ibv_cq {
        (self.create_cq)(context, cqe, cq_context, channel, comp_vector)
    }

    unsafe fn destroy_cq(&self, cq: *mut ibv_cq) -> c_int {
        (self.destroy_cq)(cq)
    }

    unsafe fn create_srq(
        &self,
        pd: *mut ibv_pd,
        init_attr: *mut ibv_srq_init_attr,
    ) -> *mut ibv_srq {
        (self.create_srq)(pd, init_attr)
    }

    unsafe fn destroy_srq(&self, srq: *mut ibv_srq) -> c_int {
        (self.destroy_srq)(srq)
    }

    unsafe fn reg_mr(
        &self,
        pd: *mut ibv_pd,
        addr: *mut c_void,
        length: usize,
        access: c_int,
    ) -> *mut ibv_mr {
        (self.reg_mr)(pd, addr, length, access)
    }

    unsafe fn dereg_mr(&self, mr: *mut ibv_mr) -> c_int {
        (self.dereg_mr)(mr)
    }

    unsafe fn create_qp(&self, pd: *mut ibv_pd, init_attr: *mut ibv_qp_init_attr) -> *mut ibv_qp {
        (self.create_qp)(pd, init_attr)
    }

    unsafe fn destroy_qp(&self, qp: *mut ibv_qp) -> c_int {
        (self.destroy_qp)(qp)
    }

    unsafe fn modify_qp(
        &self,
        qp: *mut ibv_qp,
        attr: *mut ibv_qp_attr,
        attr_mask: c_int,
    ) -> c_int {
        (self.modify_qp)(qp, attr, attr_mask)
    }
}

/// Resolve one nul-terminated symbol name into a function pointer.
///
/// # Safety
///
/// `T` must be the exact function pointer type of the named symbol.
unsafe fn sym<T: Copy>(lib: NonNull<c_void>, name: &'static [u8]) -> io::Result<T> {
    let ptr = libc::dlsym(lib.as_ptr(), name.as_ptr().cast());
    if ptr.is_null() {
        let name = CStr::from_bytes_with_nul(name)
            .map_or_else(|_| String::new(), |s| s.to_string_lossy().into_owned());
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("symbol {name} not found: {}", dlerror_to_io()),
        ));
    }
    debug_assert_eq!(mem::size_of::<T>(), mem::size_of::<*mut c_void>());
    Ok(mem::transmute_copy(&ptr))
}

/// Turn the thread's `dlerror` string into an `io::Error`.
fn dlerror_to_io() -> io::Error {
    // SAFETY: ffi; dlerror returns null or a thread-local string
    let msg = unsafe {
        let ptr = libc::dlerror();
        if ptr.is_null() {
            "unknown dlopen error".to_owned()
        } else {
            CStr::from_ptr(ptr).to_string_lossy().into_owned()
        }
    };
    io::Error::new(io::ErrorKind::NotFound, msg)
}
