use crate::{
    completion_queue::CompletionQueue,
    device::Device,
    error_utilities::{check_int, check_ptr},
    ffi::{ibv_context, ibv_port_attr},
    gid::Gid,
    protection_domain::ProtectionDomain,
    verbs::Verbs,
};
use std::{fmt, io, mem, ptr::NonNull, sync::Arc};

/// An open device context, the root resource every other handle hangs off
pub struct Context {
    /// The capability table the device was opened through
    verbs: Arc<dyn Verbs>,
    /// Internal `ibv_context` pointer
    inner_ctx: NonNull<ibv_context>,
}

impl Context {
    /// Get pointer to the internal `ibv_context`
    pub(crate) fn as_ptr(&self) -> *mut ibv_context {
        self.inner_ctx.as_ptr()
    }

    /// The capability table this context was opened through
    pub(crate) fn verbs(&self) -> &Arc<dyn Verbs> {
        &self.verbs
    }

    /// Open a device.
    ///
    /// The returned context borrows nothing from the device list; the list
    /// may be released once all needed contexts are open.
    pub fn open(verbs: &Arc<dyn Verbs>, device: &Device) -> io::Result<Self> {
        let inner_ctx = check_ptr("ibv_open_device", || {
            // SAFETY: ffi
            unsafe { verbs.open_device(device.ffi_ptr()) }
        })?;
        Ok(Self {
            verbs: Arc::clone(verbs),
            inner_ctx,
        })
    }

    /// Query the attributes of one port of this device.
    ///
    /// On failure of `ibv_query_port`, errno indicates the failure reason:
    ///
    /// `EINVAL`    Invalid port number
    pub fn query_port(&self, port_num: u8) -> io::Result<ibv_port_attr> {
        // SAFETY: POD FFI type
        let mut port_attr = unsafe { mem::zeroed::<ibv_port_attr>() };
        check_int("ibv_query_port", || {
            // SAFETY: ffi
            unsafe { self.verbs.query_port(self.as_ptr(), port_num, &mut port_attr) }
        })?;
        Ok(port_attr)
    }

    /// Read one entry of a port's GID table.
    pub fn query_gid(&self, port_num: u8, gid_index: u8) -> io::Result<Gid> {
        let mut gid = Gid::default();
        check_int("ibv_query_gid", || {
            // SAFETY: ffi
            unsafe {
                self.verbs
                    .query_gid(self.as_ptr(), port_num, gid_index.into(), gid.as_mut_ptr())
            }
        })?;
        Ok(gid)
    }

    /// Allocate a protection domain on this device
    pub fn create_protection_domain(self: &Arc<Self>) -> io::Result<ProtectionDomain> {
        ProtectionDomain::create(self)
    }

    /// Create a completion queue with room for `cq_size` entries
    pub fn create_completion_queue(self: &Arc<Self>, cq_size: u32) -> io::Result<CompletionQueue> {
        CompletionQueue::create(self, cq_size)
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("inner_ctx", &self.inner_ctx)
            .finish()
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        // SAFETY: ffi
        let errno = unsafe { self.verbs.close_device(self.as_ptr()) };
        assert_eq!(
            errno,
            0_i32,
            "ibv_close_device failed: {}",
            io::Error::from_raw_os_error(errno)
        );
    }
}

/// SAFETY: owned handle, no thread affinity in the native context
unsafe impl Send for Context {}

/// SAFETY: all native calls taking the context are safe to issue concurrently
unsafe impl Sync for Context {}
