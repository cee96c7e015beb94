use crate::{error_utilities::check_ptr, ffi::ibv_srq_init_attr, ffi::ibv_srq,
    protection_domain::ProtectionDomain};
use std::{fmt, io, mem, ptr::NonNull, sync::Arc};

/// Shared Receive Queue Wrapper.
///
/// Lets many queue pairs consume receive buffers from one queue instead of
/// posting per-pair receives.
pub struct SharedReceiveQueue {
    /// Protection domain it belongs to
    pd: Arc<ProtectionDomain>,
    /// Internal `ibv_srq` pointer
    inner_srq: NonNull<ibv_srq>,
}

impl SharedReceiveQueue {
    /// Get the internal srq ptr
    pub(crate) fn as_ptr(&self) -> *mut ibv_srq {
        self.inner_srq.as_ptr()
    }

    /// Create a shared receive queue holding up to `max_wr` outstanding work
    /// requests of up to `max_sge` scatter/gather elements each
    pub fn create(pd: &Arc<ProtectionDomain>, max_wr: u32, max_sge: u32) -> io::Result<Self> {
        // SAFETY: POD FFI type
        let mut init_attr = unsafe { mem::zeroed::<ibv_srq_init_attr>() };
        init_attr.attr.max_wr = max_wr;
        init_attr.attr.max_sge = max_sge;
        init_attr.attr.srq_limit = 0;
        let inner_srq = check_ptr("ibv_create_srq", || {
            // SAFETY: ffi
            unsafe { pd.ctx.verbs().create_srq(pd.as_ptr(), &mut init_attr) }
        })?;
        Ok(Self {
            pd: Arc::<ProtectionDomain>::clone(pd),
            inner_srq,
        })
    }
}

impl fmt::Debug for SharedReceiveQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedReceiveQueue")
            .field("inner_srq", &self.inner_srq)
            .finish()
    }
}

impl Drop for SharedReceiveQueue {
    fn drop(&mut self) {
        // SAFETY: ffi
        let errno = unsafe { self.pd.ctx.verbs().destroy_srq(self.as_ptr()) };
        assert_eq!(
            errno,
            0_i32,
            "ibv_destroy_srq failed: {}",
            io::Error::from_raw_os_error(errno)
        );
    }
}

/// SAFETY: owned handle
unsafe impl Send for SharedReceiveQueue {}

/// SAFETY: owned handle
unsafe impl Sync for SharedReceiveQueue {}
