use crate::{
    completion_queue::CompletionQueue,
    context::Context,
    error_utilities::check_ptr,
    ffi::ibv_pd,
    queue_pair::{QueuePair, QueuePairInitAttr},
    shared_receive_queue::SharedReceiveQueue,
};
use std::{fmt, io, ptr::NonNull, sync::Arc};

/// Protection Domain Wrapper
pub struct ProtectionDomain {
    /// The device context
    pub(crate) ctx: Arc<Context>,
    /// Internal `ibv_pd` pointer
    inner_pd: NonNull<ibv_pd>,
}

impl ProtectionDomain {
    /// Get pointer to the internal `ibv_pd`
    pub(crate) fn as_ptr(&self) -> *mut ibv_pd {
        self.inner_pd.as_ptr()
    }

    /// Allocate a protection domain on the device
    pub fn create(ctx: &Arc<Context>) -> io::Result<Self> {
        let inner_pd = check_ptr("ibv_alloc_pd", || {
            // SAFETY: ffi
            unsafe { ctx.verbs().alloc_pd(ctx.as_ptr()) }
        })?;
        Ok(Self {
            ctx: Arc::<Context>::clone(ctx),
            inner_pd,
        })
    }

    /// Create a queue pair inside this protection domain.
    ///
    /// The queue pair starts out in the reset state; drive it with the
    /// `modify_to_*` transitions once the peer's setup information arrives.
    pub fn create_queue_pair(
        self: &Arc<Self>,
        send_cq: &CompletionQueue,
        recv_cq: &CompletionQueue,
        srq: Option<&SharedReceiveQueue>,
        attr: &QueuePairInitAttr,
    ) -> io::Result<QueuePair> {
        QueuePair::create(self, send_cq, recv_cq, srq, attr)
    }

    /// Create a shared receive queue inside this protection domain
    pub fn create_shared_receive_queue(
        self: &Arc<Self>,
        max_wr: u32,
        max_sge: u32,
    ) -> io::Result<SharedReceiveQueue> {
        SharedReceiveQueue::create(self, max_wr, max_sge)
    }
}

impl fmt::Debug for ProtectionDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtectionDomain")
            .field("ctx", &self.ctx)
            .field("inner_pd", &self.inner_pd)
            .finish()
    }
}

impl Drop for ProtectionDomain {
    fn drop(&mut self) {
        // SAFETY: ffi
        let errno = unsafe { self.ctx.verbs().dealloc_pd(self.as_ptr()) };
        assert_eq!(
            errno,
            0_i32,
            "ibv_dealloc_pd failed: {}",
            io::Error::from_raw_os_error(errno)
        );
    }
}

/// SAFETY: owned handle
unsafe impl Send for ProtectionDomain {}

/// SAFETY: owned handle
unsafe impl Sync for ProtectionDomain {}
