use crate::{context::Context, error_utilities::check_ptr, ffi::ibv_cq};
use clippy_utilities::Cast;
use std::{fmt, io, ptr, ptr::NonNull, sync::Arc};

/// Minimum number of entries CQ will support
pub const DEFAULT_CQ_SIZE: u32 = 1024_u32;

/// Complete Queue Structure
pub struct CompletionQueue {
    /// The device context
    ctx: Arc<Context>,
    /// Real Completion Queue
    inner_cq: NonNull<ibv_cq>,
}

impl CompletionQueue {
    /// Get the internal cq ptr
    pub(crate) fn as_ptr(&self) -> *mut ibv_cq {
        self.inner_cq.as_ptr()
    }

    /// Create a new completion queue, `cq_size` is the buffer size of the
    /// completion queue
    ///
    /// On failure of `ibv_create_cq`, errno indicates the failure reason:
    ///
    /// `EINVAL`    Invalid cqe, channel or `comp_vector`
    ///
    /// `ENOMEM`    Not enough resources to complete this operation
    pub fn create(ctx: &Arc<Context>, cq_size: u32) -> io::Result<Self> {
        let inner_cq = check_ptr("ibv_create_cq", || {
            // SAFETY: ffi
            unsafe {
                ctx.verbs().create_cq(
                    ctx.as_ptr(),
                    cq_size.cast(),
                    ptr::null_mut(),
                    ptr::null_mut(),
                    0_i32,
                )
            }
        })?;
        Ok(Self {
            ctx: Arc::<Context>::clone(ctx),
            inner_cq,
        })
    }
}

impl fmt::Debug for CompletionQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionQueue")
            .field("inner_cq", &self.inner_cq)
            .finish()
    }
}

impl Drop for CompletionQueue {
    fn drop(&mut self) {
        // SAFETY: ffi
        let errno = unsafe { self.ctx.verbs().destroy_cq(self.as_ptr()) };
        assert_eq!(
            errno,
            0_i32,
            "ibv_destroy_cq failed: {}",
            io::Error::from_raw_os_error(errno)
        );
    }
}

/// SAFETY: owned handle
unsafe impl Send for CompletionQueue {}

/// SAFETY: owned handle
unsafe impl Sync for CompletionQueue {}
