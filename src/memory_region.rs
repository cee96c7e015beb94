use crate::access::{flags_into_ibv_access, AccessFlag};
use crate::error_utilities::check_ptr;
use crate::ffi::ibv_mr;
use crate::protection_domain::ProtectionDomain;
use clippy_utilities::Cast;
use enumflags2::BitFlags;
use std::fmt::Debug;
use std::io;
use std::{ptr::NonNull, sync::Arc};

/// Registered Memory Region
pub struct MemoryRegion {
    /// the internal `ibv_mr` pointer
    inner_mr: NonNull<ibv_mr>,
    /// the addr of the memory region
    addr: *mut u8,
    /// the len of the memory region
    len: usize,
    /// the protection domain the memory region belongs to
    _pd: Arc<ProtectionDomain>,
}

impl MemoryRegion {
    /// Register a memory region in the protection domain
    ///
    /// On failure of `ibv_reg_mr`, errno indicates the failure reason:
    ///
    /// `EINVAL`    Invalid access value
    ///
    /// `ENOMEM`    Not enough resources to complete this operation
    ///
    /// # Safety
    ///
    /// `addr..addr + len` must stay valid and owned by the caller for the
    /// lifetime of the returned region; the adapter reads and writes it
    /// directly.
    pub unsafe fn register(
        pd: &Arc<ProtectionDomain>,
        addr: *mut u8,
        len: usize,
        access: BitFlags<AccessFlag>,
    ) -> io::Result<Self> {
        let access = flags_into_ibv_access(access);
        let inner_mr = check_ptr("ibv_reg_mr", || {
            // SAFETY: ffi
            pd.ctx
                .verbs()
                .reg_mr(pd.as_ptr(), addr.cast(), len, access.cast())
        })?;
        Ok(Self {
            inner_mr,
            addr,
            len,
            _pd: Arc::<ProtectionDomain>::clone(pd),
        })
    }

    /// Start address of the region
    #[allow(clippy::as_conversions)]
    pub fn addr(&self) -> usize {
        self.addr as usize
    }

    /// Length of the region in bytes
    pub fn length(&self) -> usize {
        self.len
    }

    /// Local key, for work requests posted by this side
    pub fn lkey(&self) -> u32 {
        // SAFETY: lkey sits in the stable leading part of `ibv_mr`
        unsafe { self.inner_mr.as_ref().lkey }
    }

    /// Remote key, handed to the peer for one-sided access
    pub fn rkey(&self) -> u32 {
        // SAFETY: rkey sits in the stable leading part of `ibv_mr`
        unsafe { self.inner_mr.as_ref().rkey }
    }
}

impl Debug for MemoryRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryRegion")
            .field("inner_mr", &self.inner_mr)
            .finish()
    }
}

/// SAFETY: owned handle
unsafe impl Sync for MemoryRegion {}

/// SAFETY: owned handle
unsafe impl Send for MemoryRegion {}

impl Drop for MemoryRegion {
    fn drop(&mut self) {
        // SAFETY: ffi
        let errno = unsafe { self._pd.ctx.verbs().dereg_mr(self.inner_mr.as_ptr()) };
        assert_eq!(
            errno,
            0_i32,
            "ibv_dereg_mr failed: {}",
            io::Error::from_raw_os_error(errno)
        );
    }
}
