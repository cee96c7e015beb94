use crate::ffi::ibv_access_flags;
use enumflags2::{bitflags, BitFlags};

/// A wrapper for `ibv_access_flag`, hide the ibv binding types
#[bitflags]
#[repr(u64)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AccessFlag {
    /// local write permission
    LocalWrite,
    /// remote write permission
    RemoteWrite,
    /// remote read permission
    RemoteRead,
    /// remote atomic operation permission
    RemoteAtomic,
    /// enable memory window binding
    MwBind,
    /// use byte offset from beginning of MR to access this MR, instead of a pointer address
    ZeroBased,
}

/// Convert `BitFlags<AccessFlag>` into native access bits
#[inline]
#[must_use]
pub(crate) fn flags_into_ibv_access(flags: BitFlags<AccessFlag>) -> ibv_access_flags::Type {
    let mut ret = 0;
    if flags.contains(AccessFlag::LocalWrite) {
        ret |= ibv_access_flags::IBV_ACCESS_LOCAL_WRITE;
    }
    if flags.contains(AccessFlag::RemoteWrite) {
        ret |= ibv_access_flags::IBV_ACCESS_REMOTE_WRITE;
    }
    if flags.contains(AccessFlag::RemoteRead) {
        ret |= ibv_access_flags::IBV_ACCESS_REMOTE_READ;
    }
    if flags.contains(AccessFlag::RemoteAtomic) {
        ret |= ibv_access_flags::IBV_ACCESS_REMOTE_ATOMIC;
    }
    if flags.contains(AccessFlag::MwBind) {
        ret |= ibv_access_flags::IBV_ACCESS_MW_BIND;
    }
    if flags.contains(AccessFlag::ZeroBased) {
        ret |= ibv_access_flags::IBV_ACCESS_ZERO_BASED;
    }
    ret
}
