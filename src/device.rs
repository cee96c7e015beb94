use crate::context::Context;
use crate::error_utilities::{check_void, last_error};
use crate::ffi::{
    ibv_device, ibv_port_state, IBV_LINK_LAYER_ETHERNET, IBV_LINK_LAYER_INFINIBAND,
};
use crate::verbs::Verbs;

use std::ffi::CStr;
use std::io;
use std::ops::Deref;
use std::os::raw::c_int;
use std::ptr::NonNull;
use std::sync::Arc;
use std::{fmt, mem, slice};

use numeric_cast::NumericCast;
use scopeguard::{guard, ScopeGuard};
use tracing::debug;

/// The RDMA devices usable for transport.
///
/// Holds the native enumeration buffer for as long as any [`Device`] borrowed
/// from it may be in use; only the entries that passed the port filter are
/// exposed.
pub struct DeviceList {
    /// The capability table the enumeration came from
    verbs: Arc<dyn Verbs>,
    /// Enumeration buffer, released on drop
    arr: NonNull<*mut ibv_device>,
    /// Entries with a usable port, in enumeration order
    usable: Vec<Device>,
}

/// SAFETY: owned buffer
unsafe impl Send for DeviceList {}
/// SAFETY: owned buffer
unsafe impl Sync for DeviceList {}

/// A RDMA device
pub struct Device {
    /// The capability table the device was enumerated by
    verbs: Arc<dyn Verbs>,
    /// Entry in the enumeration buffer
    dev: NonNull<ibv_device>,
}

/// SAFETY: owned type
unsafe impl Send for Device {}
/// SAFETY: owned type
unsafe impl Sync for Device {}

/// A RDMA device guid
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct Guid(u64);

impl DeviceList {
    /// Returns the rdma devices whose port `port_num` is usable for transport.
    ///
    /// Every enumerated device is probed: it is opened and the port's
    /// attributes are queried. Devices that fail to open are skipped (one
    /// broken adapter must not abort discovery on a multi-adapter host), as
    /// are devices whose port link layer is neither InfiniBand nor Ethernet
    /// or whose port is not active. A failed port query is an error.
    ///
    /// On failure of `ibv_get_device_list`, errno indicates the failure
    /// reason. Old versions of libibverbs reported `ENOSYS` with the sign
    /// flipped when the kernel module was missing; that spelling is
    /// normalized here.
    #[inline]
    pub fn available(verbs: &Arc<dyn Verbs>, port_num: u8) -> io::Result<Self> {
        // SAFETY: ffi
        unsafe {
            let mut num_devices: c_int = 0;
            let arr = verbs.get_device_list(&mut num_devices);
            if arr.is_null() {
                let err = last_error();
                return Err(match err.raw_os_error() {
                    Some(code) if code == -libc::ENOSYS => {
                        io::Error::from_raw_os_error(libc::ENOSYS)
                    }
                    _ => err,
                });
            }
            let arr = NonNull::new_unchecked(arr);

            // Free the buffer again on every failure path below.
            let arr = guard(arr, |arr| verbs.free_device_list(arr.as_ptr()));

            let len: usize = num_devices.numeric_cast();

            if mem::size_of::<c_int>() >= mem::size_of::<usize>() {
                let total_size = len.saturating_mul(mem::size_of::<*mut ibv_device>());
                assert!(total_size < usize::MAX.wrapping_div(2));
            }

            let mut usable = Vec::with_capacity(len);
            for &ptr in slice::from_raw_parts(arr.as_ptr(), len) {
                // SAFETY: the first `len` entries of the enumeration are non-null
                let device = Device {
                    verbs: Arc::clone(verbs),
                    dev: NonNull::new_unchecked(ptr),
                };
                let ctx = match Context::open(verbs, &device) {
                    Ok(ctx) => ctx,
                    Err(err) => {
                        debug!("failed to open device {}, skip it: {}", device.name(), err);
                        continue;
                    }
                };
                let port_attr = ctx.query_port(port_num)?;
                if port_attr.link_layer != IBV_LINK_LAYER_INFINIBAND
                    && port_attr.link_layer != IBV_LINK_LAYER_ETHERNET
                {
                    debug!(
                        "device {} port {} link layer is neither InfiniBand nor Ethernet, skip it",
                        device.name(),
                        port_num
                    );
                    continue;
                }
                if port_attr.state != ibv_port_state::IBV_PORT_ACTIVE {
                    debug!(
                        "device {} port {} state is {}, skip it",
                        device.name(),
                        port_num,
                        port_state_str(port_attr.state)
                    );
                    continue;
                }
                usable.push(device);
            }

            Ok(Self {
                verbs: Arc::clone(verbs),
                arr: ScopeGuard::into_inner(arr),
                usable,
            })
        }
    }

    /// Returns the slice of usable devices
    #[inline]
    #[must_use]
    pub fn as_slice(&self) -> &[Device] {
        &self.usable
    }
}

impl Drop for DeviceList {
    #[inline]
    fn drop(&mut self) {
        self.usable.clear();
        check_void(|| {
            // SAFETY: ffi
            unsafe { self.verbs.free_device_list(self.arr.as_ptr()) }
        });
    }
}

impl Deref for DeviceList {
    type Target = [Device];

    #[inline]
    fn deref(&self) -> &Self::Target {
        self.as_slice()
    }
}

impl fmt::Debug for DeviceList {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        <[Device] as fmt::Debug>::fmt(self, f)
    }
}

impl Device {
    /// Returns `*mut ibv_device`
    pub(crate) fn ffi_ptr(&self) -> *mut ibv_device {
        self.dev.as_ptr()
    }

    /// Returns kernel device name
    #[inline]
    #[must_use]
    pub fn c_name(&self) -> &CStr {
        // SAFETY: ffi
        unsafe { CStr::from_ptr(self.verbs.get_device_name(self.ffi_ptr())) }
    }

    /// Returns kernel device name
    ///
    /// # Panics
    /// + if the device name is not a valid utf8 string
    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        #[allow(clippy::expect_used)]
        self.c_name().to_str().expect("non-utf8 device name")
    }

    /// Returns device's node GUID
    #[inline]
    #[must_use]
    pub fn guid(&self) -> Guid {
        // SAFETY: ffi
        unsafe { Guid(self.verbs.get_device_guid(self.ffi_ptr())) }
    }
}

impl fmt::Debug for Device {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = self.name();
        let guid = self.guid();
        f.debug_struct("Device")
            .field("name", &name)
            .field("guid", &guid)
            .finish()
    }
}

impl Guid {
    /// Constructs a Guid from network bytes.
    #[inline]
    #[must_use]
    pub fn from_bytes(bytes: [u8; 8]) -> Self {
        Self(u64::from_ne_bytes(bytes))
    }

    /// Returns the bytes of GUID in network byte order.
    #[inline]
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 8] {
        // SAFETY: transparent be64
        unsafe { &*<*const _>::cast(self) }
    }
}

impl fmt::Debug for Guid {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Guid({:x})", self)
    }
}

/// Encodes a guid to a hex string and process it
fn guid_to_hex<R>(guid: Guid, uppercase: bool, f: impl FnOnce(&str) -> R) -> R {
    let src: &[u8; 8] = guid.as_bytes();
    let mut buf: [u8; 16] = [0; 16];
    // SAFETY: The buf is two times of src, which is required by hex::encode_to_slice.
    // After the hex encoding, the bytes in buf are in the ASCII range and
    // therefore valid UTF-8.
    let ans = unsafe {
        hex::encode_to_slice(src, &mut buf).unwrap_unchecked();
        if uppercase {
            std::str::from_utf8(&buf).unwrap_unchecked().to_uppercase()
        } else {
            std::str::from_utf8(&buf).unwrap_unchecked().to_lowercase()
        }
    };
    f(&ans)
}

impl fmt::LowerHex for Guid {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        guid_to_hex(*self, false, |s| <str as fmt::Display>::fmt(s, f))
    }
}

impl fmt::UpperHex for Guid {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        guid_to_hex(*self, true, |s| <str as fmt::Display>::fmt(s, f))
    }
}

/// Human-readable port state, for the skip logs
fn port_state_str(state: ibv_port_state::Type) -> &'static str {
    match state {
        ibv_port_state::IBV_PORT_NOP => "no-op",
        ibv_port_state::IBV_PORT_DOWN => "down",
        ibv_port_state::IBV_PORT_INIT => "init",
        ibv_port_state::IBV_PORT_ARMED => "armed",
        ibv_port_state::IBV_PORT_ACTIVE => "active",
        ibv_port_state::IBV_PORT_ACTIVE_DEFER => "active-defer",
        _ => "unknown",
    }
}
