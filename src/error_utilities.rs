use libc::c_int;
use std::io;
use std::ptr::NonNull;

use tracing::error;

/// Get the last os error, log with note and return the error
pub(crate) fn log_ret_last_os_err_with_note(note: &str) -> io::Error {
    let err = io::Error::last_os_error();
    if note.is_empty() {
        error!("OS error {:?}", err);
    } else {
        error!("OS error {:?}. Note: {}", err, note);
    }
    err
}

/// Returns an error representing the last OS error which occurred.
pub(crate) fn last_error() -> io::Error {
    io::Error::last_os_error()
}

/// Logs a result and return it back
pub(crate) fn log_ret<T>(ret: io::Result<T>, note: &str) -> io::Result<T> {
    if let Err(ref err) = ret {
        if note.is_empty() {
            error!("OS error {:?}", err);
        } else {
            error!("OS error {:?}. Note: {}", err, note);
        }
    }
    ret
}

/// Run a pointer-returning native call; null becomes the system error left in
/// errno, tagged with the name of the native call.
pub(crate) fn check_ptr<T>(name: &str, op: impl FnOnce() -> *mut T) -> io::Result<NonNull<T>> {
    NonNull::new(op()).ok_or_else(|| log_ret_last_os_err_with_note(name))
}

/// Run a status-returning native call; a nonzero return is the native error
/// code itself.
pub(crate) fn check_int(name: &str, op: impl FnOnce() -> c_int) -> io::Result<()> {
    let rv = op();
    if rv == 0_i32 {
        Ok(())
    } else {
        log_ret(Err(io::Error::from_raw_os_error(rv)), name)
    }
}

/// Run a native call with no failure channel. The third variant of the same
/// adapter family, so every native entry point is invoked through one of them.
pub(crate) fn check_void(op: impl FnOnce()) {
    op();
}
