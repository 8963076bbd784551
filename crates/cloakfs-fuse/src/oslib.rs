//! Thin safe wrappers over the libc calls std does not cover.
//!
//! Everything returns `io::Result` with the errno captured via
//! `Error::last_os_error()`, so callers can propagate the code verbatim to
//! the multiplexer.

use std::ffi::{CStr, CString, OsString};
use std::io::{Error, Result};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::os::unix::io::RawFd;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

/// Checks the return value of a C function call, wrapping the errno code
/// as the error.
fn check_retval<T: From<i8> + PartialEq>(t: T) -> Result<T> {
    if t == T::from(-1_i8) {
        Err(Error::last_os_error())
    } else {
        Ok(t)
    }
}

fn cstring(path: &Path) -> Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| Error::from_raw_os_error(libc::EINVAL))
}

/// Safe wrapper for `access(2)`.
pub fn access(path: &Path, mask: u32) -> Result<()> {
    let path = cstring(path)?;
    // SAFETY: `path` is a valid NUL-terminated string.
    check_retval(unsafe { libc::access(path.as_ptr(), mask as libc::c_int) })?;
    Ok(())
}

/// Safe wrapper for `mknod(2)`.
pub fn mknod(path: &Path, mode: u32, rdev: u64) -> Result<()> {
    let path = cstring(path)?;
    // SAFETY: `path` is a valid NUL-terminated string.
    check_retval(unsafe {
        libc::mknod(path.as_ptr(), mode as libc::mode_t, rdev as libc::dev_t)
    })?;
    Ok(())
}

/// Safe wrapper for `mkfifo(3)`.
pub fn mkfifo(path: &Path, mode: u32) -> Result<()> {
    let path = cstring(path)?;
    // SAFETY: `path` is a valid NUL-terminated string.
    check_retval(unsafe { libc::mkfifo(path.as_ptr(), mode as libc::mode_t) })?;
    Ok(())
}

/// Safe wrapper for `lchown(2)`. `None` leaves the corresponding id
/// unchanged.
pub fn lchown(path: &Path, uid: Option<u32>, gid: Option<u32>) -> Result<()> {
    let path = cstring(path)?;
    let uid = uid.unwrap_or(libc::uid_t::MAX);
    let gid = gid.unwrap_or(libc::gid_t::MAX);
    // SAFETY: `path` is a valid NUL-terminated string.
    check_retval(unsafe { libc::lchown(path.as_ptr(), uid, gid) })?;
    Ok(())
}

fn timespec_from(time: Option<SystemTime>) -> libc::timespec {
    let Some(time) = time else {
        return libc::timespec {
            tv_sec: 0,
            tv_nsec: libc::UTIME_OMIT,
        };
    };
    match time.duration_since(UNIX_EPOCH) {
        Ok(d) => libc::timespec {
            tv_sec: d.as_secs() as libc::time_t,
            tv_nsec: libc::c_long::from(d.subsec_nanos()),
        },
        // Pre-epoch timestamps: round towards minus infinity.
        Err(e) => {
            let d = e.duration();
            let secs = d.as_secs() as libc::time_t;
            let nanos = libc::c_long::from(d.subsec_nanos());
            if nanos == 0 {
                libc::timespec { tv_sec: -secs, tv_nsec: 0 }
            } else {
                libc::timespec {
                    tv_sec: -secs - 1,
                    tv_nsec: 1_000_000_000 - nanos,
                }
            }
        }
    }
}

/// Safe wrapper for `utimensat(2)` with `AT_SYMLINK_NOFOLLOW`.
///
/// `None` for either timestamp leaves it untouched (`UTIME_OMIT`).
pub fn utimensat_nofollow(
    path: &Path,
    atime: Option<SystemTime>,
    mtime: Option<SystemTime>,
) -> Result<()> {
    let path = cstring(path)?;
    let times = [timespec_from(atime), timespec_from(mtime)];
    // SAFETY: `path` is a valid NUL-terminated string and `times` points to
    // two timespec values.
    check_retval(unsafe {
        libc::utimensat(
            libc::AT_FDCWD,
            path.as_ptr(),
            times.as_ptr(),
            libc::AT_SYMLINK_NOFOLLOW,
        )
    })?;
    Ok(())
}

/// Safe wrapper for `statvfs(3)`.
pub fn statvfs(path: &Path) -> Result<libc::statvfs> {
    let path = cstring(path)?;
    let mut out = std::mem::MaybeUninit::<libc::statvfs>::uninit();
    // SAFETY: `path` is a valid NUL-terminated string and `out` is a valid
    // statvfs output buffer.
    check_retval(unsafe { libc::statvfs(path.as_ptr(), out.as_mut_ptr()) })?;
    // SAFETY: statvfs returned success, so `out` is initialized.
    Ok(unsafe { out.assume_init() })
}

/// Safe wrapper for `umask(2)`.
pub fn umask(mask: libc::mode_t) -> libc::mode_t {
    // SAFETY: this call doesn't modify any memory and always succeeds.
    unsafe { libc::umask(mask) }
}

/// Safe wrapper for `flock(2)`.
pub fn flock(fd: RawFd, operation: libc::c_int) -> Result<()> {
    // SAFETY: `fd` is a live descriptor owned by the caller.
    check_retval(unsafe { libc::flock(fd, operation) })?;
    Ok(())
}

/// Safe wrapper for the `fcntl(2)` record-lock commands
/// (`F_GETLK`/`F_SETLK`/`F_SETLKW`).
pub fn fcntl_lock(fd: RawFd, cmd: libc::c_int, lock: &mut libc::flock) -> Result<()> {
    // SAFETY: `fd` is a live descriptor and `lock` is a valid flock struct.
    check_retval(unsafe { libc::fcntl(fd, cmd, std::ptr::from_mut(lock)) })?;
    Ok(())
}

/// Safe wrapper for `close(2)`, reporting the close error.
///
/// The descriptor is consumed regardless of the outcome.
pub fn close(fd: RawFd) -> Result<()> {
    // SAFETY: the caller transfers ownership of `fd`.
    check_retval(unsafe { libc::close(fd) })?;
    Ok(())
}

/// Duplicates `fd` and immediately closes the duplicate.
///
/// This is the POSIX close-flush emulation: backends watching for close
/// events (network filesystems in particular) observe one, while the
/// original descriptor stays open.
pub fn dup_close(fd: RawFd) -> Result<()> {
    let duped = check_retval(unsafe { libc::dup(fd) })?;
    close(duped)
}

/// A raw directory entry as read from the stream.
#[derive(Debug, Clone)]
pub struct RawDirEntry {
    /// Entry name (no path components).
    pub name: OsString,
    /// Inode number.
    pub ino: u64,
    /// `DT_*` type tag; `DT_UNKNOWN` on filesystems that do not fill it.
    pub d_type: u8,
}

/// An open directory stream (`DIR *`).
#[derive(Debug)]
pub struct DirStream {
    dir: *mut libc::DIR,
}

// The stream moves between callback threads behind the handle table, which
// hands out exclusive references only; it is never used from two threads at
// once, and a shared reference exposes no operations.
unsafe impl Send for DirStream {}
unsafe impl Sync for DirStream {}

impl DirStream {
    /// Safe wrapper for `opendir(3)`.
    pub fn open(path: &Path) -> Result<Self> {
        let path = cstring(path)?;
        // SAFETY: `path` is a valid NUL-terminated string.
        let dir = unsafe { libc::opendir(path.as_ptr()) };
        if dir.is_null() {
            Err(Error::last_os_error())
        } else {
            Ok(Self { dir })
        }
    }

    /// Safe wrapper for `rewinddir(3)`.
    pub fn rewind(&mut self) {
        // SAFETY: `self.dir` is an open directory stream.
        unsafe { libc::rewinddir(self.dir) }
    }

    /// Reads the next entry; `None` at end of stream.
    pub fn next_entry(&mut self) -> Option<RawDirEntry> {
        // SAFETY: `self.dir` is an open directory stream.
        let entry = unsafe { libc::readdir(self.dir) };
        if entry.is_null() {
            return None;
        }
        // SAFETY: readdir returned a valid dirent whose d_name is
        // NUL-terminated.
        let (name, ino, d_type) = unsafe {
            (
                CStr::from_ptr((*entry).d_name.as_ptr()).to_bytes().to_vec(),
                (*entry).d_ino,
                (*entry).d_type,
            )
        };
        Some(RawDirEntry {
            name: OsString::from_vec(name),
            ino,
            d_type,
        })
    }
}

impl Drop for DirStream {
    fn drop(&mut self) {
        // SAFETY: `self.dir` is an open directory stream, closed exactly
        // once here.
        unsafe {
            libc::closedir(self.dir);
        }
    }
}

#[cfg(target_os = "linux")]
mod xattr {
    use super::{check_retval, cstring, Error, Path, Result};
    use std::ffi::OsStr;
    use std::os::unix::ffi::OsStrExt;

    /// Safe wrapper for `lsetxattr(2)`.
    pub fn lsetxattr(path: &Path, name: &OsStr, value: &[u8], flags: u32) -> Result<()> {
        let path = cstring(path)?;
        let name = super::CString::new(name.as_bytes())
            .map_err(|_| Error::from_raw_os_error(libc::EINVAL))?;
        // SAFETY: both strings are valid and NUL-terminated; `value` is a
        // readable buffer of the given length.
        check_retval(unsafe {
            libc::lsetxattr(
                path.as_ptr(),
                name.as_ptr(),
                value.as_ptr().cast(),
                value.len(),
                flags as libc::c_int,
            )
        })?;
        Ok(())
    }

    /// Safe wrapper for `lgetxattr(2)`.
    ///
    /// With `buf = None` this is the size probe.
    pub fn lgetxattr(path: &Path, name: &OsStr, buf: Option<&mut [u8]>) -> Result<usize> {
        let path = cstring(path)?;
        let name = super::CString::new(name.as_bytes())
            .map_err(|_| Error::from_raw_os_error(libc::EINVAL))?;
        let (ptr, len) = match buf {
            Some(buf) => (buf.as_mut_ptr().cast(), buf.len()),
            None => (std::ptr::null_mut(), 0),
        };
        // SAFETY: strings are valid; `ptr`/`len` describe a writable buffer
        // or the null size probe.
        let n = check_retval(unsafe { libc::lgetxattr(path.as_ptr(), name.as_ptr(), ptr, len) })?;
        Ok(n as usize)
    }

    /// Safe wrapper for `llistxattr(2)`.
    ///
    /// With `buf = None` this is the size probe.
    pub fn llistxattr(path: &Path, buf: Option<&mut [u8]>) -> Result<usize> {
        let path = cstring(path)?;
        let (ptr, len) = match buf {
            Some(buf) => (buf.as_mut_ptr().cast(), buf.len()),
            None => (std::ptr::null_mut(), 0),
        };
        // SAFETY: `path` is valid; `ptr`/`len` describe a writable buffer
        // or the null size probe.
        let n = check_retval(unsafe { libc::llistxattr(path.as_ptr(), ptr, len) })?;
        Ok(n as usize)
    }

    /// Safe wrapper for `lremovexattr(2)`.
    pub fn lremovexattr(path: &Path, name: &OsStr) -> Result<()> {
        let path = cstring(path)?;
        let name = super::CString::new(name.as_bytes())
            .map_err(|_| Error::from_raw_os_error(libc::EINVAL))?;
        // SAFETY: both strings are valid and NUL-terminated.
        check_retval(unsafe { libc::lremovexattr(path.as_ptr(), name.as_ptr()) })?;
        Ok(())
    }
}

#[cfg(target_os = "linux")]
pub use xattr::{lgetxattr, llistxattr, lremovexattr, lsetxattr};
