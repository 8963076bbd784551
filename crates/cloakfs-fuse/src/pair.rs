//! The file pair: ciphertext handle + plaintext shadow.
//!
//! Every open regular file is backed by two descriptors: the authoritative
//! ciphertext file on the backing store and an ephemeral scratch file
//! holding the current plaintext. Reads and writes hit the scratch file
//! only; the ciphertext is rewritten whole whenever dirty plaintext is
//! flushed.
//!
//! The two transforms (`decrypt_into_plain`, `encrypt_from_plain`) run
//! mid-session from flush and fsync, so they must be invisible to the file
//! positions user code observes. Hence the save/rewind/transform/restore
//! dance on both handles: the cipher streams over `dup`ed descriptors
//! (which share the file offset), and the saved offsets are put back
//! afterwards, best-effort even on failure.

use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Seek, SeekFrom, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{AsRawFd, IntoRawFd};
use std::path::{Path, PathBuf};

use cloakfs_core::{crypto, FileKey};
use libc::c_int;
use tracing::{debug, trace};

use crate::error::FsResult;
use crate::oslib;

/// Permissions for the scratch file: private to the mounting user.
const SCRATCH_MODE: u32 = 0o600;

/// Open flags that `OpenOptions` models through dedicated methods and must
/// not be replayed via `custom_flags`.
const MODELED_FLAGS: i32 = libc::O_ACCMODE | libc::O_CREAT | libc::O_TRUNC;

/// A ciphertext/plaintext handle pair for one open-file session.
#[derive(Debug)]
pub struct FilePair {
    enc: File,
    plain: File,
    plain_path: PathBuf,
    dirty: bool,
}

/// Opens the backing ciphertext file.
///
/// `creating` adds create semantics and the caller's mode. A write-only
/// access mode is upgraded to read-write: both transforms have to read the
/// handle they are about to overwrite. The upgrade is observable — callers
/// passing `O_WRONLY` end up with a readable descriptor — and is part of
/// the contract.
fn open_backing(path: &Path, flags: u32, creating: Option<u32>) -> io::Result<File> {
    let flags = flags as i32;
    let access = flags & libc::O_ACCMODE;

    let mut opts = OpenOptions::new();
    match access {
        libc::O_RDONLY => {
            opts.read(true);
        }
        libc::O_WRONLY => {
            debug!(?path, "upgrading O_WRONLY to O_RDWR");
            opts.read(true).write(true);
        }
        _ => {
            opts.read(true).write(true);
        }
    }
    if let Some(mode) = creating {
        opts.create(true).mode(mode & 0o7777);
        if flags & libc::O_TRUNC != 0 {
            opts.truncate(true);
        }
    }
    opts.custom_flags(flags & !MODELED_FLAGS);
    opts.open(path)
}

/// Opens the scratch file: read-write, created, truncated, private mode.
fn open_scratch(path: &Path) -> io::Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .mode(SCRATCH_MODE)
        .open(path)
}

impl FilePair {
    /// Creates a new pair for a file being born: the backing file is opened
    /// with the caller's flags and mode (creation semantics included), the
    /// scratch starts empty.
    ///
    /// The caller is responsible for writing the initial ciphertext (an
    /// encrypt of the empty scratch) so the backing file is valid.
    pub fn create(
        enc_path: &Path,
        scratch_path: &Path,
        flags: u32,
        mode: u32,
    ) -> io::Result<Self> {
        let enc = open_backing(enc_path, flags, Some(mode))?;
        let plain = open_scratch(scratch_path)?;
        Ok(Self {
            enc,
            plain,
            plain_path: scratch_path.to_path_buf(),
            dirty: false,
        })
    }

    /// Opens a pair for an existing backing file. No creation; the scratch
    /// starts empty and the caller populates it with a decrypt.
    pub fn open(enc_path: &Path, scratch_path: &Path, flags: u32) -> io::Result<Self> {
        let enc = open_backing(enc_path, flags, None)?;
        let plain = open_scratch(scratch_path)?;
        Ok(Self {
            enc,
            plain,
            plain_path: scratch_path.to_path_buf(),
            dirty: false,
        })
    }

    /// The ciphertext handle.
    pub fn enc(&self) -> &File {
        &self.enc
    }

    /// The plaintext handle.
    pub fn plain(&self) -> &File {
        &self.plain
    }

    /// The scratch path, retained so `release` can unlink it.
    pub fn plain_path(&self) -> &Path {
        &self.plain_path
    }

    /// Whether the plaintext has unflushed changes.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Marks the plaintext as modified relative to the ciphertext.
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// Refreshes the scratch file from the ciphertext.
    ///
    /// Offset-transparent: both handles end up at the positions they held
    /// on entry. The dirty flag is left untouched.
    pub fn decrypt_into_plain(&mut self, key: &FileKey) -> FsResult<()> {
        let enc_offset = self.enc.stream_position()?;
        let plain_offset = self.plain.stream_position()?;

        let transformed = self.run_decrypt(key);

        // Restore offsets even when the transform failed; the first error
        // observed wins.
        let enc_restored = self.enc.seek(SeekFrom::Start(enc_offset));
        let plain_restored = self.plain.seek(SeekFrom::Start(plain_offset));

        transformed?;
        enc_restored?;
        plain_restored?;
        Ok(())
    }

    fn run_decrypt(&mut self, key: &FileKey) -> FsResult<()> {
        self.enc.seek(SeekFrom::Start(0))?;
        self.plain.seek(SeekFrom::Start(0))?;
        self.plain.set_len(0)?;

        // Duplicate descriptors so the streams can be buffered and dropped
        // without closing the session handles.
        let mut src = BufReader::new(self.enc.try_clone()?);
        let mut dst = BufWriter::new(self.plain.try_clone()?);
        let n = crypto::decrypt(&mut src, &mut dst, key)?;
        dst.flush()?;
        trace!(bytes = n, scratch = %self.plain_path.display(), "refreshed plaintext");
        Ok(())
    }

    /// Rewrites the ciphertext from the scratch file.
    ///
    /// Offset-transparent like [`decrypt_into_plain`](Self::decrypt_into_plain).
    /// Clears the dirty flag on success.
    pub fn encrypt_from_plain(&mut self, key: &FileKey) -> FsResult<()> {
        let plain_offset = self.plain.stream_position()?;
        let enc_offset = self.enc.stream_position()?;

        let transformed = self.run_encrypt(key);

        let plain_restored = self.plain.seek(SeekFrom::Start(plain_offset));
        let enc_restored = self.enc.seek(SeekFrom::Start(enc_offset));

        transformed?;
        plain_restored?;
        enc_restored?;

        self.dirty = false;
        Ok(())
    }

    fn run_encrypt(&mut self, key: &FileKey) -> FsResult<()> {
        self.plain.seek(SeekFrom::Start(0))?;
        self.enc.seek(SeekFrom::Start(0))?;
        self.enc.set_len(0)?;

        let mut src = BufReader::new(self.plain.try_clone()?);
        let mut dst = BufWriter::new(self.enc.try_clone()?);
        let n = crypto::encrypt(&mut src, &mut dst, key)?;
        dst.flush()?;
        trace!(bytes = n, scratch = %self.plain_path.display(), "persisted ciphertext");
        Ok(())
    }

    /// The POSIX close-flush emulation: `dup` then close each descriptor,
    /// so close-sensitive backing stores observe a close event while the
    /// session descriptors stay open across repeated flushes.
    pub fn flush_handles(&self) -> io::Result<()> {
        oslib::dup_close(self.plain.as_raw_fd())?;
        oslib::dup_close(self.enc.as_raw_fd())?;
        Ok(())
    }

    /// Applies `flock(2)` to the plaintext handle — the stable per-session
    /// descriptor the client effectively sees.
    pub fn flock(&self, operation: c_int) -> io::Result<()> {
        oslib::flock(self.plain.as_raw_fd(), operation)
    }

    /// Applies a POSIX record-lock command to the plaintext handle.
    pub fn posix_lock(&self, cmd: c_int, lock: &mut libc::flock) -> io::Result<()> {
        oslib::fcntl_lock(self.plain.as_raw_fd(), cmd, lock)
    }

    /// Closes both descriptors, reporting close errors. Does not unlink
    /// the scratch file.
    pub fn close(self) -> io::Result<()> {
        let enc_closed = oslib::close(self.enc.into_raw_fd());
        let plain_closed = oslib::close(self.plain.into_raw_fd());
        enc_closed.and(plain_closed)
    }
}
