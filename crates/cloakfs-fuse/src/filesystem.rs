//! The VFS callback layer.
//!
//! [`CloakFs`] implements `fuse_mt::FilesystemMT` over a backing ciphertext
//! tree. Directories, symlinks, permissions, ownership and timestamps pass
//! straight through to the backing store; regular-file contents and their
//! reported sizes are the only things transformed.
//!
//! Regular-file sessions follow the decrypt-on-open / re-encrypt-on-dirty-
//! flush protocol: `open`/`create` build a [`FilePair`], reads and writes
//! hit the plaintext shadow, and the ciphertext is rewritten whole by
//! `flush`/`fsync`/`release` when the shadow is dirty. `release` is the
//! only place the shadow is unlinked.

use std::ffi::OsStr;
use std::fs;
use std::os::unix::fs::{DirBuilderExt, FileExt, MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fuse_mt::{
    CallbackResult, CreatedEntry, FileAttr, FileType, FilesystemMT, RequestInfo, ResultCreate,
    ResultData, ResultEmpty, ResultEntry, ResultOpen, ResultReaddir, ResultSlice, ResultStatfs,
    ResultWrite, Statfs,
};
use libc::c_int;
use tracing::{debug, error, info, trace};

use cloakfs_core::FileKey;

use crate::dir::DirHandle;
use crate::error::{FsError, FsResult};
use crate::handles::HandleTable;
use crate::oslib;
use crate::pair::FilePair;
use crate::paths::PathTranslator;

/// TTL attached to attribute replies.
const ATTR_TTL: Duration = Duration::from_secs(1);

/// Maps a callback-layer failure to the errno channel, logging it once.
fn reply<T>(op: &'static str, result: FsResult<T>) -> Result<T, c_int> {
    result.map_err(|e| {
        let errno = e.to_errno();
        debug!(op, error = %e, errno, "callback failed");
        errno
    })
}

fn file_type_from_mode(mode: u32) -> FileType {
    match mode & libc::S_IFMT {
        libc::S_IFDIR => FileType::Directory,
        libc::S_IFLNK => FileType::Symlink,
        libc::S_IFIFO => FileType::NamedPipe,
        libc::S_IFCHR => FileType::CharDevice,
        libc::S_IFBLK => FileType::BlockDevice,
        libc::S_IFSOCK => FileType::Socket,
        _ => FileType::RegularFile,
    }
}

fn system_time(secs: i64, nanos: i64) -> SystemTime {
    if secs >= 0 {
        UNIX_EPOCH + Duration::new(secs as u64, nanos as u32)
    } else {
        UNIX_EPOCH - Duration::from_secs(secs.unsigned_abs())
    }
}

/// Converts backing-store stat data to the multiplexer's attribute record.
fn attr_from_meta(meta: &fs::Metadata) -> FileAttr {
    FileAttr {
        size: meta.size(),
        blocks: meta.blocks(),
        atime: system_time(meta.atime(), meta.atime_nsec()),
        mtime: system_time(meta.mtime(), meta.mtime_nsec()),
        ctime: system_time(meta.ctime(), meta.ctime_nsec()),
        crtime: system_time(meta.mtime(), meta.mtime_nsec()),
        kind: file_type_from_mode(meta.mode()),
        perm: (meta.mode() & 0o7777) as u16,
        nlink: meta.nlink() as u32,
        uid: meta.uid(),
        gid: meta.gid(),
        rdev: meta.rdev() as u32,
        flags: 0,
    }
}

/// Substitutes the plaintext's size fields into a ciphertext attribute
/// record. Everything else (ownership, permissions, times) is authoritative
/// on the backing file.
fn overlay_size(mut attr: FileAttr, plain_meta: &fs::Metadata) -> FileAttr {
    attr.size = plain_meta.size();
    attr.blocks = plain_meta.blocks();
    attr
}

/// The shadowing filesystem.
pub struct CloakFs {
    paths: PathTranslator,
    key: FileKey,
    files: HandleTable<FilePair>,
    dirs: HandleTable<DirHandle>,
}

impl CloakFs {
    /// Creates a filesystem over an already-canonicalized backing root.
    pub fn new(backing_root: PathBuf, key: FileKey) -> Self {
        Self {
            paths: PathTranslator::new(backing_root),
            key,
            files: HandleTable::new(),
            dirs: HandleTable::new(),
        }
    }

    /// The backing root this filesystem mirrors.
    pub fn backing_root(&self) -> &Path {
        self.paths.root()
    }

    fn backing(&self, path: &Path) -> FsResult<PathBuf> {
        Ok(self.paths.backing(path)?)
    }

    /// Backing and scratch paths for a regular-file operation.
    fn pair_paths(&self, path: &Path) -> FsResult<(PathBuf, PathBuf)> {
        let backing = self.paths.backing(path)?;
        let scratch = PathTranslator::scratch(&backing)?;
        Ok((backing, scratch))
    }

    fn with_pair<R>(&self, fh: u64, f: impl FnOnce(&mut FilePair) -> FsResult<R>) -> FsResult<R> {
        let mut pair = self
            .files
            .get_mut(fh)
            .ok_or(FsError::InvalidHandle(fh))?;
        f(&mut pair)
    }

    /// Positional read from the plaintext shadow. Never touches ciphertext.
    ///
    /// Public so the transfer path can be exercised without a kernel mount.
    pub fn read_at(&self, fh: u64, offset: u64, size: u32) -> FsResult<Vec<u8>> {
        self.with_pair(fh, |pair| {
            let mut buf = vec![0u8; size as usize];
            let mut filled = 0;
            while filled < buf.len() {
                let n = pair.plain().read_at(&mut buf[filled..], offset + filled as u64)?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            buf.truncate(filled);
            Ok(buf)
        })
    }

    /// Positional write to the plaintext shadow; marks the session dirty.
    ///
    /// Persistence happens at flush/fsync/release, not here. Partial write
    /// counts are returned unchanged.
    pub fn write_at(&self, fh: u64, offset: u64, data: &[u8]) -> FsResult<u32> {
        self.with_pair(fh, |pair| {
            let n = pair.plain().write_at(data, offset)?;
            pair.mark_dirty();
            Ok(n as u32)
        })
    }

    fn getattr_path(&self, path: &Path) -> FsResult<FileAttr> {
        let backing = self.backing(path)?;
        let meta = fs::symlink_metadata(&backing)?;
        if !meta.is_file() {
            return Ok(attr_from_meta(&meta));
        }

        // Regular file: decrypt into a temporary shadow just to stat it, so
        // the reported size is the plaintext's rather than the ciphertext's.
        let scratch = PathTranslator::scratch(&backing)?;
        let mut pair = FilePair::open(&backing, &scratch, libc::O_RDONLY as u32)?;
        let plain_meta = pair
            .decrypt_into_plain(&self.key)
            .and_then(|()| pair.plain().metadata().map_err(FsError::from));
        let closed = pair.close().map_err(FsError::from);
        let unlinked = fs::remove_file(&scratch).map_err(FsError::from);

        let plain_meta = plain_meta?;
        closed?;
        unlinked?;
        Ok(overlay_size(attr_from_meta(&meta), &plain_meta))
    }

    fn getattr_fh(&self, fh: u64) -> FsResult<FileAttr> {
        self.with_pair(fh, |pair| {
            let enc_meta = pair.enc().metadata()?;
            let attr = attr_from_meta(&enc_meta);
            if enc_meta.is_file() {
                let plain_meta = pair.plain().metadata()?;
                Ok(overlay_size(attr, &plain_meta))
            } else {
                Ok(attr)
            }
        })
    }

    fn entry_for(&self, backing: &Path) -> FsResult<(Duration, FileAttr)> {
        let meta = fs::symlink_metadata(backing)?;
        Ok((ATTR_TTL, attr_from_meta(&meta)))
    }

    fn open_impl(&self, path: &Path, flags: u32) -> FsResult<(u64, u32)> {
        let (backing, scratch) = self.pair_paths(path)?;
        let mut pair = FilePair::open(&backing, &scratch, flags)?;
        if let Err(e) = pair.decrypt_into_plain(&self.key) {
            error!(path = %path.display(), error = %e, "decrypt on open failed");
            let _ = pair.close();
            let _ = fs::remove_file(&scratch);
            return Err(e);
        }
        let fh = self.files.insert(pair);
        debug!(path = %path.display(), fh, "opened session");
        Ok((fh, flags))
    }

    fn create_impl(
        &self,
        parent: &Path,
        name: &OsStr,
        mode: u32,
        flags: u32,
    ) -> FsResult<CreatedEntry> {
        let virt = parent.join(name);
        let (backing, scratch) = self.pair_paths(&virt)?;
        let mut pair = FilePair::create(&backing, &scratch, flags, mode)?;

        // Write the empty plaintext as ciphertext immediately so a 0-byte
        // virtual file maps to a valid backing file from birth.
        let seeded = pair
            .encrypt_from_plain(&self.key)
            .and_then(|()| pair.enc().metadata().map_err(FsError::from))
            .and_then(|enc_meta| {
                let plain_meta = pair.plain().metadata()?;
                Ok(overlay_size(attr_from_meta(&enc_meta), &plain_meta))
            });
        let attr = match seeded {
            Ok(attr) => attr,
            Err(e) => {
                let _ = pair.close();
                let _ = fs::remove_file(&scratch);
                return Err(e);
            }
        };

        let fh = self.files.insert(pair);
        debug!(path = %virt.display(), fh, "created session");
        Ok(CreatedEntry {
            ttl: ATTR_TTL,
            attr,
            fh,
            flags,
        })
    }

    fn flush_impl(&self, fh: u64) -> FsResult<()> {
        self.with_pair(fh, |pair| {
            if pair.is_dirty() {
                pair.encrypt_from_plain(&self.key)?;
            }
            pair.flush_handles()?;
            Ok(())
        })
    }

    fn fsync_impl(&self, fh: u64, datasync: bool) -> FsResult<()> {
        self.with_pair(fh, |pair| {
            if pair.is_dirty() {
                pair.encrypt_from_plain(&self.key)?;
            }
            if datasync {
                pair.enc().sync_data()?;
            } else {
                pair.enc().sync_all()?;
            }
            Ok(())
        })
    }

    fn release_impl(&self, fh: u64) -> FsResult<()> {
        let mut pair = self.files.remove(fh).ok_or(FsError::InvalidHandle(fh))?;

        // Re-encrypt errors must surface, but scratch removal and handle
        // close are attempted regardless.
        let persisted = if pair.is_dirty() {
            pair.encrypt_from_plain(&self.key)
        } else {
            Ok(())
        };
        let unlinked = fs::remove_file(pair.plain_path()).map_err(FsError::from);
        let closed = pair.close().map_err(FsError::from);

        debug!(fh, "released session");
        persisted.and(unlinked).and(closed)
    }

    fn truncate_path(&self, path: &Path, size: u64) -> FsResult<()> {
        let (backing, scratch) = self.pair_paths(path)?;
        let mut pair = FilePair::open(&backing, &scratch, libc::O_RDWR as u32)?;

        let truncated = pair
            .decrypt_into_plain(&self.key)
            .and_then(|()| pair.plain().set_len(size).map_err(FsError::from))
            .and_then(|()| pair.encrypt_from_plain(&self.key));
        let closed = pair.close().map_err(FsError::from);
        let unlinked = fs::remove_file(&scratch).map_err(FsError::from);

        truncated?;
        closed?;
        unlinked?;
        debug!(path = %path.display(), size, "truncated by path");
        Ok(())
    }

    fn truncate_fh(&self, fh: u64, size: u64) -> FsResult<()> {
        // In-session truncate adjusts the shadow only; the pair persists
        // and re-encryption is deferred to the next flush/fsync/release.
        self.with_pair(fh, |pair| {
            pair.plain().set_len(size)?;
            pair.mark_dirty();
            Ok(())
        })
    }
}

impl FilesystemMT for CloakFs {
    fn init(&self, _req: RequestInfo) -> ResultEmpty {
        info!(root = %self.paths.root().display(), "filesystem initialized");
        Ok(())
    }

    fn destroy(&self) {
        info!("filesystem destroyed");
    }

    fn getattr(&self, _req: RequestInfo, path: &Path, fh: Option<u64>) -> ResultEntry {
        let attr = match fh {
            Some(fh) => reply("fgetattr", self.getattr_fh(fh))?,
            None => reply("getattr", self.getattr_path(path))?,
        };
        Ok((ATTR_TTL, attr))
    }

    fn chmod(&self, _req: RequestInfo, path: &Path, _fh: Option<u64>, mode: u32) -> ResultEmpty {
        reply("chmod", (|| {
            let backing = self.backing(path)?;
            fs::set_permissions(&backing, fs::Permissions::from_mode(mode))?;
            Ok(())
        })())
    }

    fn chown(
        &self,
        _req: RequestInfo,
        path: &Path,
        _fh: Option<u64>,
        uid: Option<u32>,
        gid: Option<u32>,
    ) -> ResultEmpty {
        reply("chown", (|| {
            let backing = self.backing(path)?;
            oslib::lchown(&backing, uid, gid)?;
            Ok(())
        })())
    }

    fn truncate(&self, _req: RequestInfo, path: &Path, fh: Option<u64>, size: u64) -> ResultEmpty {
        match fh {
            Some(fh) => reply("ftruncate", self.truncate_fh(fh, size)),
            None => reply("truncate", self.truncate_path(path, size)),
        }
    }

    fn utimens(
        &self,
        _req: RequestInfo,
        path: &Path,
        _fh: Option<u64>,
        atime: Option<SystemTime>,
        mtime: Option<SystemTime>,
    ) -> ResultEmpty {
        reply("utimens", (|| {
            let backing = self.backing(path)?;
            oslib::utimensat_nofollow(&backing, atime, mtime)?;
            Ok(())
        })())
    }

    fn readlink(&self, _req: RequestInfo, path: &Path) -> ResultData {
        reply("readlink", (|| {
            use std::os::unix::ffi::OsStrExt;
            let backing = self.backing(path)?;
            let target = fs::read_link(&backing)?;
            Ok(target.as_os_str().as_bytes().to_vec())
        })())
    }

    fn mknod(
        &self,
        _req: RequestInfo,
        parent: &Path,
        name: &OsStr,
        mode: u32,
        rdev: u32,
    ) -> ResultEntry {
        reply("mknod", (|| {
            let backing = self.backing(&parent.join(name))?;
            if mode & libc::S_IFMT == libc::S_IFIFO {
                oslib::mkfifo(&backing, mode)?;
            } else {
                oslib::mknod(&backing, mode, u64::from(rdev))?;
            }
            self.entry_for(&backing)
        })())
    }

    fn mkdir(&self, _req: RequestInfo, parent: &Path, name: &OsStr, mode: u32) -> ResultEntry {
        reply("mkdir", (|| {
            let backing = self.backing(&parent.join(name))?;
            fs::DirBuilder::new().mode(mode).create(&backing)?;
            self.entry_for(&backing)
        })())
    }

    fn unlink(&self, _req: RequestInfo, parent: &Path, name: &OsStr) -> ResultEmpty {
        reply("unlink", (|| {
            let backing = self.backing(&parent.join(name))?;
            fs::remove_file(&backing)?;
            Ok(())
        })())
    }

    fn rmdir(&self, _req: RequestInfo, parent: &Path, name: &OsStr) -> ResultEmpty {
        reply("rmdir", (|| {
            let backing = self.backing(&parent.join(name))?;
            fs::remove_dir(&backing)?;
            Ok(())
        })())
    }

    fn symlink(
        &self,
        _req: RequestInfo,
        parent: &Path,
        name: &OsStr,
        target: &Path,
    ) -> ResultEntry {
        reply("symlink", (|| {
            // The target is stored verbatim; only the link itself lives on
            // the backing store.
            let backing = self.backing(&parent.join(name))?;
            std::os::unix::fs::symlink(target, &backing)?;
            self.entry_for(&backing)
        })())
    }

    fn rename(
        &self,
        _req: RequestInfo,
        parent: &Path,
        name: &OsStr,
        newparent: &Path,
        newname: &OsStr,
    ) -> ResultEmpty {
        reply("rename", (|| {
            let from = self.backing(&parent.join(name))?;
            let to = self.backing(&newparent.join(newname))?;
            fs::rename(&from, &to)?;
            Ok(())
        })())
    }

    fn link(
        &self,
        _req: RequestInfo,
        path: &Path,
        newparent: &Path,
        newname: &OsStr,
    ) -> ResultEntry {
        reply("link", (|| {
            let from = self.backing(path)?;
            let to = self.backing(&newparent.join(newname))?;
            fs::hard_link(&from, &to)?;
            self.entry_for(&to)
        })())
    }

    fn open(&self, _req: RequestInfo, path: &Path, flags: u32) -> ResultOpen {
        reply("open", self.open_impl(path, flags))
    }

    fn read(
        &self,
        _req: RequestInfo,
        _path: &Path,
        fh: u64,
        offset: u64,
        size: u32,
        callback: impl FnOnce(ResultSlice<'_>) -> CallbackResult,
    ) -> CallbackResult {
        match reply("read", self.read_at(fh, offset, size)) {
            Ok(data) => callback(Ok(data.as_slice())),
            Err(errno) => callback(Err(errno)),
        }
    }

    fn write(
        &self,
        _req: RequestInfo,
        _path: &Path,
        fh: u64,
        offset: u64,
        data: Vec<u8>,
        _flags: u32,
    ) -> ResultWrite {
        reply("write", self.write_at(fh, offset, &data))
    }

    fn flush(&self, _req: RequestInfo, _path: &Path, fh: u64, _lock_owner: u64) -> ResultEmpty {
        reply("flush", self.flush_impl(fh))
    }

    fn release(
        &self,
        _req: RequestInfo,
        _path: &Path,
        fh: u64,
        _flags: u32,
        _lock_owner: u64,
        _flush: bool,
    ) -> ResultEmpty {
        reply("release", self.release_impl(fh))
    }

    fn fsync(&self, _req: RequestInfo, _path: &Path, fh: u64, datasync: bool) -> ResultEmpty {
        reply("fsync", self.fsync_impl(fh, datasync))
    }

    fn opendir(&self, _req: RequestInfo, path: &Path, _flags: u32) -> ResultOpen {
        reply("opendir", (|| {
            let backing = self.backing(path)?;
            let handle = DirHandle::open(backing)?;
            let fh = self.dirs.insert(handle);
            trace!(path = %path.display(), fh, "opened directory");
            Ok((fh, 0))
        })())
    }

    fn readdir(&self, _req: RequestInfo, _path: &Path, fh: u64) -> ResultReaddir {
        reply("readdir", (|| {
            let mut handle = self
                .dirs
                .get_mut(fh)
                .ok_or(FsError::InvalidHandle(fh))?;
            Ok(handle.entries()?)
        })())
    }

    fn releasedir(&self, _req: RequestInfo, _path: &Path, fh: u64, _flags: u32) -> ResultEmpty {
        reply("releasedir", (|| {
            self.dirs.remove(fh).ok_or(FsError::InvalidHandle(fh))?;
            Ok(())
        })())
    }

    fn statfs(&self, _req: RequestInfo, path: &Path) -> ResultStatfs {
        reply("statfs", (|| {
            let backing = self.backing(path)?;
            let st = oslib::statvfs(&backing)?;
            Ok(Statfs {
                blocks: st.f_blocks,
                bfree: st.f_bfree,
                bavail: st.f_bavail,
                files: st.f_files,
                ffree: st.f_ffree,
                bsize: st.f_bsize as u32,
                namelen: st.f_namemax as u32,
                frsize: st.f_frsize as u32,
            })
        })())
    }

    #[cfg(target_os = "linux")]
    fn setxattr(
        &self,
        _req: RequestInfo,
        path: &Path,
        name: &OsStr,
        value: &[u8],
        flags: u32,
        _position: u32,
    ) -> ResultEmpty {
        reply("setxattr", (|| {
            let backing = self.backing(path)?;
            oslib::lsetxattr(&backing, name, value, flags)?;
            Ok(())
        })())
    }

    #[cfg(target_os = "linux")]
    fn getxattr(
        &self,
        _req: RequestInfo,
        path: &Path,
        name: &OsStr,
        size: u32,
    ) -> fuse_mt::ResultXattr {
        reply("getxattr", (|| {
            let backing = self.backing(path)?;
            if size == 0 {
                let n = oslib::lgetxattr(&backing, name, None)?;
                Ok(fuse_mt::Xattr::Size(n as u32))
            } else {
                let mut buf = vec![0u8; size as usize];
                let n = oslib::lgetxattr(&backing, name, Some(&mut buf))?;
                buf.truncate(n);
                Ok(fuse_mt::Xattr::Data(buf))
            }
        })())
    }

    #[cfg(target_os = "linux")]
    fn listxattr(&self, _req: RequestInfo, path: &Path, size: u32) -> fuse_mt::ResultXattr {
        reply("listxattr", (|| {
            let backing = self.backing(path)?;
            if size == 0 {
                let n = oslib::llistxattr(&backing, None)?;
                Ok(fuse_mt::Xattr::Size(n as u32))
            } else {
                let mut buf = vec![0u8; size as usize];
                let n = oslib::llistxattr(&backing, Some(&mut buf))?;
                buf.truncate(n);
                Ok(fuse_mt::Xattr::Data(buf))
            }
        })())
    }

    #[cfg(target_os = "linux")]
    fn removexattr(&self, _req: RequestInfo, path: &Path, name: &OsStr) -> ResultEmpty {
        reply("removexattr", (|| {
            let backing = self.backing(path)?;
            oslib::lremovexattr(&backing, name)?;
            Ok(())
        })())
    }

    fn access(&self, _req: RequestInfo, path: &Path, mask: u32) -> ResultEmpty {
        reply("access", (|| {
            let backing = self.backing(path)?;
            oslib::access(&backing, mask)?;
            Ok(())
        })())
    }

    fn create(
        &self,
        _req: RequestInfo,
        parent: &Path,
        name: &OsStr,
        mode: u32,
        flags: u32,
    ) -> ResultCreate {
        reply("create", self.create_impl(parent, name, mode, flags))
    }
}
