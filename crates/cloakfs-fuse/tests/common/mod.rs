//! Test harness for driving the filesystem without a kernel mount.
//!
//! `TestFs` owns a temporary backing tree and a `CloakFs` over it, and
//! exposes convenience wrappers that call the `FilesystemMT` callbacks the
//! way the multiplexer would. Out-of-band helpers decrypt the backing
//! ciphertext directly so tests can observe the persistence boundary.

// Not all tests use all TestFs methods
#![allow(dead_code)]

use std::ffi::OsStr;
use std::io::Cursor;
use std::path::{Path, PathBuf};

use cloakfs_core::{crypto, FileKey};
use cloakfs_fuse::CloakFs;
use fuse_mt::{CreatedEntry, FileAttr, FilesystemMT, RequestInfo};
use tempfile::TempDir;

/// Key shared by the filesystem under test and the out-of-band helpers.
pub const TEST_KEY: &str = "harness-test-key";

/// A filesystem over a fresh temporary backing tree.
pub struct TestFs {
    pub fs: CloakFs,
    backing: TempDir,
}

/// Splits a virtual path into the (parent, name) pair the entry-creating
/// callbacks expect.
pub fn split(virt: &str) -> (&Path, &OsStr) {
    let path = Path::new(virt);
    let parent = path.parent().expect("virtual path has a parent");
    let name = path.file_name().expect("virtual path has a file name");
    (parent, name)
}

/// A request as the multiplexer would deliver it.
pub fn req() -> RequestInfo {
    RequestInfo {
        unique: 0,
        uid: 0,
        gid: 0,
        pid: 0,
    }
}

impl TestFs {
    pub fn new() -> Self {
        let backing = TempDir::new().expect("create backing dir");
        let fs = CloakFs::new(backing.path().to_path_buf(), FileKey::new(TEST_KEY));
        Self { fs, backing }
    }

    /// The backing-store path mirroring a virtual path.
    pub fn backing_path(&self, virt: &str) -> PathBuf {
        self.backing.path().join(virt.trim_start_matches('/'))
    }

    /// The scratch path for a virtual regular file.
    pub fn scratch_path(&self, virt: &str) -> PathBuf {
        let backing = self.backing_path(virt);
        let name = backing.file_name().unwrap().to_string_lossy().into_owned();
        backing.with_file_name(format!("._{name}.decrypt"))
    }

    // ------------------------------------------------------------------
    // Session operations
    // ------------------------------------------------------------------

    pub fn create(&self, virt: &str, mode: u32) -> CreatedEntry {
        let (parent, name) = split(virt);
        let flags = (libc::O_WRONLY | libc::O_CREAT) as u32;
        self.fs
            .create(req(), parent, name, mode, flags)
            .unwrap_or_else(|e| panic!("create {virt} failed with errno {e}"))
    }

    pub fn open(&self, virt: &str, flags: i32) -> u64 {
        let (fh, _) = self
            .fs
            .open(req(), Path::new(virt), flags as u32)
            .unwrap_or_else(|e| panic!("open {virt} failed with errno {e}"));
        fh
    }

    pub fn try_open(&self, virt: &str, flags: i32) -> Result<u64, libc::c_int> {
        self.fs
            .open(req(), Path::new(virt), flags as u32)
            .map(|(fh, _)| fh)
    }

    pub fn write(&self, fh: u64, offset: u64, data: &[u8]) -> u32 {
        self.fs
            .write(req(), Path::new(""), fh, offset, data.to_vec(), 0)
            .expect("write failed")
    }

    pub fn read(&self, fh: u64, offset: u64, size: u32) -> Vec<u8> {
        self.fs.read_at(fh, offset, size).expect("read failed")
    }

    pub fn flush(&self, fh: u64) {
        self.fs
            .flush(req(), Path::new(""), fh, 0)
            .expect("flush failed");
    }

    pub fn fsync(&self, fh: u64, datasync: bool) {
        self.fs
            .fsync(req(), Path::new(""), fh, datasync)
            .expect("fsync failed");
    }

    pub fn ftruncate(&self, fh: u64, size: u64) {
        self.fs
            .truncate(req(), Path::new(""), Some(fh), size)
            .expect("ftruncate failed");
    }

    pub fn release(&self, fh: u64) {
        self.fs
            .release(req(), Path::new(""), fh, 0, 0, true)
            .expect("release failed");
    }

    // ------------------------------------------------------------------
    // Path operations
    // ------------------------------------------------------------------

    pub fn getattr(&self, virt: &str) -> FileAttr {
        let (_ttl, attr) = self
            .fs
            .getattr(req(), Path::new(virt), None)
            .unwrap_or_else(|e| panic!("getattr {virt} failed with errno {e}"));
        attr
    }

    pub fn try_getattr(&self, virt: &str) -> Result<(), libc::c_int> {
        self.fs
            .getattr(req(), Path::new(virt), None)
            .map(|(_ttl, _attr)| ())
    }

    pub fn fgetattr(&self, fh: u64) -> FileAttr {
        let (_ttl, attr) = self
            .fs
            .getattr(req(), Path::new(""), Some(fh))
            .expect("fgetattr failed");
        attr
    }

    pub fn truncate(&self, virt: &str, size: u64) {
        self.fs
            .truncate(req(), Path::new(virt), None, size)
            .unwrap_or_else(|e| panic!("truncate {virt} failed with errno {e}"));
    }

    pub fn mkdir(&self, virt: &str, mode: u32) {
        let (parent, name) = split(virt);
        self.fs
            .mkdir(req(), parent, name, mode)
            .unwrap_or_else(|e| panic!("mkdir {virt} failed with errno {e}"));
    }

    pub fn readdir_names(&self, virt: &str) -> Vec<String> {
        let (fh, _) = self
            .fs
            .opendir(req(), Path::new(virt), 0)
            .expect("opendir failed");
        let entries = self
            .fs
            .readdir(req(), Path::new(virt), fh)
            .expect("readdir failed");
        self.fs
            .releasedir(req(), Path::new(virt), fh, 0)
            .expect("releasedir failed");

        let mut names: Vec<String> = entries
            .into_iter()
            .map(|e| e.name.to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    // ------------------------------------------------------------------
    // Whole-file conveniences
    // ------------------------------------------------------------------

    /// create → write → release.
    pub fn write_file(&self, virt: &str, content: &[u8]) {
        let entry = self.create(virt, 0o644);
        if !content.is_empty() {
            assert_eq!(self.write(entry.fh, 0, content) as usize, content.len());
        }
        self.release(entry.fh);
    }

    /// open → read-to-end → release.
    pub fn read_file(&self, virt: &str) -> Vec<u8> {
        let fh = self.open(virt, libc::O_RDONLY);
        let size = self.fgetattr(fh).size;
        let content = self.read(fh, 0, size as u32);
        self.release(fh);
        content
    }

    // ------------------------------------------------------------------
    // Out-of-band observation of the backing store
    // ------------------------------------------------------------------

    /// Decrypts the backing ciphertext directly, bypassing the filesystem.
    pub fn decrypt_backing(&self, virt: &str) -> Vec<u8> {
        let ct = std::fs::read(self.backing_path(virt)).expect("read backing file");
        let mut pt = Vec::new();
        crypto::decrypt(&mut Cursor::new(ct), &mut pt, &FileKey::new(TEST_KEY))
            .expect("backing file decrypts");
        pt
    }

    /// Raw size of the ciphertext on disk.
    pub fn backing_size(&self, virt: &str) -> u64 {
        std::fs::metadata(self.backing_path(virt))
            .expect("stat backing file")
            .len()
    }
}
