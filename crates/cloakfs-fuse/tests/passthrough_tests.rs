//! Pass-through operations on the backing tree: directories, links,
//! renames, metadata. Non-regular nodes are mirrored verbatim; only
//! regular-file contents are transformed.

mod common;

use common::{req, split, TestFs};
use fuse_mt::{FileType, FilesystemMT};
use std::path::Path;

// =============================================================================
// Directories
// =============================================================================

#[test]
fn mkdir_then_list_children() {
    let t = TestFs::new();
    t.mkdir("/d", 0o755);
    t.write_file("/d/a", b"first");
    t.write_file("/d/b", b"second");

    let names = t.readdir_names("/d");
    assert!(names.contains(&"a".to_string()));
    assert!(names.contains(&"b".to_string()));
    assert!(names.contains(&".".to_string()));
    assert!(names.contains(&"..".to_string()));

    let attr = t.getattr("/d");
    assert_eq!(attr.kind, FileType::Directory);
    assert_eq!(attr.perm, 0o755);
}

#[test]
fn mkdir_honors_mode_verbatim() {
    let t = TestFs::new();
    t.mkdir("/odd", 0o710);
    assert_eq!(t.getattr("/odd").perm, 0o710);
}

#[test]
fn rmdir_removes_empty_directory() {
    let t = TestFs::new();
    t.mkdir("/doomed", 0o755);

    let (parent, name) = split("/doomed");
    t.fs.rmdir(req(), parent, name).expect("rmdir failed");
    assert_eq!(t.try_getattr("/doomed"), Err(libc::ENOENT));
}

#[test]
fn rmdir_of_nonempty_directory_fails() {
    let t = TestFs::new();
    t.mkdir("/full", 0o755);
    t.write_file("/full/file", b"x");

    let (parent, name) = split("/full");
    let err = t.fs.rmdir(req(), parent, name).unwrap_err();
    assert!(err == libc::ENOTEMPTY || err == libc::EEXIST);
}

#[test]
fn opendir_of_missing_directory_is_enoent() {
    let t = TestFs::new();
    assert_eq!(
        t.fs.opendir(req(), Path::new("/missing"), 0),
        Err(libc::ENOENT)
    );
}

// =============================================================================
// Unlink
// =============================================================================

#[test]
fn unlink_removes_the_backing_file() {
    let t = TestFs::new();
    t.write_file("/bye", b"x");

    let (parent, name) = split("/bye");
    t.fs.unlink(req(), parent, name).expect("unlink failed");

    assert!(!t.backing_path("/bye").exists());
    assert_eq!(t.try_getattr("/bye"), Err(libc::ENOENT));
}

// =============================================================================
// Symlinks and hard links
// =============================================================================

#[test]
fn symlink_target_is_stored_verbatim() {
    let t = TestFs::new();
    t.write_file("/real", b"content");

    let (parent, name) = split("/link");
    let (_ttl, attr) = t
        .fs
        .symlink(req(), parent, name, Path::new("real"))
        .expect("symlink failed");
    assert_eq!(attr.kind, FileType::Symlink);

    let target = t
        .fs
        .readlink(req(), Path::new("/link"))
        .expect("readlink failed");
    assert_eq!(target, b"real");

    // lstat semantics: the link itself, not the target.
    assert_eq!(t.getattr("/link").kind, FileType::Symlink);
}

#[test]
fn hard_link_shares_the_ciphertext() {
    let t = TestFs::new();
    t.write_file("/orig", b"shared bytes");

    let (parent, name) = split("/alias");
    let (_ttl, attr) = t
        .fs
        .link(req(), Path::new("/orig"), parent, name)
        .expect("link failed");
    assert_eq!(attr.nlink, 2);

    assert_eq!(t.read_file("/alias"), b"shared bytes");
}

// =============================================================================
// Rename
// =============================================================================

#[test]
fn rename_moves_the_ciphertext() {
    let t = TestFs::new();
    t.mkdir("/dir", 0o755);
    t.write_file("/old", b"moved");

    let (parent, name) = split("/old");
    let (newparent, newname) = split("/dir/new");
    t.fs.rename(req(), parent, name, newparent, newname)
        .expect("rename failed");

    assert_eq!(t.try_getattr("/old"), Err(libc::ENOENT));
    assert_eq!(t.read_file("/dir/new"), b"moved");
}

// =============================================================================
// Permissions, ownership, times
// =============================================================================

#[test]
fn chmod_passes_through() {
    let t = TestFs::new();
    t.write_file("/perms", b"x");

    t.fs.chmod(req(), Path::new("/perms"), None, 0o600)
        .expect("chmod failed");
    assert_eq!(t.getattr("/perms").perm, 0o600);
}

#[test]
fn chown_with_no_change_succeeds() {
    let t = TestFs::new();
    t.write_file("/owned", b"x");

    // Leaving both ids unchanged must succeed for any caller.
    t.fs.chown(req(), Path::new("/owned"), None, None, None)
        .expect("chown(no-op) failed");
}

#[test]
fn utimens_sets_mtime_on_the_backing_file() {
    let t = TestFs::new();
    t.write_file("/stamped", b"x");

    let then = std::time::UNIX_EPOCH + std::time::Duration::from_secs(1_500_000_000);
    t.fs.utimens(req(), Path::new("/stamped"), None, None, Some(then))
        .expect("utimens failed");

    let meta = std::fs::metadata(t.backing_path("/stamped")).unwrap();
    assert_eq!(meta.modified().unwrap(), then);
}

#[test]
fn access_checks_the_backing_file() {
    let t = TestFs::new();
    t.write_file("/reachable", b"x");

    t.fs.access(req(), Path::new("/reachable"), libc::F_OK as u32)
        .expect("access failed");
    assert_eq!(
        t.fs.access(req(), Path::new("/unreachable"), libc::F_OK as u32),
        Err(libc::ENOENT)
    );
}

// =============================================================================
// Special nodes
// =============================================================================

#[test]
fn mknod_creates_a_fifo_by_mode() {
    let t = TestFs::new();

    let (parent, name) = split("/pipe");
    let mode = libc::S_IFIFO | 0o644;
    let (_ttl, attr) = t
        .fs
        .mknod(req(), parent, name, mode, 0)
        .expect("mknod failed");
    assert_eq!(attr.kind, FileType::NamedPipe);

    // Non-regular nodes are untouched by getattr's size overlay.
    assert_eq!(t.getattr("/pipe").kind, FileType::NamedPipe);
}

// =============================================================================
// Filesystem statistics
// =============================================================================

#[test]
fn statfs_reports_backing_filesystem_numbers() {
    let t = TestFs::new();
    let st = t.fs.statfs(req(), Path::new("/")).expect("statfs failed");
    assert!(st.bsize > 0);
    assert!(st.blocks > 0);
}

// =============================================================================
// Extended attributes (optional pass-through)
// =============================================================================

#[cfg(target_os = "linux")]
#[test]
fn xattr_roundtrip_when_supported() {
    use std::ffi::OsStr;

    let t = TestFs::new();
    t.write_file("/tagged", b"x");

    let path = Path::new("/tagged");
    let name = OsStr::new("user.cloakfs.test");
    match t.fs.setxattr(req(), path, name, b"value", 0, 0) {
        Ok(()) => {}
        // tmpfs without user xattrs, or similar
        Err(e) if e == libc::ENOTSUP || e == libc::EOPNOTSUPP => return,
        Err(e) => panic!("setxattr failed with errno {e}"),
    }

    match t.fs.getxattr(req(), path, name, 64).expect("getxattr failed") {
        fuse_mt::Xattr::Data(data) => assert_eq!(data, b"value"),
        fuse_mt::Xattr::Size(_) => panic!("expected data, got size"),
    }

    match t.fs.getxattr(req(), path, name, 0).expect("size probe failed") {
        fuse_mt::Xattr::Size(n) => assert_eq!(n as usize, b"value".len()),
        fuse_mt::Xattr::Data(_) => panic!("expected size, got data"),
    }

    t.fs.removexattr(req(), path, name).expect("removexattr failed");
}
