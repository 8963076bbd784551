//! Virtual-to-backing path translation.
//!
//! Every callback receives a virtual path rooted at the mount point. This
//! module maps it to the absolute ciphertext path under the backing root,
//! and derives the sibling scratch path that holds the plaintext shadow
//! while a file is open.
//!
//! The scratch name is deterministic (`._<name>.decrypt` next to the
//! ciphertext), so two concurrent sessions on the same virtual file collide
//! on the same shadow. That is an accepted limitation of the single-writer
//! model.

use std::ffi::OsString;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Upper bound (exclusive) on a translated path, in bytes.
pub const PATH_BUF_SIZE: usize = 1024;

const SCRATCH_PREFIX: &str = "._";
const SCRATCH_SUFFIX: &str = ".decrypt";

/// Errors from path translation. No syscall is attempted once translation
/// fails.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathError {
    /// The input path was empty or not decomposable into parent and name.
    #[error("path is empty or not decomposable")]
    InvalidArgument,

    /// The translated path does not fit the path buffer.
    #[error("translated path exceeds {PATH_BUF_SIZE} bytes")]
    NameTooLong,
}

impl PathError {
    /// The errno reported to the multiplexer.
    pub fn to_errno(self) -> libc::c_int {
        match self {
            PathError::InvalidArgument => libc::EINVAL,
            PathError::NameTooLong => libc::ENAMETOOLONG,
        }
    }
}

fn check_len(path: &Path) -> Result<(), PathError> {
    if path.as_os_str().as_bytes().len() >= PATH_BUF_SIZE {
        Err(PathError::NameTooLong)
    } else {
        Ok(())
    }
}

/// Maps virtual paths onto the backing root.
///
/// The root is resolved once at mount time and read-only afterwards; the
/// translator is shared freely across callback threads.
#[derive(Debug, Clone)]
pub struct PathTranslator {
    root: PathBuf,
}

impl PathTranslator {
    /// Creates a translator over an already-canonicalized backing root.
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// The backing root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Concatenates the backing root with a virtual path.
    ///
    /// No normalization beyond joining; the multiplexer hands us clean
    /// absolute virtual paths.
    pub fn backing(&self, virtual_path: &Path) -> Result<PathBuf, PathError> {
        if virtual_path.as_os_str().is_empty() {
            return Err(PathError::InvalidArgument);
        }
        let rel = virtual_path.strip_prefix("/").unwrap_or(virtual_path);
        let joined = if rel.as_os_str().is_empty() {
            self.root.clone()
        } else {
            self.root.join(rel)
        };
        check_len(&joined)?;
        Ok(joined)
    }

    /// Derives the scratch path for a backing file:
    /// `<parent>/._<name>.decrypt`.
    pub fn scratch(backing: &Path) -> Result<PathBuf, PathError> {
        let parent = backing.parent().ok_or(PathError::InvalidArgument)?;
        let name = backing.file_name().ok_or(PathError::InvalidArgument)?;

        let mut scratch_name = OsString::from(SCRATCH_PREFIX);
        scratch_name.push(name);
        scratch_name.push(SCRATCH_SUFFIX);

        let joined = parent.join(scratch_name);
        check_len(&joined)?;
        Ok(joined)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn translator() -> PathTranslator {
        PathTranslator::new(PathBuf::from("/srv/cipher"))
    }

    #[test]
    fn backing_joins_root_and_virtual() {
        let t = translator();
        assert_eq!(
            t.backing(Path::new("/docs/a.txt")).unwrap(),
            PathBuf::from("/srv/cipher/docs/a.txt")
        );
    }

    #[test]
    fn backing_of_root_is_the_root() {
        let t = translator();
        assert_eq!(t.backing(Path::new("/")).unwrap(), PathBuf::from("/srv/cipher"));
    }

    #[test]
    fn empty_virtual_path_is_invalid() {
        let t = translator();
        assert_eq!(t.backing(Path::new("")), Err(PathError::InvalidArgument));
    }

    #[test]
    fn oversize_virtual_path_is_name_too_long() {
        let t = translator();
        let long = format!("/{}", "x".repeat(PATH_BUF_SIZE));
        assert_eq!(t.backing(Path::new(&long)), Err(PathError::NameTooLong));
    }

    #[test]
    fn backing_exactly_at_limit_is_rejected() {
        let t = translator();
        let room = PATH_BUF_SIZE - "/srv/cipher/".len();
        let long = format!("/{}", "x".repeat(room));
        assert_eq!(t.backing(Path::new(&long)), Err(PathError::NameTooLong));

        let fits = format!("/{}", "x".repeat(room - 1));
        assert!(t.backing(Path::new(&fits)).is_ok());
    }

    #[test]
    fn scratch_is_a_hidden_sibling() {
        let s = PathTranslator::scratch(Path::new("/srv/cipher/docs/a.txt")).unwrap();
        assert_eq!(s, PathBuf::from("/srv/cipher/docs/._a.txt.decrypt"));
    }

    #[test]
    fn scratch_without_parent_is_invalid() {
        assert_eq!(
            PathTranslator::scratch(Path::new("/")),
            Err(PathError::InvalidArgument)
        );
    }

    #[test]
    fn scratch_length_is_checked() {
        // The backing path fits, but the `._` / `.decrypt` decoration
        // pushes the scratch path over the limit.
        let name = "y".repeat(PATH_BUF_SIZE - 20);
        let backing = PathBuf::from("/srv/cipher").join(name);
        assert!(backing.as_os_str().len() < PATH_BUF_SIZE);
        assert_eq!(
            PathTranslator::scratch(&backing),
            Err(PathError::NameTooLong)
        );
    }

    #[test]
    fn errno_mapping() {
        assert_eq!(PathError::InvalidArgument.to_errno(), libc::EINVAL);
        assert_eq!(PathError::NameTooLong.to_errno(), libc::ENAMETOOLONG);
    }
}
