//! FUSE frontend for cloakfs.
//!
//! Presents a transparent plaintext view of a backing directory tree whose
//! regular-file contents are stored encrypted. Directories, symlinks,
//! permissions, ownership and timestamps pass through unchanged; only file
//! contents and their reported sizes are transformed.
//!
//! The core protocol is decrypt-on-open / re-encrypt-on-dirty-flush: each
//! open regular file is shadowed by an ephemeral plaintext scratch file
//! next to its ciphertext (see [`pair::FilePair`]), and the ciphertext is
//! rewritten whole whenever dirty plaintext reaches `flush`, `fsync` or
//! `release`.
//!
//! # Usage
//!
//! ```ignore
//! use cloakfs_fuse::CloakFs;
//! use cloakfs_core::FileKey;
//!
//! let fs = CloakFs::new(backing_root, FileKey::static_key());
//! fuse_mt::mount(fuse_mt::FuseMT::new(fs, threads), mountpoint, &fuse_args)?;
//! ```

pub mod dir;
pub mod error;
pub mod filesystem;
pub mod handles;
pub mod oslib;
pub mod pair;
pub mod paths;

pub use dir::DirHandle;
pub use error::{io_error_to_errno, FsError, FsResult};
pub use filesystem::CloakFs;
pub use handles::HandleTable;
pub use pair::FilePair;
pub use paths::{PathError, PathTranslator, PATH_BUF_SIZE};
