//! Core primitives for cloakfs.
//!
//! This crate owns the two concerns the mount frontend treats as external
//! collaborators:
//!
//! - [`crypto`] — the whole-stream cipher: `encrypt`/`decrypt` consume a
//!   readable stream from its current position to EOF and append the
//!   transformed bytes to a writable stream. The cipher is deliberately not
//!   random-access; callers that need POSIX semantics pay a full decrypt on
//!   open and a full re-encrypt on dirty flush.
//! - [`key`] — acquisition of the file-encryption key, either from a
//!   compile-time static key (the default) or from a remote key service
//!   over HTTP.

pub mod crypto;
pub mod key;

pub use crypto::{decrypt, encrypt, CryptoError};
pub use key::{FileKey, KeyServiceConfig, KeyServiceError, KeySource};
