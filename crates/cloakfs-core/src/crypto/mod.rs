//! Whole-stream encryption and decryption.
//!
//! Ciphertext layout:
//!
//! ```text
//! magic(8) | salt(16) | iv(16) | AES-256-CTR(body)
//! ```
//!
//! The content key is derived per file with scrypt from the file key and the
//! embedded salt, so identical plaintexts written twice produce unrelated
//! ciphertexts. CTR carries no authentication tag; a wrong key yields
//! garbage plaintext rather than a detectable error, and only the magic
//! bytes are validated on decrypt.
//!
//! Both transforms consume `src` from its current position to EOF and append
//! at `dst`'s current position. They never seek either stream; offset
//! bookkeeping is the caller's problem.

use std::io::{self, Read, Write};

use aes::Aes256;
use ctr::cipher::generic_array::GenericArray;
use ctr::cipher::{KeyIvInit, StreamCipher};
use rand::RngCore;
use scrypt::Params;
use thiserror::Error;
use tracing::trace;
use zeroize::Zeroizing;

use crate::key::FileKey;

type Aes256Ctr = ctr::Ctr128BE<Aes256>;

/// Identifies a cloakfs ciphertext stream.
pub const MAGIC: &[u8; 8] = b"CLOAKFS1";

/// Salt length for the per-file key derivation.
pub const SALT_LEN: usize = 16;

/// CTR initialization vector length.
pub const IV_LEN: usize = 16;

/// Total ciphertext framing ahead of the encrypted body.
///
/// An empty plaintext encrypts to exactly this many bytes, which is what
/// makes a freshly created 0-byte virtual file a valid backing file.
pub const HEADER_LEN: usize = MAGIC.len() + SALT_LEN + IV_LEN;

/// Derived content key length (AES-256).
const CONTENT_KEY_LEN: usize = 32;

/// scrypt cost parameters (log2 N, r, p).
const SCRYPT_LOG_N: u8 = 14;
const SCRYPT_R: u32 = 8;
const SCRYPT_P: u32 = 1;

/// Buffer size for streaming the body through the keystream.
const IO_CHUNK: usize = 64 * 1024;

/// Errors from the stream transforms.
#[derive(Error, Debug)]
pub enum CryptoError {
    /// The ciphertext header is truncated or does not carry the magic bytes.
    #[error("malformed ciphertext: {0}")]
    Malformed(&'static str),

    /// scrypt rejected its parameters or output length.
    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    /// The underlying stream failed.
    #[error("I/O error during transform: {0}")]
    Io(#[from] io::Error),
}

fn derive_content_key(
    key: &FileKey,
    salt: &[u8; SALT_LEN],
) -> Result<Zeroizing<[u8; CONTENT_KEY_LEN]>, CryptoError> {
    let params = Params::new(SCRYPT_LOG_N, SCRYPT_R, SCRYPT_P, CONTENT_KEY_LEN)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    let mut out = Zeroizing::new([0u8; CONTENT_KEY_LEN]);
    scrypt::scrypt(key.expose().as_bytes(), salt, &params, &mut out[..])
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    Ok(out)
}

/// Streams `src` to `dst` through the keystream.
///
/// Returns the number of body bytes processed.
fn stream_body(
    src: &mut impl Read,
    dst: &mut impl Write,
    cipher: &mut Aes256Ctr,
) -> Result<u64, CryptoError> {
    let mut buf = vec![0u8; IO_CHUNK];
    let mut total = 0u64;
    loop {
        let n = match src.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        cipher.apply_keystream(&mut buf[..n]);
        dst.write_all(&buf[..n])?;
        total += n as u64;
    }
    dst.flush()?;
    Ok(total)
}

/// Encrypts `src` (current position to EOF) and appends the framed
/// ciphertext to `dst`.
///
/// Returns the number of plaintext bytes consumed.
pub fn encrypt(
    src: &mut impl Read,
    dst: &mut impl Write,
    key: &FileKey,
) -> Result<u64, CryptoError> {
    let mut salt = [0u8; SALT_LEN];
    let mut iv = [0u8; IV_LEN];
    rand::rng().fill_bytes(&mut salt);
    rand::rng().fill_bytes(&mut iv);

    let content_key = derive_content_key(key, &salt)?;
    let mut cipher = Aes256Ctr::new(
        GenericArray::from_slice(&content_key[..]),
        GenericArray::from_slice(&iv),
    );

    dst.write_all(MAGIC)?;
    dst.write_all(&salt)?;
    dst.write_all(&iv)?;

    let n = stream_body(src, dst, &mut cipher)?;
    trace!(bytes = n, "encrypted stream");
    Ok(n)
}

/// Decrypts `src` (current position to EOF) and appends the plaintext to
/// `dst`.
///
/// Returns the number of plaintext bytes produced.
pub fn decrypt(
    src: &mut impl Read,
    dst: &mut impl Write,
    key: &FileKey,
) -> Result<u64, CryptoError> {
    let mut header = [0u8; HEADER_LEN];
    src.read_exact(&mut header).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => CryptoError::Malformed("truncated header"),
        _ => CryptoError::Io(e),
    })?;
    if &header[..MAGIC.len()] != MAGIC {
        return Err(CryptoError::Malformed("bad magic"));
    }

    let mut salt = [0u8; SALT_LEN];
    let mut iv = [0u8; IV_LEN];
    salt.copy_from_slice(&header[MAGIC.len()..MAGIC.len() + SALT_LEN]);
    iv.copy_from_slice(&header[MAGIC.len() + SALT_LEN..]);

    let content_key = derive_content_key(key, &salt)?;
    let mut cipher = Aes256Ctr::new(
        GenericArray::from_slice(&content_key[..]),
        GenericArray::from_slice(&iv),
    );

    let n = stream_body(src, dst, &mut cipher)?;
    trace!(bytes = n, "decrypted stream");
    Ok(n)
}
