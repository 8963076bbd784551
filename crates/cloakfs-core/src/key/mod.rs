//! File-encryption key acquisition.
//!
//! Two modes are supported:
//!
//! - **Static** — a compile-time key, the default for the current build.
//! - **Remote** — a single HTTP round trip to a key service: the request
//!   carries the fixed key-slot UUID and a pre-shared-secret attribute, the
//!   response is an envelope with per-key status. Every failure mode
//!   collapses into [`KeyServiceError`], which the mount frontend reports
//!   as a single key-unavailable errno.

use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;
use uuid::{uuid, Uuid};

/// Key slot requested from the key service.
pub const KEY_SLOT_ID: Uuid = uuid!("1b4e28ba-2fa1-11d2-883f-b9a761bde3fb");

/// Status string the envelope and the key slot must both carry.
const STATUS_ACCEPTED: &str = "accepted";

/// Upper bound on the key value accepted from the service, in bytes.
const MAX_KEY_LEN: usize = 1024;

/// Shared-secret attribute sent with every key request.
const DEFAULT_SHARED_SECRET: &str = "It's A Trap!";

/// Compile-time key used when no key service is configured.
const STATIC_KEY: &str = "cloakfs-static-development-key";

/// Transport timeout for the key service round trip.
const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// The symmetric file-encryption key.
///
/// Wraps [`SecretString`] so the key material is redacted from debug output
/// and zeroized on drop.
pub struct FileKey(SecretString);

impl FileKey {
    /// Wraps an already-obtained key string.
    pub fn new(key: impl Into<String>) -> Self {
        Self(SecretString::from(key.into()))
    }

    /// The compile-time static key.
    pub fn static_key() -> Self {
        Self::new(STATIC_KEY)
    }

    /// Exposes the raw key material for key derivation.
    pub fn expose(&self) -> &str {
        self.0.expose_secret()
    }
}

impl std::fmt::Debug for FileKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("FileKey(REDACTED)")
    }
}

/// Errors from remote key acquisition.
///
/// The mount frontend does not distinguish these further; they all map to
/// the same key-unavailable errno.
#[derive(Error, Debug)]
pub enum KeyServiceError {
    /// Request could not be sent or returned a non-success HTTP status.
    #[error("key service transport failure: {0}")]
    Transport(#[from] reqwest::Error),

    /// Response body was not a valid key envelope.
    #[error("key service returned a malformed envelope: {0}")]
    Envelope(#[from] serde_json::Error),

    /// The envelope status was not "accepted".
    #[error("key request rejected: envelope status {0:?}")]
    Rejected(String),

    /// The envelope carried an unexpected number of keys.
    #[error("key service returned {0} keys, expected exactly 1")]
    KeyCount(usize),

    /// The key slot status was not "accepted".
    #[error("key slot rejected: status {0:?}")]
    SlotRejected(String),

    /// The key slot carried no value.
    #[error("key slot is missing its value")]
    MissingValue,

    /// The key value exceeds the caller's buffer bound.
    #[error("key value of {0} bytes exceeds the {MAX_KEY_LEN}-byte limit")]
    Oversize(usize),
}

/// Where the file key comes from.
#[derive(Debug)]
pub enum KeySource {
    /// Use the compile-time static key.
    Static,
    /// Fetch the key from a remote key service.
    Remote(KeyServiceConfig),
}

impl KeySource {
    /// Resolves the source to a usable key.
    ///
    /// Consulted once at mount time; the key is process-wide.
    pub fn resolve(&self) -> Result<FileKey, KeyServiceError> {
        match self {
            KeySource::Static => {
                debug!("using static file key");
                Ok(FileKey::static_key())
            }
            KeySource::Remote(config) => KeyClient::new(config).fetch(),
        }
    }
}

/// Remote key service endpoint configuration.
pub struct KeyServiceConfig {
    /// Endpoint the key request is POSTed to.
    pub url: Url,
    /// Shared-secret attribute authenticating the request.
    pub shared_secret: SecretString,
}

impl KeyServiceConfig {
    /// Configuration for `url` with the built-in shared secret.
    pub fn new(url: Url) -> Self {
        Self {
            url,
            shared_secret: SecretString::from(DEFAULT_SHARED_SECRET.to_owned()),
        }
    }
}

impl std::fmt::Debug for KeyServiceConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyServiceConfig")
            .field("url", &self.url.as_str())
            .field("shared_secret", &"REDACTED")
            .finish()
    }
}

#[derive(Serialize)]
struct KeyRequest<'a> {
    key_id: Uuid,
    shared_secret: &'a str,
}

#[derive(Deserialize)]
struct KeyEnvelope {
    status: String,
    #[serde(default)]
    keys: Vec<KeySlot>,
}

#[derive(Deserialize)]
struct KeySlot {
    status: String,
    #[serde(default)]
    value: Option<String>,
}

/// Blocking client for the key service.
pub struct KeyClient<'a> {
    config: &'a KeyServiceConfig,
}

impl<'a> KeyClient<'a> {
    /// Creates a client for the given endpoint.
    pub fn new(config: &'a KeyServiceConfig) -> Self {
        Self { config }
    }

    /// Performs the key request and validates the response envelope.
    pub fn fetch(&self) -> Result<FileKey, KeyServiceError> {
        debug!(url = %self.config.url, key_id = %KEY_SLOT_ID, "fetching file key");

        let request = KeyRequest {
            key_id: KEY_SLOT_ID,
            shared_secret: self.config.shared_secret.expose_secret(),
        };
        let http = reqwest::blocking::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .build()?;
        let body = http
            .post(self.config.url.clone())
            .json(&request)
            .send()?
            .error_for_status()?
            .text()?;

        let envelope: KeyEnvelope = serde_json::from_str(&body)?;
        accept_envelope(envelope).inspect_err(|e| warn!(error = %e, "key fetch failed"))
    }
}

/// Applies the acceptance rules to a parsed envelope.
fn accept_envelope(envelope: KeyEnvelope) -> Result<FileKey, KeyServiceError> {
    if envelope.status != STATUS_ACCEPTED {
        return Err(KeyServiceError::Rejected(envelope.status));
    }
    let count = envelope.keys.len();
    if count != 1 {
        return Err(KeyServiceError::KeyCount(count));
    }
    let slot = envelope
        .keys
        .into_iter()
        .next()
        .ok_or(KeyServiceError::KeyCount(0))?;
    if slot.status != STATUS_ACCEPTED {
        return Err(KeyServiceError::SlotRejected(slot.status));
    }
    let value = slot.value.ok_or(KeyServiceError::MissingValue)?;
    if value.len() >= MAX_KEY_LEN {
        return Err(KeyServiceError::Oversize(value.len()));
    }
    Ok(FileKey::new(value))
}
