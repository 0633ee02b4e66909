//! Encrypted session storage.
//!
//! Each provider id maps to one file holding a versioned envelope:
//!
//! ```json
//! { "version": 2, "payload": "<base64(nonce || AES-GCM ciphertext)>" }
//! ```
//!
//! The decrypted payload is JSON whose shape is determined solely by
//! `version`. Older versions are upgraded through [`MIGRATIONS`] once at load
//! time and re-saved at [`CURRENT_VERSION`].

// Author: kelexine (https://github.com/kelexine)

mod cipher;

pub use cipher::{AesGcmCipher, Cipher};

use crate::auth::ProviderSession;
use crate::config::CredentialsConfig;
use crate::error::{BridgeError, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::DateTime;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};
use zeroize::Zeroizing;

/// Payload layout written by this build.
pub const CURRENT_VERSION: u32 = 2;

type Migration = fn(Value) -> Result<Value>;

/// `(from_version, upgrade to from_version + 1)`.
const MIGRATIONS: &[(u32, Migration)] = &[(1, migrate_v1_to_v2)];

#[derive(Debug, Serialize, Deserialize)]
pub struct Envelope {
    pub version: u32,
    pub payload: String,
}

/// Reads and writes encrypted [`ProviderSession`]s keyed by provider id.
#[derive(Clone)]
pub struct CredentialStore {
    directory: PathBuf,
    cipher: Arc<dyn Cipher>,
}

impl CredentialStore {
    pub fn new(directory: impl Into<PathBuf>, cipher: Arc<dyn Cipher>) -> Self {
        Self {
            directory: directory.into(),
            cipher,
        }
    }

    pub fn from_config(config: &CredentialsConfig) -> Result<Self> {
        let cipher = AesGcmCipher::load_or_create(&config.key_path())?;
        Ok(Self::new(config.directory(), Arc::new(cipher)))
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn path_for(&self, provider_id: &str) -> Result<PathBuf> {
        let valid = !provider_id.is_empty()
            && provider_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
            && !provider_id.starts_with('.');
        if !valid {
            return Err(BridgeError::InvalidRequest(format!(
                "invalid provider id '{}'",
                provider_id
            )));
        }
        Ok(self.directory.join(format!("{}.json", provider_id)))
    }

    /// Load the session for `provider_id`, migrating older envelopes.
    pub fn load(&self, provider_id: &str) -> Result<Option<ProviderSession>> {
        let path = self.path_for(provider_id)?;
        if !path.exists() {
            return Ok(None);
        }

        let contents = fs::read_to_string(&path)?;
        let envelope: Envelope = serde_json::from_str(&contents).map_err(|e| {
            BridgeError::AuthenticationFailed(format!(
                "credential file {} is not a valid envelope: {}",
                path.display(),
                e
            ))
        })?;

        let stored_version = envelope.version;
        let value = self.open(&envelope)?;
        let value = migrate(stored_version, value)?;

        let session: ProviderSession = serde_json::from_value(value).map_err(|e| {
            BridgeError::AuthenticationFailed(format!("stored session is malformed: {}", e))
        })?;

        if stored_version < CURRENT_VERSION {
            info!(
                provider = provider_id,
                from = stored_version,
                to = CURRENT_VERSION,
                "Migrated stored session"
            );
            self.save(provider_id, &session)?;
        }

        debug!(provider = provider_id, "Loaded stored session");
        Ok(Some(session))
    }

    pub fn save(&self, provider_id: &str, session: &ProviderSession) -> Result<()> {
        let path = self.path_for(provider_id)?;
        fs::create_dir_all(&self.directory)?;

        let envelope = self.seal(CURRENT_VERSION, &serde_json::to_value(session)?)?;
        let json = serde_json::to_string_pretty(&envelope)?;

        // Write then rename so a crash never leaves a truncated envelope
        let tmp = path.with_extension("json.tmp");
        cipher::write_private(&tmp, json.as_bytes())?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Returns true when a stored session was removed.
    pub fn delete(&self, provider_id: &str) -> Result<bool> {
        let path = self.path_for(provider_id)?;
        match fs::remove_file(&path) {
            Ok(()) => {
                info!(provider = provider_id, "Deleted stored session");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Encrypt `value` into an envelope tagged with `version`.
    pub fn seal(&self, version: u32, value: &Value) -> Result<Envelope> {
        let plaintext = Zeroizing::new(serde_json::to_vec(value)?);
        let blob = self.cipher.encrypt(&plaintext)?;
        Ok(Envelope {
            version,
            payload: STANDARD.encode(blob),
        })
    }

    fn open(&self, envelope: &Envelope) -> Result<Value> {
        let blob = STANDARD.decode(&envelope.payload).map_err(|e| {
            BridgeError::AuthenticationFailed(format!("stored session is not base64: {}", e))
        })?;
        let plaintext = self.cipher.decrypt(&blob)?;
        Ok(serde_json::from_slice(&plaintext)?)
    }
}

/// Upgrade a decrypted payload from `version` to [`CURRENT_VERSION`].
pub fn migrate(version: u32, mut value: Value) -> Result<Value> {
    if version > CURRENT_VERSION {
        return Err(BridgeError::AuthenticationFailed(format!(
            "stored session version {} is newer than supported version {}",
            version, CURRENT_VERSION
        )));
    }

    for current in version..CURRENT_VERSION {
        let step = MIGRATIONS
            .iter()
            .find(|(from, _)| *from == current)
            .map(|(_, step)| *step)
            .ok_or_else(|| {
                BridgeError::Internal(format!("no migration from session version {}", current))
            })?;
        value = step(value)?;
    }
    Ok(value)
}

/// v1: `{accessToken, refreshToken?, expiresAt? (RFC 3339), accountId?}`.
fn migrate_v1_to_v2(value: Value) -> Result<Value> {
    let text = |name: &str| value.get(name).and_then(Value::as_str).map(str::to_string);

    let access_token = text("accessToken").ok_or_else(|| {
        BridgeError::AuthenticationFailed("v1 session has no accessToken".to_string())
    })?;

    let expires_at_ms = match text("expiresAt") {
        Some(raw) => Some(
            DateTime::parse_from_rfc3339(&raw)
                .map_err(|e| {
                    BridgeError::AuthenticationFailed(format!("v1 expiresAt is invalid: {}", e))
                })?
                .timestamp_millis(),
        ),
        None => None,
    };

    Ok(json!({
        "access_token": access_token,
        "refresh_token": text("refreshToken"),
        "expires_at_ms": expires_at_ms,
        "account_id": text("accountId"),
    }))
}
