// At-rest encryption for stored sessions
// Author: kelexine (https://github.com/kelexine)

use crate::error::{BridgeError, Result};
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use ring::rand::{SecureRandom, SystemRandom};
use std::fs;
use std::io::Write;
use std::path::Path;
use tracing::{info, warn};
use zeroize::Zeroizing;

const KEY_LEN: usize = 32;

/// Opaque blob encryption used by the credential store.
pub trait Cipher: Send + Sync {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>>;
    /// The plaintext is wiped from memory when the returned buffer drops.
    fn decrypt(&self, blob: &[u8]) -> Result<Zeroizing<Vec<u8>>>;
}

/// AES-256-GCM with a random 96-bit nonce prefixed to each ciphertext.
pub struct AesGcmCipher {
    key: LessSafeKey,
    rng: SystemRandom,
}

impl AesGcmCipher {
    pub fn from_key_bytes(bytes: &[u8]) -> Result<Self> {
        let unbound = UnboundKey::new(&AES_256_GCM, bytes).map_err(|_| {
            BridgeError::Config(format!("credential key must be {} bytes", KEY_LEN))
        })?;
        Ok(Self {
            key: LessSafeKey::new(unbound),
            rng: SystemRandom::new(),
        })
    }

    /// Read the key file, creating it with a fresh random key (mode 0600) when missing.
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if path.exists() {
            let bytes = Zeroizing::new(fs::read(path)?);
            if bytes.len() != KEY_LEN {
                return Err(BridgeError::Config(format!(
                    "credential key {} has {} bytes, expected {}",
                    path.display(),
                    bytes.len(),
                    KEY_LEN
                )));
            }
            warn_if_shared(path);
            return Self::from_key_bytes(&bytes);
        }

        let rng = SystemRandom::new();
        let mut bytes = Zeroizing::new([0u8; KEY_LEN]);
        rng.fill(&mut bytes[..])
            .map_err(|_| BridgeError::Internal("system RNG failure".to_string()))?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        write_private(path, &bytes[..])?;
        info!(path = %path.display(), "Created credential encryption key");

        Self::from_key_bytes(&bytes[..])
    }
}

impl Cipher for AesGcmCipher {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        self.rng
            .fill(&mut nonce_bytes)
            .map_err(|_| BridgeError::Internal("system RNG failure".to_string()))?;

        let mut in_out = plaintext.to_vec();
        self.key
            .seal_in_place_append_tag(
                Nonce::assume_unique_for_key(nonce_bytes),
                Aad::empty(),
                &mut in_out,
            )
            .map_err(|_| BridgeError::Internal("encryption failed".to_string()))?;

        let mut blob = Vec::with_capacity(NONCE_LEN + in_out.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&in_out);
        Ok(blob)
    }

    fn decrypt(&self, blob: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        if blob.len() < NONCE_LEN {
            return Err(BridgeError::AuthenticationFailed(
                "stored session is truncated".to_string(),
            ));
        }
        let (nonce_bytes, sealed) = blob.split_at(NONCE_LEN);
        let nonce = Nonce::try_assume_unique_for_key(nonce_bytes)
            .map_err(|_| BridgeError::Internal("bad nonce length".to_string()))?;

        // Opened in place, so the tag is the only tail to cut
        let mut in_out = Zeroizing::new(sealed.to_vec());
        let len = self
            .key
            .open_in_place(nonce, Aad::empty(), &mut in_out[..])
            .map_err(|_| {
                BridgeError::AuthenticationFailed(
                    "stored session could not be decrypted; re-import it".to_string(),
                )
            })?
            .len();
        in_out.truncate(len);
        Ok(in_out)
    }
}

/// Write `bytes` to `path` readable by the owner only.
pub(crate) fn write_private(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);

    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(path)?;
    file.write_all(bytes)?;
    file.sync_all()?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

fn warn_if_shared(path: &Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Ok(metadata) = fs::metadata(path) {
            let mode = metadata.permissions().mode() & 0o777;
            if mode & 0o077 != 0 {
                warn!(
                    "Insecure permissions on {}: {:o} (expected 0600)",
                    path.display(),
                    mode
                );
            }
        }
    }
    #[cfg(not(unix))]
    let _ = path;
}
