//! Node identity: an ed25519 keypair persisted under the pki directory.

use std::path::{Path, PathBuf};

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use tokio::fs;

use crate::pki::CryptoError;

/// SHA-256 of the raw public key, rendered as `ab:cd:...`.
pub fn fingerprint(public_key: &[u8]) -> String {
    Sha256::digest(public_key)
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":")
}

/// Verify `signature` over `message` with a raw 32-byte public key.
pub fn verify_signature(
    public_key: &[u8],
    message: &[u8],
    signature: &[u8],
) -> Result<(), CryptoError> {
    let vk = verifying_key_from_bytes(public_key)?;
    let sig_arr: [u8; 64] =
        signature
            .try_into()
            .map_err(|_| CryptoError::InvalidKeyLength {
                expected: 64,
                found: signature.len(),
            })?;
    vk.verify(message, &Signature::from_bytes(&sig_arr))
        .map_err(|_| CryptoError::VerifyFailed)
}

pub(crate) fn verifying_key_from_bytes(bytes: &[u8]) -> Result<VerifyingKey, CryptoError> {
    let arr: [u8; 32] = bytes.try_into().map_err(|_| CryptoError::InvalidKeyLength {
        expected: 32,
        found: bytes.len(),
    })?;
    VerifyingKey::from_bytes(&arr).map_err(|_| CryptoError::InvalidPublicKey)
}

/// A node's keypair. Read-only after bootstrap, so it is shared by reference
/// or `Arc` without locking.
#[derive(Clone)]
pub struct Identity {
    id: String,
    signing_key: SigningKey,
    fingerprint: String,
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("id", &self.id)
            .field("fingerprint", &self.fingerprint)
            .finish()
    }
}

impl Identity {
    /// Generate a fresh in-memory identity.
    pub fn generate(id: &str) -> Self {
        Self::from_signing_key(id, SigningKey::generate(&mut OsRng))
    }

    fn from_signing_key(id: &str, signing_key: SigningKey) -> Self {
        let fingerprint = fingerprint(signing_key.verifying_key().as_bytes());
        Self {
            id: id.to_string(),
            signing_key,
            fingerprint,
        }
    }

    /// Load `<name>.key` from `pki_dir`, generating and persisting a new
    /// keypair (`<name>.key` + `<name>.pub`) when none exists yet.
    pub async fn load_or_generate(id: &str, pki_dir: &Path, name: &str) -> Result<Self, CryptoError> {
        let key_path = pki_dir.join(format!("{}.key", name));
        if key_path.exists() {
            let identity = Self::load(id, &key_path).await?;
            tracing::debug!(path = %key_path.display(), fingerprint = %identity.fingerprint, "Loaded keypair");
            return Ok(identity);
        }

        let identity = Self::generate(id);
        fs::create_dir_all(pki_dir).await?;
        write_private(&key_path, hex::encode(identity.signing_key.to_bytes())).await?;
        fs::write(
            pki_dir.join(format!("{}.pub", name)),
            hex::encode(identity.public_key()),
        )
        .await?;
        tracing::info!(path = %key_path.display(), fingerprint = %identity.fingerprint, "Generated new keypair");
        Ok(identity)
    }

    async fn load(id: &str, key_path: &Path) -> Result<Self, CryptoError> {
        let text = fs::read_to_string(key_path).await?;
        let bytes = hex::decode(text.trim())?;
        let arr: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::InvalidKeyLength {
                expected: 32,
                found: bytes.len(),
            })?;
        Ok(Self::from_signing_key(id, SigningKey::from_bytes(&arr)))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn public_key(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.signing_key.sign(message).to_bytes().to_vec()
    }
}

/// Read a hex-encoded public key such as `master_sign.pub`.
pub async fn load_public_key(path: &Path) -> Result<Vec<u8>, CryptoError> {
    if !path.exists() {
        return Err(CryptoError::KeyNotFound(PathBuf::from(path)));
    }
    let text = fs::read_to_string(path).await?;
    let bytes = hex::decode(text.trim())?;
    verifying_key_from_bytes(&bytes)?;
    Ok(bytes)
}

#[cfg(unix)]
async fn write_private(path: &Path, contents: String) -> Result<(), CryptoError> {
    use std::os::unix::fs::PermissionsExt;

    fs::write(path, contents).await?;
    fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn write_private(path: &Path, contents: String) -> Result<(), CryptoError> {
    fs::write(path, contents).await?;
    Ok(())
}
