//! At-rest protection of the persisted cache blob.
//!
//! The cache file must only be usable on the machine that wrote it.
//! [`MachineProtector`] seals the blob with XChaCha20-Poly1305 under a key
//! derived from the machine identity; [`IdentityProtector`] is a passthrough
//! for tests and for callers that protect the file by other means.

use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use chacha20poly1305::{
    aead::{generic_array::GenericArray, Aead, AeadCore, KeyInit, OsRng},
    XChaCha20Poly1305,
};
use machineid_rs::{Encryption, HWIDComponent, IdBuilder};
use tracing::debug;
use zeroize::{Zeroize, ZeroizeOnDrop};

use keyiv_common::{Error, Result};

/// Nonce size for XChaCha20-Poly1305 (24 bytes).
pub const NONCE_SIZE: usize = 24;

/// Authentication tag size (16 bytes).
pub const TAG_SIZE: usize = 16;

/// Salt for the machine fingerprint. Changing it orphans every sealed cache.
const MACHINE_ID_SALT: &str = "keyiv-machine";

/// Capability that makes bytes usable only where they were protected.
pub trait AtRestProtector: Send + Sync {
    /// Seal `data` for storage.
    fn protect(&self, data: &[u8]) -> Result<Vec<u8>>;

    /// Recover bytes sealed by [`AtRestProtector::protect`].
    ///
    /// # Errors
    /// - `Corrupt` when the blob was tampered with or sealed elsewhere
    fn unprotect(&self, data: &[u8]) -> Result<Vec<u8>>;
}

/// Passthrough protector.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityProtector;

impl AtRestProtector for IdentityProtector {
    fn protect(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn unprotect(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }
}

/// Machine-scoped protector.
///
/// Output format is `nonce || ciphertext || tag`.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct MachineProtector {
    key: [u8; 32],
}

impl MachineProtector {
    /// Derive a protector from an arbitrary machine secret.
    pub fn from_secret(secret: &[u8]) -> Self {
        let mut hasher = Blake2b::<U32>::new();
        hasher.update(secret);
        hasher.update(b"keyiv-at-rest");

        let mut key = [0u8; 32];
        key.copy_from_slice(&hasher.finalize());
        Self { key }
    }

    /// Derive a protector from this machine's identity.
    ///
    /// # Errors
    /// - `Crypto` if no machine identity can be read
    pub fn for_this_machine() -> Result<Self> {
        let machine_id = machine_fingerprint(HWIDComponent::SystemID)?;
        debug!("Using system identity for at-rest protection");
        Ok(Self::from_secret(machine_id.as_bytes()))
    }
}

/// Deterministic fingerprint of one hardware component.
fn machine_fingerprint(component: HWIDComponent) -> Result<String> {
    IdBuilder::new(Encryption::SHA256)
        .add_component(component)
        .build(MACHINE_ID_SALT)
        .map_err(|e| Error::Crypto(format!("No machine identity available: {}", e)))
}

impl AtRestProtector for MachineProtector {
    fn protect(&self, data: &[u8]) -> Result<Vec<u8>> {
        let cipher = XChaCha20Poly1305::new(GenericArray::from_slice(&self.key));
        let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);

        let ciphertext = cipher
            .encrypt(&nonce, data)
            .map_err(|e| Error::Crypto(format!("Protection failed: {}", e)))?;

        let mut result = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        result.extend_from_slice(&nonce);
        result.extend_from_slice(&ciphertext);
        Ok(result)
    }

    fn unprotect(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.len() < NONCE_SIZE + TAG_SIZE {
            return Err(Error::Corrupt("Protected blob too short".to_string()));
        }

        let (nonce_bytes, sealed) = data.split_at(NONCE_SIZE);
        let cipher = XChaCha20Poly1305::new(GenericArray::from_slice(&self.key));

        cipher
            .decrypt(GenericArray::from_slice(nonce_bytes), sealed)
            .map_err(|_| {
                Error::Corrupt(
                    "Protected blob failed authentication (tampered or sealed on another machine)"
                        .to_string(),
                )
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_is_passthrough() {
        let data = b"plain cache".to_vec();
        assert_eq!(IdentityProtector.protect(&data).unwrap(), data);
        assert_eq!(IdentityProtector.unprotect(&data).unwrap(), data);
    }

    #[test]
    fn test_machine_protector_roundtrip() {
        let protector = MachineProtector::from_secret(b"machine-a");
        let sealed = protector.protect(b"{\"version\":1}").unwrap();

        assert_eq!(sealed.len(), NONCE_SIZE + 13 + TAG_SIZE);
        assert_eq!(protector.unprotect(&sealed).unwrap(), b"{\"version\":1}");
    }

    #[test]
    fn test_other_machine_cannot_unprotect() {
        let here = MachineProtector::from_secret(b"machine-a");
        let there = MachineProtector::from_secret(b"machine-b");
        let sealed = here.protect(b"keys").unwrap();

        assert!(matches!(there.unprotect(&sealed), Err(Error::Corrupt(_))));
    }

    #[test]
    fn test_this_machine_is_stable_or_reports_crypto_error() {
        match (MachineProtector::for_this_machine(), MachineProtector::for_this_machine()) {
            (Ok(first), Ok(second)) => {
                let sealed = first.protect(b"same machine").unwrap();
                assert_eq!(second.unprotect(&sealed).unwrap(), b"same machine");
            }
            (Err(err), _) | (_, Err(err)) => assert!(matches!(err, Error::Crypto(_))),
        }
    }

    #[test]
    fn test_tampered_blob_is_corrupt() {
        let protector = MachineProtector::from_secret(b"machine-a");
        let mut sealed = protector.protect(b"keys and ivs").unwrap();
        sealed[NONCE_SIZE + 2] ^= 0xFF;

        assert!(matches!(protector.unprotect(&sealed), Err(Error::Corrupt(_))));
        assert!(matches!(protector.unprotect(&[0u8; 8]), Err(Error::Corrupt(_))));
    }
}
