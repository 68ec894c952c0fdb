//! Key/IV entries with secure memory handling.
//!
//! A [`KeyEntry`] is created once per distinct `(password, key_size)` and is
//! never mutated afterwards. Its bytes live in [`SensitiveBytes`] so they are
//! zeroized when the last copy is dropped.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;

use keyiv_common::{Error, Result, SensitiveBytes};

/// Length of the initialization vector in bytes (AES block size).
pub const IV_LENGTH: usize = 16;

/// Key sizes, in bits, accepted by the cache.
pub const SUPPORTED_KEY_SIZES: [u32; 3] = [128, 192, 256];

/// Separator between key and IV in the export text format.
const EXPORT_SEPARATOR: char = '|';

/// Map a key size in bits to a key length in bytes.
///
/// # Errors
/// - Returns `InvalidArgument` for sizes outside [`SUPPORTED_KEY_SIZES`]
pub fn key_length_for(key_size: u32) -> Result<usize> {
    if SUPPORTED_KEY_SIZES.contains(&key_size) {
        Ok((key_size / 8) as usize)
    } else {
        Err(Error::InvalidArgument(format!(
            "Unsupported key size: {} bits (expected one of {:?})",
            key_size, SUPPORTED_KEY_SIZES
        )))
    }
}

/// Symmetric key and initialization vector issued for one password and strength.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "PersistedEntry", into = "PersistedEntry")]
pub struct KeyEntry {
    key: SensitiveBytes,
    iv: SensitiveBytes,
}

impl KeyEntry {
    /// Create an entry from raw key and IV bytes.
    pub fn new(key: Vec<u8>, iv: Vec<u8>) -> Self {
        Self {
            key: SensitiveBytes::new(key),
            iv: SensitiveBytes::new(iv),
        }
    }

    /// Generate a fresh random entry for `key_size` bits.
    ///
    /// # Postconditions
    /// - `key().len() == key_size / 8`
    /// - `iv().len() == IV_LENGTH`
    ///
    /// # Errors
    /// - Unsupported key size
    pub fn generate(key_size: u32) -> Result<Self> {
        let key_length = key_length_for(key_size)?;

        let mut rng = rand::rng();
        let mut key = vec![0u8; key_length];
        let mut iv = vec![0u8; IV_LENGTH];
        rng.fill_bytes(&mut key);
        rng.fill_bytes(&mut iv);

        Ok(Self::new(key, iv))
    }

    /// Get the key bytes.
    ///
    /// # Security
    /// The returned slice should be used immediately and not stored.
    pub fn key(&self) -> &[u8] {
        self.key.as_bytes()
    }

    /// Get the IV bytes.
    pub fn iv(&self) -> &[u8] {
        self.iv.as_bytes()
    }

    /// Key strength in bits.
    pub fn key_size(&self) -> u32 {
        (self.key.len() * 8) as u32
    }

    /// Format as `"<base64 key>|<base64 iv>"`.
    pub fn to_export_text(&self) -> String {
        format!(
            "{}{}{}",
            STANDARD.encode(self.key()),
            EXPORT_SEPARATOR,
            STANDARD.encode(self.iv())
        )
    }

    /// Parse the `"<base64 key>|<base64 iv>"` format for a `key_size` entry.
    ///
    /// # Errors
    /// - Missing separator or extra parts
    /// - Invalid base64
    /// - Key length does not match `key_size`, or IV is not [`IV_LENGTH`] bytes
    pub fn from_export_text(text: &str, key_size: u32) -> Result<Self> {
        let key_length = key_length_for(key_size)?;

        let mut parts = text.trim().split(EXPORT_SEPARATOR);
        let (key_text, iv_text) = match (parts.next(), parts.next(), parts.next()) {
            (Some(key), Some(iv), None) => (key, iv),
            _ => {
                return Err(Error::InvalidArgument(
                    "Key/IV text must be two base64 values separated by '|'".to_string(),
                ))
            }
        };

        let key = STANDARD
            .decode(key_text)
            .map_err(|e| Error::InvalidArgument(format!("Invalid base64 key: {}", e)))?;
        let iv = STANDARD
            .decode(iv_text)
            .map_err(|e| Error::InvalidArgument(format!("Invalid base64 IV: {}", e)))?;

        if key.len() != key_length {
            return Err(Error::InvalidArgument(format!(
                "Key length mismatch: expected {} bytes for {} bits, got {}",
                key_length,
                key_size,
                key.len()
            )));
        }
        if iv.len() != IV_LENGTH {
            return Err(Error::InvalidArgument(format!(
                "IV length mismatch: expected {}, got {}",
                IV_LENGTH,
                iv.len()
            )));
        }

        Ok(Self::new(key, iv))
    }
}

impl fmt::Debug for KeyEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyEntry([REDACTED; {} bits])", self.key_size())
    }
}

/// On-disk form of a [`KeyEntry`].
#[derive(Serialize, Deserialize)]
struct PersistedEntry {
    key: String,
    iv: String,
}

impl From<KeyEntry> for PersistedEntry {
    fn from(entry: KeyEntry) -> Self {
        Self {
            key: STANDARD.encode(entry.key()),
            iv: STANDARD.encode(entry.iv()),
        }
    }
}

impl TryFrom<PersistedEntry> for KeyEntry {
    type Error = String;

    fn try_from(persisted: PersistedEntry) -> std::result::Result<Self, Self::Error> {
        let key = STANDARD
            .decode(&persisted.key)
            .map_err(|e| format!("invalid key encoding: {}", e))?;
        let iv = STANDARD
            .decode(&persisted.iv)
            .map_err(|e| format!("invalid IV encoding: {}", e))?;
        Ok(KeyEntry::new(key, iv))
    }
}
