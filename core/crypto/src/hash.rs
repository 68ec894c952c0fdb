//! Password hashing into cache identifiers.
//!
//! The cache never stores raw passwords. Each `(password, key_size)` pair maps
//! to a BLAKE2b-256 digest, base64 encoded, that names its cache entry.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;
use zeroize::Zeroizing;

use keyiv_common::{Error, Result};

/// Domain separation tag mixed into every digest.
const HASH_DOMAIN: &[u8] = b"keyiv-password-hash";

/// Hash a password for a given key size.
///
/// # Preconditions
/// - `password` must not be empty
///
/// # Postconditions
/// - Deterministic for the same inputs
/// - The same password at two key sizes yields two different identifiers
///
/// # Errors
/// - Returns `InvalidArgument` if password is empty
pub fn password_hash(password: &str, key_size: u32) -> Result<String> {
    if password.is_empty() {
        return Err(Error::InvalidArgument(
            "Password cannot be empty".to_string(),
        ));
    }

    let mut hasher = Blake2b::<U32>::new();
    hasher.update(HASH_DOMAIN);
    hasher.update((password.len() as u64).to_le_bytes());
    hasher.update(password.as_bytes());
    hasher.update(key_size.to_le_bytes());

    Ok(STANDARD.encode(hasher.finalize()))
}

/// Memo key; the password copy is wiped when the key is dropped.
#[derive(PartialEq, Eq)]
struct MemoKey {
    password: Zeroizing<String>,
    key_size: u32,
}

impl MemoKey {
    fn new(password: &str, key_size: u32) -> Self {
        Self {
            password: Zeroizing::new(password.to_string()),
            key_size,
        }
    }
}

impl Hash for MemoKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.password.as_str().hash(state);
        self.key_size.hash(state);
    }
}

/// Password hasher with an in-process memo.
///
/// The memo is never persisted; it only avoids recomputing digests for
/// passwords this process has already seen.
#[derive(Default)]
pub struct PasswordHasher {
    memo: Mutex<HashMap<MemoKey, String>>,
}

impl PasswordHasher {
    /// Create a hasher with an empty memo.
    pub fn new() -> Self {
        Self::default()
    }

    /// Hash `password` for `key_size`, consulting the memo first.
    pub fn hash(&self, password: &str, key_size: u32) -> Result<String> {
        let memo_key = MemoKey::new(password, key_size);
        {
            let memo = self.memo.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(hash) = memo.get(&memo_key) {
                return Ok(hash.clone());
            }
        }

        let hash = password_hash(password, key_size)?;
        self.memo
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(memo_key, hash.clone());
        Ok(hash)
    }

    /// Number of memoized digests.
    pub fn memo_len(&self) -> usize {
        self.memo.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_deterministic() {
        let a = password_hash("hello", 256).unwrap();
        let b = password_hash("hello", 256).unwrap();
        assert_eq!(a, b);
        // 32-byte digest in padded base64
        assert_eq!(a.len(), 44);
    }

    #[test]
    fn test_hash_depends_on_key_size() {
        let a = password_hash("x", 128).unwrap();
        let b = password_hash("x", 256).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_hash_is_not_ambiguous_across_boundaries() {
        // "pw1" at 28 bits must not alias "pw" at 128 bits
        let a = password_hash("pw1", 28).unwrap();
        let b = password_hash("pw", 128).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_hash_does_not_contain_password() {
        let hash = password_hash("plain-secret", 128).unwrap();
        assert!(!hash.contains("plain-secret"));
    }

    #[test]
    fn test_empty_password_rejected() {
        assert!(matches!(
            password_hash("", 128),
            Err(Error::InvalidArgument(_))
        ));
        assert!(PasswordHasher::new().hash("", 256).is_err());
    }

    #[test]
    fn test_memo_returns_stable_hash() {
        let hasher = PasswordHasher::new();
        let first = hasher.hash("memo", 128).unwrap();
        let second = hasher.hash("memo", 128).unwrap();

        assert_eq!(first, second);
        assert_eq!(first, password_hash("memo", 128).unwrap());
        assert_eq!(hasher.memo_len(), 1);
    }

    #[test]
    fn test_memo_keys_on_password_and_key_size() {
        let hasher = PasswordHasher::new();
        let a = hasher.hash("memo", 128).unwrap();
        let b = hasher.hash("memo", 256).unwrap();
        let c = hasher.hash("other", 128).unwrap();

        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(hasher.memo_len(), 3);
        assert_eq!(hasher.hash("memo", 256).unwrap(), b);
        assert_eq!(hasher.memo_len(), 3);
    }

}
