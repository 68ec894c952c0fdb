//! Cryptographic building blocks for the key/IV cache.
//!
//! This module provides:
//! - Password hashing into stable, non-reversible cache identifiers
//! - Key/IV entries sized per requested strength
//! - The symmetric cipher seam with an AES-CBC implementation
//! - At-rest protection of the persisted cache blob
//! - Length-prefixed chunk framing for unbounded streams
//!
//! # Security Guarantees
//! - Key material is zeroized on drop
//! - No password or key material is ever logged
//! - Raw passwords never leave process memory

pub mod block;
pub mod hash;
pub mod keys;
pub mod protect;
pub mod stream;

pub use block::{AesCbc, SymmetricCipher};
pub use hash::{password_hash, PasswordHasher};
pub use keys::{key_length_for, KeyEntry, IV_LENGTH, SUPPORTED_KEY_SIZES};
pub use protect::{AtRestProtector, IdentityProtector, MachineProtector};
pub use stream::{read_record, DecryptingStream, EncryptingStream, DEFAULT_BUFFER_SIZE};
