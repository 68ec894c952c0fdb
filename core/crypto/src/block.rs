//! Symmetric cipher seam.
//!
//! The cache issues `(key, iv)` pairs; the cipher that consumes them is
//! injected through [`SymmetricCipher`]. [`AesCbc`] is the default: AES in CBC
//! mode with PKCS#7 padding, so ciphertext is always longer than plaintext.

use aes::{Aes128, Aes192, Aes256};
use cbc::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};

use keyiv_common::{Error, Result};

/// A block cipher keyed by a key and an initialization vector.
pub trait SymmetricCipher: Send + Sync {
    /// Encrypt `plaintext`. Output length may differ from input length.
    fn encrypt(&self, key: &[u8], iv: &[u8], plaintext: &[u8]) -> Result<Vec<u8>>;

    /// Decrypt `ciphertext` produced by [`SymmetricCipher::encrypt`].
    fn decrypt(&self, key: &[u8], iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>>;
}

/// AES-CBC with PKCS#7 padding for 128, 192 and 256 bit keys.
#[derive(Debug, Clone, Copy, Default)]
pub struct AesCbc;

fn invalid_length(key: &[u8], iv: &[u8]) -> Error {
    Error::Crypto(format!(
        "Invalid key/IV length: key {} bytes, IV {} bytes",
        key.len(),
        iv.len()
    ))
}

impl SymmetricCipher for AesCbc {
    fn encrypt(&self, key: &[u8], iv: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
        let ciphertext = match key.len() {
            16 => cbc::Encryptor::<Aes128>::new_from_slices(key, iv)
                .map_err(|_| invalid_length(key, iv))?
                .encrypt_padded_vec_mut::<Pkcs7>(plaintext),
            24 => cbc::Encryptor::<Aes192>::new_from_slices(key, iv)
                .map_err(|_| invalid_length(key, iv))?
                .encrypt_padded_vec_mut::<Pkcs7>(plaintext),
            32 => cbc::Encryptor::<Aes256>::new_from_slices(key, iv)
                .map_err(|_| invalid_length(key, iv))?
                .encrypt_padded_vec_mut::<Pkcs7>(plaintext),
            _ => return Err(invalid_length(key, iv)),
        };
        Ok(ciphertext)
    }

    fn decrypt(&self, key: &[u8], iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
        let plaintext = match key.len() {
            16 => cbc::Decryptor::<Aes128>::new_from_slices(key, iv)
                .map_err(|_| invalid_length(key, iv))?
                .decrypt_padded_vec_mut::<Pkcs7>(ciphertext),
            24 => cbc::Decryptor::<Aes192>::new_from_slices(key, iv)
                .map_err(|_| invalid_length(key, iv))?
                .decrypt_padded_vec_mut::<Pkcs7>(ciphertext),
            32 => cbc::Decryptor::<Aes256>::new_from_slices(key, iv)
                .map_err(|_| invalid_length(key, iv))?
                .decrypt_padded_vec_mut::<Pkcs7>(ciphertext),
            _ => return Err(invalid_length(key, iv)),
        };
        plaintext.map_err(|_| Error::Crypto("Decryption failed: invalid padding".to_string()))
    }
}
