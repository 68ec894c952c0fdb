//! Password-based encryption façade over the key/IV cache.
//!
//! A password and a [`CipherStrength`] select a cached key/IV pair, which is
//! then fed to the injected [`SymmetricCipher`]. Strength `None` passes data
//! through untouched.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tracing::debug;

use crate::cache::KeyIvCache;
use keyiv_common::{Error, Result};
use keyiv_crypto::{
    AesCbc, DecryptingStream, EncryptingStream, KeyEntry, SymmetricCipher, DEFAULT_BUFFER_SIZE,
};

/// Requested encryption strength.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CipherStrength {
    /// No encryption.
    None,
    /// AES with a 128-bit key.
    Aes128,
    /// AES with a 256-bit key.
    #[default]
    Aes256,
}

impl CipherStrength {
    /// Key size in bits, or `None` for passthrough.
    pub fn key_size(self) -> Option<u32> {
        match self {
            CipherStrength::None => None,
            CipherStrength::Aes128 => Some(128),
            CipherStrength::Aes256 => Some(256),
        }
    }
}

impl fmt::Display for CipherStrength {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CipherStrength::None => "none",
            CipherStrength::Aes128 => "aes128",
            CipherStrength::Aes256 => "aes256",
        };
        f.write_str(name)
    }
}

impl FromStr for CipherStrength {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(CipherStrength::None),
            "aes128" | "128" => Ok(CipherStrength::Aes128),
            "aes256" | "256" => Ok(CipherStrength::Aes256),
            other => Err(Error::InvalidArgument(format!(
                "Unknown cipher strength: {}",
                other
            ))),
        }
    }
}

/// Encrypts and decrypts strings, bytes, streams and files by password.
#[derive(Clone)]
pub struct Cipher {
    cache: Arc<KeyIvCache>,
    primitive: Arc<dyn SymmetricCipher>,
    buffer_size: usize,
}

impl Cipher {
    /// Create a façade using AES-CBC.
    pub fn new(cache: Arc<KeyIvCache>) -> Self {
        Self::with_primitive(cache, Arc::new(AesCbc))
    }

    /// Create a façade with a custom block cipher.
    pub fn with_primitive(cache: Arc<KeyIvCache>, primitive: Arc<dyn SymmetricCipher>) -> Self {
        Self {
            cache,
            primitive,
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }

    /// Set plaintext bytes per stream record.
    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = if size == 0 { DEFAULT_BUFFER_SIZE } else { size };
        self
    }

    /// The cache keys are drawn from.
    pub fn cache(&self) -> &Arc<KeyIvCache> {
        &self.cache
    }

    /// Resolve the key/IV for a strength; `None` means passthrough.
    ///
    /// # Errors
    /// - `InvalidArgument` if `password` is empty for a real strength
    pub async fn key_for(&self, password: &str, strength: CipherStrength) -> Result<Option<KeyEntry>> {
        let Some(key_size) = strength.key_size() else {
            return Ok(None);
        };
        if password.is_empty() {
            return Err(Error::InvalidArgument(
                "Password cannot be empty".to_string(),
            ));
        }
        Ok(Some(self.cache.get_or_create(password, key_size).await?))
    }

    /// Encrypt bytes with the key issued for `password`.
    pub async fn encrypt_bytes(&self, data: &[u8], password: &str, strength: CipherStrength) -> Result<Vec<u8>> {
        match self.key_for(password, strength).await? {
            Some(entry) => self.encrypt_bytes_with(data, &entry),
            None => Ok(data.to_vec()),
        }
    }

    /// Decrypt bytes produced by [`Cipher::encrypt_bytes`].
    pub async fn decrypt_bytes(&self, data: &[u8], password: &str, strength: CipherStrength) -> Result<Vec<u8>> {
        match self.key_for(password, strength).await? {
            Some(entry) => self.decrypt_bytes_with(data, &entry),
            None => Ok(data.to_vec()),
        }
    }

    /// Encrypt bytes with an explicit key/IV, bypassing the cache.
    pub fn encrypt_bytes_with(&self, data: &[u8], entry: &KeyEntry) -> Result<Vec<u8>> {
        self.primitive.encrypt(entry.key(), entry.iv(), data)
    }

    /// Decrypt bytes with an explicit key/IV, bypassing the cache.
    pub fn decrypt_bytes_with(&self, data: &[u8], entry: &KeyEntry) -> Result<Vec<u8>> {
        self.primitive.decrypt(entry.key(), entry.iv(), data)
    }

    /// Encrypt text: UTF-16LE encode, encrypt, base64 encode.
    ///
    /// An empty string stays empty; strength `None` returns `text` unchanged.
    pub async fn encrypt_string(&self, text: &str, password: &str, strength: CipherStrength) -> Result<String> {
        if text.is_empty() || strength == CipherStrength::None {
            return Ok(text.to_string());
        }
        let encrypted = self
            .encrypt_bytes(&utf16le_encode(text), password, strength)
            .await?;
        Ok(STANDARD.encode(encrypted))
    }

    /// Decrypt text produced by [`Cipher::encrypt_string`].
    ///
    /// Strength `None` returns `text` unchanged.
    ///
    /// # Errors
    /// - `InvalidArgument` if `text` is not base64
    /// - `Corrupt` if the plaintext is not valid UTF-16
    pub async fn decrypt_string(&self, text: &str, password: &str, strength: CipherStrength) -> Result<String> {
        if text.is_empty() || strength == CipherStrength::None {
            return Ok(text.to_string());
        }
        let encrypted = STANDARD
            .decode(text.trim())
            .map_err(|e| Error::InvalidArgument(format!("Encrypted text is not base64: {}", e)))?;
        let plain = self.decrypt_bytes(&encrypted, password, strength).await?;
        utf16le_decode(&plain)
    }

    /// Encrypt a stream into length-prefixed records.
    ///
    /// Returns plaintext bytes consumed.
    pub async fn encrypt_stream<R: Read, W: Write>(
        &self,
        reader: R,
        writer: W,
        password: &str,
        strength: CipherStrength,
    ) -> Result<u64> {
        self.encrypt_stream_with_progress(reader, writer, password, strength, &mut |_| {})
            .await
    }

    /// Encrypt a stream, reporting cumulative plaintext bytes.
    pub async fn encrypt_stream_with_progress<R: Read, W: Write>(
        &self,
        reader: R,
        writer: W,
        password: &str,
        strength: CipherStrength,
        progress: &mut dyn FnMut(u64),
    ) -> Result<u64> {
        let entry = self.key_for(password, strength).await?;
        encrypt_framed(&*self.primitive, entry.as_ref(), self.buffer_size, reader, writer, progress)
    }

    /// Decrypt a stream of length-prefixed records.
    ///
    /// Returns plaintext bytes written.
    pub async fn decrypt_stream<R: Read, W: Write>(
        &self,
        reader: R,
        writer: W,
        password: &str,
        strength: CipherStrength,
    ) -> Result<u64> {
        self.decrypt_stream_with_progress(reader, writer, password, strength, &mut |_| {})
            .await
    }

    /// Decrypt a stream, reporting cumulative framed bytes consumed.
    pub async fn decrypt_stream_with_progress<R: Read, W: Write>(
        &self,
        reader: R,
        writer: W,
        password: &str,
        strength: CipherStrength,
        progress: &mut dyn FnMut(u64),
    ) -> Result<u64> {
        let entry = self.key_for(password, strength).await?;
        decrypt_framed(&*self.primitive, entry.as_ref(), reader, writer, progress)
    }

    /// Encrypt a stream with an explicit key/IV.
    pub fn encrypt_stream_with<R: Read, W: Write>(
        &self,
        entry: &KeyEntry,
        reader: R,
        writer: W,
        progress: &mut dyn FnMut(u64),
    ) -> Result<u64> {
        encrypt_framed(&*self.primitive, Some(entry), self.buffer_size, reader, writer, progress)
    }

    /// Decrypt a stream with an explicit key/IV.
    pub fn decrypt_stream_with<R: Read, W: Write>(
        &self,
        entry: &KeyEntry,
        reader: R,
        writer: W,
        progress: &mut dyn FnMut(u64),
    ) -> Result<u64> {
        decrypt_framed(&*self.primitive, Some(entry), reader, writer, progress)
    }

    /// Encrypt `source` into `destination`.
    pub async fn encrypt_file(
        &self,
        source: &Path,
        destination: &Path,
        password: &str,
        strength: CipherStrength,
    ) -> Result<u64> {
        self.encrypt_file_with_progress(source, destination, password, strength, |_| {})
            .await
    }

    /// Encrypt a file on the blocking pool, reporting cumulative plaintext bytes.
    pub async fn encrypt_file_with_progress(
        &self,
        source: &Path,
        destination: &Path,
        password: &str,
        strength: CipherStrength,
        mut progress: impl FnMut(u64) + Send + 'static,
    ) -> Result<u64> {
        let entry = self.key_for(password, strength).await?;
        let primitive = Arc::clone(&self.primitive);
        let buffer_size = self.buffer_size;

        let total = self
            .run_file_job(source, destination, move |reader, writer| {
                encrypt_framed(&*primitive, entry.as_ref(), buffer_size, reader, writer, &mut progress)
            })
            .await?;
        debug!("Encrypted {} bytes from {}", total, source.display());
        Ok(total)
    }

    /// Decrypt `source` into `destination`.
    pub async fn decrypt_file(
        &self,
        source: &Path,
        destination: &Path,
        password: &str,
        strength: CipherStrength,
    ) -> Result<u64> {
        self.decrypt_file_with_progress(source, destination, password, strength, |_| {})
            .await
    }

    /// Decrypt a file on the blocking pool, reporting cumulative framed bytes.
    pub async fn decrypt_file_with_progress(
        &self,
        source: &Path,
        destination: &Path,
        password: &str,
        strength: CipherStrength,
        mut progress: impl FnMut(u64) + Send + 'static,
    ) -> Result<u64> {
        let entry = self.key_for(password, strength).await?;
        let primitive = Arc::clone(&self.primitive);

        let total = self
            .run_file_job(source, destination, move |reader, writer| {
                decrypt_framed(&*primitive, entry.as_ref(), reader, writer, &mut progress)
            })
            .await?;
        debug!("Decrypted {} bytes from {}", total, source.display());
        Ok(total)
    }

    async fn run_file_job<F>(&self, source: &Path, destination: &Path, job: F) -> Result<u64>
    where
        F: FnOnce(BufReader<File>, BufWriter<File>) -> Result<u64> + Send + 'static,
    {
        let source: PathBuf = source.to_path_buf();
        let destination: PathBuf = destination.to_path_buf();

        tokio::task::spawn_blocking(move || {
            let reader = File::open(&source).map_err(|e| Error::from_io(e, &source))?;
            let writer = File::create(&destination).map_err(|e| Error::from_io(e, &destination))?;
            job(BufReader::new(reader), BufWriter::new(writer))
        })
        .await
        .map_err(|e| Error::Io(io::Error::other(format!("File task failed: {}", e))))?
    }
}

fn encrypt_framed<R: Read, W: Write>(
    primitive: &dyn SymmetricCipher,
    entry: Option<&KeyEntry>,
    buffer_size: usize,
    reader: R,
    writer: W,
    progress: &mut dyn FnMut(u64),
) -> Result<u64> {
    match entry {
        Some(entry) => EncryptingStream::new(primitive, entry)
            .with_buffer_size(buffer_size)
            .encrypt_stream_with_progress(reader, writer, progress),
        None => passthrough(reader, writer, progress),
    }
}

fn decrypt_framed<R: Read, W: Write>(
    primitive: &dyn SymmetricCipher,
    entry: Option<&KeyEntry>,
    reader: R,
    writer: W,
    progress: &mut dyn FnMut(u64),
) -> Result<u64> {
    match entry {
        Some(entry) => {
            DecryptingStream::new(primitive, entry).decrypt_stream_with_progress(reader, writer, progress)
        }
        None => passthrough(reader, writer, progress),
    }
}

fn passthrough<R: Read, W: Write>(mut reader: R, mut writer: W, progress: &mut dyn FnMut(u64)) -> Result<u64> {
    let copied = io::copy(&mut reader, &mut writer)?;
    writer.flush()?;
    progress(copied);
    Ok(copied)
}

fn utf16le_encode(text: &str) -> Vec<u8> {
    text.encode_utf16().flat_map(u16::to_le_bytes).collect()
}

fn utf16le_decode(bytes: &[u8]) -> Result<String> {
    if bytes.len() % 2 != 0 {
        return Err(Error::Corrupt(
            "Decrypted text has an odd number of bytes".to_string(),
        ));
    }
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    String::from_utf16(&units).map_err(|e| Error::Corrupt(format!("Decrypted text is not UTF-16: {}", e)))
}
