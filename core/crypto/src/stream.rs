//! Chunk framing for unbounded streams.
//!
//! The source is read in fixed-size buffers. Each buffer is encrypted on its
//! own and written as a record:
//!
//! ```text
//! [u32 little-endian length][length bytes of ciphertext]
//! ```
//!
//! Records repeat until the source is exhausted; there is no header and no
//! trailing sentinel. An empty source produces no records at all.

use std::io::{self, Read, Write};

use crate::block::SymmetricCipher;
use crate::keys::KeyEntry;
use keyiv_common::{Error, Result};

/// Default plaintext buffer size per record (32 KiB).
pub const DEFAULT_BUFFER_SIZE: usize = 32 * 1024;

/// Size of the record length prefix.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Encrypts a reader into framed records.
pub struct EncryptingStream<'a> {
    cipher: &'a dyn SymmetricCipher,
    entry: &'a KeyEntry,
    buffer_size: usize,
}

impl<'a> EncryptingStream<'a> {
    /// Create a new encrypting stream.
    pub fn new(cipher: &'a dyn SymmetricCipher, entry: &'a KeyEntry) -> Self {
        Self {
            cipher,
            entry,
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }

    /// Set custom plaintext buffer size. Zero falls back to the default.
    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = if size == 0 { DEFAULT_BUFFER_SIZE } else { size };
        self
    }

    /// Encrypt everything from `reader` into `writer`.
    ///
    /// Returns the number of plaintext bytes consumed.
    pub fn encrypt_stream<R: Read, W: Write>(&self, reader: R, writer: W) -> Result<u64> {
        self.encrypt_stream_with_progress(reader, writer, &mut |_| {})
    }

    /// Encrypt with a progress callback receiving cumulative plaintext bytes.
    pub fn encrypt_stream_with_progress<R: Read, W: Write>(
        &self,
        mut reader: R,
        mut writer: W,
        progress: &mut dyn FnMut(u64),
    ) -> Result<u64> {
        let mut buffer = vec![0u8; self.buffer_size];
        let mut total_bytes = 0u64;

        loop {
            let bytes_read = fill_buffer(&mut reader, &mut buffer)?;
            if bytes_read == 0 {
                break;
            }

            let encrypted =
                self.cipher
                    .encrypt(self.entry.key(), self.entry.iv(), &buffer[..bytes_read])?;
            let length = u32::try_from(encrypted.len()).map_err(|_| {
                Error::Crypto("Encrypted chunk exceeds record size limit".to_string())
            })?;

            writer.write_all(&length.to_le_bytes())?;
            writer.write_all(&encrypted)?;

            total_bytes += bytes_read as u64;
            progress(total_bytes);
        }

        writer.flush()?;
        Ok(total_bytes)
    }
}

/// Decrypts framed records back into plaintext.
pub struct DecryptingStream<'a> {
    cipher: &'a dyn SymmetricCipher,
    entry: &'a KeyEntry,
}

impl<'a> DecryptingStream<'a> {
    /// Create a new decrypting stream.
    pub fn new(cipher: &'a dyn SymmetricCipher, entry: &'a KeyEntry) -> Self {
        Self { cipher, entry }
    }

    /// Decrypt every record from `reader` into `writer`.
    ///
    /// Returns the number of plaintext bytes written.
    ///
    /// # Errors
    /// - `Corrupt` on a truncated length prefix or record
    /// - `Crypto` when a record does not decrypt
    pub fn decrypt_stream<R: Read, W: Write>(&self, reader: R, writer: W) -> Result<u64> {
        self.decrypt_stream_with_progress(reader, writer, &mut |_| {})
    }

    /// Decrypt with a progress callback receiving cumulative framed bytes consumed.
    pub fn decrypt_stream_with_progress<R: Read, W: Write>(
        &self,
        mut reader: R,
        mut writer: W,
        progress: &mut dyn FnMut(u64),
    ) -> Result<u64> {
        let mut total_bytes = 0u64;
        let mut consumed = 0u64;

        while let Some(record) = read_record(&mut reader)? {
            consumed += (LENGTH_PREFIX_SIZE + record.len()) as u64;
            if record.is_empty() {
                continue;
            }

            let plaintext = self
                .cipher
                .decrypt(self.entry.key(), self.entry.iv(), &record)?;
            writer.write_all(&plaintext)?;

            total_bytes += plaintext.len() as u64;
            progress(consumed);
        }

        writer.flush()?;
        Ok(total_bytes)
    }
}

/// Read one framed record.
///
/// Returns `Ok(None)` at a clean end of stream (no bytes left before a
/// length prefix).
pub fn read_record<R: Read>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
    let prefix_read = fill_buffer(reader, &mut prefix)?;
    if prefix_read == 0 {
        return Ok(None);
    }
    if prefix_read < LENGTH_PREFIX_SIZE {
        return Err(Error::Corrupt(format!(
            "Truncated record length: {} of {} bytes",
            prefix_read, LENGTH_PREFIX_SIZE
        )));
    }

    let length = u32::from_le_bytes(prefix) as u64;
    let mut record = Vec::new();
    reader.by_ref().take(length).read_to_end(&mut record)?;
    if (record.len() as u64) < length {
        return Err(Error::Corrupt(format!(
            "Truncated record: expected {} bytes, got {}",
            length,
            record.len()
        )));
    }

    Ok(Some(record))
}

/// Read until `buffer` is full or the reader is exhausted.
fn fill_buffer<R: Read>(reader: &mut R, buffer: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buffer.len() {
        match reader.read(&mut buffer[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
