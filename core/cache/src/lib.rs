//! Machine-shared key/IV cache.
//!
//! This crate provides:
//! - [`KeyIvCache`]: password-keyed key/IV pairs persisted to a protected file
//! - [`CacheService`]: startup selection between the shared and per-user cache
//! - [`Cipher`]: string, byte, stream and file encryption by password
//! - [`CacheConfig`]: tunables loaded from JSON
//!
//! # Consistency
//! Every process opening the same file converges on the same entries. Two
//! processes that create the same entry before either has saved may hold
//! different keys until one reloads; the last writer wins on disk.

pub mod bootstrap;
pub mod cache;
pub mod cipher;
pub mod config;
pub mod table;

pub use bootstrap::{check_directory_writable, CacheMode, CacheService, WriteCheck};
pub use cache::KeyIvCache;
pub use cipher::{Cipher, CipherStrength};
pub use config::{CacheConfig, CACHE_FILE_NAME};
pub use table::{CacheTable, CACHE_FORMAT_VERSION};
