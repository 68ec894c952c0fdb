//! Interprocess file synchronization for the key/IV cache.
//!
//! This crate provides:
//! - A synchronized file that mirrors a shared on-disk blob in memory
//! - Fixed-interval retry for transient I/O failures
//! - Change notification so a process picks up writes made by others
//!
//! # Design Principles
//! - Every wait is bounded: readiness and retries give up with a timeout
//! - Writes replace the file atomically, so readers never see a torn blob
//! - Content hooks are injected, keeping this crate free of crypto

pub mod notifier;
pub mod retry;
pub mod synced;

pub use notifier::{ChangeCallback, ChangeNotifier, ManualNotifier, PollingNotifier, Subscription};
pub use retry::{RetryConfig, RetryExecutor, DEFAULT_MAX_ATTEMPTS, DEFAULT_RETRY_DELAY};
pub use synced::{FileHooks, PlainFile, Readiness, SynchronizedFile};
