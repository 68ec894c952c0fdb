//! Key/IV cache backed by an interprocess synchronized file.
//!
//! Every process that opens the same path converges on the same table. The
//! in-memory table is the source of truth for lookups; the synchronized file
//! carries its serialized form and keeps it in step with disk.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info};

use crate::config::CacheConfig;
use crate::table::CacheTable;
use keyiv_common::Result;
use keyiv_crypto::{key_length_for, AtRestProtector, KeyEntry, PasswordHasher};
use keyiv_storage::{ChangeNotifier, FileHooks, Readiness, RetryConfig, SynchronizedFile};

/// Table plus the hooks that route file content through it.
struct CacheState {
    table: Mutex<CacheTable>,
    protector: Arc<dyn AtRestProtector>,
    pending_write: AtomicBool,
}

impl CacheState {
    fn table(&self) -> MutexGuard<'_, CacheTable> {
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl FileHooks for CacheState {
    fn transform_before_write(&self, data: Vec<u8>) -> Result<Vec<u8>> {
        self.protector.protect(&data)
    }

    /// Merge the disk snapshot into memory. Disk wins on collision; entries
    /// only this process knows about are kept and flagged for writing.
    fn transform_after_read(&self, data: Vec<u8>) -> Result<Vec<u8>> {
        let plain = self.protector.unprotect(&data)?;
        let disk = CacheTable::from_bytes(&plain)?;

        let mut table = self.table();
        let local_only = table.count_missing_from(&disk);
        let changed = table.merge_right(&disk);
        if local_only > 0 {
            self.pending_write.store(true, Ordering::SeqCst);
        }
        debug!(
            "Merged {} entries from disk ({} changed, {} local only)",
            disk.len(),
            changed,
            local_only
        );
        table.to_bytes()
    }

    fn take_pending_write(&self) -> bool {
        self.pending_write.swap(false, Ordering::SeqCst)
    }
}

/// Persistent cache of key/IV pairs keyed by password hash.
pub struct KeyIvCache {
    state: Arc<CacheState>,
    file: Arc<SynchronizedFile>,
    hasher: PasswordHasher,
    readiness_timeout: Duration,
}

impl KeyIvCache {
    /// Open a cache on `path`. Nothing is read until [`KeyIvCache::load`].
    ///
    /// Auto-save starts disabled.
    pub fn open(path: impl AsRef<Path>, protector: Arc<dyn AtRestProtector>, retry: RetryConfig) -> Self {
        let readiness_timeout = retry.budget();
        let state = Arc::new(CacheState {
            table: Mutex::new(CacheTable::new()),
            protector,
            pending_write: AtomicBool::new(false),
        });
        let hooks: Arc<dyn FileHooks> = state.clone();
        let file = SynchronizedFile::new(path, hooks, retry);

        Self {
            state,
            file,
            hasher: PasswordHasher::new(),
            readiness_timeout,
        }
    }

    /// Open a cache on `path` using the retry settings of `config`.
    pub fn with_config(path: impl AsRef<Path>, protector: Arc<dyn AtRestProtector>, config: &CacheConfig) -> Self {
        Self::open(path, protector, config.retry_policy())
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Current load state.
    pub fn readiness(&self) -> Readiness {
        self.file.readiness()
    }

    /// Whether mutations are persisted in the background.
    pub fn auto_save(&self) -> bool {
        self.file.auto_save()
    }

    /// Enable or disable background persistence.
    pub fn set_auto_save(&self, enabled: bool) {
        self.file.set_auto_save(enabled);
    }

    /// Load (or reload) the cache file and merge it into memory.
    ///
    /// # Errors
    /// - `PermissionDenied` if the file cannot be read
    /// - `Corrupt` if the blob cannot be unprotected or parsed
    /// - `Timeout` if transient failures exhaust the retry budget
    pub async fn load(&self) -> Result<()> {
        self.file.load().await?;
        debug!("{} holds {} entries", self.path().display(), self.len());
        Ok(())
    }

    /// Start the initial load in the background.
    pub fn start_load(&self) -> Result<()> {
        self.file.start_load()
    }

    /// Reload from disk. Same as [`KeyIvCache::load`].
    pub async fn reload(&self) -> Result<()> {
        self.load().await
    }

    /// Write the table to disk now and wait for it.
    pub async fn save(&self) -> Result<()> {
        self.file.save().await
    }

    /// Wait until every queued background save has completed.
    pub async fn flush(&self, timeout: Duration) -> Result<()> {
        self.file.wait_for_save(timeout).await
    }

    /// Reload whenever `notifier` reports a change to the cache file.
    pub fn enable_reload_on_change(&self, notifier: &dyn ChangeNotifier) -> Result<()> {
        self.file.enable_reload_on_change(notifier)
    }

    /// Stop reloading on change.
    pub fn disable_reload_on_change(&self) {
        self.file.disable_reload_on_change();
    }

    async fn wait_ready(&self) -> Result<()> {
        self.file.wait_for_load(self.readiness_timeout).await
    }

    fn lookup_hash(&self, password: &str, key_size: u32) -> Result<String> {
        key_length_for(key_size)?;
        self.hasher.hash(password, key_size)
    }

    /// Return the key/IV for `password` at `key_size`, creating it on first use.
    ///
    /// Blocks until the initial load completed so a key already on disk is
    /// never shadowed by a fresh one.
    ///
    /// # Postconditions
    /// - Repeated calls return identical bytes
    /// - A newly created entry is queued for saving
    ///
    /// # Errors
    /// - `InvalidArgument` for an empty password or unsupported key size
    /// - `Timeout` if the cache is not loaded in time
    pub async fn get_or_create(&self, password: &str, key_size: u32) -> Result<KeyEntry> {
        let hash = self.lookup_hash(password, key_size)?;
        self.wait_ready().await?;

        if let Some(entry) = self.state.table().get(&hash) {
            return Ok(entry.clone());
        }

        let state = &self.state;
        let (entry, created) = self.file.modify(|data| {
            let mut table = state.table();
            if let Some(entry) = table.get(&hash) {
                return Ok((entry.clone(), false));
            }

            let entry = KeyEntry::generate(key_size)?;
            table.insert(hash.clone(), entry.clone());
            *data = table.to_bytes()?;
            Ok((entry, true))
        })?;

        if created {
            info!("Created {}-bit key/IV entry in {}", key_size, self.path().display());
        }
        Ok(entry)
    }

    /// Whether an entry exists for `password` at `key_size`. Never creates one.
    pub async fn contains(&self, password: &str, key_size: u32) -> Result<bool> {
        let hash = self.lookup_hash(password, key_size)?;
        self.wait_ready().await?;
        Ok(self.state.table().contains(&hash))
    }

    /// Install a key/IV given as `"<base64 key>|<base64 iv>"`, overwriting
    /// any existing entry for `password` at `key_size`.
    ///
    /// # Errors
    /// - `InvalidArgument` for malformed text or mismatched lengths
    pub async fn import(&self, password: &str, key_size: u32, text: &str) -> Result<()> {
        let hash = self.lookup_hash(password, key_size)?;
        let entry = KeyEntry::from_export_text(text, key_size)?;
        self.wait_ready().await?;

        let state = &self.state;
        self.file.modify(|data| {
            let mut table = state.table();
            table.insert(hash, entry);
            *data = table.to_bytes()?;
            Ok(())
        })?;

        info!("Imported {}-bit key/IV entry into {}", key_size, self.path().display());
        Ok(())
    }

    /// Export the key/IV for `password` at `key_size`, creating it if needed.
    pub async fn export(&self, password: &str, key_size: u32) -> Result<String> {
        Ok(self.get_or_create(password, key_size).await?.to_export_text())
    }

    /// Union with `other`; this cache's entries win on collision.
    ///
    /// Returns the number of entries added.
    pub async fn merge_left(&self, other: &KeyIvCache) -> Result<usize> {
        let snapshot = other.snapshot().await?;
        self.merge_with(|table| table.merge_left(&snapshot)).await
    }

    /// Union with `other`; `other`'s entries win on collision.
    ///
    /// Returns the number of entries added or replaced.
    pub async fn merge_right(&self, other: &KeyIvCache) -> Result<usize> {
        let snapshot = other.snapshot().await?;
        self.merge_with(|table| table.merge_right(&snapshot)).await
    }

    async fn merge_with(&self, merge: impl FnOnce(&mut CacheTable) -> usize) -> Result<usize> {
        self.wait_ready().await?;

        let state = &self.state;
        let changed = self.file.modify(|data| {
            let mut table = state.table();
            let changed = merge(&mut *table);
            if changed > 0 {
                *data = table.to_bytes()?;
            }
            Ok(changed)
        })?;

        debug!("Merge changed {} entries in {}", changed, self.path().display());
        Ok(changed)
    }

    /// Copy of the loaded table.
    pub async fn snapshot(&self) -> Result<CacheTable> {
        self.wait_ready().await?;
        Ok(self.state.table().clone())
    }

    /// Number of entries currently in memory.
    pub fn len(&self) -> usize {
        self.state.table().len()
    }

    /// Whether the in-memory table is empty.
    pub fn is_empty(&self) -> bool {
        self.state.table().is_empty()
    }
}

impl std::fmt::Debug for KeyIvCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyIvCache")
            .field("path", &self.path())
            .field("readiness", &self.readiness())
            .field("entries", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keyiv_common::Error;
    use keyiv_crypto::{IdentityProtector, MachineProtector};
    use keyiv_storage::ManualNotifier;
    use tempfile::TempDir;

    fn fast_retry() -> RetryConfig {
        RetryConfig::new(5).with_delay(Duration::from_millis(10))
    }

    fn identity() -> Arc<dyn AtRestProtector> {
        Arc::new(IdentityProtector)
    }

    async fn loaded(path: &Path) -> KeyIvCache {
        let cache = KeyIvCache::open(path, identity(), fast_retry());
        cache.load().await.unwrap();
        cache.set_auto_save(true);
        cache
    }

    #[tokio::test]
    async fn test_get_or_create_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let cache = loaded(&temp.path().join("KeyIVCache.bin")).await;

        let first = cache.get_or_create("hello", 256).await.unwrap();
        let second = cache.get_or_create("hello", 256).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first.key().len(), 32);
        assert_eq!(first.iv().len(), 16);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_fresh_instance_sees_persisted_entry() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("KeyIVCache.bin");

        let writer = loaded(&path).await;
        let issued = writer.get_or_create("hello", 256).await.unwrap();
        writer.flush(Duration::from_secs(2)).await.unwrap();

        let reader = loaded(&path).await;
        assert!(reader.contains("hello", 256).await.unwrap());
        assert_eq!(reader.get_or_create("hello", 256).await.unwrap(), issued);
    }

    #[tokio::test]
    async fn test_strength_isolation() {
        let temp = TempDir::new().unwrap();
        let cache = loaded(&temp.path().join("KeyIVCache.bin")).await;

        let small = cache.get_or_create("x", 128).await.unwrap();
        let large = cache.get_or_create("x", 256).await.unwrap();

        assert_eq!(small.key().len(), 16);
        assert_eq!(large.key().len(), 32);
        assert_ne!(&large.key()[..16], small.key());
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test]
    async fn test_invalid_arguments_rejected_before_io() {
        let temp = TempDir::new().unwrap();
        // Never loaded: argument errors must not wait on the gate
        let cache = KeyIvCache::open(temp.path().join("KeyIVCache.bin"), identity(), fast_retry());

        assert!(matches!(cache.get_or_create("", 256).await, Err(Error::InvalidArgument(_))));
        assert!(matches!(cache.get_or_create("pw", 100).await, Err(Error::InvalidArgument(_))));
        assert!(matches!(cache.import("pw", 128, "nope").await, Err(Error::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn test_unloaded_cache_times_out() {
        let temp = TempDir::new().unwrap();
        let cache = KeyIvCache::open(
            temp.path().join("KeyIVCache.bin"),
            identity(),
            RetryConfig::new(2).with_delay(Duration::from_millis(10)),
        );

        let result = cache.get_or_create("hello", 256).await;
        assert!(matches!(result, Err(Error::Timeout(_))));
        assert!(cache.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_lookup_waits_for_background_load() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("KeyIVCache.bin");

        let writer = loaded(&path).await;
        let issued = writer.get_or_create("hello", 256).await.unwrap();
        writer.flush(Duration::from_secs(2)).await.unwrap();

        let reader = KeyIvCache::open(&path, identity(), fast_retry());
        reader.start_load().unwrap();
        // Must see the disk entry, not mint a duplicate
        assert_eq!(reader.get_or_create("hello", 256).await.unwrap(), issued);
    }

    #[tokio::test]
    async fn test_export_import_scenario() {
        let temp = TempDir::new().unwrap();
        let a = loaded(&temp.path().join("a.bin")).await;
        let b = loaded(&temp.path().join("b.bin")).await;

        let text = a.export("secret", 128).await.unwrap();
        let (key, iv) = text.split_once('|').unwrap();
        assert_eq!(key.len(), 24);
        assert_eq!(iv.len(), 24);

        b.import("secret", 128, &text).await.unwrap();
        assert_eq!(b.export("secret", 128).await.unwrap(), text);
    }

    #[tokio::test]
    async fn test_import_overwrites() {
        let temp = TempDir::new().unwrap();
        let cache = loaded(&temp.path().join("KeyIVCache.bin")).await;
        cache.get_or_create("secret", 128).await.unwrap();

        let text = "QWJjMDEyMzQ1Njc4OXh5eg==|MTIzNDU2Nzg5MGFiY2RlZg==";
        cache.import("secret", 128, text).await.unwrap();

        let entry = cache.get_or_create("secret", 128).await.unwrap();
        assert_eq!(entry.key(), b"Abc0123456789xyz");
        assert_eq!(entry.iv(), b"1234567890abcdef");

        // Key length must match the requested strength
        assert!(matches!(
            cache.import("secret", 256, text).await,
            Err(Error::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_merge_left_and_right() {
        let temp = TempDir::new().unwrap();
        let a = loaded(&temp.path().join("a.bin")).await;
        let b = loaded(&temp.path().join("b.bin")).await;

        let a1 = a.get_or_create("one", 128).await.unwrap();
        let b1 = b.get_or_create("one", 128).await.unwrap();
        let b2 = b.get_or_create("two", 128).await.unwrap();

        let left = loaded(&temp.path().join("left.bin")).await;
        left.merge_right(&a).await.unwrap();
        assert_eq!(left.merge_left(&b).await.unwrap(), 1);
        assert_eq!(left.get_or_create("one", 128).await.unwrap(), a1);
        assert_eq!(left.get_or_create("two", 128).await.unwrap(), b2);

        assert_eq!(a.merge_right(&b).await.unwrap(), 2);
        assert_eq!(a.get_or_create("one", 128).await.unwrap(), b1);
        assert_eq!(a.get_or_create("two", 128).await.unwrap(), b2);
    }

    #[tokio::test]
    async fn test_corrupt_blob_is_fatal() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("KeyIVCache.bin");

        let sealed = KeyIvCache::open(&path, Arc::new(MachineProtector::from_secret(b"machine-a")), fast_retry());
        sealed.load().await.unwrap();
        sealed.get_or_create("hello", 256).await.unwrap();
        sealed.save().await.unwrap();

        let elsewhere = KeyIvCache::open(&path, Arc::new(MachineProtector::from_secret(b"machine-b")), fast_retry());
        assert!(matches!(elsewhere.load().await, Err(Error::Corrupt(_))));
        assert_eq!(elsewhere.readiness(), Readiness::NotLoaded);

        std::fs::write(&path, b"definitely not a cache").unwrap();
        let garbage = KeyIvCache::open(&path, identity(), fast_retry());
        assert!(matches!(garbage.load().await, Err(Error::Corrupt(_))));
    }

    #[tokio::test]
    async fn test_auto_save_off_never_writes() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("KeyIVCache.bin");

        let cache = KeyIvCache::open(&path, identity(), fast_retry());
        cache.load().await.unwrap();
        cache.get_or_create("hello", 256).await.unwrap();
        cache.flush(Duration::from_secs(1)).await.unwrap();

        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_reload_keeps_local_only_entries() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("KeyIVCache.bin");

        let local = KeyIvCache::open(&path, identity(), fast_retry());
        local.load().await.unwrap();
        let mine = local.get_or_create("mine", 256).await.unwrap();

        let peer = loaded(&path).await;
        let theirs = peer.get_or_create("theirs", 256).await.unwrap();
        peer.flush(Duration::from_secs(2)).await.unwrap();

        local.set_auto_save(true);
        local.reload().await.unwrap();
        assert_eq!(local.get_or_create("mine", 256).await.unwrap(), mine);
        assert_eq!(local.get_or_create("theirs", 256).await.unwrap(), theirs);

        // Local-only entry is written back after the merge
        local.flush(Duration::from_secs(2)).await.unwrap();
        let check = loaded(&path).await;
        assert!(check.contains("mine", 256).await.unwrap());
        assert!(check.contains("theirs", 256).await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_first_use_diverges_until_reload() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("KeyIVCache.bin");

        // Two processes, both loaded before either persisted anything
        let first = loaded(&path).await;
        let second = loaded(&path).await;

        let from_first = first.get_or_create("race", 256).await.unwrap();
        first.flush(Duration::from_secs(2)).await.unwrap();
        let from_second = second.get_or_create("race", 256).await.unwrap();
        second.flush(Duration::from_secs(2)).await.unwrap();

        assert_ne!(from_first, from_second);

        // Last writer wins on disk; the other converges after reloading
        first.reload().await.unwrap();
        assert_eq!(first.get_or_create("race", 256).await.unwrap(), from_second);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_change_notification_merges_peer_entries() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("KeyIVCache.bin");
        let notifier = ManualNotifier::new();

        let watcher = loaded(&path).await;
        watcher.enable_reload_on_change(&notifier).unwrap();

        let peer = loaded(&path).await;
        let theirs = peer.get_or_create("theirs", 128).await.unwrap();
        peer.flush(Duration::from_secs(2)).await.unwrap();

        notifier.trigger(&path);
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while !watcher.contains("theirs", 128).await.unwrap() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(watcher.get_or_create("theirs", 128).await.unwrap(), theirs);
    }
}
