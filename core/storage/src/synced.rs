//! Interprocess synchronized file.
//!
//! A [`SynchronizedFile`] owns a path and an in-memory byte blob. Loads read
//! the file, pass the bytes through [`FileHooks::transform_after_read`] and
//! open the readiness gate. Saves pass the blob through
//! [`FileHooks::transform_before_write`] and replace the file atomically
//! (write to a temporary sibling, then rename). Transient I/O failures are
//! retried per [`RetryConfig`].
//!
//! Other processes may write the same path at any time. With reload-on-change
//! enabled, a [`ChangeNotifier`] callback schedules a fresh load; the hooks
//! decide how the reloaded bytes are merged with in-memory state.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::notifier::{ChangeCallback, ChangeNotifier, Subscription};
use crate::retry::{RetryConfig, RetryExecutor};
use keyiv_common::{Error, Result};

/// Load state of a synchronized file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// No load has been attempted, or the last attempt failed.
    NotLoaded,
    /// The first load is in progress.
    Loading,
    /// At least one load completed. Never reverts.
    Ready,
}

/// Hook points applied around file I/O.
pub trait FileHooks: Send + Sync {
    /// Transform the in-memory blob into the bytes written to disk.
    fn transform_before_write(&self, data: Vec<u8>) -> Result<Vec<u8>> {
        Ok(data)
    }

    /// Transform bytes read from disk into the in-memory blob.
    ///
    /// Not called when the file is missing or empty.
    fn transform_after_read(&self, data: Vec<u8>) -> Result<Vec<u8>> {
        Ok(data)
    }

    /// Whether the last read left in-memory state that disk does not have yet.
    ///
    /// Checked (and reset) after every successful load.
    fn take_pending_write(&self) -> bool {
        false
    }
}

/// Hooks that store bytes verbatim.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainFile;

impl FileHooks for PlainFile {}

/// File shared between processes, mirrored by an in-memory blob.
pub struct SynchronizedFile {
    path: PathBuf,
    data: RwLock<Vec<u8>>,
    hooks: Arc<dyn FileHooks>,
    retry: RetryExecutor,
    auto_save: AtomicBool,
    readiness: watch::Sender<Readiness>,
    pending_saves: watch::Sender<usize>,
    last_save_error: Mutex<Option<Error>>,
    load_lock: tokio::sync::Mutex<()>,
    write_lock: tokio::sync::Mutex<()>,
    subscription: Mutex<Option<Subscription>>,
}

impl SynchronizedFile {
    /// Create a synchronized file for `path`.
    ///
    /// Nothing is read until [`SynchronizedFile::load`] runs.
    pub fn new(path: impl AsRef<Path>, hooks: Arc<dyn FileHooks>, retry: RetryConfig) -> Arc<Self> {
        let (readiness, _) = watch::channel(Readiness::NotLoaded);
        let (pending_saves, _) = watch::channel(0usize);

        Arc::new(Self {
            path: path.as_ref().to_path_buf(),
            data: RwLock::new(Vec::new()),
            hooks,
            retry: RetryExecutor::new(retry),
            auto_save: AtomicBool::new(false),
            readiness,
            pending_saves,
            last_save_error: Mutex::new(None),
            load_lock: tokio::sync::Mutex::new(()),
            write_lock: tokio::sync::Mutex::new(()),
            subscription: Mutex::new(None),
        })
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current load state.
    pub fn readiness(&self) -> Readiness {
        *self.readiness.borrow()
    }

    /// Retry settings used for file I/O.
    pub fn retry_config(&self) -> &RetryConfig {
        self.retry.config()
    }

    /// Whether blob changes are written in the background.
    pub fn auto_save(&self) -> bool {
        self.auto_save.load(Ordering::SeqCst)
    }

    /// Enable or disable background writes on change.
    pub fn set_auto_save(&self, enabled: bool) {
        self.auto_save.store(enabled, Ordering::SeqCst);
    }

    /// Copy of the in-memory blob.
    pub fn data(&self) -> Vec<u8> {
        self.data.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Replace the in-memory blob.
    ///
    /// When auto-save is on and the content actually changed, a background
    /// save is queued. The caller never waits for the write.
    pub fn set_data(self: &Arc<Self>, data: Vec<u8>) {
        // Infallible closure
        let _ = self.modify(|current| {
            *current = data;
            Ok(())
        });
    }

    /// Mutate the in-memory blob in place while holding its write lock.
    ///
    /// Loads take the same lock around [`FileHooks::transform_after_read`],
    /// so state derived from the blob can be updated here without racing a
    /// reload. A background save is queued as for [`SynchronizedFile::set_data`].
    pub fn modify<T>(
        self: &Arc<Self>,
        mutate: impl FnOnce(&mut Vec<u8>) -> Result<T>,
    ) -> Result<T> {
        let (result, changed) = {
            let mut current = self.data.write().unwrap_or_else(|e| e.into_inner());
            let before = current.clone();
            let result = mutate(&mut current)?;
            (result, *current != before)
        };

        if changed && self.auto_save() {
            self.spawn_save();
        }
        Ok(result)
    }

    /// Read the file and open the readiness gate.
    ///
    /// A missing or empty file counts as a successful, empty load.
    ///
    /// # Errors
    /// - `Timeout` when transient failures exhaust the retry budget
    /// - `PermissionDenied` when the file cannot be read
    /// - Any error raised by [`FileHooks::transform_after_read`]
    pub async fn load(self: &Arc<Self>) -> Result<()> {
        let _guard = self.load_lock.lock().await;
        self.readiness.send_if_modified(|state| {
            if *state == Readiness::NotLoaded {
                *state = Readiness::Loading;
                true
            } else {
                false
            }
        });

        match self.read_from_disk().await {
            Ok(()) => {
                if self.readiness.send_replace(Readiness::Ready) != Readiness::Ready {
                    info!("Loaded {}", self.path.display());
                }
                if self.hooks.take_pending_write() && self.auto_save() {
                    debug!("Local state ahead of {}, queueing save", self.path.display());
                    self.spawn_save();
                }
                Ok(())
            }
            Err(err) => {
                self.readiness.send_if_modified(|state| {
                    if *state == Readiness::Loading {
                        *state = Readiness::NotLoaded;
                        true
                    } else {
                        false
                    }
                });
                Err(err)
            }
        }
    }

    /// Start a load in the background. Readers wait on the readiness gate.
    pub fn start_load(self: &Arc<Self>) -> Result<()> {
        let runtime = current_runtime()?;
        let file = Arc::clone(self);
        runtime.spawn(async move {
            if let Err(err) = file.load().await {
                error!("Background load of {} failed: {}", file.path.display(), err);
            }
        });
        Ok(())
    }

    async fn read_from_disk(&self) -> Result<()> {
        let path = self.path.as_path();
        let raw = self
            .retry
            .execute("read data from cache file", move || async move {
                match tokio::fs::read(path).await {
                    Ok(bytes) => Ok(Some(bytes)),
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
                    Err(err) => Err(Error::from_io(err, path)),
                }
            })
            .await?;

        match raw {
            Some(bytes) if !bytes.is_empty() => {
                debug!("Read {} bytes from {}", bytes.len(), path.display());
                let mut data = self.data.write().unwrap_or_else(|e| e.into_inner());
                *data = self.hooks.transform_after_read(bytes)?;
            }
            _ => debug!("{} is missing or empty", path.display()),
        }
        Ok(())
    }

    /// Write the in-memory blob to disk, replacing the file atomically.
    ///
    /// Concurrent saves from this process are serialized.
    pub async fn save(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        let plain = self.data();
        let bytes = self.hooks.transform_before_write(plain)?;
        let path = self.path.as_path();
        let bytes = bytes.as_slice();

        self.retry
            .execute("write data to cache file", move || write_atomic(path, bytes))
            .await?;
        debug!("Saved {} bytes to {}", bytes.len(), path.display());
        Ok(())
    }

    /// Queue a save on the tokio runtime without waiting for it.
    pub fn spawn_save(self: &Arc<Self>) {
        let runtime = match current_runtime() {
            Ok(runtime) => runtime,
            Err(err) => {
                warn!("Cannot queue save of {}: {}", self.path.display(), err);
                return;
            }
        };

        self.pending_saves.send_modify(|pending| *pending += 1);
        let file = Arc::clone(self);
        runtime.spawn(async move {
            if let Err(err) = file.save().await {
                error!("Background save of {} failed: {}", file.path.display(), err);
                *file.last_save_error.lock().unwrap_or_else(|e| e.into_inner()) = Some(err);
            }
            file.pending_saves
                .send_modify(|pending| *pending = pending.saturating_sub(1));
        });
    }

    /// Wait until the first load completed.
    ///
    /// # Errors
    /// - `Timeout` if the gate does not open within `timeout`
    pub async fn wait_for_load(&self, timeout: Duration) -> Result<()> {
        let mut receiver = self.readiness.subscribe();
        let result = match tokio::time::timeout(timeout, receiver.wait_for(|state| *state == Readiness::Ready))
            .await
        {
            Ok(Ok(_)) => Ok(()),
            _ => Err(Error::Timeout(format!(
                "Timeout waiting to read data from {}",
                self.path.display()
            ))),
        };
        result
    }

    /// Wait until every queued background save has finished.
    ///
    /// # Errors
    /// - `Timeout` if saves are still pending after `timeout`
    /// - The error of a background save that failed since the last call
    pub async fn wait_for_save(&self, timeout: Duration) -> Result<()> {
        let mut receiver = self.pending_saves.subscribe();
        let drained = tokio::time::timeout(timeout, receiver.wait_for(|pending| *pending == 0))
            .await
            .map(|result| result.is_ok())
            .unwrap_or(false);

        if !drained {
            return Err(Error::Timeout(format!(
                "Timeout waiting to save data to {}",
                self.path.display()
            )));
        }

        match self
            .last_save_error
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Reload whenever `notifier` reports a change to the file.
    ///
    /// Each notification schedules a load on the current runtime, so the
    /// notifier's thread is never blocked by file I/O.
    pub fn enable_reload_on_change(self: &Arc<Self>, notifier: &dyn ChangeNotifier) -> Result<()> {
        let runtime = current_runtime()?;
        let weak = Arc::downgrade(self);

        let callback: ChangeCallback = Arc::new(move || {
            if let Some(file) = weak.upgrade() {
                runtime.spawn(async move {
                    if let Err(err) = file.load().await {
                        warn!("Reload of {} failed: {}", file.path.display(), err);
                    }
                });
            }
        });

        let subscription = notifier.subscribe(&self.path, callback)?;
        *self.subscription.lock().unwrap_or_else(|e| e.into_inner()) = Some(subscription);
        debug!("Reload on change enabled for {}", self.path.display());
        Ok(())
    }

    /// Stop reacting to change notifications.
    pub fn disable_reload_on_change(&self) {
        self.subscription
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
    }

    /// Whether a change subscription is active.
    pub fn reload_on_change(&self) -> bool {
        self.subscription
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }
}

fn current_runtime() -> Result<Handle> {
    Handle::try_current().map_err(|_| {
        Error::InvalidArgument("Synchronized file operations require a tokio runtime".to_string())
    })
}

/// Write `bytes` to a temporary sibling of `path`, then rename over `path`.
async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    tokio::fs::create_dir_all(&parent)
        .await
        .map_err(|e| Error::from_io(e, &parent))?;

    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "cache".to_string());
    let temp_path = parent.join(format!(".{}.{}.tmp", file_name, Uuid::new_v4()));

    let written = async {
        let mut file = tokio::fs::File::create(&temp_path).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        tokio::fs::rename(&temp_path, path).await
    }
    .await;

    if let Err(err) = written {
        let _ = tokio::fs::remove_file(&temp_path).await;
        return Err(Error::from_io(err, path));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifier::ManualNotifier;
    use tempfile::TempDir;

    fn fast_retry() -> RetryConfig {
        RetryConfig::new(3).with_delay(Duration::from_millis(10))
    }

    /// Hooks that XOR every byte, standing in for a protector.
    struct XorHooks;

    impl FileHooks for XorHooks {
        fn transform_before_write(&self, data: Vec<u8>) -> Result<Vec<u8>> {
            Ok(data.into_iter().map(|b| b ^ 0x5A).collect())
        }

        fn transform_after_read(&self, data: Vec<u8>) -> Result<Vec<u8>> {
            Ok(data.into_iter().map(|b| b ^ 0x5A).collect())
        }
    }

    struct CorruptHooks;

    impl FileHooks for CorruptHooks {
        fn transform_after_read(&self, _data: Vec<u8>) -> Result<Vec<u8>> {
            Err(Error::Corrupt("cannot unprotect".to_string()))
        }
    }

    #[tokio::test]
    async fn test_load_missing_file_is_ready_and_empty() {
        let temp = TempDir::new().unwrap();
        let file = SynchronizedFile::new(temp.path().join("cache.bin"), Arc::new(PlainFile), fast_retry());

        assert_eq!(file.readiness(), Readiness::NotLoaded);
        file.load().await.unwrap();

        assert_eq!(file.readiness(), Readiness::Ready);
        assert!(file.data().is_empty());
    }

    #[tokio::test]
    async fn test_save_then_load_applies_hooks() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("cache.bin");

        let writer = SynchronizedFile::new(&path, Arc::new(XorHooks), fast_retry());
        writer.load().await.unwrap();
        writer.set_data(b"hello".to_vec());
        writer.save().await.unwrap();

        let on_disk = std::fs::read(&path).unwrap();
        assert_ne!(on_disk, b"hello");

        let reader = SynchronizedFile::new(&path, Arc::new(XorHooks), fast_retry());
        reader.load().await.unwrap();
        assert_eq!(reader.data(), b"hello");
    }

    #[tokio::test]
    async fn test_save_leaves_no_temporary_files() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("cache.bin");
        let file = SynchronizedFile::new(&path, Arc::new(PlainFile), fast_retry());

        file.set_data(b"one".to_vec());
        file.save().await.unwrap();
        file.set_data(b"two".to_vec());
        file.save().await.unwrap();

        let names: Vec<_> = std::fs::read_dir(temp.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("cache.bin")]);
        assert_eq!(std::fs::read(&path).unwrap(), b"two");
    }

    #[tokio::test]
    async fn test_auto_save_writes_only_on_change() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("cache.bin");
        let file = SynchronizedFile::new(&path, Arc::new(PlainFile), fast_retry());

        file.set_data(b"not persisted".to_vec());
        file.wait_for_save(Duration::from_secs(1)).await.unwrap();
        assert!(!path.exists());

        file.set_auto_save(true);
        file.set_data(b"persisted".to_vec());
        file.wait_for_save(Duration::from_secs(2)).await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"persisted");
    }

    #[tokio::test]
    async fn test_modify_propagates_errors_and_results() {
        let temp = TempDir::new().unwrap();
        let file = SynchronizedFile::new(temp.path().join("cache.bin"), Arc::new(PlainFile), fast_retry());
        file.set_data(b"kept".to_vec());

        let result: Result<()> = file.modify(|_| Err(Error::Serialization("nope".to_string())));
        assert!(result.is_err());
        assert_eq!(file.data(), b"kept");

        let len = file.modify(|data| {
            data.extend_from_slice(b" and more");
            Ok(data.len())
        });
        assert_eq!(len.unwrap(), 13);
        assert_eq!(file.data(), b"kept and more");
    }

    #[tokio::test]
    async fn test_corrupt_load_is_fatal_and_gate_stays_closed() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("cache.bin");
        std::fs::write(&path, b"garbage").unwrap();

        let file = SynchronizedFile::new(&path, Arc::new(CorruptHooks), fast_retry());
        assert!(matches!(file.load().await, Err(Error::Corrupt(_))));
        assert_eq!(file.readiness(), Readiness::NotLoaded);

        let waited = file.wait_for_load(Duration::from_millis(50)).await;
        assert!(matches!(waited, Err(Error::Timeout(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_readiness_gate_releases_waiters() {
        let temp = TempDir::new().unwrap();
        let file = SynchronizedFile::new(temp.path().join("cache.bin"), Arc::new(PlainFile), fast_retry());

        let waiter = {
            let file = Arc::clone(&file);
            tokio::spawn(async move { file.wait_for_load(Duration::from_secs(5)).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        file.start_load().unwrap();
        waiter.await.unwrap().unwrap();
        assert_eq!(file.readiness(), Readiness::Ready);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_reload_on_change_picks_up_external_write() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("cache.bin");
        let notifier = ManualNotifier::new();

        let file = SynchronizedFile::new(&path, Arc::new(PlainFile), fast_retry());
        file.load().await.unwrap();
        file.enable_reload_on_change(&notifier).unwrap();
        assert!(file.reload_on_change());

        std::fs::write(&path, b"written elsewhere").unwrap();
        assert_eq!(notifier.trigger(&path), 1);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while file.data() != b"written elsewhere" && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(file.data(), b"written elsewhere");

        file.disable_reload_on_change();
        assert_eq!(notifier.subscriber_count(&path), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_save_to_unwritable_directory_is_not_retried_forever() {
        let temp = TempDir::new().unwrap();
        // A regular file standing where the parent directory should be
        let blocker = temp.path().join("not-a-dir");
        std::fs::write(&blocker, b"").unwrap();

        let file = SynchronizedFile::new(blocker.join("cache.bin"), Arc::new(PlainFile), fast_retry());
        file.set_data(b"data".to_vec());

        // Not-a-directory is transient, so the retry budget runs out
        let result = file.save().await;
        assert!(matches!(result, Err(Error::Timeout(_))));
    }
}
