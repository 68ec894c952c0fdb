//! File change notification.
//!
//! A [`ChangeNotifier`] reports that another process modified a watched file.
//! [`PollingNotifier`] is the production implementation; [`ManualNotifier`]
//! fires only when told to, which keeps tests deterministic.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tokio::time::MissedTickBehavior;
use tracing::debug;

use keyiv_common::{Error, Result};

/// Callback invoked when a watched file changes.
pub type ChangeCallback = Arc<dyn Fn() + Send + Sync>;

/// Live subscription. Dropping it stops delivery.
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    /// Create a subscription that runs `cancel` when dropped.
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

/// Capability that reports external modification of a file.
pub trait ChangeNotifier: Send + Sync {
    /// Invoke `on_change` whenever `path` changes, until the returned
    /// subscription is dropped.
    fn subscribe(&self, path: &Path, on_change: ChangeCallback) -> Result<Subscription>;
}

/// Notifier that polls modification time and length on a tokio interval.
#[derive(Debug, Clone)]
pub struct PollingNotifier {
    interval: Duration,
}

impl PollingNotifier {
    /// Create a notifier polling every `interval`.
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }
}

impl Default for PollingNotifier {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

async fn fingerprint(path: &Path) -> Option<(SystemTime, u64)> {
    let metadata = tokio::fs::metadata(path).await.ok()?;
    Some((metadata.modified().ok()?, metadata.len()))
}

impl ChangeNotifier for PollingNotifier {
    fn subscribe(&self, path: &Path, on_change: ChangeCallback) -> Result<Subscription> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            Error::InvalidArgument("PollingNotifier requires a tokio runtime".to_string())
        })?;
        let path = path.to_path_buf();
        let interval = self.interval;

        let task = runtime.spawn(async move {
            let mut last = fingerprint(&path).await;
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let current = fingerprint(&path).await;
                if current != last {
                    last = current;
                    if current.is_some() {
                        debug!("Detected change to {}", path.display());
                        on_change();
                    }
                }
            }
        });

        Ok(Subscription::new(move || task.abort()))
    }
}

type SubscriberMap = HashMap<PathBuf, Vec<(u64, ChangeCallback)>>;

/// Notifier triggered explicitly by the caller.
#[derive(Default)]
pub struct ManualNotifier {
    subscribers: Arc<Mutex<SubscriberMap>>,
    next_id: AtomicU64,
}

impl ManualNotifier {
    /// Create a notifier with no subscribers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire every callback subscribed to `path`. Returns how many ran.
    pub fn trigger(&self, path: &Path) -> usize {
        let callbacks: Vec<ChangeCallback> = {
            let subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
            subscribers
                .get(path)
                .map(|entries| entries.iter().map(|(_, cb)| cb.clone()).collect())
                .unwrap_or_default()
        };

        for callback in &callbacks {
            callback();
        }
        callbacks.len()
    }

    /// Number of live subscriptions for `path`.
    pub fn subscriber_count(&self, path: &Path) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(path)
            .map_or(0, Vec::len)
    }
}

impl ChangeNotifier for ManualNotifier {
    fn subscribe(&self, path: &Path, on_change: ChangeCallback) -> Result<Subscription> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let path = path.to_path_buf();

        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(path.clone())
            .or_default()
            .push((id, on_change));

        let subscribers = Arc::clone(&self.subscribers);
        Ok(Subscription::new(move || {
            let mut subscribers = subscribers.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(entries) = subscribers.get_mut(&path) {
                entries.retain(|(entry_id, _)| *entry_id != id);
                if entries.is_empty() {
                    subscribers.remove(&path);
                }
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    fn counter() -> (Arc<AtomicUsize>, ChangeCallback) {
        let count = Arc::new(AtomicUsize::new(0));
        let clone = count.clone();
        (count, Arc::new(move || {
            clone.fetch_add(1, Ordering::SeqCst);
        }))
    }

    #[test]
    fn test_manual_trigger_and_unsubscribe() {
        let notifier = ManualNotifier::new();
        let path = Path::new("/tmp/KeyIVCache.bin");
        let (count, callback) = counter();

        let subscription = notifier.subscribe(path, callback).unwrap();
        assert_eq!(notifier.subscriber_count(path), 1);
        assert_eq!(notifier.trigger(path), 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);

        drop(subscription);
        assert_eq!(notifier.subscriber_count(path), 0);
        assert_eq!(notifier.trigger(path), 0);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_manual_trigger_is_per_path() {
        let notifier = ManualNotifier::new();
        let (count, callback) = counter();
        let _subscription = notifier.subscribe(Path::new("a.bin"), callback).unwrap();

        assert_eq!(notifier.trigger(Path::new("b.bin")), 0);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_polling_requires_runtime() {
        let (_, callback) = counter();
        let result = PollingNotifier::default().subscribe(Path::new("x.bin"), callback);
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn test_polling_detects_modification() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("watched.bin");
        std::fs::write(&path, b"one").unwrap();

        let (count, callback) = counter();
        let _subscription = PollingNotifier::new(Duration::from_millis(20))
            .subscribe(&path, callback)
            .unwrap();

        tokio::time::sleep(Duration::from_millis(60)).await;
        std::fs::write(&path, b"two, longer").unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while count.load(Ordering::SeqCst) == 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(count.load(Ordering::SeqCst) >= 1);
    }
}
