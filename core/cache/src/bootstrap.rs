//! Startup selection between the shared and the per-user cache.
//!
//! The machine-wide cache is preferred. When this process can read but not
//! write it, a per-user cache is seeded from the shared file and the shared
//! entries are merged in with precedence, so keys issued machine-wide keep
//! decrypting. Only permission failures trigger the fallback; corruption is
//! always fatal.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::KeyIvCache;
use crate::cipher::Cipher;
use crate::config::CacheConfig;
use keyiv_common::{Error, Result};
use keyiv_crypto::{AtRestProtector, MachineProtector};
use keyiv_storage::{ChangeNotifier, PollingNotifier};

/// Which cache the service operates on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheMode {
    /// The machine-wide cache, writable by this process.
    Shared,
    /// A per-user cache, reconciled with the read-only shared one.
    UserFallback,
}

/// Check whether a directory accepts new files.
pub type WriteCheck = Arc<dyn Fn(&Path) -> Result<()> + Send + Sync>;

/// Create and delete a uniquely named file in `dir`.
///
/// # Errors
/// - `PermissionDenied` if the directory cannot be created or written
pub fn check_directory_writable(dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir).map_err(|e| Error::from_io(e, dir))?;

    let marker = dir.join(format!(".keyiv-write-check-{}", Uuid::new_v4()));
    std::fs::File::create(&marker).map_err(|e| Error::from_io(e, &marker))?;
    std::fs::remove_file(&marker).map_err(|e| Error::from_io(e, &marker))?;
    Ok(())
}

/// Explicitly constructed key/IV cache service.
///
/// Create one at startup and hand it (or the [`Cipher`] it builds) to every
/// consumer.
pub struct CacheService {
    config: CacheConfig,
    mode: CacheMode,
    shared: Arc<KeyIvCache>,
    shared_loaded: bool,
    user: Option<Arc<KeyIvCache>>,
    notifier: Arc<dyn ChangeNotifier>,
}

impl CacheService {
    /// Start with the production protector, notifier and write check.
    pub async fn start(config: CacheConfig) -> Result<Self> {
        let protector: Arc<dyn AtRestProtector> = Arc::new(MachineProtector::for_this_machine()?);
        let notifier: Arc<dyn ChangeNotifier> = Arc::new(PollingNotifier::new(config.poll_interval()));
        Self::start_with(config, protector, notifier, Arc::new(check_directory_writable)).await
    }

    /// Start with injected capabilities.
    ///
    /// # Postconditions
    /// - The active cache is loaded and writes in the background
    /// - In fallback mode the shared cache never writes
    ///
    /// # Errors
    /// - `InvalidArgument` for an invalid configuration
    /// - `Corrupt` if either cache file cannot be unprotected or parsed
    /// - `Timeout` if loading exhausts the retry budget
    pub async fn start_with(
        config: CacheConfig,
        protector: Arc<dyn AtRestProtector>,
        notifier: Arc<dyn ChangeNotifier>,
        writable: WriteCheck,
    ) -> Result<Self> {
        config.validate()?;

        let shared = Arc::new(KeyIvCache::with_config(&config.cache_path, protector.clone(), &config));
        let shared_loaded = match shared.load().await {
            Ok(()) => true,
            Err(err) if err.is_permission_denied() => {
                warn!("Shared cache is not readable: {}", err);
                false
            }
            Err(err) => return Err(err),
        };

        if shared_loaded {
            let dir = parent_dir(&config.cache_path);
            match writable(dir) {
                Ok(()) => {
                    shared.set_auto_save(true);
                    if config.reload_on_change {
                        shared.enable_reload_on_change(notifier.as_ref())?;
                    }
                    info!("Using shared key/IV cache at {}", config.cache_path.display());
                    return Ok(Self {
                        config,
                        mode: CacheMode::Shared,
                        shared,
                        shared_loaded,
                        user: None,
                        notifier,
                    });
                }
                Err(err) if err.is_permission_denied() => {
                    warn!("Shared cache directory is not writable: {}", err);
                }
                Err(err) => return Err(err),
            }
        }

        let user_path = config.user_cache_path()?;
        if shared_loaded {
            seed_user_cache(&config.cache_path, &user_path);
        }

        let user = Arc::new(KeyIvCache::with_config(&user_path, protector, &config));
        user.load().await?;
        user.set_auto_save(true);
        if shared_loaded {
            let merged = user.merge_right(&shared).await?;
            debug!("Merged {} shared entries into the user cache", merged);
        }
        if config.reload_on_change {
            user.enable_reload_on_change(notifier.as_ref())?;
        }

        info!("Using per-user key/IV cache at {}", user_path.display());
        Ok(Self {
            config,
            mode: CacheMode::UserFallback,
            shared,
            shared_loaded,
            user: Some(user),
            notifier,
        })
    }

    /// Active mode.
    pub fn mode(&self) -> CacheMode {
        self.mode
    }

    /// Configuration the service started with.
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// The cache all operations go to.
    pub fn cache(&self) -> &Arc<KeyIvCache> {
        self.user.as_ref().unwrap_or(&self.shared)
    }

    /// The machine-wide cache, read-only in fallback mode.
    pub fn shared_cache(&self) -> &Arc<KeyIvCache> {
        &self.shared
    }

    /// The notifier driving reload-on-change.
    pub fn notifier(&self) -> &Arc<dyn ChangeNotifier> {
        &self.notifier
    }

    /// Encryption façade over the active cache.
    pub fn cipher(&self) -> Cipher {
        Cipher::new(Arc::clone(self.cache())).with_buffer_size(self.config.stream_buffer_size)
    }

    /// Reload the active cache. In fallback mode the shared cache is reloaded
    /// too and merged in with precedence.
    pub async fn reload(&self) -> Result<()> {
        self.cache().reload().await?;

        if let Some(user) = &self.user {
            if !self.shared_loaded {
                return Ok(());
            }
            match self.shared.reload().await {
                Ok(()) => {
                    let merged = user.merge_right(&self.shared).await?;
                    debug!("Reload merged {} shared entries", merged);
                }
                Err(err) if err.is_permission_denied() => {
                    warn!("Shared cache is no longer readable: {}", err);
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Wait until background saves of the active cache have completed.
    pub async fn flush(&self, timeout: Duration) -> Result<()> {
        self.cache().flush(timeout).await
    }
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}

/// Copy the shared file to the user path unless the user already has one.
///
/// Seeding is best effort; the merge that follows covers a failed copy.
fn seed_user_cache(shared_path: &Path, user_path: &Path) {
    if user_path.exists() || !shared_path.exists() {
        return;
    }

    let result = std::fs::create_dir_all(parent_dir(user_path))
        .and_then(|_| std::fs::copy(shared_path, user_path));
    match result {
        Ok(bytes) => debug!("Seeded {} with {} bytes", user_path.display(), bytes),
        Err(err) => warn!("Could not seed {}: {}", user_path.display(), err),
    }
}
