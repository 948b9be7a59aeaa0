use super::debounce::{debounce_loop, Debouncer};
use super::TriggerCallback;
use futures::FutureExt;
use globset::{Glob, GlobSet, GlobSetBuilder};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("invalid ignore pattern {pattern:?}: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: globset::Error,
    },

    #[error("wait_max is set without wait_min")]
    WaitMaxWithoutWaitMin,

    #[error("wait_max ({wait_max:?}) is shorter than wait_min ({wait_min:?})")]
    InvalidWindow {
        wait_min: Duration,
        wait_max: Duration,
    },

    #[error("failed to watch {path}: {source}")]
    Notify {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },
}

/// Paths to watch and how to debounce their changes.
#[derive(Debug, Clone, Default)]
pub struct WatchConfig {
    pub paths: Vec<PathBuf>,
    /// Glob patterns, matched against the full path and the path relative to each watched root.
    pub ignore: Vec<String>,
    pub wait_min: Option<Duration>,
    pub wait_max: Option<Duration>,
}

impl WatchConfig {
    pub fn validate(&self) -> Result<(), WatchError> {
        match (self.wait_min, self.wait_max) {
            (None, Some(_)) => Err(WatchError::WaitMaxWithoutWaitMin),
            (Some(wait_min), Some(wait_max)) if wait_max < wait_min => {
                Err(WatchError::InvalidWindow { wait_min, wait_max })
            }
            _ => Ok(()),
        }
    }
}

struct ActiveWatch {
    // Dropping the watcher closes the notify backend and the event channel.
    _watcher: RecommendedWatcher,
    token: CancellationToken,
}

/// Invokes a callback when files under the watched paths change, debounced.
pub struct FsWatcher {
    name: String,
    config: WatchConfig,
    ignore: Arc<GlobSet>,
    callback: TriggerCallback,
    active: Mutex<Option<ActiveWatch>>,
}

impl FsWatcher {
    pub fn new<F, Fut>(
        name: impl Into<String>,
        config: WatchConfig,
        callback: F,
    ) -> Result<Self, WatchError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        config.validate()?;

        let mut builder = GlobSetBuilder::new();
        for pattern in &config.ignore {
            let glob = Glob::new(pattern).map_err(|source| WatchError::InvalidPattern {
                pattern: pattern.clone(),
                source,
            })?;
            builder.add(glob);
        }
        let ignore = builder.build().map_err(|source| WatchError::InvalidPattern {
            pattern: config.ignore.join(", "),
            source,
        })?;

        Ok(Self {
            name: name.into(),
            config,
            ignore: Arc::new(ignore),
            callback: Arc::new(move || callback().boxed()),
            active: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &WatchConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, Option<ActiveWatch>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_started(&self) -> bool {
        self.lock().is_some()
    }

    pub(crate) fn is_ignored(&self, path: &Path) -> bool {
        is_ignored(&self.ignore, &self.config.paths, path)
    }

    /// Starts watching. No-op if already started. Must be called from within a tokio runtime.
    pub fn start(&self) -> Result<(), WatchError> {
        let mut active = self.lock();
        if active.is_some() {
            return Ok(());
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let ignore = Arc::clone(&self.ignore);
        let roots = self.config.paths.clone();
        let name = self.name.clone();
        let handler = move |res: notify::Result<notify::Event>| match res {
            Ok(event) => {
                if matches!(event.kind, EventKind::Access(_)) {
                    return;
                }
                let relevant = event.paths.is_empty()
                    || event
                        .paths
                        .iter()
                        .any(|path| !is_ignored(&ignore, &roots, path));
                if relevant {
                    debug!(watcher = %name, paths = ?event.paths, "change detected");
                    let _ = tx.send(());
                }
            }
            Err(e) => warn!(watcher = %name, "watch error: {}", e),
        };

        let mut watcher = notify::recommended_watcher(handler).map_err(|source| {
            WatchError::Notify {
                path: PathBuf::new(),
                source,
            }
        })?;
        for path in &self.config.paths {
            watcher
                .watch(path, RecursiveMode::Recursive)
                .map_err(|source| WatchError::Notify {
                    path: path.clone(),
                    source,
                })?;
        }

        let token = CancellationToken::new();
        tokio::spawn(debounce_loop(
            self.name.clone(),
            rx,
            Debouncer::new(self.config.wait_min, self.config.wait_max),
            Arc::clone(&self.callback),
            token.clone(),
        ));
        *active = Some(ActiveWatch {
            _watcher: watcher,
            token,
        });

        info!(watcher = %self.name, paths = ?self.config.paths, "watching for changes");
        Ok(())
    }

    /// Closes the watcher and drops any pending debounce window. Idempotent.
    pub fn stop(&self) {
        if let Some(active) = self.lock().take() {
            active.token.cancel();
            info!(watcher = %self.name, "watcher stopped");
        }
    }
}

impl Drop for FsWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn is_ignored(ignore: &GlobSet, roots: &[PathBuf], path: &Path) -> bool {
    if ignore.is_empty() {
        return false;
    }
    if ignore.is_match(path) {
        return true;
    }
    roots
        .iter()
        .filter_map(|root| path.strip_prefix(root).ok())
        .any(|relative| ignore.is_match(relative))
}
