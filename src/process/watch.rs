// File watching for processes started with `watch` enabled

use crate::config::normalize_path;
use crate::error::{Result, ShepherdError};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Changes closer together than this collapse into one notification
pub const WATCH_DEBOUNCE: Duration = Duration::from_millis(500);

/// Recursive watch over a directory. Dropping it stops the watch.
pub struct FileWatcher {
    root: PathBuf,
    _watcher: RecommendedWatcher,
}

impl FileWatcher {
    /// Watch `root` recursively and call `on_change` when something in it changes
    ///
    /// # Arguments
    /// * `root` - Directory to watch
    /// * `ignored` - Files or directories whose changes are not reported
    /// * `on_change` - Callback, invoked from the watcher's own thread
    pub fn start<F>(root: &Path, ignored: Vec<PathBuf>, mut on_change: F) -> Result<Self>
    where
        F: FnMut(&Path) + Send + 'static,
    {
        let root = normalize_path(root);
        let ignored: Vec<PathBuf> = ignored.iter().map(|p| normalize_path(p)).collect();
        let mut last_fired: Option<Instant> = None;

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| {
                let event = match res {
                    Ok(event) => event,
                    Err(e) => {
                        tracing::warn!("File watch error: {}", e);
                        return;
                    }
                };
                if !is_change(&event.kind) {
                    return;
                }
                let Some(path) = event.paths.iter().find(|p| !is_ignored(p, &ignored)) else {
                    return;
                };
                if last_fired.is_some_and(|at| at.elapsed() < WATCH_DEBOUNCE) {
                    return;
                }
                last_fired = Some(Instant::now());
                on_change(path);
            },
            Config::default(),
        )
        .map_err(|e| ShepherdError::Internal(format!("Failed to create file watcher: {}", e)))?;

        watcher.watch(&root, RecursiveMode::Recursive).map_err(|e| {
            ShepherdError::Internal(format!("Failed to watch {}: {}", root.display(), e))
        })?;

        Ok(Self {
            root,
            _watcher: watcher,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

fn is_change(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    )
}

fn is_ignored(path: &Path, ignored: &[PathBuf]) -> bool {
    ignored.iter().any(|i| path.starts_with(i))
}
