use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use notify::{Config, Event, EventKind, PollWatcher, RecursiveMode, Watcher};

/// Watches one task file for modifications made by other processes.
///
/// Polling is used instead of native notification so the watcher behaves
/// the same on network mounts, where inotify-style events are unreliable.
/// Our own saves are suppressed by comparing the file's mtime against the
/// stamp recorded at the last write.
pub struct FileWatcher {
    _watcher: PollWatcher,
    state: Arc<WatchState>,
}

struct WatchState {
    path: PathBuf,
    changed: AtomicBool,
    last_saved: Mutex<Option<SystemTime>>,
}

const POLL_INTERVAL: Duration = Duration::from_secs(2);

impl FileWatcher {
    /// Start watching the given task file.
    pub fn start(path: &Path) -> Result<Self, notify::Error> {
        let state = Arc::new(WatchState {
            path: path.to_path_buf(),
            changed: AtomicBool::new(false),
            last_saved: Mutex::new(None),
        });

        let handler_state = Arc::clone(&state);
        let mut watcher = PollWatcher::new(
            move |result: Result<Event, notify::Error>| {
                let event = match result {
                    Ok(e) => e,
                    Err(_) => return,
                };
                match event.kind {
                    EventKind::Create(_) | EventKind::Modify(_) => {}
                    _ => return,
                }
                if !event.paths.iter().any(|p| *p == handler_state.path) {
                    return;
                }
                let mtime = fs::metadata(&handler_state.path)
                    .and_then(|m| m.modified())
                    .ok();
                // Skip the event our own save produced.
                if let Some(mtime) = mtime
                    && let Ok(last) = handler_state.last_saved.lock()
                    && *last == Some(mtime)
                {
                    return;
                }
                handler_state.changed.store(true, Ordering::SeqCst);
            },
            Config::default().with_poll_interval(POLL_INTERVAL),
        )?;

        watcher.watch(path, RecursiveMode::NonRecursive)?;
        Ok(FileWatcher {
            _watcher: watcher,
            state,
        })
    }

    /// Whether another process modified the file since the last
    /// `clear()` or `mark_saved()`.
    pub fn changed(&self) -> bool {
        self.state.changed.load(Ordering::SeqCst)
    }

    pub fn clear(&self) {
        self.state.changed.store(false, Ordering::SeqCst);
    }

    /// Record the file's current mtime so the event produced by our own
    /// write is not reported as an external change.
    pub fn mark_saved(&self) {
        let mtime = fs::metadata(&self.state.path)
            .and_then(|m| m.modified())
            .ok();
        if let Ok(mut last) = self.state.last_saved.lock() {
            *last = mtime;
        }
        self.clear();
    }
}
