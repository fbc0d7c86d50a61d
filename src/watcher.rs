//! Filesystem change watcher. A dedicated thread blocks on `notify` events
//! for the content root and every subdirectory that existed at startup
//! (directories created later are not retroactively watched — a known scope
//! limit). Event bursts settle for a fixed delay, are classified into
//! content vs. persisted-store changes, and each class fires onto the change
//! channel at most once per debounce window. A single consumer applies the
//! events serially, so the stores never see concurrent writers.

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::index::ContentIndex;
use crate::sessions::SessionStore;
use crate::users::CredentialStore;

/// Sleep after the first event of a burst so the burst can finish.
const SETTLE_DELAY: Duration = Duration::from_secs(3);

/// Each event class fires at most once per window.
const FIRE_WINDOW: Duration = Duration::from_secs(1);

/// Files with this suffix belong to the persisted stores.
const STORE_FILE_SUFFIX: &str = ".properties";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeEvent {
    /// Markdown tree changed: the content index needs a rescan.
    Content,
    /// A persisted store file changed: credential and session stores reload.
    Stores,
}

/// Spawn the watcher thread. Returns the channel the consumer drains;
/// setting `shutdown` ends the loop at the next iteration boundary.
pub fn spawn(root: PathBuf, shutdown: Arc<AtomicBool>) -> Receiver<ChangeEvent> {
    let (event_tx, event_rx) = mpsc::channel();
    let result = thread::Builder::new()
        .name("change-watcher".to_string())
        .spawn(move || {
            tracing::info!("Change watcher running on {}", root.display());
            if let Err(e) = run(&root, &shutdown, &event_tx) {
                tracing::error!("Failed at watching {}: {}", root.display(), e);
            }
            tracing::warn!("Change watcher stopped");
        });
    if let Err(e) = result {
        tracing::error!("Cannot spawn watcher thread: {}", e);
    }
    event_rx
}

/// Spawn the serial consumer that applies change events to the index and
/// stores. Ends when the watcher side hangs up.
pub fn spawn_consumer(
    events: Receiver<ChangeEvent>,
    index: Arc<ContentIndex>,
    users: Arc<CredentialStore>,
    sessions: Arc<SessionStore>,
) {
    let result = thread::Builder::new()
        .name("change-consumer".to_string())
        .spawn(move || {
            for event in events {
                match event {
                    ChangeEvent::Content => index.rescan(),
                    ChangeEvent::Stores => {
                        users.reload();
                        sessions.reload();
                    }
                }
            }
            tracing::debug!("Change consumer stopped");
        });
    if let Err(e) = result {
        tracing::error!("Cannot spawn consumer thread: {}", e);
    }
}

fn run(
    root: &Path,
    shutdown: &AtomicBool,
    out: &Sender<ChangeEvent>,
) -> notify::Result<()> {
    let (raw_tx, raw_rx) = mpsc::channel();
    let mut watcher = notify::recommended_watcher(move |event| {
        let _ = raw_tx.send(event);
    })?;

    watcher.watch(root, RecursiveMode::NonRecursive)?;
    register_subdirs(&mut watcher, root);

    let mut last_content_fire: Option<Instant> = None;
    let mut last_store_fire: Option<Instant> = None;

    loop {
        // Block until something happens; a closed channel means the watch
        // registration itself is gone, which is terminal.
        let first = match raw_rx.recv() {
            Ok(event) => event,
            Err(_) => break,
        };

        thread::sleep(SETTLE_DELAY);
        if shutdown.load(Ordering::Relaxed) {
            break;
        }

        let mut pending = Classification::default();
        pending.add(first);
        while let Ok(event) = raw_rx.try_recv() {
            pending.add(event);
        }

        if pending.content && window_open(last_content_fire) {
            last_content_fire = Some(Instant::now());
            tracing::info!("Firing content update event");
            if out.send(ChangeEvent::Content).is_err() {
                break;
            }
        }
        if pending.stores && window_open(last_store_fire) {
            last_store_fire = Some(Instant::now());
            tracing::info!("Firing store update event");
            if out.send(ChangeEvent::Stores).is_err() {
                break;
            }
        }
    }
    Ok(())
}

/// Register every directory below `root`, at any depth, as it exists now.
fn register_subdirs(watcher: &mut RecommendedWatcher, dir: &Path) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!("Cannot enumerate {}: {}", dir.display(), e);
            return;
        }
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        if let Err(e) = watcher.watch(&path, RecursiveMode::NonRecursive) {
            tracing::warn!("Cannot watch {}: {}", path.display(), e);
            continue;
        }
        register_subdirs(watcher, &path);
    }
}

#[derive(Default)]
struct Classification {
    content: bool,
    stores: bool,
}

impl Classification {
    fn add(&mut self, event: notify::Result<notify::Event>) {
        match event {
            Ok(event) => {
                for path in &event.paths {
                    let name = path
                        .file_name()
                        .map(|name| name.to_string_lossy().into_owned())
                        .unwrap_or_default();
                    if is_store_file(&name) {
                        self.stores = true;
                    } else {
                        self.content = true;
                    }
                }
            }
            Err(e) => tracing::error!("Error in watcher iteration: {}", e),
        }
    }
}

fn is_store_file(name: &str) -> bool {
    name.contains(STORE_FILE_SUFFIX)
}

fn window_open(last_fire: Option<Instant>) -> bool {
    match last_fire {
        Some(last) => last.elapsed() > FIRE_WINDOW,
        None => true,
    }
}
