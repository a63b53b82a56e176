//! Filesystem change observation.
//!
//! One platform-native watcher per root. Watcher callbacks translate raw
//! notifications into `ChangeEvent`s and send them through a bounded
//! crossbeam channel; the orchestrator is the sole consumer and owns the
//! application of events to the index. When the platform signals dropped
//! events, a `Resync` event tells the orchestrator to re-enumerate the
//! affected root.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_channel::{bounded, Receiver, Sender};
use notify::event::{ModifyKind, RenameMode};
use notify::{recommended_watcher, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};

use crate::error::{Result, SearchError};

/// Default capacity of the change-event channel, sized for roughly 64 KiB
/// of queued events.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// A change observed on a watched root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeEvent {
    Created(PathBuf),
    Modified(PathBuf),
    Deleted(PathBuf),
    Renamed(PathBuf, PathBuf),
    /// The platform dropped events for this root; the index must be
    /// re-enumerated under it.
    Resync(PathBuf),
}

/// Observer configuration.
#[derive(Debug, Clone)]
pub struct ObserverOptions {
    pub event_capacity: usize,
    /// On a full channel, drop the oldest queued event instead of
    /// back-pressuring the watcher callback.
    pub drop_oldest_on_overflow: bool,
}

impl Default for ObserverOptions {
    fn default() -> Self {
        Self {
            event_capacity: DEFAULT_EVENT_CAPACITY,
            drop_oldest_on_overflow: true,
        }
    }
}

/// Watches a set of roots and exposes the merged event stream.
///
/// Events from a single root arrive in order; no ordering holds across
/// roots. Dropping the observer stops all watchers.
pub struct ChangeObserver {
    rx: Receiver<ChangeEvent>,
    dropped: Arc<AtomicU64>,
    _watchers: Vec<RecommendedWatcher>,
}

impl std::fmt::Debug for ChangeObserver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeObserver")
            .field("watchers", &self._watchers.len())
            .field("dropped", &self.dropped.load(Ordering::Relaxed))
            .finish()
    }
}

impl ChangeObserver {
    /// Starts watching `locations`. Fails only when no root could be
    /// watched; partially failed registration is logged and survives.
    pub fn monitor(locations: &[PathBuf], options: &ObserverOptions) -> Result<Self> {
        let (tx, rx) = bounded(options.event_capacity.max(1));
        let dropped = Arc::new(AtomicU64::new(0));
        let mut watchers = Vec::new();

        for root in locations {
            match watch_root(
                root.clone(),
                tx.clone(),
                rx.clone(),
                options.drop_oldest_on_overflow,
                dropped.clone(),
            ) {
                Ok(watcher) => watchers.push(watcher),
                Err(error) => {
                    log::warn!("watcher registration failed for {}: {error}", root.display());
                }
            }
        }

        if watchers.is_empty() && !locations.is_empty() {
            return Err(SearchError::IoFatal(std::io::Error::other(
                "no watch root could be registered",
            )));
        }

        log::info!("change observer watching {} root(s)", watchers.len());
        Ok(Self {
            rx,
            dropped,
            _watchers: watchers,
        })
    }

    /// The merged event stream.
    pub fn events(&self) -> &Receiver<ChangeEvent> {
        &self.rx
    }

    /// Events discarded under the drop-oldest overflow policy.
    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

fn watch_root(
    root: PathBuf,
    tx: Sender<ChangeEvent>,
    rx: Receiver<ChangeEvent>,
    drop_oldest: bool,
    dropped: Arc<AtomicU64>,
) -> Result<RecommendedWatcher> {
    let callback_root = root.clone();
    let mut watcher = recommended_watcher(move |result: notify::Result<Event>| match result {
        Ok(event) => {
            for change in translate_event(&callback_root, event) {
                forward(&tx, &rx, drop_oldest, &dropped, change);
            }
        }
        Err(error) => {
            log::warn!("watcher error on {}: {error}", callback_root.display());
            forward(
                &tx,
                &rx,
                drop_oldest,
                &dropped,
                ChangeEvent::Resync(callback_root.clone()),
            );
        }
    })
    .map_err(|error| {
        SearchError::IoFatal(std::io::Error::other(format!(
            "failed to create watcher: {error}"
        )))
    })?;

    watcher
        .watch(&root, RecursiveMode::Recursive)
        .map_err(|error| {
            SearchError::IoFatal(std::io::Error::other(format!(
                "failed to watch {}: {error}",
                root.display()
            )))
        })?;

    Ok(watcher)
}

/// Sends an event, honoring the overflow policy. With drop-oldest, a full
/// channel sheds its oldest entry; otherwise the send back-pressures the
/// watcher callback.
fn forward(
    tx: &Sender<ChangeEvent>,
    rx: &Receiver<ChangeEvent>,
    drop_oldest: bool,
    dropped: &AtomicU64,
    event: ChangeEvent,
) {
    if !drop_oldest {
        let _ = tx.send(event);
        return;
    }
    let mut pending = event;
    loop {
        match tx.try_send(pending) {
            Ok(()) => return,
            Err(crossbeam_channel::TrySendError::Full(back)) => {
                if rx.try_recv().is_ok() {
                    dropped.fetch_add(1, Ordering::Relaxed);
                }
                pending = back;
            }
            Err(crossbeam_channel::TrySendError::Disconnected(_)) => return,
        }
    }
}

/// Maps a raw notification to engine change events.
fn translate_event(root: &PathBuf, event: Event) -> Vec<ChangeEvent> {
    if event.need_rescan() {
        return vec![ChangeEvent::Resync(root.clone())];
    }

    let mut paths = event.paths;
    match event.kind {
        EventKind::Access(_) => Vec::new(),
        EventKind::Create(_) => paths.drain(..).map(ChangeEvent::Created).collect(),
        EventKind::Remove(_) => paths.drain(..).map(ChangeEvent::Deleted).collect(),
        EventKind::Modify(ModifyKind::Name(mode)) => match mode {
            RenameMode::Both if paths.len() >= 2 => {
                let to = paths.pop().expect("two paths");
                let from = paths.pop().expect("two paths");
                vec![ChangeEvent::Renamed(from, to)]
            }
            RenameMode::From => paths.drain(..).map(ChangeEvent::Deleted).collect(),
            RenameMode::To => paths.drain(..).map(ChangeEvent::Created).collect(),
            // Ambiguous rename notification: reconcile against the
            // filesystem instead of guessing a direction.
            _ => paths
                .drain(..)
                .map(|path| {
                    if path.exists() {
                        ChangeEvent::Created(path)
                    } else {
                        ChangeEvent::Deleted(path)
                    }
                })
                .collect(),
        },
        EventKind::Modify(_) => paths.drain(..).map(ChangeEvent::Modified).collect(),
        EventKind::Any | EventKind::Other => {
            if paths.is_empty() {
                vec![ChangeEvent::Resync(root.clone())]
            } else {
                paths.drain(..).map(ChangeEvent::Modified).collect()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{self, File};
    use std::time::Duration;
    use tempfile::TempDir;

    fn drain_for(observer: &ChangeObserver, wait: Duration) -> Vec<ChangeEvent> {
        let deadline = std::time::Instant::now() + wait;
        let mut events = Vec::new();
        while std::time::Instant::now() < deadline {
            match observer.events().recv_timeout(Duration::from_millis(100)) {
                Ok(event) => events.push(event),
                Err(_) => {
                    if !events.is_empty() {
                        break;
                    }
                }
            }
        }
        events
    }

    #[test]
    fn create_is_observed() {
        let temp = TempDir::new().unwrap();
        let observer =
            ChangeObserver::monitor(&[temp.path().to_path_buf()], &ObserverOptions::default())
                .unwrap();

        // Let the watcher settle before generating events.
        std::thread::sleep(Duration::from_millis(250));
        File::create(temp.path().join("new.txt")).unwrap();

        let events = drain_for(&observer, Duration::from_secs(10));
        assert!(
            events.iter().any(|e| matches!(
                e,
                ChangeEvent::Created(p) | ChangeEvent::Modified(p)
                    if p.ends_with("new.txt")
            )),
            "no event for new.txt in {events:?}"
        );
    }

    #[test]
    fn delete_is_observed() {
        let temp = TempDir::new().unwrap();
        let target = temp.path().join("doomed.txt");
        File::create(&target).unwrap();

        let observer =
            ChangeObserver::monitor(&[temp.path().to_path_buf()], &ObserverOptions::default())
                .unwrap();
        std::thread::sleep(Duration::from_millis(250));
        fs::remove_file(&target).unwrap();

        let events = drain_for(&observer, Duration::from_secs(10));
        assert!(
            events.iter().any(|e| matches!(
                e,
                ChangeEvent::Deleted(p) if p.ends_with("doomed.txt")
            )),
            "no delete event in {events:?}"
        );
    }

    #[test]
    fn missing_root_fails() {
        let temp = TempDir::new().unwrap();
        let missing = temp.path().join("not-here");
        let result = ChangeObserver::monitor(&[missing], &ObserverOptions::default());
        assert!(result.is_err());
    }

    #[test]
    fn overflow_drops_oldest() {
        let (tx, rx) = bounded(2);
        let dropped = AtomicU64::new(0);
        for i in 0..5 {
            forward(
                &tx,
                &rx,
                true,
                &dropped,
                ChangeEvent::Created(PathBuf::from(format!("/f{i}"))),
            );
        }
        assert_eq!(dropped.load(Ordering::Relaxed), 3);
        // The newest events survive.
        let remaining: Vec<_> = rx.try_iter().collect();
        assert_eq!(
            remaining,
            vec![
                ChangeEvent::Created(PathBuf::from("/f3")),
                ChangeEvent::Created(PathBuf::from("/f4")),
            ]
        );
    }

    #[test]
    fn rename_translation() {
        let root = PathBuf::from("/root");
        let event = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::Both)))
            .add_path(PathBuf::from("/root/a"))
            .add_path(PathBuf::from("/root/b"));
        assert_eq!(
            translate_event(&root, event),
            vec![ChangeEvent::Renamed(
                PathBuf::from("/root/a"),
                PathBuf::from("/root/b")
            )]
        );
    }

    #[test]
    fn create_and_remove_translation() {
        let root = PathBuf::from("/root");
        let event = Event::new(EventKind::Create(notify::event::CreateKind::File))
            .add_path(PathBuf::from("/root/x.txt"));
        assert_eq!(
            translate_event(&root, event),
            vec![ChangeEvent::Created(PathBuf::from("/root/x.txt"))]
        );

        let event = Event::new(EventKind::Remove(notify::event::RemoveKind::File))
            .add_path(PathBuf::from("/root/x.txt"));
        assert_eq!(
            translate_event(&root, event),
            vec![ChangeEvent::Deleted(PathBuf::from("/root/x.txt"))]
        );

        // Access notifications carry no index-relevant change.
        let event = Event::new(EventKind::Access(notify::event::AccessKind::Read))
            .add_path(PathBuf::from("/root/x.txt"));
        assert!(translate_event(&root, event).is_empty());
    }
}
