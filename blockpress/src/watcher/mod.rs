use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::time::{Duration, Instant};

const DEBOUNCE: Duration = Duration::from_millis(100);

/// A debounced change to one definition file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefinitionChange {
    pub path: PathBuf,
    pub kind: ChangeKind,
}

/// The kind of file change detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Created,
    Modified,
    Deleted,
}

/// Watches the data directory for edits to definition files.
///
/// Changes are debounced and delivered in batches, one batch per burst of
/// edits, so a save that touches several included files triggers a single
/// recompilation.
pub struct DefinitionWatcher {
    _watcher: RecommendedWatcher,
    _thread: std::thread::JoinHandle<()>,
    /// Receiver for debounced batches of changes
    pub event_rx: mpsc::Receiver<Vec<DefinitionChange>>,
}

impl DefinitionWatcher {
    /// Start watching `root` recursively.
    pub fn start(root: &Path) -> Result<Self, notify::Error> {
        let (notify_tx, notify_rx) = mpsc::channel::<notify::Result<Event>>();
        let (event_tx, event_rx) = mpsc::channel::<Vec<DefinitionChange>>();

        let mut watcher = RecommendedWatcher::new(
            move |res| {
                let _ = notify_tx.send(res);
            },
            Config::default(),
        )?;
        watcher.watch(root, RecursiveMode::Recursive)?;

        let thread = std::thread::spawn(move || {
            let mut pending: BTreeMap<PathBuf, ChangeKind> = BTreeMap::new();
            let mut last_event = Instant::now();

            loop {
                match notify_rx.recv_timeout(DEBOUNCE) {
                    Ok(Ok(event)) => {
                        if let Some(kind) = change_kind(&event.kind) {
                            for path in event.paths {
                                if is_definition_file(&path) {
                                    pending.insert(path, kind);
                                }
                            }
                        }
                        last_event = Instant::now();
                    }
                    Ok(Err(e)) => {
                        log::warn!("Definition watcher error: {e}");
                    }
                    Err(mpsc::RecvTimeoutError::Timeout) => {
                        if !pending.is_empty() && last_event.elapsed() >= DEBOUNCE {
                            let batch = std::mem::take(&mut pending)
                                .into_iter()
                                .map(|(path, kind)| DefinitionChange { path, kind })
                                .collect();
                            if event_tx.send(batch).is_err() {
                                return;
                            }
                        }
                    }
                    Err(mpsc::RecvTimeoutError::Disconnected) => break,
                }
            }
        });

        Ok(DefinitionWatcher {
            _watcher: watcher,
            _thread: thread,
            event_rx,
        })
    }
}

fn change_kind(kind: &EventKind) -> Option<ChangeKind> {
    match kind {
        EventKind::Create(_) => Some(ChangeKind::Created),
        EventKind::Modify(_) => Some(ChangeKind::Modified),
        EventKind::Remove(_) => Some(ChangeKind::Deleted),
        _ => None,
    }
}

/// Definition files are YAML; the system database and editor droppings are ignored.
pub fn is_definition_file(path: &Path) -> bool {
    let hidden = path
        .file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with('.') || n.ends_with('~'))
        .unwrap_or(true);
    if hidden {
        return false;
    }
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_definition_file_filter() {
        assert!(is_definition_file(Path::new("/data/blockpress.yaml")));
        assert!(is_definition_file(Path::new("/data/blocks/hero.yml")));
        assert!(!is_definition_file(Path::new("/data/_system.db")));
        assert!(!is_definition_file(Path::new("/data/_system.db-journal")));
        assert!(!is_definition_file(Path::new("/data/.blockpress.yaml.swp")));
        assert!(!is_definition_file(Path::new("/data/.hidden.yaml")));
        assert!(!is_definition_file(Path::new("/data/templates/hero.html")));
    }

    #[test]
    fn test_change_kind_mapping() {
        use notify::event::{CreateKind, ModifyKind, RemoveKind};
        assert_eq!(
            change_kind(&EventKind::Create(CreateKind::File)),
            Some(ChangeKind::Created)
        );
        assert_eq!(
            change_kind(&EventKind::Modify(ModifyKind::Any)),
            Some(ChangeKind::Modified)
        );
        assert_eq!(
            change_kind(&EventKind::Remove(RemoveKind::File)),
            Some(ChangeKind::Deleted)
        );
        assert_eq!(change_kind(&EventKind::Any), None);
    }

    #[test]
    fn test_start_on_missing_directory_fails() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(DefinitionWatcher::start(&tmp.path().join("nope")).is_err());
    }
}
