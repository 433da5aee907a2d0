pub mod event;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use event::{ChangeEvent, ChangeKind};

/// Startup failures. Both are fatal: the orchestrator has nothing to observe.
#[derive(Debug, Error)]
pub enum WatchError {
    #[error("none of the configured watch roots exist under {project_root}")]
    NoWatchableRoots { project_root: PathBuf },

    #[error("file watching unavailable: {0}")]
    Notify(#[from] notify::Error),
}

/// Handle to a running watcher. Dropping it stops the OS watcher and closes
/// the event stream.
pub struct WatcherHandle {
    _watcher: RecommendedWatcher,
    roots: Vec<PathBuf>,
}

impl WatcherHandle {
    /// Roots that survived the existence filter.
    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }
}

/// Resolve configured roots against `project_root` and drop those that do not
/// exist. Order is preserved.
pub fn existing_roots(project_root: &Path, roots: &[PathBuf]) -> Vec<PathBuf> {
    roots
        .iter()
        .map(|r| {
            if r.is_absolute() {
                r.clone()
            } else {
                project_root.join(r)
            }
        })
        .filter(|p| {
            let exists = p.exists();
            if !exists {
                debug!(root = %p.display(), "watch root does not exist, skipping");
            }
            exists
        })
        .collect()
}

/// Compute the OS-level watch targets for a set of existing roots.
///
/// Directories are watched recursively. Single files are covered by a
/// non-recursive watch on their parent: inotify watches on a file die when an
/// editor saves through an atomic rename.
fn watch_targets(roots: &[PathBuf]) -> BTreeMap<PathBuf, RecursiveMode> {
    let mut targets = BTreeMap::new();
    for root in roots {
        if root.is_dir() {
            targets.insert(root.clone(), RecursiveMode::Recursive);
        } else {
            let parent = root
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."));
            targets
                .entry(parent)
                .or_insert(RecursiveMode::NonRecursive);
        }
    }
    targets
}

/// Start watching `roots` (relative to `project_root`).
///
/// Returns a `WatcherHandle` (must be kept alive) and an unbounded receiver of
/// raw `ChangeEvent`s, one per affected path, in delivery order. No filtering
/// or deduplication happens here.
pub fn start_watcher(
    project_root: &Path,
    roots: &[PathBuf],
) -> Result<(WatcherHandle, mpsc::UnboundedReceiver<ChangeEvent>), WatchError> {
    let roots = existing_roots(project_root, roots);
    if roots.is_empty() {
        return Err(WatchError::NoWatchableRoots {
            project_root: project_root.to_path_buf(),
        });
    }

    let (tx, rx) = mpsc::unbounded_channel::<ChangeEvent>();

    let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        match res {
            Ok(event) => {
                let Some(kind) = ChangeKind::from_notify(&event.kind) else {
                    return;
                };
                for path in event.paths {
                    // Receiver gone means the loop is shutting down.
                    if tx.send(ChangeEvent::new(path, kind)).is_err() {
                        return;
                    }
                }
            }
            Err(err) => warn!(error = %err, "watch backend error"),
        }
    })?;

    for (target, mode) in watch_targets(&roots) {
        watcher.watch(&target, mode)?;
        debug!(target = %target.display(), ?mode, "watching");
    }
    info!(roots = roots.len(), "watcher started");

    Ok((
        WatcherHandle {
            _watcher: watcher,
            roots,
        },
        rx,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_missing_roots_are_dropped() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir(tmp.path().join("app")).unwrap();

        let roots = existing_roots(
            tmp.path(),
            &[PathBuf::from("app"), PathBuf::from("does-not-exist")],
        );
        assert_eq!(roots, vec![tmp.path().join("app")]);
    }

    #[test]
    fn test_empty_watch_set_is_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        let err = start_watcher(tmp.path(), &[PathBuf::from("nope")])
            .err()
            .expect("startup must fail");
        assert!(matches!(err, WatchError::NoWatchableRoots { .. }));
    }

    #[test]
    fn test_file_roots_watch_their_parent() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("app");
        std::fs::create_dir(&dir).unwrap();
        let file = tmp.path().join("requirements.txt");
        std::fs::write(&file, "").unwrap();

        let targets = watch_targets(&[dir.clone(), file]);
        assert_eq!(targets.get(&dir), Some(&RecursiveMode::Recursive));
        assert_eq!(
            targets.get(tmp.path()),
            Some(&RecursiveMode::NonRecursive)
        );
    }

    #[tokio::test]
    async fn test_file_write_produces_event() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().canonicalize().unwrap();
        std::fs::create_dir(root.join("app")).unwrap();

        let (_handle, mut rx) = start_watcher(&root, &[PathBuf::from("app")]).unwrap();
        std::fs::write(root.join("app").join("main.py"), "print()").unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("no event within 5s")
            .expect("stream closed");
        assert!(event.path.starts_with(root.join("app")));
    }
}
