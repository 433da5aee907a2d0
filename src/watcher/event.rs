use std::path::PathBuf;

use tokio::time::Instant;

/// What happened to a path, as reported by the OS notification facility.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Created,
    Modified,
    Deleted,
    Moved,
}

impl ChangeKind {
    /// Map a raw notify event kind. Access and "other" notifications carry no
    /// mutation and map to `None`.
    pub fn from_notify(kind: &notify::EventKind) -> Option<Self> {
        use notify::event::ModifyKind;
        use notify::EventKind;

        match kind {
            EventKind::Create(_) => Some(Self::Created),
            EventKind::Modify(ModifyKind::Name(_)) => Some(Self::Moved),
            EventKind::Modify(_) => Some(Self::Modified),
            EventKind::Remove(_) => Some(Self::Deleted),
            // Some backends report mutations they cannot classify as `Any`.
            EventKind::Any => Some(Self::Modified),
            EventKind::Access(_) | EventKind::Other => None,
        }
    }
}

/// A single raw change notification. Ephemeral: consumed by the watch loop as
/// soon as it arrives.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub path: PathBuf,
    pub kind: ChangeKind,
    pub observed_at: Instant,
}

impl ChangeEvent {
    pub fn new(path: impl Into<PathBuf>, kind: ChangeKind) -> Self {
        Self {
            path: path.into(),
            kind,
            observed_at: Instant::now(),
        }
    }
}
