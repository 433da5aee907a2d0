use std::io::Write;
use std::path::Path;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Marker of the last successful UI build, persisted next to the build
/// output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildStamp {
    pub last_build_at: SystemTime,
}

#[derive(Debug, Error)]
pub enum StampError {
    #[error("build stamp I/O at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("build stamp at {path} is corrupt: {source}")]
    Corrupt {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

impl StampError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

impl BuildStamp {
    /// The stamp to persist after a build that started at `build_started_at`.
    ///
    /// Never earlier than the previous stamp nor than any source mtime seen
    /// before the build began. The build start time is used instead of the
    /// completion time so that sources edited while the build ran still
    /// count as newer on the next check.
    pub fn after_build(
        previous: Option<BuildStamp>,
        build_started_at: SystemTime,
        newest_source: Option<SystemTime>,
    ) -> Self {
        let mut at = build_started_at;
        if let Some(newest) = newest_source {
            at = at.max(newest);
        }
        if let Some(prev) = previous {
            at = at.max(prev.last_build_at);
        }
        Self { last_build_at: at }
    }
}

/// Read the stamp. A missing file is `Ok(None)`.
pub fn load_stamp(path: &Path) -> Result<Option<BuildStamp>, StampError> {
    let bytes = match std::fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(StampError::io(path, e)),
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|source| StampError::Corrupt {
            path: path.display().to_string(),
            source,
        })
}

/// Write the stamp atomically: temp file in the same directory, then rename.
pub fn save_stamp(path: &Path, stamp: &BuildStamp) -> Result<(), StampError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir).map_err(|e| StampError::io(dir, e))?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| StampError::io(dir, e))?;
    serde_json::to_writer(&mut tmp, stamp).map_err(|source| StampError::Corrupt {
        path: path.display().to_string(),
        source,
    })?;
    tmp.as_file_mut()
        .flush()
        .map_err(|e| StampError::io(path, e))?;
    tmp.persist(path)
        .map_err(|e| StampError::io(path, e.error))?;
    Ok(())
}
