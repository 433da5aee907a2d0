//! Skip UI rebuilds when nothing that feeds the build changed since the last
//! successful one.

pub mod stamp;

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::Result;
use glob::Pattern;
use serde::Serialize;
use tracing::{info, warn};

use crate::classify::{MATCH_OPTIONS, compile_patterns, relative_path};
use crate::config::BuildConfig;
use crate::runner::{ActionError, CommandRunner, Completed, Invocation};

use stamp::{BuildStamp, load_stamp, save_stamp};

/// Why a build has to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BuildReason {
    /// The primary build artifact does not exist.
    ArtifactMissing,
    /// A source is newer than the stamp (or the artifact, without a stamp).
    SourcesNewer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "kebab-case")]
pub enum GateDecision {
    Build {
        reason: BuildReason,
        newest_source: Option<SystemTime>,
        reference: Option<SystemTime>,
    },
    Skip {
        newest_source: Option<SystemTime>,
        reference: SystemTime,
    },
}

impl GateDecision {
    pub fn needs_build(&self) -> bool {
        matches!(self, Self::Build { .. })
    }
}

/// Result of passing through the gate.
#[derive(Debug)]
pub enum GateOutcome {
    Skipped(GateDecision),
    Built(Completed),
}

/// Decides whether the UI build collaborator needs to run and records
/// successful builds.
#[derive(Debug, Clone)]
pub struct BuildGate {
    project_root: PathBuf,
    config: BuildConfig,
    sources: Vec<Pattern>,
    walk_roots: Vec<PathBuf>,
}

impl BuildGate {
    /// `sources` are project-relative globs naming every build input.
    pub fn new(project_root: &Path, config: &BuildConfig, sources: &[String]) -> Result<Self> {
        Ok(Self {
            project_root: project_root.to_path_buf(),
            config: config.clone(),
            sources: compile_patterns(sources)?,
            walk_roots: walk_roots(sources),
        })
    }

    pub fn artifact_path(&self) -> PathBuf {
        self.project_root
            .join(&self.config.output_dir)
            .join(&self.config.artifact)
    }

    pub fn stamp_path(&self) -> PathBuf {
        self.project_root
            .join(&self.config.output_dir)
            .join(&self.config.stamp_file)
    }

    fn stamp(&self) -> Option<BuildStamp> {
        match load_stamp(&self.stamp_path()) {
            Ok(stamp) => stamp,
            Err(err) => {
                warn!(error = %err, "ignoring unreadable build stamp");
                None
            }
        }
    }

    /// Whether a walked entry is a build input. A directory counts when a file
    /// directly inside it would be one, so deletions (which only touch the
    /// parent's mtime) are seen.
    fn is_source(&self, rel: &str, is_dir: bool) -> bool {
        if rel.is_empty() {
            return false;
        }
        let child = format!("{rel}/_");
        self.sources.iter().any(|p| {
            p.matches_with(rel, MATCH_OPTIONS) || (is_dir && p.matches_with(&child, MATCH_OPTIONS))
        })
    }

    /// Newest mtime across every entry matching a source pattern.
    pub fn newest_source_mtime(&self) -> Option<SystemTime> {
        let mut newest: Option<SystemTime> = None;
        for walk_root in &self.walk_roots {
            let root = self.project_root.join(walk_root);
            if !root.exists() {
                continue;
            }
            let walker = ignore::WalkBuilder::new(&root)
                .standard_filters(false)
                .filter_entry(|e| e.file_name() != "node_modules")
                .build();
            for entry in walker.flatten() {
                let is_dir = entry.file_type().is_some_and(|t| t.is_dir());
                let rel = relative_path(&self.project_root, entry.path());
                if !self.is_source(&rel, is_dir) {
                    continue;
                }
                let Some(modified) = entry.metadata().ok().and_then(|m| m.modified().ok()) else {
                    continue;
                };
                newest = Some(newest.map_or(modified, |n| n.max(modified)));
            }
        }
        newest
    }

    pub fn decide(&self) -> GateDecision {
        let newest_source = self.newest_source_mtime();

        let artifact_mtime = std::fs::metadata(self.artifact_path())
            .and_then(|m| m.modified())
            .ok();
        let Some(artifact_mtime) = artifact_mtime else {
            return GateDecision::Build {
                reason: BuildReason::ArtifactMissing,
                newest_source,
                reference: None,
            };
        };

        let reference = self
            .stamp()
            .map_or(artifact_mtime, |s| s.last_build_at);

        match newest_source {
            Some(newest) if newest > reference => GateDecision::Build {
                reason: BuildReason::SourcesNewer,
                newest_source,
                reference: Some(reference),
            },
            _ => GateDecision::Skip {
                newest_source,
                reference,
            },
        }
    }

    /// Run `build` through `runner` unless the decision says it's not needed.
    /// Only a zero exit persists a new stamp.
    pub async fn run_build(
        &self,
        runner: &dyn CommandRunner,
        build: &Invocation,
    ) -> Result<GateOutcome, ActionError> {
        let (reason, newest_source) = match self.decide() {
            GateDecision::Build {
                reason,
                newest_source,
                ..
            } => (reason, newest_source),
            skip @ GateDecision::Skip { .. } => {
                info!(
                    artifact = %self.artifact_path().display(),
                    "UI sources unchanged since last build, skipping build"
                );
                return Ok(GateOutcome::Skipped(skip));
            }
        };

        info!(?reason, "building UI");
        let started_at = SystemTime::now();
        let completed = runner.run(build).await?;

        let stamp = BuildStamp::after_build(self.stamp(), started_at, newest_source);
        if let Err(err) = save_stamp(&self.stamp_path(), &stamp) {
            // The build itself succeeded; the next cycle just rebuilds.
            warn!(error = %err, "failed to persist build stamp");
        }
        Ok(GateOutcome::Built(completed))
    }
}

/// Directories to walk: the literal leading components of each pattern,
/// with roots nested inside another root dropped.
fn walk_roots(patterns: &[String]) -> Vec<PathBuf> {
    let mut roots: Vec<PathBuf> = patterns
        .iter()
        .map(|p| {
            p.split('/')
                .take_while(|c| !c.contains(['*', '?', '[']))
                .collect::<PathBuf>()
        })
        .collect();
    roots.sort();
    roots.dedup();

    let mut kept: Vec<PathBuf> = Vec::new();
    for root in roots {
        if !kept.iter().any(|k| root.starts_with(k)) {
            kept.push(root);
        }
    }
    kept
}
