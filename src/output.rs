use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::Serialize;

use crate::classify::{ActionCategory, PendingActionSet};
use crate::cli::OutputFormat;
use crate::dispatch::{ActionStatus, BuildStatus, CycleReport, PlannedAction};
use crate::gate::{BuildGate, BuildReason, GateDecision};

/// What `classify` found for one path.
#[derive(Debug, Serialize)]
pub struct PathClassification {
    pub path: PathBuf,
    pub categories: Vec<ActionCategory>,
}

/// Result of a dry-run classification over a set of paths.
#[derive(Debug, Serialize)]
pub struct ClassifyReport {
    pub paths: Vec<PathClassification>,
    pub pending: Vec<ActionCategory>,
    pub plan: Vec<PlannedAction>,
}

impl ClassifyReport {
    pub fn new(
        paths: Vec<PathClassification>,
        pending: &PendingActionSet,
        plan: Vec<PlannedAction>,
    ) -> Self {
        Self {
            paths,
            pending: pending.iter().collect(),
            plan,
        }
    }
}

/// Build gate state with times as fractional unix seconds.
#[derive(Debug, Serialize)]
pub struct GateReport {
    pub artifact: PathBuf,
    pub stamp: PathBuf,
    pub needs_build: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<BuildReason>,
    pub newest_source: Option<f64>,
    pub reference: Option<f64>,
}

impl GateReport {
    pub fn new(gate: &BuildGate, decision: &GateDecision) -> Self {
        let (reason, newest_source, reference) = match decision {
            GateDecision::Build {
                reason,
                newest_source,
                reference,
            } => (Some(*reason), *newest_source, *reference),
            GateDecision::Skip {
                newest_source,
                reference,
            } => (None, *newest_source, Some(*reference)),
        };
        Self {
            artifact: gate.artifact_path(),
            stamp: gate.stamp_path(),
            needs_build: decision.needs_build(),
            reason,
            newest_source: newest_source.map(unix_secs),
            reference: reference.map(unix_secs),
        }
    }
}

fn unix_secs(t: SystemTime) -> f64 {
    t.duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

fn print_json<T: Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(s) => println!("{}", s),
        Err(e) => eprintln!("error serialising report: {}", e),
    }
}

fn join_categories(categories: &[ActionCategory]) -> String {
    if categories.is_empty() {
        return "(none)".to_string();
    }
    categories
        .iter()
        .map(|c| c.as_str())
        .collect::<Vec<_>>()
        .join(",")
}

/// Compact form: one `path -> categories` line per input, then the pending
/// set and the plan.
pub fn print_classify(report: &ClassifyReport, root: &Path, format: &OutputFormat) {
    if matches!(format, OutputFormat::Json) {
        print_json(report);
        return;
    }

    for entry in &report.paths {
        let shown = entry.path.strip_prefix(root).unwrap_or(&entry.path);
        println!(
            "{} -> {}",
            shown.display(),
            join_categories(&entry.categories)
        );
    }
    println!("pending: {}", join_categories(&report.pending));
    if report.plan.is_empty() {
        println!("plan: (nothing to run)");
    } else {
        let steps: Vec<String> = report.plan.iter().map(|a| a.to_string()).collect();
        println!("plan: {}", steps.join(" -> "));
    }
}

pub fn print_gate(report: &GateReport, format: &OutputFormat) {
    if matches!(format, OutputFormat::Json) {
        print_json(report);
        return;
    }

    let verdict = match report.reason {
        Some(BuildReason::ArtifactMissing) => "build needed (artifact missing)",
        Some(BuildReason::SourcesNewer) => "build needed (sources changed)",
        None => "up to date",
    };
    println!("{verdict}");
    println!("  artifact: {}", report.artifact.display());
    println!("  stamp:    {}", report.stamp.display());
    match report.newest_source {
        Some(t) => println!("  newest source: {t:.3}"),
        None => println!("  newest source: (no sources found)"),
    }
    if let Some(t) = report.reference {
        println!("  reference:     {t:.3}");
    }
}

/// Print a finished cycle.
///
/// Failures are repeated on stderr so stdout stays parseable in JSON mode.
pub fn print_cycle(report: &CycleReport, format: &OutputFormat) {
    if matches!(format, OutputFormat::Json) {
        print_json(report);
    } else {
        if report.actions.is_empty() {
            println!("nothing to run");
        }
        for action in &report.actions {
            let status = match &action.status {
                ActionStatus::Succeeded => "ok".to_string(),
                ActionStatus::Failed { .. } => "FAILED".to_string(),
                ActionStatus::TimedOut { after_secs } => format!("TIMED OUT after {after_secs}s"),
            };
            let build = match action.build {
                Some(BuildStatus::Built) => " [built]",
                Some(BuildStatus::Skipped) => " [build skipped]",
                Some(BuildStatus::Failed) => " [build failed]",
                None => "",
            };
            println!(
                "{:<20} {}{} ({} ms)",
                action.action.to_string(),
                status,
                build,
                action.elapsed_ms
            );
        }
        println!(
            "{} action(s), {} failed, {:.2}s",
            report.actions.len(),
            report.failures(),
            report.elapsed_ms as f64 / 1000.0
        );
    }

    for action in &report.actions {
        if let ActionStatus::Failed { message } = &action.status {
            eprintln!("error: {message}");
        }
    }
}
