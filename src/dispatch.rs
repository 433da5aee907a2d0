//! Priority-ordered, strictly sequential execution of pending actions.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::classify::{ActionCategory, PendingActionSet};
use crate::config::{CommandsConfig, DeployConfig};
use crate::gate::{BuildGate, GateOutcome};
use crate::runner::{ActionError, CommandRunner, CommandSpec, Completed, Invocation};

/// Artifact sync flavour handed to the UI build and sync collaborators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum UiMode {
    Full,
    Minimal,
    Skip,
}

impl UiMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Minimal => "minimal",
            Self::Skip => "skip",
        }
    }
}

/// One step of a dispatch cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "kebab-case")]
pub enum PlannedAction {
    ServiceInstall,
    DependencySync,
    UiDeploy { mode: UiMode },
    CodeDeploy,
}

impl PlannedAction {
    pub fn name(self) -> &'static str {
        match self {
            Self::ServiceInstall => "service-install",
            Self::DependencySync => "dependency-sync",
            Self::UiDeploy { .. } => "ui-deploy",
            Self::CodeDeploy => "code-deploy",
        }
    }

    pub fn category(self) -> ActionCategory {
        match self {
            Self::ServiceInstall => ActionCategory::ServiceUnit,
            Self::DependencySync => ActionCategory::Dependency,
            Self::UiDeploy { mode: UiMode::Full } => ActionCategory::UiFull,
            Self::UiDeploy { .. } => ActionCategory::UiIncremental,
            Self::CodeDeploy => ActionCategory::CodeConfig,
        }
    }
}

impl fmt::Display for PlannedAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UiDeploy { mode } => write!(f, "{}({})", self.name(), mode.as_str()),
            _ => f.write_str(self.name()),
        }
    }
}

/// Turn a pending set into the ordered action list for one cycle.
///
/// Order is fixed: service units, dependencies, UI, code/config. A full UI
/// rebuild suppresses the incremental one. With `skip_ui`, no UI action is
/// planned at all.
pub fn plan(pending: &PendingActionSet, skip_ui: bool) -> Vec<PlannedAction> {
    let mut actions = Vec::with_capacity(4);
    if pending.contains(ActionCategory::ServiceUnit) {
        actions.push(PlannedAction::ServiceInstall);
    }
    if pending.contains(ActionCategory::Dependency) {
        actions.push(PlannedAction::DependencySync);
    }
    if !skip_ui {
        if pending.contains(ActionCategory::UiFull) {
            actions.push(PlannedAction::UiDeploy { mode: UiMode::Full });
        } else if pending.contains(ActionCategory::UiIncremental) {
            actions.push(PlannedAction::UiDeploy {
                mode: UiMode::Minimal,
            });
        }
    }
    if pending.contains(ActionCategory::CodeConfig) {
        actions.push(PlannedAction::CodeDeploy);
    }
    actions
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum ActionStatus {
    Succeeded,
    Failed { message: String },
    TimedOut { after_secs: u64 },
}

/// What the build gate did inside a UI action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BuildStatus {
    Built,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct ActionReport {
    #[serde(flatten)]
    pub action: PlannedAction,
    #[serde(flatten)]
    pub status: ActionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build: Option<BuildStatus>,
    pub elapsed_ms: u64,
}

impl ActionReport {
    pub fn succeeded(&self) -> bool {
        self.status == ActionStatus::Succeeded
    }
}

/// Everything one dispatch cycle did, in execution order.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleReport {
    pub actions: Vec<ActionReport>,
    pub elapsed_ms: u64,
}

impl CycleReport {
    pub fn all_succeeded(&self) -> bool {
        self.actions.iter().all(ActionReport::succeeded)
    }

    pub fn failures(&self) -> usize {
        self.actions.iter().filter(|a| !a.succeeded()).count()
    }
}

/// Executes planned actions through a [`CommandRunner`].
pub struct Dispatcher {
    project_root: PathBuf,
    commands: CommandsConfig,
    cycle_timeout: Duration,
    service_timeout: Duration,
    skip_ui: bool,
    gate: BuildGate,
    runner: Arc<dyn CommandRunner>,
}

impl Dispatcher {
    pub fn new(
        project_root: &Path,
        config: &DeployConfig,
        runner: Arc<dyn CommandRunner>,
    ) -> Result<Self> {
        let gate = BuildGate::new(project_root, &config.build, &config.build_sources())
            .context("invalid build sources")?;
        Ok(Self {
            project_root: project_root.to_path_buf(),
            commands: config.commands.clone(),
            cycle_timeout: config.cycle_timeout(),
            service_timeout: config.service_timeout(),
            skip_ui: config.skip_ui,
            gate,
            runner,
        })
    }

    /// Run every pending action in priority order, then clear `pending`.
    ///
    /// A failing or hung action never stops the ones after it; the set is
    /// cleared only once all of them have run.
    pub async fn run_cycle(&self, pending: &mut PendingActionSet) -> CycleReport {
        let started = Instant::now();
        let actions = plan(pending, self.skip_ui);

        if self.skip_ui
            && (pending.contains(ActionCategory::UiFull)
                || pending.contains(ActionCategory::UiIncremental))
        {
            info!("UI pipeline disabled, ignoring UI changes");
        }

        let mut report = CycleReport::default();
        for action in actions {
            report.actions.push(self.execute(action).await);
        }

        pending.clear();
        report.elapsed_ms = started.elapsed().as_millis() as u64;
        report
    }

    async fn execute(&self, action: PlannedAction) -> ActionReport {
        let started = Instant::now();
        info!(action = %action, category = %action.category(), "running");

        let mut build = None;
        let result = match action {
            PlannedAction::ServiceInstall => {
                let inv = self.invocation(
                    &self.commands.service_install,
                    action,
                    self.service_timeout,
                    None,
                );
                self.runner.run(&inv).await
            }
            PlannedAction::DependencySync => {
                let inv = self.invocation(
                    &self.commands.dependency_sync,
                    action,
                    self.cycle_timeout,
                    None,
                );
                self.runner.run(&inv).await
            }
            PlannedAction::UiDeploy { mode } => {
                let (status, result) = self.ui_deploy(mode).await;
                build = Some(status);
                result
            }
            PlannedAction::CodeDeploy => {
                let inv = self.invocation(
                    &self.commands.code_deploy,
                    action,
                    self.cycle_timeout,
                    Some(UiMode::Skip),
                );
                self.runner.run(&inv).await
            }
        };

        let elapsed = started.elapsed();
        let status = match result {
            Ok(completed) => {
                if !completed.output_tail.is_empty() {
                    debug!(
                        action = %action,
                        output = %completed.output_tail,
                        "collaborator output"
                    );
                }
                info!(action = %action, elapsed_ms = elapsed.as_millis() as u64, "done");
                ActionStatus::Succeeded
            }
            Err(err) => {
                log_failure(action, &err);
                match err {
                    ActionError::Timeout { after, .. } => ActionStatus::TimedOut {
                        after_secs: after.as_secs(),
                    },
                    other => ActionStatus::Failed {
                        message: other.to_string(),
                    },
                }
            }
        };

        ActionReport {
            action,
            status,
            build,
            elapsed_ms: elapsed.as_millis() as u64,
        }
    }

    /// Gate + build, then sync. A failed build leaves the deployed artifact
    /// alone.
    async fn ui_deploy(&self, mode: UiMode) -> (BuildStatus, Result<Completed, ActionError>) {
        let build_inv = Invocation::from_spec(
            "ui-build",
            &self.commands.ui_build,
            &self.project_root,
            self.cycle_timeout,
            Some(mode.as_str()),
        );
        let build_status = match self.gate.run_build(self.runner.as_ref(), &build_inv).await {
            Ok(GateOutcome::Built(done)) => {
                info!(elapsed_ms = done.elapsed.as_millis() as u64, "UI build finished");
                BuildStatus::Built
            }
            Ok(GateOutcome::Skipped(_)) => BuildStatus::Skipped,
            Err(err) => return (BuildStatus::Failed, Err(err)),
        };

        let sync_inv = Invocation::from_spec(
            "ui-sync",
            &self.commands.ui_sync,
            &self.project_root,
            self.cycle_timeout,
            Some(mode.as_str()),
        );
        (build_status, self.runner.run(&sync_inv).await)
    }

    fn invocation(
        &self,
        spec: &CommandSpec,
        action: PlannedAction,
        default_timeout: Duration,
        mode: Option<UiMode>,
    ) -> Invocation {
        Invocation::from_spec(
            action.name(),
            spec,
            &self.project_root,
            default_timeout,
            mode.map(UiMode::as_str),
        )
    }
}

fn log_failure(action: PlannedAction, err: &ActionError) {
    let output = err.output_tail().unwrap_or("");
    if action == PlannedAction::ServiceInstall {
        if err.is_timeout() {
            error!(action = %action, error = %err, "service install timed out");
        } else {
            error!(action = %action, error = %err, output, "service install failed");
        }
    } else if err.is_timeout() {
        warn!(action = %action, error = %err, "action timed out");
    } else {
        warn!(action = %action, error = %err, output, "action failed");
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;

    /// Records every invocation; fails or hangs the ones it is told to.
    #[derive(Default)]
    pub(crate) struct RecordingRunner {
        pub calls: Mutex<Vec<Invocation>>,
        pub failing: Vec<&'static str>,
        pub hanging: Vec<&'static str>,
    }

    impl RecordingRunner {
        pub fn names(&self) -> Vec<String> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .map(|i| i.name.clone())
                .collect()
        }
    }

    #[async_trait]
    impl CommandRunner for RecordingRunner {
        async fn run(&self, inv: &Invocation) -> Result<Completed, ActionError> {
            self.calls.lock().unwrap().push(inv.clone());
            if self.hanging.contains(&inv.name.as_str()) {
                tokio::time::sleep(inv.timeout).await;
                return Err(ActionError::Timeout {
                    name: inv.name.clone(),
                    after: inv.timeout,
                });
            }
            if self.failing.contains(&inv.name.as_str()) {
                return Err(ActionError::Failed {
                    name: inv.name.clone(),
                    code: Some(1),
                    output_tail: "boom".into(),
                });
            }
            Ok(Completed::default())
        }
    }

    fn set(categories: &[ActionCategory]) -> PendingActionSet {
        categories.iter().copied().collect()
    }

    fn dispatcher(root: &Path, runner: Arc<RecordingRunner>) -> Dispatcher {
        Dispatcher::new(root, &DeployConfig::default(), runner).unwrap()
    }

    #[test]
    fn test_plan_order_is_fixed() {
        let pending = set(&[
            ActionCategory::CodeConfig,
            ActionCategory::UiIncremental,
            ActionCategory::Dependency,
            ActionCategory::ServiceUnit,
        ]);
        assert_eq!(
            plan(&pending, false),
            vec![
                PlannedAction::ServiceInstall,
                PlannedAction::DependencySync,
                PlannedAction::UiDeploy {
                    mode: UiMode::Minimal
                },
                PlannedAction::CodeDeploy,
            ]
        );
    }

    #[test]
    fn test_full_rebuild_suppresses_incremental() {
        let pending = set(&[ActionCategory::UiIncremental, ActionCategory::UiFull]);
        assert_eq!(
            plan(&pending, false),
            vec![PlannedAction::UiDeploy { mode: UiMode::Full }]
        );
    }

    #[test]
    fn test_skip_ui_drops_ui_actions_only() {
        let pending = set(&[ActionCategory::UiFull, ActionCategory::CodeConfig]);
        assert_eq!(plan(&pending, true), vec![PlannedAction::CodeDeploy]);
    }

    #[test]
    fn test_empty_set_plans_nothing() {
        assert!(plan(&PendingActionSet::new(), false).is_empty());
    }

    #[tokio::test]
    async fn test_service_runs_before_dependencies() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = Arc::new(RecordingRunner::default());
        let d = dispatcher(tmp.path(), runner.clone());

        let mut pending = set(&[ActionCategory::Dependency, ActionCategory::ServiceUnit]);
        let report = d.run_cycle(&mut pending).await;

        assert!(report.all_succeeded());
        assert_eq!(runner.names(), vec!["service-install", "dependency-sync"]);
        assert!(pending.is_empty());

        let calls = runner.calls.lock().unwrap();
        assert_eq!(calls[0].timeout, Duration::from_secs(60));
        assert_eq!(calls[1].timeout, Duration::from_secs(600));
    }

    #[tokio::test]
    async fn test_incremental_change_builds_and_syncs_minimal() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = Arc::new(RecordingRunner::default());
        let d = dispatcher(tmp.path(), runner.clone());

        // No artifact yet, so the gate must build.
        let mut pending = set(&[ActionCategory::UiIncremental]);
        let report = d.run_cycle(&mut pending).await;

        assert_eq!(runner.names(), vec!["ui-build", "ui-sync"]);
        let calls = runner.calls.lock().unwrap();
        assert_eq!(calls[1].argv, vec!["scripts/deploy.sh", "--ui=minimal"]);
        assert_eq!(report.actions[0].build, Some(BuildStatus::Built));
    }

    #[tokio::test]
    async fn test_up_to_date_ui_skips_build_but_still_syncs() {
        let tmp = tempfile::tempdir().unwrap();
        let dist = tmp.path().join("webui/dist");
        std::fs::create_dir_all(&dist).unwrap();
        std::fs::write(dist.join("index.html"), "<html/>").unwrap();

        let runner = Arc::new(RecordingRunner::default());
        let d = dispatcher(tmp.path(), runner.clone());
        let mut pending = set(&[ActionCategory::UiFull]);
        let report = d.run_cycle(&mut pending).await;

        assert_eq!(runner.names(), vec!["ui-sync"]);
        assert_eq!(report.actions[0].build, Some(BuildStatus::Skipped));
        assert!(report.all_succeeded());
    }

    #[tokio::test]
    async fn test_failed_build_skips_sync_but_not_later_actions() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = Arc::new(RecordingRunner {
            failing: vec!["ui-build"],
            ..Default::default()
        });
        let d = dispatcher(tmp.path(), runner.clone());

        let mut pending = set(&[ActionCategory::UiFull, ActionCategory::CodeConfig]);
        let report = d.run_cycle(&mut pending).await;

        assert_eq!(runner.names(), vec!["ui-build", "code-deploy"]);
        assert_eq!(report.failures(), 1);
        assert_eq!(report.actions[0].build, Some(BuildStatus::Failed));
        assert!(report.actions[1].succeeded());
        assert!(pending.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_does_not_block_next_category() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = Arc::new(RecordingRunner {
            hanging: vec!["dependency-sync"],
            ..Default::default()
        });
        let mut config = DeployConfig::default();
        config.commands.dependency_sync.timeout_secs = Some(5);
        let d = Dispatcher::new(tmp.path(), &config, runner.clone()).unwrap();

        let mut pending = set(&[ActionCategory::Dependency, ActionCategory::CodeConfig]);
        let report = d.run_cycle(&mut pending).await;

        assert_eq!(runner.names(), vec!["dependency-sync", "code-deploy"]);
        assert_eq!(
            report.actions[0].status,
            ActionStatus::TimedOut { after_secs: 5 }
        );
        assert!(report.actions[1].succeeded());
    }

    #[tokio::test]
    async fn test_code_deploy_uses_skip_mode() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = Arc::new(RecordingRunner::default());
        let d = dispatcher(tmp.path(), runner.clone());

        let mut pending = set(&[ActionCategory::CodeConfig]);
        d.run_cycle(&mut pending).await;

        let calls = runner.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert!(calls[0]
            .env
            .contains(&("DEPLOY_WATCH_MODE".to_string(), "skip".to_string())));
    }

    #[tokio::test]
    async fn test_second_cycle_without_changes_is_noop() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = Arc::new(RecordingRunner::default());
        let d = dispatcher(tmp.path(), runner.clone());

        let mut pending = set(&[ActionCategory::CodeConfig]);
        d.run_cycle(&mut pending).await;
        let second = d.run_cycle(&mut pending).await;

        assert!(second.actions.is_empty());
        assert_eq!(runner.names().len(), 1);
    }
}
