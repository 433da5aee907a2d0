//! The watch → debounce → classify → dispatch loop.
//!
//! A single task owns the debouncer, the pending set and the dispatcher.
//! Events arrive over a channel; nothing here is shared, so nothing is
//! locked.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::classify::{Classifier, PendingActionSet};
use crate::config::DeployConfig;
use crate::debounce::Debouncer;
use crate::dispatch::{CycleReport, Dispatcher};
use crate::runner::{CommandRunner, ProcessRunner};
use crate::watcher::event::ChangeEvent;
use crate::watcher::start_watcher;

pub struct Orchestrator {
    classifier: Classifier,
    debouncer: Debouncer,
    dispatcher: Dispatcher,
    pending: PendingActionSet,
    events_in_cycle: usize,
}

impl Orchestrator {
    pub fn new(classifier: Classifier, debouncer: Debouncer, dispatcher: Dispatcher) -> Self {
        Self {
            classifier,
            debouncer,
            dispatcher,
            pending: PendingActionSet::new(),
            events_in_cycle: 0,
        }
    }

    pub fn from_config(
        project_root: &Path,
        config: &DeployConfig,
        runner: Arc<dyn CommandRunner>,
    ) -> Result<Self> {
        let classifier = Classifier::new(project_root, &config.rules(), &config.ignore_patterns())
            .context("invalid classification rules")?;
        let debouncer = Debouncer::new(
            config.debounce_mode,
            config.debounce_window(),
            config.max_wait(),
        );
        let dispatcher = Dispatcher::new(project_root, config, runner)?;
        Ok(Self::new(classifier, debouncer, dispatcher))
    }

    fn observe(&mut self, event: &ChangeEvent) {
        self.debouncer.observe(event.observed_at);
        self.events_in_cycle += 1;
        if self.classifier.classify(&event.path, &mut self.pending) {
            debug!(
                path = %event.path.display(),
                kind = ?event.kind,
                pending = %self.pending,
                "classified"
            );
        }
    }

    async fn fire(&mut self) -> Option<CycleReport> {
        let events = std::mem::take(&mut self.events_in_cycle);
        if self.pending.is_empty() {
            debug!(events, "changes settled, nothing to deploy");
            return None;
        }

        info!(events, pending = %self.pending, "changes settled, dispatching");
        let report = self.dispatcher.run_cycle(&mut self.pending).await;
        info!(
            actions = report.actions.len(),
            failures = report.failures(),
            elapsed_ms = report.elapsed_ms,
            "cycle complete"
        );
        Some(report)
    }

    /// Drive the loop until the event stream closes or `shutdown` flips.
    ///
    /// A cycle that has started always runs to completion; shutdown is only
    /// observed between cycles. Dropping the shutdown sender also stops the
    /// loop.
    pub async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<ChangeEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        info!(
            mode = ?self.debouncer.mode(),
            window_ms = self.debouncer.window().as_millis() as u64,
            "waiting for changes"
        );

        loop {
            let deadline = self.debouncer.deadline();
            tokio::select! {
                // Queued events are drained before a due trigger fires, so they
                // land in the cycle they belong to.
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("shutdown requested");
                        break;
                    }
                }
                event = events.recv() => match event {
                    Some(event) => self.observe(&event),
                    None => {
                        info!("event stream closed");
                        break;
                    }
                },
                () = sleep_until(deadline) => {
                    if self.debouncer.take_trigger(Instant::now()) {
                        self.fire().await;
                    }
                }
            }
        }

        if !self.pending.is_empty() {
            warn!(pending = %self.pending, "exiting with undispatched changes");
        }
        Ok(())
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Flip the returned receiver on SIGINT or SIGTERM.
pub fn shutdown_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        let _ = tx.send(true);
        // Keep the sender alive so the loop sees `true`, not a closed channel.
        std::future::pending::<()>().await;
    });
    rx
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(err) => {
            warn!(error = %err, "SIGTERM handler unavailable, listening for Ctrl-C only");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

/// Start the watcher and run the loop until a termination signal.
pub async fn watch_project(project_root: &Path, config: &DeployConfig) -> Result<()> {
    let span = info_span!("deploy-watch");
    async {
        let (handle, events) = start_watcher(project_root, &config.roots)?;
        info!(
            project_root = %project_root.display(),
            roots = handle.roots().len(),
            skip_ui = config.skip_ui,
            "watching"
        );

        let orchestrator =
            Orchestrator::from_config(project_root, config, Arc::new(ProcessRunner))?;
        orchestrator.run(events, shutdown_signal()).await?;
        drop(handle);
        Ok::<_, anyhow::Error>(())
    }
    .instrument(span)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::Duration;

    use crate::debounce::DebounceMode;
    use crate::dispatch::tests::RecordingRunner;
    use crate::watcher::event::ChangeKind;

    struct Harness {
        root: tempfile::TempDir,
        runner: Arc<RecordingRunner>,
        events: mpsc::UnboundedSender<ChangeEvent>,
        stop: watch::Sender<bool>,
        task: tokio::task::JoinHandle<Result<()>>,
    }

    impl Harness {
        fn start(config: DeployConfig) -> Self {
            Self::start_with(config, RecordingRunner::default(), |_| {})
        }

        fn start_with(
            config: DeployConfig,
            runner: RecordingRunner,
            setup: impl FnOnce(&Path),
        ) -> Self {
            let root = tempfile::tempdir().unwrap();
            setup(root.path());
            let runner = Arc::new(runner);
            let orch = Orchestrator::from_config(root.path(), &config, runner.clone()).unwrap();
            let (events, rx) = mpsc::unbounded_channel();
            let (stop, stop_rx) = watch::channel(false);
            let task = tokio::spawn(orch.run(rx, stop_rx));
            Self {
                root,
                runner,
                events,
                stop,
                task,
            }
        }

        fn touch(&self, rel: &str) {
            let path: PathBuf = self.root.path().join(rel);
            self.events
                .send(ChangeEvent::new(path, ChangeKind::Modified))
                .unwrap();
        }

        async fn finish(self) -> Arc<RecordingRunner> {
            self.stop.send(true).unwrap();
            self.task.await.unwrap().unwrap();
            self.runner
        }
    }

    async fn advance(ms: u64) {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_manifest_and_source_in_one_window_run_full_only() {
        let h = Harness::start(DeployConfig::default());
        h.touch("webui/package.json");
        advance(300).await;
        h.touch("webui/src/App.component");
        advance(5_000).await;

        let runner = h.finish().await;
        assert_eq!(runner.names(), vec!["ui-build", "ui-sync"]);
        let calls = runner.calls.lock().unwrap();
        assert_eq!(calls[1].argv, vec!["scripts/deploy.sh", "--ui=full"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_order_ignores_arrival_order() {
        let h = Harness::start(DeployConfig::default());
        h.touch("requirements.txt");
        h.touch("app/main.py");
        h.touch("services/api.service");
        advance(5_000).await;

        let runner = h.finish().await;
        assert_eq!(
            runner.names(),
            vec!["service-install", "dependency-sync", "code-deploy"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_config_change_with_fresh_ui_never_builds() {
        let h = Harness::start_with(DeployConfig::default(), RecordingRunner::default(), |root| {
            let dist = root.join("webui/dist");
            std::fs::create_dir_all(&dist).unwrap();
            std::fs::write(dist.join("index.html"), "<html/>").unwrap();
        });
        h.touch("app/config.yaml");
        advance(5_000).await;

        let runner = h.finish().await;
        assert_eq!(runner.names(), vec!["code-deploy"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_separate_bursts_are_separate_cycles() {
        let h = Harness::start(DeployConfig::default());
        h.touch("app/a.py");
        advance(5_000).await;
        h.touch("app/b.py");
        advance(5_000).await;
        // Nothing changed: no third cycle.
        advance(10_000).await;

        let runner = h.finish().await;
        assert_eq!(runner.names(), vec!["code-deploy", "code-deploy"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unclassified_changes_dispatch_nothing() {
        let h = Harness::start(DeployConfig::default());
        h.touch("README.md");
        h.touch("webui/dist/assets/index.js");
        advance(5_000).await;

        let runner = h.finish().await;
        assert!(runner.names().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_silence_mode_waits_for_quiet() {
        let h = Harness::start(DeployConfig::default());
        // One event per second for six seconds, window is two seconds.
        for _ in 0..6 {
            h.touch("app/main.py");
            advance(1_000).await;
        }
        assert!(h.runner.names().is_empty());
        advance(2_000).await;

        let runner = h.finish().await;
        assert_eq!(runner.names(), vec!["code-deploy"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_leading_edge_parity_starves_tight_stream() {
        let config = DeployConfig {
            debounce_mode: DebounceMode::LeadingEdge,
            ..Default::default()
        };
        let h = Harness::start(config);
        h.touch("app/main.py");
        advance(1_000).await;
        // Every later event lands less than a window after the previous one.
        for _ in 0..10 {
            h.touch("config/app.yaml");
            advance(1_000).await;
        }
        advance(10_000).await;

        let runner = h.finish().await;
        // Only the settle trigger from the first event fired.
        assert_eq!(runner.names(), vec!["code-deploy"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_action_times_out_and_cycle_continues() {
        let mut config = DeployConfig::default();
        config.commands.dependency_sync.timeout_secs = Some(5);
        let runner = RecordingRunner {
            hanging: vec!["dependency-sync"],
            ..Default::default()
        };
        let h = Harness::start_with(config, runner, |_| {});
        h.touch("requirements.txt");
        h.touch("app/main.py");
        advance(2_500).await;

        // Settle (2s) plus the 5s timeout, well short of a 10s hang.
        advance(5_500).await;
        assert_eq!(h.runner.names(), vec!["dependency-sync", "code-deploy"]);
        h.finish().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_mid_cycle_finishes_cycle() {
        let mut config = DeployConfig::default();
        config.commands.dependency_sync.timeout_secs = Some(10);
        let runner = RecordingRunner {
            hanging: vec!["dependency-sync"],
            ..Default::default()
        };
        let h = Harness::start_with(config, runner, |_| {});
        h.touch("requirements.txt");
        h.touch("app/main.py");
        // Settle (2s), then 3s into the hung dependency sync.
        advance(5_000).await;
        assert_eq!(h.runner.names(), vec!["dependency-sync"]);

        let runner = h.finish().await;
        assert_eq!(runner.names(), vec!["dependency-sync", "code-deploy"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ui_build_config_change_rebuilds() {
        let h = Harness::start_with(DeployConfig::default(), RecordingRunner::default(), |root| {
            let dist = root.join("webui/dist");
            std::fs::create_dir_all(&dist).unwrap();
            std::fs::write(dist.join("index.html"), "<html/>").unwrap();
            let tailwind = root.join("webui/tailwind.config.js");
            std::fs::write(&tailwind, "module.exports = {}").unwrap();
            let later = std::time::SystemTime::now() + Duration::from_secs(3_600);
            std::fs::File::options()
                .write(true)
                .open(&tailwind)
                .unwrap()
                .set_times(std::fs::FileTimes::new().set_modified(later))
                .unwrap();
        });
        h.touch("webui/tailwind.config.js");
        advance(5_000).await;

        let runner = h.finish().await;
        assert_eq!(runner.names(), vec!["ui-build", "ui-sync"]);
        let calls = runner.calls.lock().unwrap();
        assert_eq!(calls[1].argv, vec!["scripts/deploy.sh", "--ui=minimal"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_event_stream_ends_loop() {
        let h = Harness::start(DeployConfig::default());
        let Harness {
            events, task, stop, ..
        } = h;
        drop(events);
        task.await.unwrap().unwrap();
        drop(stop);
    }
}
