mod classify;
mod cli;
mod config;
mod debounce;
mod dispatch;
mod gate;
mod logging;
mod orchestrator;
mod output;
mod runner;
mod watcher;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::Instrument;

use classify::{Classifier, PendingActionSet};
use cli::{Cli, Commands, OverrideArgs, ProjectArgs};
use config::{ConfigOverrides, DeployConfig};
use dispatch::{Dispatcher, plan};
use gate::BuildGate;
use output::{ClassifyReport, GateReport, PathClassification};
use runner::ProcessRunner;

/// Resolve the project root, load and validate its config, and start logging.
fn load(project: &ProjectArgs, overrides: ConfigOverrides) -> Result<(PathBuf, DeployConfig)> {
    let root = project
        .project_root
        .canonicalize()
        .with_context(|| format!("project root {} not found", project.project_root.display()))?;

    let mut config = DeployConfig::load(&root, project.config.as_deref())?;
    config.apply(&overrides);
    config.validate()?;
    logging::init(&config.logging);
    Ok((root, config))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Watch { project, overrides } => {
            let (root, config) = load(&project, ConfigOverrides::from(&overrides))?;
            orchestrator::watch_project(&root, &config).await?;
        }
        Commands::Classify {
            paths,
            project,
            skip_ui,
            format,
        } => {
            let overrides = OverrideArgs {
                skip_ui,
                ..Default::default()
            };
            let (root, config) = load(&project, ConfigOverrides::from(&overrides))?;
            let classifier = Classifier::new(&root, &config.rules(), &config.ignore_patterns())
                .context("invalid classification rules")?;

            let mut pending = PendingActionSet::new();
            let mut entries = Vec::with_capacity(paths.len());
            for path in paths {
                let path = if path.is_absolute() {
                    path
                } else {
                    root.join(path)
                };
                let categories = classifier.categories_for(&path);
                for category in &categories {
                    pending.insert(*category);
                }
                entries.push(PathClassification { path, categories });
            }

            let steps = plan(&pending, config.skip_ui);
            let report = ClassifyReport::new(entries, &pending, steps);
            output::print_classify(&report, &root, &format);
        }
        Commands::Deploy {
            category,
            project,
            overrides,
            format,
        } => {
            let (root, config) = load(&project, ConfigOverrides::from(&overrides))?;
            let dispatcher = Dispatcher::new(&root, &config, Arc::new(ProcessRunner))?;

            let mut pending: PendingActionSet = category.into_iter().collect();
            let report = dispatcher
                .run_cycle(&mut pending)
                .instrument(tracing::info_span!("deploy-watch"))
                .await;
            output::print_cycle(&report, &format);
            if !report.all_succeeded() {
                std::process::exit(1);
            }
        }
        Commands::Gate { project, format } => {
            let (root, config) = load(&project, ConfigOverrides::default())?;
            let gate = BuildGate::new(&root, &config.build, &config.build_sources())
                .context("invalid build sources")?;
            let decision = gate.decide();
            output::print_gate(&GateReport::new(&gate, &decision), &format);
        }
    }

    Ok(())
}
