use std::path::PathBuf;

use clap::builder::BoolishValueParser;
use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::classify::ActionCategory;
use crate::config::ConfigOverrides;
use crate::debounce::DebounceMode;

/// Change-driven deployment orchestrator.
///
/// deploy-watch observes a source tree, coalesces bursts of edits, classifies
/// what changed and runs the matching install/build/sync steps in a fixed
/// priority order, each under its own timeout.
#[derive(Parser, Debug)]
#[command(
    name = "deploy-watch",
    version,
    about,
    long_about = None,
    propagate_version = true,
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

/// Output format for one-shot commands.
#[derive(Clone, Debug, ValueEnum, Default)]
pub enum OutputFormat {
    /// One line per item (default).
    #[default]
    Compact,
    /// Pretty-printed JSON for scripts.
    Json,
}

#[derive(Args, Debug, Clone)]
pub struct ProjectArgs {
    /// Project root; watch roots and collaborator paths are relative to it.
    #[arg(short = 'C', long, default_value = ".", env = "DEPLOY_WATCH_PROJECT_ROOT")]
    pub project_root: PathBuf,

    /// Config file (default: deploy-watch.toml in the project root).
    #[arg(long, env = "DEPLOY_WATCH_CONFIG")]
    pub config: Option<PathBuf>,
}

#[derive(Args, Debug, Clone, Default)]
pub struct OverrideArgs {
    /// Debounce window in seconds.
    #[arg(long, env = "DEPLOY_WATCH_DEBOUNCE_SECS")]
    pub debounce_secs: Option<f64>,

    /// Burst detection strategy.
    #[arg(long, value_enum, env = "DEPLOY_WATCH_DEBOUNCE_MODE")]
    pub debounce_mode: Option<DebounceMode>,

    /// Default timeout for build, sync and deploy collaborators, in seconds.
    #[arg(long, env = "DEPLOY_WATCH_CYCLE_TIMEOUT_SECS")]
    pub cycle_timeout_secs: Option<u64>,

    /// Timeout for the service-unit installer, in seconds.
    #[arg(long, env = "DEPLOY_WATCH_SERVICE_TIMEOUT_SECS")]
    pub service_timeout_secs: Option<u64>,

    /// Never rebuild or resync the UI.
    #[arg(long, env = "DEPLOY_WATCH_SKIP_UI", value_parser = BoolishValueParser::new())]
    pub skip_ui: bool,
}

impl From<&OverrideArgs> for ConfigOverrides {
    fn from(args: &OverrideArgs) -> Self {
        Self {
            debounce_secs: args.debounce_secs,
            debounce_mode: args.debounce_mode,
            cycle_timeout_secs: args.cycle_timeout_secs,
            service_timeout_secs: args.service_timeout_secs,
            skip_ui: args.skip_ui,
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Watch the project and deploy changes until interrupted.
    Watch {
        #[command(flatten)]
        project: ProjectArgs,

        #[command(flatten)]
        overrides: OverrideArgs,
    },

    /// Show which categories the given paths would set and what a cycle
    /// would run. Nothing is executed.
    Classify {
        /// Paths to classify, relative to the project root.
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        #[command(flatten)]
        project: ProjectArgs,

        /// Never plan UI actions.
        #[arg(long, env = "DEPLOY_WATCH_SKIP_UI", value_parser = BoolishValueParser::new())]
        skip_ui: bool,

        /// Output format.
        #[arg(long, value_enum, default_value_t = OutputFormat::Compact)]
        format: OutputFormat,
    },

    /// Run one dispatch cycle now for the given categories.
    ///
    /// Exits non-zero if any action failed or timed out.
    Deploy {
        /// Categories to dispatch (comma-separated).
        #[arg(long, value_enum, value_delimiter = ',', required = true)]
        category: Vec<ActionCategory>,

        #[command(flatten)]
        project: ProjectArgs,

        #[command(flatten)]
        overrides: OverrideArgs,

        /// Output format.
        #[arg(long, value_enum, default_value_t = OutputFormat::Compact)]
        format: OutputFormat,
    },

    /// Report whether the UI build is out of date, without building.
    Gate {
        #[command(flatten)]
        project: ProjectArgs,

        /// Output format.
        #[arg(long, value_enum, default_value_t = OutputFormat::Compact)]
        format: OutputFormat,
    },
}
