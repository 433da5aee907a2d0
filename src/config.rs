use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Deserialize;

use crate::classify::{DEFAULT_IGNORE, RuleConfig, default_rules, ui_source_patterns};
use crate::debounce::DebounceMode;
use crate::runner::CommandSpec;

/// Config file looked up in the project root when `--config` is not given.
pub const CONFIG_FILE: &str = "deploy-watch.toml";

/// Configuration loaded from `deploy-watch.toml`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeployConfig {
    /// Directories and files to watch, relative to the project root.
    pub roots: Vec<PathBuf>,
    pub debounce_secs: f64,
    pub debounce_mode: DebounceMode,
    /// Upper bound on how long a sustained burst can postpone a cycle
    /// (silence mode). `0` disables the cap.
    pub max_wait_secs: f64,
    /// Timeout for every collaborator that does not set its own.
    pub cycle_timeout_secs: u64,
    /// Timeout for the service-unit installer (stop, replace, reload, restart).
    pub service_timeout_secs: u64,
    /// Never rebuild or resync the UI.
    pub skip_ui: bool,
    pub build: BuildConfig,
    pub commands: CommandsConfig,
    /// Replaces the built-in ignore list when set.
    pub ignore: Option<Vec<String>>,
    /// Replaces the built-in classification rules when set.
    pub rules: Option<Vec<RuleConfig>>,
    pub logging: LoggingConfig,
}

/// UI build output layout and freshness inputs.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    pub output_dir: PathBuf,
    /// Primary artifact, relative to `output_dir`. If it is missing the build
    /// always runs.
    pub artifact: PathBuf,
    /// Stamp file, relative to `output_dir`.
    pub stamp_file: PathBuf,
    /// Glob patterns, relative to the project root, whose mtimes decide
    /// whether a rebuild is needed. Defaults to the patterns of the UI
    /// classification rules.
    pub sources: Option<Vec<String>>,
}

/// The five external collaborators.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CommandsConfig {
    pub service_install: CommandSpec,
    pub dependency_sync: CommandSpec,
    pub ui_build: CommandSpec,
    pub ui_sync: CommandSpec,
    pub code_deploy: CommandSpec,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive, e.g. `"info"` or `"deploy_watch=debug"`.
    pub level: Option<String>,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            roots: [
                "app",
                "config",
                "services",
                "webui/src",
                "webui/public",
                "webui/index.html",
                "webui/package.json",
                "webui/package-lock.json",
                "webui/pnpm-lock.yaml",
                "webui/yarn.lock",
                "webui/vite.config.ts",
                "webui/vite.config.js",
                "webui/tsconfig.json",
                "webui/postcss.config.js",
                "webui/tailwind.config.js",
                "requirements.txt",
                "requirements-optional.txt",
                "pyproject.toml",
            ]
            .iter()
            .map(PathBuf::from)
            .collect(),
            debounce_secs: 2.0,
            debounce_mode: DebounceMode::default(),
            max_wait_secs: 30.0,
            cycle_timeout_secs: 600,
            service_timeout_secs: 60,
            skip_ui: false,
            build: BuildConfig::default(),
            commands: CommandsConfig::default(),
            ignore: None,
            rules: None,
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("webui/dist"),
            artifact: PathBuf::from("index.html"),
            stamp_file: PathBuf::from(".build-stamp"),
            sources: None,
        }
    }
}

impl Default for CommandsConfig {
    fn default() -> Self {
        Self {
            service_install: CommandSpec::new(&["scripts/install-services.sh"]),
            dependency_sync: CommandSpec::new(&["scripts/ensure-deps.sh"]),
            ui_build: CommandSpec {
                workdir: Some(PathBuf::from("webui")),
                ..CommandSpec::new(&["npm", "run", "build"])
            },
            ui_sync: CommandSpec::new(&["scripts/deploy.sh", "--ui={mode}"]),
            code_deploy: CommandSpec::new(&["scripts/deploy.sh", "--ui=skip"]),
        }
    }
}

/// Command-line / environment overrides, applied on top of the file.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub debounce_secs: Option<f64>,
    pub debounce_mode: Option<DebounceMode>,
    pub cycle_timeout_secs: Option<u64>,
    pub service_timeout_secs: Option<u64>,
    pub skip_ui: bool,
}

impl DeployConfig {
    /// Load configuration for `root`.
    ///
    /// With an explicit `path`, a missing or malformed file is an error.
    /// Otherwise `deploy-watch.toml` in `root` is optional, and an unreadable
    /// or malformed one falls back to defaults with a warning.
    pub fn load(root: &Path, path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let config: Self = toml::from_str(&contents)
                .with_context(|| format!("failed to parse {}", path.display()))?;
            return Ok(config);
        }

        let config_path = root.join(CONFIG_FILE);
        if !config_path.exists() {
            return Ok(Self::default());
        }

        let config = match std::fs::read_to_string(&config_path) {
            Ok(contents) => match toml::from_str::<Self>(&contents) {
                Ok(config) => config,
                Err(err) => {
                    eprintln!("warning: failed to parse {CONFIG_FILE}: {err}. Using defaults.");
                    Self::default()
                }
            },
            Err(err) => {
                eprintln!("warning: failed to read {CONFIG_FILE}: {err}. Using defaults.");
                Self::default()
            }
        };
        Ok(config)
    }

    pub fn apply(&mut self, overrides: &ConfigOverrides) {
        if let Some(secs) = overrides.debounce_secs {
            self.debounce_secs = secs;
        }
        if let Some(mode) = overrides.debounce_mode {
            self.debounce_mode = mode;
        }
        if let Some(secs) = overrides.cycle_timeout_secs {
            self.cycle_timeout_secs = secs;
        }
        if let Some(secs) = overrides.service_timeout_secs {
            self.service_timeout_secs = secs;
        }
        if overrides.skip_ui {
            self.skip_ui = true;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.debounce_secs.is_finite() && self.debounce_secs > 0.0) {
            bail!("debounce_secs must be a positive number, got {}", self.debounce_secs);
        }
        if !(self.max_wait_secs.is_finite() && self.max_wait_secs >= 0.0) {
            bail!("max_wait_secs must be zero or positive, got {}", self.max_wait_secs);
        }
        if self.cycle_timeout_secs == 0 || self.service_timeout_secs == 0 {
            bail!("collaborator timeouts must be at least one second");
        }
        if self.roots.is_empty() {
            bail!("no watch roots configured");
        }
        Ok(())
    }

    pub fn debounce_window(&self) -> Duration {
        Duration::from_secs_f64(self.debounce_secs)
    }

    pub fn max_wait(&self) -> Option<Duration> {
        (self.max_wait_secs > 0.0).then(|| Duration::from_secs_f64(self.max_wait_secs))
    }

    pub fn cycle_timeout(&self) -> Duration {
        Duration::from_secs(self.cycle_timeout_secs)
    }

    pub fn service_timeout(&self) -> Duration {
        Duration::from_secs(self.service_timeout_secs)
    }

    /// Ignore globs in effect. The build output directory is always
    /// included so a build can never retrigger itself.
    pub fn ignore_patterns(&self) -> Vec<String> {
        let mut patterns: Vec<String> = match &self.ignore {
            Some(custom) => custom.clone(),
            None => DEFAULT_IGNORE.iter().map(|p| p.to_string()).collect(),
        };
        let output = self
            .build
            .output_dir
            .to_string_lossy()
            .trim_end_matches('/')
            .to_string();
        patterns.push(format!("{output}/**"));
        patterns
    }

    pub fn rules(&self) -> Vec<RuleConfig> {
        self.rules.clone().unwrap_or_else(default_rules)
    }

    /// Build freshness inputs in effect.
    pub fn build_sources(&self) -> Vec<String> {
        match &self.build.sources {
            Some(sources) => sources.clone(),
            None => ui_source_patterns(&self.rules()),
        }
    }
}
