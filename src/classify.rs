//! Path → deployment category classification.
//!
//! Rules are data: an ordered list of `(patterns, category)` pairs evaluated
//! top to bottom for every observed path. Matches are OR-ed into a
//! [`PendingActionSet`]; nothing here ever clears a flag.

use std::fmt;
use std::path::Path;

use anyhow::{Context, Result};
use clap::ValueEnum;
use glob::{MatchOptions, Pattern};
use serde::{Deserialize, Serialize};

/// Deployment action categories, declared in dispatch priority order
/// (highest first). `Ord` follows declaration order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
pub enum ActionCategory {
    /// A service unit file changed: reinstall and restart.
    ServiceUnit,
    /// A dependency manifest changed: sync runtime dependencies.
    Dependency,
    /// UI manifest or lockfile changed: full rebuild + full resync.
    UiFull,
    /// UI sources/assets/build config changed: rebuild + minimal resync.
    UiIncremental,
    /// Application code or configuration changed: fast deploy, UI untouched.
    CodeConfig,
}

impl ActionCategory {
    pub const ALL: [ActionCategory; 5] = [
        Self::ServiceUnit,
        Self::Dependency,
        Self::UiFull,
        Self::UiIncremental,
        Self::CodeConfig,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ServiceUnit => "service-unit",
            Self::Dependency => "dependency",
            Self::UiFull => "ui-full",
            Self::UiIncremental => "ui-incremental",
            Self::CodeConfig => "code-config",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for ActionCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Accumulated, not yet dispatched work. A set: re-inserting a category is a
/// no-op and iteration is always in priority order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingActionSet {
    flags: [bool; ActionCategory::ALL.len()],
}

impl PendingActionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, category: ActionCategory) {
        self.flags[category.index()] = true;
    }

    pub fn contains(&self, category: ActionCategory) -> bool {
        self.flags[category.index()]
    }

    pub fn is_empty(&self) -> bool {
        !self.flags.iter().any(|f| *f)
    }

    /// Set categories in priority order.
    pub fn iter(&self) -> impl Iterator<Item = ActionCategory> + '_ {
        ActionCategory::ALL
            .into_iter()
            .filter(|c| self.contains(*c))
    }

    /// Reset every flag at once.
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

impl FromIterator<ActionCategory> for PendingActionSet {
    fn from_iter<I: IntoIterator<Item = ActionCategory>>(iter: I) -> Self {
        let mut set = Self::new();
        for category in iter {
            set.insert(category);
        }
        set
    }
}

impl fmt::Display for PendingActionSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("(none)");
        }
        let names: Vec<&str> = self.iter().map(ActionCategory::as_str).collect();
        f.write_str(&names.join(","))
    }
}

/// Rule as written in `deploy-watch.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct RuleConfig {
    pub category: ActionCategory,
    pub patterns: Vec<String>,
    /// Skip this rule for a path that already matched one of these categories.
    #[serde(default)]
    pub unless: Vec<ActionCategory>,
}

/// A compiled classification rule.
#[derive(Debug, Clone)]
pub struct Rule {
    pub category: ActionCategory,
    patterns: Vec<Pattern>,
    unless: Vec<ActionCategory>,
}

impl Rule {
    pub fn compile(config: &RuleConfig) -> Result<Self> {
        Ok(Self {
            category: config.category,
            patterns: compile_patterns(&config.patterns)?,
            unless: config.unless.clone(),
        })
    }

    fn matches(&self, rel: &str) -> bool {
        self.patterns
            .iter()
            .any(|p| p.matches_with(rel, MATCH_OPTIONS))
    }
}

pub(crate) const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

pub(crate) fn compile_patterns(patterns: &[String]) -> Result<Vec<Pattern>> {
    patterns
        .iter()
        .map(|p| Pattern::new(p).with_context(|| format!("invalid glob pattern {p:?}")))
        .collect()
}

/// The rule list used when the config file does not define `[[rules]]`.
pub fn default_rules() -> Vec<RuleConfig> {
    fn rule(category: ActionCategory, patterns: &[&str], unless: &[ActionCategory]) -> RuleConfig {
        RuleConfig {
            category,
            patterns: patterns.iter().map(|p| p.to_string()).collect(),
            unless: unless.to_vec(),
        }
    }

    vec![
        rule(
            ActionCategory::UiFull,
            &[
                "webui/package.json",
                "webui/package-lock.json",
                "webui/pnpm-lock.yaml",
                "webui/yarn.lock",
            ],
            &[],
        ),
        rule(
            ActionCategory::UiIncremental,
            &[
                "webui/src/**",
                "webui/public/**",
                "webui/index.html",
                "webui/vite.config.*",
                "webui/tsconfig*.json",
                "webui/postcss.config.*",
                "webui/tailwind.config.*",
            ],
            &[ActionCategory::UiFull],
        ),
        rule(ActionCategory::ServiceUnit, &["**/*.service"], &[]),
        rule(
            ActionCategory::Dependency,
            &[
                "requirements.txt",
                "requirements-*.txt",
                "pyproject.toml",
            ],
            &[],
        ),
        rule(ActionCategory::CodeConfig, &["app/**", "config/**"], &[]),
    ]
}

/// Patterns of every rule that schedules a UI rebuild, in rule order.
///
/// The build gate watches exactly these, so anything classified as a UI
/// change is also a freshness input.
pub fn ui_source_patterns(rules: &[RuleConfig]) -> Vec<String> {
    let mut patterns: Vec<String> = Vec::new();
    for rule in rules {
        if !matches!(
            rule.category,
            ActionCategory::UiFull | ActionCategory::UiIncremental
        ) {
            continue;
        }
        for pattern in &rule.patterns {
            if !patterns.contains(pattern) {
                patterns.push(pattern.clone());
            }
        }
    }
    patterns
}

/// Project-relative, `/`-separated form used for matching. Paths outside
/// `root` are returned as given.
pub(crate) fn relative_path(root: &Path, path: &Path) -> String {
    let rel = path.strip_prefix(root).unwrap_or(path);
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Paths never classified: VCS internals, dependency trees, caches, editor
/// swap files.
pub const DEFAULT_IGNORE: &[&str] = &[
    "**/.git/**",
    "**/node_modules/**",
    "**/__pycache__/**",
    "**/*.pyc",
    "**/*.swp",
    "**/*~",
    "**/.#*",
];

/// Maps observed paths to categories.
#[derive(Debug, Clone)]
pub struct Classifier {
    project_root: std::path::PathBuf,
    rules: Vec<Rule>,
    ignore: Vec<Pattern>,
}

impl Classifier {
    pub fn new(project_root: &Path, rules: &[RuleConfig], ignore: &[String]) -> Result<Self> {
        let rules = rules.iter().map(Rule::compile).collect::<Result<Vec<_>>>()?;
        Ok(Self {
            project_root: project_root.to_path_buf(),
            rules,
            ignore: compile_patterns(ignore)?,
        })
    }

    /// Categories a single path maps to, in rule order.
    pub fn categories_for(&self, path: &Path) -> Vec<ActionCategory> {
        let rel = relative_path(&self.project_root, path);
        if self.ignore.iter().any(|p| p.matches_with(&rel, MATCH_OPTIONS)) {
            return Vec::new();
        }

        let mut matched: Vec<ActionCategory> = Vec::new();
        for rule in &self.rules {
            if rule.unless.iter().any(|c| matched.contains(c)) {
                continue;
            }
            if rule.matches(&rel) && !matched.contains(&rule.category) {
                matched.push(rule.category);
            }
        }
        matched
    }

    /// OR every category `path` maps to into `pending`. Returns whether the
    /// path matched anything.
    pub fn classify(&self, path: &Path, pending: &mut PendingActionSet) -> bool {
        let categories = self.categories_for(path);
        for category in &categories {
            pending.insert(*category);
        }
        !categories.is_empty()
    }
}
