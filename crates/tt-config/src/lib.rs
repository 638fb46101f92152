// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Configuration for tui-test.
//!
//! Configuration is resolved from three layers, lowest precedence first:
//! built-in defaults, `tui-test.toml` (or the `--config` path) and the
//! `TUI_TEST_*` environment overlay. Layers are merged as JSON and the result
//! is deserialized into [`TestConfig`].

pub mod env;
pub mod loader;
pub mod merge;

use serde::{Deserialize, Serialize};
use serde_json::Value as J;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// File looked up in the working directory when no path is given.
pub const DEFAULT_CONFIG_FILE: &str = "tui-test.toml";

pub const DEFAULT_ROWS: u16 = 30;
pub const DEFAULT_COLUMNS: u16 = 80;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("config file {0} does not exist")]
    NotFound(PathBuf),
    #[error("failed to parse config file {path}: {source}")]
    Toml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("failed to read environment overlay: {0}")]
    Env(#[from] config::ConfigError),
    #[error("invalid configuration at `{path}`: {message}")]
    Invalid { path: String, message: String },
    #[error("invalid test match pattern `{pattern}`: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("invalid configuration: {0}")]
    Validation(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Shell used to host a test when no program is configured
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Shell {
    Bash,
    Sh,
    Zsh,
    Fish,
    Powershell,
    Pwsh,
    Cmd,
}

impl Default for Shell {
    fn default() -> Self {
        if cfg!(windows) {
            Shell::Cmd
        } else {
            Shell::Bash
        }
    }
}

impl Shell {
    pub fn name(&self) -> &'static str {
        match self {
            Shell::Bash => "bash",
            Shell::Sh => "sh",
            Shell::Zsh => "zsh",
            Shell::Fish => "fish",
            Shell::Powershell => "powershell",
            Shell::Pwsh => "pwsh",
            Shell::Cmd => "cmd",
        }
    }
}

impl std::fmt::Display for Shell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Program launched directly in the terminal instead of a shell
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Program {
    pub file: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// Terminal options that can be set on the config root, on a project, or on
/// any suite. Unset fields inherit from the enclosing scope.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct TestOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shell: Option<Shell>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub columns: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env: Option<BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub program: Option<Program>,
}

impl TestOptions {
    /// Return `self` layered over `parent`: set fields win, env maps merge
    /// key by key with `self` taking precedence.
    pub fn inherit(&self, parent: &TestOptions) -> TestOptions {
        let env = match (&parent.env, &self.env) {
            (None, None) => None,
            (Some(p), None) => Some(p.clone()),
            (None, Some(c)) => Some(c.clone()),
            (Some(p), Some(c)) => {
                let mut merged = p.clone();
                merged.extend(c.iter().map(|(k, v)| (k.clone(), v.clone())));
                Some(merged)
            }
        };
        TestOptions {
            shell: self.shell.or(parent.shell),
            rows: self.rows.or(parent.rows),
            columns: self.columns.or(parent.columns),
            env,
            program: self.program.clone().or_else(|| parent.program.clone()),
        }
    }

    /// Fill remaining gaps with built-in defaults.
    pub fn resolve(&self) -> ResolvedOptions {
        ResolvedOptions {
            shell: self.shell.unwrap_or_default(),
            rows: self.rows.unwrap_or(DEFAULT_ROWS),
            columns: self.columns.unwrap_or(DEFAULT_COLUMNS),
            env: self.env.clone().unwrap_or_default(),
            program: self.program.clone(),
        }
    }

    fn validate(&self, scope: &str) -> ConfigResult<()> {
        if self.rows == Some(0) || self.columns == Some(0) {
            return Err(ConfigError::Validation(format!(
                "{scope}: rows and columns must be greater than zero"
            )));
        }
        if let Some(program) = &self.program {
            if program.file.trim().is_empty() {
                return Err(ConfigError::Validation(format!(
                    "{scope}: program.file must not be empty"
                )));
            }
        }
        Ok(())
    }
}

/// Fully defaulted terminal options for one test
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedOptions {
    pub shell: Shell,
    pub rows: u16,
    pub columns: u16,
    pub env: BTreeMap<String, String>,
    pub program: Option<Program>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ExpectConfig {
    /// Default assertion timeout in milliseconds
    pub timeout: u64,
}

impl Default for ExpectConfig {
    fn default() -> Self {
        Self { timeout: 5_000 }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ProjectConfig {
    pub name: String,
    /// Regular expression selecting the test files of this project
    pub test_match: Option<String>,
    #[serde(flatten)]
    pub options: TestOptions,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct TestConfig {
    /// Regular expression selecting test files for the implicit root project
    pub test_match: String,
    /// Per-attempt timeout in milliseconds, 0 disables
    pub timeout: u64,
    /// Whole-run timeout in milliseconds, 0 disables
    pub global_timeout: u64,
    pub retries: u32,
    /// Worker process count, defaults to half the logical CPUs
    pub workers: Option<usize>,
    pub expect: ExpectConfig,
    pub trace: bool,
    pub trace_folder: PathBuf,
    #[serde(rename = "use")]
    pub use_options: TestOptions,
    pub projects: Vec<ProjectConfig>,
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            test_match: ".*".to_string(),
            timeout: 30_000,
            global_timeout: 0,
            retries: 0,
            workers: None,
            expect: ExpectConfig::default(),
            trace: false,
            trace_folder: PathBuf::from("tui-traces"),
            use_options: TestOptions::default(),
            projects: Vec::new(),
        }
    }
}

impl TestConfig {
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout > 0).then(|| Duration::from_millis(self.timeout))
    }

    pub fn global_timeout(&self) -> Option<Duration> {
        (self.global_timeout > 0).then(|| Duration::from_millis(self.global_timeout))
    }

    pub fn expect_timeout(&self) -> Duration {
        Duration::from_millis(self.expect.timeout)
    }

    pub fn worker_count(&self) -> usize {
        self.workers.filter(|n| *n > 0).unwrap_or_else(default_worker_count)
    }

    pub fn test_match_regex(&self) -> ConfigResult<regex::Regex> {
        compile_pattern(&self.test_match)
    }

    fn validate(&self) -> ConfigResult<()> {
        self.test_match_regex()?;
        self.use_options.validate("use")?;
        for (idx, project) in self.projects.iter().enumerate() {
            if let Some(pattern) = &project.test_match {
                compile_pattern(pattern)?;
            }
            project.options.validate(&format!("projects[{idx}]"))?;
        }
        Ok(())
    }
}

/// Half the logical CPUs, at least one.
pub fn default_worker_count() -> usize {
    let cpus = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
    (cpus / 2).max(1)
}

pub fn compile_pattern(pattern: &str) -> ConfigResult<regex::Regex> {
    regex::Regex::new(pattern).map_err(|source| ConfigError::InvalidPattern {
        pattern: pattern.to_string(),
        source,
    })
}

/// Deserialize and validate a merged JSON document.
pub fn from_json(json: J) -> ConfigResult<TestConfig> {
    let config: TestConfig =
        serde_path_to_error::deserialize(json).map_err(|e| ConfigError::Invalid {
            path: e.path().to_string(),
            message: e.inner().to_string(),
        })?;
    config.validate()?;
    Ok(config)
}

/// Load configuration from `path` (or `tui-test.toml` in the working
/// directory) layered under the process environment.
pub fn load(path: Option<&Path>) -> ConfigResult<TestConfig> {
    let overlay = env::env_overlay()?;
    load_layers(path, overlay)
}

/// Load configuration with an explicit environment overlay.
///
/// An explicit `path` must exist; the default file is optional.
pub fn load_layers(path: Option<&Path>, overlay: J) -> ConfigResult<TestConfig> {
    let mut json = serde_json::json!({});

    let file = match path {
        Some(p) if !p.exists() => return Err(ConfigError::NotFound(p.to_path_buf())),
        Some(p) => Some(p.to_path_buf()),
        None => {
            let default = PathBuf::from(DEFAULT_CONFIG_FILE);
            default.exists().then_some(default)
        }
    };

    if let Some(file) = &file {
        debug!(path = %file.display(), "Loading config file");
        merge::merge_two_json(&mut json, loader::read_layer_from_file(file)?);
    }
    merge::merge_two_json(&mut json, overlay);

    from_json(json)
}
