// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Test binary entry point and command line

use crate::orchestrator::{Orchestrator, RunSettings};
use crate::pool::{ProcessPool, WorkerCommand};
use crate::reporter::ListReporter;
use anyhow::Context;
use clap::{Parser, Subcommand};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{debug, error};
use tt_core::{build_tree, RegisterFn, SuiteTree, TestFile, TestIndex};
use tt_logging::{CliLogLevel, CliLoggingArgs};
use tt_terminal::trace::{load_trace, play, replay};
use tt_terminal::{BufferScope, ScreenSource};

pub const INVALID_FILTER: &str =
    "Error: invalid test filter supplied. Test filters must be valid regular expressions";

#[derive(Parser, Debug)]
#[command(
    name = "tui-test",
    about = "Run end-to-end tests against terminal applications",
    args_conflicts_with_subcommands = true
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Only run test files whose absolute path matches one of these regular expressions
    #[arg(value_name = "FILTER")]
    pub filters: Vec<String>,

    /// Overwrite snapshots that differ and remove obsolete ones
    #[arg(short = 'u', long)]
    pub update_snapshots: bool,

    /// Record a trace of every attempt
    #[arg(short = 't', long)]
    pub trace: bool,

    /// Configuration file (default: ./tui-test.toml)
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[command(flatten)]
    pub logging: CliLoggingArgs,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Replay a recorded trace and print the final screen
    ShowTrace {
        /// Trace file written by a `--trace` run
        file: PathBuf,
        /// Replay the output in real time instead of printing the final screen
        #[arg(long)]
        play: bool,
        /// Playback speed multiplier
        #[arg(long, default_value_t = 1.0)]
        speed: f64,
    },
    /// Serve attempts for an orchestrator over stdin/stdout
    #[command(hide = true)]
    Worker,
}

/// The registered test files of one test binary
#[derive(Default)]
pub struct TestProgram {
    files: Vec<TestFile>,
}

impl TestProgram {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a test file. `path` is the file's path relative to the
    /// directory the tests run from; it scopes ids and snapshot documents.
    pub fn file(mut self, path: &'static str, register: RegisterFn) -> Self {
        self.files.push(TestFile { path, register });
        self
    }

    pub fn files(&self) -> &[TestFile] {
        &self.files
    }

    /// Parse the command line and run.
    pub fn run(self) -> ExitCode {
        self.run_with(Cli::parse())
    }

    pub fn run_with(self, cli: Cli) -> ExitCode {
        let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
            Ok(runtime) => runtime,
            Err(e) => {
                eprintln!("Error: failed to start async runtime: {e}");
                return ExitCode::FAILURE;
            }
        };

        let result = match cli.command.clone() {
            Some(Command::Worker) => {
                if let Err(e) = cli.logging.init_with_default_level("tui-test-worker", CliLogLevel::Warn) {
                    eprintln!("Warning: logging unavailable: {e}");
                }
                runtime.block_on(crate::worker::serve(&self.files)).map(|_| 0)
            }
            Some(Command::ShowTrace { file, play, speed }) => {
                runtime.block_on(show_trace(&file, play, speed)).map(|_| 0)
            }
            None => {
                if let Err(e) = cli.logging.init("tui-test") {
                    eprintln!("Warning: logging unavailable: {e}");
                }
                runtime.block_on(run_tests(&self.files, &cli))
            }
        };

        match result {
            Ok(code) => ExitCode::from(code),
            Err(e) => {
                error!(error = %e, "Run failed");
                eprintln!("Error: {e:#}");
                ExitCode::FAILURE
            }
        }
    }
}

/// Tests to run: the focused tests when any exist, narrowed by the file filters.
pub fn select_tests(tree: &SuiteTree, filters: &[Regex], cwd: &Path) -> Vec<TestIndex> {
    let any_only = tree.tests().any(|(_, t)| t.is_only());
    tree.tests()
        .filter(|(_, t)| !any_only || t.is_only())
        .filter(|(idx, _)| {
            if filters.is_empty() {
                return true;
            }
            let Some(file) = tree.file_path(*idx) else {
                return false;
            };
            let absolute = cwd.join(file);
            let absolute = absolute.to_string_lossy();
            filters.iter().any(|f| f.is_match(&absolute))
        })
        .map(|(idx, _)| idx)
        .collect()
}

async fn run_tests(files: &[TestFile], cli: &Cli) -> anyhow::Result<u8> {
    let config = tt_config::load(cli.config.as_deref()).context("failed to load configuration")?;
    let (mut tree, _registry) = build_tree(&config, files).context("failed to build the test tree")?;

    let filters: Result<Vec<Regex>, _> = cli.filters.iter().map(|f| Regex::new(f)).collect();
    let Ok(filters) = filters else {
        eprintln!("{INVALID_FILTER}");
        return Ok(1);
    };
    let cwd = std::env::current_dir().context("failed to read the working directory")?;
    let selected = select_tests(&tree, &filters, &cwd);
    debug!(selected = selected.len(), "Selected tests");

    let command = WorkerCommand::current_exe(cli.logging.to_args()).context("failed to locate the test binary")?;
    let pool = Arc::new(ProcessPool::new(command, config.worker_count()));
    let settings = RunSettings::from_config(&config, cli.update_snapshots, cli.trace, cwd);
    let orchestrator = Orchestrator::new(pool, Arc::new(ListReporter::stdout()), settings);

    match orchestrator.run(&mut tree, &selected).await {
        Ok(report) => Ok(report.failures.min(u8::MAX as usize) as u8),
        Err(e) => {
            eprintln!("{e}");
            Ok(1)
        }
    }
}

async fn show_trace(file: &Path, realtime: bool, speed: f64) -> anyhow::Result<()> {
    let trace = load_trace(file).with_context(|| format!("failed to read trace {}", file.display()))?;
    if realtime {
        let mut out = std::io::stdout();
        play(&trace, &mut out, speed).await?;
        return Ok(());
    }
    let screen = replay(&trace)?;
    for row in screen.grid(BufferScope::Viewport).text_rows() {
        println!("{}", row.trim_end());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tt_config::TestConfig;
    use tt_core::SuiteBuilder;

    fn register_a(s: &mut SuiteBuilder<'_>) {
        s.test("plain", |_| async { Ok(()) });
        s.test("other", |_| async { Ok(()) });
    }

    fn register_b(s: &mut SuiteBuilder<'_>) {
        s.test("plain", |_| async { Ok(()) });
    }

    fn register_focused(s: &mut SuiteBuilder<'_>) {
        s.test("plain", |_| async { Ok(()) });
        s.only("focused", |_| async { Ok(()) });
    }

    fn tree(files: &[TestFile]) -> SuiteTree {
        build_tree(&TestConfig::default(), files).unwrap().0
    }

    #[test]
    fn test_filters_match_absolute_paths() {
        let files = [
            TestFile {
                path: "tests/a.rs",
                register: register_a,
            },
            TestFile {
                path: "tests/b.rs",
                register: register_b,
            },
        ];
        let tree = tree(&files);
        let cwd = Path::new("/work");
        assert_eq!(select_tests(&tree, &[], cwd).len(), 3);
        let only_b = select_tests(&tree, &[Regex::new("^/work/tests/b").unwrap()], cwd);
        assert_eq!(only_b.len(), 1);
        assert_eq!(tree.file_path(only_b[0]), Some("tests/b.rs"));
    }

    #[test]
    fn test_focused_tests_win() {
        let files = [
            TestFile {
                path: "tests/a.rs",
                register: register_a,
            },
            TestFile {
                path: "tests/f.rs",
                register: register_focused,
            },
        ];
        let tree = tree(&files);
        let selected = select_tests(&tree, &[], Path::new("/work"));
        assert_eq!(selected.len(), 1);
        assert_eq!(tree.test(selected[0]).title, "focused");
    }

    #[test]
    fn test_cli_parses_filters_and_subcommands() {
        let cli = Cli::try_parse_from(["tui-test", "-u", "--trace", "tests/a"]).unwrap();
        assert!(cli.update_snapshots);
        assert!(cli.trace);
        assert_eq!(cli.filters, vec!["tests/a"]);
        assert!(cli.command.is_none());

        let cli = Cli::try_parse_from(["tui-test", "worker", "--log-level", "debug"]).unwrap();
        assert!(matches!(cli.command, Some(Command::Worker)));
        assert_eq!(cli.logging.log_level, Some(CliLogLevel::Debug));

        let cli = Cli::try_parse_from(["tui-test", "show-trace", "t.trace", "--play"]).unwrap();
        match cli.command {
            Some(Command::ShowTrace { file, play, speed }) => {
                assert_eq!(file, PathBuf::from("t.trace"));
                assert!(play);
                assert_eq!(speed, 1.0);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
