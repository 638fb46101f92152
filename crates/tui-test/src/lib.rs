// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! End-to-end tests for terminal applications.
//!
//! A test binary registers its test files with [`TestProgram`] and calls
//! [`TestProgram::run`]. The same binary acts as orchestrator and, through a
//! hidden subcommand, as worker process:
//!
//! ```no_run
//! use tui_test::prelude::*;
//!
//! fn app_tests(s: &mut SuiteBuilder<'_>) {
//!     s.test("prints a greeting", |t| async move {
//!         t.terminal().submit("echo hello")?;
//!         expect(&t.get_by_text("hello")).to_be_visible().await?;
//!         Ok(())
//!     });
//! }
//!
//! fn main() -> std::process::ExitCode {
//!     TestProgram::new().file("tests/app.rs", app_tests).run()
//! }
//! ```

pub mod orchestrator;
pub mod pool;
pub mod program;
pub mod protocol;
pub mod reporter;
pub mod worker;

pub use orchestrator::{Orchestrator, OrchestratorError, RunReport, RunSettings};
pub use pool::{PoolError, ProcessPool, WorkerCommand, WorkerPool};
pub use program::{Cli, Command, TestProgram};
pub use protocol::{AttemptRequest, SuiteSpec, WorkerEvent};
pub use reporter::{ListReporter, Reporter, StaleSnapshotSummary};

pub mod prelude {
    pub use crate::TestProgram;
    pub use tt_config::{Program, Shell, TestOptions};
    pub use tt_core::{
        expect, ExpectedColor, LocatorOptions, Pattern, SnapshotOptions, SuiteBuilder, TestContext,
    };
    pub use tt_terminal::Key;
}
