// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Worker process entry point
//!
//! A worker reads attempt requests from stdin, one per line, and runs each
//! against a freshly spawned terminal. Everything it reports goes to stdout
//! as prefixed [`WorkerEvent`] lines.

use crate::protocol::{AttemptRequest, WorkerEvent, ATTEMPT_END};
use anyhow::Context;
use futures::FutureExt;
use std::io::Write;
use std::panic::AssertUnwindSafe;
use std::path::{Component, Path};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};
use tt_core::{
    build_file_tree, SnapshotContext, SnapshotRecord, SnapshotStore, SuiteKind, TestContext, TestFile, TestInfo,
};
use tt_terminal::trace::{save_trace, trace_filename};
use tt_terminal::{BufferScope, ScreenSource, Terminal, TerminalOptions, Trace, TraceRecorder, SHELL_PROMPT};

/// How long a shell gets to print its first prompt
const PROMPT_TIMEOUT: Duration = Duration::from_secs(5);

/// How long to wait for the PTY reader to drain after killing the child
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

fn emit(event: &WorkerEvent) -> anyhow::Result<()> {
    let line = event.encode()?;
    let mut out = std::io::stdout().lock();
    writeln!(out, "{line}").context("writing worker event")?;
    out.flush().context("flushing worker events")?;
    Ok(())
}

/// Report the attempt's result, then close its stderr stream.
fn finish(event: &WorkerEvent) -> anyhow::Result<()> {
    emit(event)?;
    let mut err = std::io::stderr().lock();
    writeln!(err, "{ATTEMPT_END}").context("writing attempt end marker")?;
    err.flush().context("flushing worker stderr")?;
    Ok(())
}

/// Serve attempt requests until stdin closes.
pub async fn serve(files: &[TestFile]) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("reading attempt request")? {
        if line.trim().is_empty() {
            continue;
        }
        match AttemptRequest::decode(&line) {
            Ok(request) => run_attempt(files, request).await?,
            Err(e) => {
                error!(error = %e, "Malformed attempt request");
                finish(&WorkerEvent::Failed {
                    error: format!("Error: {e}"),
                    duration_ms: 0,
                })?;
            }
        }
    }
    debug!("Worker input closed");
    Ok(())
}

async fn run_attempt(files: &[TestFile], request: AttemptRequest) -> anyhow::Result<()> {
    emit(&WorkerEvent::Started {
        start_time_ms: chrono::Utc::now().timestamp_millis(),
    })?;
    let started = Instant::now();
    let event = match execute(files, &request).await {
        Ok(()) => WorkerEvent::Completed,
        Err(error) => WorkerEvent::Failed {
            error,
            duration_ms: started.elapsed().as_millis() as u64,
        },
    };
    finish(&event)
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "test body panicked".to_string()
    }
}

async fn wait_for_prompt(terminal: &Terminal) -> bool {
    let deadline = tokio::time::Instant::now() + PROMPT_TIMEOUT;
    loop {
        let grid = terminal.grid(BufferScope::Viewport);
        if grid.text_rows().iter().any(|row| row.contains(SHELL_PROMPT.trim_end())) {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(tt_core::poll::POLL_INTERVAL).await;
    }
}

/// Run one attempt. The error string is what the orchestrator reports.
async fn execute(files: &[TestFile], request: &AttemptRequest) -> Result<(), String> {
    let fail = |e: &dyn std::fmt::Display| format!("Error: {e}");

    let file = files
        .iter()
        .find(|f| f.path == request.source_file)
        .ok_or_else(|| format!("Error: test file {} is not registered", request.source_file))?;
    let project = request.suite(SuiteKind::Project).map_err(|e| fail(&e))?;
    let file_suite = request.suite(SuiteKind::File).map_err(|e| fail(&e))?;
    let (tree, registry) = build_file_tree(&project.title, project.options.clone(), file, file_suite.options.clone());
    let idx = tree
        .find_test(&request.test_id)
        .ok_or_else(|| format!("Error: unknown test id: {}", request.test_id))?;
    let body = registry.get(&request.test_id).map_err(|e| fail(&e))?;
    let case = tree.test(idx);

    let cwd = std::env::current_dir().map_err(|e| fail(&e))?;
    let options = tree.resolved_options(case.suite);
    let hosts_shell = options.program.is_none();
    let recorder = request.trace.then(|| TraceRecorder::new(options.rows, options.columns));
    let mut terminal_options = TerminalOptions::from(options);
    terminal_options.cwd = Some(cwd.clone());
    let terminal = Arc::new(Terminal::spawn(terminal_options, recorder).map_err(|e| fail(&e))?);
    if hosts_shell && !wait_for_prompt(&terminal).await {
        warn!(test = %request.test_id, "Shell prompt did not appear");
    }

    let (snapshot_tx, snapshot_rx) = mpsc::unbounded_channel::<SnapshotRecord>();
    let mut forwarder = tokio::spawn(forward_snapshots(snapshot_rx, emit));
    let store = Arc::new(SnapshotStore::new(cwd.clone(), request.update_snapshots));
    let titles = tree.local_titles(idx);
    let info = TestInfo {
        id: case.id.clone(),
        title: case.title.clone(),
        titles: titles.clone(),
        file: request.source_file.clone(),
        attempt: request.attempt,
    };
    let snapshots = SnapshotContext::new(store, &request.source_file, case.snapshot_base_name(), snapshot_tx);
    let ctx = TestContext::new(
        terminal.clone(),
        Duration::from_millis(request.expect_timeout_ms),
        info,
        snapshots,
    );

    debug!(test = %request.test_id, attempt = request.attempt, "Running test body");
    let outcome = match AssertUnwindSafe(body(ctx)).catch_unwind().await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(format!("Error: {e:#}")),
        Err(payload) => Err(format!("Error: {}", panic_message(payload.as_ref()))),
    };

    // The body owned the last sender, so the forwarder ends once it has drained.
    if tokio::time::timeout(DRAIN_TIMEOUT, &mut forwarder).await.is_err() {
        warn!(test = %request.test_id, "Snapshot results did not drain");
        forwarder.abort();
    }

    let draining = terminal.clone();
    if tokio::time::timeout(DRAIN_TIMEOUT, tokio::task::spawn_blocking(move || draining.shutdown()))
        .await
        .is_err()
    {
        warn!(test = %request.test_id, "Terminal output did not drain");
    }

    if let Some(recorder) = terminal.recorder() {
        let trace = Trace {
            points: recorder.points(),
            test_path: trace_test_path(&request.source_file, case.location.row, case.location.column),
            test_name: titles.clone(),
            attempt: request.attempt,
        };
        let folder = cwd.join(&request.trace_folder);
        let filename = trace_filename(&request.source_file, &titles, request.attempt);
        if let Err(e) = save_trace(&trace, &folder, &filename) {
            warn!(error = %e, "Failed to save trace");
        }
    }

    outcome
}

/// Report each snapshot result as soon as the body produces it.
async fn forward_snapshots<F>(mut records: mpsc::UnboundedReceiver<SnapshotRecord>, mut sink: F)
where
    F: FnMut(&WorkerEvent) -> anyhow::Result<()>,
{
    while let Some(record) = records.recv().await {
        let event = WorkerEvent::Snapshot {
            name: record.name,
            status: record.status,
        };
        if let Err(e) = sink(&event) {
            warn!(error = %e, "Failed to report snapshot");
        }
    }
}

fn trace_test_path(file: &str, row: u32, column: u32) -> Vec<String> {
    let mut path: Vec<String> = Path::new(file)
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();
    path.push(row.to_string());
    path.push(column.to_string());
    path
}

#[cfg(test)]
mod tests {
    use super::*;
    use tt_core::SnapshotStatus;

    #[test]
    fn test_trace_path_splits_components() {
        assert_eq!(
            trace_test_path("./tests/app.rs", 4, 9),
            vec!["tests", "app.rs", "4", "9"]
        );
    }

    #[tokio::test]
    async fn test_snapshots_are_reported_while_the_body_runs() {
        let (tx, rx) = mpsc::unbounded_channel();
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = {
            let seen = seen.clone();
            move |event: &WorkerEvent| -> anyhow::Result<()> {
                seen.lock().unwrap().push(event.clone());
                Ok(())
            }
        };
        let forwarder = tokio::spawn(forward_snapshots(rx, sink));

        tx.send(SnapshotRecord {
            name: "hangs 1".into(),
            status: SnapshotStatus::Written,
        })
        .unwrap();
        // The sender stays alive, as it does while a body hangs after snapshotting
        for _ in 0..100 {
            if !seen.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(
            *seen.lock().unwrap(),
            vec![WorkerEvent::Snapshot {
                name: "hangs 1".into(),
                status: SnapshotStatus::Written,
            }]
        );
        assert!(!forwarder.is_finished());

        drop(tx);
        forwarder.await.unwrap();
    }

    #[test]
    fn test_panic_messages() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn std::any::Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(payload.as_ref()), "owned");
        let payload: Box<dyn std::any::Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(payload.as_ref()), "test body panicked");
    }
}
