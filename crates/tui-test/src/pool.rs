// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Worker pool
//!
//! [`ProcessPool`] re-executes the test binary with the hidden `worker`
//! subcommand. A semaphore bounds how many attempts run at once. Workers that
//! finish an attempt cleanly go back to the idle list; a worker whose attempt
//! is abandoned (timeout, crash, cancellation) is killed.

use crate::protocol::{AttemptRequest, ProtocolError, WorkerEvent, ATTEMPT_END};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, trace, warn};

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("failed to spawn worker process {program}: {source}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("worker I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("worker process exited before the attempt finished{}", .status.map(|s| format!(" (exit code {s})")).unwrap_or_default())]
    Crashed { status: Option<i32> },
    #[error("worker pool has been terminated")]
    Terminated,
}

pub type PoolResult<T> = Result<T, PoolError>;

/// How long stderr may trail the result before the worker is given up on
const STDERR_GRACE: Duration = Duration::from_secs(1);

/// Runs attempts in isolated workers
#[async_trait]
pub trait WorkerPool: Send + Sync {
    /// Upper bound on concurrently running attempts.
    fn size(&self) -> usize;

    /// Run one attempt, forwarding every event (including the terminal one)
    /// to `events`. Dropping the returned future abandons the attempt and
    /// kills its worker.
    async fn run(&self, request: AttemptRequest, events: mpsc::UnboundedSender<WorkerEvent>) -> PoolResult<()>;

    /// Kill every idle and in-flight worker; later runs fail.
    async fn terminate(&self);
}

/// How to start a worker process
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl WorkerCommand {
    /// The current executable with the `worker` subcommand.
    pub fn current_exe(extra_args: Vec<String>) -> std::io::Result<Self> {
        let mut args = vec!["worker".to_string()];
        args.extend(extra_args);
        Ok(Self {
            program: std::env::current_exe()?,
            args,
        })
    }
}

enum WorkerLine {
    Stdout(String),
    Stderr(String),
}

struct WorkerProcess {
    id: u64,
    child: Arc<Mutex<Child>>,
    stdin: ChildStdin,
    lines: mpsc::UnboundedReceiver<WorkerLine>,
}

impl WorkerProcess {
    fn kill(&self) {
        if let Ok(mut child) = self.child.lock() {
            if let Err(e) = child.start_kill() {
                trace!(worker = self.id, error = %e, "Worker already gone");
            }
        }
    }

    fn exit_status(&self) -> Option<i32> {
        let mut child = self.child.lock().ok()?;
        child.try_wait().ok().flatten().and_then(|s| s.code())
    }
}

type LiveMap = Mutex<HashMap<u64, Arc<Mutex<Child>>>>;

pub struct ProcessPool {
    command: WorkerCommand,
    size: usize,
    slots: Arc<Semaphore>,
    idle: Mutex<Vec<WorkerProcess>>,
    live: LiveMap,
    next_id: AtomicU64,
    closed: AtomicBool,
}

/// A worker checked out for one attempt. Unless handed back, it is killed on drop.
struct Checkout<'a> {
    pool: &'a ProcessPool,
    worker: Option<WorkerProcess>,
}

impl Checkout<'_> {
    fn worker(&mut self) -> PoolResult<&mut WorkerProcess> {
        self.worker.as_mut().ok_or(PoolError::Terminated)
    }

    fn give_back(mut self) {
        if let Some(worker) = self.worker.take() {
            self.pool.park(worker);
        }
    }
}

impl Drop for Checkout<'_> {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            debug!(worker = worker.id, "Discarding worker");
            self.pool.discard(&worker);
        }
    }
}

impl ProcessPool {
    pub fn new(command: WorkerCommand, size: usize) -> Self {
        let size = size.max(1);
        Self {
            command,
            size,
            slots: Arc::new(Semaphore::new(size)),
            idle: Mutex::new(Vec::new()),
            live: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    fn spawn_worker(&self) -> PoolResult<WorkerProcess> {
        let mut child = Command::new(&self.command.program)
            .args(&self.command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| PoolError::Spawn {
                program: self.command.program.clone(),
                source,
            })?;

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let stdin = child.stdin.take().ok_or(PoolError::Crashed { status: None })?;
        let stdout = child.stdout.take().ok_or(PoolError::Crashed { status: None })?;
        let stderr = child.stderr.take().ok_or(PoolError::Crashed { status: None })?;

        let (tx, lines) = mpsc::unbounded_channel();
        let out_tx = tx.clone();
        tokio::spawn(async move {
            let mut reader = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = reader.next_line().await {
                if out_tx.send(WorkerLine::Stdout(line)).is_err() {
                    break;
                }
            }
        });
        tokio::spawn(async move {
            let mut reader = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = reader.next_line().await {
                if tx.send(WorkerLine::Stderr(line)).is_err() {
                    break;
                }
            }
        });

        let child = Arc::new(Mutex::new(child));
        if let Ok(mut live) = self.live.lock() {
            live.insert(id, child.clone());
        }
        debug!(worker = id, program = %self.command.program.display(), "Spawned worker");
        Ok(WorkerProcess {
            id,
            child,
            stdin,
            lines,
        })
    }

    fn checkout(&self) -> PoolResult<Checkout<'_>> {
        let parked = self.idle.lock().ok().and_then(|mut idle| idle.pop());
        let worker = match parked {
            Some(worker) => {
                trace!(worker = worker.id, "Reusing idle worker");
                worker
            }
            None => self.spawn_worker()?,
        };
        Ok(Checkout {
            pool: self,
            worker: Some(worker),
        })
    }

    fn park(&self, worker: WorkerProcess) {
        if self.closed.load(Ordering::SeqCst) {
            self.discard(&worker);
            return;
        }
        if let Ok(mut idle) = self.idle.lock() {
            idle.push(worker);
        }
    }

    fn discard(&self, worker: &WorkerProcess) {
        worker.kill();
        if let Ok(mut live) = self.live.lock() {
            live.remove(&worker.id);
        }
    }
}

#[async_trait]
impl WorkerPool for ProcessPool {
    fn size(&self) -> usize {
        self.size
    }

    async fn run(&self, request: AttemptRequest, events: mpsc::UnboundedSender<WorkerEvent>) -> PoolResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PoolError::Terminated);
        }
        let _permit = self
            .slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| PoolError::Terminated)?;

        let mut checkout = self.checkout()?;
        let worker = checkout.worker()?;
        let mut line = request.encode()?;
        line.push('\n');
        worker.stdin.write_all(line.as_bytes()).await?;
        worker.stdin.flush().await?;
        debug!(worker = worker.id, test = %request.test_id, attempt = request.attempt, "Dispatched attempt");

        // An attempt is over once its result arrived on stdout and its end
        // marker on stderr; only then is the worker clean to reuse.
        let mut result_seen = false;
        let mut stderr_ended = false;
        loop {
            let next = if result_seen {
                match tokio::time::timeout(STDERR_GRACE, worker.lines.recv()).await {
                    Ok(next) => next,
                    Err(_) => {
                        debug!(worker = worker.id, "Worker stderr did not settle");
                        return Ok(());
                    }
                }
            } else {
                worker.lines.recv().await
            };
            let Some(line) = next else {
                if result_seen {
                    return Ok(());
                }
                let status = worker.exit_status();
                return Err(PoolError::Crashed { status });
            };
            let event = match line {
                WorkerLine::Stderr(text) if text == ATTEMPT_END => {
                    stderr_ended = true;
                    if result_seen {
                        break;
                    }
                    continue;
                }
                WorkerLine::Stderr(text) => WorkerEvent::Stderr { chunk: text + "\n" },
                WorkerLine::Stdout(text) => match WorkerEvent::decode(&text) {
                    Ok(Some(event)) => event,
                    Ok(None) => WorkerEvent::Stdout { chunk: text + "\n" },
                    Err(e) => {
                        warn!(worker = worker.id, error = %e, "Unreadable worker event");
                        WorkerEvent::Stdout { chunk: text + "\n" }
                    }
                },
            };
            result_seen |= event.is_terminal();
            if events.send(event).is_err() {
                // Nobody is listening for this attempt any more
                return Err(PoolError::Terminated);
            }
            if result_seen && stderr_ended {
                break;
            }
        }

        checkout.give_back();
        Ok(())
    }

    async fn terminate(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.slots.close();
        if let Ok(mut idle) = self.idle.lock() {
            idle.clear();
        }
        let live: Vec<Arc<Mutex<Child>>> = self
            .live
            .lock()
            .map(|mut live| live.drain().map(|(_, child)| child).collect())
            .unwrap_or_default();
        for child in live {
            if let Ok(mut child) = child.lock() {
                if let Err(e) = child.start_kill() {
                    debug!(error = %e, "Failed to kill worker on terminate");
                }
            }
        }
        debug!("Worker pool terminated");
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::protocol::{ATTEMPT_END, EVENT_PREFIX};
    use tt_core::TestId;

    fn sh(script: String) -> WorkerCommand {
        WorkerCommand {
            program: PathBuf::from("sh"),
            args: vec!["-c".into(), script],
        }
    }

    fn request(attempt: u32) -> AttemptRequest {
        AttemptRequest {
            test_id: TestId("a.rs:1:1 › t".into()),
            suite_chain: Vec::new(),
            source_file: "a.rs".into(),
            update_snapshots: false,
            attempt,
            trace: false,
            trace_folder: PathBuf::from("tui-traces"),
            expect_timeout_ms: 5000,
        }
    }

    async fn run(pool: &ProcessPool, attempt: u32) -> (PoolResult<()>, Vec<WorkerEvent>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let result = pool.run(request(attempt), tx).await;
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        (result, events)
    }

    #[tokio::test]
    async fn test_events_are_forwarded_and_workers_reused() {
        let script = format!(
            "while read -r line; do echo plain; echo '{EVENT_PREFIX}{{\"event\":\"started\",\"start_time_ms\":1}}'; echo '{EVENT_PREFIX}{{\"event\":\"completed\"}}'; echo '{ATTEMPT_END}' >&2; done"
        );
        let pool = ProcessPool::new(sh(script), 1);
        for attempt in 0..2 {
            let (result, events) = run(&pool, attempt).await;
            result.unwrap();
            assert_eq!(
                events,
                vec![
                    WorkerEvent::Stdout { chunk: "plain\n".into() },
                    WorkerEvent::Started { start_time_ms: 1 },
                    WorkerEvent::Completed,
                ]
            );
        }
        assert_eq!(pool.next_id.load(Ordering::SeqCst), 1);
        pool.terminate().await;
        assert!(matches!(run(&pool, 2).await.0, Err(PoolError::Terminated)));
    }

    #[tokio::test]
    async fn test_late_stderr_stays_with_its_attempt() {
        let script = format!(
            "n=0; while read -r line; do n=$((n+1)); echo '{EVENT_PREFIX}{{\"event\":\"completed\"}}'; sleep 0.2; echo \"late $n\" >&2; echo '{ATTEMPT_END}' >&2; done"
        );
        let pool = ProcessPool::new(sh(script), 1);
        for attempt in 0..2 {
            let (result, events) = run(&pool, attempt).await;
            result.unwrap();
            assert_eq!(
                events,
                vec![
                    WorkerEvent::Completed,
                    WorkerEvent::Stderr {
                        chunk: format!("late {}\n", attempt + 1)
                    },
                ]
            );
        }
        assert_eq!(pool.next_id.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_worker_without_end_marker_is_not_reused() {
        let script = format!("while read -r line; do echo '{EVENT_PREFIX}{{\"event\":\"completed\"}}'; done");
        let pool = ProcessPool::new(sh(script), 1);
        for attempt in 0..2 {
            let (result, events) = run(&pool, attempt).await;
            result.unwrap();
            assert_eq!(events, vec![WorkerEvent::Completed]);
        }
        assert_eq!(pool.next_id.load(Ordering::SeqCst), 2);
        assert!(pool.idle.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_exit_without_result_is_a_crash() {
        let pool = ProcessPool::new(sh("read -r line; echo oops >&2; exit 3".into()), 1);
        let (result, events) = run(&pool, 0).await;
        assert!(matches!(result, Err(PoolError::Crashed { .. })));
        assert_eq!(events, vec![WorkerEvent::Stderr { chunk: "oops\n".into() }]);
        assert!(pool.idle.lock().unwrap().is_empty());
    }
}
