// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Orchestrator-worker protocol
//!
//! The orchestrator writes one [`AttemptRequest`] per line to a worker's
//! stdin. The worker answers on stdout with [`WorkerEvent`] lines, each
//! prefixed with [`EVENT_PREFIX`] so they can be told apart from whatever the
//! test body prints.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tt_config::TestOptions;
use tt_core::{SnapshotStatus, SuiteKind, TestId};

/// Record separator followed by a tag
pub const EVENT_PREFIX: &str = "\u{1e}tui-test:";

/// Written to stderr after an attempt's terminal event. Everything the
/// attempt wrote to stderr precedes it.
pub const ATTEMPT_END: &str = "\u{1e}tui-test:end";

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed protocol message: {0}")]
    Json(#[from] serde_json::Error),
    #[error("attempt request for {0} has no {1} suite")]
    MissingSuite(TestId, &'static str),
}

pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// A suite of the chain leading to a test
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuiteSpec {
    pub kind: SuiteKind,
    pub title: String,
    /// Options with everything above this suite already folded in
    pub options: TestOptions,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRequest {
    pub test_id: TestId,
    /// Project then file
    pub suite_chain: Vec<SuiteSpec>,
    pub source_file: String,
    pub update_snapshots: bool,
    pub attempt: u32,
    pub trace: bool,
    pub trace_folder: PathBuf,
    pub expect_timeout_ms: u64,
}

impl AttemptRequest {
    pub fn suite(&self, kind: SuiteKind) -> ProtocolResult<&SuiteSpec> {
        let name = match kind {
            SuiteKind::Project => "project",
            SuiteKind::File => "file",
            SuiteKind::Describe => "describe",
            SuiteKind::Root => "root",
        };
        self.suite_chain
            .iter()
            .find(|s| s.kind == kind)
            .ok_or_else(|| ProtocolError::MissingSuite(self.test_id.clone(), name))
    }

    pub fn encode(&self) -> ProtocolResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(line: &str) -> ProtocolResult<Self> {
        Ok(serde_json::from_str(line.trim())?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WorkerEvent {
    Started { start_time_ms: i64 },
    Stdout { chunk: String },
    Stderr { chunk: String },
    Snapshot { name: String, status: SnapshotStatus },
    Completed,
    Failed { error: String, duration_ms: u64 },
}

impl WorkerEvent {
    /// `completed` and `failed` end an attempt.
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkerEvent::Completed | WorkerEvent::Failed { .. })
    }

    pub fn encode(&self) -> ProtocolResult<String> {
        Ok(format!("{EVENT_PREFIX}{}", serde_json::to_string(self)?))
    }

    /// Decode a worker stdout line. `Ok(None)` for lines that are not events.
    pub fn decode(line: &str) -> ProtocolResult<Option<Self>> {
        match line.strip_prefix(EVENT_PREFIX) {
            Some(json) => Ok(Some(serde_json::from_str(json.trim_end())?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_lines_are_tagged() {
        let line = WorkerEvent::Snapshot {
            name: "a 1".into(),
            status: SnapshotStatus::Written,
        }
        .encode()
        .unwrap();
        assert_eq!(
            line,
            "\u{1e}tui-test:{\"event\":\"snapshot\",\"name\":\"a 1\",\"status\":\"written\"}"
        );
        assert_eq!(
            WorkerEvent::decode(&line).unwrap(),
            Some(WorkerEvent::Snapshot {
                name: "a 1".into(),
                status: SnapshotStatus::Written
            })
        );
    }

    #[test]
    fn test_plain_output_is_not_an_event() {
        assert_eq!(WorkerEvent::decode("hello from the test").unwrap(), None);
        assert_eq!(
            WorkerEvent::decode("{\"event\":\"completed\"}").unwrap(),
            None
        );
        assert!(WorkerEvent::decode("\u{1e}tui-test:{oops").is_err());
    }

    #[test]
    fn test_terminal_events() {
        assert!(WorkerEvent::Completed.is_terminal());
        assert!(WorkerEvent::Failed {
            error: "e".into(),
            duration_ms: 1
        }
        .is_terminal());
        assert!(!WorkerEvent::Started { start_time_ms: 0 }.is_terminal());
    }

    #[test]
    fn test_request_suite_lookup() {
        let request = AttemptRequest {
            test_id: TestId("t".into()),
            suite_chain: vec![SuiteSpec {
                kind: SuiteKind::Project,
                title: String::new(),
                options: TestOptions::default(),
            }],
            source_file: "a.rs".into(),
            update_snapshots: false,
            attempt: 0,
            trace: false,
            trace_folder: PathBuf::from("tui-traces"),
            expect_timeout_ms: 5000,
        };
        assert!(request.suite(SuiteKind::Project).is_ok());
        assert!(matches!(
            request.suite(SuiteKind::File),
            Err(ProtocolError::MissingSuite(_, "file"))
        ));
        let decoded = AttemptRequest::decode(&request.encode().unwrap()).unwrap();
        assert_eq!(decoded, request);
    }
}
