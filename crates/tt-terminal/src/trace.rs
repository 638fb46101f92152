// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

// Attempt traces: time-stamped PTY output and resizes, stored as
// Brotli-compressed JSON

use crate::screen::VirtualScreen;
use brotli::enc::BrotliEncoderParams;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::debug;

const TRACE_BROTLI_QUALITY: i32 = 5;

#[derive(Debug, thiserror::Error)]
pub enum TraceError {
    #[error("trace file {0} not found")]
    NotFound(PathBuf),
    #[error("trace I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed trace: {0}")]
    Format(#[from] serde_json::Error),
    #[error("trace has no size record")]
    MissingSize,
}

pub type TraceResult<T> = Result<T, TraceError>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TracePoint {
    /// Output bytes, `time_ms` after recording started
    Data { time_ms: u64, data: Vec<u8> },
    Size { rows: u16, cols: u16 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trace {
    pub points: Vec<TracePoint>,
    /// Test file path components followed by row and column
    pub test_path: Vec<String>,
    /// Describe titles followed by the test title
    pub test_name: Vec<String>,
    pub attempt: u32,
}

/// Shared sink the PTY reader thread appends to
#[derive(Clone)]
pub struct TraceRecorder {
    started: Instant,
    points: Arc<Mutex<Vec<TracePoint>>>,
}

impl TraceRecorder {
    pub fn new(rows: u16, cols: u16) -> Self {
        Self {
            started: Instant::now(),
            points: Arc::new(Mutex::new(vec![TracePoint::Size { rows, cols }])),
        }
    }

    pub fn record_output(&self, data: &[u8]) {
        let time_ms = self.started.elapsed().as_millis() as u64;
        self.push(TracePoint::Data {
            time_ms,
            data: data.to_vec(),
        });
    }

    pub fn record_resize(&self, rows: u16, cols: u16) {
        self.push(TracePoint::Size { rows, cols });
    }

    pub fn points(&self) -> Vec<TracePoint> {
        self.points.lock().map(|p| p.clone()).unwrap_or_default()
    }

    fn push(&self, point: TracePoint) {
        if let Ok(mut points) = self.points.lock() {
            points.push(point);
        }
    }
}

/// File name for a trace: the test file path, then its titles, then the
/// retry suffix, with path and shell-unsafe characters replaced by `-`.
pub fn trace_filename(file: &str, titles: &[String], attempt: u32) -> String {
    let retry = if attempt > 0 {
        format!("-retry{attempt}")
    } else {
        String::new()
    };
    let name = format!("{}-{}{}", file, titles.join("-"), retry);
    name.chars()
        .map(|c| match c {
            ' ' | '/' | '\\' | '<' | '>' | ':' | '"' | '\'' | '|' | '?' | '*' => '-',
            c => c,
        })
        .collect()
}

pub fn save_trace(trace: &Trace, folder: &Path, filename: &str) -> TraceResult<PathBuf> {
    std::fs::create_dir_all(folder)?;
    let json = serde_json::to_vec(trace)?;
    let params = BrotliEncoderParams {
        quality: TRACE_BROTLI_QUALITY,
        ..Default::default()
    };
    let mut compressed = Vec::new();
    brotli::BrotliCompress(&mut &json[..], &mut compressed, &params)?;

    let path = folder.join(filename);
    std::fs::write(&path, compressed)?;
    debug!(path = %path.display(), points = trace.points.len(), "Saved trace");
    Ok(path)
}

pub fn load_trace(path: &Path) -> TraceResult<Trace> {
    if !path.exists() {
        return Err(TraceError::NotFound(path.to_path_buf()));
    }
    let compressed = std::fs::read(path)?;
    let mut json = Vec::new();
    brotli::BrotliDecompress(&mut &compressed[..], &mut json)?;
    Ok(serde_json::from_slice(&json)?)
}

/// Feed a trace through a fresh screen and return the final state.
pub fn replay(trace: &Trace) -> TraceResult<VirtualScreen> {
    let (rows, cols) = trace
        .points
        .iter()
        .find_map(|p| match p {
            TracePoint::Size { rows, cols } => Some((*rows, *cols)),
            _ => None,
        })
        .ok_or(TraceError::MissingSize)?;

    let screen = VirtualScreen::new(rows, cols);
    let mut seen_size = false;
    for point in &trace.points {
        match point {
            TracePoint::Data { data, .. } => screen.process(data),
            TracePoint::Size { rows, cols } => {
                if seen_size {
                    screen.resize(*rows, *cols);
                }
                seen_size = true;
            }
        }
    }
    Ok(screen)
}

/// Write trace output to `out` with the recorded timing scaled by `speed`.
pub async fn play<W: Write>(trace: &Trace, out: &mut W, speed: f64) -> TraceResult<()> {
    let speed = if speed > 0.0 { speed } else { 1.0 };
    let mut last = 0u64;
    for point in &trace.points {
        if let TracePoint::Data { time_ms, data } = point {
            let delay = time_ms.saturating_sub(last);
            last = *time_ms;
            if delay > 0 {
                tokio::time::sleep(Duration::from_secs_f64(delay as f64 / 1000.0 / speed)).await;
            }
            out.write_all(data)?;
            out.flush()?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::screen::{BufferScope, ScreenSource};

    fn sample() -> Trace {
        let recorder = TraceRecorder::new(2, 10);
        recorder.record_output(b"hi");
        recorder.record_resize(3, 12);
        recorder.record_output(b"\r\nthere");
        Trace {
            points: recorder.points(),
            test_path: vec!["tests".into(), "demo.rs".into(), "10".into(), "5".into()],
            test_name: vec!["greets".into()],
            attempt: 0,
        }
    }

    #[test]
    fn test_filename_sanitizes() {
        let name = trace_filename("tests/demo.rs", &["group".into(), "say \"hi\"?".into()], 2);
        assert_eq!(name, "tests-demo.rs-group-say--hi---retry2");
        assert_eq!(trace_filename("a.rs", &["t".into()], 0), "a.rs-t");
    }

    #[test]
    fn test_save_load_and_replay() {
        let dir = tempfile::tempdir().unwrap();
        let trace = sample();
        let path = save_trace(&trace, &dir.path().join("traces"), "demo").unwrap();
        let loaded = load_trace(&path).unwrap();
        assert_eq!(loaded, trace);

        let screen = replay(&loaded).unwrap();
        assert_eq!(screen.size(), (3, 12));
        let rows = screen.grid(BufferScope::Viewport).text_rows();
        assert_eq!(rows[0].trim_end(), "hi");
        assert_eq!(rows[1].trim_end(), "there");
    }

    #[test]
    fn test_missing_trace() {
        let err = load_trace(Path::new("/nonexistent/trace")).unwrap_err();
        assert!(matches!(err, TraceError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_play_writes_all_output() {
        let mut out = Vec::new();
        play(&sample(), &mut out, 100.0).await.unwrap();
        assert_eq!(out, b"hi\r\nthere");
    }
}
