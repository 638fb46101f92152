// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! PTY round trips against a real `sh`

#![cfg(unix)]

use std::time::Duration;
use tt_config::{Program, Shell};
use tt_terminal::{BufferScope, ScreenSource, Terminal, TerminalOptions, TraceRecorder};

async fn wait_for_text(term: &Terminal, needle: &str) -> bool {
    for _ in 0..100 {
        let rows = term.grid(BufferScope::Full).text_rows();
        if rows.iter().any(|r| r.contains(needle)) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

#[tokio::test]
async fn test_shell_echo_reaches_screen() {
    let options = TerminalOptions {
        shell: Shell::Sh,
        rows: 10,
        cols: 40,
        ..Default::default()
    };
    let term = Terminal::spawn(options, None).expect("spawn sh");
    term.submit("echo tt-$((20 + 22))").unwrap();
    assert!(wait_for_text(&term, "tt-42").await);
    term.shutdown();
}

#[tokio::test]
async fn test_program_output_is_traced() {
    let options = TerminalOptions {
        program: Some(Program {
            file: "printf".into(),
            args: vec!["traced-output".into()],
        }),
        rows: 5,
        cols: 30,
        ..Default::default()
    };
    let recorder = TraceRecorder::new(5, 30);
    let term = Terminal::spawn(options, Some(recorder.clone())).expect("spawn printf");
    assert!(wait_for_text(&term, "traced-output").await);
    term.shutdown();
    assert_eq!(term.exit_code(), Some(0));

    let bytes: Vec<u8> = recorder
        .points()
        .into_iter()
        .filter_map(|p| match p {
            tt_terminal::TracePoint::Data { data, .. } => Some(data),
            _ => None,
        })
        .flatten()
        .collect();
    assert!(String::from_utf8_lossy(&bytes).contains("traced-output"));
}

#[tokio::test]
async fn test_resize_updates_screen() {
    let options = TerminalOptions {
        shell: Shell::Sh,
        rows: 10,
        cols: 40,
        ..Default::default()
    };
    let term = Terminal::spawn(options, None).expect("spawn sh");
    term.resize(60, 12).unwrap();
    assert_eq!(term.size(), (12, 60));
    assert!(term.resize(0, 12).is_err());
    term.shutdown();
}
