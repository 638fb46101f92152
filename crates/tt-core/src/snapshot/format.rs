// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! On-disk snapshot document
//!
//! ```text
//! // tui-test snapshot v1
//!
//! snapshot "prompt 1" 3
//! ╭──╮
//! │> │
//! ╰──╯
//!
//! ```
//!
//! Each entry header carries the JSON-escaped name and the number of content
//! lines that follow, so content is stored verbatim.

use std::collections::BTreeMap;

pub const HEADER: &str = "// tui-test snapshot v1";
const ENTRY_PREFIX: &str = "snapshot ";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("line {line}: {message}")]
pub struct ParseError {
    pub line: usize,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotDocument {
    entries: BTreeMap<String, String>,
}

impl SnapshotDocument {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries.get(name).map(String::as_str)
    }

    /// Insert or replace an entry. Content is stored trimmed.
    pub fn insert(&mut self, name: impl Into<String>, content: &str) {
        self.entries.insert(name.into(), content.trim().to_string());
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        self.entries.remove(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn parse(text: &str) -> Result<Self, ParseError> {
        let mut doc = SnapshotDocument::default();
        let mut lines = text.split('\n').enumerate().peekable();
        let error = |line: usize, message: String| ParseError { line: line + 1, message };

        // Blank files are valid empty documents
        while lines.peek().is_some_and(|(_, l)| l.trim().is_empty()) {
            lines.next();
        }
        match lines.next() {
            None => return Ok(doc),
            Some((_, l)) if l.trim_end() == HEADER => {}
            Some((n, l)) => return Err(error(n, format!("expected header `{HEADER}`, found `{l}`"))),
        }

        while let Some((n, line)) = lines.next() {
            if line.trim().is_empty() {
                continue;
            }
            let rest = line
                .strip_prefix(ENTRY_PREFIX)
                .ok_or_else(|| error(n, format!("expected snapshot entry, found `{line}`")))?;
            let (raw_name, raw_count) = rest
                .trim_end()
                .rsplit_once(' ')
                .ok_or_else(|| error(n, "entry header is missing its line count".into()))?;
            let name: String = serde_json::from_str(raw_name)
                .map_err(|e| error(n, format!("invalid snapshot name {raw_name}: {e}")))?;
            let count: usize = raw_count
                .parse()
                .map_err(|_| error(n, format!("invalid line count `{raw_count}`")))?;

            let mut content = Vec::with_capacity(count);
            for _ in 0..count {
                let (_, l) = lines
                    .next()
                    .ok_or_else(|| error(n, format!("snapshot {raw_name} ends before {count} lines")))?;
                content.push(l);
            }
            doc.entries.insert(name, content.join("\n"));
        }
        Ok(doc)
    }

    pub fn serialize(&self) -> String {
        let mut out = String::from(HEADER);
        out.push_str("\n\n");
        for (name, content) in &self.entries {
            let lines: Vec<&str> = if content.is_empty() {
                Vec::new()
            } else {
                content.split('\n').collect()
            };
            // Serializing a string to JSON cannot fail
            let quoted = serde_json::to_string(name).unwrap_or_else(|_| format!("{name:?}"));
            out.push_str(&format!("{ENTRY_PREFIX}{quoted} {}\n", lines.len()));
            for line in lines {
                out.push_str(line);
                out.push('\n');
            }
            out.push('\n');
        }
        out
    }
}
