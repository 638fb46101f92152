// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! JSON layer merging

use serde_json::Value as J;

/// Merge `layer` over `base`.
///
/// Objects merge recursively, arrays and scalars replace, null keeps the base.
pub fn merge_two_json(base: &mut J, layer: J) {
    match (base, layer) {
        (J::Object(a), J::Object(b)) => {
            for (k, v) in b {
                merge_two_json(a.entry(k).or_insert(J::Null), v);
            }
        }
        (_, J::Null) => {}
        (a, b) => *a = b,
    }
}

/// Rewrite every object key with `f`, recursively.
pub fn rename_keys(value: J, f: &impl Fn(&str) -> String) -> J {
    match value {
        J::Object(map) => J::Object(
            map.into_iter()
                .map(|(k, v)| (f(&k), rename_keys(v, f)))
                .collect(),
        ),
        J::Array(items) => J::Array(items.into_iter().map(|v| rename_keys(v, f)).collect()),
        other => other,
    }
}
