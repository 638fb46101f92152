// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Environment variable overlay
//!
//! `TUI_TEST_RETRIES=2` sets `retries`, `TUI_TEST_GLOBAL_TIMEOUT` sets
//! `global-timeout` and a double underscore descends into a table, so
//! `TUI_TEST_EXPECT__TIMEOUT=100` sets `expect.timeout`.

use crate::merge::rename_keys;
use crate::ConfigResult;
use serde_json::Value as J;

pub const ENV_PREFIX: &str = "TUI_TEST";

/// Overlay built from the process environment.
pub fn env_overlay() -> ConfigResult<J> {
    build_overlay(None)
}

/// Overlay built from an explicit variable set instead of the process environment.
pub fn env_overlay_from<I, K, V>(vars: I) -> ConfigResult<J>
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<String>,
{
    let map: config::Map<String, String> =
        vars.into_iter().map(|(k, v)| (k.into(), v.into())).collect();
    build_overlay(Some(map))
}

fn build_overlay(source: Option<config::Map<String, String>>) -> ConfigResult<J> {
    let built = config::Config::builder()
        .add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true)
                .source(source),
        )
        .build()?;

    let map = built.try_deserialize::<serde_json::Map<String, J>>()?;
    Ok(rename_keys(J::Object(map), &|k| k.replace('_', "-")))
}
