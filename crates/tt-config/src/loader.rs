// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! TOML loading

use crate::{ConfigError, ConfigResult};
use serde_json::Value as J;
use std::path::Path;

/// Parse a TOML document into a JSON value for merging.
pub fn parse_toml_to_json(toml_str: &str) -> Result<J, toml::de::Error> {
    let value: toml::Value = toml::from_str(toml_str)?;
    Ok(toml_to_json(value))
}

fn toml_to_json(t: toml::Value) -> J {
    match t {
        toml::Value::String(s) => J::String(s),
        toml::Value::Integer(i) => J::from(i),
        toml::Value::Float(f) => serde_json::Number::from_f64(f).map(J::Number).unwrap_or(J::Null),
        toml::Value::Boolean(b) => J::Bool(b),
        toml::Value::Datetime(d) => J::String(d.to_string()),
        toml::Value::Array(items) => J::Array(items.into_iter().map(toml_to_json).collect()),
        toml::Value::Table(table) => {
            J::Object(table.into_iter().map(|(k, v)| (k, toml_to_json(v))).collect())
        }
    }
}

/// Read a config file into its JSON layer.
pub fn read_layer_from_file(path: &Path) -> ConfigResult<J> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_toml_to_json(&content).map_err(|source| ConfigError::Toml {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nested_tables_become_objects() {
        let json = parse_toml_to_json(
            r#"
            retries = 2
            [expect]
            timeout = 100
            [[projects]]
            name = "bash"
            "#,
        )
        .unwrap();
        assert_eq!(json["retries"], 2);
        assert_eq!(json["expect"]["timeout"], 100);
        assert_eq!(json["projects"][0]["name"], "bash");
    }

    #[test]
    fn test_invalid_toml_is_an_error() {
        assert!(parse_toml_to_json("retries = [").is_err());
    }
}
