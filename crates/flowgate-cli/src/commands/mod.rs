//! CLI command implementations.
//!
//! Each submodule corresponds to a top-level CLI command and drives the
//! flowgate-core engine through `AppState`.

pub mod server;
pub mod workflow;

use std::collections::HashMap;
use std::sync::Arc;

use flowgate_core::state::{AppState, AppStateInner};
use flowgate_core::{Database, EngineConfig};

/// Load the engine configuration; `db_path` overrides the file's `db_path`.
pub fn load_config(config_path: Option<&str>, db_path: Option<&str>) -> Result<EngineConfig, String> {
    let mut config = match config_path {
        Some(path) => EngineConfig::from_file(path).map_err(|e| e.to_string())?,
        None => EngineConfig::default(),
    };
    if let Some(db_path) = db_path {
        config.db_path = db_path.to_string();
    }
    Ok(config)
}

/// Open the database and restore registered tool servers.
pub async fn init_state(config: EngineConfig) -> Result<AppState, String> {
    let db = Database::open(&config.db_path)
        .map_err(|e| format!("Failed to open database '{}': {}", config.db_path, e))?;
    let state: AppState = Arc::new(AppStateInner::new(db, config));
    state.start().await.map_err(|e| e.to_string())?;
    Ok(state)
}

/// Pretty-print a JSON value to stdout.
pub fn print_json(value: &serde_json::Value) {
    println!(
        "{}",
        serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
    );
}

/// Serialise then pretty-print.
pub fn print_serialized<T: serde::Serialize>(value: &T) -> Result<(), String> {
    let value = serde_json::to_value(value).map_err(|e| e.to_string())?;
    print_json(&value);
    Ok(())
}

/// Parse repeated `KEY=VALUE` arguments.
pub fn parse_pairs(pairs: &[String]) -> Result<HashMap<String, String>, String> {
    pairs
        .iter()
        .map(|pair| match pair.split_once('=') {
            Some((key, value)) if !key.trim().is_empty() => {
                Ok((key.trim().to_string(), value.to_string()))
            }
            _ => Err(format!("Expected KEY=VALUE, got '{}'", pair)),
        })
        .collect()
}

/// Parse a JSON argument, naming the flag on failure.
pub fn parse_json_arg(flag: &str, raw: &str) -> Result<serde_json::Value, String> {
    serde_json::from_str(raw).map_err(|e| format!("Invalid JSON for --{}: {}", flag, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pairs() {
        let parsed = parse_pairs(&["A=1".to_string(), "TOKEN=x=y".to_string()]).unwrap();
        assert_eq!(parsed["A"], "1");
        assert_eq!(parsed["TOKEN"], "x=y");
        assert!(parse_pairs(&["novalue".to_string()]).is_err());
        assert!(parse_pairs(&["=v".to_string()]).is_err());
    }

    #[test]
    fn test_db_flag_overrides_config() {
        let config = load_config(None, Some("/tmp/other.db")).unwrap();
        assert_eq!(config.db_path, "/tmp/other.db");
        assert_eq!(load_config(None, None).unwrap().db_path, "flowgate.db");
    }
}
