//! Toolchain configuration
//!
//! Artifact names and compiler settings, loaded from an optional JSON file
//! and then overridden from the environment:
//!
//! - `SANDCC_ARTIFACTS`: directory holding the artifacts
//! - `SANDCC_SHOW_TIMING`: `1`/`true`/`yes` or `0`/`false`/`no`

use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::worker::shared::DEFAULT_CAPACITY;

pub const ENV_ARTIFACTS: &str = "SANDCC_ARTIFACTS";
pub const ENV_SHOW_TIMING: &str = "SANDCC_SHOW_TIMING";

/// Errors loading a configuration file
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Everything the orchestrator needs to know up front
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolchainConfig {
    /// Directory the artifacts are read from
    pub artifact_dir: PathBuf,
    pub memfs: String,
    pub clang: String,
    pub lld: String,
    pub sysroot: String,
    /// Append elapsed times to progress lines
    pub show_timing: bool,
    /// Stack size handed to the linker, in bytes
    pub stack_size: u32,
    /// Compiler builtin header directory inside the sysroot
    pub clang_resource_dir: String,
    /// Capacity of the blocking input region, in bytes
    pub input_capacity: usize,
}

impl Default for ToolchainConfig {
    fn default() -> Self {
        Self {
            artifact_dir: PathBuf::from("."),
            memfs: "memfs.wasm".to_string(),
            clang: "clang.wasm".to_string(),
            lld: "lld.wasm".to_string(),
            sysroot: "sysroot.tar".to_string(),
            show_timing: false,
            stack_size: 1024 * 1024,
            clang_resource_dir: "/lib/clang/8.0.1/include".to_string(),
            input_capacity: DEFAULT_CAPACITY,
        }
    }
}

impl ToolchainConfig {
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&text)
    }

    /// Apply `SANDCC_*` overrides from the process environment
    pub fn with_env(self) -> Self {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(dir) = lookup(ENV_ARTIFACTS) {
            self.artifact_dir = PathBuf::from(dir);
        }
        if let Some(value) = lookup(ENV_SHOW_TIMING) {
            match value.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" => self.show_timing = true,
                "0" | "false" | "no" => self.show_timing = false,
                other => {
                    tracing::warn!(value = other, "ignoring unrecognised {}", ENV_SHOW_TIMING)
                }
            }
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ToolchainConfig::default();
        assert_eq!(config.clang, "clang.wasm");
        assert_eq!(config.stack_size, 1_048_576);
        assert_eq!(config.input_capacity, 64 * 1024);
        assert!(!config.show_timing);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = ToolchainConfig::from_json(r#"{"clang": "clang-8.wasm", "show_timing": true}"#)
            .unwrap();
        assert_eq!(config.clang, "clang-8.wasm");
        assert!(config.show_timing);
        assert_eq!(config.lld, "lld.wasm");
    }

    #[test]
    fn test_invalid_json() {
        assert!(matches!(
            ToolchainConfig::from_json("{"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sandcc.json");
        std::fs::write(&path, r#"{"sysroot": "root.tar"}"#).unwrap();
        assert_eq!(ToolchainConfig::from_file(&path).unwrap().sysroot, "root.tar");
        assert!(matches!(
            ToolchainConfig::from_file(&dir.path().join("missing.json")),
            Err(ConfigError::Io { .. })
        ));
    }

    #[test]
    fn test_overrides() {
        let config = ToolchainConfig::default().with_overrides(|key| match key {
            ENV_ARTIFACTS => Some("/opt/sandcc".to_string()),
            ENV_SHOW_TIMING => Some("Yes".to_string()),
            _ => None,
        });
        assert_eq!(config.artifact_dir, PathBuf::from("/opt/sandcc"));
        assert!(config.show_timing);

        let config = config.with_overrides(|key| {
            (key == ENV_SHOW_TIMING).then(|| "maybe".to_string())
        });
        assert!(config.show_timing);
    }
}
