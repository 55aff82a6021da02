//! Configuration file loading.
//!
//! ## Responsibility
//! Read a TOML file from disk, parse it into an [`EngineConfig`], and run
//! validation before returning. This is the primary entry point for loading
//! engine configuration at startup.
//!
//! ## Guarantees
//! - A successfully loaded config is always validated
//! - I/O errors and parse errors are distinguished in the error type
//! - File path is included in every error message
//!
//! ## NOT Responsible For
//! - Defining the config schema (that belongs to `mod.rs`)

use std::path::Path;

use super::validation::{self, ConfigError};
use super::EngineConfig;

/// Load an [`EngineConfig`] from a TOML file.
///
/// Reads the file, parses it as TOML, and validates all semantic
/// constraints.
///
/// # Errors
///
/// - `ConfigError::Io` if the file cannot be read.
/// - `ConfigError::Parse` if the TOML is malformed.
/// - `ConfigError::Validation` if semantic constraints are violated.
pub fn load_from_file(path: &Path) -> Result<EngineConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
        file: path.display().to_string(),
        source: e,
    })?;

    load_from_str(&content, &path.display().to_string())
}

/// Load an [`EngineConfig`] from a TOML string.
///
/// Useful for testing or embedding configs without file I/O.
///
/// # Arguments
///
/// * `content` — TOML content as a string.
/// * `source_name` — Identifier for the source (used in error messages).
///
/// # Errors
///
/// - `ConfigError::Parse` if the TOML is malformed.
/// - `ConfigError::Validation` if semantic constraints are violated.
pub fn load_from_str(content: &str, source_name: &str) -> Result<EngineConfig, ConfigError> {
    let config: EngineConfig = toml::from_str(content).map_err(|e| ConfigError::Parse {
        file: source_name.to_string(),
        source: e,
    })?;

    validation::validate(&config).map_err(|errors| {
        ConfigError::Validation(
            errors
                .iter()
                .map(|e| e.to_string())
                .collect::<Vec<_>>()
                .join("\n"),
        )
    })?;

    Ok(config)
}
