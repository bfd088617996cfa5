//! Configuration loading and schema definitions for lth.
//!
//! Configuration lives in a TOML file, `lth.toml` by default. The file is
//! optional: every field has a default, and [`load_config_or_default`] falls
//! back to [`Config::default`] when the file does not exist.

pub mod schema;

pub use schema::*;

use std::path::Path;

use anyhow::{Context, Result};

/// Loads configuration from a TOML file.
///
/// # Errors
///
/// Returns an error if:
/// - The file cannot be read (e.g., doesn't exist or permission denied)
/// - The file contains invalid TOML syntax
/// - The configuration doesn't match the expected schema
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    Ok(config)
}

/// Loads configuration from a TOML file, or returns the defaults if the
/// file does not exist.
///
/// A file that exists but cannot be parsed is still an error.
pub fn load_config_or_default(path: &Path) -> Result<Config> {
    if !path.exists() {
        tracing::debug!(
            "No config file at {}, using defaults",
            path.display()
        );
        return Ok(Config::default());
    }
    load_config(path)
}

/// Loads configuration from a TOML string.
///
/// # Example
///
/// ```
/// use lambda_harness::config::load_config_str;
///
/// let config = load_config_str(r#"
///     [harness]
///     max_parallel = 8
///
///     [test]
///     command = "npm run test:ci"
/// "#)?;
///
/// assert_eq!(config.harness.max_parallel, 8);
/// assert_eq!(config.test.command, "npm run test:ci");
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config_str(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).context("Failed to parse config")?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = load_config_str("").unwrap();

        assert_eq!(config.harness.max_parallel, 4);
        assert_eq!(config.harness.run_timeout_secs, 600);
        assert_eq!(config.harness.cleanup_timeout_secs, 60);
        assert!(config.harness.persist_ledger);
        assert_eq!(config.runtime.code_mount, "/var/task");
        assert_eq!(config.runtime.keep_alive, vec!["sleep", "infinity"]);
        assert_eq!(config.analyzer.program, "bun");
        assert_eq!(config.test.command, "npm test");
        assert!(!config.report.junit);

        let ids: Vec<&str> = config.variants.iter().map(|v| v.id.as_str()).collect();
        assert_eq!(ids, vec!["nodejs:20", "nodejs:22", "nodejs:24"]);
    }

    #[test]
    fn test_partial_sections_keep_field_defaults() {
        let config = load_config_str(
            r#"
            [harness]
            run_timeout_secs = 30

            [runtime]
            network_mode = "none"

            [[variants]]
            id = "custom"
            image = "registry.local/node:lts"
            "#,
        )
        .unwrap();

        assert_eq!(config.harness.run_timeout_secs, 30);
        assert_eq!(config.harness.max_parallel, 4);
        assert_eq!(config.runtime.network_mode, "none");
        assert_eq!(config.runtime.code_mount, "/var/task");
        assert_eq!(config.variants.len(), 1);
        assert_eq!(config.variants[0].image, "registry.local/node:lts");
    }

    #[test]
    fn test_invalid_config_is_an_error() {
        assert!(load_config_str("[harness]\nmax_parallel = \"many\"").is_err());
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config_or_default(&dir.path().join("lth.toml")).unwrap();
        assert_eq!(config.harness.max_parallel, 4);
    }

    #[test]
    fn test_load_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lth.toml");
        std::fs::write(&path, "[analyzer]\nenabled = false\n").unwrap();

        let config = load_config_or_default(&path).unwrap();
        assert!(!config.analyzer.enabled);
    }
}
