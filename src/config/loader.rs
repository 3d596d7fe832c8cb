use std::path::{Path, PathBuf};

use crate::config::types::TaskboxConfig;
use crate::error::{Result, TaskboxError};

/// Get the default configuration file path
pub fn get_config_path() -> PathBuf {
    if let Some(proj_dirs) = directories::ProjectDirs::from("com", "taskbox", "taskbox") {
        proj_dirs.config_dir().join("config.toml")
    } else {
        // Fallback to home directory
        dirs_fallback().join(".taskbox").join("config.toml")
    }
}

fn dirs_fallback() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
}

/// Load configuration from file, with defaults for missing values.
///
/// An explicitly requested file must exist; the default location may be absent.
pub fn load_config(config_path: Option<&Path>) -> Result<TaskboxConfig> {
    let explicit = config_path.is_some();
    let path = config_path
        .map(PathBuf::from)
        .unwrap_or_else(get_config_path);

    if !path.exists() {
        if explicit {
            return Err(TaskboxError::ConfigNotFound {
                path: path.display().to_string(),
            });
        }
        return Ok(TaskboxConfig::default());
    }

    let content = std::fs::read_to_string(&path)?;
    let config: TaskboxConfig =
        toml::from_str(&content).map_err(|e| TaskboxError::TomlParse(e.to_string()))?;
    config.validate()?;

    Ok(config)
}

/// Get the data directory for sandbox records
pub fn get_data_dir() -> PathBuf {
    if let Some(proj_dirs) = directories::ProjectDirs::from("com", "taskbox", "taskbox") {
        proj_dirs.data_dir().to_path_buf()
    } else {
        dirs_fallback().join(".local").join("share").join("taskbox")
    }
}

/// Directory holding persisted sandbox records.
pub fn get_store_dir(config: &TaskboxConfig) -> PathBuf {
    config
        .store
        .dir
        .clone()
        .unwrap_or_else(|| get_data_dir().join("sandboxes"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_explicit_config_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        let err = load_config(Some(&missing)).unwrap_err();
        assert!(matches!(err, TaskboxError::ConfigNotFound { .. }));
    }

    #[test]
    fn test_load_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[engine]\ncontainer_prefix = \"ci-box\"\n[store]\ndir = \"/tmp/records\"\n",
        )
        .unwrap();

        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.engine.container_prefix, "ci-box");
        assert_eq!(get_store_dir(&config), PathBuf::from("/tmp/records"));
    }

    #[test]
    fn test_invalid_toml_reports_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[engine\n").unwrap();
        let err = load_config(Some(&path)).unwrap_err();
        assert!(matches!(err, TaskboxError::TomlParse(_)));
    }
}
