pub mod schema;

pub use schema::{AutomationConfig, Role};

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Config file name inside the home directory.
pub const CONFIG_FILE: &str = "automation.toml";

/// Default home directory (~/.policy-automaton).
pub fn default_home_dir() -> PathBuf {
    directories::BaseDirs::new()
        .map(|d| d.home_dir().join(".policy-automaton"))
        .unwrap_or_else(|| PathBuf::from(".policy-automaton"))
}

/// Load config from the given path, or return defaults.
pub fn load_config(path: &Path) -> Result<AutomationConfig> {
    if path.exists() {
        let contents =
            std::fs::read_to_string(path).context("Failed to read automation config file")?;
        let config: AutomationConfig =
            toml::from_str(&contents).context("Failed to parse automation config (TOML)")?;
        Ok(config)
    } else {
        Ok(AutomationConfig::default())
    }
}

/// Save config to the given path (TOML format).
pub fn save_config(config: &AutomationConfig, path: &Path) -> Result<()> {
    let contents = toml::to_string_pretty(config).context("Failed to serialize config")?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, contents).context("Failed to write config file")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = load_config(&dir.path().join(CONFIG_FILE)).unwrap();
        assert_eq!(cfg.role, Role::Plugin);
        assert_eq!(cfg.queue_name, "default_queue");
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(CONFIG_FILE);
        let cfg = AutomationConfig {
            role: Role::Verifier,
            token_secret: "s3cret".into(),
            ..Default::default()
        };
        save_config(&cfg, &path).unwrap();

        let loaded = load_config(&path).unwrap();
        assert_eq!(loaded.role, Role::Verifier);
        assert_eq!(loaded.token_secret, "s3cret");
    }
}
