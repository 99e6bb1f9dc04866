use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

pub const CONFIG_FILE_NAME: &str = "patchward.toml";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostConfig {
    #[serde(default)]
    pub host_root: Option<PathBuf>,
    /// Version of the runtime the host application runs on; compared against
    /// the minimum an update declares.
    #[serde(default = "default_runtime_version")]
    pub runtime_version: String,
    /// Host policy flag; when set nothing may be mutated.
    #[serde(default)]
    pub disallow_file_mods: bool,
    /// JSON update feed (local path or http(s) URL) pulled on metadata refresh.
    #[serde(default)]
    pub update_feed: Option<String>,
    #[serde(default)]
    pub defaults: UpgradeDefaults,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradeDefaults {
    #[serde(default)]
    pub maintenance_mode: bool,
    #[serde(default)]
    pub crash_recovery: bool,
}

// Unknown runtimes compare lowest so any declared minimum blocks the update.
fn default_runtime_version() -> String {
    "0.0.0".to_string()
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            host_root: None,
            runtime_version: default_runtime_version(),
            disallow_file_mods: false,
            update_feed: None,
            defaults: UpgradeDefaults::default(),
        }
    }
}

impl HostConfig {
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let config: Self = toml::from_str(input).context("failed to parse patchward config")?;
        if config.runtime_version.trim().is_empty() {
            return Err(anyhow!("runtime_version must not be empty"));
        }
        Ok(config)
    }

    /// Loads a config file; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to read config: {}", path.display()));
            }
        };
        Self::from_toml_str(&raw).with_context(|| format!("invalid config: {}", path.display()))
    }

    /// Applies `PATCHWARD_*` overrides using the given variable lookup.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(root) = lookup("PATCHWARD_HOST_ROOT").filter(|value| !value.is_empty()) {
            self.host_root = Some(PathBuf::from(root));
        }
        if let Some(version) = lookup("PATCHWARD_RUNTIME_VERSION").filter(|v| !v.is_empty()) {
            self.runtime_version = version;
        }
        if let Some(raw) = lookup("PATCHWARD_DISALLOW_FILE_MODS") {
            self.disallow_file_mods = parse_env_bool(&raw).with_context(|| {
                format!("invalid PATCHWARD_DISALLOW_FILE_MODS value: {raw}")
            })?;
        }
        Ok(())
    }
}

fn parse_env_bool(raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => Err(anyhow!("expected a boolean, got '{other}'")),
    }
}
