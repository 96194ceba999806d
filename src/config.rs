//! Project manifest parsing (`sx.toml`).
//!
//! The manifest is how the CLI supplies what an editor would: the target
//! selection, the serial port, option choices and any extra persistent
//! settings for the sketch.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::Path;

#[derive(Deserialize, Debug, Default)]
pub struct SxConfig {
    #[serde(default)]
    pub project: ProjectConfig,
    pub target: Option<TargetConfig>,
    /// Option-group selections, e.g. `speed = "fast"`.
    pub options: Option<HashMap<String, String>>,
    pub build: Option<BuildConfig>,
}

#[derive(Deserialize, Debug, Default)]
pub struct ProjectConfig {
    #[serde(default)]
    pub name: String,
    #[allow(dead_code)]
    pub version: Option<String>,
}

#[derive(Deserialize, Debug, Default)]
pub struct TargetConfig {
    pub board: Option<String>,
    pub core: Option<String>,
    pub compiler: Option<String>,
    pub programmer: Option<String>,
    pub port: Option<String>,
}

#[derive(Deserialize, Debug, Default)]
pub struct BuildConfig {
    /// Extra persistent settings merged into the sketch layer verbatim.
    pub settings: Option<HashMap<String, String>>,
}

pub fn load_config(dir: &Path) -> Result<SxConfig> {
    let path = dir.join("sx.toml");
    if !path.exists() {
        return Err(anyhow::anyhow!(
            "sx.toml not found in {}.\n\n\
            💡 Tip: create one with a [target] section selecting your board, core and compiler.",
            dir.display()
        ));
    }
    let text = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let config: SxConfig = toml::from_str(&text)
        .context("Failed to parse sx.toml - check for syntax errors (missing quotes, brackets)")?;
    Ok(config)
}
