//! Optional YAML configuration file.
//!
//! Discovery order: `$XDG_CONFIG_HOME/ffind/config.yaml`,
//! `$HOME/.config/ffind/config.yaml`, `/etc/ffind/config.yaml`. The
//! first existing file wins. Unknown keys warn and continue; the
//! command line overrides anything set here.

use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

#[derive(Debug, Default)]
pub struct FileConfig {
    pub foreground: Option<bool>,
    pub db: Option<PathBuf>,
    /// Which file these settings came from.
    pub source: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    foreground: Option<Toggle>,
    db: Option<String>,
    #[serde(flatten)]
    unknown: BTreeMap<String, serde_yaml::Value>,
}

/// Boolean in any of the accepted spellings: true/false, yes/no, 1/0.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Toggle {
    Bool(bool),
    Int(i64),
    Text(String),
}

impl Toggle {
    fn as_bool(&self) -> Option<bool> {
        match self {
            Toggle::Bool(value) => Some(*value),
            Toggle::Int(0) => Some(false),
            Toggle::Int(1) => Some(true),
            Toggle::Int(_) => None,
            Toggle::Text(text) => match text.to_ascii_lowercase().as_str() {
                "true" | "yes" | "1" => Some(true),
                "false" | "no" | "0" => Some(false),
                _ => None,
            },
        }
    }
}

fn candidate_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();
    if let Some(xdg) = env::var_os("XDG_CONFIG_HOME").filter(|value| !value.is_empty()) {
        paths.push(PathBuf::from(xdg).join("ffind/config.yaml"));
    }
    if let Some(home) = env::var_os("HOME").filter(|value| !value.is_empty()) {
        paths.push(PathBuf::from(home).join(".config/ffind/config.yaml"));
    }
    paths.push(PathBuf::from("/etc/ffind/config.yaml"));
    paths
}

pub fn load() -> FileConfig {
    for path in candidate_paths() {
        if path.exists() {
            return parse_file(&path);
        }
    }
    FileConfig::default()
}

fn parse_file(path: &Path) -> FileConfig {
    match fs::read_to_string(path) {
        Ok(content) => parse_str(&content, path),
        Err(err) => {
            tracing::warn!("could not read config {}: {err}", path.display());
            FileConfig::default()
        }
    }
}

fn parse_str(content: &str, origin: &Path) -> FileConfig {
    let mut config = FileConfig {
        source: Some(origin.to_path_buf()),
        ..FileConfig::default()
    };
    if content.trim().is_empty() {
        return config;
    }
    let raw: RawConfig = match serde_yaml::from_str(content) {
        Ok(raw) => raw,
        Err(err) => {
            tracing::warn!("invalid config {}: {err}", origin.display());
            return config;
        }
    };
    for key in raw.unknown.keys() {
        tracing::warn!("unknown config key '{key}' in {}", origin.display());
    }
    config.foreground = raw.foreground.and_then(|toggle| {
        let parsed = toggle.as_bool();
        if parsed.is_none() {
            tracing::warn!(
                "invalid value for 'foreground' in {} (expected true/false)",
                origin.display()
            );
        }
        parsed
    });
    config.db = raw.db.map(PathBuf::from);
    config
}
