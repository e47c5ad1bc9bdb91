// src/config.rs
use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

pub const ENV_CONFIG_PATH: &str = "ANALYTICS_CONFIG_PATH";
pub const ENV_WINDOW_MINUTES: &str = "ANALYTICS_WINDOW_MINUTES";
pub const ENV_BIND: &str = "ANALYTICS_BIND";
pub const ENV_SOURCE: &str = "ANALYTICS_SOURCE";
pub const ENV_TCP_ADDR: &str = "ANALYTICS_TCP_ADDR";

pub const DEFAULT_CONFIG_PATH: &str = "config/analytics.toml";

fn default_window_minutes() -> u32 {
    3
}
fn default_bind_addr() -> String {
    "127.0.0.1:5000".to_string()
}
fn default_channel_capacity() -> usize {
    10_000
}
fn default_tcp_addr() -> String {
    "127.0.0.1:9092".to_string()
}
fn default_metrics() -> bool {
    true
}

/// Where events come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// Newline-delimited JSON on stdin.
    #[default]
    Stdin,
    /// Newline-delimited JSON over TCP connections.
    Tcp,
    /// Only `POST /api/events`.
    None,
}

impl std::str::FromStr for SourceKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "stdin" => Ok(Self::Stdin),
            "tcp" => Ok(Self::Tcp),
            "none" => Ok(Self::None),
            other => Err(anyhow!("unknown source kind: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_window_minutes")]
    pub window_minutes: u32,
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    #[serde(default)]
    pub source: SourceKind,
    #[serde(default = "default_tcp_addr")]
    pub tcp_addr: String,
    #[serde(default = "default_metrics")]
    pub metrics: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            window_minutes: default_window_minutes(),
            bind_addr: default_bind_addr(),
            channel_capacity: default_channel_capacity(),
            source: SourceKind::default(),
            tcp_addr: default_tcp_addr(),
            metrics: default_metrics(),
        }
    }
}

impl AppConfig {
    fn validate(self) -> Result<Self> {
        if self.window_minutes == 0 {
            bail!("window_minutes must be at least 1");
        }
        if self.channel_capacity == 0 {
            bail!("channel_capacity must be at least 1");
        }
        Ok(self)
    }

    fn apply_env(mut self) -> Result<Self> {
        if let Ok(v) = std::env::var(ENV_WINDOW_MINUTES) {
            self.window_minutes = v
                .trim()
                .parse()
                .with_context(|| format!("{ENV_WINDOW_MINUTES}={v} is not a number"))?;
        }
        if let Ok(v) = std::env::var(ENV_BIND) {
            self.bind_addr = v.trim().to_string();
        }
        if let Ok(v) = std::env::var(ENV_SOURCE) {
            self.source = v.parse()?;
        }
        if let Ok(v) = std::env::var(ENV_TCP_ADDR) {
            self.tcp_addr = v.trim().to_string();
        }
        Ok(self)
    }
}

/// Load config from an explicit TOML file, without env overrides.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("reading config from {}", path.display()))?;
    let cfg: AppConfig =
        toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))?;
    cfg.validate()
}

/// Load config using env var + fallbacks, then apply env overrides:
/// 1) $ANALYTICS_CONFIG_PATH
/// 2) config/analytics.toml
/// 3) built-in defaults
pub fn load_config_default() -> Result<AppConfig> {
    let base = if let Ok(p) = std::env::var(ENV_CONFIG_PATH) {
        let pb = PathBuf::from(p);
        if !pb.exists() {
            return Err(anyhow!("{ENV_CONFIG_PATH} points to non-existent path"));
        }
        load_config_from(&pb)?
    } else {
        let default_p = PathBuf::from(DEFAULT_CONFIG_PATH);
        if default_p.exists() {
            load_config_from(&default_p)?
        } else {
            AppConfig::default()
        }
    };
    base.apply_env()?.validate()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_toml_fills_defaults() {
        let cfg: AppConfig = toml::from_str("window_minutes = 10\nsource = \"tcp\"").unwrap();
        assert_eq!(cfg.window_minutes, 10);
        assert_eq!(cfg.source, SourceKind::Tcp);
        assert_eq!(cfg.bind_addr, "127.0.0.1:5000");
        assert_eq!(cfg.channel_capacity, 10_000);
        assert!(cfg.metrics);
    }

    #[test]
    fn zero_window_is_rejected() {
        let cfg = AppConfig {
            window_minutes: 0,
            ..AppConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn source_kind_parses_case_insensitively() {
        assert_eq!("TCP".parse::<SourceKind>().unwrap(), SourceKind::Tcp);
        assert_eq!(" none ".parse::<SourceKind>().unwrap(), SourceKind::None);
        assert!("kafka".parse::<SourceKind>().is_err());
    }
}
