//! CLI configuration, persisted as JSON.

use std::path::{Path, PathBuf};

use llama_bridge::{ApiVersion, NoticeScope, ProbeConfig, SamplingParams, SessionConfig};
use serde::{Deserialize, Serialize};

/// Defaults for `run`, overridable per invocation by flags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CliConfig {
    #[serde(default)]
    pub probe: ProbeConfig,
    /// GPU layers (-1 = all, 0 = CPU only).
    #[serde(default = "default_gpu_layers")]
    pub gpu_layers: i32,
    #[serde(default = "default_ctx_size")]
    pub ctx_size: i32,
    /// Worker threads (`None` = all cores).
    #[serde(default)]
    pub threads: Option<i32>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: i32,
    #[serde(default)]
    pub sampling: SamplingParams,
    #[serde(default)]
    pub session: SessionConfig,
}

fn default_gpu_layers() -> i32 {
    -1
}
fn default_ctx_size() -> i32 {
    4096
}
fn default_max_tokens() -> i32 {
    512
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            probe: ProbeConfig::default(),
            gpu_layers: default_gpu_layers(),
            ctx_size: default_ctx_size(),
            threads: None,
            max_tokens: default_max_tokens(),
            sampling: SamplingParams::default(),
            session: SessionConfig::default(),
        }
    }
}

impl CliConfig {
    /// Platform config directory: `~/.config/llama-bridge/`
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("llama-bridge")
    }

    pub fn config_file() -> PathBuf {
        Self::config_dir().join("config.json")
    }

    /// Load from disk, or return defaults if the file doesn't exist.
    pub fn load_or_default() -> anyhow::Result<Self> {
        Self::load_from(&Self::config_file())
    }

    pub fn save(&self) -> anyhow::Result<()> {
        self.save_to(&Self::config_file())
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            Ok(serde_json::from_str(&data)?)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let data = serde_json::to_string_pretty(self)?;
        std::fs::write(path, data)?;
        Ok(())
    }

    /// Set one value by its dotted-free key name.
    pub fn set(&mut self, key: &str, value: &str) -> anyhow::Result<()> {
        match key {
            "min_api_version" => {
                self.probe.min_api_version =
                    value.parse::<ApiVersion>().map_err(anyhow::Error::msg)?;
            }
            "gpu_layers" => self.gpu_layers = value.parse()?,
            "ctx_size" => self.ctx_size = value.parse()?,
            "threads" => {
                self.threads = match value {
                    "" | "auto" => None,
                    n => Some(n.parse()?),
                }
            }
            "max_tokens" => self.max_tokens = value.parse()?,
            "greedy" => self.sampling.greedy = value.parse()?,
            "temperature" => self.sampling.temperature = value.parse()?,
            "top_k" => self.sampling.top_k = value.parse()?,
            "top_p" => self.sampling.top_p = value.parse()?,
            "repeat_penalty" => self.sampling.repeat_penalty = value.parse()?,
            "seed" => self.sampling.seed = Some(value.parse()?),
            "notice_scope" => {
                self.session.notice_scope = match value {
                    "session" => NoticeScope::Session,
                    "process" => NoticeScope::Process,
                    other => anyhow::bail!("notice_scope must be session or process, got {other}"),
                }
            }
            "truncation_notice" => self.session.truncation_notice = value.to_string(),
            _ => anyhow::bail!("Unknown config key: {key}"),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = CliConfig::load_from(&dir.path().join("config.json")).unwrap();
        assert_eq!(cfg, CliConfig::default());
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let mut cfg = CliConfig::default();
        cfg.set("gpu_layers", "12").unwrap();
        cfg.set("min_api_version", "1.3").unwrap();
        cfg.set("notice_scope", "process").unwrap();
        cfg.save_to(&path).unwrap();

        let loaded = CliConfig::load_from(&path).unwrap();
        assert_eq!(loaded.gpu_layers, 12);
        assert_eq!(loaded.probe.min_api_version, ApiVersion::V1_3);
        assert_eq!(loaded.session.notice_scope, NoticeScope::Process);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{ "max_tokens": 64 }"#).unwrap();

        let cfg = CliConfig::load_from(&path).unwrap();
        assert_eq!(cfg.max_tokens, 64);
        assert_eq!(cfg.ctx_size, 4096);
        assert!(cfg.session.parse_special);
    }

    #[test]
    fn unknown_and_malformed_values_are_rejected() {
        let mut cfg = CliConfig::default();
        assert!(cfg.set("port", "8080").is_err());
        assert!(cfg.set("gpu_layers", "many").is_err());
        assert!(cfg.set("notice_scope", "global").is_err());
        cfg.set("threads", "auto").unwrap();
        assert_eq!(cfg.threads, None);
    }
}
