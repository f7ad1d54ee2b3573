// src/config.rs
//! Application configuration: optional TOML file, env-provided secrets,
//! compiled-in production defaults.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::analyzer::AnalyzerConfig;
use crate::gate::RateGate;
use crate::worker::WorkerConfig;

const ENV_CONFIG_PATH: &str = "INSIGHTS_CONFIG_PATH";
const DEFAULT_CONFIG_PATH: &str = "config/pipeline.toml";

/// One sliding-window ceiling.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GateConfig {
    pub capacity: usize,
    pub window_secs: u64,
}

impl GateConfig {
    pub fn build(&self) -> Arc<RateGate> {
        Arc::new(RateGate::new(
            self.capacity,
            Duration::from_secs(self.window_secs),
        ))
    }
}

fn default_inbound() -> GateConfig {
    GateConfig {
        capacity: 100,
        window_secs: 1,
    }
}
fn default_outbound() -> GateConfig {
    GateConfig {
        capacity: 10,
        window_secs: 1,
    }
}
fn default_port() -> u16 {
    8000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    /// HTTP submission ceiling.
    #[serde(default = "default_inbound")]
    pub inbound: GateConfig,
    /// External analysis ceiling.
    #[serde(default = "default_outbound")]
    pub outbound: GateConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub analyzer: AnalyzerConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            inbound: default_inbound(),
            outbound: default_outbound(),
            worker: WorkerConfig::default(),
            analyzer: AnalyzerConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load using env var + fallbacks:
    /// 1) $INSIGHTS_CONFIG_PATH (must be readable when set)
    /// 2) config/pipeline.toml when present
    /// 3) compiled-in defaults
    pub fn load() -> Result<Self> {
        let mut cfg = if let Ok(p) = std::env::var(ENV_CONFIG_PATH) {
            let pb = PathBuf::from(p);
            Self::load_from(&pb)?
        } else {
            let default = Path::new(DEFAULT_CONFIG_PATH);
            if default.exists() {
                Self::load_from(default)?
            } else {
                Self::default()
            }
        };
        cfg.sanitize();
        Ok(cfg)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        parse_config(&content).with_context(|| format!("parsing {}", path.display()))
    }

    /// Floor out values that would wedge the pipeline.
    pub fn sanitize(&mut self) {
        if self.inbound.capacity == 0 {
            self.inbound.capacity = 1;
        }
        if self.inbound.window_secs == 0 {
            self.inbound.window_secs = 1;
        }
        if self.outbound.capacity == 0 {
            self.outbound.capacity = 1;
        }
        if self.outbound.window_secs == 0 {
            self.outbound.window_secs = 1;
        }
        self.worker.sanitize();
        self.analyzer.sanitize();
    }
}

fn parse_config(s: &str) -> Result<AppConfig> {
    Ok(toml::from_str(s)?)
}
