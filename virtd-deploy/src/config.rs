//! Tool settings.
//!
//! Layered from built-in defaults, an optional YAML file, `VIRTD_`
//! environment variables and finally command-line flags.

use anyhow::{Context, Result};
use config::{Config, Environment, File, FileFormat};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use virtd_common::LogFormat;
use virtd_hypervisor::DEFAULT_URI;

use crate::cli::Args;

/// Settings file read when `--settings` is not given.
pub const DEFAULT_SETTINGS_PATH: &str = "/etc/virtd/settings.yaml";

/// Settings of the `virtd` tool.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Where resource state is persisted
    pub state_file: PathBuf,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    pub log_format: LogFormat,
    /// Delay between DHCP lease polls
    pub poll_interval_ms: u64,
    /// URI for resources whose definition does not name one
    pub default_uri: String,
    pub evaluator: EvaluatorSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            state_file: PathBuf::from("virtd-state.json"),
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            poll_interval_ms: 1000,
            default_uri: DEFAULT_URI.to_string(),
            evaluator: EvaluatorSettings::default(),
        }
    }
}

/// External programs used to build and inspect machine images.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EvaluatorSettings {
    pub nix_build: String,
    pub qemu_img: String,
    pub ssh_keygen: String,
    /// Expression that evaluates the deployment's machines
    pub entry_expr: String,
    /// Extra `-I` search path entries passed to the evaluator
    pub include_paths: Vec<String>,
}

impl Default for EvaluatorSettings {
    fn default() -> Self {
        Self {
            nix_build: "nix-build".to_string(),
            qemu_img: "qemu-img".to_string(),
            ssh_keygen: "ssh-keygen".to_string(),
            entry_expr: "<nixops/eval-machine-info.nix>".to_string(),
            include_paths: Vec::new(),
        }
    }
}

impl Settings {
    /// Load settings from `path` layered over the defaults.
    ///
    /// A missing file is only an error when `required` is set.
    pub fn load(path: &Path, required: bool) -> Result<Self> {
        if required && !path.exists() {
            return Err(anyhow::anyhow!("Settings file not found: {}", path.display()));
        }

        let settings = Config::builder()
            .add_source(File::from(path).format(FileFormat::Yaml).required(required))
            .add_source(
                Environment::with_prefix("VIRTD")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()
            .with_context(|| format!("Failed to read settings from {}", path.display()))?;

        settings
            .try_deserialize()
            .with_context(|| "Failed to parse settings")
    }

    /// Load the file named on the command line, or the default one if present.
    pub fn resolve(args: &Args) -> Result<Self> {
        let settings = match &args.settings {
            Some(path) => Self::load(path, true)?,
            None => Self::load(Path::new(DEFAULT_SETTINGS_PATH), false)?,
        };
        Ok(settings.with_cli_overrides(args))
    }

    /// Apply CLI argument overrides to the settings.
    pub fn with_cli_overrides(mut self, args: &Args) -> Self {
        if let Some(ref state) = args.state {
            self.state_file = state.clone();
        }

        if let Some(ref level) = args.log_level {
            self.log_level = level.clone();
        }

        if args.json_logs {
            self.log_format = LogFormat::Json;
        }

        self
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}
