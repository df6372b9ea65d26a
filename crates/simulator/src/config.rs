//! Simulator configuration management

use anyhow::{Context, Result, anyhow};
use engine::EngineConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SimulatorConfig {
    #[serde(default)]
    pub logging: LoggingSettings,
    /// Dispatcher and event channel tunables
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub printer: PrinterSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingSettings {
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Simulated receipt printer
///
/// # Example Configuration
/// ```toml
/// [printer]
/// sessions = 2
/// receipts = 3
/// lines_per_receipt = 5
/// line_delay_ms = 20
/// failure_rate = 0.1
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrinterSettings {
    /// Sessions opened on the one physical printer
    #[serde(default = "PrinterSettings::default_sessions")]
    pub sessions: u32,
    /// Receipts printed by the claiming session
    #[serde(default = "PrinterSettings::default_receipts")]
    pub receipts: u32,
    #[serde(default = "PrinterSettings::default_lines")]
    pub lines_per_receipt: u32,
    /// Time the mechanism needs per line
    #[serde(default = "PrinterSettings::default_line_delay")]
    pub line_delay_ms: u64,
    /// Probability of a paper jam per printed line, below 1.0
    #[serde(default)]
    pub failure_rate: f64,
    /// Optional file receiving everything written to the mechanism
    #[serde(default)]
    pub output_file: Option<String>,
}

impl Default for PrinterSettings {
    fn default() -> Self {
        Self {
            sessions: Self::default_sessions(),
            receipts: Self::default_receipts(),
            lines_per_receipt: Self::default_lines(),
            line_delay_ms: Self::default_line_delay(),
            failure_rate: 0.0,
            output_file: None,
        }
    }
}

impl PrinterSettings {
    fn default_sessions() -> u32 {
        2
    }

    fn default_receipts() -> u32 {
        3
    }

    fn default_lines() -> u32 {
        4
    }

    fn default_line_delay() -> u64 {
        25
    }

    pub fn line_delay(&self) -> Duration {
        Duration::from_millis(self.line_delay_ms)
    }

    /// Output file with `~` expanded
    pub fn output_path(&self) -> Option<PathBuf> {
        self.output_file
            .as_deref()
            .map(|p| PathBuf::from(shellexpand::tilde(p).as_ref()))
    }
}

impl SimulatorConfig {
    /// Load configuration from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = match path {
            Some(p) => PathBuf::from(shellexpand::tilde(&p.to_string_lossy()).as_ref()),
            None => {
                let default = Self::default_path();
                if !default.exists() {
                    return Err(anyhow!("No configuration file found, using defaults"));
                }
                default
            }
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config = Self::parse(&content)
            .with_context(|| format!("Invalid config file: {}", config_path.display()))?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Parse and validate TOML text
    pub fn parse(content: &str) -> Result<Self> {
        let config: SimulatorConfig =
            toml::from_str(content).context("Failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to load config: {}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("pos-runtime").join("simulator.toml")
        } else {
            PathBuf::from(".config/pos-runtime/simulator.toml")
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            ));
        }

        if self.printer.sessions == 0 {
            return Err(anyhow!("printer.sessions must be at least 1"));
        }

        // A line that always jams would be retried forever
        if !(0.0..1.0).contains(&self.printer.failure_rate) {
            return Err(anyhow!(
                "printer.failure_rate {} must be at least 0.0 and below 1.0",
                self.printer.failure_rate
            ));
        }

        if self.engine.callback_wait_ms == Some(0) {
            return Err(anyhow!(
                "engine.callback_wait_ms must be positive; omit it to wait forever"
            ));
        }

        Ok(())
    }
}
