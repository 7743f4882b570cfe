use config::{Config, ConfigError, Environment, File, FileFormat};
use engine::Manufacturer;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Bundled defaults; every other source overrides these.
const DEFAULTS: &str = include_str!("../global_config.yaml");

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AppConfig {
    pub backend: BackendConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct BackendConfig {
    pub manufacturer: String,
    #[serde(default)]
    pub interactive: bool,
}

impl BackendConfig {
    pub fn manufacturer(&self) -> anyhow::Result<Manufacturer> {
        self.manufacturer
            .parse()
            .map_err(|e: engine::ErrorRecord| anyhow::anyhow!(e.message))
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    pub verbose: bool,
    pub format: LoggingFormatConfig,
    pub levels: LoggingLevelsConfig,
    #[serde(default)]
    pub file: LogFileConfig,
    #[serde(default)]
    pub redaction: RedactionConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingFormatConfig {
    pub show_time: bool,
    #[serde(default)]
    pub json: bool,
    pub location: LoggingLocationConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingLocationConfig {
    pub show_file: bool,
    pub show_line: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingLevelsConfig {
    #[serde(default)]
    pub trace: bool,
    pub debug: bool,
    pub info: bool,
    pub warning: bool,
    pub error: bool,
    pub critical: bool,
}

impl LoggingLevelsConfig {
    /// The most verbose enabled level, as an `EnvFilter` directive.
    pub fn directive(&self) -> &'static str {
        if self.trace {
            "trace"
        } else if self.debug {
            "debug"
        } else if self.info {
            "info"
        } else if self.warning {
            "warn"
        } else if self.error || self.critical {
            "error"
        } else {
            "off"
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LogFileConfig {
    pub enabled: bool,
    #[serde(default = "default_log_dir")]
    pub dir: PathBuf,
}

impl Default for LogFileConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            dir: default_log_dir(),
        }
    }
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

#[derive(Debug, Deserialize, Serialize, Default, Clone)]
pub struct RedactionConfig {
    #[serde(default = "true_default")]
    pub enabled: bool,
    #[serde(default = "true_default")]
    pub use_default_pii: bool,
    #[serde(default)]
    pub patterns: Vec<RedactionPattern>,
}

fn true_default() -> bool {
    true
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RedactionPattern {
    pub name: String,
    pub regex: String,
    pub placeholder: String,
}

/// Layered load: bundled defaults, `.global_config.yaml` in the working
/// directory, the explicit `--config` file, then `APP__*` variables.
pub fn load_config(explicit: Option<&Path>) -> Result<AppConfig, ConfigError> {
    let mut builder = Config::builder()
        .add_source(File::from_str(DEFAULTS, FileFormat::Yaml))
        .add_source(File::with_name(".global_config.yaml").required(false));

    if let Some(path) = explicit {
        builder = builder.add_source(File::from(path).required(true));
    }

    builder
        // Map nested env vars like APP__LOGGING__VERBOSE=true
        .add_source(Environment::with_prefix("APP").separator("__"))
        .build()?
        .try_deserialize()
}
