use error_stack::ResultExt;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Cannot access configuration file {0}")]
    Io(String),

    #[error("Configuration file {0} is not valid")]
    Parse(String),

    #[error("Invalid configuration: {0}")]
    InvalidValue(String),
}

pub type Result<T> = error_stack::Result<T, ConfigError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DaliDriverKind {
    Hasseb,
    Tridonic,
    DaliServer,
    Dummy,
}

/// How a group derives its level from its members. `Off` freezes the
/// derived value: the group level becomes write-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupMode {
    #[default]
    Median,
    Max,
    Min,
    Off,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub mqtt_server: String,
    pub mqtt_port: u16,
    pub mqtt_username: String,
    pub mqtt_password: String,
    pub mqtt_base_topic: String,
    pub dali_driver: DaliDriverKind,
    pub dali_lamps: u8,
    pub dali_device: String,
    pub dali_server_address: String,
    pub ha_discovery_prefix: String,
    pub devices_names_file: String,
    pub group_mode: GroupMode,
    pub log_level: String,
    pub log_color: bool,
    pub max_retries: u32,
    pub min_backoff_time: u64,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            mqtt_server: String::from("localhost"),
            mqtt_port: 1883,
            mqtt_username: String::new(),
            mqtt_password: String::new(),
            mqtt_base_topic: String::from("dali2mqtt"),
            dali_driver: DaliDriverKind::Hasseb,
            dali_lamps: 64,
            dali_device: String::from("/dev/hidraw0"),
            dali_server_address: String::from("localhost:55825"),
            ha_discovery_prefix: String::from("homeassistant"),
            devices_names_file: String::from("devices.yaml"),
            group_mode: GroupMode::default(),
            log_level: String::from("info"),
            log_color: false,
            max_retries: 10,
            min_backoff_time: 1,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Config> {
        if !path.exists() {
            println!(
                "No configuration file found, creating {} with defaults",
                path.display()
            );

            let config = Config::default();
            let text = serde_yaml::to_string(&config)
                .change_context_lazy(|| ConfigError::Parse(path.display().to_string()))?;
            std::fs::write(path, text)
                .change_context_lazy(|| ConfigError::Io(path.display().to_string()))?;

            return Ok(config);
        }

        let text = std::fs::read_to_string(path)
            .change_context_lazy(|| ConfigError::Io(path.display().to_string()))?;
        let config: Config = serde_yaml::from_str(&text)
            .change_context_lazy(|| ConfigError::Parse(path.display().to_string()))?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.dali_lamps < 1 || self.dali_lamps > 64 {
            return Err(ConfigError::InvalidValue(format!(
                "dali_lamps must be 1..=64, got {}",
                self.dali_lamps
            ))
            .into());
        }
        if self.mqtt_base_topic.is_empty() {
            return Err(ConfigError::InvalidValue("mqtt_base_topic is empty".into()).into());
        }
        if self.max_retries == 0 {
            return Err(ConfigError::InvalidValue("max_retries must be at least 1".into()).into());
        }
        if self.tracing_level().is_none() {
            return Err(ConfigError::InvalidValue(format!(
                "log_level must be one of critical/error/warning/info/debug, got '{}'",
                self.log_level
            ))
            .into());
        }
        Ok(())
    }

    fn tracing_level(&self) -> Option<&'static str> {
        match self.log_level.as_str() {
            "critical" | "error" => Some("error"),
            "warning" => Some("warn"),
            "info" => Some("info"),
            "debug" => Some("debug"),
            _ => None,
        }
    }

    pub fn env_filter_directive(&self) -> String {
        self.tracing_level().unwrap_or("info").to_string()
    }
}
