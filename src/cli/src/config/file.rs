use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::service::renogy::Family;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum LogLevel {
  Trace,
  Debug,
  Info,
  Warn,
  Error,
}

impl FromStr for LogLevel {
  type Err = String;

  fn from_str(value: &str) -> Result<Self, Self::Err> {
    match value.trim().to_lowercase().as_str() {
      "trace" => Ok(LogLevel::Trace),
      "debug" => Ok(LogLevel::Debug),
      "info" => Ok(LogLevel::Info),
      "warn" => Ok(LogLevel::Warn),
      "error" => Ok(LogLevel::Error),
      _ => Err(value.to_string()),
    }
  }
}

#[derive(Default, Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Discovery {
  pub(crate) interval: Option<u32>,
  pub(crate) retention: Option<u32>,
  pub(crate) scan: Option<bool>,
  pub(crate) scan_duration: Option<u32>,
  pub(crate) prefix: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Device {
  pub(crate) address: String,
  pub(crate) family: Family,
  pub(crate) name: Option<String>,
}

#[derive(Default, Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Values {
  pub(crate) log_level: Option<LogLevel>,
  pub(crate) poll_interval: Option<u32>,
  pub(crate) cycle_timeout: Option<u32>,
  pub(crate) failure_threshold: Option<u32>,
  pub(crate) unavailable_retry_interval: Option<u32>,
  pub(crate) response_timeout_ms: Option<u32>,
  pub(crate) keep_connected: Option<bool>,
  #[serde(default)]
  pub(crate) discovery: Discovery,
  #[serde(default)]
  pub(crate) devices: Vec<Device>,
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum ParseError {
  #[error("Failed creating project directories")]
  MissingProjectDirs,

  #[error("Failed reading config file")]
  Read(#[from] std::io::Error),

  #[error("Config file is missing an extension")]
  MissingExtension,

  #[error("Config file has invalid extension")]
  InvalidExtension,

  #[error("Failed deserializing config from yaml")]
  DeserializetionYaml(#[from] serde_yaml::Error),

  #[error("Failed deserializing config from toml")]
  DeserializetionToml(#[from] toml::de::Error),

  #[error("Failed deserializing config from json")]
  DeserializetionJson(#[from] serde_json::Error),
}

/// Reads the config file at `location` or the default location.
///
/// A missing file at the default location yields defaults.
pub(crate) async fn parse_async(
  location: Option<&str>,
) -> Result<Values, ParseError> {
  let location = match location {
    Some(location) => std::path::PathBuf::from(location),
    None => {
      let location =
        match directories::ProjectDirs::from("com", "renogy", "renogy") {
          Some(project_dirs) => project_dirs.config_dir().join("config.yaml"),
          None => return Err(ParseError::MissingProjectDirs),
        };
      if !tokio::fs::try_exists(&location).await? {
        tracing::debug!("No config file at {:?}", location);
        return Ok(Values::default());
      }
      location
    }
  };

  let raw = tokio::fs::read_to_string(&location).await?;
  let extension = location.extension().and_then(|str| str.to_str());
  parse_str(raw.as_str(), extension)
}

pub(crate) fn parse_str(
  raw: &str,
  extension: Option<&str>,
) -> Result<Values, ParseError> {
  let values = match extension {
    None => return Err(ParseError::MissingExtension),
    Some("yaml" | "yml") => serde_yaml::from_str::<Values>(raw)?,
    Some("toml") => toml::from_str::<Values>(raw)?,
    Some("json") => serde_json::from_str::<Values>(raw)?,
    Some(_) => return Err(ParseError::InvalidExtension),
  };

  Ok(values)
}

pub(crate) fn seconds_to_chrono(seconds: u32) -> chrono::Duration {
  chrono::Duration::seconds(seconds as i64)
}

pub(crate) fn milliseconds_to_chrono(milliseconds: u32) -> chrono::Duration {
  chrono::Duration::milliseconds(milliseconds as i64)
}
