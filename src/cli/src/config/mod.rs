mod args;
mod env;
mod file;

use std::sync::Arc;

use itertools::Itertools;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::service::renogy::Family;

pub(crate) const MIN_POLL_INTERVAL: u32 = 10;
pub(crate) const MAX_POLL_INTERVAL: u32 = 600;

const MAC_ADDRESS: &str = r"^[0-9A-F]{2}(:[0-9A-F]{2}){5}$";

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Device {
  pub(crate) address: String,
  pub(crate) family: Family,
  pub(crate) name: Option<String>,
}

#[derive(Debug, Clone)]
pub(crate) struct Discovery {
  pub(crate) interval: chrono::Duration,
  pub(crate) retention: u32,
  pub(crate) scan: bool,
  pub(crate) scan_duration: chrono::Duration,
  pub(crate) prefix: String,
}

#[derive(Debug, Clone)]
pub(crate) struct Values {
  pub(crate) poll_interval: chrono::Duration,
  pub(crate) cycle_timeout: chrono::Duration,
  pub(crate) failure_threshold: u32,
  pub(crate) unavailable_retry_interval: chrono::Duration,
  pub(crate) response_timeout: chrono::Duration,
  pub(crate) keep_connected: bool,
  pub(crate) discovery: Discovery,
  pub(crate) devices: Vec<Device>,
}

#[derive(Debug, Clone)]
struct Unparsed {
  from_args: args::Values,
  from_env: env::Values,
  from_file: file::Values,
}

#[derive(Debug, Clone)]
pub(crate) struct Manager {
  lock: Arc<Mutex<Unparsed>>,
}

#[derive(Debug, Error)]
pub(crate) enum ReadError {
  #[error("Failed reading file")]
  FileReadError(#[from] file::ParseError),

  #[error("Failed reading env")]
  EnvReadError(#[from] env::ParseError),
}

#[derive(Debug, Error)]
pub(crate) enum ValidationError {
  #[error("Cycle timeout must be positive")]
  ZeroCycleTimeout,

  #[error("Response timeout must be positive")]
  ZeroResponseTimeout,

  #[error("Failure threshold must be at least 1")]
  ZeroFailureThreshold,

  #[error("Invalid log level {0:?}")]
  InvalidLogLevel(String),

  #[error("Invalid device address {0:?}")]
  InvalidAddress(String),

  #[error("Device {0} is configured more than once")]
  DuplicateAddress(String),

  #[error("Failed compiling address pattern")]
  Pattern(#[from] regex::Error),
}

impl Manager {
  pub(crate) async fn new() -> Result<Self, ReadError> {
    let config = Self::read_async().await?;

    let config_manager = Self {
      lock: Arc::new(Mutex::new(config)),
    };

    Ok(config_manager)
  }

  /// Log level as early as possible so that config errors get logged.
  pub(crate) async fn log_level(&self) -> tracing::level_filters::LevelFilter {
    let config = self.lock.lock().await.clone();

    Self::parse_log_level(&config)
      .unwrap_or(tracing::level_filters::LevelFilter::INFO)
  }

  pub(crate) async fn values(&self) -> Result<Values, ValidationError> {
    let config = self.lock.lock().await.clone();

    Self::parse(config)
  }

  /// Re-reads the config file, keeping the previous file on failure.
  #[tracing::instrument(skip(self))]
  pub(crate) async fn reload(&self) -> Result<Values, ValidationError> {
    let config = {
      let mut values = self.lock.lock().await;
      let from_file = file::parse_async(Self::location(&values)).await;
      match from_file {
        Ok(from_file) => values.from_file = from_file,
        Err(error) => {
          tracing::error!("Failed parsing config file {}", error)
        }
      }
      values.clone()
    };

    Self::parse(config)
  }

  fn location(config: &Unparsed) -> Option<&str> {
    config
      .from_args
      .config
      .as_deref()
      .or(config.from_env.config.as_deref())
  }

  fn parse_log_level(
    config: &Unparsed,
  ) -> Result<tracing::level_filters::LevelFilter, ValidationError> {
    if config.from_args.trace {
      return Ok(tracing::level_filters::LevelFilter::TRACE);
    }

    let log_level = match &config.from_env.log_level {
      Some(log_level) => Some(
        log_level
          .parse::<file::LogLevel>()
          .map_err(ValidationError::InvalidLogLevel)?,
      ),
      None => config.from_file.log_level,
    };

    Ok(log_level.map_or_else(
      || {
        #[cfg(debug_assertions)]
        {
          tracing::level_filters::LevelFilter::DEBUG
        }
        #[cfg(not(debug_assertions))]
        {
          tracing::level_filters::LevelFilter::INFO
        }
      },
      |log_level| match log_level {
        file::LogLevel::Trace => tracing::level_filters::LevelFilter::TRACE,
        file::LogLevel::Debug => tracing::level_filters::LevelFilter::DEBUG,
        file::LogLevel::Info => tracing::level_filters::LevelFilter::INFO,
        file::LogLevel::Warn => tracing::level_filters::LevelFilter::WARN,
        file::LogLevel::Error => tracing::level_filters::LevelFilter::ERROR,
      },
    ))
  }

  fn parse(config: Unparsed) -> Result<Values, ValidationError> {
    Self::parse_log_level(&config)?;
    let from_file = config.from_file;

    let cycle_timeout = from_file.cycle_timeout.unwrap_or(30);
    if cycle_timeout == 0 {
      return Err(ValidationError::ZeroCycleTimeout);
    }

    let response_timeout = from_file.response_timeout_ms.unwrap_or(2000);
    if response_timeout == 0 {
      return Err(ValidationError::ZeroResponseTimeout);
    }

    let failure_threshold = from_file.failure_threshold.unwrap_or(3);
    if failure_threshold == 0 {
      return Err(ValidationError::ZeroFailureThreshold);
    }

    let pattern = regex::Regex::new(MAC_ADDRESS)?;
    let devices = from_file
      .devices
      .into_iter()
      .map(|device| {
        let address = device.address.trim().to_uppercase();
        if !pattern.is_match(&address) {
          return Err(ValidationError::InvalidAddress(device.address));
        }
        Ok(Device {
          address,
          family: device.family,
          name: device.name,
        })
      })
      .collect::<Result<Vec<_>, _>>()?;
    if let Some(address) =
      devices.iter().map(|device| &device.address).duplicates().next()
    {
      return Err(ValidationError::DuplicateAddress(address.clone()));
    }

    Ok(Values {
      poll_interval: file::seconds_to_chrono(clamp_poll_interval(
        from_file.poll_interval.unwrap_or(60),
      )),
      cycle_timeout: file::seconds_to_chrono(cycle_timeout),
      failure_threshold,
      unavailable_retry_interval: file::seconds_to_chrono(
        from_file.unavailable_retry_interval.unwrap_or(0),
      ),
      response_timeout: file::milliseconds_to_chrono(response_timeout),
      keep_connected: from_file.keep_connected.unwrap_or(false),
      discovery: Discovery {
        interval: file::seconds_to_chrono(
          from_file.discovery.interval.unwrap_or(60).max(1),
        ),
        retention: from_file.discovery.retention.unwrap_or(3),
        scan: from_file.discovery.scan.unwrap_or(false),
        scan_duration: file::seconds_to_chrono(
          from_file.discovery.scan_duration.unwrap_or(10).max(1),
        ),
        prefix: from_file
          .discovery
          .prefix
          .unwrap_or_else(|| "BT-TH-".to_owned()),
      },
      devices,
    })
  }

  async fn read_async() -> Result<Unparsed, ReadError> {
    let from_args = args::parse();
    let from_env = env::parse()?;
    let from_file = file::parse_async(
      from_args
        .config
        .as_deref()
        .or(from_env.config.as_deref()),
    )
    .await?;

    Ok(Unparsed {
      from_args,
      from_env,
      from_file,
    })
  }
}

#[cfg(test)]
impl Manager {
  pub(crate) async fn from_location(
    location: &str,
  ) -> Result<Self, ReadError> {
    let from_file = file::parse_async(Some(location)).await?;

    Ok(Self {
      lock: Arc::new(Mutex::new(Unparsed {
        from_args: args::Values {
          config: Some(location.to_owned()),
          trace: false,
        },
        from_env: env::Values::default(),
        from_file,
      })),
    })
  }
}

fn clamp_poll_interval(seconds: u32) -> u32 {
  let clamped = seconds.clamp(MIN_POLL_INTERVAL, MAX_POLL_INTERVAL);
  if clamped != seconds {
    tracing::warn!(
      "Poll interval {}s is outside [{}, {}], using {}s",
      seconds,
      MIN_POLL_INTERVAL,
      MAX_POLL_INTERVAL,
      clamped
    );
  }

  clamped
}
