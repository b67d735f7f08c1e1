use crate::config;

use super::renogy::Family;

/// A device reported present by a discovery round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Discovered {
  pub(crate) address: String,
  pub(crate) family: Family,
  pub(crate) name: Option<String>,
  pub(crate) rssi: Option<i16>,
}

impl From<config::Device> for Discovered {
  fn from(device: config::Device) -> Self {
    Self {
      address: device.address,
      family: device.family,
      name: device.name,
      rssi: None,
    }
  }
}

/// Supplies the current set of device addresses.
#[async_trait::async_trait]
pub(crate) trait Discovery: Send + Sync {
  async fn discover(&self) -> anyhow::Result<Vec<Discovered>>;
}

/// Devices listed in the config file, re-read on every round.
pub(crate) struct StaticDiscovery {
  config: config::Manager,
}

impl StaticDiscovery {
  pub(crate) fn new(config: config::Manager) -> Self {
    Self { config }
  }
}

#[async_trait::async_trait]
impl Discovery for StaticDiscovery {
  #[tracing::instrument(skip(self))]
  async fn discover(&self) -> anyhow::Result<Vec<Discovered>> {
    let config = self.config.reload().await?;

    Ok(config.devices.into_iter().map(Discovered::from).collect())
  }
}

#[cfg(feature = "ble")]
pub(crate) use self::ble::BleDiscovery;

#[cfg(feature = "ble")]
mod ble {
  use std::collections::HashMap;

  use crate::service::renogy::ble::BleRadio;

  use super::*;

  /// Configured devices plus any advertiser whose name has the prefix.
  pub(crate) struct BleDiscovery {
    config: config::Manager,
    radio: BleRadio,
  }

  impl BleDiscovery {
    pub(crate) fn new(config: config::Manager, radio: BleRadio) -> Self {
      Self { config, radio }
    }
  }

  #[async_trait::async_trait]
  impl Discovery for BleDiscovery {
    #[tracing::instrument(skip(self))]
    async fn discover(&self) -> anyhow::Result<Vec<Discovered>> {
      let config = self.config.reload().await?;
      let mut discovered = config
        .devices
        .into_iter()
        .map(|device| (device.address.clone(), Discovered::from(device)))
        .collect::<HashMap<_, _>>();

      let advertisements = self
        .radio
        .scan(config.discovery.scan_duration.to_std()?)
        .await?;
      for advertisement in advertisements {
        match discovered.get_mut(&advertisement.address) {
          Some(device) => {
            device.name = device.name.take().or(advertisement.name);
            device.rssi = advertisement.rssi;
          }
          None => {
            let matches = advertisement
              .name
              .as_deref()
              .is_some_and(|name| name.starts_with(&config.discovery.prefix));
            if matches {
              discovered.insert(
                advertisement.address.clone(),
                Discovered {
                  address: advertisement.address,
                  family: Family::Bt2,
                  name: advertisement.name,
                  rssi: advertisement.rssi,
                },
              );
            }
          }
        }
      }

      Ok(discovered.into_values().collect())
    }
  }
}
