pub(crate) mod discovery;
pub(crate) mod output;
pub(crate) mod renogy;
pub(crate) mod scheduler;

use std::sync::Arc;

use crate::config;

use self::discovery::Discovery;
use self::output::EventSender;
use self::scheduler::Scheduler;

#[derive(Clone)]
pub(crate) struct Container {
  scheduler: Scheduler,
  discovery: Arc<dyn Discovery>,
}

impl Container {
  /// Wires the protocol core to the Bluetooth radio.
  ///
  /// Fails on an invalid register table or a missing adapter.
  pub(crate) async fn new(
    config: config::Manager,
    values: &config::Values,
    events: EventSender,
  ) -> anyhow::Result<Self> {
    let sections = Arc::new(renogy::rover::sections()?);
    let params = scheduler::Params::new(values);

    #[cfg(feature = "ble")]
    {
      let radio =
        renogy::ble::BleRadio::new(values.discovery.scan_duration.to_std()?)
          .await?;
      let discovery: Arc<dyn Discovery> = if values.discovery.scan {
        Arc::new(discovery::BleDiscovery::new(config, radio.clone()))
      } else {
        Arc::new(discovery::StaticDiscovery::new(config))
      };

      Ok(Self {
        scheduler: Scheduler::new(Arc::new(radio), sections, params, events),
        discovery,
      })
    }

    #[cfg(not(feature = "ble"))]
    {
      let _ = (config, sections, params, events);
      anyhow::bail!("Built without Bluetooth support, enable the ble feature")
    }
  }

  pub(crate) fn scheduler(&self) -> &Scheduler {
    &self.scheduler
  }

  pub(crate) fn discovery(&self) -> &dyn Discovery {
    self.discovery.as_ref()
  }
}
