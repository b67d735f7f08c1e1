use std::{collections::HashMap, sync::Arc, time::Duration};

use bluest::{Adapter, Characteristic, Device, Uuid};
use futures::StreamExt;
use tokio::sync::Mutex;

use super::frame;
use super::link::*;

#[derive(Debug, Clone)]
pub(crate) struct Advertisement {
  pub(crate) address: String,
  pub(crate) name: Option<String>,
  pub(crate) rssi: Option<i16>,
}

/// Bluetooth LE adapter plus the devices it has seen advertising.
#[derive(Clone)]
pub(crate) struct BleRadio {
  adapter: Adapter,
  devices: Arc<Mutex<HashMap<String, Device>>>,
  scan_duration: Duration,
}

impl BleRadio {
  pub(crate) async fn new(scan_duration: Duration) -> anyhow::Result<Self> {
    let adapter = Adapter::default()
      .await
      .ok_or_else(|| anyhow::anyhow!("Default Bluetooth adapter not found"))?;
    adapter.wait_available().await?;

    Ok(Self {
      adapter,
      devices: Arc::new(Mutex::new(HashMap::new())),
      scan_duration,
    })
  }

  /// Listens for advertisements for `duration` and remembers every device.
  #[tracing::instrument(skip(self))]
  pub(crate) async fn scan(
    &self,
    duration: Duration,
  ) -> Result<Vec<Advertisement>, bluest::Error> {
    let mut found = HashMap::new();
    {
      let mut events = self.adapter.scan(&[]).await?;
      let deadline = tokio::time::Instant::now() + duration;
      while let Ok(Some(advertising)) =
        tokio::time::timeout_at(deadline, events.next()).await
      {
        let address = advertising.device.id().to_string().to_uppercase();
        let name = advertising
          .adv_data
          .local_name
          .clone()
          .or_else(|| advertising.device.name().ok());
        tracing::trace!(
          "Heard {} {:?} at {:?} dBm",
          address,
          name,
          advertising.rssi
        );
        found.insert(
          address.clone(),
          (
            advertising.device,
            Advertisement {
              address,
              name,
              rssi: advertising.rssi,
            },
          ),
        );
      }
    }

    let mut devices = self.devices.lock().await;
    Ok(
      found
        .into_values()
        .map(|(device, advertisement)| {
          devices.insert(advertisement.address.clone(), device);
          advertisement
        })
        .collect(),
    )
  }

  async fn device(&self, address: &str) -> Result<Device, LinkError> {
    if let Some(device) = self.devices.lock().await.get(address) {
      return Ok(device.clone());
    }

    tracing::debug!("Scanning for unseen device {}", address);
    self.scan(self.scan_duration).await.map_err(io)?;

    self
      .devices
      .lock()
      .await
      .get(address)
      .cloned()
      .ok_or_else(|| LinkError::NotConnected(format!("{} not found", address)))
  }
}

#[async_trait::async_trait]
impl Connector for BleRadio {
  #[tracing::instrument(skip(self))]
  async fn connect(&self, target: &Target) -> Result<Box<dyn Link>, LinkError> {
    let device = self.device(&target.address).await?;
    let release = Release::new({
      let adapter = self.adapter.clone();
      let device = device.clone();
      let address = target.address.clone();
      async move {
        if let Err(error) = adapter.disconnect_device(&device).await {
          tracing::debug!("Failed disconnecting {}: {}", address, error);
        }
      }
    });

    self
      .adapter
      .connect_device(&device)
      .await
      .map_err(|error| LinkError::NotConnected(error.to_string()))?;

    let framing = target.family.framing();
    let write =
      characteristic(&device, framing.write_service, framing.write).await?;
    let notify =
      characteristic(&device, framing.notify_service, framing.notify).await?;
    release.disarm();

    Ok(Box::new(BleLink {
      adapter: self.adapter.clone(),
      device,
      write,
      notify,
    }))
  }
}

async fn characteristic(
  device: &Device,
  service: Uuid,
  characteristic: Uuid,
) -> Result<Characteristic, LinkError> {
  let service = device
    .discover_services_with_uuid(service)
    .await
    .map_err(io)?
    .first()
    .cloned()
    .ok_or_else(|| LinkError::Io(format!("Service {} not found", service)))?;

  service
    .discover_characteristics_with_uuid(characteristic)
    .await
    .map_err(io)?
    .first()
    .cloned()
    .ok_or_else(|| {
      LinkError::Io(format!("Characteristic {} not found", characteristic))
    })
}

struct BleLink {
  adapter: Adapter,
  device: Device,
  write: Characteristic,
  notify: Characteristic,
}

#[async_trait::async_trait]
impl Link for BleLink {
  async fn request(
    &mut self,
    request: &[u8],
    timeout: Duration,
  ) -> Result<Vec<u8>, LinkError> {
    let mut notifications = self.notify.notify().await.map_err(io)?;
    self.write.write(request).await.map_err(io)?;

    // NOTE: responses arrive split over several notifications
    let deadline = tokio::time::Instant::now() + timeout;
    let mut buffer = Vec::new();
    loop {
      if let Some(expected_len) = frame::expected_len(&buffer) {
        if buffer.len() >= expected_len {
          return Ok(buffer);
        }
      }

      match tokio::time::timeout_at(deadline, notifications.next()).await {
        Err(_) if buffer.is_empty() => return Err(LinkError::Timeout),
        Err(_) => return Ok(buffer),
        Ok(None) => {
          return Err(LinkError::NotConnected(
            "Notification stream ended".to_string(),
          ))
        }
        Ok(Some(Err(error))) => return Err(io(error)),
        Ok(Some(Ok(data))) => {
          tracing::trace!("Notification {}", hex::encode(&data));
          buffer.extend_from_slice(&data);
        }
      }
    }
  }

  async fn close(&mut self) {
    if let Err(error) = self.adapter.disconnect_device(&self.device).await {
      tracing::debug!("Failed disconnecting: {}", error);
    }
  }
}

fn io(error: bluest::Error) -> LinkError {
  LinkError::Io(error.to_string())
}
