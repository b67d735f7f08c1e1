use chrono::{DateTime, Utc};
use serde::Serialize;

use super::renogy::{DeviceIdentity, Measurement, Status, Transition};

#[derive(Debug, Clone, Serialize)]
pub(crate) struct Reading {
  pub(crate) address: String,
  pub(crate) name: Option<String>,
  pub(crate) identity: Option<DeviceIdentity>,
  pub(crate) status: Status,
  pub(crate) status_since: DateTime<Utc>,
  pub(crate) timestamp: DateTime<Utc>,
  pub(crate) rssi: Option<i16>,
  pub(crate) measurements: Vec<Measurement>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub(crate) enum Event {
  Reading(Reading),
  Transition(Transition),
}

pub(crate) type EventSender = flume::Sender<Event>;
pub(crate) type EventReceiver = flume::Receiver<Event>;

/// Logs every event as json until all senders are gone.
pub(crate) async fn log_events(receiver: EventReceiver) {
  while let Ok(event) = receiver.recv_async().await {
    match serde_json::to_string(&event) {
      Ok(json) => tracing::info!(target: "renogy::output", "{}", json),
      Err(error) => {
        tracing::error! {
          %error,
          "Failed serializing event"
        }
      }
    }
  }

  tracing::debug!("Event channel closed");
}
