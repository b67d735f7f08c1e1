use std::sync::Arc;

use futures_time::future::FutureExt;
use rust_decimal::prelude::ToPrimitive;
use serde::Serialize;

use super::family::Family;
use super::frame;
use super::link::*;
use super::register::{self, *};
use super::rover;
use super::span::Span;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum CycleOutcome {
  Success(Vec<Measurement>),
  TransportFailure(TransportFailure),
  DecodeFailure(DecodeFailure),
}

impl CycleOutcome {
  pub(crate) fn is_success(&self) -> bool {
    matches!(self, CycleOutcome::Success(_))
  }

  pub(crate) fn kind(&self) -> &'static str {
    match self {
      CycleOutcome::Success(_) => "success",
      CycleOutcome::TransportFailure(_) => "transport",
      CycleOutcome::DecodeFailure(_) => "decode",
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub(crate) struct DeviceIdentity {
  pub(crate) address: String,
  pub(crate) family: Family,
  pub(crate) display_model: String,
  pub(crate) firmware_version: String,
  pub(crate) serial: String,
}

const UNKNOWN: &str = "unknown";

impl DeviceIdentity {
  fn resolve(target: &Target, measurements: &[Measurement]) -> Self {
    let find = |name: &str| {
      measurements
        .iter()
        .find(|measurement| measurement.name == name)
        .map(|measurement| &measurement.value)
    };

    let display_model = match find(rover::MODEL) {
      Some(Value::Text(model)) if !model.is_empty() => model.clone(),
      _ => UNKNOWN.to_string(),
    };
    let firmware_version = match find(rover::SOFTWARE_VERSION) {
      Some(Value::Number(version)) => match version.to_u32() {
        Some(version) => format!(
          "V{:02}.{:02}.{:02}",
          (version >> 16) & 0xFF,
          (version >> 8) & 0xFF,
          version & 0xFF
        ),
        None => UNKNOWN.to_string(),
      },
      _ => UNKNOWN.to_string(),
    };
    let serial = match find(rover::SERIAL_NUMBER) {
      Some(Value::Number(serial)) => serial.to_string(),
      _ => UNKNOWN.to_string(),
    };

    Self {
      address: target.address.clone(),
      family: target.family,
      display_model,
      firmware_version,
      serial,
    }
  }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Params {
  pub(crate) response_timeout: chrono::Duration,
  pub(crate) keep_connected: bool,
}

/// Transport handle and cached identity of one device.
pub(crate) struct Session {
  target: Target,
  connector: Arc<dyn Connector>,
  sections: Arc<Vec<Section>>,
  params: Params,
  link: Option<Box<dyn Link>>,
  identity: Option<DeviceIdentity>,
}

impl Session {
  pub(crate) fn new(
    target: Target,
    connector: Arc<dyn Connector>,
    sections: Arc<Vec<Section>>,
    params: Params,
  ) -> Self {
    Self {
      target,
      connector,
      sections,
      params,
      link: None,
      identity: None,
    }
  }

  pub(crate) fn target(&self) -> &Target {
    &self.target
  }

  pub(crate) fn identity(&self) -> Option<&DeviceIdentity> {
    self.identity.as_ref()
  }

  #[cfg(test)]
  pub(crate) fn is_connected(&self) -> bool {
    self.link.is_some()
  }

  /// Connects if needed and reads every section once.
  ///
  /// Connecting and reading share `timeout`.
  #[tracing::instrument(skip(self), fields(address = %self.target.address))]
  pub(crate) async fn read_cycle(
    &mut self,
    timeout: chrono::Duration,
  ) -> CycleOutcome {
    let outcome = match self.read_sections().timeout(to_futures(timeout)).await
    {
      Ok(outcome) => outcome,
      Err(_) => CycleOutcome::TransportFailure(TransportFailure::Timeout),
    };

    match &outcome {
      CycleOutcome::Success(measurements) => {
        tracing::trace!(
          "Read {} measurements from {}",
          measurements.len(),
          self.target.address
        );
      }
      CycleOutcome::TransportFailure(failure) => {
        tracing::warn!(
          kind = outcome.kind(),
          "Cycle for {} failed: {}",
          self.target.address,
          failure
        );
      }
      CycleOutcome::DecodeFailure(failure) => {
        tracing::warn!(
          kind = outcome.kind(),
          field = failure.field(),
          "Cycle for {} failed: {}",
          self.target.address,
          failure
        );
      }
    }

    if matches!(outcome, CycleOutcome::TransportFailure(_))
      || !self.params.keep_connected
    {
      self.close().await;
    }

    outcome
  }

  pub(crate) async fn close(&mut self) {
    if let Some(mut link) = self.link.take() {
      if link
        .close()
        .timeout(to_futures(self.params.response_timeout))
        .await
        .is_err()
      {
        tracing::debug!("Timed out closing link to {}", self.target.address);
      }
    }
  }

  async fn read_sections(&mut self) -> CycleOutcome {
    if self.link.is_none() {
      match self.connector.connect(&self.target).await {
        Ok(link) => self.link = Some(link),
        Err(error) => return CycleOutcome::TransportFailure(error.into()),
      }
    }
    let Some(link) = self.link.as_mut() else {
      return CycleOutcome::TransportFailure(TransportFailure::NotConnected(
        self.target.address.clone(),
      ));
    };

    let sections = self.sections.clone();
    let mut measurements = Vec::new();
    let mut identity = None;
    for section in sections.iter() {
      let words = match read_section(
        link.as_mut(),
        self.target.family,
        section,
        to_std(self.params.response_timeout),
      )
      .await
      {
        Ok(words) => words,
        Err(failure) => return CycleOutcome::TransportFailure(failure),
      };

      let block = RawBlock {
        version: section.map.version(),
        words,
      };
      match register::decode(&block, &section.map) {
        Ok(decoded) if section.identity => identity = Some(decoded),
        Ok(decoded) => measurements.extend(decoded),
        // identity is frozen once resolved
        Err(failure) if section.identity && self.identity.is_some() => {
          tracing::warn!(
            field = failure.field(),
            "Ignoring unreadable identity for {}: {} ({})",
            self.target.address,
            failure,
            hex::encode(words_to_bytes(&block.words))
          );
        }
        Err(failure) => return CycleOutcome::DecodeFailure(failure),
      }
    }

    if let Some(identity) = identity {
      self.resolve_identity(&identity);
    }

    CycleOutcome::Success(measurements)
  }

  fn resolve_identity(&mut self, measurements: &[Measurement]) {
    let resolved = DeviceIdentity::resolve(&self.target, measurements);
    match &self.identity {
      None => {
        tracing::info!(
          "Resolved {} as {} {} serial {}",
          self.target.address,
          resolved.display_model,
          resolved.firmware_version,
          resolved.serial
        );
        self.identity = Some(resolved);
      }
      Some(identity) if *identity != resolved => {
        tracing::warn!(
          "Ignoring changed identity for {}: {:?} instead of {:?}",
          self.target.address,
          resolved,
          identity
        );
      }
      Some(_) => {}
    }
  }
}

async fn read_section(
  link: &mut dyn Link,
  family: Family,
  section: &Section,
  response_timeout: std::time::Duration,
) -> Result<Vec<u16>, TransportFailure> {
  let mut words = Vec::with_capacity(section.quantity() as usize);
  for (span, request) in family.requests(section) {
    tracing::trace!(
      "Requesting {} words at {:#06x}: {}",
      span.quantity,
      span.address,
      hex::encode(&request)
    );
    let response = link.request(&request, response_timeout).await?;
    words.extend(frame::parse_response(&response, span)?);
  }

  Ok(words)
}

fn words_to_bytes(words: &[u16]) -> Vec<u8> {
  words.iter().flat_map(|word| word.to_be_bytes()).collect()
}

fn to_futures(duration: chrono::Duration) -> futures_time::time::Duration {
  futures_time::time::Duration::from_millis(
    duration.num_milliseconds().max(0) as u64,
  )
}

fn to_std(duration: chrono::Duration) -> std::time::Duration {
  duration.to_std().unwrap_or_default()
}

#[cfg(test)]
mod tests {
  use crate::service::renogy::mock::*;

  use super::*;

  fn params() -> Params {
    Params {
      response_timeout: chrono::Duration::milliseconds(200),
      keep_connected: false,
    }
  }

  fn session(connector: &MockConnector, family: Family) -> Session {
    Session::new(
      Target {
        address: "AA:BB:CC:DD:EE:01".to_string(),
        family,
      },
      Arc::new(connector.clone()),
      Arc::new(rover::sections().unwrap()),
      params(),
    )
  }

  fn value(measurements: &[Measurement], name: &str) -> String {
    measurements
      .iter()
      .find(|measurement| measurement.name == name)
      .map(|measurement| measurement.value.to_string())
      .unwrap()
  }

  #[tokio::test]
  async fn reads_and_resolves_identity() {
    let connector = MockConnector::new(rover_image());
    let mut session = session(&connector, Family::Bt2);

    let outcome = session.read_cycle(chrono::Duration::seconds(5)).await;

    let CycleOutcome::Success(measurements) = outcome else {
      panic!("cycle failed");
    };
    assert_eq!(value(&measurements, "battery_voltage"), "13.2");
    assert_eq!(value(&measurements, "charging_status"), "mppt");
    assert_eq!(value(&measurements, "battery_type"), "lithium");
    assert!(measurements.iter().all(|measurement| measurement.name != "model"));

    let identity = session.identity().unwrap();
    assert_eq!(identity.display_model, "RNG-CTRL-RVR40");
    assert_eq!(identity.firmware_version, "V01.02.03");
    assert_eq!(identity.serial, "123456");
    assert_eq!(identity.family, Family::Bt2);

    assert!(!session.is_connected());
    assert_eq!(connector.closes("AA:BB:CC:DD:EE:01"), 1);
  }

  #[tokio::test]
  async fn bt1_reads_in_small_requests() {
    let connector = MockConnector::new(rover_image());
    let mut session = session(&connector, Family::Bt1);

    let outcome = session.read_cycle(chrono::Duration::seconds(5)).await;

    assert!(outcome.is_success());
    let requests = connector.requests("AA:BB:CC:DD:EE:01");
    assert_eq!(requests.len(), 5);
    assert!(requests.iter().all(|span| span.quantity <= 16));
  }

  #[tokio::test]
  async fn identity_is_frozen_after_first_success() {
    let connector = MockConnector::new(rover_image());
    let mut session = session(&connector, Family::Bt2);
    assert!(session.identity().is_none());

    session.read_cycle(chrono::Duration::seconds(5)).await;
    connector.set_register(0x0019, 0x0001);
    let outcome = session.read_cycle(chrono::Duration::seconds(5)).await;

    assert!(outcome.is_success());
    assert_eq!(session.identity().unwrap().serial, "123456");
  }

  #[tokio::test]
  async fn garbled_identity_after_resolution_is_ignored() {
    let connector = MockConnector::new(rover_image());
    let mut session = session(&connector, Family::Bt2);
    let first = session.read_cycle(chrono::Duration::seconds(5)).await;
    assert!(first.is_success());

    connector.set_register(0x000C, 0xFFFE);
    let outcome = session.read_cycle(chrono::Duration::seconds(5)).await;

    let CycleOutcome::Success(measurements) = outcome else {
      panic!("cycle failed");
    };
    assert_eq!(value(&measurements, "battery_voltage"), "13.2");
    assert_eq!(session.identity().unwrap().display_model, "RNG-CTRL-RVR40");
  }

  #[tokio::test]
  async fn garbled_identity_before_resolution_fails_cycle() {
    let connector = MockConnector::new(rover_image());
    connector.set_register(0x000C, 0xFFFE);
    let mut session = session(&connector, Family::Bt2);

    let outcome = session.read_cycle(chrono::Duration::seconds(5)).await;

    assert!(matches!(
      outcome,
      CycleOutcome::DecodeFailure(DecodeFailure::InvalidText {
        field: "model",
        ..
      })
    ));
    assert!(session.identity().is_none());
  }

  #[tokio::test]
  async fn slow_device_times_out() {
    let connector = MockConnector::new(rover_image());
    connector.behave(
      "AA:BB:CC:DD:EE:01",
      Behaviour {
        request_delay: std::time::Duration::from_millis(500),
        ..Behaviour::default()
      },
    );
    let mut session = session(&connector, Family::Bt2);

    let outcome = session
      .read_cycle(chrono::Duration::milliseconds(50))
      .await;

    assert_eq!(
      outcome,
      CycleOutcome::TransportFailure(TransportFailure::Timeout)
    );
    assert!(!session.is_connected());
    assert!(session.identity().is_none());
  }

  #[tokio::test]
  async fn refused_connection_is_not_connected() {
    let connector = MockConnector::new(rover_image());
    connector.behave(
      "AA:BB:CC:DD:EE:01",
      Behaviour {
        refuse: true,
        ..Behaviour::default()
      },
    );
    let mut session = session(&connector, Family::Bt2);

    let outcome = session.read_cycle(chrono::Duration::seconds(5)).await;

    assert!(matches!(
      outcome,
      CycleOutcome::TransportFailure(TransportFailure::NotConnected(_))
    ));
  }

  #[tokio::test]
  async fn corrupted_response_is_checksum_mismatch() {
    let connector = MockConnector::new(rover_image());
    connector.behave(
      "AA:BB:CC:DD:EE:01",
      Behaviour {
        corrupt: true,
        ..Behaviour::default()
      },
    );
    let mut session = session(&connector, Family::Bt2);

    let outcome = session.read_cycle(chrono::Duration::seconds(5)).await;

    assert!(matches!(
      outcome,
      CycleOutcome::TransportFailure(TransportFailure::ChecksumMismatch { .. })
    ));
    assert!(!session.is_connected());
  }

  #[tokio::test]
  async fn unknown_charging_status_fails_whole_cycle() {
    let connector = MockConnector::new(rover_image());
    connector.set_register(0x0120, 0x0009);
    let mut session = session(&connector, Family::Bt2);

    let outcome = session.read_cycle(chrono::Duration::seconds(5)).await;

    match outcome {
      CycleOutcome::DecodeFailure(DecodeFailure::UnknownEnumCode {
        field,
        code,
        ..
      }) => {
        assert_eq!(field, "charging_status");
        assert_eq!(code, 9);
      }
      other => panic!("unexpected {other:?}"),
    }
  }

  #[tokio::test]
  async fn keeps_link_open_when_asked() {
    let connector = MockConnector::new(rover_image());
    let mut session = Session::new(
      Target {
        address: "AA:BB:CC:DD:EE:01".to_string(),
        family: Family::Bt2,
      },
      Arc::new(connector.clone()),
      Arc::new(rover::sections().unwrap()),
      Params {
        keep_connected: true,
        ..params()
      },
    );

    session.read_cycle(chrono::Duration::seconds(5)).await;
    session.read_cycle(chrono::Duration::seconds(5)).await;

    assert!(session.is_connected());
    assert_eq!(connector.connects("AA:BB:CC:DD:EE:01"), 1);

    session.close().await;
    assert!(!session.is_connected());
    assert_eq!(connector.closes("AA:BB:CC:DD:EE:01"), 1);
  }
}
