//! Scripted in-memory devices answering register reads from an image.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::frame;
use super::link::*;
use super::span::SimpleSpan;

#[derive(Debug, Clone, Default)]
pub(crate) struct Behaviour {
  pub(crate) connect_delay: Duration,
  pub(crate) request_delay: Duration,
  pub(crate) refuse: bool,
  pub(crate) corrupt: bool,
}

#[derive(Debug, Default)]
struct State {
  image: HashMap<u16, u16>,
  behaviours: HashMap<String, Behaviour>,
  connects: HashMap<String, usize>,
  closes: HashMap<String, usize>,
  requests: HashMap<String, Vec<SimpleSpan>>,
  in_flight: HashMap<String, usize>,
  max_in_flight: HashMap<String, usize>,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct MockConnector {
  state: Arc<Mutex<State>>,
}

impl MockConnector {
  pub(crate) fn new(image: HashMap<u16, u16>) -> Self {
    Self {
      state: Arc::new(Mutex::new(State {
        image,
        ..State::default()
      })),
    }
  }

  pub(crate) fn set_register(&self, address: u16, value: u16) {
    self.state.lock().unwrap().image.insert(address, value);
  }

  pub(crate) fn behave(&self, address: &str, behaviour: Behaviour) {
    self
      .state
      .lock()
      .unwrap()
      .behaviours
      .insert(address.to_string(), behaviour);
  }

  pub(crate) fn connects(&self, address: &str) -> usize {
    count(&self.state.lock().unwrap().connects, address)
  }

  pub(crate) fn closes(&self, address: &str) -> usize {
    count(&self.state.lock().unwrap().closes, address)
  }

  pub(crate) fn requests(&self, address: &str) -> Vec<SimpleSpan> {
    self
      .state
      .lock()
      .unwrap()
      .requests
      .get(address)
      .cloned()
      .unwrap_or_default()
  }

  pub(crate) fn max_in_flight(&self, address: &str) -> usize {
    count(&self.state.lock().unwrap().max_in_flight, address)
  }

  fn behaviour(&self, address: &str) -> Behaviour {
    self
      .state
      .lock()
      .unwrap()
      .behaviours
      .get(address)
      .cloned()
      .unwrap_or_default()
  }
}

fn count(counts: &HashMap<String, usize>, address: &str) -> usize {
  counts.get(address).copied().unwrap_or(0)
}

#[async_trait::async_trait]
impl Connector for MockConnector {
  async fn connect(&self, target: &Target) -> Result<Box<dyn Link>, LinkError> {
    let behaviour = self.behaviour(&target.address);
    tokio::time::sleep(behaviour.connect_delay).await;
    if behaviour.refuse {
      return Err(LinkError::NotConnected(target.address.clone()));
    }

    *self
      .state
      .lock()
      .unwrap()
      .connects
      .entry(target.address.clone())
      .or_default() += 1;

    Ok(Box::new(MockLink {
      connector: self.clone(),
      target: target.clone(),
    }))
  }
}

struct MockLink {
  connector: MockConnector,
  target: Target,
}

struct InFlight {
  state: Arc<Mutex<State>>,
  address: String,
}

impl InFlight {
  fn enter(state: Arc<Mutex<State>>, address: String) -> Self {
    {
      let mut state = state.lock().unwrap();
      let in_flight = {
        let in_flight = state.in_flight.entry(address.clone()).or_default();
        *in_flight += 1;
        *in_flight
      };
      let max = state.max_in_flight.entry(address.clone()).or_default();
      *max = (*max).max(in_flight);
    }

    Self { state, address }
  }
}

impl Drop for InFlight {
  fn drop(&mut self) {
    if let Ok(mut state) = self.state.lock() {
      if let Some(in_flight) = state.in_flight.get_mut(&self.address) {
        *in_flight = in_flight.saturating_sub(1);
      }
    }
  }
}

#[async_trait::async_trait]
impl Link for MockLink {
  async fn request(
    &mut self,
    request: &[u8],
    _timeout: Duration,
  ) -> Result<Vec<u8>, LinkError> {
    let _in_flight = InFlight::enter(
      self.connector.state.clone(),
      self.target.address.clone(),
    );
    let behaviour = self.connector.behaviour(&self.target.address);
    tokio::time::sleep(behaviour.request_delay).await;

    if request.len() != 8 {
      return Err(LinkError::Io(format!(
        "bad request {}",
        hex::encode(request)
      )));
    }
    let span = SimpleSpan {
      address: u16::from_be_bytes([request[2], request[3]]),
      quantity: u16::from_be_bytes([request[4], request[5]]),
    };
    if span.quantity > self.target.family.framing().max_quantity {
      return Err(LinkError::Io(format!(
        "{} words is too much for {}",
        span.quantity, self.target.family
      )));
    }

    let words = {
      let mut state = self.connector.state.lock().unwrap();
      state
        .requests
        .entry(self.target.address.clone())
        .or_default()
        .push(span);
      (0..span.quantity)
        .map(|offset| {
          state
            .image
            .get(&span.address.wrapping_add(offset))
            .copied()
            .unwrap_or(0)
        })
        .collect::<Vec<_>>()
    };

    let mut response = frame::response(request[0], &words);
    if behaviour.corrupt {
      if let Some(last) = response.last_mut() {
        *last ^= 0xFF;
      }
    }

    Ok(response)
  }

  async fn close(&mut self) {
    *self
      .connector
      .state
      .lock()
      .unwrap()
      .closes
      .entry(self.target.address.clone())
      .or_default() += 1;
  }
}

fn write_text(
  image: &mut HashMap<u16, u16>,
  address: u16,
  text: &str,
  words: u16,
) {
  let mut bytes = text.as_bytes().to_vec();
  bytes.resize(words as usize * 2, b' ');
  for (offset, pair) in bytes.chunks_exact(2).enumerate() {
    image.insert(
      address + offset as u16,
      u16::from_be_bytes([pair[0], pair[1]]),
    );
  }
}

/// A healthy controller charging a lithium battery in MPPT mode.
pub(crate) fn rover_image() -> HashMap<u16, u16> {
  let mut image = HashMap::new();

  write_text(&mut image, 0x000C, "RNG-CTRL-RVR40", 8);
  image.insert(0x0014, 0x0001);
  image.insert(0x0015, 0x0203);
  image.insert(0x0016, 0x0001);
  image.insert(0x0017, 0x0000);
  image.insert(0x0018, 0x0001);
  image.insert(0x0019, 0xE240);
  image.insert(0x001A, 0x0001);

  image.insert(0x0100, 80);
  image.insert(0x0101, 132);
  image.insert(0x0102, 250);
  image.insert(0x0103, 0x1A19);
  image.insert(0x0107, 186);
  image.insert(0x0108, 180);
  image.insert(0x0109, 33);
  image.insert(0x0120, 0x0002);

  image.insert(0xE004, 4);

  image
}
