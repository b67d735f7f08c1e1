use std::collections::{hash_map::Entry, HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::config;

use super::discovery::Discovered;
use super::output::{Event, EventSender, Reading};
use super::renogy::session;
use super::renogy::*;

#[derive(Debug, Clone, Copy)]
pub(crate) struct Params {
  pub(crate) cycle_timeout: chrono::Duration,
  pub(crate) failure_threshold: u32,
  pub(crate) retention: u32,
  pub(crate) unavailable_retry_interval: chrono::Duration,
  pub(crate) session: session::Params,
}

impl Params {
  pub(crate) fn new(config: &config::Values) -> Self {
    Self {
      cycle_timeout: config.cycle_timeout,
      failure_threshold: config.failure_threshold,
      retention: config.discovery.retention,
      unavailable_retry_interval: config.unavailable_retry_interval,
      session: session::Params {
        response_timeout: config.response_timeout,
        keep_connected: config.keep_connected,
      },
    }
  }
}

struct Slot {
  session: Session,
  tracker: Tracker,
}

struct Member {
  family: Family,
  name: Option<String>,
  rssi: Option<i16>,
  missed: u32,
  slot: Arc<Mutex<Slot>>,
}

/// What one tick did with each known device.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Tick {
  pub(crate) started: usize,
  pub(crate) skipped: usize,
  pub(crate) throttled: usize,
}

#[derive(Clone)]
pub(crate) struct Scheduler {
  members: Arc<Mutex<HashMap<String, Member>>>,
  connector: Arc<dyn Connector>,
  sections: Arc<Vec<Section>>,
  params: Params,
  events: EventSender,
  token: CancellationToken,
  tasks: TaskTracker,
}

impl Scheduler {
  pub(crate) fn new(
    connector: Arc<dyn Connector>,
    sections: Arc<Vec<Section>>,
    params: Params,
    events: EventSender,
  ) -> Self {
    Self {
      members: Arc::new(Mutex::new(HashMap::new())),
      connector,
      sections,
      params,
      events,
      token: CancellationToken::new(),
      tasks: TaskTracker::new(),
    }
  }

  pub(crate) async fn len(&self) -> usize {
    self.members.clone().lock_owned().await.len()
  }

  /// Applies one discovery round to the set of polled devices.
  ///
  /// Devices missing from more than `retention` rounds in a row are
  /// dropped and their links closed.
  #[tracing::instrument(skip_all, fields(count = discovered.len()))]
  pub(crate) async fn refresh(&self, discovered: Vec<Discovered>) {
    let now = Utc::now();
    let mut dropped = Vec::new();
    {
      let mut members = self.members.clone().lock_owned().await;
      let mut seen = HashSet::new();

      for device in discovered {
        seen.insert(device.address.clone());
        match members.entry(device.address.clone()) {
          Entry::Occupied(mut entry) if entry.get().family == device.family => {
            let member = entry.get_mut();
            member.missed = 0;
            member.name = device.name.or(member.name.take());
            member.rssi = device.rssi;
          }
          Entry::Occupied(mut entry) => {
            tracing::info!(
              "Device {} changed from {} to {}",
              device.address,
              entry.get().family,
              device.family
            );
            dropped.push(entry.insert(self.member(device, now)));
          }
          Entry::Vacant(entry) => {
            tracing::info!(
              "Tracking {} {} {:?}",
              device.family,
              device.address,
              device.name
            );
            entry.insert(self.member(device, now));
          }
        }
      }

      for (address, member) in members.iter_mut() {
        if !seen.contains(address) {
          member.missed = member.missed.saturating_add(1);
          tracing::debug!(
            "Device {} missed {} discovery rounds",
            address,
            member.missed
          );
        }
      }

      let gone = members
        .iter()
        .filter(|(_, member)| member.missed > self.params.retention)
        .map(|(address, _)| address.clone())
        .collect::<Vec<_>>();
      for address in gone {
        if let Some(member) = members.remove(&address) {
          tracing::info!("Dropping {} after {} misses", address, member.missed);
          dropped.push(member);
        }
      }
    }

    for member in dropped {
      self.tasks.spawn(async move {
        member.slot.lock_owned().await.session.close().await;
      });
    }
  }

  fn member(&self, device: Discovered, now: chrono::DateTime<Utc>) -> Member {
    let session = Session::new(
      Target {
        address: device.address.clone(),
        family: device.family,
      },
      self.connector.clone(),
      self.sections.clone(),
      self.params.session,
    );
    let tracker =
      Tracker::new(device.address, self.params.failure_threshold, now);

    Member {
      family: device.family,
      name: device.name,
      rssi: device.rssi,
      missed: 0,
      slot: Arc::new(Mutex::new(Slot { session, tracker })),
    }
  }

  /// Starts a cycle for every idle device without waiting for any of them.
  #[tracing::instrument(skip(self))]
  pub(crate) async fn tick(&self) -> Tick {
    let mut tick = Tick::default();
    if self.token.is_cancelled() {
      return tick;
    }

    let now = Utc::now();
    let members = self.members.clone().lock_owned().await;
    for (address, member) in members.iter() {
      let Ok(slot) = member.slot.clone().try_lock_owned() else {
        tracing::debug!("Skipping {} with a cycle still running", address);
        tick.skipped += 1;
        continue;
      };

      if !slot
        .tracker
        .should_poll(now, self.params.unavailable_retry_interval)
      {
        tick.throttled += 1;
        continue;
      }

      tick.started += 1;
      let scheduler = self.clone();
      let name = member.name.clone();
      let rssi = member.rssi;
      self
        .tasks
        .spawn(async move { scheduler.cycle(slot, name, rssi).await });
    }

    tracing::trace!("{:?}", tick);

    tick
  }

  async fn cycle(
    &self,
    mut slot: OwnedMutexGuard<Slot>,
    name: Option<String>,
    rssi: Option<i16>,
  ) {
    let outcome = tokio::select! {
      _ = self.token.cancelled() => None,
      outcome = slot.session.read_cycle(self.params.cycle_timeout) => {
        Some(outcome)
      }
    };
    let Some(outcome) = outcome else {
      slot.session.close().await;
      return;
    };

    let now = Utc::now();
    let slot = &mut *slot;
    if let Some(transition) = slot.tracker.record(&outcome, now) {
      match transition.to {
        Status::Unavailable => tracing::warn!(
          "{} unavailable after {} failed cycles",
          transition.address,
          transition.consecutive_failures
        ),
        Status::Available => {
          tracing::info!("{} available again", transition.address)
        }
      }
      self.emit(Event::Transition(transition)).await;
    } else if !outcome.is_success() {
      tracing::debug!(
        "{} failed {} cycles in a row",
        slot.session.target().address,
        slot.tracker.consecutive_failures()
      );
    }

    if let CycleOutcome::Success(measurements) = outcome {
      let target = slot.session.target();
      self
        .emit(Event::Reading(Reading {
          address: target.address.clone(),
          name,
          identity: slot.session.identity().cloned(),
          status: slot.tracker.status(),
          status_since: slot.tracker.last_transition(),
          timestamp: now,
          rssi,
          measurements,
        }))
        .await;
    }
  }

  async fn emit(&self, event: Event) {
    if let Err(error) = self.events.send_async(event).await {
      tracing::debug!("Dropping event with no receiver {:?}", error.0);
    }
  }

  /// Cancels running cycles and closes every link.
  #[tracing::instrument(skip(self))]
  pub(crate) async fn shutdown(&self) {
    self.token.cancel();
    self.tasks.close();
    self.tasks.wait().await;

    let members = {
      let mut members = self.members.clone().lock_owned().await;
      members.drain().map(|(_, member)| member).collect::<Vec<_>>()
    };
    for member in members {
      member.slot.lock_owned().await.session.close().await;
    }

    tracing::info!("Scheduler shut down");
  }
}

#[cfg(test)]
impl Scheduler {
  async fn settle(&self) {
    self.tasks.close();
    self.tasks.wait().await;
    self.tasks.reopen();
  }

  async fn status(&self, address: &str) -> Option<(Status, u32)> {
    let slot = {
      let members = self.members.clone().lock_owned().await;
      members.get(address)?.slot.clone()
    };
    let slot = slot.lock_owned().await;

    Some((slot.tracker.status(), slot.tracker.consecutive_failures()))
  }
}

#[cfg(test)]
mod tests {
  use std::time::Duration;

  use crate::service::renogy::link::TransportFailure;
  use crate::service::renogy::mock::*;

  use super::*;

  const FAST: &str = "AA:BB:CC:DD:EE:01";
  const SLOW: &str = "AA:BB:CC:DD:EE:02";

  fn params() -> Params {
    Params {
      cycle_timeout: chrono::Duration::milliseconds(300),
      failure_threshold: 3,
      retention: 2,
      unavailable_retry_interval: chrono::Duration::zero(),
      session: session::Params {
        response_timeout: chrono::Duration::milliseconds(100),
        keep_connected: false,
      },
    }
  }

  fn scheduler(
    connector: &MockConnector,
    params: Params,
  ) -> (Scheduler, flume::Receiver<Event>) {
    let (sender, receiver) = flume::unbounded();
    let scheduler = Scheduler::new(
      Arc::new(connector.clone()),
      Arc::new(rover::sections().unwrap()),
      params,
      sender,
    );
    (scheduler, receiver)
  }

  fn device(address: &str) -> Discovered {
    Discovered {
      address: address.to_string(),
      family: Family::Bt2,
      name: Some("BT-TH-TEST".to_string()),
      rssi: Some(-60),
    }
  }

  fn slow(connector: &MockConnector, address: &str, delay: Duration) {
    connector.behave(
      address,
      Behaviour {
        request_delay: delay,
        ..Behaviour::default()
      },
    );
  }

  #[tokio::test]
  async fn successful_cycle_emits_reading_with_identity() {
    let connector = MockConnector::new(rover_image());
    let (scheduler, events) = scheduler(&connector, params());
    scheduler.refresh(vec![device(FAST)]).await;

    let tick = scheduler.tick().await;
    scheduler.settle().await;

    assert_eq!(tick.started, 1);
    match events.try_recv().unwrap() {
      Event::Reading(reading) => {
        assert_eq!(reading.address, FAST);
        assert_eq!(reading.status, Status::Available);
        assert_eq!(reading.rssi, Some(-60));
        assert_eq!(reading.identity.unwrap().serial, "123456");
        assert!(!reading.measurements.is_empty());
      }
      other => panic!("unexpected {other:?}"),
    }
    assert!(events.try_recv().is_err());
  }

  #[tokio::test]
  async fn busy_device_is_skipped() {
    let connector = MockConnector::new(rover_image());
    slow(&connector, SLOW, Duration::from_millis(100));
    let (scheduler, _events) = scheduler(
      &connector,
      Params {
        cycle_timeout: chrono::Duration::seconds(5),
        ..params()
      },
    );
    scheduler.refresh(vec![device(SLOW)]).await;

    let first = scheduler.tick().await;
    let second = scheduler.tick().await;
    scheduler.settle().await;

    assert_eq!(first.started, 1);
    assert_eq!(second.skipped, 1);
    assert_eq!(second.started, 0);
    assert_eq!(connector.max_in_flight(SLOW), 1);
    assert_eq!(connector.connects(SLOW), 1);
  }

  #[tokio::test]
  async fn slow_device_does_not_delay_others() {
    let connector = MockConnector::new(rover_image());
    slow(&connector, SLOW, Duration::from_secs(2));
    let (scheduler, events) = scheduler(&connector, params());
    scheduler.refresh(vec![device(FAST), device(SLOW)]).await;

    let started = std::time::Instant::now();
    let tick = scheduler.tick().await;
    assert_eq!(tick.started, 2);

    let first =
      tokio::time::timeout(Duration::from_secs(1), events.recv_async())
        .await
        .unwrap()
        .unwrap();
    match first {
      Event::Reading(reading) => assert_eq!(reading.address, FAST),
      other => panic!("unexpected {other:?}"),
    }
    assert!(started.elapsed() < Duration::from_secs(1));

    scheduler.settle().await;
    assert_eq!(scheduler.status(SLOW).await, Some((Status::Available, 1)));
    assert_eq!(scheduler.status(FAST).await, Some((Status::Available, 0)));
  }

  #[tokio::test]
  async fn repeated_failures_mark_only_the_failing_device() {
    let connector = MockConnector::new(rover_image());
    connector.behave(
      SLOW,
      Behaviour {
        refuse: true,
        ..Behaviour::default()
      },
    );
    let (scheduler, events) = scheduler(&connector, params());
    scheduler.refresh(vec![device(FAST), device(SLOW)]).await;

    for _ in 0..4 {
      scheduler.tick().await;
      scheduler.settle().await;
    }

    let events = events.drain().collect::<Vec<_>>();
    let transitions = events
      .iter()
      .filter_map(|event| match event {
        Event::Transition(transition) => Some(transition),
        Event::Reading(_) => None,
      })
      .collect::<Vec<_>>();
    let readings = events
      .iter()
      .filter(|event| matches!(event, Event::Reading(_)))
      .count();

    assert_eq!(transitions.len(), 1);
    assert_eq!(transitions[0].address, SLOW);
    assert_eq!(transitions[0].to, Status::Unavailable);
    assert_eq!(readings, 4);
    assert_eq!(scheduler.status(SLOW).await, Some((Status::Unavailable, 4)));
    assert_eq!(scheduler.status(FAST).await, Some((Status::Available, 0)));

    connector.behave(SLOW, Behaviour::default());
    scheduler.tick().await;
    scheduler.settle().await;
    assert_eq!(scheduler.status(SLOW).await, Some((Status::Available, 0)));
  }

  #[tokio::test]
  async fn unavailable_devices_respect_retry_interval() {
    let connector = MockConnector::new(rover_image());
    connector.behave(
      FAST,
      Behaviour {
        refuse: true,
        ..Behaviour::default()
      },
    );
    let (scheduler, _events) = scheduler(
      &connector,
      Params {
        failure_threshold: 1,
        unavailable_retry_interval: chrono::Duration::seconds(600),
        ..params()
      },
    );
    scheduler.refresh(vec![device(FAST)]).await;

    scheduler.tick().await;
    scheduler.settle().await;
    let tick = scheduler.tick().await;

    assert_eq!(tick.throttled, 1);
    assert_eq!(tick.started, 0);
  }

  #[tokio::test]
  async fn devices_survive_missed_rounds_up_to_retention() {
    let connector = MockConnector::new(rover_image());
    let (scheduler, _events) = scheduler(&connector, params());
    scheduler.refresh(vec![device(FAST), device(SLOW)]).await;
    assert_eq!(scheduler.len().await, 2);

    scheduler.refresh(vec![device(FAST)]).await;
    scheduler.refresh(vec![device(FAST)]).await;
    assert_eq!(scheduler.len().await, 2);

    scheduler.refresh(vec![device(FAST)]).await;
    assert_eq!(scheduler.len().await, 1);
    assert_eq!(scheduler.status(SLOW).await, None);

    scheduler.refresh(vec![device(SLOW)]).await;
    assert_eq!(scheduler.len().await, 2);
  }

  #[tokio::test]
  async fn reappearing_device_resets_missed_rounds() {
    let connector = MockConnector::new(rover_image());
    let (scheduler, _events) = scheduler(&connector, params());
    scheduler.refresh(vec![device(FAST)]).await;

    for _ in 0..5 {
      scheduler.refresh(vec![]).await;
      scheduler.refresh(vec![device(FAST)]).await;
    }

    assert_eq!(scheduler.len().await, 1);
  }

  #[tokio::test]
  async fn shutdown_cancels_running_cycles_and_closes_links() {
    let connector = MockConnector::new(rover_image());
    slow(&connector, SLOW, Duration::from_secs(5));
    let (scheduler, events) = scheduler(
      &connector,
      Params {
        cycle_timeout: chrono::Duration::seconds(30),
        ..params()
      },
    );
    scheduler.refresh(vec![device(SLOW)]).await;
    scheduler.tick().await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let started = std::time::Instant::now();
    scheduler.shutdown().await;

    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(connector.closes(SLOW), 1);
    assert_eq!(scheduler.len().await, 0);
    assert!(events.try_recv().is_err());
    assert_eq!(scheduler.tick().await, Tick::default());
  }

  #[tokio::test]
  async fn timeout_counts_as_failure() {
    let connector = MockConnector::new(rover_image());
    slow(&connector, SLOW, Duration::from_secs(2));
    let (scheduler, _events) = scheduler(&connector, params());
    scheduler.refresh(vec![device(SLOW)]).await;

    scheduler.tick().await;
    scheduler.settle().await;

    assert_eq!(scheduler.status(SLOW).await, Some((Status::Available, 1)));
    assert!(!CycleOutcome::TransportFailure(TransportFailure::Timeout)
      .is_success());
  }
}
