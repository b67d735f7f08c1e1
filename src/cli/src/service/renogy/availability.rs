use chrono::{DateTime, Utc};
use serde::Serialize;

use super::session::CycleOutcome;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum Status {
  Available,
  Unavailable,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub(crate) struct Transition {
  pub(crate) address: String,
  pub(crate) from: Status,
  pub(crate) to: Status,
  pub(crate) timestamp: DateTime<Utc>,
  pub(crate) consecutive_failures: u32,
}

/// Turns cycle outcomes of one device into an availability signal.
///
/// Goes unavailable after `threshold` consecutive failures and comes back
/// on the first success.
#[derive(Debug, Clone)]
pub(crate) struct Tracker {
  address: String,
  threshold: u32,
  status: Status,
  consecutive_failures: u32,
  last_transition: DateTime<Utc>,
  last_attempt: Option<DateTime<Utc>>,
}

impl Tracker {
  pub(crate) fn new(
    address: String,
    threshold: u32,
    now: DateTime<Utc>,
  ) -> Self {
    Self {
      address,
      threshold: threshold.max(1),
      status: Status::Available,
      consecutive_failures: 0,
      last_transition: now,
      last_attempt: None,
    }
  }

  pub(crate) fn status(&self) -> Status {
    self.status
  }

  pub(crate) fn consecutive_failures(&self) -> u32 {
    self.consecutive_failures
  }

  pub(crate) fn last_transition(&self) -> DateTime<Utc> {
    self.last_transition
  }

  pub(crate) fn record(
    &mut self,
    outcome: &CycleOutcome,
    now: DateTime<Utc>,
  ) -> Option<Transition> {
    self.last_attempt = Some(now);

    let next = if outcome.is_success() {
      self.consecutive_failures = 0;
      Status::Available
    } else {
      self.consecutive_failures = self.consecutive_failures.saturating_add(1);
      if self.consecutive_failures >= self.threshold {
        Status::Unavailable
      } else {
        self.status
      }
    };

    if next == self.status {
      return None;
    }

    let transition = Transition {
      address: self.address.clone(),
      from: self.status,
      to: next,
      timestamp: now,
      consecutive_failures: self.consecutive_failures,
    };
    self.status = next;
    self.last_transition = now;

    Some(transition)
  }

  /// Whether a cycle should run now.
  ///
  /// Unavailable devices are retried at most once per `retry_interval`;
  /// a zero interval disables the throttle.
  pub(crate) fn should_poll(
    &self,
    now: DateTime<Utc>,
    retry_interval: chrono::Duration,
  ) -> bool {
    if self.status == Status::Available
      || retry_interval <= chrono::Duration::zero()
    {
      return true;
    }

    match self.last_attempt {
      Some(last_attempt) => now - last_attempt >= retry_interval,
      None => true,
    }
  }
}
