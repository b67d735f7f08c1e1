pub(crate) mod availability;
pub(crate) mod family;
pub(crate) mod frame;
pub(crate) mod link;
pub(crate) mod register;
pub(crate) mod rover;
pub(crate) mod session;
pub(crate) mod span;

#[cfg(feature = "ble")]
pub(crate) mod ble;

#[cfg(test)]
pub(crate) mod mock;

pub(crate) use availability::{Status, Tracker, Transition};
pub(crate) use family::Family;
pub(crate) use link::{Connector, Target};
pub(crate) use register::{Measurement, Section};
pub(crate) use session::{CycleOutcome, DeviceIdentity, Session};
