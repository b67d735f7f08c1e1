use std::{future::Future, time::Duration};

use super::family::Family;

#[derive(Clone, Debug, Hash, Eq, PartialEq)]
pub(crate) struct Target {
  pub(crate) address: String,
  pub(crate) family: Family,
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum LinkError {
  #[error("Device not connected: {0}")]
  NotConnected(String),

  #[error("Timed out waiting for a response")]
  Timeout,

  #[error("Transport failed: {0}")]
  Io(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub(crate) enum TransportFailure {
  #[error("Not connected: {0}")]
  NotConnected(String),

  #[error("Timed out")]
  Timeout,

  #[error("Malformed response: {0}")]
  MalformedResponse(String),

  #[error("Checksum mismatch (raw {})", hex::encode(.raw))]
  ChecksumMismatch { raw: Vec<u8> },
}

impl From<LinkError> for TransportFailure {
  fn from(error: LinkError) -> Self {
    match error {
      LinkError::NotConnected(reason) => TransportFailure::NotConnected(reason),
      LinkError::Timeout => TransportFailure::Timeout,
      LinkError::Io(reason) => TransportFailure::NotConnected(reason),
    }
  }
}

/// Opens request/response channels to devices by address.
#[async_trait::async_trait]
pub(crate) trait Connector: Send + Sync {
  async fn connect(&self, target: &Target) -> Result<Box<dyn Link>, LinkError>;
}

/// One open channel to a device.
#[async_trait::async_trait]
pub(crate) trait Link: Send {
  /// Sends one request frame and collects the raw response frame.
  async fn request(
    &mut self,
    frame: &[u8],
    timeout: Duration,
  ) -> Result<Vec<u8>, LinkError>;

  async fn close(&mut self);
}

/// Spawns `release` if dropped before [`Release::disarm`].
///
/// Guards transport handles that are open but not yet owned by a [`Link`].
pub(crate) struct Release<F: Future<Output = ()> + Send + 'static> {
  release: Option<F>,
}

impl<F: Future<Output = ()> + Send + 'static> Release<F> {
  pub(crate) fn new(release: F) -> Self {
    Self {
      release: Some(release),
    }
  }

  pub(crate) fn disarm(mut self) {
    self.release = None;
  }
}

impl<F: Future<Output = ()> + Send + 'static> Drop for Release<F> {
  fn drop(&mut self) {
    if let Some(release) = self.release.take() {
      match tokio::runtime::Handle::try_current() {
        Ok(runtime) => {
          runtime.spawn(release);
        }
        Err(_) => tracing::warn!("No runtime to release a transport handle"),
      }
    }
  }
}
