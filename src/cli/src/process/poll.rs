use crate::*;

pub(crate) struct Process {
  services: service::Container,
}

impl process::Process for Process {
  fn new(_config: config::Values, services: service::Container) -> Self {
    Self { services }
  }
}

#[async_trait::async_trait]
impl process::Recurring for Process {
  #[tracing::instrument(skip(self))]
  async fn execute(&self) -> anyhow::Result<()> {
    let tick = self.services.scheduler().tick().await;

    tracing::debug!(
      "Started {:?} cycles, skipped {:?} busy and {:?} throttled devices",
      tick.started,
      tick.skipped,
      tick.throttled
    );

    Ok(())
  }
}
