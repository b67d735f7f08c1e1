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
    let discovered = self.services.discovery().discover().await?;
    let discovered_len = discovered.len();

    self.services.scheduler().refresh(discovered).await;

    tracing::info!(
      "Discovered {:?} devices, polling {:?}",
      discovered_len,
      self.services.scheduler().len().await
    );

    Ok(())
  }
}
