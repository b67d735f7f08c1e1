#![deny(
  unsafe_code,
  // reason = "Let's just not do it"
)]
#![deny(
  clippy::unwrap_used,
  clippy::expect_used,
  clippy::panic,
  clippy::unreachable,
  // reason = "We have to handle errors properly"
)]
#![cfg_attr(
  test,
  allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)
)]

mod config;
mod process;
mod service;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  let config = config::Manager::new().await?;

  tracing_subscriber::fmt()
    .with_max_level(config.log_level().await)
    .init();

  let values = config.values().await?;

  let (sender, receiver) = flume::unbounded();
  let sink = tokio::spawn(service::output::log_events(receiver));

  let services = service::Container::new(config, &values, sender).await?;
  let processes = process::Container::new(values, services);

  processes.spawn().await;
  tokio::signal::ctrl_c().await?;
  tracing::info!("Shutting down");
  processes.cancel().await;
  drop(processes);

  if tokio::time::timeout(std::time::Duration::from_secs(5), sink)
    .await
    .is_err()
  {
    tracing::warn!("Timed out flushing events");
  }

  Ok(())
}
