mod discover;
mod poll;

use std::sync::Arc;

use tokio::sync::Mutex;

use crate::{config, service};

pub(crate) trait Process {
  fn new(config: config::Values, services: service::Container) -> Self
  where
    Self: Sized;

  fn process_name(&self) -> &'static str {
    std::any::type_name::<Self>()
  }
}

#[async_trait::async_trait]
pub(crate) trait Recurring: Process {
  async fn execute(&self) -> anyhow::Result<()>;
}

pub(crate) struct Container {
  config: config::Values,
  services: service::Container,
  handles: Arc<Mutex<Option<Vec<Handle>>>>,
}

impl Container {
  pub(crate) fn new(
    config: config::Values,
    services: service::Container,
  ) -> Self {
    Self {
      config,
      services,
      handles: Arc::new(Mutex::new(None)),
    }
  }

  /// Stops every process, then cancels running cycles and closes links.
  pub(crate) async fn cancel(&self) {
    {
      let mut handles = self.handles.clone().lock_owned().await;
      if let Some(handles) = &mut *handles {
        for handle in handles.iter() {
          handle.token.cancel();
        }

        for handle in handles.drain(0..) {
          if let Err(error) = handle.join.await {
            tracing::error! {
              %error,
              "Joining process handle on cancel failed"
            }
          }
        }
      }
      *handles = None;
    }

    self.services.scheduler().shutdown().await;
  }
}

macro_rules! make_recurring_spec {
  ($self: ident, $type: ty, $interval: expr, $immediate: expr) => {
    RecurringSpec {
      process: Box::new(<$type as Process>::new(
        $self.config.clone(),
        $self.services.clone(),
      )),
      interval: $interval,
      immediate: $immediate,
    }
  };
}

impl Container {
  /// Runs discovery once so the first poll has devices, then starts the
  /// recurring processes.
  pub(crate) async fn spawn(&self) {
    let discover =
      discover::Process::new(self.config.clone(), self.services.clone());
    if let Err(error) = discover.execute().await {
      tracing::error!("Initial discovery failed {}", error);
    }

    let specs = vec![
      make_recurring_spec!(
        self,
        discover::Process,
        self.config.discovery.interval,
        false
      ),
      make_recurring_spec!(
        self,
        poll::Process,
        self.config.poll_interval,
        true
      ),
    ];

    {
      let mut handles = self.handles.clone().lock_owned().await;
      *handles = Some(specs.into_iter().map(Handle::recurring).collect());
    }
  }
}

struct Handle {
  token: tokio_util::sync::CancellationToken,
  join: tokio::task::JoinHandle<()>,
}

struct RecurringSpec {
  process: Box<dyn Recurring + Sync + Send>,
  interval: chrono::Duration,
  immediate: bool,
}

impl Handle {
  fn recurring(spec: RecurringSpec) -> Self {
    let token = tokio_util::sync::CancellationToken::new();
    let child_token = token.child_token();
    let join = tokio::spawn(async move {
      let period = std::time::Duration::from_millis(
        spec.interval.num_milliseconds().max(1) as u64,
      );
      let start = if spec.immediate {
        tokio::time::Instant::now()
      } else {
        tokio::time::Instant::now() + period
      };
      let mut interval = tokio::time::interval_at(start, period);
      interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
      loop {
        tokio::select! {
            _ = child_token.cancelled() => { return; },
            _ = async {
                interval.tick().await;

                if let Err(error) = spec.process.execute().await {
                  tracing::error!(
                    "Process execution failed {} for {}",
                    error,
                    spec.process.process_name()
                  );
                }
            } => { }
        }
      }
    });
    Self { token, join }
  }
}
