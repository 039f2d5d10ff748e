// ── Startup barrier ──
//
// Single-use gate between `Arlo::connect` and the end of the initial
// refresh pass. Released once; later releases are no-ops.

use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;

use crate::error::CoreError;

/// How often a waiter reports that it is still waiting.
const WAIT_LOG_EVERY: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub struct StartupBarrier {
    started: watch::Sender<bool>,
}

impl Default for StartupBarrier {
    fn default() -> Self {
        Self::new()
    }
}

impl StartupBarrier {
    pub fn new() -> Self {
        let (started, _) = watch::channel(false);
        Self { started }
    }

    /// Open the gate. Returns `true` only for the call that opened it.
    pub fn release(&self) -> bool {
        let opened = self.started.send_if_modified(|started| {
            let was = *started;
            *started = true;
            !was
        });
        if opened {
            debug!("initial setup complete");
        }
        opened
    }

    pub fn is_released(&self) -> bool {
        *self.started.borrow()
    }

    /// Block until released, or until `timeout` elapses (`None` waits
    /// forever). Logs while waiting.
    pub async fn wait(&self, timeout: Option<Duration>) -> Result<(), CoreError> {
        let mut rx = self.started.subscribe();
        let started_at = Instant::now();
        let deadline = timeout.map(|t| started_at + t);

        loop {
            if *rx.borrow_and_update() {
                debug!(waited_ms = elapsed_ms(started_at), "finished waiting for initial setup");
                return Ok(());
            }

            let expiry = async move {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                biased;
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Err(CoreError::Internal("startup barrier dropped".into()));
                    }
                }
                () = expiry => {
                    return Err(CoreError::StartupTimeout {
                        waited_secs: timeout.map_or(0, |t| t.as_secs()),
                    });
                }
                () = tokio::time::sleep(WAIT_LOG_EVERY) => {
                    debug!(waited_ms = elapsed_ms(started_at), "waiting for initial setup...");
                }
            }
        }
    }
}

fn elapsed_ms(since: Instant) -> u64 {
    u64::try_from(since.elapsed().as_millis()).unwrap_or(u64::MAX)
}
