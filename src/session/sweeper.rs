use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::SessionStore;
use crate::error::{Error, Result};

/// Background task that purges expired sessions every 1.5x the session
/// lifetime. Dropping the handle signals the task to exit.
pub struct SessionSweeper {
    shutdown_token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl SessionSweeper {
    /// Fails when the sweep period cannot be scheduled on the clock.
    pub fn start(store: Arc<SessionStore>) -> Result<Self> {
        let period = sweep_period(store.lifetime()).ok_or_else(|| {
            Error::Config(format!(
                "Session lifetime {:?} is too large to schedule a sweep",
                store.lifetime()
            ))
        })?;
        let first_tick = Instant::now()
            .checked_add(period)
            .filter(|first| first.checked_add(period).is_some())
            .ok_or_else(|| {
                Error::Config(format!("Sweep period {:?} overflows the clock", period))
            })?;

        let shutdown_token = CancellationToken::new();
        let handle = tokio::spawn(run_sweeper(store, first_tick, period, shutdown_token.clone()));

        Ok(Self {
            shutdown_token,
            handle: Some(handle),
        })
    }

    /// Signals the task and waits until it has exited.
    pub async fn stop(&mut self) {
        self.shutdown_token.cancel();
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "Session sweeper task failed");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

/// 1.5x the lifetime, at least 1ms.
fn sweep_period(lifetime: Duration) -> Option<Duration> {
    let period = lifetime.checked_mul(3)? / 2;
    Some(period.max(Duration::from_millis(1)))
}

async fn run_sweeper(
    store: Arc<SessionStore>,
    first_tick: Instant,
    period: Duration,
    shutdown_token: CancellationToken,
) {
    info!(interval_ms = period.as_millis() as u64, "Session sweeper started");

    let mut interval = tokio::time::interval_at(first_tick, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = shutdown_token.cancelled() => {
                break;
            }
            _ = interval.tick() => {
                let start = Instant::now();
                let removed = store.sweep_expired();
                debug!(
                    removed,
                    remaining = store.len(),
                    elapsed_us = start.elapsed().as_micros() as u64,
                    "Session sweep"
                );
            }
        }
    }

    info!("Session sweeper stopped");
}

impl Drop for SessionSweeper {
    fn drop(&mut self) {
        self.shutdown_token.cancel();
    }
}
