//! Idle eviction and the background maintenance task

use async_trait::async_trait;
use std::sync::Weak;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::handle::PooledHandle;

/// Remove every handle idle for longer than `idle_timeout`
///
/// Survivors keep their relative order, so the most recently returned
/// handle stays on top of the idle stack.
pub(crate) fn take_expired<C>(
    idle: &mut Vec<PooledHandle<C>>,
    idle_timeout: Duration,
    now: Instant,
) -> Vec<PooledHandle<C>> {
    let mut expired = Vec::new();
    let mut kept = Vec::with_capacity(idle.len());
    for handle in idle.drain(..) {
        if handle.idle_for(now) > idle_timeout {
            expired.push(handle);
        } else {
            kept.push(handle);
        }
    }
    *idle = kept;
    expired
}

/// Something the maintenance task can sweep
#[async_trait]
pub(crate) trait IdleSweeper: Send + Sync + 'static {
    /// Evict expired idle connections, returning how many were closed
    async fn sweep(&self) -> usize;
}

/// Periodic sweep bound to a pool's lifetime
///
/// Holds only a weak reference, so a pool dropped without `close` still
/// lets the task finish on its next tick.
pub(crate) struct MaintenanceTask {
    handle: JoinHandle<()>,
    token: CancellationToken,
}

impl MaintenanceTask {
    pub fn spawn<S: IdleSweeper>(target: Weak<S>, period: Duration, token: CancellationToken) -> Self {
        let task_token = token.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = task_token.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(pool) = target.upgrade() else { break };
                        let evicted = pool.sweep().await;
                        trace!(evicted, "maintenance sweep finished");
                    }
                }
            }

            debug!("maintenance task stopped");
        });

        Self { handle, token }
    }

    pub fn stop(&self) {
        self.token.cancel();
    }

    #[cfg(test)]
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for MaintenanceTask {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
