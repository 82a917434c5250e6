use std::sync::Weak;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;

use super::PoolInner;
use crate::native::NativeDriver;

/// Sweep every `period` until `token` fires or the pool is dropped.
pub(super) fn spawn<D: NativeDriver>(
    pool: Weak<PoolInner<D>>,
    period: Duration,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = token.cancelled() => break,
                _ = ticker.tick() => {
                    let Some(inner) = pool.upgrade() else {
                        break;
                    };
                    inner.sweep().await;
                }
            }
        }
        tracing::debug!("pool sweeper stopped");
    })
}
