//! The reconciliation scheduler.
//!
//! One cooperative loop drives every adapter: per tick, a payout pass over
//! all coins in registration order, then a deposit pass in the same order,
//! then one outbox drain.  Adapters never run concurrently with each other
//! or with themselves; a faulted adapter is skipped until an operator
//! clears its latch.  An error outside the adapters (the outbox drain)
//! stops the loop for operator intervention.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::*;

use cashier_db::Outbox;
use cashier_engines::{ChainAdapter, EventSink};
use cashier_tasks::ShutdownGuard;

pub async fn reconciler_task(
    shutdown: ShutdownGuard,
    adapters: Arc<Vec<Arc<dyn ChainAdapter>>>,
    outbox: Outbox,
    tick_interval: Duration,
) -> anyhow::Result<()> {
    info!(coins = adapters.len(), ?tick_interval, "starting reconciler");
    let mut interval = tokio::time::interval(tick_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        interval.tick().await;
        if shutdown.should_shutdown() {
            info!("reconciler shutting down");
            return Ok(());
        }
        run_tick(&shutdown, &adapters, &outbox).await?;
    }
}

/// One full reconciliation tick.  Adapter failures are contained by their
/// latch; only storage failures on the outbox drain propagate.
pub async fn run_tick(
    shutdown: &ShutdownGuard,
    adapters: &[Arc<dyn ChainAdapter>],
    outbox: &Outbox,
) -> anyhow::Result<()> {
    let mut deposits = EventSink::new();
    let mut withdrawals = EventSink::new();
    let mut rejections = EventSink::new();

    for adapter in adapters {
        if shutdown.should_shutdown() {
            break;
        }
        if adapter.fault().is_engaged() {
            debug!(coin = adapter.coin(), "skipping faulted adapter");
            continue;
        }
        if let Err(e) = adapter
            .process_pending(&mut withdrawals, &mut rejections, shutdown)
            .await
        {
            warn!(coin = adapter.coin(), err = %e, "payout pass failed");
        }
    }

    for adapter in adapters {
        if shutdown.should_shutdown() {
            break;
        }
        if adapter.fault().is_engaged() {
            debug!(coin = adapter.coin(), "skipping faulted adapter");
            continue;
        }
        if let Err(e) = adapter.poll_deposits(&mut deposits).await {
            warn!(coin = adapter.coin(), err = %e, "deposit pass failed");
        }
    }

    if !deposits.is_empty() || !withdrawals.is_empty() || !rejections.is_empty() {
        trace!(
            deposits = deposits.len(),
            withdrawals = withdrawals.len(),
            rejections = rejections.len(),
            "draining tick events into the outbox"
        );
        outbox.append_tick(&deposits.take(), &withdrawals.take(), &rejections.take())?;
    }
    Ok(())
}
