//! Task wiring for a running agent.
//!
//! [`start`] subscribes the lifecycle bridge before reconciling, so domains
//! booted by reconciliation still report `Started`. [`supervise`] waits for
//! a stop signal and notices tasks that end on their own:
//! - the consumer ending early is fatal, the agent cannot take commands
//! - the bridge ending early is logged, commands are still applied

use std::future::Future;

use anyhow::{anyhow, Result};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::bus::BusError;
use crate::dispatcher::Dispatcher;
use crate::hypervisor::HypervisorError;
use crate::lifecycle::LifecycleBridge;
use crate::reconciler::ReconcileReport;

/// Subscribe the bridge to lifecycle events, then reconcile cached domains.
pub async fn start(
    bridge: LifecycleBridge,
    dispatcher: &Dispatcher,
    shutdown: watch::Receiver<bool>,
) -> Result<(JoinHandle<u64>, ReconcileReport), HypervisorError> {
    let bridge_handle = bridge.spawn(shutdown).await?;

    let report = dispatcher.reconcile().await;
    if !report.is_complete() {
        warn!(
            total = report.total,
            bridges_ensured = report.bridges_ensured,
            domains_ensured = report.domains_ensured,
            "Reconciliation incomplete"
        );
    }
    Ok((bridge_handle, report))
}

/// Run until `signal` resolves or the consumer stops, then shut down.
///
/// Flips `shutdown_tx` and joins both tasks before returning. Returns an
/// error when the consumer stopped before a signal arrived.
pub async fn supervise<S>(
    signal: S,
    mut serve: JoinHandle<Result<(), BusError>>,
    mut bridge: JoinHandle<u64>,
    shutdown_tx: watch::Sender<bool>,
) -> Result<()>
where
    S: Future<Output = Result<()>>,
{
    tokio::pin!(signal);
    let mut bridge_done = false;

    let consumer_exit = loop {
        tokio::select! {
            result = &mut signal => {
                if let Err(e) = result {
                    error!(error = %e, "Signal handling failed, shutting down");
                }
                break None;
            }
            result = &mut serve => break Some(result),
            result = &mut bridge, if !bridge_done => {
                bridge_done = true;
                match result {
                    Ok(published) => warn!(published, "Lifecycle bridge stopped before shutdown"),
                    Err(e) => error!(error = %e, "Lifecycle bridge task panicked"),
                }
            }
        }
    };

    // Signal shutdown to all workers
    let _ = shutdown_tx.send(true);

    if !bridge_done {
        match bridge.await {
            Ok(published) => info!(published, "Lifecycle bridge exited"),
            Err(e) => error!(error = %e, "Lifecycle bridge task panicked"),
        }
    }

    match consumer_exit {
        None => {
            match serve.await {
                Ok(Ok(())) => info!("Consumer stopped"),
                Ok(Err(e)) => error!(error = %e, "Consumer error"),
                Err(e) => error!(error = %e, "Consumer task panicked"),
            }
            Ok(())
        }
        Some(result) => {
            let err = match result {
                Ok(Ok(())) => anyhow!("consumer stopped unexpectedly"),
                Ok(Err(e)) => anyhow::Error::new(e).context("consumer failed"),
                Err(e) => anyhow::Error::new(e).context("consumer task panicked"),
            };
            let message = format!("{err:#}");
            error!(error = %message, "Consumer stopped before shutdown");
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::bus::wait_for_shutdown;

    fn waiting_consumer(shutdown: watch::Receiver<bool>) -> JoinHandle<Result<(), BusError>> {
        tokio::spawn(async move {
            wait_for_shutdown(shutdown).await;
            Ok(())
        })
    }

    fn waiting_bridge(shutdown: watch::Receiver<bool>) -> JoinHandle<u64> {
        tokio::spawn(async move {
            wait_for_shutdown(shutdown).await;
            7
        })
    }

    #[tokio::test]
    async fn test_signal_stops_everything() {
        let (tx, rx) = watch::channel(false);
        let serve = waiting_consumer(rx.clone());
        let bridge = waiting_bridge(rx.clone());

        supervise(async { Ok(()) }, serve, bridge, tx).await.unwrap();
        assert!(*rx.borrow());
    }

    #[tokio::test]
    async fn test_consumer_failure_is_fatal() {
        let (tx, rx) = watch::channel(false);
        let serve = tokio::spawn(async {
            Err(BusError::Subscribe {
                topic: "vmfleet-hv1".to_string(),
                message: "permissions violation".to_string(),
            })
        });
        let bridge = waiting_bridge(rx.clone());

        let err = supervise(std::future::pending(), serve, bridge, tx)
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("permissions violation"));
        assert!(*rx.borrow());
    }

    #[tokio::test]
    async fn test_consumer_ending_early_is_fatal() {
        let (tx, rx) = watch::channel(false);
        let serve = tokio::spawn(async { Ok(()) });
        let bridge = waiting_bridge(rx);

        assert!(supervise(std::future::pending(), serve, bridge, tx)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_bridge_ending_early_keeps_consumer() {
        let (tx, rx) = watch::channel(false);
        let serve = waiting_consumer(rx.clone());
        let bridge = tokio::spawn(async { 0u64 });

        let signal = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(())
        };
        supervise(signal, serve, bridge, tx).await.unwrap();
        assert!(*rx.borrow());
    }
}
