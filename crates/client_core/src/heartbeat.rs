use std::{future::Future, time::Duration};

use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tracing::{trace, warn};

use crate::error::InvokeError;

/// Probes the hub every `interval` until a probe fails, then reports the
/// failure once and stops. The first probe runs one interval after start.
pub(crate) fn spawn_heartbeat<P, PF, F, FF>(
    interval: Duration,
    mut probe: P,
    on_failure: F,
) -> JoinHandle<()>
where
    P: FnMut() -> PF + Send + 'static,
    PF: Future<Output = Result<(), InvokeError>> + Send + 'static,
    F: FnOnce(InvokeError) -> FF + Send + 'static,
    FF: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match probe().await {
                Ok(()) => trace!("hub: heartbeat ok"),
                Err(err) => {
                    warn!("hub: heartbeat failed: {err}");
                    on_failure(err).await;
                    return;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    };

    use tokio::sync::oneshot;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn probes_on_every_interval_until_failure() {
        let probes = Arc::new(AtomicU32::new(0));
        let counted = Arc::clone(&probes);
        let (failed_tx, failed_rx) = oneshot::channel();

        let task = spawn_heartbeat(
            Duration::from_secs(30),
            move || {
                let n = counted.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n < 3 {
                        Ok(())
                    } else {
                        Err(InvokeError::ConnectionClosed {
                            method: "GetConnectionId".into(),
                        })
                    }
                }
            },
            move |err| async move {
                let _ = failed_tx.send(err);
            },
        );

        tokio::time::sleep(Duration::from_secs(29)).await;
        assert_eq!(probes.load(Ordering::SeqCst), 0);

        let err = failed_rx.await.expect("failure reported");
        assert!(matches!(err, InvokeError::ConnectionClosed { .. }));
        assert_eq!(probes.load(Ordering::SeqCst), 3);
        task.await.expect("heartbeat task finishes");

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(probes.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn aborting_stops_probes() {
        let probes = Arc::new(AtomicU32::new(0));
        let counted = Arc::clone(&probes);
        let task = spawn_heartbeat(
            Duration::from_secs(30),
            move || {
                counted.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            },
            |_| async {},
        );

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(probes.load(Ordering::SeqCst), 2);
        task.abort();
        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(probes.load(Ordering::SeqCst), 2);
    }
}
