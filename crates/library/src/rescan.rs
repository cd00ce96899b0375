use std::future::Future;
use std::time::{Duration, SystemTime};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Runs `cycle` every `interval`, passing the start time of the previous
/// cycle as the modify-time floor.
pub struct PeriodicRescan {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl PeriodicRescan {
    pub fn start<F, Fut>(interval: Duration, initial_floor: Option<SystemTime>, cycle: F) -> Self
    where
        F: Fn(Option<SystemTime>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            let mut floor = initial_floor;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                let started = SystemTime::now();
                debug!("Periodic rescan starting (floor {:?})", floor);
                cycle(floor).await;
                floor = Some(started);
                if token.is_cancelled() {
                    break;
                }
            }
            debug!("Periodic rescan loop finished");
        });
        info!("Periodic rescan every {:?}", interval);
        Self { cancel, handle }
    }

    /// Lets an in-flight cycle finish within `grace`, then aborts it.
    /// Returns whether the loop stopped on its own.
    pub async fn stop(mut self, grace: Duration) -> bool {
        self.cancel.cancel();
        match tokio::time::timeout(grace, &mut self.handle).await {
            Ok(_) => true,
            Err(_) => {
                warn!("Rescan still running after {:?}; cancelling", grace);
                self.handle.abort();
                false
            }
        }
    }
}
