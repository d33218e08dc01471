//! Expiry Sweeper (C9): an hourly (configurable) timer that deletes every
//! event whose `expires_at` tag has passed. Deletions remove primary and
//! secondary index entries atomically (see `Storage::delete_if_expired`);
//! subscribers aren't notified, they just observe the absence on their
//! next query.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::interval;
use tracing::{debug, warn};

use crate::storage::Storage;

pub fn spawn(
    storage: Arc<Storage>,
    interval_secs: u64,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(interval_secs));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let now = crate::now_unix();
                    match storage.delete_if_expired(now) {
                        Ok(removed) if removed > 0 => {
                            debug!(removed, "expiry sweep removed events");
                        }
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "expiry sweep failed"),
                    }
                }
                _ = shutdown_rx.recv() => break,
            }
        }
    })
}
