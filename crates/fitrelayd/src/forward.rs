//! Satellite forwarding: ship a PRIVATE event to the chosen satellite node
//! over HTTP, retrying with bounded exponential backoff up to a wall-clock
//! ceiling. Forwarding is detached from the PUBLISH acknowledgement — the
//! caller only waits on the reference event's local `Put` before replying.

use std::time::{Duration, Instant};

use fitrelay_core::Event;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("satellite unreachable after retrying: {0}")]
    Unreachable(String),
}

const BASE_BACKOFF: Duration = Duration::from_millis(200);
const MAX_BACKOFF: Duration = Duration::from_secs(10);

fn backoff_delay(attempt: u32) -> Duration {
    let exponential = BASE_BACKOFF * 2u32.saturating_pow(attempt.min(20));
    exponential.min(MAX_BACKOFF)
}

/// Deliver `event` to `url`, retrying with exponential backoff until
/// `ceiling` has elapsed since the first attempt.
pub async fn forward_with_retry(
    client: &reqwest::Client,
    url: &str,
    event: &Event,
    ceiling: Duration,
) -> Result<(), ForwardError> {
    let deadline = Instant::now() + ceiling;
    let mut attempt: u32 = 0;

    loop {
        match client.post(url).json(event).send().await {
            Ok(resp) if resp.status().is_success() => {
                debug!(url, id = %event.id, "forwarded event to satellite");
                return Ok(());
            }
            Ok(resp) => {
                warn!(url, status = %resp.status(), id = %event.id, "satellite rejected forwarded event");
            }
            Err(e) => {
                warn!(url, error = %e, id = %event.id, "satellite forward attempt failed");
            }
        }

        if Instant::now() >= deadline {
            return Err(ForwardError::Unreachable(url.to_string()));
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        tokio::time::sleep(backoff_delay(attempt).min(remaining)).await;
        attempt += 1;
    }
}
