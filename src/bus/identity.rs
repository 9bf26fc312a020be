//! Context Identity Resolver
//!
//! A context learns its own address by asking the broker. The broker may not be
//! up yet right after the host starts, so the question is retried a bounded
//! number of times with a fixed delay between attempts.

use crate::address::FrameAddress;
use crate::bus::error::BusError;
use std::future::Future;
use std::time::Duration;

/// Ask `attempt` for the own address up to `max_attempts` times.
///
/// An attempt that yields no address or fails with `ContextNotReady` is
/// retried after `delay`. Any other failure ends resolution immediately.
/// No attempt is made after the last one fails.
pub async fn resolve_own_address<F, Fut>(max_attempts: u32, delay: Duration, mut attempt: F) -> Result<FrameAddress, BusError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<FrameAddress>, BusError>>,
{
    let mut last = None;
    for i in 1..=max_attempts {
        match attempt().await {
            Ok(Some(address)) => {
                tracing::debug!("[IdentityResolver] Resolved own address {} on attempt {}", address, i);
                return Ok(address);
            }
            Ok(None) => last = Some("broker does not know this context's address".to_string()),
            Err(e @ BusError::ContextNotReady { .. }) => last = Some(e.to_string()),
            Err(e) => return Err(e),
        }
        if i < max_attempts {
            tokio::time::sleep(delay).await;
        }
    }
    tracing::error!(
        "[IdentityResolver] Own address unavailable after {} attempts: {}",
        max_attempts,
        last.as_deref().unwrap_or("no attempt made")
    );
    Err(BusError::AddressUnavailable {
        attempts: max_attempts,
        last,
    })
}
