//! Administrative HTTP operations
//!
//! Thin wrappers over the broker admin endpoint, used by test setup and
//! teardown. These are opaque side effects outside the delivery path.

use crate::error::NsqError;
use std::time::Duration;

/// Drain all pending messages for a topic's channel.
pub async fn empty_queue(admin_base_url: &str, topic: &str, channel: &str) -> Result<(), NsqError> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .expect("http client builds");
    let base = admin_base_url.trim_end_matches('/');
    let url = format!("{}/api/topics/{}/{}?action=empty", base, topic, channel);
    let response = client
        .post(&url)
        .send()
        .await
        .map_err(|e| NsqError::lookup(format!("admin endpoint unreachable: {}", e)))?;
    if !response.status().is_success() {
        return Err(NsqError::lookup(format!(
            "admin queue drain failed with status {}",
            response.status()
        )));
    }
    tracing::debug!(topic = %topic, channel = %channel, "queue drained");
    Ok(())
}
