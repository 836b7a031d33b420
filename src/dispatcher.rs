//! Exposed to HTTP: look up the registry, send through the connection, await
//! a reply with timeout (component G).

use std::time::Duration;

use serde::Serialize;

use crate::identity::DeviceIdentity;
use crate::metrics::Metrics;
use crate::registry::Registry;

#[derive(Debug, Serialize)]
pub struct DispatchResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_flag: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// `send_command_to_device(identity, content, timeout) → {success, reply?,
/// note?, server_flag?}` per §4.7. `success:true` means the frame was
/// written, independent of whether a reply arrived within `timeout`.
pub async fn send_command_to_device(
    registry: &Registry,
    metrics: &Metrics,
    identity: DeviceIdentity,
    content: String,
    timeout: Duration,
) -> DispatchResult {
    let Some(handle) = registry.lookup(&identity) else {
        return DispatchResult {
            success: false,
            reply: None,
            note: None,
            server_flag: None,
            error: Some("not connected".to_string()),
        };
    };

    match handle.send_command(content, timeout).await {
        Ok(outcome) => {
            metrics.record_command_sent();
            if outcome.note.is_some() {
                metrics.record_command_timed_out();
            }
            DispatchResult {
                success: true,
                reply: outcome.reply,
                note: outcome.note,
                server_flag: if outcome.server_flag != 0 {
                    Some(outcome.server_flag)
                } else {
                    None
                },
                error: None,
            }
        }
        Err(err) => DispatchResult {
            success: false,
            reply: None,
            note: None,
            server_flag: None,
            error: Some(err.to_string()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::test_support::test_handle;

    #[tokio::test]
    async fn not_connected_device_reports_failure() {
        let registry = Registry::new();
        let metrics = Metrics::default();
        let identity = DeviceIdentity::from_bytes([1, 2, 3, 4, 5, 6, 7, 8]);
        let result = send_command_to_device(
            &registry,
            &metrics,
            identity,
            "STATUS#".to_string(),
            Duration::from_secs(1),
        )
        .await;
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("not connected"));
    }

    #[tokio::test]
    async fn connected_device_round_trips_command() {
        let registry = Registry::new();
        let metrics = Metrics::default();
        let identity = DeviceIdentity::from_bytes([1, 2, 3, 4, 5, 6, 7, 8]);
        let (handle, _events) = test_handle(1, identity);
        registry.register(identity, handle);

        let result = send_command_to_device(
            &registry,
            &metrics,
            identity,
            "STATUS#".to_string(),
            Duration::from_secs(1),
        )
        .await;
        assert!(result.success);
        assert_eq!(result.reply.as_deref(), Some("test-reply"));
        assert_eq!(result.server_flag, Some(0xA001));
    }
}
