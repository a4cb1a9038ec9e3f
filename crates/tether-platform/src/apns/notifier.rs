//! APNs-backed [`FallbackNotifier`].

use std::sync::Arc;

use async_trait::async_trait;
use tether_core::ids::PrincipalId;
use tether_runtime::notifier::{DeviceTokenRegistry, FallbackError, FallbackNotifier, PushMessage};
use tracing::{debug, info};

use super::service::{ApnsService, token_prefix};
use super::types::{ApnsNotification, ApnsSendResult};

/// Pushes to the principal's registered device through APNs.
///
/// Tokens that APNs reports dead are dropped from the registry unless the
/// device has registered a newer one in the meantime.
pub struct ApnsFallbackNotifier {
    apns: Arc<ApnsService>,
    tokens: Arc<DeviceTokenRegistry>,
}

impl ApnsFallbackNotifier {
    /// Create a notifier over the shared token registry.
    pub fn new(apns: Arc<ApnsService>, tokens: Arc<DeviceTokenRegistry>) -> Self {
        Self { apns, tokens }
    }
}

fn to_apns_notification(message: &PushMessage) -> ApnsNotification {
    ApnsNotification {
        title: message.title.clone(),
        body: message.body.clone(),
        data: message.data.clone(),
        priority: "high".to_string(),
        sound: Some("default".to_string()),
        thread_id: message.data.get("sessionId").cloned(),
    }
}

/// Map a send result onto the notifier contract, forgetting dead tokens.
fn settle(
    result: &ApnsSendResult,
    principal: &PrincipalId,
    token: &str,
    tokens: &DeviceTokenRegistry,
) -> Result<(), FallbackError> {
    if result.success {
        return Ok(());
    }
    if result.token_is_dead() && tokens.remove_if_matches(principal, token) {
        info!(principal = %principal, token = token_prefix(token), "dropped unregistered device token");
    }
    match result.status_code {
        Some(status) => Err(FallbackError::Rejected {
            status,
            reason: result
                .reason
                .clone()
                .or_else(|| result.error.clone())
                .unwrap_or_default(),
        }),
        None => Err(FallbackError::Transport {
            message: result.error.clone().unwrap_or_default(),
        }),
    }
}

#[async_trait]
impl FallbackNotifier for ApnsFallbackNotifier {
    async fn notify(&self, principal: &PrincipalId, message: &PushMessage) -> Result<(), FallbackError> {
        let Some(token) = self.tokens.token_for(principal) else {
            return Err(FallbackError::NoDeviceToken {
                principal: principal.to_string(),
            });
        };

        let result = self.apns.send(&token, &to_apns_notification(message)).await;
        debug!(
            principal = %principal,
            success = result.success,
            status = ?result.status_code,
            reason = ?result.reason,
            "APNs push result"
        );
        settle(&result, principal, &token, &self.tokens)
    }
}
