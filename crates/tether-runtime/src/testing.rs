//! Test doubles for the fallback seam.

use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tether_core::ids::PrincipalId;

use crate::notifier::{FallbackError, FallbackNotifier, PushMessage};

/// Notifier that records every push and can be told to fail or stall.
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<(PrincipalId, PushMessage)>>,
    fail_with: Mutex<Option<FallbackError>>,
    delay: Mutex<Option<Duration>>,
}

impl RecordingNotifier {
    /// Create a notifier that accepts everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every later push fail with `err` (still recorded).
    pub fn fail_with(&self, err: FallbackError) {
        *self.fail_with.lock() = Some(err);
    }

    /// Sleep this long inside every later push.
    pub fn delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    /// Everything pushed so far.
    pub fn sent(&self) -> Vec<(PrincipalId, PushMessage)> {
        self.sent.lock().clone()
    }

    /// Pushes addressed to `principal`.
    pub fn sent_to(&self, principal: &str) -> Vec<PushMessage> {
        self.sent
            .lock()
            .iter()
            .filter(|(p, _)| p.as_str() == principal)
            .map(|(_, m)| m.clone())
            .collect()
    }
}

#[async_trait]
impl FallbackNotifier for RecordingNotifier {
    async fn notify(&self, principal: &PrincipalId, message: &PushMessage) -> Result<(), FallbackError> {
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.sent.lock().push((principal.clone(), message.clone()));
        match self.fail_with.lock().clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
