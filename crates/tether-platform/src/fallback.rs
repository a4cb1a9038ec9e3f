//! Choose the fallback notifier for this process.

use std::sync::Arc;

use tether_runtime::notifier::{DeviceTokenRegistry, FallbackNotifier, LogNotifier};
use tether_settings::PushSettings;
use tracing::{info, warn};

/// Which notifier [`build_notifier`] settled on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NotifierKind {
    /// Pushes are logged only.
    Log,
    /// Pushes go to Apple.
    Apns,
}

impl NotifierKind {
    /// Label for logs and health output.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Log => "log",
            Self::Apns => "apns",
        }
    }
}

/// Build the fallback notifier.
///
/// Falls back to [`LogNotifier`] when push is disabled, when the binary was
/// built without the `apns` feature, or when credentials are missing or
/// unreadable. Missing push never stops the relay from starting.
pub fn build_notifier(
    settings: &PushSettings,
    tokens: Arc<DeviceTokenRegistry>,
) -> (Arc<dyn FallbackNotifier>, NotifierKind) {
    if settings.enabled {
        if let Some(notifier) = apns_notifier(settings, Arc::clone(&tokens)) {
            info!("push notifications enabled (apns)");
            return (notifier, NotifierKind::Apns);
        }
    }
    info!("push notifications disabled, logging instead");
    (Arc::new(LogNotifier::new(tokens)), NotifierKind::Log)
}

#[cfg(feature = "apns")]
fn apns_notifier(settings: &PushSettings, tokens: Arc<DeviceTokenRegistry>) -> Option<Arc<dyn FallbackNotifier>> {
    use crate::apns::{ApnsFallbackNotifier, ApnsService, default_apns_dir, load_from_dir};

    let dir = settings
        .apns_dir
        .as_deref()
        .map_or_else(default_apns_dir, std::path::PathBuf::from);
    let config = load_from_dir(&dir)?;
    match ApnsService::new(config) {
        Ok(service) => Some(Arc::new(ApnsFallbackNotifier::new(Arc::new(service), tokens))),
        Err(e) => {
            warn!(error = %e, "failed to initialize APNs, falling back to logging");
            None
        }
    }
}

#[cfg(not(feature = "apns"))]
fn apns_notifier(_settings: &PushSettings, _tokens: Arc<DeviceTokenRegistry>) -> Option<Arc<dyn FallbackNotifier>> {
    warn!("push enabled but this build has no apns support");
    None
}
