//! APNs (Apple Push Notification service).
//!
//! JWT-authenticated HTTP/2 delivery. Credentials live in a directory holding
//! `config.json` and the `.p8` signing key (default `~/.tether/apns`).

mod config;
mod notifier;
mod service;
mod types;

pub use config::{ApnsConfig, default_apns_dir, load_from_dir};
pub use notifier::ApnsFallbackNotifier;
pub use service::{ApnsError, ApnsService};
pub use types::{ApnsNotification, ApnsSendResult};
