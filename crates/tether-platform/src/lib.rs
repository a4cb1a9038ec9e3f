//! # tether-platform
//!
//! Push integrations for offline principals.
//!
//! - **APNs**: ES256 JWT signing and HTTP/2 delivery to Apple (feature-gated: `apns`)
//! - **Notifier selection**: [`build_notifier`] picks APNs when enabled and
//!   configured, otherwise the logging notifier

#![deny(unsafe_code)]

#[cfg(feature = "apns")]
pub mod apns;
pub mod fallback;

pub use fallback::{NotifierKind, build_notifier};
