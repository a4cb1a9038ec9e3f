//! # tether-runtime
//!
//! The live-location relay core. Everything here is transport-agnostic: a
//! connection is just an outbound queue plus an identity, so the server crate
//! can drive it from WebSockets and tests can drive it from plain channels.
//!
//! - [`registry::ConnectionRegistry`]: principal → live connections
//! - [`store::SessionStore`]: sharded session records with per-session locks
//! - [`notifier::FallbackNotifier`]: push seam for offline principals
//! - [`router::MessageRouter`]: live-vs-fallback fan-out with rate limiting
//! - [`lifecycle::LifecycleManager`]: the session state machine
//! - [`sweeper`]: periodic expiry task

#![deny(unsafe_code)]

pub mod config;
pub mod connection;
pub mod lifecycle;
pub mod notifier;
pub mod registry;
pub mod router;
pub mod session;
pub mod store;
pub mod sweeper;
pub mod testing;

pub use config::RelayConfig;
pub use connection::ClientConnection;
pub use lifecycle::LifecycleManager;
pub use notifier::{DeviceTokenRegistry, FallbackError, FallbackNotifier, LogNotifier, PushMessage};
pub use registry::ConnectionRegistry;
pub use router::MessageRouter;
pub use session::{LiveSession, SessionState, SessionSummary};
pub use store::SessionStore;
