//! # tether-core
//!
//! Foundation types shared by every tether crate:
//!
//! - **Branded IDs**: `SessionId`, `ConnectionId`, `PrincipalId` as newtypes for type safety
//! - **Positions**: validated [`geo::Position`] samples reported by sharers
//! - **Wire events**: inbound [`events::ClientCommand`] parsing and outbound [`events::RelayEvent`] framing
//! - **Errors**: [`errors::RelayError`] taxonomy with stable wire codes
//! - **Clock**: injectable wall clock so expiry logic is testable
//! - **Logging**: `tracing-subscriber` initialization

#![deny(unsafe_code)]

pub mod clock;
pub mod errors;
pub mod events;
pub mod geo;
pub mod ids;
pub mod logging;
