//! Collaborator adapters for the Tollbooth authority.
//!
//! Live adapters talk HTTP through `reqwest`; the fixtures are deterministic
//! in-process stand-ins used in development mode and tests.

#![deny(unsafe_code)]

pub mod btcpay;
pub mod fixtures;
pub mod registry;

pub use btcpay::{BtcPayBackend, BtcPayConfig};
pub use fixtures::{MockPaymentBackend, StaticMembershipRegistry};
pub use registry::HttpMembershipRegistry;
