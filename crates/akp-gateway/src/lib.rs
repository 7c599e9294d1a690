//! Typed client over the Akuity Platform API
//!
//! - [`types`] - platform data model (instances, agents, workspaces, statuses)
//! - [`client`] - the [`PlatformGateway`] trait controllers depend on
//! - [`http`] - HTTP/JSON implementation with API-key authentication

#![deny(missing_docs)]

pub mod client;
pub mod http;
pub mod types;

#[cfg(any(test, feature = "mock"))]
pub use client::MockPlatformGateway;
pub use client::{ManifestStream, PlatformGateway};
pub use http::{Credentials, HttpGateway, HttpGatewayConfig};
pub use types::{
    AgentSize, HealthStatus, HealthStatusCode, Instance, InstanceSpec, IpAllowListEntry,
    KargoAgent, KargoAgentData, Organization, ReconciliationStatus, ReconciliationStatusCode,
    Workspace,
};
