//! akp - declarative control-plane adapter for the Akuity Platform
//!
//! Translates create/read/update/delete/import requests from an IaC engine
//! into platform RPCs for two resources that share server-side state in
//! non-trivial ways:
//!
//! - IP allow lists: many resources own disjoint subsets of one instance's
//!   list, so every write is a serialized read-modify-write
//! - Kargo agents: registered on the platform, then installed on a user
//!   cluster from platform-rendered manifests
//!
//! # Modules
//!
//! - [`controller`] - IP allow-list and Kargo agent controllers
//! - [`resource`] - operation outcomes and plan actions
//! - [`kustomization`] - drift-free kustomization normalization
//! - [`provider`] - provider configuration and bootstrap
//!
//! The kernels (retry, status wait, keyed locks, errors) live in
//! [`akp_common`]; the platform client in [`akp_gateway`]; the cluster
//! manifest applier in [`akp_kube`].

#![deny(missing_docs)]

pub mod controller;
pub mod kustomization;
pub mod provider;
pub mod resource;

pub use akp_common::{Error, Result};
pub use controller::{Agent, AgentController, AgentSpec, IpAllowList, IpAllowListController};
pub use provider::{Provider, ProviderConfig};
pub use resource::{Outcome, PlanAction};
