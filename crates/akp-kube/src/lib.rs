//! Kubernetes side of agent installs
//!
//! The platform renders agent manifests; this crate puts them on (or takes
//! them off) the user's cluster.

#![deny(missing_docs)]

pub mod applier;
pub mod kubeconfig;

#[cfg(any(test, feature = "mock"))]
pub use applier::MockManifestApplier;
pub use applier::{
    ApplyOptions, ApplyReport, Cascade, DeleteOptions, DryRun, KubeManifestApplier,
    ManifestApplier, Validation,
};
pub use kubeconfig::{ExecConfig, Kubeconfig};
