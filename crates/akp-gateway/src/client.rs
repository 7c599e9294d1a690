//! Platform gateway trait
//!
//! Controllers talk to the platform only through [`PlatformGateway`], which
//! lets tests substitute a mock or an in-memory platform.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use serde_json::Value;

use akp_common::RpcError;

use crate::types::{Instance, KargoAgent, Organization, Workspace};

/// Chunked byte stream of rendered agent manifests
pub type ManifestStream = BoxStream<'static, Result<Bytes, RpcError>>;

/// Typed client over the platform API.
///
/// Every method is a single RPC. Retries, cancellation and deadlines are
/// applied by the caller through the retry kernel and `CallContext`.
#[cfg_attr(any(test, feature = "mock"), mockall::automock)]
#[async_trait]
pub trait PlatformGateway: Send + Sync {
    /// Look up an organization by name
    async fn get_organization_by_name(&self, name: &str) -> Result<Organization, RpcError>;

    /// List the organization's workspaces
    async fn list_workspaces(&self, org_id: &str) -> Result<Vec<Workspace>, RpcError>;

    /// Fetch an Argo CD instance with its spec
    async fn get_instance(&self, org_id: &str, instance_id: &str) -> Result<Instance, RpcError>;

    /// Declaratively apply an Argo CD instance
    ///
    /// The full spec is sent; the server reconciles. Resource types listed in
    /// `prune_resource_types` are pruned when absent from the request.
    async fn apply_instance(
        &self,
        org_id: &str,
        instance: &Instance,
        prune_resource_types: &[String],
    ) -> Result<(), RpcError>;

    /// Export an instance with all of its declarative resources
    async fn export_instance(&self, org_id: &str, instance_id: &str) -> Result<Value, RpcError>;

    /// Register or update agents of a Kargo instance
    ///
    /// `agents` are KargoAgent documents in the platform's nested shape.
    async fn apply_agents(
        &self,
        org_id: &str,
        instance_id: &str,
        workspace_id: &str,
        agents: Vec<Value>,
    ) -> Result<(), RpcError>;

    /// Fetch one agent by id
    async fn get_agent(
        &self,
        org_id: &str,
        instance_id: &str,
        agent_id: &str,
    ) -> Result<KargoAgent, RpcError>;

    /// List the agents of a Kargo instance
    async fn list_agents(&self, org_id: &str, instance_id: &str)
        -> Result<Vec<KargoAgent>, RpcError>;

    /// Delete an agent
    async fn delete_agent(
        &self,
        org_id: &str,
        instance_id: &str,
        agent_id: &str,
    ) -> Result<(), RpcError>;

    /// Stream the Kubernetes manifests that install an agent
    async fn get_agent_manifests(
        &self,
        org_id: &str,
        instance_id: &str,
        agent_id: &str,
    ) -> Result<ManifestStream, RpcError>;
}
