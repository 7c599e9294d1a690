//! Resource controllers
//!
//! Each controller turns one IaC operation (create, read, update, delete,
//! import) into retried platform RPCs plus status waits, and returns the state
//! to commit as an [`Outcome`](crate::resource::Outcome).

mod agent;
mod ip_allow_list;

use std::sync::Arc;

use futures::StreamExt;

use akp_common::{retry_rpc, CallContext, Error, RetryConfig};
use akp_gateway::{Instance, KargoAgent, PlatformGateway, Workspace};

pub use agent::{Agent, AgentController, AgentSpec, AGENT_REPLACE_FIELDS};
pub use ip_allow_list::{IpAllowList, IpAllowListController, IP_ALLOW_LIST_REPLACE_FIELDS};

/// Platform access shared by the controllers
#[derive(Clone)]
pub struct Context {
    /// Platform client (trait object for testability)
    pub gateway: Arc<dyn PlatformGateway>,
    /// Organization every call is scoped to
    pub org_id: String,
    /// Retry policy for every RPC
    pub retry: RetryConfig,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("org_id", &self.org_id)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl Context {
    /// Context with the default retry policy
    pub fn new(gateway: Arc<dyn PlatformGateway>, org_id: impl Into<String>) -> Self {
        Self {
            gateway,
            org_id: org_id.into(),
            retry: RetryConfig::default(),
        }
    }

    /// Override the retry policy
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub(crate) async fn get_instance(
        &self,
        ctx: &CallContext,
        instance_id: &str,
    ) -> Result<Instance, Error> {
        retry_rpc(ctx, &self.retry, "get instance", || {
            self.gateway.get_instance(&self.org_id, instance_id)
        })
        .await
    }

    pub(crate) async fn apply_instance(
        &self,
        ctx: &CallContext,
        instance: &Instance,
    ) -> Result<(), Error> {
        retry_rpc(ctx, &self.retry, "apply instance", || {
            self.gateway.apply_instance(&self.org_id, instance, &[])
        })
        .await
    }

    pub(crate) async fn list_workspaces(&self, ctx: &CallContext) -> Result<Vec<Workspace>, Error> {
        retry_rpc(ctx, &self.retry, "list workspaces", || {
            self.gateway.list_workspaces(&self.org_id)
        })
        .await
    }

    pub(crate) async fn list_agents(
        &self,
        ctx: &CallContext,
        instance_id: &str,
    ) -> Result<Vec<KargoAgent>, Error> {
        retry_rpc(ctx, &self.retry, "list agents", || {
            self.gateway.list_agents(&self.org_id, instance_id)
        })
        .await
    }

    pub(crate) async fn get_agent(
        &self,
        ctx: &CallContext,
        instance_id: &str,
        agent_id: &str,
    ) -> Result<KargoAgent, Error> {
        retry_rpc(ctx, &self.retry, "get agent", || {
            self.gateway.get_agent(&self.org_id, instance_id, agent_id)
        })
        .await
    }

    /// Fetch the rendered manifests of an agent as one YAML stream
    pub(crate) async fn agent_manifests(
        &self,
        ctx: &CallContext,
        instance_id: &str,
        agent_id: &str,
    ) -> Result<String, Error> {
        let mut stream = retry_rpc(ctx, &self.retry, "get agent manifests", || {
            self.gateway
                .get_agent_manifests(&self.org_id, instance_id, agent_id)
        })
        .await?;

        let mut buf = Vec::new();
        while let Some(chunk) = ctx.run("read agent manifests", stream.next()).await? {
            let chunk = chunk.map_err(|e| Error::rpc("read agent manifests", e))?;
            buf.extend_from_slice(&chunk);
        }
        String::from_utf8(buf).map_err(|e| {
            Error::serialization_for_kind("manifests", format!("manifests are not UTF-8: {e}"))
        })
    }
}
