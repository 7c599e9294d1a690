//! Provider configuration and bootstrap
//!
//! Resolves the platform endpoint and API key from explicit settings or the
//! environment, connects the HTTP gateway and looks up the organization once.
//! The resulting [`Provider`] hands out the resource controllers.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use tracing::info;

use akp_common::{
    retry_rpc, CallContext, Error, RetryConfig, DEFAULT_SERVER_URL, ENV_API_KEY_ID,
    ENV_API_KEY_SECRET, ENV_SERVER_URL,
};
use akp_gateway::{Credentials, HttpGateway, HttpGatewayConfig, PlatformGateway};
use akp_kube::{KubeManifestApplier, ManifestApplier};

use crate::controller::{AgentController, Context, IpAllowListController};

/// Provider settings as declared by the user
#[derive(Clone, Default, Deserialize)]
pub struct ProviderConfig {
    /// Platform URL; `AKUITY_SERVER_URL` or the public platform when unset
    #[serde(default)]
    pub server_url: Option<String>,
    /// Organization every resource belongs to
    #[serde(default)]
    pub org_name: Option<String>,
    /// API key id; `AKUITY_API_KEY_ID` when unset
    #[serde(default)]
    pub api_key_id: Option<String>,
    /// API key secret; `AKUITY_API_KEY_SECRET` when unset
    #[serde(default)]
    pub api_key_secret: Option<String>,
    /// Accept self-signed certificates (self-hosted platforms)
    #[serde(default)]
    pub skip_tls_verify: bool,
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("server_url", &self.server_url)
            .field("org_name", &self.org_name)
            .field("api_key_id", &self.api_key_id)
            .field("api_key_secret", &self.api_key_secret.as_ref().map(|_| "<redacted>"))
            .field("skip_tls_verify", &self.skip_tls_verify)
            .finish()
    }
}

/// Fully resolved provider settings
#[derive(Clone)]
pub struct ResolvedConfig {
    /// Platform URL
    pub server_url: String,
    /// Organization name
    pub org_name: String,
    /// API key id
    pub api_key_id: String,
    /// API key secret
    pub api_key_secret: String,
    /// Accept self-signed certificates
    pub skip_tls_verify: bool,
}

impl std::fmt::Debug for ResolvedConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedConfig")
            .field("server_url", &self.server_url)
            .field("org_name", &self.org_name)
            .field("api_key_id", &self.api_key_id)
            .field("api_key_secret", &"<redacted>")
            .field("skip_tls_verify", &self.skip_tls_verify)
            .finish()
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

impl ProviderConfig {
    /// Resolve against the process environment
    pub fn resolve(&self) -> Result<ResolvedConfig, Error> {
        self.resolve_with(|name| std::env::var(name).ok())
    }

    /// Resolve with an explicit environment lookup
    ///
    /// Explicit settings win over the environment; the server URL falls back
    /// to the public platform.
    pub fn resolve_with<F>(&self, env: F) -> Result<ResolvedConfig, Error>
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |explicit: &Option<String>, var: &str| {
            non_empty(explicit.clone()).or_else(|| non_empty(env(var)))
        };

        let server_url = lookup(&self.server_url, ENV_SERVER_URL)
            .unwrap_or_else(|| DEFAULT_SERVER_URL.to_string());
        let org_name = non_empty(self.org_name.clone())
            .ok_or_else(|| Error::config("org_name is required"))?;
        let api_key_id = lookup(&self.api_key_id, ENV_API_KEY_ID).ok_or_else(|| {
            Error::config(format!("api_key_id is required (set it or {ENV_API_KEY_ID})"))
        })?;
        let api_key_secret = lookup(&self.api_key_secret, ENV_API_KEY_SECRET).ok_or_else(|| {
            Error::config(format!(
                "api_key_secret is required (set it or {ENV_API_KEY_SECRET})"
            ))
        })?;

        Ok(ResolvedConfig {
            server_url,
            org_name,
            api_key_id,
            api_key_secret,
            skip_tls_verify: self.skip_tls_verify,
        })
    }
}

/// Connected provider
#[derive(Clone)]
pub struct Provider {
    context: Context,
    applier: Arc<dyn ManifestApplier>,
}

impl std::fmt::Debug for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Provider")
            .field("context", &self.context)
            .finish_non_exhaustive()
    }
}

impl Provider {
    /// Connect to the platform and resolve the organization id
    pub async fn connect(ctx: &CallContext, config: &ProviderConfig) -> Result<Self, Error> {
        let resolved = config.resolve()?;
        let mut gateway_config = HttpGatewayConfig::new(
            &resolved.server_url,
            Credentials::api_key(&resolved.api_key_id, &resolved.api_key_secret),
        );
        gateway_config.skip_tls_verify = resolved.skip_tls_verify;
        let gateway = HttpGateway::new(gateway_config)
            .map_err(|e| Error::config(format!("invalid platform client settings: {e}")))?;

        let provider = Self::from_gateway(
            ctx,
            Arc::new(gateway),
            &resolved.org_name,
            Arc::new(KubeManifestApplier::new()),
        )
        .await?;
        info!(
            server_url = %resolved.server_url,
            org_id = %provider.org_id(),
            "Connected to Akuity Platform"
        );
        Ok(provider)
    }

    /// Build a provider over an existing gateway and applier, resolving the
    /// organization by name
    pub async fn from_gateway(
        ctx: &CallContext,
        gateway: Arc<dyn PlatformGateway>,
        org_name: &str,
        applier: Arc<dyn ManifestApplier>,
    ) -> Result<Self, Error> {
        let retry = RetryConfig::default();
        let org = retry_rpc(ctx, &retry, "get organization", || {
            gateway.get_organization_by_name(org_name)
        })
        .await?;
        Ok(Self {
            context: Context::new(gateway, org.id).with_retry(retry),
            applier,
        })
    }

    /// Provider over an already resolved context
    pub fn from_context(context: Context, applier: Arc<dyn ManifestApplier>) -> Self {
        Self { context, applier }
    }

    /// Organization id every call is scoped to
    pub fn org_id(&self) -> &str {
        &self.context.org_id
    }

    /// Shared controller context
    pub fn context(&self) -> &Context {
        &self.context
    }

    /// IP allow-list controller sharing the process-wide instance locks
    pub fn ip_allow_lists(&self) -> IpAllowListController {
        IpAllowListController::new(self.context.clone())
    }

    /// Kargo agent controller
    pub fn agents(&self) -> AgentController {
        AgentController::new(self.context.clone(), self.applier.clone())
    }

    /// Export an instance with all of its declarative resources
    pub async fn export_instance(&self, ctx: &CallContext, instance_id: &str) -> Result<Value, Error> {
        let context = &self.context;
        retry_rpc(ctx, &context.retry, "export instance", || {
            context.gateway.export_instance(&context.org_id, instance_id)
        })
        .await
    }
}
