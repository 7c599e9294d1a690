//! HTTP implementation of [`PlatformGateway`]
//!
//! Talks to the platform's JSON gateway. Credentials go into the
//! `Authorization` header of every request; non-2xx responses are decoded into
//! [`RpcError`] using the status body when present and the HTTP status
//! otherwise.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::{Client, Method, RequestBuilder, Response, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, trace};

use akp_common::{RpcCode, RpcError};

use crate::client::{ManifestStream, PlatformGateway};
use crate::types::{Instance, KargoAgent, Organization, Workspace};

/// Default timeout for a single unary request
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Default connect timeout
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Authentication injected into every request
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    scheme: String,
    credential: String,
}

impl Credentials {
    /// Arbitrary scheme and credential
    pub fn new(scheme: impl Into<String>, credential: impl Into<String>) -> Self {
        Self {
            scheme: scheme.into(),
            credential: credential.into(),
        }
    }

    /// Organization API key
    pub fn api_key(id: &str, secret: &str) -> Self {
        Self::new("Bearer", format!("{id}:{secret}"))
    }

    /// Authentication scheme, e.g. `Bearer`
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// `Authorization` header value
    pub fn header_value(&self) -> String {
        format!("{} {}", self.scheme, self.credential)
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("scheme", &self.scheme)
            .field("credential", &"<redacted>")
            .finish()
    }
}

/// Settings for [`HttpGateway`]
#[derive(Clone, Debug)]
pub struct HttpGatewayConfig {
    /// Platform base URL
    pub server_url: String,
    /// Credentials for every call
    pub credentials: Credentials,
    /// Accept self-signed certificates (self-hosted platforms)
    pub skip_tls_verify: bool,
    /// Timeout for unary requests
    pub request_timeout: Duration,
}

impl HttpGatewayConfig {
    /// Config with default timeouts
    pub fn new(server_url: impl Into<String>, credentials: Credentials) -> Self {
        Self {
            server_url: server_url.into(),
            credentials,
            skip_tls_verify: false,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

/// Platform client over HTTP/JSON
#[derive(Clone, Debug)]
pub struct HttpGateway {
    client: Client,
    base: Url,
    request_timeout: Duration,
}

/// Status body of a failed call
#[derive(Debug, Deserialize)]
struct StatusBody {
    #[serde(default)]
    code: Option<i32>,
    #[serde(default)]
    message: String,
}

#[derive(Deserialize)]
struct OrganizationResponse {
    organization: Organization,
}

#[derive(Deserialize)]
struct WorkspacesResponse {
    #[serde(default)]
    workspaces: Vec<Workspace>,
}

#[derive(Deserialize)]
struct InstanceResponse {
    instance: Instance,
}

#[derive(Deserialize)]
struct AgentResponse {
    agent: KargoAgent,
}

#[derive(Deserialize)]
struct AgentsResponse {
    #[serde(default)]
    agents: Vec<KargoAgent>,
}

impl HttpGateway {
    /// Build a client
    pub fn new(config: HttpGatewayConfig) -> Result<Self, RpcError> {
        let base = Url::parse(&config.server_url).map_err(|e| {
            RpcError::new(
                RpcCode::InvalidArgument,
                format!("invalid server url {}: {}", config.server_url, e),
            )
        })?;
        if base.cannot_be_a_base() {
            return Err(RpcError::new(
                RpcCode::InvalidArgument,
                format!("server url {} cannot be a base url", config.server_url),
            ));
        }

        let mut auth = HeaderValue::from_str(&config.credentials.header_value()).map_err(|e| {
            RpcError::new(
                RpcCode::InvalidArgument,
                format!("credentials are not a valid header value: {e}"),
            )
        })?;
        auth.set_sensitive(true);
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, auth);

        let client = Client::builder()
            .default_headers(headers)
            .connect_timeout(DEFAULT_CONNECT_TIMEOUT)
            .danger_accept_invalid_certs(config.skip_tls_verify)
            .user_agent(concat!("akp/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(transport_error)?;

        Ok(Self {
            client,
            base,
            request_timeout: config.request_timeout,
        })
    }

    /// Build a URL below `/api/v1` from path segments, escaping each one
    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(["api", "v1"]).extend(segments);
        }
        url
    }

    fn request(&self, method: Method, segments: &[&str]) -> RequestBuilder {
        let url = self.url(segments);
        trace!(method = %method, url = %url, "Platform request");
        self.client
            .request(method, url)
            .timeout(self.request_timeout)
    }

    async fn send(&self, builder: RequestBuilder) -> Result<Response, RpcError> {
        let response = builder.send().await.map_err(transport_error)?;
        if response.status().is_success() {
            return Ok(response);
        }
        Err(status_error(response).await)
    }

    async fn send_json<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<T, RpcError> {
        let response = self.send(builder).await?;
        let bytes = response.bytes().await.map_err(transport_error)?;
        serde_json::from_slice(&bytes).map_err(|e| {
            RpcError::new(RpcCode::Internal, format!("malformed response body: {e}"))
        })
    }
}

/// Map a transport failure to a status
fn transport_error(e: reqwest::Error) -> RpcError {
    let code = if e.is_timeout() {
        RpcCode::DeadlineExceeded
    } else if e.is_connect() {
        RpcCode::Unavailable
    } else {
        RpcCode::Unknown
    };
    RpcError::new(code, e.to_string())
}

/// Decode a failed response
async fn status_error(response: Response) -> RpcError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    decode_status(status, &body)
}

fn decode_status(status: u16, body: &str) -> RpcError {
    match serde_json::from_str::<StatusBody>(body) {
        Ok(parsed) => {
            let code = parsed
                .code
                .and_then(RpcCode::from_i32)
                .filter(|c| *c != RpcCode::Ok)
                .unwrap_or_else(|| RpcCode::from_http_status(status));
            let message = if parsed.message.is_empty() {
                format!("http status {status}")
            } else {
                parsed.message
            };
            RpcError::new(code, message)
        }
        Err(_) => {
            let message = if body.trim().is_empty() {
                format!("http status {status}")
            } else {
                body.trim().to_string()
            };
            // A bare 500 comes from a proxy rather than the platform; leave it
            // untyped so the message decides whether it is transient
            let code = match RpcCode::from_http_status(status) {
                RpcCode::Internal => RpcCode::Unknown,
                code => code,
            };
            RpcError::new(code, message)
        }
    }
}

/// Argo CD resource document the apply endpoint expects
fn argocd_document(instance: &Instance) -> Value {
    json!({
        "apiVersion": "argocd.akuity.io/v1alpha1",
        "kind": "ArgoCD",
        "metadata": { "name": instance.name },
        "spec": {
            "description": instance.description,
            "version": instance.version,
            "instanceSpec": instance.spec,
        }
    })
}

#[async_trait]
impl PlatformGateway for HttpGateway {
    async fn get_organization_by_name(&self, name: &str) -> Result<Organization, RpcError> {
        let builder = self
            .request(Method::GET, &["organizations", name])
            .query(&[("idType", "ID_TYPE_NAME")]);
        let resp: OrganizationResponse = self.send_json(builder).await?;
        Ok(resp.organization)
    }

    async fn list_workspaces(&self, org_id: &str) -> Result<Vec<Workspace>, RpcError> {
        let builder = self.request(Method::GET, &["organizations", org_id, "workspaces"]);
        let resp: WorkspacesResponse = self.send_json(builder).await?;
        Ok(resp.workspaces)
    }

    async fn get_instance(&self, org_id: &str, instance_id: &str) -> Result<Instance, RpcError> {
        let builder = self.request(
            Method::GET,
            &["orgs", org_id, "argocd", "instances", instance_id],
        );
        let resp: InstanceResponse = self.send_json(builder).await?;
        Ok(resp.instance)
    }

    async fn apply_instance(
        &self,
        org_id: &str,
        instance: &Instance,
        prune_resource_types: &[String],
    ) -> Result<(), RpcError> {
        debug!(instance_id = %instance.id, "Applying instance");
        let body = json!({
            "idType": "ID",
            "argocd": argocd_document(instance),
            "pruneResourceTypes": prune_resource_types,
        });
        let builder = self
            .request(
                Method::PUT,
                &["orgs", org_id, "argocd", "instances", &instance.id, "apply"],
            )
            .json(&body);
        self.send(builder).await.map(|_| ())
    }

    async fn export_instance(&self, org_id: &str, instance_id: &str) -> Result<Value, RpcError> {
        let builder = self.request(
            Method::GET,
            &["orgs", org_id, "argocd", "instances", instance_id, "export"],
        );
        self.send_json(builder).await
    }

    async fn apply_agents(
        &self,
        org_id: &str,
        instance_id: &str,
        workspace_id: &str,
        agents: Vec<Value>,
    ) -> Result<(), RpcError> {
        debug!(instance_id = %instance_id, agents = agents.len(), "Applying agents");
        let body = json!({
            "idType": "ID",
            "workspaceId": workspace_id,
            "agents": agents,
        });
        let builder = self
            .request(
                Method::PUT,
                &["orgs", org_id, "kargo", "instances", instance_id, "apply"],
            )
            .json(&body);
        self.send(builder).await.map(|_| ())
    }

    async fn get_agent(
        &self,
        org_id: &str,
        instance_id: &str,
        agent_id: &str,
    ) -> Result<KargoAgent, RpcError> {
        let builder = self.request(
            Method::GET,
            &["orgs", org_id, "kargo", "instances", instance_id, "agents", agent_id],
        );
        let resp: AgentResponse = self.send_json(builder).await?;
        Ok(resp.agent)
    }

    async fn list_agents(
        &self,
        org_id: &str,
        instance_id: &str,
    ) -> Result<Vec<KargoAgent>, RpcError> {
        let builder = self.request(
            Method::GET,
            &["orgs", org_id, "kargo", "instances", instance_id, "agents"],
        );
        let resp: AgentsResponse = self.send_json(builder).await?;
        Ok(resp.agents)
    }

    async fn delete_agent(
        &self,
        org_id: &str,
        instance_id: &str,
        agent_id: &str,
    ) -> Result<(), RpcError> {
        let builder = self.request(
            Method::DELETE,
            &["orgs", org_id, "kargo", "instances", instance_id, "agents", agent_id],
        );
        self.send(builder).await.map(|_| ())
    }

    async fn get_agent_manifests(
        &self,
        org_id: &str,
        instance_id: &str,
        agent_id: &str,
    ) -> Result<ManifestStream, RpcError> {
        let url = self.url(&[
            "orgs",
            org_id,
            "kargo",
            "instances",
            instance_id,
            "agents",
            agent_id,
            "manifests",
        ]);
        // Streaming: no overall timeout, the caller's context bounds each read
        let builder = self.client.get(url);
        let response = self.send(builder).await?;
        Ok(response.bytes_stream().map(|chunk| chunk.map_err(transport_error)).boxed())
    }
}
