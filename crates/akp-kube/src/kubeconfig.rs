//! Credential bundle for a user-supplied cluster
//!
//! A [`Kubeconfig`] either points at a kubeconfig file (optionally selecting a
//! context, cluster and user) or carries inline connection fields. It is
//! converted to a `kube::Config` on demand and never persisted.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use kube::config::{KubeConfigOptions, Kubeconfig as KubeconfigFile};
use kube::{Client, Config};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use akp_common::Error;

/// Connect timeout for user cluster clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Read timeout for user cluster clients
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(60);

const INLINE_NAME: &str = "akp";

/// Exec credential plugin
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecConfig {
    /// client.authentication.k8s.io API version
    pub api_version: String,
    /// Plugin binary
    pub command: String,
    /// Plugin arguments
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment for the plugin
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// Connection settings for a user cluster
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Kubeconfig {
    /// API server URL
    #[serde(default)]
    pub host: Option<String>,
    /// Basic auth user
    #[serde(default)]
    pub username: Option<String>,
    /// Basic auth password
    #[serde(default)]
    pub password: Option<String>,
    /// Skip TLS verification of the API server
    #[serde(default)]
    pub insecure: bool,
    /// PEM client certificate
    #[serde(default)]
    pub client_certificate: Option<String>,
    /// PEM client key
    #[serde(default)]
    pub client_key: Option<String>,
    /// PEM CA bundle of the API server
    #[serde(default)]
    pub cluster_ca_certificate: Option<String>,
    /// Kubeconfig file to load instead of inline fields
    #[serde(default)]
    pub config_path: Option<String>,
    /// Context to select from the file
    #[serde(default)]
    pub config_context: Option<String>,
    /// User to select from the file
    #[serde(default)]
    pub config_context_auth_info: Option<String>,
    /// Cluster to select from the file
    #[serde(default)]
    pub config_context_cluster: Option<String>,
    /// Bearer token
    #[serde(default)]
    pub token: Option<String>,
    /// HTTP proxy for API server traffic
    #[serde(default)]
    pub proxy_url: Option<String>,
    /// Exec credential plugin
    #[serde(default)]
    pub exec: Option<ExecConfig>,
}

impl fmt::Debug for Kubeconfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redact = |v: &Option<String>| v.as_ref().map(|_| "<redacted>");
        f.debug_struct("Kubeconfig")
            .field("host", &self.host)
            .field("username", &self.username)
            .field("password", &redact(&self.password))
            .field("insecure", &self.insecure)
            .field("client_certificate", &redact(&self.client_certificate))
            .field("client_key", &redact(&self.client_key))
            .field("cluster_ca_certificate", &redact(&self.cluster_ca_certificate))
            .field("config_path", &self.config_path)
            .field("config_context", &self.config_context)
            .field("config_context_auth_info", &self.config_context_auth_info)
            .field("config_context_cluster", &self.config_context_cluster)
            .field("token", &redact(&self.token))
            .field("proxy_url", &self.proxy_url)
            .field("exec", &self.exec.as_ref().map(|e| &e.command))
            .finish()
    }
}

fn insert_opt(map: &mut Map<String, Value>, key: &str, value: Option<Value>) {
    if let Some(v) = value {
        map.insert(key.to_string(), v);
    }
}

fn b64(pem: &Option<String>) -> Option<Value> {
    pem.as_ref().map(|p| Value::String(STANDARD.encode(p.as_bytes())))
}

impl Kubeconfig {
    /// True when the bundle points at a file
    pub fn uses_file(&self) -> bool {
        self.config_path.is_some()
    }

    fn options(&self) -> KubeConfigOptions {
        KubeConfigOptions {
            context: self.config_context.clone(),
            cluster: self.config_context_cluster.clone(),
            user: self.config_context_auth_info.clone(),
        }
    }

    /// Render the inline fields as a kubeconfig document with one cluster,
    /// one user and one current context
    pub fn to_document(&self) -> Result<Value, Error> {
        let host = self
            .host
            .as_deref()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| {
                Error::validation_for_field("kube_config", "host", "host is required")
            })?;

        let mut cluster = Map::new();
        cluster.insert("server".to_string(), json!(host));
        if self.insecure {
            cluster.insert("insecure-skip-tls-verify".to_string(), json!(true));
        }
        insert_opt(
            &mut cluster,
            "certificate-authority-data",
            b64(&self.cluster_ca_certificate),
        );
        insert_opt(&mut cluster, "proxy-url", self.proxy_url.clone().map(Value::String));

        let mut user = Map::new();
        insert_opt(&mut user, "token", self.token.clone().map(Value::String));
        insert_opt(&mut user, "username", self.username.clone().map(Value::String));
        insert_opt(&mut user, "password", self.password.clone().map(Value::String));
        insert_opt(
            &mut user,
            "client-certificate-data",
            b64(&self.client_certificate),
        );
        insert_opt(&mut user, "client-key-data", b64(&self.client_key));
        if let Some(exec) = &self.exec {
            let env: Vec<Value> = exec
                .env
                .iter()
                .map(|(name, value)| json!({ "name": name, "value": value }))
                .collect();
            user.insert(
                "exec".to_string(),
                json!({
                    "apiVersion": exec.api_version,
                    "command": exec.command,
                    "args": exec.args,
                    "env": env,
                }),
            );
        }

        Ok(json!({
            "apiVersion": "v1",
            "kind": "Config",
            "current-context": INLINE_NAME,
            "clusters": [{ "name": INLINE_NAME, "cluster": cluster }],
            "users": [{ "name": INLINE_NAME, "user": user }],
            "contexts": [{
                "name": INLINE_NAME,
                "context": { "cluster": INLINE_NAME, "user": INLINE_NAME }
            }],
        }))
    }

    /// Load the kube client configuration
    pub async fn to_config(&self) -> Result<Config, Error> {
        let (file, options) = match &self.config_path {
            Some(path) => {
                let file = KubeconfigFile::read_from(path).map_err(|e| {
                    Error::manifest("client", format!("failed to read kubeconfig {path}: {e}"))
                })?;
                (file, self.options())
            }
            None => {
                let document = serde_json::to_string(&self.to_document()?)?;
                let file = KubeconfigFile::from_yaml(&document).map_err(|e| {
                    Error::manifest("client", format!("invalid kubeconfig: {e}"))
                })?;
                (file, KubeConfigOptions::default())
            }
        };

        let mut config = Config::from_custom_kubeconfig(file, &options)
            .await
            .map_err(|e| Error::manifest("client", format!("failed to load kubeconfig: {e}")))?;
        config.connect_timeout = Some(DEFAULT_CONNECT_TIMEOUT);
        config.read_timeout = Some(DEFAULT_READ_TIMEOUT);
        Ok(config)
    }

    /// Build a client for the cluster
    pub async fn client(&self) -> Result<Client, Error> {
        let config = self.to_config().await?;
        Client::try_from(config)
            .map_err(|e| Error::manifest("client", format!("failed to create client: {e}")))
    }
}
