//! Apply and delete rendered manifests on a user cluster
//!
//! Agent manifests arrive as one multi-document YAML stream. Documents are
//! applied with server-side apply in kind priority order; API discovery is
//! re-run after CRDs so custom resources in the same stream resolve. Deletion
//! walks the same order backwards.

use std::time::Duration;

use async_trait::async_trait;
use kube::api::{
    Api, DeleteParams, DynamicObject, GroupVersionKind, Patch, PatchParams, PropagationPolicy,
};
use kube::discovery::{ApiCapabilities, ApiResource, Discovery, Scope};
use kube::Client;
use serde_json::Value;
use tracing::{debug, info, trace, warn};

use akp_common::yaml::parse_yaml_multi;
use akp_common::{retry_rpc, CallContext, Error, RetryConfig, RpcCode, RpcError};

use crate::kubeconfig::Kubeconfig;

/// Field manager recorded on applied objects
pub const FIELD_MANAGER: &str = "akp";

const DELETE_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Dry-run strategy
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DryRun {
    /// Persist changes
    #[default]
    None,
    /// Parse and resolve locally, never send a write
    Client,
    /// Send writes with the server's dry-run flag
    Server,
}

/// Server-side field validation
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Validation {
    /// Unknown or duplicate fields fail the request
    #[default]
    Strict,
    /// Unknown fields are reported as warnings
    Warn,
    /// Unknown fields are dropped silently
    Ignore,
}

/// Options for [`ManifestApplier::apply`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ApplyOptions {
    /// Dry-run strategy
    pub dry_run: DryRun,
    /// Take ownership of fields managed by others
    pub force: bool,
    /// Field validation
    pub validate: Validation,
}

impl Default for ApplyOptions {
    fn default() -> Self {
        Self {
            dry_run: DryRun::None,
            force: true,
            validate: Validation::Strict,
        }
    }
}

/// Dependent cleanup policy for deletes
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Cascade {
    /// Delete the owner now, dependents in the background
    #[default]
    Background,
    /// Delete dependents before the owner
    Foreground,
    /// Leave dependents behind
    Orphan,
}

impl From<Cascade> for PropagationPolicy {
    fn from(cascade: Cascade) -> Self {
        match cascade {
            Cascade::Background => PropagationPolicy::Background,
            Cascade::Foreground => PropagationPolicy::Foreground,
            Cascade::Orphan => PropagationPolicy::Orphan,
        }
    }
}

/// Options for [`ManifestApplier::delete`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeleteOptions {
    /// Skip graceful termination
    pub force: bool,
    /// Block until every object is gone
    pub wait_for_deletion: bool,
    /// Treat already-absent objects as deleted
    pub ignore_not_found: bool,
    /// Grace period override in seconds
    pub grace_period: Option<u32>,
    /// Dependent cleanup policy
    pub cascade: Cascade,
    /// Upper bound on `wait_for_deletion`
    pub wait_timeout: Duration,
}

impl Default for DeleteOptions {
    fn default() -> Self {
        Self {
            force: false,
            wait_for_deletion: false,
            ignore_not_found: true,
            grace_period: None,
            cascade: Cascade::Background,
            wait_timeout: Duration::from_secs(5 * 60),
        }
    }
}

/// What an apply touched
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ApplyReport {
    /// `Kind namespace/name` of every applied object
    pub applied: Vec<String>,
    /// Objects skipped because their type is not served by the cluster
    pub skipped: Vec<String>,
    /// True when nothing was persisted
    pub dry_run: bool,
}

/// Applies and deletes manifests on a cluster described by a [`Kubeconfig`]
#[cfg_attr(any(test, feature = "mock"), mockall::automock)]
#[async_trait]
pub trait ManifestApplier: Send + Sync {
    /// Apply every document in `manifests`
    async fn apply(
        &self,
        ctx: &CallContext,
        kubeconfig: &Kubeconfig,
        manifests: &str,
        options: &ApplyOptions,
    ) -> Result<ApplyReport, Error>;

    /// Delete every object named in `manifests`
    async fn delete(
        &self,
        ctx: &CallContext,
        kubeconfig: &Kubeconfig,
        manifests: &str,
        options: &DeleteOptions,
    ) -> Result<(), Error>;
}

/// Priority of a kind when applying (lower first)
pub fn kind_priority(kind: &str) -> u8 {
    match kind {
        "Namespace" => 0,
        "CustomResourceDefinition" => 1,
        "ServiceAccount" => 2,
        "ClusterRole" | "Role" => 3,
        "ClusterRoleBinding" | "RoleBinding" => 4,
        "ConfigMap" | "Secret" => 5,
        "Service" => 6,
        "Deployment" | "DaemonSet" | "StatefulSet" | "Job" => 7,
        _ => 8,
    }
}

/// One manifest document with its identifying fields
#[derive(Clone, Debug, PartialEq)]
pub struct ManifestObject {
    /// Full document
    pub value: Value,
    /// Group, version and kind
    pub gvk: GroupVersionKind,
    /// metadata.name
    pub name: String,
    /// metadata.namespace
    pub namespace: Option<String>,
}

impl ManifestObject {
    fn from_value(value: Value) -> Result<Self, Error> {
        let api_version = value
            .get("apiVersion")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::manifest("parse", "manifest missing apiVersion"))?;
        let kind = value
            .get("kind")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::manifest("parse", "manifest missing kind"))?;
        let name = value
            .pointer("/metadata/name")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                Error::manifest("parse", format!("{kind} manifest missing metadata.name"))
            })?
            .to_string();
        let namespace = value
            .pointer("/metadata/namespace")
            .and_then(Value::as_str)
            .map(str::to_string);

        let (group, version) = match api_version.split_once('/') {
            Some((g, v)) => (g.to_string(), v.to_string()),
            None => (String::new(), api_version.to_string()),
        };
        let gvk = GroupVersionKind {
            group,
            version,
            kind: kind.to_string(),
        };

        Ok(Self {
            value,
            gvk,
            name,
            namespace,
        })
    }

    /// `Kind namespace/name`, or `Kind name` for cluster-scoped objects
    pub fn display_name(&self) -> String {
        match &self.namespace {
            Some(ns) => format!("{} {}/{}", self.gvk.kind, ns, self.name),
            None => format!("{} {}", self.gvk.kind, self.name),
        }
    }

    fn priority(&self) -> u8 {
        kind_priority(&self.gvk.kind)
    }
}

/// Split a YAML stream into objects sorted by apply priority.
///
/// `*List` documents are expanded into their items. The sort is stable, so
/// objects of equal priority keep stream order.
pub fn parse_manifests(manifests: &str) -> Result<Vec<ManifestObject>, Error> {
    let docs = parse_yaml_multi(manifests)
        .map_err(|e| Error::manifest("parse", format!("invalid manifest YAML: {e}")))?;

    let mut objects = Vec::new();
    for doc in docs {
        let is_list = doc
            .get("kind")
            .and_then(Value::as_str)
            .is_some_and(|k| k.ends_with("List"))
            && doc.get("items").is_some_and(Value::is_array);
        if is_list {
            if let Some(Value::Array(items)) = doc.get("items") {
                for item in items {
                    objects.push(ManifestObject::from_value(item.clone())?);
                }
            }
        } else {
            objects.push(ManifestObject::from_value(doc)?);
        }
    }

    objects.sort_by_key(ManifestObject::priority);
    Ok(objects)
}

/// Map a kube client error onto a platform status so the retry kernel can
/// classify it
pub fn kube_rpc_error(err: kube::Error) -> RpcError {
    match err {
        kube::Error::Api(resp) => RpcError::new(
            RpcCode::from_http_status(resp.code),
            format!("{}: {}", resp.reason, resp.message),
        ),
        kube::Error::HyperError(e) => RpcError::unavailable(e.to_string()),
        kube::Error::Service(e) => RpcError::unavailable(e.to_string()),
        other => RpcError::unknown(other.to_string()),
    }
}

fn is_kube_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == 404)
}

fn patch_params(options: &ApplyOptions) -> PatchParams {
    let mut params = PatchParams::apply(FIELD_MANAGER);
    if options.force {
        params = params.force();
    }
    params.dry_run = options.dry_run == DryRun::Server;
    match options.validate {
        Validation::Strict => params.validation_strict(),
        Validation::Warn => params.validation_warn(),
        Validation::Ignore => params.validation_ignore(),
    }
}

fn delete_params(options: &DeleteOptions) -> DeleteParams {
    let grace_period = if options.force {
        Some(0)
    } else {
        options.grace_period
    };
    DeleteParams {
        propagation_policy: Some(options.cascade.into()),
        grace_period_seconds: grace_period,
        ..DeleteParams::default()
    }
}

fn dynamic_api(
    client: &Client,
    obj: &ManifestObject,
    ar: &ApiResource,
    caps: &ApiCapabilities,
) -> Api<DynamicObject> {
    match (&caps.scope, &obj.namespace) {
        (Scope::Cluster, _) => Api::all_with(client.clone(), ar),
        (Scope::Namespaced, Some(ns)) => Api::namespaced_with(client.clone(), ns, ar),
        (Scope::Namespaced, None) => Api::default_namespaced_with(client.clone(), ar),
    }
}

/// [`ManifestApplier`] backed by kube-rs
#[derive(Clone, Debug, Default)]
pub struct KubeManifestApplier {
    discovery_retry: RetryConfig,
}

impl KubeManifestApplier {
    /// Applier with discovery retries starting at one second
    pub fn new() -> Self {
        Self {
            discovery_retry: RetryConfig {
                initial_delay: Duration::from_secs(1),
                ..RetryConfig::default()
            },
        }
    }

    /// Override the discovery retry policy
    pub fn with_discovery_retry(mut self, config: RetryConfig) -> Self {
        self.discovery_retry = config;
        self
    }

    async fn discover(&self, ctx: &CallContext, client: &Client) -> Result<Discovery, Error> {
        retry_rpc(ctx, &self.discovery_retry, "api-discovery", || {
            let client = client.clone();
            async move { Discovery::new(client).run().await.map_err(kube_rpc_error) }
        })
        .await
    }

    async fn wait_deleted(
        &self,
        ctx: &CallContext,
        api: &Api<DynamicObject>,
        obj: &ManifestObject,
    ) -> Result<(), Error> {
        loop {
            let current = ctx
                .run("wait-deletion", api.get_opt(&obj.name))
                .await?
                .map_err(|e| Error::rpc("wait-deletion", kube_rpc_error(e)))?;
            if current.is_none() {
                trace!(object = %obj.display_name(), "deleted");
                return Ok(());
            }
            ctx.sleep("wait-deletion", DELETE_POLL_INTERVAL).await?;
        }
    }
}

#[async_trait]
impl ManifestApplier for KubeManifestApplier {
    async fn apply(
        &self,
        ctx: &CallContext,
        kubeconfig: &Kubeconfig,
        manifests: &str,
        options: &ApplyOptions,
    ) -> Result<ApplyReport, Error> {
        let objects = parse_manifests(manifests)?;
        let mut report = ApplyReport {
            dry_run: options.dry_run != DryRun::None,
            ..ApplyReport::default()
        };
        if objects.is_empty() {
            return Ok(report);
        }

        let client = kubeconfig.client().await?;
        let params = patch_params(options);
        let mut discovery = self.discover(ctx, &client).await?;
        let mut crds_pending = objects
            .iter()
            .any(|o| o.gvk.kind == "CustomResourceDefinition");

        for obj in &objects {
            // CRDs sort before every custom resource, so the first non-CRD
            // after them sees the new types
            if crds_pending && obj.priority() > kind_priority("CustomResourceDefinition") {
                crds_pending = false;
                if options.dry_run != DryRun::Client {
                    debug!("re-running API discovery after CRDs");
                    discovery = self.discover(ctx, &client).await?;
                }
            }

            let Some((ar, caps)) = discovery.resolve_gvk(&obj.gvk) else {
                if options.validate == Validation::Strict {
                    return Err(Error::manifest(
                        "apply",
                        format!("unknown resource type for {}", obj.display_name()),
                    ));
                }
                warn!(object = %obj.display_name(), "resource type not served, skipping");
                report.skipped.push(obj.display_name());
                continue;
            };

            if options.dry_run != DryRun::Client {
                let api = dynamic_api(&client, obj, &ar, &caps);
                ctx.run("apply", api.patch(&obj.name, &params, &Patch::Apply(&obj.value)))
                    .await?
                    .map_err(|e| {
                        Error::manifest(
                            "apply",
                            format!("failed to apply {}: {}", obj.display_name(), e),
                        )
                    })?;
            }
            trace!(object = %obj.display_name(), "applied");
            report.applied.push(obj.display_name());
        }

        info!(
            applied = report.applied.len(),
            skipped = report.skipped.len(),
            dry_run = report.dry_run,
            "applied manifests"
        );
        Ok(report)
    }

    async fn delete(
        &self,
        ctx: &CallContext,
        kubeconfig: &Kubeconfig,
        manifests: &str,
        options: &DeleteOptions,
    ) -> Result<(), Error> {
        let mut objects = parse_manifests(manifests)?;
        if objects.is_empty() {
            return Ok(());
        }
        objects.reverse();

        let client = kubeconfig.client().await?;
        let discovery = self.discover(ctx, &client).await?;
        let params = delete_params(options);
        let mut deleted = Vec::new();

        for obj in &objects {
            let Some((ar, caps)) = discovery.resolve_gvk(&obj.gvk) else {
                if options.ignore_not_found {
                    trace!(object = %obj.display_name(), "type not served, nothing to delete");
                    continue;
                }
                return Err(Error::manifest(
                    "delete",
                    format!("unknown resource type for {}", obj.display_name()),
                ));
            };

            let api = dynamic_api(&client, obj, &ar, &caps);
            match ctx.run("delete", api.delete(&obj.name, &params)).await? {
                Ok(_) => {
                    trace!(object = %obj.display_name(), "delete requested");
                    deleted.push((api, obj));
                }
                Err(e) if is_kube_not_found(&e) && options.ignore_not_found => {
                    trace!(object = %obj.display_name(), "already absent");
                }
                Err(e) => {
                    return Err(Error::manifest(
                        "delete",
                        format!("failed to delete {}: {}", obj.display_name(), e),
                    ));
                }
            }
        }

        if options.wait_for_deletion {
            let wait_ctx = ctx.with_default_timeout(options.wait_timeout);
            for (api, obj) in &deleted {
                self.wait_deleted(&wait_ctx, api, obj).await?;
            }
        }

        info!(deleted = deleted.len(), "deleted manifests");
        Ok(())
    }
}
