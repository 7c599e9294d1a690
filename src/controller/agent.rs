//! Kargo agent controller
//!
//! An agent is registered on the platform first (server upsert). When a
//! kubeconfig is attached the platform-rendered manifests are then applied to
//! that cluster and the agent's health is awaited. Agent operations are not
//! locked: the engine serializes work per agent and different agents of one
//! instance commute on the server.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use akp_common::{wait_for_status, CallContext, DiagContext, Error, RpcError, WaitConfig};
use akp_gateway::{AgentSize, HealthStatusCode, KargoAgent, ReconciliationStatusCode};
use akp_kube::{ApplyOptions, DeleteOptions, DryRun, Kubeconfig, ManifestApplier, Validation};

use super::Context;
use crate::kustomization;
use crate::resource::{Outcome, PlanAction};

/// Fields whose change forces a replace
pub const AGENT_REPLACE_FIELDS: &[&str] = &["name", "instance_id", "remote_argocd", "akuity_managed"];

const ENTITY: &str = "kargo_agent";
const AGENT_API_VERSION: &str = "kargo.akuity.io/v1alpha1";
const AGENT_KIND: &str = "KargoAgent";

fn default_true() -> bool {
    true
}

/// Declared agent settings
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentSpec {
    /// Agent size
    #[serde(default)]
    pub size: AgentSize,
    /// Pin the agent version
    #[serde(default)]
    pub auto_upgrade_disabled: bool,
    /// Version to run when auto-upgrade is disabled
    #[serde(default)]
    pub target_version: String,
    /// Kustomization YAML applied to the rendered manifests
    #[serde(default)]
    pub kustomization: Option<String>,
    /// Argo CD instance the agent reports to
    #[serde(default)]
    pub remote_argocd: String,
    /// Managed by the platform rather than installed by the user
    #[serde(default)]
    pub akuity_managed: bool,
    /// Namespace of the Argo CD the agent talks to
    #[serde(default)]
    pub argocd_namespace: String,
}

/// State of one Kargo agent resource
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Agent {
    /// Server-assigned id, empty before create
    #[serde(default)]
    pub id: String,
    /// Kargo instance the agent belongs to
    pub instance_id: String,
    /// Agent name, unique per instance
    pub name: String,
    /// Namespace the agent is installed into
    #[serde(default)]
    pub namespace: String,
    /// Free-form description
    #[serde(default)]
    pub description: String,
    /// Labels
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Annotations
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    /// Workspace id or name; the organization's default when unset
    #[serde(default)]
    pub workspace: Option<String>,
    /// Agent settings
    #[serde(default)]
    pub spec: AgentSpec,
    /// Re-apply cluster manifests on every update
    #[serde(default)]
    pub reapply_manifests_on_update: bool,
    /// Delete cluster resources when the agent is destroyed
    #[serde(default = "default_true")]
    pub remove_agent_resources_on_destroy: bool,
    /// Cluster to install the agent on. Read from declarations, never written
    /// to state.
    #[serde(default, skip_serializing)]
    pub kube_config: Option<Kubeconfig>,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("id", &self.id)
            .field("instance_id", &self.instance_id)
            .field("name", &self.name)
            .field("namespace", &self.namespace)
            .field("workspace", &self.workspace)
            .field("spec", &self.spec)
            .field("kube_config", &self.kube_config.as_ref().map(|_| "<set>"))
            .finish_non_exhaustive()
    }
}

impl Agent {
    /// Declared agent without an id
    pub fn new(instance_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            name: name.into(),
            remove_agent_resources_on_destroy: true,
            ..Default::default()
        }
    }

    /// Attach the kubeconfig of `declared` to state read back from storage
    ///
    /// State never carries a kubeconfig, so delete takes it from the
    /// declaration. A kubeconfig already on the state wins.
    pub fn with_declared_kube_config(mut self, declared: &Agent) -> Self {
        if self.kube_config.is_none() {
            self.kube_config = declared.kube_config.clone();
        }
        self
    }

    fn diag(&self, operation: &str) -> DiagContext {
        let entity = if self.id.is_empty() {
            format!("{ENTITY} {}", self.name)
        } else {
            format!("{ENTITY} {} ({})", self.name, self.id)
        };
        DiagContext::new(operation, entity).with_instance(&self.instance_id)
    }

    /// Copy suitable for state: no kubeconfig
    fn for_state(&self) -> Self {
        Self {
            kube_config: None,
            ..self.clone()
        }
    }

    /// The platform's nested KargoAgent document
    fn to_platform(&self) -> Result<Value, Error> {
        let kustomization = match &self.spec.kustomization {
            Some(text) => kustomization::parse(text)?,
            None => None,
        };
        let mut data = json!({
            "size": self.spec.size.as_str(),
            "autoUpgradeDisabled": self.spec.auto_upgrade_disabled,
            "targetVersion": self.spec.target_version,
            "remoteArgocd": self.spec.remote_argocd,
            "akuityManaged": self.spec.akuity_managed,
            "argocdNamespace": self.spec.argocd_namespace,
        });
        if let (Some(k), Some(obj)) = (kustomization, data.as_object_mut()) {
            obj.insert("kustomization".to_string(), k);
        }

        let mut metadata = json!({ "name": self.name });
        if let Some(obj) = metadata.as_object_mut() {
            if !self.namespace.is_empty() {
                obj.insert("namespace".to_string(), json!(self.namespace));
            }
            if !self.labels.is_empty() {
                obj.insert("labels".to_string(), json!(self.labels));
            }
            if !self.annotations.is_empty() {
                obj.insert("annotations".to_string(), json!(self.annotations));
            }
        }

        Ok(json!({
            "apiVersion": AGENT_API_VERSION,
            "kind": AGENT_KIND,
            "metadata": metadata,
            "spec": {
                "description": self.description,
                "data": data,
            },
        }))
    }

    /// Merge what the platform reports into this state
    fn observed(&self, server: &KargoAgent) -> Result<Self, Error> {
        let kustomization = kustomization::reconcile(
            self.spec.kustomization.as_deref(),
            server.data.kustomization.as_ref(),
        )?;
        Ok(Self {
            id: server.id.clone(),
            instance_id: self.instance_id.clone(),
            name: server.name.clone(),
            namespace: server.namespace.clone(),
            description: server.description.clone(),
            labels: server.labels.clone(),
            annotations: server.annotations.clone(),
            workspace: self.workspace.clone(),
            spec: AgentSpec {
                size: server.data.size,
                auto_upgrade_disabled: server.data.auto_upgrade_disabled,
                target_version: server.data.target_version.clone(),
                kustomization,
                remote_argocd: server.data.remote_argocd.clone(),
                akuity_managed: server.data.akuity_managed,
                argocd_namespace: server.data.argocd_namespace.clone(),
            },
            reapply_manifests_on_update: self.reapply_manifests_on_update,
            remove_agent_resources_on_destroy: self.remove_agent_resources_on_destroy,
            kube_config: None,
        })
    }
}

fn replace_fields(state: &Agent, desired: &Agent) -> Vec<&'static str> {
    let changed = [
        state.name != desired.name,
        state.instance_id != desired.instance_id,
        state.spec.remote_argocd != desired.spec.remote_argocd,
        state.spec.akuity_managed != desired.spec.akuity_managed,
    ];
    AGENT_REPLACE_FIELDS
        .iter()
        .zip(changed)
        .filter_map(|(field, changed)| changed.then_some(*field))
        .collect()
}

fn validate(agent: &Agent) -> Result<(), Error> {
    if agent.instance_id.is_empty() {
        return Err(Error::validation_for_field(ENTITY, "instance_id", "instance_id is required"));
    }
    if agent.name.is_empty() {
        return Err(Error::validation_for_field(ENTITY, "name", "name is required"));
    }
    if let Some(text) = &agent.spec.kustomization {
        kustomization::parse(text)?;
    }
    Ok(())
}

/// Split an import id of the form `instance_id/name`
pub fn parse_import_id(id: &str) -> Result<(&str, &str), Error> {
    match id.split_once('/') {
        Some((instance_id, name))
            if !instance_id.is_empty() && !name.is_empty() && !name.contains('/') =>
        {
            Ok((instance_id, name))
        }
        _ => Err(Error::validation_for_field(
            ENTITY,
            "id",
            format!("import id {id:?} must have the form instance_id/name"),
        )),
    }
}

/// Controller for Kargo agents
#[derive(Clone)]
pub struct AgentController {
    context: Context,
    applier: Arc<dyn ManifestApplier>,
    health_wait: WaitConfig,
    reconcile_wait: WaitConfig,
    tombstone_wait: WaitConfig,
}

impl std::fmt::Debug for AgentController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentController")
            .field("context", &self.context)
            .field("health_wait", &self.health_wait)
            .field("reconcile_wait", &self.reconcile_wait)
            .field("tombstone_wait", &self.tombstone_wait)
            .finish_non_exhaustive()
    }
}

impl AgentController {
    /// Controller with default wait timing
    pub fn new(context: Context, applier: Arc<dyn ManifestApplier>) -> Self {
        Self {
            context,
            applier,
            health_wait: WaitConfig::default(),
            reconcile_wait: WaitConfig::default(),
            tombstone_wait: WaitConfig::new(Duration::from_secs(30), Duration::from_secs(1)),
        }
    }

    /// Override health and reconciliation wait timing
    pub fn with_waits(mut self, health: WaitConfig, reconcile: WaitConfig) -> Self {
        self.health_wait = health;
        self.reconcile_wait = reconcile;
        self
    }

    /// Override how long delete waits for the platform to drop the agent
    pub fn with_tombstone_wait(mut self, wait: WaitConfig) -> Self {
        self.tombstone_wait = wait;
        self
    }

    /// What applying `desired` over `state` would do
    pub fn plan(state: Option<&Agent>, desired: &Agent) -> PlanAction {
        let Some(state) = state else {
            return PlanAction::Create;
        };
        let changed = state.namespace != desired.namespace
            || state.description != desired.description
            || state.labels != desired.labels
            || state.annotations != desired.annotations
            || state.workspace != desired.workspace
            || state.reapply_manifests_on_update != desired.reapply_manifests_on_update
            || state.remove_agent_resources_on_destroy != desired.remove_agent_resources_on_destroy
            || spec_changed(&state.spec, &desired.spec);
        PlanAction::from_changes(replace_fields(state, desired), changed)
    }

    /// Register the agent and install it on the attached cluster
    pub async fn create(&self, ctx: &CallContext, plan: &Agent) -> Outcome<Agent> {
        let diag = plan.diag("create");
        const SUMMARY: &str = "Unable to create Kargo agent";

        if let Err(e) = validate(plan) {
            return Outcome::failed(&diag, SUMMARY, e);
        }
        if let Err(e) = self.upsert(ctx, plan).await {
            return Outcome::failed(&diag, SUMMARY, e);
        }

        // The agent exists on the platform from here on; every failure keeps
        // it in state so the next apply replaces it
        let mut state = plan.for_state();
        match self.find_by_name(ctx, &plan.instance_id, &plan.name).await {
            Ok(agent) => state.id = agent.id,
            Err(e) => return Outcome::partial(state, &diag, SUMMARY, e).taint(),
        }
        let diag = state.diag("create");

        if let Some(kubeconfig) = &plan.kube_config {
            if let Err(e) = self.install(ctx, &state, kubeconfig).await {
                return Outcome::partial(state, &diag, "Unable to install Kargo agent", e).taint();
            }
            if let Err(e) = self.wait_healthy(ctx, &state).await {
                return Outcome::partial(state, &diag, SUMMARY, e).taint();
            }
        }

        info!(instance_id = %state.instance_id, agent = %state.name, id = %state.id, "Created Kargo agent");
        Outcome::ok(state)
    }

    /// Refresh state from the platform; a missing agent removes the resource
    pub async fn read(&self, ctx: &CallContext, state: &Agent) -> Outcome<Agent> {
        let diag = state.diag("read");
        const SUMMARY: &str = "Unable to read Kargo agent";

        let fetched = if state.id.is_empty() {
            self.find_by_name(ctx, &state.instance_id, &state.name).await
        } else {
            self.context.get_agent(ctx, &state.instance_id, &state.id).await
        };
        let server = match fetched {
            Ok(agent) => agent,
            Err(e) if e.is_not_found() => {
                let mut outcome = Outcome::removed();
                outcome.warn(&diag, "Kargo agent not found, removing from state", e.to_string());
                return outcome;
            }
            Err(e) => return Outcome::partial(state.for_state(), &diag, SUMMARY, e),
        };

        match state.observed(&server) {
            Ok(observed) => Outcome::ok(observed),
            Err(e) => Outcome::partial(state.for_state(), &diag, SUMMARY, e),
        }
    }

    /// Update the agent in place
    pub async fn update(&self, ctx: &CallContext, state: &Agent, plan: &Agent) -> Outcome<Agent> {
        let diag = state.diag("update");
        const SUMMARY: &str = "Unable to update Kargo agent";

        let replace = replace_fields(state, plan);
        if !replace.is_empty() {
            let err = Error::validation_for_field(
                ENTITY,
                replace.join(", "),
                "changing this field requires replacing the agent",
            );
            return Outcome::partial(state.for_state(), &diag, SUMMARY, err);
        }
        if let Err(e) = validate(plan) {
            return Outcome::partial(state.for_state(), &diag, SUMMARY, e);
        }
        if let Err(e) = self.upsert(ctx, plan).await {
            return Outcome::partial(state.for_state(), &diag, SUMMARY, e);
        }

        let next = Agent {
            id: state.id.clone(),
            ..plan.for_state()
        };
        if plan.reapply_manifests_on_update {
            if let Some(kubeconfig) = &plan.kube_config {
                if let Err(e) = self.install(ctx, &next, kubeconfig).await {
                    return Outcome::partial(next, &diag, "Unable to reinstall Kargo agent", e);
                }
                if let Err(e) = self.wait_healthy(ctx, &next).await {
                    return Outcome::partial(next, &diag, SUMMARY, e);
                }
            }
        }

        info!(instance_id = %next.instance_id, agent = %next.name, "Updated Kargo agent");
        Outcome::ok(next)
    }

    /// Remove cluster resources (when asked to) and delete the agent
    pub async fn delete(&self, ctx: &CallContext, state: &Agent) -> Outcome<Agent> {
        let diag = state.diag("delete");
        const SUMMARY: &str = "Unable to delete Kargo agent";

        // State committed before the id was known carries only the name
        let resolved;
        let state = if state.id.is_empty() {
            match self.find_by_name(ctx, &state.instance_id, &state.name).await {
                Ok(agent) => {
                    resolved = Agent {
                        id: agent.id,
                        ..state.clone()
                    };
                    &resolved
                }
                Err(e) if e.is_not_found() => {
                    debug!(agent = %state.name, "Kargo agent already gone");
                    return Outcome::removed();
                }
                Err(e) => return Outcome::partial(state.for_state(), &diag, SUMMARY, e),
            }
        } else {
            state
        };

        if state.remove_agent_resources_on_destroy {
            if let Some(kubeconfig) = &state.kube_config {
                if let Err(e) = self.uninstall(ctx, state, kubeconfig).await {
                    return Outcome::partial(
                        state.for_state(),
                        &diag,
                        "Unable to remove Kargo agent resources",
                        e,
                    );
                }
            }
        }

        let deleted = retry_delete(&self.context, ctx, state).await;
        match deleted {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                debug!(agent = %state.name, "Kargo agent already gone");
                return Outcome::removed();
            }
            Err(e) => return Outcome::partial(state.for_state(), &diag, SUMMARY, e),
        }

        let mut outcome = Outcome::removed();
        if let Err(e) = self.wait_tombstone(ctx, state).await {
            warn!(agent = %state.name, error = %e, "Kargo agent still visible after delete");
            outcome.warn(&diag, "Kargo agent still visible after delete", e.to_string());
        }
        info!(instance_id = %state.instance_id, agent = %state.name, "Deleted Kargo agent");
        outcome
    }

    /// Adopt an existing agent by `instance_id/name`
    pub async fn import(&self, ctx: &CallContext, id: &str) -> Outcome<Agent> {
        let diag = DiagContext::new("import", ENTITY);
        const SUMMARY: &str = "Unable to import Kargo agent";

        let (instance_id, name) = match parse_import_id(id) {
            Ok(parts) => parts,
            Err(e) => return Outcome::failed(&diag, SUMMARY, e),
        };
        let seed = Agent::new(instance_id, name);
        let diag = seed.diag("import");

        let server = match self.find_by_name(ctx, instance_id, name).await {
            Ok(agent) => agent,
            Err(e) => return Outcome::failed(&diag, SUMMARY, e),
        };
        match seed.observed(&server) {
            Ok(state) => Outcome::ok(state),
            Err(e) => Outcome::failed(&diag, SUMMARY, e),
        }
    }

    async fn resolve_workspace(&self, ctx: &CallContext, workspace: Option<&str>) -> Result<String, Error> {
        let workspaces = self.context.list_workspaces(ctx).await?;
        let found = match workspace {
            Some(wanted) => workspaces.iter().find(|w| w.id == wanted || w.name == wanted),
            None => workspaces.iter().find(|w| w.is_default),
        };
        match (found, workspace) {
            (Some(w), _) => Ok(w.id.clone()),
            (None, Some(wanted)) => Err(Error::validation_for_field(
                ENTITY,
                "workspace",
                format!("workspace {wanted} not found"),
            )),
            (None, None) => Err(Error::validation_for_field(
                ENTITY,
                "workspace",
                "organization has no default workspace",
            )),
        }
    }

    async fn upsert(&self, ctx: &CallContext, agent: &Agent) -> Result<(), Error> {
        let workspace_id = self.resolve_workspace(ctx, agent.workspace.as_deref()).await?;
        let document = agent.to_platform()?;
        info!(
            instance_id = %agent.instance_id,
            agent = %agent.name,
            workspace_id = %workspace_id,
            "Applying Kargo agent"
        );
        let context = &self.context;
        akp_common::retry_rpc(ctx, &context.retry, "apply agent", || {
            context.gateway.apply_agents(
                &context.org_id,
                &agent.instance_id,
                &workspace_id,
                vec![document.clone()],
            )
        })
        .await
    }

    async fn find_by_name(
        &self,
        ctx: &CallContext,
        instance_id: &str,
        name: &str,
    ) -> Result<KargoAgent, Error> {
        self.context
            .list_agents(ctx, instance_id)
            .await?
            .into_iter()
            .find(|a| a.name == name)
            .ok_or_else(|| {
                Error::rpc(
                    "find agent",
                    RpcError::not_found(format!("agent {name} not found in instance {instance_id}")),
                )
            })
    }

    async fn install(
        &self,
        ctx: &CallContext,
        agent: &Agent,
        kubeconfig: &Kubeconfig,
    ) -> Result<(), Error> {
        self.wait_reconciled(ctx, agent).await?;
        let manifests = self
            .context
            .agent_manifests(ctx, &agent.instance_id, &agent.id)
            .await?;
        let options = ApplyOptions {
            dry_run: DryRun::None,
            force: true,
            validate: Validation::Strict,
        };
        let report = self.applier.apply(ctx, kubeconfig, &manifests, &options).await?;
        info!(
            agent = %agent.name,
            applied = report.applied.len(),
            "Applied Kargo agent manifests"
        );
        Ok(())
    }

    async fn uninstall(
        &self,
        ctx: &CallContext,
        agent: &Agent,
        kubeconfig: &Kubeconfig,
    ) -> Result<(), Error> {
        let manifests = self
            .context
            .agent_manifests(ctx, &agent.instance_id, &agent.id)
            .await?;
        self.applier
            .delete(ctx, kubeconfig, &manifests, &DeleteOptions::default())
            .await?;
        info!(agent = %agent.name, "Removed Kargo agent resources from cluster");
        Ok(())
    }

    async fn wait_reconciled(&self, ctx: &CallContext, agent: &Agent) -> Result<(), Error> {
        let label = format!("agent {} reconciliation", agent.name);
        wait_for_status(
            ctx,
            &self.reconcile_wait,
            &label,
            &[ReconciliationStatusCode::Successful, ReconciliationStatusCode::Failed],
            || {
                self.context
                    .gateway
                    .get_agent(&self.context.org_id, &agent.instance_id, &agent.id)
            },
            KargoAgent::reconciliation,
        )
        .await
        .map(|_| ())
    }

    async fn wait_healthy(&self, ctx: &CallContext, agent: &Agent) -> Result<(), Error> {
        let label = format!("agent {} health", agent.name);
        wait_for_status(
            ctx,
            &self.health_wait,
            &label,
            &[HealthStatusCode::Healthy, HealthStatusCode::Degraded],
            || {
                self.context
                    .gateway
                    .get_agent(&self.context.org_id, &agent.instance_id, &agent.id)
            },
            KargoAgent::health,
        )
        .await
        .map(|_| ())
    }

    /// Poll until the platform stops returning the agent
    async fn wait_tombstone(&self, ctx: &CallContext, agent: &Agent) -> Result<(), Error> {
        let ctx = ctx.with_default_timeout(self.tombstone_wait.timeout);
        loop {
            let polled = ctx
                .run(
                    "wait agent deletion",
                    self.context
                        .gateway
                        .get_agent(&self.context.org_id, &agent.instance_id, &agent.id),
                )
                .await?;
            match polled {
                Err(e) if e.is_not_found() => return Ok(()),
                Err(e) => debug!(agent = %agent.name, error = %e, "Polling deleted agent"),
                Ok(_) => debug!(agent = %agent.name, "Agent still visible"),
            }
            ctx.sleep("wait agent deletion", self.tombstone_wait.poll_interval)
                .await?;
        }
    }
}

async fn retry_delete(context: &Context, ctx: &CallContext, agent: &Agent) -> Result<(), Error> {
    akp_common::retry_rpc(ctx, &context.retry, "delete agent", || {
        context
            .gateway
            .delete_agent(&context.org_id, &agent.instance_id, &agent.id)
    })
    .await
}

fn spec_changed(state: &AgentSpec, desired: &AgentSpec) -> bool {
    let kustomization_changed = match (&state.kustomization, &desired.kustomization) {
        (Some(a), Some(b)) => match (kustomization::canonicalize(a), kustomization::canonicalize(b)) {
            (Ok(a), Ok(b)) => a != b,
            _ => a != b,
        },
        (a, b) => a != b,
    };
    state.size != desired.size
        || state.auto_upgrade_disabled != desired.auto_upgrade_disabled
        || state.target_version != desired.target_version
        || state.argocd_namespace != desired.argocd_namespace
        || kustomization_changed
}
