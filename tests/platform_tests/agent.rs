//! Stories about registering and installing Kargo agents
//!
//! An agent lives in two places: the platform record and the resources
//! installed on the user's cluster. These stories check both stay in step,
//! including when the cluster cannot be reached.

use std::sync::Arc;

use akp::controller::AgentController;
use akp::{Agent, Outcome, PlanAction};
use akp_common::{CallContext, Error, RpcError};
use akp_gateway::AgentSize;

use super::fake::{
    fast_wait, reachable_kubeconfig, unreachable_kubeconfig, FakeApplier, FakePlatform,
    AGENT_SIZE, KARGO_INSTANCE_ID,
};

// =============================================================================
// Test Fixtures
// =============================================================================

const PATCH_KUSTOMIZATION: &str = r#"apiVersion: kustomize.config.k8s.io/v1beta1
kind: Kustomization
patches:
  - patch: |-
      - op: replace
        path: /spec/replicas
        value: 2
    target:
      kind: Deployment
      name: kargo-agent
"#;

fn controller(platform: &FakePlatform, applier: &FakeApplier) -> AgentController {
    AgentController::new(platform.context(), Arc::new(applier.clone()))
        .with_waits(fast_wait(), fast_wait())
        .with_tombstone_wait(fast_wait())
}

fn declared(name: &str) -> Agent {
    let mut agent = Agent::new(KARGO_INSTANCE_ID, name);
    agent.namespace = "akuity".to_string();
    agent.description = "production agent".to_string();
    agent.spec.size = AGENT_SIZE;
    agent.spec.kustomization = Some(PATCH_KUSTOMIZATION.to_string());
    agent.labels.insert("team".to_string(), "platform".to_string());
    agent
}

fn state_of(outcome: Outcome<Agent>) -> Agent {
    match outcome.into_result() {
        Ok(Some(state)) => state,
        Ok(None) => panic!("operation removed the resource"),
        Err(e) => panic!("operation failed: {e}"),
    }
}

fn ctx() -> CallContext {
    CallContext::new()
}

// =============================================================================
// Create and install
// =============================================================================

/// Story: an agent is registered and installed on a reachable cluster; the
/// kubeconfig never reaches state
#[tokio::test(start_paused = true)]
async fn create_registers_and_installs() {
    let platform = FakePlatform::new();
    let applier = FakeApplier::default();
    let mut plan = declared("prod-agent");
    plan.kube_config = Some(reachable_kubeconfig());

    let state = state_of(controller(&platform, &applier).create(&ctx(), &plan).await);

    assert!(!state.id.is_empty());
    assert!(state.kube_config.is_none());
    let serialized = serde_json::to_string(&state).unwrap();
    assert!(!serialized.contains("kube_config"));
    assert!(!serialized.contains("10.0.0.1"));

    let applied = applier.applied();
    assert_eq!(applied.len(), 1);
    assert!(applied[0].contains("kind: Namespace"));
    assert!(applied[0].contains("  namespace: akuity"));

    let registered = platform.agents(KARGO_INSTANCE_ID);
    assert_eq!(registered.len(), 1);
    assert_eq!(registered[0].data.size, AgentSize::Small);
    assert_eq!(registered[0].labels["team"], "platform");
}

/// Story: the kubeconfig points at a host that does not resolve. The agent
/// was already registered, so state is committed without the kubeconfig and
/// tainted; the engine's replace then deletes the agent and nothing is left
/// on the platform
#[tokio::test(start_paused = true)]
async fn failed_install_is_cleaned_up_by_replace() {
    let platform = FakePlatform::new();
    let applier = FakeApplier::default();
    let controller = controller(&platform, &applier);
    let mut plan = declared("test-agent-invalid");
    plan.kube_config = Some(unreachable_kubeconfig());

    let outcome = controller.create(&ctx(), &plan).await;
    assert!(outcome.tainted);
    assert_eq!(outcome.diagnostics.errors().count(), 1);
    assert!(matches!(outcome.error(), Some(Error::Manifest { .. })));
    let partial = outcome.state.clone().unwrap();
    assert!(!partial.id.is_empty());
    assert!(partial.kube_config.is_none());
    assert_eq!(platform.agents(KARGO_INSTANCE_ID).len(), 1);

    // Tainted state is destroyed before the next create
    let destroyed = controller.delete(&ctx(), &partial).await;
    assert!(destroyed.into_result().unwrap().is_none());
    assert!(platform
        .agents(KARGO_INSTANCE_ID)
        .iter()
        .all(|a| a.name != "test-agent-invalid"));
    assert!(applier.applied().is_empty());
}

/// Story: without a kubeconfig the agent is only registered; installation is
/// left to the user
#[tokio::test]
async fn create_without_kubeconfig_only_registers() {
    let platform = FakePlatform::new();
    let applier = FakeApplier::default();

    let state = state_of(
        controller(&platform, &applier)
            .create(&ctx(), &declared("manual-agent"))
            .await,
    );
    assert!(!state.id.is_empty());
    assert_eq!(platform.calls("get_agent_manifests"), 0);
    assert!(applier.applied().is_empty());
}

/// Story: the platform is briefly unavailable while registering
#[tokio::test(start_paused = true)]
async fn registration_is_retried() {
    let platform = FakePlatform::new();
    platform.fail_next("apply_agents", RpcError::unavailable("upstream connect error"));

    let state = state_of(
        controller(&platform, &FakeApplier::default())
            .create(&ctx(), &declared("prod-agent"))
            .await,
    );
    assert!(!state.id.is_empty());
    assert_eq!(platform.calls("apply_agents"), 2);
}

// =============================================================================
// Read, drift and import
// =============================================================================

/// Story: the platform returns the kustomization as JSON with different key
/// order; the user's YAML stays in state so no drift is reported
#[tokio::test]
async fn read_keeps_equivalent_kustomization_text() {
    let platform = FakePlatform::new();
    let controller = controller(&platform, &FakeApplier::default());

    let state = state_of(controller.create(&ctx(), &declared("prod-agent")).await);
    let read = state_of(controller.read(&ctx(), &state).await);

    assert_eq!(read.spec.kustomization.as_deref(), Some(PATCH_KUSTOMIZATION));
    assert_eq!(AgentController::plan(Some(&read), &declared("prod-agent")), PlanAction::NoOp);
}

/// Story: the agent was deleted in the platform UI; read drops it from state
#[tokio::test(start_paused = true)]
async fn read_of_deleted_agent_removes_state() {
    let platform = FakePlatform::new();
    let applier = FakeApplier::default();
    let controller = controller(&platform, &applier);

    let state = state_of(controller.create(&ctx(), &declared("prod-agent")).await);
    let mut removed_elsewhere = state.clone();
    removed_elsewhere.remove_agent_resources_on_destroy = false;
    controller
        .delete(&ctx(), &removed_elsewhere)
        .await
        .into_result()
        .unwrap();

    let outcome = controller.read(&ctx(), &state).await;
    assert!(outcome.state.is_none());
    assert!(!outcome.is_err());
    assert_eq!(outcome.diagnostics.warnings().count(), 1);
}

/// Story: an agent created by hand is adopted by `instance_id/name`
#[tokio::test]
async fn import_adopts_existing_agent() {
    let platform = FakePlatform::new();
    let controller = controller(&platform, &FakeApplier::default());
    let created = state_of(controller.create(&ctx(), &declared("prod-agent")).await);

    let imported = state_of(
        controller
            .import(&ctx(), &format!("{KARGO_INSTANCE_ID}/prod-agent"))
            .await,
    );
    assert_eq!(imported.id, created.id);
    assert_eq!(imported.namespace, "akuity");
    assert_eq!(imported.spec.size, AgentSize::Small);
    assert!(imported.spec.kustomization.is_some());

    let outcome = controller.import(&ctx(), "no-separator").await;
    assert!(matches!(outcome.error(), Some(Error::Validation { .. })));
}

// =============================================================================
// Update
// =============================================================================

/// Story: the agent is resized and its manifests are re-applied because the
/// user opted in
#[tokio::test(start_paused = true)]
async fn update_reapplies_manifests_when_requested() {
    let platform = FakePlatform::new();
    let applier = FakeApplier::default();
    let controller = controller(&platform, &applier);
    let mut plan = declared("prod-agent");
    plan.kube_config = Some(reachable_kubeconfig());
    let state = state_of(controller.create(&ctx(), &plan).await);

    plan.spec.size = AgentSize::Large;
    plan.reapply_manifests_on_update = true;
    assert_eq!(AgentController::plan(Some(&state), &plan), PlanAction::Update);
    let updated = state_of(controller.update(&ctx(), &state, &plan).await);

    assert_eq!(updated.id, state.id);
    assert_eq!(updated.spec.size, AgentSize::Large);
    assert_eq!(applier.applied().len(), 2);
    assert_eq!(platform.agents(KARGO_INSTANCE_ID)[0].data.size, AgentSize::Large);
}

/// Story: moving the agent to another Argo CD cannot happen in place
#[tokio::test]
async fn immutable_change_plans_a_replace() {
    let platform = FakePlatform::new();
    let controller = controller(&platform, &FakeApplier::default());
    let state = state_of(controller.create(&ctx(), &declared("prod-agent")).await);

    let mut plan = declared("prod-agent");
    plan.spec.remote_argocd = "argo-2".to_string();
    assert_eq!(
        AgentController::plan(Some(&state), &plan),
        PlanAction::Replace {
            fields: vec!["remote_argocd"]
        }
    );

    let applies = platform.calls("apply_agents");
    let outcome = controller.update(&ctx(), &state, &plan).await;
    assert!(outcome.is_err());
    assert_eq!(outcome.state.as_ref().map(|a| a.spec.remote_argocd.as_str()), Some(""));
    assert_eq!(platform.calls("apply_agents"), applies);
}

// =============================================================================
// Delete
// =============================================================================

/// Story: deleting removes the cluster resources first, then the platform
/// record, and waits until the platform stops returning it
#[tokio::test(start_paused = true)]
async fn delete_removes_cluster_resources_then_agent() {
    let platform = FakePlatform::new();
    let applier = FakeApplier::default();
    let controller = controller(&platform, &applier);
    let mut plan = declared("prod-agent");
    plan.kube_config = Some(reachable_kubeconfig());
    let mut state = state_of(controller.create(&ctx(), &plan).await);

    state.kube_config = Some(reachable_kubeconfig());
    platform.linger_deleted_agent(&state.id, 3);
    let outcome = controller.delete(&ctx(), &state).await;

    assert!(outcome.into_result().unwrap().is_none());
    assert_eq!(applier.deleted().len(), 1);
    assert!(platform.agents(KARGO_INSTANCE_ID).is_empty());
}

/// Story: the cluster is unreachable during delete; the platform record is
/// kept so nothing is orphaned
#[tokio::test]
async fn delete_stops_when_cluster_cleanup_fails() {
    let platform = FakePlatform::new();
    let applier = FakeApplier::default();
    let controller = controller(&platform, &applier);
    let mut state = state_of(controller.create(&ctx(), &declared("prod-agent")).await);

    state.kube_config = Some(unreachable_kubeconfig());
    let outcome = controller.delete(&ctx(), &state).await;

    assert!(matches!(outcome.error(), Some(Error::Manifest { .. })));
    assert!(outcome.state.is_some());
    assert_eq!(platform.calls("delete_agent"), 0);
    assert_eq!(platform.agents(KARGO_INSTANCE_ID).len(), 1);
}

/// Story: the platform keeps showing the deleted agent past the tombstone
/// wait; delete still succeeds with a warning
#[tokio::test(start_paused = true)]
async fn lingering_agent_is_a_warning() {
    let platform = FakePlatform::new();
    let applier = FakeApplier::default();
    let controller = controller(&platform, &applier);
    let state = state_of(controller.create(&ctx(), &declared("prod-agent")).await);

    platform.linger_deleted_agent(&state.id, u32::MAX);
    let outcome = controller.delete(&ctx(), &state).await;

    assert!(!outcome.is_err());
    assert!(outcome.state.is_none());
    assert_eq!(outcome.diagnostics.warnings().count(), 1);
}
