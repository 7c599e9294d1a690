//! In-memory Akuity Platform and manifest applier
//!
//! `FakePlatform` keeps organizations, workspaces, instances and agents behind
//! one mutex and yields to the scheduler inside every call so that concurrent
//! controller operations interleave. Faults can be queued per method.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use serde_json::{json, Value};

use akp::controller::Context;
use akp_common::{CallContext, Error, RetryConfig, RpcError, WaitConfig};
use akp_gateway::{
    AgentSize, HealthStatus, HealthStatusCode, Instance, InstanceSpec, IpAllowListEntry,
    KargoAgent, KargoAgentData, ManifestStream, Organization, PlatformGateway,
    ReconciliationStatus, ReconciliationStatusCode, Workspace,
};
use akp_kube::{ApplyOptions, ApplyReport, DeleteOptions, Kubeconfig, ManifestApplier};

pub const ORG_NAME: &str = "acme";
pub const ORG_ID: &str = "org-1";
pub const INSTANCE_ID: &str = "argo-1";
pub const KARGO_INSTANCE_ID: &str = "kargo-1";

/// Host the fake applier cannot reach
pub const UNREACHABLE_HOST: &str = "https://invalid";

const AGENT_MANIFESTS: [&str; 3] = [
    "apiVersion: v1\nkind: Namespace\nmetadata:\n  name: akuity\n---\n",
    "apiVersion: v1\nkind: ServiceAccount\nmetadata:\n  name: kargo-agent\n",
    "  namespace: akuity\n",
];

#[derive(Default)]
struct State {
    workspaces: Vec<Workspace>,
    instances: HashMap<String, Instance>,
    agents: HashMap<String, Vec<KargoAgent>>,
    faults: HashMap<&'static str, VecDeque<RpcError>>,
    calls: Vec<&'static str>,
    next_agent: u32,
    /// Report PROGRESSING on the first poll after each apply
    slow_health: bool,
    /// Health every instance reports regardless of applies
    forced_health: Option<HealthStatusCode>,
    /// Polls left before a deleted agent disappears from GetAgent
    agent_tombstones: HashMap<String, u32>,
}

/// In-memory platform
#[derive(Clone, Default)]
pub struct FakePlatform {
    state: Arc<Mutex<State>>,
}

fn healthy() -> Option<HealthStatus> {
    Some(HealthStatus {
        code: HealthStatusCode::Healthy,
        message: String::new(),
    })
}

fn progressing() -> Option<HealthStatus> {
    Some(HealthStatus {
        code: HealthStatusCode::Progressing,
        message: "applying spec".to_string(),
    })
}

impl FakePlatform {
    /// Platform with the default workspace and one healthy instance
    /// carrying a realistic spec
    pub fn new() -> Self {
        let platform = Self::default();
        {
            let mut state = platform.lock();
            state.workspaces = vec![Workspace {
                id: "ws-default".to_string(),
                name: "default".to_string(),
                is_default: true,
            }];
        }
        platform.seed_instance(INSTANCE_ID, vec![]);
        platform
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    /// Add or replace an instance with the given entries
    pub fn seed_instance(&self, id: &str, entries: Vec<IpAllowListEntry>) {
        let mut extra = serde_json::Map::new();
        extra.insert("subdomain".to_string(), json!("prod"));
        extra.insert("declarativeManagementEnabled".to_string(), json!(true));
        extra.insert("metricsIngressUsername".to_string(), Value::Null);
        extra.insert(
            "extensions".to_string(),
            json!([{"id": "rollouts", "version": "v0.3.4"}]),
        );
        let mut instance_extra = serde_json::Map::new();
        instance_extra.insert("workspaceId".to_string(), json!("ws-default"));

        let instance = Instance {
            id: id.to_string(),
            name: format!("{id}-name"),
            description: "production control plane".to_string(),
            version: "v2.13.1".to_string(),
            spec: InstanceSpec {
                ip_allow_list: entries,
                extra,
            },
            health_status: healthy(),
            reconciliation_status: None,
            extra: instance_extra,
        };
        self.lock().instances.insert(id.to_string(), instance);
    }

    /// Make each apply report PROGRESSING once before turning healthy
    pub fn set_slow_health(&self, slow: bool) {
        self.lock().slow_health = slow;
    }

    /// Pin the health every instance reports
    pub fn force_health(&self, code: HealthStatusCode) {
        self.lock().forced_health = Some(code);
    }

    /// Fail the next call of `method` with `err`
    pub fn fail_next(&self, method: &'static str, err: RpcError) {
        self.lock().faults.entry(method).or_default().push_back(err);
    }

    /// Keep a deleted agent visible for this many GetAgent polls
    pub fn linger_deleted_agent(&self, agent_id: &str, polls: u32) {
        self.lock()
            .agent_tombstones
            .insert(agent_id.to_string(), polls);
    }

    /// Number of calls made to `method`
    pub fn calls(&self, method: &str) -> usize {
        self.lock().calls.iter().filter(|c| **c == method).count()
    }

    /// Current instance as stored by the platform
    pub fn instance(&self, id: &str) -> Instance {
        self.lock().instances[id].clone()
    }

    /// Ips on the instance, in list order
    pub fn ips(&self, id: &str) -> Vec<String> {
        self.instance(id)
            .spec
            .ip_allow_list
            .into_iter()
            .map(|e| e.ip)
            .collect()
    }

    /// Replace the instance's list as if edited in the platform UI
    pub fn edit_entries(&self, id: &str, entries: Vec<IpAllowListEntry>) {
        if let Some(instance) = self.lock().instances.get_mut(id) {
            instance.spec.ip_allow_list = entries;
        }
    }

    /// Agents registered against an instance
    pub fn agents(&self, instance_id: &str) -> Vec<KargoAgent> {
        self.lock()
            .agents
            .get(instance_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Controller context over this platform with fast retries
    pub fn context(&self) -> Context {
        Context::new(Arc::new(self.clone()), ORG_ID).with_retry(RetryConfig {
            initial_delay: std::time::Duration::from_millis(10),
            ..RetryConfig::with_max_retries(3)
        })
    }

    fn enter(&self, method: &'static str) -> Result<(), RpcError> {
        let mut state = self.lock();
        state.calls.push(method);
        match state.faults.get_mut(method).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Short wait timing for tests driven by paused time
pub fn fast_wait() -> WaitConfig {
    WaitConfig::new(
        std::time::Duration::from_secs(60),
        std::time::Duration::from_secs(1),
    )
}

fn agent_from_document(document: &Value) -> Result<KargoAgent, RpcError> {
    let name = document["metadata"]["name"]
        .as_str()
        .filter(|n| !n.is_empty())
        .ok_or_else(|| RpcError::new(akp_common::RpcCode::InvalidArgument, "agent name required"))?;
    let data: KargoAgentData = serde_json::from_value(document["spec"]["data"].clone())
        .map_err(|e| RpcError::new(akp_common::RpcCode::InvalidArgument, e.to_string()))?;
    let string_map = |value: &Value| -> BTreeMap<String, String> {
        serde_json::from_value(value.clone()).unwrap_or_default()
    };
    Ok(KargoAgent {
        id: String::new(),
        name: name.to_string(),
        description: document["spec"]["description"]
            .as_str()
            .unwrap_or_default()
            .to_string(),
        namespace: document["metadata"]["namespace"]
            .as_str()
            .unwrap_or_default()
            .to_string(),
        labels: string_map(&document["metadata"]["labels"]),
        annotations: string_map(&document["metadata"]["annotations"]),
        data,
        health_status: healthy(),
        reconciliation_status: Some(ReconciliationStatus {
            code: ReconciliationStatusCode::Successful,
            message: String::new(),
        }),
    })
}

#[async_trait]
impl PlatformGateway for FakePlatform {
    async fn get_organization_by_name(&self, name: &str) -> Result<Organization, RpcError> {
        self.enter("get_organization_by_name")?;
        if name != ORG_NAME {
            return Err(RpcError::not_found(format!("organization {name} not found")));
        }
        Ok(Organization {
            id: ORG_ID.to_string(),
            name: name.to_string(),
        })
    }

    async fn list_workspaces(&self, _org_id: &str) -> Result<Vec<Workspace>, RpcError> {
        self.enter("list_workspaces")?;
        Ok(self.lock().workspaces.clone())
    }

    async fn get_instance(&self, _org_id: &str, instance_id: &str) -> Result<Instance, RpcError> {
        self.enter("get_instance")?;
        let snapshot = {
            let mut state = self.lock();
            let Some(instance) = state.instances.get_mut(instance_id) else {
                return Err(RpcError::not_found(format!("instance {instance_id} not found")));
            };
            let mut snapshot = instance.clone();
            if instance.health_status == progressing() {
                instance.health_status = healthy();
            }
            if let Some(code) = state.forced_health {
                snapshot.health_status = Some(HealthStatus {
                    code,
                    message: "forced".to_string(),
                });
            }
            snapshot
        };
        tokio::task::yield_now().await;
        Ok(snapshot)
    }

    async fn apply_instance(
        &self,
        _org_id: &str,
        instance: &Instance,
        _prune_resource_types: &[String],
    ) -> Result<(), RpcError> {
        self.enter("apply_instance")?;
        tokio::task::yield_now().await;
        let mut state = self.lock();
        let slow_health = state.slow_health;
        let Some(stored) = state.instances.get_mut(&instance.id) else {
            return Err(RpcError::not_found(format!("instance {} not found", instance.id)));
        };
        *stored = instance.clone();
        if slow_health {
            stored.health_status = progressing();
        }
        Ok(())
    }

    async fn export_instance(&self, _org_id: &str, instance_id: &str) -> Result<Value, RpcError> {
        self.enter("export_instance")?;
        let state = self.lock();
        let instance = state
            .instances
            .get(instance_id)
            .ok_or_else(|| RpcError::not_found(format!("instance {instance_id} not found")))?;
        Ok(json!({ "argocd": instance }))
    }

    async fn apply_agents(
        &self,
        _org_id: &str,
        instance_id: &str,
        _workspace_id: &str,
        agents: Vec<Value>,
    ) -> Result<(), RpcError> {
        self.enter("apply_agents")?;
        let parsed = agents
            .iter()
            .map(agent_from_document)
            .collect::<Result<Vec<_>, _>>()?;
        tokio::task::yield_now().await;

        let mut state = self.lock();
        for mut agent in parsed {
            let existing = state
                .agents
                .get(instance_id)
                .and_then(|list| list.iter().position(|a| a.name == agent.name));
            match existing {
                Some(idx) => {
                    if let Some(list) = state.agents.get_mut(instance_id) {
                        agent.id = list[idx].id.clone();
                        list[idx] = agent;
                    }
                }
                None => {
                    state.next_agent += 1;
                    agent.id = format!("agent-{}", state.next_agent);
                    state
                        .agents
                        .entry(instance_id.to_string())
                        .or_default()
                        .push(agent);
                }
            }
        }
        Ok(())
    }

    async fn get_agent(
        &self,
        _org_id: &str,
        instance_id: &str,
        agent_id: &str,
    ) -> Result<KargoAgent, RpcError> {
        self.enter("get_agent")?;
        let mut state = self.lock();
        if let Some(polls) = state.agent_tombstones.get_mut(agent_id) {
            if *polls > 0 {
                *polls -= 1;
                return Ok(KargoAgent {
                    id: agent_id.to_string(),
                    ..Default::default()
                });
            }
        }
        state
            .agents
            .get(instance_id)
            .and_then(|list| list.iter().find(|a| a.id == agent_id))
            .cloned()
            .ok_or_else(|| RpcError::not_found(format!("agent {agent_id} not found")))
    }

    async fn list_agents(
        &self,
        _org_id: &str,
        instance_id: &str,
    ) -> Result<Vec<KargoAgent>, RpcError> {
        self.enter("list_agents")?;
        Ok(self.agents(instance_id))
    }

    async fn delete_agent(
        &self,
        _org_id: &str,
        instance_id: &str,
        agent_id: &str,
    ) -> Result<(), RpcError> {
        self.enter("delete_agent")?;
        let mut state = self.lock();
        let list = state.agents.entry(instance_id.to_string()).or_default();
        let before = list.len();
        list.retain(|a| a.id != agent_id);
        if list.len() == before {
            return Err(RpcError::not_found(format!("agent {agent_id} not found")));
        }
        Ok(())
    }

    async fn get_agent_manifests(
        &self,
        org_id: &str,
        instance_id: &str,
        agent_id: &str,
    ) -> Result<ManifestStream, RpcError> {
        self.enter("get_agent_manifests")?;
        let visible = self.lock().agents.get(instance_id).is_some_and(|list| {
            list.iter().any(|a| a.id == agent_id)
        });
        if !visible {
            return Err(RpcError::not_found(format!(
                "agent {agent_id} not found in {org_id}/{instance_id}"
            )));
        }
        let chunks: Vec<Result<Bytes, RpcError>> = AGENT_MANIFESTS
            .iter()
            .map(|chunk| Ok(Bytes::from_static(chunk.as_bytes())))
            .collect();
        Ok(stream::iter(chunks).boxed())
    }
}

/// Manifest applier that records calls and cannot reach [`UNREACHABLE_HOST`]
#[derive(Clone, Default)]
pub struct FakeApplier {
    applied: Arc<Mutex<Vec<String>>>,
    deleted: Arc<Mutex<Vec<String>>>,
}

impl FakeApplier {
    pub fn applied(&self) -> Vec<String> {
        self.applied.lock().unwrap().clone()
    }

    pub fn deleted(&self) -> Vec<String> {
        self.deleted.lock().unwrap().clone()
    }
}

fn reach(kubeconfig: &Kubeconfig, operation: &str) -> Result<(), Error> {
    match kubeconfig.host.as_deref() {
        Some(UNREACHABLE_HOST) => Err(Error::manifest(
            operation,
            "error trying to connect: dns error: failed to lookup address information",
        )),
        Some(_) => Ok(()),
        None => Err(Error::validation_for_field("kubeconfig", "host", "host is required")),
    }
}

#[async_trait]
impl ManifestApplier for FakeApplier {
    async fn apply(
        &self,
        ctx: &CallContext,
        kubeconfig: &Kubeconfig,
        manifests: &str,
        options: &ApplyOptions,
    ) -> Result<ApplyReport, Error> {
        ctx.check("apply manifests")?;
        reach(kubeconfig, "apply")?;
        self.applied.lock().unwrap().push(manifests.to_string());
        Ok(ApplyReport {
            applied: vec![
                "Namespace akuity".to_string(),
                "ServiceAccount akuity/kargo-agent".to_string(),
            ],
            skipped: vec![],
            dry_run: options.dry_run != akp_kube::DryRun::None,
        })
    }

    async fn delete(
        &self,
        ctx: &CallContext,
        kubeconfig: &Kubeconfig,
        manifests: &str,
        _options: &DeleteOptions,
    ) -> Result<(), Error> {
        ctx.check("delete manifests")?;
        reach(kubeconfig, "delete")?;
        self.deleted.lock().unwrap().push(manifests.to_string());
        Ok(())
    }
}

/// Kubeconfig the fake applier accepts
pub fn reachable_kubeconfig() -> Kubeconfig {
    Kubeconfig {
        host: Some("https://10.0.0.1:6443".to_string()),
        token: Some("token".to_string()),
        ..Default::default()
    }
}

/// Kubeconfig pointing at a host that does not resolve
pub fn unreachable_kubeconfig() -> Kubeconfig {
    Kubeconfig {
        host: Some(UNREACHABLE_HOST.to_string()),
        insecure: true,
        token: Some("x".to_string()),
        ..Default::default()
    }
}

/// Size used by agent stories
pub const AGENT_SIZE: AgentSize = AgentSize::Small;
