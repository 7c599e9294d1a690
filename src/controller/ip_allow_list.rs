//! IP allow-list controller
//!
//! Several resources may each own a disjoint subset of one instance's IP
//! allow list. Entries on the instance that no resource owns are left alone.
//! Every write is a read-modify-write of the whole instance under the
//! instance's keyed lock; the health wait afterwards runs without the lock.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use akp_common::{wait_for_status, CallContext, DiagContext, Error, KeyedMutex, WaitConfig};
use akp_gateway::{HealthStatusCode, Instance, IpAllowListEntry};

use super::Context;
use crate::resource::{Outcome, PlanAction};

/// Fields whose change forces a replace
pub const IP_ALLOW_LIST_REPLACE_FIELDS: &[&str] = &["instance_id"];

const ENTITY: &str = "ip_allow_list";

/// State of one IP allow-list resource
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpAllowList {
    /// Resource id (UUID), empty before create
    #[serde(default)]
    pub id: String,
    /// Argo CD instance holding the list
    pub instance_id: String,
    /// Entries owned by this resource
    #[serde(default)]
    pub entries: Vec<IpAllowListEntry>,
}

impl IpAllowList {
    /// Declared resource without an id
    pub fn new(instance_id: impl Into<String>, entries: Vec<IpAllowListEntry>) -> Self {
        Self {
            id: String::new(),
            instance_id: instance_id.into(),
            entries,
        }
    }

    fn ips(&self) -> HashSet<&str> {
        self.entries.iter().map(|e| e.ip.as_str()).collect()
    }

    fn normalized_entries(&self) -> Vec<IpAllowListEntry> {
        self.entries.iter().cloned().map(IpAllowListEntry::normalized).collect()
    }

    fn diag(&self, operation: &str) -> DiagContext {
        let entity = if self.id.is_empty() {
            ENTITY.to_string()
        } else {
            format!("{ENTITY} {}", self.id)
        };
        DiagContext::new(operation, entity).with_instance(&self.instance_id)
    }
}

fn validate(resource: &IpAllowList) -> Result<(), Error> {
    if resource.instance_id.is_empty() {
        return Err(Error::validation_for_field(
            ENTITY,
            "instance_id",
            "instance_id is required",
        ));
    }
    if resource.entries.is_empty() {
        return Err(Error::validation_for_field(
            ENTITY,
            "entries",
            "at least one entry is required",
        ));
    }

    let mut seen = HashSet::new();
    for (i, entry) in resource.entries.iter().enumerate() {
        if entry.ip.is_empty() {
            return Err(Error::validation_for_field(
                ENTITY,
                format!("entries[{i}].ip"),
                "ip must not be empty",
            ));
        }
        if !seen.insert(entry.ip.as_str()) {
            return Err(Error::DuplicateInResource {
                ip: entry.ip.clone(),
            });
        }
    }
    Ok(())
}

/// Reject any of `requested` already present in `existing`
fn check_conflicts<'a>(
    requested: impl IntoIterator<Item = &'a IpAllowListEntry>,
    existing: &HashSet<&str>,
    instance_id: &str,
) -> Result<(), Error> {
    for entry in requested {
        if existing.contains(entry.ip.as_str()) {
            return Err(Error::AlreadyExists {
                ip: entry.ip.clone(),
                instance_id: instance_id.to_string(),
            });
        }
    }
    Ok(())
}

/// New instance list for an update from `state` to `plan`.
///
/// Entries removed from the plan are dropped, entries kept by the plan take
/// the plan's version, foreign entries stay as they are. Added entries (and
/// kept entries that vanished from the instance) are appended.
fn merge_update(
    current: &[IpAllowListEntry],
    state: &IpAllowList,
    plan: &IpAllowList,
) -> Vec<IpAllowListEntry> {
    let state_ips = state.ips();
    let planned: HashMap<&str, &IpAllowListEntry> =
        plan.entries.iter().map(|e| (e.ip.as_str(), e)).collect();

    let mut merged = Vec::with_capacity(current.len() + plan.entries.len());
    let mut emitted = HashSet::new();
    for entry in current {
        let ip = entry.ip.as_str();
        match planned.get(ip) {
            Some(planned) if state_ips.contains(ip) => {
                merged.push((*planned).clone().normalized());
                emitted.insert(ip);
            }
            // Owned before, not planned any more
            None if state_ips.contains(ip) => {}
            _ => merged.push(entry.clone()),
        }
    }
    for entry in &plan.entries {
        if !emitted.contains(entry.ip.as_str()) {
            merged.push(entry.clone().normalized());
        }
    }
    merged
}

/// Controller for resources that own part of an instance's IP allow list
#[derive(Clone, Debug)]
pub struct IpAllowListController {
    context: Context,
    locks: Arc<KeyedMutex>,
    health_wait: WaitConfig,
}

impl IpAllowListController {
    /// Controller using the process-wide lock registry
    pub fn new(context: Context) -> Self {
        Self {
            context,
            locks: KeyedMutex::global(),
            health_wait: WaitConfig::default(),
        }
    }

    /// Use a dedicated lock registry
    pub fn with_locks(mut self, locks: Arc<KeyedMutex>) -> Self {
        self.locks = locks;
        self
    }

    /// Override health wait timing
    pub fn with_health_wait(mut self, wait: WaitConfig) -> Self {
        self.health_wait = wait;
        self
    }

    /// What applying `desired` over `state` would do
    pub fn plan(state: Option<&IpAllowList>, desired: &IpAllowList) -> PlanAction {
        let Some(state) = state else {
            return PlanAction::Create;
        };
        let mut replace = Vec::new();
        if state.instance_id != desired.instance_id {
            replace.push(IP_ALLOW_LIST_REPLACE_FIELDS[0]);
        }
        let changed = state.normalized_entries() != desired.normalized_entries();
        PlanAction::from_changes(replace, changed)
    }

    /// Add the declared entries to the instance under a fresh resource id
    pub async fn create(&self, ctx: &CallContext, plan: &IpAllowList) -> Outcome<IpAllowList> {
        let diag = plan.diag("create");
        const SUMMARY: &str = "Unable to create IP allow list";

        if let Err(e) = validate(plan) {
            return Outcome::failed(&diag, SUMMARY, e);
        }

        let instance = {
            let _guard = self.locks.lock(&plan.instance_id).await;
            let mut instance = match self.context.get_instance(ctx, &plan.instance_id).await {
                Ok(instance) => instance,
                Err(e) => return Outcome::failed(&diag, SUMMARY, e),
            };

            let existing: HashSet<&str> = instance.spec.ips().collect();
            if let Err(e) = check_conflicts(&plan.entries, &existing, &plan.instance_id) {
                return Outcome::failed(&diag, SUMMARY, e);
            }

            instance
                .spec
                .ip_allow_list
                .extend(plan.normalized_entries());
            info!(
                instance_id = %plan.instance_id,
                added = plan.entries.len(),
                "Adding IP allow list entries"
            );
            if let Err(e) = self.context.apply_instance(ctx, &instance).await {
                return Outcome::failed(&diag, SUMMARY, e);
            }
            instance
        };

        let state = IpAllowList {
            id: Uuid::new_v4().to_string(),
            instance_id: plan.instance_id.clone(),
            entries: plan.entries.clone(),
        };
        let diag = state.diag("create");
        match self.wait_healthy(ctx, &instance).await {
            Ok(()) => Outcome::ok(state),
            // Entries are on the instance; commit them so a retry replaces
            Err(e) => Outcome::partial(state, &diag, SUMMARY, e).taint(),
        }
    }

    /// Refresh owned entries from the instance.
    ///
    /// Entries keep state order and take the server's descriptions. Owned ips
    /// removed outside of akp are dropped with a warning. A missing instance
    /// removes the resource.
    pub async fn read(&self, ctx: &CallContext, state: &IpAllowList) -> Outcome<IpAllowList> {
        let diag = state.diag("read");

        let instance = match self.context.get_instance(ctx, &state.instance_id).await {
            Ok(instance) => instance,
            Err(e) if e.is_not_found() => {
                let mut outcome = Outcome::removed();
                outcome.warn(
                    &diag,
                    "Instance not found, removing IP allow list from state",
                    e.to_string(),
                );
                return outcome;
            }
            Err(e) => return Outcome::failed(&diag, "Unable to read IP allow list", e),
        };

        let (entries, missing) = observe(&instance, state);
        let refreshed = IpAllowList {
            id: state.id.clone(),
            instance_id: state.instance_id.clone(),
            entries,
        };
        let mut outcome = Outcome::ok(refreshed);
        if !missing.is_empty() {
            warn!(
                instance_id = %state.instance_id,
                missing = ?missing,
                "Owned IP allow list entries were removed outside of akp"
            );
            outcome.warn(
                &diag,
                "IP allow list entries removed outside of akp",
                format!("no longer on the instance: {}", missing.join(", ")),
            );
        }
        outcome
    }

    /// Move the owned subset from `state` to `plan`
    pub async fn update(
        &self,
        ctx: &CallContext,
        state: &IpAllowList,
        plan: &IpAllowList,
    ) -> Outcome<IpAllowList> {
        let diag = state.diag("update");
        const SUMMARY: &str = "Unable to update IP allow list";

        if let PlanAction::Replace { fields } = Self::plan(Some(state), plan) {
            let err = Error::validation_for_field(
                ENTITY,
                fields.join(", "),
                "changing this field requires replacing the resource",
            );
            return Outcome::partial(state.clone(), &diag, SUMMARY, err);
        }
        if let Err(e) = validate(plan) {
            return Outcome::partial(state.clone(), &diag, SUMMARY, e);
        }

        let next = IpAllowList {
            id: state.id.clone(),
            instance_id: state.instance_id.clone(),
            entries: plan.entries.clone(),
        };
        if state.normalized_entries() == plan.normalized_entries() {
            debug!(id = %state.id, "IP allow list unchanged");
            return Outcome::ok(next);
        }

        let instance = {
            let _guard = self.locks.lock(&state.instance_id).await;
            let mut instance = match self.context.get_instance(ctx, &state.instance_id).await {
                Ok(instance) => instance,
                Err(e) => return Outcome::partial(state.clone(), &diag, SUMMARY, e),
            };

            let state_ips = state.ips();
            let remaining: HashSet<&str> = instance
                .spec
                .ips()
                .filter(|ip| !state_ips.contains(ip))
                .collect();
            let added = plan
                .entries
                .iter()
                .filter(|e| !state_ips.contains(e.ip.as_str()));
            if let Err(e) = check_conflicts(added, &remaining, &state.instance_id) {
                return Outcome::partial(state.clone(), &diag, SUMMARY, e);
            }

            instance.spec.ip_allow_list = merge_update(&instance.spec.ip_allow_list, state, plan);
            info!(
                instance_id = %state.instance_id,
                id = %state.id,
                entries = plan.entries.len(),
                "Updating IP allow list entries"
            );
            if let Err(e) = self.context.apply_instance(ctx, &instance).await {
                return Outcome::partial(state.clone(), &diag, SUMMARY, e);
            }
            instance
        };

        match self.wait_healthy(ctx, &instance).await {
            Ok(()) => Outcome::ok(next),
            Err(e) => Outcome::partial(next, &diag, SUMMARY, e),
        }
    }

    /// Remove exactly the owned ips and verify they are gone
    pub async fn delete(&self, ctx: &CallContext, state: &IpAllowList) -> Outcome<IpAllowList> {
        let diag = state.diag("delete");
        const SUMMARY: &str = "Unable to delete IP allow list";
        let owned = state.ips();

        let instance = {
            let _guard = self.locks.lock(&state.instance_id).await;
            let mut instance = match self.context.get_instance(ctx, &state.instance_id).await {
                Ok(instance) => instance,
                Err(e) if e.is_not_found() => {
                    debug!(instance_id = %state.instance_id, "Instance gone, nothing to delete");
                    return Outcome::removed();
                }
                Err(e) => return Outcome::partial(state.clone(), &diag, SUMMARY, e),
            };

            let before = instance.spec.ip_allow_list.len();
            instance
                .spec
                .ip_allow_list
                .retain(|e| !owned.contains(e.ip.as_str()));
            if instance.spec.ip_allow_list.len() == before {
                debug!(id = %state.id, "No owned entries on the instance");
                return Outcome::removed();
            }

            info!(
                instance_id = %state.instance_id,
                id = %state.id,
                removed = before - instance.spec.ip_allow_list.len(),
                "Removing IP allow list entries"
            );
            if let Err(e) = self.context.apply_instance(ctx, &instance).await {
                return Outcome::partial(state.clone(), &diag, SUMMARY, e);
            }
            instance
        };

        if let Err(e) = self.wait_healthy(ctx, &instance).await {
            return Outcome::partial(state.clone(), &diag, SUMMARY, e);
        }

        match self.context.get_instance(ctx, &state.instance_id).await {
            Ok(observed) => {
                let remaining: Vec<String> = observed
                    .spec
                    .ips()
                    .filter(|ip| owned.contains(ip))
                    .map(str::to_string)
                    .collect();
                if remaining.is_empty() {
                    Outcome::removed()
                } else {
                    let err = Error::VerificationFailed {
                        instance_id: state.instance_id.clone(),
                        remaining,
                    };
                    Outcome::partial(state.clone(), &diag, SUMMARY, err)
                }
            }
            Err(e) if e.is_not_found() => Outcome::removed(),
            Err(e) => Outcome::partial(state.clone(), &diag, SUMMARY, e),
        }
    }

    /// Adopt every entry currently on the instance under a fresh resource id
    pub async fn import(&self, ctx: &CallContext, instance_id: &str) -> Outcome<IpAllowList> {
        let diag = DiagContext::new("import", ENTITY).with_instance(instance_id);
        const SUMMARY: &str = "Unable to import IP allow list";

        if instance_id.trim().is_empty() {
            let err = Error::validation_for_field(ENTITY, "id", "import id must be an instance id");
            return Outcome::failed(&diag, SUMMARY, err);
        }

        match self.context.get_instance(ctx, instance_id).await {
            Ok(instance) => {
                let state = IpAllowList {
                    id: Uuid::new_v4().to_string(),
                    instance_id: instance_id.to_string(),
                    entries: instance.spec.ip_allow_list,
                };
                info!(
                    instance_id = %instance_id,
                    id = %state.id,
                    entries = state.entries.len(),
                    "Imported IP allow list"
                );
                Outcome::ok(state)
            }
            Err(e) => Outcome::failed(&diag, SUMMARY, e),
        }
    }

    async fn wait_healthy(&self, ctx: &CallContext, instance: &Instance) -> Result<(), Error> {
        let label = format!("instance {} health", instance.name);
        wait_for_status(
            ctx,
            &self.health_wait,
            &label,
            &[HealthStatusCode::Healthy],
            || self.context.gateway.get_instance(&self.context.org_id, &instance.id),
            Instance::health,
        )
        .await
        .map(|_| ())
    }
}

/// Owned entries as the instance reports them, plus owned ips it lost
fn observe(instance: &Instance, state: &IpAllowList) -> (Vec<IpAllowListEntry>, Vec<String>) {
    let observed: HashMap<&str, &IpAllowListEntry> = instance
        .spec
        .ip_allow_list
        .iter()
        .map(|e| (e.ip.as_str(), e))
        .collect();

    let mut entries = Vec::with_capacity(state.entries.len());
    let mut missing = Vec::new();
    for entry in &state.entries {
        match observed.get(entry.ip.as_str()) {
            Some(found) => entries.push((*found).clone().normalized()),
            None => missing.push(entry.ip.clone()),
        }
    }
    (entries, missing)
}
