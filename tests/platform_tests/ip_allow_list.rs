//! Stories about several resources sharing one instance's IP allow list
//!
//! Each resource owns a disjoint subset of the list. Entries nobody owns
//! (added in the UI, or by the legacy instance resource) must survive every
//! operation, and so must every other instance setting.

use std::collections::HashSet;
use std::sync::Arc;

use akp::{IpAllowList, IpAllowListController, Outcome};
use akp_common::{CallContext, Error, KeyedMutex, RpcCode, RpcError};
use akp_gateway::{HealthStatusCode, IpAllowListEntry};

use super::fake::{fast_wait, FakePlatform, INSTANCE_ID};

// =============================================================================
// Test Fixtures
// =============================================================================

fn controller(platform: &FakePlatform) -> IpAllowListController {
    IpAllowListController::new(platform.context())
        .with_locks(Arc::new(KeyedMutex::new()))
        .with_health_wait(fast_wait())
}

fn declared(entries: Vec<IpAllowListEntry>) -> IpAllowList {
    IpAllowList::new(INSTANCE_ID, entries)
}

fn foreign() -> IpAllowListEntry {
    IpAllowListEntry::new("203.0.113.7/32", "Added in the UI")
}

fn state_of(outcome: Outcome<IpAllowList>) -> IpAllowList {
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
// Lifecycle
// =============================================================================

/// Story: an office network is allowed, extended with the internal range,
/// relabelled, trimmed back and finally removed, while an entry someone added
/// in the UI stays untouched throughout
#[tokio::test(start_paused = true)]
async fn add_modify_and_remove_entries() {
    let platform = FakePlatform::new();
    platform.seed_instance(INSTANCE_ID, vec![foreign()]);
    let controller = controller(&platform);

    let state = state_of(
        controller
            .create(
                &ctx(),
                &declared(vec![IpAllowListEntry::new("192.168.1.0/24", "Office")]),
            )
            .await,
    );
    assert_eq!(state.entries.len(), 1);
    assert_eq!(platform.ips(INSTANCE_ID), ["203.0.113.7/32", "192.168.1.0/24"]);

    let plan = declared(vec![
        IpAllowListEntry::new("192.168.1.0/24", "Office"),
        IpAllowListEntry::new("10.0.0.0/8", "Internal"),
    ]);
    let state = state_of(controller.update(&ctx(), &state, &plan).await);
    assert_eq!(state.entries.len(), 2);

    let plan = declared(vec![
        IpAllowListEntry::new("192.168.1.0/24", "Head office"),
        IpAllowListEntry::new("10.0.0.0/8", "Internal network"),
    ]);
    let state = state_of(controller.update(&ctx(), &state, &plan).await);
    let read = state_of(controller.read(&ctx(), &state).await);
    let descriptions: Vec<_> = read
        .entries
        .iter()
        .map(|e| e.description.as_deref().unwrap_or_default())
        .collect();
    assert_eq!(descriptions, ["Head office", "Internal network"]);

    let plan = declared(vec![IpAllowListEntry::new("192.168.1.0/24", "Head office")]);
    let state = state_of(controller.update(&ctx(), &state, &plan).await);
    assert_eq!(state.entries.len(), 1);
    assert_eq!(platform.ips(INSTANCE_ID), ["203.0.113.7/32", "192.168.1.0/24"]);

    let outcome = controller.delete(&ctx(), &state).await;
    assert!(outcome.into_result().unwrap().is_none());
    assert_eq!(platform.ips(INSTANCE_ID), ["203.0.113.7/32"]);
}

/// Story: the platform stores more instance settings than akp models; an IP
/// allow-list write must send every one of them back unchanged
#[tokio::test(start_paused = true)]
async fn other_instance_fields_survive_writes() {
    let platform = FakePlatform::new();
    let before = platform.instance(INSTANCE_ID);
    let controller = controller(&platform);

    let state = state_of(
        controller
            .create(&ctx(), &declared(vec![IpAllowListEntry::bare("10.1.0.0/16")]))
            .await,
    );
    let after_create = platform.instance(INSTANCE_ID);
    assert_eq!(after_create.description, before.description);
    assert_eq!(after_create.version, before.version);
    assert_eq!(after_create.extra, before.extra);
    assert_eq!(after_create.spec.extra, before.spec.extra);
    assert!(after_create.spec.extra["metricsIngressUsername"].is_null());

    controller.delete(&ctx(), &state).await.into_result().unwrap();
    let after_delete = platform.instance(INSTANCE_ID);
    assert_eq!(after_delete.spec, before.spec);
    assert_eq!(after_delete.description, before.description);
}

/// Story: an IPv6 range is stored and read back byte for byte
#[tokio::test(start_paused = true)]
async fn ipv6_entries_round_trip() {
    let platform = FakePlatform::new();
    let controller = controller(&platform);

    let state = state_of(
        controller
            .create(
                &ctx(),
                &declared(vec![IpAllowListEntry::new("2001:db8::/32", "IPv6 network")]),
            )
            .await,
    );
    let read = state_of(controller.read(&ctx(), &state).await);
    assert_eq!(read.entries[0].ip, "2001:db8::/32");
    assert_eq!(read.entries[0].description.as_deref(), Some("IPv6 network"));
    assert_eq!(platform.ips(INSTANCE_ID), ["2001:db8::/32"]);
}

// =============================================================================
// Ownership
// =============================================================================

/// Story: listing the same network twice in one resource is rejected before
/// anything is written
#[tokio::test]
async fn duplicate_within_resource_is_rejected() {
    let platform = FakePlatform::new();
    let outcome = controller(&platform)
        .create(
            &ctx(),
            &declared(vec![
                IpAllowListEntry::bare("198.51.100.0/24"),
                IpAllowListEntry::bare("198.51.100.0/24"),
            ]),
        )
        .await;

    assert!(outcome.state.is_none());
    let err = outcome.into_result().unwrap_err();
    assert!(matches!(err, Error::DuplicateInResource { .. }));
    assert!(err.to_string().contains("appears multiple times"));
    assert_eq!(platform.calls("apply_instance"), 0);
    assert!(platform.ips(INSTANCE_ID).is_empty());
}

/// Story: a second team tries to claim a network another resource already
/// owns on the same instance
#[tokio::test(start_paused = true)]
async fn duplicate_across_resources_is_rejected() {
    let platform = FakePlatform::new();
    let controller = controller(&platform);

    let shared = IpAllowListEntry::new("198.51.100.0/24", "Partner");
    state_of(controller.create(&ctx(), &declared(vec![shared.clone()])).await);

    let outcome = controller
        .create(
            &ctx(),
            &declared(vec![IpAllowListEntry::bare("10.9.0.0/16"), shared]),
        )
        .await;
    let err = outcome.into_result().unwrap_err();
    assert!(matches!(err, Error::AlreadyExists { .. }));
    assert!(err.to_string().contains("already exists"));
    assert_eq!(platform.ips(INSTANCE_ID), ["198.51.100.0/24"]);
}

/// Story: two resources with disjoint networks coexist, and deleting one
/// leaves the other and every foreign entry in place
#[tokio::test(start_paused = true)]
async fn delete_removes_only_owned_entries() {
    let platform = FakePlatform::new();
    platform.seed_instance(INSTANCE_ID, vec![foreign()]);
    let controller = controller(&platform);

    let office = state_of(
        controller
            .create(&ctx(), &declared(vec![IpAllowListEntry::new("192.168.1.0/24", "Office")]))
            .await,
    );
    let vpn = state_of(
        controller
            .create(
                &ctx(),
                &declared(vec![
                    IpAllowListEntry::new("10.8.0.0/16", "VPN"),
                    IpAllowListEntry::new("10.9.0.0/16", "VPN fallback"),
                ]),
            )
            .await,
    );
    assert_ne!(office.id, vpn.id);

    controller.delete(&ctx(), &vpn).await.into_result().unwrap();
    assert_eq!(platform.ips(INSTANCE_ID), ["203.0.113.7/32", "192.168.1.0/24"]);

    // Owned entries already gone: nothing to write
    let applies = platform.calls("apply_instance");
    controller.delete(&ctx(), &vpn).await.into_result().unwrap();
    assert_eq!(platform.calls("apply_instance"), applies);
}

/// Story: an update may take over a network the resource releases in the
/// same step, but not one owned elsewhere
#[tokio::test(start_paused = true)]
async fn update_checks_conflicts_against_other_owners() {
    let platform = FakePlatform::new();
    platform.seed_instance(INSTANCE_ID, vec![foreign()]);
    let controller = controller(&platform);

    let state = state_of(
        controller
            .create(&ctx(), &declared(vec![IpAllowListEntry::bare("192.168.1.0/24")]))
            .await,
    );

    let outcome = controller
        .update(
            &ctx(),
            &state,
            &declared(vec![
                IpAllowListEntry::bare("192.168.1.0/24"),
                IpAllowListEntry::bare("203.0.113.7/32"),
            ]),
        )
        .await;
    assert_eq!(outcome.state.as_ref(), Some(&state));
    assert!(matches!(outcome.error(), Some(Error::AlreadyExists { .. })));
    assert_eq!(platform.ips(INSTANCE_ID), ["203.0.113.7/32", "192.168.1.0/24"]);
}

// =============================================================================
// Drift and import
// =============================================================================

/// Story: reads are stable, and an owned network removed in the UI shrinks
/// the resource with a warning instead of failing
#[tokio::test(start_paused = true)]
async fn read_is_idempotent_and_only_shrinks() {
    let platform = FakePlatform::new();
    let controller = controller(&platform);

    let state = state_of(
        controller
            .create(
                &ctx(),
                &declared(vec![
                    IpAllowListEntry::new("192.168.1.0/24", "Office"),
                    IpAllowListEntry::new("10.0.0.0/8", "Internal"),
                ]),
            )
            .await,
    );

    let first = state_of(controller.read(&ctx(), &state).await);
    let second = state_of(controller.read(&ctx(), &first).await);
    assert_eq!(first, second);
    assert_eq!(first, state);

    platform.edit_entries(
        INSTANCE_ID,
        vec![IpAllowListEntry::new("192.168.1.0/24", "Office"), foreign()],
    );
    let outcome = controller.read(&ctx(), &second).await;
    assert!(!outcome.is_err());
    assert_eq!(outcome.diagnostics.warnings().count(), 1);
    let shrunk = state_of(outcome);
    assert_eq!(shrunk.id, state.id);
    assert_eq!(shrunk.entries, vec![IpAllowListEntry::new("192.168.1.0/24", "Office")]);
}

/// Story: adopting a hand-managed list imports every entry under a new id
#[tokio::test]
async fn import_adopts_all_entries() {
    let platform = FakePlatform::new();
    platform.seed_instance(
        INSTANCE_ID,
        vec![
            IpAllowListEntry::new("192.0.2.0/24", "A"),
            IpAllowListEntry::new("198.51.100.0/24", "B"),
            IpAllowListEntry::bare("203.0.113.0/24"),
        ],
    );
    let controller = controller(&platform);

    let first = state_of(controller.import(&ctx(), INSTANCE_ID).await);
    assert_eq!(first.entries.len(), 3);
    assert_eq!(first.instance_id, INSTANCE_ID);
    assert!(uuid::Uuid::parse_str(&first.id).is_ok());

    let second = state_of(controller.import(&ctx(), INSTANCE_ID).await);
    assert_ne!(first.id, second.id);
    assert_eq!(platform.calls("apply_instance"), 0);
}

// =============================================================================
// Platform behaviour
// =============================================================================

/// Story: the platform briefly refuses connections; the write is retried and
/// lands exactly once
#[tokio::test(start_paused = true)]
async fn transient_failures_are_retried() {
    let platform = FakePlatform::new();
    platform.fail_next("get_instance", RpcError::unavailable("connection refused"));
    platform.fail_next(
        "apply_instance",
        RpcError::new(RpcCode::Unknown, "read tcp 10.0.0.2:443: connection reset by peer"),
    );

    let state = state_of(
        controller(&platform)
            .create(&ctx(), &declared(vec![IpAllowListEntry::bare("10.1.0.0/16")]))
            .await,
    );
    assert_eq!(state.entries.len(), 1);
    assert_eq!(platform.calls("apply_instance"), 2);
    assert_eq!(platform.ips(INSTANCE_ID), ["10.1.0.0/16"]);
}

/// Story: a permanent platform error is surfaced at once and nothing is
/// committed
#[tokio::test]
async fn permanent_failures_are_not_retried() {
    let platform = FakePlatform::new();
    platform.fail_next(
        "apply_instance",
        RpcError::new(RpcCode::PermissionDenied, "api key lacks instance write"),
    );

    let outcome = controller(&platform)
        .create(&ctx(), &declared(vec![IpAllowListEntry::bare("10.1.0.0/16")]))
        .await;
    assert!(outcome.state.is_none());
    assert_eq!(
        outcome.error().and_then(Error::rpc_code),
        Some(RpcCode::PermissionDenied)
    );
    assert_eq!(platform.calls("apply_instance"), 1);
}

/// Story: the instance takes a moment to become healthy after a write; create
/// waits for it
#[tokio::test(start_paused = true)]
async fn create_waits_for_instance_health() {
    let platform = FakePlatform::new();
    platform.set_slow_health(true);

    let outcome = controller(&platform)
        .create(&ctx(), &declared(vec![IpAllowListEntry::bare("10.1.0.0/16")]))
        .await;
    assert!(!outcome.is_err());
    // One lock-held read, then at least two health polls
    assert!(platform.calls("get_instance") >= 3);
}

/// Story: the instance never recovers; the entries stay committed but the
/// resource is tainted for replacement
#[tokio::test(start_paused = true)]
async fn health_timeout_commits_tainted_state() {
    let platform = FakePlatform::new();
    platform.force_health(HealthStatusCode::Degraded);

    let outcome = controller(&platform)
        .create(&ctx(), &declared(vec![IpAllowListEntry::bare("10.1.0.0/16")]))
        .await;
    assert!(outcome.tainted);
    assert!(matches!(outcome.error(), Some(Error::Timeout { .. })));
    let state = outcome.state.clone().unwrap();
    assert!(!state.id.is_empty());
    assert_eq!(platform.ips(INSTANCE_ID), ["10.1.0.0/16"]);
}

// =============================================================================
// Concurrency
// =============================================================================

/// Story: many resources target one instance at the same time; per-instance
/// locking keeps every write, so no entry is lost
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_creates_keep_every_entry() {
    let platform = FakePlatform::new();
    platform.seed_instance(INSTANCE_ID, vec![foreign()]);
    let controller = controller(&platform);

    let tasks: Vec<_> = (0..12)
        .map(|i| {
            let controller = controller.clone();
            tokio::spawn(async move {
                let plan = declared(vec![IpAllowListEntry::new(
                    format!("10.{i}.0.0/16"),
                    format!("team {i}"),
                )]);
                controller.create(&CallContext::new(), &plan).await.into_result()
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let ips: HashSet<String> = platform.ips(INSTANCE_ID).into_iter().collect();
    assert_eq!(ips.len(), 13);
    assert!(ips.contains("203.0.113.7/32"));
    for i in 0..12 {
        assert!(ips.contains(&format!("10.{i}.0.0/16")));
    }
}
