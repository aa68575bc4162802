//! Lifecycle facades against an eventually-consistent in-memory store
//!
//! Waits use paused tokio time, so visibility lag costs no wall-clock time.

use converge_common::ResourceKind;
use converge_core::allocator::AllocateOptions;
use converge_core::cloud::{ResourceRef, ResourceSpec};
use converge_core::error::{CloudError, ConvergeError};
use converge_core::lifecycle::{
    RegionAccessRequest, create_region_access, create_sync, create_unique, delete_sync, key_material_path,
};
use converge_core::wait::PollConfig;
use converge_test_utils::FakeResourceApi;
use std::collections::BTreeMap;
use std::time::Duration;

fn names(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

fn seeded(seed: u64) -> AllocateOptions {
    AllocateOptions {
        seed: Some(seed),
        ..Default::default()
    }
}

fn poll() -> PollConfig {
    PollConfig::new(Duration::from_secs(1), Duration::from_secs(30))
}

#[tokio::test(start_paused = true)]
async fn create_sync_waits_out_visibility_lag() {
    let api = FakeResourceApi::new().with_visibility_lag(3);

    let created = create_sync(&api, &ResourceSpec::new(ResourceKind::Role, "worker"), &poll())
        .await
        .unwrap();

    assert_eq!(created.name, "worker");
    // Precondition check, three lagged lookups, then the visible one
    assert_eq!(api.exists_calls(), 5);
}

#[tokio::test(start_paused = true)]
async fn create_sync_rejects_visible_name() {
    let api = FakeResourceApi::new().with_existing(ResourceKind::Role, "worker");

    let err = create_sync(&api, &ResourceSpec::new(ResourceKind::Role, "worker"), &poll())
        .await
        .unwrap_err();

    assert!(matches!(err, ConvergeError::AlreadyExists { kind: ResourceKind::Role, .. }));
    assert!(api.create_attempts().is_empty());
}

#[tokio::test(start_paused = true)]
async fn delete_sync_waits_until_gone() {
    let api = FakeResourceApi::new()
        .with_existing(ResourceKind::Queue, "jobs")
        .with_visibility_lag(2);

    delete_sync(&api, &ResourceRef::named(ResourceKind::Queue, "jobs"), &poll())
        .await
        .unwrap();

    assert!(!api.is_visible(ResourceKind::Queue, "jobs"));
    assert_eq!(api.deleted(), names(&["jobs"]));
    assert_eq!(api.exists_calls(), 4);
}

#[tokio::test(start_paused = true)]
async fn delete_sync_of_missing_resource_fails() {
    let api = FakeResourceApi::new();

    let err = delete_sync(&api, &ResourceRef::named(ResourceKind::KeyPair, "kp_gone"), &poll())
        .await
        .unwrap_err();

    assert!(matches!(err, ConvergeError::DoesNotExist { .. }));
}

#[tokio::test(start_paused = true)]
async fn unnamed_kinds_are_rejected() {
    let api = FakeResourceApi::new();

    let err = create_sync(&api, &ResourceSpec::new(ResourceKind::Instance, "i-1"), &poll())
        .await
        .unwrap_err();

    assert!(matches!(err, ConvergeError::Validation(_)));
    assert_eq!(api.exists_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn unique_queue_skips_names_an_idempotent_create_would_reuse() {
    let api = FakeResourceApi::new()
        .with_existing(ResourceKind::Queue, "q_1001")
        .with_existing(ResourceKind::Queue, "q_1002")
        .with_existing(ResourceKind::Queue, "q_1003")
        .with_idempotent_create();

    let allocated = create_unique(&api, ResourceKind::Queue, "q_", &BTreeMap::new(), &seeded(1001))
        .await
        .unwrap();

    assert_eq!(allocated.name, "q_1004");
    assert_eq!(allocated.attempts, 4);
    // Taken names never reach create
    assert_eq!(api.create_attempts(), names(&["q_1004"]));
    assert_eq!(
        api.exists_checked()[..4],
        names(&["q_1001", "q_1002", "q_1003", "q_1004"])[..]
    );
}

#[tokio::test(start_paused = true)]
async fn unique_key_pair_relies_on_conflict_codes() {
    let api = FakeResourceApi::new()
        .with_existing(ResourceKind::KeyPair, "kp_7")
        .with_visibility_lag(1);

    let allocated = create_unique(&api, ResourceKind::KeyPair, "kp_", &BTreeMap::new(), &seeded(7))
        .await
        .unwrap();

    assert_eq!(allocated.name, "kp_8");
    assert_eq!(api.create_attempts(), names(&["kp_7", "kp_8"]));
    assert!(allocated.handle.material.is_some());
    // Only the sync wait looked the name up
    assert_eq!(api.exists_checked(), names(&["kp_8", "kp_8"]));
}

#[tokio::test(start_paused = true)]
async fn unique_allocation_exhausts_on_taken_names() {
    let api = FakeResourceApi::new()
        .with_existing(ResourceKind::SecurityGroup, "sg_1")
        .with_existing(ResourceKind::SecurityGroup, "sg_2");
    let options = AllocateOptions {
        max_attempts: 2,
        ..seeded(1)
    };

    let err = create_unique(&api, ResourceKind::SecurityGroup, "sg_", &BTreeMap::new(), &options)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        ConvergeError::AllocationExhausted { ref last_name, attempts: 2 } if last_name == "sg_2"
    ));
}

#[tokio::test(start_paused = true)]
async fn region_access_creates_key_pair_and_ssh_group() {
    let dir = tempfile::tempdir().unwrap();
    let api = FakeResourceApi::new().with_existing(ResourceKind::KeyPair, "kp_spot_500");
    let request = RegionAccessRequest {
        key_dir: Some(dir.path().to_path_buf()),
        vpc_id: Some("vpc-0abc".to_string()),
        ..Default::default()
    };

    let access = create_region_access(&api, &request, &seeded(500)).await.unwrap();

    assert_eq!(access.key_pair.name, "kp_spot_501");
    assert_eq!(access.security_group.name, "sg_spot_500");
    assert!(api.is_visible(ResourceKind::SecurityGroup, "sg_spot_500"));
    let key_path = access.key_path.unwrap();
    assert_eq!(key_path, key_material_path(dir.path(), "kp_spot_501"));
    assert!(std::fs::read_to_string(key_path).unwrap().contains("kp_spot_501"));
}

#[tokio::test(start_paused = true)]
async fn region_access_rolls_back_key_pair_when_group_fails() {
    let dir = tempfile::tempdir().unwrap();
    let api = FakeResourceApi::new().with_create_failure(
        ResourceKind::SecurityGroup,
        CloudError::new("UnauthorizedOperation", "not allowed to create groups"),
    );
    let request = RegionAccessRequest {
        key_dir: Some(dir.path().to_path_buf()),
        ..Default::default()
    };

    let err = create_region_access(&api, &request, &seeded(900)).await.unwrap_err();

    assert!(matches!(err, ConvergeError::Api { .. }));
    assert_eq!(api.deleted(), names(&["kp_spot_900"]));
    assert!(!api.is_visible(ResourceKind::KeyPair, "kp_spot_900"));
    assert!(!key_material_path(dir.path(), "kp_spot_900").exists());
}
