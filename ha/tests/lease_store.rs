use chrono::Duration;
use ha::{
    lease::LeaseStore,
    record::RecordKeys,
    storage::{InMemoryObjectStore, ObjectStore},
    test_utils::{FakeEngine, TestCluster, TEST_SYS_ID},
    time::ManualClock,
    Error, MemberTopology, Role, TickOutcome,
};
use std::collections::BTreeMap;
use std::sync::Arc;

fn stores(n: usize) -> (Arc<InMemoryObjectStore>, Arc<ManualClock>, Vec<LeaseStore>) {
    let objects = Arc::new(InMemoryObjectStore::new());
    let clock = Arc::new(ManualClock::new());
    let leases = (0..n)
        .map(|_| {
            LeaseStore::new(
                objects.clone(),
                RecordKeys::new("pg", "main"),
                clock.clone(),
                Duration::seconds(10),
            )
        })
        .collect();
    (objects, clock, leases)
}

#[tokio::test]
async fn test_leader_init_seeds_fresh_group() {
    let (_, _, leases) = stores(2);

    let created = leases[0]
        .init(true, "sys-1", BTreeMap::new(), 42, "pod-0", Role::Follower)
        .await
        .unwrap();
    assert!(created.exists());
    assert_eq!(created.record.sys_id, "sys-1");
    assert_eq!(created.record.leader_name(), Some("pod-0"));
    assert_eq!(created.record.leader.as_ref().unwrap().op_time, 42);

    let joined = leases[1]
        .init(false, "sys-1", BTreeMap::new(), 40, "pod-1", Role::Follower)
        .await
        .unwrap();
    assert_eq!(joined.record.leader_name(), Some("pod-0"));
    assert!(joined.record.has_member("pod-0"));
    assert!(joined.record.has_member("pod-1"));
}

#[tokio::test]
async fn test_follower_init_never_overwrites_leader() {
    let (_, _, leases) = stores(2);
    leases[0]
        .init(true, "sys-1", BTreeMap::new(), 0, "pod-0", Role::Follower)
        .await
        .unwrap();

    // A second self-declared leader only registers.
    let second = leases[1]
        .init(true, "sys-1", BTreeMap::new(), 0, "pod-1", Role::Follower)
        .await
        .unwrap();
    assert_eq!(second.record.leader_name(), Some("pod-0"));

    let reread = leases[0].refresh().await.unwrap();
    assert_eq!(reread.record.leader_name(), Some("pod-0"));
    assert_eq!(reread.record.members.len(), 2);
}

#[tokio::test]
async fn test_follower_first_leaves_group_leaderless() {
    let (_, _, leases) = stores(2);
    let created = leases[1]
        .init(false, "sys-1", BTreeMap::new(), 0, "pod-1", Role::Follower)
        .await
        .unwrap();
    assert!(created.exists());
    assert!(created.record.leader.is_none());
    assert_eq!(created.record.sys_id, "sys-1");

    let joined = leases[0]
        .init(true, "sys-1", BTreeMap::new(), 0, "pod-0", Role::Follower)
        .await
        .unwrap();
    assert!(joined.record.leader.is_none());
    assert!(joined.record.has_member("pod-0"));
}

#[tokio::test]
async fn test_sys_id_mismatch_is_fatal() {
    let (_, _, leases) = stores(2);
    leases[0]
        .init(true, "sys-1", BTreeMap::new(), 0, "pod-0", Role::Follower)
        .await
        .unwrap();

    let err = leases[1]
        .init(false, "sys-2", BTreeMap::new(), 0, "pod-1", Role::Follower)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::SysIdMismatch { .. }));
    assert!(err.is_fatal());
}

#[tokio::test]
async fn test_stale_token_conflicts_then_locked() {
    let (_, _, leases) = stores(2);
    leases[0].refresh().await.unwrap();
    leases[1].refresh().await.unwrap();

    leases[0].try_acquire_leader("pod-0").await.unwrap();

    let stale = leases[1].try_acquire_leader("pod-1").await.unwrap_err();
    assert!(matches!(stale, Error::Conflict { .. }));

    leases[1].refresh().await.unwrap();
    let locked = leases[1].try_acquire_leader("pod-1").await.unwrap_err();
    assert!(matches!(locked, Error::AlreadyLocked { ref holder } if holder == "pod-0"));
    assert!(leases[1].is_locked());
    assert_eq!(leases[1].leader_name().as_deref(), Some("pod-0"));
}

#[tokio::test]
async fn test_expired_lease_can_be_taken() {
    let (_, clock, leases) = stores(2);
    leases[0].refresh().await.unwrap();
    leases[0].try_acquire_leader("pod-0").await.unwrap();

    clock.advance(Duration::seconds(11));
    leases[1].refresh().await.unwrap();
    assert!(!leases[1].is_locked());
    let taken = leases[1].try_acquire_leader("pod-1").await.unwrap();
    assert_eq!(taken.record.leader_name(), Some("pod-1"));

    leases[0].refresh().await.unwrap();
    let err = leases[0].renew_leader("pod-0", 1, BTreeMap::new()).await.unwrap_err();
    assert!(matches!(err, Error::NotLeader { leader: Some(ref l), .. } if l == "pod-1"));
}

#[tokio::test]
async fn test_release_lets_others_acquire_without_waiting() {
    let (_, _, leases) = stores(2);
    leases[0].refresh().await.unwrap();
    leases[0].try_acquire_leader("pod-0").await.unwrap();
    leases[0].release_leader("pod-0").await.unwrap();

    leases[1].refresh().await.unwrap();
    assert!(!leases[1].is_locked());
    leases[1].try_acquire_leader("pod-1").await.unwrap();
}

#[tokio::test]
async fn test_switchover_request_validation() {
    let (objects, _, leases) = stores(1);
    let lease = &leases[0];
    let topology = MemberTopology::default();

    let no_leader = lease.request_switchover(None, &topology).await.unwrap_err();
    assert!(matches!(no_leader, Error::InvalidSwitchover { .. }));

    lease
        .init(true, "sys-1", BTreeMap::new(), 0, "pod-0", Role::Follower)
        .await
        .unwrap();
    lease.register_member("pod-1", Role::Follower, 0).await.unwrap();
    lease.register_member("pod-2", Role::Learner, 0).await.unwrap();

    for (target, reason) in [
        ("pod-9", "not a known member"),
        ("pod-2", "learners cannot lead"),
        ("pod-0", "already the leader"),
    ] {
        let err = lease.request_switchover(Some(target), &topology).await.unwrap_err();
        assert!(
            matches!(err, Error::InvalidSwitchover { reason: ref r, .. } if r == reason),
            "{target}: {err}"
        );
    }

    let switchover = lease.request_switchover(Some("pod-1"), &topology).await.unwrap();
    assert_eq!(switchover.leader, "pod-0");
    assert!(objects.get("pg-main-switchover").await.unwrap().is_some());

    let pending = lease.request_switchover(None, &topology).await.unwrap_err();
    assert!(matches!(pending, Error::InvalidSwitchover { .. }));

    lease.cancel_switchover().await.unwrap();
    assert!(objects.get("pg-main-switchover").await.unwrap().is_none());
    assert!(lease.snapshot().unwrap().record.switchover.is_none());
}

#[tokio::test]
async fn test_controller_init_rejects_down_primary() {
    let mut cluster = TestCluster::new(&[]);
    let engine = FakeEngine::primary();
    engine.update(|s| s.running = false);
    let pod = cluster.add_member("pod-0", Role::Follower, engine);

    let err = pod.controller.init().await.unwrap_err();
    assert!(matches!(err, Error::EngineState(_)));
    assert_eq!(pod.engine.calls("init_delay"), 3);
    assert!(cluster.record().await.is_none());
}

#[tokio::test]
async fn test_controller_init_then_leader_acquires() {
    let mut cluster = TestCluster::new(&["pod-1"]);
    cluster.add_member("pod-0", Role::Follower, FakeEngine::primary());

    // The replica starts first and creates a leaderless record.
    cluster.member("pod-1").controller.init().await.unwrap();
    cluster.member("pod-0").controller.init().await.unwrap();
    assert_eq!(cluster.recorded_leader().await, None);

    assert_eq!(cluster.tick("pod-0").await.unwrap(), TickOutcome::Acquired);
    let record = cluster.record().await.unwrap();
    assert_eq!(record.sys_id, TEST_SYS_ID);
    assert_eq!(record.leader_name(), Some("pod-0"));
}

#[tokio::test]
async fn test_any_member_seeds_a_missing_sys_id() {
    let (_, _, leases) = stores(3);
    // The first member could not read its engine's system id.
    let created = leases[1]
        .init(false, "", BTreeMap::new(), 0, "pod-1", Role::Follower)
        .await
        .unwrap();
    assert!(created.record.sys_id.is_empty());

    let seeded = leases[2]
        .init(false, "sys-1", BTreeMap::new(), 0, "pod-2", Role::Follower)
        .await
        .unwrap();
    assert_eq!(seeded.record.sys_id, "sys-1");
    assert!(seeded.record.leader.is_none());

    let err = leases[0]
        .init(true, "sys-2", BTreeMap::new(), 0, "pod-0", Role::Follower)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::SysIdMismatch { .. }));
}
