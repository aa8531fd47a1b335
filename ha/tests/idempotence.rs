use ha::{
    adapter::DatabaseAdapter,
    test_utils::{FakeEngine, TestCluster},
    Role, TickOutcome,
};

#[tokio::test]
async fn test_repeated_leader_ticks_promote_once() {
    let cluster = TestCluster::new(&["pod-0"]);
    let pod = cluster.member("pod-0");

    assert_eq!(cluster.tick("pod-0").await.unwrap(), TickOutcome::Acquired);
    for _ in 0..3 {
        assert_eq!(cluster.tick("pod-0").await.unwrap(), TickOutcome::Renewed);
    }
    assert_eq!(pod.engine.calls("enforce_primary_role"), 4);
    assert_eq!(pod.engine.state().promotions, 1);
    assert_eq!(pod.engine.calls("demote"), 0);
}

#[tokio::test]
async fn test_repeated_follow_is_a_no_op() {
    let mut cluster = TestCluster::new(&[]);
    cluster.add_member("pod-0", Role::Follower, FakeEngine::primary());
    cluster.add_member("pod-1", Role::Follower, FakeEngine::new());
    for member in &cluster.members {
        member.controller.init().await.unwrap();
    }

    let follower = cluster.member("pod-1");
    cluster.tick("pod-1").await.unwrap();
    let writes = follower.store.writes();

    for _ in 0..3 {
        assert_eq!(
            cluster.tick("pod-1").await.unwrap(),
            TickOutcome::Following {
                leader: Some("pod-0".into())
            }
        );
    }
    let state = follower.engine.state();
    assert_eq!(state.follow_changes, 1);
    assert_eq!(state.following.as_deref(), Some("pod-0"));
    assert_eq!(follower.store.writes(), writes);
    assert_eq!(follower.engine.calls("demote"), 0);
}

#[tokio::test]
async fn test_duplicate_init_is_harmless() {
    let mut cluster = TestCluster::new(&[]);
    cluster.add_member("pod-0", Role::Follower, FakeEngine::primary());
    let pod = cluster.member("pod-0");

    let first = pod.controller.init().await.unwrap();
    let second = pod.controller.init().await.unwrap();
    assert_eq!(first.version, second.version);
    assert_eq!(second.record.leader_name(), Some("pod-0"));
}

#[tokio::test]
async fn test_fake_engine_contract() {
    let engine = FakeEngine::new();
    engine.handle_follow(None, "pod-1").await.unwrap();
    assert_eq!(engine.state().follow_changes, 0);

    engine.demote("pod-1").await.unwrap();
    engine.demote("pod-1").await.unwrap();
    assert!(!engine.state().primary);
}
