use chrono::Duration;
use ha::{
    test_utils::{FakeEngine, TestCluster},
    Role, TickOutcome,
};

/// pod-0 leads, pod-1 and pod-2 replicate; every member has run `init`.
async fn running_group() -> TestCluster {
    let mut cluster = TestCluster::new(&[]);
    cluster.add_member("pod-0", Role::Follower, FakeEngine::primary());
    cluster.add_member("pod-1", Role::Follower, FakeEngine::new());
    cluster.add_member("pod-2", Role::Follower, FakeEngine::new());
    for member in &cluster.members {
        member.controller.init().await.unwrap();
    }
    cluster
}

#[tokio::test]
async fn test_steady_state() {
    let cluster = running_group().await;

    assert_eq!(cluster.tick("pod-0").await.unwrap(), TickOutcome::Renewed);
    for name in ["pod-1", "pod-2"] {
        assert_eq!(
            cluster.tick(name).await.unwrap(),
            TickOutcome::Following {
                leader: Some("pod-0".into())
            }
        );
        assert_eq!(cluster.member(name).engine.state().following.as_deref(), Some("pod-0"));
    }
    assert_eq!(cluster.primaries(), vec!["pod-0".to_string()]);
    assert!(cluster.member("pod-0").controller.holds_lease());
    assert_eq!(cluster.member("pod-0").engine.state().promotions, 0);
}

#[tokio::test]
async fn test_three_renew_conflicts_demote_without_promotion() {
    let cluster = running_group().await;
    let leader = cluster.member("pod-0");
    leader.engine.reset_calls();
    leader.store.inject_update_conflicts(3);

    assert_eq!(cluster.tick("pod-0").await.unwrap(), TickOutcome::LockLost);
    assert!(!leader.engine.state().primary);
    assert_eq!(leader.engine.calls("demote"), 1);
    assert_eq!(leader.engine.calls("enforce_primary_role"), 0);
    assert!(!leader.controller.holds_lease());

    // Nobody else may take over until the recorded lease runs out.
    assert_eq!(
        cluster.tick("pod-1").await.unwrap(),
        TickOutcome::Following {
            leader: Some("pod-0".into())
        }
    );

    cluster.advance(Duration::seconds(11));
    assert_eq!(cluster.tick("pod-1").await.unwrap(), TickOutcome::Acquired);
    assert_eq!(
        cluster.tick("pod-0").await.unwrap(),
        TickOutcome::Following {
            leader: Some("pod-1".into())
        }
    );
    assert_eq!(leader.engine.calls("enforce_primary_role"), 0);
    assert_eq!(cluster.primaries(), vec!["pod-1".to_string()]);
}

#[tokio::test]
async fn test_two_conflicts_still_renew() {
    let cluster = running_group().await;
    let leader = cluster.member("pod-0");
    leader.store.inject_update_conflicts(2);

    assert_eq!(cluster.tick("pod-0").await.unwrap(), TickOutcome::Renewed);
    assert!(leader.engine.state().primary);
    assert_eq!(leader.engine.calls("demote"), 0);
}

#[tokio::test]
async fn test_silent_leader_is_replaced_within_one_tick() {
    let cluster = running_group().await;
    cluster.tick_all().await;
    cluster.member("pod-2").engine.update(|s| s.op_time = 5);

    // pod-0 stops renewing. Its lease stays valid for the full TTL.
    cluster.advance(Duration::seconds(10));
    assert_eq!(
        cluster.tick("pod-2").await.unwrap(),
        TickOutcome::Following {
            leader: Some("pod-0".into())
        }
    );

    cluster.advance(Duration::seconds(1));
    assert_eq!(cluster.tick("pod-2").await.unwrap(), TickOutcome::Acquired);
    assert_eq!(cluster.tick("pod-1").await.unwrap(), TickOutcome::Following { leader: Some("pod-2".into()) });
    assert_eq!(cluster.recorded_leader().await.as_deref(), Some("pod-2"));
}

#[tokio::test]
async fn test_partitioned_leader_demotes_on_return() {
    let cluster = running_group().await;
    cluster.tick_all().await;
    let old = cluster.member("pod-0");

    old.store.set_outage(true);
    assert!(cluster.tick("pod-0").await.is_err());
    // A tick that cannot read the record changes nothing locally.
    assert!(old.engine.state().primary);

    cluster.advance(Duration::seconds(11));
    assert_eq!(cluster.tick("pod-1").await.unwrap(), TickOutcome::Acquired);

    old.store.set_outage(false);
    old.engine.reset_calls();
    assert_eq!(
        cluster.tick("pod-0").await.unwrap(),
        TickOutcome::Following {
            leader: Some("pod-1".into())
        }
    );
    assert_eq!(old.engine.calls("demote"), 1);
    assert_eq!(old.engine.calls("enforce_primary_role"), 0);
    assert_eq!(cluster.primaries(), vec!["pod-1".to_string()]);
}

#[tokio::test]
async fn test_failed_rogue_demotion_retried_next_tick() {
    let cluster = running_group().await;
    cluster.tick_all().await;
    cluster.advance(Duration::seconds(11));
    assert_eq!(cluster.tick("pod-1").await.unwrap(), TickOutcome::Acquired);

    let old = cluster.member("pod-0");
    old.engine.fail("demote");
    assert!(cluster.tick("pod-0").await.is_err());
    assert!(old.engine.state().primary);
    assert_eq!(old.engine.calls("handle_follow"), 0);

    old.engine.heal("demote");
    assert_eq!(
        cluster.tick("pod-0").await.unwrap(),
        TickOutcome::Following {
            leader: Some("pod-1".into())
        }
    );
    assert!(!old.engine.state().primary);
}

#[tokio::test]
async fn test_unhealthy_replica_does_not_contend() {
    let cluster = running_group().await;
    cluster.tick_all().await;
    cluster.member("pod-1").engine.update(|s| s.healthiest = false);

    cluster.advance(Duration::seconds(11));
    assert_eq!(cluster.tick("pod-1").await.unwrap(), TickOutcome::Following { leader: None });
    // pod-1 still ranks first, so pod-2 waits until the lease is overdue.
    assert_eq!(cluster.tick("pod-2").await.unwrap(), TickOutcome::Following { leader: None });

    cluster.advance(Duration::seconds(10));
    assert_eq!(cluster.tick("pod-2").await.unwrap(), TickOutcome::Acquired);
}

#[tokio::test]
async fn test_equal_replicas_leave_the_lease_to_one() {
    let cluster = running_group().await;
    cluster.tick_all().await;

    cluster.advance(Duration::seconds(11));
    assert_eq!(cluster.tick("pod-2").await.unwrap(), TickOutcome::Following { leader: None });
    assert_eq!(cluster.member("pod-2").engine.calls("is_healthiest"), 0);
    assert_eq!(cluster.tick("pod-1").await.unwrap(), TickOutcome::Acquired);
    assert_eq!(cluster.recorded_leader().await.as_deref(), Some("pod-1"));
}

#[tokio::test]
async fn test_slow_demotion_finishes_on_lock_loss() {
    let cluster = running_group().await;
    let leader = cluster.member("pod-0");
    leader.engine.slow("demote", leader.controller.config().call_timeout * 2);
    leader.store.inject_update_conflicts(3);

    assert_eq!(cluster.tick("pod-0").await.unwrap(), TickOutcome::LockLost);
    assert!(!leader.engine.state().primary);
}

#[tokio::test]
async fn test_foreign_primary_never_acquires() {
    let mut cluster = TestCluster::new(&["pod-1"]);
    let foreign = FakeEngine::primary();
    foreign.update(|s| {
        s.sys_id = "1111".into();
        s.healthiest = true;
    });
    cluster.add_member("pod-0", Role::Follower, foreign);

    cluster.member("pod-1").controller.init().await.unwrap();
    let err = cluster.member("pod-0").controller.init().await.unwrap_err();
    assert!(err.is_fatal());

    let pod = cluster.member("pod-0");
    assert_eq!(cluster.tick("pod-0").await.unwrap(), TickOutcome::Following { leader: None });
    assert!(!pod.engine.state().primary);
    assert_eq!(pod.engine.calls("demote"), 1);

    // Once demoted it still may not contend as a replica.
    assert_eq!(cluster.tick("pod-0").await.unwrap(), TickOutcome::Following { leader: None });
    assert_eq!(pod.engine.calls("is_healthiest"), 0);
    assert_eq!(cluster.recorded_leader().await, None);
}

#[tokio::test]
async fn test_learner_never_leads() {
    let mut cluster = TestCluster::new(&[]);
    cluster.add_member("pod-l", Role::Learner, FakeEngine::primary());

    let snapshot = cluster.member("pod-l").controller.init().await.unwrap();
    assert!(snapshot.record.leader.is_none());
    assert_eq!(snapshot.record.members["pod-l"].role, Role::Learner);

    assert_eq!(cluster.tick("pod-l").await.unwrap(), TickOutcome::Following { leader: None });
    assert_eq!(cluster.recorded_leader().await, None);
    assert_eq!(cluster.member("pod-l").engine.calls("is_healthiest"), 0);
    assert!(!cluster.member("pod-l").engine.state().primary);
    assert_eq!(cluster.member("pod-l").engine.calls("demote"), 1);
}
