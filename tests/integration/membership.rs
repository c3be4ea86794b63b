use crate::*;

use murmur_services::CollectionOutcome;

/// A silent member leaving lets collect_all finish with what it has.
#[tokio::test(start_paused = true)]
async fn test_collect_all_completes_when_member_leaves() {
    let cluster = LocalCluster::new("c");
    let a = node(&cluster, "A");
    let _b = echo_node(&cluster, "B");
    let silent = node(&cluster, "C");

    let mut handle = a
        .new_builder(query(1))
        .broadcast(false)
        .collect_all()
        .no_timeout()
        .build()
        .transmit()
        .unwrap();

    settle().await;
    assert!(handle.try_outcome().is_none(), "still waiting for C");

    silent.close();

    match handle.await {
        CollectionOutcome::Completed(packets) => assert_eq!(answered_by(&packets), ["B"]),
        other => panic!("expected completion, got {other:?}"),
    }
    assert_eq!(a.pending_collections(), 0);
}

/// A member joining does not raise the target of a collection in flight.
#[tokio::test(start_paused = true)]
async fn test_join_does_not_extend_collect_all() {
    let cluster = LocalCluster::new("c");
    let a = node(&cluster, "A");
    let b = node(&cluster, "B");
    answer_queries(&b, "B", Duration::from_secs(1));

    let handle = a
        .new_builder(query(2))
        .broadcast(false)
        .collect_all()
        .timeout(Duration::from_secs(5))
        .build()
        .transmit()
        .unwrap();

    let _late = echo_node(&cluster, "late");

    let packets = handle.await.into_result().unwrap();
    assert_eq!(answered_by(&packets), ["B"]);
}

/// Exact targets ignore membership changes.
#[tokio::test(start_paused = true)]
async fn test_collect_exact_survives_shrink() {
    let cluster = LocalCluster::new("c");
    let a = node(&cluster, "A");
    let _b = echo_node(&cluster, "B");
    let c = node(&cluster, "C");

    let mut handle = a
        .new_builder(query(3))
        .broadcast(false)
        .collect_exact(2)
        .timeout(Duration::from_secs(5))
        .build()
        .transmit()
        .unwrap();

    settle().await;
    c.close();
    settle().await;
    assert!(handle.try_outcome().is_none());

    assert!(matches!(handle.await, CollectionOutcome::TimedOut { received } if received.len() == 1));
}

/// Views reflect join order and every change bumps the view id.
#[tokio::test]
async fn test_view_tracks_membership() {
    let cluster = LocalCluster::new("c");
    let a = node(&cluster, "A");
    let b = node(&cluster, "B");
    let first = a.view();
    assert_eq!(a.member_count(), 2);

    let _c = node(&cluster, "C");
    let second = a.view();
    assert!(second.id() > first.id());
    assert_eq!(
        second.members().iter().map(|m| m.name()).collect::<Vec<_>>(),
        ["A", "B", "C"]
    );

    b.close();
    assert_eq!(a.member_count(), 2);
    assert!(!a.view().contains(&b.local_address()));
}
