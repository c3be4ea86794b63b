use crate::*;

use std::sync::atomic::{AtomicUsize, Ordering};

use murmur_services::{CollectionError, CollectionOutcome, Target, TransmissionError, TransportError};

/// Loopback broadcast to a three-node cluster waits for all three answers.
#[tokio::test(start_paused = true)]
async fn test_collect_all_with_loopback() {
    let cluster = LocalCluster::new("c");
    let a = echo_node(&cluster, "A");
    let _b = echo_node(&cluster, "B");
    let _c = echo_node(&cluster, "C");

    let pending = a
        .new_builder(query(1))
        .broadcast(true)
        .collect_all()
        .timeout(Duration::from_secs(5))
        .build();
    assert_eq!(
        pending.target(),
        &Target::AllMembers {
            expected: 3,
            excluding: None
        }
    );

    let packets = pending.transmit().unwrap().await.into_result().unwrap();
    assert_eq!(answered_by(&packets), ["A", "B", "C"]);
    assert_eq!(a.pending_collections(), 0);
}

/// Without loopback the sender does not count itself.
#[tokio::test(start_paused = true)]
async fn test_collect_all_without_loopback() {
    let cluster = LocalCluster::new("c");
    let a = echo_node(&cluster, "A");
    let _b = echo_node(&cluster, "B");
    let _c = echo_node(&cluster, "C");

    let done = Arc::new(Mutex::new(Vec::new()));
    let sink = done.clone();
    let handle = a
        .new_builder(query(2))
        .broadcast(false)
        .collect_all()
        .timeout(Duration::from_secs(5))
        .on_done(move |packets| sink.lock().unwrap().extend(answered_by(packets)))
        .build()
        .transmit()
        .unwrap();

    let packets = handle.await.into_result().unwrap();
    assert_eq!(answered_by(&packets), ["B", "C"]);
    assert_eq!(*done.lock().unwrap(), ["B", "C"]);
}

/// Responses carry the request's collection id and the responder's address.
#[tokio::test(start_paused = true)]
async fn test_responses_are_correlated() {
    let cluster = LocalCluster::new("c");
    let a = node(&cluster, "A");
    let b = echo_node(&cluster, "B");

    let request = query(7);
    let collection_id = request.collection_id();
    let handle = a
        .new_builder(request)
        .to_node("B")
        .unwrap()
        .collect_one()
        .build()
        .transmit()
        .unwrap();
    assert_eq!(Some(handle.id()), collection_id);

    let packets = handle.await.into_result().unwrap();
    let response = &packets[0];
    assert!(response.is_response());
    assert_eq!(response.collection_id(), collection_id);
    assert_eq!(response.sender(), Some(&b.local_address()));
    assert_eq!(response.recipient(), Some(&a.local_address()));
    assert_eq!(response.decode::<Answer>().unwrap().n, 7);
}

/// collect_exact(2) resolves on the second answer and ignores the rest.
#[tokio::test(start_paused = true)]
async fn test_collect_exact_stops_at_target() {
    let cluster = LocalCluster::new("c");
    let a = node(&cluster, "A");
    let _peers: Vec<_> = ["B", "C", "D", "E"]
        .into_iter()
        .map(|name| echo_node(&cluster, name))
        .collect();

    let packets = a
        .new_builder(query(3))
        .broadcast(false)
        .collect_exact(2)
        .timeout(Duration::from_secs(5))
        .build()
        .transmit()
        .unwrap()
        .await
        .into_result()
        .unwrap();

    assert_eq!(packets.len(), 2);
    settle().await;
    assert_eq!(a.pending_collections(), 0);
}

/// One peer answers late: the collection times out with the early answer,
/// and the late one changes nothing.
#[tokio::test(start_paused = true)]
async fn test_timeout_then_late_reply() {
    let cluster = LocalCluster::new("c");
    let a = node(&cluster, "A");
    let _b = echo_node(&cluster, "B");
    let c = node(&cluster, "C");
    answer_queries(&c, "C", Duration::from_secs(3));

    let timeouts = Arc::new(AtomicUsize::new(0));
    let counter = timeouts.clone();
    let handle = a
        .new_builder(query(4))
        .broadcast(false)
        .collect_all()
        .timeout(Duration::from_secs(2))
        .on_timeout(move |received| {
            assert_eq!(received.len(), 1);
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .build()
        .transmit()
        .unwrap();

    match handle.await {
        CollectionOutcome::TimedOut { received } => assert_eq!(answered_by(&received), ["B"]),
        other => panic!("expected timeout, got {other:?}"),
    }

    // C's answer lands after the timeout.
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(timeouts.load(Ordering::SeqCst), 1);
    assert_eq!(a.pending_collections(), 0);
}

/// Timeouts go to on_error when no on_timeout is attached.
#[tokio::test(start_paused = true)]
async fn test_timeout_falls_back_to_on_error() {
    let cluster = LocalCluster::new("c");
    let a = node(&cluster, "A");
    let _silent = node(&cluster, "B");

    let errors = Arc::new(Mutex::new(Vec::new()));
    let sink = errors.clone();
    let handle = a
        .new_builder(query(5))
        .to_node("B")
        .unwrap()
        .collect_one()
        .timeout(Duration::from_secs(1))
        .on_error(move |e| sink.lock().unwrap().push(e.clone()))
        .build()
        .transmit()
        .unwrap();

    let err = handle.await.into_result().unwrap_err();
    assert_eq!(err, CollectionError::TimedOut { received: 0 });
    assert_eq!(*errors.lock().unwrap(), [CollectionError::TimedOut { received: 0 }]);
}

/// Unknown node names fail synchronously and nothing is sent.
#[tokio::test(start_paused = true)]
async fn test_unknown_node_name() {
    let cluster = LocalCluster::new("c");
    let a = node(&cluster, "A");
    let b = node(&cluster, "B");
    let seen = notice_log(&b);

    let err = a.new_builder(notice("hi")).to_node("nonexistent-node").err().unwrap();
    assert!(matches!(err, TransmissionError::AddressNotFound(name) if name == "nonexistent-node"));

    settle().await;
    assert!(seen.lock().unwrap().is_empty());
    assert_eq!(a.pending_collections(), 0);
}

/// Collecting requires a REQUEST packet.
#[tokio::test]
async fn test_collect_on_plain_packet_fails() {
    let cluster = LocalCluster::new("c");
    let a = node(&cluster, "A");

    let packet = notice("not a request");
    let packet_id = packet.id();
    let err = a.new_builder(packet).collect_one().build().transmit().unwrap_err();

    assert!(matches!(err, TransmissionError::NotARequest(id) if id == packet_id));
    assert_eq!(a.pending_collections(), 0);
}

/// A failed send resolves the collection as failed and reports the error.
#[tokio::test]
async fn test_send_failure_resolves_collection() {
    let cluster = LocalCluster::new("c");
    let a = node(&cluster, "A");
    let b = node(&cluster, "B");
    let b_address = b.local_address();
    b.close();

    let errors = Arc::new(Mutex::new(Vec::new()));
    let sink = errors.clone();
    let err = a
        .new_builder(query(6))
        .to(b_address)
        .collect_one()
        .on_error(move |e| sink.lock().unwrap().push(e.clone()))
        .build()
        .transmit()
        .unwrap_err();

    assert!(matches!(
        err,
        TransmissionError::Send(TransportError::UnknownDestination(_))
    ));
    assert_eq!(a.pending_collections(), 0);
    assert!(matches!(errors.lock().unwrap().as_slice(), [CollectionError::Failed(_)]));
}

/// sneaky_transmit swallows errors.
#[tokio::test]
async fn test_sneaky_transmit_reports_success_as_bool() {
    let cluster = LocalCluster::new("c");
    let a = node(&cluster, "A");
    let _b = node(&cluster, "B");

    assert!(a.new_builder(notice("hi")).build().sneaky_transmit());
    assert!(a.new_builder(query(1)).broadcast(false).collect_all().build().sneaky_transmit());
    assert!(a.new_builder(notice("hi")).to_node("B").unwrap().relay(false).build().sneaky_transmit());

    a.close();
    assert!(!a.new_builder(notice("bye")).build().sneaky_transmit());
}

/// Cancellation wins exactly once.
#[tokio::test(start_paused = true)]
async fn test_cancel_pending_collection() {
    let cluster = LocalCluster::new("c");
    let a = node(&cluster, "A");
    let _silent = node(&cluster, "B");

    let handle = a
        .new_builder(query(8))
        .broadcast(false)
        .collect_all()
        .no_timeout()
        .build()
        .transmit()
        .unwrap();
    let id = handle.id();

    assert!(a.cancel(id));
    assert!(!a.cancel(id));
    assert!(matches!(handle.await, CollectionOutcome::Cancelled));
}

/// The configured default timeout applies unless overridden.
#[tokio::test(start_paused = true)]
async fn test_default_timeout_from_config() {
    let cluster = LocalCluster::new("c");
    let config = CollectionConfig {
        default_timeout_ms: 500,
    };
    let a = node_with(&cluster, "A", &config);
    let _silent = node(&cluster, "B");

    let defaulted = a.new_builder(query(9)).broadcast(false).collect_all().build();
    assert_eq!(defaulted.timeout(), Some(Duration::from_millis(500)));
    let defaulted = defaulted.transmit().unwrap();

    let forever = a
        .new_builder(query(10))
        .broadcast(false)
        .collect_all()
        .no_timeout()
        .build()
        .transmit()
        .unwrap();

    assert!(matches!(defaulted.await, CollectionOutcome::TimedOut { .. }));
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(a.pending_collections(), 1);
    assert!(a.cancel(forever.id()));
}

/// Closing a manager cancels what it was still waiting for.
#[tokio::test]
async fn test_close_cancels_pending() {
    let cluster = LocalCluster::new("c");
    let a = node(&cluster, "A");
    let _silent = node(&cluster, "B");

    let handle = a
        .new_builder(query(11))
        .broadcast(false)
        .collect_all()
        .build()
        .transmit()
        .unwrap();

    a.close();
    assert!(matches!(handle.await, CollectionOutcome::Cancelled));
    assert_eq!(cluster.member_count(), 1);
}

/// wait_blocking works from a plain thread.
#[test]
fn test_wait_blocking_from_sync_thread() {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let _guard = runtime.enter();

    let cluster = LocalCluster::new("c");
    let a = node(&cluster, "A");
    let _b = echo_node(&cluster, "B");

    let handle = a
        .new_builder(query(12))
        .broadcast(false)
        .collect_all()
        .timeout(Duration::from_secs(10))
        .build()
        .transmit()
        .unwrap();

    let packets = handle.wait_blocking().into_result().unwrap();
    assert_eq!(answered_by(&packets), ["B"]);
}
