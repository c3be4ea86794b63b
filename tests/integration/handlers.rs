use crate::*;

/// Plain packets reach every handler on every receiving node, in order.
#[tokio::test(start_paused = true)]
async fn test_broadcast_reaches_handlers_in_order() {
    let cluster = LocalCluster::new("c");
    let a = node(&cluster, "A");
    let b = node(&cluster, "B");

    let order = Arc::new(Mutex::new(Vec::new()));
    for tag in ["first", "second"] {
        let order = order.clone();
        b.add_handler(Notice::packet_type(), move |_| {
            order.lock().unwrap().push(tag);
            Ok(())
        });
    }
    let seen_by_a = notice_log(&a);

    a.new_builder(notice("one")).broadcast(false).build().transmit().unwrap();
    a.new_builder(notice("two")).broadcast(false).build().transmit().unwrap();
    settle().await;

    assert_eq!(*order.lock().unwrap(), ["first", "second", "first", "second"]);
    assert!(seen_by_a.lock().unwrap().is_empty(), "no loopback requested");
}

/// A failing handler is skipped; the others still run.
#[tokio::test(start_paused = true)]
async fn test_failing_handler_is_contained() {
    let cluster = LocalCluster::new("c");
    let a = node(&cluster, "A");
    let b = node(&cluster, "B");

    b.add_handler(Notice::packet_type(), |_| anyhow::bail!("broken handler"));
    b.add_handler(Notice::packet_type(), |_| panic!("panicking handler"));
    let seen = notice_log(&b);

    a.new_builder(notice("still delivered"))
        .to_node("B")
        .unwrap()
        .build()
        .transmit()
        .unwrap();
    settle().await;

    assert_eq!(*seen.lock().unwrap(), ["still delivered"]);
}

/// Removed handlers stop receiving; unknown removals report false.
#[tokio::test(start_paused = true)]
async fn test_remove_handler() {
    let cluster = LocalCluster::new("c");
    let a = node(&cluster, "A");
    let b = node(&cluster, "B");

    let count = Arc::new(Mutex::new(0));
    let counter = count.clone();
    let id = b.add_handler(Notice::packet_type(), move |_| {
        *counter.lock().unwrap() += 1;
        Ok(())
    });

    a.new_builder(notice("1")).broadcast(false).build().transmit().unwrap();
    settle().await;
    assert!(b.remove_handler(Notice::packet_type(), id));
    assert!(!b.remove_handler(Notice::packet_type(), id));
    assert!(!b.remove_handler(Query::packet_type(), id));

    a.new_builder(notice("2")).broadcast(false).build().transmit().unwrap();
    settle().await;
    assert_eq!(*count.lock().unwrap(), 1);
}

/// Responses go to the collection engine, never to handlers.
#[tokio::test(start_paused = true)]
async fn test_responses_bypass_handlers() {
    let cluster = LocalCluster::new("c");
    let a = node(&cluster, "A");
    let _b = echo_node(&cluster, "B");

    let handled = Arc::new(Mutex::new(0));
    let counter = handled.clone();
    a.add_handler(Answer::packet_type(), move |_| {
        *counter.lock().unwrap() += 1;
        Ok(())
    });

    a.new_builder(query(1))
        .to_node("B")
        .unwrap()
        .collect_one()
        .build()
        .transmit()
        .unwrap()
        .await
        .into_result()
        .unwrap();
    settle().await;

    assert_eq!(*handled.lock().unwrap(), 0);
}

/// Requests follow the normal handler path on the receiving node.
#[tokio::test(start_paused = true)]
async fn test_request_with_loopback_reaches_own_handler() {
    let cluster = LocalCluster::new("c");
    let a = echo_node(&cluster, "A");

    let packets = a
        .new_builder(query(5))
        .broadcast(true)
        .collect_all()
        .timeout(Duration::from_secs(1))
        .build()
        .transmit()
        .unwrap()
        .await
        .into_result()
        .unwrap();

    assert_eq!(answered_by(&packets), ["A"]);
}
