//! Basic announce/fetch: a record published on one node lands in the
//! subscriber's store and flows to its streaming sessions.

use std::time::Duration;

use sdx_core::SchemaId;
use sdx_node::filter::FilterSet;
use sdx_node::subscriptions::{DeliveryMode, SessionDelivery, SubscriptionSpec};
use sdx_node::trust::TrustLevel;
use sdx_sim::{wait_until, SimNet};

#[test]
fn published_record_reaches_subscriber_store_and_sessions() {
    let net = SimNet::new(&["OMM"]);
    let mut node_a = net.spawn_node(1);
    let mut node_b = net.spawn_node(2);
    net.subscribe_all(&node_a, &node_b);
    net.trust(&node_b, node_a.peer, TrustLevel::Standard);
    net.trust(&node_a, node_b.peer, TrustLevel::Standard);

    let (_, deliveries) = node_b
        .service
        .subscribe(SubscriptionSpec {
            schema: SchemaId::from("OMM"),
            mode: DeliveryMode::Streaming,
            filters: FilterSet::default(),
            messages_per_minute: None,
            batch_window: None,
            batch_size: None,
        })
        .expect("session should create");

    let bytes = vec![0x42; 64];
    let cid = node_a
        .service
        .publish_record(SchemaId::from("OMM"), bytes.clone(), false)
        .expect("publish should succeed");

    assert!(
        wait_until(Duration::from_secs(5), || {
            node_b
                .service
                .store()
                .has(&SchemaId::from("OMM"), &cid)
                .unwrap_or(false)
        }),
        "subscriber should fetch the announced record"
    );
    let fetched = node_b
        .service
        .store()
        .get(&SchemaId::from("OMM"), &cid)
        .expect("fetched record should read");
    assert_eq!(fetched, bytes);

    let delivery = deliveries
        .recv_timeout(Duration::from_secs(5))
        .expect("session should receive the record");
    match delivery {
        SessionDelivery::Record(envelope) => {
            assert_eq!(envelope.cid, cid);
            assert_eq!(envelope.bytes, bytes);
        }
        other => panic!("expected a single record, got {other:?}"),
    }

    // The publisher's own sessions are fed from the local put as well.
    assert_eq!(node_a.service.metrics().snapshot().fetch_ok, 0);
    assert_eq!(node_b.service.metrics().snapshot().fetch_ok, 1);

    node_a.service.shutdown();
    node_b.service.shutdown();
}
