//! Policy override precedence across the four scopes, field by field.

use std::time::Duration;

use sdx_core::SchemaId;
use sdx_node::policy::{PolicyEntry, PolicyScope};
use sdx_node::trust::TrustLevel;
use sdx_sim::{wait_until, SimNet};

#[test]
fn layered_policies_resolve_first_hit_per_field() {
    let net = SimNet::new(&["TDM", "CDM"]);
    let mut node_h = net.spawn_node(1);
    let mut node_f = net.spawn_node(2);
    let mut node_g = net.spawn_node(3);
    net.subscribe_all(&node_f, &node_h);
    net.subscribe_all(&node_g, &node_h);
    for peer in [node_f.peer, node_g.peer] {
        net.trust(&node_h, peer, TrustLevel::Standard);
    }
    net.trust(&node_f, node_h.peer, TrustLevel::Standard);
    net.trust(&node_g, node_h.peer, TrustLevel::Standard);

    // System: fetch everything, pin nothing, keep one hour.
    node_h.service.policy().set(
        PolicyScope::System,
        PolicyEntry {
            auto_fetch: Some(true),
            auto_pin: Some(false),
            ttl: Some(Duration::from_secs(3600)),
            max_payload_bytes: None,
        },
    );
    // Schema TDM: pinned.
    node_h.service.policy().set(
        PolicyScope::Schema {
            schema: SchemaId::from("TDM"),
        },
        PolicyEntry {
            auto_pin: Some(true),
            ..PolicyEntry::default()
        },
    );
    // Peer F: day-long retention.
    node_h.service.policy().set(
        PolicyScope::Peer { peer: node_f.peer },
        PolicyEntry {
            ttl: Some(Duration::from_secs(24 * 3600)),
            ..PolicyEntry::default()
        },
    );
    // (F, TDM): do not fetch at all.
    node_h.service.policy().set(
        PolicyScope::PeerAndSchema {
            peer: node_f.peer,
            schema: SchemaId::from("TDM"),
        },
        PolicyEntry {
            auto_fetch: Some(false),
            ..PolicyEntry::default()
        },
    );

    let f_tdm = node_f
        .service
        .publish_record(SchemaId::from("TDM"), b"tdm from F".to_vec(), false)
        .expect("publish should succeed");
    let g_tdm = node_g
        .service
        .publish_record(SchemaId::from("TDM"), b"tdm from G".to_vec(), false)
        .expect("publish should succeed");
    let f_cdm = node_f
        .service
        .publish_record(SchemaId::from("CDM"), b"cdm from F".to_vec(), false)
        .expect("publish should succeed");

    // G's TDM and F's CDM arrive; F's TDM never does.
    assert!(
        wait_until(Duration::from_secs(5), || {
            let store = node_h.service.store();
            store.has(&SchemaId::from("TDM"), &g_tdm).unwrap_or(false)
                && store.has(&SchemaId::from("CDM"), &f_cdm).unwrap_or(false)
        }),
        "the fetchable records should land"
    );
    std::thread::sleep(Duration::from_millis(300));
    assert!(
        !node_h
            .service
            .store()
            .has(&SchemaId::from("TDM"), &f_tdm)
            .unwrap_or(true),
        "PeerAndSchema auto_fetch=false wins for F's TDM"
    );

    // G's TDM: pinned by the schema entry, so no expiry is stamped.
    let tdm_rows = node_h
        .service
        .store()
        .query(&SchemaId::from("TDM"), &Default::default())
        .expect("query should succeed");
    assert_eq!(tdm_rows.len(), 1);
    assert_eq!(tdm_rows[0].cid, g_tdm);
    assert!(tdm_rows[0].ttl_expires_at.is_none());

    // F's CDM: unpinned (System) with the Peer-scoped 24 h retention.
    let cdm_rows = node_h
        .service
        .store()
        .query(&SchemaId::from("CDM"), &Default::default())
        .expect("query should succeed");
    assert_eq!(cdm_rows.len(), 1);
    let expiry = cdm_rows[0]
        .ttl_expires_at
        .expect("unpinned record should carry an expiry");
    let lifetime = expiry - cdm_rows[0].received_at;
    assert_eq!(lifetime, 24 * 3600 * 1000);

    node_h.service.shutdown();
    node_f.service.shutdown();
    node_g.service.shutdown();
}
