use codec::identity::NodeId;
use service::dht::{DhtEngine, StoreOutcome};
use std::net::{Ipv4Addr, SocketAddrV4};

fn ep(port: u16) -> SocketAddrV4 {
    SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), port)
}

fn id_with_first_byte(b: u8) -> NodeId {
    let mut bytes = [0u8; 20];
    bytes[0] = b;
    NodeId::from_bytes(bytes)
}

/// Spec §8 scenario 2: bucket ejection. Local id all-zero, 9 ids whose
/// first byte is 0x80 (same bucket, index 0): the first 8 succeed, the 9th
/// is rejected because nothing existing is old enough to evict.
#[test]
fn bucket_ejection_scenario() {
    let local = NodeId::from_bytes([0u8; 20]);
    let dht = DhtEngine::new(local);

    for i in 0..8u8 {
        let mut bytes = [0u8; 20];
        bytes[0] = 0x80;
        bytes[1] = i;
        assert!(dht.add_node(NodeId::from_bytes(bytes), ep(9000 + i as u16)));
    }

    let mut ninth = [0u8; 20];
    ninth[0] = 0x80;
    ninth[1] = 8;
    assert!(!dht.add_node(NodeId::from_bytes(ninth), ep(9100)));
}

/// Spec §8 scenario 3: DHT find ranking.
#[test]
fn find_ranking_scenario() {
    let local = NodeId::from_bytes([0u8; 20]);
    let dht = DhtEngine::new(local);

    let ids = [0x01u8, 0x02, 0x04, 0x08].map(id_with_first_byte);
    for (i, id) in ids.iter().enumerate() {
        dht.add_node(*id, ep(9000 + i as u16));
    }

    let found = dht.find_node(&local, 3);
    let found_ids: Vec<NodeId> = found.iter().map(|e| e.node_id).collect();
    assert_eq!(found_ids, vec![ids[0], ids[1], ids[2]]);
}

#[test]
fn value_store_round_trip_via_engine() {
    let dht = DhtEngine::new(NodeId::random());
    let key = NodeId::from_str("some-key");

    assert!(matches!(dht.store(key, b"hello".to_vec()), StoreOutcome::Stored));

    match dht.find_value(&key) {
        service::dht::FindValueResult::Found(bytes) => assert_eq!(bytes, b"hello"),
        service::dht::FindValueResult::Closest(_) => panic!("expected a hit"),
    }
}
