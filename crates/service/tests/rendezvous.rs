use codec::identity::NodeId;
use service::dht::{DhtEngine, FindValueResult};
use service::rendezvous::{Membership, RendezvousValue};
use std::net::Ipv4Addr;

/// Spec §8 scenario 4 (rendezvous matching), exercised against the DHT
/// storage path directly: A joins a key and publishes its endpoint tuple;
/// a lookup of the key's DHT id recovers A's record. The network fan-out
/// to the K closest nodes is the dispatcher's job and is covered by the
/// end-to-end test at the workspace root.
#[test]
fn join_then_find_recovers_the_published_endpoint() {
    let dht = DhtEngine::new(NodeId::random());
    let membership = Membership::default();

    let key = "/room/42";
    let dht_id = membership.join(key).unwrap();
    assert!(membership.is_member(key));

    let value = RendezvousValue {
        node_id: NodeId::random(),
        ip: Ipv4Addr::new(127, 0, 0, 1),
        port: 8000,
        public_ip: None,
        public_port: None,
        behind_nat: false,
    };

    dht.store(dht_id, value.encode());

    match dht.find_value(&dht_id) {
        FindValueResult::Found(bytes) => {
            let recovered = RendezvousValue::decode(&bytes).unwrap();
            assert_eq!(recovered, value);
        }
        FindValueResult::Closest(_) => panic!("expected the published value"),
    }
}
