//! Tests for discovery types — the peer record peers exchange.

use munin::discovery::Peer;

#[test]
fn peer_record_roundtrips_as_json() {
    let peer = Peer {
        id: "munin-2".into(),
        grpc_addr: "10.1.0.4:8091".into(),
        rest_addr: "http://10.1.0.4:8081".into(),
    };
    let encoded = serde_json::to_string(&peer).unwrap();
    let decoded: Peer = serde_json::from_str(&encoded).unwrap();
    assert_eq!(decoded, peer);
}

#[test]
fn peer_record_field_names_are_stable() {
    // Registrations are read back by every node in the fleet; renaming a
    // field is a wire break, not a refactor.
    let peer = Peer {
        id: "munin-2".into(),
        grpc_addr: "10.1.0.4:8091".into(),
        rest_addr: "http://10.1.0.4:8081".into(),
    };
    let value = serde_json::to_value(&peer).unwrap();
    assert_eq!(value["id"], "munin-2");
    assert_eq!(value["grpc_addr"], "10.1.0.4:8091");
    assert_eq!(value["rest_addr"], "http://10.1.0.4:8081");
}

#[test]
fn malformed_peer_record_is_an_error() {
    assert!(serde_json::from_str::<Peer>(r#"{"id": "x"}"#).is_err());
}
