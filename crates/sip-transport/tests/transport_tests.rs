use std::net::SocketAddr;
use std::time::Duration;

use sipstack_sip_core::prelude::*;
use sipstack_sip_transport::{bind_udp, Error, MemoryNetwork, Transport, TransportEvent, TransportType};

fn options_request() -> Message {
    RequestBuilder::new(Method::Options, "sip:bob@127.0.0.1")
        .unwrap()
        .via(Via::new("UDP", "127.0.0.1", Some(5060)).with_branch(generate_branch()))
        .from_address("<sip:alice@127.0.0.1>;tag=a1".parse().unwrap())
        .to_address("<sip:bob@127.0.0.1>".parse().unwrap())
        .call_id("transport-test")
        .cseq(1)
        .max_forwards(70)
        .build()
        .into()
}

fn addr(s: &str) -> SocketAddr {
    s.parse().unwrap()
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sipstack_sip_transport=trace".into()),
        )
        .with_test_writer()
        .try_init();
}

#[tokio::test]
async fn test_memory_delivery_goes_through_codec() {
    init_tracing();
    let network = MemoryNetwork::new();
    let (alice, _alice_rx) = network.bind(addr("10.0.0.1:5060"), TransportType::Udp).unwrap();
    let (_bob, mut bob_rx) = network.bind(addr("10.0.0.2:5060"), TransportType::Udp).unwrap();

    let request = options_request();
    alice.send_message(request.clone(), addr("10.0.0.2:5060")).await.unwrap();

    match bob_rx.recv().await.unwrap() {
        TransportEvent::MessageReceived { message, source, destination } => {
            assert_eq!(source, addr("10.0.0.1:5060"));
            assert_eq!(destination, addr("10.0.0.2:5060"));
            assert_eq!(message.call_id(), Some("transport-test"));
            assert_eq!(message.top_via().unwrap().branch(), request.top_via().unwrap().branch());
        }
        other => panic!("unexpected event {:?}", other),
    }
}

#[tokio::test]
async fn test_memory_unbound_destination() {
    init_tracing();
    let network = MemoryNetwork::new();
    let (udp, _rx1) = network.bind(addr("10.0.0.1:5060"), TransportType::Udp).unwrap();
    let (tcp, _rx2) = network.bind(addr("10.0.0.1:5061"), TransportType::Tcp).unwrap();

    assert!(udp.send_message(options_request(), addr("10.9.9.9:5060")).await.is_ok());
    assert!(matches!(
        tcp.send_message(options_request(), addr("10.9.9.9:5060")).await,
        Err(Error::Unreachable(_))
    ));
    assert!(tcp.is_reliable());
    assert!(!udp.is_reliable());
}

#[tokio::test]
async fn test_memory_close_and_rebind() {
    init_tracing();
    let network = MemoryNetwork::new();
    let (transport, mut rx) = network.bind(addr("10.0.0.1:5060"), TransportType::Udp).unwrap();
    assert!(network.bind(addr("10.0.0.1:5060"), TransportType::Udp).is_err());

    transport.close().await.unwrap();
    assert!(transport.is_closed());
    assert!(matches!(rx.recv().await, Some(TransportEvent::Closed)));
    assert!(matches!(
        transport.send_message(options_request(), addr("10.0.0.2:5060")).await,
        Err(Error::TransportClosed)
    ));
    assert!(network.bind(addr("10.0.0.1:5060"), TransportType::Udp).is_ok());
}

#[tokio::test]
async fn test_memory_ephemeral_ports() {
    init_tracing();
    let network = MemoryNetwork::new();
    let (a, _ra) = network.bind(addr("10.0.0.1:0"), TransportType::Udp).unwrap();
    let (b, _rb) = network.bind(addr("10.0.0.1:0"), TransportType::Udp).unwrap();
    assert_ne!(a.local_addr().unwrap(), b.local_addr().unwrap());
    assert_eq!(network.endpoint_count(), 2);
}

#[tokio::test]
async fn test_udp_loopback() {
    init_tracing();
    let (alice, _alice_rx) = bind_udp(addr("127.0.0.1:0")).await.unwrap();
    let (bob, mut bob_rx) = bind_udp(addr("127.0.0.1:0")).await.unwrap();
    let bob_addr = bob.local_addr().unwrap();

    alice.send_message(options_request(), bob_addr).await.unwrap();

    let event = tokio::time::timeout(Duration::from_secs(5), bob_rx.recv())
        .await
        .unwrap()
        .unwrap();
    match event {
        TransportEvent::MessageReceived { message, source, .. } => {
            assert_eq!(source, alice.local_addr().unwrap());
            assert!(message.is_request());
        }
        other => panic!("unexpected event {:?}", other),
    }

    bob.close().await.unwrap();
    let closed = tokio::time::timeout(Duration::from_secs(5), bob_rx.recv())
        .await
        .unwrap();
    assert!(matches!(closed, Some(TransportEvent::Closed)));
}

#[test]
fn test_transport_type_tokens() {
    assert_eq!("udp".parse::<TransportType>().unwrap(), TransportType::Udp);
    assert_eq!(TransportType::Tls.to_string(), "TLS");
    assert!("sctp".parse::<TransportType>().is_err());
}
