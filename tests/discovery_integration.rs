//! Integration tests for UDP network discovery over loopback.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use lanshare::discovery::{
    probe, DiscoveryConfig, DiscoveryHandle, DiscoveryResponder, DISCOVERY_TOKEN, SERVICE_ID,
};
use tokio::net::UdpSocket;

async fn start_responder(name: &str, service_port: u16) -> DiscoveryHandle {
    let mut config = DiscoveryConfig::new(name, service_port);
    config.bind = SocketAddr::from((Ipv4Addr::LOCALHOST, 0));
    config.advertised_address = Some(IpAddr::V4(Ipv4Addr::LOCALHOST));

    DiscoveryResponder::bind(config)
        .await
        .expect("bind responder")
        .spawn()
        .expect("spawn responder")
}

#[tokio::test]
async fn test_probe_finds_responder() {
    let handle = start_responder("Test Share", 3456).await;

    let found = probe(handle.local_addr(), Duration::from_millis(500))
        .await
        .unwrap();
    assert_eq!(found.len(), 1);

    let (from, announcement) = &found[0];
    assert_eq!(*from, handle.local_addr());
    assert_eq!(announcement.service, SERVICE_ID);
    assert_eq!(announcement.service_name, "Test Share");
    assert_eq!(announcement.port, 3456);
    assert_eq!(announcement.address, IpAddr::V4(Ipv4Addr::LOCALHOST));
    assert_eq!(announcement.url, "http://127.0.0.1:3456");

    handle.shutdown().await;
}

#[tokio::test]
async fn test_announced_address_is_routable_from_querier() {
    let mut config = DiscoveryConfig::new("Routed", 4000);
    config.bind = SocketAddr::from((Ipv4Addr::LOCALHOST, 0));
    let handle = DiscoveryResponder::bind(config)
        .await
        .unwrap()
        .spawn()
        .unwrap();

    let found = probe(handle.local_addr(), Duration::from_millis(500))
        .await
        .unwrap();
    assert_eq!(found.len(), 1);

    // A querier on loopback is answered with the address it can reach us on,
    // not whatever interface carries the default route.
    let announcement = &found[0].1;
    assert_eq!(announcement.address, IpAddr::V4(Ipv4Addr::LOCALHOST));
    assert_eq!(announcement.url, "http://127.0.0.1:4000");

    handle.shutdown().await;
}

#[tokio::test]
async fn test_unrecognized_payload_gets_no_reply() {
    let handle = start_responder("Quiet", 3000).await;

    let client = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    for payload in [&b"HELLO"[..], &b"FILE_SHARE_DISCOVERY\n"[..], &b""[..]] {
        client.send_to(payload, handle.local_addr()).await.unwrap();
    }

    let mut buf = [0u8; 1024];
    let reply = tokio::time::timeout(Duration::from_millis(300), client.recv_from(&mut buf)).await;
    assert!(reply.is_err(), "responder must ignore unrecognized datagrams");

    handle.shutdown().await;
}

#[tokio::test]
async fn test_every_query_in_a_burst_is_answered() {
    let handle = start_responder("Busy", 3000).await;

    let client = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    for _ in 0..20 {
        client
            .send_to(DISCOVERY_TOKEN, handle.local_addr())
            .await
            .unwrap();
    }

    let mut buf = [0u8; 1024];
    let mut replies = 0;
    while let Ok(Ok((len, _))) =
        tokio::time::timeout(Duration::from_millis(500), client.recv_from(&mut buf)).await
    {
        let value: serde_json::Value = serde_json::from_slice(&buf[..len]).unwrap();
        assert_eq!(value["name"], "Busy");
        replies += 1;
        if replies == 20 {
            break;
        }
    }
    assert_eq!(replies, 20);

    handle.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_stops_answering() {
    let handle = start_responder("Gone", 3000).await;
    let addr = handle.local_addr();
    handle.shutdown().await;

    let found = probe(addr, Duration::from_millis(200)).await.unwrap();
    assert!(found.is_empty());
}
