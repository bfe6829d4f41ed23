//! Beacon and listener over loopback.

use asfa_core::AppEvent;
use asfa_core::config::DiscoveryConfig;
use asfa_core::discovery::{DiscoveryBeacon, DiscoveryListener, PeerIdentity};
use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

fn loopback(port: u16) -> DiscoveryConfig {
    DiscoveryConfig {
        group: Ipv4Addr::LOCALHOST,
        port,
        ttl: 1,
        interval_secs: 1,
    }
}

async fn next_peer(rx: &mut mpsc::Receiver<AppEvent>) -> (String, SocketAddr) {
    let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("no peer discovered")
        .expect("listener stopped");
    match event {
        AppEvent::PeerDiscovered { username, addr } => (username, addr),
        other => panic!("unexpected event {:?}", other),
    }
}

#[tokio::test]
async fn test_beacon_is_heard() {
    let listener = DiscoveryListener::bind(&loopback(0)).unwrap();
    let config = loopback(listener.local_port().unwrap());
    let (tx, mut rx) = mpsc::channel(16);
    let cancel = CancellationToken::new();
    let handle = listener.start_listening(tx, cancel.clone());

    // Garbage first: it must not stop the listener
    let sender = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    for junk in [&b"hello"[..], b"asfa!bob!not-an-ip!3000", b"other!bob!10.0.0.1!3000"] {
        sender
            .send_to(junk, (Ipv4Addr::LOCALHOST, config.port))
            .await
            .unwrap();
    }

    let identity = PeerIdentity::new("bob", "192.168.1.7:3001".parse().unwrap());
    let beacon = DiscoveryBeacon::start(identity.clone(), &config).await.unwrap();

    let (username, addr) = next_peer(&mut rx).await;
    assert_eq!(username, "bob");
    assert_eq!(addr, identity.addr);

    beacon.stop().await;
    cancel.cancel();
    handle.await.unwrap();
}

#[tokio::test]
async fn test_several_peers() {
    let listener = DiscoveryListener::bind(&loopback(0)).unwrap();
    let config = loopback(listener.local_port().unwrap());
    let (tx, mut rx) = mpsc::channel(64);
    let cancel = CancellationToken::new();
    let _handle = listener.start_listening(tx, cancel.clone());

    let _alice = DiscoveryBeacon::start(
        PeerIdentity::new("alice", "10.0.0.2:3000".parse().unwrap()),
        &config,
    )
    .await
    .unwrap();
    let _carol = DiscoveryBeacon::start(
        PeerIdentity::new("carol", "10.0.0.3:3000".parse().unwrap()),
        &config,
    )
    .await
    .unwrap();

    let mut seen = HashSet::new();
    while seen.len() < 2 {
        seen.insert(next_peer(&mut rx).await);
    }
    assert!(seen.contains(&("alice".to_string(), "10.0.0.2:3000".parse().unwrap())));
    assert!(seen.contains(&("carol".to_string(), "10.0.0.3:3000".parse().unwrap())));
    cancel.cancel();
}

#[tokio::test]
async fn test_dropped_beacon_goes_quiet() {
    let listener = DiscoveryListener::bind(&loopback(0)).unwrap();
    let config = loopback(listener.local_port().unwrap());
    let (tx, mut rx) = mpsc::channel(16);
    let cancel = CancellationToken::new();
    let _handle = listener.start_listening(tx, cancel.clone());

    let beacon = DiscoveryBeacon::start(
        PeerIdentity::new("dave", "10.0.0.4:3000".parse().unwrap()),
        &config,
    )
    .await
    .unwrap();
    next_peer(&mut rx).await;
    drop(beacon);

    // Drain whatever was already in flight, then expect silence
    tokio::time::sleep(Duration::from_millis(200)).await;
    while rx.try_recv().is_ok() {}
    let quiet = tokio::time::timeout(Duration::from_millis(2500), rx.recv()).await;
    assert!(quiet.is_err());
    cancel.cancel();
}
