//! Whole-node integration tests: real UDP sockets on loopback, in-memory
//! virtual interfaces.

use std::{sync::Arc, time::Duration};

use fscp_node::{
    config::Config,
    server::NodeHandle,
    startup,
    tap::{MemoryInterface, MemoryInterfaceHandle},
};
use tokio::sync::mpsc::Sender;

fn base_config(extra: &str) -> Arc<Config> {
    let config: Config = format!(
        r#"{{
            node: {{ listen: "127.0.0.1:0" }},
            security: {{ "allow-generated-identity": true }},
            {extra}
        }}"#,
    )
    .parse()
    .unwrap();

    Arc::new(config)
}

fn config_with_contacts(contacts: &[std::net::SocketAddr], extra: &str) -> Arc<Config> {
    let contacts = contacts
        .iter()
        .map(|addr| format!("\"{}\"", addr))
        .collect::<Vec<_>>()
        .join(", ");

    let config: Config = format!(
        r#"{{
            node: {{ listen: "127.0.0.1:0", contacts: [{contacts}] }},
            security: {{ "allow-generated-identity": true }},
            {extra}
        }}"#,
    )
    .parse()
    .unwrap();

    Arc::new(config)
}

async fn wait_established(handle: &NodeHandle, peers: usize) {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if handle.service.manager().established_peers().len() >= peers {
                break;
            }

            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .expect("sessions did not establish in time");
}

fn frame(destination: [u8; 6], source: [u8; 6], payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::new();
    frame.extend_from_slice(&destination);
    frame.extend_from_slice(&source);
    frame.extend_from_slice(&0x0800u16.to_be_bytes());
    frame.extend_from_slice(payload);
    frame.resize(frame.len().max(60), 0);

    frame
}

async fn expect_frame(handle: &mut MemoryInterfaceHandle) -> Vec<u8> {
    tokio::time::timeout(Duration::from_secs(5), handle.written.recv())
        .await
        .expect("no frame arrived in time")
        .expect("interface closed")
}

async fn expect_no_frame(handle: &mut MemoryInterfaceHandle) {
    let result = tokio::time::timeout(Duration::from_millis(500), handle.written.recv()).await;
    assert!(result.is_err(), "unexpected frame arrived");
}

/// Port registration trails session establishment by one event-loop turn,
/// so first frames may be dropped; inject until one comes through.
async fn inject_until_received(
    inject: &Sender<Vec<u8>>,
    frame: &[u8],
    receiver: &mut MemoryInterfaceHandle,
) -> Vec<u8> {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            inject.send(frame.to_vec()).await.unwrap();

            match tokio::time::timeout(Duration::from_millis(250), receiver.written.recv()).await
            {
                Ok(Some(received)) => break received,
                _ => continue,
            }
        }
    })
    .await
    .expect("frame was never relayed")
}

/// Discard whatever is still queued towards the device.
async fn settle(handle: &mut MemoryInterfaceHandle) {
    tokio::time::sleep(Duration::from_millis(300)).await;
    while handle.written.try_recv().is_ok() {}
}

#[tokio::test]
async fn two_nodes_establish_over_loopback() {
    let a = startup(base_config(""), None).await.unwrap();
    let b = startup(config_with_contacts(&[a.local_addr()], ""), None)
        .await
        .unwrap();

    wait_established(&a, 1).await;
    wait_established(&b, 1).await;

    assert_eq!(a.service.manager().established_peers()[0], b.local_addr());
    assert_eq!(b.service.manager().established_peers()[0], a.local_addr());
}

#[tokio::test]
async fn switch_mode_floods_broadcasts_and_narrows_unicast() {
    const MAC_A: [u8; 6] = [0x02, 0, 0, 0, 0, 0x0A];
    const MAC_B: [u8; 6] = [0x02, 0, 0, 0, 0, 0x0B];
    const BROADCAST: [u8; 6] = [0xFF; 6];

    let (tap_a, mut handle_a) = MemoryInterface::new();
    let (tap_b, mut handle_b) = MemoryInterface::new();
    let (tap_c, mut handle_c) = MemoryInterface::new();

    let a = startup(base_config(""), Some(Box::new(tap_a))).await.unwrap();
    let b = startup(
        config_with_contacts(&[a.local_addr()], ""),
        Some(Box::new(tap_b)),
    )
    .await
    .unwrap();
    let c = startup(
        config_with_contacts(&[a.local_addr()], ""),
        Some(Box::new(tap_c)),
    )
    .await
    .unwrap();

    wait_established(&a, 2).await;
    wait_established(&b, 1).await;
    wait_established(&c, 1).await;

    // A broadcast from A's interface reaches both B and C.
    let received = inject_until_received(
        &handle_a.inject,
        &frame(BROADCAST, MAC_A, b"hello lan"),
        &mut handle_b,
    )
    .await;
    assert_eq!(&received[6..12], &MAC_A);
    expect_frame(&mut handle_c).await;

    settle(&mut handle_b).await;
    settle(&mut handle_c).await;

    // B speaks once so A learns where MAC_B lives...
    inject_until_received(
        &handle_b.inject,
        &frame(BROADCAST, MAC_B, b"hello back"),
        &mut handle_a,
    )
    .await;

    settle(&mut handle_a).await;
    settle(&mut handle_c).await;

    // ...then a unicast from A to MAC_B reaches only B.
    handle_a
        .inject
        .send(frame(MAC_B, MAC_A, b"just for b"))
        .await
        .unwrap();

    let unicast = expect_frame(&mut handle_b).await;
    assert_eq!(&unicast[..6], &MAC_B);
    expect_no_frame(&mut handle_c).await;

    drop(b);
    drop(c);
}

#[tokio::test]
async fn router_mode_forwards_along_announced_routes() {
    // A is a TUN router announcing 192.168.1.0/24; B accepts any route.
    let (tap_a, mut handle_a) = MemoryInterface::new();
    let (tap_b, mut handle_b) = MemoryInterface::new();

    let a = startup(
        base_config(
            r#"relay: { mode: "router" },
               tap: { ipv4: "172.16.0.1/24" },
               routes: { "local-ip-routes": ["192.168.1.0/24"] },"#,
        ),
        Some(Box::new(tap_a)),
    )
    .await
    .unwrap();

    let b = startup(
        config_with_contacts(
            &[a.local_addr()],
            r#"relay: { mode: "router" },
               tap: { ipv4: "172.16.0.2/24" },
               routes: { "accept-routes": "any" },"#,
        ),
        Some(Box::new(tap_b)),
    )
    .await
    .unwrap();

    wait_established(&a, 1).await;
    wait_established(&b, 1).await;

    // An IPv4 packet to 192.168.1.5 injected at B's interface must come
    // out of A's interface once the routes announcement has landed.
    let mut packet = vec![0u8; 28];
    packet[0] = 0x45;
    packet[2..4].copy_from_slice(&28u16.to_be_bytes());
    packet[16..20].copy_from_slice(&[192, 168, 1, 5]);

    let forwarded = inject_until_received(&handle_b.inject, &packet, &mut handle_a).await;
    assert_eq!(&forwarded[16..20], &[192, 168, 1, 5]);

    settle(&mut handle_a).await;
    settle(&mut handle_b).await;

    // No route matches the opposite direction: a packet to an unknown
    // destination goes nowhere.
    let mut unroutable = packet.clone();
    unroutable[16..20].copy_from_slice(&[8, 8, 8, 8]);
    handle_a.inject.send(unroutable).await.unwrap();
    expect_no_frame(&mut handle_b).await;

    drop(a);
}
