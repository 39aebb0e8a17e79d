//! Integration tests for the direct side-channel: handshake, re-injection
//! under the `Direct` pseudo-header, and announced teardown.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use relay_mesh::core::header::PacketHeader;
use relay_mesh::{Dispatcher, MeshConfig, ParsedPacket, Peer, PeerDirectory, RoleContext};
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn node(config: &MeshConfig, local_id: i32, remote_id: i32) -> (Arc<RoleContext>, Arc<Peer>) {
    let directory = PeerDirectory::new();
    let local = Peer::new(local_id, format!("node-{local_id}"));
    directory.set_local_peer(local);
    let remote = Peer::new(remote_id, format!("node-{remote_id}"));
    directory.register_with_addr(remote.clone(), IpAddr::from([127, 0, 0, 1]));
    let ctx = RoleContext::new(directory, Arc::new(Dispatcher::new()), config.clone());
    (ctx, remote)
}

async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn whisper_rides_the_side_channel_and_teardown_is_announced() {
    let config = MeshConfig::default_with_overrides(|c| {
        c.network.base_port = 26300;
    });

    // a sees b, b sees a; each side holds its own peer objects.
    let (ctx_a, b_as_seen_by_a) = node(&config, 1337, 1338);
    let (ctx_b, a_as_seen_by_b) = node(&config, 1338, 1337);

    let whispers = Arc::new(Mutex::new(Vec::new()));
    {
        let whispers = whispers.clone();
        ctx_b.dispatcher
            .register(PacketHeader::Direct, 3, "test", "whispers", move |from, p| {
                if let ParsedPacket::Direct(inner) = p {
                    if let ParsedPacket::Whisper { message } = inner.as_ref() {
                        let sender = from.map_or(-1, |peer| peer.id());
                        whispers.lock().unwrap().push((sender, message.clone()));
                    }
                }
            })
            .unwrap();
    }

    // b listens, a dials and announces its id.
    let acceptor = ctx_b.start_direct_acceptor().await.unwrap();
    ctx_a.ensure_direct_connection(&b_as_seen_by_a).await.unwrap();
    assert!(ctx_a.has_direct_connection(&b_as_seen_by_a));

    // Redialing an existing link is a no-op.
    ctx_a.ensure_direct_connection(&b_as_seen_by_a).await.unwrap();

    assert!(
        eventually(|| ctx_b.has_direct_connection(&a_as_seen_by_b)).await,
        "acceptor never registered the inbound link"
    );

    ctx_a.send_directly(
        &b_as_seen_by_a,
        &ParsedPacket::Whisper {
            message: "quiet word".into(),
        },
    )
    .unwrap();

    assert!(
        eventually(|| !whispers.lock().unwrap().is_empty()).await,
        "whisper never re-injected"
    );
    assert_eq!(
        whispers.lock().unwrap().as_slice(),
        [(1337, "quiet word".to_string())]
    );

    // Teardown: the destroyer forgets the link at once, the remote monitor
    // unwinds on the announcement.
    ctx_a.destroy_unnecessary_connection(&b_as_seen_by_a).await.unwrap();
    assert!(!ctx_a.has_direct_connection(&b_as_seen_by_a));
    assert!(
        eventually(|| !ctx_b.has_direct_connection(&a_as_seen_by_b)).await,
        "remote never observed the teardown"
    );

    // Destroying a link that is already gone is not an error.
    ctx_a.destroy_unnecessary_connection(&b_as_seen_by_a).await.unwrap();
    acceptor.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unknown_announced_id_is_rejected() {
    let config = MeshConfig::default_with_overrides(|c| {
        c.network.base_port = 26400;
    });

    let (ctx_a, b_as_seen_by_a) = node(&config, 1337, 1338);

    // b's directory has no entry for id 1337, and the fallback policy is
    // off by default, so the inbound link must not be registered.
    let directory = PeerDirectory::new();
    directory.set_local_peer(Peer::new(1338, "b"));
    let ctx_b = RoleContext::new(directory, Arc::new(Dispatcher::new()), config);
    let acceptor = ctx_b.start_direct_acceptor().await.unwrap();

    ctx_a.ensure_direct_connection(&b_as_seen_by_a).await.unwrap();

    // b drops the rejected stream; a's monitor observes the close and
    // forgets the link.
    assert!(
        eventually(|| !ctx_a.has_direct_connection(&b_as_seen_by_a)).await,
        "rejected link lingered on the dialing side"
    );

    acceptor.shutdown().await;
}

#[test]
fn send_without_a_link_is_an_error() {
    let config = MeshConfig::default();
    let directory = PeerDirectory::new();
    directory.set_local_peer(Peer::new(1337, "a"));
    let stranger = Peer::new(1338, "b");
    directory.register_with_addr(stranger.clone(), IpAddr::from([127, 0, 0, 1]));
    let ctx = RoleContext::new(directory, Arc::new(Dispatcher::new()), config);

    let result = ctx.send_directly(&stranger, &ParsedPacket::DestroyingChannel);
    assert!(matches!(
        result,
        Err(relay_mesh::MeshError::NoDirectChannel(1338))
    ));
}
