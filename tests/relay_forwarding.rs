//! Integration tests for the broadcast hub: frames from one leaf must reach
//! every other leaf byte-for-byte and must never echo back to their origin.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use relay_mesh::core::header::PacketHeader;
use relay_mesh::relay::RelayRole;
use relay_mesh::transport::channel::next_frame;
use relay_mesh::transport::Channel;
use relay_mesh::{
    encode_frame, BroadcastRole, Dispatcher, MeshConfig, ParsedPacket, Peer, PeerDirectory,
    RoleContext,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};

async fn tcp_pair(listener: &TcpListener) -> (TcpStream, TcpStream) {
    let addr = listener.local_addr().unwrap();
    let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
    (client.unwrap(), accepted.unwrap().0)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn hub_forwards_verbatim_and_never_echoes() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let (mut b_end, hub_to_b) = tcp_pair(&listener).await;
    let (c_end, hub_to_c) = tcp_pair(&listener).await;

    let config = MeshConfig::default_with_overrides(|c| {
        c.network.base_port = 26100;
    });
    let directory = PeerDirectory::new();
    let dispatcher = Arc::new(Dispatcher::new());

    let hub = Peer::new(1337, "hub");
    let b = Peer::new(1338, "b");
    let c = Peer::new(1339, "c");
    directory.set_local_peer(hub.clone());
    directory.register_with_channel(b.clone(), Channel::spawn(hub_to_b).unwrap());
    directory.register_with_channel(c.clone(), Channel::spawn(hub_to_c).unwrap());
    directory
        .set_connected_with(&hub, vec![b.clone(), c.clone()])
        .unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    {
        let seen = seen.clone();
        dispatcher
            .register(PacketHeader::Chat, 10, "test", "observer", move |_, p| {
                if let ParsedPacket::Chat { message } = p {
                    seen.lock().unwrap().push(message.clone());
                }
            })
            .unwrap();
    }

    let ctx = RoleContext::new(directory.clone(), dispatcher, config);
    let role = BroadcastRole::new();
    role.activate(ctx.clone()).await.unwrap();

    let sent = encode_frame(
        1338,
        &ParsedPacket::Chat {
            message: "from b".into(),
        },
    )
    .unwrap();
    b_end.write_all(&sent).await.unwrap();

    // C receives the exact bytes B put on the wire, sender id intact.
    let c_channel = Channel::spawn(c_end).unwrap();
    let mut c_reader = c_channel.take_reader().unwrap();
    let forwarded = tokio::time::timeout(Duration::from_secs(2), next_frame(&mut c_reader))
        .await
        .expect("forwarded frame must arrive")
        .unwrap()
        .expect("stream open");
    assert_eq!(forwarded.sender_id, 1338);
    assert_eq!(forwarded.raw, sent);

    // The hub also dispatched the packet locally.
    assert_eq!(seen.lock().unwrap().as_slice(), ["from b".to_string()]);

    // Nothing comes back to B.
    let mut echo = [0u8; 1];
    let echoed = tokio::time::timeout(Duration::from_millis(300), b_end.read(&mut echo)).await;
    assert!(echoed.is_err(), "hub echoed a frame to its origin");

    // Deactivation hands the parked readers back.
    role.deactivate().await.unwrap();
    let b_channel = directory.channel_of(&b).unwrap();
    assert!(b_channel.take_reader().is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn send_data_honors_the_except_list() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let (b_end, hub_to_b) = tcp_pair(&listener).await;
    let (mut c_end, hub_to_c) = tcp_pair(&listener).await;

    let config = MeshConfig::default_with_overrides(|c| {
        c.network.base_port = 26150;
    });
    let directory = PeerDirectory::new();
    let hub = Peer::new(1337, "hub");
    let b = Peer::new(1338, "b");
    let c = Peer::new(1339, "c");
    directory.set_local_peer(hub.clone());
    directory.register_with_channel(b.clone(), Channel::spawn(hub_to_b).unwrap());
    directory.register_with_channel(c.clone(), Channel::spawn(hub_to_c).unwrap());
    directory
        .set_connected_with(&hub, vec![b.clone(), c.clone()])
        .unwrap();

    let ctx = RoleContext::new(directory, Arc::new(Dispatcher::new()), config);
    let role = BroadcastRole::new();
    role.activate(ctx.clone()).await.unwrap();

    let frame = encode_frame(1337, &ParsedPacket::BeginCountdown).unwrap();
    role.send_data(frame.clone(), &[c.clone()]).unwrap();

    let b_channel = Channel::spawn(b_end).unwrap();
    let mut b_reader = b_channel.take_reader().unwrap();
    let received = tokio::time::timeout(Duration::from_secs(2), next_frame(&mut b_reader))
        .await
        .expect("frame for b")
        .unwrap()
        .expect("stream open");
    assert_eq!(received.raw, frame);

    let mut byte = [0u8; 1];
    let nothing = tokio::time::timeout(Duration::from_millis(300), c_end.read(&mut byte)).await;
    assert!(nothing.is_err(), "excepted peer still received the frame");

    role.deactivate().await.unwrap();
}
