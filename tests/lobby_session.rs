//! End-to-end lobby test: host and joiner negotiate ids, exchange chat,
//! ready up, ride the countdown into the mesh, and talk through their
//! relay roles in the resulting session.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use relay_mesh::core::header::PacketHeader;
use relay_mesh::{
    HostedLobby, JoinedLobby, LobbyState, MeshConfig, ParsedPacket, RoleRegistry, SessionSettings,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;

async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..250 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn two_node_lobby_becomes_a_session() {
    let config = MeshConfig::default_with_overrides(|c| {
        c.network.base_port = 26700;
        c.lobby.countdown_secs = 0;
    });

    let host = HostedLobby::open(config.clone(), "host").await.unwrap();
    assert_eq!(host.local_peer().id(), 1337);
    assert_eq!(host.state(), LobbyState::Open);

    let joiner = JoinedLobby::connect(
        config.clone(),
        "127.0.0.1:26700".parse().unwrap(),
        "alice",
        None,
    )
    .await
    .unwrap();

    // First joiner is suggested the id right above the host's.
    assert!(
        eventually(|| joiner.local_peer().id() == 1338).await,
        "joiner never received an id"
    );
    // The joiner's roster names the host, the host's roster names the joiner.
    assert!(
        eventually(|| joiner.members().iter().any(|p| p.id() == 1337)).await,
        "joiner never learned about the host"
    );
    assert!(
        eventually(|| host.members().iter().any(|p| p.id() == 1338)).await,
        "host never settled the joiner"
    );

    // Lobby traffic flows both ways through the host.
    joiner.chat("hello host").unwrap();
    assert!(
        eventually(|| host.chat_log().iter().any(|l| l.message == "hello host")).await,
        "host never received the chat line"
    );
    host.chat("hello alice");
    assert!(
        eventually(|| joiner.chat_log().iter().any(|l| l.message == "hello alice")).await,
        "joiner never received the chat line"
    );

    let mut settings = SessionSettings::default();
    settings.entries.insert("mode".into(), "duel".into());
    host.update_settings(settings.clone()).unwrap();
    assert!(
        eventually(|| joiner.settings() == settings).await,
        "settings never propagated"
    );

    // Ready-up. The countdown starts only when everyone is ready.
    joiner.set_ready(true).unwrap();
    assert!(
        eventually(|| {
            host.members()
                .iter()
                .find(|p| p.id() == 1338)
                .is_some_and(|p| p.is_ready())
        })
        .await,
        "host never saw the joiner ready"
    );
    assert_eq!(host.state(), LobbyState::ReadyCheck);
    host.set_ready(true);

    let provider = Arc::new(RoleRegistry::builtin());
    let host_session = tokio::spawn(host.wait_session(provider.clone()));
    let join_session = tokio::spawn(joiner.wait_session(provider));

    let host_session = tokio::time::timeout(Duration::from_secs(15), host_session)
        .await
        .expect("host handoff timed out")
        .unwrap()
        .unwrap();
    let join_session = tokio::time::timeout(Duration::from_secs(15), join_session)
        .await
        .expect("joiner handoff timed out")
        .unwrap()
        .unwrap();

    // The init-id holder hubs the session, everyone else leafs.
    let host_local = host_session.local_peer().unwrap();
    assert_eq!(host_local.id(), 1337);
    assert_eq!(
        host_session
            .directory()
            .relay_role_of(&host_local)
            .map(|r| r.name().to_string()),
        Some("broadcast".to_string())
    );
    let join_local = join_session.local_peer().unwrap();
    assert_eq!(join_local.id(), 1338);
    assert_eq!(
        join_session
            .directory()
            .relay_role_of(&join_local)
            .map(|r| r.name().to_string()),
        Some("listener".to_string())
    );

    // Session traffic flows through the relay roles.
    let seen = Arc::new(Mutex::new(Vec::new()));
    {
        let seen = seen.clone();
        join_session
            .dispatcher()
            .register(PacketHeader::Chat, 3, "test", "chat", move |_, p| {
                if let ParsedPacket::Chat { message } = p {
                    seen.lock().unwrap().push(message.clone());
                }
            })
            .unwrap();
    }
    host_session
        .send(
            &ParsedPacket::Chat {
                message: "post-handoff".into(),
            },
            &[],
        )
        .unwrap();
    assert!(
        eventually(|| seen.lock().unwrap().contains(&"post-handoff".to_string())).await,
        "session chat never arrived at the leaf"
    );

    join_session.shutdown().await.unwrap();
    host_session.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn going_unready_interrupts_the_countdown() {
    let config = MeshConfig::default_with_overrides(|c| {
        c.network.base_port = 26800;
        c.lobby.countdown_secs = 30;
    });

    let host = HostedLobby::open(config.clone(), "host").await.unwrap();
    let joiner = JoinedLobby::connect(
        config.clone(),
        "127.0.0.1:26800".parse().unwrap(),
        "bob",
        None,
    )
    .await
    .unwrap();
    assert!(eventually(|| joiner.local_peer().id() == 1338).await);

    joiner.set_ready(true).unwrap();
    assert!(
        eventually(|| {
            host.members()
                .iter()
                .find(|p| p.id() == 1338)
                .is_some_and(|p| p.is_ready())
        })
        .await
    );
    host.set_ready(true);
    assert_eq!(host.state(), LobbyState::Counting);
    assert!(
        eventually(|| joiner.state() == LobbyState::Counting).await,
        "joiner never saw the countdown begin"
    );

    joiner.set_ready(false).unwrap();
    assert!(
        eventually(|| host.state() == LobbyState::ReadyCheck).await,
        "countdown never interrupted"
    );
    assert!(
        eventually(|| joiner.countdown_remaining().is_none()).await,
        "joiner still thinks the countdown runs"
    );

    host.shutdown("closing").await;
    joiner.leave("bye").await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn wished_id_collision_is_corrected() {
    let config = MeshConfig::default_with_overrides(|c| {
        c.network.base_port = 26900;
    });

    let host = HostedLobby::open(config.clone(), "host").await.unwrap();

    // Wishing for the host's own id cannot be honored.
    let joiner = JoinedLobby::connect(
        config.clone(),
        "127.0.0.1:26900".parse().unwrap(),
        "greedy",
        Some(1337),
    )
    .await
    .unwrap();

    assert!(
        eventually(|| {
            let id = joiner.local_peer().id();
            id != 1337 && id != relay_mesh::RESERVED_ID
        })
        .await,
        "collision never corrected"
    );
    assert_eq!(joiner.local_peer().id(), 1338);

    host.shutdown("done").await;
    joiner.leave("done").await;
}
