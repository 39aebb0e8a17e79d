//! Lobby joining.
//!
//! A joiner dials the host's rendezvous port, announces itself with a
//! `Connect` frame, and from then on mirrors what the host relays: the
//! roster, readiness, settings, chat, the countdown, and finally the
//! topology handoff that moves everyone into the mesh.

use crate::config::MeshConfig;
use crate::core::header::{PacketHeader, RESERVED_ID};
use crate::core::packet::{AssignId, ParsedPacket, PeerAddr};
use crate::error::{MeshError, Result};
use crate::lobby::{mesh, ChatLine, LobbyState, Session, SessionSettings};
use crate::peer::Peer;
use crate::protocol::Dispatcher;
use crate::relay::RoleProvider;
use crate::transport::channel::{next_frame, Channel};
use crate::utils::{lock, time};
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const OWNER: &str = "lobby-join";

struct JoinState {
    phase: LobbyState,
    local: Arc<Peer>,
    /// Remote members in announcement order; the host is always first.
    roster: Vec<(Arc<Peer>, IpAddr)>,
    settings: SessionSettings,
    chat: Vec<ChatLine>,
    countdown_remaining: Option<i32>,
    host_gone: bool,
}

impl JoinState {
    fn peer_by_id(&self, id: i32) -> Option<Arc<Peer>> {
        self.roster
            .iter()
            .map(|(p, _)| p)
            .find(|p| p.id() == id)
            .cloned()
    }
}

struct JoinShared {
    config: MeshConfig,
    dispatcher: Arc<Dispatcher>,
    channel: Arc<Channel>,
    host_addr: IpAddr,
    stop: watch::Sender<bool>,
    state: Mutex<JoinState>,
    netinfo_tx: Mutex<Option<oneshot::Sender<Vec<(Arc<Peer>, IpAddr)>>>>,
}

impl JoinShared {
    fn on_connect(&self, id: Option<i32>, ready: bool, name: &str) {
        let Some(id) = id else {
            // Only the host assigns ids; a bare announce is never relayed.
            return;
        };
        let mut state = lock(&self.state);
        if id == state.local.id() {
            return;
        }
        match state.peer_by_id(id) {
            Some(peer) => {
                peer.set_ready(ready);
                peer.set_name(name);
            }
            None => {
                let peer = Peer::new(id, name);
                peer.set_ready(ready);
                // Addresses other than the host's are unknown until the
                // topology handoff names them.
                state.roster.push((peer, self.host_addr));
                debug!(peer = id, name, "roster entry added");
            }
        }
    }

    fn on_assign_id(&self, assign: AssignId) {
        let AssignId::Assign { id, target } = assign else {
            return;
        };
        let state = lock(&self.state);
        // Aimed at this peer when the target names its current id; a
        // partial peer still carries the reserved sentinel, which is what
        // the host targets when no wish was made.
        if target == state.local.id() {
            info!(id, "wire id assigned");
            state.local.set_id(id);
        }
    }

    fn on_disconnect(&self, origin: Option<Arc<Peer>>, reason: &str) {
        let mut state = lock(&self.state);
        match origin {
            Some(peer) => {
                let was_host = state
                    .roster
                    .first()
                    .is_some_and(|(host, _)| host.token() == peer.token());
                state.roster.retain(|(p, _)| p.token() != peer.token());
                if was_host {
                    warn!(reason, "host left, lobby is dead");
                    state.host_gone = true;
                    self.channel.close();
                } else {
                    info!(peer = peer.id(), reason, "member left");
                }
            }
            None => debug!(reason, "disconnect for unknown peer"),
        }
    }

    fn on_send_net_info(&self, peers: &[PeerAddr]) {
        let roster = {
            let mut state = lock(&self.state);
            state.phase = LobbyState::HandingOff;
            let local_id = state.local.id();
            let mut roster = Vec::new();
            for entry in peers {
                if entry.id == local_id {
                    continue;
                }
                let peer = state
                    .peer_by_id(entry.id)
                    .unwrap_or_else(|| Peer::new(entry.id, format!("peer-{}", entry.id)));
                roster.push((peer, entry.addr));
            }
            roster
        };
        info!(members = roster.len(), "topology received");
        if let Some(tx) = lock(&self.netinfo_tx).take() {
            let _ = tx.send(roster);
        }
    }
}

/// A lobby this process has joined.
pub struct JoinedLobby {
    shared: Arc<JoinShared>,
    read_task: JoinHandle<()>,
    netinfo_rx: oneshot::Receiver<Vec<(Arc<Peer>, IpAddr)>>,
}

impl JoinedLobby {
    /// Dial the host and announce. `wanted_id` is a wish the host may
    /// override; `None` asks for a suggestion.
    pub async fn connect(
        config: MeshConfig,
        host: SocketAddr,
        name: &str,
        wanted_id: Option<i32>,
    ) -> Result<JoinedLobby> {
        config.validate_strict()?;
        let stream = tokio::time::timeout(config.lobby.connect_timeout, TcpStream::connect(host))
            .await
            .map_err(|_| MeshError::Timeout("lobby connect"))??;
        let channel = Channel::spawn(stream)?;
        info!(%host, name, "joined rendezvous");

        let local = Peer::partial();
        local.set_name(name);
        if let Some(id) = wanted_id {
            local.set_id(id);
        }
        let (stop, _) = watch::channel(false);
        let (netinfo_tx, netinfo_rx) = oneshot::channel();
        let shared = Arc::new(JoinShared {
            dispatcher: Arc::new(Dispatcher::new()),
            channel: channel.clone(),
            host_addr: host.ip(),
            stop,
            state: Mutex::new(JoinState {
                phase: LobbyState::Open,
                local: local.clone(),
                roster: Vec::new(),
                settings: SessionSettings::default(),
                chat: Vec::new(),
                countdown_remaining: None,
                host_gone: false,
            }),
            netinfo_tx: Mutex::new(Some(netinfo_tx)),
            config,
        });
        register_handlers(&shared)?;

        let announce = ParsedPacket::Connect {
            id: wanted_id,
            ready: false,
            name: name.to_string(),
        };
        channel.send_packet(wanted_id.unwrap_or(RESERVED_ID), &announce)?;

        let read_task = spawn_read_loop(shared.clone());
        Ok(JoinedLobby {
            shared,
            read_task,
            netinfo_rx,
        })
    }

    pub fn state(&self) -> LobbyState {
        lock(&self.shared.state).phase
    }

    pub fn local_peer(&self) -> Arc<Peer> {
        lock(&self.shared.state).local.clone()
    }

    /// Remote members as announced by the host, host first.
    pub fn members(&self) -> Vec<Arc<Peer>> {
        lock(&self.shared.state)
            .roster
            .iter()
            .map(|(p, _)| p.clone())
            .collect()
    }

    pub fn settings(&self) -> SessionSettings {
        lock(&self.shared.state).settings.clone()
    }

    pub fn chat_log(&self) -> Vec<ChatLine> {
        lock(&self.shared.state).chat.clone()
    }

    /// Seconds left on the countdown, when one is running.
    pub fn countdown_remaining(&self) -> Option<i32> {
        lock(&self.shared.state).countdown_remaining
    }

    pub fn set_ready(&self, ready: bool) -> Result<()> {
        let state = lock(&self.shared.state);
        state.local.set_ready(ready);
        self.shared
            .channel
            .send_packet(state.local.id(), &ParsedPacket::SetReady { ready })
    }

    pub fn chat(&self, message: &str) -> Result<()> {
        let mut state = lock(&self.shared.state);
        let author = state.local.name();
        state.chat.push(ChatLine {
            author,
            message: message.to_string(),
        });
        self.shared.channel.send_packet(
            state.local.id(),
            &ParsedPacket::Chat {
                message: message.to_string(),
            },
        )
    }

    pub fn change_name(&self, name: &str) -> Result<()> {
        let state = lock(&self.shared.state);
        state.local.set_name(name);
        self.shared.channel.send_packet(
            state.local.id(),
            &ParsedPacket::ChangeName {
                name: name.to_string(),
            },
        )
    }

    pub fn update_settings(&self, settings: SessionSettings) -> Result<()> {
        let payload = settings.to_bytes()?;
        let mut state = lock(&self.shared.state);
        state.settings = settings;
        self.shared
            .channel
            .send_packet(state.local.id(), &ParsedPacket::UpdateSettings { payload })
    }

    /// Measure the rendezvous round trip. The reply lands in the debug log.
    pub fn ping(&self) -> Result<()> {
        let state = lock(&self.shared.state);
        self.shared.channel.send_packet(
            state.local.id(),
            &ParsedPacket::Ping {
                sent_at_nanos: time::now_nanos(),
            },
        )
    }

    /// Leave the lobby gracefully.
    pub async fn leave(self, reason: &str) {
        {
            let state = lock(&self.shared.state);
            let _ = self.shared.channel.send_packet(
                state.local.id(),
                &ParsedPacket::Disconnect {
                    reason: reason.to_string(),
                },
            );
        }
        self.teardown().await;
    }

    /// Wait for the topology handoff, then establish the mesh and build
    /// the session. Consumes the lobby.
    pub async fn wait_session(mut self, provider: Arc<dyn RoleProvider>) -> Result<Session> {
        let roster = (&mut self.netinfo_rx)
            .await
            .map_err(|_| MeshError::ConnectionClosed)?;
        let local = lock(&self.shared.state).local.clone();
        let config = self.shared.config.clone();
        self.teardown().await;
        let links = mesh::establish(&config, local.id(), roster).await?;
        Session::from_mesh(&config, local, links, provider).await
    }

    async fn teardown(self) {
        let _ = self.shared.stop.send(true);
        let _ = self.read_task.await;
        self.shared.dispatcher.unregister_owner(OWNER);
        self.shared.channel.close();
    }
}

fn spawn_read_loop(shared: Arc<JoinShared>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let Some(mut reader) = shared.channel.take_reader() else {
            warn!("rendezvous reader already taken");
            return;
        };
        let mut stopping = shared.stop.subscribe();
        loop {
            tokio::select! {
                changed = stopping.changed() => {
                    if changed.is_err() || *stopping.borrow() {
                        break;
                    }
                }
                frame = next_frame(&mut reader) => match frame {
                    Ok(Some(frame)) => {
                        let origin = lock(&shared.state).peer_by_id(frame.sender_id);
                        shared.dispatcher.dispatch(origin.as_ref(), &frame.packet);
                    }
                    Ok(None) => {
                        let mut state = lock(&shared.state);
                        if !state.host_gone {
                            warn!("rendezvous stream closed by host");
                            state.host_gone = true;
                        }
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "rendezvous stream poisoned");
                        break;
                    }
                },
            }
        }
    })
}

fn register_handlers(shared: &Arc<JoinShared>) -> Result<()> {
    let dispatcher = shared.dispatcher.clone();

    let s = shared.clone();
    dispatcher.register(PacketHeader::Connect, 3, OWNER, "roster", move |_, p| {
        if let ParsedPacket::Connect { id, ready, name } = p {
            s.on_connect(*id, *ready, name);
        }
    })?;

    let s = shared.clone();
    dispatcher.register(PacketHeader::AssignId, 3, OWNER, "assign", move |_, p| {
        if let ParsedPacket::AssignId(assign) = p {
            s.on_assign_id(*assign);
        }
    })?;

    dispatcher.register(PacketHeader::SetReady, 3, OWNER, "ready", |from, p| {
        if let (Some(peer), ParsedPacket::SetReady { ready }) = (from, p) {
            peer.set_ready(*ready);
        }
    })?;

    dispatcher.register(PacketHeader::ChangeName, 3, OWNER, "rename", |from, p| {
        if let (Some(peer), ParsedPacket::ChangeName { name }) = (from, p) {
            peer.set_name(name.as_str());
        }
    })?;

    let s = shared.clone();
    dispatcher.register(PacketHeader::Chat, 3, OWNER, "chat", move |from, p| {
        if let ParsedPacket::Chat { message } = p {
            let author = from.map_or_else(|| "?".to_string(), |peer| peer.name());
            lock(&s.state).chat.push(ChatLine {
                author,
                message: message.clone(),
            });
        }
    })?;

    let s = shared.clone();
    dispatcher.register(
        PacketHeader::UpdateSettings,
        3,
        OWNER,
        "settings",
        move |_, p| {
            if let ParsedPacket::UpdateSettings { payload } = p {
                match SessionSettings::from_bytes(payload) {
                    Ok(settings) => lock(&s.state).settings = settings,
                    Err(e) => warn!(error = %e, "undecodable settings dropped"),
                }
            }
        },
    )?;

    let s = shared.clone();
    dispatcher.register(
        PacketHeader::BeginCountdown,
        3,
        OWNER,
        "begin",
        move |_, _| {
            let mut state = lock(&s.state);
            state.phase = LobbyState::Counting;
            state.countdown_remaining = Some(s.config.lobby.countdown_secs as i32);
        },
    )?;

    let s = shared.clone();
    dispatcher.register(PacketHeader::SyncCountdown, 3, OWNER, "sync", move |_, p| {
        if let ParsedPacket::SyncCountdown { remaining_secs } = p {
            let mut state = lock(&s.state);
            state.phase = LobbyState::Counting;
            state.countdown_remaining = Some(*remaining_secs);
        }
    })?;

    let s = shared.clone();
    dispatcher.register(
        PacketHeader::InterruptReady,
        3,
        OWNER,
        "interrupt",
        move |_, _| {
            let mut state = lock(&s.state);
            if state.phase == LobbyState::Counting {
                state.phase = LobbyState::ReadyCheck;
            }
            state.countdown_remaining = None;
        },
    )?;

    let s = shared.clone();
    dispatcher.register(
        PacketHeader::Disconnect,
        3,
        OWNER,
        "disconnect",
        move |from, p| {
            if let ParsedPacket::Disconnect { reason } = p {
                s.on_disconnect(from.cloned(), reason);
            }
        },
    )?;

    let s = shared.clone();
    dispatcher.register(
        PacketHeader::SendNetInfo,
        3,
        OWNER,
        "topology",
        move |_, p| {
            if let ParsedPacket::SendNetInfo { peers } = p {
                s.on_send_net_info(peers);
            }
        },
    )?;

    let s = shared.clone();
    dispatcher.register(PacketHeader::Ping, 3, OWNER, "ping", move |_, p| {
        if let ParsedPacket::Ping { sent_at_nanos } = p {
            let sender = lock(&s.state).local.id();
            let _ = s.channel.send_packet(
                sender,
                &ParsedPacket::ReturnPing {
                    sent_at_nanos: *sent_at_nanos,
                },
            );
        }
    })?;

    dispatcher.register(PacketHeader::ReturnPing, 3, OWNER, "pong", |_, p| {
        if let ParsedPacket::ReturnPing { sent_at_nanos } = p {
            let rtt = time::now_nanos().saturating_sub(*sent_at_nanos);
            debug!(rtt_nanos = rtt, "rendezvous round trip");
        }
    })?;

    dispatcher.register(PacketHeader::Error, 3, OWNER, "error", |_, p| {
        if let ParsedPacket::Error { message } = p {
            warn!(error = %message, "error frame from host");
        }
    })?;

    Ok(())
}
