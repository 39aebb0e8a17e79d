//! Lobby hosting.
//!
//! The host binds the rendezvous port, accepts joiners, suggests wire ids,
//! relays lobby traffic between members, and owns the countdown. Once the
//! countdown reaches zero the topology is announced with `SendNetInfo` and
//! the lobby hands off to mesh establishment.

use crate::config::MeshConfig;
use crate::core::header::{PacketHeader, RESERVED_ID};
use crate::core::packet::{AssignId, ParsedPacket, PeerAddr};
use crate::error::{constants, MeshError, Result};
use crate::lobby::{mesh, ChatLine, LobbyState, Session, SessionSettings};
use crate::peer::Peer;
use crate::protocol::Dispatcher;
use crate::relay::RoleProvider;
use crate::transport::channel::{next_frame, Channel};
use crate::utils::lock;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const OWNER: &str = "lobby-host";

struct Member {
    peer: Arc<Peer>,
    channel: Arc<Channel>,
    addr: IpAddr,
}

struct HostState {
    phase: LobbyState,
    local: Arc<Peer>,
    members: Vec<Member>,
    settings: SessionSettings,
    chat: Vec<ChatLine>,
    next_id: i32,
    countdown: Option<JoinHandle<()>>,
}

impl HostState {
    fn member_of(&self, peer: &Arc<Peer>) -> Option<&Member> {
        self.members
            .iter()
            .find(|m| m.peer.token() == peer.token())
    }

    fn id_taken(&self, id: i32) -> bool {
        self.local.id() == id || self.members.iter().any(|m| !m.peer.is_partial() && m.peer.id() == id)
    }

    fn fresh_id(&mut self) -> i32 {
        loop {
            self.next_id += 1;
            if !self.id_taken(self.next_id) {
                return self.next_id;
            }
        }
    }

    fn all_ready(&self) -> bool {
        !self.members.is_empty()
            && self.local.is_ready()
            && self
                .members
                .iter()
                .all(|m| !m.peer.is_partial() && m.peer.is_ready())
    }

    fn settle_phase(&mut self) {
        if matches!(self.phase, LobbyState::HandingOff | LobbyState::Connected) {
            return;
        }
        let any_ready = self.local.is_ready() || self.members.iter().any(|m| m.peer.is_ready());
        self.phase = if any_ready {
            LobbyState::ReadyCheck
        } else {
            LobbyState::Open
        };
    }
}

struct HostShared {
    config: MeshConfig,
    dispatcher: Arc<Dispatcher>,
    stop: watch::Sender<bool>,
    state: Mutex<HostState>,
    reader_tasks: Mutex<Vec<JoinHandle<()>>>,
    handoff_tx: Mutex<Option<oneshot::Sender<Vec<(Arc<Peer>, IpAddr)>>>>,
}

impl HostShared {
    /// Send to every connected member, skipping `except_token`.
    fn relay(&self, state: &HostState, sender_id: i32, packet: &ParsedPacket, except_token: Option<u64>) {
        for member in &state.members {
            if Some(member.peer.token()) == except_token {
                continue;
            }
            if let Err(e) = member.channel.send_packet(sender_id, packet) {
                debug!(peer = member.peer.id(), error = %e, "lobby send failed");
            }
        }
    }

    fn on_connect(
        self: &Arc<Self>,
        from: Option<&Arc<Peer>>,
        wanted: Option<i32>,
        ready: bool,
        name: &str,
    ) {
        let Some(peer) = from else { return };
        let mut state = lock(&self.state);
        let Some(member) = state.member_of(peer) else {
            return;
        };
        let channel = member.channel.clone();
        peer.set_name(name);
        peer.set_ready(ready);

        // Roster snapshot for the newcomer: the host first, then every
        // settled member, each as a Connect frame under its own id.
        let local = state.local.clone();
        let roster = ParsedPacket::Connect {
            id: Some(local.id()),
            ready: local.is_ready(),
            name: local.name(),
        };
        if let Err(e) = channel.send_packet(local.id(), &roster) {
            debug!(error = %e, "roster send failed");
        }
        for other in &state.members {
            if other.peer.token() == peer.token() || other.peer.is_partial() {
                continue;
            }
            let entry = ParsedPacket::Connect {
                id: Some(other.peer.id()),
                ready: other.peer.is_ready(),
                name: other.peer.name(),
            };
            if let Err(e) = channel.send_packet(other.peer.id(), &entry) {
                debug!(error = %e, "roster send failed");
            }
        }
        if state.settings != SessionSettings::default() {
            match state.settings.to_bytes() {
                Ok(payload) => {
                    let packet = ParsedPacket::UpdateSettings { payload };
                    if let Err(e) = channel.send_packet(local.id(), &packet) {
                        debug!(error = %e, "settings send failed");
                    }
                }
                Err(e) => warn!(error = %e, "settings not serializable"),
            }
        }

        // Id negotiation: honor the wish when free, otherwise suggest a
        // fresh one, naming the wished-for id so the joiner knows it was
        // corrected.
        let assigned = match wanted {
            Some(id) if !state.id_taken(id) => id,
            _ => state.fresh_id(),
        };
        if wanted.is_some() && wanted != Some(assigned) {
            info!(wanted = wanted.unwrap_or(RESERVED_ID), assigned, "id collision corrected");
        }
        peer.set_id(assigned);
        let assignment = ParsedPacket::AssignId(AssignId::Assign {
            id: assigned,
            target: wanted.unwrap_or(RESERVED_ID),
        });
        if let Err(e) = channel.send_packet(local.id(), &assignment) {
            debug!(error = %e, "id assignment send failed");
        }

        info!(peer = assigned, name, "member joined");
        let announce = ParsedPacket::Connect {
            id: Some(assigned),
            ready,
            name: name.to_string(),
        };
        self.relay(&state, assigned, &announce, Some(peer.token()));

        // A fresh joiner is never ready; any running countdown is void.
        self.interrupt_locked(&mut state);
    }

    fn on_set_ready(self: &Arc<Self>, from: Option<&Arc<Peer>>, ready: bool) {
        let Some(peer) = from else { return };
        let mut state = lock(&self.state);
        if state.member_of(peer).is_none() {
            return;
        }
        peer.set_ready(ready);
        self.relay(
            &state,
            peer.id(),
            &ParsedPacket::SetReady { ready },
            Some(peer.token()),
        );
        self.after_ready_change(&mut state);
    }

    /// Countdown bookkeeping after any readiness transition.
    fn after_ready_change(self: &Arc<Self>, state: &mut HostState) {
        if state.all_ready() {
            if state.phase != LobbyState::Counting {
                self.begin_countdown_locked(state);
            }
        } else if state.phase == LobbyState::Counting {
            self.interrupt_locked(state);
        } else {
            state.settle_phase();
        }
    }

    fn begin_countdown_locked(self: &Arc<Self>, state: &mut HostState) {
        state.phase = LobbyState::Counting;
        let local_id = state.local.id();
        self.relay(state, local_id, &ParsedPacket::BeginCountdown, None);
        info!(secs = self.config.lobby.countdown_secs, "countdown started");

        let shared = self.clone();
        let total = self.config.lobby.countdown_secs as i32;
        state.countdown = Some(tokio::spawn(async move {
            let mut remaining = total;
            loop {
                {
                    // An interrupt may have landed while this tick waited
                    // for the lock; a stale tick must not resurrect the
                    // countdown on the members' side.
                    let state = lock(&shared.state);
                    if state.phase != LobbyState::Counting {
                        return;
                    }
                    shared.relay(
                        &state,
                        local_id,
                        &ParsedPacket::SyncCountdown {
                            remaining_secs: remaining,
                        },
                        None,
                    );
                }
                if remaining <= 0 {
                    shared.finish_countdown();
                    return;
                }
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                remaining -= 1;
            }
        }));
    }

    /// Abort a running countdown and tell everyone. A later restart gets
    /// the full duration again. No-op outside the counting phase.
    fn interrupt_locked(self: &Arc<Self>, state: &mut HostState) {
        if let Some(ticker) = state.countdown.take() {
            ticker.abort();
            info!("countdown interrupted");
            let local_id = state.local.id();
            self.relay(state, local_id, &ParsedPacket::InterruptReady, None);
        }
        state.settle_phase();
    }

    fn finish_countdown(self: &Arc<Self>) {
        let roster;
        {
            let mut state = lock(&self.state);
            if state.phase != LobbyState::Counting {
                return;
            }
            state.phase = LobbyState::HandingOff;
            state.countdown = None;

            let mut peers = vec![PeerAddr {
                id: state.local.id(),
                addr: self.config.network.advertise_addr,
            }];
            peers.extend(state.members.iter().map(|m| PeerAddr {
                id: m.peer.id(),
                addr: m.addr,
            }));
            let local_id = state.local.id();
            self.relay(&state, local_id, &ParsedPacket::SendNetInfo { peers }, None);

            roster = state
                .members
                .iter()
                .map(|m| (m.peer.clone(), m.addr))
                .collect::<Vec<_>>();
        }
        info!(members = roster.len(), "topology announced, handing off");
        if let Some(tx) = lock(&self.handoff_tx).take() {
            let _ = tx.send(roster);
        }
    }

    fn on_interrupt(self: &Arc<Self>, from: Option<&Arc<Peer>>) {
        let Some(peer) = from else { return };
        let mut state = lock(&self.state);
        if state.member_of(peer).is_none() {
            return;
        }
        self.interrupt_locked(&mut state);
    }

    fn on_chat(self: &Arc<Self>, from: Option<&Arc<Peer>>, message: &str) {
        let Some(peer) = from else { return };
        let mut state = lock(&self.state);
        if state.member_of(peer).is_none() {
            return;
        }
        state.chat.push(ChatLine {
            author: peer.name(),
            message: message.to_string(),
        });
        self.relay(
            &state,
            peer.id(),
            &ParsedPacket::Chat {
                message: message.to_string(),
            },
            Some(peer.token()),
        );
    }

    fn on_change_name(self: &Arc<Self>, from: Option<&Arc<Peer>>, name: &str) {
        let Some(peer) = from else { return };
        let state = lock(&self.state);
        if state.member_of(peer).is_none() {
            return;
        }
        peer.set_name(name);
        self.relay(
            &state,
            peer.id(),
            &ParsedPacket::ChangeName {
                name: name.to_string(),
            },
            Some(peer.token()),
        );
    }

    fn on_update_settings(self: &Arc<Self>, from: Option<&Arc<Peer>>, payload: &[u8]) {
        let Some(peer) = from else { return };
        let mut state = lock(&self.state);
        if state.member_of(peer).is_none() {
            return;
        }
        match SessionSettings::from_bytes(payload) {
            Ok(settings) => {
                state.settings = settings;
                self.relay(
                    &state,
                    peer.id(),
                    &ParsedPacket::UpdateSettings {
                        payload: bytes::Bytes::copy_from_slice(payload),
                    },
                    Some(peer.token()),
                );
            }
            Err(e) => warn!(peer = peer.id(), error = %e, "undecodable settings dropped"),
        }
    }

    fn on_ping(&self, from: Option<&Arc<Peer>>, sent_at_nanos: i64) {
        let Some(peer) = from else { return };
        let state = lock(&self.state);
        let Some(member) = state.member_of(peer) else {
            return;
        };
        let pong = ParsedPacket::ReturnPing { sent_at_nanos };
        if let Err(e) = member.channel.send_packet(state.local.id(), &pong) {
            debug!(peer = peer.id(), error = %e, "pong send failed");
        }
    }

    /// Members do not drive the countdown. A forged attempt gets an error
    /// frame back and nothing else.
    fn on_forged_countdown(&self, from: Option<&Arc<Peer>>) {
        let Some(peer) = from else { return };
        let state = lock(&self.state);
        let Some(member) = state.member_of(peer) else {
            return;
        };
        warn!(peer = peer.id(), "member attempted to drive the countdown");
        let error = ParsedPacket::Error {
            message: "countdown is host-controlled".to_string(),
        };
        if let Err(e) = member.channel.send_packet(state.local.id(), &error) {
            debug!(peer = peer.id(), error = %e, "error frame send failed");
        }
    }

    fn member_gone(self: &Arc<Self>, peer: &Arc<Peer>, reason: &str) {
        let mut state = lock(&self.state);
        let before = state.members.len();
        state.members.retain(|m| m.peer.token() != peer.token());
        if state.members.len() == before {
            return;
        }
        info!(peer = peer.id(), reason, "member left");
        let sender = if peer.is_partial() { RESERVED_ID } else { peer.id() };
        self.relay(
            &state,
            sender,
            &ParsedPacket::Disconnect {
                reason: reason.to_string(),
            },
            None,
        );
        self.after_ready_change(&mut state);
    }
}

/// A lobby this process is hosting.
pub struct HostedLobby {
    shared: Arc<HostShared>,
    accept_task: JoinHandle<()>,
    handoff_rx: oneshot::Receiver<Vec<(Arc<Peer>, IpAddr)>>,
}

impl HostedLobby {
    /// Bind the rendezvous port and start accepting joiners. The local
    /// peer claims the configured init id.
    pub async fn open(config: MeshConfig, name: &str) -> Result<HostedLobby> {
        config.validate_strict()?;
        let listener =
            TcpListener::bind((config.network.bind_addr, config.network.base_port)).await?;
        info!(port = config.network.base_port, name, "lobby open");

        let local = Peer::new(config.network.init_id, name);
        let (stop, _) = watch::channel(false);
        let (handoff_tx, handoff_rx) = oneshot::channel();
        let shared = Arc::new(HostShared {
            dispatcher: Arc::new(Dispatcher::new()),
            stop,
            state: Mutex::new(HostState {
                phase: LobbyState::Open,
                local,
                members: Vec::new(),
                settings: SessionSettings::default(),
                chat: Vec::new(),
                next_id: config.network.init_id,
                countdown: None,
            }),
            reader_tasks: Mutex::new(Vec::new()),
            handoff_tx: Mutex::new(Some(handoff_tx)),
            config,
        });
        register_handlers(&shared)?;

        let accept_task = spawn_accept_loop(shared.clone(), listener);
        Ok(HostedLobby {
            shared,
            accept_task,
            handoff_rx,
        })
    }

    pub fn state(&self) -> LobbyState {
        lock(&self.shared.state).phase
    }

    pub fn local_peer(&self) -> Arc<Peer> {
        lock(&self.shared.state).local.clone()
    }

    /// Every member the host currently knows, local peer first.
    pub fn members(&self) -> Vec<Arc<Peer>> {
        let state = lock(&self.shared.state);
        std::iter::once(state.local.clone())
            .chain(state.members.iter().map(|m| m.peer.clone()))
            .collect()
    }

    pub fn settings(&self) -> SessionSettings {
        lock(&self.shared.state).settings.clone()
    }

    pub fn chat_log(&self) -> Vec<ChatLine> {
        lock(&self.shared.state).chat.clone()
    }

    /// Flip the host's own readiness; all members ready starts the
    /// countdown, going unready during it interrupts.
    pub fn set_ready(&self, ready: bool) {
        let shared = &self.shared;
        let mut state = lock(&shared.state);
        state.local.set_ready(ready);
        let local_id = state.local.id();
        shared.relay(&state, local_id, &ParsedPacket::SetReady { ready }, None);
        shared.after_ready_change(&mut state);
    }

    pub fn chat(&self, message: &str) {
        let state = &mut *lock(&self.shared.state);
        state.chat.push(ChatLine {
            author: state.local.name(),
            message: message.to_string(),
        });
        let local_id = state.local.id();
        self.shared.relay(
            state,
            local_id,
            &ParsedPacket::Chat {
                message: message.to_string(),
            },
            None,
        );
    }

    pub fn change_name(&self, name: &str) {
        let state = lock(&self.shared.state);
        state.local.set_name(name);
        let local_id = state.local.id();
        self.shared.relay(
            &state,
            local_id,
            &ParsedPacket::ChangeName {
                name: name.to_string(),
            },
            None,
        );
    }

    pub fn update_settings(&self, settings: SessionSettings) -> Result<()> {
        let payload = settings.to_bytes()?;
        let mut state = lock(&self.shared.state);
        state.settings = settings;
        let local_id = state.local.id();
        self.shared.relay(
            &state,
            local_id,
            &ParsedPacket::UpdateSettings { payload },
            None,
        );
        Ok(())
    }

    /// Wait for the countdown handoff, then establish the mesh and build
    /// the session. Consumes the lobby.
    pub async fn wait_session(mut self, provider: Arc<dyn RoleProvider>) -> Result<Session> {
        let roster = (&mut self.handoff_rx)
            .await
            .map_err(|_| MeshError::ConnectionClosed)?;
        let local = lock(&self.shared.state).local.clone();
        let config = self.shared.config.clone();
        self.teardown().await;
        let links = mesh::establish(&config, local.id(), roster).await?;
        Session::from_mesh(&config, local, links, provider).await
    }

    /// Tell every member the lobby is gone and tear it down.
    pub async fn shutdown(self, reason: &str) {
        {
            let mut state = lock(&self.shared.state);
            let local_id = state.local.id();
            self.shared.relay(
                &state,
                local_id,
                &ParsedPacket::Disconnect {
                    reason: reason.to_string(),
                },
                None,
            );
            if let Some(ticker) = state.countdown.take() {
                ticker.abort();
            }
        }
        self.teardown().await;
    }

    async fn teardown(self) {
        let _ = self.shared.stop.send(true);
        self.accept_task.abort();
        let _ = self.accept_task.await;
        let readers: Vec<JoinHandle<()>> = std::mem::take(&mut *lock(&self.shared.reader_tasks));
        for task in readers {
            let _ = task.await;
        }
        self.shared.dispatcher.unregister_owner(OWNER);
        let members = {
            let mut state = lock(&self.shared.state);
            std::mem::take(&mut state.members)
        };
        for member in members {
            member.channel.close();
        }
    }
}

fn spawn_accept_loop(shared: Arc<HostShared>, listener: TcpListener) -> JoinHandle<()> {
    let mut stopping = shared.stop.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                changed = stopping.changed() => {
                    if changed.is_err() || *stopping.borrow() {
                        break;
                    }
                }
                accepted = listener.accept() => {
                    let (stream, from) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!(error = %e, "rendezvous accept failed");
                            continue;
                        }
                    };
                    let channel = match Channel::spawn(stream) {
                        Ok(channel) => channel,
                        Err(e) => {
                            warn!(%from, error = %e, "joiner channel setup failed");
                            continue;
                        }
                    };
                    admit(&shared, channel, from.ip());
                }
            }
        }
    })
}

/// Add a joiner as a partial member and start reading its frames. The
/// member settles once its `Connect` arrives.
fn admit(shared: &Arc<HostShared>, channel: Arc<Channel>, addr: IpAddr) {
    let peer = Peer::partial();
    {
        let mut state = lock(&shared.state);
        if state.members.len() + 1 >= shared.config.lobby.max_members {
            warn!(%addr, "lobby full, rejecting joiner");
            let error = ParsedPacket::Error {
                message: "lobby is full".to_string(),
            };
            let _ = channel.send_packet(state.local.id(), &error);
            channel.close();
            return;
        }
        state.members.push(Member {
            peer: peer.clone(),
            channel: channel.clone(),
            addr,
        });
    }
    debug!(%addr, "joiner admitted, awaiting announce");

    let reader_shared = shared.clone();
    let task = tokio::spawn(async move {
        let shared = reader_shared;
        let Some(mut reader) = channel.take_reader() else {
            warn!(%addr, "joiner reader already taken");
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
                        shared.dispatcher.dispatch(Some(&peer), &frame.packet);
                    }
                    Ok(None) => {
                        shared.member_gone(&peer, constants::ERR_CONNECTION_CLOSED);
                        break;
                    }
                    Err(e) => {
                        warn!(peer = peer.id(), error = %e, "member stream poisoned");
                        shared.member_gone(&peer, "protocol error");
                        break;
                    }
                },
            }
        }
    });
    lock(&shared.reader_tasks).push(task);
}

fn register_handlers(shared: &Arc<HostShared>) -> Result<()> {
    let dispatcher = shared.dispatcher.clone();

    let s = shared.clone();
    dispatcher.register(PacketHeader::Connect, 3, OWNER, "connect", move |from, p| {
        if let ParsedPacket::Connect { id, ready, name } = p {
            s.on_connect(from, *id, *ready, name);
        }
    })?;

    let s = shared.clone();
    dispatcher.register(PacketHeader::SetReady, 3, OWNER, "ready", move |from, p| {
        if let ParsedPacket::SetReady { ready } = p {
            s.on_set_ready(from, *ready);
        }
    })?;

    let s = shared.clone();
    dispatcher.register(
        PacketHeader::InterruptReady,
        3,
        OWNER,
        "interrupt",
        move |from, _| s.on_interrupt(from),
    )?;

    let s = shared.clone();
    dispatcher.register(PacketHeader::Chat, 3, OWNER, "chat", move |from, p| {
        if let ParsedPacket::Chat { message } = p {
            s.on_chat(from, message);
        }
    })?;

    let s = shared.clone();
    dispatcher.register(
        PacketHeader::ChangeName,
        3,
        OWNER,
        "rename",
        move |from, p| {
            if let ParsedPacket::ChangeName { name } = p {
                s.on_change_name(from, name);
            }
        },
    )?;

    let s = shared.clone();
    dispatcher.register(
        PacketHeader::UpdateSettings,
        3,
        OWNER,
        "settings",
        move |from, p| {
            if let ParsedPacket::UpdateSettings { payload } = p {
                s.on_update_settings(from, payload);
            }
        },
    )?;

    let s = shared.clone();
    dispatcher.register(
        PacketHeader::Disconnect,
        3,
        OWNER,
        "disconnect",
        move |from, p| {
            if let (Some(peer), ParsedPacket::Disconnect { reason }) = (from, p) {
                s.member_gone(peer, reason);
            }
        },
    )?;

    let s = shared.clone();
    dispatcher.register(PacketHeader::Ping, 3, OWNER, "ping", move |from, p| {
        if let ParsedPacket::Ping { sent_at_nanos } = p {
            s.on_ping(from, *sent_at_nanos);
        }
    })?;

    let s = shared.clone();
    dispatcher.register(
        PacketHeader::BeginCountdown,
        3,
        OWNER,
        "forged-begin",
        move |from, _| s.on_forged_countdown(from),
    )?;

    let s = shared.clone();
    dispatcher.register(
        PacketHeader::SyncCountdown,
        3,
        OWNER,
        "forged-sync",
        move |from, _| s.on_forged_countdown(from),
    )?;

    Ok(())
}
