//! # Direct Side-Channel
//!
//! Point-to-point connections outside the relay tree, used for traffic that
//! must not transit the relay (whispers, bulk transfers between two peers).
//!
//! A connector dials the target's derived direct port and announces itself
//! with a 4-byte id handshake. The acceptor validates the announced id
//! against the peer expected at that address; an id/address mismatch is
//! accepted only under the address-fallback trust policy. Every link gets a
//! monitor task that re-injects inbound packets into the dispatcher wrapped
//! under the `Direct` pseudo-header, and teardown announces itself with a
//! `DestroyingChannel` control frame before the socket closes.

use crate::core::codec::Frame;
use crate::core::header::PacketHeader;
use crate::core::packet::ParsedPacket;
use crate::core::wire;
use crate::error::{MeshError, Result};
use crate::peer::Peer;
use crate::relay::RoleContext;
use crate::transport::channel::{next_frame, Channel};
use crate::utils::lock;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Live side-channel links, keyed by peer token.
#[derive(Debug, Default)]
pub struct DirectChannels {
    links: Mutex<HashMap<u64, Arc<Channel>>>,
}

impl DirectChannels {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, peer: &Arc<Peer>) -> Option<Arc<Channel>> {
        lock(&self.links).get(&peer.token()).cloned()
    }

    pub fn insert(&self, peer: &Arc<Peer>, channel: Arc<Channel>) {
        lock(&self.links).insert(peer.token(), channel);
    }

    pub fn remove(&self, peer: &Arc<Peer>) -> Option<Arc<Channel>> {
        lock(&self.links).remove(&peer.token())
    }

    pub fn is_connected(&self, peer: &Arc<Peer>) -> bool {
        lock(&self.links).contains_key(&peer.token())
    }
}

/// Open a side channel to `peer` if one does not already exist. Idempotent.
pub async fn ensure_direct_connection(ctx: &Arc<RoleContext>, peer: &Arc<Peer>) -> Result<()> {
    if ctx.direct.is_connected(peer) {
        return Ok(());
    }
    let addr = ctx
        .directory
        .addr_of(peer)
        .ok_or(MeshError::UnknownPeer(peer.id()))?;
    let port = wire::direct_port(
        ctx.config.network.base_port,
        ctx.config.network.init_id,
        peer.id(),
    );
    let local_id = ctx.local_id()?;

    let mut stream = TcpStream::connect((addr, port)).await?;
    stream.write_i32(local_id).await?;
    let channel = Channel::spawn(stream)?;
    debug!(peer = peer.id(), port, "direct channel opened");
    ctx.direct.insert(peer, channel.clone());
    spawn_monitor(ctx.clone(), peer.clone(), channel);
    Ok(())
}

/// Send a packet over an existing side channel. `ensure_direct_connection`
/// must have succeeded (or the peer dialed us) first.
pub fn send_directly(ctx: &RoleContext, peer: &Arc<Peer>, packet: &ParsedPacket) -> Result<()> {
    let channel = ctx
        .direct
        .get(peer)
        .ok_or(MeshError::NoDirectChannel(peer.id()))?;
    channel.send_packet(ctx.local_id()?, packet)
}

/// Tear down the side channel to `peer`, announcing the teardown first so
/// the remote monitor can unwind cleanly. A missing link is not an error.
pub async fn destroy_unnecessary_connection(ctx: &RoleContext, peer: &Arc<Peer>) -> Result<()> {
    let Some(channel) = ctx.direct.remove(peer) else {
        return Ok(());
    };
    let local_id = ctx.local_id()?;
    if let Err(e) = channel.send_packet(local_id, &ParsedPacket::DestroyingChannel) {
        debug!(peer = peer.id(), error = %e, "peer already gone during teardown");
    }
    channel.close();
    Ok(())
}

/// Monitor one side-channel link: re-inject inbound packets under the
/// `Direct` pseudo-header and unwind on teardown, error, or halt.
fn spawn_monitor(ctx: Arc<RoleContext>, peer: Arc<Peer>, channel: Arc<Channel>) {
    tokio::spawn(async move {
        let Some(mut reader) = channel.take_reader() else {
            warn!(peer = peer.id(), "direct reader already taken");
            return;
        };
        let mut halted = ctx.halt.subscribe();
        loop {
            tokio::select! {
                _ = halted.changed() => break,
                frame = next_frame(&mut reader) => match frame {
                    Ok(Some(frame)) => {
                        if frame.header() == PacketHeader::DestroyingChannel {
                            debug!(peer = peer.id(), "remote tore down direct channel");
                            break;
                        }
                        let Frame { packet, .. } = frame;
                        ctx.dispatcher
                            .dispatch(Some(&peer), &ParsedPacket::Direct(Box::new(packet)));
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(peer = peer.id(), error = %e, "direct channel poisoned");
                        break;
                    }
                },
            }
        }
        ctx.direct.remove(&peer);
        channel.close();
    });
}

/// Accept loop for inbound side-channel connections. Owned by the active
/// relay role and shut down with it.
#[derive(Debug)]
pub struct DirectAcceptor {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl DirectAcceptor {
    /// Bind the local peer's derived direct port and start accepting.
    pub async fn bind(ctx: Arc<RoleContext>) -> Result<Self> {
        let local_id = ctx.local_id()?;
        let port = wire::direct_port(
            ctx.config.network.base_port,
            ctx.config.network.init_id,
            local_id,
        );
        let listener = TcpListener::bind((ctx.config.network.bind_addr, port)).await?;
        info!(port, "direct acceptor listening");

        let (stop, mut stop_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, addr)) => {
                            let ctx = ctx.clone();
                            tokio::spawn(async move {
                                if let Err(e) = accept_link(ctx, stream).await {
                                    warn!(remote = %addr, error = %e, "rejected direct connection");
                                }
                            });
                        }
                        Err(e) => warn!(error = %e, "direct accept failed"),
                    },
                }
            }
        });
        Ok(Self { stop, task })
    }

    /// Stop accepting and wait for the accept loop to finish. Established
    /// links stay up; only their monitors own them now.
    pub async fn shutdown(self) {
        let _ = self.stop.send(true);
        let _ = self.task.await;
    }
}

async fn accept_link(ctx: Arc<RoleContext>, mut stream: TcpStream) -> Result<()> {
    let remote_ip = stream.peer_addr()?.ip();
    let announced_id = stream.read_i32().await?;

    let peer = match ctx.directory.peer_by_id(announced_id) {
        Some(peer) if ctx.directory.addr_of(&peer) == Some(remote_ip) => peer,
        Some(peer) if ctx.config.trust.accept_address_fallback => {
            debug!(
                peer = announced_id,
                remote = %remote_ip,
                "address mismatch accepted under fallback policy"
            );
            peer
        }
        Some(_) => {
            return Err(MeshError::Dispatch(format!(
                "id {announced_id} announced from unexpected address {remote_ip}"
            )))
        }
        None if ctx.config.trust.accept_address_fallback => ctx
            .directory
            .peers()
            .into_iter()
            .find(|p| ctx.directory.addr_of(p) == Some(remote_ip))
            .ok_or(MeshError::UnknownPeer(announced_id))?,
        None => return Err(MeshError::UnknownPeer(announced_id)),
    };

    let channel = Channel::spawn(stream)?;
    debug!(peer = peer.id(), "direct channel accepted");
    ctx.direct.insert(&peer, channel.clone());
    spawn_monitor(ctx, peer, channel);
    Ok(())
}
