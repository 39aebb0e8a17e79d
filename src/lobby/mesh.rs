//! Mesh establishment and the running session.
//!
//! After the topology handoff every member knows every other member's id
//! and address. Each member binds a mesh listener at a port derived from
//! its own id, accepts connections from lower-id peers, and dials every
//! higher-id peer. The accept and dial sides run concurrently under one
//! deadline; dialing retries until the target's listener is up. The result
//! is a full connection matrix, from which [`Session::from_mesh`] builds a
//! fresh directory and activates the local relay role.

use crate::config::MeshConfig;
use crate::core::packet::{encode_frame, ParsedPacket};
use crate::core::wire;
use crate::error::{constants, MeshError, Result};
use crate::peer::{Peer, PeerDirectory};
use crate::protocol::Dispatcher;
use crate::relay::{
    BroadcastRole, HaltSignal, IdleRole, ListenerRole, RelayPlacement, RoleContext, RoleProvider,
};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::transport::Channel;

/// Build the full connection matrix for `roster` (remote members only).
/// Listens for lower-id peers and dials higher-id peers, both bounded by
/// the configured establish timeout.
pub(crate) async fn establish(
    config: &MeshConfig,
    local_id: i32,
    roster: Vec<(Arc<Peer>, IpAddr)>,
) -> Result<Vec<(Arc<Peer>, Arc<Channel>)>> {
    let base = config.network.base_port;
    let init = config.network.init_id;

    let mut expect_lower: HashMap<i32, Arc<Peer>> = HashMap::new();
    let mut dial_higher: Vec<(Arc<Peer>, IpAddr)> = Vec::new();
    for (peer, addr) in roster {
        let id = peer.id();
        // A handoff roster with a repeated id, or one naming the local
        // id, cannot produce a usable matrix.
        if id == local_id {
            return Err(MeshError::IdCollision(id));
        }
        if id < local_id {
            if expect_lower.insert(id, peer).is_some() {
                return Err(MeshError::IdCollision(id));
            }
        } else {
            if dial_higher.iter().any(|(p, _)| p.id() == id) {
                return Err(MeshError::IdCollision(id));
            }
            dial_higher.push((peer, addr));
        }
    }

    let listener = TcpListener::bind((
        config.network.bind_addr,
        wire::mesh_port(base, init, local_id),
    ))
    .await?;
    info!(
        port = wire::mesh_port(base, init, local_id),
        lower = expect_lower.len(),
        higher = dial_higher.len(),
        "establishing mesh"
    );

    let accept_side = async {
        let mut links = Vec::new();
        let mut remaining = expect_lower;
        while !remaining.is_empty() {
            let (mut stream, from) = listener.accept().await?;
            let announced = stream.read_i32().await?;
            match remaining.remove(&announced) {
                Some(peer) => {
                    debug!(peer = announced, %from, "mesh link accepted");
                    links.push((peer, Channel::spawn(stream)?));
                }
                None => warn!(id = announced, %from, "unexpected mesh connection dropped"),
            }
        }
        Ok::<_, MeshError>(links)
    };

    let dial_side = async {
        let mut links = Vec::new();
        for (peer, addr) in dial_higher {
            let port = wire::mesh_port(base, init, peer.id());
            let stream = loop {
                match TcpStream::connect((addr, port)).await {
                    Ok(stream) => break stream,
                    Err(e) => {
                        debug!(peer = peer.id(), error = %e, "mesh dial not up yet, retrying");
                        tokio::time::sleep(config.mesh.poll_interval).await;
                    }
                }
            };
            let mut stream = stream;
            stream.write_i32(local_id).await?;
            debug!(peer = peer.id(), "mesh link dialed");
            links.push((peer, Channel::spawn(stream)?));
        }
        Ok::<_, MeshError>(links)
    };

    let (mut accepted, dialed) =
        tokio::time::timeout(config.mesh.establish_timeout, async move {
            tokio::try_join!(accept_side, dial_side)
        })
        .await
        .map_err(|_| MeshError::Timeout("mesh establishment"))??;

    accepted.extend(dialed);
    Ok(accepted)
}

/// A connected session: the directory, dispatcher, and role context that
/// outlive the lobby.
pub struct Session {
    ctx: Arc<RoleContext>,
}

impl Session {
    /// Build a session from an established connection matrix. The
    /// directory is rebuilt from scratch with fresh peer objects; nothing
    /// from the lobby carries over. The peer holding the init id becomes
    /// the broadcast hub, everyone else starts as a listener leaf.
    pub async fn from_mesh(
        config: &MeshConfig,
        local: Arc<Peer>,
        links: Vec<(Arc<Peer>, Arc<Channel>)>,
        provider: Arc<dyn RoleProvider>,
    ) -> Result<Session> {
        let directory = PeerDirectory::new();
        let dispatcher = Arc::new(Dispatcher::new());

        let fresh_local = Peer::new(local.id(), local.name());
        fresh_local.set_ready(local.is_ready());
        directory.set_local_peer(fresh_local.clone());

        let mut remotes = Vec::new();
        for (peer, channel) in links {
            let fresh = Peer::new(peer.id(), peer.name());
            fresh.set_ready(peer.is_ready());
            directory.register_with_channel(fresh.clone(), channel);
            remotes.push(fresh);
        }

        // Full matrix: every member is connected with every other member.
        let everyone = directory.peers();
        for peer in &everyone {
            directory.set_connected_with(peer, everyone.clone())?;
        }

        let ctx = RoleContext::new(directory.clone(), dispatcher, config.clone());

        // Remote role slots record what the rest of the mesh is running;
        // the instances are never activated locally.
        let hub_id = config.network.init_id;
        for peer in &remotes {
            let role: Arc<dyn crate::relay::RelayRole> = if peer.id() == hub_id {
                Arc::new(BroadcastRole::new())
            } else {
                Arc::new(ListenerRole::new())
            };
            directory.set_relay_role(peer, Some(role), &ctx).await?;
        }

        directory
            .set_session_role(&fresh_local, Some(Arc::new(IdleRole::new(provider))), &ctx)
            .await?;
        let local_role: Arc<dyn crate::relay::RelayRole> = if fresh_local.id() == hub_id {
            Arc::new(BroadcastRole::new())
        } else {
            Arc::new(ListenerRole::new())
        };
        info!(
            id = fresh_local.id(),
            role = local_role.name(),
            peers = remotes.len(),
            "session established"
        );
        directory
            .set_relay_role(&fresh_local, Some(local_role), &ctx)
            .await?;

        Ok(Session { ctx })
    }

    /// Shared runtime, for registering dispatch handlers and opening
    /// direct side channels.
    pub fn context(&self) -> &Arc<RoleContext> {
        &self.ctx
    }

    pub fn directory(&self) -> &Arc<PeerDirectory> {
        &self.ctx.directory
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.ctx.dispatcher
    }

    pub fn local_peer(&self) -> Result<Arc<Peer>> {
        self.ctx
            .directory
            .local_peer()
            .ok_or_else(|| MeshError::Dispatch(constants::ERR_NO_LOCAL_PEER.to_string()))
    }

    pub fn halt(&self) -> &HaltSignal {
        &self.ctx.halt
    }

    /// Send a packet through the local relay role, skipping `except`.
    pub fn send(&self, packet: &ParsedPacket, except: &[Arc<Peer>]) -> Result<()> {
        let local = self.local_peer()?;
        let role = self
            .ctx
            .directory
            .relay_role_of(&local)
            .ok_or_else(|| MeshError::Dispatch(constants::ERR_ROLE_INACTIVE.to_string()))?;
        role.send_data(encode_frame(local.id(), packet)?, except)
    }

    /// Wind the session down: deactivate the local roles and close every
    /// channel.
    pub async fn shutdown(self) -> Result<()> {
        let directory = self.ctx.directory.clone();
        if let Some(local) = directory.local_peer() {
            directory.set_relay_role(&local, None, &self.ctx).await?;
            directory.set_session_role(&local, None, &self.ctx).await?;
        }
        for peer in directory.remote_peers() {
            if let Some(channel) = directory.channel_of(&peer) {
                channel.close();
            }
            directory.set_placement(&peer, RelayPlacement::None)?;
        }
        info!("session shut down");
        Ok(())
    }
}
