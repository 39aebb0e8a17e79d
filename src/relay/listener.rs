//! Listener relay role.
//!
//! Leaf of the relay tree: everything outbound goes to a single upstream
//! peer, and the only read loop runs against that upstream. The upstream
//! starts as the broadcast holder (first session peer when roles are not
//! known yet) and is re-resolved when a role swap moves the broadcast role
//! to another peer.

use crate::core::header::PacketHeader;
use crate::core::packet::ParsedPacket;
use crate::error::{constants, MeshError, Result};
use crate::peer::Peer;
use crate::relay::{RelayRole, RoleContext, ROLE_BROADCAST, ROLE_LISTENER};
use crate::transport::channel::next_frame;
use crate::transport::direct::DirectAcceptor;
use crate::utils::lock;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

struct ActiveState {
    ctx: Arc<RoleContext>,
    reader_task: JoinHandle<()>,
    acceptor: DirectAcceptor,
}

/// Leaf role. See the module docs.
pub struct ListenerRole {
    running: watch::Sender<bool>,
    upstream: Arc<watch::Sender<Option<Arc<Peer>>>>,
    active: Mutex<Option<ActiveState>>,
}

impl Default for ListenerRole {
    fn default() -> Self {
        Self::new()
    }
}

impl ListenerRole {
    pub fn new() -> Self {
        let (running, _) = watch::channel(false);
        let (upstream, _) = watch::channel(None);
        Self {
            running,
            upstream: Arc::new(upstream),
            active: Mutex::new(None),
        }
    }

    /// The peer currently used as upstream.
    pub fn upstream(&self) -> Option<Arc<Peer>> {
        self.upstream.borrow().clone()
    }
}

/// The broadcast holder if one is known, otherwise the first remote peer
/// in session order.
fn resolve_upstream(ctx: &RoleContext) -> Option<Arc<Peer>> {
    let local_token = ctx.directory.local_peer().map(|p| p.token());
    ctx.directory
        .peers_with_relay_role(ROLE_BROADCAST)
        .into_iter()
        .find(|p| Some(p.token()) != local_token)
        .or_else(|| ctx.directory.remote_peers().into_iter().next())
}

#[async_trait]
impl RelayRole for ListenerRole {
    fn name(&self) -> &str {
        ROLE_LISTENER
    }

    async fn activate(&self, ctx: Arc<RoleContext>) -> Result<()> {
        if lock(&self.active).is_some() {
            warn!("listener role already active");
            return Ok(());
        }
        // send_replace: nothing subscribes to these channels until the
        // reader task below, so a plain send would be dropped.
        self.running.send_replace(true);

        let first = resolve_upstream(&ctx)
            .ok_or_else(|| MeshError::Dispatch(constants::ERR_NO_UPSTREAM.to_string()))?;
        info!(upstream = first.id(), "listener upstream resolved");
        self.upstream.send_replace(Some(first));

        let reader_task = spawn_leaf_reader(
            ctx.clone(),
            self.running.subscribe(),
            self.upstream.subscribe(),
        );

        // A relay-role swap that moves the broadcast role re-points this
        // leaf at the new holder.
        {
            let dispatcher = ctx.dispatcher.clone();
            let ctx = ctx.clone();
            let upstream = self.upstream.clone();
            dispatcher.register(
                PacketHeader::ChangeRole,
                10,
                ROLE_LISTENER,
                "upstream-watch",
                move |_, packet| {
                    let ParsedPacket::ChangeRole {
                        peer_id,
                        relay: true,
                        role_name,
                        ..
                    } = packet
                    else {
                        return;
                    };
                    if role_name != ROLE_BROADCAST {
                        return;
                    }
                    if ctx.local_id().ok() == Some(*peer_id) {
                        return;
                    }
                    match ctx.directory.peer_by_id(*peer_id) {
                        Some(peer) => {
                            debug!(upstream = peer.id(), "upstream moved");
                            upstream.send_replace(Some(peer));
                        }
                        None => warn!(peer = peer_id, "broadcast moved to unknown peer"),
                    }
                },
            )?;
        }

        let acceptor = ctx.start_direct_acceptor().await?;
        *lock(&self.active) = Some(ActiveState {
            ctx,
            reader_task,
            acceptor,
        });
        Ok(())
    }

    async fn deactivate(&self) -> Result<()> {
        let Some(state) = lock(&self.active).take() else {
            return Ok(());
        };
        state.ctx.dispatcher.unregister_owner(ROLE_LISTENER);
        self.running.send_replace(false);
        let _ = state.reader_task.await;
        state.acceptor.shutdown().await;
        self.upstream.send_replace(None);
        Ok(())
    }

    fn send_data(&self, frame: Bytes, except: &[Arc<Peer>]) -> Result<()> {
        let guard = lock(&self.active);
        let state = guard
            .as_ref()
            .ok_or_else(|| MeshError::Dispatch(constants::ERR_ROLE_INACTIVE.to_string()))?;
        let upstream = self
            .upstream
            .borrow()
            .clone()
            .ok_or_else(|| MeshError::Dispatch(constants::ERR_NO_UPSTREAM.to_string()))?;
        if except.iter().any(|p| p.token() == upstream.token()) {
            return Ok(());
        }
        let channel = state
            .ctx
            .directory
            .channel_of(&upstream)
            .ok_or(MeshError::UnknownPeer(upstream.id()))?;
        channel.send(frame)
    }
}

/// One read loop that follows the upstream as it moves: the current
/// upstream's reader is taken, drained, and restored whenever the upstream
/// changes or the role winds down.
fn spawn_leaf_reader(
    ctx: Arc<RoleContext>,
    mut running: watch::Receiver<bool>,
    mut upstream_rx: watch::Receiver<Option<Arc<Peer>>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        'outer: loop {
            let Some(peer) = upstream_rx.borrow_and_update().clone() else {
                // No upstream yet; wait for one or for shutdown.
                tokio::select! {
                    changed = running.changed() => {
                        if changed.is_err() || !*running.borrow() {
                            break 'outer;
                        }
                    }
                    changed = upstream_rx.changed() => {
                        if changed.is_err() {
                            break 'outer;
                        }
                    }
                }
                continue;
            };
            let Some(channel) = ctx.directory.channel_of(&peer) else {
                warn!(upstream = peer.id(), "upstream has no channel");
                break;
            };
            let Some(mut reader) = channel.take_reader() else {
                warn!(upstream = peer.id(), "upstream reader already taken");
                break;
            };
            loop {
                tokio::select! {
                    changed = running.changed() => {
                        if changed.is_err() || !*running.borrow() {
                            channel.restore_reader(reader);
                            break 'outer;
                        }
                    }
                    changed = upstream_rx.changed() => {
                        channel.restore_reader(reader);
                        if changed.is_err() {
                            break 'outer;
                        }
                        continue 'outer;
                    }
                    frame = next_frame(&mut reader) => match frame {
                        Ok(Some(frame)) => {
                            let origin = ctx.directory.peer_by_id(frame.sender_id);
                            ctx.dispatcher.dispatch(origin.as_ref(), &frame.packet);
                        }
                        Ok(None) => {
                            debug!(upstream = peer.id(), "upstream closed its stream");
                            channel.restore_reader(reader);
                            break 'outer;
                        }
                        Err(e) => {
                            warn!(upstream = peer.id(), error = %e, "upstream stream poisoned");
                            channel.restore_reader(reader);
                            break 'outer;
                        }
                    },
                }
            }
        }
    })
}
