//! Broadcast relay role.
//!
//! The hub of a star topology: every inbound frame is re-dispatched locally
//! and then retransmitted, bytes untouched, to every directly-connected
//! peer except the one it came from. Forwarding the original bytes keeps
//! the sender id intact so leaves can attribute the frame to its origin.

use crate::core::codec::Frame;
use crate::error::{constants, MeshError, Result};
use crate::peer::Peer;
use crate::relay::{RelayRole, RoleContext, ROLE_BROADCAST};
use crate::transport::channel::{next_frame, Channel, FrameReader};
use crate::transport::direct::DirectAcceptor;
use crate::utils::lock;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

struct ActiveState {
    ctx: Arc<RoleContext>,
    readers: Vec<(Arc<Channel>, JoinHandle<Option<FrameReader>>)>,
    acceptor: DirectAcceptor,
}

/// Hub role. See the module docs.
pub struct BroadcastRole {
    running: watch::Sender<bool>,
    active: Mutex<Option<ActiveState>>,
}

impl Default for BroadcastRole {
    fn default() -> Self {
        Self::new()
    }
}

impl BroadcastRole {
    pub fn new() -> Self {
        let (running, _) = watch::channel(false);
        Self {
            running,
            active: Mutex::new(None),
        }
    }
}

#[async_trait]
impl RelayRole for BroadcastRole {
    fn name(&self) -> &str {
        ROLE_BROADCAST
    }

    async fn activate(&self, ctx: Arc<RoleContext>) -> Result<()> {
        if lock(&self.active).is_some() {
            warn!("broadcast role already active");
            return Ok(());
        }
        // The readers subscribe below; send_replace sets the flag even
        // while there are no receivers yet.
        self.running.send_replace(true);

        let local = ctx
            .directory
            .local_peer()
            .ok_or_else(|| MeshError::Dispatch(constants::ERR_NO_LOCAL_PEER.to_string()))?;

        let mut readers = Vec::new();
        for peer in ctx.directory.connections_of(&local) {
            let Some(channel) = ctx.directory.channel_of(&peer) else {
                warn!(peer = peer.id(), "connected peer has no channel, skipping");
                continue;
            };
            let handle = spawn_hub_reader(
                ctx.clone(),
                local.clone(),
                peer,
                channel.clone(),
                self.running.subscribe(),
            );
            readers.push((channel, handle));
        }

        let acceptor = ctx.start_direct_acceptor().await?;
        *lock(&self.active) = Some(ActiveState {
            ctx,
            readers,
            acceptor,
        });
        Ok(())
    }

    async fn deactivate(&self) -> Result<()> {
        let Some(state) = lock(&self.active).take() else {
            return Ok(());
        };
        self.running.send_replace(false);
        for (channel, handle) in state.readers {
            if let Ok(Some(reader)) = handle.await {
                channel.restore_reader(reader);
            }
        }
        state.acceptor.shutdown().await;
        Ok(())
    }

    fn send_data(&self, frame: Bytes, except: &[Arc<Peer>]) -> Result<()> {
        let guard = lock(&self.active);
        let state = guard
            .as_ref()
            .ok_or_else(|| MeshError::Dispatch(constants::ERR_ROLE_INACTIVE.to_string()))?;
        let local = state
            .ctx
            .directory
            .local_peer()
            .ok_or_else(|| MeshError::Dispatch(constants::ERR_NO_LOCAL_PEER.to_string()))?;
        fan_out(&state.ctx, &local, frame, except, None);
        Ok(())
    }
}

/// Send `frame` to every peer connected with `local`, skipping `except`
/// and (when forwarding) the peer the frame came from. A connected peer
/// without a usable channel is warned about and skipped.
fn fan_out(
    ctx: &RoleContext,
    local: &Arc<Peer>,
    frame: Bytes,
    except: &[Arc<Peer>],
    came_from: Option<&Arc<Peer>>,
) {
    for peer in ctx.directory.connections_of(local) {
        if came_from.is_some_and(|from| from.token() == peer.token()) {
            continue;
        }
        if except.iter().any(|p| p.token() == peer.token()) {
            continue;
        }
        match ctx.directory.channel_of(&peer) {
            Some(channel) => {
                if let Err(e) = channel.send(frame.clone()) {
                    warn!(peer = peer.id(), error = %e, "dropping frame for peer");
                }
            }
            None => warn!(peer = peer.id(), "no channel to connected peer"),
        }
    }
}

fn spawn_hub_reader(
    ctx: Arc<RoleContext>,
    local: Arc<Peer>,
    peer: Arc<Peer>,
    channel: Arc<Channel>,
    mut running: watch::Receiver<bool>,
) -> JoinHandle<Option<FrameReader>> {
    tokio::spawn(async move {
        let Some(mut reader) = channel.take_reader() else {
            warn!(peer = peer.id(), "reader already taken");
            return None;
        };
        loop {
            tokio::select! {
                changed = running.changed() => {
                    if changed.is_err() || !*running.borrow() {
                        break;
                    }
                }
                frame = next_frame(&mut reader) => match frame {
                    Ok(Some(frame)) => {
                        let Frame { packet, raw, .. } = frame;
                        ctx.dispatcher.dispatch(Some(&peer), &packet);
                        fan_out(&ctx, &local, raw, &[], Some(&peer));
                    }
                    Ok(None) => {
                        debug!(peer = peer.id(), "peer closed its stream");
                        break;
                    }
                    Err(e) => {
                        warn!(peer = peer.id(), error = %e, "relay stream poisoned");
                        break;
                    }
                },
            }
        }
        Some(reader)
    })
}
