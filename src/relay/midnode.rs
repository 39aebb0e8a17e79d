//! Mid-node relay role.
//!
//! Interior node of a relay tree: at most one peer above, any number of
//! peers below. A below peer is either directly connected or routed through
//! a parent that eventually is. Frames from above fan out to the direct
//! below peers; frames from below go up and across. Parented peers are
//! never sent to directly, their parent relays for them.
//!
//! Topology is verified before the role activates; a malformed tree is a
//! fatal configuration error, not something to limp through.

use crate::error::{constants, MeshError, Result};
use crate::peer::{Peer, PeerDirectory};
use crate::relay::{RelayPlacement, RelayRole, RoleContext, ROLE_MIDNODE};
use crate::transport::channel::{next_frame, Channel, FrameReader};
use crate::transport::direct::DirectAcceptor;
use crate::utils::lock;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Check the relay placement table for structural violations: more than
/// one peer above, a routed below peer without a parent, or a parent chain
/// that never reaches a directly-connected peer (including cycles).
pub fn verify_topology(directory: &PeerDirectory) -> Result<()> {
    let peers = directory.peers();
    let mut above = 0usize;

    for peer in &peers {
        match directory.placement_of(peer) {
            RelayPlacement::Above => above += 1,
            RelayPlacement::Below {
                direct: false,
                parent,
            } => {
                let Some(mut current) = parent else {
                    return Err(MeshError::TopologyViolation(format!(
                        "peer {} is routed below but has no parent",
                        peer.id()
                    )));
                };
                let mut seen = HashSet::new();
                seen.insert(peer.token());
                loop {
                    if !seen.insert(current.token()) {
                        return Err(MeshError::TopologyViolation(format!(
                            "cycle in parent chain at peer {}",
                            current.id()
                        )));
                    }
                    match directory.placement_of(&current) {
                        RelayPlacement::Below { direct: true, .. } => break,
                        RelayPlacement::Below {
                            direct: false,
                            parent: Some(next),
                        } => current = next,
                        other => {
                            return Err(MeshError::TopologyViolation(format!(
                                "parent chain of peer {} reaches peer {} with placement {:?}",
                                peer.id(),
                                current.id(),
                                other
                            )))
                        }
                    }
                }
            }
            RelayPlacement::Below { direct: true, .. } | RelayPlacement::None => {}
        }
    }

    if above > 1 {
        return Err(MeshError::TopologyViolation(format!(
            "{above} peers placed above, at most one allowed"
        )));
    }
    Ok(())
}

#[derive(Clone, Copy, PartialEq)]
enum LinkSide {
    Above,
    Below,
}

struct ActiveState {
    ctx: Arc<RoleContext>,
    readers: Vec<(Arc<Channel>, JoinHandle<Option<FrameReader>>)>,
    acceptor: DirectAcceptor,
}

/// Interior role. See the module docs.
pub struct MidnodeRole {
    running: watch::Sender<bool>,
    active: Mutex<Option<ActiveState>>,
}

impl Default for MidnodeRole {
    fn default() -> Self {
        Self::new()
    }
}

impl MidnodeRole {
    pub fn new() -> Self {
        let (running, _) = watch::channel(false);
        Self {
            running,
            active: Mutex::new(None),
        }
    }
}

/// The above peer (if any) and the directly-connected below peers.
fn linked_peers(ctx: &RoleContext) -> (Option<Arc<Peer>>, Vec<Arc<Peer>>) {
    let mut above = None;
    let mut below = Vec::new();
    for peer in ctx.directory.peers() {
        match ctx.directory.placement_of(&peer) {
            RelayPlacement::Above => above = Some(peer),
            RelayPlacement::Below { direct: true, .. } => below.push(peer),
            _ => {}
        }
    }
    (above, below)
}

#[async_trait]
impl RelayRole for MidnodeRole {
    fn name(&self) -> &str {
        ROLE_MIDNODE
    }

    async fn activate(&self, ctx: Arc<RoleContext>) -> Result<()> {
        if lock(&self.active).is_some() {
            warn!("midnode role already active");
            return Ok(());
        }
        verify_topology(&ctx.directory)?;
        // Readers subscribe below; send_replace works with zero receivers.
        self.running.send_replace(true);

        let (above, below) = linked_peers(&ctx);
        let mut readers = Vec::new();
        let links = above
            .into_iter()
            .map(|p| (p, LinkSide::Above))
            .chain(below.into_iter().map(|p| (p, LinkSide::Below)));
        for (peer, side) in links {
            let Some(channel) = ctx.directory.channel_of(&peer) else {
                warn!(peer = peer.id(), "linked peer has no channel, skipping");
                continue;
            };
            let handle = spawn_link_reader(
                ctx.clone(),
                peer,
                side,
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
        relay_to_links(&state.ctx, frame, except, None);
        Ok(())
    }
}

/// Send `frame` to the above peer and every direct below peer, minus the
/// except list and the link the frame arrived on.
fn relay_to_links(
    ctx: &RoleContext,
    frame: Bytes,
    except: &[Arc<Peer>],
    came_from: Option<(&Arc<Peer>, LinkSide)>,
) {
    let (above, below) = linked_peers(ctx);
    let mut targets: Vec<Arc<Peer>> = Vec::new();
    match came_from {
        // Downward traffic stays downward.
        Some((_, LinkSide::Above)) => targets.extend(below),
        _ => {
            targets.extend(above);
            targets.extend(below);
        }
    }
    for peer in targets {
        if came_from.is_some_and(|(from, _)| from.token() == peer.token()) {
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
            None => warn!(peer = peer.id(), "no channel to linked peer"),
        }
    }
}

fn spawn_link_reader(
    ctx: Arc<RoleContext>,
    peer: Arc<Peer>,
    side: LinkSide,
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
                        let origin = ctx.directory.peer_by_id(frame.sender_id);
                        ctx.dispatcher
                            .dispatch(origin.as_ref().or(Some(&peer)), &frame.packet);
                        relay_to_links(&ctx, frame.raw, &[], Some((&peer, side)));
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

#[cfg(test)]
mod tests {
    use super::*;

    fn directory_with(
        placements: Vec<(i32, RelayPlacement)>,
    ) -> (Arc<PeerDirectory>, Vec<Arc<Peer>>) {
        let directory = PeerDirectory::new();
        let local = Peer::new(1, "local");
        directory.set_local_peer(local);
        let mut peers = Vec::new();
        for (id, placement) in placements {
            let peer = Peer::new(id, format!("peer-{id}"));
            directory.register_with_addr(peer.clone(), std::net::IpAddr::from([127, 0, 0, 1]));
            directory.set_placement(&peer, placement).expect("placement");
            peers.push(peer);
        }
        (directory, peers)
    }

    #[test]
    fn depth_three_chain_verifies() {
        let (directory, peers) = directory_with(vec![(10, RelayPlacement::Below {
            direct: true,
            parent: None,
        })]);
        let a = peers[0].clone();
        let b = Peer::new(11, "b");
        directory.register_with_addr(b.clone(), std::net::IpAddr::from([127, 0, 0, 1]));
        directory
            .set_placement(
                &b,
                RelayPlacement::Below {
                    direct: false,
                    parent: Some(a.clone()),
                },
            )
            .expect("placement");
        let c = Peer::new(12, "c");
        directory.register_with_addr(c.clone(), std::net::IpAddr::from([127, 0, 0, 1]));
        directory
            .set_placement(
                &c,
                RelayPlacement::Below {
                    direct: false,
                    parent: Some(b),
                },
            )
            .expect("placement");

        verify_topology(&directory).expect("valid tree");
    }

    #[test]
    fn two_node_parent_cycle_is_rejected() {
        let directory = PeerDirectory::new();
        directory.set_local_peer(Peer::new(1, "local"));
        let a = Peer::new(10, "a");
        let b = Peer::new(11, "b");
        directory.register_with_addr(a.clone(), std::net::IpAddr::from([127, 0, 0, 1]));
        directory.register_with_addr(b.clone(), std::net::IpAddr::from([127, 0, 0, 1]));
        directory
            .set_placement(
                &a,
                RelayPlacement::Below {
                    direct: false,
                    parent: Some(b.clone()),
                },
            )
            .expect("placement");
        directory
            .set_placement(
                &b,
                RelayPlacement::Below {
                    direct: false,
                    parent: Some(a),
                },
            )
            .expect("placement");

        assert!(matches!(
            verify_topology(&directory),
            Err(MeshError::TopologyViolation(_))
        ));
    }

    #[test]
    fn second_above_peer_is_rejected() {
        let (directory, _) = directory_with(vec![
            (10, RelayPlacement::Above),
            (11, RelayPlacement::Above),
        ]);
        assert!(matches!(
            verify_topology(&directory),
            Err(MeshError::TopologyViolation(_))
        ));
    }

    #[test]
    fn parentless_routed_peer_is_rejected() {
        let (directory, _) = directory_with(vec![(10, RelayPlacement::Below {
            direct: false,
            parent: None,
        })]);
        assert!(matches!(
            verify_topology(&directory),
            Err(MeshError::TopologyViolation(_))
        ));
    }
}
