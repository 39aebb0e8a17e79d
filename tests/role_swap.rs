//! Integration tests for digest-verified role hot-swap: a digest mismatch
//! must halt the node before the new role is even instantiated.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use bytes::Bytes;
use relay_mesh::relay::{RelayRole, SessionRole};
use relay_mesh::{
    Dispatcher, IdleRole, MeshConfig, ParsedPacket, Peer, PeerDirectory, Result, RoleContext,
    RoleRegistry,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

struct ProbeRole {
    activated: Arc<AtomicBool>,
}

#[async_trait]
impl RelayRole for ProbeRole {
    fn name(&self) -> &str {
        "probe"
    }

    async fn activate(&self, _ctx: Arc<RoleContext>) -> Result<()> {
        self.activated.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn deactivate(&self) -> Result<()> {
        Ok(())
    }

    fn send_data(&self, _frame: Bytes, _except: &[Arc<Peer>]) -> Result<()> {
        Ok(())
    }
}

fn probe_setup() -> (Arc<RoleContext>, Arc<AtomicBool>, IdleRole) {
    let directory = PeerDirectory::new();
    directory.set_local_peer(Peer::new(1337, "local"));
    let ctx = RoleContext::new(
        directory,
        Arc::new(Dispatcher::new()),
        MeshConfig::default(),
    );

    let activated = Arc::new(AtomicBool::new(false));
    let registry = RoleRegistry::new();
    let flag = activated.clone();
    registry.register_relay("probe", RoleRegistry::name_digest("probe"), move || {
        Arc::new(ProbeRole {
            activated: flag.clone(),
        })
    });
    let idle = IdleRole::new(Arc::new(registry));
    (ctx, activated, idle)
}

fn swap_packet(digest: Vec<u8>) -> ParsedPacket {
    ParsedPacket::ChangeRole {
        peer_id: 1337,
        relay: true,
        role_name: "probe".into(),
        digest,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn digest_mismatch_halts_without_activation() {
    let (ctx, activated, idle) = probe_setup();
    idle.activate(ctx.clone()).await.unwrap();

    ctx.dispatcher.dispatch(None, &swap_packet(vec![0u8; 32]));

    assert!(ctx.halt.is_raised(), "mismatch must raise the halt signal");
    // Give any wrongly spawned activation a chance to run before checking.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(
        !activated.load(Ordering::SeqCst),
        "mismatched role must never activate"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn matching_digest_applies_the_swap() {
    let (ctx, activated, idle) = probe_setup();
    idle.activate(ctx.clone()).await.unwrap();

    let digest = RoleRegistry::name_digest("probe").to_vec();
    ctx.dispatcher.dispatch(None, &swap_packet(digest));

    let mut applied = false;
    for _ in 0..100 {
        if activated.load(Ordering::SeqCst) {
            applied = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(applied, "verified swap never activated the role");
    assert!(!ctx.halt.is_raised());

    let local = ctx.directory.local_peer().unwrap();
    assert_eq!(
        ctx.directory.relay_role_of(&local).map(|r| r.name().to_string()),
        Some("probe".to_string())
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unknown_role_halts() {
    let (ctx, _activated, idle) = probe_setup();
    idle.activate(ctx.clone()).await.unwrap();

    ctx.dispatcher.dispatch(
        None,
        &ParsedPacket::ChangeRole {
            peer_id: 1337,
            relay: true,
            role_name: "nonsense".into(),
            digest: vec![0u8; 32],
        },
    );
    assert!(ctx.halt.is_raised());
}
