//! Packet dispatcher with priority-ordered routing.
//!
//! Handlers register under a concrete header or the `Any` wildcard with a
//! priority from 1 to 10; dispatch runs concrete and wildcard handlers in a
//! single ascending-priority order, registration order breaking ties.
//! Priority 10 is reserved by convention for read-only observers, which
//! therefore always see the fully handled packet.
//!
//! Callbacks are invoked without the registry lock held, so a handler may
//! register or unregister others.

use crate::core::header::PacketHeader;
use crate::core::packet::ParsedPacket;
use crate::error::{constants, MeshError, Result};
use crate::peer::Peer;
use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tracing::warn;

/// Lowest handler priority.
pub const PRIORITY_FIRST: u8 = 1;
/// Highest handler priority; read-only observers by convention.
pub const PRIORITY_OBSERVER: u8 = 10;

type HandlerFn = dyn Fn(Option<&Arc<Peer>>, &ParsedPacket) + Send + Sync + 'static;

struct Registration {
    owner: Cow<'static, str>,
    name: Cow<'static, str>,
    priority: u8,
    seq: u64,
    callback: Arc<HandlerFn>,
}

/// Packet dispatcher. Uses Cow<'static, str> for owner and handler names to
/// avoid heap allocations for the static names used throughout the crate.
pub struct Dispatcher {
    handlers: RwLock<HashMap<PacketHeader, Vec<Registration>>>,
    next_seq: AtomicU64,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            next_seq: AtomicU64::new(0),
        }
    }

    /// Register a handler. Fails if the priority is out of range or if the
    /// same owner already registered a handler with this name under the
    /// same header.
    pub fn register<F>(
        &self,
        header: PacketHeader,
        priority: u8,
        owner: impl Into<Cow<'static, str>>,
        name: impl Into<Cow<'static, str>>,
        callback: F,
    ) -> Result<()>
    where
        F: Fn(Option<&Arc<Peer>>, &ParsedPacket) + Send + Sync + 'static,
    {
        if !(PRIORITY_FIRST..=PRIORITY_OBSERVER).contains(&priority) {
            return Err(MeshError::Dispatch(format!(
                "handler priority {priority} out of range {PRIORITY_FIRST}..={PRIORITY_OBSERVER}"
            )));
        }
        let owner = owner.into();
        let name = name.into();

        let mut handlers = self
            .handlers
            .write()
            .map_err(|_| MeshError::Dispatch(constants::ERR_DISPATCHER_WRITE_LOCK.to_string()))?;

        let slot = handlers.entry(header).or_default();
        if slot
            .iter()
            .any(|reg| reg.owner == owner && reg.name == name)
        {
            return Err(MeshError::Dispatch(format!(
                "handler '{name}' of owner '{owner}' already registered for {}",
                header.name()
            )));
        }

        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        slot.push(Registration {
            owner,
            name,
            priority,
            seq,
            callback: Arc::new(callback),
        });
        slot.sort_by_key(|reg| (reg.priority, reg.seq));
        Ok(())
    }

    /// Remove every handler registered by `owner`, across all headers.
    pub fn unregister_owner(&self, owner: &str) {
        let mut handlers = self
            .handlers
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        for slot in handlers.values_mut() {
            slot.retain(|reg| reg.owner != owner);
        }
    }

    /// Number of handlers that would run for `header`, wildcards included.
    pub fn handler_count(&self, header: PacketHeader) -> usize {
        let handlers = self
            .handlers
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let concrete = handlers.get(&header).map_or(0, Vec::len);
        let wildcard = if header == PacketHeader::Any {
            0
        } else {
            handlers.get(&PacketHeader::Any).map_or(0, Vec::len)
        };
        concrete + wildcard
    }

    /// Run every handler for this packet's header, wildcard handlers
    /// interleaved by the same (priority, registration order) ordering.
    /// A packet nobody handles is logged, not fatal.
    pub fn dispatch(&self, from: Option<&Arc<Peer>>, packet: &ParsedPacket) {
        let header = packet.header();
        let callbacks: Vec<Arc<HandlerFn>> = {
            let handlers = self
                .handlers
                .read()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            let empty: &[Registration] = &[];
            let concrete = handlers.get(&header).map_or(empty, Vec::as_slice);
            let wildcard = if header == PacketHeader::Any {
                empty
            } else {
                handlers.get(&PacketHeader::Any).map_or(empty, Vec::as_slice)
            };
            merge_ordered(concrete, wildcard)
        };

        if callbacks.is_empty() {
            warn!(header = header.name(), "packet has no registered handler");
            return;
        }
        for callback in callbacks {
            callback(from, packet);
        }
    }
}

/// Merge two slices already sorted by (priority, seq) into one ordered
/// callback list. Sequence numbers are globally unique, so the comparison
/// never ties.
fn merge_ordered(a: &[Registration], b: &[Registration]) -> Vec<Arc<HandlerFn>> {
    let mut out = Vec::with_capacity(a.len() + b.len());
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        if (a[i].priority, a[i].seq) <= (b[j].priority, b[j].seq) {
            out.push(a[i].callback.clone());
            i += 1;
        } else {
            out.push(b[j].callback.clone());
            j += 1;
        }
    }
    out.extend(a[i..].iter().map(|reg| reg.callback.clone()));
    out.extend(b[j..].iter().map(|reg| reg.callback.clone()));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn record(
        log: &Arc<Mutex<Vec<&'static str>>>,
        tag: &'static str,
    ) -> impl Fn(Option<&Arc<Peer>>, &ParsedPacket) + Send + Sync {
        let log = log.clone();
        move |_, _| log.lock().expect("log lock").push(tag)
    }

    #[test]
    fn ascending_priority_with_wildcard_interleave() {
        let dispatcher = Dispatcher::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        dispatcher
            .register(PacketHeader::Chat, 3, "t", "mid", record(&log, "chat-3"))
            .expect("register");
        dispatcher
            .register(PacketHeader::Any, 1, "t", "first", record(&log, "any-1"))
            .expect("register");
        dispatcher
            .register(PacketHeader::Chat, 10, "t", "obs", record(&log, "chat-10"))
            .expect("register");
        dispatcher
            .register(PacketHeader::Any, 5, "t", "late", record(&log, "any-5"))
            .expect("register");

        dispatcher.dispatch(
            None,
            &ParsedPacket::Chat {
                message: "x".into(),
            },
        );
        assert_eq!(
            *log.lock().expect("log lock"),
            vec!["any-1", "chat-3", "any-5", "chat-10"]
        );
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let dispatcher = Dispatcher::new();
        dispatcher
            .register(PacketHeader::Ping, 1, "o", "h", |_, _| {})
            .expect("first");
        assert!(dispatcher
            .register(PacketHeader::Ping, 2, "o", "h", |_, _| {})
            .is_err());
        // Same name under a different header is a distinct registration.
        dispatcher
            .register(PacketHeader::Chat, 1, "o", "h", |_, _| {})
            .expect("different header");
    }

    #[test]
    fn priority_out_of_range_is_rejected() {
        let dispatcher = Dispatcher::new();
        assert!(dispatcher
            .register(PacketHeader::Ping, 0, "o", "low", |_, _| {})
            .is_err());
        assert!(dispatcher
            .register(PacketHeader::Ping, 11, "o", "high", |_, _| {})
            .is_err());
    }

    #[test]
    fn unregister_owner_removes_across_headers() {
        let dispatcher = Dispatcher::new();
        dispatcher
            .register(PacketHeader::Ping, 1, "gone", "a", |_, _| {})
            .expect("register");
        dispatcher
            .register(PacketHeader::Any, 1, "gone", "b", |_, _| {})
            .expect("register");
        dispatcher
            .register(PacketHeader::Ping, 1, "stays", "c", |_, _| {})
            .expect("register");

        dispatcher.unregister_owner("gone");
        assert_eq!(dispatcher.handler_count(PacketHeader::Ping), 1);
    }

    #[test]
    fn zero_handler_dispatch_does_not_panic() {
        let dispatcher = Dispatcher::new();
        dispatcher.dispatch(None, &ParsedPacket::BeginCountdown);
    }
}
