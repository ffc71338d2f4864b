use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::consts::{OfType, Role};
use crate::message::OfMessage;
use crate::switch::Switch;

/// Whether dispatch continues to the next listener or halts immediately.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Command {
    Continue,
    Stop,
}

/// A best-effort Ethernet header, parsed once per `PACKET_IN` and shared with
/// every listener through [`ListenerContext`] rather than re-parsed by each
/// one ([SPEC_FULL] §4.5).
#[derive(Debug, Clone, Copy)]
pub struct EthernetHeader {
    pub dst: [u8; 6],
    pub src: [u8; 6],
    pub ether_type: u16,
}

impl EthernetHeader {
    pub fn parse(payload: &[u8]) -> Option<Self> {
        if payload.len() < 14 {
            return None;
        }
        let mut dst = [0u8; 6];
        let mut src = [0u8; 6];
        dst.copy_from_slice(&payload[0..6]);
        src.copy_from_slice(&payload[6..12]);
        let ether_type = u16::from_be_bytes([payload[12], payload[13]]);
        Some(Self { dst, src, ether_type })
    }
}

/// Per-dispatch scratch space, pooled and reused across calls ([SPEC_FULL] §4.5).
#[derive(Debug, Default)]
pub struct ListenerContext {
    pub ethernet: Option<EthernetHeader>,
}

impl ListenerContext {
    fn reset(&mut self) {
        self.ethernet = None;
    }
}

/// A free-list of [`ListenerContext`]s, avoiding an allocation on every
/// dispatched message.
#[derive(Default)]
pub struct ContextPool {
    free: Mutex<Vec<Box<ListenerContext>>>,
}

impl ContextPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self) -> Box<ListenerContext> {
        let mut ctx = self.free.lock().pop().unwrap_or_default();
        ctx.reset();
        ctx
    }

    pub fn release(&self, ctx: Box<ListenerContext>) {
        self.free.lock().push(ctx);
    }
}

/// A per-message-type listener ([SPEC_FULL] §6 "Listener registration contract").
pub trait MessageListener: Send + Sync {
    fn receive(&self, sw: &Switch, msg: &OfMessage, ctx: &mut ListenerContext) -> Command;

    /// Switch-filter capability: `false` skips this listener for `sw`.
    fn is_interested(&self, _sw: &Switch) -> bool {
        true
    }

    fn name(&self) -> &str;
}

/// Notified of HA role transitions, distinct from per-message listeners
/// since a role change is not an `OfMessage`.
pub trait HaListener: Send + Sync {
    fn role_changed(&self, old: Option<Role>, new: Role);
}

/// Ordered, copy-on-write listener lists, keyed by message type for
/// [`MessageListener`]s and a single list for [`HaListener`]s
/// ([SPEC_FULL] §5 "listener lists use copy-on-write replacement").
#[derive(Default)]
pub struct ListenerRegistry {
    by_type: parking_lot::RwLock<HashMap<OfType, Arc<Vec<Arc<dyn MessageListener>>>>>,
    ha_listeners: parking_lot::RwLock<Arc<Vec<Arc<dyn HaListener>>>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `listener` to the end of `msg_type`'s list, preserving the
    /// registration order that gives the dispatch loop its prerequisites-
    /// first ordering.
    pub fn add_listener(&self, msg_type: OfType, listener: Arc<dyn MessageListener>) {
        let mut by_type = self.by_type.write();
        let mut updated = by_type.get(&msg_type).map(|list| (**list).clone()).unwrap_or_default();
        updated.push(listener);
        by_type.insert(msg_type, Arc::new(updated));
    }

    pub fn remove_listener(&self, msg_type: OfType, listener: &Arc<dyn MessageListener>) {
        let mut by_type = self.by_type.write();
        if let Some(list) = by_type.get(&msg_type) {
            let updated: Vec<_> = list.iter().filter(|l| !Arc::ptr_eq(l, listener)).cloned().collect();
            by_type.insert(msg_type, Arc::new(updated));
        }
    }

    pub fn listeners_for(&self, msg_type: OfType) -> Arc<Vec<Arc<dyn MessageListener>>> {
        self.by_type.read().get(&msg_type).cloned().unwrap_or_default()
    }

    pub fn add_ha_listener(&self, listener: Arc<dyn HaListener>) {
        let mut guard = self.ha_listeners.write();
        let mut updated = (**guard).clone();
        updated.push(listener);
        *guard = Arc::new(updated);
    }

    pub fn ha_listeners(&self) -> Arc<Vec<Arc<dyn HaListener>>> {
        self.ha_listeners.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo(&'static str);

    impl MessageListener for Echo {
        fn receive(&self, _sw: &Switch, _msg: &OfMessage, _ctx: &mut ListenerContext) -> Command {
            Command::Continue
        }

        fn name(&self) -> &str {
            self.0
        }
    }

    #[test]
    fn registration_preserves_order_and_supports_removal() {
        let registry = ListenerRegistry::new();
        let a: Arc<dyn MessageListener> = Arc::new(Echo("a"));
        let b: Arc<dyn MessageListener> = Arc::new(Echo("b"));
        registry.add_listener(OfType::PacketIn, a.clone());
        registry.add_listener(OfType::PacketIn, b.clone());
        let listeners = registry.listeners_for(OfType::PacketIn);
        assert_eq!(listeners.iter().map(|l| l.name()).collect::<Vec<_>>(), vec!["a", "b"]);

        registry.remove_listener(OfType::PacketIn, &a);
        let listeners = registry.listeners_for(OfType::PacketIn);
        assert_eq!(listeners.iter().map(|l| l.name()).collect::<Vec<_>>(), vec!["b"]);
    }

    #[test]
    fn ethernet_header_parses_fixed_fields() {
        let mut frame = vec![0xffu8; 12];
        frame.extend_from_slice(&0x0800u16.to_be_bytes());
        frame.extend_from_slice(&[1, 2, 3]);
        let header = EthernetHeader::parse(&frame).unwrap();
        assert_eq!(header.ether_type, 0x0800);
    }
}
