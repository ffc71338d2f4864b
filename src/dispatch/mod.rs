mod guard;
mod listener;

use std::net::IpAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error};

pub use self::guard::{DispatchGuard, DispatchPermit};
pub use self::listener::{Command, ContextPool, EthernetHeader, HaListener, ListenerContext, ListenerRegistry, MessageListener};
use crate::consts::Role;
use crate::message::OfMessage;
use crate::switch::{Dpid, Switch};
use crate::utils::MutexCell;

/// Default capacity of the update queue ("bounded blocking FIFO", [SPEC_FULL] §4.5).
pub const DEFAULT_UPDATE_QUEUE_SIZE: usize = 1024;

/// A unit of work produced by the core and consumed strictly FIFO by the
/// single dispatch loop ([SPEC_FULL] §3 "Update").
#[derive(Debug, Clone)]
pub enum Update {
    SwitchAdded(Arc<Switch>),
    SwitchRemoved(Arc<Switch>),
    SwitchPortChanged(Dpid),
    HaRoleChanged(Role),
    ControllerNodeIpsChanged { current: Vec<IpAddr>, added: Vec<IpAddr>, removed: Vec<IpAddr> },
}

/// Dispatches OpenFlow messages to registered listeners under role-aware
/// admission control, and drains the single-consumer update queue
/// ([SPEC_FULL] §4.5).
pub struct MessageDispatcher {
    guard: Arc<DispatchGuard>,
    listeners: Arc<ListenerRegistry>,
    ctx_pool: ContextPool,
    update_tx: mpsc::Sender<Update>,
    last_role: MutexCell<Option<Role>>,
}

impl MessageDispatcher {
    pub fn new() -> (Arc<Self>, mpsc::Receiver<Update>) {
        Self::with_queue_size(DEFAULT_UPDATE_QUEUE_SIZE)
    }

    pub fn with_queue_size(queue_size: usize) -> (Arc<Self>, mpsc::Receiver<Update>) {
        let (update_tx, update_rx) = mpsc::channel(queue_size);
        let dispatcher = Arc::new(Self {
            guard: Arc::new(DispatchGuard::new()),
            listeners: Arc::new(ListenerRegistry::new()),
            ctx_pool: ContextPool::new(),
            update_tx,
            last_role: MutexCell::new(None),
        });
        (dispatcher, update_rx)
    }

    pub fn guard(&self) -> Arc<DispatchGuard> {
        self.guard.clone()
    }

    pub fn listeners(&self) -> Arc<ListenerRegistry> {
        self.listeners.clone()
    }

    pub fn update_sender(&self) -> mpsc::Sender<Update> {
        self.update_tx.clone()
    }

    /// Steps 1-5 of [SPEC_FULL] §4.5's dispatch algorithm.
    pub fn dispatch_message(&self, sw: &Switch, msg: &OfMessage) {
        let Some(_permit) = self.guard.acquire() else {
            debug!("dropping message for {} while dispatch is disabled", sw.dpid);
            return;
        };

        let listeners = self.listeners.listeners_for(msg.of_type());
        if listeners.is_empty() {
            return;
        }

        let mut ctx = self.ctx_pool.acquire();
        if let OfMessage::PacketIn { payload, .. } = msg {
            ctx.ethernet = EthernetHeader::parse(payload);
        }

        for listener in listeners.iter() {
            if !listener.is_interested(sw) {
                continue;
            }
            let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| listener.receive(sw, msg, &mut ctx)));
            match outcome {
                Ok(Command::Continue) => {}
                Ok(Command::Stop) => break,
                Err(_) => {
                    error!("listener {} panicked while handling a message from {}", listener.name(), sw.dpid);
                }
            }
        }

        self.ctx_pool.release(ctx);
    }

    /// The dispatch loop's single consumer task. Runs until every
    /// [`mpsc::Sender<Update>`] handle is dropped.
    pub async fn run_update_loop(self: Arc<Self>, mut update_rx: mpsc::Receiver<Update>) {
        while let Some(update) = update_rx.recv().await {
            self.handle_update(update).await;
        }
        debug!("update queue closed, dispatch loop exiting");
    }

    async fn handle_update(&self, update: Update) {
        match update {
            Update::HaRoleChanged(new_role) => self.handle_role_changed(new_role),
            Update::SwitchAdded(sw) => debug!("switch {} added", sw.dpid),
            Update::SwitchRemoved(sw) => debug!("switch {} removed", sw.dpid),
            Update::SwitchPortChanged(dpid) => debug!("switch {dpid} port changed"),
            Update::ControllerNodeIpsChanged { added, removed, .. } => {
                debug!("controller node IPs changed: +{} -{}", added.len(), removed.len());
            }
        }
    }

    /// Disables the guard BEFORE notifying HA listeners of a SLAVE
    /// transition, and re-enables it AFTER notifying them of a non-SLAVE
    /// transition - this is what makes the transition atomic with respect to
    /// in-flight `dispatch_message` calls ([SPEC_FULL] §4.5, §5).
    fn handle_role_changed(&self, new_role: Role) {
        let old_role = self.last_role.replace(Some(new_role));
        if new_role == Role::Slave {
            self.guard.disable();
        }
        for listener in self.listeners.ha_listeners().iter() {
            let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| listener.role_changed(old_role, new_role)));
            if outcome.is_err() {
                error!("an HA listener panicked while handling a role change to {new_role:?}");
            }
        }
        if new_role != Role::Slave {
            self.guard.enable();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    use bytes::Bytes;

    use super::*;
    use crate::consts::OfType;
    use crate::error::Error;
    use crate::switch::{Dpid, SwitchHandle};

    struct NullHandle;
    impl SwitchHandle for NullHandle {
        fn send(&self, _data: Bytes) -> Result<(), Error> {
            Ok(())
        }
        fn disconnect(&self) {}
        fn remote_addr(&self) -> std::net::SocketAddr {
            std::net::SocketAddr::new(std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST), 6633)
        }
    }

    struct CountingListener(AtomicUsize);
    impl MessageListener for CountingListener {
        fn receive(&self, _sw: &Switch, _msg: &OfMessage, _ctx: &mut ListenerContext) -> Command {
            self.0.fetch_add(1, Ordering::SeqCst);
            Command::Continue
        }
        fn name(&self) -> &str {
            "counting"
        }
    }

    struct StoppingListener;
    impl MessageListener for StoppingListener {
        fn receive(&self, _sw: &Switch, _msg: &OfMessage, _ctx: &mut ListenerContext) -> Command {
            Command::Stop
        }
        fn name(&self) -> &str {
            "stopping"
        }
    }

    fn switch() -> Switch {
        Switch::new(Dpid(1), Box::new(NullHandle))
    }

    #[test]
    fn disabled_guard_drops_messages_silently() {
        let (dispatcher, _rx) = MessageDispatcher::new();
        let counter = Arc::new(CountingListener(AtomicUsize::new(0)));
        dispatcher.listeners().add_listener(OfType::EchoRequest, counter.clone());
        dispatcher.guard().disable();

        let sw = switch();
        dispatcher.dispatch_message(&sw, &OfMessage::EchoRequest { xid: 1, payload: Bytes::new() });
        assert_eq!(counter.0.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn stop_halts_further_listener_calls() {
        let (dispatcher, _rx) = MessageDispatcher::new();
        let counter = Arc::new(CountingListener(AtomicUsize::new(0)));
        dispatcher.listeners().add_listener(OfType::EchoRequest, Arc::new(StoppingListener));
        dispatcher.listeners().add_listener(OfType::EchoRequest, counter.clone());

        let sw = switch();
        dispatcher.dispatch_message(&sw, &OfMessage::EchoRequest { xid: 1, payload: Bytes::new() });
        assert_eq!(counter.0.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn packet_in_populates_ethernet_header() {
        let (dispatcher, _rx) = MessageDispatcher::new();
        let seen = Arc::new(StdMutex::new(None));
        struct Capture(Arc<StdMutex<Option<EthernetHeader>>>);
        impl MessageListener for Capture {
            fn receive(&self, _sw: &Switch, _msg: &OfMessage, ctx: &mut ListenerContext) -> Command {
                *self.0.lock().unwrap() = ctx.ethernet;
                Command::Continue
            }
            fn name(&self) -> &str {
                "capture"
            }
        }
        dispatcher.listeners().add_listener(OfType::PacketIn, Arc::new(Capture(seen.clone())));

        let mut payload = vec![0xaau8; 12];
        payload.extend_from_slice(&0x0806u16.to_be_bytes());
        let sw = switch();
        dispatcher.dispatch_message(&sw, &OfMessage::PacketIn { xid: 1, payload: Bytes::from(payload) });
        assert_eq!(seen.lock().unwrap().unwrap().ether_type, 0x0806);
    }

    #[tokio::test]
    async fn slave_transition_disables_guard_before_ha_listener_runs() {
        let (dispatcher, update_rx) = MessageDispatcher::new();
        struct Observer(Arc<DispatchGuard>, Arc<StdMutex<Option<bool>>>);
        impl HaListener for Observer {
            fn role_changed(&self, _old: Option<Role>, new: Role) {
                if new == Role::Slave {
                    *self.1.lock().unwrap() = Some(self.0.is_enabled());
                }
            }
        }
        let observed = Arc::new(StdMutex::new(None));
        dispatcher.listeners().add_ha_listener(Arc::new(Observer(dispatcher.guard(), observed.clone())));

        let tx = dispatcher.update_sender();
        let handle = tokio::spawn(dispatcher.clone().run_update_loop(update_rx));
        tx.send(Update::HaRoleChanged(Role::Slave)).await.unwrap();
        drop(tx);
        handle.await.unwrap();

        assert_eq!(*observed.lock().unwrap(), Some(false));
        assert!(!dispatcher.guard().is_enabled());
    }
}
