use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::channel::{run_acceptor, AcceptorConfig};
use crate::config::Config;
use crate::consts::{OfType, Role};
use crate::dispatch::{HaListener, MessageDispatcher, MessageListener};
use crate::error::Error;
use crate::message::WireCodec;
use crate::registry::{NullClusterView, SwitchRegistry};
use crate::role::{RoleChanger, RoleInfo, RoleManager};
use crate::switch::{Dpid, Switch};

/// The controller's public surface: the one object an embedding binary
/// constructs, registers listeners on, and runs ([SPEC_FULL] §2, §4). Mirrors
/// `Hci`'s role as the facade over a handful of internally-spawned tasks.
pub struct Controller {
    codec: Arc<dyn WireCodec>,
    registry: Arc<SwitchRegistry>,
    role_manager: Arc<RoleManager>,
    role_changer: Arc<RoleChanger>,
    dispatcher: Arc<MessageDispatcher>,
    acceptor: Mutex<Option<JoinHandle<()>>>,
    dispatch_loop: Mutex<Option<JoinHandle<()>>>,
}

impl Controller {
    /// Wires the Switch Registry, Role Manager, Role Changer and Message
    /// Dispatcher together, but does not yet bind a listener or start the
    /// update-dispatch loop - call [`Controller::run`] for that, after
    /// registering whatever listeners the embedding binary needs.
    pub fn new(codec: Arc<dyn WireCodec>, config: &Config) -> Arc<Self> {
        let role_changer = Arc::new(RoleChanger::new(codec.clone()));
        let (dispatcher, update_rx) = MessageDispatcher::new();
        let role_manager = RoleManager::new(role_changer.clone(), dispatcher.update_sender(), config.initial_role);
        let registry = Arc::new(SwitchRegistry::new(NullClusterView));

        let dispatch_loop = tokio::spawn(dispatcher.clone().run_update_loop(update_rx));

        Arc::new(Self {
            codec,
            registry,
            role_manager,
            role_changer,
            dispatcher,
            acceptor: Mutex::new(None),
            dispatch_loop: Mutex::new(Some(dispatch_loop)),
        })
    }

    /// Binds `config.bind_addr` and spawns the Connection Acceptor task.
    /// Idempotent-refusing: a second call while one is already running
    /// returns `Err` rather than silently leaking a second listener.
    pub fn run(self: &Arc<Self>, config: &Config) -> Result<(), Error> {
        let mut acceptor = self.acceptor.lock();
        if acceptor.is_some() {
            return Err(Error::InvalidConfig { key: "bind_addr", value: "acceptor already running".to_string() });
        }

        let acceptor_config = AcceptorConfig::new(config.bind_addr);
        let codec = self.codec.clone();
        let registry = self.registry.clone();
        let role_manager = self.role_manager.clone();
        let role_changer = self.role_changer.clone();
        let dispatcher = self.dispatcher.clone();
        let handle = tokio::spawn(async move {
            if let Err(err) = run_acceptor(acceptor_config, codec, registry, role_manager, role_changer, dispatcher).await {
                error!("connection acceptor exited: {err}");
            }
        });
        *acceptor = Some(handle);
        Ok(())
    }

    pub fn add_listener(&self, msg_type: OfType, listener: Arc<dyn MessageListener>) {
        self.dispatcher.listeners().add_listener(msg_type, listener);
    }

    pub fn remove_listener(&self, msg_type: OfType, listener: &Arc<dyn MessageListener>) {
        self.dispatcher.listeners().remove_listener(msg_type, listener);
    }

    pub fn add_ha_listener(&self, listener: Arc<dyn HaListener>) {
        self.dispatcher.listeners().add_ha_listener(listener);
    }

    pub fn set_role(self: &Arc<Self>, role: Role, description: impl Into<String>) {
        self.role_manager.set_role(role, description);
    }

    pub fn get_role_info(&self) -> RoleInfo {
        self.role_manager.get_role_info()
    }

    /// Re-sends the controller's current role to `sw`, a no-op unless the
    /// role already matches and nothing is in flight for it ([SPEC_FULL] §4.2).
    pub fn reassert_role(&self, sw: &Arc<Switch>, role: Role) -> Result<(), Error> {
        self.role_manager.reassert_role(sw, role)
    }

    pub fn get_switch(&self, dpid: Dpid) -> Option<Arc<Switch>> {
        self.registry.get_switch(dpid)
    }

    pub fn get_all_dpids(&self) -> Vec<Dpid> {
        self.registry.get_all_dpids()
    }

    /// Aborts the acceptor and update-dispatch loop and waits for both to
    /// finish, per the teacher's take-and-await shutdown idiom.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.acceptor.lock().take() {
            handle.abort();
            let _ = handle.await;
        } else {
            debug!("Controller::shutdown: acceptor was not running");
        }
        if let Some(handle) = self.dispatch_loop.lock().take() {
            handle.abort();
            let _ = handle.await;
        }
        self.role_changer.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use std::sync::atomic::{AtomicUsize, Ordering};

    use bytes::Bytes;

    use super::*;
    use crate::dispatch::{Command, ListenerContext};
    use crate::message::{BuiltinCodec, OfMessage};
    use crate::switch::SwitchHandle;

    fn test_config() -> Config {
        // port 0 lets the OS pick an ephemeral port, so tests never collide
        // with each other or a real OpenFlow listener on the default port.
        let mut map = std::collections::HashMap::new();
        map.insert("openflowport".to_string(), "0".to_string());
        Config::from_map(&map).unwrap()
    }

    #[tokio::test]
    async fn new_starts_with_no_switches_and_the_configured_role() {
        let controller = Controller::new(Arc::new(BuiltinCodec), &test_config());
        assert!(controller.get_all_dpids().is_empty());
        assert_eq!(controller.get_role_info().role, Role::Master);
        controller.shutdown().await;
    }

    #[tokio::test]
    async fn run_refuses_a_second_acceptor() {
        let config = test_config();
        let controller = Controller::new(Arc::new(BuiltinCodec), &config);
        controller.run(&config).unwrap();
        assert!(controller.run(&config).is_err());
        controller.shutdown().await;
    }

    #[tokio::test]
    async fn registered_listener_observes_dispatched_messages() {
        struct NullHandle;
        impl SwitchHandle for NullHandle {
            fn send(&self, _data: Bytes) -> Result<(), Error> {
                Ok(())
            }
            fn disconnect(&self) {}
            fn remote_addr(&self) -> SocketAddr {
                SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 6633)
            }
        }
        struct CountingListener(Arc<AtomicUsize>);
        impl MessageListener for CountingListener {
            fn receive(&self, _sw: &Switch, _msg: &OfMessage, _ctx: &mut ListenerContext) -> Command {
                self.0.fetch_add(1, Ordering::SeqCst);
                Command::Continue
            }
            fn name(&self) -> &str {
                "counting"
            }
        }

        let controller = Controller::new(Arc::new(BuiltinCodec), &test_config());
        let counter = Arc::new(AtomicUsize::new(0));
        controller.add_listener(OfType::EchoRequest, Arc::new(CountingListener(counter.clone())));

        let sw = Switch::new(Dpid(1), Box::new(NullHandle));
        controller.dispatcher.dispatch_message(&sw, &OfMessage::EchoRequest { xid: 1, payload: Bytes::new() });
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        controller.shutdown().await;
    }
}
