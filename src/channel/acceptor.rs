use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::{error, info};

use super::ChannelDeps;
use crate::message::WireCodec;
use crate::registry::SwitchRegistry;
use crate::role::{RoleChanger, RoleManager};

/// The Connection Acceptor's tunables ([SPEC_FULL] §4.1 "Connection Acceptor").
#[derive(Debug, Clone)]
pub struct AcceptorConfig {
    pub bind_addr: SocketAddr,
    pub handshake_timeout: Duration,
    pub idle_timeout: Duration,
    pub flush_switches_on_reconnect: bool,
}

impl AcceptorConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            handshake_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(60),
            flush_switches_on_reconnect: false,
        }
    }
}

/// Binds `config.bind_addr` and spawns one Channel Handler task per accepted
/// connection, forever, mirroring the core's "one connection, one task"
/// model ([SPEC_FULL] §4.1). Runs until the listener itself errors out, which
/// only happens if the OS socket is in a bad state - a single accepted
/// connection's problems never propagate past its own `run_channel` task.
pub async fn run_acceptor(
    config: AcceptorConfig,
    codec: Arc<dyn WireCodec>,
    registry: Arc<SwitchRegistry>,
    role_manager: Arc<RoleManager>,
    role_changer: Arc<RoleChanger>,
    dispatcher: Arc<crate::dispatch::MessageDispatcher>,
) -> Result<(), crate::error::Error> {
    let listener = TcpListener::bind(config.bind_addr).await?;
    info!("listening for OpenFlow connections on {}", config.bind_addr);

    let deps = Arc::new(ChannelDeps {
        codec,
        registry,
        role_manager,
        role_changer,
        dispatcher,
        handshake_timeout: config.handshake_timeout,
        idle_timeout: config.idle_timeout,
        flush_switches_on_reconnect: config.flush_switches_on_reconnect,
    });

    loop {
        let (stream, remote_addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                error!("failed to accept a connection: {err}");
                continue;
            }
        };
        info!("accepted connection from {remote_addr}");
        if let Err(err) = stream.set_nodelay(true) {
            error!("failed to set TCP_NODELAY for {remote_addr}: {err}");
        }
        tokio::spawn(super::run_channel(stream, remote_addr, deps.clone()));
    }
}
