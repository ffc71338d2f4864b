mod acceptor;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use instructor::Buffer;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tracing::{info, warn};

pub use self::acceptor::{run_acceptor, AcceptorConfig};
use crate::consts::{Role, OFPBRC_BAD_SUBTYPE, OFPBRC_BAD_VENDOR, OFPET_BAD_REQUEST};
use crate::dispatch::{MessageDispatcher, Update};
use crate::error::Error;
use crate::message::{OfHeader, OfMessage, WireCodec, OFP_HEADER_LEN};
use crate::registry::{AddOutcome, SwitchRegistry};
use crate::role::{RoleChanger, RoleManager};
use crate::switch::{Dpid, Switch, SwitchHandle};

/// The Channel Handler's handshake FSM ([SPEC_FULL] §4.1). `None` means the
/// handshake is complete and the channel is in its steady ACTIVE/SLAVE state
/// - at that point whether the switch is "ACTIVE" or "SLAVE" lives on
/// `Switch::role`, not here, since reassertion can change it again later.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum HandshakeState {
    WaitHello,
    WaitFeaturesReply,
    WaitConfigReply,
    WaitDescriptionStatsReply,
    WaitInitialRole,
}

impl HandshakeState {
    fn name(self) -> &'static str {
        match self {
            HandshakeState::WaitHello => "WAIT_HELLO",
            HandshakeState::WaitFeaturesReply => "WAIT_FEATURES_REPLY",
            HandshakeState::WaitConfigReply => "WAIT_CONFIG_REPLY",
            HandshakeState::WaitDescriptionStatsReply => "WAIT_DESCRIPTION_STATS_REPLY",
            HandshakeState::WaitInitialRole => "WAIT_INITIAL_ROLE",
        }
    }
}

/// The shared collaborators every Channel Handler task needs a handle to.
/// Cloned (cheaply, via the inner `Arc`s) into each spawned connection task
/// by the Connection Acceptor.
pub struct ChannelDeps {
    pub codec: Arc<dyn WireCodec>,
    pub registry: Arc<SwitchRegistry>,
    pub role_manager: Arc<RoleManager>,
    pub role_changer: Arc<RoleChanger>,
    pub dispatcher: Arc<MessageDispatcher>,
    pub handshake_timeout: Duration,
    pub idle_timeout: Duration,
    pub flush_switches_on_reconnect: bool,
}

/// The write-side handle handed to [`Switch`], backed by an unbounded queue
/// drained by the owning Channel Handler task - mirrors the teacher's
/// pattern of a single task owning transport I/O while every other
/// component only ever holds a cheap sender ([SPEC_FULL] §4.1).
struct TcpSwitchHandle {
    tx: mpsc::UnboundedSender<Bytes>,
    disconnect: Arc<Notify>,
    remote_addr: SocketAddr,
}

impl SwitchHandle for TcpSwitchHandle {
    fn send(&self, data: Bytes) -> Result<(), Error> {
        self.tx
            .send(data)
            .map_err(|_| Error::Io(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "channel handler has shut down")))
    }

    fn disconnect(&self) {
        self.disconnect.notify_one();
    }

    fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }
}

/// Entry point spawned once per accepted connection. A channel only ever
/// terminates through an error (I/O, protocol violation, timeout, or an
/// explicit disconnect) - there is no "graceful success" exit for a
/// long-lived switch connection.
pub async fn run_channel(stream: TcpStream, remote_addr: SocketAddr, deps: Arc<ChannelDeps>) {
    if let Err(err) = drive_channel(stream, remote_addr, &deps).await {
        info!("channel {remote_addr} closed: {err}");
    }
}

async fn drive_channel(stream: TcpStream, remote_addr: SocketAddr, deps: &ChannelDeps) -> Result<(), Error> {
    // Split so the read loop and the outbound-write branch of the select!
    // below can each hold their own mutable half instead of contending for
    // one `&mut TcpStream`.
    let (mut read_half, mut write_half) = stream.into_split();
    let mut buf = BytesMut::with_capacity(4096);
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Bytes>();
    let disconnect = Arc::new(Notify::new());
    let xid_counter = AtomicU32::new(0);
    let next_xid = || xid_counter.fetch_add(1, Ordering::Relaxed);

    write_out(&mut write_half, deps.codec.encode_hello(next_xid())).await?;

    let mut state = Some(HandshakeState::WaitHello);
    let mut sw: Option<Arc<Switch>> = None;
    let handshake_deadline = Instant::now() + deps.handshake_timeout;
    let mut idle_deadline = Instant::now() + deps.idle_timeout;

    let result: Result<(), Error> = loop {
        let deadline = if state.is_some() { handshake_deadline } else { idle_deadline };

        tokio::select! {
            biased;
            _ = disconnect.notified() => {
                break Err(Error::Io(std::io::Error::new(std::io::ErrorKind::ConnectionAborted, "disconnected by the core")));
            }
            _ = tokio::time::sleep_until(deadline) => {
                break Err(match state {
                    Some(s) => Error::HandshakeTimeout(s.name()),
                    None => Error::IdleTimeout,
                });
            }
            outgoing = outbound_rx.recv() => {
                match outgoing {
                    Some(bytes) => {
                        if let Err(err) = write_out(&mut write_half, bytes).await {
                            break Err(err);
                        }
                    }
                    None => unreachable!("the channel handler always holds a sender clone"),
                }
            }
            frame = read_message(&mut read_half, &mut buf) => {
                idle_deadline = Instant::now() + deps.idle_timeout;
                let (header, body) = match frame {
                    Ok(frame) => frame,
                    Err(err) => break Err(err),
                };
                let msg = match deps.codec.decode(header, body) {
                    Ok(msg) => msg,
                    Err(err) => break Err(Error::BadPacket(err)),
                };
                match handle_message(&mut write_half, &mut state, &mut sw, &msg, deps, remote_addr, &outbound_tx, &disconnect, next_xid).await {
                    Ok(()) => {}
                    Err(err) => break Err(err),
                }
            }
        }
    };

    if let Some(sw) = sw {
        deps.role_manager.remove_channel(&sw);
        sw.clear_pending();
        if deps.registry.remove_switch(&sw) {
            if deps.dispatcher.update_sender().send(Update::SwitchRemoved(sw.clone())).await.is_err() {
                warn!("{}", Error::DispatcherClosed);
            }
        }
    }
    result
}

/// One received message's effect on the handshake/steady-state.
#[allow(clippy::too_many_arguments)]
async fn handle_message(
    stream: &mut OwnedWriteHalf,
    state: &mut Option<HandshakeState>,
    sw: &mut Option<Arc<Switch>>,
    msg: &OfMessage,
    deps: &ChannelDeps,
    remote_addr: SocketAddr,
    outbound_tx: &mpsc::UnboundedSender<Bytes>,
    disconnect: &Arc<Notify>,
    next_xid: impl Fn() -> u32,
) -> Result<(), Error> {
    // Echo requests are answered locally in every state and never reach the dispatcher.
    if let OfMessage::EchoRequest { xid, payload } = msg {
        write_out(stream, deps.codec.encode_echo_reply(*xid, payload.clone())).await?;
        return Ok(());
    }

    if let Some(current) = *state {
        return handle_handshake_message(stream, state, sw, current, msg, deps, remote_addr, outbound_tx, disconnect, next_xid).await;
    }

    let sw = sw.as_ref().expect("steady state implies a switch exists");
    match msg {
        OfMessage::RoleReply { xid, role } => {
            let role = Role::try_from(*role).map_err(|_| Error::protocol(Some(sw.dpid), "unrecognized nx_role value"))?;
            if !deps.role_changer.check_first_pending_role_request_xid(sw, *xid) {
                warn!("switch {} sent a role reply with xid {} not at the head of its pending queue", sw.dpid, xid);
            }
            deps.role_changer.deliver_role_reply(sw, *xid, role)
        }
        OfMessage::Error { xid, error_type, code, .. } if is_role_not_supported(*error_type, *code) => {
            deps.role_changer.deliver_role_request_not_supported(sw, *xid)
        }
        _ => {
            deps.dispatcher.dispatch_message(sw, msg);
            Ok(())
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_handshake_message(
    stream: &mut OwnedWriteHalf,
    state: &mut Option<HandshakeState>,
    sw: &mut Option<Arc<Switch>>,
    current: HandshakeState,
    msg: &OfMessage,
    deps: &ChannelDeps,
    remote_addr: SocketAddr,
    outbound_tx: &mpsc::UnboundedSender<Bytes>,
    disconnect: &Arc<Notify>,
    next_xid: impl Fn() -> u32,
) -> Result<(), Error> {
    match (current, msg) {
        (HandshakeState::WaitHello, OfMessage::Hello { .. }) => {
            write_out(stream, deps.codec.encode_features_request(next_xid())).await?;
            *state = Some(HandshakeState::WaitFeaturesReply);
            Ok(())
        }
        (HandshakeState::WaitFeaturesReply, OfMessage::FeaturesReply { dpid, .. }) => {
            let handle: Box<dyn SwitchHandle> =
                Box::new(TcpSwitchHandle { tx: outbound_tx.clone(), disconnect: disconnect.clone(), remote_addr });
            let new_sw = Arc::new(Switch::new(Dpid(*dpid), handle));

            write_out(stream, deps.codec.encode_set_config(next_xid())).await?;
            write_out(stream, deps.codec.encode_get_config_request(next_xid())).await?;
            *sw = Some(new_sw);
            *state = Some(HandshakeState::WaitConfigReply);
            Ok(())
        }
        (HandshakeState::WaitConfigReply, OfMessage::GetConfigReply { .. }) => {
            write_out(stream, deps.codec.encode_desc_stats_request(next_xid())).await?;
            *state = Some(HandshakeState::WaitDescriptionStatsReply);
            Ok(())
        }
        (HandshakeState::WaitDescriptionStatsReply, OfMessage::StatsReplyDesc { .. }) => {
            let current_sw = sw.as_ref().expect("switch exists once FeaturesReply is parsed");
            deps.role_manager.add_channel_and_send_initial_role(current_sw.clone())?;
            *state = Some(HandshakeState::WaitInitialRole);
            Ok(())
        }
        (HandshakeState::WaitInitialRole, OfMessage::RoleReply { xid, role }) => {
            let current_sw = sw.as_ref().expect("switch exists once FeaturesReply is parsed");
            let role = Role::try_from(*role).map_err(|_| Error::protocol(Some(current_sw.dpid), "unrecognized nx_role value"))?;
            if !deps.role_changer.check_first_pending_role_request_xid(current_sw, *xid) {
                warn!("switch {} sent its initial role reply with xid {} not at the head of its pending queue", current_sw.dpid, xid);
            }
            deps.role_changer.deliver_role_reply(current_sw, *xid, role)?;
            activate_switch(current_sw.clone(), deps).await;
            *state = None;
            Ok(())
        }
        (HandshakeState::WaitInitialRole, OfMessage::Error { xid, error_type, code, .. }) if is_role_not_supported(*error_type, *code) => {
            let current_sw = sw.as_ref().expect("switch exists once FeaturesReply is parsed");
            deps.role_changer.deliver_role_request_not_supported(current_sw, *xid)?;
            activate_switch(current_sw.clone(), deps).await;
            *state = None;
            Ok(())
        }
        _ => Err(Error::UnexpectedMessage { expected: current.name(), actual: msg.of_type(), dpid: sw.as_ref().map(|s| s.dpid) }),
    }
}

/// Promotes a switch to "active" ([SPEC_FULL] §3): only reached once the
/// handshake has run to completion AND the initial role request has either
/// succeeded or been determined unsupported, never at `FeaturesReply` time.
async fn activate_switch(new_sw: Arc<Switch>, deps: &ChannelDeps) {
    if let AddOutcome::Replaced(old) = deps.registry.add_switch(new_sw.clone()) {
        deps.role_manager.remove_channel(&old);
        old.clear_pending();
        if deps.dispatcher.update_sender().send(Update::SwitchRemoved(old)).await.is_err() {
            warn!("{}", Error::DispatcherClosed);
        }
    }
    if deps.flush_switches_on_reconnect {
        new_sw.flush_flow_mods();
    }
    if deps.dispatcher.update_sender().send(Update::SwitchAdded(new_sw)).await.is_err() {
        warn!("{}", Error::DispatcherClosed);
    }
}

fn is_role_not_supported(error_type: u16, code: u16) -> bool {
    error_type == OFPET_BAD_REQUEST && (code == OFPBRC_BAD_VENDOR || code == OFPBRC_BAD_SUBTYPE)
}

async fn write_out(stream: &mut OwnedWriteHalf, data: Bytes) -> Result<(), Error> {
    use tokio::io::AsyncWriteExt;
    stream.write_all(&data).await?;
    Ok(())
}

/// Reads one complete OpenFlow frame, growing `buf` with reads from `stream`
/// until a full message (per its self-inclusive `length` field) is present.
async fn read_message(stream: &mut OwnedReadHalf, buf: &mut BytesMut) -> Result<(OfHeader, Bytes), Error> {
    use tokio::io::AsyncReadExt;
    loop {
        if buf.len() >= OFP_HEADER_LEN {
            let length = u16::from_be_bytes([buf[2], buf[3]]) as usize;
            if length < OFP_HEADER_LEN {
                return Err(Error::FramingError(length));
            }
            if buf.len() >= length {
                let mut frame = buf.split_to(length).freeze();
                let header: OfHeader = frame.read_be()?;
                if header.body_len()? != frame.remaining() {
                    return Err(Error::FramingError(header.length as usize));
                }
                return Ok((header, frame));
            }
        }
        let n = stream.read_buf(buf).await?;
        if n == 0 {
            return Err(Error::Io(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "peer closed the connection")));
        }
    }
}
