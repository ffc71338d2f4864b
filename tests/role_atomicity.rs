//! Drives two real TCP connections through the full handshake against a
//! `TcpListener`-backed acceptor and exercises the SLAVE-transition
//! atomicity property (testable property #3): once the HA role flips to
//! SLAVE, no `PACKET_IN` dispatched concurrently with (or after) that flip
//! reaches a registered listener, even though the underlying bytes keep
//! arriving on the wire.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BufMut, BytesMut};
use switchboard::channel::{run_channel, ChannelDeps};
use switchboard::consts::{Role, NXT_ROLE_REPLY, NX_VENDOR_ID};
use switchboard::dispatch::HaListener;
use switchboard::registry::{NullClusterView, SwitchRegistry};
use switchboard::role::{RoleChanger, RoleManager};
use switchboard::{BuiltinCodec, Command, ListenerContext, MessageDispatcher, MessageListener, OfMessage, Switch};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;

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

struct SlaveObserved(Arc<Notify>);

impl HaListener for SlaveObserved {
    fn role_changed(&self, _old: Option<Role>, new: Role) {
        if new == Role::Slave {
            self.0.notify_one();
        }
    }
}

/// Writes one OpenFlow frame: `version=1, of_type, length=8+body.len(), xid`.
async fn write_frame(stream: &mut TcpStream, of_type: u8, xid: u32, body: &[u8]) {
    use tokio::io::AsyncWriteExt;
    let mut buf = BytesMut::with_capacity(8 + body.len());
    buf.put_u8(1);
    buf.put_u8(of_type);
    buf.put_u16((8 + body.len()) as u16);
    buf.put_u32(xid);
    buf.put_slice(body);
    stream.write_all(&buf).await.unwrap();
}

/// Reads one OpenFlow frame and returns `(of_type, xid, body)`.
async fn read_frame(stream: &mut TcpStream) -> (u8, u32, BytesMut) {
    use tokio::io::AsyncReadExt;
    let mut header = [0u8; 8];
    stream.read_exact(&mut header).await.unwrap();
    let of_type = header[1];
    let length = u16::from_be_bytes([header[2], header[3]]) as usize;
    let xid = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
    let mut body = BytesMut::zeroed(length - 8);
    stream.read_exact(&mut body).await.unwrap();
    (of_type, xid, body)
}

/// Drives a single switch connection through the full handshake up to
/// steady state, replying to the controller's initial role request with
/// whatever role it asked for.
async fn complete_handshake(stream: &mut TcpStream, dpid: u64) {
    // Controller's Hello arrives first.
    let (of_type, ..) = read_frame(stream).await;
    assert_eq!(of_type, 0); // Hello

    write_frame(stream, 0, 1, &[]).await; // our Hello

    let (of_type, ..) = read_frame(stream).await;
    assert_eq!(of_type, 5); // FeaturesRequest
    let mut body = BytesMut::new();
    body.put_u64(dpid);
    write_frame(stream, 6, 2, &body).await; // FeaturesReply

    let (of_type, ..) = read_frame(stream).await;
    assert_eq!(of_type, 9); // SetConfig
    let (of_type, ..) = read_frame(stream).await;
    assert_eq!(of_type, 7); // GetConfigRequest
    write_frame(stream, 8, 3, &[0, 0]).await; // GetConfigReply

    let (of_type, _xid, _body) = read_frame(stream).await;
    assert_eq!(of_type, 16); // StatsRequest (desc)
    let mut desc_body = BytesMut::new();
    desc_body.put_u16(0); // OFPST_DESC
    desc_body.put_u16(0); // flags
    write_frame(stream, 17, 4, &desc_body).await; // StatsReply(Desc)

    // Initial NX role request.
    let (of_type, role_xid, mut body) = read_frame(stream).await;
    assert_eq!(of_type, 4); // Vendor
    let vendor_id = body.get_u32();
    assert_eq!(vendor_id, NX_VENDOR_ID);
    let _subtype = body.get_u32();
    let requested_role = body.get_u32();

    let mut reply = BytesMut::new();
    reply.put_u32(NX_VENDOR_ID);
    reply.put_u32(NXT_ROLE_REPLY);
    reply.put_u32(requested_role);
    write_frame(stream, 4, role_xid, &reply).await;
}

async fn send_packet_in(stream: &mut TcpStream, xid: u32) {
    write_frame(stream, 10, xid, &[0xaa; 20]).await;
}

struct Harness {
    listener_addr: SocketAddr,
    dispatcher: Arc<MessageDispatcher>,
    role_manager: Arc<RoleManager>,
    role_changer: Arc<RoleChanger>,
    counter: Arc<AtomicUsize>,
    slave_observed: Arc<Notify>,
    dispatch_loop: tokio::task::JoinHandle<()>,
    acceptor: tokio::task::JoinHandle<()>,
}

async fn start_harness() -> Harness {
    let codec: Arc<dyn switchboard::WireCodec> = Arc::new(BuiltinCodec);
    let role_changer = Arc::new(RoleChanger::new(codec.clone()));
    let (dispatcher, update_rx) = MessageDispatcher::new();
    let role_manager = RoleManager::new(role_changer.clone(), dispatcher.update_sender(), Role::Master);
    let registry = Arc::new(SwitchRegistry::new(NullClusterView));

    let counter = Arc::new(AtomicUsize::new(0));
    dispatcher
        .listeners()
        .add_listener(switchboard::consts::OfType::PacketIn, Arc::new(CountingListener(counter.clone())));
    let slave_observed = Arc::new(Notify::new());
    dispatcher.listeners().add_ha_listener(Arc::new(SlaveObserved(slave_observed.clone())));

    let dispatch_loop = tokio::spawn(dispatcher.clone().run_update_loop(update_rx));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let listener_addr = listener.local_addr().unwrap();

    let deps = Arc::new(ChannelDeps {
        codec,
        registry,
        role_manager: role_manager.clone(),
        role_changer: role_changer.clone(),
        dispatcher: dispatcher.clone(),
        handshake_timeout: Duration::from_secs(5),
        idle_timeout: Duration::from_secs(30),
        flush_switches_on_reconnect: false,
    });
    let acceptor = tokio::spawn(async move {
        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(_) => break,
            };
            tokio::spawn(run_channel(stream, addr, deps.clone()));
        }
    });

    Harness { listener_addr, dispatcher, role_manager, role_changer, counter, slave_observed, dispatch_loop, acceptor }
}

impl Harness {
    async fn shutdown(self) {
        self.acceptor.abort();
        self.dispatch_loop.abort();
        self.role_changer.shutdown().await;
        let _ = self.dispatcher;
        let _ = self.role_manager;
    }
}

#[tokio::test]
async fn slave_transition_stops_dispatch_for_every_connected_switch() {
    let harness = start_harness().await;

    let mut switch_one = TcpStream::connect(harness.listener_addr).await.unwrap();
    complete_handshake(&mut switch_one, 1).await;
    let mut switch_two = TcpStream::connect(harness.listener_addr).await.unwrap();
    complete_handshake(&mut switch_two, 2).await;

    send_packet_in(&mut switch_one, 100).await;
    send_packet_in(&mut switch_two, 101).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(harness.counter.load(Ordering::SeqCst), 2);

    harness.role_manager.set_role(Role::Slave, "planned maintenance");
    harness.slave_observed.notified().await;

    // Both switches keep talking, but dispatch is disabled for the
    // duration of the transition: neither PACKET_IN reaches the listener.
    send_packet_in(&mut switch_one, 102).await;
    send_packet_in(&mut switch_two, 103).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(harness.counter.load(Ordering::SeqCst), 2);
    assert!(!harness.dispatcher.guard().is_enabled());

    harness.shutdown().await;
}
