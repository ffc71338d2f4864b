use bytes::{BufMut, Bytes, BytesMut};
use instructor::{BigEndian, Buffer, BufferMut, Error as InstructorError, Exstruct, Instruct};

use crate::consts::{NxRole, OfType, StatsType, NX_VENDOR_ID, NXT_ROLE_REPLY, NXT_ROLE_REQUEST};
use crate::error::Error;

pub const OFP_VERSION: u8 = 0x01;
pub const OFP_HEADER_LEN: usize = 8;

/// The fixed 8-byte OpenFlow 1.0 header ([OFP] Section A.1).
///
/// This is the only part of the wire format this crate parses on its own;
/// everything past the header is handed to an external [`WireCodec`] as
/// opaque bytes, per the core's role as a dispatcher rather than a protocol
/// implementation. `length` is self-inclusive (covers the header itself),
/// which is why it is read and written by hand rather than via
/// `instructor`'s `Length<T, N>` helper used elsewhere in this codebase for
/// payload-only lengths.
#[derive(Debug, Clone, Copy)]
pub struct OfHeader {
    pub version: u8,
    pub of_type: OfType,
    pub length: u16,
    pub xid: u32,
}

impl OfHeader {
    pub fn new(of_type: OfType, xid: u32, body_len: usize) -> Self {
        Self { version: OFP_VERSION, of_type, length: (OFP_HEADER_LEN + body_len) as u16, xid }
    }

    pub fn body_len(&self) -> Result<usize, Error> {
        (self.length as usize).checked_sub(OFP_HEADER_LEN).ok_or(Error::FramingError(self.length as usize))
    }
}

impl Exstruct<BigEndian> for OfHeader {
    fn read_from_buffer<B: Buffer>(buffer: &mut B) -> Result<Self, InstructorError> {
        let version: u8 = buffer.read_be()?;
        let of_type: u8 = buffer.read_be()?;
        let length: u16 = buffer.read_be()?;
        let xid: u32 = buffer.read_be()?;
        Ok(Self { version, of_type: OfType::from(of_type), length, xid })
    }
}

impl Instruct<BigEndian> for OfHeader {
    fn write_to_buffer<B: BufferMut>(&self, buffer: &mut B) {
        buffer.write_be(self.version);
        buffer.write_be(u8::from(self.of_type));
        buffer.write_be(self.length);
        buffer.write_be(self.xid);
    }
}

/// A coarsely-decoded OpenFlow message: enough for the Channel Handler to
/// drive the handshake and role protocol, with application bodies left as
/// [`Bytes`] for listeners and the external codec to interpret.
#[derive(Debug, Clone)]
pub enum OfMessage {
    Hello { xid: u32 },
    EchoRequest { xid: u32, payload: Bytes },
    EchoReply { xid: u32, payload: Bytes },
    FeaturesReply { xid: u32, dpid: u64, payload: Bytes },
    GetConfigReply { xid: u32, payload: Bytes },
    StatsReplyDesc { xid: u32, payload: Bytes },
    /// A generic OpenFlow error, including `OFPET_BAD_REQUEST` replies used
    /// to signal that NX role requests are unsupported.
    Error { xid: u32, error_type: u16, code: u16, data: Bytes },
    /// A Nicira vendor role reply.
    RoleReply { xid: u32, role: NxRole },
    /// Any other vendor message, not a role reply.
    Vendor { xid: u32, vendor_id: u32, payload: Bytes },
    PacketIn { xid: u32, payload: Bytes },
    /// Anything else: application-class traffic forwarded to the dispatcher
    /// verbatim.
    Other { header: OfHeader, payload: Bytes },
}

impl OfMessage {
    pub fn xid(&self) -> u32 {
        match self {
            OfMessage::Hello { xid }
            | OfMessage::EchoRequest { xid, .. }
            | OfMessage::EchoReply { xid, .. }
            | OfMessage::FeaturesReply { xid, .. }
            | OfMessage::GetConfigReply { xid, .. }
            | OfMessage::StatsReplyDesc { xid, .. }
            | OfMessage::Error { xid, .. }
            | OfMessage::RoleReply { xid, .. }
            | OfMessage::Vendor { xid, .. }
            | OfMessage::PacketIn { xid, .. } => *xid,
            OfMessage::Other { header, .. } => header.xid,
        }
    }

    pub fn of_type(&self) -> OfType {
        match self {
            OfMessage::Hello { .. } => OfType::Hello,
            OfMessage::EchoRequest { .. } => OfType::EchoRequest,
            OfMessage::EchoReply { .. } => OfType::EchoReply,
            OfMessage::FeaturesReply { .. } => OfType::FeaturesReply,
            OfMessage::GetConfigReply { .. } => OfType::GetConfigReply,
            OfMessage::StatsReplyDesc { .. } => OfType::StatsReply,
            OfMessage::Error { .. } => OfType::Error,
            OfMessage::RoleReply { .. } | OfMessage::Vendor { .. } => OfType::Vendor,
            OfMessage::PacketIn { .. } => OfType::PacketIn,
            OfMessage::Other { header, .. } => header.of_type,
        }
    }
}

/// The external message factory named in the core's scope: this crate never
/// defines the OpenFlow wire format beyond the fixed header, it only
/// constrains how the core invokes a decoder/encoder for everything else.
pub trait WireCodec: Send + Sync {
    fn decode(&self, header: OfHeader, body: Bytes) -> Result<OfMessage, instructor::Error>;

    fn encode_hello(&self, xid: u32) -> Bytes;
    fn encode_echo_reply(&self, xid: u32, payload: Bytes) -> Bytes;
    fn encode_features_request(&self, xid: u32) -> Bytes;
    fn encode_set_config(&self, xid: u32) -> Bytes;
    fn encode_get_config_request(&self, xid: u32) -> Bytes;
    fn encode_desc_stats_request(&self, xid: u32) -> Bytes;
    fn encode_role_request(&self, xid: u32, role: NxRole) -> Bytes;
}

/// A minimal, standards-following [`WireCodec`] used by the demo binary and
/// the integration tests. Real deployments are expected to supply their own,
/// fuller codec; this one understands only what the handshake and role
/// protocol require.
#[derive(Debug, Default, Clone, Copy)]
pub struct BuiltinCodec;

impl WireCodec for BuiltinCodec {
    fn decode(&self, header: OfHeader, mut body: Bytes) -> Result<OfMessage, instructor::Error> {
        let xid = header.xid;
        Ok(match header.of_type {
            OfType::Hello => OfMessage::Hello { xid },
            OfType::EchoRequest => OfMessage::EchoRequest { xid, payload: body },
            OfType::EchoReply => OfMessage::EchoReply { xid, payload: body },
            OfType::FeaturesReply => {
                let dpid: u64 = body.read_be()?;
                OfMessage::FeaturesReply { xid, dpid, payload: body }
            }
            OfType::GetConfigReply => OfMessage::GetConfigReply { xid, payload: body },
            OfType::StatsReply => {
                let stats_type: u16 = body.read_be()?;
                let _flags: u16 = body.read_be()?;
                match StatsType::from(stats_type) {
                    StatsType::Desc => OfMessage::StatsReplyDesc { xid, payload: body },
                    _ => OfMessage::Other { header, payload: body },
                }
            }
            OfType::Error => {
                let error_type: u16 = body.read_be()?;
                let code: u16 = body.read_be()?;
                OfMessage::Error { xid, error_type, code, data: body }
            }
            OfType::Vendor => {
                let vendor_id: u32 = body.read_be()?;
                if vendor_id == NX_VENDOR_ID {
                    let subtype: u32 = body.read_be()?;
                    if subtype == NXT_ROLE_REPLY {
                        let role: NxRole = body.read_be()?;
                        return Ok(OfMessage::RoleReply { xid, role });
                    }
                }
                OfMessage::Vendor { xid, vendor_id, payload: body }
            }
            OfType::PacketIn => OfMessage::PacketIn { xid, payload: body },
            _ => OfMessage::Other { header, payload: body },
        })
    }

    fn encode_hello(&self, xid: u32) -> Bytes {
        frame(OfType::Hello, xid, |_| {})
    }

    fn encode_echo_reply(&self, xid: u32, payload: Bytes) -> Bytes {
        frame(OfType::EchoReply, xid, |buf| buf.put(payload))
    }

    fn encode_features_request(&self, xid: u32) -> Bytes {
        frame(OfType::FeaturesRequest, xid, |_| {})
    }

    fn encode_set_config(&self, xid: u32) -> Bytes {
        frame(OfType::SetConfig, xid, |buf| {
            buf.write_be(0u16); // flags
            buf.write_be(0xFFFFu16); // miss_send_len
        })
    }

    fn encode_get_config_request(&self, xid: u32) -> Bytes {
        frame(OfType::GetConfigRequest, xid, |_| {})
    }

    fn encode_desc_stats_request(&self, xid: u32) -> Bytes {
        frame(OfType::StatsRequest, xid, |buf| {
            buf.write_be(0u16); // OFPST_DESC
            buf.write_be(0u16); // flags
        })
    }

    fn encode_role_request(&self, xid: u32, role: NxRole) -> Bytes {
        frame(OfType::Vendor, xid, |buf| {
            buf.write_be(NX_VENDOR_ID);
            buf.write_be(NXT_ROLE_REQUEST);
            buf.write_be(role);
        })
    }
}

fn frame(of_type: OfType, xid: u32, writer: impl FnOnce(&mut BytesMut)) -> Bytes {
    let mut body = BytesMut::new();
    writer(&mut body);
    let header = OfHeader::new(of_type, xid, body.len());
    let mut out = BytesMut::with_capacity(OFP_HEADER_LEN + body.len());
    out.write_be(header);
    out.put(body);
    out.freeze()
}
