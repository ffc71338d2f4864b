use instructor::{Exstruct, Instruct};
use num_enum::{FromPrimitive, IntoPrimitive};

/// OpenFlow 1.0 message types ([OpenFlow Switch Specification] Section A.1).
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, FromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum OfType {
    Hello = 0,
    Error = 1,
    EchoRequest = 2,
    EchoReply = 3,
    Vendor = 4,
    FeaturesRequest = 5,
    FeaturesReply = 6,
    GetConfigRequest = 7,
    GetConfigReply = 8,
    SetConfig = 9,
    PacketIn = 10,
    FlowRemoved = 11,
    PortStatus = 12,
    PacketOut = 13,
    FlowMod = 14,
    PortMod = 15,
    StatsRequest = 16,
    StatsReply = 17,
    BarrierRequest = 18,
    BarrierReply = 19,
    QueueGetConfigRequest = 20,
    QueueGetConfigReply = 21,
    #[num_enum(catch_all)]
    Unknown(u8),
}

/// OpenFlow stats types carried in `StatsRequest`/`StatsReply` bodies ([OFP] Section A.3.5).
#[derive(Debug, Copy, Clone, Eq, PartialEq, FromPrimitive, IntoPrimitive)]
#[repr(u16)]
pub enum StatsType {
    Desc = 0,
    Flow = 1,
    Aggregate = 2,
    Table = 3,
    Port = 4,
    Queue = 5,
    Vendor = 0xFFFF,
    #[num_enum(catch_all)]
    Unknown(u16),
}

/// HA role of the controller, or of a switch as last reported by it.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Role {
    Master,
    Equal,
    Slave,
}

/// The Nicira vendor extension's role encoding ([ovs-ofctl(8)], `NXT_ROLE_REQUEST`).
///
/// Distinct from [`Role`]: `OTHER` on the wire means "no particular role",
/// which this crate treats as equivalent to [`Role::Equal`].
#[derive(Debug, Copy, Clone, Eq, PartialEq, FromPrimitive, IntoPrimitive, Exstruct, Instruct)]
#[instructor(endian = "big")]
#[repr(u32)]
pub enum NxRole {
    Other = 0,
    Master = 1,
    Slave = 2,
    #[num_enum(catch_all)]
    Unknown(u32),
}

impl From<Role> for NxRole {
    fn from(role: Role) -> Self {
        match role {
            Role::Master => NxRole::Master,
            Role::Equal => NxRole::Other,
            Role::Slave => NxRole::Slave,
        }
    }
}

impl TryFrom<NxRole> for Role {
    type Error = instructor::Error;

    fn try_from(value: NxRole) -> Result<Self, Self::Error> {
        match value {
            NxRole::Other => Ok(Role::Equal),
            NxRole::Master => Ok(Role::Master),
            NxRole::Slave => Ok(Role::Slave),
            NxRole::Unknown(_) => Err(instructor::Error::InvalidValue),
        }
    }
}

/// Whether a switch has demonstrated support for the NX role-request extension.
///
/// Tri-valued on purpose: collapsing this to `Option<bool>` loses the "we
/// haven't asked yet" state that the first role request after a (re)connect
/// relies on.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub enum Capability {
    Supported,
    Unsupported,
    #[default]
    Unknown,
}

/// Nicira's OpenFlow vendor ID ([ovs-ofctl(8)]).
pub const NX_VENDOR_ID: u32 = 0x00002320;

/// Nicira vendor extension subtypes relevant to role negotiation.
pub const NXT_ROLE_REQUEST: u32 = 10;
pub const NXT_ROLE_REPLY: u32 = 11;

/// `OFPET_BAD_REQUEST` / `OFPBRC_EPERM`-style errors that a switch without NX
/// role support returns for an `NXT_ROLE_REQUEST` it does not recognize.
pub const OFPET_BAD_REQUEST: u16 = 1;
pub const OFPBRC_BAD_VENDOR: u16 = 4;
pub const OFPBRC_BAD_SUBTYPE: u16 = 5;

/// Default TCP port OpenFlow switches connect to.
pub const DEFAULT_OPENFLOW_PORT: u16 = 6633;
