use crate::consts::OfType;
use crate::switch::Dpid;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed OpenFlow message: {0:?}")]
    BadPacket(#[from] instructor::Error),
    #[error("frame length {0} is shorter than the OpenFlow header")]
    FramingError(usize),
    #[error("handshake timed out in state {0}")]
    HandshakeTimeout(&'static str),
    #[error("no message received within the idle timeout")]
    IdleTimeout,
    #[error("unexpected message type {actual:?} while waiting for {expected} (dpid={dpid:?})")]
    UnexpectedMessage { expected: &'static str, actual: OfType, dpid: Option<Dpid> },
    #[error("protocol violation from {dpid:?}: {reason}")]
    ProtocolViolation { dpid: Option<Dpid>, reason: &'static str },
    #[error("the dispatch update queue has been closed")]
    DispatcherClosed,
    #[error("the role changer's scheduler task is no longer running")]
    SchedulerClosed,
    #[error("invalid configuration value for `{key}`: {value}")]
    InvalidConfig { key: &'static str, value: String },
}

impl Error {
    pub fn protocol(dpid: Option<Dpid>, reason: &'static str) -> Self {
        Self::ProtocolViolation { dpid, reason }
    }
}
