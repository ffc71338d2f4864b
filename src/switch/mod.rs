use std::collections::VecDeque;
use std::fmt::{Debug, Display, Formatter};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Instant;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::consts::{Capability, Role};
use crate::error::Error;
use crate::utils::MutexCell;

/// A 64-bit OpenFlow datapath identifier.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Dpid(pub u64);

impl Display for Dpid {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let bytes = self.0.to_be_bytes();
        for (i, byte) in bytes.iter().enumerate() {
            if i > 0 {
                write!(f, ":")?;
            }
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl From<u64> for Dpid {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// The write-side handle to a switch's TCP connection, owned exclusively by
/// its Channel Handler task. Role Manager, Role Changer and the Switch
/// Registry only ever see this cheap handle, never the socket itself -
/// mirroring how `bluefang`'s `Hci` keeps transport ownership private and
/// only hands callers an `AclSender`.
pub trait SwitchHandle: Send + Sync {
    fn send(&self, data: Bytes) -> Result<(), Error>;

    /// Asynchronously close the underlying connection. The Channel Handler
    /// observes the resulting I/O error on its next read and performs the
    /// actual teardown (registry removal, `SwitchRemoved` update).
    fn disconnect(&self);

    fn remote_addr(&self) -> SocketAddr;
}

/// A single outstanding role request awaiting a reply ([SPEC_FULL] §3).
#[derive(Debug, Clone, Copy)]
pub struct PendingRoleRequest {
    pub xid: u32,
    pub role: Role,
    pub cookie: u64,
    pub deadline: Instant,
}

/// The authoritative state the core keeps for a connected switch.
///
/// Constructed once the Channel Handler has learned the switch's DPID from
/// its Features Reply; before that point the connection is tracked as a bare
/// handshake in progress, not yet a `Switch`.
pub struct Switch {
    pub dpid: Dpid,
    remote_addr: SocketAddr,
    next_xid: AtomicU32,
    pub capability: MutexCell<Capability>,
    pub role: MutexCell<Option<Role>>,
    handle: Box<dyn SwitchHandle>,
    pending: Mutex<VecDeque<PendingRoleRequest>>,
    /// Cookies of flow-mods this core has pushed to the switch. Opaque to
    /// every component except whatever flow-mod application owns it; the
    /// core only ever clears this set (`flushSwitchesOnReconnect`).
    flow_mods: Mutex<Vec<u64>>,
}

impl Switch {
    pub fn new(dpid: Dpid, handle: Box<dyn SwitchHandle>) -> Self {
        let remote_addr = handle.remote_addr();
        Self {
            dpid,
            remote_addr,
            next_xid: AtomicU32::new(1),
            capability: MutexCell::new(Capability::Unknown),
            role: MutexCell::new(None),
            handle,
            pending: Mutex::new(VecDeque::new()),
            flow_mods: Mutex::new(Vec::new()),
        }
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn next_xid(&self) -> u32 {
        self.next_xid.fetch_add(1, Ordering::Relaxed)
    }

    pub fn send(&self, data: Bytes) -> Result<(), Error> {
        self.handle.send(data)
    }

    pub fn disconnect(&self) {
        self.handle.disconnect();
    }

    pub fn push_pending(&self, request: PendingRoleRequest) {
        let mut pending = self.pending.lock();
        debug_assert!(pending.back().map_or(true, |last| last.xid < request.xid));
        pending.push_back(request);
    }

    pub fn first_pending(&self) -> Option<PendingRoleRequest> {
        self.pending.lock().front().copied()
    }

    pub fn clear_pending(&self) {
        self.pending.lock().clear();
    }

    /// Pops the front pending entry iff it matches `xid`. Returns `None`
    /// (leaving the list untouched) for an empty list or an xid mismatch -
    /// callers are responsible for closing the channel in both of those
    /// cases, per the "first entry" discipline in [SPEC_FULL] §4.3.
    pub fn pop_pending_if_xid(&self, xid: u32) -> Option<PendingRoleRequest> {
        let mut pending = self.pending.lock();
        match pending.front() {
            Some(front) if front.xid == xid => pending.pop_front(),
            _ => None,
        }
    }

    /// Pops the front pending entry iff its cookie matches, used by the
    /// Role Changer's TIMEOUT task. Returns `None` if a later reply already
    /// drained the entry this task was watching.
    pub fn pop_pending_if_cookie(&self, cookie: u64) -> Option<PendingRoleRequest> {
        let mut pending = self.pending.lock();
        match pending.front() {
            Some(front) if front.cookie == cookie => pending.pop_front(),
            _ => None,
        }
    }

    pub fn check_first_pending_xid(&self, xid: u32) -> bool {
        self.pending.lock().front().is_some_and(|p| p.xid == xid)
    }

    pub fn check_first_pending_cookie(&self, cookie: u64) -> bool {
        self.pending.lock().front().is_some_and(|p| p.cookie == cookie)
    }

    pub fn has_pending_for_role(&self, role: Role) -> bool {
        self.pending.lock().iter().any(|p| p.role == role)
    }

    pub fn flush_flow_mods(&self) {
        self.flow_mods.lock().clear();
    }

    pub fn flow_mod_cookies(&self) -> Vec<u64> {
        self.flow_mods.lock().clone()
    }

    pub fn record_flow_mod(&self, cookie: u64) {
        self.flow_mods.lock().push(cookie);
    }
}

impl Debug for Switch {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Switch")
            .field("dpid", &self.dpid)
            .field("remote_addr", &self.remote_addr)
            .field("capability", &self.capability.get())
            .field("role", &self.role.get())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use super::*;

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

    fn switch() -> Switch {
        Switch::new(Dpid(1), Box::new(NullHandle))
    }

    #[test]
    fn dpid_formats_as_colon_hex() {
        assert_eq!(Dpid(0x0001_0203_0405_0607).to_string(), "00:01:02:03:04:05:06:07");
    }

    #[test]
    fn xids_are_strictly_increasing() {
        let sw = switch();
        let a = sw.next_xid();
        let b = sw.next_xid();
        assert!(b > a);
    }

    #[test]
    fn pending_pops_only_on_matching_xid() {
        let sw = switch();
        sw.push_pending(PendingRoleRequest { xid: 5, role: Role::Master, cookie: 1, deadline: Instant::now() });
        assert!(sw.pop_pending_if_xid(4).is_none());
        assert!(sw.first_pending().is_some());
        assert!(sw.pop_pending_if_xid(5).is_some());
        assert!(sw.first_pending().is_none());
    }
}
