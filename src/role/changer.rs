use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::consts::{Capability, Role};
use crate::error::Error;
use crate::message::WireCodec;
use crate::switch::{PendingRoleRequest, Switch};

/// Default role-reply timeout, 5 seconds, matching the Role Changer's
/// `TIMEOUT_NS` default ([SPEC_FULL] §4.3).
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

enum TaskKind {
    Send { switches: Vec<Arc<Switch>>, role: Role },
    Timeout { switches: Vec<Arc<Switch>> },
}

/// A scheduled unit of role-protocol work ([SPEC_FULL] §3 "Role Change Task").
///
/// Ordered by deadline ascending, ties broken by insertion sequence - pushed
/// into a `BinaryHeap<Reverse<_>>` so the scheduler task always pops the
/// earliest-due entry first.
struct RoleChangeTask {
    kind: TaskKind,
    cookie: u64,
    deadline: Instant,
    seq: u64,
}

impl PartialEq for RoleChangeTask {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for RoleChangeTask {}

impl PartialOrd for RoleChangeTask {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RoleChangeTask {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.deadline.cmp(&other.deadline).then(self.seq.cmp(&other.seq))
    }
}

/// The per-switch role-request protocol ([SPEC_FULL] §4.3).
///
/// The only writer of per-switch pending lists driven through `submitRequest`
/// is this component's single scheduler task; `deliver_role_reply` and
/// `deliver_role_request_not_supported`, however, are invoked directly by
/// whichever Channel Handler task read the reply off the wire, which is why
/// `Switch::pending` carries its own lock rather than relying on the
/// scheduler for exclusion.
pub struct RoleChanger {
    submit_tx: mpsc::UnboundedSender<RoleChangeTask>,
    next_cookie: AtomicU64,
    next_seq: AtomicU64,
    scheduler: Mutex<Option<JoinHandle<()>>>,
    timeout: Duration,
}

impl RoleChanger {
    pub fn new(codec: Arc<dyn WireCodec>) -> Self {
        Self::with_timeout(codec, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(codec: Arc<dyn WireCodec>, timeout: Duration) -> Self {
        let (submit_tx, submit_rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run_scheduler(codec, timeout, submit_rx));
        Self {
            submit_tx,
            next_cookie: AtomicU64::new(1),
            next_seq: AtomicU64::new(0),
            scheduler: Mutex::new(Some(handle)),
            timeout,
        }
    }

    /// Enqueues a SEND task (immediate deadline) and a TIMEOUT task
    /// (`now + TIMEOUT_NS`) sharing a fresh cookie, per [SPEC_FULL] §4.3.
    pub fn submit_request(&self, switches: Vec<Arc<Switch>>, role: Role) -> Result<u64, Error> {
        let cookie = self.next_cookie.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();
        let send = RoleChangeTask {
            kind: TaskKind::Send { switches: switches.clone(), role },
            cookie,
            deadline: now,
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
        };
        let timeout = RoleChangeTask {
            kind: TaskKind::Timeout { switches },
            cookie,
            deadline: now + self.timeout,
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
        };
        self.submit_tx.send(send).map_err(|_| Error::SchedulerClosed)?;
        self.submit_tx.send(timeout).map_err(|_| Error::SchedulerClosed)?;
        Ok(cookie)
    }

    /// `deliverRoleReply`: called by a Channel Handler on receiving a role
    /// reply. Returns `Ok(())` if the reply matched the first pending entry,
    /// `Err` (channel already closed) otherwise.
    pub fn deliver_role_reply(&self, sw: &Arc<Switch>, xid: u32, role: Role) -> Result<(), Error> {
        match sw.pop_pending_if_xid(xid) {
            None => {
                sw.clear_pending();
                sw.disconnect();
                Err(Error::protocol(Some(sw.dpid), "unsolicited or out-of-order role reply"))
            }
            Some(first) if first.role != role => {
                sw.clear_pending();
                sw.disconnect();
                Err(Error::protocol(Some(sw.dpid), "role reply carried an unexpected role"))
            }
            Some(_first) => {
                sw.capability.set(Capability::Supported);
                sw.role.set(Some(role));
                Ok(())
            }
        }
    }

    /// `deliverRoleRequestNotSupported`: called when the switch returns an
    /// OpenFlow error for the vendor role request.
    pub fn deliver_role_request_not_supported(&self, sw: &Arc<Switch>, xid: u32) -> Result<(), Error> {
        match sw.pop_pending_if_xid(xid) {
            None => {
                sw.clear_pending();
                sw.disconnect();
                Err(Error::protocol(Some(sw.dpid), "unsolicited role-not-supported error"))
            }
            Some(first) => {
                sw.capability.set(Capability::Unsupported);
                // Mirrors observed switch behavior: the role is applied as
                // if silently accepted, even though no reply was sent.
                sw.role.set(Some(first.role));
                Ok(())
            }
        }
    }

    pub fn check_first_pending_role_request_xid(&self, sw: &Switch, xid: u32) -> bool {
        sw.check_first_pending_xid(xid)
    }

    pub fn check_first_pending_role_request_cookie(&self, sw: &Switch, cookie: u64) -> bool {
        sw.check_first_pending_cookie(cookie)
    }

    pub async fn shutdown(&self) {
        let handle = self.scheduler.lock().take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        } else {
            warn!("RoleChanger::shutdown called more than once");
        }
    }
}

/// `sendRoleRequest`, shared between the immediate SEND task and any future
/// caller: mutates `switches` in place per the three-branch logic in
/// [SPEC_FULL] §4.3.
fn send_role_request(codec: &dyn WireCodec, switches: &mut Vec<Arc<Switch>>, role: Role, cookie: u64, timeout: Duration) {
    switches.retain_mut(|sw| match (sw.capability.get(), role) {
        (Capability::Unsupported, Role::Slave) => {
            debug!("switch {} does not support NX role and SLAVE was requested, disconnecting", sw.dpid);
            sw.disconnect();
            false
        }
        (Capability::Unsupported, _) => true,
        (Capability::Supported | Capability::Unknown, _) => {
            let xid = sw.next_xid();
            let bytes = codec.encode_role_request(xid, role.into());
            match sw.send(bytes) {
                Ok(()) => {
                    sw.push_pending(PendingRoleRequest { xid, role, cookie, deadline: Instant::now() + timeout });
                    true
                }
                Err(err) => {
                    warn!("failed to write role request to switch {}: {err}", sw.dpid);
                    sw.disconnect();
                    false
                }
            }
        }
    });
}

/// `verifyRoleReplyReceived`: a TIMEOUT task's effect on every switch whose
/// first pending entry still matches `cookie`.
fn verify_role_reply_received(switches: &[Arc<Switch>], cookie: u64) {
    for sw in switches {
        if sw.pop_pending_if_cookie(cookie).is_some() {
            warn!("switch {} did not answer a role request in time", sw.dpid);
            sw.role.set(None);
            sw.capability.set(Capability::Unknown);
            sw.disconnect();
        }
    }
}

async fn run_scheduler(codec: Arc<dyn WireCodec>, timeout: Duration, mut submit_rx: mpsc::UnboundedReceiver<RoleChangeTask>) {
    let mut heap: BinaryHeap<Reverse<RoleChangeTask>> = BinaryHeap::new();
    loop {
        let next_deadline = heap.peek().map(|Reverse(task)| task.deadline);
        let sleep = async {
            match next_deadline {
                Some(deadline) => tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            biased;
            task = submit_rx.recv() => match task {
                Some(task) => heap.push(Reverse(task)),
                None => break,
            },
            _ = sleep => {
                if let Some(Reverse(task)) = heap.pop() {
                    match task.kind {
                        TaskKind::Send { mut switches, role } => {
                            send_role_request(codec.as_ref(), &mut switches, role, task.cookie, timeout);
                        }
                        TaskKind::Timeout { switches } => {
                            verify_role_reply_received(&switches, task.cookie);
                        }
                    }
                }
            }
        }
    }
}
