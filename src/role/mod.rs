pub mod changer;

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub use self::changer::RoleChanger;
use crate::consts::Role;
use crate::dispatch::Update;
use crate::error::Error;
use crate::switch::Switch;

/// Default flap-dampening window ([SPEC_FULL] §4.2).
pub const DEFAULT_DAMPEN: Duration = Duration::from_millis(2000);

/// The controller-wide role, its human-readable justification, and when it
/// was last changed ([SPEC_FULL] §4.2 `getRoleInfo`).
#[derive(Debug, Clone)]
pub struct RoleInfo {
    pub role: Role,
    pub description: String,
    pub timestamp: SystemTime,
}

struct Inner {
    role: Role,
    description: String,
    timestamp: SystemTime,
    channels: Vec<Arc<Switch>>,
    dampen_task: Option<JoinHandle<()>>,
    last_propagation_at: Option<Instant>,
}

/// Owns the controller's current HA role, dampens flaps, and drives
/// per-channel role propagation through the [`RoleChanger`] ([SPEC_FULL] §4.2).
///
/// Always held as `Arc<RoleManager>`: a dampened propagation is a detached
/// task that needs to call back into the manager once its delay elapses.
pub struct RoleManager {
    changer: Arc<RoleChanger>,
    update_tx: mpsc::Sender<Update>,
    dampen: Duration,
    inner: Mutex<Inner>,
}

impl RoleManager {
    pub fn new(changer: Arc<RoleChanger>, update_tx: mpsc::Sender<Update>, initial_role: Role) -> Arc<Self> {
        Self::with_dampen(changer, update_tx, initial_role, DEFAULT_DAMPEN)
    }

    pub fn with_dampen(changer: Arc<RoleChanger>, update_tx: mpsc::Sender<Update>, initial_role: Role, dampen: Duration) -> Arc<Self> {
        Arc::new(Self {
            changer,
            update_tx,
            dampen,
            inner: Mutex::new(Inner {
                role: initial_role,
                description: "startup".to_string(),
                timestamp: SystemTime::now(),
                channels: Vec::new(),
                dampen_task: None,
                last_propagation_at: None,
            }),
        })
    }

    /// Idempotent when `role == currentRole`. Otherwise updates the stored
    /// role/description immediately and schedules propagation, subject to
    /// flap dampening ([SPEC_FULL] §4.2).
    pub fn set_role(self: &Arc<Self>, role: Role, description: impl Into<String>) {
        let description = description.into();
        let mut inner = self.inner.lock();
        if inner.role == role {
            return;
        }
        inner.role = role;
        inner.description = description.clone();
        inner.timestamp = SystemTime::now();
        self.schedule_propagation(&mut inner, role, description);
    }

    /// Cancel-and-replace dampening timer: a call within `dampen` of the
    /// previous propagation defers the new one by a full `dampen` window
    /// instead of stacking up a second task.
    fn schedule_propagation(self: &Arc<Self>, inner: &mut Inner, role: Role, description: String) {
        let now = Instant::now();
        let within_window = inner.last_propagation_at.is_some_and(|t| now.duration_since(t) < self.dampen);

        if let Some(handle) = inner.dampen_task.take() {
            handle.abort();
        }

        if within_window {
            let this = Arc::downgrade(self);
            let delay = self.dampen;
            inner.dampen_task = Some(tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if let Some(this) = this.upgrade() {
                    this.propagate_now(role, description).await;
                }
            }));
        } else {
            inner.last_propagation_at = Some(now);
            let this = self.clone();
            tokio::spawn(async move { this.propagate_now(role, description).await });
        }
    }

    async fn propagate_now(&self, role: Role, description: String) {
        let channels = {
            let mut inner = self.inner.lock();
            inner.dampen_task = None;
            inner.last_propagation_at = Some(Instant::now());
            inner.channels.clone()
        };
        debug!("propagating role {role:?} ({description}) to {} channel(s)", channels.len());
        if let Err(err) = self.changer.submit_request(channels, role) {
            warn!("failed to submit role propagation: {err}");
        }
        if self.update_tx.send(Update::HaRoleChanged(role)).await.is_err() {
            warn!("{}", Error::DispatcherClosed);
        }
    }

    /// Registers a newly-handshaken channel and sends it the current role,
    /// guarded by the same pending/timeout machinery as any other role
    /// request ([SPEC_FULL] §4.2).
    pub fn add_channel_and_send_initial_role(&self, sw: Arc<Switch>) -> Result<(), Error> {
        let role = {
            let mut inner = self.inner.lock();
            inner.channels.push(sw.clone());
            inner.role
        };
        self.changer.submit_request(vec![sw], role)?;
        Ok(())
    }

    pub fn remove_channel(&self, sw: &Arc<Switch>) {
        self.inner.lock().channels.retain(|c| !Arc::ptr_eq(c, sw));
    }

    /// No-op unless `currentRole == role` AND `sw` has no in-flight request
    /// for that role; recovers from a spuriously-observed role on the switch
    /// without disturbing an already-converging negotiation.
    pub fn reassert_role(&self, sw: &Arc<Switch>, role: Role) -> Result<(), Error> {
        let current = self.inner.lock().role;
        if current != role || sw.has_pending_for_role(role) {
            return Ok(());
        }
        self.changer.submit_request(vec![sw.clone()], role)?;
        Ok(())
    }

    pub fn get_role_info(&self) -> RoleInfo {
        let inner = self.inner.lock();
        RoleInfo { role: inner.role, description: inner.description.clone(), timestamp: inner.timestamp }
    }
}
