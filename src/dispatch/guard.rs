use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{RwLock, RwLockReadGuard};

/// The readers-writer latch that atomically pauses listener dispatch across
/// HA role transitions ([SPEC_FULL] §4.5).
///
/// The only "data" protected is a boolean: shared (reader) holders may
/// dispatch a message, the exclusive (writer) holder flips `enabled`.
/// Acquiring the writer lock naturally blocks until every in-flight dispatch
/// releases its reader lock, which is exactly the "disableDispatch() BLOCKS
/// until every in-flight dispatch has completed" contract.
pub struct DispatchGuard {
    lock: RwLock<()>,
    enabled: AtomicBool,
}

/// Held for the duration of one dispatch. Dropping it releases the shared
/// lock, letting a pending `disable()` proceed.
pub struct DispatchPermit<'a>(#[allow(dead_code)] RwLockReadGuard<'a, ()>);

impl Default for DispatchGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl DispatchGuard {
    pub fn new() -> Self {
        Self { lock: RwLock::new(()), enabled: AtomicBool::new(true) }
    }

    /// Shared-mode acquire. Returns `None` if dispatch is currently disabled,
    /// in which case the caller must drop the message.
    pub fn acquire(&self) -> Option<DispatchPermit<'_>> {
        let guard = self.lock.read();
        if self.enabled.load(Ordering::Acquire) {
            Some(DispatchPermit(guard))
        } else {
            None
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Exclusive-mode: blocks until every in-flight dispatch has completed,
    /// then disables dispatch.
    pub fn disable(&self) {
        let _write = self.lock.write();
        self.enabled.store(false, Ordering::Release);
    }

    pub fn enable(&self) {
        let _write = self.lock.write();
        self.enabled.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_guard_refuses_new_permits() {
        let guard = DispatchGuard::new();
        assert!(guard.acquire().is_some());
        guard.disable();
        assert!(guard.acquire().is_none());
        guard.enable();
        assert!(guard.acquire().is_some());
    }

    #[test]
    fn disable_waits_for_outstanding_permit_to_drop() {
        let guard = DispatchGuard::new();
        let permit = guard.acquire().unwrap();
        // `disable` would deadlock here if called on this thread while the
        // permit is still held, so this test only asserts the happy path:
        // releasing the permit before disabling succeeds immediately.
        drop(permit);
        guard.disable();
        assert!(!guard.is_enabled());
    }
}
