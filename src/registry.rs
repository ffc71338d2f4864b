use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::switch::{Dpid, Switch};

/// The out-of-scope cluster-sync component's read-side seam: in SLAVE mode
/// the registry merges in whatever the cluster peer owns so that slave-mode
/// callers still see a complete switch set ([SPEC_FULL] §4.4). This core
/// never writes to it.
pub trait ClusterSwitchView: Send + Sync {
    fn get(&self, dpid: Dpid) -> Option<Arc<Switch>>;
    fn all(&self) -> Vec<Arc<Switch>>;
}

/// A [`ClusterSwitchView`] for deployments that run standalone (no HA peer
/// to merge in). The registry behaves exactly as if SLAVE mode didn't exist.
#[derive(Debug, Default)]
pub struct NullClusterView;

impl ClusterSwitchView for NullClusterView {
    fn get(&self, _dpid: Dpid) -> Option<Arc<Switch>> {
        None
    }

    fn all(&self) -> Vec<Arc<Switch>> {
        Vec::new()
    }
}

/// The authoritative map of active switches ([SPEC_FULL] §3, §4.4).
///
/// Writes only ever happen while the controller believes itself MASTER or
/// EQUAL for the switch in question - enforced by callers (the Channel
/// Handler and the HA update path), not by the registry itself.
pub struct SwitchRegistry<V: ClusterSwitchView = NullClusterView> {
    switches: RwLock<BTreeMap<Dpid, Arc<Switch>>>,
    cluster: V,
}

/// The outcome of [`SwitchRegistry::add_switch`], distinguishing a no-op
/// re-add from a DPID collision that displaced a stale entry.
pub enum AddOutcome {
    /// The same switch object was already registered; no updates emitted.
    Unchanged,
    /// A fresh switch was added with no prior entry for its DPID.
    Added,
    /// A different switch object with the same DPID was already registered
    /// (a reconnect racing a stale connection, or a duplicate DPID on the
    /// wire). The old entry was disconnected and replaced.
    Replaced(Arc<Switch>),
}

impl<V: ClusterSwitchView> SwitchRegistry<V> {
    pub fn new(cluster: V) -> Self {
        Self { switches: RwLock::new(BTreeMap::new()), cluster }
    }

    /// DPID collision policy ([SPEC_FULL] §4.4): a re-add of the identical
    /// object is a no-op; a different object at the same DPID displaces the
    /// old one, which is disconnected so its Channel Handler tears itself
    /// down and removes it again (a harmless second no-op remove).
    pub fn add_switch(&self, sw: Arc<Switch>) -> AddOutcome {
        let mut switches = self.switches.write();
        match switches.get(&sw.dpid) {
            Some(existing) if Arc::ptr_eq(existing, &sw) => AddOutcome::Unchanged,
            Some(existing) => {
                let old = existing.clone();
                warn!("DPID {} reconnected while an old channel was still registered", sw.dpid);
                old.disconnect();
                switches.insert(sw.dpid, sw);
                AddOutcome::Replaced(old)
            }
            None => {
                debug!("Switch {} added", sw.dpid);
                switches.insert(sw.dpid, sw);
                AddOutcome::Added
            }
        }
    }

    /// Removes `sw` iff it is still the registered object for its DPID -
    /// a stale channel racing a reconnect must not evict the new one.
    pub fn remove_switch(&self, sw: &Arc<Switch>) -> bool {
        let mut switches = self.switches.write();
        match switches.get(&sw.dpid) {
            Some(existing) if Arc::ptr_eq(existing, sw) => {
                switches.remove(&sw.dpid);
                debug!("Switch {} removed", sw.dpid);
                true
            }
            _ => false,
        }
    }

    pub fn get_switch(&self, dpid: Dpid) -> Option<Arc<Switch>> {
        self.switches.read().get(&dpid).cloned().or_else(|| self.cluster.get(dpid))
    }

    pub fn get_all_dpids(&self) -> Vec<Dpid> {
        let mut dpids: Vec<Dpid> = self.switches.read().keys().copied().collect();
        for sw in self.cluster.all() {
            if !dpids.contains(&sw.dpid) {
                dpids.push(sw.dpid);
            }
        }
        dpids
    }

    pub fn get_all_switch_map(&self) -> BTreeMap<Dpid, Arc<Switch>> {
        let mut map = self.switches.read().clone();
        for sw in self.cluster.all() {
            map.entry(sw.dpid).or_insert(sw);
        }
        map
    }

    pub fn len(&self) -> usize {
        self.switches.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    use bytes::Bytes;

    use super::*;
    use crate::error::Error;
    use crate::switch::SwitchHandle;

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

    fn switch(dpid: u64) -> Arc<Switch> {
        Arc::new(Switch::new(Dpid(dpid), Box::new(NullHandle)))
    }

    #[test]
    fn re_adding_the_same_object_is_a_no_op() {
        let registry = SwitchRegistry::new(NullClusterView);
        let sw = switch(1);
        assert!(matches!(registry.add_switch(sw.clone()), AddOutcome::Added));
        assert!(matches!(registry.add_switch(sw.clone()), AddOutcome::Unchanged));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn colliding_dpid_replaces_and_disconnects_old_entry() {
        let registry = SwitchRegistry::new(NullClusterView);
        let first = switch(1);
        let second = switch(1);
        assert!(matches!(registry.add_switch(first.clone()), AddOutcome::Added));
        match registry.add_switch(second.clone()) {
            AddOutcome::Replaced(old) => assert!(Arc::ptr_eq(&old, &first)),
            _ => panic!("expected a Replaced outcome"),
        }
        assert!(Arc::ptr_eq(&registry.get_switch(Dpid(1)).unwrap(), &second));
    }

    #[test]
    fn stale_remove_does_not_evict_the_current_entry() {
        let registry = SwitchRegistry::new(NullClusterView);
        let first = switch(1);
        let second = switch(1);
        registry.add_switch(first.clone());
        registry.add_switch(second.clone());
        assert!(!registry.remove_switch(&first));
        assert!(registry.get_switch(Dpid(1)).is_some());
        assert!(registry.remove_switch(&second));
        assert!(registry.get_switch(Dpid(1)).is_none());
    }
}
