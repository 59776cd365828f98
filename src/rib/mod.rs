//! The Adj-RIB-Out: the per-peer set of pending changes queued toward a
//! session. Announces sharing identical attributes travel in a single
//! UPDATE; a withdraw for a prefix supersedes any queued announce.

pub mod families;

pub use families::{Families, Family};

use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;

use thiserror::Error;

use crate::message::attributes::code;
use crate::message::{Attribute, AttributeCollection, Nlri, RoutedNlri, Update};

/// In configuration a nexthop may be the "use our local address"
/// placeholder; it must be resolved to a concrete address before a
/// route reaches the RIB.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum NextHop {
    Address(IpAddr),
    /// Placeholder resolved against the session's local address
    SelfAddress,
}

impl NextHop {
    pub fn is_resolved(&self) -> bool {
        matches!(self, NextHop::Address(_))
    }

    pub fn address(&self) -> Option<IpAddr> {
        match self {
            NextHop::Address(addr) => Some(*addr),
            NextHop::SelfAddress => None,
        }
    }
}

impl fmt::Display for NextHop {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            NextHop::Address(addr) => write!(f, "{}", addr),
            NextHop::SelfAddress => write!(f, "self"),
        }
    }
}

/// A route queued for advertisement: NLRI, shared attributes, nexthop
#[derive(Clone, Debug, PartialEq)]
pub struct Route {
    pub nlri: Nlri,
    pub attributes: AttributeCollection,
    pub next_hop: Option<NextHop>,
}

impl Route {
    pub fn new(nlri: Nlri, attributes: AttributeCollection, next_hop: Option<NextHop>) -> Self {
        Self {
            nlri,
            attributes,
            next_hop,
        }
    }

    /// Replace a self nexthop by the given concrete address, returning a
    /// new route; resolved routes pass through unchanged
    pub fn resolve_self(&self, local_address: IpAddr) -> Route {
        match self.next_hop {
            Some(NextHop::SelfAddress) => Route {
                nlri: self.nlri.clone(),
                attributes: self.attributes.clone(),
                next_hop: Some(NextHop::Address(local_address)),
            },
            _ => self.clone(),
        }
    }
}

#[derive(Debug, Error)]
pub enum RibError {
    /// A route carrying an unresolved nexthop placeholder reached the RIB
    #[error("route for {0} carries an unresolved self nexthop")]
    UnresolvedNextHop(String),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Action {
    Announce,
    Withdraw,
}

/// One queued change, keyed in the RIB by the NLRI wire index
#[derive(Clone, Debug)]
pub struct Change {
    pub action: Action,
    pub nlri: Nlri,
    /// Attributes and nexthop; only meaningful for announces
    pub attributes: AttributeCollection,
    pub next_hop: Option<IpAddr>,
}

/// Per-peer outbound RIB: the last change queued for each NLRI plus the
/// set of routes already advertised to the peer.
#[derive(Debug, Default)]
pub struct AdjRibOut {
    /// Changes not yet sent, keyed by NLRI wire identity
    pending: BTreeMap<Vec<u8>, Change>,
    /// What the peer currently holds from us, keyed by NLRI wire identity
    advertised: BTreeMap<Vec<u8>, Change>,
    /// Flips on at any mutation; the reactor polls it to schedule flushes
    dirty: bool,
}

impl AdjRibOut {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_pending(&self) -> bool {
        self.dirty
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn advertised_count(&self) -> usize {
        self.advertised.len()
    }

    /// Queue an announce, replacing any prior change for the same NLRI.
    /// Routes still carrying a nexthop placeholder are refused.
    pub fn announce(&mut self, route: Route) -> Result<(), RibError> {
        let next_hop = match &route.next_hop {
            Some(NextHop::Address(addr)) => Some(*addr),
            Some(NextHop::SelfAddress) => {
                return Err(RibError::UnresolvedNextHop(route.nlri.to_string()));
            }
            None => None,
        };
        let index = route.nlri.index();
        // Re-announcing exactly what the peer already holds is a no-op
        if let Some(advertised) = self.advertised.get(&index) {
            if advertised.action == Action::Announce
                && advertised.attributes == route.attributes
                && advertised.next_hop == next_hop
            {
                self.pending.remove(&index);
                return Ok(());
            }
        }
        self.pending.insert(
            index,
            Change {
                action: Action::Announce,
                nlri: route.nlri,
                attributes: route.attributes,
                next_hop,
            },
        );
        self.dirty = true;
        Ok(())
    }

    /// Queue a withdraw, superseding any queued announce for the NLRI
    pub fn withdraw(&mut self, nlri: Nlri) {
        let index = nlri.index();
        if !self.advertised.contains_key(&index) {
            // Nothing on the wire to take back; just drop a queued announce
            self.pending.remove(&index);
            return;
        }
        self.pending.insert(
            index,
            Change {
                action: Action::Withdraw,
                nlri,
                attributes: AttributeCollection::new(),
                next_hop: None,
            },
        );
        self.dirty = true;
    }

    /// Queue a withdraw for every currently-advertised NLRI
    pub fn withdraw_all(&mut self) {
        let nlris: Vec<Nlri> = self
            .advertised
            .values()
            .map(|change| change.nlri.clone())
            .collect();
        for nlri in nlris {
            self.withdraw(nlri);
        }
    }

    /// Forget everything we believe the peer holds; used when a session
    /// drops so the next one re-advertises from scratch
    pub fn clear_advertised(&mut self) {
        for (index, change) in std::mem::take(&mut self.advertised) {
            if change.action == Action::Announce && !self.pending.contains_key(&index) {
                self.pending.insert(index, change);
                self.dirty = true;
            }
        }
    }

    /// Queue a re-send of everything advertised (route-refresh request)
    pub fn refresh(&mut self) {
        self.clear_advertised();
    }

    /// The routes the peer currently holds from us
    pub fn advertised_routes(&self) -> Vec<&Change> {
        self.advertised.values().collect()
    }

    /// Drain the pending set into update collections and account the
    /// changes as advertised.
    ///
    /// With `grouped` set, announces sharing an identical attribute set
    /// (and nexthop) are merged into one collection so they travel in
    /// the same UPDATE message; withdraws are merged per family.
    pub fn take_updates(&mut self, grouped: bool) -> Vec<Update> {
        let changes: Vec<Change> = std::mem::take(&mut self.pending).into_values().collect();
        self.dirty = false;

        let mut updates: Vec<Update> = vec![];
        let mut withdraws: Vec<Nlri> = vec![];
        // Announces sharing an attribute collection (and nexthop) travel
        // together; ungrouped mode keeps one collection per NLRI
        let mut groups: Vec<(AttributeCollection, Option<IpAddr>, Vec<Nlri>)> = vec![];

        for change in changes {
            let index = change.nlri.index();
            match change.action {
                Action::Withdraw => {
                    self.advertised.remove(&index);
                    withdraws.push(change.nlri);
                }
                Action::Announce => {
                    self.advertised.insert(index, change.clone());
                    let existing = if grouped {
                        groups.iter_mut().find(|(attributes, next_hop, _)| {
                            attributes == &change.attributes && *next_hop == change.next_hop
                        })
                    } else {
                        None
                    };
                    match existing {
                        Some((_, _, nlris)) => nlris.push(change.nlri),
                        None => {
                            groups.push((change.attributes, change.next_hop, vec![change.nlri]))
                        }
                    }
                }
            }
        }

        // Withdraws travel first so a withdraw and a later announce of
        // the same prefix never share a message
        if !withdraws.is_empty() {
            updates.push(Update::new(vec![], withdraws, AttributeCollection::new()));
        }

        for (attributes, next_hop, nlris) in groups {
            let announces: Vec<RoutedNlri> = nlris
                .into_iter()
                .map(|nlri| RoutedNlri { nlri, next_hop })
                .collect();
            // For classic IPv4 the nexthop travels as the NEXT_HOP
            // attribute; make sure the collection carries it
            let mut attributes = attributes;
            if let Some(addr) = next_hop {
                if !attributes.contains(code::NEXT_HOP) {
                    attributes.set(Attribute::NextHop(addr));
                }
            }
            updates.push(Update::new(announces, vec![], attributes));
        }
        updates
    }
}

impl fmt::Display for AdjRibOut {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "<AdjRibOut pending={} advertised={}>",
            self.pending.len(),
            self.advertised.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::attributes::{AsPath, Origin};

    fn inet(prefix: &str, length: u8) -> Nlri {
        Nlri::Inet {
            prefix: (prefix.parse().unwrap(), length).into(),
            path_id: None,
        }
    }

    fn attributes(med: Option<u32>) -> AttributeCollection {
        let mut collection = AttributeCollection::new();
        collection.set(Attribute::Origin(Origin::Igp));
        collection.set(Attribute::AsPath(AsPath::sequence(vec![65000])));
        if let Some(med) = med {
            collection.set(Attribute::MultiExitDisc(med));
        }
        collection
    }

    fn route(prefix: &str, length: u8, med: Option<u32>) -> Route {
        Route::new(
            inet(prefix, length),
            attributes(med),
            Some(NextHop::Address("192.168.1.1".parse().unwrap())),
        )
    }

    #[test]
    fn test_unresolved_sentinel_is_refused() {
        let mut rib = AdjRibOut::new();
        let unresolved = Route::new(
            inet("10.0.0.0", 24),
            attributes(None),
            Some(NextHop::SelfAddress),
        );
        assert!(rib.announce(unresolved.clone()).is_err());
        assert!(!rib.is_pending());

        // After resolution the same call succeeds
        let resolved = unresolved.resolve_self("192.168.1.1".parse().unwrap());
        assert_eq!(
            resolved.next_hop,
            Some(NextHop::Address("192.168.1.1".parse().unwrap()))
        );
        rib.announce(resolved).unwrap();
        assert!(rib.is_pending());
    }

    #[test]
    fn test_same_attribute_announces_group_into_one_update() {
        let mut rib = AdjRibOut::new();
        rib.announce(route("10.0.0.0", 24, Some(100))).unwrap();
        rib.announce(route("10.0.1.0", 24, Some(100))).unwrap();
        rib.announce(route("10.0.2.0", 24, Some(200))).unwrap();
        let updates = rib.take_updates(true);
        assert_eq!(updates.len(), 2);
        let sizes: Vec<usize> = updates.iter().map(|u| u.announces.len()).collect();
        assert!(sizes.contains(&2));
        assert!(sizes.contains(&1));
        assert!(!rib.is_pending());
        assert_eq!(rib.advertised_count(), 3);
    }

    #[test]
    fn test_withdraw_supersedes_queued_announce() {
        let mut rib = AdjRibOut::new();
        // First advertise, flush, then announce + withdraw again
        rib.announce(route("10.0.0.0", 24, None)).unwrap();
        rib.take_updates(true);

        rib.announce(route("10.0.0.0", 24, Some(50))).unwrap();
        rib.withdraw(inet("10.0.0.0", 24));
        let updates = rib.take_updates(true);
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].withdraws.len(), 1);
        assert!(updates[0].announces.is_empty());
        assert_eq!(rib.advertised_count(), 0);
    }

    #[test]
    fn test_withdraw_of_unadvertised_prefix_cancels_announce() {
        let mut rib = AdjRibOut::new();
        rib.announce(route("10.0.0.0", 24, None)).unwrap();
        rib.withdraw(inet("10.0.0.0", 24));
        let updates = rib.take_updates(true);
        assert!(updates.is_empty());
    }

    #[test]
    fn test_reannounce_identical_is_noop() {
        let mut rib = AdjRibOut::new();
        rib.announce(route("10.0.0.0", 24, Some(100))).unwrap();
        rib.take_updates(true);
        rib.announce(route("10.0.0.0", 24, Some(100))).unwrap();
        assert!(!rib.is_pending());
        assert!(rib.take_updates(true).is_empty());

        // Changing the attributes queues a real update
        rib.announce(route("10.0.0.0", 24, Some(200))).unwrap();
        assert!(rib.is_pending());
    }

    #[test]
    fn test_withdraw_all() {
        let mut rib = AdjRibOut::new();
        rib.announce(route("10.0.0.0", 24, None)).unwrap();
        rib.announce(route("10.0.1.0", 24, None)).unwrap();
        rib.take_updates(true);
        rib.withdraw_all();
        let updates = rib.take_updates(true);
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].withdraws.len(), 2);
        assert_eq!(rib.advertised_count(), 0);
    }

    #[test]
    fn test_clear_advertised_requeues_routes() {
        let mut rib = AdjRibOut::new();
        rib.announce(route("10.0.0.0", 24, None)).unwrap();
        rib.take_updates(true);
        assert_eq!(rib.advertised_count(), 1);
        rib.clear_advertised();
        assert!(rib.is_pending());
        let updates = rib.take_updates(true);
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].announces.len(), 1);
    }

    #[test]
    fn test_withdraws_emitted_before_announces() {
        let mut rib = AdjRibOut::new();
        rib.announce(route("10.0.0.0", 24, None)).unwrap();
        rib.announce(route("10.0.1.0", 24, None)).unwrap();
        rib.take_updates(true);

        rib.withdraw(inet("10.0.0.0", 24));
        rib.announce(route("10.0.2.0", 24, None)).unwrap();
        let updates = rib.take_updates(true);
        assert_eq!(updates.len(), 2);
        assert!(!updates[0].withdraws.is_empty());
        assert!(updates[0].announces.is_empty());
        assert!(!updates[1].announces.is_empty());
    }
}
