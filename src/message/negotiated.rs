//! Derives the working parameter set of a session from the locally
//! configured capabilities and the peer's received OPEN.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr};

use log::{debug, warn};

use super::nlri::{Afi, Safi};
use super::notification::Notification;
use super::open::{Capabilities, GracefulRestart, Open, AS_TRANS};
use super::{DEFAULT_MESSAGE_SIZE, EXTENDED_MESSAGE_SIZE};

/// Which route-refresh variant the session runs; enhanced takes
/// precedence over classic when both are advertised
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RefreshVariant {
    None,
    Classic,
    Enhanced,
}

/// Per-family Add-Path directions in effect on the wire.
///
/// "send" means our NLRIs towards the peer carry Path IDs, "receive"
/// means the peer's NLRIs towards us do.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AddPathMap {
    send: HashSet<(Afi, Safi)>,
    receive: HashSet<(Afi, Safi)>,
}

impl AddPathMap {
    pub fn send(&self, family: (Afi, Safi)) -> bool {
        self.send.contains(&family)
    }

    pub fn receive(&self, family: (Afi, Safi)) -> bool {
        self.receive.contains(&family)
    }

    pub fn is_empty(&self) -> bool {
        self.send.is_empty() && self.receive.is_empty()
    }
}

/// The session parameter set produced by OPEN negotiation, consumed by
/// the codec (per-NLRI behaviors) and the session FSM (timers, families,
/// message size)
#[derive(Clone, Debug)]
pub struct Negotiated {
    pub local_asn: u32,
    pub peer_asn: u32,
    /// The peer's router-id from its OPEN
    pub router_id: Ipv4Addr,
    /// Agreed hold time; 0 disables keepalives entirely
    pub hold_time: u16,
    /// Keepalive interval, hold_time / 3
    pub keepalive: u16,
    /// Both sides advertised 4-byte ASN support
    pub asn4: bool,
    /// Largest message either side may send
    pub msg_size: u16,
    /// Families both sides agreed to exchange
    pub families: Vec<(Afi, Safi)>,
    /// Families we wanted but the peer did not advertise
    pub missing_families: Vec<(Afi, Safi)>,
    pub add_path: AddPathMap,
    pub refresh: RefreshVariant,
    /// The peer's graceful-restart advertisement, when made
    pub graceful_restart: Option<GracefulRestart>,
    pub multisession: bool,
    pub operational: bool,
    pub aigp: bool,
    /// Our side of the connection, once known; lets the decoder flag
    /// nexthops pointing back at us
    pub local_address: Option<IpAddr>,
}

impl Default for Negotiated {
    fn default() -> Self {
        Self {
            local_asn: 0,
            peer_asn: 0,
            router_id: Ipv4Addr::UNSPECIFIED,
            hold_time: 0,
            keepalive: 0,
            asn4: false,
            msg_size: DEFAULT_MESSAGE_SIZE,
            families: vec![],
            missing_families: vec![],
            add_path: AddPathMap::default(),
            refresh: RefreshVariant::None,
            graceful_restart: None,
            multisession: false,
            operational: false,
            aigp: false,
            local_address: None,
        }
    }
}

impl Negotiated {
    /// True when NLRIs of this family that we emit must carry a Path ID
    pub fn addpath_send(&self, family: (Afi, Safi)) -> bool {
        self.add_path.send(family)
    }

    /// True when NLRIs of this family received from the peer carry a Path ID
    pub fn addpath_receive(&self, family: (Afi, Safi)) -> bool {
        self.add_path.receive(family)
    }

    /// The 2-octet ASN field value for our outgoing OPEN
    pub fn wire_asn(local_asn: u32) -> u16 {
        if local_asn > u32::from(std::u16::MAX) {
            AS_TRANS
        } else {
            local_asn as u16
        }
    }
}

/// Derive the session parameters from what we configured and what the
/// peer sent. Rejections carry the exact RFC (code, subcode) tuple.
pub fn negotiate(
    local: &Capabilities,
    local_asn: u32,
    local_hold_time: u16,
    open: &Open,
) -> Result<Negotiated, Notification> {
    if open.version != 4 {
        return Err(Notification {
            code: 2,
            subcode: 1,
            data: vec![0, 4],
        });
    }

    // Hold time: min of both sides; 0 disables keepalives; 1 and 2 are
    // unacceptable per RFC 4271 Sect. 4.2
    if open.hold_time == 1 || open.hold_time == 2 {
        return Err(Notification::with_message(
            2,
            6,
            &format!("hold time {} is unacceptable", open.hold_time),
        ));
    }
    let hold_time = std::cmp::min(local_hold_time, open.hold_time);
    let keepalive = hold_time / 3;

    let peer = Capabilities::from_parameters(&open.parameters);

    // ASN4 is in effect only when both sides advertised it; the peer's
    // effective ASN then comes from the capability value
    let asn4 = local.four_byte_asn.is_some() && peer.four_byte_asn.is_some();
    let peer_asn = match peer.four_byte_asn {
        Some(asn) if asn4 => {
            if asn > u32::from(std::u16::MAX) && open.asn != AS_TRANS {
                debug!(
                    "peer advertised 4-byte ASN {} without AS_TRANS in the OPEN header",
                    asn
                );
            }
            asn
        }
        _ => u32::from(open.asn),
    };

    // Families: the intersection; what we wanted but did not get is
    // recorded for logging, it does not abort the session
    let mut families: Vec<(Afi, Safi)> = local
        .multiprotocol
        .intersection(&peer.multiprotocol)
        .copied()
        .collect();
    families.sort_by_key(|(afi, safi)| (*afi as u16, *safi as u8));
    let mut missing_families: Vec<(Afi, Safi)> = local
        .multiprotocol
        .difference(&peer.multiprotocol)
        .copied()
        .collect();
    missing_families.sort_by_key(|(afi, safi)| (*afi as u16, *safi as u8));
    for family in &missing_families {
        warn!(
            "family {} {} configured locally but not advertised by peer",
            family.0, family.1
        );
    }

    // Add-Path directions pair up across the wire: our send requires the
    // peer to have advertised receive, and vice-versa
    let mut add_path = AddPathMap::default();
    for (family, local_dir) in &local.add_path {
        if let Some(peer_dir) = peer.add_path.get(family) {
            if local_dir.sends() && peer_dir.receives() {
                add_path.send.insert(*family);
            }
            if local_dir.receives() && peer_dir.sends() {
                add_path.receive.insert(*family);
            }
        }
    }

    let msg_size = if local.extended_message && peer.extended_message {
        EXTENDED_MESSAGE_SIZE
    } else {
        DEFAULT_MESSAGE_SIZE
    };

    let refresh = if local.enhanced_route_refresh && peer.enhanced_route_refresh {
        RefreshVariant::Enhanced
    } else if (local.route_refresh || local.cisco_route_refresh)
        && (peer.route_refresh || peer.cisco_route_refresh)
    {
        RefreshVariant::Classic
    } else {
        RefreshVariant::None
    };

    Ok(Negotiated {
        local_asn,
        peer_asn,
        router_id: open.router_id,
        hold_time,
        keepalive,
        asn4,
        msg_size,
        families,
        missing_families,
        add_path,
        refresh,
        graceful_restart: peer.graceful_restart.clone(),
        multisession: local.multisession && peer.multisession,
        operational: local.operational && peer.operational,
        aigp: local.aigp && peer.aigp,
        local_address: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::open::{AddPathDirection, OpenCapability, OpenParameter};

    fn capabilities(families: &[(Afi, Safi)], asn4: Option<u32>) -> Capabilities {
        let mut caps = Capabilities::default();
        caps.multiprotocol = families.iter().copied().collect();
        caps.four_byte_asn = asn4;
        caps
    }

    fn open_for(caps: &Capabilities, asn: u16, hold_time: u16, router_id: Ipv4Addr) -> Open {
        Open {
            version: 4,
            asn,
            hold_time,
            router_id,
            parameters: caps.to_parameters(),
        }
    }

    #[test]
    fn test_hold_time_minimum_wins() {
        let local = capabilities(&[(Afi::Ipv4, Safi::Unicast)], Some(65000));
        let peer = capabilities(&[(Afi::Ipv4, Safi::Unicast)], Some(65001));
        let open = open_for(&peer, 65001, 90, Ipv4Addr::new(2, 2, 2, 2));
        let negotiated = negotiate(&local, 65000, 180, &open).unwrap();
        assert_eq!(negotiated.hold_time, 90);
        assert_eq!(negotiated.keepalive, 30);
    }

    #[test]
    fn test_hold_time_of_one_or_two_is_rejected() {
        let local = capabilities(&[(Afi::Ipv4, Safi::Unicast)], None);
        for bad in [1u16, 2] {
            let open = open_for(&local.clone(), 65001, bad, Ipv4Addr::new(2, 2, 2, 2));
            let err = negotiate(&local, 65000, 180, &open).unwrap_err();
            assert_eq!((err.code, err.subcode), (2, 6));
        }
    }

    #[test]
    fn test_zero_hold_time_disables_keepalive() {
        let local = capabilities(&[(Afi::Ipv4, Safi::Unicast)], None);
        let open = open_for(&local.clone(), 65001, 0, Ipv4Addr::new(2, 2, 2, 2));
        let negotiated = negotiate(&local, 65000, 180, &open).unwrap();
        assert_eq!(negotiated.hold_time, 0);
        assert_eq!(negotiated.keepalive, 0);
    }

    #[test]
    fn test_asn4_negotiation() {
        // Local ASN above 16 bits: peer advertises ASN4, OPEN carries AS_TRANS
        let local = capabilities(&[(Afi::Ipv4, Safi::Unicast)], Some(131_072));
        let peer = capabilities(&[(Afi::Ipv4, Safi::Unicast)], Some(131_073));
        let open = open_for(&peer, AS_TRANS, 180, Ipv4Addr::new(2, 2, 2, 2));
        let negotiated = negotiate(&local, 131_072, 180, &open).unwrap();
        assert!(negotiated.asn4);
        assert_eq!(negotiated.peer_asn, 131_073);
        assert_eq!(negotiated.local_asn, 131_072);
        assert_eq!(Negotiated::wire_asn(131_072), AS_TRANS);
    }

    #[test]
    fn test_asn4_not_advertised_by_peer() {
        let local = capabilities(&[(Afi::Ipv4, Safi::Unicast)], Some(65000));
        let peer = capabilities(&[(Afi::Ipv4, Safi::Unicast)], None);
        let open = open_for(&peer, 65001, 180, Ipv4Addr::new(2, 2, 2, 2));
        let negotiated = negotiate(&local, 65000, 180, &open).unwrap();
        assert!(!negotiated.asn4);
        assert_eq!(negotiated.peer_asn, 65001);
    }

    #[test]
    fn test_family_intersection_and_mismatch() {
        let local = capabilities(
            &[(Afi::Ipv4, Safi::Unicast), (Afi::Ipv6, Safi::Unicast)],
            None,
        );
        let peer = capabilities(&[(Afi::Ipv4, Safi::Unicast)], None);
        let open = open_for(&peer, 65001, 180, Ipv4Addr::new(2, 2, 2, 2));
        let negotiated = negotiate(&local, 65000, 180, &open).unwrap();
        assert_eq!(negotiated.families, vec![(Afi::Ipv4, Safi::Unicast)]);
        assert_eq!(negotiated.missing_families, vec![(Afi::Ipv6, Safi::Unicast)]);
    }

    #[test]
    fn test_extended_message_size() {
        let mut local = capabilities(&[(Afi::Ipv4, Safi::Unicast)], None);
        local.extended_message = true;
        let mut peer = capabilities(&[(Afi::Ipv4, Safi::Unicast)], None);
        peer.extended_message = true;
        let open = open_for(&peer, 65001, 180, Ipv4Addr::new(2, 2, 2, 2));
        let negotiated = negotiate(&local, 65000, 180, &open).unwrap();
        assert_eq!(negotiated.msg_size, EXTENDED_MESSAGE_SIZE);

        peer.extended_message = false;
        let open = open_for(&peer, 65001, 180, Ipv4Addr::new(2, 2, 2, 2));
        let negotiated = negotiate(&local, 65000, 180, &open).unwrap();
        assert_eq!(negotiated.msg_size, DEFAULT_MESSAGE_SIZE);
    }

    #[test]
    fn test_enhanced_refresh_takes_precedence() {
        let mut local = capabilities(&[(Afi::Ipv4, Safi::Unicast)], None);
        local.route_refresh = true;
        local.enhanced_route_refresh = true;
        let mut peer = local.clone();
        peer.enhanced_route_refresh = true;
        let open = open_for(&peer, 65001, 180, Ipv4Addr::new(2, 2, 2, 2));
        let negotiated = negotiate(&local, 65000, 180, &open).unwrap();
        assert_eq!(negotiated.refresh, RefreshVariant::Enhanced);
    }

    #[test]
    fn test_addpath_direction_pairing() {
        let family = (Afi::Ipv4, Safi::Unicast);
        let mut local = capabilities(&[family], None);
        local.add_path.insert(family, AddPathDirection::Send);
        let mut peer = capabilities(&[family], None);
        peer.add_path.insert(family, AddPathDirection::Receive);
        let open = open_for(&peer, 65001, 180, Ipv4Addr::new(2, 2, 2, 2));
        let negotiated = negotiate(&local, 65000, 180, &open).unwrap();
        assert!(negotiated.addpath_send(family));
        assert!(!negotiated.addpath_receive(family));
    }

    // Swapping the two sides yields the same families, hold time, message
    // size, with send/receive mirrored
    #[test]
    fn test_negotiation_commutes() {
        let family = (Afi::Ipv4, Safi::Unicast);
        let mut a = capabilities(&[family, (Afi::Ipv6, Safi::Unicast)], Some(65000));
        a.add_path.insert(family, AddPathDirection::SendReceive);
        a.extended_message = true;
        let mut b = capabilities(&[family], Some(65001));
        b.add_path.insert(family, AddPathDirection::Receive);
        b.extended_message = true;

        let open_b = open_for(&b, 65001, 120, Ipv4Addr::new(2, 2, 2, 2));
        let open_a = open_for(&a, 65000, 180, Ipv4Addr::new(1, 1, 1, 1));

        let from_a = negotiate(&a, 65000, 180, &open_b).unwrap();
        let from_b = negotiate(&b, 65001, 120, &open_a).unwrap();

        assert_eq!(from_a.families, from_b.families);
        assert_eq!(from_a.hold_time, from_b.hold_time);
        assert_eq!(from_a.msg_size, from_b.msg_size);
        assert_eq!(from_a.addpath_send(family), from_b.addpath_receive(family));
        assert_eq!(from_a.addpath_receive(family), from_b.addpath_send(family));
    }

    #[test]
    fn test_parameter_tlv_roundtrip() {
        let mut caps = capabilities(&[(Afi::Ipv4, Safi::Flow)], Some(65000));
        caps.route_refresh = true;
        caps.multisession = true;
        let params = caps.to_parameters();
        let rebuilt = Capabilities::from_parameters(&params);
        assert_eq!(rebuilt.multiprotocol, caps.multiprotocol);
        assert_eq!(rebuilt.four_byte_asn, caps.four_byte_asn);
        assert!(rebuilt.route_refresh);
        assert!(rebuilt.multisession);
        let _ = OpenParameter::Capabilities(vec![OpenCapability::RouteRefresh]);
    }
}
