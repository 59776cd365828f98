//! UPDATE messages: the semantic container of announces, withdraws and
//! shared attributes, its wire parser, and the packer that fragments a
//! container into as many on-wire UPDATEs as the negotiated message
//! size requires.

use std::collections::BTreeMap;
use std::io::{Error, ErrorKind};
use std::net::IpAddr;

use byteorder::{BigEndian, WriteBytesExt};
use log::{debug, error, warn};

use super::attributes::{
    code, mp_reach_attribute, mp_unreach_attribute, Attribute, AttributeCollection,
};
use super::negotiated::Negotiated;
use super::nlri::{Afi, Nlri, Safi};
use super::notification::Notification;
use super::{frame, MessageError, MessageType};

/// The IPv4-unicast End-of-RIB marker: an UPDATE with empty withdrawn
/// routes, zero attributes and no NLRI
const EOR_IPV4_PAYLOAD: [u8; 4] = [0, 0, 0, 0];

/// An NLRI with the nexthop it is announced with. Withdraws carry bare
/// NLRIs, so the nexthop lives here rather than on the NLRI.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct RoutedNlri {
    pub nlri: Nlri,
    /// None for families that go on the wire without a nexthop (flow)
    pub next_hop: Option<IpAddr>,
}

/// Semantic payload of one UPDATE: ordered announces, ordered withdraws,
/// and the attributes shared by every announce. A single `Update` may
/// fragment into several on-wire messages when it exceeds the
/// negotiated message size.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Update {
    pub announces: Vec<RoutedNlri>,
    pub withdraws: Vec<Nlri>,
    pub attributes: AttributeCollection,
    /// Set when this UPDATE is an End-of-RIB marker for a family
    pub eor: Option<(Afi, Safi)>,
}

/// Parse output: the update plus the RFC 7606 treat-as-withdraw reason
/// when a recoverable attribute fault was found
#[derive(Debug)]
pub struct ParsedUpdate {
    pub update: Update,
    pub withdraw_reason: Option<String>,
}

impl Update {
    pub fn new(
        announces: Vec<RoutedNlri>,
        withdraws: Vec<Nlri>,
        attributes: AttributeCollection,
    ) -> Self {
        Update {
            announces,
            withdraws,
            attributes,
            eor: None,
        }
    }

    /// An End-of-RIB marker for the family [RFC 4724]
    pub fn end_of_rib(family: (Afi, Safi)) -> Self {
        Update {
            eor: Some(family),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.announces.is_empty() && self.withdraws.is_empty() && self.eor.is_none()
    }

    /// Split an UPDATE payload into its withdrawn, attribute and
    /// announced sections, validating the two framing length fields
    fn split(payload: &[u8]) -> Result<(&[u8], &[u8], &[u8]), Notification> {
        if payload.len() < 4 {
            return Err(Notification::with_message(
                3,
                1,
                &format!("UPDATE message too short: {} bytes", payload.len()),
            ));
        }
        let withdrawn_len = usize::from(u16::from_be_bytes([payload[0], payload[1]]));
        if payload.len() < 4 + withdrawn_len {
            return Err(Notification::with_message(
                3,
                1,
                &format!("withdrawn length {} exceeds available data", withdrawn_len),
            ));
        }
        let withdrawn = &payload[2..2 + withdrawn_len];
        let attr_start = 2 + withdrawn_len + 2;
        let attr_len = usize::from(u16::from_be_bytes([
            payload[attr_start - 2],
            payload[attr_start - 1],
        ]));
        if payload.len() < attr_start + attr_len {
            return Err(Notification::with_message(
                3,
                1,
                &format!("attributes length {} exceeds available data", attr_len),
            ));
        }
        let attributes = &payload[attr_start..attr_start + attr_len];
        let announced = &payload[attr_start + attr_len..];
        Ok((withdrawn, attributes, announced))
    }

    pub fn parse(payload: &[u8], negotiated: &Negotiated) -> Result<ParsedUpdate, MessageError> {
        // IPv4-unicast End-of-RIB is recognized directly, no attribute
        // parsing involved
        if payload == &EOR_IPV4_PAYLOAD[..] {
            return Ok(ParsedUpdate {
                update: Update::end_of_rib((Afi::Ipv4, Safi::Unicast)),
                withdraw_reason: None,
            });
        }

        let (withdrawn_bytes, attr_bytes, announced_bytes) = Update::split(payload)?;
        let v4_addpath = negotiated.addpath_receive((Afi::Ipv4, Safi::Unicast));

        let mut withdraws: Vec<Nlri> = Vec::with_capacity(4);
        let mut cursor = std::io::Cursor::new(withdrawn_bytes);
        while (cursor.position() as usize) < withdrawn_bytes.len() {
            withdraws.push(Nlri::parse(
                &mut cursor,
                Afi::Ipv4,
                Safi::Unicast,
                v4_addpath,
            )?);
        }

        let parsed = AttributeCollection::parse(attr_bytes, negotiated)?;
        let mut attributes = parsed.attributes;

        let mut announces: Vec<RoutedNlri> = Vec::with_capacity(4);
        let mut cursor = std::io::Cursor::new(announced_bytes);
        while (cursor.position() as usize) < announced_bytes.len() {
            announces.push(RoutedNlri {
                nlri: Nlri::parse(&mut cursor, Afi::Ipv4, Safi::Unicast, v4_addpath)?,
                next_hop: None,
            });
        }

        // NEXT_HOP is mandatory for announcements in the classic NLRI area
        let next_hop = attributes.next_hop();
        if !announces.is_empty() {
            match next_hop {
                Some(addr) => {
                    for routed in announces.iter_mut() {
                        routed.next_hop = Some(addr);
                    }
                    // RFC 4271 Sect. 5.1.3: a nexthop pointing back at the
                    // receiver is logged but does not kill the session
                    if Some(addr) == negotiated.local_address {
                        warn!(
                            "received NEXT_HOP {} equals our local address (RFC 4271 violation)",
                            addr
                        );
                    }
                }
                None => {
                    return Err(Notification::with_message(
                        3,
                        5,
                        "announced NLRIs without a NEXT_HOP attribute",
                    )
                    .into());
                }
            }
        }

        // Fold the multiprotocol attributes into the announce/withdraw
        // lists; an empty MP_UNREACH is End-of-RIB for the family
        let mut eor = None;
        if let Some(Attribute::MpReachNlri(mp)) = attributes.remove(code::MP_REACH_NLRI) {
            let next_hop = mp.next_hop_ip();
            for nlri in mp.nlris {
                announces.push(RoutedNlri { nlri, next_hop });
            }
        }
        if let Some(Attribute::MpUnreachNlri(mp)) = attributes.remove(code::MP_UNREACH_NLRI) {
            if mp.nlris.is_empty() {
                if announces.is_empty() && withdraws.is_empty() && attributes.is_empty() {
                    eor = Some((mp.afi, mp.safi));
                } else {
                    debug!("empty MP_UNREACH_NLRI inside a non-empty UPDATE, ignoring");
                }
            } else {
                withdraws.extend(mp.nlris);
            }
        }

        Ok(ParsedUpdate {
            update: Update {
                announces,
                withdraws,
                attributes,
                eor,
            },
            withdraw_reason: parsed.withdraw_reason,
        })
    }

    /// Pack into zero or more complete on-wire messages, each within the
    /// negotiated message size. Announces sharing these attributes
    /// travel together; families outside the negotiated set are skipped.
    pub fn messages(&self, negotiated: &Negotiated) -> Result<Vec<Vec<u8>>, Error> {
        if let Some(family) = self.eor {
            return Ok(vec![end_of_rib_message(family)]);
        }

        let mut v4_announces: Vec<&RoutedNlri> = vec![];
        let mut v4_withdraws: Vec<&Nlri> = vec![];
        let mut mp_announces: BTreeMap<(Afi, Safi), Vec<&RoutedNlri>> = BTreeMap::new();
        let mut mp_withdraws: BTreeMap<(Afi, Safi), Vec<&Nlri>> = BTreeMap::new();

        for routed in &self.announces {
            let family = routed.nlri.family();
            if !negotiated.families.is_empty() && !negotiated.families.contains(&family) {
                debug!("family {} {} not negotiated, skipping announce", family.0, family.1);
                continue;
            }
            let classic = family.0 == Afi::Ipv4
                && family.1.is_classic()
                && matches!(routed.next_hop, Some(IpAddr::V4(_)));
            if classic {
                v4_announces.push(routed);
            } else {
                mp_announces.entry(family).or_default().push(routed);
            }
        }
        for nlri in &self.withdraws {
            let family = nlri.family();
            if !negotiated.families.is_empty() && !negotiated.families.contains(&family) {
                debug!("family {} {} not negotiated, skipping withdraw", family.0, family.1);
                continue;
            }
            if family.0 == Afi::Ipv4 && family.1.is_classic() {
                v4_withdraws.push(nlri);
            } else {
                mp_withdraws.entry(family).or_default().push(nlri);
            }
        }

        let has_any = !v4_announces.is_empty()
            || !v4_withdraws.is_empty()
            || !mp_announces.is_empty()
            || !mp_withdraws.is_empty();
        if !has_any {
            return Ok(vec![]);
        }

        // An UPDATE carrying only MP_UNREACH_NLRI is not required to
        // carry any other path attributes [RFC 4760]
        let only_withdraws = v4_announces.is_empty() && mp_announces.is_empty();
        let attr = if only_withdraws {
            vec![]
        } else {
            self.attributes.pack(negotiated)?
        };

        // Two 2-byte length fields frame the withdrawn and attribute
        // sections of every message
        let budget =
            i64::from(negotiated.msg_size) - 19 - 2 - 2 - attr.len() as i64;
        if budget <= 0 {
            error!("attribute set larger than the negotiated message size, not sending");
            return Ok(vec![]);
        }
        let budget = budget as usize;

        let mut out: Vec<Vec<u8>> = vec![];
        let mut announced: Vec<u8> = vec![];
        let mut withdrawn: Vec<u8> = vec![];

        for routed in v4_announces {
            let family = routed.nlri.family();
            let mut packed = vec![];
            routed
                .nlri
                .encode(&mut packed, negotiated.addpath_send(family))?;
            if announced.len() + withdrawn.len() + packed.len() <= budget {
                announced.extend_from_slice(&packed);
                continue;
            }
            if announced.is_empty() && withdrawn.is_empty() {
                error!("attribute set leaves no room for a single NLRI, not sending");
                return Ok(out);
            }
            out.push(build_message(&withdrawn, &attr, &announced));
            announced = packed;
            withdrawn.clear();
        }

        for nlri in v4_withdraws {
            let family = nlri.family();
            let mut packed = vec![];
            nlri.encode(&mut packed, negotiated.addpath_send(family))?;
            if announced.len() + withdrawn.len() + packed.len() <= budget {
                withdrawn.extend_from_slice(&packed);
                continue;
            }
            if announced.is_empty() && withdrawn.is_empty() {
                error!("attribute set leaves no room for a single NLRI, not sending");
                return Ok(out);
            }
            if announced.is_empty() {
                out.push(build_message(&withdrawn, &[], &[]));
            } else {
                out.push(build_message(&withdrawn, &attr, &announced));
            }
            withdrawn = packed;
            announced.clear();
        }

        if !announced.is_empty() || !withdrawn.is_empty() {
            if announced.is_empty() {
                out.push(build_message(&withdrawn, &[], &[]));
            } else {
                out.push(build_message(&withdrawn, &attr, &announced));
            }
        }

        // Multiprotocol families: one (AFI, SAFI) per MP attribute, a
        // fresh MP_REACH/MP_UNREACH in every emitted message
        for (family, routeds) in mp_announces {
            let addpath = negotiated.addpath_send(family);
            // MP_REACH carries a single nexthop, so group by nexthop bytes
            let mut by_next_hop: BTreeMap<Vec<u8>, Vec<Vec<u8>>> = BTreeMap::new();
            for routed in routeds {
                let nh = mp_next_hop_bytes(family, routed.next_hop)?;
                let mut packed = vec![];
                routed.nlri.encode(&mut packed, addpath)?;
                by_next_hop.entry(nh).or_default().push(packed);
            }
            for (next_hop, nlris) in by_next_hop {
                // attribute header (up to 4) + afi/safi/nhlen/reserved (5)
                let overhead = 4 + 5 + next_hop.len();
                if budget <= overhead {
                    error!("attribute set leaves no room for {} {} NLRIs, not sending", family.0, family.1);
                    continue;
                }
                let capacity = budget - overhead;
                let mut chunk: Vec<u8> = vec![];
                for packed in nlris {
                    if packed.len() > capacity {
                        error!("oversized {} {} NLRI, not sending", family.0, family.1);
                        continue;
                    }
                    if chunk.len() + packed.len() > capacity {
                        let reach = mp_reach_attribute(family, &next_hop, &chunk);
                        out.push(build_message(&[], &[&attr[..], &reach[..]].concat(), &[]));
                        chunk.clear();
                    }
                    chunk.extend_from_slice(&packed);
                }
                if !chunk.is_empty() {
                    let reach = mp_reach_attribute(family, &next_hop, &chunk);
                    out.push(build_message(&[], &[&attr[..], &reach[..]].concat(), &[]));
                }
            }
        }

        for (family, nlris) in mp_withdraws {
            let addpath = negotiated.addpath_send(family);
            let overhead = 4 + 3;
            if budget <= overhead {
                error!("attribute set leaves no room for {} {} withdraws, not sending", family.0, family.1);
                continue;
            }
            let capacity = budget - overhead;
            let mut chunk: Vec<u8> = vec![];
            for nlri in nlris {
                let mut packed = vec![];
                nlri.encode(&mut packed, addpath)?;
                if packed.len() > capacity {
                    error!("oversized {} {} NLRI, not sending", family.0, family.1);
                    continue;
                }
                if chunk.len() + packed.len() > capacity {
                    let unreach = mp_unreach_attribute(family, &chunk);
                    out.push(build_message(&[], &[&attr[..], &unreach[..]].concat(), &[]));
                    chunk.clear();
                }
                chunk.extend_from_slice(&packed);
            }
            if !chunk.is_empty() {
                let unreach = mp_unreach_attribute(family, &chunk);
                out.push(build_message(&[], &[&attr[..], &unreach[..]].concat(), &[]));
            }
        }

        Ok(out)
    }
}

/// Nexthop octets for an MP_REACH attribute of the family; VPN nexthops
/// are prefixed by a zeroed route distinguisher
fn mp_next_hop_bytes(family: (Afi, Safi), next_hop: Option<IpAddr>) -> Result<Vec<u8>, Error> {
    let addr = match next_hop {
        Some(addr) => addr,
        None if family.1.is_flow() => return Ok(vec![]),
        None => {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                format!("missing nexthop for {} {} NLRI", family.0, family.1),
            ));
        }
    };
    let mut bytes = vec![];
    if family.1 == Safi::MplsVpn {
        bytes.extend_from_slice(&[0u8; 8]);
    }
    match addr {
        IpAddr::V4(v4) => bytes.extend_from_slice(&v4.octets()),
        IpAddr::V6(v6) => bytes.extend_from_slice(&v6.octets()),
    }
    Ok(bytes)
}

/// Assemble one framed UPDATE from the three packed sections
fn build_message(withdrawn: &[u8], attributes: &[u8], announced: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(4 + withdrawn.len() + attributes.len() + announced.len());
    payload
        .write_u16::<BigEndian>(withdrawn.len() as u16)
        .expect("in-memory write cannot fail");
    payload.extend_from_slice(withdrawn);
    payload
        .write_u16::<BigEndian>(attributes.len() as u16)
        .expect("in-memory write cannot fail");
    payload.extend_from_slice(attributes);
    payload.extend_from_slice(announced);
    frame(MessageType::Update, &payload)
}

fn end_of_rib_message(family: (Afi, Safi)) -> Vec<u8> {
    if family == (Afi::Ipv4, Safi::Unicast) {
        frame(MessageType::Update, &EOR_IPV4_PAYLOAD)
    } else {
        let unreach = mp_unreach_attribute(family, &[]);
        build_message(&[], &unreach, &[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::attributes::{AsPath, Origin};
    use crate::message::{Message, HEADER_LEN};

    fn negotiated_with(families: &[(Afi, Safi)], msg_size: u16) -> Negotiated {
        Negotiated {
            families: families.to_vec(),
            msg_size,
            asn4: true,
            ..Default::default()
        }
    }

    fn inet(prefix: &str, length: u8) -> Nlri {
        Nlri::Inet {
            prefix: (prefix.parse().unwrap(), length).into(),
            path_id: None,
        }
    }

    fn routed(prefix: &str, length: u8, next_hop: &str) -> RoutedNlri {
        RoutedNlri {
            nlri: inet(prefix, length),
            next_hop: Some(next_hop.parse().unwrap()),
        }
    }

    fn base_attributes(next_hop: &str) -> AttributeCollection {
        let mut attributes = AttributeCollection::new();
        attributes.set(Attribute::Origin(Origin::Igp));
        attributes.set(Attribute::AsPath(AsPath::default()));
        attributes.set(Attribute::NextHop(next_hop.parse().unwrap()));
        attributes
    }

    // Minimal IPv4-unicast UPDATE announcing 10.0.0.0/24 with next-hop
    // 192.168.1.1, origin IGP, empty AS_PATH, MED 100: 48 bytes total
    #[test]
    fn test_reference_announce_encoding() {
        let negotiated = negotiated_with(&[(Afi::Ipv4, Safi::Unicast)], 4096);
        let mut attributes = base_attributes("192.168.1.1");
        attributes.set(Attribute::MultiExitDisc(100));
        let update = Update::new(
            vec![routed("10.0.0.0", 24, "192.168.1.1")],
            vec![],
            attributes,
        );
        let messages = update.messages(&negotiated).unwrap();
        assert_eq!(messages.len(), 1);
        let mut expected = vec![0xff; 16];
        expected.extend_from_slice(&[
            0x00, 0x30, // length 48
            0x02, // UPDATE
            0x00, 0x00, // no withdrawn routes
            0x00, 0x15, // attributes length 21
            0x40, 0x01, 0x01, 0x00, // ORIGIN IGP
            0x40, 0x02, 0x00, // empty AS_PATH
            0x40, 0x03, 0x04, 0xC0, 0xA8, 0x01, 0x01, // NEXT_HOP 192.168.1.1
            0x40, 0x04, 0x04, 0x00, 0x00, 0x00, 0x64, // MED 100
            0x18, 0x0A, 0x00, 0x00, // 10.0.0.0/24
        ]);
        assert_eq!(messages[0], expected);
    }

    #[test]
    fn test_ipv4_end_of_rib() {
        let negotiated = negotiated_with(&[(Afi::Ipv4, Safi::Unicast)], 4096);
        let update = Update::end_of_rib((Afi::Ipv4, Safi::Unicast));
        let messages = update.messages(&negotiated).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(&messages[0][HEADER_LEN..], &EOR_IPV4_PAYLOAD);

        let parsed = Update::parse(&messages[0][HEADER_LEN..], &negotiated).unwrap();
        assert_eq!(parsed.update.eor, Some((Afi::Ipv4, Safi::Unicast)));
    }

    #[test]
    fn test_mp_end_of_rib_roundtrip() {
        let family = (Afi::Ipv6, Safi::Unicast);
        let negotiated = negotiated_with(&[family], 4096);
        let update = Update::end_of_rib(family);
        let messages = update.messages(&negotiated).unwrap();
        assert_eq!(messages.len(), 1);
        let parsed = Update::parse(&messages[0][HEADER_LEN..], &negotiated).unwrap();
        assert_eq!(parsed.update.eor, Some(family));
    }

    #[test]
    fn test_parse_rejects_missing_next_hop() {
        let negotiated = negotiated_with(&[(Afi::Ipv4, Safi::Unicast)], 4096);
        let mut attr_bytes = vec![];
        Attribute::Origin(Origin::Igp)
            .encode(&mut attr_bytes, &negotiated)
            .unwrap();
        let mut payload = vec![0, 0];
        payload.push(0);
        payload.push(attr_bytes.len() as u8);
        payload.extend_from_slice(&attr_bytes);
        payload.extend_from_slice(&[24, 10, 0, 0]); // 10.0.0.0/24
        match Update::parse(&payload, &negotiated) {
            Err(MessageError::Notify(n)) => assert_eq!((n.code, n.subcode), (3, 5)),
            other => panic!("expected missing NEXT_HOP fault, got {:?}", other),
        }
    }

    #[test]
    fn test_fragmentation_respects_message_size() {
        // Small negotiated size to force fragmentation
        let negotiated = negotiated_with(&[(Afi::Ipv4, Safi::Unicast)], 64);
        let attributes = base_attributes("192.168.1.1");
        let announces: Vec<RoutedNlri> = (0..64u32)
            .map(|i| {
                routed(
                    &format!("10.{}.{}.0", i / 256, i % 256),
                    24,
                    "192.168.1.1",
                )
            })
            .collect();
        let update = Update::new(announces.clone(), vec![], attributes);
        let messages = update.messages(&negotiated).unwrap();
        assert!(messages.len() > 1);

        let mut decoded: Vec<Nlri> = vec![];
        for message in &messages {
            assert!(message.len() <= 64);
            let parsed = Update::parse(&message[HEADER_LEN..], &negotiated).unwrap();
            decoded.extend(parsed.update.announces.into_iter().map(|r| r.nlri));
        }
        let expected: Vec<Nlri> = announces.into_iter().map(|r| r.nlri).collect();
        assert_eq!(decoded, expected);
    }

    #[test]
    fn test_mp_fragmentation_respects_message_size() {
        let family = (Afi::Ipv6, Safi::Unicast);
        let negotiated = negotiated_with(&[family], 96);
        let mut attributes = AttributeCollection::new();
        attributes.set(Attribute::Origin(Origin::Igp));
        attributes.set(Attribute::AsPath(AsPath::default()));
        let announces: Vec<RoutedNlri> = (0..32u32)
            .map(|i| RoutedNlri {
                nlri: Nlri::Inet {
                    prefix: (format!("2001:db8:{}::", i).parse().unwrap(), 48).into(),
                    path_id: None,
                },
                next_hop: Some("2001:db8::1".parse().unwrap()),
            })
            .collect();
        let update = Update::new(announces.clone(), vec![], attributes);
        let messages = update.messages(&negotiated).unwrap();
        assert!(messages.len() > 1);

        let mut decoded: Vec<Nlri> = vec![];
        for message in &messages {
            assert!(message.len() <= 96);
            let parsed = Update::parse(&message[HEADER_LEN..], &negotiated).unwrap();
            decoded.extend(parsed.update.announces.into_iter().map(|r| r.nlri));
        }
        let expected: Vec<Nlri> = announces.into_iter().map(|r| r.nlri).collect();
        assert_eq!(decoded, expected);
    }

    #[test]
    fn test_withdraw_only_message_omits_attributes() {
        let negotiated = negotiated_with(&[(Afi::Ipv4, Safi::Unicast)], 4096);
        let update = Update::new(vec![], vec![inet("10.0.0.0", 24)], base_attributes("1.1.1.1"));
        let messages = update.messages(&negotiated).unwrap();
        assert_eq!(messages.len(), 1);
        let payload = &messages[0][HEADER_LEN..];
        // withdrawn length 4, attribute length 0
        assert_eq!(&payload[..2], &[0, 4]);
        assert_eq!(&payload[6..8], &[0, 0]);
    }

    #[test]
    fn test_mp_withdraw_only_omits_default_attributes() {
        let family = (Afi::Ipv6, Safi::Unicast);
        let negotiated = negotiated_with(&[family], 4096);
        let update = Update::new(
            vec![],
            vec![Nlri::Inet {
                prefix: ("2001:db8::".parse().unwrap(), 48).into(),
                path_id: None,
            }],
            base_attributes("1.1.1.1"),
        );
        let messages = update.messages(&negotiated).unwrap();
        assert_eq!(messages.len(), 1);
        let parsed = Update::parse(&messages[0][HEADER_LEN..], &negotiated).unwrap();
        assert_eq!(parsed.update.withdraws.len(), 1);
        // only MP_UNREACH_NLRI traveled
        assert!(parsed.update.attributes.is_empty());
        assert!(parsed.update.announces.is_empty());
    }

    #[test]
    fn test_oversized_attributes_produce_nothing() {
        let negotiated = negotiated_with(&[(Afi::Ipv4, Safi::Unicast)], 64);
        let mut attributes = base_attributes("192.168.1.1");
        attributes.set(Attribute::Communities((0..64u32).collect()));
        let update = Update::new(
            vec![routed("10.0.0.0", 24, "192.168.1.1")],
            vec![],
            attributes,
        );
        let messages = update.messages(&negotiated).unwrap();
        assert!(messages.is_empty());
    }

    #[test]
    fn test_non_negotiated_family_is_skipped() {
        let negotiated = negotiated_with(&[(Afi::Ipv4, Safi::Unicast)], 4096);
        let update = Update::new(
            vec![RoutedNlri {
                nlri: Nlri::Inet {
                    prefix: ("2001:db8::".parse().unwrap(), 48).into(),
                    path_id: None,
                },
                next_hop: Some("2001:db8::1".parse().unwrap()),
            }],
            vec![],
            base_attributes("1.1.1.1"),
        );
        let messages = update.messages(&negotiated).unwrap();
        assert!(messages.is_empty());
    }

    #[test]
    fn test_update_message_roundtrip_through_message_parse() {
        let negotiated = negotiated_with(&[(Afi::Ipv4, Safi::Unicast)], 4096);
        let update = Update::new(
            vec![routed("10.0.0.0", 24, "192.168.1.1")],
            vec![],
            base_attributes("192.168.1.1"),
        );
        let messages = update.messages(&negotiated).unwrap();
        let message = Message::parse(
            MessageType::Update,
            &messages[0][HEADER_LEN..],
            &negotiated,
        )
        .unwrap();
        match message {
            Message::Update(parsed) => {
                assert_eq!(parsed.update.announces[0].nlri, inet("10.0.0.0", 24));
            }
            other => panic!("expected UPDATE, got {:?}", other),
        }
    }
}
