//! Wire-level codec checks across complete messages.

use bgps::message::attributes::{code, AsPath, Origin};
use bgps::message::flowspec::{FlowspecFilter, NumericOperator};
use bgps::message::nlri::FlowNlri;
use bgps::message::open::{GracefulRestart, OpenCapability, OpenParameter};
use bgps::message::{
    frame, validate_header, Afi, Attribute, AttributeCollection, Capabilities, Message,
    MessageType, Negotiated, Nlri, Open, RoutedNlri, Safi, Update, HEADER_LEN,
};

fn negotiated(families: &[(Afi, Safi)]) -> Negotiated {
    Negotiated {
        families: families.to_vec(),
        asn4: true,
        ..Default::default()
    }
}

fn header_of(message: &[u8]) -> [u8; HEADER_LEN] {
    let mut header = [0u8; HEADER_LEN];
    header.copy_from_slice(&message[..HEADER_LEN]);
    header
}

fn parse(message: &[u8], negotiated: &Negotiated) -> Message {
    let (length, message_type) = validate_header(&header_of(message), negotiated.msg_size).unwrap();
    assert_eq!(usize::from(length), message.len());
    Message::parse(message_type, &message[HEADER_LEN..], negotiated).unwrap()
}

#[test]
fn open_with_capabilities_roundtrips() {
    let open = Open {
        version: 4,
        asn: 65000,
        hold_time: 180,
        router_id: "1.1.1.1".parse().unwrap(),
        parameters: vec![OpenParameter::Capabilities(vec![
            OpenCapability::MultiProtocol((Afi::Ipv4, Safi::Unicast)),
            OpenCapability::MultiProtocol((Afi::Ipv4, Safi::Flow)),
            OpenCapability::MultiProtocol((Afi::L2vpn, Safi::Vpls)),
            OpenCapability::RouteRefresh,
            OpenCapability::FourByteAsn(65000),
            OpenCapability::GracefulRestart(GracefulRestart {
                flags: 0,
                restart_time: 120,
                families: vec![(Afi::Ipv4, Safi::Unicast, 0x80)],
            }),
        ])],
    };
    let negotiated = negotiated(&[]);
    let framed = Message::Open(open).encode(&negotiated).unwrap();
    assert_eq!(framed.len(), 1);

    match parse(&framed[0], &negotiated) {
        Message::Open(decoded) => {
            assert_eq!(decoded.asn, 65000);
            assert_eq!(decoded.hold_time, 180);
            let caps = Capabilities::from_parameters(&decoded.parameters);
            assert_eq!(caps.multiprotocol.len(), 3);
            assert!(caps.route_refresh);
            assert_eq!(caps.graceful_restart.unwrap().restart_time, 120);
        }
        other => panic!("expected OPEN, got {:?}", other),
    }
}

#[test]
fn keepalive_is_nineteen_bytes() {
    let negotiated = negotiated(&[]);
    let framed = Message::KeepAlive.encode(&negotiated).unwrap();
    assert_eq!(framed[0].len(), 19);
    assert!(matches!(parse(&framed[0], &negotiated), Message::KeepAlive));
}

#[test]
fn update_announce_roundtrips_across_families() {
    let families = [
        (Afi::Ipv4, Safi::Unicast),
        (Afi::Ipv6, Safi::Unicast),
        (Afi::Ipv4, Safi::MplsVpn),
    ];
    let negotiated = negotiated(&families);

    let mut attributes = AttributeCollection::new();
    attributes.set(Attribute::Origin(Origin::Igp));
    attributes.set(Attribute::AsPath(AsPath::sequence(vec![65000])));
    attributes.set(Attribute::NextHop("192.168.1.1".parse().unwrap()));

    let announces = vec![
        RoutedNlri {
            nlri: Nlri::Inet {
                prefix: ("10.0.0.0".parse().unwrap(), 24).into(),
                path_id: None,
            },
            next_hop: Some("192.168.1.1".parse().unwrap()),
        },
        RoutedNlri {
            nlri: Nlri::Inet {
                prefix: ("2001:db8::".parse().unwrap(), 48).into(),
                path_id: None,
            },
            next_hop: Some("2001:db8::1".parse().unwrap()),
        },
        RoutedNlri {
            nlri: Nlri::MplsVpn {
                rd: bgps::utils::rd_from_str("65000:1").unwrap(),
                prefix: ("10.1.0.0".parse().unwrap(), 16).into(),
                labels: vec![42],
                path_id: None,
            },
            next_hop: Some("192.168.1.1".parse().unwrap()),
        },
    ];
    let update = Update::new(announces.clone(), vec![], attributes);
    let messages = update.messages(&negotiated).unwrap();
    assert!(!messages.is_empty());

    let mut decoded = vec![];
    for message in &messages {
        match parse(message, &negotiated) {
            Message::Update(parsed) => decoded.extend(parsed.update.announces),
            other => panic!("expected UPDATE, got {:?}", other),
        }
    }
    let mut expected: Vec<Nlri> = announces.into_iter().map(|r| r.nlri).collect();
    let mut actual: Vec<Nlri> = decoded.into_iter().map(|r| r.nlri).collect();
    expected.sort_by_key(|n| n.index());
    actual.sort_by_key(|n| n.index());
    assert_eq!(actual, expected);
}

// Flow components travel in type-code order whatever the caller's order,
// and the last operand of each numeric test carries the end-of-list bit
#[test]
fn flow_rule_is_emitted_in_component_order() {
    let negotiated = negotiated(&[(Afi::Ipv4, Safi::Flow)]);
    let flow = Nlri::Flow(FlowNlri {
        afi: Afi::Ipv4,
        safi: Safi::Flow,
        rd: None,
        filters: vec![
            FlowspecFilter::DestinationPort(vec![(NumericOperator::EQ, 80)]),
            FlowspecFilter::IpProtocol(vec![(NumericOperator::EQ, 6)]),
            FlowspecFilter::SourcePrefix(("10.0.0.0".parse().unwrap(), 24).into()),
        ],
    });
    let mut attributes = AttributeCollection::new();
    attributes.set(Attribute::Origin(Origin::Igp));
    attributes.set(Attribute::AsPath(AsPath::default()));
    attributes.set(Attribute::ExtendedCommunities(vec![0x8006_0000_0000_0000]));

    let update = Update::new(
        vec![RoutedNlri {
            nlri: flow,
            next_hop: None,
        }],
        vec![],
        attributes,
    );
    let messages = update.messages(&negotiated).unwrap();
    assert_eq!(messages.len(), 1);

    match parse(&messages[0], &negotiated) {
        Message::Update(parsed) => match &parsed.update.announces[0].nlri {
            Nlri::Flow(decoded) => {
                let codes: Vec<u8> = decoded.filters.iter().map(|f| f.code()).collect();
                // source(2), protocol(3), destination-port(5)
                assert_eq!(codes, vec![2, 3, 5]);
            }
            other => panic!("expected flow NLRI, got {:?}", other),
        },
        other => panic!("expected UPDATE, got {:?}", other),
    }
}

// Withdraws and announces decoded from a mixed collection survive the
// trip intact, with the MP split reassembled
#[test]
fn update_with_withdraws_roundtrips() {
    let families = [(Afi::Ipv4, Safi::Unicast), (Afi::Ipv6, Safi::Unicast)];
    let negotiated = negotiated(&families);
    let mut attributes = AttributeCollection::new();
    attributes.set(Attribute::Origin(Origin::Igp));
    attributes.set(Attribute::AsPath(AsPath::sequence(vec![65000])));
    attributes.set(Attribute::NextHop("192.168.1.1".parse().unwrap()));

    let update = Update::new(
        vec![RoutedNlri {
            nlri: Nlri::Inet {
                prefix: ("10.2.0.0".parse().unwrap(), 24).into(),
                path_id: None,
            },
            next_hop: Some("192.168.1.1".parse().unwrap()),
        }],
        vec![
            Nlri::Inet {
                prefix: ("10.3.0.0".parse().unwrap(), 24).into(),
                path_id: None,
            },
            Nlri::Inet {
                prefix: ("2001:db8:f::".parse().unwrap(), 48).into(),
                path_id: None,
            },
        ],
        attributes,
    );
    let messages = update.messages(&negotiated).unwrap();
    let mut announced = 0;
    let mut withdrawn = 0;
    for message in &messages {
        match parse(message, &negotiated) {
            Message::Update(parsed) => {
                announced += parsed.update.announces.len();
                withdrawn += parsed.update.withdraws.len();
            }
            other => panic!("expected UPDATE, got {:?}", other),
        }
    }
    assert_eq!(announced, 1);
    assert_eq!(withdrawn, 2);
}

#[test]
fn notification_roundtrips() {
    let negotiated = negotiated(&[]);
    let notification = bgps::message::Notification::with_message(6, 2, "going away");
    let framed = Message::Notification(notification.clone())
        .encode(&negotiated)
        .unwrap();
    match parse(&framed[0], &negotiated) {
        Message::Notification(decoded) => assert_eq!(decoded, notification),
        other => panic!("expected NOTIFICATION, got {:?}", other),
    }
}

#[test]
fn route_refresh_roundtrips() {
    let negotiated = negotiated(&[(Afi::Ipv4, Safi::Unicast)]);
    let refresh = bgps::message::RouteRefresh::new(Afi::Ipv4, Safi::Unicast);
    let framed = Message::RouteRefresh(refresh.clone())
        .encode(&negotiated)
        .unwrap();
    assert_eq!(framed[0].len(), 23);
    match parse(&framed[0], &negotiated) {
        Message::RouteRefresh(decoded) => assert_eq!(decoded, refresh),
        other => panic!("expected ROUTE-REFRESH, got {:?}", other),
    }
}

#[test]
fn frame_and_validate_agree() {
    let framed = frame(MessageType::KeepAlive, &[]);
    let (length, message_type) =
        validate_header(&header_of(&framed), 4096).unwrap();
    assert_eq!(length, 19);
    assert_eq!(message_type, MessageType::KeepAlive);
}

#[test]
fn attribute_codes_match_the_registry() {
    assert_eq!(code::ORIGIN, 1);
    assert_eq!(code::AS_PATH, 2);
    assert_eq!(code::NEXT_HOP, 3);
    assert_eq!(code::MP_REACH_NLRI, 14);
    assert_eq!(code::MP_UNREACH_NLRI, 15);
    assert_eq!(code::AIGP, 26);
    assert_eq!(code::LARGE_COMMUNITIES, 32);
}
