//! Loopback establishment: two sessions handshake over a real TCP pair,
//! exchange routes and End-of-RIB markers.

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;

use bgps::config::{PeerConfig, RouteSpec};
use bgps::message::{Afi, Safi};
use bgps::rib::Family;
use bgps::session::{MessageCodec, Session, SessionState, SessionUpdate};

fn peer_config(
    remote_ip: &str,
    remote_as: u32,
    local_as: u32,
    router_id: Ipv4Addr,
    dest_port: u16,
) -> PeerConfig {
    PeerConfig {
        remote_ip: remote_ip.parse().unwrap(),
        remote_as,
        local_as,
        local_router_id: router_id,
        local_address: None,
        enabled: true,
        passive: false,
        once: false,
        hold_time: 180,
        dest_port,
        listen_port: None,
        families: vec![Family::new(Afi::Ipv4, Safi::Unicast)],
        route_refresh: true,
        enhanced_route_refresh: false,
        extended_message: false,
        asn4: true,
        multisession: false,
        operational: false,
        aigp: false,
        graceful_restart: None,
        add_path: HashMap::new(),
        md5_password: None,
        ttl_security: None,
        rate_limit: None,
        static_routes: vec![],
        static_flows: vec![],
        api_events: HashSet::new(),
    }
}

async fn tcp_pair() -> (TcpStream, TcpStream, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let connect = TcpStream::connect(("127.0.0.1", port));
    let (outbound, inbound) = tokio::join!(connect, listener.accept());
    (outbound.unwrap(), inbound.unwrap().0, port)
}

struct Pair {
    initiator: Session,
    acceptor: Session,
}

async fn establish() -> Pair {
    let (outbound, inbound, port) = tcp_pair().await;

    // The initiator's configured destination port is the port it dialed,
    // the acceptor sees a random remote port and so waits for the OPEN
    let initiator_config = Arc::new(peer_config(
        "127.0.0.1",
        65001,
        65000,
        Ipv4Addr::new(1, 1, 1, 1),
        port,
    ));
    let acceptor_config = Arc::new(peer_config(
        "127.0.0.1",
        65000,
        65001,
        Ipv4Addr::new(2, 2, 2, 2),
        9999,
    ));

    // Receivers are dropped on purpose; the sessions tolerate a gone
    // event channel
    let (events_a, _) = mpsc::unbounded_channel();
    let (events_b, _) = mpsc::unbounded_channel();
    let mut pair = Pair {
        initiator: Session::new(
            initiator_config,
            Framed::new(outbound, MessageCodec::new()),
            events_a,
        ),
        acceptor: Session::new(
            acceptor_config,
            Framed::new(inbound, MessageCodec::new()),
            events_b,
        ),
    };

    for _ in 0..100 {
        let _ = tokio::time::timeout(Duration::from_millis(150), pair.initiator.run()).await;
        let _ = tokio::time::timeout(Duration::from_millis(150), pair.acceptor.run()).await;
        if pair.initiator.state() == SessionState::Established
            && pair.acceptor.state() == SessionState::Established
        {
            return pair;
        }
    }
    panic!(
        "sessions never established: initiator={} acceptor={}",
        pair.initiator.state(),
        pair.acceptor.state()
    );
}

#[tokio::test]
async fn sessions_reach_established_within_the_handshake() {
    let pair = establish().await;
    let negotiated = pair.initiator.negotiated().expect("negotiated parameters");
    assert_eq!(negotiated.peer_asn, 65001);
    assert_eq!(negotiated.hold_time, 180);
    assert!(negotiated
        .families
        .contains(&(Afi::Ipv4, Safi::Unicast)));

    let negotiated = pair.acceptor.negotiated().expect("negotiated parameters");
    assert_eq!(negotiated.peer_asn, 65000);
}

#[tokio::test]
async fn announced_route_reaches_the_peer_followed_by_end_of_rib() {
    let mut pair = establish().await;

    let spec = RouteSpec {
        prefix: "10.0.0.0/24".to_string(),
        next_hop: "192.168.1.1".to_string(),
        med: Some(100),
        ..Default::default()
    };
    let route = spec.parse().unwrap();
    pair.initiator.rib_mut().announce(route).unwrap();

    let mut announced: Vec<String> = vec![];
    let mut saw_end_of_rib = false;
    for _ in 0..100 {
        let _ = tokio::time::timeout(Duration::from_millis(150), pair.initiator.run()).await;
        let learned =
            tokio::time::timeout(Duration::from_millis(150), pair.acceptor.run()).await;
        if let Ok(Ok(Some(SessionUpdate::Learned(_, parsed)))) = learned {
            if parsed.update.eor == Some((Afi::Ipv4, Safi::Unicast)) {
                saw_end_of_rib = true;
            }
            announced.extend(parsed.update.announces.iter().map(|r| r.nlri.to_string()));
        }
        if !announced.is_empty() && saw_end_of_rib {
            break;
        }
    }
    assert_eq!(announced, vec!["10.0.0.0/24".to_string()]);
    assert!(saw_end_of_rib, "initiator never sent its End-of-RIB");
}
