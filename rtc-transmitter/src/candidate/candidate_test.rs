use super::candidate_host::CandidateHostConfig;
use super::candidate_multicast::CandidateMulticastConfig;
use super::candidate_pair::CandidatePair;
use super::candidate_related::CandidateRelatedConfig;
use super::*;

fn host_candidate(address: &str, port: u16) -> Result<Candidate> {
    CandidateHostConfig {
        base_config: CandidateConfig {
            address: address.to_owned(),
            port,
            component: COMPONENT_RTP,
            ..Default::default()
        },
    }
    .new_candidate_host()
}

fn srflx_candidate() -> Result<Candidate> {
    CandidateRelatedConfig {
        base_config: CandidateConfig {
            foundation: "4207374052".to_owned(),
            address: "203.0.113.7".to_owned(),
            port: 40000,
            component: COMPONENT_RTCP,
            priority: 1694498815,
            username: Some("ufrag1".to_owned()),
            password: Some("pwd1pwd1pwd1".to_owned()),
            ..Default::default()
        },
        rel_addr: "192.168.1.4".to_owned(),
        rel_port: 0,
    }
    .new_candidate_server_reflexive()
}

fn multicast_candidate(ttl: u8) -> Result<Candidate> {
    CandidateMulticastConfig {
        base_config: CandidateConfig {
            address: "224.1.2.3".to_owned(),
            port: 5004,
            component: COMPONENT_RTP,
            ..Default::default()
        },
        ttl,
    }
    .new_candidate_multicast()
}

#[test]
fn test_candidate_type_preference() {
    assert_eq!(CandidateType::Host.preference(), 126);
    assert_eq!(CandidateType::PeerReflexive.preference(), 110);
    assert_eq!(CandidateType::ServerReflexive.preference(), 100);
    assert_eq!(CandidateType::Relay.preference(), 0);
    assert_eq!(CandidateType::Multicast.preference(), 0);
}

#[test]
fn test_candidate_type_string() -> Result<()> {
    for candidate_type in [
        CandidateType::Host,
        CandidateType::ServerReflexive,
        CandidateType::PeerReflexive,
        CandidateType::Relay,
        CandidateType::Multicast,
    ] {
        assert_eq!(candidate_type.to_string().parse::<CandidateType>()?, candidate_type);
    }

    assert_eq!(
        "nat".parse::<CandidateType>(),
        Err(Error::ErrUnknownCandidateType("nat".to_owned()))
    );
    Ok(())
}

#[test]
fn test_host_candidate_defaults() -> Result<()> {
    let c = host_candidate("192.168.1.4", 7078)?;

    assert_eq!(c.candidate_type(), CandidateType::Host);
    assert_eq!(c.transport_protocol(), TransportProtocol::UDP);
    assert!(!c.foundation().is_empty());
    assert_eq!(c.priority(), 2130706431);
    assert_eq!(c.base_address(), None);
    assert_eq!(c.ttl(), None);
    assert_eq!(c.addr()?, "192.168.1.4:7078".parse::<SocketAddr>()?);

    // foundation only depends on type, address and protocol
    let other = host_candidate("192.168.1.4", 9000)?;
    assert_eq!(c.foundation(), other.foundation());
    let elsewhere = host_candidate("192.168.1.5", 7078)?;
    assert_ne!(c.foundation(), elsewhere.foundation());

    Ok(())
}

#[test]
fn test_candidate_validation() {
    let no_component = CandidateHostConfig {
        base_config: CandidateConfig {
            address: "10.0.0.1".to_owned(),
            ..Default::default()
        },
    }
    .new_candidate_host();
    assert_eq!(no_component, Err(Error::ErrInvalidComponent(0)));

    let no_address = CandidateHostConfig {
        base_config: CandidateConfig {
            component: COMPONENT_RTP,
            ..Default::default()
        },
    }
    .new_candidate_host();
    assert!(matches!(no_address, Err(Error::ErrInvalidCandidate(_))));

    let too_high = CandidateHostConfig {
        base_config: CandidateConfig {
            address: "10.0.0.1".to_owned(),
            component: COMPONENT_RTP,
            priority: MAX_PRIORITY + 1,
            ..Default::default()
        },
    }
    .new_candidate_host();
    assert!(matches!(too_high, Err(Error::ErrInvalidCandidate(_))));

    assert_eq!(multicast_candidate(0), Err(Error::ErrInvalidTtl));

    let spaced_password = CandidateHostConfig {
        base_config: CandidateConfig {
            address: "10.0.0.1".to_owned(),
            component: COMPONENT_RTP,
            password: Some("two words".to_owned()),
            ..Default::default()
        },
    }
    .new_candidate_host();
    assert!(matches!(spaced_password, Err(Error::ErrInvalidCandidate(_))));
}

#[test]
fn test_base_address_rules() -> Result<()> {
    let mut host = host_candidate("10.0.0.1", 5000)?;
    host.base_address = Some("10.0.0.2".to_owned());
    host.base_port = Some(5000);
    assert!(matches!(host.validate(), Err(Error::ErrInvalidCandidate(_))));

    let mut srflx = srflx_candidate()?;
    srflx.base_port = None;
    assert_eq!(srflx.validate(), Err(Error::ErrParseRelatedAddr));
    srflx.base_address = None;
    assert!(matches!(srflx.validate(), Err(Error::ErrInvalidCandidate(_))));

    let mut host_with_ttl = host_candidate("10.0.0.1", 5000)?;
    host_with_ttl.ttl = Some(4);
    assert!(matches!(
        host_with_ttl.validate(),
        Err(Error::ErrInvalidCandidate(_))
    ));

    Ok(())
}

#[test]
fn test_are_equal_vs_full_equality() -> Result<()> {
    let a = host_candidate("fe80::1", 5000)?;
    let b = host_candidate("FE80::1", 5000)?;

    assert!(a.are_equal(&b));
    assert_ne!(a, b);

    let c = host_candidate("fe80::1", 5002)?;
    assert!(!a.are_equal(&c));

    let d = a.clone();
    assert!(a.are_equal(&d));
    assert_eq!(a, d);

    Ok(())
}

#[test]
fn test_candidate_marshal() -> Result<()> {
    let c = srflx_candidate()?;
    assert_eq!(
        c.marshal(),
        "4207374052 2 udp 1694498815 203.0.113.7 40000 typ srflx raddr 192.168.1.4 rport 0 ufrag ufrag1 pwd pwd1pwd1pwd1"
    );

    let m = multicast_candidate(3)?;
    assert!(m.marshal().ends_with("224.1.2.3 5004 typ multicast ttl 3"));

    Ok(())
}

#[test]
fn test_unmarshal_candidate_errors() {
    assert_eq!(
        unmarshal_candidate("1 1 udp 2130706431 10.0.0.1 5000 typ"),
        Err(Error::ErrAttributeTooShortCandidate(7))
    );
    assert!(matches!(
        unmarshal_candidate("1 1 udp 2130706431 10.0.0.1 5000 type host"),
        Err(Error::ErrInvalidCandidate(_))
    ));
    assert_eq!(
        unmarshal_candidate("1 1 sctp 2130706431 10.0.0.1 5000 typ host"),
        Err(Error::ErrUnknownTransportProtocol("sctp".to_owned()))
    );
    assert!(matches!(
        unmarshal_candidate("1 1 udp 2130706431 10.0.0.1 99999 typ host"),
        Err(Error::ParseInt(_))
    ));
    assert!(matches!(
        unmarshal_candidate("1 1 udp 2130706431 10.0.0.1 5000 typ host ufrag"),
        Err(Error::ErrInvalidCandidate(_))
    ));
    assert_eq!(
        unmarshal_candidate("1 1 udp 2130706431 10.0.0.1 5000 typ host generation 0"),
        Err(Error::ErrUnknownCandidateAttribute("generation".to_owned()))
    );
    assert_eq!(
        unmarshal_candidate("1 1 udp 2130706431 10.0.0.1 5000 typ srflx raddr 10.0.0.2"),
        Err(Error::ErrParseRelatedAddr)
    );
}

#[test]
fn test_candidate_list_round_trip() -> Result<()> {
    assert_eq!(marshal_candidates(&[]), "");
    assert!(unmarshal_candidates("")?.is_empty());

    let candidates = vec![
        host_candidate("192.168.1.4", 7078)?,
        srflx_candidate()?,
        multicast_candidate(5)?,
        CandidateRelatedConfig {
            base_config: CandidateConfig {
                address: "198.51.100.1".to_owned(),
                port: 3478,
                component: COMPONENT_RTP,
                transport_protocol: TransportProtocol::TCP,
                ..Default::default()
            },
            rel_addr: "10.0.0.9".to_owned(),
            rel_port: 61000,
        }
        .new_candidate_relay()?,
    ];

    let raw = marshal_candidates(&candidates);
    assert_eq!(raw.lines().count(), candidates.len());

    let decoded = unmarshal_candidates(&raw)?;
    assert_eq!(decoded, candidates);
    assert_eq!(decoded[0].username(), None);
    assert_eq!(decoded[1].base_port(), Some(0));
    assert_eq!(decoded[2].ttl(), Some(5));

    Ok(())
}

#[test]
fn test_candidate_json_round_trip() -> Result<()> {
    let candidates = vec![host_candidate("192.168.1.4", 7078)?, srflx_candidate()?];

    let json = serde_json::to_string(&candidates).map_err(|e| Error::Other(e.to_string()))?;
    assert!(json.contains("\"type\":\"srflx\""));
    assert!(json.contains("\"protocol\":\"udp\""));
    assert!(!json.contains("\"ttl\""));

    let decoded: Vec<Candidate> =
        serde_json::from_str(&json).map_err(|e| Error::Other(e.to_string()))?;
    assert_eq!(decoded, candidates);
    for c in &decoded {
        c.validate()?;
    }

    Ok(())
}

#[test]
fn test_find_candidate_by_foundation() -> Result<()> {
    let mut named = host_candidate("10.0.0.1", 5000)?;
    named.foundation = "Alpha".to_owned();
    let candidates = vec![host_candidate("10.0.0.2", 5000)?, named.clone()];

    assert_eq!(find_candidate_by_foundation(&candidates, "alpha"), Some(&named));
    assert_eq!(find_candidate_by_foundation(&candidates, "beta"), None);

    Ok(())
}

#[test]
fn test_candidate_pair() -> Result<()> {
    let local = host_candidate("10.0.0.1", 5000)?;
    let remote = host_candidate("10.0.0.2", 6000)?;
    let pair = CandidatePair::new(local, remote);

    assert_eq!(pair.component(), COMPONENT_RTP);
    assert_eq!(
        pair.to_string(),
        "(udp host 10.0.0.1:5000) <-> (udp host 10.0.0.2:6000)"
    );
    Ok(())
}
