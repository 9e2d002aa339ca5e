use super::*;
use crate::candidate::candidate_multicast::CandidateMulticastConfig;
use crate::stream::ConnectionState;
use shared::error::ErrorKind;

fn loopback_candidate(component: u16, port: u16) -> Result<Candidate> {
    RawUdpStreamTransmitter::host_candidate(component, IpAddr::from([127, 0, 0, 1]), port)
}

fn loopback_config() -> Result<StreamTransmitterConfig> {
    Ok(StreamTransmitterConfig::default()
        .with_preferred_local_candidates(vec![loopback_candidate(1, 0)?, loopback_candidate(2, 0)?]))
}

/// Pins component 1 to a free port so that streams of one pool land on the
/// same block even while other tests hold the default ports.
fn pinned_config() -> Result<StreamTransmitterConfig> {
    let probe = std::net::UdpSocket::bind(("127.0.0.1", 0))?;
    let port = probe.local_addr()?.port();
    drop(probe);
    Ok(StreamTransmitterConfig::default()
        .with_preferred_local_candidates(vec![loopback_candidate(1, port)?, loopback_candidate(2, 0)?]))
}

fn new_stream(pool: &EndpointPool, config: StreamTransmitterConfig) -> Result<RawUdpStreamTransmitter> {
    RawUdpStreamTransmitter::new(pool.clone(), &TransmitterConfig::default(), config)
}

fn drain(stream: &mut dyn StreamTransmitter) -> Vec<StreamTransmitterEvent> {
    std::iter::from_fn(|| stream.poll_event()).collect()
}

fn pair_count(events: &[StreamTransmitterEvent]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, StreamTransmitterEvent::NewActiveCandidatePair(_)))
        .count()
}

#[test]
fn test_preferred_candidate_validation() -> Result<()> {
    let pool = EndpointPool::new(2, None);

    let tcp = CandidateHostConfig {
        base_config: CandidateConfig {
            component: 1,
            address: "127.0.0.1".to_owned(),
            transport_protocol: TransportProtocol::TCP,
            ..Default::default()
        },
    }
    .new_candidate_host()?;
    let err = new_stream(
        &pool,
        StreamTransmitterConfig::default().with_preferred_local_candidates(vec![tcp]),
    );
    assert_eq!(err.map(|_| ()).map_err(|e| e.kind()), Err(ErrorKind::InvalidArguments));

    let err = new_stream(
        &pool,
        StreamTransmitterConfig::default().with_preferred_local_candidates(vec![
            loopback_candidate(2, 0)?,
            loopback_candidate(2, 0)?,
        ]),
    );
    assert_eq!(err.map(|_| ()), Err(Error::ErrDuplicatePreferredCandidate(2)));

    let err = new_stream(
        &pool,
        StreamTransmitterConfig::default()
            .with_preferred_local_candidates(vec![loopback_candidate(3, 0)?]),
    );
    assert_eq!(err.map(|_| ()), Err(Error::ErrInvalidComponent(3)));

    assert!(pool.is_empty()?);
    Ok(())
}

#[test]
fn test_consecutive_ports() -> Result<()> {
    let _ = env_logger::builder().is_test(true).try_init();

    let pool = EndpointPool::new(2, None);
    let stream = new_stream(&pool, loopback_config()?)?;

    let rtp = stream
        .local_addr(1)
        .ok_or_else(|| Error::Other("no rtp endpoint".to_owned()))?;
    let rtcp = stream
        .local_addr(2)
        .ok_or_else(|| Error::Other("no rtcp endpoint".to_owned()))?;
    assert!(rtp.port() >= DEFAULT_PORT);
    assert_eq!(rtcp.port(), rtp.port() + 1);
    assert_eq!(rtp.ip(), IpAddr::from([127, 0, 0, 1]));

    Ok(())
}

#[test]
fn test_streams_share_endpoints() -> Result<()> {
    let pool = EndpointPool::new(2, None);
    let config = pinned_config()?;
    let first = new_stream(&pool, config.clone())?;

    let rtp = first
        .local_addr(1)
        .ok_or_else(|| Error::Other("no rtp endpoint".to_owned()))?;
    let rtcp = first
        .local_addr(2)
        .ok_or_else(|| Error::Other("no rtcp endpoint".to_owned()))?;

    // a second stream of the session shares the sockets
    let second = new_stream(&pool, config)?;
    assert_eq!(second.local_addr(1), Some(rtp));
    assert_eq!(second.local_addr(2), Some(rtcp));
    assert_eq!(pool.len()?, 2);

    drop(first);
    assert_eq!(pool.len()?, 2);
    drop(second);
    assert!(pool.is_empty()?);

    Ok(())
}

#[test]
fn test_muted_stream_on_shared_socket() -> Result<()> {
    let pool = EndpointPool::new(2, None);
    let config = pinned_config()?;
    let peer_a = std::net::UdpSocket::bind(("127.0.0.1", 0))?;
    let peer_b = std::net::UdpSocket::bind(("127.0.0.1", 0))?;

    let mut a = new_stream(&pool, config.clone())?;
    let mut b = new_stream(&pool, config)?;
    let rtp = a
        .local_addr(1)
        .ok_or_else(|| Error::Other("no rtp endpoint".to_owned()))?;
    assert_eq!(b.local_addr(1), Some(rtp));

    for (stream, peer) in [(&mut a, &peer_a), (&mut b, &peer_b)] {
        stream.gather_local_candidates()?;
        stream.force_remote_candidates(&[loopback_candidate(1, peer.local_addr()?.port())?])?;
        drain(stream);
    }
    a.set_receiving(false)?;
    assert!(b.receiving());

    peer_a.send_to(b"to a", rtp)?;
    peer_b.send_to(b"to b", rtp)?;

    let mut received = Vec::new();
    for _ in 0..50 {
        match pool.recv(1)? {
            Some(msg) => received.push((msg.transport.peer_addr, msg.message.to_vec())),
            None if !received.is_empty() => break,
            None => std::thread::sleep(std::time::Duration::from_millis(10)),
        }
    }
    std::thread::sleep(std::time::Duration::from_millis(20));
    while let Some(msg) = pool.recv(1)? {
        received.push((msg.transport.peer_addr, msg.message.to_vec()));
    }
    assert_eq!(received, vec![(peer_b.local_addr()?, b"to b".to_vec())]);

    Ok(())
}

#[test]
fn test_preferred_port_is_kept() -> Result<()> {
    let pool = EndpointPool::new(2, None);
    let probe = std::net::UdpSocket::bind(("127.0.0.1", 0))?;
    let free = probe.local_addr()?.port();
    drop(probe);

    let stream = new_stream(
        &pool,
        StreamTransmitterConfig::default().with_preferred_local_candidates(vec![
            loopback_candidate(1, 0)?,
            loopback_candidate(2, free)?,
        ]),
    )?;
    assert_eq!(stream.local_addr(2).map(|a| a.port()), Some(free));

    Ok(())
}

#[test]
fn test_first_sender_requests_key_frame() -> Result<()> {
    let pool = EndpointPool::new(2, None);
    let config = pinned_config()?;

    let mut first = new_stream(&pool, config.clone())?;
    assert_eq!(
        drain(&mut first),
        vec![
            StreamTransmitterEvent::KeyFrameRequested(1),
            StreamTransmitterEvent::KeyFrameRequested(2),
        ]
    );

    let mut second = new_stream(&pool, config)?;
    assert!(drain(&mut second).is_empty());

    first.set_sending(false)?;
    second.set_sending(false)?;
    assert!(!second.sending());
    second.set_sending(true)?;
    assert_eq!(
        drain(&mut second),
        vec![
            StreamTransmitterEvent::KeyFrameRequested(1),
            StreamTransmitterEvent::KeyFrameRequested(2),
        ]
    );
    assert!(drain(&mut first).is_empty());

    Ok(())
}

#[test]
fn test_gather_preferred_address() -> Result<()> {
    let pool = EndpointPool::new(2, None);
    let mut stream = new_stream(&pool, loopback_config()?.with_sending(false))?;

    stream.gather_local_candidates()?;
    let events = drain(&mut stream);

    let local = stream.local_candidates(1).to_vec();
    assert_eq!(local.len(), 1);
    assert_eq!(local[0].candidate_type(), CandidateType::Host);
    assert_eq!(local[0].address(), "127.0.0.1");
    assert_eq!(Some(local[0].port()), stream.local_addr(1).map(|a| a.port()));

    assert_eq!(events.first(), Some(&StreamTransmitterEvent::StateChanged(1, ConnectionState::Gathering)));
    assert_eq!(events.last(), Some(&StreamTransmitterEvent::LocalCandidatesPrepared));
    assert!(events.contains(&StreamTransmitterEvent::NewLocalCandidate(local[0].clone())));
    assert_eq!(stream.component_state(2), Some(ComponentState::Prepared));
    assert_eq!(stream.poll_timeout(), None);

    assert_eq!(stream.gather_local_candidates(), Err(Error::ErrAlreadyGathering));
    Ok(())
}

#[test]
fn test_gather_interface_addresses() -> Result<()> {
    let pool = EndpointPool::new(1, None);
    let mut stream = RawUdpStreamTransmitter::new(
        pool,
        &TransmitterConfig::default().with_components(1),
        StreamTransmitterConfig::default().with_sending(false),
    )?;

    stream.gather_local_candidates()?;
    let port = stream.local_addr(1).map(|a| a.port());
    let local = stream.local_candidates(1);
    assert!(!local.is_empty());
    for candidate in local {
        assert_eq!(candidate.candidate_type(), CandidateType::Host);
        assert_eq!(Some(candidate.port()), port);
        candidate.ip()?;
    }

    Ok(())
}

#[test]
fn test_discovery_completion_and_timeout() -> Result<()> {
    let _ = env_logger::builder().is_test(true).try_init();

    let pool = EndpointPool::new(2, None);
    let mut stream = new_stream(
        &pool,
        StreamTransmitterConfig::default()
            .with_sending(false)
            .with_discovery_ip(IpAddr::from([198, 51, 100, 1]))
            .with_discovery_timeout(Duration::from_secs(5)),
    )?;

    stream.gather_local_candidates()?;
    let requests: Vec<_> = drain(&mut stream)
        .into_iter()
        .filter_map(|event| match event {
            StreamTransmitterEvent::DiscoveryRequested(request) => Some(request),
            _ => None,
        })
        .collect();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].component_id, 1);
    assert_eq!(requests[0].server, SocketAddr::from(([198, 51, 100, 1], 3478)));
    assert_eq!(Some(requests[0].local_addr), stream.local_addr(1));
    assert_eq!(stream.component_state(1), Some(ComponentState::Gathering));
    assert_eq!(stream.poll_timeout(), Some(requests[0].deadline));

    // a failed answer is reported and the discovery keeps waiting
    stream.complete_discovery(
        requests[0].id,
        Err(Error::ErrDiscoveryFailed("no answer".to_owned())),
    )?;
    let events = drain(&mut stream);
    assert!(matches!(
        events.as_slice(),
        [StreamTransmitterEvent::Error(ErrorKind::Network, _)]
    ));
    assert_eq!(stream.poll_timeout(), Some(requests[0].deadline));

    let mapped = SocketAddr::from(([203, 0, 113, 5], 40000));
    stream.complete_discovery(requests[0].id, Ok(mapped))?;
    let srflx = stream.local_candidates(1).to_vec();
    assert_eq!(srflx.len(), 1);
    assert_eq!(srflx[0].candidate_type(), CandidateType::ServerReflexive);
    assert_eq!(srflx[0].addr()?, mapped);
    assert_eq!(srflx[0].base_port(), stream.local_addr(1).map(|a| a.port()));
    assert_eq!(stream.component_state(1), Some(ComponentState::Prepared));
    assert_eq!(
        drain(&mut stream),
        vec![StreamTransmitterEvent::NewLocalCandidate(srflx[0].clone())]
    );

    // component 2 never gets an answer
    stream.handle_timeout(requests[1].deadline)?;
    let events = drain(&mut stream);
    assert!(matches!(
        events.first(),
        Some(StreamTransmitterEvent::Error(ErrorKind::Network, _))
    ));
    assert_eq!(events.last(), Some(&StreamTransmitterEvent::LocalCandidatesPrepared));
    assert!(
        stream
            .local_candidates(2)
            .iter()
            .all(|c| c.candidate_type() == CandidateType::Host)
    );
    assert_eq!(stream.poll_timeout(), None);

    // late answers are dropped
    stream.complete_discovery(requests[1].id, Ok(mapped))?;
    assert!(drain(&mut stream).is_empty());

    Ok(())
}

#[test]
fn test_remote_candidates() -> Result<()> {
    let pool = EndpointPool::new(2, None);
    let mut stream = new_stream(&pool, loopback_config()?.with_sending(false))?;
    stream.gather_local_candidates()?;
    drain(&mut stream);

    let multicast = CandidateMulticastConfig {
        base_config: CandidateConfig {
            component: 1,
            address: "239.255.0.1".to_owned(),
            port: 5004,
            ..Default::default()
        },
        ttl: 1,
    }
    .new_candidate_multicast()?;
    assert_eq!(
        stream.add_remote_candidates(&[multicast]).map_err(|e| e.kind()),
        Err(ErrorKind::InvalidArguments)
    );

    let remote = loopback_candidate(1, 9000)?;
    stream.add_remote_candidates(&[remote.clone()])?;
    let events = drain(&mut stream);
    assert_eq!(pair_count(&events), 1);
    assert_eq!(
        stream.active_pair(1).map(|pair| &pair.remote),
        Some(&remote)
    );
    assert_eq!(stream.component_state(1), Some(ComponentState::Active));

    // fully equal re-set
    stream.add_remote_candidates(&[remote.clone()])?;
    assert!(drain(&mut stream).is_empty());

    // same path, other description
    let renamed = CandidateHostConfig {
        base_config: CandidateConfig {
            foundation: "renamed".to_owned(),
            component: 1,
            address: "127.0.0.1".to_owned(),
            port: 9000,
            ..Default::default()
        },
    }
    .new_candidate_host()?;
    stream.add_remote_candidates(&[renamed])?;
    assert_eq!(pair_count(&drain(&mut stream)), 0);

    // a new path replaces the previous one
    let moved = loopback_candidate(1, 9002)?;
    stream.add_remote_candidates(&[moved.clone()])?;
    assert_eq!(pair_count(&drain(&mut stream)), 1);
    assert_eq!(stream.active_pair(1).map(|pair| &pair.remote), Some(&moved));

    assert_eq!(
        stream.force_remote_candidates(&[moved]),
        Err(Error::ErrRemoteCandidatesAdded)
    );
    Ok(())
}

#[test]
fn test_remote_port_zero_is_rejected() -> Result<()> {
    let pool = EndpointPool::new(2, None);
    let mut stream = new_stream(&pool, loopback_config()?.with_sending(false))?;
    stream.gather_local_candidates()?;
    drain(&mut stream);

    let no_port = loopback_candidate(1, 0)?;
    assert_eq!(
        stream.add_remote_candidates(&[no_port.clone()]).map_err(|e| e.kind()),
        Err(ErrorKind::InvalidArguments)
    );
    assert_eq!(
        stream.force_remote_candidates(&[no_port]).map_err(|e| e.kind()),
        Err(ErrorKind::InvalidArguments)
    );
    assert_eq!(pair_count(&drain(&mut stream)), 0);
    assert!(stream.active_pair(1).is_none());
    Ok(())
}

#[test]
fn test_remote_before_gathering() -> Result<()> {
    let pool = EndpointPool::new(2, None);
    let mut stream = new_stream(&pool, loopback_config()?.with_sending(false))?;

    stream.add_remote_candidates(&[loopback_candidate(2, 9001)?])?;
    assert!(stream.active_pair(2).is_none());

    stream.gather_local_candidates()?;
    assert_eq!(pair_count(&drain(&mut stream)), 1);
    assert!(stream.active_pair(2).is_some());
    assert!(stream.active_pair(1).is_none());
    Ok(())
}

#[test]
fn test_forced_candidate_exclusivity() -> Result<()> {
    let pool = EndpointPool::new(2, None);
    let mut stream = new_stream(&pool, loopback_config()?.with_sending(false))?;
    stream.gather_local_candidates()?;

    let forced = loopback_candidate(1, 9004)?;
    stream.force_remote_candidates(&[forced.clone()])?;
    stream.force_remote_candidates(&[forced.clone()])?;
    assert_eq!(pair_count(&drain(&mut stream)), 1);

    assert_eq!(
        stream.force_remote_candidates(&[loopback_candidate(1, 9006)?]),
        Err(Error::ErrAlreadyForced(1))
    );
    assert_eq!(
        stream.force_remote_candidates(&[loopback_candidate(2, 9006)?, loopback_candidate(2, 9008)?]),
        Err(Error::ErrAlreadyForced(2))
    );
    assert!(stream.active_pair(2).is_none());
    Ok(())
}

#[test]
fn test_stop_inside_pair_notification() -> Result<()> {
    let pool = EndpointPool::new(2, None);
    let mut stream = new_stream(&pool, loopback_config()?)?;
    stream.gather_local_candidates()?;
    stream.add_remote_candidates(&[loopback_candidate(1, 9010)?, loopback_candidate(2, 9011)?])?;

    let mut stopped_at = None;
    while let Some(event) = stream.poll_event() {
        if let StreamTransmitterEvent::NewActiveCandidatePair(pair) = event {
            stream.stop()?;
            stopped_at = Some(pair.component());
        }
    }
    assert_eq!(stopped_at, Some(1));
    assert!(stream.is_stopped());
    assert_eq!(stream.component_state(1), Some(ComponentState::Stopped));
    assert_eq!(stream.component_state(2), Some(ComponentState::Stopped));
    assert!(pool.is_empty()?);

    assert_eq!(stream.stop(), Err(Error::ErrDisposed));
    assert_eq!(stream.gather_local_candidates(), Err(Error::ErrDisposed));
    assert_eq!(stream.set_receiving(false), Err(Error::ErrDisposed));
    assert_eq!(stream.handle_timeout(Instant::now()), Err(Error::ErrDisposed));
    assert_eq!(stream.complete_discovery(1, Ok(SocketAddr::from(([127, 0, 0, 1], 1)))), Ok(()));
    Ok(())
}
