use super::*;
use crate::stream::ConnectionState;
use shared::error::ErrorKind;
use std::thread;
use std::time::Duration;

fn temp_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("rtc-shm-test-{}-{name}", std::process::id()))
}

fn path_candidate(component: u16, path: &Path) -> Result<Candidate> {
    CandidateHostConfig {
        base_config: CandidateConfig {
            component,
            address: path.display().to_string(),
            ..Default::default()
        },
    }
    .new_candidate_host()
}

fn new_stream(
    transmitter: &ShmTransmitter,
    config: StreamTransmitterConfig,
) -> Result<ShmStreamTransmitter> {
    ShmStreamTransmitter::new(&transmitter.hub, &transmitter.config, config)
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

fn recv_with_retry(transmitter: &ShmTransmitter, component_id: u16) -> Result<Option<Vec<u8>>> {
    for _ in 0..50 {
        if let Some(datagram) = transmitter.recv(component_id)? {
            return Ok(Some(datagram.message.to_vec()));
        }
        thread::sleep(Duration::from_millis(10));
    }
    Ok(None)
}

#[test]
fn test_gather_reports_socket_paths() -> Result<()> {
    let transmitter = ShmTransmitter::new(TransmitterConfig::default())?;
    let mut stream = new_stream(&transmitter, StreamTransmitterConfig::default())?;
    assert_eq!(transmitter.link_count()?, 2);
    assert_eq!(
        drain(&mut stream),
        vec![
            StreamTransmitterEvent::KeyFrameRequested(1),
            StreamTransmitterEvent::KeyFrameRequested(2),
        ]
    );

    stream.gather_local_candidates()?;
    let events = drain(&mut stream);
    assert_eq!(events.last(), Some(&StreamTransmitterEvent::LocalCandidatesPrepared));

    let rtp_path = stream
        .local_path(1)
        .map(Path::to_path_buf)
        .ok_or_else(|| Error::Other("no rtp socket".to_owned()))?;
    assert!(rtp_path.exists());
    assert_ne!(stream.local_path(2), Some(rtp_path.as_path()));

    let local = stream.local_candidates(1);
    assert_eq!(local.len(), 1);
    assert_eq!(local[0].candidate_type(), CandidateType::Host);
    assert_eq!(local[0].address(), rtp_path.display().to_string());
    assert_eq!(local[0].port(), 0);
    assert_eq!(stream.component_state(1), Some(ComponentState::Prepared));

    drop(stream);
    assert_eq!(transmitter.link_count()?, 0);
    assert!(!rtp_path.exists());

    Ok(())
}

#[test]
fn test_preferred_local_candidates() -> Result<()> {
    let transmitter = ShmTransmitter::new(TransmitterConfig::default())?;
    let preferred = temp_path("preferred");

    let stream = new_stream(
        &transmitter,
        StreamTransmitterConfig::default()
            .with_preferred_local_candidates(vec![path_candidate(1, &preferred)?]),
    )?;
    assert_eq!(stream.local_path(1), Some(preferred.as_path()));
    assert!(stream.local_path(2).is_some());

    // the path is taken while the first stream lives
    let taken = new_stream(
        &transmitter,
        StreamTransmitterConfig::default()
            .with_preferred_local_candidates(vec![path_candidate(1, &preferred)?]),
    );
    assert_eq!(
        taken.map(|_| ()).map_err(|e| e.kind()),
        Err(ErrorKind::Construction)
    );
    drop(stream);
    assert_eq!(transmitter.link_count()?, 0);

    let duplicate = new_stream(
        &transmitter,
        StreamTransmitterConfig::default().with_preferred_local_candidates(vec![
            path_candidate(2, &temp_path("first"))?,
            path_candidate(2, &temp_path("second"))?,
        ]),
    );
    assert_eq!(
        duplicate.map(|_| ()),
        Err(Error::ErrDuplicatePreferredCandidate(2))
    );

    let out_of_range = new_stream(
        &transmitter,
        StreamTransmitterConfig::default()
            .with_preferred_local_candidates(vec![path_candidate(3, &temp_path("third"))?]),
    );
    assert_eq!(out_of_range.map(|_| ()), Err(Error::ErrInvalidComponent(3)));
    assert_eq!(transmitter.link_count()?, 0);

    Ok(())
}

#[test]
fn test_pairing_follows_remote_path() -> Result<()> {
    let transmitter = ShmTransmitter::new(TransmitterConfig::default())?;
    let mut stream = new_stream(
        &transmitter,
        StreamTransmitterConfig::default().with_sending(false),
    )?;

    // a remote given before gathering pairs once the component is prepared
    let rtcp = path_candidate(2, &temp_path("remote-rtcp"))?;
    stream.add_remote_candidates(&[rtcp.clone()])?;
    assert!(stream.active_pair(2).is_none());

    stream.gather_local_candidates()?;
    assert_eq!(pair_count(&drain(&mut stream)), 1);
    assert_eq!(stream.active_pair(2).map(|pair| &pair.remote), Some(&rtcp));
    assert_eq!(stream.remote_path(2), Some(temp_path("remote-rtcp").as_path()));

    let rtp = path_candidate(1, &temp_path("remote-rtp"))?;
    stream.add_remote_candidates(&[rtp.clone()])?;
    let events = drain(&mut stream);
    assert_eq!(pair_count(&events), 1);
    assert!(events.contains(&StreamTransmitterEvent::StateChanged(1, ConnectionState::Ready)));
    assert!(events.contains(&StreamTransmitterEvent::StateChanged(2, ConnectionState::Ready)));

    // fully equal re-set
    stream.add_remote_candidates(&[rtp.clone()])?;
    assert!(drain(&mut stream).is_empty());

    // a new path replaces the previous one
    let moved = path_candidate(1, &temp_path("remote-moved"))?;
    stream.add_remote_candidates(&[moved.clone()])?;
    assert_eq!(pair_count(&drain(&mut stream)), 1);
    assert_eq!(stream.active_pair(1).map(|pair| &pair.remote), Some(&moved));

    assert_eq!(
        stream.force_remote_candidates(&[moved]),
        Err(Error::ErrRemoteCandidatesAdded)
    );
    assert_eq!(
        stream.add_remote_candidates(&[path_candidate(3, &temp_path("remote-3"))?]),
        Err(Error::ErrInvalidComponent(3))
    );

    Ok(())
}

#[test]
fn test_sessions_exchange_datagrams() -> Result<()> {
    let offer_transmitter = ShmTransmitter::new(TransmitterConfig::default().with_components(1))?;
    let answer_transmitter = ShmTransmitter::new(TransmitterConfig::default().with_components(1))?;
    let mut offer = new_stream(&offer_transmitter, StreamTransmitterConfig::default())?;
    let mut answer = new_stream(&answer_transmitter, StreamTransmitterConfig::default())?;

    offer.gather_local_candidates()?;
    answer.gather_local_candidates()?;
    let offer_candidates = offer.local_candidates(1).to_vec();
    let answer_candidates = answer.local_candidates(1).to_vec();
    offer.force_remote_candidates(&answer_candidates)?;
    answer.add_remote_candidates(&offer_candidates)?;
    drain(&mut offer);
    drain(&mut answer);

    assert_eq!(offer_transmitter.send(1, b"rtp")?, 1);
    assert_eq!(
        recv_with_retry(&answer_transmitter, 1)?,
        Some(b"rtp".to_vec())
    );
    assert_eq!(answer_transmitter.send(1, b"back")?, 1);
    assert_eq!(recv_with_retry(&offer_transmitter, 1)?, Some(b"back".to_vec()));

    // a stream that doesn't receive drops what reaches it
    answer.set_receiving(false)?;
    assert_eq!(offer_transmitter.send(1, b"dropped")?, 1);
    thread::sleep(Duration::from_millis(20));
    assert!(answer_transmitter.recv(1)?.is_none());

    // nothing leaves a stream that doesn't send, a key frame is asked on resume
    offer.set_sending(false)?;
    assert_eq!(offer_transmitter.send(1, b"muted")?, 0);
    offer.set_sending(true)?;
    assert_eq!(
        drain(&mut offer),
        vec![StreamTransmitterEvent::KeyFrameRequested(1)]
    );

    Ok(())
}

#[test]
fn test_stop_removes_sockets() -> Result<()> {
    let mut transmitter = ShmTransmitter::new(TransmitterConfig::default())?;
    let mut stream = transmitter.new_stream_transmitter(StreamTransmitterConfig::default())?;
    stream.gather_local_candidates()?;
    let paths: Vec<String> = (1..=2)
        .flat_map(|c| stream.local_candidates(c).to_vec())
        .map(|c| c.address().to_owned())
        .collect();
    assert_eq!(paths.len(), 2);

    stream.force_remote_candidates(&[
        path_candidate(1, &temp_path("stop-rtp"))?,
        path_candidate(2, &temp_path("stop-rtcp"))?,
    ])?;
    let mut seen = 0;
    while let Some(event) = stream.poll_event() {
        if let StreamTransmitterEvent::NewActiveCandidatePair(_) = event {
            seen += 1;
            stream.stop()?;
        }
    }
    assert_eq!(seen, 1);
    assert!(stream.is_stopped());
    assert_eq!(transmitter.link_count()?, 0);
    for path in &paths {
        assert!(!Path::new(path).exists());
    }

    assert_eq!(stream.stop(), Err(Error::ErrDisposed));
    assert_eq!(stream.set_sending(false), Err(Error::ErrDisposed));
    Ok(())
}
