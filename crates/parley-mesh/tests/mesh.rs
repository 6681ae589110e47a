//! Coordinator scenarios driven over in-process channels with scripted
//! media links. The signaling relay is simulated by the test shuttling
//! envelopes between channel halves.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;

use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use parley_mesh::link::mock::{MockCall, MockLinkFactory, MockLinkHandle};
use parley_mesh::link::{LinkEvent, LinkState};
use parley_mesh::signaling::SignalingConnection;
use parley_mesh::{
    DepartReason, LocalTrack, MeshCoordinator, MeshError, MeshEvent, MeshHandle,
};
use parley_proto::{CandidateInit, Envelope, SessionDescription};

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

struct TestMesh {
    to_coordinator: mpsc::UnboundedSender<Envelope>,
    from_coordinator: mpsc::UnboundedReceiver<Envelope>,
    factory: Arc<MockLinkFactory>,
    handle: MeshHandle,
    events: mpsc::UnboundedReceiver<MeshEvent>,
    task: tokio::task::JoinHandle<Result<(), MeshError>>,
}

async fn start(session_id: &str) -> TestMesh {
    start_with_tracks(session_id, Vec::new()).await
}

async fn start_with_tracks(session_id: &str, tracks: Vec<LocalTrack>) -> TestMesh {
    let (to_tx, to_rx) = mpsc::unbounded_channel();
    let (from_tx, mut from_rx) = mpsc::unbounded_channel();
    let signaling = SignalingConnection::from_channels(from_tx, to_rx);
    let factory = Arc::new(MockLinkFactory::new());
    let (coordinator, handle, events) =
        MeshCoordinator::new(session_id, signaling, factory.clone(), tracks);
    let task = tokio::spawn(coordinator.run());

    // the coordinator announces itself before anything else
    let join = recv_envelope(&mut from_rx).await;
    assert_eq!(
        join,
        Envelope::Join {
            sender_id: session_id.to_string()
        }
    );

    TestMesh {
        to_coordinator: to_tx,
        from_coordinator: from_rx,
        factory,
        handle,
        events,
        task,
    }
}

async fn recv_envelope(rx: &mut mpsc::UnboundedReceiver<Envelope>) -> Envelope {
    timeout(RECV_TIMEOUT, rx.recv())
        .await
        .expect("timed out waiting for an envelope")
        .expect("envelope channel closed")
}

async fn recv_event(rx: &mut mpsc::UnboundedReceiver<MeshEvent>) -> MeshEvent {
    timeout(RECV_TIMEOUT, rx.recv())
        .await
        .expect("timed out waiting for a mesh event")
        .expect("event channel closed")
}

async fn expect_envelope_silence(rx: &mut mpsc::UnboundedReceiver<Envelope>) {
    let quiet = timeout(Duration::from_millis(200), rx.recv()).await;
    assert!(quiet.is_err(), "expected no envelope, got {quiet:?}");
}

/// Waits for the coordinator task to open its `index`-th link.
async fn link(factory: &MockLinkFactory, index: usize) -> MockLinkHandle {
    timeout(RECV_TIMEOUT, async {
        loop {
            if let Some(handle) = factory.opened().get(index) {
                return handle.clone();
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("link was never opened")
}

async fn wait_for_calls(handle: &MockLinkHandle, expected: &[MockCall]) {
    let deadline = tokio::time::Instant::now() + RECV_TIMEOUT;
    loop {
        let calls = handle.link.calls();
        if calls == expected {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            assert_eq!(calls, expected, "link calls never settled");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn offer_payload(sdp: &str) -> serde_json::Value {
    serde_json::to_value(SessionDescription::offer(sdp)).unwrap()
}

fn answer_payload(sdp: &str) -> serde_json::Value {
    serde_json::to_value(SessionDescription::answer(sdp)).unwrap()
}

fn candidate_payload(candidate: &str) -> serde_json::Value {
    serde_json::to_value(CandidateInit {
        candidate: candidate.to_string(),
        ..Default::default()
    })
    .unwrap()
}

fn local_track(id: &str) -> LocalTrack {
    Arc::new(TrackLocalStaticSample::new(
        RTCRtpCodecCapability {
            mime_type: "audio/opus".to_string(),
            clock_rate: 48000,
            channels: 2,
            sdp_fmtp_line: String::new(),
            rtcp_feedback: vec![],
        },
        id.to_string(),
        "local-stream".to_string(),
    ))
}

#[tokio::test]
async fn receiving_a_join_makes_us_the_offerer() {
    let mut mesh = start("local").await;

    mesh.to_coordinator
        .send(Envelope::Join {
            sender_id: "peer-b".into(),
        })
        .unwrap();

    let out = recv_envelope(&mut mesh.from_coordinator).await;
    let Envelope::Offer {
        sender_id,
        target_id,
        sdp,
    } = out
    else {
        panic!("expected an offer, got {out:?}");
    };
    assert_eq!(sender_id, "local");
    assert_eq!(target_id, "peer-b");
    let desc: SessionDescription = serde_json::from_value(sdp).unwrap();
    assert_eq!(desc, SessionDescription::offer("v=0 mock-offer"));

    assert!(matches!(
        recv_event(&mut mesh.events).await,
        MeshEvent::PeerJoined { session_id } if session_id == "peer-b"
    ));
}

#[tokio::test]
async fn local_tracks_attach_before_the_offer() {
    let mut mesh =
        start_with_tracks("local", vec![local_track("mic"), local_track("cam")]).await;

    mesh.to_coordinator
        .send(Envelope::Join {
            sender_id: "peer-b".into(),
        })
        .unwrap();
    recv_envelope(&mut mesh.from_coordinator).await;

    let handle = link(&mesh.factory, 0).await;
    wait_for_calls(
        &handle,
        &[
            MockCall::AttachLocalTrack,
            MockCall::AttachLocalTrack,
            MockCall::CreateOffer,
        ],
    )
    .await;
}

#[tokio::test]
async fn the_newcomer_only_answers() {
    let mut mesh = start("local").await;

    mesh.to_coordinator
        .send(Envelope::Offer {
            sender_id: "peer-a".into(),
            target_id: "local".into(),
            sdp: offer_payload("v=0 their-offer"),
        })
        .unwrap();

    let out = recv_envelope(&mut mesh.from_coordinator).await;
    let Envelope::Answer {
        sender_id,
        target_id,
        sdp,
    } = out
    else {
        panic!("expected an answer, got {out:?}");
    };
    assert_eq!(sender_id, "local");
    assert_eq!(target_id, "peer-a");
    let desc: SessionDescription = serde_json::from_value(sdp).unwrap();
    assert_eq!(desc, SessionDescription::answer("v=0 mock-answer"));

    assert!(matches!(
        recv_event(&mut mesh.events).await,
        MeshEvent::PeerJoined { session_id } if session_id == "peer-a"
    ));
    // the existing member offers; we never do
    let handle = link(&mesh.factory, 0).await;
    assert_eq!(
        handle.link.calls(),
        vec![MockCall::AcceptRemoteOffer("v=0 their-offer".into())]
    );
    expect_envelope_silence(&mut mesh.from_coordinator).await;
}

#[tokio::test]
async fn early_candidates_buffer_until_the_answer_lands() {
    let mut mesh = start("local").await;

    mesh.to_coordinator
        .send(Envelope::Join {
            sender_id: "peer-b".into(),
        })
        .unwrap();
    recv_envelope(&mut mesh.from_coordinator).await; // our offer

    mesh.to_coordinator
        .send(Envelope::IceCandidate {
            sender_id: "peer-b".into(),
            target_id: "local".into(),
            candidate: candidate_payload("c1"),
        })
        .unwrap();
    mesh.to_coordinator
        .send(Envelope::IceCandidate {
            sender_id: "peer-b".into(),
            target_id: "local".into(),
            candidate: candidate_payload("c2"),
        })
        .unwrap();
    mesh.to_coordinator
        .send(Envelope::Answer {
            sender_id: "peer-b".into(),
            target_id: "local".into(),
            sdp: answer_payload("v=0 their-answer"),
        })
        .unwrap();

    let handle = link(&mesh.factory, 0).await;
    wait_for_calls(
        &handle,
        &[
            MockCall::CreateOffer,
            MockCall::AcceptRemoteAnswer("v=0 their-answer".into()),
            MockCall::AddRemoteCandidate("c1".into()),
            MockCall::AddRemoteCandidate("c2".into()),
        ],
    )
    .await;
}

#[tokio::test]
async fn locally_gathered_candidates_are_trickled() {
    let mut mesh = start("local").await;

    mesh.to_coordinator
        .send(Envelope::Join {
            sender_id: "peer-b".into(),
        })
        .unwrap();
    recv_envelope(&mut mesh.from_coordinator).await; // our offer

    let handle = link(&mesh.factory, 0).await;
    handle
        .events
        .send(LinkEvent::LocalCandidate(CandidateInit {
            candidate: "local-c1".into(),
            ..Default::default()
        }))
        .unwrap();

    let out = recv_envelope(&mut mesh.from_coordinator).await;
    let Envelope::IceCandidate {
        sender_id,
        target_id,
        candidate,
    } = out
    else {
        panic!("expected a candidate, got {out:?}");
    };
    assert_eq!(sender_id, "local");
    assert_eq!(target_id, "peer-b");
    let init: CandidateInit = serde_json::from_value(candidate).unwrap();
    assert_eq!(init.candidate, "local-c1");
}

#[tokio::test]
async fn connected_peers_appear_in_the_roster() {
    let mut mesh = start("local").await;

    mesh.to_coordinator
        .send(Envelope::Join {
            sender_id: "peer-b".into(),
        })
        .unwrap();
    recv_envelope(&mut mesh.from_coordinator).await;
    recv_event(&mut mesh.events).await; // PeerJoined

    mesh.to_coordinator
        .send(Envelope::Answer {
            sender_id: "peer-b".into(),
            target_id: "local".into(),
            sdp: answer_payload("v=0 their-answer"),
        })
        .unwrap();
    let handle = link(&mesh.factory, 0).await;
    wait_for_calls(
        &handle,
        &[
            MockCall::CreateOffer,
            MockCall::AcceptRemoteAnswer("v=0 their-answer".into()),
        ],
    )
    .await;

    assert!(mesh.handle.roster().await.is_empty());
    handle
        .events
        .send(LinkEvent::StateChanged(LinkState::Connected))
        .unwrap();
    assert!(matches!(
        recv_event(&mut mesh.events).await,
        MeshEvent::PeerConnected { session_id } if session_id == "peer-b"
    ));

    let roster = mesh.handle.roster().await;
    assert_eq!(roster.len(), 1);
    assert_eq!(roster[0].session_id, "peer-b");
}

#[tokio::test]
async fn a_remote_leave_discards_the_pair() {
    let mut mesh = start("local").await;

    mesh.to_coordinator
        .send(Envelope::Join {
            sender_id: "peer-b".into(),
        })
        .unwrap();
    recv_envelope(&mut mesh.from_coordinator).await;
    recv_event(&mut mesh.events).await; // PeerJoined

    mesh.to_coordinator
        .send(Envelope::Leave {
            sender_id: "peer-b".into(),
        })
        .unwrap();
    assert!(matches!(
        recv_event(&mut mesh.events).await,
        MeshEvent::PeerDeparted { session_id, reason: DepartReason::Left } if session_id == "peer-b"
    ));

    let handle = link(&mesh.factory, 0).await;
    wait_for_calls(&handle, &[MockCall::CreateOffer, MockCall::Close]).await;
    assert!(mesh.handle.roster().await.is_empty());
}

#[tokio::test]
async fn a_failed_link_surfaces_as_participant_disconnected() {
    let mut mesh = start("local").await;

    mesh.to_coordinator
        .send(Envelope::Join {
            sender_id: "peer-b".into(),
        })
        .unwrap();
    recv_envelope(&mut mesh.from_coordinator).await;
    recv_event(&mut mesh.events).await; // PeerJoined

    let handle = link(&mesh.factory, 0).await;
    handle
        .events
        .send(LinkEvent::StateChanged(LinkState::Failed))
        .unwrap();

    assert!(matches!(
        recv_event(&mut mesh.events).await,
        MeshEvent::PeerDeparted {
            session_id,
            reason: DepartReason::ConnectionFailed
        } if session_id == "peer-b"
    ));
}

#[tokio::test]
async fn leaving_tears_down_links_then_announces_once() {
    let mut mesh = start("local").await;

    mesh.to_coordinator
        .send(Envelope::Join {
            sender_id: "peer-b".into(),
        })
        .unwrap();
    recv_envelope(&mut mesh.from_coordinator).await;

    mesh.handle.leave();
    let out = recv_envelope(&mut mesh.from_coordinator).await;
    assert_eq!(
        out,
        Envelope::Leave {
            sender_id: "local".into()
        }
    );
    assert!(mesh.task.await.unwrap().is_ok());

    let handle = link(&mesh.factory, 0).await;
    let calls = handle.link.calls();
    assert_eq!(calls.last(), Some(&MockCall::Close));
}

#[tokio::test]
async fn a_rejoin_replaces_the_old_session() {
    let mut mesh = start("local").await;

    mesh.to_coordinator
        .send(Envelope::Join {
            sender_id: "peer-b".into(),
        })
        .unwrap();
    recv_envelope(&mut mesh.from_coordinator).await;
    recv_event(&mut mesh.events).await; // PeerJoined

    mesh.to_coordinator
        .send(Envelope::Join {
            sender_id: "peer-b".into(),
        })
        .unwrap();
    assert!(matches!(
        recv_event(&mut mesh.events).await,
        MeshEvent::PeerDeparted {
            reason: DepartReason::ConnectionClosed,
            ..
        }
    ));
    assert!(matches!(
        recv_event(&mut mesh.events).await,
        MeshEvent::PeerJoined { session_id } if session_id == "peer-b"
    ));

    // a fresh offer from a fresh link; never two live sessions at once
    let out = recv_envelope(&mut mesh.from_coordinator).await;
    assert!(matches!(out, Envelope::Offer { .. }));
    assert_eq!(mesh.factory.opened().len(), 2);
}

#[tokio::test]
async fn losing_the_relay_ends_the_run_with_an_error() {
    let mut mesh = start("local").await;

    mesh.to_coordinator
        .send(Envelope::Join {
            sender_id: "peer-b".into(),
        })
        .unwrap();
    recv_envelope(&mut mesh.from_coordinator).await;

    drop(mesh.to_coordinator);
    assert!(matches!(
        mesh.task.await.unwrap(),
        Err(MeshError::SignalingClosed)
    ));

    let handle = link(&mesh.factory, 0).await;
    assert_eq!(handle.link.calls().last(), Some(&MockCall::Close));
}

/// Two coordinators, one scripted relay: B joins after A, so A offers
/// and B answers — exactly one offer for the pair, glare-free by
/// construction.
#[tokio::test]
async fn a_pair_negotiates_exactly_one_offer() {
    let mut a = start("a").await;
    let mut b = start("b").await;

    // the relay broadcasts B's join to A (never back to B)
    a.to_coordinator
        .send(Envelope::Join {
            sender_id: "b".into(),
        })
        .unwrap();

    let offer = recv_envelope(&mut a.from_coordinator).await;
    assert!(
        matches!(&offer, Envelope::Offer { sender_id, target_id, .. }
            if sender_id == "a" && target_id == "b")
    );
    b.to_coordinator.send(offer).unwrap();

    let answer = recv_envelope(&mut b.from_coordinator).await;
    assert!(
        matches!(&answer, Envelope::Answer { sender_id, target_id, .. }
            if sender_id == "b" && target_id == "a")
    );
    a.to_coordinator.send(answer).unwrap();

    let a_link = link(&a.factory, 0).await;
    let b_link = link(&b.factory, 0).await;
    wait_for_calls(
        &a_link,
        &[
            MockCall::CreateOffer,
            MockCall::AcceptRemoteAnswer("v=0 mock-answer".into()),
        ],
    )
    .await;
    assert_eq!(
        b_link.link.calls(),
        vec![MockCall::AcceptRemoteOffer("v=0 mock-offer".into())]
    );
    // B produced its answer and nothing else
    expect_envelope_silence(&mut b.from_coordinator).await;

    a_link
        .events
        .send(LinkEvent::StateChanged(LinkState::Connected))
        .unwrap();
    b_link
        .events
        .send(LinkEvent::StateChanged(LinkState::Connected))
        .unwrap();
    recv_event(&mut a.events).await; // PeerJoined(b)
    assert!(matches!(
        recv_event(&mut a.events).await,
        MeshEvent::PeerConnected { session_id } if session_id == "b"
    ));
    recv_event(&mut b.events).await; // PeerJoined(a)
    assert!(matches!(
        recv_event(&mut b.events).await,
        MeshEvent::PeerConnected { session_id } if session_id == "a"
    ));

    assert_eq!(a.handle.roster().await[0].session_id, "b");
    assert_eq!(b.handle.roster().await[0].session_id, "a");
}
