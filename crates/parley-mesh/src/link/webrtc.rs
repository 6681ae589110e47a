//! `MediaLink` over a `webrtc` crate peer connection.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;

use parley_proto::{CandidateInit, SdpKind, SessionDescription};

use super::{LinkError, LinkEvent, LinkState, LocalTrack, MediaLink, MediaLinkFactory};

/// STUN/TURN endpoint for ICE gathering.
#[derive(Debug, Clone)]
pub struct IceServer {
    pub urls: Vec<String>,
    pub username: String,
    pub credential: String,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: String::new(),
            credential: String::new(),
        }
    }
}

/// Opens webrtc-backed links, one per remote peer.
pub struct WebRtcLinkFactory {
    ice_servers: Vec<IceServer>,
}

impl WebRtcLinkFactory {
    pub fn new(ice_servers: Vec<IceServer>) -> Self {
        Self { ice_servers }
    }
}

impl Default for WebRtcLinkFactory {
    fn default() -> Self {
        // Default STUN server for NAT traversal
        Self::new(vec![IceServer::stun("stun:stun.l.google.com:19302")])
    }
}

#[async_trait]
impl MediaLinkFactory for WebRtcLinkFactory {
    async fn open_link(
        &self,
    ) -> Result<(Arc<dyn MediaLink>, mpsc::UnboundedReceiver<LinkEvent>), LinkError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|err| LinkError::Setup(format!("register codecs: {err}")))?;
        let interceptors = register_default_interceptors(Default::default(), &mut media_engine)
            .map_err(|err| LinkError::Setup(format!("register interceptors: {err}")))?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(interceptors)
            .build();

        let config = RTCConfiguration {
            ice_servers: self
                .ice_servers
                .iter()
                .map(|server| RTCIceServer {
                    urls: server.urls.clone(),
                    username: server.username.clone(),
                    credential: server.credential.clone(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };

        let peer_connection = Arc::new(
            api.new_peer_connection(config)
                .await
                .map_err(|err| LinkError::Setup(format!("create peer connection: {err}")))?,
        );

        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let tx = events_tx.clone();
        peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let tx = tx.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = tx.send(LinkEvent::LocalCandidate(CandidateInit {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                        }));
                    }
                    Err(err) => warn!(%err, "failed to serialize local candidate"),
                }
            })
        }));

        let tx = events_tx.clone();
        peer_connection.on_track(Box::new(move |track, _receiver, _transceiver| {
            let tx = tx.clone();
            Box::pin(async move {
                debug!(kind = %track.kind(), "remote track arrived");
                let _ = tx.send(LinkEvent::RemoteTrack(track));
            })
        }));

        let tx = events_tx.clone();
        peer_connection.on_peer_connection_state_change(Box::new(
            move |state: RTCPeerConnectionState| {
                let tx = tx.clone();
                Box::pin(async move {
                    let mapped = match state {
                        RTCPeerConnectionState::Connecting => LinkState::Connecting,
                        RTCPeerConnectionState::Connected => LinkState::Connected,
                        RTCPeerConnectionState::Disconnected => LinkState::Disconnected,
                        RTCPeerConnectionState::Failed => LinkState::Failed,
                        RTCPeerConnectionState::Closed => LinkState::Closed,
                        _ => return,
                    };
                    let _ = tx.send(LinkEvent::StateChanged(mapped));
                })
            },
        ));

        let link: Arc<dyn MediaLink> = Arc::new(WebRtcLink {
            peer_connection,
            senders: Mutex::new(Vec::new()),
        });
        Ok((link, events_rx))
    }
}

pub struct WebRtcLink {
    peer_connection: Arc<RTCPeerConnection>,
    // Retained so the transport does not tear tracks down early.
    senders: Mutex<Vec<Arc<RTCRtpSender>>>,
}

#[async_trait]
impl MediaLink for WebRtcLink {
    async fn create_offer(&self) -> Result<SessionDescription, LinkError> {
        let offer = self
            .peer_connection
            .create_offer(None)
            .await
            .map_err(|err| LinkError::Sdp(format!("create offer: {err}")))?;
        self.peer_connection
            .set_local_description(offer)
            .await
            .map_err(|err| LinkError::Sdp(format!("set local offer: {err}")))?;
        let local = self
            .peer_connection
            .local_description()
            .await
            .ok_or_else(|| LinkError::Sdp("no local description after offer".into()))?;
        Ok(SessionDescription::offer(local.sdp))
    }

    async fn accept_remote_offer(
        &self,
        offer: SessionDescription,
    ) -> Result<SessionDescription, LinkError> {
        if offer.kind != SdpKind::Offer {
            return Err(LinkError::Sdp("expected an offer description".into()));
        }
        let remote = RTCSessionDescription::offer(offer.sdp)
            .map_err(|err| LinkError::Sdp(format!("parse offer: {err}")))?;
        self.peer_connection
            .set_remote_description(remote)
            .await
            .map_err(|err| LinkError::Sdp(format!("set remote offer: {err}")))?;
        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .map_err(|err| LinkError::Sdp(format!("create answer: {err}")))?;
        self.peer_connection
            .set_local_description(answer)
            .await
            .map_err(|err| LinkError::Sdp(format!("set local answer: {err}")))?;
        let local = self
            .peer_connection
            .local_description()
            .await
            .ok_or_else(|| LinkError::Sdp("no local description after answer".into()))?;
        Ok(SessionDescription::answer(local.sdp))
    }

    async fn accept_remote_answer(&self, answer: SessionDescription) -> Result<(), LinkError> {
        if answer.kind != SdpKind::Answer {
            return Err(LinkError::Sdp("expected an answer description".into()));
        }
        let remote = RTCSessionDescription::answer(answer.sdp)
            .map_err(|err| LinkError::Sdp(format!("parse answer: {err}")))?;
        self.peer_connection
            .set_remote_description(remote)
            .await
            .map_err(|err| LinkError::Sdp(format!("set remote answer: {err}")))
    }

    async fn add_remote_candidate(&self, candidate: CandidateInit) -> Result<(), LinkError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: None,
        };
        self.peer_connection
            .add_ice_candidate(init)
            .await
            .map_err(|err| LinkError::Candidate(err.to_string()))
    }

    async fn attach_local_track(&self, track: LocalTrack) -> Result<(), LinkError> {
        let sender = self
            .peer_connection
            .add_track(track)
            .await
            .map_err(|err| LinkError::Track(err.to_string()))?;
        self.senders.lock().push(sender);
        Ok(())
    }

    async fn close(&self) {
        if let Err(err) = self.peer_connection.close().await {
            debug!(%err, "peer connection close");
        }
    }
}
