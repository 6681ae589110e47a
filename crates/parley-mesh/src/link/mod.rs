//! The seam between negotiation and the media transport. The peer
//! session drives a [`MediaLink`] and reacts to its [`LinkEvent`]
//! stream; everything below the SDP/candidate surface (codecs, ICE,
//! bandwidth) belongs to the link implementation.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use ::webrtc::track::track_local::TrackLocal;
use ::webrtc::track::track_remote::TrackRemote;

use parley_proto::{CandidateInit, SessionDescription};

pub mod mock;
pub mod webrtc;

/// A local media track as handed to a link.
pub type LocalTrack = Arc<dyn TrackLocal + Send + Sync>;

/// A remote media track surfaced by a link.
pub type RemoteTrack = Arc<TrackRemote>;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("media link setup failed: {0}")]
    Setup(String),
    #[error("session description exchange failed: {0}")]
    Sdp(String),
    #[error("ice candidate rejected: {0}")]
    Candidate(String),
    #[error("media track rejected: {0}")]
    Track(String),
}

/// Transport-level connection state as reported by the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Events pushed by a link while negotiation and transport run.
pub enum LinkEvent {
    /// A locally gathered ICE candidate, to be trickled to the remote.
    LocalCandidate(CandidateInit),
    /// The remote side added a media track.
    RemoteTrack(RemoteTrack),
    /// Transport state change.
    StateChanged(LinkState),
}

impl fmt::Debug for LinkEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkEvent::LocalCandidate(candidate) => {
                f.debug_tuple("LocalCandidate").field(candidate).finish()
            }
            LinkEvent::RemoteTrack(_) => f.write_str("RemoteTrack(..)"),
            LinkEvent::StateChanged(state) => f.debug_tuple("StateChanged").field(state).finish(),
        }
    }
}

/// One point-to-point media connection under negotiation.
#[async_trait]
pub trait MediaLink: Send + Sync {
    /// Produces the local offer and stores it as the local description.
    async fn create_offer(&self) -> Result<SessionDescription, LinkError>;

    /// Applies a remote offer and produces the local answer.
    async fn accept_remote_offer(
        &self,
        offer: SessionDescription,
    ) -> Result<SessionDescription, LinkError>;

    /// Applies the remote answer to our outstanding offer.
    async fn accept_remote_answer(&self, answer: SessionDescription) -> Result<(), LinkError>;

    async fn add_remote_candidate(&self, candidate: CandidateInit) -> Result<(), LinkError>;

    async fn attach_local_track(&self, track: LocalTrack) -> Result<(), LinkError>;

    async fn close(&self);
}

/// Opens one link per remote peer; the receiver carries that link's
/// events for as long as it lives.
#[async_trait]
pub trait MediaLinkFactory: Send + Sync {
    async fn open_link(
        &self,
    ) -> Result<(Arc<dyn MediaLink>, mpsc::UnboundedReceiver<LinkEvent>), LinkError>;
}
