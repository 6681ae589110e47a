//! Per-remote-peer negotiation state. One `PeerSession` exists per
//! (local, remote) pair; terminal sessions are discarded, never
//! reused.

use std::sync::Arc;

use tracing::{debug, warn};

use parley_proto::{CandidateInit, SessionDescription};

use crate::link::{LinkError, LinkState, MediaLink, RemoteTrack};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    Offering,
    AwaitingAnswer,
    AwaitingOffer,
    Answering,
    Negotiating,
    Connected,
    Failed,
    Closed,
}

impl NegotiationState {
    pub fn is_terminal(self) -> bool {
        matches!(self, NegotiationState::Failed | NegotiationState::Closed)
    }
}

/// Outcome of a link state report, for the coordinator to act on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerUpdate {
    Connected,
    Ended(EndReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    Failed,
    Closed,
}

pub struct PeerSession {
    remote_id: String,
    epoch: u64,
    state: NegotiationState,
    link: Arc<dyn MediaLink>,
    // Candidates that arrived before the remote description was set.
    pending_candidates: Vec<CandidateInit>,
    have_remote_description: bool,
    remote_tracks: Vec<RemoteTrack>,
}

impl PeerSession {
    /// Session toward a remote we are designated to offer to (we
    /// received their `join`).
    pub fn offerer(remote_id: impl Into<String>, epoch: u64, link: Arc<dyn MediaLink>) -> Self {
        Self::new(remote_id, epoch, link, NegotiationState::Idle)
    }

    /// Session toward a remote whose offer we expect (we are the
    /// newcomer for this round).
    pub fn answerer(remote_id: impl Into<String>, epoch: u64, link: Arc<dyn MediaLink>) -> Self {
        Self::new(remote_id, epoch, link, NegotiationState::AwaitingOffer)
    }

    fn new(
        remote_id: impl Into<String>,
        epoch: u64,
        link: Arc<dyn MediaLink>,
        state: NegotiationState,
    ) -> Self {
        Self {
            remote_id: remote_id.into(),
            epoch,
            state,
            link,
            pending_candidates: Vec::new(),
            have_remote_description: false,
            remote_tracks: Vec::new(),
        }
    }

    pub fn remote_id(&self) -> &str {
        &self.remote_id
    }

    /// Distinguishes this session from earlier ones toward the same
    /// remote, so stale link events cannot touch a replacement.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn remote_tracks(&self) -> &[RemoteTrack] {
        &self.remote_tracks
    }

    pub fn push_remote_track(&mut self, track: RemoteTrack) {
        self.remote_tracks.push(track);
    }

    /// Offerer entry point: produce and return the local offer.
    pub async fn start_offer(&mut self) -> Result<SessionDescription, LinkError> {
        self.state = NegotiationState::Offering;
        match self.link.create_offer().await {
            Ok(offer) => {
                self.state = NegotiationState::AwaitingAnswer;
                Ok(offer)
            }
            Err(err) => {
                self.state = NegotiationState::Failed;
                Err(err)
            }
        }
    }

    /// Applies a remote offer and returns the answer to send back.
    /// Offers arriving in any state past `AwaitingOffer` are stale and
    /// dropped (`None`).
    pub async fn accept_offer(
        &mut self,
        offer: SessionDescription,
    ) -> Result<Option<SessionDescription>, LinkError> {
        match self.state {
            NegotiationState::Idle | NegotiationState::AwaitingOffer => {}
            state => {
                debug!(remote = %self.remote_id, ?state, "discarding offer");
                return Ok(None);
            }
        }
        self.state = NegotiationState::Answering;
        match self.link.accept_remote_offer(offer).await {
            Ok(answer) => {
                self.have_remote_description = true;
                self.flush_pending_candidates().await;
                self.state = NegotiationState::Negotiating;
                Ok(Some(answer))
            }
            Err(err) => {
                self.state = NegotiationState::Failed;
                Err(err)
            }
        }
    }

    /// Applies the remote answer. Returns whether it was applied;
    /// answers in any state but `AwaitingAnswer` are stale and dropped.
    pub async fn accept_answer(&mut self, answer: SessionDescription) -> Result<bool, LinkError> {
        if self.state != NegotiationState::AwaitingAnswer {
            debug!(remote = %self.remote_id, state = ?self.state, "discarding answer");
            return Ok(false);
        }
        match self.link.accept_remote_answer(answer).await {
            Ok(()) => {
                self.have_remote_description = true;
                self.flush_pending_candidates().await;
                self.state = NegotiationState::Negotiating;
                Ok(true)
            }
            Err(err) => {
                self.state = NegotiationState::Failed;
                Err(err)
            }
        }
    }

    /// Candidates apply in any non-terminal state; before the remote
    /// description exists they are buffered.
    pub async fn add_candidate(&mut self, candidate: CandidateInit) -> Result<(), LinkError> {
        if self.is_terminal() {
            debug!(remote = %self.remote_id, "dropping candidate for ended session");
            return Ok(());
        }
        if !self.have_remote_description {
            self.pending_candidates.push(candidate);
            return Ok(());
        }
        self.link.add_remote_candidate(candidate).await
    }

    async fn flush_pending_candidates(&mut self) {
        for candidate in std::mem::take(&mut self.pending_candidates) {
            if let Err(err) = self.link.add_remote_candidate(candidate).await {
                warn!(remote = %self.remote_id, %err, "buffered candidate rejected");
            }
        }
    }

    /// Folds a transport state report into the negotiation state.
    pub fn apply_link_state(&mut self, link_state: LinkState) -> Option<PeerUpdate> {
        if self.is_terminal() {
            return None;
        }
        match link_state {
            LinkState::Connecting => None,
            LinkState::Connected => {
                if self.state == NegotiationState::Negotiating {
                    self.state = NegotiationState::Connected;
                    Some(PeerUpdate::Connected)
                } else {
                    debug!(remote = %self.remote_id, state = ?self.state, "ignoring early connected report");
                    None
                }
            }
            LinkState::Disconnected | LinkState::Failed => {
                self.state = NegotiationState::Failed;
                Some(PeerUpdate::Ended(EndReason::Failed))
            }
            LinkState::Closed => {
                self.state = NegotiationState::Closed;
                Some(PeerUpdate::Ended(EndReason::Closed))
            }
        }
    }

    pub async fn close(&mut self) {
        if self.state != NegotiationState::Closed {
            self.state = NegotiationState::Closed;
            self.link.close().await;
        }
    }
}
