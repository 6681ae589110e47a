//! The mesh coordinator: one per local participant, owning every peer
//! session toward the room and applying the join-triggered offerer
//! policy. Whoever *receives* a `join` offers; the newcomer only
//! answers, so each pair negotiates exactly one offer.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use parley_proto::{CandidateInit, Envelope, SessionDescription};

use crate::link::{LinkEvent, LocalTrack, MediaLinkFactory, RemoteTrack};
use crate::peer::{EndReason, NegotiationState, PeerSession, PeerUpdate};
use crate::signaling::SignalingConnection;

#[derive(Debug, Error)]
pub enum MeshError {
    #[error("signaling connection closed")]
    SignalingClosed,
}

/// Why a remote participant is gone, as surfaced to the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepartReason {
    Left,
    ConnectionFailed,
    ConnectionClosed,
}

pub enum MeshEvent {
    /// A remote participant became visible (their join, or their offer
    /// when we are the newcomer).
    PeerJoined { session_id: String },
    /// The pair's media link reached connected.
    PeerConnected { session_id: String },
    /// The remote added a media track; its handle is live.
    RemoteTrackAdded {
        session_id: String,
        track: RemoteTrack,
    },
    /// The participant is gone and its media handles are dead.
    PeerDeparted {
        session_id: String,
        reason: DepartReason,
    },
}

impl fmt::Debug for MeshEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MeshEvent::PeerJoined { session_id } => {
                f.debug_struct("PeerJoined").field("session_id", session_id).finish()
            }
            MeshEvent::PeerConnected { session_id } => {
                f.debug_struct("PeerConnected").field("session_id", session_id).finish()
            }
            MeshEvent::RemoteTrackAdded { session_id, .. } => f
                .debug_struct("RemoteTrackAdded")
                .field("session_id", session_id)
                .finish(),
            MeshEvent::PeerDeparted { session_id, reason } => f
                .debug_struct("PeerDeparted")
                .field("session_id", session_id)
                .field("reason", reason)
                .finish(),
        }
    }
}

/// A connected remote participant and its live media.
pub struct Participant {
    pub session_id: String,
    pub tracks: Vec<RemoteTrack>,
}

enum Command {
    Leave,
    Roster(oneshot::Sender<Vec<Participant>>),
}

/// Control handle for a running coordinator.
#[derive(Clone)]
pub struct MeshHandle {
    commands: mpsc::UnboundedSender<Command>,
    local_tracks: Vec<LocalTrack>,
}

impl MeshHandle {
    /// Tears down every peer session, announces the leave, and ends
    /// the coordinator.
    pub fn leave(&self) {
        let _ = self.commands.send(Command::Leave);
    }

    /// The local media published into every pair, as supplied at join.
    pub fn local_tracks(&self) -> &[LocalTrack] {
        &self.local_tracks
    }

    /// Connected remote participants in the order they were first
    /// observed.
    pub async fn roster(&self) -> Vec<Participant> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.commands.send(Command::Roster(reply_tx)).is_err() {
            return Vec::new();
        }
        reply_rx.await.unwrap_or_default()
    }
}

pub struct MeshCoordinator {
    session_id: String,
    signaling: SignalingConnection,
    factory: Arc<dyn MediaLinkFactory>,
    local_tracks: Vec<LocalTrack>,
    sessions: HashMap<String, PeerSession>,
    order: Vec<String>,
    next_epoch: u64,
    events: mpsc::UnboundedSender<MeshEvent>,
    link_events_tx: mpsc::UnboundedSender<(String, u64, LinkEvent)>,
    link_events_rx: mpsc::UnboundedReceiver<(String, u64, LinkEvent)>,
    commands: mpsc::UnboundedReceiver<Command>,
}

impl MeshCoordinator {
    /// Builds the coordinator for one local participant. Local tracks
    /// are fixed at join time and attached to every future session at
    /// creation. `run` announces the join and drives everything.
    pub fn new(
        session_id: impl Into<String>,
        signaling: SignalingConnection,
        factory: Arc<dyn MediaLinkFactory>,
        local_tracks: Vec<LocalTrack>,
    ) -> (Self, MeshHandle, mpsc::UnboundedReceiver<MeshEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (link_events_tx, link_events_rx) = mpsc::unbounded_channel();
        let handle = MeshHandle {
            commands: commands_tx,
            local_tracks: local_tracks.clone(),
        };
        let coordinator = Self {
            session_id: session_id.into(),
            signaling,
            factory,
            local_tracks,
            sessions: HashMap::new(),
            order: Vec::new(),
            next_epoch: 0,
            events: events_tx,
            link_events_tx,
            link_events_rx,
            commands: commands_rx,
        };
        (coordinator, handle, events_rx)
    }

    pub async fn run(mut self) -> Result<(), MeshError> {
        self.signaling
            .send(Envelope::Join {
                sender_id: self.session_id.clone(),
            })
            .map_err(|_| MeshError::SignalingClosed)?;

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    None | Some(Command::Leave) => {
                        self.teardown().await;
                        return Ok(());
                    }
                    Some(Command::Roster(reply)) => {
                        let _ = reply.send(self.roster());
                    }
                },
                envelope = self.signaling.recv() => match envelope {
                    None => {
                        // relay is gone; nothing left to signal through
                        for (_, mut session) in self.sessions.drain() {
                            session.close().await;
                        }
                        self.order.clear();
                        return Err(MeshError::SignalingClosed);
                    }
                    Some(envelope) => self.handle_envelope(envelope).await,
                },
                // never yields None: we hold a sender for the lifetime
                // of the coordinator
                Some((remote_id, epoch, event)) = self.link_events_rx.recv() => {
                    self.handle_link_event(remote_id, epoch, event).await;
                },
            }
        }
    }

    async fn handle_envelope(&mut self, envelope: Envelope) {
        match envelope {
            Envelope::Join { sender_id } => {
                if sender_id != self.session_id {
                    self.handle_remote_join(sender_id).await;
                }
            }
            Envelope::Offer { sender_id, sdp, .. } => match serde_json::from_value(sdp) {
                Ok(offer) => self.handle_remote_offer(sender_id, offer).await,
                Err(err) => warn!(remote = %sender_id, %err, "dropping malformed offer payload"),
            },
            Envelope::Answer { sender_id, sdp, .. } => match serde_json::from_value(sdp) {
                Ok(answer) => self.handle_remote_answer(sender_id, answer).await,
                Err(err) => warn!(remote = %sender_id, %err, "dropping malformed answer payload"),
            },
            Envelope::IceCandidate {
                sender_id,
                candidate,
                ..
            } => match serde_json::from_value(candidate) {
                Ok(candidate) => self.handle_remote_candidate(sender_id, candidate).await,
                Err(err) => {
                    warn!(remote = %sender_id, %err, "dropping malformed candidate payload")
                }
            },
            Envelope::Leave { sender_id } => {
                self.remove_session(&sender_id, DepartReason::Left).await;
            }
        }
    }

    /// We received the remote's join, so we are the offerer for this
    /// round.
    async fn handle_remote_join(&mut self, remote_id: String) {
        if self.sessions.contains_key(&remote_id) {
            // the remote came back without us seeing a leave; its old
            // session is unusable
            debug!(remote = %remote_id, "replacing session after rejoin");
            self.remove_session(&remote_id, DepartReason::ConnectionClosed)
                .await;
        }

        let mut session = match self.open_session(&remote_id, true).await {
            Ok(session) => session,
            Err(err) => {
                warn!(remote = %remote_id, %err, "failed to open media link");
                return;
            }
        };
        let _ = self.events.send(MeshEvent::PeerJoined {
            session_id: remote_id.clone(),
        });

        match session.start_offer().await {
            Ok(offer) => {
                self.track_session(remote_id.clone(), session);
                if let Ok(sdp) = serde_json::to_value(&offer) {
                    self.send_envelope(Envelope::Offer {
                        sender_id: self.session_id.clone(),
                        target_id: remote_id,
                        sdp,
                    });
                }
            }
            Err(err) => {
                warn!(remote = %remote_id, %err, "offer creation failed");
                session.close().await;
                let _ = self.events.send(MeshEvent::PeerDeparted {
                    session_id: remote_id,
                    reason: DepartReason::ConnectionFailed,
                });
            }
        }
    }

    /// An offer reaches us either as the newcomer (unknown remote) or
    /// as a stale duplicate the session will discard.
    async fn handle_remote_offer(&mut self, remote_id: String, offer: SessionDescription) {
        if !self.sessions.contains_key(&remote_id) {
            let session = match self.open_session(&remote_id, false).await {
                Ok(session) => session,
                Err(err) => {
                    warn!(remote = %remote_id, %err, "failed to open media link");
                    return;
                }
            };
            self.track_session(remote_id.clone(), session);
            let _ = self.events.send(MeshEvent::PeerJoined {
                session_id: remote_id.clone(),
            });
        }

        let Some(session) = self.sessions.get_mut(&remote_id) else {
            return;
        };
        match session.accept_offer(offer).await {
            Ok(Some(answer)) => {
                if let Ok(sdp) = serde_json::to_value(&answer) {
                    self.send_envelope(Envelope::Answer {
                        sender_id: self.session_id.clone(),
                        target_id: remote_id,
                        sdp,
                    });
                }
            }
            Ok(None) => {}
            Err(err) => {
                warn!(remote = %remote_id, %err, "answering offer failed");
                self.remove_session(&remote_id, DepartReason::ConnectionFailed)
                    .await;
            }
        }
    }

    async fn handle_remote_answer(&mut self, remote_id: String, answer: SessionDescription) {
        let Some(session) = self.sessions.get_mut(&remote_id) else {
            debug!(remote = %remote_id, "answer for unknown peer dropped");
            return;
        };
        match session.accept_answer(answer).await {
            Ok(_) => {}
            Err(err) => {
                warn!(remote = %remote_id, %err, "applying answer failed");
                self.remove_session(&remote_id, DepartReason::ConnectionFailed)
                    .await;
            }
        }
    }

    async fn handle_remote_candidate(&mut self, remote_id: String, candidate: CandidateInit) {
        let Some(session) = self.sessions.get_mut(&remote_id) else {
            debug!(remote = %remote_id, "candidate for unknown peer dropped");
            return;
        };
        if let Err(err) = session.add_candidate(candidate).await {
            // a bad candidate is not fatal to the pair
            warn!(remote = %remote_id, %err, "remote candidate rejected");
        }
    }

    async fn handle_link_event(&mut self, remote_id: String, epoch: u64, event: LinkEvent) {
        let current = self
            .sessions
            .get(&remote_id)
            .map_or(false, |session| session.epoch() == epoch);
        if !current {
            debug!(remote = %remote_id, "event from a replaced link dropped");
            return;
        }

        match event {
            LinkEvent::LocalCandidate(candidate) => {
                if let Ok(value) = serde_json::to_value(&candidate) {
                    self.send_envelope(Envelope::IceCandidate {
                        sender_id: self.session_id.clone(),
                        target_id: remote_id,
                        candidate: value,
                    });
                }
            }
            LinkEvent::RemoteTrack(track) => {
                if let Some(session) = self.sessions.get_mut(&remote_id) {
                    session.push_remote_track(track.clone());
                }
                let _ = self.events.send(MeshEvent::RemoteTrackAdded {
                    session_id: remote_id,
                    track,
                });
            }
            LinkEvent::StateChanged(link_state) => {
                let update = self
                    .sessions
                    .get_mut(&remote_id)
                    .and_then(|session| session.apply_link_state(link_state));
                match update {
                    Some(PeerUpdate::Connected) => {
                        info!(remote = %remote_id, "peer connected");
                        let _ = self.events.send(MeshEvent::PeerConnected {
                            session_id: remote_id,
                        });
                    }
                    Some(PeerUpdate::Ended(EndReason::Failed)) => {
                        self.remove_session(&remote_id, DepartReason::ConnectionFailed)
                            .await;
                    }
                    Some(PeerUpdate::Ended(EndReason::Closed)) => {
                        self.remove_session(&remote_id, DepartReason::ConnectionClosed)
                            .await;
                    }
                    None => {}
                }
            }
        }
    }

    /// Opens a link, attaches the local tracks, and wires its events
    /// into the coordinator loop tagged with a fresh epoch.
    async fn open_session(
        &mut self,
        remote_id: &str,
        offerer: bool,
    ) -> Result<PeerSession, crate::link::LinkError> {
        let (link, mut link_events) = self.factory.open_link().await?;
        for track in &self.local_tracks {
            link.attach_local_track(track.clone()).await?;
        }

        self.next_epoch += 1;
        let epoch = self.next_epoch;
        let forward = self.link_events_tx.clone();
        let tagged = remote_id.to_string();
        tokio::spawn(async move {
            while let Some(event) = link_events.recv().await {
                if forward.send((tagged.clone(), epoch, event)).is_err() {
                    break;
                }
            }
        });

        Ok(if offerer {
            PeerSession::offerer(remote_id, epoch, link)
        } else {
            PeerSession::answerer(remote_id, epoch, link)
        })
    }

    fn track_session(&mut self, remote_id: String, session: PeerSession) {
        self.order.push(remote_id.clone());
        self.sessions.insert(remote_id, session);
    }

    async fn remove_session(&mut self, remote_id: &str, reason: DepartReason) {
        if let Some(mut session) = self.sessions.remove(remote_id) {
            session.close().await;
            self.order.retain(|id| id != remote_id);
            info!(remote = %remote_id, ?reason, "peer departed");
            let _ = self.events.send(MeshEvent::PeerDeparted {
                session_id: remote_id.to_string(),
                reason,
            });
        }
    }

    fn roster(&self) -> Vec<Participant> {
        self.order
            .iter()
            .filter_map(|id| self.sessions.get(id))
            .filter(|session| session.state() == NegotiationState::Connected)
            .map(|session| Participant {
                session_id: session.remote_id().to_string(),
                tracks: session.remote_tracks().to_vec(),
            })
            .collect()
    }

    /// Local leave: close every link first, then announce once. No
    /// partial state survives this.
    async fn teardown(&mut self) {
        for (_, mut session) in self.sessions.drain() {
            session.close().await;
        }
        self.order.clear();
        let _ = self.signaling.send(Envelope::Leave {
            sender_id: self.session_id.clone(),
        });
        self.signaling.close();
    }

    fn send_envelope(&self, envelope: Envelope) {
        if self.signaling.send(envelope).is_err() {
            warn!("signaling connection closed; envelope dropped");
        }
    }
}
