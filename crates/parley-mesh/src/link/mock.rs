//! Scripted link for driving the negotiation machinery in tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use parley_proto::{CandidateInit, SdpKind, SessionDescription};

use super::{LinkError, LinkEvent, LocalTrack, MediaLink, MediaLinkFactory};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    CreateOffer,
    AcceptRemoteOffer(String),
    AcceptRemoteAnswer(String),
    AddRemoteCandidate(String),
    AttachLocalTrack,
    Close,
}

/// Records every call and answers with canned descriptions.
#[derive(Default)]
pub struct MockLink {
    calls: Mutex<Vec<MockCall>>,
    fail_offer: AtomicBool,
}

impl MockLink {
    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().clone()
    }

    pub fn fail_next_offer(&self) {
        self.fail_offer.store(true, Ordering::SeqCst);
    }

    fn record(&self, call: MockCall) {
        self.calls.lock().push(call);
    }
}

#[async_trait]
impl MediaLink for MockLink {
    async fn create_offer(&self) -> Result<SessionDescription, LinkError> {
        self.record(MockCall::CreateOffer);
        if self.fail_offer.swap(false, Ordering::SeqCst) {
            return Err(LinkError::Sdp("scripted offer failure".into()));
        }
        Ok(SessionDescription::offer("v=0 mock-offer"))
    }

    async fn accept_remote_offer(
        &self,
        offer: SessionDescription,
    ) -> Result<SessionDescription, LinkError> {
        if offer.kind != SdpKind::Offer {
            return Err(LinkError::Sdp("expected an offer description".into()));
        }
        self.record(MockCall::AcceptRemoteOffer(offer.sdp));
        Ok(SessionDescription::answer("v=0 mock-answer"))
    }

    async fn accept_remote_answer(&self, answer: SessionDescription) -> Result<(), LinkError> {
        if answer.kind != SdpKind::Answer {
            return Err(LinkError::Sdp("expected an answer description".into()));
        }
        self.record(MockCall::AcceptRemoteAnswer(answer.sdp));
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: CandidateInit) -> Result<(), LinkError> {
        self.record(MockCall::AddRemoteCandidate(candidate.candidate));
        Ok(())
    }

    async fn attach_local_track(&self, _track: LocalTrack) -> Result<(), LinkError> {
        self.record(MockCall::AttachLocalTrack);
        Ok(())
    }

    async fn close(&self) {
        self.record(MockCall::Close);
    }
}

/// Handle to one opened mock link: inspect its calls, inject events.
#[derive(Clone)]
pub struct MockLinkHandle {
    pub link: Arc<MockLink>,
    pub events: mpsc::UnboundedSender<LinkEvent>,
}

/// Factory that hands out [`MockLink`]s and keeps a handle to each.
#[derive(Default)]
pub struct MockLinkFactory {
    opened: Mutex<Vec<MockLinkHandle>>,
}

impl MockLinkFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handles to every link opened so far, in open order.
    pub fn opened(&self) -> Vec<MockLinkHandle> {
        self.opened.lock().clone()
    }
}

#[async_trait]
impl MediaLinkFactory for MockLinkFactory {
    async fn open_link(
        &self,
    ) -> Result<(Arc<dyn MediaLink>, mpsc::UnboundedReceiver<LinkEvent>), LinkError> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let link = Arc::new(MockLink::default());
        self.opened.lock().push(MockLinkHandle {
            link: link.clone(),
            events: events_tx,
        });
        let as_link: Arc<dyn MediaLink> = link;
        Ok((as_link, events_rx))
    }
}
