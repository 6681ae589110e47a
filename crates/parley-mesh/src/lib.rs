//! Client side of the Parley signaling stack: the relay connection,
//! the per-peer negotiation state machine, and the mesh coordinator
//! that owns one media link per remote participant.

pub mod coordinator;
pub mod directory;
pub mod link;
pub mod peer;
pub mod signaling;

pub use coordinator::{DepartReason, MeshCoordinator, MeshError, MeshEvent, MeshHandle, Participant};
pub use link::{
    LinkError, LinkEvent, LinkState, LocalTrack, MediaLink, MediaLinkFactory, RemoteTrack,
};
pub use peer::NegotiationState;
pub use signaling::{generate_session_id, SignalingConnection, SignalingError};
