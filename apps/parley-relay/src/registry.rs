use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::mpsc;

/// What the writer task should do next for one connection.
#[derive(Debug, Clone)]
pub enum Outbound {
    /// Serialized envelope to deliver as a text frame.
    Frame(String),
    /// Close the connection after flushing, with a close frame.
    Close { code: u16, reason: &'static str },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("session id {0} already registered in room")]
    DuplicateSession(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("send queue full")]
    Backpressured,
    #[error("connection closed")]
    Closed,
}

/// The relay's handle to one registered session: the bounded queue
/// feeding that connection's writer task.
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::Sender<Outbound>,
}

impl SessionHandle {
    pub fn new(tx: mpsc::Sender<Outbound>) -> Self {
        Self { tx }
    }

    /// Fire-and-forget delivery. Never blocks: a full queue is the
    /// caller's signal to drop this session rather than stall others.
    pub fn try_deliver(&self, out: Outbound) -> Result<(), DeliveryError> {
        self.tx.try_send(out).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => DeliveryError::Backpressured,
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }
}

/// Room membership: room id -> (session id -> handle).
///
/// Rooms are created implicitly by the first register and removed when
/// their last session unregisters. Constructed per relay instance so
/// tests get isolated registries.
#[derive(Default)]
pub struct ConnectionRegistry {
    rooms: DashMap<String, DashMap<String, SessionHandle>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a session. The existing registration wins on an id
    /// collision; the caller is expected to reject the new connection.
    pub fn register(
        &self,
        room_id: &str,
        session_id: &str,
        handle: SessionHandle,
    ) -> Result<(), RegistryError> {
        let room = self.rooms.entry(room_id.to_string()).or_default();
        let result = match room.entry(session_id.to_string()) {
            Entry::Occupied(_) => Err(RegistryError::DuplicateSession(session_id.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(handle);
                Ok(())
            }
        };
        result
    }

    /// Removes a session, returning its handle if it was present.
    /// The emptiness re-check runs under the map lock so a concurrent
    /// register into the same room is not lost.
    pub fn unregister(&self, room_id: &str, session_id: &str) -> Option<SessionHandle> {
        let removed = {
            let room = self.rooms.get(room_id)?;
            room.remove(session_id).map(|(_, handle)| handle)
        };
        if removed.is_some() {
            self.rooms.remove_if(room_id, |_, sessions| sessions.is_empty());
        }
        removed
    }

    /// Snapshot of the session ids currently in a room.
    pub fn members(&self, room_id: &str) -> Vec<String> {
        self.rooms
            .get(room_id)
            .map(|room| room.iter().map(|entry| entry.key().clone()).collect())
            .unwrap_or_default()
    }

    pub fn handle_for(&self, room_id: &str, session_id: &str) -> Option<SessionHandle> {
        self.rooms
            .get(room_id)?
            .get(session_id)
            .map(|entry| entry.value().clone())
    }

    /// Number of live rooms. Rooms only exist while occupied.
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}
