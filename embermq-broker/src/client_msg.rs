//! A single in-flight or queued protocol exchange for one session-direction.

/// Which way a message is travelling relative to the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
}

/// State of a [`ClientMsg`] within its QoS exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientMsgState {
    PublishQoS0,
    PublishQoS1,
    PublishQoS2,
    WaitPuback,
    WaitPubrec,
    WaitPubrel,
    WaitPubcomp,
    SendPubrec,
    ResendPubrel,
    ResendPubcomp,
    Queued,
    Invalid,
}

/// A message occupying a slot in a session's inflight or queued list.
/// Holds a `db_id` handle into the owning [`crate::store::MessageStore`]
/// rather than a shared pointer, since the store is the single owner of
/// every payload's bytes.
#[derive(Debug, Clone)]
pub struct ClientMsg {
    pub mid: u16,
    pub qos: embermq_core::qos::QoS,
    pub retain: bool,
    pub dup: bool,
    pub direction: Direction,
    pub state: ClientMsgState,
    /// Epoch seconds this entry last transitioned state (used to stamp
    /// resend timers at the edge; the core does not itself schedule resends).
    pub timestamp: u64,
    pub properties: Vec<(u32, bytes::Bytes)>,
    pub store_id: u64,
    /// Byte length of the referenced [`crate::store::StoredMessage`]'s
    /// payload, cached here so queue accounting doesn't need a store lookup
    /// on every mutation.
    pub payload_len: usize,
}

impl ClientMsg {
    pub fn new(
        mid: u16,
        qos: embermq_core::qos::QoS,
        retain: bool,
        direction: Direction,
        state: ClientMsgState,
        store_id: u64,
        payload_len: usize,
        timestamp: u64,
    ) -> Self {
        ClientMsg {
            mid,
            qos,
            retain,
            dup: false,
            direction,
            state,
            timestamp,
            properties: Vec::new(),
            store_id,
            payload_len,
        }
    }

    pub fn is_queued(&self) -> bool {
        matches!(self.state, ClientMsgState::Queued)
    }
}
