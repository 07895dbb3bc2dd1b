//! Session state machine and data model.

use bytes::Bytes;

use embermq_core::protocol::ProtocolVersion;
use embermq_core::qos::QoS;

use crate::queue::{Limits, MessageData};

/// Lifecycle state of a [`Session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    New,
    Authenticating,
    Active,
    /// About to be replaced by a takeover; kept only long enough to flush
    /// its will and cancel its timers.
    Duplicate,
    Disconnecting,
    Disconnected,
}

/// Whether a session is an ordinary client or a bridge connection, which
/// changes the offline-drop policy in `message_insert`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionKind {
    #[default]
    Normal,
    /// A bridge that only reconnects once enough outbound traffic has
    /// queued up; `reconnect_threshold` is the `msg_count` that flips
    /// `lazy_reconnect`.
    LazyBridge { reconnect_threshold: u32 },
    /// A bridge configured with `clean_start_local`: messages are always
    /// dropped while it is offline rather than queued.
    BridgeCleanStartLocal,
}

#[derive(Debug, Clone)]
pub struct WillMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    pub delay_interval: u32,
    pub message_expiry_interval: u32,
    pub properties: Vec<(u32, Bytes)>,
}

/// A connected (or formerly connected, retained for its session-expiry
/// window) client.
#[derive(Debug)]
pub struct Session {
    pub client_id: String,
    pub protocol_version: ProtocolVersion,
    pub clean_start: bool,
    /// Seconds; `UINT32_MAX` is infinite for v3.x.
    pub session_expiry_interval: u32,
    pub keepalive: u16,
    pub username: Option<String>,
    pub will: Option<WillMessage>,
    pub auth_method: Option<String>,
    pub max_qos: QoS,
    pub max_topic_alias: u16,
    pub state: SessionState,
    /// `true` when a live socket handle is attached; `false` once the
    /// socket has gone away but the session is kept for its expiry window.
    pub online: bool,
    pub kind: SessionKind,
    pub lazy_reconnect: bool,
    pub last_mid: u16,
    pub msgs_in: MessageData,
    pub msgs_out: MessageData,
    pub limits: Limits,
    pub assigned_id: bool,
    /// Topic filters this session is subscribed to. The subscription
    /// hierarchy's node layout itself lives outside this crate; this list
    /// is what a takeover transplants and what an external router uses to
    /// rebind its leaves to the new session.
    pub subscriptions: Vec<String>,
}

impl Session {
    pub fn new(client_id: String, protocol_version: ProtocolVersion, limits: Limits) -> Self {
        Session {
            client_id,
            protocol_version,
            clean_start: true,
            session_expiry_interval: 0,
            keepalive: 0,
            username: None,
            will: None,
            auth_method: None,
            max_qos: QoS::ExactlyOnce,
            max_topic_alias: 0,
            state: SessionState::New,
            online: false,
            kind: SessionKind::Normal,
            lazy_reconnect: false,
            last_mid: 0,
            msgs_in: MessageData::new(crate::client_msg::Direction::In, 20),
            msgs_out: MessageData::new(crate::client_msg::Direction::Out, 20),
            limits,
            assigned_id: false,
            subscriptions: Vec::new(),
        }
    }

    /// Next nonzero packet identifier, wrapping `1..=u16::MAX`.
    pub fn next_mid(&mut self) -> u16 {
        self.last_mid = self.last_mid.wrapping_add(1);
        if self.last_mid == 0 {
            self.last_mid = 1;
        }
        self.last_mid
    }

    /// `UINT32_MAX` means "infinite" for v3.x sessions.
    pub fn session_expiry_is_infinite(&self) -> bool {
        self.protocol_version != ProtocolVersion::V5 && self.session_expiry_interval == u32::MAX
    }

    /// Whether this session's prior state should be discarded rather than
    /// resumed.
    pub fn is_session_continuation(&self) -> bool {
        !self.clean_start && (self.session_expiry_interval > 0 || self.session_expiry_is_infinite())
    }
}
