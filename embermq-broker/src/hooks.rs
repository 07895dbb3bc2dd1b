//! Interfaces to the broker's external collaborators: the listener/event-loop
//! layer, the authenticator, the ACL checker and the subscription router.
//! The core never calls a socket, a clock or an auth backend directly — it
//! calls these traits, which an embedder (e.g. `embermq-server`) implements.

use crate::client_msg::ClientMsg;
use crate::error::CoreError;
use crate::store::StoredMessage;

/// Non-blocking outbound packet sink for one session.
///
/// Every method enqueues bytes into the session's outbound buffer and
/// returns immediately; none may block the core thread. A send that would
/// exceed the peer's advertised maximum packet size returns
/// [`CoreError::OversizePacket`] rather than writing a truncated packet.
pub trait SendSink {
    fn send_publish(&mut self, msg: &ClientMsg, stored: &StoredMessage) -> Result<(), CoreError>;
    fn send_pubrec(&mut self, mid: u16) -> Result<(), CoreError>;
    fn send_pubrel(&mut self, mid: u16) -> Result<(), CoreError>;
    fn send_puback(&mut self, mid: u16) -> Result<(), CoreError>;
    fn send_pubcomp(&mut self, mid: u16) -> Result<(), CoreError>;
    fn send_connack(
        &mut self,
        session_present: bool,
        reason: embermq_core::reason::ReasonCode,
    ) -> Result<(), CoreError>;
    fn send_auth(&mut self, reason: embermq_core::reason::ReasonCode) -> Result<(), CoreError>;
}

/// Outcome of an access-control check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AclAccess {
    Read,
    Write,
    Subscribe,
}

/// Opaque ACL checker; pure function of current ACL state.
pub trait AclChecker {
    fn check(&self, client_id: &str, username: Option<&str>, topic: &str, access: AclAccess) -> bool;
}

/// Outcome of a username/password or extended-auth attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    Success,
    /// MQTT 5 extended auth: more `AUTH` exchanges are needed.
    Continue { data: Vec<u8> },
    Failure,
    NotSupported,
}

/// Opaque authenticator (password file, TLS client-cert identity, external
/// plugin — all out of scope; the core only sees the outcome).
pub trait Authenticator {
    fn check_username_password(
        &self,
        client_id: &str,
        username: Option<&str>,
        password: Option<&[u8]>,
    ) -> AuthOutcome;

    fn extended_auth_start(
        &self,
        client_id: &str,
        auth_method: &str,
        auth_data: Option<&[u8]>,
    ) -> AuthOutcome;

    fn extended_auth_continue(&self, client_id: &str, auth_data: &[u8]) -> AuthOutcome;
}

/// Result of routing a published message through the subscription hierarchy
/// (out of scope for this crate beyond this interface).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    Delivered,
    NoSubscribers,
}

pub trait SubscribeRouter {
    fn route(
        &mut self,
        source_id: &str,
        topic: &str,
        qos: embermq_core::qos::QoS,
        retain: bool,
        store_id: u64,
    ) -> Result<RouteOutcome, CoreError>;

    /// Rewrite every subscription leaf's back-pointer from `old_client_id`
    /// to `new_client_id` during a session takeover. The leaf itself lives
    /// in the subscription hierarchy, which is out of scope for this crate
    /// beyond this interface.
    fn rebind_subscriber(&mut self, old_client_id: &str, new_client_id: &str, filters: &[String]);

    /// Drop a session's subscriptions entirely (the clean-start takeover
    /// branch).
    fn clean_session(&mut self, client_id: &str, filters: &[String]);
}

/// Will-delay / session-expiry / keepalive scheduling, all external timers
/// the core only starts or cancels.
pub trait ExpiryTimers {
    fn schedule_will_delay(&mut self, client_id: &str, delay_seconds: u32);
    fn cancel_will_delay(&mut self, client_id: &str);
    fn schedule_session_expiry(&mut self, client_id: &str, expiry_seconds: u32);
    fn cancel_session_expiry(&mut self, client_id: &str);
    fn reset_keepalive_deadline(&mut self, client_id: &str, keepalive_seconds: u16);
}
