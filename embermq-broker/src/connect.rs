//! CONNECT handler / protocol state machine.
//!
//! Wire-level parsing of the `CONNECT` packet itself lives in
//! `embermq-packets::connect` — this module never touches raw bytes, only
//! already-decoded packets — and performs the semantic validation,
//! negotiation, authorization and session-install steps that turn one into
//! an accepted (or rejected) session.

use rand::RngCore;

use embermq_core::protocol::ProtocolVersion;
use embermq_core::qos::QoS;
use embermq_core::reason::ReasonCode;
use embermq_packets::connect::ConnectPacket;

use crate::hooks::{AclAccess, AclChecker, AuthOutcome, Authenticator, ExpiryTimers, SendSink, SubscribeRouter};
use crate::queue::{retain_acl_permitted, Limits, MessageData};
use crate::registry::SessionRegistry;
use crate::session::{Session, WillMessage};
use crate::store::MessageStore;

/// Per-listener configuration the CONNECT handler consults.
#[derive(Debug, Clone)]
pub struct ListenerSettings {
    pub max_qos: QoS,
    pub max_topic_alias: u16,
    pub allow_anonymous: bool,
    pub allow_zero_length_clientid: bool,
    pub auto_id_prefix: String,
    pub mount_point: String,
    pub use_username_as_clientid: bool,
    pub retain_available: bool,
    pub max_keepalive: u16,
    pub clientid_prefixes: Option<String>,
    pub limits: Limits,
    pub receive_maximum: u16,
}

impl Default for ListenerSettings {
    fn default() -> Self {
        ListenerSettings {
            max_qos: QoS::ExactlyOnce,
            max_topic_alias: 0,
            allow_anonymous: false,
            allow_zero_length_clientid: true,
            auto_id_prefix: String::new(),
            mount_point: String::new(),
            use_username_as_clientid: false,
            retain_available: true,
            max_keepalive: 0,
            clientid_prefixes: None,
            limits: Limits::default(),
            receive_maximum: 20,
        }
    }
}

/// Outcome of processing a `CONNECT` packet. [`handle_connect`] has already
/// sent the matching `CONNACK`/`AUTH` by the time this is returned; `Rejected`
/// additionally tells the caller to close the socket once the `CONNACK` has
/// flushed.
pub enum ConnectOutcome {
    Accepted {
        session_present: bool,
        assigned_client_id: Option<String>,
        server_keepalive: Option<u16>,
    },
    Authenticating {
        auth_method: String,
        auth_data: Vec<u8>,
    },
    Rejected {
        reason: ReasonCode,
    },
}

/// Generate a client id as `auto_id_prefix` + 36 hex/dash UUID-shaped bytes
/// derived from 16 cryptographically random bytes.
fn generate_client_id(auto_id_prefix: &str) -> String {
    let mut rnd = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut rnd);

    let mut out = String::with_capacity(auto_id_prefix.len() + 36);
    out.push_str(auto_id_prefix);
    for (i, byte) in rnd.iter().enumerate() {
        out.push_str(&format!("{:02x}", byte));
        if matches!(i, 3 | 5 | 7 | 9) {
            out.push('-');
        }
    }
    out
}

fn will_from_packet(packet: &ConnectPacket) -> Option<WillMessage> {
    if !packet.flags.will_flag {
        return None;
    }
    let topic = packet.payload.will_topic.clone()?;
    let payload = packet.payload.will_payload.clone().unwrap_or_default();
    let (delay_interval, message_expiry_interval, properties) =
        if let Some(props) = &packet.payload.will_properties {
            (
                props.will_delay_interval.as_ref().map(|p| p.value).unwrap_or(0),
                props
                    .message_expiry_interval
                    .as_ref()
                    .map(|p| p.value)
                    .unwrap_or(0),
                Vec::new(),
            )
        } else {
            (0, 0, Vec::new())
        };

    Some(WillMessage {
        topic,
        payload,
        qos: packet.flags.will_qos,
        retain: packet.flags.will_retain,
        delay_interval,
        message_expiry_interval,
        properties,
    })
}

/// Send a `CONNACK` carrying a failure reason and return the rejection.
/// Every rejection path in [`handle_connect`] funnels through here so the
/// peer always learns why.
fn reject(sink: &mut dyn SendSink, reason: ReasonCode) -> ConnectOutcome {
    if let Err(e) = sink.send_connack(false, reason) {
        tracing::warn!(error = %e, "failed to send CONNACK for rejected CONNECT");
    }
    ConnectOutcome::Rejected { reason }
}

/// Validate, authorize and install a session from a decoded `CONNECT`
/// packet, in order, sending the resulting `CONNACK`/`AUTH` via `sink`
/// before returning the decision.
pub fn handle_connect(
    packet: ConnectPacket,
    listener: &ListenerSettings,
    registry: &mut SessionRegistry,
    store: &mut MessageStore,
    router: &mut dyn SubscribeRouter,
    timers: &mut dyn ExpiryTimers,
    authenticator: &dyn Authenticator,
    acl: &dyn AclChecker,
    sink: &mut dyn SendSink,
    now: u64,
) -> ConnectOutcome {
    let protocol_version = packet.protocol_version;

    if packet.flags.will_flag && packet.flags.will_qos == QoS::Invalid {
        return reject(sink, ReasonCode::ProtocolError);
    }

    if packet.flags.will_retain && !listener.retain_available {
        let reason = if protocol_version == ProtocolVersion::V5 {
            ReasonCode::RetainNotSupported
        } else {
            ReasonCode::NotAuthorized
        };
        return reject(sink, reason);
    }

    if packet.flags.will_flag && (packet.flags.will_qos as u8) > (listener.max_qos as u8) {
        return reject(sink, ReasonCode::QoSNotSupported);
    }

    let mut client_id = packet.payload.client_id.clone();
    let mut assigned_id = false;
    if client_id.is_empty() {
        let allow_assign = match protocol_version {
            ProtocolVersion::V3_1 => false,
            ProtocolVersion::V3_1_1 => {
                packet.flags.clean_start && listener.allow_zero_length_clientid
            }
            ProtocolVersion::V5 => listener.allow_zero_length_clientid,
        };
        if !allow_assign {
            return reject(sink, ReasonCode::ClientIdentifierNotValid);
        }
        client_id = generate_client_id(&listener.auto_id_prefix);
        assigned_id = true;
    }

    if let Some(prefix) = &listener.clientid_prefixes {
        if !client_id.starts_with(prefix.as_str()) {
            return reject(sink, ReasonCode::NotAuthorized);
        }
    }

    let username = packet.payload.user_name.clone();
    if listener.use_username_as_clientid {
        match &username {
            Some(u) => client_id = u.clone(),
            None => return reject(sink, ReasonCode::NotAuthorized),
        }
    }

    let session_expiry_interval = packet
        .properties
        .as_ref()
        .and_then(|p| p.session_expiry_interval.as_ref())
        .map(|p| p.value)
        .unwrap_or_else(|| {
            if protocol_version == ProtocolVersion::V5 {
                0
            } else if !packet.flags.clean_start {
                u32::MAX
            } else {
                0
            }
        });

    let receive_maximum = packet
        .properties
        .as_ref()
        .and_then(|p| p.receive_maximum.as_ref())
        .map(|p| p.value)
        .unwrap_or(listener.receive_maximum);

    // Extended auth (MQTT 5) takes priority over username/password.
    let auth_method = packet
        .properties
        .as_ref()
        .and_then(|p| p.authentication_method.clone())
        .map(|p| p.value);
    let auth_data = packet
        .properties
        .as_ref()
        .and_then(|p| p.authentication_data.clone())
        .map(|p| p.value);

    let auth_outcome = if let Some(method) = &auth_method {
        authenticator.extended_auth_start(&client_id, method, auth_data.as_deref())
    } else if listener.allow_anonymous && username.is_none() {
        AuthOutcome::Success
    } else {
        authenticator.check_username_password(
            &client_id,
            username.as_deref(),
            packet.payload.password.as_deref(),
        )
    };

    match auth_outcome {
        AuthOutcome::Success => {}
        AuthOutcome::Continue { data } => {
            if let Err(e) = sink.send_auth(ReasonCode::ContinueAuthentication) {
                tracing::warn!(client_id = %client_id, error = %e, "failed to send AUTH");
            }
            return ConnectOutcome::Authenticating {
                auth_method: auth_method.unwrap_or_default(),
                auth_data: data,
            };
        }
        AuthOutcome::Failure => return reject(sink, ReasonCode::NotAuthorized),
        AuthOutcome::NotSupported => return reject(sink, ReasonCode::BadAuthenticationMethod),
    }

    if username.is_none() && !listener.allow_anonymous {
        return reject(sink, ReasonCode::BadUserNameOrPassword);
    }
    let keepalive = if listener.max_keepalive != 0 && packet.keepalive > listener.max_keepalive {
        listener.max_keepalive
    } else {
        packet.keepalive
    };

    let mut session = Session::new(client_id.clone(), protocol_version, listener.limits);
    session.clean_start = packet.flags.clean_start;
    session.session_expiry_interval = session_expiry_interval;
    session.keepalive = keepalive;
    session.username = username;
    session.will = will_from_packet(&packet);
    session.auth_method = auth_method;
    session.max_qos = listener.max_qos;
    session.max_topic_alias = listener.max_topic_alias;
    session.assigned_id = assigned_id;
    session.online = true;
    session.msgs_out = MessageData::new(crate::client_msg::Direction::Out, receive_maximum as u32);
    session.msgs_in = MessageData::new(crate::client_msg::Direction::In, listener.receive_maximum as u32);
    session.state = crate::session::SessionState::Active;

    let outcome = registry.install_session(session, store, router, timers, now);

    // A continued session may have stolen queued/inflight messages that the
    // new identity (client-id may be unchanged, but username/ACL context can
    // differ across a reconnect) is no longer authorized to see.
    if outcome.session_present {
        if let Some(installed) = registry.get_mut(&client_id) {
            let username = installed.username.clone();
            let uname = username.as_deref();
            retain_acl_permitted(&mut installed.msgs_out, store, |stored| {
                acl.check(&client_id, uname, &stored.topic, AclAccess::Read)
            });
            retain_acl_permitted(&mut installed.msgs_in, store, |stored| {
                acl.check(&client_id, uname, &stored.topic, AclAccess::Write)
            });
        }
    }

    timers.reset_keepalive_deadline(&client_id, keepalive);

    let server_keepalive = if listener.max_keepalive != 0 && packet.keepalive > listener.max_keepalive
    {
        Some(keepalive)
    } else {
        None
    };

    if let Err(e) = sink.send_connack(outcome.session_present, ReasonCode::Success) {
        tracing::warn!(client_id = %client_id, error = %e, "failed to send CONNACK");
    }

    ConnectOutcome::Accepted {
        session_present: outcome.session_present,
        assigned_client_id: if assigned_id { Some(client_id) } else { None },
        server_keepalive,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::RouteOutcome;
    use embermq_packets::connect::{ConnectFlags, ConnectPayload};

    struct AllowAllAuth;
    impl Authenticator for AllowAllAuth {
        fn check_username_password(
            &self,
            _: &str,
            _: Option<&str>,
            _: Option<&[u8]>,
        ) -> AuthOutcome {
            AuthOutcome::Success
        }
        fn extended_auth_start(&self, _: &str, _: &str, _: Option<&[u8]>) -> AuthOutcome {
            AuthOutcome::Success
        }
        fn extended_auth_continue(&self, _: &str, _: &[u8]) -> AuthOutcome {
            AuthOutcome::Success
        }
    }

    struct AllowAllAcl;
    impl AclChecker for AllowAllAcl {
        fn check(&self, _: &str, _: Option<&str>, _: &str, _: AclAccess) -> bool {
            true
        }
    }

    struct NoopRouter;
    impl SubscribeRouter for NoopRouter {
        fn route(
            &mut self,
            _: &str,
            _: &str,
            _: QoS,
            _: bool,
            _: u64,
        ) -> Result<RouteOutcome, crate::error::CoreError> {
            Ok(RouteOutcome::NoSubscribers)
        }
        fn rebind_subscriber(&mut self, _: &str, _: &str, _: &[String]) {}
        fn clean_session(&mut self, _: &str, _: &[String]) {}
    }

    struct NoopTimers;
    impl ExpiryTimers for NoopTimers {
        fn schedule_will_delay(&mut self, _: &str, _: u32) {}
        fn cancel_will_delay(&mut self, _: &str) {}
        fn schedule_session_expiry(&mut self, _: &str, _: u32) {}
        fn cancel_session_expiry(&mut self, _: &str) {}
        fn reset_keepalive_deadline(&mut self, _: &str, _: u16) {}
    }

    struct NullSink;
    impl SendSink for NullSink {
        fn send_publish(&mut self, _: &crate::client_msg::ClientMsg, _: &crate::store::StoredMessage) -> Result<(), crate::error::CoreError> {
            Ok(())
        }
        fn send_pubrec(&mut self, _: u16) -> Result<(), crate::error::CoreError> {
            Ok(())
        }
        fn send_pubrel(&mut self, _: u16) -> Result<(), crate::error::CoreError> {
            Ok(())
        }
        fn send_puback(&mut self, _: u16) -> Result<(), crate::error::CoreError> {
            Ok(())
        }
        fn send_pubcomp(&mut self, _: u16) -> Result<(), crate::error::CoreError> {
            Ok(())
        }
        fn send_connack(&mut self, _: bool, _: ReasonCode) -> Result<(), crate::error::CoreError> {
            Ok(())
        }
        fn send_auth(&mut self, _: ReasonCode) -> Result<(), crate::error::CoreError> {
            Ok(())
        }
    }

    fn base_packet() -> ConnectPacket {
        ConnectPacket {
            protocol_version: ProtocolVersion::V5,
            flags: ConnectFlags {
                clean_start: true,
                ..Default::default()
            },
            keepalive: 60,
            properties: None,
            payload: ConnectPayload {
                client_id: "c1".into(),
                will_properties: None,
                will_topic: None,
                will_payload: None,
                user_name: None,
                password: None,
            },
        }
    }

    #[test]
    fn empty_client_id_v31_is_rejected() {
        let mut packet = base_packet();
        packet.protocol_version = ProtocolVersion::V3_1;
        packet.payload.client_id = String::new();

        let mut registry = SessionRegistry::new();
        let mut store = MessageStore::new();
        let listener = ListenerSettings {
            allow_anonymous: true,
            ..Default::default()
        };

        let outcome = handle_connect(
            packet,
            &listener,
            &mut registry,
            &mut store,
            &mut NoopRouter,
            &mut NoopTimers,
            &AllowAllAuth,
            &AllowAllAcl,
            &mut NullSink,
            0,
        );

        match outcome {
            ConnectOutcome::Rejected { reason } => {
                assert_eq!(reason, ReasonCode::ClientIdentifierNotValid)
            }
            _ => panic!("expected rejection"),
        }
    }

    #[test]
    fn will_qos3_is_protocol_error() {
        let mut packet = base_packet();
        packet.flags.will_flag = true;
        packet.flags.will_qos = QoS::Invalid;

        let mut registry = SessionRegistry::new();
        let mut store = MessageStore::new();
        let listener = ListenerSettings {
            allow_anonymous: true,
            ..Default::default()
        };

        let outcome = handle_connect(
            packet,
            &listener,
            &mut registry,
            &mut store,
            &mut NoopRouter,
            &mut NoopTimers,
            &AllowAllAuth,
            &AllowAllAcl,
            &mut NullSink,
            0,
        );

        match outcome {
            ConnectOutcome::Rejected { reason } => assert_eq!(reason, ReasonCode::ProtocolError),
            _ => panic!("expected rejection"),
        }
    }

    #[test]
    fn retain_not_available_with_will_retain_rejects() {
        let mut packet = base_packet();
        packet.flags.will_flag = true;
        packet.flags.will_qos = QoS::AtLeastOnce;
        packet.flags.will_retain = true;
        packet.payload.will_topic = Some("a/will".into());

        let mut registry = SessionRegistry::new();
        let mut store = MessageStore::new();
        let listener = ListenerSettings {
            allow_anonymous: true,
            retain_available: false,
            ..Default::default()
        };

        let outcome = handle_connect(
            packet,
            &listener,
            &mut registry,
            &mut store,
            &mut NoopRouter,
            &mut NoopTimers,
            &AllowAllAuth,
            &AllowAllAcl,
            &mut NullSink,
            0,
        );

        match outcome {
            ConnectOutcome::Rejected { reason } => {
                assert_eq!(reason, ReasonCode::RetainNotSupported)
            }
            _ => panic!("expected rejection"),
        }
    }

    #[test]
    fn successful_connect_installs_session() {
        let packet = base_packet();
        let mut registry = SessionRegistry::new();
        let mut store = MessageStore::new();
        let listener = ListenerSettings {
            allow_anonymous: true,
            ..Default::default()
        };

        let outcome = handle_connect(
            packet,
            &listener,
            &mut registry,
            &mut store,
            &mut NoopRouter,
            &mut NoopTimers,
            &AllowAllAuth,
            &AllowAllAcl,
            &mut NullSink,
            0,
        );

        match outcome {
            ConnectOutcome::Accepted { session_present, .. } => assert!(!session_present),
            _ => panic!("expected acceptance"),
        }
        assert!(registry.get("c1").is_some());
    }

    struct DenyTopicAcl(&'static str);
    impl AclChecker for DenyTopicAcl {
        fn check(&self, _: &str, _: Option<&str>, topic: &str, _: AclAccess) -> bool {
            topic != self.0
        }
    }

    #[test]
    fn takeover_discards_messages_the_new_identity_cannot_access() {
        let mut registry = SessionRegistry::new();
        let mut store = MessageStore::new();
        let listener = ListenerSettings {
            allow_anonymous: true,
            ..Default::default()
        };

        let mut first = base_packet();
        first.flags.clean_start = false;
        handle_connect(
            first,
            &listener,
            &mut registry,
            &mut store,
            &mut NoopRouter,
            &mut NoopTimers,
            &AllowAllAuth,
            &AllowAllAcl,
            &mut NullSink,
            0,
        );

        // Queue one message the new identity will keep, one it will lose.
        let keep_id = store.add(crate::store::NewMessage {
            source_id: "pub".into(),
            source_username: None,
            origin: crate::store::Origin::Client,
            topic: "a/b".into(),
            payload: bytes::Bytes::from_static(b"keep"),
            qos: QoS::AtLeastOnce,
            retain: false,
            properties: Vec::new(),
            message_expiry_time: 0,
        });
        let drop_id = store.add(crate::store::NewMessage {
            source_id: "pub".into(),
            source_username: None,
            origin: crate::store::Origin::Client,
            topic: "secret/topic".into(),
            payload: bytes::Bytes::from_static(b"drop"),
            qos: QoS::AtLeastOnce,
            retain: false,
            properties: Vec::new(),
            message_expiry_time: 0,
        });
        {
            let session = registry.get_mut("c1").unwrap();
            store.ref_inc(keep_id);
            store.ref_inc(drop_id);
            for (mid, id, topic_len) in [(1u16, keep_id, 4usize), (2u16, drop_id, 4usize)] {
                let msg = crate::client_msg::ClientMsg::new(
                    mid,
                    QoS::AtLeastOnce,
                    false,
                    crate::client_msg::Direction::Out,
                    crate::client_msg::ClientMsgState::Queued,
                    id,
                    topic_len,
                    0,
                );
                session.msgs_out.queued.push_back(msg);
                session.msgs_out.msg_count += 1;
                session.msgs_out.msg_count12 += 1;
            }
        }

        let mut second = base_packet();
        second.flags.clean_start = false;
        let outcome = handle_connect(
            second,
            &listener,
            &mut registry,
            &mut store,
            &mut NoopRouter,
            &mut NoopTimers,
            &AllowAllAuth,
            &DenyTopicAcl("secret/topic"),
            &mut NullSink,
            0,
        );

        match outcome {
            ConnectOutcome::Accepted { session_present, .. } => assert!(session_present),
            _ => panic!("expected acceptance"),
        }

        let installed = registry.get("c1").unwrap();
        let remaining: Vec<u64> = installed
            .msgs_out
            .queued
            .iter()
            .map(|m| m.store_id)
            .collect();
        assert_eq!(remaining, vec![keep_id]);
        assert_eq!(store.get(drop_id), None);
    }
}
