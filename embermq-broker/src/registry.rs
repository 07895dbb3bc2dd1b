//! Client-id → session mapping, takeover, cleanup.
//!
//! At most one session is registered under any `client_id` at a time;
//! installing a second steals or discards the first's state depending on
//! whether the new connection continues or replaces it.

use std::collections::HashMap;

use crate::hooks::{ExpiryTimers, SubscribeRouter};
use crate::queue::reconnect_reset;
use crate::session::{Session, SessionState};
use crate::store::{MessageStore, NewMessage, Origin};

#[derive(Debug, Default)]
pub struct SessionRegistry {
    by_id: HashMap<String, Session>,
}

/// Outcome of [`install_session`], feeding the CONNACK's `session_present` bit.
pub struct TakeoverOutcome {
    /// CONNACK `session_present` flag.
    pub session_present: bool,
    /// The displaced session, already marked `Duplicate`; the caller
    /// (embedder) is responsible for physically closing its socket.
    pub displaced: Option<Session>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, client_id: &str) -> Option<&Session> {
        self.by_id.get(client_id)
    }

    pub fn get_mut(&mut self, client_id: &str) -> Option<&mut Session> {
        self.by_id.get_mut(client_id)
    }

    pub fn remove(&mut self, client_id: &str) -> Option<Session> {
        self.by_id.remove(client_id)
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Install `new_session` into the registry, performing a takeover of
    /// any existing session registered under the same `client_id` first.
    /// `new_session.msgs_in`/`msgs_out` must already carry the *new*
    /// connection's configured `inflight_maximum` — these are the values
    /// preserved across a steal.
    pub fn install_session(
        &mut self,
        mut new_session: Session,
        store: &mut MessageStore,
        router: &mut dyn SubscribeRouter,
        timers: &mut dyn ExpiryTimers,
        now: u64,
    ) -> TakeoverOutcome {
        let existing = self.by_id.remove(&new_session.client_id);

        let (session_present, displaced) = match existing {
            Some(mut old) => {
                if old.online {
                    tracing::info!(client_id = %old.client_id, "displacing existing session on takeover");
                }

                let continuation = !new_session.clean_start
                    && (old.session_expiry_interval > 0 || old.session_expiry_is_infinite());

                let present = if continuation {
                    let new_out_max = new_session.msgs_out.inflight_maximum;
                    let new_in_max = new_session.msgs_in.inflight_maximum;

                    new_session.msgs_out = std::mem::replace(
                        &mut old.msgs_out,
                        crate::queue::MessageData::new(crate::client_msg::Direction::Out, 0),
                    );
                    new_session.msgs_in = std::mem::replace(
                        &mut old.msgs_in,
                        crate::queue::MessageData::new(crate::client_msg::Direction::In, 0),
                    );
                    new_session.msgs_out.inflight_maximum = new_out_max;
                    new_session.msgs_in.inflight_maximum = new_in_max;

                    new_session.subscriptions = std::mem::take(&mut old.subscriptions);
                    new_session.last_mid = old.last_mid;

                    router.rebind_subscriber(
                        &old.client_id,
                        &new_session.client_id,
                        &new_session.subscriptions,
                    );

                    reconnect_reset(&mut new_session.msgs_out, &new_session.limits, true, now);
                    reconnect_reset(&mut new_session.msgs_in, &new_session.limits, false, now);

                    true
                } else {
                    router.clean_session(&old.client_id, &old.subscriptions);
                    old.subscriptions.clear();
                    false
                };

                dispatch_or_schedule_will(&mut old, &new_session, store, router, timers);

                timers.cancel_session_expiry(&old.client_id);
                old.state = SessionState::Duplicate;
                old.online = false;

                (present, Some(old))
            }
            None => (false, None),
        };

        self.by_id
            .insert(new_session.client_id.clone(), new_session);

        TakeoverOutcome {
            session_present,
            displaced,
        }
    }
}

/// Dispatch the displaced session's will immediately when its expiry rules
/// require it, otherwise defer via the will-delay timer.
fn dispatch_or_schedule_will(
    old: &mut Session,
    new_session: &Session,
    store: &mut MessageStore,
    router: &mut dyn SubscribeRouter,
    timers: &mut dyn ExpiryTimers,
) {
    use embermq_core::protocol::ProtocolVersion;

    let Some(will) = old.will.take() else {
        return;
    };

    let immediate = match old.protocol_version {
        ProtocolVersion::V5 => will.delay_interval == 0,
        _ => old.clean_start,
    } || new_session.clean_start;

    if immediate {
        timers.cancel_will_delay(&old.client_id);
        let db_id = store.add(NewMessage {
            source_id: old.client_id.clone(),
            source_username: old.username.clone(),
            origin: Origin::Broker,
            topic: will.topic,
            payload: will.payload,
            qos: will.qos,
            retain: will.retain,
            properties: will.properties,
            message_expiry_time: 0,
        });
        store.ref_inc(db_id);
        let _ = router.route(&old.client_id, "", will.qos, will.retain, db_id);
        store.ref_dec(db_id);
    } else {
        old.will = Some(will);
        timers.schedule_will_delay(&old.client_id, old.will.as_ref().unwrap().delay_interval);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::{AclAccess, AuthOutcome, RouteOutcome};
    use embermq_core::protocol::ProtocolVersion;
    use embermq_core::qos::QoS;

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

    #[allow(dead_code)]
    fn unused(_: AclAccess, _: AuthOutcome) {}

    #[test]
    fn at_most_one_session_per_client_id() {
        let mut registry = SessionRegistry::new();
        let mut store = MessageStore::new();
        let limits = crate::queue::Limits::default();

        let s1 = Session::new("c1".into(), ProtocolVersion::V5, limits);
        registry.install_session(s1, &mut store, &mut NoopRouter, &mut NoopTimers, 0);
        assert_eq!(registry.len(), 1);

        let s2 = Session::new("c1".into(), ProtocolVersion::V5, limits);
        let outcome =
            registry.install_session(s2, &mut store, &mut NoopRouter, &mut NoopTimers, 0);
        assert_eq!(registry.len(), 1);
        assert!(outcome.displaced.is_some());
    }

    #[test]
    fn continuation_steals_message_data() {
        let mut registry = SessionRegistry::new();
        let mut store = MessageStore::new();
        let limits = crate::queue::Limits::default();

        let mut s1 = Session::new("c1".into(), ProtocolVersion::V5, limits);
        s1.clean_start = false;
        s1.session_expiry_interval = 60;
        s1.msgs_out.inflight_maximum = 20;
        s1.msgs_out.inflight_quota = 20;
        let db_id = store.add(NewMessage {
            source_id: "other".into(),
            source_username: None,
            origin: Origin::Client,
            topic: "a/b".into(),
            payload: bytes::Bytes::from_static(b"x"),
            qos: QoS::ExactlyOnce,
            retain: false,
            properties: Vec::new(),
            message_expiry_time: 0,
        });
        store.ref_inc(db_id);
        let msg = crate::client_msg::ClientMsg::new(
            5,
            QoS::ExactlyOnce,
            false,
            crate::client_msg::Direction::Out,
            crate::client_msg::ClientMsgState::WaitPubcomp,
            db_id,
            1,
            0,
        );
        s1.msgs_out.inflight.push_back(msg);
        s1.msgs_out.msg_count = 1;

        registry.install_session(s1, &mut store, &mut NoopRouter, &mut NoopTimers, 0);

        let mut s2 = Session::new("c1".into(), ProtocolVersion::V5, limits);
        s2.clean_start = false;
        s2.msgs_out.inflight_maximum = 20;
        let outcome =
            registry.install_session(s2, &mut store, &mut NoopRouter, &mut NoopTimers, 0);
        assert!(outcome.session_present);

        let restored = registry.get("c1").unwrap();
        assert_eq!(restored.msgs_out.inflight.len(), 1);
        assert_eq!(
            restored.msgs_out.inflight.front().unwrap().state,
            crate::client_msg::ClientMsgState::ResendPubrel
        );
    }

    #[test]
    fn clean_start_drops_old_subscriptions() {
        let mut registry = SessionRegistry::new();
        let mut store = MessageStore::new();
        let limits = crate::queue::Limits::default();

        let mut s1 = Session::new("c1".into(), ProtocolVersion::V5, limits);
        s1.subscriptions.push("a/b".into());
        registry.install_session(s1, &mut store, &mut NoopRouter, &mut NoopTimers, 0);

        let mut s2 = Session::new("c1".into(), ProtocolVersion::V5, limits);
        s2.clean_start = true;
        let outcome =
            registry.install_session(s2, &mut store, &mut NoopRouter, &mut NoopTimers, 0);
        assert!(!outcome.session_present);
        assert!(registry.get("c1").unwrap().subscriptions.is_empty());
    }
}
