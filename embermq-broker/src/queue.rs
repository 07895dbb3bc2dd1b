//! Per-session message queues — the central subsystem of the broker message
//! plane. Implements QoS 0/1/2 bookkeeping with flow control: admission,
//! inflight/queued transitions, and release-on-ack.

use std::collections::VecDeque;

use embermq_core::qos::QoS;

use crate::client_msg::{ClientMsg, ClientMsgState, Direction};
use crate::error::{CoreError, CoreResult};
use crate::hooks::SendSink;
use crate::session::SessionKind;
use crate::store::{MessageStore, StoredMessage};

/// Per-session admission limits. `0` disables the corresponding half of an
/// admission conjunction.
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    pub max_inflight_bytes: u64,
    pub max_queued_messages: u32,
    pub max_queued_bytes: u64,
    pub queue_qos0_messages: bool,
    pub allow_duplicate_messages: bool,
}

impl Default for Limits {
    fn default() -> Self {
        Limits {
            max_inflight_bytes: 0,
            max_queued_messages: 100,
            max_queued_bytes: 0,
            queue_qos0_messages: false,
            allow_duplicate_messages: false,
        }
    }
}

/// Two of these exist per session — inbound and outbound — each owning its
/// own inflight/queued lists and counters.
#[derive(Debug)]
pub struct MessageData {
    pub direction: Direction,
    pub inflight: VecDeque<ClientMsg>,
    pub queued: VecDeque<ClientMsg>,
    pub msg_count: u32,
    pub msg_bytes: u64,
    pub msg_count12: u32,
    pub msg_bytes12: u64,
    /// 0 means unlimited.
    pub inflight_maximum: u32,
    /// Decreasing credit, replenished on terminal ack.
    pub inflight_quota: u32,
    /// Latched the first time a message is dropped for this direction so
    /// the drop is logged only once per dropping streak.
    pub is_dropping: bool,
}

impl MessageData {
    pub fn new(direction: Direction, inflight_maximum: u32) -> Self {
        MessageData {
            direction,
            inflight: VecDeque::new(),
            queued: VecDeque::new(),
            msg_count: 0,
            msg_bytes: 0,
            msg_count12: 0,
            msg_bytes12: 0,
            inflight_maximum,
            inflight_quota: inflight_maximum,
            is_dropping: false,
        }
    }

    fn account_add(&mut self, qos: QoS, payload_len: usize) {
        self.msg_count += 1;
        self.msg_bytes += payload_len as u64;
        if qos != QoS::AtMostOnce {
            self.msg_count12 += 1;
            self.msg_bytes12 += payload_len as u64;
        }
    }

    fn account_remove(&mut self, qos: QoS, payload_len: usize) {
        self.msg_count = self.msg_count.saturating_sub(1);
        self.msg_bytes = self.msg_bytes.saturating_sub(payload_len as u64);
        if qos != QoS::AtMostOnce {
            self.msg_count12 = self.msg_count12.saturating_sub(1);
            self.msg_bytes12 = self.msg_bytes12.saturating_sub(payload_len as u64);
        }
    }

    /// Can a new message be admitted into `inflight`?
    pub fn ready_for_flight(&self, limits: &Limits, qos: QoS, out_packet_count: u32) -> bool {
        if self.inflight_maximum == 0 && limits.max_inflight_bytes == 0 {
            return true;
        }

        if qos == QoS::AtMostOnce {
            if limits.max_queued_messages == 0 && limits.max_inflight_bytes == 0 {
                return true;
            }
            let valid_bytes = limits.max_inflight_bytes == 0
                || (self.msg_bytes as i64 - limits.max_inflight_bytes as i64)
                    < limits.max_queued_bytes as i64;
            let valid_count = if limits.max_queued_messages == 0 {
                true
            } else if self.direction == Direction::Out {
                out_packet_count < limits.max_queued_messages
            } else {
                (self.msg_count as i64 - self.inflight_maximum as i64)
                    < limits.max_queued_messages as i64
            };
            valid_bytes && valid_count
        } else {
            let valid_bytes =
                limits.max_inflight_bytes == 0 || self.msg_bytes12 < limits.max_inflight_bytes;
            let valid_count = self.inflight_maximum == 0 || self.inflight_quota > 0;
            valid_bytes && valid_count
        }
    }

    /// Called once `ready_for_flight` returned false: can this message join
    /// the queued list instead of being dropped?
    pub fn ready_for_queue(&self, limits: &Limits, qos: QoS, online: bool) -> bool {
        if qos == QoS::AtMostOnce && !limits.queue_qos0_messages {
            return false;
        }
        if limits.max_queued_messages == 0 && limits.max_queued_bytes == 0 {
            return false;
        }

        let (adjust_bytes, adjust_count) = if online {
            (limits.max_inflight_bytes, self.inflight_maximum)
        } else {
            (0, 0)
        };

        let source_bytes = self.msg_bytes;
        let source_count = self.msg_count;

        let valid_bytes = limits.max_queued_bytes == 0
            || (source_bytes as i64 - adjust_bytes as i64) < limits.max_queued_bytes as i64;
        let valid_count = limits.max_queued_messages == 0
            || (source_count as i64 - adjust_count as i64) < limits.max_queued_messages as i64;

        valid_bytes && valid_count
    }

    fn push_inflight(&mut self, msg: ClientMsg) {
        self.account_add(msg.qos, msg.payload_len);
        self.inflight.push_back(msg);
    }

    fn push_queued(&mut self, msg: ClientMsg) {
        self.account_add(msg.qos, msg.payload_len);
        self.queued.push_back(msg);
    }

    /// Promote up to `inflight_maximum - inflight.len()` queued entries into
    /// `inflight`, FIFO, stamping `timestamp` and the per-direction/QoS send
    /// state. Returns the number promoted.
    fn promote_queued(&mut self, now: u64) -> u32 {
        let capacity = if self.inflight_maximum == 0 {
            self.queued.len() as u32
        } else {
            self.inflight_maximum
                .saturating_sub(self.inflight.len() as u32)
        };

        let mut promoted = 0;
        while promoted < capacity {
            let Some(mut msg) = self.queued.pop_front() else {
                break;
            };
            msg.timestamp = now;
            msg.state = match (msg.direction, msg.qos) {
                (Direction::Out, QoS::AtMostOnce) => ClientMsgState::PublishQoS0,
                (Direction::Out, QoS::AtLeastOnce) => ClientMsgState::PublishQoS1,
                (Direction::Out, QoS::ExactlyOnce) => ClientMsgState::PublishQoS2,
                (Direction::In, _) => ClientMsgState::WaitPubrel,
                _ => ClientMsgState::Invalid,
            };
            self.inflight.push_back(msg);
            promoted += 1;
        }
        promoted
    }
}

/// Outcome of [`message_insert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// Inserted (inflight or queued), or silently suppressed as a duplicate.
    Accepted,
    /// Protocol error: inbound QoS 0/1 with nowhere sane to go.
    ProtocolError,
    /// Queued, or dropped for lack of room / offline policy.
    QueuedOrDropped,
}

pub struct InsertParams<'a> {
    pub client_id: &'a str,
    pub mid: u16,
    pub direction: Direction,
    pub qos: QoS,
    pub retain: bool,
    pub store_id: u64,
    pub properties: Vec<(u32, bytes::Bytes)>,
    /// If true and `direction == Out`, drain the just-inserted message
    /// immediately via `write_inflight_out_latest`.
    pub update: bool,
    pub online: bool,
    pub is_mqtt5: bool,
    pub max_qos: QoS,
    pub out_packet_count: u32,
    pub now: u64,
    /// Drives both halves of the offline policy (step 2) and the bridge-wake
    /// check (step 6): an ordinary session, a lazy bridge (exempt from the
    /// qos-0 offline drop, woken once enough traffic queues up) or a bridge
    /// configured `clean_start_local` (always dropped while offline).
    pub session_kind: SessionKind,
}

/// Result of [`message_insert`]: the admission outcome plus whether this
/// insert just crossed a lazy bridge's reconnect threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InsertResult {
    pub outcome: InsertOutcome,
    /// Set once outbound `msg_count` for an offline lazy bridge reaches
    /// `reconnect_threshold`. The embedder is responsible for actually
    /// initiating the bridge reconnect.
    pub lazy_reconnect: bool,
}

/// Insert a message into a session's inbound or outbound queue, running it
/// through admission control, duplicate suppression and flow-control quota.
/// `msgs` is the `MessageData` for `params.direction` on the target
/// session; `store` owns the referenced [`StoredMessage`].
pub fn message_insert(
    msgs: &mut MessageData,
    limits: &Limits,
    store: &mut MessageStore,
    params: InsertParams<'_>,
    sink: &mut dyn SendSink,
) -> CoreResult<InsertResult> {
    let stored = store.get(params.store_id).ok_or(CoreError::Inval)?;

    // Step 1: duplicate suppression (outbound only).
    if params.direction == Direction::Out
        && !params.is_mqtt5
        && !limits.allow_duplicate_messages
        && !params.retain
        && stored.has_been_delivered_to(params.client_id)
    {
        return Ok(InsertResult {
            outcome: InsertOutcome::Accepted,
            lazy_reconnect: false,
        });
    }

    // Step 2: offline policy.
    if !params.online {
        let is_lazy_bridge = matches!(params.session_kind, SessionKind::LazyBridge { .. });
        let is_clean_start_local_bridge =
            matches!(params.session_kind, SessionKind::BridgeCleanStartLocal);

        // A bridge configured clean_start_local never accumulates state
        // while offline, regardless of QoS.
        if is_clean_start_local_bridge {
            msgs.is_dropping = true;
            return Ok(InsertResult {
                outcome: InsertOutcome::QueuedOrDropped,
                lazy_reconnect: false,
            });
        }

        // A lazy bridge is exempt from the ordinary qos-0 offline drop: it
        // stays queued until the bridge reconnects.
        if params.qos == QoS::AtMostOnce && !limits.queue_qos0_messages && !is_lazy_bridge {
            msgs.is_dropping = true;
            return Ok(InsertResult {
                outcome: InsertOutcome::QueuedOrDropped,
                lazy_reconnect: false,
            });
        }
    }

    let payload_len = stored.payload_len();

    // Step 3: state selection.
    let (target_state, goes_to_inflight) = if params.online
        && msgs.ready_for_flight(limits, params.qos, params.out_packet_count)
    {
        match params.direction {
            Direction::Out => {
                let state = match params.qos {
                    QoS::AtMostOnce => ClientMsgState::PublishQoS0,
                    QoS::AtLeastOnce => ClientMsgState::PublishQoS1,
                    QoS::ExactlyOnce => ClientMsgState::PublishQoS2,
                    QoS::Invalid => {
                        return Ok(InsertResult {
                            outcome: InsertOutcome::ProtocolError,
                            lazy_reconnect: false,
                        })
                    }
                };
                (state, true)
            }
            Direction::In => {
                if params.qos == QoS::ExactlyOnce {
                    (ClientMsgState::WaitPubrel, true)
                } else {
                    return Ok(InsertResult {
                        outcome: InsertOutcome::ProtocolError,
                        lazy_reconnect: false,
                    });
                }
            }
        }
    } else if (params.online && params.qos != QoS::AtMostOnce || !params.online)
        && msgs.ready_for_queue(limits, params.qos, params.online)
    {
        // Online: only qos>=1 may queue (qos0 either flies immediately or
        // drops). Offline: qos0 may still queue, gated solely by
        // `ready_for_queue`'s own `queue_qos0_messages` check.
        (ClientMsgState::Queued, false)
    } else {
        // Drop: increment dropped counter, latch is_dropping.
        msgs.is_dropping = true;
        return Ok(InsertResult {
            outcome: InsertOutcome::QueuedOrDropped,
            lazy_reconnect: false,
        });
    };

    // Step 4: allocate, cap QoS, append, update counters.
    store.ref_inc(params.store_id);
    let capped_qos = if (params.qos as u8) > (params.max_qos as u8) {
        params.max_qos
    } else {
        params.qos
    };
    let mut msg = ClientMsg::new(
        params.mid,
        capped_qos,
        params.retain,
        params.direction,
        target_state,
        params.store_id,
        payload_len,
        params.now,
    );
    msg.properties = params.properties;

    if goes_to_inflight {
        msgs.push_inflight(msg);
    } else {
        msgs.push_queued(msg);
    }
    msgs.is_dropping = false;

    // Step 5: duplicate-tracking.
    if params.direction == Direction::Out && !params.retain && !limits.allow_duplicate_messages {
        store.append_dest_id(params.store_id, params.client_id);
    }

    // Step 7: quota.
    if params.direction == Direction::Out && params.qos != QoS::AtMostOnce {
        if msgs.inflight_quota > 0 {
            msgs.inflight_quota -= 1;
        }
    }

    // Step 6: bridge wake. A lazy bridge offline with enough outbound
    // traffic queued up asks to be reconnected.
    let lazy_reconnect = !params.online
        && params.direction == Direction::Out
        && matches!(
            params.session_kind,
            SessionKind::LazyBridge { reconnect_threshold } if msgs.msg_count >= reconnect_threshold
        );

    // Step 8: write-through.
    if params.direction == Direction::Out && params.update {
        write_inflight_out_latest(msgs, store, params.now, sink)?;
    }

    Ok(InsertResult {
        outcome: InsertOutcome::Accepted,
        lazy_reconnect,
    })
}

/// Walk outbound `inflight`, remove the entry matching `mid`, then promote
/// queued entries to fill the gap.
pub fn message_delete_outgoing(
    msgs: &mut MessageData,
    store: &mut MessageStore,
    mid: u16,
    expect_state: ClientMsgState,
    qos: QoS,
    now: u64,
    sink: &mut dyn SendSink,
) -> CoreResult<()> {
    let pos = msgs
        .inflight
        .iter()
        .position(|m| m.mid == mid)
        .ok_or(CoreError::NotFound)?;

    {
        let entry = &msgs.inflight[pos];
        if entry.qos != qos {
            return Err(CoreError::Protocol);
        }
        if qos == QoS::ExactlyOnce && entry.state != expect_state {
            return Err(CoreError::Protocol);
        }
    }

    let entry = msgs.inflight.remove(pos).expect("checked by position");
    msgs.account_remove(entry.qos, entry.payload_len);
    store.ref_dec(entry.store_id);
    if entry.qos != QoS::AtMostOnce {
        if msgs.inflight_maximum == 0 || msgs.inflight_quota < msgs.inflight_maximum {
            msgs.inflight_quota += 1;
        }
    }

    msgs.promote_queued(now);
    write_inflight_out_latest(msgs, store, now, sink)
}

/// Release an inbound QoS 2 exchange once the PUBLISH has been routed (or
/// found to have no subscribers).
///
/// The caller supplies the routing outcome (performed via
/// [`crate::hooks::SubscribeRouter`] outside this function, since routing
/// needs the subscription hierarchy which is out of scope for this crate).
pub fn message_release_incoming(
    msgs: &mut MessageData,
    store: &mut MessageStore,
    mid: u16,
    routed: bool,
    now: u64,
    sink: &mut dyn SendSink,
) -> CoreResult<()> {
    let pos = msgs
        .inflight
        .iter()
        .position(|m| m.mid == mid && m.direction == Direction::In)
        .ok_or(CoreError::NotFound)?;

    {
        let entry = &msgs.inflight[pos];
        let stored = store.get(entry.store_id).ok_or(CoreError::Inval)?;
        if stored.qos != QoS::ExactlyOnce {
            return Err(CoreError::Protocol);
        }
    }

    if routed {
        let entry = msgs.inflight.remove(pos).expect("checked by position");
        msgs.account_remove(entry.qos, entry.payload_len);
        store.ref_dec(entry.store_id);
    }

    // Promote waiting QoS 2 inbounds, sending PUBREC for each as it moves
    // from `Queued` to `WaitPubrel`.
    let before = msgs.inflight.len();
    msgs.promote_queued(now);
    let promoted_mids: Vec<u16> = msgs
        .inflight
        .iter()
        .skip(before)
        .map(|m| m.mid)
        .collect();
    for mid in promoted_mids {
        sink.send_pubrec(mid)?;
    }
    Ok(())
}

/// Drop every inflight/queued entry whose stored message fails `permitted`,
/// releasing its store reference and re-accounting the list. Used after a
/// session takeover to re-evaluate ACLs against a stolen identity's queue:
/// the new connection's `client_id`/`username` may not be authorized for
/// topics the old connection was.
pub fn retain_acl_permitted(
    msgs: &mut MessageData,
    store: &mut MessageStore,
    mut permitted: impl FnMut(&StoredMessage) -> bool,
) {
    let mut removed = Vec::new();

    for list in [&mut msgs.inflight, &mut msgs.queued] {
        let mut i = 0;
        while i < list.len() {
            let keep = store
                .get(list[i].store_id)
                .map(|stored| permitted(stored))
                .unwrap_or(false);
            if keep {
                i += 1;
            } else {
                removed.push(list.remove(i).expect("index in bounds"));
            }
        }
    }

    for entry in removed {
        msgs.account_remove(entry.qos, entry.payload_len);
        store.ref_dec(entry.store_id);
    }
}

/// Reset counters and state across a takeover. `outgoing` selects outbound
/// vs inbound semantics.
pub fn reconnect_reset(msgs: &mut MessageData, limits: &Limits, outgoing: bool, now: u64) {
    msgs.msg_count = 0;
    msgs.msg_bytes = 0;
    msgs.msg_count12 = 0;
    msgs.msg_bytes12 = 0;
    msgs.is_dropping = false;
    msgs.inflight_quota = msgs.inflight_maximum;
    let _ = limits;

    if outgoing {
        let old_inflight: Vec<ClientMsg> = msgs.inflight.drain(..).collect();
        for mut msg in old_inflight {
            msg.state = match msg.state {
                // Preserve QoS 2 exchanges already past PUBREC.
                ClientMsgState::WaitPubcomp => ClientMsgState::ResendPubrel,
                _ => match msg.qos {
                    QoS::AtMostOnce => ClientMsgState::PublishQoS0,
                    QoS::AtLeastOnce => ClientMsgState::PublishQoS1,
                    QoS::ExactlyOnce => ClientMsgState::PublishQoS2,
                    QoS::Invalid => ClientMsgState::Invalid,
                },
            };
            msgs.account_add(msg.qos, msg.payload_len);
            msgs.inflight.push_back(msg);
        }
        let queued: Vec<ClientMsg> = msgs.queued.drain(..).collect();
        for msg in queued {
            msgs.account_add(msg.qos, msg.payload_len);
            msgs.queued.push_back(msg);
        }
    } else {
        let old_inflight: Vec<ClientMsg> = msgs.inflight.drain(..).collect();
        for msg in old_inflight {
            // QoS < 2 inbound in-flight is safe for the client to retry; keep QoS 2.
            if msg.qos == QoS::ExactlyOnce {
                msgs.account_add(msg.qos, msg.payload_len);
                msgs.inflight.push_back(msg);
            }
        }
        let queued: Vec<ClientMsg> = msgs.queued.drain(..).collect();
        for msg in queued {
            msgs.account_add(msg.qos, msg.payload_len);
            msgs.queued.push_back(msg);
        }
    }

    msgs.promote_queued(now);
}

/// `write_inflight_out_all`: send every outbound inflight entry in order.
/// A no-op when `active` is false or the socket is offline.
pub fn write_inflight_out_all(
    msgs: &mut MessageData,
    store: &MessageStore,
    active: bool,
    online: bool,
    now: u64,
    sink: &mut dyn SendSink,
) -> CoreResult<()> {
    if !active || !online {
        return Ok(());
    }
    let mids: Vec<u16> = msgs.inflight.iter().map(|m| m.mid).collect();
    for mid in mids {
        write_by_mid(msgs, store, mid, now, sink)?;
    }
    Ok(())
}

/// `write_inflight_out_latest`: flush only the most recently inserted run of
/// `Publish*` entries, walking backward from the tail past any state that's
/// waiting on the peer, then forward from there. Short-circuits for a
/// singleton list.
pub fn write_inflight_out_latest(
    msgs: &mut MessageData,
    store: &MessageStore,
    now: u64,
    sink: &mut dyn SendSink,
) -> CoreResult<()> {
    if msgs.inflight.len() <= 1 {
        if let Some(mid) = msgs.inflight.back().map(|m| m.mid) {
            return write_by_mid(msgs, store, mid, now, sink);
        }
        return Ok(());
    }

    let mut start = msgs.inflight.len();
    for (idx, msg) in msgs.inflight.iter().enumerate().rev() {
        if matches!(
            msg.state,
            ClientMsgState::PublishQoS0 | ClientMsgState::PublishQoS1 | ClientMsgState::PublishQoS2
        ) {
            start = idx;
        } else {
            break;
        }
    }

    let mids: Vec<u16> = msgs
        .inflight
        .iter()
        .skip(start)
        .map(|m| m.mid)
        .collect();
    for mid in mids {
        write_by_mid(msgs, store, mid, now, sink)?;
    }
    Ok(())
}

fn write_by_mid(
    msgs: &mut MessageData,
    store: &MessageStore,
    mid: u16,
    now: u64,
    sink: &mut dyn SendSink,
) -> CoreResult<()> {
    let Some(pos) = msgs.inflight.iter().position(|m| m.mid == mid) else {
        return Ok(());
    };
    let Some(stored) = store.get(msgs.inflight[pos].store_id).cloned() else {
        return Ok(());
    };
    write_inflight_out_single(msgs, pos, &stored, now, sink)
}

/// `write_inflight_out_single`: send (or expire) one outbound entry.
///
/// `now` and `message_expiry_time` (0 = never) decide expiry first; a
/// message past its expiry is dropped and the QoS≥1 quota returned.
pub fn write_inflight_out_single(
    msgs: &mut MessageData,
    pos: usize,
    stored: &StoredMessage,
    now: u64,
    sink: &mut dyn SendSink,
) -> CoreResult<()> {
    if stored.message_expiry_time != 0 && now > stored.message_expiry_time {
        let entry = msgs.inflight.remove(pos).expect("valid position");
        msgs.account_remove(entry.qos, entry.payload_len);
        if entry.qos != QoS::AtMostOnce
            && (msgs.inflight_maximum == 0 || msgs.inflight_quota < msgs.inflight_maximum)
        {
            msgs.inflight_quota += 1;
        }
        return Ok(());
    }

    let state = msgs.inflight[pos].state;
    match state {
        ClientMsgState::PublishQoS0 => {
            let result = sink.send_publish(&msgs.inflight[pos], stored);
            match result {
                Ok(()) => {
                    let entry = msgs.inflight.remove(pos).expect("valid position");
                    msgs.account_remove(entry.qos, entry.payload_len);
                }
                Err(CoreError::OversizePacket) => {
                    let entry = msgs.inflight.remove(pos).expect("valid position");
                    msgs.account_remove(entry.qos, entry.payload_len);
                }
                Err(e) => return Err(e),
            }
        }
        ClientMsgState::PublishQoS1 => match sink.send_publish(&msgs.inflight[pos], stored) {
            Ok(()) => {
                msgs.inflight[pos].state = ClientMsgState::WaitPuback;
                msgs.inflight[pos].dup = true;
                msgs.inflight[pos].timestamp = now;
            }
            Err(CoreError::OversizePacket) => {
                let entry = msgs.inflight.remove(pos).expect("valid position");
                msgs.account_remove(entry.qos, entry.payload_len);
            }
            Err(e) => return Err(e),
        },
        ClientMsgState::PublishQoS2 => match sink.send_publish(&msgs.inflight[pos], stored) {
            Ok(()) => {
                msgs.inflight[pos].state = ClientMsgState::WaitPubrec;
                msgs.inflight[pos].dup = true;
            }
            Err(CoreError::OversizePacket) => {
                let entry = msgs.inflight.remove(pos).expect("valid position");
                msgs.account_remove(entry.qos, entry.payload_len);
            }
            Err(e) => return Err(e),
        },
        ClientMsgState::ResendPubrel => {
            sink.send_pubrel(msgs.inflight[pos].mid)?;
            msgs.inflight[pos].state = ClientMsgState::WaitPubcomp;
        }
        _ => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    struct NullSink;
    impl SendSink for NullSink {
        fn send_publish(&mut self, _: &ClientMsg, _: &StoredMessage) -> CoreResult<()> {
            Ok(())
        }
        fn send_pubrec(&mut self, _: u16) -> CoreResult<()> {
            Ok(())
        }
        fn send_pubrel(&mut self, _: u16) -> CoreResult<()> {
            Ok(())
        }
        fn send_puback(&mut self, _: u16) -> CoreResult<()> {
            Ok(())
        }
        fn send_pubcomp(&mut self, _: u16) -> CoreResult<()> {
            Ok(())
        }
        fn send_connack(
            &mut self,
            _: bool,
            _: embermq_core::reason::ReasonCode,
        ) -> CoreResult<()> {
            Ok(())
        }
        fn send_auth(&mut self, _: embermq_core::reason::ReasonCode) -> CoreResult<()> {
            Ok(())
        }
    }

    fn store_with_message(store: &mut MessageStore) -> u64 {
        store.add(crate::store::NewMessage {
            source_id: "pub".into(),
            source_username: None,
            origin: crate::store::Origin::Client,
            topic: "a/b".into(),
            payload: Bytes::from_static(b"hello"),
            qos: QoS::AtLeastOnce,
            retain: false,
            properties: Vec::new(),
            message_expiry_time: 0,
        })
    }

    fn insert(
        msgs: &mut MessageData,
        limits: &Limits,
        store: &mut MessageStore,
        mid: u16,
        store_id: u64,
        online: bool,
        out_packet_count: u32,
    ) -> InsertOutcome {
        message_insert(
            msgs,
            limits,
            store,
            InsertParams {
                client_id: "sub",
                mid,
                direction: Direction::Out,
                qos: QoS::AtLeastOnce,
                retain: false,
                store_id,
                properties: Vec::new(),
                update: false,
                online,
                is_mqtt5: false,
                max_qos: QoS::ExactlyOnce,
                out_packet_count,
                now: 0,
                session_kind: SessionKind::Normal,
            },
            &mut NullSink,
        )
        .unwrap()
        .outcome
    }

    #[test]
    fn qos1_roundtrip() {
        let mut store = MessageStore::new();
        let id = store_with_message(&mut store);
        let limits = Limits::default();
        let mut msgs = MessageData::new(Direction::Out, 20);

        let outcome = insert(&mut msgs, &limits, &mut store, 1, id, true, 0);
        assert_eq!(outcome, InsertOutcome::Accepted);
        assert_eq!(msgs.msg_count, 1);
        assert_eq!(msgs.inflight.len(), 1);

        message_delete_outgoing(
            &mut msgs,
            &mut store,
            1,
            ClientMsgState::WaitPuback,
            QoS::AtLeastOnce,
            0,
            &mut NullSink,
        )
        .unwrap();
        assert_eq!(msgs.msg_count, 0);
        assert_eq!(store.get(id), None);
    }

    #[test]
    fn backpressure_promotion() {
        let mut store = MessageStore::new();
        let limits = Limits {
            max_queued_messages: 3,
            ..Limits::default()
        };
        let mut msgs = MessageData::new(Direction::Out, 2);

        let mut ids = Vec::new();
        for i in 1..=5u16 {
            let id = store_with_message(&mut store);
            ids.push((i, id));
            let outcome = insert(&mut msgs, &limits, &mut store, i, id, true, msgs.msg_count);
            if i <= 2 {
                assert_eq!(outcome, InsertOutcome::Accepted);
            } else {
                assert_eq!(outcome, InsertOutcome::Accepted);
            }
        }
        assert_eq!(msgs.inflight.len(), 2);
        assert_eq!(msgs.queued.len(), 3);

        // Sixth message should be dropped (queue full).
        let id6 = store_with_message(&mut store);
        let outcome = insert(&mut msgs, &limits, &mut store, 6, id6, true, msgs.msg_count);
        assert_eq!(outcome, InsertOutcome::QueuedOrDropped);
        assert!(msgs.is_dropping);

        message_delete_outgoing(
            &mut msgs,
            &mut store,
            1,
            ClientMsgState::WaitPuback,
            QoS::AtLeastOnce,
            0,
            &mut NullSink,
        )
        .unwrap();
        assert_eq!(msgs.inflight.len(), 2);
        assert_eq!(msgs.queued.len(), 2);
        let _ = ids;
    }

    #[test]
    fn takeover_preserves_qos2_exchange_progress() {
        let mut store = MessageStore::new();
        let id = store_with_message(&mut store);
        let limits = Limits::default();
        let mut msgs = MessageData::new(Direction::Out, 20);
        store.ref_inc(id);
        let mut msg = ClientMsg::new(
            9,
            QoS::ExactlyOnce,
            false,
            Direction::Out,
            ClientMsgState::WaitPubcomp,
            id,
            store.get(id).unwrap().payload_len(),
            0,
        );
        msg.dup = false;
        msgs.push_inflight(msg);

        reconnect_reset(&mut msgs, &limits, true, 0);

        let restored = msgs.inflight.front().unwrap();
        assert_eq!(restored.state, ClientMsgState::ResendPubrel);
    }

    #[test]
    fn inflight_maximum_zero_with_bytes_limit_governs_by_bytes() {
        let limits = Limits {
            max_inflight_bytes: 10,
            max_queued_messages: 0,
            max_queued_bytes: 0,
            ..Limits::default()
        };
        let msgs = MessageData::new(Direction::Out, 0);
        assert!(msgs.ready_for_flight(&limits, QoS::AtLeastOnce, 0));
    }

    #[test]
    fn expired_message_is_dropped_at_send_and_quota_returned() {
        let mut store = MessageStore::new();
        let id = store.add(crate::store::NewMessage {
            source_id: "pub".into(),
            source_username: None,
            origin: crate::store::Origin::Client,
            topic: "a/b".into(),
            payload: Bytes::from_static(b"x"),
            qos: QoS::AtLeastOnce,
            retain: false,
            properties: Vec::new(),
            message_expiry_time: 2,
        });
        store.ref_inc(id);

        let mut msgs = MessageData::new(Direction::Out, 10);
        let mut msg = ClientMsg::new(
            1,
            QoS::AtLeastOnce,
            false,
            Direction::Out,
            ClientMsgState::PublishQoS1,
            id,
            store.get(id).unwrap().payload_len(),
            0,
        );
        msg.timestamp = 0;
        msgs.push_inflight(msg);
        msgs.inflight_quota = msgs.inflight_quota.saturating_sub(1);

        let quota_before = msgs.inflight_quota;
        let stored = store.get(id).unwrap().clone();
        write_inflight_out_single(&mut msgs, 0, &stored, 3, &mut NullSink).unwrap();

        assert!(msgs.inflight.is_empty());
        assert_eq!(msgs.msg_count12, 0);
        assert_eq!(msgs.inflight_quota, quota_before + 1);
    }

    fn insert_qos0(
        msgs: &mut MessageData,
        limits: &Limits,
        store: &mut MessageStore,
        store_id: u64,
        session_kind: SessionKind,
    ) -> InsertResult {
        message_insert(
            msgs,
            limits,
            store,
            InsertParams {
                client_id: "bridge",
                mid: 1,
                direction: Direction::Out,
                qos: QoS::AtMostOnce,
                retain: false,
                store_id,
                properties: Vec::new(),
                update: false,
                online: false,
                is_mqtt5: false,
                max_qos: QoS::ExactlyOnce,
                out_packet_count: 0,
                now: 0,
                session_kind,
            },
            &mut NullSink,
        )
        .unwrap()
    }

    #[test]
    fn lazy_bridge_is_exempt_from_qos0_offline_drop() {
        // `queue_qos0_messages` has to be on for the exemption to have any
        // observable effect: `ready_for_queue` itself refuses qos0 whenever
        // it's off, for every session kind, so step 2's early drop is the
        // only place a lazy bridge and an ordinary session can diverge.
        let mut store = MessageStore::new();
        let id = store_with_message(&mut store);
        let limits = Limits {
            queue_qos0_messages: true,
            ..Limits::default()
        };
        let mut msgs = MessageData::new(Direction::Out, 20);

        let result = insert_qos0(
            &mut msgs,
            &limits,
            &mut store,
            id,
            SessionKind::LazyBridge {
                reconnect_threshold: 10,
            },
        );
        assert_eq!(result.outcome, InsertOutcome::Accepted);
        assert_eq!(msgs.queued.len(), 1);
    }

    #[test]
    fn ordinary_offline_session_drops_qos0() {
        let mut store = MessageStore::new();
        let id = store_with_message(&mut store);
        let limits = Limits::default();
        let mut msgs = MessageData::new(Direction::Out, 20);

        let result = insert_qos0(&mut msgs, &limits, &mut store, id, SessionKind::Normal);
        assert_eq!(result.outcome, InsertOutcome::QueuedOrDropped);
        assert!(msgs.is_dropping);
    }

    #[test]
    fn clean_start_local_bridge_always_drops_while_offline() {
        let mut store = MessageStore::new();
        let id = store_with_message(&mut store);
        let limits = Limits {
            queue_qos0_messages: true,
            ..Limits::default()
        };
        let mut msgs = MessageData::new(Direction::Out, 20);

        let result = insert_qos0(
            &mut msgs,
            &limits,
            &mut store,
            id,
            SessionKind::BridgeCleanStartLocal,
        );
        assert_eq!(result.outcome, InsertOutcome::QueuedOrDropped);
        assert!(msgs.is_dropping);
    }

    #[test]
    fn lazy_bridge_wakes_once_threshold_reached() {
        let mut store = MessageStore::new();
        let limits = Limits::default();
        let mut msgs = MessageData::new(Direction::Out, 20);

        let mut last = InsertResult {
            outcome: InsertOutcome::Accepted,
            lazy_reconnect: false,
        };
        for i in 1..=3u16 {
            let id = store_with_message(&mut store);
            last = message_insert(
                &mut msgs,
                &limits,
                &mut store,
                InsertParams {
                    client_id: "bridge",
                    mid: i,
                    direction: Direction::Out,
                    qos: QoS::AtLeastOnce,
                    retain: false,
                    store_id: id,
                    properties: Vec::new(),
                    update: false,
                    online: false,
                    is_mqtt5: false,
                    max_qos: QoS::ExactlyOnce,
                    out_packet_count: 0,
                    now: 0,
                    session_kind: SessionKind::LazyBridge {
                        reconnect_threshold: 3,
                    },
                },
                &mut NullSink,
            )
            .unwrap();
        }
        assert!(last.lazy_reconnect);
    }
}
