//! Content-addressed pool of published payloads with reference counts.
//!
//! The pool is owned by a single [`MessageStore`] value, an explicit context
//! rather than a singleton, and entries are referenced by `db_id` handles
//! rather than shared pointers, so no `Rc`/`Arc` bookkeeping leaks into
//! `ClientMsg`.

use std::collections::HashMap;

use bytes::Bytes;

use embermq_core::qos::QoS;

use crate::client_msg::Direction;
use crate::queue::MessageData;

/// Where a stored message originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Client,
    Broker,
}

/// Immutable (after creation) published payload, shared by reference count
/// across every `ClientMsg` currently delivering it.
#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub db_id: u64,
    pub source_id: String,
    pub source_username: Option<String>,
    pub origin: Origin,
    pub topic: String,
    payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    pub properties: Vec<(u32, Bytes)>,
    /// Absolute epoch seconds; 0 means no expiry.
    pub message_expiry_time: u64,
    ref_count: u32,
    /// Client ids already delivered to; suppresses duplicate delivery for
    /// overlapping subscriptions. Append-only.
    dest_ids: Vec<String>,
}

impl StoredMessage {
    /// Payload bytes, *not* including the broker's internal trailing zero
    /// byte guaranteed by [`MessageStore::add`] for safe C-string reads by
    /// integrators.
    pub fn payload(&self) -> &[u8] {
        &self.payload[..self.payload.len().saturating_sub(1)]
    }

    pub fn payload_len(&self) -> usize {
        self.payload().len()
    }

    pub fn ref_count(&self) -> u32 {
        self.ref_count
    }

    pub fn dest_ids(&self) -> &[String] {
        &self.dest_ids
    }

    pub fn has_been_delivered_to(&self, client_id: &str) -> bool {
        self.dest_ids.iter().any(|id| id == client_id)
    }
}

/// Process-wide (per-broker) pool of [`StoredMessage`]s, tracked by total
/// bytes and count.
#[derive(Debug, Default)]
pub struct MessageStore {
    entries: HashMap<u64, StoredMessage>,
    /// Insertion order, head-first; gives `compact`'s sweep a stable order.
    /// Not required for correctness.
    order: Vec<u64>,
    next_db_id: u64,
    pub total_bytes: u64,
    pub total_count: u64,
}

pub struct NewMessage {
    pub source_id: String,
    pub source_username: Option<String>,
    pub origin: Origin,
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    pub properties: Vec<(u32, Bytes)>,
    pub message_expiry_time: u64,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// `store_add`: push a newly published/synthesized message onto the
    /// pool and return its `db_id`. The monotonic counter is a 64-bit value
    /// for the broker's entire uptime — no 16-bit wraparound is permitted.
    pub fn add(&mut self, msg: NewMessage) -> u64 {
        self.next_db_id += 1;
        let db_id = self.next_db_id;

        let mut payload = msg.payload;
        // Guarantee a trailing zero byte for safe C-string reads downstream
        // without exposing it through `StoredMessage::payload()`.
        let mut buf = bytes::BytesMut::with_capacity(payload.len() + 1);
        buf.extend_from_slice(&payload);
        buf.extend_from_slice(&[0]);
        payload = buf.freeze();

        let payload_len = payload.len() as u64 - 1;

        let entry = StoredMessage {
            db_id,
            source_id: msg.source_id,
            source_username: msg.source_username,
            origin: msg.origin,
            topic: msg.topic,
            payload,
            qos: msg.qos,
            retain: msg.retain,
            properties: msg.properties,
            message_expiry_time: msg.message_expiry_time,
            ref_count: 0,
            dest_ids: Vec::new(),
        };

        self.total_bytes += payload_len;
        self.total_count += 1;
        self.order.push(db_id);
        self.entries.insert(db_id, entry);
        db_id
    }

    pub fn get(&self, db_id: u64) -> Option<&StoredMessage> {
        self.entries.get(&db_id)
    }

    pub fn get_mut(&mut self, db_id: u64) -> Option<&mut StoredMessage> {
        self.entries.get_mut(&db_id)
    }

    /// `store_ref_inc`.
    pub fn ref_inc(&mut self, db_id: u64) {
        if let Some(entry) = self.entries.get_mut(&db_id) {
            entry.ref_count += 1;
        }
    }

    /// `store_ref_dec`: on decrement-to-zero, remove and free.
    pub fn ref_dec(&mut self, db_id: u64) {
        let should_remove = match self.entries.get_mut(&db_id) {
            Some(entry) => {
                entry.ref_count = entry.ref_count.saturating_sub(1);
                entry.ref_count == 0
            }
            None => false,
        };
        if should_remove {
            self.remove(db_id);
        }
    }

    /// `store_remove`: unlink, decrement pool counters, free payload/topic/
    /// properties/dest-ids regardless of current `ref_count`.
    pub fn remove(&mut self, db_id: u64) {
        if let Some(entry) = self.entries.remove(&db_id) {
            self.total_bytes = self.total_bytes.saturating_sub(entry.payload_len() as u64);
            self.total_count = self.total_count.saturating_sub(1);
            self.order.retain(|id| *id != db_id);
        }
    }

    /// `store_compact`: sweep the pool, freeing any entry with `ref_count < 1`.
    pub fn compact(&mut self) {
        let dead: Vec<u64> = self
            .entries
            .iter()
            .filter(|(_, e)| e.ref_count < 1)
            .map(|(id, _)| *id)
            .collect();
        for id in dead {
            self.remove(id);
        }
    }

    /// `store_find_by_source_mid`: linear scan of the given session's
    /// inbound `inflight` then `queued` lists for the `ClientMsg` with this
    /// `mid`, returning the `StoredMessage` it references.
    pub fn find_by_source_mid(&self, msgs_in: &MessageData, mid: u16) -> Option<&StoredMessage> {
        let store_id = msgs_in
            .inflight
            .iter()
            .chain(msgs_in.queued.iter())
            .find(|m| m.direction == Direction::In && m.mid == mid)
            .map(|m| m.store_id)?;
        self.get(store_id)
    }

    pub fn append_dest_id(&mut self, db_id: u64, client_id: &str) {
        if let Some(entry) = self.entries.get_mut(&db_id) {
            if !entry.dest_ids.iter().any(|id| id == client_id) {
                entry.dest_ids.push(client_id.to_string());
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
