//! Record store interface and an in-memory implementation.
//!
//! The core writes derived records (messages, calls, friends, groups) here and
//! reads identities and groups back. It never waits on the store before a state
//! transition.

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use commsdk_protocol::types::{CallDirection, Group, Identity, Target};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RecordKind {
    Identity,
    Group,
    Message,
    Call,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageStatus {
    Pending,
    Sent,
    Delivered,
    Failed(String),
    Received,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: String,
    pub peer: Target,
    /// Sender for inbound messages, ourselves for outbound.
    pub sender: String,
    pub direction: CallDirection,
    pub text: String,
    pub media_key: Option<String>,
    pub encrypted: bool,
    pub status: MessageStatus,
    pub read: bool,
    /// Unix milliseconds.
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRecord {
    pub id: String,
    /// User id, group id or phone number.
    pub contact: String,
    pub direction: CallDirection,
    pub video: bool,
    pub missed: bool,
    pub duration_secs: u64,
    /// Unix milliseconds.
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Record {
    Identity(Identity),
    Group(Group),
    Message(MessageRecord),
    Call(CallRecord),
}

impl Record {
    pub fn kind(&self) -> RecordKind {
        match self {
            Record::Identity(_) => RecordKind::Identity,
            Record::Group(_) => RecordKind::Group,
            Record::Message(_) => RecordKind::Message,
            Record::Call(_) => RecordKind::Call,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Record::Identity(i) => &i.id,
            Record::Group(g) => &g.id,
            Record::Message(m) => &m.id,
            Record::Call(c) => &c.id,
        }
    }

    /// Sort key used by `query`. Identities and groups sort by id.
    fn sort_key(&self) -> (u64, &str) {
        match self {
            Record::Message(m) => (m.timestamp, &m.id),
            Record::Call(c) => (c.timestamp, &c.id),
            other => (0, other.id()),
        }
    }
}

/// Change notification for UI refresh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordChange {
    pub kind: RecordKind,
    pub id: String,
    pub removed: bool,
}

pub type RecordFilter<'a> = &'a dyn Fn(&Record) -> bool;

/// Persistent record store (CRUD + query).
pub trait RecordStore: Send + Sync {
    fn query(
        &self,
        kind: RecordKind,
        filter: RecordFilter<'_>,
        sort_ascending: bool,
        limit: Option<usize>,
    ) -> Vec<Record>;

    fn get(&self, kind: RecordKind, id: &str) -> Option<Record>;

    /// Insert or replace.
    fn put(&self, record: Record);

    fn delete(&self, kind: RecordKind, id: &str) -> bool;

    fn changes(&self) -> broadcast::Receiver<RecordChange>;
}

// ── Convenience lookups ───────────────────────────────────────────────

pub fn identity(store: &dyn RecordStore, id: &str) -> Option<Identity> {
    match store.get(RecordKind::Identity, id) {
        Some(Record::Identity(i)) => Some(i),
        _ => None,
    }
}

pub fn group(store: &dyn RecordStore, id: &str) -> Option<Group> {
    match store.get(RecordKind::Group, id) {
        Some(Record::Group(g)) => Some(g),
        _ => None,
    }
}

pub fn message(store: &dyn RecordStore, id: &str) -> Option<MessageRecord> {
    match store.get(RecordKind::Message, id) {
        Some(Record::Message(m)) => Some(m),
        _ => None,
    }
}

/// Identity whose address matches, case-insensitively.
pub fn identity_by_address(store: &dyn RecordStore, address: &str) -> Option<Identity> {
    let wanted = address.trim().to_lowercase();
    let matches_address = |r: &Record| match r {
        Record::Identity(i) => i
            .address
            .as_deref()
            .is_some_and(|a| a.to_lowercase() == wanted),
        _ => false,
    };
    store
        .query(RecordKind::Identity, &matches_address, true, Some(1))
        .into_iter()
        .find_map(|r| match r {
            Record::Identity(i) => Some(i),
            _ => None,
        })
}

// ── In-memory store ───────────────────────────────────────────────────

/// In-memory [`RecordStore`] for tests and hosts without persistence.
pub struct MemoryRecordStore {
    records: Mutex<BTreeMap<(RecordKind, String), Record>>,
    tx: broadcast::Sender<RecordChange>,
}

impl Default for MemoryRecordStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self {
            records: Mutex::new(BTreeMap::new()),
            tx,
        }
    }

    fn notify(&self, kind: RecordKind, id: String, removed: bool) {
        let _ = self.tx.send(RecordChange { kind, id, removed });
    }
}

impl RecordStore for MemoryRecordStore {
    fn query(
        &self,
        kind: RecordKind,
        filter: RecordFilter<'_>,
        sort_ascending: bool,
        limit: Option<usize>,
    ) -> Vec<Record> {
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        let mut out: Vec<Record> = records
            .iter()
            .filter_map(|((k, _), r)| (*k == kind && filter(r)).then(|| r.clone()))
            .collect();
        drop(records);

        out.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
        if !sort_ascending {
            out.reverse();
        }
        if let Some(limit) = limit {
            out.truncate(limit);
        }
        out
    }

    fn get(&self, kind: RecordKind, id: &str) -> Option<Record> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(kind, id.to_string()))
            .cloned()
    }

    fn put(&self, record: Record) {
        let kind = record.kind();
        let id = record.id().to_string();
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((kind, id.clone()), record);
        self.notify(kind, id, false);
    }

    fn delete(&self, kind: RecordKind, id: &str) -> bool {
        let removed = self
            .records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&(kind, id.to_string()))
            .is_some();
        if removed {
            self.notify(kind, id.to_string(), true);
        }
        removed
    }

    fn changes(&self) -> broadcast::Receiver<RecordChange> {
        self.tx.subscribe()
    }
}
