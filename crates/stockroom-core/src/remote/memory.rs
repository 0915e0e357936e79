//! In-process remote store

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::db::Query;
use crate::models::{
    ChangeKind, Document, DocumentChange, OperationKind, RemoteDocument, RemoteUpdate, Table,
    FIELD_UPDATED_AT,
};
use crate::util::timestamp_now;

use super::{owned_by, ChangeEvent, ChangeStream, RemoteError, RemoteResult, RemoteStore};

struct LogEntry {
    table: Table,
    remote_id: String,
    operation: OperationKind,
    changed_at: DateTime<Utc>,
    owner_snapshot: Document,
}

struct Subscriber {
    table: Table,
    owner_ids: Vec<String>,
    sender: mpsc::UnboundedSender<ChangeEvent>,
}

#[derive(Default)]
struct State {
    tables: HashMap<Table, BTreeMap<String, Document>>,
    log: Vec<LogEntry>,
    subscribers: Vec<Subscriber>,
    offline: bool,
    scripted_failures: VecDeque<RemoteError>,
    targeted_failures: HashMap<&'static str, VecDeque<RemoteError>>,
    calls: HashMap<&'static str, usize>,
}

impl State {
    fn check(&mut self, call: &'static str) -> RemoteResult<()> {
        *self.calls.entry(call).or_default() += 1;
        if self.offline {
            return Err(RemoteError::Unavailable("network is offline".into()));
        }
        let targeted = self
            .targeted_failures
            .get_mut(call)
            .and_then(VecDeque::pop_front);
        match targeted.or_else(|| self.scripted_failures.pop_front()) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn record(&mut self, table: Table, remote_id: &str, kind: ChangeKind, document: &Document) {
        let operation = match kind {
            ChangeKind::Added => OperationKind::Create,
            ChangeKind::Modified => OperationKind::Update,
            ChangeKind::Removed => OperationKind::Delete,
        };
        self.log.push(LogEntry {
            table,
            remote_id: remote_id.to_string(),
            operation,
            changed_at: Utc::now(),
            owner_snapshot: document.clone(),
        });

        let data = if kind == ChangeKind::Removed {
            Document::new()
        } else {
            document.clone()
        };
        let change = DocumentChange::new(kind, remote_id, data);
        self.subscribers.retain(|subscriber| {
            if subscriber.table != table || !owned_by(document, &subscriber.owner_ids) {
                return !subscriber.sender.is_closed();
            }
            subscriber
                .sender
                .send(ChangeEvent::Batch(vec![change.clone()]))
                .is_ok()
        });
    }
}

/// Remote store held in process memory.
///
/// Behaves like a hosted document store: ids are assigned on create, every write is
/// logged for `updates_since`, and subscribers receive an initial snapshot followed
/// by live changes. Test hooks can take the store offline or script failures.
#[derive(Default)]
pub struct InMemoryRemoteStore {
    state: Mutex<State>,
}

impl InMemoryRemoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Simulate losing (or regaining) the network.
    pub fn set_offline(&self, offline: bool) {
        self.state().offline = offline;
    }

    /// Make the next remote call fail with `error`.
    pub fn fail_next(&self, error: RemoteError) {
        self.state().scripted_failures.push_back(error);
    }

    /// Make the next attempt of `call` fail with `error`, leaving other calls alone.
    pub fn fail_next_call(&self, call: &'static str, error: RemoteError) {
        self.state()
            .targeted_failures
            .entry(call)
            .or_default()
            .push_back(error);
    }

    /// Number of times `call` (`create`, `update`, `delete`, `get`, `find`,
    /// `updates_since`, `subscribe`) was attempted.
    pub fn call_count(&self, call: &str) -> usize {
        self.state().calls.get(call).copied().unwrap_or(0)
    }

    /// Every document currently stored in `table`.
    pub fn documents(&self, table: Table) -> Vec<RemoteDocument> {
        self.state()
            .tables
            .get(&table)
            .map(|documents| {
                documents
                    .iter()
                    .map(|(remote_id, data)| RemoteDocument {
                        remote_id: remote_id.clone(),
                        data: data.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Deliver `changes` to subscribers of `table` as one batch, bypassing storage.
    pub fn push_batch(&self, table: Table, changes: Vec<DocumentChange>) {
        self.state().subscribers.retain(|subscriber| {
            if subscriber.table != table {
                return !subscriber.sender.is_closed();
            }
            subscriber
                .sender
                .send(ChangeEvent::Batch(changes.clone()))
                .is_ok()
        });
    }

    /// Fail every live subscription of `table`.
    pub fn break_subscriptions(&self, table: Table, message: &str) {
        self.state().subscribers.retain(|subscriber| {
            if subscriber.table == table {
                let _ = subscriber.sender.send(ChangeEvent::Error(RemoteError::Subscription(
                    message.to_string(),
                )));
                false
            } else {
                !subscriber.sender.is_closed()
            }
        });
    }

    /// Live subscriptions for `table`.
    pub fn subscriber_count(&self, table: Table) -> usize {
        self.state()
            .subscribers
            .iter()
            .filter(|subscriber| subscriber.table == table && !subscriber.sender.is_closed())
            .count()
    }
}

fn stamped(document: &Document) -> Document {
    let mut document = document.clone();
    if !document.contains_key(FIELD_UPDATED_AT) {
        document.insert(FIELD_UPDATED_AT.to_string(), timestamp_now());
    }
    document
}

#[async_trait]
impl RemoteStore for InMemoryRemoteStore {
    async fn create(&self, table: Table, document: &Document) -> RemoteResult<String> {
        let mut state = self.state();
        state.check("create")?;

        let remote_id = Uuid::now_v7().simple().to_string();
        let document = stamped(document);
        state
            .tables
            .entry(table)
            .or_default()
            .insert(remote_id.clone(), document.clone());
        state.record(table, &remote_id, ChangeKind::Added, &document);
        Ok(remote_id)
    }

    async fn update(
        &self,
        table: Table,
        remote_id: &str,
        document: &Document,
    ) -> RemoteResult<()> {
        let mut state = self.state();
        state.check("update")?;

        let Some(existing) = state
            .tables
            .get_mut(&table)
            .and_then(|documents| documents.get_mut(remote_id))
        else {
            return Err(RemoteError::NotFound(format!("{table}/{remote_id}")));
        };
        existing.extend(stamped(document));
        let merged = existing.clone();
        state.record(table, remote_id, ChangeKind::Modified, &merged);
        Ok(())
    }

    async fn delete(&self, table: Table, remote_id: &str) -> RemoteResult<()> {
        let mut state = self.state();
        state.check("delete")?;

        let removed = state
            .tables
            .get_mut(&table)
            .and_then(|documents| documents.remove(remote_id))
            .ok_or_else(|| RemoteError::NotFound(format!("{table}/{remote_id}")))?;
        state.record(table, remote_id, ChangeKind::Removed, &removed);
        Ok(())
    }

    async fn get(&self, table: Table, remote_id: &str) -> RemoteResult<Option<RemoteDocument>> {
        let mut state = self.state();
        state.check("get")?;

        Ok(state
            .tables
            .get(&table)
            .and_then(|documents| documents.get(remote_id))
            .map(|data| RemoteDocument {
                remote_id: remote_id.to_string(),
                data: data.clone(),
            }))
    }

    async fn find(&self, table: Table, query: &Query) -> RemoteResult<Vec<RemoteDocument>> {
        let mut state = self.state();
        state.check("find")?;

        Ok(state
            .tables
            .get(&table)
            .map(|documents| {
                documents
                    .iter()
                    .filter(|(_, data)| query.matches(data))
                    .map(|(remote_id, data)| RemoteDocument {
                        remote_id: remote_id.clone(),
                        data: data.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn updates_since(
        &self,
        since: DateTime<Utc>,
        owner_ids: &[String],
    ) -> RemoteResult<Vec<RemoteUpdate>> {
        let mut state = self.state();
        state.check("updates_since")?;

        let updates = state
            .log
            .iter()
            .filter(|entry| entry.changed_at > since && owned_by(&entry.owner_snapshot, owner_ids))
            .map(|entry| {
                let data = match entry.operation {
                    OperationKind::Delete => Document::new(),
                    _ => state
                        .tables
                        .get(&entry.table)
                        .and_then(|documents| documents.get(&entry.remote_id))
                        .cloned()
                        .unwrap_or_else(|| entry.owner_snapshot.clone()),
                };
                RemoteUpdate {
                    table: entry.table,
                    operation: entry.operation,
                    remote_id: entry.remote_id.clone(),
                    data,
                }
            })
            .collect();
        Ok(updates)
    }

    async fn subscribe(&self, table: Table, owner_ids: &[String]) -> RemoteResult<ChangeStream> {
        let mut state = self.state();
        *state.calls.entry("subscribe").or_default() += 1;
        if state.offline {
            return Err(RemoteError::Unavailable("network is offline".into()));
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        let snapshot: Vec<DocumentChange> = state
            .tables
            .get(&table)
            .map(|documents| {
                documents
                    .iter()
                    .filter(|(_, data)| owned_by(data, owner_ids))
                    .map(|(remote_id, data)| {
                        DocumentChange::new(ChangeKind::Added, remote_id.clone(), data.clone())
                    })
                    .collect()
            })
            .unwrap_or_default();
        if !snapshot.is_empty() {
            let _ = sender.send(ChangeEvent::Batch(snapshot));
        }

        state.subscribers.push(Subscriber {
            table,
            owner_ids: owner_ids.to_vec(),
            sender,
        });
        Ok(ChangeStream::new(receiver))
    }
}
