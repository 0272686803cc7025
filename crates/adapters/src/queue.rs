//! In-memory message broker resource manager
//!
//! A broker owns named FIFO queues. A `QueueSession` sends and receives on
//! them and is the `ResourceAdapter` the coordinator drives.
//!
//! Inside a transaction:
//! - sent messages are held by the session and published on commit
//! - received messages are removed from the queue immediately and
//!   acknowledged on commit; rollback puts them back at the head of their
//!   queue, in original order, flagged `redelivered`
//!
//! Outside a transaction sends publish at once and receives acknowledge at
//! once. A session whose transaction ended refuses both with
//! `QueueError::TransactionEnded` until it is `reset` or enlisted again.

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;
use xact_core::{
    AdapterError, AdapterResult, Capability, ResourceAdapter, ResourceId, TransactionId, Vote,
};

/// A message on a queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Broker-wide message id, assigned on publish
    pub id: u64,
    /// Queue the message was published to
    pub queue: String,
    /// Payload
    pub body: String,
    /// True once the message has been returned by a rollback
    pub redelivered: bool,
}

/// Queue operation errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueueError {
    /// No queue with this name was declared
    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    /// The session's transaction is prepared; no further operations
    #[error("Session {0} is prepared and accepts no further operations")]
    Prepared(ResourceId),

    /// The session's transaction already ended
    #[error("Session {resource} belongs to ended transaction {txn}")]
    TransactionEnded {
        /// Session
        resource: ResourceId,
        /// Transaction that ended
        txn: TransactionId,
    },
}

struct BrokerInner {
    name: String,
    queues: Mutex<HashMap<String, VecDeque<Message>>>,
    available: Condvar,
    next_message: AtomicU64,
    next_session: AtomicU64,
}

impl BrokerInner {
    fn publish_all(&self, messages: Vec<(String, String)>) -> Result<Vec<u64>, QueueError> {
        let mut queues = self.queues.lock();
        if let Some((queue, _)) = messages.iter().find(|(q, _)| !queues.contains_key(q)) {
            return Err(QueueError::QueueNotFound(queue.clone()));
        }
        let mut ids = Vec::with_capacity(messages.len());
        for (queue, body) in messages {
            let id = self.next_message.fetch_add(1, Ordering::Relaxed);
            if let Some(q) = queues.get_mut(&queue) {
                q.push_back(Message {
                    id,
                    queue,
                    body,
                    redelivered: false,
                });
                ids.push(id);
            }
        }
        drop(queues);
        self.available.notify_all();
        Ok(ids)
    }

    /// Put an undelivered message back at the head of its queue, unchanged
    fn restore(&self, message: Message) {
        self.queues
            .lock()
            .entry(message.queue.clone())
            .or_default()
            .push_front(message);
        self.available.notify_all();
    }

    /// Return `messages` to the head of their queues, preserving order
    fn redeliver(&self, messages: Vec<Message>) {
        if messages.is_empty() {
            return;
        }
        let mut queues = self.queues.lock();
        for mut message in messages.into_iter().rev() {
            message.redelivered = true;
            queues
                .entry(message.queue.clone())
                .or_default()
                .push_front(message);
        }
        drop(queues);
        self.available.notify_all();
    }
}

/// In-memory message broker
///
/// Cheap to clone; clones share the same queues.
#[derive(Clone)]
pub struct InMemoryBroker {
    inner: Arc<BrokerInner>,
}

impl InMemoryBroker {
    /// Create a broker with no queues
    pub fn new(name: &str) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                name: name.to_string(),
                queues: Mutex::new(HashMap::new()),
                available: Condvar::new(),
                next_message: AtomicU64::new(1),
                next_session: AtomicU64::new(1),
            }),
        }
    }

    /// Broker name
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Declare a queue; declaring an existing queue is a no-op
    pub fn declare_queue(&self, queue: &str) {
        self.inner
            .queues
            .lock()
            .entry(queue.to_string())
            .or_default();
    }

    /// Publish one message outside any transaction
    ///
    /// # Returns
    /// The assigned message id
    ///
    /// # Errors
    /// `QueueNotFound` if the queue was never declared
    pub fn publish(&self, queue: &str, body: impl Into<String>) -> Result<u64, QueueError> {
        let ids = self
            .inner
            .publish_all(vec![(queue.to_string(), body.into())])?;
        Ok(ids.into_iter().next().unwrap_or_default())
    }

    /// Number of messages waiting on a queue
    pub fn depth(&self, queue: &str) -> Option<usize> {
        self.inner.queues.lock().get(queue).map(VecDeque::len)
    }

    /// Snapshot of the messages waiting on a queue, head first
    pub fn peek_all(&self, queue: &str) -> Vec<Message> {
        self.inner
            .queues
            .lock()
            .get(queue)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Open a preparable session with a generated resource id
    /// (`<broker>/session-<n>`)
    pub fn open_session(&self) -> QueueSession {
        let n = self.inner.next_session.fetch_add(1, Ordering::Relaxed);
        self.open_named_session(format!("{}/session-{}", self.inner.name, n))
    }

    /// Open a preparable session with an explicit unique resource id
    pub fn open_named_session(&self, resource: impl Into<ResourceId>) -> QueueSession {
        QueueSession {
            id: resource.into(),
            broker: Arc::clone(&self.inner),
            capability: Capability::Preparable,
            state: Mutex::new(SessionState::default()),
        }
    }
}

#[derive(Debug, Default)]
struct SessionState {
    txn: Option<TransactionId>,
    sent: Vec<(String, String)>,
    received: Vec<Message>,
    prepared: bool,
    ended: Option<TransactionId>,
}

impl SessionState {
    fn ended(txn: TransactionId) -> Self {
        SessionState {
            ended: Some(txn),
            ..SessionState::default()
        }
    }
}

/// Session on an `InMemoryBroker`
///
/// The session lock is never taken while the broker's queue lock is held.
pub struct QueueSession {
    id: ResourceId,
    broker: Arc<BrokerInner>,
    capability: Capability,
    state: Mutex<SessionState>,
}

impl QueueSession {
    /// Turn this session into a resource that skips the prepare round
    pub fn non_preparable(mut self) -> Self {
        self.capability = Capability::NonPreparable;
        self
    }

    /// Transaction this session is enlisted in
    pub fn enlisted_in(&self) -> Option<TransactionId> {
        self.state.lock().txn
    }

    /// Transaction that ended under this session, while it still refuses
    /// operations
    pub fn ended_in(&self) -> Option<TransactionId> {
        self.state.lock().ended
    }

    /// Return to acknowledge-on-receive after the transaction ended.
    ///
    /// No effect while enlisted.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        if state.txn.is_none() {
            state.ended = None;
        }
    }

    fn check_usable(&self, state: &SessionState) -> Result<(), QueueError> {
        if let Some(txn) = state.ended {
            return Err(QueueError::TransactionEnded {
                resource: self.id.clone(),
                txn,
            });
        }
        if state.prepared {
            return Err(QueueError::Prepared(self.id.clone()));
        }
        Ok(())
    }

    /// Send a message; staged until commit inside a transaction
    ///
    /// # Errors
    /// `QueueNotFound` for an undeclared queue, `Prepared` after prepare,
    /// `TransactionEnded` once the transaction is over
    pub fn send(&self, queue: &str, body: impl Into<String>) -> Result<(), QueueError> {
        let mut state = self.state.lock();
        self.check_usable(&state)?;
        if state.txn.is_none() {
            drop(state);
            self.broker
                .publish_all(vec![(queue.to_string(), body.into())])?;
            return Ok(());
        }
        if !self.broker.queues.lock().contains_key(queue) {
            return Err(QueueError::QueueNotFound(queue.to_string()));
        }
        state.sent.push((queue.to_string(), body.into()));
        Ok(())
    }

    /// Take the next message from `queue`, waiting up to `timeout`
    ///
    /// # Returns
    /// `None` if nothing arrived in time
    ///
    /// # Errors
    /// `QueueNotFound` for an undeclared queue, `Prepared` after prepare,
    /// `TransactionEnded` once the transaction is over, including when it
    /// ends while waiting
    pub fn receive(&self, queue: &str, timeout: Duration) -> Result<Option<Message>, QueueError> {
        let started_in = {
            let state = self.state.lock();
            self.check_usable(&state)?;
            state.txn
        };

        let deadline = Instant::now() + timeout;
        let message = {
            let mut queues = self.broker.queues.lock();
            loop {
                let q = queues
                    .get_mut(queue)
                    .ok_or_else(|| QueueError::QueueNotFound(queue.to_string()))?;
                if let Some(message) = q.pop_front() {
                    break Some(message);
                }
                if self
                    .broker
                    .available
                    .wait_until(&mut queues, deadline)
                    .timed_out()
                {
                    break queues.get_mut(queue).and_then(VecDeque::pop_front);
                }
            }
        };

        let Some(message) = message else {
            return Ok(None);
        };
        let mut state = self.state.lock();
        if let Some(txn) = started_in.filter(|&txn| state.txn != Some(txn)) {
            drop(state);
            self.broker.restore(message);
            return Err(QueueError::TransactionEnded {
                resource: self.id.clone(),
                txn,
            });
        }
        if state.txn.is_some() {
            state.received.push(message.clone());
        }
        Ok(Some(message))
    }

    fn check_txn(&self, state: &SessionState, txn: TransactionId) -> AdapterResult<()> {
        match state.txn {
            Some(current) if current == txn => Ok(()),
            _ => Err(AdapterError::Failed(format!(
                "session {} is not enlisted in transaction {}",
                self.id, txn
            ))),
        }
    }
}

impl ResourceAdapter for QueueSession {
    fn resource_id(&self) -> &ResourceId {
        &self.id
    }

    fn capability(&self) -> Capability {
        self.capability
    }

    fn enlist(&self, txn: TransactionId) -> AdapterResult<()> {
        let mut state = self.state.lock();
        match state.txn {
            Some(current) if current == txn => Ok(()),
            Some(current) => Err(AdapterError::AlreadyEnlisted(current)),
            None => {
                *state = SessionState {
                    txn: Some(txn),
                    ..SessionState::default()
                };
                Ok(())
            }
        }
    }

    fn prepare(&self, txn: TransactionId) -> AdapterResult<Vote> {
        let mut state = self.state.lock();
        self.check_txn(&state, txn)?;
        state.prepared = true;
        Ok(Vote::Commit)
    }

    fn commit(&self, txn: TransactionId, _one_phase: bool) -> AdapterResult<()> {
        let mut state = self.state.lock();
        self.check_txn(&state, txn)?;
        let sent = std::mem::take(&mut state.sent);
        let acked = state.received.len();
        *state = SessionState::ended(txn);
        drop(state);

        let published = sent.len();
        self.broker
            .publish_all(sent)
            .map_err(|e| AdapterError::Failed(e.to_string()))?;
        debug!(target: "xact::adapters", session = %self.id, txn = %txn, published, acked, "Committed");
        Ok(())
    }

    fn rollback(&self, txn: TransactionId) -> AdapterResult<()> {
        let mut state = self.state.lock();
        if state.txn != Some(txn) {
            return Ok(());
        }
        let received = std::mem::take(&mut state.received);
        let discarded = state.sent.len();
        *state = SessionState::ended(txn);
        drop(state);

        let redelivered = received.len();
        self.broker.redeliver(received);
        debug!(target: "xact::adapters", session = %self.id, txn = %txn, discarded, redelivered, "Rolled back");
        Ok(())
    }

    fn forget(&self, _txn: TransactionId) -> AdapterResult<()> {
        Ok(())
    }
}
