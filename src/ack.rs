//! Client acknowledgment of self-update notices.
//!
//! Every event-stream connection is registered with an id and a token. When a
//! self-update is announced each connected client gets a notice and may post
//! an acknowledgment back. Acknowledgments are only counted and logged; the
//! update itself never waits for them.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

const EVENT_BUFFER: usize = 64;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AckError {
    #[error("unknown self-update operation {0}")]
    UnknownOperation(String),
    #[error("unknown client {0}")]
    UnknownClient(String),
    #[error("invalid token for client {0}")]
    InvalidToken(String),
}

/// Identity handed to a client when its event stream opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientSession {
    pub client_id: Uuid,
    pub client_token: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelfUpdateEvent {
    pub op_id: String,
    pub requires_ack: bool,
    pub ack_timeout_ms: u64,
    pub started_at: DateTime<Utc>,
}

/// A self-update event as broadcast to the streams, with its stream event id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub event_id: u64,
    pub event: SelfUpdateEvent,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AckRequest {
    pub client_id: String,
    pub client_token: String,
    #[serde(default)]
    pub last_event_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AckReceipt {
    pub op_id: String,
    /// Distinct clients that acknowledged the operation so far.
    pub acknowledged: usize,
    pub connected_clients: usize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct AckHub {
    events: broadcast::Sender<Notice>,
    /// Client id to token.
    clients: Mutex<HashMap<Uuid, Uuid>>,
    /// Operations still accepting acknowledgments, with who acknowledged.
    pending: Mutex<HashMap<String, HashSet<Uuid>>>,
    next_event_id: AtomicU64,
    ack_timeout: Duration,
}

impl AckHub {
    pub fn new(ack_timeout: Duration) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            events,
            clients: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            next_event_id: AtomicU64::new(1),
            ack_timeout,
        }
    }

    /// Register a new client and subscribe it to notices.
    pub fn connect(&self) -> (ClientSession, broadcast::Receiver<Notice>) {
        let receiver = self.events.subscribe();
        let session = ClientSession {
            client_id: Uuid::now_v7(),
            client_token: Uuid::new_v4(),
        };
        lock(&self.clients).insert(session.client_id, session.client_token);
        log::debug!("Client {} connected", session.client_id);
        (session, receiver)
    }

    pub fn disconnect(&self, client_id: &Uuid) {
        if lock(&self.clients).remove(client_id).is_some() {
            log::debug!("Client {client_id} disconnected");
        }
    }

    pub fn connected_clients(&self) -> usize {
        lock(&self.clients).len()
    }

    /// Tell every connected client that a self-update is about to start.
    ///
    /// Returns immediately. The operation accepts acknowledgments for the ack
    /// timeout; after that the tally is logged and the operation forgotten.
    pub fn announce_self_update(self: &Arc<Self>, op_id: &str) -> Notice {
        lock(&self.pending).insert(op_id.to_string(), HashSet::new());

        let notice = Notice {
            event_id: self.next_event_id.fetch_add(1, Ordering::Relaxed),
            event: SelfUpdateEvent {
                op_id: op_id.to_string(),
                requires_ack: true,
                ack_timeout_ms: u64::try_from(self.ack_timeout.as_millis()).unwrap_or(u64::MAX),
                started_at: Utc::now(),
            },
        };
        // No subscribers is not an error; nobody is watching.
        let delivered = self.events.send(notice.clone()).unwrap_or(0);
        log::info!("[self-update:{op_id}] notice sent to {delivered} client(s)");

        let hub = Arc::clone(self);
        let op_id = op_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(hub.ack_timeout).await;
            let acknowledged = lock(&hub.pending).remove(&op_id).map_or(0, |acks| acks.len());
            log::info!(
                "[self-update:{op_id}] {acknowledged} of {delivered} client(s) acknowledged within {:?}",
                hub.ack_timeout
            );
        });

        notice
    }

    pub fn acknowledge(&self, op_id: &str, request: &AckRequest) -> Result<AckReceipt, AckError> {
        let client_id = Uuid::parse_str(&request.client_id)
            .map_err(|_| AckError::UnknownClient(request.client_id.clone()))?;
        let token = {
            let clients = lock(&self.clients);
            *clients
                .get(&client_id)
                .ok_or_else(|| AckError::UnknownClient(request.client_id.clone()))?
        };
        if Uuid::parse_str(&request.client_token).ok() != Some(token) {
            return Err(AckError::InvalidToken(request.client_id.clone()));
        }

        let acknowledged = {
            let mut pending = lock(&self.pending);
            let acks = pending
                .get_mut(op_id)
                .ok_or_else(|| AckError::UnknownOperation(op_id.to_string()))?;
            acks.insert(client_id);
            acks.len()
        };

        log::debug!(
            "[self-update:{op_id}] ack from {client_id} (last event {})",
            request.last_event_id.as_deref().unwrap_or("-")
        );

        Ok(AckReceipt {
            op_id: op_id.to_string(),
            acknowledged,
            connected_clients: self.connected_clients(),
        })
    }
}
