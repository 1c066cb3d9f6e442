//! In-memory at-least-once queue.
//!
//! Mirrors the delivery contract of a managed FIFO queue closely
//! enough to drive the workers and every coordination test: dedup IDs
//! are honored inside a TTL window, each delivery carries a receive
//! count, and unsettled deliveries return to the queue via `nack`.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering::Relaxed},
        Mutex, RwLock,
    },
    time::{Duration, Instant},
};

use async_trait::async_trait;

use crate::error::{AppError, AppResult};

use super::{Delivery, MessageQueue, OutgoingMessage};

/// A set with TTL-based expiration, used for the dedup window.
struct TtlSet {
    entries: RwLock<HashMap<String, Instant>>,
    ttl: Duration,
}

impl TtlSet {
    fn new(ttl_secs: u64) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl: Duration::from_secs(ttl_secs),
        }
    }

    fn insert(&self, key: String) {
        let mut entries = self.entries.write().unwrap();
        entries.insert(key, Instant::now());
    }

    fn contains(&self, key: &str) -> bool {
        let entries = self.entries.read().unwrap();
        entries
            .get(key)
            .map(|at| at.elapsed() < self.ttl)
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone)]
struct StoredMessage {
    id: u64,
    body: String,
    receive_count: u32,
}

pub struct InMemoryQueue {
    messages: Mutex<VecDeque<StoredMessage>>,
    in_flight: Mutex<HashMap<String, StoredMessage>>,
    dedup: TtlSet,
    next_id: AtomicU64,
    unavailable: AtomicBool,
}

impl InMemoryQueue {
    pub fn new(dedup_window_secs: u64) -> Self {
        Self {
            messages: Mutex::new(VecDeque::new()),
            in_flight: Mutex::new(HashMap::new()),
            dedup: TtlSet::new(dedup_window_secs),
            next_id: AtomicU64::new(1),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Fault-injection hook: makes every call fail with
    /// `QueueUnavailable` until cleared.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Relaxed);
    }

    fn check_available(&self) -> AppResult<()> {
        if self.unavailable.load(Relaxed) {
            return Err(AppError::QueueUnavailable("injected outage".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl MessageQueue for InMemoryQueue {
    async fn send(&self, message: OutgoingMessage) -> AppResult<Option<String>> {
        self.check_available()?;

        if self.dedup.contains(&message.dedup_id) {
            tracing::debug!("Dedup window swallowed message {}", message.dedup_id);
            return Ok(None);
        }
        self.dedup.insert(message.dedup_id.clone());

        let id = self.next_id.fetch_add(1, Relaxed);
        self.messages.lock().unwrap().push_back(StoredMessage {
            id,
            body: message.body,
            receive_count: 0,
        });

        Ok(Some(id.to_string()))
    }

    async fn receive(&self, max: usize) -> AppResult<Vec<Delivery>> {
        self.check_available()?;

        let mut messages = self.messages.lock().unwrap();
        let mut in_flight = self.in_flight.lock().unwrap();
        let mut batch = Vec::new();

        while batch.len() < max {
            let Some(mut message) = messages.pop_front() else {
                break;
            };
            message.receive_count += 1;

            let receipt = format!("{}-{}", message.id, message.receive_count);
            batch.push(Delivery {
                receipt: receipt.clone(),
                body: message.body.clone(),
                receive_count: message.receive_count,
            });
            in_flight.insert(receipt, message);
        }

        Ok(batch)
    }

    async fn ack(&self, receipt: &str) -> AppResult<()> {
        self.check_available()?;
        self.in_flight.lock().unwrap().remove(receipt);
        Ok(())
    }

    async fn nack(&self, receipt: &str) -> AppResult<()> {
        self.check_available()?;

        let message = self.in_flight.lock().unwrap().remove(receipt);
        if let Some(message) = message {
            self.messages.lock().unwrap().push_back(message);
        }

        Ok(())
    }

    async fn pending(&self) -> AppResult<usize> {
        self.check_available()?;
        Ok(self.messages.lock().unwrap().len())
    }
}
