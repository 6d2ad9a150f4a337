//! Per-conversation debouncing of inbound messages.
//!
//! Every conversation has at most one pending batch. Each new message appends
//! to it and replaces its flush timer. When a timer survives the quiet period
//! the batch is removed from the map and handed to the processor outside the
//! lock, so the conversation can start a fresh batch right away. Processing of
//! flushed batches is serialized per conversation in flush order.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info};

/// Joins the retained messages of a batch into one user turn.
pub const MESSAGE_SEPARATOR: &str = " \\ ";

/// Identifies one chat thread, private or group.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConversationKey(String);

impl ConversationKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConversationKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ConversationKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

#[derive(Debug, Clone)]
pub struct DebounceConfig {
    pub quiet_period: Duration,
    /// Only this many of the most recent messages survive a flush.
    pub max_batch_messages: usize,
}

/// A batch handed off for processing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushedBatch {
    pub key: ConversationKey,
    /// Display name of the most recent sender in the batch.
    pub sender: String,
    /// Where replies are sent.
    pub routing_target: String,
    /// Retained timestamped messages, oldest first.
    pub messages: Vec<String>,
    /// `messages` joined with `MESSAGE_SEPARATOR`.
    pub merged: String,
}

impl FlushedBatch {
    /// Group chats route somewhere other than the sender.
    pub fn is_group(&self) -> bool {
        self.routing_target != self.sender
    }
}

#[async_trait]
pub trait BatchProcessor: Send + Sync + 'static {
    async fn process(&self, batch: FlushedBatch) -> Result<(), String>;
}

struct PendingBatch {
    messages: Vec<String>,
    sender: String,
    routing_target: String,
    generation: u64,
    timer: JoinHandle<()>,
}

#[derive(Default)]
struct State {
    pending: HashMap<ConversationKey, PendingBatch>,
    next_generation: u64,
    /// Serializes processing of flushed batches per conversation.
    turnstiles: HashMap<ConversationKey, Arc<tokio::sync::Mutex<()>>>,
}

struct Shared {
    config: DebounceConfig,
    processor: Arc<dyn BatchProcessor>,
    state: Mutex<State>,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Remove the batch for `key` if `generation` still owns it.
    fn take(
        &self,
        key: &ConversationKey,
        generation: u64,
    ) -> Option<(FlushedBatch, Arc<tokio::sync::Mutex<()>>)> {
        let mut state = self.state();
        if state.pending.get(key).map(|b| b.generation) != Some(generation) {
            return None;
        }
        let batch = state.pending.remove(key)?;
        let turnstile = state.turnstiles.entry(key.clone()).or_default().clone();
        drop(state);

        let total = batch.messages.len();
        let keep_from = total.saturating_sub(self.config.max_batch_messages);
        if keep_from > 0 {
            debug!("Dropping {} oldest message(s) for {}", keep_from, key);
        }
        let messages = batch.messages[keep_from..].to_vec();
        let merged = messages.join(MESSAGE_SEPARATOR);

        Some((
            FlushedBatch {
                key: key.clone(),
                sender: batch.sender,
                routing_target: batch.routing_target,
                messages,
                merged,
            },
            turnstile,
        ))
    }
}

/// Owns all pending batches. Share it behind an `Arc`.
pub struct ConversationDebouncer {
    shared: Arc<Shared>,
}

impl ConversationDebouncer {
    pub fn new(config: DebounceConfig, processor: Arc<dyn BatchProcessor>) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                processor,
                state: Mutex::new(State::default()),
            }),
        }
    }

    /// Queue `text` for `key` and restart its quiet-period timer.
    ///
    /// Must be called from within a tokio runtime.
    pub fn on_message(&self, key: ConversationKey, text: &str, sender: &str, routing_target: &str) {
        let stamped = format!("[{}] {}", chrono::Local::now().format("%Y-%m-%d %H:%M:%S"), text);

        let mut state = self.shared.state();
        state.next_generation += 1;
        let generation = state.next_generation;
        let timer = tokio::spawn(flush_after_quiet(self.shared.clone(), key.clone(), generation));

        match state.pending.entry(key) {
            Entry::Occupied(mut entry) => {
                let batch = entry.get_mut();
                batch.timer.abort();
                batch.timer = timer;
                batch.generation = generation;
                batch.messages.push(stamped);
                batch.sender = sender.to_string();
                batch.routing_target = routing_target.to_string();
                let count = batch.messages.len();
                debug!("Batch for {} now has {} message(s)", entry.key(), count);
            }
            Entry::Vacant(entry) => {
                debug!("New batch for {}", entry.key());
                entry.insert(PendingBatch {
                    messages: vec![stamped],
                    sender: sender.to_string(),
                    routing_target: routing_target.to_string(),
                    generation,
                    timer,
                });
            }
        }
    }

    /// Number of conversations with an unflushed batch.
    #[cfg(test)]
    pub(crate) fn pending_count(&self) -> usize {
        self.shared.state().pending.len()
    }

    #[cfg(test)]
    pub(crate) fn has_pending(&self, key: &ConversationKey) -> bool {
        self.shared.state().pending.contains_key(key)
    }

    #[cfg(test)]
    fn turnstile_count(&self) -> usize {
        self.shared.state().turnstiles.len()
    }
}

impl Drop for ConversationDebouncer {
    fn drop(&mut self) {
        let mut state = self.shared.state();
        for (_, batch) in state.pending.drain() {
            batch.timer.abort();
        }
    }
}

async fn flush_after_quiet(shared: Arc<Shared>, key: ConversationKey, generation: u64) {
    sleep(shared.config.quiet_period).await;

    let Some((batch, turnstile)) = shared.take(&key, generation) else {
        return;
    };

    let turn = turnstile.lock().await;
    info!("⚡ Flushing {} message(s) for {}", batch.messages.len(), key);
    if let Err(e) = shared.processor.process(batch).await {
        error!("Processing batch for {} failed: {}", key, e);
    }
    drop(turn);

    // Clones are only handed out under the state lock, so two owners means
    // the map and this task, and no flush is queued behind us.
    let mut state = shared.state();
    if Arc::strong_count(&turnstile) == 2 {
        state.turnstiles.remove(&key);
    }
}
