//! Chat bot - relays desktop chat messages to an OpenAI-compatible model.

pub mod client;
pub mod context;
pub mod debounce;
pub mod dispatcher;
pub mod emoji;
pub mod gateway;
pub mod listener;
pub mod openai;
pub mod recognition;
pub mod reply;
pub mod transcript;
pub mod tts;

#[cfg(test)]
pub(crate) mod test_support;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

pub use client::{ChatClient, HttpChatClient};
pub use debounce::{ConversationDebouncer, ConversationKey, FlushedBatch};
pub use dispatcher::ReplyDispatcher;
pub use gateway::ModelGateway;
pub use listener::Listener;
pub use recognition::{ImageRecognizer, ReplyGate};
pub use transcript::TranscriptStore;

/// Build an HTTP client that enforces `timeout` on every request.
pub fn http_client(timeout: Duration) -> Result<reqwest::Client, String> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| format!("Failed to build HTTP client: {e}"))
}

static MEDIA_SEQ: AtomicU64 = AtomicU64::new(0);

/// Fresh file path for generated media, unique within this process.
pub fn media_path(dir: &Path, prefix: &str, ext: &str) -> PathBuf {
    let seq = MEDIA_SEQ.fetch_add(1, Ordering::Relaxed);
    let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S_%3f");
    dir.join(format!("{prefix}_{stamp}_{seq}.{ext}"))
}
