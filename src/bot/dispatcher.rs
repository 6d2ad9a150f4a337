//! Reply dispatcher: turns a flushed batch into outbound sends.
//!
//! Order of evaluation per batch:
//! 1. Voice requests get a spoken reply (text if synthesis or sending fails).
//! 2. Emoji requests get a random emoji first, then continue normally.
//! 3. The model reply is sent as image + caption, paced segments, or one message.
//!
//! Every handled batch is recorded in the transcript store in the background.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tracing::{error, info, warn};

use crate::bot::client::ChatClient;
use crate::bot::debounce::{BatchProcessor, FlushedBatch};
use crate::bot::emoji::random_emoji;
use crate::bot::gateway::{ModelGateway, IMAGE_FILE_EXT, IMAGE_FILE_PREFIX};
use crate::bot::recognition::ReplyGate;
use crate::bot::reply::{parse, strip_thinking, ParsedReply};
use crate::bot::transcript::{append_in_background, TranscriptRecord, TranscriptStore};
use crate::intent;

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub emoji_dir: PathBuf,
    /// Only image envelopes pointing inside this directory are sent and deleted.
    pub temp_image_dir: PathBuf,
    pub pacing_min: Duration,
    pub pacing_max: Duration,
}

pub struct ReplyDispatcher {
    config: DispatchConfig,
    client: Arc<dyn ChatClient>,
    gateway: Arc<ModelGateway>,
    transcripts: Arc<TranscriptStore>,
    gate: ReplyGate,
}

impl ReplyDispatcher {
    pub fn new(
        config: DispatchConfig,
        client: Arc<dyn ChatClient>,
        gateway: Arc<ModelGateway>,
        transcripts: Arc<TranscriptStore>,
        gate: ReplyGate,
    ) -> Self {
        Self { config, client, gateway, transcripts, gate }
    }

    async fn send_text(&self, who: &str, text: &str) -> Result<(), String> {
        let preview: String = text.chars().take(50).collect();
        info!("📤 Sending to {}: \"{}\"", who, preview);
        self.client.send_text(who, text).await.map_err(|e| {
            let msg = format!("Failed to send text to {who}: {e}");
            error!("{}", msg);
            msg
        })
    }

    async fn send_file(&self, who: &str, path: &Path) -> Result<(), String> {
        info!("📤 Sending file to {}: {:?}", who, path);
        self.client.send_file(who, path).await.map_err(|e| {
            let msg = format!("Failed to send file to {who}: {e}");
            error!("{}", msg);
            msg
        })
    }

    /// Best effort; a missing directory or failed send is only logged.
    async fn send_emoji(&self, who: &str) {
        let Some(path) = random_emoji(&self.config.emoji_dir) else {
            return;
        };
        let _ = self.send_file(who, &path).await;
    }

    async fn deliver_voice(&self, batch: &FlushedBatch, reply: &str) -> Result<(), String> {
        let target = &batch.routing_target;
        let Some(path) = self.gateway.generate_speech(reply).await else {
            return self.send_text(target, reply).await;
        };

        let result = match self.send_file(target, &path).await {
            Ok(()) => Ok(()),
            Err(_) => {
                warn!("Falling back to text reply for {}", target);
                self.send_text(target, reply).await
            }
        };
        remove_temp_file(&path).await;
        result
    }

    async fn deliver(&self, batch: &FlushedBatch, reply: &str) -> Result<(), String> {
        let target = &batch.routing_target;
        match parse(reply) {
            ParsedReply::Image { path, caption } => {
                let path = PathBuf::from(path);
                if !is_generated_image(&self.config.temp_image_dir, &path) {
                    warn!("Refusing image envelope outside {:?}: {:?}", self.config.temp_image_dir, path);
                    return Err(format!("{:?} is not a generated image", path));
                }
                if !path.exists() {
                    warn!("Generated image {:?} is missing", path);
                    return Err(format!("{:?} is missing", path));
                }

                // Caption only follows a delivered image
                let result = match self.send_file(target, &path).await {
                    Ok(()) if caption.is_empty() => Ok(()),
                    Ok(()) => self.send_text(target, &caption).await,
                    Err(e) => Err(e),
                };
                remove_temp_file(&path).await;
                result
            }
            ParsedReply::Segments(parts) => {
                for (idx, part) in parts.iter().enumerate() {
                    if idx > 0 {
                        tokio::time::sleep(pacing_delay(self.config.pacing_min, self.config.pacing_max)).await;
                    }
                    let text = if idx == 0 && batch.is_group() {
                        format!("@{} {}", batch.sender, part)
                    } else {
                        part.clone()
                    };
                    self.send_text(target, &text).await?;
                }
                Ok(())
            }
            ParsedReply::Single(text) => {
                if text.trim().is_empty() {
                    warn!("Empty reply for {}, nothing to send", batch.key);
                    return Ok(());
                }
                self.send_text(target, &text).await
            }
        }
    }
}

/// Uniform random delay in `[min, max]`.
fn pacing_delay(min: Duration, max: Duration) -> Duration {
    let min = min.as_millis() as u64;
    let max = max.as_millis() as u64;
    Duration::from_millis(rand::rng().random_range(min..=max.max(min)))
}

/// Only a file name `media_path` produced directly inside `dir` qualifies.
fn is_generated_image(dir: &Path, path: &Path) -> bool {
    if path.parent() != Some(dir) {
        return false;
    }
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    name.starts_with(&format!("{IMAGE_FILE_PREFIX}_")) && name.ends_with(&format!(".{IMAGE_FILE_EXT}"))
}

async fn remove_temp_file(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        error!("Failed to delete temporary file {:?}: {}", path, e);
    }
}

#[async_trait]
impl BatchProcessor for ReplyDispatcher {
    async fn process(&self, batch: FlushedBatch) -> Result<(), String> {
        let _replying = self.gate.begin();
        let merged = batch.merged.as_str();
        info!("📨 Handling batch for {} ({}): {}", batch.key, batch.sender, merged);

        let (reply, delivered) = if intent::is_voice_request(merged) {
            let reply = self.gateway.converse(&batch.key, merged).await;
            let reply = strip_thinking(&reply).to_string();
            let delivered = self.deliver_voice(&batch, &reply).await;
            (reply, delivered)
        } else {
            if intent::is_emoji_request(merged) {
                self.send_emoji(&batch.routing_target).await;
            }
            let reply = self.gateway.reply(&batch.key, merged).await;
            let reply = strip_thinking(&reply).to_string();
            let delivered = self.deliver(&batch, &reply).await;
            (reply, delivered)
        };

        append_in_background(
            self.transcripts.clone(),
            TranscriptRecord {
                sender_id: batch.key.to_string(),
                sender_name: batch.sender.clone(),
                message: batch.merged.clone(),
                reply,
            },
        );

        delivered
    }
}
