//! Model gateway: chat completions, image generation and speech synthesis.
//!
//! The gateway owns every conversation's rolling context. Remote failures never
//! escape as errors; callers get a fixed apologetic reply (or `None` for media)
//! and the context is left exactly as it was before the call.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::bot::context::ConversationContext;
use crate::bot::debounce::ConversationKey;
use crate::bot::media_path;
use crate::bot::openai::{self, ChatRequest, Message, Role};
use crate::bot::reply::image_envelope;
use crate::bot::tts::TtsClient;
use crate::intent;

pub const FALLBACK_API_ERROR: &str = "抱歉主人，我现在有点累，请稍后再试...";
pub const FALLBACK_EMPTY_CHOICES: &str = "抱歉主人，服务响应异常，请稍后再试";
pub const IMAGE_CAPTION: &str = "这是按照主人您的要求生成的图片\\(^o^)/~";
pub const IMAGE_GENERATION_FAILED: &str = "抱歉主人，图片生成失败，请稍后重试。";
pub const IMAGE_DOWNLOAD_FAILED: &str = "抱歉主人，图片生成成功但下载失败，请稍后重试。";

/// Name parts of downloaded images, see `media_path`.
pub const IMAGE_FILE_PREFIX: &str = "image";
pub const IMAGE_FILE_EXT: &str = "jpg";

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub image_model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Context cap in user/assistant pairs.
    pub max_groups: usize,
    pub system_prompt: String,
    pub temp_image_dir: PathBuf,
    pub voice_dir: PathBuf,
    pub tts_api_url: Option<String>,
    pub timeout: Duration,
}

pub struct ModelGateway {
    config: GatewayConfig,
    api: openai::Client,
    tts: Option<TtsClient>,
    contexts: Mutex<HashMap<ConversationKey, ConversationContext>>,
}

impl ModelGateway {
    pub fn new(config: GatewayConfig) -> Result<Self, String> {
        let api = openai::Client::new(config.api_key.clone(), config.base_url.clone(), config.timeout)?;
        let tts = config
            .tts_api_url
            .clone()
            .map(|url| TtsClient::new(url, config.timeout))
            .transpose()?;
        Ok(Self {
            config,
            api,
            tts,
            contexts: Mutex::new(HashMap::new()),
        })
    }

    /// Reply to a merged inbound batch.
    ///
    /// Image requests are answered with an image envelope and leave the
    /// context alone; everything else goes through `converse`.
    pub async fn reply(&self, key: &ConversationKey, text: &str) -> String {
        if intent::is_image_request(text) {
            return self.reply_with_image(text).await;
        }
        self.converse(key, text).await
    }

    /// One chat-completion exchange within the conversation's context.
    pub async fn converse(&self, key: &ConversationKey, text: &str) -> String {
        let preview: String = text.chars().take(50).collect();
        info!("🤖 Calling model for {}: \"{}\"", key, preview);

        // Work on a copy; it only replaces the stored context on success
        let mut candidate = {
            let contexts = self.contexts.lock().await;
            contexts.get(key).cloned().unwrap_or_default()
        };
        candidate.push(Role::User, text);
        candidate.trim(self.config.max_groups);

        let mut messages = Vec::with_capacity(candidate.len() + 1);
        messages.push(Message::text(Role::System, self.config.system_prompt.clone()));
        messages.extend(candidate.messages().cloned());

        let request = ChatRequest {
            model: &self.config.model,
            messages,
            temperature: self.config.temperature,
            max_tokens: Some(self.config.max_tokens),
            stream: false,
        };

        let reply = match self.api.chat(&request).await {
            Ok(reply) => reply,
            Err(openai::Error::Empty) => {
                error!("Model returned no choices for {}", key);
                return FALLBACK_EMPTY_CHOICES.to_string();
            }
            Err(e) => {
                error!("Model call failed for {}: {}", key, e);
                return FALLBACK_API_ERROR.to_string();
            }
        };

        let preview: String = reply.chars().take(80).collect();
        info!("✅ Model replied to {}: \"{}\"", key, preview);

        candidate.push(Role::Assistant, reply.clone());
        candidate.trim(self.config.max_groups);
        self.contexts.lock().await.insert(key.clone(), candidate);

        reply
    }

    /// Generate an image and return its URL, or `None` on any failure.
    pub async fn generate_image(&self, prompt: &str) -> Option<String> {
        info!("🎨 Generating image: {}", prompt);
        match self.api.generate_image(&self.config.image_model, prompt).await {
            Ok(url) => Some(url),
            Err(e) => {
                error!("Image generation failed: {}", e);
                None
            }
        }
    }

    /// Synthesize speech into a fresh file, or `None` when TTS is unavailable or fails.
    pub async fn generate_speech(&self, text: &str) -> Option<PathBuf> {
        let Some(ref tts) = self.tts else {
            warn!("Voice requested but no tts_api_url configured");
            return None;
        };
        match tts.synthesize(text, &self.config.voice_dir).await {
            Ok(path) => Some(path),
            Err(e) => {
                error!("Speech synthesis failed: {}", e);
                None
            }
        }
    }

    /// Download a URL into the temp image dir.
    async fn download_image(&self, url: &str) -> Result<PathBuf, String> {
        let data = self.api.download(url).await.map_err(|e| e.to_string())?;
        tokio::fs::create_dir_all(&self.config.temp_image_dir)
            .await
            .map_err(|e| format!("Failed to create {:?}: {e}", self.config.temp_image_dir))?;
        let path = media_path(&self.config.temp_image_dir, IMAGE_FILE_PREFIX, IMAGE_FILE_EXT);
        tokio::fs::write(&path, &data)
            .await
            .map_err(|e| format!("Failed to write {:?}: {e}", path))?;
        info!("🎨 Saved generated image ({} bytes) to {:?}", data.len(), path);
        Ok(path)
    }

    async fn reply_with_image(&self, prompt: &str) -> String {
        let Some(url) = self.generate_image(prompt).await else {
            return IMAGE_GENERATION_FAILED.to_string();
        };
        match self.download_image(&url).await {
            Ok(path) => image_envelope(&path.to_string_lossy(), IMAGE_CAPTION),
            Err(e) => {
                error!("Image download failed: {}", e);
                IMAGE_DOWNLOAD_FAILED.to_string()
            }
        }
    }

    /// Number of stored turns for a conversation.
    #[cfg(test)]
    pub(crate) async fn context_len(&self, key: &ConversationKey) -> usize {
        self.contexts.lock().await.get(key).map_or(0, |c| c.len())
    }
}
