//! Text-to-speech over a simple HTTP endpoint.
//!
//! The endpoint takes the text as a `text` query parameter and streams back
//! WAV audio, which is written chunk by chunk to a file in the voice directory.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::bot::{http_client, media_path};

pub struct TtsClient {
    endpoint: String,
    client: reqwest::Client,
}

impl TtsClient {
    /// `endpoint` is the full URL the `?text=` query is appended to.
    pub fn new(endpoint: String, timeout: Duration) -> Result<Self, String> {
        let client = http_client(timeout)?;
        Ok(Self { endpoint, client })
    }

    /// Synthesize `text` into a new `voice_<timestamp>.wav` under `voice_dir`.
    pub async fn synthesize(&self, text: &str, voice_dir: &Path) -> Result<PathBuf, String> {
        let preview: String = text.chars().take(50).collect();
        info!("TTS: \"{}\"", preview);

        tokio::fs::create_dir_all(voice_dir)
            .await
            .map_err(|e| format!("Failed to create voice dir {:?}: {e}", voice_dir))?;

        let url = format!("{}?text={}", self.endpoint, urlencoding::encode(text));
        let mut response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| format!("TTS request failed: {e}"))?;

        if !response.status().is_success() {
            return Err(format!("TTS error {}", response.status()));
        }

        let path = media_path(voice_dir, "voice", "wav");
        let mut file = tokio::fs::File::create(&path)
            .await
            .map_err(|e| format!("Failed to create {:?}: {e}", path))?;

        let mut written = 0usize;
        let streamed: Result<(), String> = async {
            while let Some(chunk) = response
                .chunk()
                .await
                .map_err(|e| format!("Failed to read TTS response: {e}"))?
            {
                file.write_all(&chunk)
                    .await
                    .map_err(|e| format!("Failed to write audio: {e}"))?;
                written += chunk.len();
            }
            file.flush().await.map_err(|e| format!("Failed to flush audio: {e}"))
        }
        .await;

        if let Err(e) = streamed {
            drop(file);
            let _ = tokio::fs::remove_file(&path).await;
            return Err(e);
        }

        debug!("Wrote {} bytes of audio to {:?}", written, path);
        Ok(path)
    }
}
