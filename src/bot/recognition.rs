//! Image recognition worker.
//!
//! Pictures are described by a vision model one at a time. The worker holds
//! off while any reply is being sent (see [`ReplyGate`]) so that descriptions
//! never interleave with an outgoing reply.

use std::path::{Path, PathBuf};
use std::time::Duration;

use base64::Engine;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{error, info, warn};

use crate::bot::openai::{self, ChatRequest, ContentPart, ImageUrl, Message, MessageContent, Role};

const MAX_IMAGE_BYTES: u64 = 100 * 1024 * 1024;
const RECOGNITION_TIMEOUT: Duration = Duration::from_secs(30);

const PROMPT_IMAGE: &str = "请描述这个图片";
const PROMPT_EMOJI: &str = "请描述这个聊天窗口的最后一张表情包";
const EMOJI_LEAD_IN: &str = "最后一张表情包是";
const PREFIX_IMAGE: &str = "发送了图片：";
const PREFIX_EMOJI: &str = "发送了表情包：";

pub const ERR_MISSING_FILE: &str = "抱歉，图片文件不存在";
pub const ERR_TOO_LARGE: &str = "抱歉，图片文件太大了";
pub const ERR_READ: &str = "抱歉，读取图片时出现错误";
pub const ERR_UNAVAILABLE: &str = "抱歉，图片识别服务暂时不可用";
pub const ERR_TIMEOUT: &str = "抱歉，图片识别服务响应超时";
pub const ERR_UNPARSEABLE: &str = "抱歉，无法解析图片内容";
pub const ERR_QUEUE: &str = "抱歉，处理图片时出现错误";

/// Counts replies currently being sent.
#[derive(Clone)]
pub struct ReplyGate {
    tx: watch::Sender<usize>,
}

/// Marks one reply as in flight until dropped.
pub struct Replying {
    tx: watch::Sender<usize>,
}

impl Drop for Replying {
    fn drop(&mut self) {
        self.tx.send_modify(|n| *n = n.saturating_sub(1));
    }
}

impl ReplyGate {
    pub fn new() -> Self {
        Self { tx: watch::Sender::new(0) }
    }

    pub fn begin(&self) -> Replying {
        self.tx.send_modify(|n| *n += 1);
        Replying { tx: self.tx.clone() }
    }

    pub fn is_replying(&self) -> bool {
        *self.tx.borrow() > 0
    }

    /// Resolves once no reply is in flight.
    pub async fn idle(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|n| *n == 0).await;
    }
}

impl Default for ReplyGate {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct RecognitionConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    /// Already clamped to [0, 1].
    pub temperature: f32,
}

struct Task {
    path: PathBuf,
    is_emoji: bool,
    done: oneshot::Sender<String>,
}

/// Handle to the recognition worker. Cheap to clone.
#[derive(Clone)]
pub struct ImageRecognizer {
    tx: mpsc::UnboundedSender<Task>,
}

impl ImageRecognizer {
    /// Spawn the worker on the current runtime.
    pub fn spawn(config: RecognitionConfig, gate: ReplyGate) -> Result<Self, String> {
        let api = openai::Client::new(config.api_key.clone(), config.base_url.clone(), RECOGNITION_TIMEOUT)?;
        let (tx, mut rx) = mpsc::unbounded_channel::<Task>();

        tokio::spawn(async move {
            while let Some(task) = rx.recv().await {
                if gate.is_replying() {
                    info!("Reply in progress, holding image recognition");
                }
                gate.idle().await;
                let result = recognize_now(&api, &config, &task.path, task.is_emoji).await;
                let _ = task.done.send(result);
            }
        });

        Ok(Self { tx })
    }

    /// Queue a picture and wait for its description.
    ///
    /// Always yields user-presentable text; failures become apology strings.
    pub async fn recognize(&self, path: PathBuf, is_emoji: bool) -> String {
        let (done, rx) = oneshot::channel();
        info!("Queued image recognition: {:?}", path);
        if self.tx.send(Task { path, is_emoji, done }).is_err() {
            error!("Image recognition worker is gone");
            return ERR_QUEUE.to_string();
        }
        rx.await.unwrap_or_else(|_| ERR_QUEUE.to_string())
    }
}

async fn recognize_now(api: &openai::Client, config: &RecognitionConfig, path: &Path, is_emoji: bool) -> String {
    let meta = match tokio::fs::metadata(path).await {
        Ok(meta) => meta,
        Err(_) => {
            error!("Image file not found: {:?}", path);
            return ERR_MISSING_FILE.to_string();
        }
    };
    if meta.len() > MAX_IMAGE_BYTES {
        error!("Image too large ({} bytes): {:?}", meta.len(), path);
        return ERR_TOO_LARGE.to_string();
    }

    let data = match tokio::fs::read(path).await {
        Ok(data) => data,
        Err(e) => {
            error!("Failed to read image {:?}: {}", path, e);
            return ERR_READ.to_string();
        }
    };
    let encoded = base64::engine::general_purpose::STANDARD.encode(&data);

    let request = ChatRequest {
        model: &config.model,
        messages: vec![Message {
            role: Role::User,
            content: MessageContent::Parts(vec![
                ContentPart::ImageUrl {
                    image_url: ImageUrl { url: format!("data:image/jpeg;base64,{encoded}") },
                },
                ContentPart::Text {
                    text: if is_emoji { PROMPT_EMOJI } else { PROMPT_IMAGE }.to_string(),
                },
            ]),
        }],
        temperature: config.temperature,
        max_tokens: None,
        stream: false,
    };

    match api.chat(&request).await {
        Ok(text) => {
            let described = describe(&text, is_emoji);
            info!("Image recognition result: {}", described);
            described
        }
        Err(openai::Error::Timeout) => {
            warn!("Image recognition timed out");
            ERR_TIMEOUT.to_string()
        }
        Err(openai::Error::Empty) | Err(openai::Error::Parse(_)) => {
            error!("Image recognition returned an unusable response");
            ERR_UNPARSEABLE.to_string()
        }
        Err(e) => {
            error!("Image recognition failed: {}", e);
            ERR_UNAVAILABLE.to_string()
        }
    }
}

fn describe(text: &str, is_emoji: bool) -> String {
    if is_emoji {
        let text = text.split_once(EMOJI_LEAD_IN).map_or(text, |(_, rest)| rest.trim());
        format!("{PREFIX_EMOJI}{text}")
    } else {
        format!("{PREFIX_IMAGE}{text}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bot::test_support::{StubResponse, StubServer};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn config(base_url: String) -> RecognitionConfig {
        RecognitionConfig {
            api_key: "mk".into(),
            base_url,
            model: "moonshot-v1-8k-vision-preview".into(),
            temperature: 0.5,
        }
    }

    #[test]
    fn test_describe_prefixes() {
        assert_eq!(describe("一只橘猫", false), "发送了图片：一只橘猫");
        assert_eq!(describe("最后一张表情包是 狗头", true), "发送了表情包：狗头");
        assert_eq!(describe("一个笑脸", true), "发送了表情包：一个笑脸");
    }

    #[tokio::test]
    async fn test_recognize_sends_data_uri() {
        let server = StubServer::start(|_| {
            StubResponse::json(200, r#"{"choices":[{"message":{"content":"一只橘猫"}}]}"#)
        })
        .await;
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cat.jpg");
        std::fs::write(&path, b"jpegbytes").unwrap();

        let recognizer = ImageRecognizer::spawn(config(server.base_url()), ReplyGate::new()).unwrap();
        assert_eq!(recognizer.recognize(path, false).await, "发送了图片：一只橘猫");

        let body = server.requests()[0].json();
        let url = body["messages"][0]["content"][0]["image_url"]["url"].as_str().unwrap().to_string();
        assert_eq!(url, format!("data:image/jpeg;base64,{}", base64::engine::general_purpose::STANDARD.encode(b"jpegbytes")));
        assert_eq!(body["messages"][0]["content"][1]["text"], PROMPT_IMAGE);
    }

    #[tokio::test]
    async fn test_missing_file() {
        let recognizer = ImageRecognizer::spawn(config("http://127.0.0.1:9".into()), ReplyGate::new()).unwrap();
        let reply = recognizer.recognize(PathBuf::from("/nonexistent/x.jpg"), false).await;
        assert_eq!(reply, ERR_MISSING_FILE);
    }

    #[tokio::test]
    async fn test_service_error() {
        let server = StubServer::start(|_| StubResponse::json(502, "bad gateway")).await;
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("x.png");
        std::fs::write(&path, b"png").unwrap();

        let recognizer = ImageRecognizer::spawn(config(server.base_url()), ReplyGate::new()).unwrap();
        assert_eq!(recognizer.recognize(path, true).await, ERR_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_waits_for_reply_to_finish() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let server = StubServer::start(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
            StubResponse::json(200, r#"{"choices":[{"message":{"content":"ok"}}]}"#)
        })
        .await;
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("x.jpg");
        std::fs::write(&path, b"jpg").unwrap();

        let gate = ReplyGate::new();
        let recognizer = ImageRecognizer::spawn(config(server.base_url()), gate.clone()).unwrap();

        let replying = gate.begin();
        let pending = tokio::spawn({
            let recognizer = recognizer.clone();
            async move { recognizer.recognize(path, false).await }
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        drop(replying);
        assert_eq!(pending.await.unwrap(), "发送了图片：ok");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_gate_counts_overlapping_replies() {
        let gate = ReplyGate::new();
        let a = gate.begin();
        let b = gate.begin();
        drop(a);
        assert!(gate.is_replying());
        drop(b);
        assert!(!gate.is_replying());
    }
}
