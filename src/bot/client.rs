//! Chat client seam and the HTTP bridge to the desktop-automation layer.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::bot::http_client;

const BRIDGE_TIMEOUT: Duration = Duration::from_secs(30);

/// One inbound message as reported by the desktop client.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct InboundEvent {
    /// "friend", "self", "sys", "time", ...
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub sender: String,
    /// Local path of a saved picture attached to this message, if any.
    #[serde(default)]
    pub image_path: Option<String>,
    /// Set by the bridge when the picture is a sticker rather than a photo.
    #[serde(default)]
    pub is_emoji: bool,
}

impl InboundEvent {
    pub fn is_friend(&self) -> bool {
        self.kind == "friend"
    }
}

/// All new messages in one watched conversation window.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ChatEvents {
    /// Window name; equals the sender for private chats.
    pub who: String,
    #[serde(default)]
    pub messages: Vec<InboundEvent>,
}

#[derive(Debug)]
pub enum ClientError {
    Http(String),
    Bridge { status: u16, body: String },
    Parse(String),
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientError::Http(e) => write!(f, "bridge unreachable: {e}"),
            ClientError::Bridge { status, body } => write!(f, "bridge error {status}: {body}"),
            ClientError::Parse(e) => write!(f, "bad bridge response: {e}"),
        }
    }
}

impl std::error::Error for ClientError {}

/// Operations the bot needs from the desktop messaging application.
#[async_trait]
pub trait ChatClient: Send + Sync {
    /// Names of the open sessions. Empty means the client is not logged in.
    async fn sessions(&self) -> Result<Vec<String>, ClientError>;

    /// Start watching a conversation for new messages.
    async fn listen(&self, who: &str) -> Result<(), ClientError>;

    /// Drain new messages from every watched conversation.
    async fn list_messages(&self) -> Result<Vec<ChatEvents>, ClientError>;

    async fn send_text(&self, who: &str, text: &str) -> Result<(), ClientError>;

    async fn send_file(&self, who: &str, path: &Path) -> Result<(), ClientError>;
}

#[derive(Deserialize)]
struct SessionsResponse {
    #[serde(default)]
    sessions: Vec<String>,
}

#[derive(Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    chats: Vec<ChatEvents>,
}

#[derive(Serialize)]
struct ListenRequest<'a> {
    who: &'a str,
}

#[derive(Serialize)]
struct SendTextRequest<'a> {
    who: &'a str,
    text: &'a str,
}

#[derive(Serialize)]
struct SendFileRequest<'a> {
    who: &'a str,
    path: &'a str,
}

/// `ChatClient` backed by a local HTTP bridge process that drives the desktop app.
pub struct HttpChatClient {
    base_url: String,
    http: reqwest::Client,
}

impl HttpChatClient {
    pub fn new(base_url: String) -> Result<Self, String> {
        let http = http_client(BRIDGE_TIMEOUT)?;
        Ok(Self { base_url, http })
    }

    async fn post<T: Serialize + ?Sized>(&self, route: &str, body: &T) -> Result<(), ClientError> {
        let response = self
            .http
            .post(format!("{}{}", self.base_url, route))
            .json(body)
            .send()
            .await
            .map_err(|e| ClientError::Http(e.to_string()))?;
        check_status(response).await.map(|_| ())
    }

    async fn get<T: for<'de> Deserialize<'de>>(&self, route: &str) -> Result<T, ClientError> {
        let response = self
            .http
            .get(format!("{}{}", self.base_url, route))
            .send()
            .await
            .map_err(|e| ClientError::Http(e.to_string()))?;
        check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| ClientError::Parse(e.to_string()))
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ClientError> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    Err(ClientError::Bridge { status, body })
}

#[async_trait]
impl ChatClient for HttpChatClient {
    async fn sessions(&self) -> Result<Vec<String>, ClientError> {
        let resp: SessionsResponse = self.get("/sessions").await?;
        Ok(resp.sessions)
    }

    async fn listen(&self, who: &str) -> Result<(), ClientError> {
        self.post("/listen", &ListenRequest { who }).await
    }

    async fn list_messages(&self) -> Result<Vec<ChatEvents>, ClientError> {
        let resp: MessagesResponse = self.get("/messages").await?;
        Ok(resp.chats)
    }

    async fn send_text(&self, who: &str, text: &str) -> Result<(), ClientError> {
        let preview: String = text.chars().take(50).collect();
        debug!("send_text to {}: \"{}\"", who, preview);
        self.post("/send_text", &SendTextRequest { who, text }).await
    }

    async fn send_file(&self, who: &str, path: &Path) -> Result<(), ClientError> {
        let path = path.to_string_lossy();
        debug!("send_file to {}: {}", who, path);
        self.post("/send_file", &SendFileRequest { who, path: &path }).await
    }
}
