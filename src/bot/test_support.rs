//! In-process HTTP stub and chat client fake shared by the bot tests.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::bot::client::{ChatClient, ChatEvents, ClientError};

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    /// Path including the query string.
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl RecordedRequest {
    pub fn header(&self, name: &str) -> Option<String> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.clone())
    }

    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.body).unwrap_or(serde_json::Value::Null)
    }
}

pub struct StubResponse {
    pub status: u16,
    pub content_type: &'static str,
    pub body: Vec<u8>,
}

impl StubResponse {
    pub fn json(status: u16, body: &str) -> Self {
        Self { status, content_type: "application/json", body: body.as_bytes().to_vec() }
    }

    pub fn bytes(status: u16, body: &[u8]) -> Self {
        Self { status, content_type: "application/octet-stream", body: body.to_vec() }
    }
}

type Handler = dyn Fn(&RecordedRequest) -> StubResponse + Send + Sync;

/// One-request-per-connection HTTP/1.1 server answering from a closure.
pub struct StubServer {
    addr: std::net::SocketAddr,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
    task: tokio::task::JoinHandle<()>,
}

impl StubServer {
    pub async fn start<F>(handler: F) -> Self
    where
        F: Fn(&RecordedRequest) -> StubResponse + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let handler: Arc<Handler> = Arc::new(handler);

        let recorded = requests.clone();
        let task = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else { break };
                let handler = handler.clone();
                let recorded = recorded.clone();
                tokio::spawn(async move {
                    let _ = serve_one(stream, handler, recorded).await;
                });
            }
        });

        Self { addr, requests, task }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl Drop for StubServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve_one(
    mut stream: TcpStream,
    handler: Arc<Handler>,
    recorded: Arc<Mutex<Vec<RecordedRequest>>>,
) -> std::io::Result<()> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];

    let header_end = loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let mut lines = head.split("\r\n");
    let request_line = lines.next().unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default().to_string();
    let path = parts.next().unwrap_or_default().to_string();
    let headers: Vec<(String, String)> = lines
        .filter_map(|l| l.split_once(':'))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect();
    let content_length = headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, v)| v.parse::<usize>().ok())
        .unwrap_or(0);

    while buf.len() < header_end + content_length {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    let body_end = (header_end + content_length).min(buf.len());
    let request = RecordedRequest { method, path, headers, body: buf[header_end..body_end].to_vec() };

    let response = handler(&request);
    recorded.lock().unwrap().push(request);

    let head = format!(
        "HTTP/1.1 {} STUB\r\ncontent-type: {}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
        response.status,
        response.content_type,
        response.body.len()
    );
    stream.write_all(head.as_bytes()).await?;
    stream.write_all(&response.body).await?;
    stream.shutdown().await
}

/// What a `RecordingClient` was asked to send, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sent {
    Text { who: String, text: String },
    File { who: String, path: PathBuf, existed: bool },
}

/// Fake chat client that records sends and serves scripted polls.
#[derive(Default)]
pub struct RecordingClient {
    pub sent: Mutex<Vec<Sent>>,
    pub polls: Mutex<Vec<Result<Vec<ChatEvents>, ClientError>>>,
    pub fail_files: bool,
    pub fail_texts: bool,
    pub sessions: Mutex<Vec<String>>,
    pub listened: Mutex<Vec<String>>,
    pub connects: Mutex<usize>,
    /// When each successful send happened, parallel to `sent`.
    pub sent_at: Mutex<Vec<std::time::Instant>>,
}

impl RecordingClient {
    pub fn new() -> Self {
        Self { sessions: Mutex::new(vec!["文件传输助手".to_string()]), ..Default::default() }
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().unwrap().clone()
    }

    pub fn texts(&self) -> Vec<String> {
        self.sent()
            .into_iter()
            .filter_map(|s| match s {
                Sent::Text { text, .. } => Some(text),
                Sent::File { .. } => None,
            })
            .collect()
    }

    pub fn push_poll(&self, poll: Result<Vec<ChatEvents>, ClientError>) {
        self.polls.lock().unwrap().push(poll);
    }
}

#[async_trait]
impl ChatClient for RecordingClient {
    async fn sessions(&self) -> Result<Vec<String>, ClientError> {
        *self.connects.lock().unwrap() += 1;
        Ok(self.sessions.lock().unwrap().clone())
    }

    async fn listen(&self, who: &str) -> Result<(), ClientError> {
        self.listened.lock().unwrap().push(who.to_string());
        Ok(())
    }

    async fn list_messages(&self) -> Result<Vec<ChatEvents>, ClientError> {
        let mut polls = self.polls.lock().unwrap();
        if polls.is_empty() {
            Ok(Vec::new())
        } else {
            polls.remove(0)
        }
    }

    async fn send_text(&self, who: &str, text: &str) -> Result<(), ClientError> {
        if self.fail_texts {
            return Err(ClientError::Bridge { status: 500, body: "send_text failed".into() });
        }
        self.sent.lock().unwrap().push(Sent::Text { who: who.to_string(), text: text.to_string() });
        self.sent_at.lock().unwrap().push(std::time::Instant::now());
        Ok(())
    }

    async fn send_file(&self, who: &str, path: &Path) -> Result<(), ClientError> {
        let existed = path.exists();
        if self.fail_files {
            return Err(ClientError::Bridge { status: 500, body: "send_file failed".into() });
        }
        self.sent.lock().unwrap().push(Sent::File { who: who.to_string(), path: path.to_path_buf(), existed });
        self.sent_at.lock().unwrap().push(std::time::Instant::now());
        Ok(())
    }
}
