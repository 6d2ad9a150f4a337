//! Polling loop over the desktop chat client.
//!
//! Private messages from friends are always handled. Group messages are only
//! handled when they @-mention the robot, and the mention is stripped first.
//! Pictures are described by the recognition worker before being debounced.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::bot::client::{ChatClient, InboundEvent};
use crate::bot::debounce::{ConversationDebouncer, ConversationKey};
use crate::bot::recognition::ImageRecognizer;

/// Wait before retrying when the client reports no sessions.
const RECONNECT_BACKOFF: Duration = Duration::from_secs(5);

/// Separator the desktop client places after an @-mention.
const MENTION_SPACE: char = '\u{2005}';

#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub robot_name: String,
    pub listen_list: Vec<String>,
    pub poll_interval: Duration,
    pub revalidate_interval: Duration,
}

/// An inbound event that should reach the debouncer.
#[derive(Debug, Clone, PartialEq)]
pub struct Routed {
    pub key: ConversationKey,
    pub sender: String,
    pub routing_target: String,
    pub payload: Payload,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Text(String),
    Image { path: PathBuf, is_emoji: bool },
}

/// Decide whether an event from window `who` is for the robot.
pub fn route_event(who: &str, event: &InboundEvent, robot_name: &str) -> Option<Routed> {
    if !event.is_friend() {
        return None;
    }

    let mention = format!("@{robot_name}{MENTION_SPACE}");
    let is_private = who == event.sender;
    if !is_private && (robot_name.is_empty() || !event.content.contains(&mention)) {
        return None;
    }

    let payload = match event.image_path {
        Some(ref path) if !path.is_empty() => Payload::Image { path: PathBuf::from(path), is_emoji: event.is_emoji },
        _ => {
            let text = if robot_name.is_empty() {
                event.content.clone()
            } else {
                event.content.replace(&mention, "")
            };
            if text.trim().is_empty() {
                return None;
            }
            Payload::Text(text)
        }
    };

    Some(Routed {
        key: ConversationKey::from(who),
        sender: event.sender.clone(),
        routing_target: who.to_string(),
        payload,
    })
}

pub struct Listener {
    config: ListenerConfig,
    client: Arc<dyn ChatClient>,
    debouncer: Arc<ConversationDebouncer>,
    recognizer: Option<ImageRecognizer>,
}

impl Listener {
    pub fn new(
        config: ListenerConfig,
        client: Arc<dyn ChatClient>,
        debouncer: Arc<ConversationDebouncer>,
        recognizer: Option<ImageRecognizer>,
    ) -> Self {
        Self { config, client, debouncer, recognizer }
    }

    /// Check the session and register every watched conversation.
    ///
    /// Returns `false` when the client is up but not logged in.
    async fn connect(&self) -> Result<bool, String> {
        let sessions = self.client.sessions().await.map_err(|e| e.to_string())?;
        if sessions.is_empty() {
            warn!("Chat client reports no sessions, is it logged in?");
            return Ok(false);
        }
        for who in &self.config.listen_list {
            match self.client.listen(who).await {
                Ok(()) => info!("👂 Listening to {}", who),
                Err(e) => error!("Failed to listen to {}: {}", who, e),
            }
        }
        Ok(true)
    }

    /// Poll forever. Cancel by dropping the future.
    pub async fn run(&self) {
        let mut connected_at: Option<Instant> = None;
        loop {
            let stale = connected_at.is_none_or(|at| at.elapsed() >= self.config.revalidate_interval);
            if stale {
                match self.connect().await {
                    Ok(true) => connected_at = Some(Instant::now()),
                    Ok(false) => {
                        connected_at = None;
                        tokio::time::sleep(RECONNECT_BACKOFF).await;
                        continue;
                    }
                    Err(e) => {
                        error!("Failed to connect to chat client: {}", e);
                        connected_at = None;
                        tokio::time::sleep(RECONNECT_BACKOFF).await;
                        continue;
                    }
                }
            }

            match self.client.list_messages().await {
                Ok(chats) => {
                    for chat in chats {
                        for event in &chat.messages {
                            self.handle_event(&chat.who, event);
                        }
                    }
                }
                Err(e) => {
                    warn!("Polling failed, reconnecting: {}", e);
                    connected_at = None;
                }
            }

            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    fn handle_event(&self, who: &str, event: &InboundEvent) {
        let Some(routed) = route_event(who, event, &self.config.robot_name) else {
            debug!("Ignoring {} event in {}", event.kind, who);
            return;
        };

        let Routed { key, sender, routing_target, payload } = routed;
        match payload {
            Payload::Text(text) => {
                let preview: String = text.chars().take(50).collect();
                info!("📩 {} in {}: \"{}\"", sender, who, preview);
                self.debouncer.on_message(key, &text, &sender, &routing_target);
            }
            Payload::Image { path, is_emoji } => {
                let Some(ref recognizer) = self.recognizer else {
                    debug!("No recognition configured, dropping picture from {}", sender);
                    return;
                };
                let recognizer = recognizer.clone();
                let debouncer = self.debouncer.clone();
                tokio::spawn(async move {
                    let description = recognizer.recognize(path, is_emoji).await;
                    debouncer.on_message(key, &description, &sender, &routing_target);
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bot::client::{ChatEvents, ClientError};
    use crate::bot::debounce::{BatchProcessor, DebounceConfig, FlushedBatch};
    use crate::bot::test_support::RecordingClient;
    use async_trait::async_trait;
    use std::sync::Mutex;

    fn event(kind: &str, sender: &str, content: &str) -> InboundEvent {
        InboundEvent {
            kind: kind.to_string(),
            content: content.to_string(),
            sender: sender.to_string(),
            image_path: None,
            is_emoji: false,
        }
    }

    #[test]
    fn test_private_message_routed() {
        let routed = route_event("小明", &event("friend", "小明", "你好"), "小K").unwrap();
        assert_eq!(routed.key, ConversationKey::from("小明"));
        assert_eq!(routed.routing_target, "小明");
        assert_eq!(routed.payload, Payload::Text("你好".into()));
    }

    #[test]
    fn test_group_requires_mention() {
        assert!(route_event("家人群", &event("friend", "小明", "大家好"), "小K").is_none());
        // A plain space is not the client's mention separator
        assert!(route_event("家人群", &event("friend", "小明", "@小K 你好"), "小K").is_none());

        let routed = route_event("家人群", &event("friend", "小明", "@小K\u{2005}讲个笑话"), "小K").unwrap();
        assert_eq!(routed.key, ConversationKey::from("家人群"));
        assert_eq!(routed.sender, "小明");
        assert_eq!(routed.routing_target, "家人群");
        assert_eq!(routed.payload, Payload::Text("讲个笑话".into()));
    }

    #[test]
    fn test_group_ignored_without_robot_name() {
        assert!(route_event("家人群", &event("friend", "小明", "@\u{2005}你好"), "").is_none());
    }

    #[test]
    fn test_non_friend_and_empty_ignored() {
        assert!(route_event("小明", &event("self", "小明", "你好"), "小K").is_none());
        assert!(route_event("小明", &event("sys", "小明", "你好"), "小K").is_none());
        assert!(route_event("家人群", &event("friend", "小明", "@小K\u{2005}"), "小K").is_none());
    }

    #[test]
    fn test_picture_routed_as_image() {
        let mut picture = event("friend", "小明", "[图片]");
        picture.image_path = Some("/tmp/wx/pic.jpg".into());
        picture.is_emoji = true;
        let routed = route_event("小明", &picture, "小K").unwrap();
        assert_eq!(
            routed.payload,
            Payload::Image { path: PathBuf::from("/tmp/wx/pic.jpg"), is_emoji: true }
        );
    }

    struct Recorder {
        batches: Mutex<Vec<FlushedBatch>>,
    }

    #[async_trait]
    impl BatchProcessor for Recorder {
        async fn process(&self, batch: FlushedBatch) -> Result<(), String> {
            self.batches.lock().unwrap().push(batch);
            Ok(())
        }
    }

    fn listener_config() -> ListenerConfig {
        ListenerConfig {
            robot_name: "小K".into(),
            listen_list: vec!["小明".into(), "家人群".into()],
            poll_interval: Duration::from_millis(10),
            revalidate_interval: Duration::from_secs(600),
        }
    }

    #[tokio::test]
    async fn test_run_routes_polled_messages() {
        let client = Arc::new(RecordingClient::new());
        client.push_poll(Ok(vec![
            ChatEvents { who: "小明".into(), messages: vec![event("friend", "小明", "在吗")] },
            ChatEvents {
                who: "家人群".into(),
                messages: vec![
                    event("friend", "小红", "没人理我"),
                    event("friend", "小红", "@小K\u{2005}早上好"),
                ],
            },
        ]));

        let recorder = Arc::new(Recorder { batches: Mutex::new(Vec::new()) });
        let debouncer = Arc::new(ConversationDebouncer::new(
            DebounceConfig { quiet_period: Duration::from_millis(50), max_batch_messages: 5 },
            recorder.clone(),
        ));
        let listener = Listener::new(listener_config(), client.clone(), debouncer, None);

        let _ = tokio::time::timeout(Duration::from_millis(300), listener.run()).await;

        assert_eq!(*client.listened.lock().unwrap(), vec!["小明", "家人群"]);
        let batches = recorder.batches.lock().unwrap().clone();
        assert_eq!(batches.len(), 2);

        let group = batches.iter().find(|b| b.is_group()).unwrap();
        assert_eq!(group.sender, "小红");
        assert!(group.merged.ends_with("早上好"));
        assert!(!group.merged.contains("没人理我"));

        let private = batches.iter().find(|b| !b.is_group()).unwrap();
        assert_eq!(private.routing_target, "小明");
        assert!(private.merged.ends_with("在吗"));
    }

    #[tokio::test]
    async fn test_poll_error_triggers_reconnect() {
        let client = Arc::new(RecordingClient::new());
        client.push_poll(Err(ClientError::Http("window lost".into())));

        let recorder = Arc::new(Recorder { batches: Mutex::new(Vec::new()) });
        let debouncer = Arc::new(ConversationDebouncer::new(
            DebounceConfig { quiet_period: Duration::from_millis(50), max_batch_messages: 5 },
            recorder,
        ));
        let listener = Listener::new(listener_config(), client.clone(), debouncer, None);

        let _ = tokio::time::timeout(Duration::from_millis(200), listener.run()).await;
        assert_eq!(*client.connects.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_no_sessions_backs_off() {
        let client = Arc::new(RecordingClient::new());
        client.sessions.lock().unwrap().clear();

        let recorder = Arc::new(Recorder { batches: Mutex::new(Vec::new()) });
        let debouncer = Arc::new(ConversationDebouncer::new(
            DebounceConfig { quiet_period: Duration::from_millis(50), max_batch_messages: 5 },
            recorder,
        ));
        let listener = Listener::new(listener_config(), client.clone(), debouncer, None);

        let _ = tokio::time::timeout(Duration::from_millis(200), listener.run()).await;
        assert_eq!(*client.connects.lock().unwrap(), 1);
        assert!(client.listened.lock().unwrap().is_empty());
    }
}
