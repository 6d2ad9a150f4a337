use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::prelude::*;

use wxrelay::bot::{
    ChatClient, ConversationDebouncer, HttpChatClient, ImageRecognizer, Listener, ModelGateway, ReplyDispatcher,
    ReplyGate, TranscriptStore,
};
use wxrelay::config::Config;

#[tokio::main]
async fn main() {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "wxrelay.json".to_string());
    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };

    // Setup logging
    let log_dir = config.data_dir.join("logs");
    std::fs::create_dir_all(&log_dir).ok();
    let log_file = match std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_dir.join("wxrelay.log"))
    {
        Ok(file) => file,
        Err(e) => {
            eprintln!("Failed to open log file in {}: {e}", log_dir.display());
            std::process::exit(1);
        }
    };
    let (non_blocking, _guard) = tracing_appender::non_blocking(log_file);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stdout)
                .with_filter(
                    tracing_subscriber::EnvFilter::from_default_env()
                        .add_directive(tracing::Level::INFO.into()),
                ),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_filter(
                    tracing_subscriber::EnvFilter::from_default_env()
                        .add_directive(tracing::Level::INFO.into()),
                ),
        )
        .init();

    info!("🚀 Starting wxrelay...");
    info!("Loaded config from {config_path}");
    info!("Listening to: {:?}", config.listen_list);
    for warning in &config.warnings {
        warn!("{warning}");
    }
    if config.robot_name.is_empty() {
        warn!("robot_name is empty, group messages will be ignored");
    }

    let transcripts = match TranscriptStore::open(&config.transcript_path()) {
        Ok(store) => Arc::new(store),
        Err(e) => fatal(&format!("Failed to open transcript store: {e}")),
    };

    let gate = ReplyGate::new();
    let recognizer = match config
        .recognition()
        .map(|rc| {
            info!("Image recognition enabled ({})", rc.model);
            ImageRecognizer::spawn(rc, gate.clone())
        })
        .transpose()
    {
        Ok(recognizer) => recognizer,
        Err(e) => fatal(&e),
    };

    let client: Arc<dyn ChatClient> = match HttpChatClient::new(config.bridge_url.clone()) {
        Ok(client) => Arc::new(client),
        Err(e) => fatal(&e),
    };
    let gateway = match ModelGateway::new(config.gateway()) {
        Ok(gateway) => Arc::new(gateway),
        Err(e) => fatal(&e),
    };
    let dispatcher = Arc::new(ReplyDispatcher::new(
        config.dispatch(),
        client.clone(),
        gateway,
        transcripts,
        gate,
    ));
    let debouncer = Arc::new(ConversationDebouncer::new(config.debounce(), dispatcher));
    let listener = Listener::new(config.listener(), client, debouncer, recognizer);

    tokio::select! {
        _ = listener.run() => {}
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!("Failed to listen for shutdown signal: {e}");
            }
            info!("👋 Shutting down");
        }
    }
}

/// Log a startup failure to both sinks and exit.
fn fatal(msg: &str) -> ! {
    error!("{msg}");
    eprintln!("{msg}");
    std::process::exit(1);
}
