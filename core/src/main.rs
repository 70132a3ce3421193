/// Helplink sync node - headless session runner
use helplink_core::{ChatClient, Config, SyncUpdate};
use std::env;
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse configuration
    let args: Vec<String> = env::args().collect();
    let (identity, config) = Config::from_args(&args)
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;

    // Initialize tracing
    let default_level = if config.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_level))
        )
        .init();

    info!("🚀 Starting Helplink sync node");
    info!("   Identity: {}", identity);
    info!("   Socket: {}", config.socket_url);
    info!("   API: {}", config.api_base_url);

    let client = ChatClient::from_config(config)
        .map_err(|e| anyhow::anyhow!("Client error: {}", e))?;
    let mut updates = client.updates();
    let connection_id = client.start(&identity);
    info!("   Connection: {}", connection_id);

    if let Err(e) = client.load_notifications().await {
        warn!("Notifications unavailable: {}", e);
    }

    let logger = tokio::spawn(async move {
        loop {
            match updates.recv().await {
                Ok(update) => log_update(&update),
                Err(RecvError::Lagged(skipped)) => warn!("Skipped {} updates", skipped),
                Err(RecvError::Closed) => break,
            }
        }
    });

    wait_for_shutdown().await;
    info!("Shutdown signal received, stopping...");

    client.shutdown();
    logger.abort();
    info!("Stopped");
    Ok(())
}

fn log_update(update: &SyncUpdate) {
    match update {
        SyncUpdate::ConnectionChanged(state) => info!("Connection: {:?}", state),
        SyncUpdate::ConversationChanged(id) => info!("Conversation {} changed", id),
        SyncUpdate::PresenceChanged { online } => info!("{} online: {:?}", online.len(), online),
        SyncUpdate::TypingChanged(change) => info!(
            "{} {} in {}",
            change.user_id,
            if change.is_typing { "is typing" } else { "stopped typing" },
            change.conversation_id
        ),
        SyncUpdate::NotificationsChanged { unread, chat_unread } => {
            info!("Unread: {} notifications, {} chat messages", unread, chat_unread)
        }
        SyncUpdate::PostUpdated(post) => info!(
            "Post {} is now {}",
            post.id,
            post.status.as_deref().unwrap_or("unchanged")
        ),
        SyncUpdate::ProfileUpdated(profile) => info!("Profile {} updated", profile.display_name()),
        SyncUpdate::Notice(text) => warn!("{}", text),
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn wait_for_shutdown() {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => info!("Ctrl+C received"),
            Err(e) => {
                error!("Failed to install Ctrl+C handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                info!("SIGTERM received");
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
