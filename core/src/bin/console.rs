/// Interactive socket console: drive one chat session from the terminal
use colored::*;
use helplink_core::{ChatClient, Config, SyncUpdate};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let (identity, config) = Config::from_args(&args)
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;

    let default_level = if config.debug { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    println!("{}", "⚡ Helplink socket console".bright_cyan().bold());
    println!("  {} {}", "socket:".dimmed(), config.socket_url);
    println!("  {} {}", "api:".dimmed(), config.api_base_url);

    let client = ChatClient::from_config(config)
        .map_err(|e| anyhow::anyhow!("Client error: {}", e))?;
    let mut updates = client.updates();
    let connection_id = client.start(&identity);
    println!(
        "{} connecting as {} ({})",
        "→".cyan(),
        identity.bright_white().bold(),
        connection_id.to_string().dimmed()
    );
    print_help();

    let printer = tokio::spawn(async move {
        loop {
            match updates.recv().await {
                Ok(update) => print_update(&update),
                Err(RecvError::Lagged(skipped)) => {
                    println!("{} skipped {} updates", "!".yellow(), skipped)
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
        let rest = rest.trim();

        match command {
            "quit" | "exit" => break,
            "help" => print_help(),
            "open" if !rest.is_empty() => match client.open_conversation(rest).await {
                Ok(Some(view)) => {
                    println!("{} {} ({} messages)", "✓".green(), view.conversation_id, view.len());
                    for message in view.messages() {
                        print_message(&identity, message);
                    }
                }
                Ok(None) => println!("{} superseded", "…".dimmed()),
                Err(e) => failed(e),
            },
            "send" if !rest.is_empty() => match client.send_message(rest).await {
                Ok(message) => println!("{} sent {}", "✓".green(), message.id.dimmed()),
                Err(e) => failed(e),
            },
            "type" => {
                if let Err(e) = client.keystroke() {
                    failed(e);
                }
            }
            "delete" if !rest.is_empty() => match client.delete_message(rest).await {
                Ok(()) => println!("{} deleted {}", "✓".green(), rest),
                Err(e) => failed(e),
            },
            "react" => match rest.split_once(' ') {
                Some((id, emoji)) => match client.react(id, emoji.trim()).await {
                    Ok(message) => println!("{} {} reactions", "✓".green(), message.reactions.len()),
                    Err(e) => failed(e),
                },
                None => println!("{}", "Usage: react <message-id> <emoji>".yellow()),
            },
            "unreact" if !rest.is_empty() => match client.unreact(rest).await {
                Ok(message) => println!("{} {} reactions", "✓".green(), message.reactions.len()),
                Err(e) => failed(e),
            },
            "clear" => match client.clear_conversation().await {
                Ok(()) => println!("{} cleared", "✓".green()),
                Err(e) => failed(e),
            },
            "chats" => match client.conversations().await {
                Ok(list) => {
                    for chat in list {
                        println!(
                            "  {} {} {}",
                            chat.other_user.display_name().bright_white(),
                            chat.conversation_id.to_string().dimmed(),
                            if chat.unread_count > 0 {
                                format!("({} unread)", chat.unread_count).yellow().to_string()
                            } else {
                                String::new()
                            }
                        );
                    }
                }
                Err(e) => failed(e),
            },
            "online" => {
                let online = client.online();
                println!("{} {} online", "●".green(), online.len());
                for id in online {
                    let name = client
                        .profile(&id)
                        .map(|p| p.display_name().to_string())
                        .unwrap_or_else(|| id.clone());
                    println!("  {} {}", name.bright_white(), id.dimmed());
                }
            }
            "notifications" => {
                for n in client.notifications() {
                    let marker = if n.read { " ".normal() } else { "•".yellow() };
                    println!("  {} {} {}", marker, n.message, n.id.dimmed());
                }
                println!("{} unread", client.unread_notifications());
            }
            "state" => {
                let connection = client.connection();
                println!(
                    "  {} {:?}\n  {} {:?}\n  {} {}\n  {} {}",
                    "state:".dimmed(),
                    connection.state(),
                    "connection:".dimmed(),
                    connection.connection_id(),
                    "pending:".dimmed(),
                    connection.pending_len(),
                    "subscribers:".dimmed(),
                    connection.dispatcher().total_subscribers()
                );
            }
            "reconnect" => {
                client.stop();
                let id = client.start(&identity);
                println!("{} reconnecting ({})", "→".cyan(), id.to_string().dimmed());
            }
            other => {
                println!("{} Unknown command: {}", "✗".red().bold(), other.red());
                print_help();
            }
        }
    }

    client.shutdown();
    printer.abort();
    println!("{}", "bye".dimmed());
    Ok(())
}

fn failed(e: helplink_core::SyncError) {
    println!("{} {}", "✗".red().bold(), e.to_string().red());
}

fn print_message(me: &str, message: &helplink_core::models::Message) {
    let who = if message.sender_id == me {
        "me".cyan()
    } else {
        message.sender_id.as_str().magenta()
    };
    let read = if message.read { "✓✓" } else { "✓" };
    println!(
        "  {} {} {} {}",
        message.created_at.format("%H:%M").to_string().dimmed(),
        who,
        message.content,
        read.dimmed()
    );
}

fn print_update(update: &SyncUpdate) {
    match update {
        SyncUpdate::ConnectionChanged(state) => {
            println!("{} connection {:?}", "◆".blue(), state)
        }
        SyncUpdate::ConversationChanged(id) => {
            println!("{} conversation {} changed", "◆".blue(), id.to_string().dimmed())
        }
        SyncUpdate::PresenceChanged { online } => {
            println!("{} {} online", "●".green(), online.len())
        }
        SyncUpdate::TypingChanged(change) => {
            let text = if change.is_typing { "is typing…" } else { "stopped typing" };
            println!("{} {} {}", "✎".dimmed(), change.user_id.magenta(), text.dimmed())
        }
        SyncUpdate::NotificationsChanged { unread, chat_unread } => println!(
            "{} {} notifications, {} chat messages unread",
            "🔔".yellow(),
            unread,
            chat_unread
        ),
        SyncUpdate::PostUpdated(post) => println!(
            "{} post {} {}",
            "◆".blue(),
            post.id.dimmed(),
            post.status.as_deref().unwrap_or("")
        ),
        SyncUpdate::ProfileUpdated(profile) => {
            println!("{} {} updated their profile", "◆".blue(), profile.display_name())
        }
        SyncUpdate::Notice(text) => println!("{} {}", "!".yellow().bold(), text.yellow()),
    }
}

fn print_help() {
    println!("{}", "Commands:".bright_white().bold());
    println!("  {} <user-id>          Open the conversation with a user", "open".cyan());
    println!("  {} <text>             Send a message", "send".cyan());
    println!("  {}                    Announce typing", "type".cyan());
    println!("  {} <message-id>     Delete a message", "delete".cyan());
    println!("  {} <id> <emoji>      React to a message", "react".cyan());
    println!("  {} <message-id>    Remove your reaction", "unreact".cyan());
    println!("  {}                   Clear the open conversation", "clear".cyan());
    println!("  {}                   List conversations", "chats".cyan());
    println!("  {}                  Who is online", "online".cyan());
    println!("  {}           Notification inbox", "notifications".cyan());
    println!("  {}                   Connection details", "state".cyan());
    println!("  {}               Disconnect and connect again", "reconnect".cyan());
    println!("  {}                    Leave", "quit".cyan());
}
