//! salut-chat — interactive link-local chat client.
//!
//! Registers a presence on the local link, prints peers as they come and
//! go, and offers a small command loop:
//!
//!   list                     known peers
//!   msg <peer> <text...>     send a chat message
//!   status <mode> [text]     update advertised status (avail|away|dnd)
//!   quit                     shut down

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};

use salut_core::config::ServiceConfig;
use salut_engine::{
    Chat, ChatListener, LLPresence, LLService, MdnsDiscovery, Message, MessageListener, Mode,
    PresenceListener,
};

#[derive(Parser)]
#[command(name = "salut-chat", about = "Serverless link-local XMPP chat")]
struct Args {
    /// Service name to advertise, e.g. alice@my-laptop. Defaults to
    /// $USER@$HOSTNAME.
    #[arg(long)]
    name: Option<String>,

    /// Host name to advertise (without .local.). Defaults to $HOSTNAME.
    #[arg(long)]
    host: Option<String>,

    /// Nickname for the presence TXT record.
    #[arg(long)]
    nick: Option<String>,
}

fn env_or(key: &str, fallback: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| fallback.to_string())
}

struct PrintPresence;

impl PresenceListener for PrintPresence {
    fn presence_new(&self, presence: &LLPresence) {
        println!(
            "*** {} is online ({}:{}, {})",
            presence.service_name(),
            presence.host(),
            presence.port(),
            presence.status.as_str()
        );
    }

    fn presence_removed(&self, presence: &LLPresence) {
        println!("*** {} went offline", presence.service_name());
    }

    fn presence_updated(&self, presence: &LLPresence) {
        println!(
            "*** {} is now {}",
            presence.service_name(),
            presence.status.as_str()
        );
    }
}

struct PrintMessages;

impl MessageListener for PrintMessages {
    fn process_message(&self, chat: &Arc<Chat>, message: &Message) {
        if let Some(body) = &message.body {
            println!("<{}> {}", chat.service_name(), body);
        }
    }
}

struct AttachPrinter;

impl ChatListener for AttachPrinter {
    fn new_chat(&self, chat: &Arc<Chat>) {
        chat.add_message_listener(Arc::new(PrintMessages));
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let host = args.host.unwrap_or_else(|| env_or("HOSTNAME", "localhost"));
    let name = args
        .name
        .unwrap_or_else(|| format!("{}@{}", env_or("USER", "salut"), host));

    let mut presence = LLPresence::with_addr(&name, &host, 0);
    presence.nick = args.nick;

    println!("Link-local presence name set to '{name}'");
    let discovery = Arc::new(MdnsDiscovery::new().context("failed to start mDNS daemon")?);
    let config = ServiceConfig::load().context("failed to load configuration")?;
    let service = LLService::new(presence, discovery, config);

    service.add_presence_listener(Arc::new(PrintPresence));
    service.add_chat_listener(Arc::new(AttachPrinter));

    service.init().await.context("failed to start service")?;
    let local = service.local_presence();
    println!(
        "Listening as '{}' on port {}",
        local.service_name(),
        local.port()
    );
    println!("Commands: list | msg <peer> <text> | status <avail|away|dnd> [text] | quit");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("stdin read failed")?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else { break };
        let line = line.trim();
        let mut parts = line.splitn(3, ' ');
        match parts.next().unwrap_or("") {
            "" => {}
            "quit" => break,
            "list" => {
                let peers = service.known_presences();
                if peers.is_empty() {
                    println!("(no peers on the link)");
                }
                for peer in peers {
                    println!(
                        "  {} — {}:{} ({})",
                        peer.service_name(),
                        peer.host(),
                        peer.port(),
                        peer.status.as_str()
                    );
                }
            }
            "msg" => {
                let (Some(peer), Some(text)) = (parts.next(), parts.next()) else {
                    println!("usage: msg <peer> <text>");
                    continue;
                };
                match service.chat(peer) {
                    Ok(chat) => match chat.send_text(text).await {
                        Ok(()) => println!("(sent)"),
                        Err(e) => println!("send failed: {e}"),
                    },
                    Err(e) => println!("no chat to '{peer}': {e}"),
                }
            }
            "status" => {
                let Some(mode) = parts.next() else {
                    println!("usage: status <avail|away|dnd> [text]");
                    continue;
                };
                let mut patch = service.local_presence();
                patch.status = Mode::parse(mode);
                patch.msg = parts.next().map(String::from);
                match service.update_presence(&patch) {
                    Ok(()) => println!("(status updated)"),
                    Err(e) => println!("status update failed: {e}"),
                }
            }
            other => println!("unknown command '{other}'"),
        }
    }

    println!("Shutting down...");
    service.close().await;
    Ok(())
}
