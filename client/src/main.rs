//! `hlchat`: join a market's chat room from the terminal.
//!
//! Lines read from stdin are signed with `--key` and sent; everything else in
//! the room is printed as it arrives.

use std::sync::Arc;

use anyhow::Context;
use chrono::{TimeZone, Utc};
use clap::{Parser, ValueEnum};
use hlchat_client::{
    ChatError, MeshConfig, MeshTransport, RelayConfig, RelayTransport, RoomStatus,
    RoomSynchronizer, SyncConfig, SyncListener, Transport, WakuRestNode,
};
use hlchat_common::{LocalWallet, Message, SignatureScheme};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

#[derive(Clone, Copy, ValueEnum)]
enum TransportKind {
    Relay,
    Mesh,
}

#[derive(Parser)]
#[command(name = "hlchat", about = "HL Chat terminal client")]
struct Cli {
    /// Which network to chat over.
    #[arg(long, value_enum, default_value = "relay")]
    transport: TransportKind,

    /// Gateway base URL (relay transport).
    #[arg(long, default_value = "http://localhost:3030")]
    gateway_url: String,

    /// nwaku REST URL (mesh transport).
    #[arg(long, default_value = "http://localhost:8645")]
    waku_url: String,

    /// Trading pair, e.g. "BTC".
    #[arg(long)]
    pair: String,

    /// Market, e.g. "perp" or "spot".
    #[arg(long, default_value = "perp")]
    market: String,

    /// Hex private key to sign with. A throwaway key is generated if omitted.
    #[arg(long, env = "HLCHAT_KEY")]
    key: Option<String>,

    /// Display name to attach to messages (must be owned by the key's address).
    #[arg(long)]
    name: Option<String>,

    /// Sign EIP-712 typed data instead of personal_sign strings.
    #[arg(long)]
    typed: bool,
}

struct Printer;

fn print_message(message: &Message) {
    let when = Utc
        .timestamp_millis_opt(message.timestamp as i64)
        .single()
        .map(|t| t.format("%H:%M:%S").to_string())
        .unwrap_or_default();
    let who = message
        .display_name
        .clone()
        .unwrap_or_else(|| message.address.to_string());
    println!("[{when}] {who}: {}", message.content);
}

impl SyncListener for Printer {
    fn on_message(&self, message: &Message) {
        print_message(message);
    }

    fn on_history_loaded(&self, messages: &[Message]) {
        for message in messages {
            print_message(message);
        }
        println!("--- {} messages of history ---", messages.len());
    }

    fn on_connection_status_change(&self, connected: bool) {
        if !connected {
            println!("--- connection lost, reconnecting ---");
        }
    }

    fn on_error(&self, error: &ChatError) {
        eprintln!("! {}", error.user_message());
    }

    fn on_status(&self, status: &RoomStatus) {
        match status {
            RoomStatus::LoadingHistory { attempt } if *attempt > 1 => {
                println!("--- retrying history (attempt {attempt}) ---")
            }
            RoomStatus::Failed { .. } => println!("--- room unavailable, type /retry ---"),
            _ => {}
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let wallet = match &cli.key {
        Some(key) => LocalWallet::from_hex(key).context("invalid --key")?,
        None => LocalWallet::random(),
    };
    println!("chatting as {}", wallet.address());

    let scheme = if cli.typed {
        SignatureScheme::Typed
    } else {
        SignatureScheme::Personal
    };

    let transport: Arc<dyn Transport> = match cli.transport {
        TransportKind::Relay => {
            let config = RelayConfig {
                scheme,
                ..RelayConfig::new(cli.gateway_url.clone())
            };
            Arc::new(RelayTransport::new(config).context("failed to set up relay transport")?)
        }
        TransportKind::Mesh => {
            let node = WakuRestNode::new(&cli.waku_url).context("failed to set up nwaku client")?;
            Arc::new(MeshTransport::new(Arc::new(node), MeshConfig::default()))
        }
    };

    let sync = RoomSynchronizer::new(
        transport,
        Arc::new(Printer),
        SyncConfig {
            scheme,
            display_name: cli.name.clone(),
            local_address: Some(wallet.address()),
            ..SyncConfig::default()
        },
    );

    if let Err(e) = sync.set_room(&cli.pair, &cli.market).await {
        eprintln!("! {}", e.user_message());
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("failed to read stdin")? {
        let line = line.trim();
        match line {
            "" => continue,
            "/quit" => break,
            "/retry" => {
                let _ = sync.retry().await;
            }
            content => {
                if let Ok(message) = sync.send_message(content, &wallet).await {
                    print_message(&message);
                }
            }
        }
    }

    sync.shutdown().await;
    Ok(())
}
