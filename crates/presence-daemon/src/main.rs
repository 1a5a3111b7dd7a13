//! presence-daemon: LAN discovery node with a chat room on stdin.
//!
//! Finds peers in the same groups, tracks them with heartbeats, and relays
//! `/message` lines between them.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use presence_core::config::{parse_targets, split_list};
use presence_core::{DiscoveryEngine, NodeConfig, NodeEvent, NodeEventKind, RelayedMessage};
use presence_daemon::chat::{self, ChatCommand};
use presence_daemon::{interfaces, UdpTransport, DEFAULT_PORT};

#[derive(Parser, Debug)]
#[command(name = "presence-daemon")]
#[command(about = "LAN peer discovery node with a stdin chat room")]
struct Args {
    /// YAML node configuration
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Name advertised to peers (default: host name)
    #[arg(short, long)]
    name: Option<String>,

    /// Comma-separated groups to join
    #[arg(short, long)]
    group: Option<String>,

    /// Comma-separated request targets (default: interface broadcast addresses)
    #[arg(long)]
    targets: Option<String>,

    /// Shared secret; enables secret mode
    #[arg(long)]
    secret: Option<String>,

    /// UDP port to listen on and send to
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Treat our own broadcasts as a peer
    #[arg(long)]
    allow_loopback: bool,

    /// Tick period in milliseconds
    #[arg(long, default_value_t = 100)]
    tick_ms: u64,

    /// Print lifecycle events as JSON lines
    #[arg(long)]
    json_events: bool,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
}

impl Args {
    /// Config file (if any) with command-line overrides applied.
    fn node_config(&self) -> Result<NodeConfig> {
        let mut config = match &self.config {
            Some(path) => NodeConfig::from_yaml_file(path)
                .with_context(|| format!("Failed to load config {:?}", path))?,
            None => NodeConfig::default(),
        };
        if let Some(name) = &self.name {
            config.name = name.clone();
        }
        if let Some(groups) = &self.group {
            config.groups = split_list(groups);
        }
        if let Some(targets) = &self.targets {
            config.targets = Some(parse_targets(targets)?);
        }
        if let Some(secret) = &self.secret {
            config.secret = Some(secret.clone());
        }
        if self.allow_loopback {
            config.allow_loopback = true;
        }
        Ok(config)
    }
}

/// Daemon state: the node plus output preferences.
struct Daemon {
    engine: DiscoveryEngine<UdpTransport>,
    json_events: bool,
}

impl Daemon {
    fn on_event(&self, event: NodeEvent) {
        if self.json_events {
            match serde_json::to_string(&event) {
                Ok(json) => println!("{}", json),
                Err(e) => warn!("Failed to serialize event: {}", e),
            }
            return;
        }
        let verb = match event.kind {
            NodeEventKind::Found => "joined",
            NodeEventKind::PropertyChanged => "updated",
            NodeEventKind::Disconnected => "left",
            NodeEventKind::Lost => "went silent",
            NodeEventKind::Reconnected => "is back",
        };
        println!("* {}({}) {}", event.peer.name, event.peer.address, verb);
    }

    fn on_relayed(&self, message: RelayedMessage) {
        match chat::format_chat(&message, &self.engine.peers()) {
            Some(line) => println!("{}", line),
            None => debug!("Unhandled message {} from {}", message.address, message.sender),
        }
    }

    fn on_line(&mut self, line: &str) {
        let Some(command) = ChatCommand::parse(line) else {
            return;
        };
        match command {
            ChatCommand::Say(text) => {
                self.engine.broadcast_message(&chat::chat_message(&text));
            }
            ChatCommand::Name(name) => {
                self.engine.set_name(name);
                self.engine.request(None);
            }
            ChatCommand::Room(groups) => {
                self.engine.set_groups(split_list(&groups));
                self.engine.request(None);
            }
            ChatCommand::Enter => self.engine.request(None),
            ChatCommand::Leave => self.engine.disconnect(),
            ChatCommand::Members => println!("{}", chat::format_members(&self.engine.peers())),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,presence_daemon=debug,presence_core=debug"
    } else {
        "info,presence_daemon=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = args.node_config()?;
    let interfaces = interfaces::enumerate();
    let transport = UdpTransport::bind(args.port).await?;

    let mut daemon = Daemon {
        engine: DiscoveryEngine::new(config, interfaces, transport),
        json_events: args.json_events,
    };

    info!("Starting presence-daemon as {:?}", daemon.engine.name());
    info!("Port: {}, groups: {:?}", args.port, daemon.engine.groups());
    info!("Targets: {:?}", daemon.engine.targets());

    let (relay_tx, mut relay_rx) = mpsc::unbounded_channel();
    let _relay = daemon.engine.subscribe_messages(move |msg| {
        let _ = relay_tx.send(msg);
    });

    daemon.engine.request(None);

    let mut ticker = tokio::time::interval(Duration::from_millis(args.tick_ms.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_tick = Instant::now();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    info!("Node running. Type to chat, Ctrl+C to stop.");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let now = Instant::now();
                daemon.engine.tick(now - last_tick);
                last_tick = now;
                for event in daemon.engine.drain_events() {
                    daemon.on_event(event);
                }
            }

            Some(message) = relay_rx.recv() => {
                daemon.on_relayed(message);
            }

            line = lines.next_line(), if stdin_open => {
                match line {
                    Ok(Some(line)) => daemon.on_line(&line),
                    Ok(None) => {
                        debug!("stdin closed, chat input disabled");
                        stdin_open = false;
                    }
                    Err(e) => {
                        warn!("Failed to read stdin: {}", e);
                        stdin_open = false;
                    }
                }
            }

            // Handle graceful shutdown
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    daemon.engine.disconnect();
    info!("Shutting down");
    Ok(())
}
