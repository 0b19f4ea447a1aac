//! Truman Node Binary
//!
//! Runs a mesh node with a line-oriented console:
//!
//! ```text
//! truman [config.json] [whitelisted peer ids...]
//!
//! /id              local peer id and tier
//! /peers           connected peers
//! /ping <id>       round-trip time to a peer
//! /pingall         round-trip time to every peer
//! /wolf <id>       promote a peer (wolves only)
//! /stats           node counters
//! /quit            leave the mesh
//! <tag>: <text>    broadcast with tag general, important or emergency
//! <text>           broadcast with tag general
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::FmtSubscriber;

use truman_core::crypto::NodeIdentity;
use truman_core::network::{MdnsDiscovery, TcpTransport, Transport};
use truman_core::node::{NetworkNode, NodeConfig};
use truman_core::types::{PeerId, Tag};

#[tokio::main]
async fn main() {
    let mut args = std::env::args().skip(1);
    let config_path = PathBuf::from(args.next().unwrap_or_else(|| "config.json".to_string()));
    let whitelist: Vec<String> = args.collect();

    // Load or create configuration
    let mut notes = Vec::new();
    let config = if config_path.exists() {
        match NodeConfig::load(&config_path) {
            Ok(cfg) => {
                notes.push(format!("Loaded configuration from {}", config_path.display()));
                cfg
            }
            Err(e) => {
                notes.push(format!("Failed to load config ({}), using defaults", e));
                NodeConfig::default()
            }
        }
    } else {
        let config = NodeConfig::default();

        // Save default config for reference
        match config.save(&config_path) {
            Ok(()) => notes.push(format!(
                "No config file found, saved defaults to {}",
                config_path.display()
            )),
            Err(e) => notes.push(format!("Failed to save default config: {}", e)),
        }

        config
    };

    // Initialize logging
    let subscriber = FmtSubscriber::builder()
        .with_max_level(config.logging.max_level())
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");

    println!(
        r#"
  _____
 |_   _| __ _   _ _ __ ___   __ _ _ __
   | || '__| | | | '_ ` _ \ / _` | '_ \
   | || |  | |_| | | | | | | (_| | | | |
   |_||_|   \__,_|_| |_| |_|\__,_|_| |_|
    "#
    );

    info!("Truman mesh node v{}", env!("CARGO_PKG_VERSION"));
    for note in notes {
        info!("{}", note);
    }

    // Print configuration summary
    info!("Listen address: {}", config.network.listen_addr);
    info!("Bootstrap peers: {}", config.network.bootstrap_peers.len());
    info!("Max peers: {}", config.network.max_peers);
    info!("mDNS discovery: {}", if config.discovery.mdns { "on" } else { "off" });
    info!("Starting tier: {}", config.identity.tier);
    if whitelist.is_empty() {
        info!("Admission: open");
    } else {
        info!("Admission: {} whitelisted peers", whitelist.len());
    }

    let identity = match &config.identity.key_path {
        Some(path) => NodeIdentity::load_or_generate(path),
        None => NodeIdentity::generate(),
    };
    let identity = match identity {
        Ok(identity) => identity,
        Err(e) => {
            error!("Failed to create identity: {}", e);
            std::process::exit(1);
        }
    };

    let transport: Arc<dyn Transport> =
        Arc::new(TcpTransport::new(config.network.transport_config()));
    let node = if config.discovery.mdns {
        let discovery = Arc::new(MdnsDiscovery::new(&config.discovery));
        NetworkNode::with_discovery(config, identity, whitelist, transport, discovery)
    } else {
        NetworkNode::new(config, identity, whitelist, transport)
    };

    if let Err(e) = node.start().await {
        error!("Failed to start node: {}", e);
        std::process::exit(1);
    }
    node.start_gossip_loop();
    info!("Peer ID: {}", node.local_peer_id());

    // Print events as they arrive
    let printer = {
        let node = Arc::clone(&node);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(250));
            loop {
                interval.tick().await;
                for event in node.collect_events() {
                    println!("{}", event);
                }
            }
        })
    };

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal");
                break;
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if !run_command(&node, line.trim()).await {
                        break;
                    }
                }
                Ok(None) => {
                    // stdin closed, keep serving until ctrl-c
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        warn!("Cannot wait for ctrl-c: {}", e);
                    }
                    break;
                }
                Err(e) => {
                    warn!("Console read failed: {}", e);
                    break;
                }
            }
        }
    }

    printer.abort();
    node.cleanup().await;
    info!("Goodbye!");
}

/// Run one console line. Returns false to quit.
async fn run_command(node: &Arc<NetworkNode>, line: &str) -> bool {
    if line.is_empty() {
        return true;
    }

    let (command, arg) = match line.split_once(' ') {
        Some((command, arg)) => (command, arg.trim()),
        None => (line, ""),
    };

    match command {
        "/quit" | "/exit" => return false,
        "/id" => println!("{} ({})", node.local_peer_id(), node.local_tier()),
        "/peers" => {
            let peers = node.get_peers();
            println!("{} connected", peers.len());
            for peer in peers {
                println!("  {}", peer);
            }
        }
        "/ping" => match arg.parse::<PeerId>() {
            Ok(peer) => println!("{} ms", node.ping(&peer).await),
            Err(e) => println!("{}", e),
        },
        "/pingall" => {
            for (peer, rtt) in node.ping_all().await {
                println!("  {} {} ms", peer.short(), rtt);
            }
        }
        "/wolf" => match arg.parse::<PeerId>() {
            Ok(peer) => println!("promoted: {}", node.new_wolf(&peer)),
            Err(e) => println!("{}", e),
        },
        "/stats" => println!("{:#?}", node.stats()),
        _ if command.starts_with('/') => println!("unknown command {}", command),
        _ => {
            let (tag, text) = match line.split_once(':') {
                Some((tag, text)) => match tag.parse::<Tag>() {
                    Ok(tag) => (tag, text.trim()),
                    Err(_) => (Tag::General, line),
                },
                None => (Tag::General, line),
            };
            if !node.broadcast_message(text, tag) {
                println!("broadcast failed");
            }
        }
    }
    true
}
