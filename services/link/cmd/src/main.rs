//! dfs-link node binary.
//!
//! Runs one link node: listens for inbound links, dials configured peers,
//! keeps every online peer warm with a periodic echo and logs the peer
//! lifecycle until Ctrl-C.

use clap::Parser;
use link_session::{
    listen_tcp, CallbackMode, EventContext, EventKind, LinkNode, LinkNodeBuilder, PeerStatus,
    TcpConnector,
};
use link_wire::VERSION_LEGACY;
use std::{collections::BTreeMap, net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod logging;

use config::NodeConfig;
use logging::LinkLogFormatter;

/// Distributed filesystem link node
#[derive(Parser, Debug)]
#[command(name = "dfs-link", version, about = "Peer link node for the distributed filesystem")]
struct Args {
    /// Configuration file path
    #[arg(long, default_value = "link.yaml")]
    config: PathBuf,

    /// Device id announced to peers (overrides the config file)
    #[arg(long)]
    device_id: Option<String>,

    /// Listen address, e.g. 0.0.0.0:9100
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Peer to dial as device@address, e.g. device-b@127.0.0.1:9100 (repeatable)
    #[arg(long, value_parser = parse_peer)]
    connect: Vec<(String, SocketAddr)>,

    /// Echo interval for online peers, e.g. 10s
    #[arg(long, default_value = "10s")]
    echo_interval: humantime::Duration,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,
}

fn parse_peer(value: &str) -> Result<(String, SocketAddr), String> {
    let (cid, addr) = value
        .split_once('@')
        .ok_or_else(|| format!("expected device@address, got {:?}", value))?;
    if cid.is_empty() {
        return Err("device id must not be empty".to_string());
    }
    let addr = addr
        .parse::<SocketAddr>()
        .map_err(|e| format!("invalid address {:?}: {}", addr, e))?;
    Ok((cid.to_string(), addr))
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Load configuration before logging so the file can pick the level
    let mut node_config = NodeConfig::load_from_file(&args.config)?;
    if let Some(device_id) = args.device_id.clone() {
        node_config.device_id = device_id;
    }
    if args.listen.is_some() {
        node_config.listen = args.listen;
    }
    let log_level = args
        .log_level
        .clone()
        .unwrap_or_else(|| node_config.log_level.clone());

    let env_filter = EnvFilter::new("info")
        .add_directive(format!("dfs_link={}", log_level).parse()?)
        .add_directive(format!("link_session={}", log_level).parse()?)
        .add_directive(format!("link_wire={}", log_level).parse()?);

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_ansi(true)
        .event_format(LinkLogFormatter::new("link"))
        .init();

    info!("Starting dfs-link v{}", env!("CARGO_PKG_VERSION"));

    let mut peers: BTreeMap<String, SocketAddr> = node_config.peers.clone();
    peers.extend(args.connect.iter().cloned());

    let connector = Arc::new(TcpConnector::new());
    for (cid, addr) in &peers {
        connector.set_address(cid.clone(), *addr);
    }

    let node = LinkNodeBuilder::new(node_config.to_link_config())
        .tcp_connector(Arc::clone(&connector))
        .build()?;
    register_lifecycle_logging(&node)?;

    if let Some(addr) = node_config.listen {
        let listener = listen_tcp(addr).await?;
        let server = node.clone();
        tokio::spawn(async move {
            if let Err(e) = server.serve(listener).await {
                component_warn!("server", "Listener stopped: {}", e);
            }
        });
    }

    for (cid, addr) in peers {
        let dialer = node.clone();
        tokio::spawn(async move {
            match dialer.connect(&cid, addr).await {
                Ok(conn) => component_info!("dial", "Dialed {} at {} (connection {})", cid, addr, conn.id()),
                Err(e) => component_warn!("dial", "Failed to dial {} at {}: {}", cid, addr, e),
            }
        });
    }

    let echo_node = node.clone();
    let echo_interval = Duration::from(args.echo_interval);
    let echo_task = tokio::spawn(async move { run_echo_loop(echo_node, echo_interval).await });

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested, stopping connections");
    echo_task.abort();
    node.connections_stop().await;
    info!("dfs-link stopped");
    Ok(())
}

fn register_lifecycle_logging(node: &LinkNode) -> anyhow::Result<()> {
    for kind in [EventKind::Add, EventKind::Online, EventKind::Offline, EventKind::Del] {
        node.register_event_callback(kind, CallbackMode::Sync, VERSION_LEGACY, "lifecycle-log", log_event)?;
    }
    for kind in [EventKind::Online, EventKind::Offline] {
        node.register_event_callback(kind, CallbackMode::Async, VERSION_LEGACY, "lifecycle-settle", |ctx| {
            component_debug!("peer", "Peer {} settled {} (seq {})", ctx.peer_cid, ctx.event, ctx.seq);
            Ok(())
        })?;
    }
    Ok(())
}

fn log_event(ctx: &EventContext<'_>) -> anyhow::Result<()> {
    component_info!(
        "peer",
        "Peer {} {} (device {}, version {}, seq {})",
        ctx.peer_cid,
        ctx.event,
        ctx.device_id,
        ctx.version,
        ctx.seq
    );
    Ok(())
}

async fn run_echo_loop(node: LinkNode, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        for peer in node.peers().await {
            if peer.status != PeerStatus::Online {
                continue;
            }
            let started = std::time::Instant::now();
            match node.echo(&peer.cid).await {
                Ok(iid) => component_debug!(
                    "echo",
                    "Echo from {} (iid {}) in {:?}",
                    peer.cid,
                    iid,
                    started.elapsed()
                ),
                Err(e) => warn!("Echo to {} failed: {}", peer.cid, e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_peer() {
        let (cid, addr) = parse_peer("device-b@127.0.0.1:9100").unwrap();
        assert_eq!(cid, "device-b");
        assert_eq!(addr.port(), 9100);
        assert!(parse_peer("127.0.0.1:9100").is_err());
        assert!(parse_peer("@127.0.0.1:9100").is_err());
        assert!(parse_peer("device-b@nowhere").is_err());
    }

    #[test]
    fn test_cli_flags() {
        let args = Args::try_parse_from([
            "dfs-link",
            "--device-id",
            "device-a",
            "--connect",
            "device-b@127.0.0.1:9100",
            "--connect",
            "device-c@127.0.0.1:9101",
            "--echo-interval",
            "2s",
        ])
        .unwrap();
        assert_eq!(args.device_id.as_deref(), Some("device-a"));
        assert_eq!(args.connect.len(), 2);
        assert_eq!(Duration::from(args.echo_interval), Duration::from_secs(2));
        assert!(args.log_level.is_none());
    }
}
