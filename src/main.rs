use gossip_kv::{GossipConfig, GossipNode, JsonCodec, NodeId, Transport, UdpTransport};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // With a config file argument, run a single long-lived node; without
    // one, run the three-node local demonstration.
    if let Some(path) = std::env::args().nth(1) {
        run_node(&path).await
    } else {
        run_demo().await
    }
}

async fn run_node(config_path: &str) -> Result<(), Box<dyn std::error::Error>> {
    let config = GossipConfig::from_toml_file(config_path)?;
    let transport = Arc::new(UdpTransport::bind(&config.bind_addr).await?);
    let node = GossipNode::new(config, transport.clone(), Arc::new(JsonCodec))?;

    node.start();
    node.join();
    println!("gossip node {} listening on {}", node.node_id(), node.local_addr());

    tokio::signal::ctrl_c().await?;
    node.stop().await;
    transport.close();
    Ok(())
}

async fn run_demo() -> Result<(), Box<dyn std::error::Error>> {
    println!("=== gossip-kv demonstration ===\n");

    let mut nodes = Vec::new();
    let mut transports: Vec<Arc<UdpTransport>> = Vec::new();
    for i in 0..3 {
        let transport = Arc::new(UdpTransport::bind("127.0.0.1:0").await?);
        let mut config = GossipConfig::new(format!("node-{}", i), transport.local_addr());
        config.gossip_interval_ms = 200;
        config.suspicion_timeout_ms = 2_000;
        config.failure_timeout_ms = 2_000;
        config.incremental_sync_interval_ms = 500;
        config.full_sync_interval_ms = 2_000;
        if let Some(seed) = transports.first() {
            config.seed_addrs = vec![seed.local_addr().to_string()];
        }
        let node = GossipNode::new(config, transport.clone(), Arc::new(JsonCodec))?;
        node.start();
        node.join();
        transports.push(transport);
        nodes.push(node);
    }

    // Everyone reconciles with node-0.
    for node in &nodes[1..] {
        node.add_sync_peer(NodeId::from("node-0"));
        nodes[0].add_sync_peer(node.node_id().clone());
    }

    tokio::time::sleep(Duration::from_millis(800)).await;

    println!("--- writing keys on different nodes ---");
    nodes[0].put("service", "web-server");
    nodes[1].put("version", "1.2.3");
    nodes[2].put("region", "us-west");
    nodes[1].delete("version");

    tokio::time::sleep(Duration::from_secs(3)).await;

    println!("\n--- final state ---");
    for node in &nodes {
        let members = node.membership_snapshot();
        let alive = members
            .iter()
            .filter(|m| m.state == gossip_kv::PeerState::Alive)
            .count();
        println!(
            "{}: {} members ({} alive), service={:?} region={:?} version={:?}",
            node.node_id(),
            members.len(),
            alive,
            node.get("service"),
            node.get("region"),
            node.get("version"),
        );
        let stats = node.stats();
        println!(
            "    rounds: {} gossip / {} sync / {} full, {} sent, {} received, {} conflicts",
            stats.gossip_rounds,
            stats.sync_rounds,
            stats.full_syncs,
            stats.messages_sent,
            stats.messages_received,
            stats.conflicts_resolved,
        );
    }

    for node in &nodes {
        node.stop().await;
    }
    for transport in &transports {
        transport.close();
    }
    Ok(())
}
