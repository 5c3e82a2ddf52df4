//! A peer-to-peer overlay node: NAT traversal (STUN/TURN/ICE), a
//! Kademlia DHT, and rendezvous-key discovery, layered on LAN multicast
//! and directory-gossip peer discovery, all sharing one UDP socket.

pub mod config;
pub mod discovery;
pub mod dispatcher;
pub mod ice;
pub mod net;
pub mod node;
pub mod observer;
pub mod repl;
pub mod statistics;
pub mod stun_client;
pub mod turn_client;
pub mod upnp;

pub use config::Config;
pub use node::{Node, NodeBuilder};

/// Builds and runs a node from `config` until ctrl-c (spec §5, §6). The
/// binary's `main` is a thin wrapper around this so embedders can pull
/// in the crate and drive a [`Node`] directly.
pub async fn node_main(config: Config) -> anyhow::Result<()> {
    let node = NodeBuilder::new(config).build().await?;

    let repl_node = node.clone();
    tokio::spawn(async move {
        if let Err(e) = repl::run(repl_node).await {
            log::warn!("REPL exited: {e}");
        }
    });

    node.run().await
}
