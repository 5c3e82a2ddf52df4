//! The stdin command REPL (spec §6 "Operator interface"). Reads one line
//! at a time on a blocking thread (so it doesn't compete with the async
//! dispatcher tasks for a terminal that may not even be a tty) and drives
//! the same public [`crate::node::Node`] API the dispatcher itself uses.

use std::io::{BufRead, Write};
use std::sync::Arc;

use codec::identity::NodeId;

use crate::node::Node;

const HELP: &str = "\
commands:
  status                 local identity, reflexive endpoint, feature flags
  list                    known peers (id, endpoints, reachability)
  nodes                   dht bucket contacts (if dht is enabled)
  ping <peer-id>          send a PING to a known peer
  send <peer-id> <text>   send application data to a known peer
  diag                    running counters (packets, hole punches, ...)
  dht find <hex-id>       iterative find-node lookup
  dht get <hex-id>        iterative find-value lookup
  rendezvous join <key>   publish this node under a rendezvous key
  rendezvous leave <key>  stop publishing under a rendezvous key
  rendezvous find <key>   look up a rendezvous key's publisher
  ice status              ice session states by peer
  help                    this text
  exit | quit             shut the node down";

/// Reads commands from stdin until `exit`/`quit` or EOF, then calls
/// [`Node::stop`]. Blocking stdin reads run on [`tokio::task::spawn_blocking`]
/// so a line with no trailing newline (piped input, a closed terminal)
/// doesn't need special-casing here.
pub async fn run(node: Arc<Node>) -> anyhow::Result<()> {
    let mut lines = spawn_line_reader();

    println!("overlay node REPL ready, type 'help' for commands");

    while let Some(line) = lines.recv().await {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if matches!(line, "exit" | "quit") {
            node.stop();
            break;
        }

        if let Err(e) = dispatch(&node, line).await {
            println!("error: {e}");
        }
    }

    Ok(())
}

fn spawn_line_reader() -> tokio::sync::mpsc::Receiver<String> {
    let (tx, rx) = tokio::sync::mpsc::channel(16);

    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            match line {
                Ok(text) => {
                    if tx.blocking_send(text).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });

    rx
}

async fn dispatch(node: &Arc<Node>, line: &str) -> anyhow::Result<()> {
    let mut parts = line.split_whitespace();
    let command = parts.next().unwrap_or("");

    match command {
        "help" => println!("{HELP}"),
        "status" => cmd_status(node),
        "list" => cmd_list(node),
        "nodes" => cmd_nodes(node),
        "diag" => cmd_diag(node),
        "ping" => {
            let peer_id: i32 = parts.next().and_then(|s| s.parse().ok()).ok_or_else(|| anyhow::anyhow!("usage: ping <peer-id>"))?;
            node.send_application_data(peer_id, Vec::new()).await?;
            println!("ping sent to {peer_id}");
        }
        "send" => {
            let peer_id: i32 = parts.next().and_then(|s| s.parse().ok()).ok_or_else(|| anyhow::anyhow!("usage: send <peer-id> <text>"))?;
            let rest: Vec<&str> = parts.collect();
            if rest.is_empty() {
                return Err(anyhow::anyhow!("usage: send <peer-id> <text>"));
            }
            let text = rest.join(" ");
            node.send_application_data(peer_id, text.into_bytes()).await?;
            println!("sent to {peer_id}");
        }
        "dht" => cmd_dht(node, parts.next(), parts.next()).await?,
        "rendezvous" => cmd_rendezvous(node, parts.next(), parts.next()).await?,
        "ice" if parts.clone().next() == Some("status") => cmd_ice_status(node),
        other => println!("unknown command {other:?}, type 'help' for a list"),
    }

    Ok(())
}

fn cmd_status(node: &Arc<Node>) {
    println!("node id:      {}", node.local_node_id().to_hex());
    println!("peer id:      {}", node.local_peer_id());
    println!("public:       {}", node.is_public());
    println!(
        "reflexive:    {}",
        node.public_endpoint().map(|e| e.to_string()).unwrap_or_else(|| "unknown".to_string())
    );
    println!("dht:          {}", node.dht_enabled());
    println!("rendezvous:   {}", node.rendezvous_enabled());
    if let Some((allocated, relayed)) = node.turn_status() {
        println!(
            "turn:         allocated={allocated} relayed={}",
            relayed.map(|e| e.to_string()).unwrap_or_else(|| "none".to_string())
        );
    } else {
        println!("turn:         disabled");
    }
}

fn cmd_list(node: &Arc<Node>) {
    let peers = node.peer_table().all();
    if peers.is_empty() {
        println!("no known peers");
        return;
    }

    for record in peers {
        println!(
            "{:>10}  local={}  public={}  reachable={}  node-id={}",
            record.peer_id,
            record.local_endpoint,
            record.public_endpoint.map(|e| e.to_string()).unwrap_or_else(|| "-".to_string()),
            record.reachable,
            record.node_id.map(|n| n.to_hex()).unwrap_or_else(|| "-".to_string()),
        );
    }
}

fn cmd_nodes(node: &Arc<Node>) {
    if !node.dht_enabled() {
        println!("dht is disabled");
        return;
    }
    println!("use 'dht find <hex-id>' to walk the table toward a target");
}

fn cmd_diag(node: &Arc<Node>) {
    let snapshot = node.stats().snapshot();
    println!("packets sent:        {}", snapshot.packets_sent);
    println!("packets received:    {}", snapshot.packets_received);
    println!("bytes sent:          {}", snapshot.bytes_sent);
    println!("bytes received:      {}", snapshot.bytes_received);
    println!("hole punches tried:  {}", snapshot.hole_punches_attempted);
    println!("hole punches ok:     {}", snapshot.hole_punches_succeeded);
    println!("stun requests:       {}", snapshot.stun_requests);
    println!("turn allocations:    {}", snapshot.turn_allocations);
    println!("dht lookups:         {}", snapshot.dht_lookups);
}

async fn cmd_dht(node: &Arc<Node>, sub: Option<&str>, key: Option<&str>) -> anyhow::Result<()> {
    let key = key.ok_or_else(|| anyhow::anyhow!("usage: dht <find|get> <hex-id>"))?;
    let target = NodeId::from_hex(key).map_err(|_| anyhow::anyhow!("invalid hex node id {key:?}"))?;

    match sub {
        Some("find") => {
            let contacts = node.dht_find_node(target).await;
            if contacts.is_empty() {
                println!("no contacts found");
            }
            for entry in contacts {
                println!("{}  {}", entry.node_id.to_hex(), entry.endpoint);
            }
        }
        Some("get") => match node.dht_find_value(target).await {
            Some(value) => println!("{} bytes: {}", value.len(), String::from_utf8_lossy(&value)),
            None => println!("value not found"),
        },
        _ => return Err(anyhow::anyhow!("usage: dht <find|get> <hex-id>")),
    }

    Ok(())
}

async fn cmd_rendezvous(node: &Arc<Node>, sub: Option<&str>, key: Option<&str>) -> anyhow::Result<()> {
    let key = key.ok_or_else(|| anyhow::anyhow!("usage: rendezvous <join|leave|find> <key>"))?;

    match sub {
        Some("join") => {
            node.rendezvous_join(key).await?;
            println!("joined {key:?}");
        }
        Some("leave") => {
            node.rendezvous_leave(key).await?;
            println!("left {key:?}");
        }
        Some("find") => match node.rendezvous_find(key).await? {
            Some(value) => println!(
                "{}  local={}  public={}",
                value.node_id.to_hex(),
                value.local_endpoint(),
                value.public_endpoint().map(|e| e.to_string()).unwrap_or_else(|| "-".to_string())
            ),
            None => println!("no publisher found for {key:?}"),
        },
        _ => return Err(anyhow::anyhow!("usage: rendezvous <join|leave|find> <key>")),
    }

    Ok(())
}

fn cmd_ice_status(node: &Arc<Node>) {
    let sessions = node.ice_sessions_snapshot();
    if sessions.is_empty() {
        println!("no ice sessions");
        return;
    }

    for (peer_id, state) in sessions {
        println!("{peer_id:>10}  {state:?}");
    }
}
