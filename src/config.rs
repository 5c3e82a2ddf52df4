//! Node configuration: a `--config <path>` CLI flag (clap) pointing at a
//! JSON5 file (serde_json5), matching `turn-server::config`'s split
//! between command-line glue and a declarative config body.

use std::collections::HashMap;
use std::fs::read_to_string;
use std::net::SocketAddrV4;

use clap::Parser;
use serde::Deserialize;

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Identity {
    /// Integer node handle used throughout the peer-list and datagram
    /// wire formats (spec §3 "Node identifier").
    #[serde(default = "Identity::id")]
    pub id: i32,

    /// When absent, the node id is derived from `node-<id>-<ip>-<port>`
    /// (spec §3); set this to pin a specific 160-bit id instead.
    #[serde(default)]
    pub node_id_hex: Option<String>,
}

impl Identity {
    fn id() -> i32 {
        1
    }
}

impl Default for Identity {
    fn default() -> Self {
        Self {
            id: Self::id(),
            node_id_hex: None,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Network {
    #[serde(default = "Network::bind")]
    pub bind: SocketAddrV4,

    #[serde(default)]
    pub firewall_bypass: bool,

    /// Seed peers formatted `id:ip:port` (spec §6 "remote-peer seeds").
    #[serde(default)]
    pub seeds: Vec<String>,
}

impl Network {
    fn bind() -> SocketAddrV4 {
        "0.0.0.0:8000".parse().unwrap()
    }
}

impl Default for Network {
    fn default() -> Self {
        Self {
            bind: Self::bind(),
            firewall_bypass: false,
            seeds: Vec::new(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
pub struct Features {
    #[serde(default)]
    pub nat_traversal: bool,
    #[serde(default)]
    pub upnp: bool,
    #[serde(default)]
    pub lan_discovery: bool,
    #[serde(default)]
    pub enhanced_lan_discovery: bool,
    #[serde(default)]
    pub directory_server: bool,
    #[serde(default)]
    pub dht: bool,
    #[serde(default)]
    pub rendezvous: bool,
    #[serde(default)]
    pub turn: bool,
    #[serde(default)]
    pub ice: bool,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Servers {
    #[serde(default = "Servers::stun_server")]
    pub stun_server: String,

    #[serde(default)]
    pub turn_server: Option<String>,

    #[serde(default)]
    pub directory_server_name: Option<String>,

    #[serde(default = "Servers::directory_server_port")]
    pub directory_server_port: u16,
}

impl Servers {
    fn stun_server() -> String {
        "stun.l.google.com:19302".to_string()
    }

    fn directory_server_port() -> u16 {
        7000
    }
}

impl Default for Servers {
    fn default() -> Self {
        Self {
            stun_server: Self::stun_server(),
            turn_server: None,
            directory_server_name: None,
            directory_server_port: Self::directory_server_port(),
        }
    }
}

#[derive(Deserialize, Debug)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl Default for LogLevel {
    fn default() -> Self {
        Self::Info
    }
}

impl LogLevel {
    pub fn as_level(&self) -> log::Level {
        match self {
            Self::Error => log::Level::Error,
            Self::Warn => log::Level::Warn,
            Self::Info => log::Level::Info,
            Self::Debug => log::Level::Debug,
            Self::Trace => log::Level::Trace,
        }
    }
}

#[derive(Deserialize, Debug, Default)]
pub struct Log {
    #[serde(default)]
    pub level: LogLevel,
}

#[derive(Deserialize, Debug)]
pub struct Config {
    #[serde(default)]
    pub identity: Identity,
    #[serde(default)]
    pub network: Network,
    #[serde(default)]
    pub features: Features,
    #[serde(default)]
    pub servers: Servers,
    #[serde(default)]
    pub log: Log,
    /// Static TURN credentials by username, mirroring
    /// `turn-server::config::Config::auth`.
    #[serde(default)]
    pub turn_auth: HashMap<String, String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            identity: Identity::default(),
            network: Network::default(),
            features: Features::default(),
            servers: Servers::default(),
            log: Log::default(),
            turn_auth: HashMap::new(),
        }
    }
}

#[derive(Parser)]
#[command(
    about = "A peer-to-peer overlay node with NAT traversal, a Kademlia DHT, and rendezvous discovery.",
    version
)]
struct Cli {
    /// Path to a JSON5 configuration file. Defaults are used for
    /// anything left unspecified.
    #[arg(long)]
    config: Option<String>,
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let cli = Cli::parse();
        let text = match cli.config {
            Some(path) => read_to_string(&path)
                .map_err(|e| anyhow::anyhow!("failed to read config file {path}: {e}"))?,
            None => String::new(),
        };

        Ok(serde_json5::from_str(&text)?)
    }
}
