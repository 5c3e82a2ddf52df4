//! The node composition root (spec §9 "global singleton"/"opaque
//! pointer" design notes, resolved here as a typed [`Node`] built by
//! [`NodeBuilder`]). Owns the single UDP socket and every feature
//! sub-record, and runs the dispatcher's tasks (spec §5): one receive
//! loop, one maintenance tick, and one task per enabled feature
//! (DHT refresh, LAN multicast, directory polling, TURN refresh, ICE
//! keepalive).

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::AHashMap;
use anyhow::{anyhow, Context};
use bytes::{Bytes, BytesMut};
use codec::dht_rpc::{self, DhtRpc};
use codec::identity::NodeId;
use codec::peer::{MessageType as PeerMessageType, PeerFrame, PeerListEntry};
use codec::rendezvous_rpc::RendezvousMessage;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::config::Config;
use crate::discovery::directory::{DirectoryClient, InMemoryDirectory};
use crate::discovery::multicast::{self, MulticastDiscovery, MulticastEvent};
use crate::dispatcher;
use crate::ice::{self, CandidateKind, ConnectionState, IceSession};
use crate::net::UdpEndpoint;
use crate::observer::{LoggingObserver, Observer};
use crate::statistics::Statistics;
use crate::stun_client;
use crate::turn_client::TurnClient;
use crate::upnp::{NullPortMapper, PortMapper, Protocol};
use codec::discovery::DirectoryRecord;
use service::dht::{DhtEngine, FindValueResult, IterativeLookup, K as DHT_K};
use service::peer_table::{PeerId, PeerTable};
use service::rendezvous::{Membership, RendezvousValue};

/// Per-query timeout for a single DHT RPC round trip (spec §4.6 leaves
/// this unspecified; chosen to sit comfortably under the maintenance
/// tick so a stalled contact doesn't stall a whole refresh cycle).
const DHT_QUERY_TIMEOUT: Duration = Duration::from_secs(2);

/// How long `rendezvous_find` waits for a RENDEZVOUS_RESPONSE before
/// giving up (spec §4.7).
const RENDEZVOUS_QUERY_TIMEOUT: Duration = Duration::from_secs(5);

const TURN_REFRESH_POLL: Duration = Duration::from_secs(30);

/// Tag byte prefixing a DHT_FIND_VALUE_REPLY payload: `1` means the
/// remainder is the stored value, `0` means the remainder is an encoded
/// contact list (spec §4.6 doesn't name a wire tag for this
/// disambiguation; this is the dispatcher's own choice, recorded in
/// DESIGN.md).
const FIND_VALUE_TAG_VALUE: u8 = 1;
const FIND_VALUE_TAG_CONTACTS: u8 = 0;

pub struct Node {
    config: Config,
    socket: Arc<UdpEndpoint>,
    local_peer_id: PeerId,
    local_node_id: NodeId,
    bind_addr: SocketAddrV4,
    public_endpoint: Mutex<Option<SocketAddrV4>>,
    is_public: AtomicBool,

    peer_table: PeerTable,
    dht: Option<Arc<DhtEngine>>,
    membership: Option<Arc<Membership>>,
    turn: Option<Arc<TurnClient>>,
    ice_sessions: Mutex<AHashMap<PeerId, Arc<IceSession>>>,
    multicast: Option<Arc<MulticastDiscovery>>,
    directory: Option<Arc<dyn DirectoryClient>>,
    port_mapper: Option<Arc<dyn PortMapper>>,
    observer: Arc<dyn Observer>,
    stats: Arc<Statistics>,

    running: AtomicBool,
    next_seq: AtomicU32,
    next_transaction: AtomicU32,
    pending_dht: Mutex<AHashMap<u32, oneshot::Sender<DhtRpc>>>,
    pending_rendezvous: Mutex<AHashMap<NodeId, oneshot::Sender<RendezvousMessage>>>,
}

pub struct NodeBuilder {
    config: Config,
    observer: Arc<dyn Observer>,
    directory: Option<Arc<dyn DirectoryClient>>,
    port_mapper: Option<Arc<dyn PortMapper>>,
}

impl NodeBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            observer: Arc::new(LoggingObserver),
            directory: None,
            port_mapper: None,
        }
    }

    pub fn observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observer = observer;
        self
    }

    /// Overrides the directory client the node polls/publishes to.
    /// Without this, `features.directory-server` falls back to
    /// [`InMemoryDirectory`] (spec §4.9: the backing store is an
    /// embedder concern, out of core scope).
    pub fn directory_client(mut self, client: Arc<dyn DirectoryClient>) -> Self {
        self.directory = Some(client);
        self
    }

    /// Overrides the UPnP port mapper the node asks to forward its bind
    /// port. Without this, `features.upnp` falls back to
    /// [`NullPortMapper`] (spec §9: SSDP discovery and the SOAP actions
    /// are out of core scope; only the public contract is carried).
    pub fn port_mapper(mut self, mapper: Arc<dyn PortMapper>) -> Self {
        self.port_mapper = Some(mapper);
        self
    }

    pub async fn build(self) -> anyhow::Result<Arc<Node>> {
        let config = self.config;
        let socket = Arc::new(UdpEndpoint::bind(config.network.bind, config.network.firewall_bypass)?);

        let local_node_id = match &config.identity.node_id_hex {
            Some(hex) => NodeId::from_hex(hex).context("parsing identity.node-id-hex")?,
            None => NodeId::from_node_string(config.identity.id, &config.network.bind.ip().to_string(), config.network.bind.port()),
        };

        let dht = config.features.dht.then(|| Arc::new(DhtEngine::new(local_node_id)));
        let membership = config.features.rendezvous.then(|| Arc::new(Membership::default()));

        let turn = if config.features.turn {
            match &config.servers.turn_server {
                Some(turn_server) => match build_turn_client(turn_server, &config.turn_auth, socket.clone()).await {
                    Ok(client) => Some(client),
                    Err(e) => {
                        log::warn!("TURN client unavailable: {e}");
                        None
                    }
                },
                None => None,
            }
        } else {
            None
        };

        let multicast = if config.features.lan_discovery || config.features.enhanced_lan_discovery {
            match MulticastDiscovery::bind(config.identity.id) {
                Ok(m) => Some(Arc::new(m)),
                Err(e) => {
                    log::warn!("LAN multicast discovery unavailable: {e}");
                    None
                }
            }
        } else {
            None
        };

        let directory: Option<Arc<dyn DirectoryClient>> = self.directory.or_else(|| {
            config.features.directory_server.then(|| InMemoryDirectory::shared() as Arc<dyn DirectoryClient>)
        });

        let port_mapper: Option<Arc<dyn PortMapper>> = self
            .port_mapper
            .or_else(|| config.features.upnp.then(|| Arc::new(NullPortMapper) as Arc<dyn PortMapper>));

        let peer_table = PeerTable::default();
        for seed in &config.network.seeds {
            if let Some((id, endpoint)) = parse_seed(seed) {
                peer_table.add_or_update(id, None, endpoint, None);
            } else {
                log::warn!("ignoring malformed seed peer {seed:?}");
            }
        }

        let node = Arc::new(Node {
            local_peer_id: config.identity.id,
            local_node_id,
            bind_addr: config.network.bind,
            public_endpoint: Mutex::new(None),
            is_public: AtomicBool::new(false),
            peer_table,
            dht,
            membership,
            turn,
            ice_sessions: Mutex::new(AHashMap::new()),
            multicast,
            directory,
            port_mapper,
            observer: self.observer,
            stats: Arc::new(Statistics::default()),
            running: AtomicBool::new(false),
            next_seq: AtomicU32::new(0),
            next_transaction: AtomicU32::new(0),
            pending_dht: Mutex::new(AHashMap::new()),
            pending_rendezvous: Mutex::new(AHashMap::new()),
            config,
        });

        if node.config.features.nat_traversal {
            node.discover_reflexive_endpoint().await;
        }

        if let Some(turn) = node.turn.clone() {
            match turn.allocate().await {
                Ok(relayed) => {
                    log::info!("TURN allocation obtained: {relayed}");
                    node.stats.record_turn_allocation();
                }
                Err(e) => log::warn!("initial TURN allocation failed: {e}"),
            }
        }

        if let Some(mapper) = &node.port_mapper {
            let port = node.bind_addr.port();
            if let Err(e) = mapper.add_port_mapping(port, port, Protocol::Udp).await {
                log::warn!("UPnP port mapping for {port}/udp unavailable: {e}");
            }
        }

        Ok(node)
    }
}

async fn build_turn_client(
    turn_server: &str,
    turn_auth: &std::collections::HashMap<String, String>,
    socket: Arc<UdpEndpoint>,
) -> anyhow::Result<Arc<TurnClient>> {
    let server: SocketAddrV4 = tokio::net::lookup_host(turn_server)
        .await
        .context("resolving turn server")?
        .find_map(|addr| match addr {
            SocketAddr::V4(v4) => Some(v4),
            _ => None,
        })
        .ok_or_else(|| anyhow!("turn server {turn_server} has no IPv4 address"))?;

    let (username, password) = turn_auth
        .iter()
        .next()
        .map(|(u, p)| (u.clone(), p.clone()))
        .ok_or_else(|| anyhow!("no turn-auth credentials configured"))?;

    Ok(Arc::new(TurnClient::new(server, socket, username, password)))
}

fn parse_seed(seed: &str) -> Option<(PeerId, SocketAddrV4)> {
    let mut parts = seed.splitn(3, ':');
    let id: PeerId = parts.next()?.parse().ok()?;
    let ip: Ipv4Addr = parts.next()?.parse().ok()?;
    let port: u16 = parts.next()?.parse().ok()?;
    Some((id, SocketAddrV4::new(ip, port)))
}

fn now_unix() -> u32 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

/// Derives a synthetic integer peer id from a 160-bit node id for peers
/// first learned through the DHT or rendezvous path, where no integer
/// id has been exchanged yet. A later PEER_LIST exchange with the real
/// id simply overwrites this record (spec §3 "peer identifier" is only
/// meaningful within the integer-id namespace the seeds/peer-list use).
fn synthetic_peer_id(node_id: &NodeId) -> PeerId {
    let bytes = node_id.as_bytes();
    i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

impl Node {
    pub fn local_node_id(&self) -> NodeId {
        self.local_node_id
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    pub fn stats(&self) -> Arc<Statistics> {
        self.stats.clone()
    }

    pub fn peer_table(&self) -> &PeerTable {
        &self.peer_table
    }

    pub fn public_endpoint(&self) -> Option<SocketAddrV4> {
        *self.public_endpoint.lock()
    }

    fn next_seq(&self) -> u32 {
        self.next_seq.fetch_add(1, Ordering::Relaxed)
    }

    fn next_transaction_id(&self) -> u32 {
        self.next_transaction.fetch_add(1, Ordering::Relaxed)
    }

    async fn discover_reflexive_endpoint(&self) {
        match stun_client::discover_reflexive_address(&self.config.servers.stun_server).await {
            Ok(reflexive) => {
                self.stats.record_stun_request();
                let is_public = reflexive == self.bind_addr;
                self.is_public.store(is_public, Ordering::Relaxed);
                *self.public_endpoint.lock() = Some(reflexive);
                log::info!("reflexive endpoint {reflexive} (public: {is_public})");
            }
            Err(e) => log::warn!("STUN reflexive discovery failed: {e}"),
        }
    }

    /// Runs every enabled dispatcher task until ctrl-c (spec §5). Returns
    /// once every task has observed the shutdown signal and exited.
    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        self.running.store(true, Ordering::SeqCst);

        for record in self.peer_table.all() {
            let target = record.public_endpoint.unwrap_or(record.local_endpoint);
            let _ = self.send_peer_frame(target, PeerMessageType::Ping, record.peer_id, Vec::new()).await;
        }

        let mut handles = vec![
            tokio::spawn(self.clone().receive_loop()),
            tokio::spawn(self.clone().maintenance_loop()),
            tokio::spawn(self.clone().ice_keepalive_loop()),
        ];

        if self.dht.is_some() {
            handles.push(tokio::spawn(self.clone().dht_refresh_loop()));
        }
        if self.multicast.is_some() {
            handles.push(tokio::spawn(self.clone().multicast_loop()));
        }
        if self.directory.is_some() {
            handles.push(tokio::spawn(self.clone().directory_poll_loop()));
        }
        if self.turn.is_some() {
            handles.push(tokio::spawn(self.clone().turn_refresh_loop()));
        }

        tokio::signal::ctrl_c().await.ok();
        log::info!("shutting down");
        self.running.store(false, Ordering::SeqCst);

        if let Some(mapper) = &self.port_mapper {
            let port = self.bind_addr.port();
            if let Err(e) = mapper.delete_port_mapping(port, Protocol::Udp).await {
                log::debug!("UPnP port unmap for {port}/udp failed: {e}");
            }
        }

        for handle in handles {
            let _ = handle.await;
        }

        Ok(())
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    async fn send_peer_frame(&self, to_addr: SocketAddrV4, kind: PeerMessageType, to_peer: PeerId, data: Vec<u8>) -> anyhow::Result<()> {
        let frame = PeerFrame::new(kind, self.next_seq(), self.local_peer_id, to_peer, data)?;
        let mut bytes = BytesMut::new();
        frame.encode(&mut bytes);
        self.socket.send_to(&bytes, to_addr.into()).await?;
        self.stats.record_sent(bytes.len());
        Ok(())
    }

    async fn send_peer_list_to(&self, target: SocketAddrV4, to_peer: PeerId) {
        let entries: Vec<PeerListEntry> = self
            .peer_table
            .all()
            .iter()
            .map(|r| PeerListEntry {
                id: r.peer_id,
                ip: r.local_endpoint.ip().to_string(),
                port: r.local_endpoint.port(),
                public_ip: r.public_endpoint.map(|e| e.ip().to_string()).unwrap_or_else(|| "0.0.0.0".to_string()),
                public_port: r.public_endpoint.map(|e| e.port()).unwrap_or(0),
                is_public: r.is_public,
            })
            .collect();

        let payload = dispatcher::build_peer_list(&entries, to_peer);
        let _ = self.send_peer_frame(target, PeerMessageType::PeerList, to_peer, payload.into_bytes()).await;
    }

    // ---- Public API consumed by the REPL ---------------------------------

    pub async fn send_application_data(&self, to_peer: PeerId, data: Vec<u8>) -> anyhow::Result<()> {
        let record = self.peer_table.lookup(to_peer).ok_or_else(|| anyhow!("unknown peer {to_peer}"))?;
        let ice_relay = self
            .ice_sessions
            .lock()
            .get(&to_peer)
            .map(|s| s.should_relay())
            .unwrap_or(false);

        if ice_relay {
            if let Some(turn) = &self.turn {
                let target = record.public_endpoint.unwrap_or(record.local_endpoint);
                turn.send_data(target, &data).await?;
                self.stats.record_sent(data.len());
                return Ok(());
            }
        }

        let target = record.public_endpoint.unwrap_or(record.local_endpoint);
        self.send_peer_frame(target, PeerMessageType::Data, to_peer, data).await
    }

    pub fn connect_hole_punch(self: &Arc<Self>, peer_id: PeerId) {
        self.spawn_hole_punch(peer_id);
    }

    pub fn is_public(&self) -> bool {
        self.is_public.load(Ordering::Relaxed)
    }

    pub fn dht_enabled(&self) -> bool {
        self.dht.is_some()
    }

    pub fn rendezvous_enabled(&self) -> bool {
        self.membership.is_some()
    }

    /// `(allocated, relayed address)` for the REPL's `diag` command, or
    /// `None` when TURN is disabled.
    pub fn turn_status(&self) -> Option<(bool, Option<SocketAddrV4>)> {
        self.turn.as_ref().map(|t| (t.is_allocated(), t.relayed_address()))
    }

    /// Snapshot of every ICE session's peer and connection state, for the
    /// REPL's `ice status` command.
    pub fn ice_sessions_snapshot(&self) -> Vec<(PeerId, ConnectionState)> {
        self.ice_sessions.lock().iter().map(|(id, session)| (*id, session.state())).collect()
    }

    // ---- Receive loop and frame classification ----------------------------

    async fn receive_loop(self: Arc<Self>) {
        let mut buf = vec![0u8; 1500];
        while self.running.load(Ordering::SeqCst) {
            let (n, from) = match self.socket.recv_from(&mut buf).await {
                Ok(Some(pair)) => pair,
                Ok(None) => continue,
                Err(e) => {
                    log::warn!("recv_from failed: {e}");
                    continue;
                }
            };

            if n == 0 {
                continue;
            }

            self.stats.record_received(n);
            let bytes = &buf[..n];

            if codec::stun::MessageType::looks_like_stun(bytes[0]) {
                self.handle_stun_frame(bytes).await;
            } else {
                self.clone().handle_peer_frame(bytes, from).await;
            }
        }
    }

    async fn handle_stun_frame(&self, bytes: &[u8]) {
        let Some(turn) = &self.turn else {
            return;
        };

        let owned = Bytes::copy_from_slice(bytes);
        if turn.route_response(owned.clone()) {
            return;
        }

        if let Some((peer, data)) = TurnClient::unwrap_data_indication(&owned) {
            log::debug!("relayed {} bytes from {peer} via TURN", data.len());
        } else {
            log::debug!("unrecognized STUN/TURN frame, dropping");
        }
    }

    async fn handle_peer_frame(self: Arc<Self>, bytes: &[u8], from: SocketAddr) {
        let SocketAddr::V4(from_v4) = from else {
            return;
        };

        let frame = match PeerFrame::decode(bytes) {
            Ok(frame) => frame,
            Err(_) => {
                log::debug!("malformed peer frame from {from}");
                return;
            }
        };

        self.peer_table.touch(frame.from_id);

        match frame.kind {
            PeerMessageType::Data => {
                if let Some(node_id) = self.peer_table.lookup(frame.from_id).and_then(|r| r.node_id) {
                    self.observer.message_received(node_id, frame.data.len());
                }
            }
            PeerMessageType::Ping => {
                self.peer_table.set_reachable(frame.from_id, true);
                let _ = self.send_peer_frame(from_v4, PeerMessageType::Pong, frame.from_id, Vec::new()).await;
            }
            PeerMessageType::Pong => {
                self.peer_table.set_reachable(frame.from_id, true);
                self.stats.record_hole_punch_success();
                if let Some(node_id) = self.peer_table.lookup(frame.from_id).and_then(|r| r.node_id) {
                    self.observer.nat_traversal_succeeded(node_id, from_v4);
                }
                self.send_peer_list_to(from_v4, frame.from_id).await;
            }
            PeerMessageType::PeerList => self.handle_peer_list(&frame).await,
            PeerMessageType::NatTraversal => {
                self.peer_table.set_reachable(frame.from_id, true);
            }
            PeerMessageType::DhtPing => self.handle_dht_ping(&frame, from_v4).await,
            PeerMessageType::DhtPong => self.handle_dht_reply(&frame),
            PeerMessageType::DhtFindNode => self.handle_dht_find_node(&frame, from_v4).await,
            PeerMessageType::DhtFindNodeReply => self.handle_dht_reply(&frame),
            PeerMessageType::DhtFindValue => self.handle_dht_find_value(&frame, from_v4).await,
            PeerMessageType::DhtFindValueReply => self.handle_dht_reply(&frame),
            PeerMessageType::DhtStore => self.handle_dht_store(&frame),
            PeerMessageType::RendezvousAnnounce => self.handle_rendezvous_announce(&frame),
            PeerMessageType::RendezvousQuery => self.handle_rendezvous_query(&frame, from_v4).await,
            PeerMessageType::RendezvousResponse => self.handle_rendezvous_response(&frame),
            PeerMessageType::RendezvousConnect => self.handle_rendezvous_connect(&frame, from_v4).await,
        }
    }

    async fn handle_peer_list(&self, frame: &PeerFrame) {
        let Ok(text) = std::str::from_utf8(&frame.data) else {
            return;
        };
        let Ok(entries) = dispatcher::parse_peer_list(text) else {
            return;
        };

        for entry in entries {
            if entry.id == self.local_peer_id {
                continue;
            }

            let (Ok(ip), Ok(public_ip)) = (entry.ip.parse::<Ipv4Addr>(), entry.public_ip.parse::<Ipv4Addr>()) else {
                continue;
            };

            let local_endpoint = SocketAddrV4::new(ip, entry.port);
            let public_endpoint = (entry.public_port != 0).then(|| SocketAddrV4::new(public_ip, entry.public_port));
            let is_new = self.peer_table.lookup(entry.id).is_none();

            self.peer_table.add_or_update(entry.id, None, local_endpoint, public_endpoint);
            self.peer_table.set_public(entry.id, entry.is_public);

            if is_new && self.config.features.nat_traversal {
                self.clone_arc_and_punch(entry.id);
            }
        }
    }

    /// `Node` isn't always held behind an `Arc` at the point a peer-list
    /// entry triggers a hole punch (the receive loop already is), so this
    /// threads the punch through a raw method instead of requiring every
    /// caller to carry an `Arc<Self>`.
    fn clone_arc_and_punch(self: &Arc<Self>, peer_id: PeerId) {
        self.spawn_hole_punch(peer_id);
    }

    // ---- DHT RPC handling ---------------------------------------------------

    async fn send_dht_rpc(&self, to_addr: SocketAddrV4, to_peer: PeerId, kind: PeerMessageType, rpc: &DhtRpc) -> anyhow::Result<()> {
        let mut body = BytesMut::new();
        rpc.encode(&mut body);
        self.send_peer_frame(to_addr, kind, to_peer, body.to_vec()).await
    }

    async fn handle_dht_ping(&self, frame: &PeerFrame, from_v4: SocketAddrV4) {
        let Some(dht) = &self.dht else { return };
        let Ok(rpc) = DhtRpc::decode(&frame.data) else { return };
        dht.add_node(rpc.sender_id, from_v4);

        let reply = DhtRpc {
            sender_id: dht.local_id(),
            target_id: rpc.sender_id,
            transaction_id: rpc.transaction_id,
            data: Vec::new(),
        };
        let _ = self.send_dht_rpc(from_v4, frame.from_id, PeerMessageType::DhtPong, &reply).await;
    }

    fn handle_dht_reply(&self, frame: &PeerFrame) {
        let Ok(rpc) = DhtRpc::decode(&frame.data) else { return };
        if let Some(dht) = &self.dht {
            dht.add_node(rpc.sender_id, SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0));
        }
        if let Some(tx) = self.pending_dht.lock().remove(&rpc.transaction_id) {
            let _ = tx.send(rpc);
        }
    }

    async fn handle_dht_find_node(&self, frame: &PeerFrame, from_v4: SocketAddrV4) {
        let Some(dht) = &self.dht else { return };
        let Ok(rpc) = DhtRpc::decode(&frame.data) else { return };
        dht.add_node(rpc.sender_id, from_v4);

        let contacts: Vec<(NodeId, SocketAddrV4)> = dht
            .find_node(&rpc.target_id, DHT_K)
            .into_iter()
            .map(|e| (e.node_id, e.endpoint))
            .collect();

        let reply = DhtRpc {
            sender_id: dht.local_id(),
            target_id: rpc.target_id,
            transaction_id: rpc.transaction_id,
            data: dht_rpc::contacts::encode(&contacts),
        };
        let _ = self.send_dht_rpc(from_v4, frame.from_id, PeerMessageType::DhtFindNodeReply, &reply).await;
    }

    async fn handle_dht_find_value(&self, frame: &PeerFrame, from_v4: SocketAddrV4) {
        let Some(dht) = &self.dht else { return };
        let Ok(rpc) = DhtRpc::decode(&frame.data) else { return };
        dht.add_node(rpc.sender_id, from_v4);

        let mut data = Vec::new();
        match dht.find_value(&rpc.target_id) {
            FindValueResult::Found(value) => {
                data.push(FIND_VALUE_TAG_VALUE);
                data.extend_from_slice(&value);
            }
            FindValueResult::Closest(contacts) => {
                data.push(FIND_VALUE_TAG_CONTACTS);
                let pairs: Vec<(NodeId, SocketAddrV4)> = contacts.into_iter().map(|e| (e.node_id, e.endpoint)).collect();
                data.extend_from_slice(&dht_rpc::contacts::encode(&pairs));
            }
        }

        let reply = DhtRpc {
            sender_id: dht.local_id(),
            target_id: rpc.target_id,
            transaction_id: rpc.transaction_id,
            data,
        };
        let _ = self.send_dht_rpc(from_v4, frame.from_id, PeerMessageType::DhtFindValueReply, &reply).await;
    }

    fn handle_dht_store(&self, frame: &PeerFrame) {
        let Some(dht) = &self.dht else { return };
        let Ok(rpc) = DhtRpc::decode(&frame.data) else { return };
        dht.store(rpc.target_id, rpc.data);
    }

    async fn dht_transact(&self, peer_endpoint: SocketAddrV4, kind: PeerMessageType, target_id: NodeId, data: Vec<u8>) -> anyhow::Result<DhtRpc> {
        let dht = self.dht.as_ref().ok_or_else(|| anyhow!("dht disabled"))?;
        let transaction_id = self.next_transaction_id();
        let rpc = DhtRpc::new(dht.local_id(), target_id, transaction_id, data)?;

        let (tx, rx) = oneshot::channel();
        self.pending_dht.lock().insert(transaction_id, tx);

        if let Err(e) = self.send_dht_rpc(peer_endpoint, 0, kind, &rpc).await {
            self.pending_dht.lock().remove(&transaction_id);
            return Err(e);
        }

        match tokio::time::timeout(DHT_QUERY_TIMEOUT, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(anyhow!("dht transaction channel dropped")),
            Err(_) => {
                self.pending_dht.lock().remove(&transaction_id);
                Err(anyhow!("dht transaction timed out"))
            }
        }
    }

    /// Standard Kademlia iterative find-node (spec §4.6): queries `ALPHA`
    /// not-yet-queried contacts per round, sequentially (the teacher's
    /// dependency stack carries no `futures` crate for a `join_all`-style
    /// fan-out, so concurrency within a round is traded for latency, not
    /// correctness).
    pub async fn dht_find_node(&self, target: NodeId) -> Vec<service::dht::BucketEntry> {
        let Some(dht) = &self.dht else { return Vec::new() };
        self.stats.record_dht_lookup();

        let seed = dht.find_node(&target, DHT_K);
        let mut lookup = IterativeLookup::new(target, seed);

        while !lookup.is_done() {
            let batch = lookup.next_batch();
            if batch.is_empty() {
                break;
            }

            let mut learned = Vec::new();
            for contact in batch {
                match self.dht_transact(contact.endpoint, PeerMessageType::DhtFindNode, target, Vec::new()).await {
                    Ok(reply) => {
                        if let Ok(contacts) = dht_rpc::contacts::decode(&reply.data) {
                            for (node_id, endpoint) in contacts {
                                dht.add_node(node_id, endpoint);
                                learned.push(service::dht::BucketEntry {
                                    node_id,
                                    endpoint,
                                    last_seen: Instant::now(),
                                });
                            }
                        }
                    }
                    Err(e) => log::debug!("find-node query to {} failed: {e}", contact.node_id.to_hex()),
                }
            }

            lookup.merge(learned);
        }

        lookup.shortlist().to_vec()
    }

    /// Iterative find-value (spec §4.6): same traversal as find-node, but
    /// terminates early the first time a queried contact returns the
    /// value itself.
    pub async fn dht_find_value(&self, target: NodeId) -> Option<Vec<u8>> {
        let dht = self.dht.as_ref()?;
        self.stats.record_dht_lookup();

        if let FindValueResult::Found(value) = dht.find_value(&target) {
            return Some(value);
        }

        let seed = dht.find_node(&target, DHT_K);
        let mut lookup = IterativeLookup::new(target, seed);

        while !lookup.is_done() {
            let batch = lookup.next_batch();
            if batch.is_empty() {
                break;
            }

            let mut learned = Vec::new();
            for contact in batch {
                match self.dht_transact(contact.endpoint, PeerMessageType::DhtFindValue, target, Vec::new()).await {
                    Ok(reply) if reply.data.first() == Some(&FIND_VALUE_TAG_VALUE) => {
                        return Some(reply.data[1..].to_vec());
                    }
                    Ok(reply) => {
                        if let Ok(contacts) = dht_rpc::contacts::decode(&reply.data[1.min(reply.data.len())..]) {
                            for (node_id, endpoint) in contacts {
                                dht.add_node(node_id, endpoint);
                                learned.push(service::dht::BucketEntry {
                                    node_id,
                                    endpoint,
                                    last_seen: Instant::now(),
                                });
                            }
                        }
                    }
                    Err(e) => log::debug!("find-value query to {} failed: {e}", contact.node_id.to_hex()),
                }
            }

            lookup.merge(learned);
        }

        None
    }

    pub async fn dht_store_remote(&self, key: NodeId, value: Vec<u8>) {
        let Some(dht) = &self.dht else { return };
        dht.store(key, value.clone());

        for contact in dht.find_node(&key, DHT_K) {
            let rpc = DhtRpc {
                sender_id: dht.local_id(),
                target_id: key,
                transaction_id: self.next_transaction_id(),
                data: value.clone(),
            };
            let _ = self.send_dht_rpc(contact.endpoint, 0, PeerMessageType::DhtStore, &rpc).await;
        }
    }

    // ---- Rendezvous RPC handling --------------------------------------------

    fn rendezvous_self_value(&self) -> RendezvousValue {
        let public = self.public_endpoint();
        RendezvousValue {
            node_id: self.local_node_id,
            ip: *self.bind_addr.ip(),
            port: self.bind_addr.port(),
            public_ip: public.map(|e| *e.ip()),
            public_port: public.map(|e| e.port()),
            behind_nat: !self.is_public.load(Ordering::Relaxed),
        }
    }

    pub async fn rendezvous_join(&self, key: &str) -> anyhow::Result<()> {
        let membership = self.membership.as_ref().ok_or_else(|| anyhow!("rendezvous disabled"))?;
        let key_id = membership.join(key).map_err(|_| anyhow!("rendezvous key too long"))?;

        let value = self.rendezvous_self_value();
        self.dht_store_remote(key_id, value.encode()).await;
        Ok(())
    }

    /// Leaves `key`: flips the local membership flag and best-effort
    /// overwrites the DHT value with an empty tombstone, so a concurrent
    /// `rendezvous_find` stops resolving this node as the publisher (spec
    /// §4.7 OPEN item, resolved in DESIGN.md).
    pub async fn rendezvous_leave(&self, key: &str) -> anyhow::Result<()> {
        let membership = self.membership.as_ref().ok_or_else(|| anyhow!("rendezvous disabled"))?;
        membership.leave(key);

        let key_id = NodeId::from_str(key);
        self.dht_store_remote(key_id, Vec::new()).await;
        Ok(())
    }

    /// Finds a rendezvous key's publisher (spec §4.7 "find"): a local
    /// value-store hit short-circuits; otherwise the query fans out to
    /// the closest known contacts and waits for one RENDEZVOUS_RESPONSE.
    /// On success, registers the publisher in the peer table and starts
    /// a hole punch toward it.
    pub async fn rendezvous_find(self: &Arc<Self>, key: &str) -> anyhow::Result<Option<RendezvousValue>> {
        let key_id = NodeId::from_str(key);

        if let Some(dht) = &self.dht {
            if let FindValueResult::Found(bytes) = dht.find_value(&key_id) {
                if let Some(value) = RendezvousValue::decode(&bytes) {
                    self.register_rendezvous_peer(&value);
                    return Ok(Some(value));
                }
            }
        }

        let Some(dht) = &self.dht else {
            return Err(anyhow!("rendezvous requires dht to be enabled"));
        };

        let (tx, rx) = oneshot::channel();
        self.pending_rendezvous.lock().insert(key_id, tx);

        for contact in dht.find_node(&key_id, DHT_K) {
            let _ = self
                .send_peer_frame(contact.endpoint, PeerMessageType::RendezvousQuery, 0, key.as_bytes().to_vec())
                .await;
        }

        match tokio::time::timeout(RENDEZVOUS_QUERY_TIMEOUT, rx).await {
            Ok(Ok(message)) => match rendezvous_message_to_value(&message) {
                Some(value) => {
                    self.register_rendezvous_peer(&value);
                    Ok(Some(value))
                }
                None => Ok(None),
            },
            _ => {
                self.pending_rendezvous.lock().remove(&key_id);
                Ok(None)
            }
        }
    }

    fn register_rendezvous_peer(self: &Arc<Self>, value: &RendezvousValue) {
        let peer_id = synthetic_peer_id(&value.node_id);
        self.peer_table.add_or_update(peer_id, Some(value.node_id), value.local_endpoint(), value.public_endpoint());
        self.observer.peer_discovered(value.node_id, value.public_endpoint().unwrap_or(value.local_endpoint()));

        if self.config.features.nat_traversal {
            self.spawn_hole_punch(peer_id);
        }
    }

    fn handle_rendezvous_announce(&self, frame: &PeerFrame) {
        let Some(dht) = &self.dht else { return };
        let Ok(text) = std::str::from_utf8(&frame.data) else { return };
        let Ok(message) = RendezvousMessage::decode(text) else { return };
        let Some(value) = rendezvous_message_to_value(&message) else { return };

        let key_id = NodeId::from_str(&message.key);
        dht.store(key_id, value.encode());
    }

    async fn handle_rendezvous_query(&self, frame: &PeerFrame, from_v4: SocketAddrV4) {
        let Some(dht) = &self.dht else { return };
        let Ok(key) = String::from_utf8(frame.data.clone()) else { return };
        let key_id = NodeId::from_str(&key);

        let FindValueResult::Found(bytes) = dht.find_value(&key_id) else {
            return;
        };
        let Some(value) = RendezvousValue::decode(&bytes) else { return };

        let message = value_to_rendezvous_message(&value, &key, now_unix());
        let _ = self
            .send_peer_frame(from_v4, PeerMessageType::RendezvousResponse, 0, message.encode().into_bytes())
            .await;
    }

    fn handle_rendezvous_response(&self, frame: &PeerFrame) {
        let Ok(text) = std::str::from_utf8(&frame.data) else { return };
        let Ok(message) = RendezvousMessage::decode(text) else { return };
        let key_id = NodeId::from_str(&message.key);

        if let Some(tx) = self.pending_rendezvous.lock().remove(&key_id) {
            let _ = tx.send(message);
        }
    }

    async fn handle_rendezvous_connect(self: Arc<Self>, frame: &PeerFrame, from_v4: SocketAddrV4) {
        let Ok(text) = std::str::from_utf8(&frame.data) else { return };
        let Ok(message) = RendezvousMessage::decode(text) else { return };
        let Some(value) = rendezvous_message_to_value(&message) else { return };

        log::info!("rendezvous connect request from {from_v4}");
        self.register_rendezvous_peer(&value);
    }

    // ---- Discovery loops -----------------------------------------------------

    async fn multicast_loop(self: Arc<Self>) {
        let Some(mcast) = self.multicast.clone() else { return };

        let mut announce_ticker = tokio::time::interval(multicast::ANNOUNCE_INTERVAL);
        let mut query_ticker = tokio::time::interval(multicast::QUERY_INTERVAL);

        while self.running.load(Ordering::SeqCst) {
            tokio::select! {
                _ = announce_ticker.tick() => {
                    let _ = self.multicast_announce(&mcast).await;
                }
                _ = query_ticker.tick() => {
                    let _ = mcast.query(&self.bind_addr.ip().to_string(), self.bind_addr.port() as i32, "0.0.0.0", 0, false).await;
                }
                result = mcast.recv() => {
                    if let Ok(Some(event)) = result {
                        self.handle_multicast_event(&mcast, event).await;
                    }
                }
            }
        }
    }

    async fn multicast_announce(&self, mcast: &MulticastDiscovery) -> anyhow::Result<()> {
        let public = self.public_endpoint();
        mcast
            .announce(
                &self.bind_addr.ip().to_string(),
                self.bind_addr.port() as i32,
                &public.map(|e| e.ip().to_string()).unwrap_or_else(|| "0.0.0.0".to_string()),
                public.map(|e| e.port() as i32).unwrap_or(0),
                self.is_public.load(Ordering::Relaxed),
            )
            .await
    }

    async fn handle_multicast_event(&self, mcast: &MulticastDiscovery, event: MulticastEvent) {
        let MulticastEvent { frame, from: _ } = event;
        let Ok(ip) = frame.ip.parse::<Ipv4Addr>() else { return };

        match frame.kind {
            codec::discovery::MulticastKind::Announce => {
                let local_endpoint = SocketAddrV4::new(ip, frame.port as u16);
                let public_endpoint = frame
                    .public_ip
                    .parse::<Ipv4Addr>()
                    .ok()
                    .filter(|_| frame.public_port != 0)
                    .map(|pip| SocketAddrV4::new(pip, frame.public_port as u16));

                let is_new = self.peer_table.lookup(frame.node_id).is_none();
                self.peer_table.add_or_update(frame.node_id, None, local_endpoint, public_endpoint);
                self.peer_table.set_public(frame.node_id, frame.is_public);

                if is_new {
                    log::info!("discovered peer {} via LAN multicast", frame.node_id);
                }
            }
            codec::discovery::MulticastKind::Query => {
                if self.peer_table.lookup(frame.node_id).is_none() {
                    let public = self.public_endpoint();
                    let _ = mcast
                        .respond(
                            &self.bind_addr.ip().to_string(),
                            self.bind_addr.port() as i32,
                            &public.map(|e| e.ip().to_string()).unwrap_or_else(|| "0.0.0.0".to_string()),
                            public.map(|e| e.port() as i32).unwrap_or(0),
                            self.is_public.load(Ordering::Relaxed),
                        )
                        .await;
                }
            }
            codec::discovery::MulticastKind::Response => {}
        }
    }

    async fn directory_poll_loop(self: Arc<Self>) {
        let Some(directory) = self.directory.clone() else { return };
        let mut ticker = tokio::time::interval(Duration::from_secs(crate::discovery::directory::POLL_INTERVAL_SECS));

        while self.running.load(Ordering::SeqCst) {
            ticker.tick().await;

            let public = self.public_endpoint();
            let own_record = DirectoryRecord {
                id: self.local_peer_id,
                ip: self.bind_addr.ip().to_string(),
                port: self.bind_addr.port(),
                public_ip: public.map(|e| e.ip().to_string()).unwrap_or_else(|| "0.0.0.0".to_string()),
                public_port: public.map(|e| e.port()).unwrap_or(0),
                is_public: self.is_public.load(Ordering::Relaxed),
            };

            if let Err(e) = directory.publish(own_record).await {
                log::warn!("directory publish failed: {e}");
                continue;
            }

            match directory.list().await {
                Ok(records) => {
                    for record in records {
                        if record.id == self.local_peer_id {
                            continue;
                        }
                        let (Ok(ip), Ok(public_ip)) = (record.ip.parse::<Ipv4Addr>(), record.public_ip.parse::<Ipv4Addr>()) else {
                            continue;
                        };
                        let local_endpoint = SocketAddrV4::new(ip, record.port);
                        let public_endpoint = (record.public_port != 0).then(|| SocketAddrV4::new(public_ip, record.public_port));
                        self.peer_table.add_or_update(record.id, None, local_endpoint, public_endpoint);
                    }
                }
                Err(e) => log::warn!("directory list failed: {e}"),
            }
        }
    }

    async fn turn_refresh_loop(self: Arc<Self>) {
        let Some(turn) = self.turn.clone() else { return };
        let mut ticker = tokio::time::interval(TURN_REFRESH_POLL);

        while self.running.load(Ordering::SeqCst) {
            ticker.tick().await;

            if turn.is_allocated() && turn.needs_refresh() {
                if let Err(e) = turn.refresh().await {
                    log::warn!("TURN refresh failed: {e}");
                }
            }
        }
    }

    async fn ice_keepalive_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(ice::KEEPALIVE_INTERVAL_SECS));

        while self.running.load(Ordering::SeqCst) {
            ticker.tick().await;

            let sessions: Vec<(PeerId, Arc<IceSession>)> = self.ice_sessions.lock().iter().map(|(k, v)| (*k, v.clone())).collect();

            for (peer_id, session) in sessions {
                if session.state() == ConnectionState::Closed {
                    continue;
                }
                let Some(record) = self.peer_table.lookup(peer_id) else { continue };
                let target = record.public_endpoint.unwrap_or(record.local_endpoint);
                let succeeded = self.send_peer_frame(target, PeerMessageType::Ping, peer_id, Vec::new()).await.is_ok();
                session.record_keepalive(succeeded);
            }
        }
    }

    async fn dht_refresh_loop(self: Arc<Self>) {
        let Some(dht) = self.dht.clone() else { return };
        let mut ticker = tokio::time::interval(Duration::from_secs(60));

        while self.running.load(Ordering::SeqCst) {
            ticker.tick().await;
            let now = Instant::now();

            for node_id in dht.evict_stale(now) {
                log::debug!("evicted stale dht contact {}", node_id.to_hex());
            }

            for (bucket_idx, random_target) in dht.buckets_needing_refresh(now) {
                let _ = self.dht_find_node(random_target).await;
                dht.mark_refreshed(bucket_idx);
            }
        }
    }

    async fn maintenance_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(dispatcher::MAINTENANCE_TICK);

        while self.running.load(Ordering::SeqCst) {
            ticker.tick().await;

            let node_ids_by_peer: AHashMap<PeerId, NodeId> = self
                .peer_table
                .all()
                .iter()
                .filter_map(|r| r.node_id.map(|n| (r.peer_id, n)))
                .collect();

            for peer_id in self.peer_table.reap() {
                log::info!("peer {peer_id} reaped after {:?} of silence", dispatcher::REAP_TIMEOUT);
                if let Some(node_id) = node_ids_by_peer.get(&peer_id) {
                    self.observer.peer_lost(*node_id);
                }
            }

            for record in self.peer_table.all() {
                let silence = record.last_seen.elapsed();

                if silence >= dispatcher::KEEPALIVE_INTERVAL && silence < dispatcher::REAP_TIMEOUT {
                    let target = record.public_endpoint.unwrap_or(record.local_endpoint);
                    let _ = self.send_peer_frame(target, PeerMessageType::Ping, record.peer_id, Vec::new()).await;
                }

                if silence >= dispatcher::RECONNECT_THRESHOLD && silence < dispatcher::REAP_TIMEOUT && !record.reachable {
                    self.spawn_hole_punch(record.peer_id);
                }
            }
        }
    }

    // ---- Hole punching --------------------------------------------------------

    fn spawn_hole_punch(self: &Arc<Self>, peer_id: PeerId) {
        let node = self.clone();
        tokio::spawn(async move { node.hole_punch(peer_id).await });
    }

    async fn hole_punch(self: Arc<Self>, peer_id: PeerId) {
        let Some(record) = self.peer_table.lookup(peer_id) else { return };
        self.stats.record_hole_punch_attempt();

        if self.config.features.ice {
            let session = self
                .ice_sessions
                .lock()
                .entry(peer_id)
                .or_insert_with(|| Arc::new(IceSession::new(true)))
                .clone();

            session.gather_local_candidates(self.bind_addr, self.public_endpoint(), self.turn.as_ref().and_then(|t| t.relayed_address()));

            if let Some(public) = record.public_endpoint {
                session.add_remote_candidate(CandidateKind::ServerReflexive, public, ice::Candidate::new(CandidateKind::ServerReflexive, public).priority);
            }
            session.add_remote_candidate(CandidateKind::Host, record.local_endpoint, ice::Candidate::new(CandidateKind::Host, record.local_endpoint).priority);
            session.select_pair();
        }

        let targets: Vec<SocketAddrV4> = [record.public_endpoint, Some(record.local_endpoint)].into_iter().flatten().collect();

        for target in &targets {
            for _ in 0..dispatcher::HOLE_PUNCH_ATTEMPTS {
                let _ = self.send_peer_frame(*target, PeerMessageType::NatTraversal, peer_id, Vec::new()).await;
                tokio::time::sleep(dispatcher::HOLE_PUNCH_INTERVAL).await;
            }
        }

        if self.config.network.firewall_bypass {
            if let Some(ip) = targets.first().map(|t| *t.ip()) {
                for port in crate::net::udp::FALLBACK_PORTS {
                    let candidate = SocketAddrV4::new(ip, *port);
                    let _ = self.send_peer_frame(candidate, PeerMessageType::NatTraversal, peer_id, Vec::new()).await;
                    tokio::time::sleep(dispatcher::FIREWALL_SWEEP_INTERVAL).await;
                }
            }
        }
    }
}

fn rendezvous_message_to_value(msg: &RendezvousMessage) -> Option<RendezvousValue> {
    Some(RendezvousValue {
        node_id: msg.node_id,
        ip: msg.ip.parse().ok()?,
        port: msg.port,
        public_ip: (msg.public_ip != "0.0.0.0").then(|| msg.public_ip.parse().ok()).flatten(),
        public_port: (msg.public_port != 0).then_some(msg.public_port),
        behind_nat: !msg.is_public,
    })
}

fn value_to_rendezvous_message(value: &RendezvousValue, key: &str, timestamp: u32) -> RendezvousMessage {
    RendezvousMessage {
        node_id: value.node_id,
        key: key.to_string(),
        ip: value.ip.to_string(),
        port: value.port,
        public_ip: value.public_ip.map(|ip| ip.to_string()).unwrap_or_else(|| "0.0.0.0".to_string()),
        public_port: value.public_port.unwrap_or(0),
        is_public: !value.behind_nat,
        timestamp,
    }
}
