//! TURN client (spec §4.4, C5): allocate, refresh, create-permission, and
//! send/data indications against a single long-term-credential TURN
//! server. The teacher implements the TURN *server* side of this exact
//! state machine (`turn/operations/allocate.rs` et al.); this module is
//! its client-side mirror image, built on the same `codec::stun` wire
//! layer.
//!
//! Responses are correlated by transaction id rather than read directly
//! from the socket: the node's single UDP socket is owned exclusively by
//! the dispatcher's receive task (spec §5 "shared resources"), so this
//! client registers a pending transaction and is woken by
//! [`TurnClient::route_response`] when the dispatcher sees a matching
//! reply.

use std::net::SocketAddrV4;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::{AHashMap, AHashSet};
use anyhow::{anyhow, Context};
use bytes::{Bytes, BytesMut};
use codec::stun::attributes::{
    Data, ErrorCode, Lifetime, Nonce, Realm, RequestedTransport, UserName, XorPeerAddress,
    XorRelayedAddress,
};
use codec::stun::{Attributes, Message, MessageType, MessageWriter};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::timeout;

use crate::net::UdpEndpoint;

const TRANSACTION_TIMEOUT: Duration = Duration::from_secs(5);
const ALLOCATION_LIFETIME: u32 = 600;
const UDP_TRANSPORT: u8 = 17;

#[derive(Debug, Clone)]
enum State {
    Idle,
    Allocating,
    Allocated {
        relayed: SocketAddrV4,
        expiry: Instant,
        realm: String,
        nonce: String,
        key: [u8; 16],
    },
    Failed,
}

pub struct TurnClient {
    server: SocketAddrV4,
    socket: Arc<UdpEndpoint>,
    username: String,
    password: String,
    state: Mutex<State>,
    pending: Mutex<AHashMap<[u8; 12], oneshot::Sender<Bytes>>>,
    /// Realm/nonce captured from the 401 challenge, consumed by the
    /// authenticated retry in [`TurnClient::allocate`].
    last_challenge: Mutex<Option<(String, String)>>,
    /// Peers a CREATE_PERMISSION_REQUEST has already succeeded for, so
    /// [`TurnClient::send_data`] only asks once per peer (spec §4.4
    /// "Create-permission... before any data flow to a given peer").
    permissions: Mutex<AHashSet<SocketAddrV4>>,
}

impl TurnClient {
    pub fn new(server: SocketAddrV4, socket: Arc<UdpEndpoint>, username: String, password: String) -> Self {
        Self {
            server,
            socket,
            username,
            password,
            state: Mutex::new(State::Idle),
            pending: Mutex::new(AHashMap::new()),
            last_challenge: Mutex::new(None),
            permissions: Mutex::new(AHashSet::new()),
        }
    }

    pub fn allocated_lifetime_fraction(now: Instant, expiry: Instant) -> f64 {
        let total = ALLOCATION_LIFETIME as f64;
        let remaining = expiry.saturating_duration_since(now).as_secs_f64();
        1.0 - (remaining / total).clamp(0.0, 1.0)
    }

    pub fn relayed_address(&self) -> Option<SocketAddrV4> {
        match &*self.state.lock() {
            State::Allocated { relayed, .. } => Some(*relayed),
            _ => None,
        }
    }

    pub fn is_allocated(&self) -> bool {
        matches!(&*self.state.lock(), State::Allocated { .. })
    }

    /// True once 80% of the current allocation's lifetime has elapsed,
    /// the trigger point the TURN refresh task polls for (spec §4.4
    /// "Refresh").
    pub fn needs_refresh(&self) -> bool {
        match &*self.state.lock() {
            State::Allocated { expiry, .. } => Self::allocated_lifetime_fraction(Instant::now(), *expiry) >= 0.8,
            _ => false,
        }
    }

    /// Dispatcher entry point: called for every datagram that looks like
    /// a STUN/TURN frame. Returns `true` if the frame was a response this
    /// client was waiting on.
    pub fn route_response(&self, bytes: Bytes) -> bool {
        let mut attributes = Attributes::default();
        let Ok(message) = Message::decode(&bytes, &mut attributes) else {
            return false;
        };

        let tx = match <[u8; 12]>::try_from(message.transaction_id()) {
            Ok(tx) => tx,
            Err(_) => return false,
        };

        if let Some(sender) = self.pending.lock().remove(&tx) {
            let _ = sender.send(bytes);
            true
        } else {
            false
        }
    }

    /// Unwraps an inbound DATA_INDICATION into (peer address, payload),
    /// for the dispatcher to hand to the application. Not part of the
    /// pending-transaction correlation since indications expect no reply.
    pub fn unwrap_data_indication(bytes: &[u8]) -> Option<(SocketAddrV4, Vec<u8>)> {
        let mut attributes = Attributes::default();
        let message = Message::decode(bytes, &mut attributes).ok()?;
        if message.kind() != MessageType::DATA_INDICATION {
            return None;
        }

        let peer = message.get::<XorPeerAddress>()?;
        let data = message.get::<Data>()?.to_vec();
        Some((peer, data))
    }

    async fn transact(&self, bytes: &[u8], transaction_id: [u8; 12]) -> anyhow::Result<Bytes> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(transaction_id, tx);

        self.socket
            .send_to(bytes, self.server.into())
            .await
            .context("sending TURN request")?;

        match timeout(TRANSACTION_TIMEOUT, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(anyhow!("TURN transaction channel dropped")),
            Err(_) => {
                self.pending.lock().remove(&transaction_id);
                Err(anyhow!("TURN transaction timed out"))
            }
        }
    }

    /// Allocate (spec §4.4 "Allocate"): sends an unauthenticated request
    /// first; on a 401 challenge, derives the long-term credential and
    /// retries once with MESSAGE-INTEGRITY.
    pub async fn allocate(&self) -> anyhow::Result<SocketAddrV4> {
        *self.state.lock() = State::Allocating;

        match self.allocate_once(None).await {
            Ok(relayed) => Ok(relayed),
            Err(first_err) => {
                let challenge = self.last_challenge.lock().take();
                let Some((realm, nonce)) = challenge else {
                    *self.state.lock() = State::Failed;
                    return Err(first_err);
                };

                let key = codec::crypto::long_term_key(&self.username, &realm, &self.password);
                match self.allocate_once(Some((realm, nonce, key))).await {
                    Ok(relayed) => Ok(relayed),
                    Err(e) => {
                        *self.state.lock() = State::Failed;
                        Err(e)
                    }
                }
            }
        }
    }

    async fn allocate_once(&self, creds: Option<(String, String, [u8; 16])>) -> anyhow::Result<SocketAddrV4> {
        let transaction_id: [u8; 12] = rand::random();
        let mut bytes = BytesMut::new();
        let mut writer = MessageWriter::new(MessageType::ALLOCATE_REQUEST, transaction_id, &mut bytes);
        writer.append::<RequestedTransport>(UDP_TRANSPORT);

        let key = if let Some((realm, nonce, key)) = &creds {
            writer.append::<UserName>(self.username.clone());
            writer.append::<Realm>(realm.clone());
            writer.append::<Nonce>(nonce.clone());
            Some(*key)
        } else {
            None
        };

        writer.finish(key.as_ref().map(|k| k.as_slice()));

        let response = self.transact(&bytes, transaction_id).await?;
        let mut attributes = Attributes::default();
        let message = Message::decode(&response, &mut attributes)
            .map_err(|e| anyhow!("malformed ALLOCATE response: {e}"))?;

        if message.kind() == MessageType::ALLOCATE_ERROR {
            let (code, _reason) = message.get::<ErrorCode>().ok_or_else(|| anyhow!("ALLOCATE error carried no ErrorCode"))?;

            if code == 401 {
                let realm = message.get::<Realm>().ok_or_else(|| anyhow!("401 response missing Realm"))?;
                let nonce = message.get::<Nonce>().ok_or_else(|| anyhow!("401 response missing Nonce"))?;
                *self.last_challenge.lock() = Some((realm, nonce));
            }

            return Err(anyhow!("ALLOCATE rejected with code {code}"));
        }

        if message.kind() != MessageType::ALLOCATE_RESPONSE {
            return Err(anyhow!("unexpected ALLOCATE response type"));
        }

        let relayed = message
            .get::<XorRelayedAddress>()
            .ok_or_else(|| anyhow!("ALLOCATE response missing XorRelayedAddress"))?;

        *self.state.lock() = State::Allocated {
            relayed,
            expiry: Instant::now() + Duration::from_secs(ALLOCATION_LIFETIME as u64),
            realm: creds.as_ref().map(|(r, ..)| r.clone()).unwrap_or_default(),
            nonce: creds.as_ref().map(|(_, n, _)| n.clone()).unwrap_or_default(),
            key: key.unwrap_or([0u8; 16]),
        };

        Ok(relayed)
    }

    /// Refresh (spec §4.4 "Refresh"): resends with the credential
    /// established at allocation time.
    pub async fn refresh(&self) -> anyhow::Result<()> {
        let (realm, nonce, key) = {
            let state = self.state.lock();
            match &*state {
                State::Allocated { realm, nonce, key, .. } => (realm.clone(), nonce.clone(), *key),
                _ => return Err(anyhow!("refresh attempted with no active allocation")),
            }
        };

        let transaction_id: [u8; 12] = rand::random();
        let mut bytes = BytesMut::new();
        let mut writer = MessageWriter::new(MessageType::REFRESH_REQUEST, transaction_id, &mut bytes);
        writer.append::<Lifetime>(ALLOCATION_LIFETIME);
        writer.append::<UserName>(self.username.clone());
        writer.append::<Realm>(realm);
        writer.append::<Nonce>(nonce);
        writer.finish(Some(&key));

        let response = self.transact(&bytes, transaction_id).await?;
        let mut attributes = Attributes::default();
        let message = Message::decode(&response, &mut attributes)
            .map_err(|e| anyhow!("malformed REFRESH response: {e}"))?;

        if message.kind() != MessageType::REFRESH_RESPONSE {
            *self.state.lock() = State::Failed;
            return Err(anyhow!("REFRESH rejected"));
        }

        if let State::Allocated { expiry, .. } = &mut *self.state.lock() {
            *expiry = Instant::now() + Duration::from_secs(ALLOCATION_LIFETIME as u64);
        }

        Ok(())
    }

    /// Create-permission (spec §4.4 "Create-permission"): required
    /// before any SEND_INDICATION to `peer` will be relayed.
    pub async fn create_permission(&self, peer: SocketAddrV4) -> anyhow::Result<()> {
        let (realm, nonce, key) = {
            let state = self.state.lock();
            match &*state {
                State::Allocated { realm, nonce, key, .. } => (realm.clone(), nonce.clone(), *key),
                _ => return Err(anyhow!("create-permission attempted with no active allocation")),
            }
        };

        let transaction_id: [u8; 12] = rand::random();
        let mut bytes = BytesMut::new();
        let mut writer = MessageWriter::new(MessageType::CREATE_PERMISSION_REQUEST, transaction_id, &mut bytes);
        writer.append::<XorPeerAddress>(peer);
        writer.append::<UserName>(self.username.clone());
        writer.append::<Realm>(realm);
        writer.append::<Nonce>(nonce);
        writer.finish(Some(&key));

        let response = self.transact(&bytes, transaction_id).await?;
        let mut attributes = Attributes::default();
        let message = Message::decode(&response, &mut attributes)
            .map_err(|e| anyhow!("malformed CREATE_PERMISSION response: {e}"))?;

        if message.kind() != MessageType::CREATE_PERMISSION_RESPONSE {
            return Err(anyhow!("CREATE_PERMISSION rejected"));
        }

        Ok(())
    }

    /// Wraps outbound application data in a SEND_INDICATION (spec §4.4
    /// "Send/receive"). Ensures a CREATE_PERMISSION_REQUEST has succeeded
    /// for `peer` first; indications themselves carry no response.
    pub async fn send_data(&self, peer: SocketAddrV4, data: &[u8]) -> anyhow::Result<()> {
        if !self.permissions.lock().contains(&peer) {
            self.create_permission(peer).await?;
            self.permissions.lock().insert(peer);
        }

        let transaction_id: [u8; 12] = rand::random();
        let mut bytes = BytesMut::new();
        let mut writer = MessageWriter::new(MessageType::SEND_INDICATION, transaction_id, &mut bytes);
        writer.append::<XorPeerAddress>(peer);
        writer.append::<Data>(data);
        writer.finish(None);

        self.socket.send_to(&bytes, self.server.into()).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn route_response_wakes_the_matching_transaction() {
        let socket = Arc::new(UdpEndpoint::bind("127.0.0.1:0".parse().unwrap(), false).unwrap());
        let server = socket.local_addr().unwrap();
        let client = TurnClient::new(
            match server {
                std::net::SocketAddr::V4(v4) => v4,
                _ => unreachable!(),
            },
            socket.clone(),
            "user".to_string(),
            "pass".to_string(),
        );

        let transaction_id = [5u8; 12];
        let (tx, rx) = oneshot::channel();
        client.pending.lock().insert(transaction_id, tx);

        let mut bytes = BytesMut::new();
        MessageWriter::new(MessageType::ALLOCATE_RESPONSE, transaction_id, &mut bytes).finish(None);

        assert!(client.route_response(bytes.freeze()));
        assert!(rx.await.is_ok());
    }

    #[test]
    fn unwrap_data_indication_round_trips() {
        let peer = SocketAddrV4::new([127, 0, 0, 1].into(), 4000);
        let mut bytes = BytesMut::new();
        let mut writer = MessageWriter::new(MessageType::DATA_INDICATION, [1u8; 12], &mut bytes);
        writer.append::<XorPeerAddress>(peer);
        writer.append::<Data>(b"hello");
        writer.finish(None);

        let (decoded_peer, data) = TurnClient::unwrap_data_indication(&bytes).unwrap();
        assert_eq!(decoded_peer, peer);
        assert_eq!(data, b"hello");
    }
}
