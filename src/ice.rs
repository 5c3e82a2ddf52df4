//! ICE engine (spec §4.8, C9): candidate gathering, static priority/pair
//! selection, and a keepalive-driven liveness state machine. Grounded in
//! `ice.c`/`ice.h`'s `IceSession`; the teacher repo has no ICE
//! implementation of its own (TURN relays traffic but never negotiates a
//! peer connection), so the state-machine shape is carried over from the
//! original and rendered in the style of the teacher's session-state
//! types (`turn/src/session.rs`-like: a mutex-guarded struct with
//! explicit state enum transitions).

use std::net::SocketAddrV4;
use std::time::Instant;

use parking_lot::Mutex;

pub const MAX_CANDIDATES: usize = 10;
pub const KEEPALIVE_INTERVAL_SECS: u64 = 10;
pub const KEEPALIVE_FAILURE_LIMIT: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateKind {
    Host,
    ServerReflexive,
    Relayed,
}

impl CandidateKind {
    /// Type preference term of the RFC 5245 §4.1.2.1 priority formula.
    /// Host > server-reflexive > relayed, as in `ice.c::calculate_priority`.
    fn type_preference(self) -> u32 {
        match self {
            Self::Host => 126,
            Self::ServerReflexive => 100,
            Self::Relayed => 0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Candidate {
    pub kind: CandidateKind,
    pub endpoint: SocketAddrV4,
    pub priority: u32,
    pub nominated: bool,
}

impl Candidate {
    /// `(type_pref << 24) | (local_pref << 8) | (256 - component)`, with
    /// `local_pref = 1` and `component = 1` (this node always advertises
    /// a single RTP-equivalent component), per spec §4.8 and
    /// `ice.c::calculate_priority`.
    pub fn new(kind: CandidateKind, endpoint: SocketAddrV4) -> Self {
        let local_preference: u32 = 1;
        let component: u32 = 1;
        let priority = (kind.type_preference() << 24) | (local_preference << 8) | (256 - component);

        Self {
            kind,
            endpoint,
            priority,
            nominated: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Failed,
    Disconnected,
    Closed,
}

struct SessionState {
    local_candidates: Vec<Candidate>,
    remote_candidates: Vec<Candidate>,
    selected_pair: Option<(Candidate, Candidate)>,
    state: ConnectionState,
    controlling: bool,
    consecutive_keepalive_failures: u32,
    last_keepalive: Option<Instant>,
}

/// One ICE session per remote peer. The teacher's per-allocation mutex
/// (`turn/src/router/route.rs`-style guarded state) is the model for
/// serializing transitions (spec §5 "ICE state transitions... serialized
/// by the session's mutex").
pub struct IceSession {
    inner: Mutex<SessionState>,
}

impl IceSession {
    pub fn new(controlling: bool) -> Self {
        Self {
            inner: Mutex::new(SessionState {
                local_candidates: Vec::new(),
                remote_candidates: Vec::new(),
                selected_pair: None,
                state: ConnectionState::New,
                controlling,
                consecutive_keepalive_failures: 0,
                last_keepalive: None,
            }),
        }
    }

    /// Gathers local candidates: always a host candidate; a
    /// server-reflexive candidate if `reflexive` is given; a relayed
    /// candidate if `relayed` is given (spec §4.8 "Candidate gathering").
    pub fn gather_local_candidates(
        &self,
        host: SocketAddrV4,
        reflexive: Option<SocketAddrV4>,
        relayed: Option<SocketAddrV4>,
    ) {
        let mut state = self.inner.lock();
        state.local_candidates.clear();
        state.local_candidates.push(Candidate::new(CandidateKind::Host, host));

        if let Some(endpoint) = reflexive {
            state.local_candidates.push(Candidate::new(CandidateKind::ServerReflexive, endpoint));
        }

        if let Some(endpoint) = relayed {
            state.local_candidates.push(Candidate::new(CandidateKind::Relayed, endpoint));
        }

        state.local_candidates.truncate(MAX_CANDIDATES);
        state.state = ConnectionState::Checking;
    }

    /// Adds a remote candidate supplied by the application/signaling
    /// path, up to [`MAX_CANDIDATES`] (spec §4.8 "Remote candidates").
    pub fn add_remote_candidate(&self, kind: CandidateKind, endpoint: SocketAddrV4, priority: u32) {
        let mut state = self.inner.lock();
        if state.remote_candidates.len() >= MAX_CANDIDATES {
            return;
        }

        state.remote_candidates.push(Candidate {
            kind,
            endpoint,
            priority,
            nominated: false,
        });
    }

    /// Pair priority per RFC 5245 §5.7.2: `2^32 * min(g,d) + 2*max(g,d) +
    /// [g>d]`, with `g`/`d` the controlling/controlled side's candidate
    /// priority (spec §4.8 "Pair selection", `ice.c::calculate_pair_priority`).
    fn pair_priority(controlling: bool, local: &Candidate, remote: &Candidate) -> u64 {
        let (g, d) = if controlling {
            (local.priority as u64, remote.priority as u64)
        } else {
            (remote.priority as u64, local.priority as u64)
        };

        let min = g.min(d);
        let max = g.max(d);
        (1u64 << 32) * min + 2 * max + if g > d { 1 } else { 0 }
    }

    /// Computes the pair priority for every `(local, remote)` cross
    /// product and selects the maximum. Transitions to `connected` on
    /// success, `failed` if either side has no candidates.
    pub fn select_pair(&self) {
        let mut state = self.inner.lock();

        if state.local_candidates.is_empty() || state.remote_candidates.is_empty() {
            state.state = ConnectionState::Failed;
            return;
        }

        let controlling = state.controlling;
        let mut best: Option<(u64, usize, usize)> = None;

        for (li, local) in state.local_candidates.iter().enumerate() {
            for (ri, remote) in state.remote_candidates.iter().enumerate() {
                let priority = Self::pair_priority(controlling, local, remote);
                if best.map(|(p, ..)| priority > p).unwrap_or(true) {
                    best = Some((priority, li, ri));
                }
            }
        }

        let Some((_, li, ri)) = best else {
            state.state = ConnectionState::Failed;
            return;
        };

        state.local_candidates[li].nominated = true;
        state.remote_candidates[ri].nominated = true;
        state.selected_pair = Some((state.local_candidates[li], state.remote_candidates[ri]));
        state.state = ConnectionState::Connected;
    }

    pub fn selected_pair(&self) -> Option<(Candidate, Candidate)> {
        self.inner.lock().selected_pair
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    /// Whether outbound payload should go through the relay (spec §4.8
    /// "Sending"): true only when the selected local candidate is
    /// `Relayed`.
    pub fn should_relay(&self) -> bool {
        self.inner
            .lock()
            .selected_pair
            .map(|(local, _)| local.kind == CandidateKind::Relayed)
            .unwrap_or(false)
    }

    /// Records a keepalive outcome (spec §4.8 "Keepalive"): three
    /// consecutive failures transition the session to `disconnected`.
    pub fn record_keepalive(&self, succeeded: bool) {
        let mut state = self.inner.lock();
        state.last_keepalive = Some(Instant::now());

        if succeeded {
            state.consecutive_keepalive_failures = 0;
            if state.state == ConnectionState::Disconnected {
                state.state = ConnectionState::Connected;
            }
        } else {
            state.consecutive_keepalive_failures += 1;
            if state.consecutive_keepalive_failures >= KEEPALIVE_FAILURE_LIMIT {
                state.state = ConnectionState::Disconnected;
            }
        }
    }

    pub fn close(&self) {
        self.inner.lock().state = ConnectionState::Closed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ep(port: u16) -> SocketAddrV4 {
        SocketAddrV4::new([192, 0, 2, 1].into(), port)
    }

    #[test]
    fn host_candidate_outranks_relayed_at_same_endpoint() {
        let host = Candidate::new(CandidateKind::Host, ep(5000));
        let relayed = Candidate::new(CandidateKind::Relayed, ep(5000));
        assert!(host.priority > relayed.priority);
    }

    #[test]
    fn controlling_side_prefers_host_host_pair() {
        let session = IceSession::new(true);
        session.gather_local_candidates(ep(5000), Some(ep(5001)), None);
        session.add_remote_candidate(CandidateKind::Host, ep(6000), Candidate::new(CandidateKind::Host, ep(6000)).priority);
        session.add_remote_candidate(
            CandidateKind::ServerReflexive,
            ep(6001),
            Candidate::new(CandidateKind::ServerReflexive, ep(6001)).priority,
        );

        session.select_pair();

        let (local, remote) = session.selected_pair().unwrap();
        assert_eq!(local.kind, CandidateKind::Host);
        assert_eq!(remote.kind, CandidateKind::Host);
        assert_eq!(session.state(), ConnectionState::Connected);
    }

    #[test]
    fn no_remote_candidates_fails_the_session() {
        let session = IceSession::new(true);
        session.gather_local_candidates(ep(5000), None, None);
        session.select_pair();
        assert_eq!(session.state(), ConnectionState::Failed);
    }

    #[test]
    fn three_failed_keepalives_disconnect_the_session() {
        let session = IceSession::new(true);
        session.gather_local_candidates(ep(5000), None, None);
        session.add_remote_candidate(CandidateKind::Host, ep(6000), 1);
        session.select_pair();

        session.record_keepalive(false);
        session.record_keepalive(false);
        assert_eq!(session.state(), ConnectionState::Connected);
        session.record_keepalive(false);
        assert_eq!(session.state(), ConnectionState::Disconnected);
    }

    /// When neither side has a usable host/reflexive path (symmetric NAT
    /// on both ends), only relayed candidates are offered and the
    /// selected pair necessarily routes through TURN.
    #[test]
    fn relayed_local_candidate_routes_through_turn() {
        let session = IceSession::new(true);
        {
            let mut state = session.inner.lock();
            state.local_candidates = vec![Candidate::new(CandidateKind::Relayed, ep(5002))];
            state.remote_candidates = vec![Candidate::new(CandidateKind::Relayed, ep(6002))];
        }

        session.select_pair();
        assert!(session.should_relay());
        assert_eq!(session.state(), ConnectionState::Connected);
    }

    /// A host local candidate, when present, outranks a relayed remote
    /// candidate in the pair-priority formula even though connectivity
    /// checks (not implemented, spec §4.8) might show it unreachable —
    /// a documented limitation of static-only prioritization.
    #[test]
    fn host_local_candidate_outranks_relay_pairing_even_against_relay_remote() {
        let session = IceSession::new(true);
        session.gather_local_candidates(ep(5000), None, Some(ep(5002)));
        session.add_remote_candidate(CandidateKind::Relayed, ep(6002), Candidate::new(CandidateKind::Relayed, ep(6002)).priority);
        session.select_pair();

        let (local, _remote) = session.selected_pair().unwrap();
        assert_eq!(local.kind, CandidateKind::Host);
    }
}
