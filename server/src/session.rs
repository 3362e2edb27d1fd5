//! Connection session lifecycle and input queuing for the authoritative
//! server.
//!
//! Each client runs through `Connecting -> Authenticated -> Joined ->
//! (Disconnected[reconnectable] -> Joined | Closed) -> Closed`. Sessions are
//! keyed by connection id and by an opaque authenticated identity; a
//! reconnect inside the grace window with the same identity resumes the
//! same entity. The registry is owned by the match loop, never shared.

use log::{info, warn};
use shared::{ControlInputs, EntityState};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// One input extracted from a client delta, queued for the tick.
#[derive(Debug, Clone)]
pub struct TimedInput {
    pub sequence: u32,
    pub timestamp: u64,
    pub inputs: ControlInputs,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Authenticated,
    Joined,
    /// Transport lost while joined; reconnection allowed until the deadline.
    Disconnected { deadline: Instant },
    Closed,
}

/// Server-side view of one client connection.
#[derive(Debug)]
pub struct ConnectionSession {
    pub connection_id: u32,
    /// Opaque verified identity supplied by the authenticator.
    pub identity: String,
    pub addr: SocketAddr,
    pub entity_id: Option<u64>,
    pub last_activity: Instant,
    pub latency_estimate_ms: u64,
    pub state: SessionState,
    /// Inputs awaiting the next tick, kept sorted by sequence.
    pending_inputs: Vec<TimedInput>,
    /// Highest input sequence applied to the simulation for this client.
    pub last_acked_sequence: u32,
    /// State produced by the tick that consumed that input. Corrections
    /// carry this pair, never the live entity, so the client compares the
    /// server's answer against the matching prediction record.
    pub last_acked_state: Option<EntityState>,
    /// Last control inputs seen, reused for keep-alive deltas that omit the
    /// input field.
    pub last_inputs: ControlInputs,
    /// Per-entity baselines of what this client last received, so broadcast
    /// deltas stay small.
    pub broadcast_bases: HashMap<u64, EntityState>,
}

impl ConnectionSession {
    pub fn new(connection_id: u32, identity: String, addr: SocketAddr) -> Self {
        Self {
            connection_id,
            identity,
            addr,
            entity_id: None,
            last_activity: Instant::now(),
            latency_estimate_ms: 0,
            state: SessionState::Connecting,
            pending_inputs: Vec::new(),
            last_acked_sequence: 0,
            last_acked_state: None,
            last_inputs: ControlInputs::default(),
            broadcast_bases: HashMap::new(),
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn is_timed_out(&self, timeout: Duration) -> bool {
        self.last_activity.elapsed() > timeout
    }

    /// Queues an input for the next tick. Stale sequences (at or below the
    /// last applied) are dropped rather than ever applied backward.
    pub fn queue_input(&mut self, input: TimedInput) -> bool {
        self.touch();
        if input.sequence <= self.last_acked_sequence {
            warn!(
                "connection {}: dropping stale input sequence {} (last acked {})",
                self.connection_id, input.sequence, self.last_acked_sequence
            );
            return false;
        }
        self.last_inputs = input.inputs;
        self.pending_inputs.push(input);
        // Sort by sequence to tolerate out-of-order delivery.
        self.pending_inputs.sort_by_key(|i| i.sequence);
        true
    }

    /// Takes the input to apply this tick: most-recent-wins when several
    /// arrived since the last tick, and the queue is acked through it so at
    /// most one input per entity is ever applied per tick.
    pub fn take_tick_input(&mut self) -> Option<TimedInput> {
        let newest = self.pending_inputs.pop()?;
        self.last_acked_sequence = newest.sequence;
        self.pending_inputs.clear();
        Some(newest)
    }

    pub fn pending_len(&self) -> usize {
        self.pending_inputs.len()
    }
}

/// Verifies a connect token into an opaque stable identity. The real
/// implementation lives outside the sync core; sessions only need the
/// identity string it produces.
pub trait Authenticator: Send {
    fn authenticate(&self, token: &str) -> Result<String, String>;
}

/// Token-as-identity validator used until a real auth backend is wired in.
/// Rejects empty tokens so the failure path stays exercised.
pub struct TokenAuthenticator;

impl Authenticator for TokenAuthenticator {
    fn authenticate(&self, token: &str) -> Result<String, String> {
        let token = token.trim();
        if token.is_empty() {
            Err("empty auth token".to_string())
        } else {
            Ok(token.to_string())
        }
    }
}

/// Owns every session for one match. Enforces capacity, resolves addresses
/// and identities, and runs the timeout/grace-deadline sweeps.
pub struct SessionRegistry {
    sessions: HashMap<u32, ConnectionSession>,
    next_connection_id: u32,
    max_clients: usize,
}

/// Outcome of one liveness sweep.
#[derive(Debug, Default)]
pub struct SweepOutcome {
    /// Sessions whose transport timed out and moved to the grace window.
    pub newly_disconnected: Vec<u32>,
    /// Sessions closed outright (no reconnection allowed, or grace expiry),
    /// with the entity each one releases.
    pub closed: Vec<(u32, Option<u64>)>,
}

impl SessionRegistry {
    pub fn new(max_clients: usize) -> Self {
        Self {
            sessions: HashMap::new(),
            next_connection_id: 1,
            max_clients,
        }
    }

    /// Admits a freshly authenticated connection, or `None` at capacity.
    /// Capacity counts every non-closed session, grace-window ones included.
    pub fn add(&mut self, identity: String, addr: SocketAddr) -> Option<u32> {
        if self.active_count() >= self.max_clients {
            return None;
        }

        let connection_id = self.next_connection_id;
        self.next_connection_id += 1;

        let mut session = ConnectionSession::new(connection_id, identity, addr);
        session.state = SessionState::Authenticated;
        info!(
            "connection {} authenticated as '{}' from {}",
            connection_id, session.identity, addr
        );
        self.sessions.insert(connection_id, session);
        Some(connection_id)
    }

    pub fn get(&self, connection_id: u32) -> Option<&ConnectionSession> {
        self.sessions.get(&connection_id)
    }

    pub fn get_mut(&mut self, connection_id: u32) -> Option<&mut ConnectionSession> {
        self.sessions.get_mut(&connection_id)
    }

    pub fn find_by_addr(&self, addr: SocketAddr) -> Option<u32> {
        self.sessions
            .iter()
            .find(|(_, s)| s.addr == addr && s.state != SessionState::Closed)
            .map(|(id, _)| *id)
    }

    /// Finds a session in its grace window for the given identity.
    pub fn find_reconnectable(&self, identity: &str) -> Option<u32> {
        let now = Instant::now();
        self.sessions
            .iter()
            .find(|(_, s)| {
                s.identity == identity
                    && matches!(s.state, SessionState::Disconnected { deadline } if deadline > now)
            })
            .map(|(id, _)| *id)
    }

    /// Restores a grace-window session onto a new transport address.
    pub fn resume(&mut self, connection_id: u32, addr: SocketAddr) -> Option<&ConnectionSession> {
        let session = self.sessions.get_mut(&connection_id)?;
        session.addr = addr;
        session.state = SessionState::Joined;
        session.touch();
        info!(
            "connection {} ('{}') reconnected from {}, resuming entity {:?}",
            connection_id, session.identity, addr, session.entity_id
        );
        Some(session)
    }

    /// Marks a joined session's entity and promotes it to `Joined`.
    pub fn mark_joined(&mut self, connection_id: u32, entity_id: u64) {
        if let Some(session) = self.sessions.get_mut(&connection_id) {
            session.entity_id = Some(entity_id);
            session.state = SessionState::Joined;
        }
    }

    /// Closes a session outright, returning the entity it releases.
    pub fn close(&mut self, connection_id: u32) -> Option<u64> {
        let session = self.sessions.get_mut(&connection_id)?;
        if session.state == SessionState::Closed {
            return None;
        }
        info!(
            "connection {} ('{}') closed",
            connection_id, session.identity
        );
        session.state = SessionState::Closed;
        let entity = session.entity_id.take();
        self.sessions.remove(&connection_id);
        entity
    }

    /// One liveness pass: transport-silent joined sessions either enter the
    /// grace window (when the mode allows reconnection) or close; sessions
    /// whose grace deadline passed close.
    pub fn sweep(
        &mut self,
        timeout: Duration,
        allow_reconnection: bool,
        reconnect_window: Duration,
    ) -> SweepOutcome {
        let now = Instant::now();
        let mut outcome = SweepOutcome::default();

        let mut to_close = Vec::new();
        for (id, session) in self.sessions.iter_mut() {
            match session.state {
                SessionState::Joined | SessionState::Authenticated | SessionState::Connecting => {
                    if session.is_timed_out(timeout) {
                        if allow_reconnection && session.state == SessionState::Joined {
                            session.state = SessionState::Disconnected {
                                deadline: now + reconnect_window,
                            };
                            info!(
                                "connection {} lost transport, reconnect window {}s",
                                id,
                                reconnect_window.as_secs()
                            );
                            outcome.newly_disconnected.push(*id);
                        } else {
                            to_close.push(*id);
                        }
                    }
                }
                SessionState::Disconnected { deadline } => {
                    if deadline <= now {
                        to_close.push(*id);
                    }
                }
                SessionState::Closed => {}
            }
        }

        for id in to_close {
            let entity = self.close(id);
            outcome.closed.push((id, entity));
        }

        outcome
    }

    /// Addresses of sessions that should receive broadcasts right now.
    /// Grace-window sessions keep their entity but get nothing delivered.
    pub fn joined_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.state == SessionState::Joined)
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Every session not yet closed, grace-window ones included.
    pub fn active_count(&self) -> usize {
        self.sessions
            .values()
            .filter(|s| s.state != SessionState::Closed)
            .count()
    }

    /// Sessions currently participating as players.
    pub fn player_count(&self) -> usize {
        self.sessions
            .values()
            .filter(|s| {
                s.entity_id.is_some()
                    && matches!(
                        s.state,
                        SessionState::Joined | SessionState::Disconnected { .. }
                    )
            })
            .count()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
