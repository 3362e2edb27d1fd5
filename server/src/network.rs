//! Server network layer: UDP transport, authoritative tick and broadcast
//! coordination.
//!
//! A receiver task turns datagrams into messages on a channel and a sender
//! task drains the outbound queue, so the main loop is the single owner of
//! the session registry and the match state. Everything runs through one
//! `select!` over inbound messages, the authoritative tick, the broadcast
//! interval and the liveness sweep.

use crate::match_state::{GameModePolicy, Match};
use crate::session::{Authenticator, SessionRegistry, SessionState, TimedInput, TokenAuthenticator};
use bincode::{deserialize, serialize};
use log::{debug, error, info, warn};
use shared::{codec, now_millis, EntityState, Packet, StateDelta, PROTOCOL_VERSION};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::interval;

/// Transport is considered lost after this much silence. Idle players keep
/// the transport alive through ping probes and keep-alive deltas, so
/// reaching this means the link is gone, not that the player stopped
/// maneuvering.
pub const TRANSPORT_TIMEOUT: Duration = Duration::from_secs(15);

/// Messages sent from network tasks to the main server loop.
#[derive(Debug)]
pub enum ServerMessage {
    PacketReceived {
        packet: Packet,
        addr: SocketAddr,
    },
    #[allow(dead_code)]
    Shutdown,
}

/// Messages sent from the main loop to the sender task.
#[derive(Debug)]
pub enum OutboundMessage {
    Send {
        packet: Packet,
        addr: SocketAddr,
    },
    /// One packet fanned out to an explicit recipient list. The list is
    /// computed by the main loop so the registry stays singly owned.
    Broadcast {
        packet: Packet,
        addrs: Vec<SocketAddr>,
    },
}

/// Main server coordinating networking, sessions and the authoritative
/// simulation for one match.
pub struct Server {
    socket: Arc<UdpSocket>,
    registry: SessionRegistry,
    game: Match,
    authenticator: Box<dyn Authenticator>,

    server_tx: mpsc::UnboundedSender<ServerMessage>,
    server_rx: mpsc::UnboundedReceiver<ServerMessage>,
    out_tx: mpsc::UnboundedSender<OutboundMessage>,
    out_rx: Option<mpsc::UnboundedReceiver<OutboundMessage>>,
}

impl Server {
    pub async fn new(
        addr: &str,
        policy: GameModePolicy,
        max_clients: usize,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        info!("Server listening on {}", addr);

        let (server_tx, server_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();

        Ok(Server {
            socket,
            registry: SessionRegistry::new(max_clients),
            game: Match::new(policy),
            authenticator: Box::new(TokenAuthenticator),
            server_tx,
            server_rx,
            out_tx,
            out_rx: Some(out_rx),
        })
    }

    /// Spawns the task that continuously listens for incoming datagrams.
    fn spawn_network_receiver(&self) {
        let socket = Arc::clone(&self.socket);
        let server_tx = self.server_tx.clone();

        tokio::spawn(async move {
            let mut buffer = [0u8; 2048];

            loop {
                match socket.recv_from(&mut buffer).await {
                    Ok((len, addr)) => {
                        if let Ok(packet) = deserialize::<Packet>(&buffer[0..len]) {
                            if server_tx
                                .send(ServerMessage::PacketReceived { packet, addr })
                                .is_err()
                            {
                                break;
                            }
                        } else {
                            warn!("Failed to deserialize packet from {}", addr);
                        }
                    }
                    Err(e) => {
                        error!("Error receiving packet: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        });
    }

    /// Spawns the task that drains the outbound queue onto the socket.
    fn spawn_network_sender(&mut self) {
        let Some(mut out_rx) = self.out_rx.take() else {
            return;
        };
        let socket = Arc::clone(&self.socket);

        tokio::spawn(async move {
            while let Some(message) = out_rx.recv().await {
                match message {
                    OutboundMessage::Send { packet, addr } => {
                        if let Err(e) = Self::send_packet_impl(&socket, &packet, addr).await {
                            error!("Failed to send packet to {}: {}", addr, e);
                        }
                    }
                    OutboundMessage::Broadcast { packet, addrs } => {
                        for addr in addrs {
                            if let Err(e) = Self::send_packet_impl(&socket, &packet, addr).await {
                                error!("Failed to broadcast to {}: {}", addr, e);
                            }
                        }
                    }
                }
            }
        });
    }

    async fn send_packet_impl(
        socket: &UdpSocket,
        packet: &Packet,
        addr: SocketAddr,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let data = serialize(packet)?;
        socket.send_to(&data, addr).await?;
        Ok(())
    }

    fn send_packet(&self, packet: Packet, addr: SocketAddr) {
        if self
            .out_tx
            .send(OutboundMessage::Send { packet, addr })
            .is_err()
        {
            error!("Failed to queue packet for sending");
        }
    }

    fn broadcast_to_joined(&self, packet: Packet) {
        let addrs: Vec<SocketAddr> = self
            .registry
            .joined_ids()
            .into_iter()
            .filter_map(|id| self.registry.get(id).map(|s| s.addr))
            .collect();
        if addrs.is_empty() {
            return;
        }
        if self
            .out_tx
            .send(OutboundMessage::Broadcast { packet, addrs })
            .is_err()
        {
            error!("Failed to queue broadcast");
        }
    }

    /// Processes one inbound packet against session and match state.
    fn handle_packet(&mut self, packet: Packet, addr: SocketAddr) {
        match packet {
            Packet::Connect {
                client_version,
                auth_token,
            } => self.handle_connect(client_version, &auth_token, addr),

            Packet::Join { aircraft } => {
                let Some(id) = self.registry.find_by_addr(addr) else {
                    warn!("Join from unknown address {}", addr);
                    return;
                };
                {
                    let Some(session) = self.registry.get(id) else {
                        return;
                    };
                    if session.state != SessionState::Authenticated {
                        warn!("connection {}: Join in state {:?}", id, session.state);
                        return;
                    }
                }

                let entity_id = self.game.spawn_entity(aircraft);
                self.registry.mark_joined(id, entity_id);
                self.game.review_player_count(self.registry.player_count());

                if let Some(state) = self.game.entity(entity_id).cloned() {
                    self.send_packet(
                        Packet::JoinAccepted {
                            entity_id,
                            tick_rate_hz: self.game.policy().tick_rate_hz,
                            state,
                        },
                        addr,
                    );
                }
            }

            Packet::Input { delta } => self.handle_input(delta, addr),

            Packet::Ping { client_time } => {
                if let Some(id) = self.registry.find_by_addr(addr) {
                    if let Some(session) = self.registry.get_mut(id) {
                        session.touch();
                    }
                }
                self.send_packet(
                    Packet::Pong {
                        client_time,
                        server_time: now_millis(),
                    },
                    addr,
                );
            }

            Packet::Disconnect => {
                if let Some(id) = self.registry.find_by_addr(addr) {
                    self.close_session(id);
                }
            }

            _ => {
                warn!("Unexpected packet type from client at {}", addr);
            }
        }
    }

    fn handle_connect(&mut self, client_version: u32, auth_token: &str, addr: SocketAddr) {
        info!("Client connecting from {} (version {})", addr, client_version);

        if client_version != PROTOCOL_VERSION {
            self.send_packet(
                Packet::Disconnected {
                    reason: format!(
                        "protocol version mismatch: client {}, server {}",
                        client_version, PROTOCOL_VERSION
                    ),
                },
                addr,
            );
            return;
        }

        let identity = match self.authenticator.authenticate(auth_token) {
            Ok(identity) => identity,
            Err(reason) => {
                warn!("authentication failed for {}: {}", addr, reason);
                self.send_packet(
                    Packet::Disconnected {
                        reason: format!("authentication failed: {}", reason),
                    },
                    addr,
                );
                return;
            }
        };

        // A connection lost mid-match may come back within the grace window:
        // the same identity resumes the same session and entity.
        if let Some(id) = self.registry.find_reconnectable(&identity) {
            let resumed = self
                .registry
                .resume(id, addr)
                .map(|s| (s.connection_id, s.entity_id));
            if let Some((connection_id, entity_id)) = resumed {
                self.send_packet(Packet::Connected { connection_id }, addr);
                if let Some(entity_id) = entity_id {
                    if let Some(state) = self.game.entity(entity_id).cloned() {
                        self.send_packet(
                            Packet::JoinAccepted {
                                entity_id,
                                tick_rate_hz: self.game.policy().tick_rate_hz,
                                state,
                            },
                            addr,
                        );
                    }
                }
            }
            return;
        }

        // A stale session on this address is replaced by the new connect.
        if let Some(existing) = self.registry.find_by_addr(addr) {
            info!("Replacing existing connection {} from {}", existing, addr);
            self.close_session(existing);
        }

        match self.registry.add(identity, addr) {
            Some(connection_id) => {
                self.send_packet(Packet::Connected { connection_id }, addr);
            }
            None => {
                self.send_packet(
                    Packet::Disconnected {
                        reason: "server full".to_string(),
                    },
                    addr,
                );
            }
        }
    }

    fn handle_input(&mut self, delta: StateDelta, addr: SocketAddr) {
        let Some(id) = self.registry.find_by_addr(addr) else {
            return;
        };
        let Some(session) = self.registry.get_mut(id) else {
            return;
        };
        if session.state != SessionState::Joined {
            warn!("connection {}: input while not joined", id);
            return;
        }

        // Clients stamp inputs with their server-clock estimate, so the age
        // of the delta approximates the one-way latency.
        session.latency_estimate_ms = now_millis().saturating_sub(delta.timestamp);

        // A keep-alive delta omits the inputs field; the held controls
        // still advance the ack sequence.
        let inputs = delta
            .inputs
            .map(|i| i.clamped())
            .unwrap_or(session.last_inputs);

        session.queue_input(TimedInput {
            sequence: delta.sequence,
            timestamp: delta.timestamp,
            inputs,
        });
    }

    /// Tears a session down and releases its entity everywhere: the
    /// registry, the match, and every observer via `EntityLeft`.
    fn close_session(&mut self, connection_id: u32) {
        if let Some(entity_id) = self.registry.close(connection_id) {
            self.game.remove_entity(entity_id);
            self.broadcast_to_joined(Packet::EntityLeft { entity_id });
        }
        self.game.review_player_count(self.registry.player_count());
    }

    /// One authoritative tick: at most one queued input per joined session,
    /// most-recent-wins, then one simulation step for everyone. The state
    /// each consuming tick produces is captured per session so the next
    /// broadcast pairs it with the acked sequence.
    fn run_tick(&mut self) {
        let mut inputs: Vec<(u64, TimedInput)> = Vec::new();
        let mut consumed: Vec<(u32, u64)> = Vec::new();
        for id in self.registry.joined_ids() {
            if let Some(session) = self.registry.get_mut(id) {
                if let (Some(entity_id), Some(input)) =
                    (session.entity_id, session.take_tick_input())
                {
                    inputs.push((entity_id, input));
                    consumed.push((id, entity_id));
                }
            }
        }

        self.game.tick(&inputs, now_millis());

        for (id, entity_id) in consumed {
            let acked = self.game.entity(entity_id).cloned();
            if let Some(session) = self.registry.get_mut(id) {
                session.last_acked_state = acked;
            }
        }

        if self.game.tick % 600 == 0 && self.registry.player_count() > 0 {
            debug!(
                "tick {}: {} players, {} entities",
                self.game.tick,
                self.registry.player_count(),
                self.game.entity_count()
            );
        }
    }

    /// One broadcast pass: each joined client gets the correction for its
    /// last acked input (the state captured by the tick that consumed it),
    /// plus delta snapshots of every other entity against that client's
    /// baselines.
    fn run_broadcast(&mut self) {
        let server_time = now_millis();
        let all: Vec<EntityState> = self.game.entities().cloned().collect();

        for id in self.registry.joined_ids() {
            let Some(session) = self.registry.get_mut(id) else {
                continue;
            };
            let addr = session.addr;
            let own_entity = session.entity_id;

            let mut deltas: Vec<StateDelta> = Vec::new();
            for state in &all {
                if Some(state.entity_id) == own_entity {
                    continue;
                }
                let base = session.broadcast_bases.get(&state.entity_id);
                let delta = codec::encode(base, state);

                // The stored baseline must be what the client decodes, not
                // the raw state, or rounding drifts the two ends apart.
                let next_base = match base {
                    Some(base) => codec::decode(base, &delta),
                    None => {
                        let seed = EntityState::new(
                            state.entity_id,
                            glam::Vec3::ZERO,
                            Default::default(),
                        );
                        codec::decode(&seed, &delta)
                    }
                };
                session.broadcast_bases.insert(state.entity_id, next_base);
                deltas.push(delta);
            }
            // The live entity may be several held-input ticks past the
            // acked state; sending it tagged with the older sequence would
            // make every correction look like a divergence.
            let correction = session
                .last_acked_state
                .clone()
                .map(|state| (session.last_acked_sequence, state));

            if let Some((acked_sequence, state)) = correction {
                self.send_packet(
                    Packet::Correction {
                        acked_sequence,
                        state,
                    },
                    addr,
                );
            }
            if !deltas.is_empty() {
                self.send_packet(
                    Packet::Snapshot {
                        server_time,
                        entities: deltas,
                    },
                    addr,
                );
            }
        }
    }

    /// One liveness pass over the registry, escalating expiries to the
    /// match policy.
    fn run_sweep(&mut self) {
        let policy = *self.game.policy();
        let outcome = self.registry.sweep(
            TRANSPORT_TIMEOUT,
            policy.allow_reconnection,
            policy.reconnect_timeout,
        );

        for (connection_id, entity_id) in outcome.closed {
            debug!("connection {} closed by sweep", connection_id);
            if let Some(entity_id) = entity_id {
                self.game.remove_entity(entity_id);
                self.broadcast_to_joined(Packet::EntityLeft { entity_id });
            }
        }

        self.game.review_player_count(self.registry.player_count());
        if self.game.is_flagged_for_end() {
            debug!("match is flagged for ending");
        }
    }

    /// Main server loop coordinating all operations.
    pub async fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.spawn_network_receiver();
        self.spawn_network_sender();

        let policy = *self.game.policy();
        let mut tick_interval = interval(Duration::from_secs_f64(1.0 / policy.tick_rate_hz as f64));
        let mut broadcast_interval =
            interval(Duration::from_secs_f64(1.0 / policy.broadcast_rate_hz as f64));
        let mut sweep_interval = interval(Duration::from_secs(1));

        info!(
            "Server started: tick {}Hz, broadcast {}Hz, min players {}",
            policy.tick_rate_hz, policy.broadcast_rate_hz, policy.min_players
        );

        loop {
            tokio::select! {
                message = self.server_rx.recv() => {
                    match message {
                        Some(ServerMessage::PacketReceived { packet, addr }) => {
                            self.handle_packet(packet, addr);
                        },
                        Some(ServerMessage::Shutdown) | None => {
                            info!("Server shutting down");
                            break;
                        }
                    }
                },

                _ = tick_interval.tick() => {
                    self.run_tick();
                },

                _ = broadcast_interval.tick() => {
                    self.run_broadcast();
                },

                _ = sweep_interval.tick() => {
                    self.run_sweep();
                },
            }
        }

        Ok(())
    }
}
