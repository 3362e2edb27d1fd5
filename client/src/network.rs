//! Async shell around the synchronous sync engine: UDP socket, connect and
//! join handshake, frame cadence, clock probes and optional fake latency
//! for testing prediction under load.

use crate::engine::SyncEngine;
use crate::prediction::ReconciliationConfig;
use bincode::{deserialize, serialize};
use log::{error, info, warn};
use shared::{now_millis, AircraftKind, ControlInputs, Packet, PROTOCOL_VERSION};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::{interval, sleep};

pub struct Client {
    socket: UdpSocket,
    server_addr: SocketAddr,
    connection_id: Option<u32>,
    connected: bool,
    auth_token: String,
    aircraft: AircraftKind,
    pub engine: SyncEngine,
    fake_ping_ms: u64,
}

impl Client {
    pub async fn new(
        server_addr: &str,
        auth_token: String,
        aircraft: AircraftKind,
        fake_ping_ms: u64,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        let server_addr = server_addr.parse()?;

        Ok(Client {
            socket,
            server_addr,
            connection_id: None,
            connected: false,
            auth_token,
            aircraft,
            engine: SyncEngine::new(ReconciliationConfig::default()),
            fake_ping_ms,
        })
    }

    async fn connect(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        info!("Connecting to {}...", self.server_addr);
        let packet = Packet::Connect {
            client_version: PROTOCOL_VERSION,
            auth_token: self.auth_token.clone(),
        };
        self.send_packet(&packet).await
    }

    async fn send_packet(&self, packet: &Packet) -> Result<(), Box<dyn std::error::Error>> {
        if self.fake_ping_ms > 0 {
            sleep(Duration::from_millis(self.fake_ping_ms / 2)).await;
        }

        let data = serialize(packet)?;
        self.socket.send_to(&data, self.server_addr).await?;
        Ok(())
    }

    async fn handle_packet(&mut self, packet: Packet) -> Result<(), Box<dyn std::error::Error>> {
        match packet {
            Packet::Connected { connection_id } => {
                info!("Connected, connection id {}", connection_id);
                self.connection_id = Some(connection_id);
                self.connected = true;
                let join = Packet::Join {
                    aircraft: self.aircraft,
                };
                self.send_packet(&join).await?;
            }

            Packet::JoinAccepted {
                entity_id,
                tick_rate_hz,
                state,
            } => {
                info!("Join accepted, server tick rate {}Hz", tick_rate_hz);
                self.engine.handle_join(entity_id, state);
            }

            Packet::Disconnected { reason } => {
                warn!("Disconnected by server: {}", reason);
                self.connected = false;
                self.connection_id = None;
            }

            other => self.engine.handle_packet(other, now_millis()),
        }
        Ok(())
    }

    /// Runs the frame loop: socket receipt on one select arm, the fixed
    /// frame tick on the other. `input_source` is the presentation layer's
    /// hook, called once per frame with the frame time.
    pub async fn run(
        &mut self,
        mut input_source: impl FnMut(f32) -> ControlInputs,
        run_seconds: Option<u64>,
    ) -> Result<(), Box<dyn std::error::Error>> {
        self.connect().await?;

        let mut frame_interval = interval(Duration::from_millis(16));
        let deadline = run_seconds.map(|s| tokio::time::Instant::now() + Duration::from_secs(s));
        let mut buffer = [0u8; 2048];
        let mut elapsed = 0.0f32;

        loop {
            if let Some(deadline) = deadline {
                if tokio::time::Instant::now() >= deadline {
                    break;
                }
            }

            tokio::select! {
                result = self.socket.recv_from(&mut buffer) => {
                    match result {
                        Ok((len, _)) => {
                            if self.fake_ping_ms > 0 {
                                sleep(Duration::from_millis(self.fake_ping_ms / 2)).await;
                            }

                            match deserialize::<Packet>(&buffer[0..len]) {
                                Ok(packet) => self.handle_packet(packet).await?,
                                Err(_) => warn!("Malformed packet from server, dropping"),
                            }
                        },
                        Err(e) => error!("Error receiving packet: {}", e),
                    }
                },

                _ = frame_interval.tick() => {
                    let now = now_millis();
                    elapsed += 1.0 / 60.0;

                    if self.connected && self.engine.is_joined() {
                        let input = input_source(elapsed);
                        if let Some(delta) = self.engine.frame(input, now) {
                            if let Err(e) = self.send_packet(&Packet::Input { delta }).await {
                                error!("Error sending input delta: {}", e);
                            }
                        }
                    }

                    if self.connected {
                        if let Some(probe) = self.engine.maybe_probe(now) {
                            if let Err(e) = self.send_packet(&probe).await {
                                error!("Error sending clock probe: {}", e);
                            }
                        }
                    }
                },
            }
        }

        if self.connected {
            let _ = self.send_packet(&Packet::Disconnect).await;
        }

        Ok(())
    }
}
