//! Integration tests for the flight sync core.
//!
//! These tests validate cross-component interactions: the wire protocol,
//! the client prediction stack against the authoritative match, and the
//! snapshot-to-interpolation path.

use bincode::{deserialize, serialize};
use client::engine::SyncEngine;
use client::prediction::ReconciliationConfig;
use glam::Vec3;
use server::match_state::{GameModePolicy, Match};
use server::session::TimedInput;
use shared::{codec, AircraftKind, ControlInputs, EntityState, Packet, PROTOCOL_VERSION};
use std::net::UdpSocket;
use std::thread;
use std::time::Duration;
use tokio::time::sleep;

/// NETWORK PROTOCOL TESTS
mod protocol_tests {
    use super::*;

    /// Tests packet serialization round-trip for network protocol validation
    #[tokio::test]
    async fn packet_serialization_roundtrip() {
        let state = EntityState::new(7, Vec3::new(10.0, 900.0, -40.0), AircraftKind::Bomber);
        let test_packets = vec![
            Packet::Connect {
                client_version: PROTOCOL_VERSION,
                auth_token: "pilot-a".to_string(),
            },
            Packet::Join {
                aircraft: AircraftKind::Fighter,
            },
            Packet::Input {
                delta: codec::encode(None, &state),
            },
            Packet::Connected { connection_id: 42 },
            Packet::JoinAccepted {
                entity_id: 7,
                tick_rate_hz: 60,
                state: state.clone(),
            },
            Packet::Correction {
                acked_sequence: 9,
                state: state.clone(),
            },
            Packet::Snapshot {
                server_time: 123456789,
                entities: vec![codec::encode(None, &state)],
            },
            Packet::Ping { client_time: 1000 },
            Packet::Pong {
                client_time: 1000,
                server_time: 2000,
            },
            Packet::EntityLeft { entity_id: 7 },
            Packet::Disconnect,
            Packet::Disconnected {
                reason: "test".to_string(),
            },
        ];

        for packet in test_packets {
            let serialized = serialize(&packet).unwrap();
            let deserialized: Packet = deserialize(&serialized).unwrap();
            assert_eq!(
                std::mem::discriminant(&packet),
                std::mem::discriminant(&deserialized),
                "packet variant changed across serialization"
            );
        }
    }

    /// Tests real UDP socket communication
    #[tokio::test]
    async fn udp_socket_communication() {
        let server_socket = UdpSocket::bind("127.0.0.1:0").expect("Failed to bind server socket");
        let server_addr = server_socket.local_addr().unwrap();

        // Echo server
        let server_socket_clone = server_socket.try_clone().unwrap();
        thread::spawn(move || {
            let mut buf = [0; 2048];
            if let Ok((size, client_addr)) = server_socket_clone.recv_from(&mut buf) {
                let _ = server_socket_clone.send_to(&buf[..size], client_addr);
            }
        });

        sleep(Duration::from_millis(10)).await;

        let client_socket = UdpSocket::bind("127.0.0.1:0").expect("Failed to bind client socket");
        client_socket
            .set_read_timeout(Some(Duration::from_millis(100)))
            .unwrap();

        let test_packet = Packet::Connect {
            client_version: PROTOCOL_VERSION,
            auth_token: "pilot-a".to_string(),
        };
        let serialized = serialize(&test_packet).unwrap();

        client_socket.send_to(&serialized, server_addr).unwrap();

        let mut buf = [0; 2048];
        let (size, _) = client_socket.recv_from(&mut buf).unwrap();
        let received_packet: Packet = deserialize(&buf[..size]).unwrap();

        match received_packet {
            Packet::Connect { client_version, .. } => {
                assert_eq!(client_version, PROTOCOL_VERSION)
            }
            _ => panic!("Wrong packet type received"),
        }
    }

    /// Tests malformed packet handling
    #[test]
    fn malformed_packet_handling() {
        let valid_packet = Packet::Ping { client_time: 1234 };
        let valid_data = serialize(&valid_packet).unwrap();

        let truncated_data = &valid_data[..valid_data.len() / 2];
        let result: Result<Packet, _> = deserialize(truncated_data);
        assert!(result.is_err(), "truncated packet must not deserialize");

        let mut corrupted_data = valid_data.clone();
        corrupted_data[0] = 0xFF;
        let result: Result<Packet, _> = deserialize(&corrupted_data);
        assert!(result.is_err(), "corrupted packet must not deserialize");

        let result: Result<Packet, _> = deserialize(&[]);
        assert!(result.is_err(), "empty packet must not deserialize");
    }
}

/// PREDICTION AND RECONCILIATION TESTS
mod sync_tests {
    use super::*;

    fn joined_pair() -> (SyncEngine, Match, u64) {
        let mut game = Match::new(GameModePolicy::default());
        let entity_id = game.spawn_entity(AircraftKind::Fighter);
        let state = game.entity(entity_id).unwrap().clone();

        let mut engine = SyncEngine::new(ReconciliationConfig::default());
        engine.handle_join(entity_id, state);
        (engine, game, entity_id)
    }

    /// Client and server run the same deterministic flight step, so under
    /// lossless conditions corrections never move the predicted state.
    #[test]
    fn prediction_matches_authoritative_simulation() {
        let (mut engine, mut game, entity_id) = joined_pair();
        let inputs = ControlInputs {
            throttle: 0.7,
            pitch: 0.3,
            roll: -0.2,
            yaw: 0.1,
        };

        for i in 0u64..120 {
            let now = i * 16;
            engine.frame(inputs, now);
            game.tick(
                &[(
                    entity_id,
                    TimedInput {
                        sequence: (i + 1) as u32,
                        timestamp: now,
                        inputs,
                    },
                )],
                now,
            );

            // Correction for every fourth tick, as a 15Hz broadcast would.
            if i % 4 == 3 {
                let state = game.entity(entity_id).unwrap().clone();
                engine.handle_packet(
                    Packet::Correction {
                        acked_sequence: (i + 1) as u32,
                        state,
                    },
                    now,
                );
            }
        }

        let predicted = engine.local_state().unwrap().position;
        let authoritative = game.entity(entity_id).unwrap().position;
        assert!(
            predicted.distance(authoritative) < 0.01,
            "prediction drifted: {} vs {}",
            predicted,
            authoritative
        );
    }

    /// A server-side teleport beyond the snap threshold must pull the client
    /// onto the authoritative trajectory.
    #[test]
    fn correction_recovers_from_forced_divergence() {
        let (mut engine, mut game, entity_id) = joined_pair();
        let inputs = ControlInputs {
            throttle: 0.5,
            ..Default::default()
        };

        for i in 0u64..60 {
            let now = i * 16;
            engine.frame(inputs, now);
            game.tick(
                &[(
                    entity_id,
                    TimedInput {
                        sequence: (i + 1) as u32,
                        timestamp: now,
                        inputs,
                    },
                )],
                now,
            );

            // Authoritative teleport halfway through, far past any threshold.
            if i == 30 {
                let mut state = game.entity(entity_id).unwrap().clone();
                state.position.x += 500.0;
                game.set_entity_state(state);
            }
            if i % 4 == 3 {
                let state = game.entity(entity_id).unwrap().clone();
                engine.handle_packet(
                    Packet::Correction {
                        acked_sequence: (i + 1) as u32,
                        state,
                    },
                    now,
                );
            }
        }

        let predicted = engine.local_state().unwrap().position;
        let authoritative = game.entity(entity_id).unwrap().position;
        assert!(
            predicted.distance(authoritative) < 0.01,
            "client never converged after teleport: {} vs {}",
            predicted,
            authoritative
        );
    }

    /// Snapshots of another aircraft flow through delta decoding into the
    /// interpolation buffer and come back out at the delayed render time.
    #[test]
    fn snapshot_pipeline_feeds_interpolation() {
        let mut game = Match::new(GameModePolicy::default());
        let remote_id = game.spawn_entity(AircraftKind::Interceptor);

        let mut engine = SyncEngine::new(ReconciliationConfig::default());
        engine.handle_join(1000, EntityState::new(1000, Vec3::ZERO, AircraftKind::Fighter));

        let inputs = ControlInputs {
            throttle: 1.0,
            ..Default::default()
        };
        let mut base: Option<EntityState> = None;
        let mut decoded_track: Vec<EntityState> = Vec::new();

        for i in 0u64..40 {
            let now = i * 16;
            game.tick(
                &[(
                    remote_id,
                    TimedInput {
                        sequence: (i + 1) as u32,
                        timestamp: now,
                        inputs,
                    },
                )],
                now,
            );

            // Broadcast every third tick, delta-encoded against what the
            // client last decoded.
            if i % 3 == 0 {
                let state = game.entity(remote_id).unwrap().clone();
                let delta = codec::encode(base.as_ref(), &state);
                let seed = base.clone().unwrap_or_else(|| {
                    EntityState::new(remote_id, Vec3::ZERO, AircraftKind::Fighter)
                });
                let decoded = codec::decode(&seed, &delta);
                base = Some(decoded.clone());
                decoded_track.push(decoded);

                engine.handle_packet(
                    Packet::Snapshot {
                        server_time: now,
                        entities: vec![delta],
                    },
                    now,
                );
            }
        }

        // Sample so the delayed render time lands on a known snapshot.
        let target = &decoded_track[decoded_track.len() - 3];
        let sampled = engine.sample_remotes(target.timestamp + engine.render_delay_ms());
        assert_eq!(sampled.len(), 1);
        assert_eq!(sampled[0].entity_id, remote_id);
        assert!(
            sampled[0].position.distance(target.position) < 0.05,
            "sampled {} expected {}",
            sampled[0].position,
            target.position
        );
    }

    /// Ping/pong replies converge the clock estimate on the server offset.
    #[test]
    fn clock_probes_estimate_server_offset() {
        let mut engine = SyncEngine::new(ReconciliationConfig::default());
        let one_way = 40u64;
        let server_ahead = 500u64;

        let mut now = 0u64;
        for _ in 0..5 {
            let probe = engine.maybe_probe(now);
            if let Some(Packet::Ping { client_time }) = probe {
                let server_time = client_time + one_way + server_ahead;
                now = client_time + 2 * one_way;
                engine.handle_packet(
                    Packet::Pong {
                        client_time,
                        server_time,
                    },
                    now,
                );
            }
            now += 5000;
        }

        assert!(engine.average_latency_ms() > 0.0);
        assert!((engine.average_latency_ms() - 2.0 * one_way as f64).abs() < 1e-6);
    }
}
