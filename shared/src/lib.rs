//! Types shared between the flight-combat client and server: entity state,
//! control inputs, the wire protocol, the deterministic flight model, the
//! delta codec and clock synchronization.

use glam::{Quat, Vec3};
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub mod clock;
pub mod codec;
pub mod sim;

pub use codec::StateDelta;

/// Protocol version checked on connect; mismatches are rejected.
pub const PROTOCOL_VERSION: u32 = 1;

/// Fixed simulation step, identical on client prediction and server tick.
pub const SIM_DT: f32 = 1.0 / 60.0;

/// Capacity of the client prediction history ring.
pub const PREDICTION_CAPACITY: usize = 60;

/// Render delay applied when sampling remote entities.
pub const INTERPOLATION_DELAY_MS: u64 = 100;

/// Snapshots older than the render time minus this margin are pruned.
pub const INTERPOLATION_MARGIN_MS: u64 = 1000;

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    let ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis();
    ms.min(u64::MAX as u128) as u64
}

/// Airframe selected at join time. Opaque to the sync core; carried so
/// observers can present the right model.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
pub enum AircraftKind {
    #[default]
    Fighter,
    Interceptor,
    Bomber,
}

/// Normalized control axes captured each frame.
///
/// Throttle is in [0, 1]; pitch, roll and yaw are in [-1, 1].
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Default)]
pub struct ControlInputs {
    pub throttle: f32,
    pub pitch: f32,
    pub roll: f32,
    pub yaw: f32,
}

impl ControlInputs {
    /// Clamps every axis into its legal range. Applied at the transport
    /// boundary before an input enters the simulation.
    pub fn clamped(self) -> Self {
        Self {
            throttle: self.throttle.clamp(0.0, 1.0),
            pitch: self.pitch.clamp(-1.0, 1.0),
            roll: self.roll.clamp(-1.0, 1.0),
            yaw: self.yaw.clamp(-1.0, 1.0),
        }
    }
}

/// Full state of one simulated aircraft at one sequence point.
///
/// `rotation` is kept normalized by every code path that writes it;
/// `sequence` strictly increases per origin.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct EntityState {
    pub entity_id: u64,
    pub sequence: u32,
    pub timestamp: u64,
    pub position: Vec3,
    pub rotation: Quat,
    pub linear_velocity: Vec3,
    pub angular_velocity: Vec3,
    pub inputs: ControlInputs,
    pub health: f32,
    pub aircraft: AircraftKind,
}

impl EntityState {
    pub fn new(entity_id: u64, position: Vec3, aircraft: AircraftKind) -> Self {
        Self {
            entity_id,
            sequence: 0,
            timestamp: 0,
            position,
            rotation: Quat::IDENTITY,
            linear_velocity: Vec3::ZERO,
            angular_velocity: Vec3::ZERO,
            inputs: ControlInputs::default(),
            health: 100.0,
            aircraft,
        }
    }
}

/// Every message that crosses the wire, in both directions. Tagged variants
/// are validated at the transport boundary before entering the core.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub enum Packet {
    // Client -> server
    Connect {
        client_version: u32,
        auth_token: String,
    },
    Join {
        aircraft: AircraftKind,
    },
    Input {
        delta: StateDelta,
    },
    Ping {
        client_time: u64,
    },
    Disconnect,

    // Server -> client
    Connected {
        connection_id: u32,
    },
    JoinAccepted {
        entity_id: u64,
        tick_rate_hz: u32,
        state: EntityState,
    },
    Correction {
        acked_sequence: u32,
        state: EntityState,
    },
    Snapshot {
        server_time: u64,
        entities: Vec<StateDelta>,
    },
    Pong {
        client_time: u64,
        server_time: u64,
    },
    EntityLeft {
        entity_id: u64,
    },
    Disconnected {
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_inputs_clamped() {
        let inputs = ControlInputs {
            throttle: 1.7,
            pitch: -2.0,
            roll: 0.5,
            yaw: 1.1,
        };
        let clamped = inputs.clamped();
        assert_eq!(clamped.throttle, 1.0);
        assert_eq!(clamped.pitch, -1.0);
        assert_eq!(clamped.roll, 0.5);
        assert_eq!(clamped.yaw, 1.0);
    }

    #[test]
    fn test_entity_state_creation() {
        let state = EntityState::new(7, Vec3::new(10.0, 500.0, -30.0), AircraftKind::Bomber);
        assert_eq!(state.entity_id, 7);
        assert_eq!(state.sequence, 0);
        assert_eq!(state.rotation, Quat::IDENTITY);
        assert_eq!(state.health, 100.0);
        assert_eq!(state.aircraft, AircraftKind::Bomber);
    }

    #[test]
    fn test_packet_serialization_connect() {
        let packet = Packet::Connect {
            client_version: PROTOCOL_VERSION,
            auth_token: "pilot-1".to_string(),
        };
        let serialized = bincode::serialize(&packet).unwrap();
        let deserialized: Packet = bincode::deserialize(&serialized).unwrap();

        match deserialized {
            Packet::Connect {
                client_version,
                auth_token,
            } => {
                assert_eq!(client_version, PROTOCOL_VERSION);
                assert_eq!(auth_token, "pilot-1");
            }
            _ => panic!("Wrong packet type after deserialization"),
        }
    }

    #[test]
    fn test_packet_serialization_correction() {
        let state = EntityState::new(3, Vec3::new(1.0, 2.0, 3.0), AircraftKind::Fighter);
        let packet = Packet::Correction {
            acked_sequence: 42,
            state,
        };

        let serialized = bincode::serialize(&packet).unwrap();
        let deserialized: Packet = bincode::deserialize(&serialized).unwrap();

        match deserialized {
            Packet::Correction {
                acked_sequence,
                state,
            } => {
                assert_eq!(acked_sequence, 42);
                assert_eq!(state.entity_id, 3);
                assert_eq!(state.position, Vec3::new(1.0, 2.0, 3.0));
            }
            _ => panic!("Wrong packet type after deserialization"),
        }
    }

    #[test]
    fn test_now_millis_monotonic_enough() {
        let a = now_millis();
        std::thread::sleep(Duration::from_millis(2));
        let b = now_millis();
        assert!(b > a);
    }
}
