//! Delta encoding of entity state for bandwidth-conscious broadcast.
//!
//! A `StateDelta` carries only the fields that changed beyond a per-field
//! noise threshold relative to the previously sent state for the same
//! entity/peer pair. Numeric fields are rounded before transmission
//! (position to 2 decimals, rotation to 3, velocities to 1), a deliberate
//! lossy bandwidth/precision trade-off; decoded values are only guaranteed
//! to match the source within that rounding.

use crate::{AircraftKind, ControlInputs, EntityState};
use glam::{Quat, Vec3};
use serde::{Deserialize, Serialize};

/// Position changes below this are not retransmitted (meters).
pub const EPS_POS: f32 = 0.01;
/// Per-component rotation threshold (unit quaternion components).
pub const EPS_ROT: f32 = 0.001;
/// Velocity threshold (meters per second).
pub const EPS_VEL: f32 = 0.1;
/// Control-axis threshold.
pub const EPS_INPUT: f32 = 0.01;

const POS_DECIMALS: i32 = 2;
const ROT_DECIMALS: i32 = 3;
const VEL_DECIMALS: i32 = 1;

/// Partial entity state: identity and sequencing always present, everything
/// else only when it changed beyond its threshold.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct StateDelta {
    pub entity_id: u64,
    pub sequence: u32,
    pub timestamp: u64,
    pub position: Option<[f32; 3]>,
    pub rotation: Option<[f32; 4]>,
    pub linear_velocity: Option<[f32; 3]>,
    pub angular_velocity: Option<[f32; 3]>,
    pub inputs: Option<ControlInputs>,
    pub health: Option<f32>,
    pub aircraft: Option<AircraftKind>,
}

impl StateDelta {
    /// True when every field is present, i.e. the delta can stand alone as a
    /// baseline without a previously known state.
    pub fn is_full(&self) -> bool {
        self.position.is_some()
            && self.rotation.is_some()
            && self.linear_velocity.is_some()
            && self.angular_velocity.is_some()
            && self.inputs.is_some()
            && self.health.is_some()
            && self.aircraft.is_some()
    }
}

fn round_to(value: f32, decimals: i32) -> f32 {
    let factor = 10f32.powi(decimals);
    (value * factor).round() / factor
}

fn round_vec(v: Vec3, decimals: i32) -> [f32; 3] {
    [
        round_to(v.x, decimals),
        round_to(v.y, decimals),
        round_to(v.z, decimals),
    ]
}

fn vec_changed(a: Vec3, b: Vec3, eps: f32) -> bool {
    (a.x - b.x).abs() > eps || (a.y - b.y).abs() > eps || (a.z - b.z).abs() > eps
}

fn quat_changed(a: Quat, b: Quat, eps: f32) -> bool {
    (a.x - b.x).abs() > eps
        || (a.y - b.y).abs() > eps
        || (a.z - b.z).abs() > eps
        || (a.w - b.w).abs() > eps
}

fn inputs_changed(a: &ControlInputs, b: &ControlInputs) -> bool {
    (a.throttle - b.throttle).abs() > EPS_INPUT
        || (a.pitch - b.pitch).abs() > EPS_INPUT
        || (a.roll - b.roll).abs() > EPS_INPUT
        || (a.yaw - b.yaw).abs() > EPS_INPUT
}

/// Encodes `current` as a delta against `previous`.
///
/// With no previous state (first transmission for this entity/peer pair)
/// every field is included at full precision so the receiver can adopt it as
/// a baseline.
pub fn encode(previous: Option<&EntityState>, current: &EntityState) -> StateDelta {
    let prev = match previous {
        Some(prev) => prev,
        None => {
            return StateDelta {
                entity_id: current.entity_id,
                sequence: current.sequence,
                timestamp: current.timestamp,
                position: Some(current.position.to_array()),
                rotation: Some(current.rotation.to_array()),
                linear_velocity: Some(current.linear_velocity.to_array()),
                angular_velocity: Some(current.angular_velocity.to_array()),
                inputs: Some(current.inputs),
                health: Some(current.health),
                aircraft: Some(current.aircraft),
            }
        }
    };

    StateDelta {
        entity_id: current.entity_id,
        sequence: current.sequence,
        timestamp: current.timestamp,
        position: vec_changed(prev.position, current.position, EPS_POS)
            .then(|| round_vec(current.position, POS_DECIMALS)),
        rotation: quat_changed(prev.rotation, current.rotation, EPS_ROT).then(|| {
            let q = current.rotation;
            [
                round_to(q.x, ROT_DECIMALS),
                round_to(q.y, ROT_DECIMALS),
                round_to(q.z, ROT_DECIMALS),
                round_to(q.w, ROT_DECIMALS),
            ]
        }),
        linear_velocity: vec_changed(prev.linear_velocity, current.linear_velocity, EPS_VEL)
            .then(|| round_vec(current.linear_velocity, VEL_DECIMALS)),
        angular_velocity: vec_changed(prev.angular_velocity, current.angular_velocity, EPS_VEL)
            .then(|| round_vec(current.angular_velocity, VEL_DECIMALS)),
        inputs: inputs_changed(&prev.inputs, &current.inputs).then_some(current.inputs),
        // No threshold on health or identity: any change at all is carried.
        health: (prev.health != current.health).then_some(current.health),
        aircraft: (prev.aircraft != current.aircraft).then_some(current.aircraft),
    }
}

/// Merges a delta over a locally held base state. Fields absent from the
/// delta keep the base value; rotation is renormalized after merging so
/// rounding can never leave a non-unit quaternion in play.
pub fn decode(base: &EntityState, delta: &StateDelta) -> EntityState {
    let mut state = base.clone();
    state.entity_id = delta.entity_id;
    state.sequence = delta.sequence;
    state.timestamp = delta.timestamp;

    if let Some(p) = delta.position {
        state.position = Vec3::from_array(p);
    }
    if let Some(r) = delta.rotation {
        state.rotation = Quat::from_array(r).normalize();
    }
    if let Some(v) = delta.linear_velocity {
        state.linear_velocity = Vec3::from_array(v);
    }
    if let Some(w) = delta.angular_velocity {
        state.angular_velocity = Vec3::from_array(w);
    }
    if let Some(inputs) = delta.inputs {
        state.inputs = inputs.clamped();
    }
    if let Some(health) = delta.health {
        state.health = health;
    }
    if let Some(aircraft) = delta.aircraft {
        state.aircraft = aircraft;
    }

    state
}
