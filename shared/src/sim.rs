//! Deterministic flight model shared by client prediction and the
//! authoritative server tick.
//!
//! The model is deliberately simple: throttle drives forward speed toward a
//! maximum, and the stick axes command body-frame angular rates that are
//! integrated through the quaternion. What matters to the sync core is not
//! realism but determinism: `apply_input` must produce bit-identical results
//! for identical `(state, input, dt)` on both ends, or reconciliation replay
//! is meaningless.

use crate::{ControlInputs, EntityState};
use glam::{Quat, Vec3};

/// Forward speed at full throttle, meters per second.
pub const MAX_SPEED: f32 = 120.0;
/// Minimum forward speed; aircraft never hover.
pub const MIN_SPEED: f32 = 20.0;
/// How quickly speed approaches the throttle target, per second.
pub const THROTTLE_RESPONSE: f32 = 1.5;
/// Angular rates at full stick deflection, radians per second.
pub const PITCH_RATE: f32 = 1.2;
pub const ROLL_RATE: f32 = 2.4;
pub const YAW_RATE: f32 = 0.6;

/// Advances one aircraft by one fixed step under the given inputs.
///
/// Sequence, timestamp and identity fields are left untouched; the caller
/// stamps them.
pub fn apply_input(state: &EntityState, input: &ControlInputs, dt: f32) -> EntityState {
    let mut next = state.clone();
    next.inputs = *input;

    // Body-frame angular rates commanded by the stick.
    next.angular_velocity = Vec3::new(
        input.pitch * PITCH_RATE,
        input.yaw * YAW_RATE,
        -input.roll * ROLL_RATE,
    );

    // Integrate rotation in the body frame and renormalize; the unit-quat
    // invariant must survive every step.
    let delta = Quat::from_scaled_axis(next.angular_velocity * dt);
    next.rotation = (state.rotation * delta).normalize();

    // Speed relaxes toward the throttle target.
    let target_speed = MIN_SPEED + input.throttle * (MAX_SPEED - MIN_SPEED);
    let current_speed = state.linear_velocity.length();
    let blend = (THROTTLE_RESPONSE * dt).min(1.0);
    let speed = current_speed + (target_speed - current_speed) * blend;

    let forward = next.rotation * Vec3::NEG_Z;
    next.linear_velocity = forward * speed;
    next.position = state.position + next.linear_velocity * dt;

    next
}
