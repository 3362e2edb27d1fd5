//! Delayed interpolation of remote entity snapshots.
//!
//! Remote aircraft are rendered a fixed delay behind the newest known state
//! so bursty snapshot arrival turns into smooth motion. Position and
//! velocity are linearly interpolated; rotation is slerped, since linear
//! quaternion blending visibly distorts a rolling aircraft and is not used
//! anywhere in this module.

use glam::Quat;
use shared::{EntityState, INTERPOLATION_DELAY_MS, INTERPOLATION_MARGIN_MS};

/// Time-ordered, bounded buffer of snapshots for one remote entity.
///
/// Size is bounded by arrival rate times (delay + margin) regardless of how
/// many snapshots ever arrive: every `sample` prunes what the render time
/// has moved past, and `push` drops anything already behind the last sample.
pub struct InterpolationBuffer {
    snapshots: Vec<EntityState>,
    delay_ms: u64,
    margin_ms: u64,
    last_sampled_time: u64,
}

impl Default for InterpolationBuffer {
    fn default() -> Self {
        Self::new(INTERPOLATION_DELAY_MS, INTERPOLATION_MARGIN_MS)
    }
}

impl InterpolationBuffer {
    pub fn new(delay_ms: u64, margin_ms: u64) -> Self {
        Self {
            snapshots: Vec::new(),
            delay_ms,
            margin_ms,
            last_sampled_time: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    pub fn newest(&self) -> Option<&EntityState> {
        self.snapshots.last()
    }

    /// Inserts a snapshot in timestamp order. Out-of-order arrival is
    /// tolerated; a snapshot older than a time we already sampled past is
    /// dropped so sampled motion never runs backward.
    pub fn push(&mut self, snapshot: EntityState) {
        if snapshot.timestamp < self.last_sampled_time {
            return;
        }

        let index = self
            .snapshots
            .partition_point(|s| s.timestamp <= snapshot.timestamp);
        self.snapshots.insert(index, snapshot);

        // Bound growth independent of sampling: anything far behind the
        // newest snapshot can never be bracketed again.
        if let Some(newest) = self.snapshots.last().map(|s| s.timestamp) {
            let cutoff = newest.saturating_sub(self.delay_ms + self.margin_ms);
            self.snapshots.retain(|s| s.timestamp >= cutoff);
        }
    }

    /// Samples the buffer at `now - delay` (both in the origin clock).
    ///
    /// Clamps to the oldest snapshot when the render time is behind the
    /// buffer and holds the newest on under-run; no extrapolation in either
    /// direction. Returns `None` only while the buffer is empty.
    pub fn sample(&mut self, now_ms: u64) -> Option<EntityState> {
        let render_time = now_ms.saturating_sub(self.delay_ms);
        self.last_sampled_time = self.last_sampled_time.max(render_time);

        let result = self.sample_at(render_time);

        let cutoff = render_time.saturating_sub(self.margin_ms);
        self.snapshots.retain(|s| s.timestamp >= cutoff);

        result
    }

    fn sample_at(&self, render_time: u64) -> Option<EntityState> {
        let first = self.snapshots.first()?;
        if render_time <= first.timestamp {
            return Some(first.clone());
        }

        let newest = self.snapshots.last()?;
        if render_time >= newest.timestamp {
            // Under-run: hold the newest rather than guess forward.
            return Some(newest.clone());
        }

        let after_index = self
            .snapshots
            .partition_point(|s| s.timestamp <= render_time);
        let before = &self.snapshots[after_index - 1];
        let after = &self.snapshots[after_index];

        let span = (after.timestamp - before.timestamp) as f32;
        let alpha = if span > 0.0 {
            (render_time - before.timestamp) as f32 / span
        } else {
            0.0
        }
        .clamp(0.0, 1.0);

        let mut state = after.clone();
        state.timestamp = render_time;
        state.position = before.position.lerp(after.position, alpha);
        state.linear_velocity = before.linear_velocity.lerp(after.linear_velocity, alpha);
        state.angular_velocity = before.angular_velocity.lerp(after.angular_velocity, alpha);
        state.rotation = slerp_unit(before.rotation, after.rotation, alpha);
        Some(state)
    }
}

/// Slerp that always returns a unit quaternion.
pub fn slerp_unit(a: Quat, b: Quat, t: f32) -> Quat {
    a.slerp(b, t).normalize()
}
