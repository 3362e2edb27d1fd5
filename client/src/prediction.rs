//! Prediction history and server reconciliation for the local aircraft.
//!
//! Every locally simulated tick is recorded in a bounded, sequence-indexed
//! ring. When an authoritative correction arrives for an earlier sequence,
//! the buffered inputs issued after it are replayed through the
//! deterministic flight model so the newest predicted state is always
//! "correction plus every later local input".

use log::{debug, warn};
use shared::sim;
use shared::{ControlInputs, EntityState, PREDICTION_CAPACITY, SIM_DT};
use std::collections::VecDeque;

/// One locally simulated tick: the input applied and the state it produced.
#[derive(Debug, Clone)]
pub struct PredictionRecord {
    pub sequence: u32,
    pub input: ControlInputs,
    pub predicted: EntityState,
}

/// Tunable reconciliation behavior. The thresholds decide when a correction
/// triggers a full replay versus a smoothed blend; neither value is load
/// bearing for correctness, only for feel, so they are configuration rather
/// than constants.
#[derive(Debug, Clone, Copy)]
pub struct ReconciliationConfig {
    /// Positional error (meters) beyond which the prediction is replayed.
    pub position_threshold: f32,
    /// Rotational error (radians) beyond which the prediction is replayed.
    pub rotation_threshold: f32,
    /// Fraction of the residual error folded in per correction when the
    /// error is within threshold.
    pub blend_factor: f32,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            position_threshold: 2.0,
            rotation_threshold: 0.05,
            blend_factor: 0.15,
        }
    }
}

pub struct PredictionBuffer {
    records: VecDeque<PredictionRecord>,
    capacity: usize,
    config: ReconciliationConfig,
    /// Counts corrections that exceeded the replay threshold, for telemetry.
    divergence_count: u32,
}

impl PredictionBuffer {
    pub fn new(config: ReconciliationConfig) -> Self {
        Self::with_capacity(PREDICTION_CAPACITY, config)
    }

    pub fn with_capacity(capacity: usize, config: ReconciliationConfig) -> Self {
        Self {
            records: VecDeque::with_capacity(capacity),
            capacity,
            config,
            divergence_count: 0,
        }
    }

    /// Appends one locally applied tick, evicting the oldest past capacity.
    pub fn record_local(&mut self, sequence: u32, input: ControlInputs, predicted: EntityState) {
        if let Some(last) = self.records.back() {
            debug_assert!(sequence > last.sequence, "sequence must increase");
        }
        self.records.push_back(PredictionRecord {
            sequence,
            input,
            predicted,
        });
        while self.records.len() > self.capacity {
            self.records.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn latest(&self) -> Option<&EntityState> {
        self.records.back().map(|r| &r.predicted)
    }

    pub fn divergence_count(&self) -> u32 {
        self.divergence_count
    }

    /// Folds an authoritative correction into the history and returns the
    /// state the local player should now be rendered from.
    ///
    /// An ack older than the oldest retained record is a re-send of one
    /// already folded in (the broadcast loop repeats the ack whenever no new
    /// input landed between two passes) and leaves the history untouched.
    /// With no retained history at all the correction is adopted outright.
    /// Error beyond threshold: replay every later input from the corrected
    /// baseline. Error within threshold: nudge the retained predictions a
    /// fraction toward the authoritative state.
    pub fn reconcile(&mut self, acked_sequence: u32, correction: &EntityState) -> EntityState {
        let index = self
            .records
            .iter()
            .position(|r| r.sequence == acked_sequence);

        let index = match index {
            Some(index) => index,
            None => {
                if let Some(front) = self.records.front() {
                    if acked_sequence < front.sequence {
                        debug!(
                            "re-sent ack for sequence {} (oldest retained {}), keeping prediction",
                            acked_sequence, front.sequence
                        );
                        return self
                            .records
                            .back()
                            .map(|r| r.predicted.clone())
                            .unwrap_or_else(|| correction.clone());
                    }
                }
                debug!(
                    "no prediction record for sequence {}, adopting correction",
                    acked_sequence
                );
                self.records.clear();
                return correction.clone();
            }
        };

        let predicted = self.records[index].predicted.clone();
        let position_error = (predicted.position - correction.position).length();
        let rotation_error = predicted.rotation.angle_between(correction.rotation);

        // Acked-and-earlier records are settled either way.
        let later: Vec<PredictionRecord> = self.records.iter().skip(index + 1).cloned().collect();
        self.records.drain(..=index);

        if position_error > self.config.position_threshold
            || rotation_error > self.config.rotation_threshold
        {
            self.divergence_count += 1;
            if self.divergence_count % 10 == 0 {
                warn!(
                    "prediction diverged {} times (latest error {:.2}m / {:.3}rad)",
                    self.divergence_count, position_error, rotation_error
                );
            }

            // Replay: the correction becomes the baseline and every later
            // buffered input regenerates its predicted state in place.
            let mut state = correction.clone();
            self.records.clear();
            for record in later {
                let mut replayed = sim::apply_input(&state, &record.input, SIM_DT);
                replayed.sequence = record.sequence;
                replayed.timestamp = record.predicted.timestamp;
                state = replayed.clone();
                self.records.push_back(PredictionRecord {
                    sequence: record.sequence,
                    input: record.input,
                    predicted: replayed,
                });
            }
            return state;
        }

        // Small drift: shift the retained predictions a fraction toward the
        // authoritative state instead of snapping.
        let position_nudge = (correction.position - predicted.position) * self.config.blend_factor;
        let rotation_nudge = (predicted.rotation.inverse() * correction.rotation).normalize();
        let blend = self.config.blend_factor;

        self.records = later
            .into_iter()
            .map(|mut record| {
                record.predicted.position += position_nudge;
                record.predicted.rotation = record
                    .predicted
                    .rotation
                    .slerp(record.predicted.rotation * rotation_nudge, blend)
                    .normalize();
                record
            })
            .collect();

        if let Some(record) = self.records.back() {
            return record.predicted.clone();
        }

        // The ack covered the newest record: nudge it the same fraction
        // toward the authoritative state.
        let mut nudged = predicted;
        nudged.position += position_nudge;
        nudged.rotation = nudged.rotation.slerp(correction.rotation, blend).normalize();
        nudged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use glam::Vec3;
    use shared::AircraftKind;

    fn spawn_state() -> EntityState {
        let mut state = EntityState::new(1, Vec3::new(0.0, 1000.0, 0.0), AircraftKind::Fighter);
        state.linear_velocity = Vec3::NEG_Z * 60.0;
        state
    }

    fn bank_left() -> ControlInputs {
        ControlInputs {
            throttle: 0.8,
            pitch: 0.1,
            roll: -0.4,
            yaw: 0.0,
        }
    }

    fn predict_ticks(
        buffer: &mut PredictionBuffer,
        start: &EntityState,
        input: ControlInputs,
        first_seq: u32,
        count: u32,
    ) -> EntityState {
        let mut state = start.clone();
        for i in 0..count {
            let seq = first_seq + i;
            state = sim::apply_input(&state, &input, SIM_DT);
            state.sequence = seq;
            buffer.record_local(seq, input, state.clone());
        }
        state
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let mut buffer = PredictionBuffer::with_capacity(5, ReconciliationConfig::default());
        let state = spawn_state();
        predict_ticks(&mut buffer, &state, bank_left(), 1, 10);

        assert_eq!(buffer.len(), 5);
        assert_eq!(buffer.latest().unwrap().sequence, 10);
    }

    #[test]
    fn test_empty_history_adopts_correction() {
        let mut buffer = PredictionBuffer::new(ReconciliationConfig::default());

        let mut correction = spawn_state();
        correction.position = Vec3::new(500.0, 900.0, -200.0);
        correction.sequence = 4;

        let result = buffer.reconcile(4, &correction);
        assert_eq!(result.position, correction.position);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_ack_ahead_of_history_adopts_correction() {
        let mut buffer = PredictionBuffer::new(ReconciliationConfig::default());
        let state = spawn_state();
        predict_ticks(&mut buffer, &state, bank_left(), 1, 3);

        let mut correction = spawn_state();
        correction.position = Vec3::new(500.0, 900.0, -200.0);
        correction.sequence = 10; // past everything predicted

        let result = buffer.reconcile(10, &correction);
        assert_eq!(result.position, correction.position);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_duplicate_correction_keeps_later_predictions() {
        let mut buffer = PredictionBuffer::new(ReconciliationConfig::default());
        let state = spawn_state();
        predict_ticks(&mut buffer, &state, bank_left(), 1, 10);

        let correction = buffer.records[4].predicted.clone(); // sequence 5
        buffer.reconcile(5, &correction);
        assert_eq!(buffer.len(), 5); // sequences 6..=10 retained

        // The broadcast loop re-sends the same ack whenever no new input
        // was applied between two passes; the retained predictions must
        // survive the repeat instead of being adopted away.
        let result = buffer.reconcile(5, &correction);
        assert_eq!(buffer.len(), 5);
        assert_eq!(result.sequence, 10);
        assert!(buffer.records.iter().all(|r| r.sequence > 5));
    }

    #[test]
    fn test_replay_matches_direct_simulation() {
        let mut buffer = PredictionBuffer::new(ReconciliationConfig::default());
        let state = spawn_state();
        let input = bank_left();
        predict_ticks(&mut buffer, &state, input, 5, 8); // sequences 5..=12

        // Authoritative state for sequence 5, 50m away from the prediction.
        let mut correction = buffer.records[0].predicted.clone();
        correction.position += Vec3::new(50.0, 0.0, 0.0);

        let pre_reconcile = buffer.latest().unwrap().clone();
        let result = buffer.reconcile(5, &correction);

        // Past the threshold the tip must move...
        assert!((result.position - pre_reconcile.position).length() > 1.0);

        // ...and equal deterministically re-simulating from the correction
        // through sequences 6..=12.
        let mut expected = correction.clone();
        for _ in 6..=12 {
            expected = sim::apply_input(&expected, &input, SIM_DT);
        }
        assert_approx_eq!(result.position.x, expected.position.x, 1e-4);
        assert_approx_eq!(result.position.y, expected.position.y, 1e-4);
        assert_approx_eq!(result.position.z, expected.position.z, 1e-4);
        assert_eq!(result.sequence, 12);
    }

    #[test]
    fn test_small_error_blends_instead_of_snapping() {
        let mut buffer = PredictionBuffer::new(ReconciliationConfig::default());
        let state = spawn_state();
        predict_ticks(&mut buffer, &state, bank_left(), 1, 6);

        let mut correction = buffer.records[0].predicted.clone();
        correction.position += Vec3::new(0.5, 0.0, 0.0); // under the 2m threshold

        let pre_reconcile = buffer.latest().unwrap().clone();
        let result = buffer.reconcile(1, &correction);

        let moved = (result.position - pre_reconcile.position).length();
        assert!(moved > 0.0);
        assert!(moved < 0.5); // a nudge, not a snap
        assert_eq!(buffer.divergence_count(), 0);
    }

    #[test]
    fn test_ack_of_newest_record_blends_not_snaps() {
        let mut buffer = PredictionBuffer::new(ReconciliationConfig::default());
        let state = spawn_state();
        predict_ticks(&mut buffer, &state, bank_left(), 1, 6);

        let mut correction = buffer.records[5].predicted.clone();
        correction.position += Vec3::new(1.5, 0.0, 0.0); // under the 2m threshold

        let pre_reconcile = buffer.latest().unwrap().clone();
        let result = buffer.reconcile(6, &correction);

        // No later records to carry the nudge, but the return is still a
        // blended step, not the full residual.
        let moved = (result.position - pre_reconcile.position).length();
        assert_approx_eq!(moved, 1.5 * 0.15, 1e-4);
        assert!(buffer.is_empty());
        assert_eq!(buffer.divergence_count(), 0);
    }

    #[test]
    fn test_acked_records_are_dropped() {
        let mut buffer = PredictionBuffer::new(ReconciliationConfig::default());
        let state = spawn_state();
        predict_ticks(&mut buffer, &state, bank_left(), 1, 6);

        let correction = buffer.records[2].predicted.clone();
        buffer.reconcile(3, &correction);

        assert_eq!(buffer.len(), 3);
        assert!(buffer.records.iter().all(|r| r.sequence > 3));
    }
}
