//! Client-side synchronization engine.
//!
//! Owns the prediction buffer for the local aircraft, one interpolation
//! buffer per remote aircraft, the delta baselines for decoding snapshots
//! and the clock estimate. All methods are synchronous; the async network
//! shell feeds packets in through a queue drained once per frame and sends
//! whatever `frame` and `maybe_probe` hand back.

use crate::interpolation::InterpolationBuffer;
use crate::prediction::{PredictionBuffer, ReconciliationConfig};
use log::{debug, info, warn};
use shared::clock::{ClockSync, PROBE_INTERVAL_MS, PROBE_TIMEOUT_MS};
use shared::{codec, sim};
use shared::{ControlInputs, EntityState, Packet, StateDelta, INTERPOLATION_DELAY_MS, SIM_DT};
use std::collections::HashMap;

/// Network send cadence: a delta goes out at most this often even though
/// prediction steps every frame.
pub const SEND_INTERVAL_MS: u64 = 50;

pub struct SyncEngine {
    entity_id: Option<u64>,
    /// Latest predicted state of the local aircraft; render reads this
    /// directly, with no interpolation delay.
    local: Option<EntityState>,
    next_sequence: u32,
    prediction: PredictionBuffer,
    remotes: HashMap<u64, InterpolationBuffer>,
    /// Last decoded state per remote entity, the base the next delta merges
    /// over.
    remote_bases: HashMap<u64, EntityState>,
    last_sent: Option<EntityState>,
    last_send_ms: u64,
    clock: ClockSync,
    pending_probe: Option<u64>,
    last_probe_ms: u64,
}

impl SyncEngine {
    pub fn new(config: ReconciliationConfig) -> Self {
        Self {
            entity_id: None,
            local: None,
            next_sequence: 1,
            prediction: PredictionBuffer::new(config),
            remotes: HashMap::new(),
            remote_bases: HashMap::new(),
            last_sent: None,
            last_send_ms: 0,
            clock: ClockSync::new(),
            pending_probe: None,
            last_probe_ms: 0,
        }
    }

    pub fn entity_id(&self) -> Option<u64> {
        self.entity_id
    }

    pub fn is_joined(&self) -> bool {
        self.entity_id.is_some()
    }

    pub fn average_latency_ms(&self) -> f64 {
        self.clock.average_latency_ms()
    }

    pub fn jitter_ms(&self) -> f64 {
        self.clock.jitter_ms()
    }

    /// Adopts the join grant: our entity id and authoritative spawn state.
    pub fn handle_join(&mut self, entity_id: u64, state: EntityState) {
        info!("joined as entity {}", entity_id);
        self.entity_id = Some(entity_id);
        self.local = Some(state);
        self.next_sequence = 1;
        self.last_sent = None;
    }

    /// Advances local prediction by one fixed step and, when the send
    /// interval has elapsed, returns the delta to transmit.
    pub fn frame(&mut self, raw_input: ControlInputs, now_ms: u64) -> Option<StateDelta> {
        let current = self.local.as_ref()?;
        let input = raw_input.clamped();

        let sequence = self.next_sequence;
        self.next_sequence += 1;

        let mut predicted = sim::apply_input(current, &input, SIM_DT);
        predicted.sequence = sequence;
        predicted.timestamp = self.clock.remote_time(now_ms);
        self.prediction.record_local(sequence, input, predicted.clone());
        self.local = Some(predicted);

        // Keep-alive: a delta goes out every send interval even when every
        // field is below threshold.
        if now_ms.saturating_sub(self.last_send_ms) < SEND_INTERVAL_MS {
            return None;
        }
        self.last_send_ms = now_ms;

        let current = self.local.clone()?;
        let delta = codec::encode(self.last_sent.as_ref(), &current);
        self.last_sent = Some(current);
        Some(delta)
    }

    /// Emits a clock probe when one is due; abandons a probe that timed out
    /// so a lost reply only skips that sample.
    pub fn maybe_probe(&mut self, now_ms: u64) -> Option<Packet> {
        if let Some(sent_at) = self.pending_probe {
            if now_ms.saturating_sub(sent_at) > PROBE_TIMEOUT_MS {
                debug!("clock probe timed out, skipping sample");
                self.pending_probe = None;
            } else {
                return None;
            }
        }

        if now_ms.saturating_sub(self.last_probe_ms) < PROBE_INTERVAL_MS && self.clock.is_synced() {
            return None;
        }

        self.pending_probe = Some(now_ms);
        self.last_probe_ms = now_ms;
        Some(Packet::Ping {
            client_time: now_ms,
        })
    }

    /// Feeds one inbound packet into the core. Called by the frame loop
    /// while draining the receive queue.
    pub fn handle_packet(&mut self, packet: Packet, now_ms: u64) {
        match packet {
            Packet::Correction {
                acked_sequence,
                state,
            } => {
                if Some(state.entity_id) != self.entity_id {
                    warn!("correction for foreign entity {}", state.entity_id);
                    return;
                }
                let mut reconciled = self.prediction.reconcile(acked_sequence, &state);
                // The entity carries the server's per-tick counter; input
                // sequencing stays on our own.
                reconciled.sequence = self.next_sequence.saturating_sub(1);
                self.local = Some(reconciled);
            }

            Packet::Snapshot {
                server_time: _,
                entities,
            } => {
                for delta in entities {
                    self.apply_remote_delta(delta);
                }
            }

            Packet::Pong {
                client_time,
                server_time,
            } => {
                // Only the probe we actually have outstanding counts; a
                // stray or duplicate pong is ignored.
                if self.pending_probe == Some(client_time) {
                    self.pending_probe = None;
                    self.clock.apply_reply(now_ms, client_time, server_time);
                }
            }

            Packet::EntityLeft { entity_id } => {
                debug!("entity {} left", entity_id);
                self.remotes.remove(&entity_id);
                self.remote_bases.remove(&entity_id);
            }

            _ => {
                warn!("unexpected packet type in engine");
            }
        }
    }

    fn apply_remote_delta(&mut self, delta: StateDelta) {
        if Some(delta.entity_id) == self.entity_id {
            // Own entity arrives via corrections, never via snapshots.
            return;
        }

        let decoded = match self.remote_bases.get(&delta.entity_id) {
            Some(base) => codec::decode(base, &delta),
            None if delta.is_full() => {
                let placeholder =
                    EntityState::new(delta.entity_id, glam::Vec3::ZERO, Default::default());
                codec::decode(&placeholder, &delta)
            }
            None => {
                // A partial delta without a baseline cannot be merged; the
                // next full state for this entity re-seeds us.
                warn!("dropping partial delta for unknown entity {}", delta.entity_id);
                return;
            }
        };

        self.remote_bases.insert(delta.entity_id, decoded.clone());
        self.remotes
            .entry(delta.entity_id)
            .or_default()
            .push(decoded);
    }

    /// Latest predicted state of the local aircraft, for the render layer.
    pub fn local_state(&self) -> Option<&EntityState> {
        self.local.as_ref()
    }

    /// Samples every remote entity at the delayed render time.
    pub fn sample_remotes(&mut self, now_ms: u64) -> Vec<EntityState> {
        let render_now = self.clock.remote_time(now_ms);
        self.remotes
            .values_mut()
            .filter_map(|buffer| buffer.sample(render_now))
            .collect()
    }

    /// Estimated render delay behind real time for remote entities.
    pub fn render_delay_ms(&self) -> u64 {
        INTERPOLATION_DELAY_MS
    }
}
