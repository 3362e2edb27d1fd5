//! Authoritative match state: the simulated aircraft, per-tick input
//! application and the game-mode policy hooks.
//!
//! One `Match` is the single simulation owner; the network loop feeds it
//! inputs already serialized per connection and calls `tick` at the fixed
//! rate. Nothing here touches a socket or a clock: `tick` takes inputs and
//! a timestamp so timing stays testable without sleeps.

use crate::session::TimedInput;
use glam::Vec3;
use log::{info, warn};
use rand::Rng;
use shared::{sim, AircraftKind, EntityState, SIM_DT};
use std::collections::{HashMap, HashSet};
use std::time::Duration;

/// Per-mode policy consumed at match start. Minimum player count is a hook
/// the lifecycle sweep consults, not a hardcoded number.
#[derive(Debug, Clone, Copy)]
pub struct GameModePolicy {
    pub min_players: usize,
    pub allow_reconnection: bool,
    pub reconnect_timeout: Duration,
    pub tick_rate_hz: u32,
    pub broadcast_rate_hz: u32,
}

impl Default for GameModePolicy {
    fn default() -> Self {
        Self {
            min_players: 2,
            allow_reconnection: true,
            reconnect_timeout: Duration::from_secs(30),
            tick_rate_hz: 60,
            broadcast_rate_hz: 20,
        }
    }
}

pub struct Match {
    entities: HashMap<u64, EntityState>,
    policy: GameModePolicy,
    next_entity_id: u64,
    pub tick: u64,
    /// Highest input sequence applied per entity; inputs never go backward.
    last_applied: HashMap<u64, u32>,
    /// Set once enough players have joined; below-minimum afterwards flags
    /// the match for ending.
    started: bool,
    flagged_for_end: bool,
}

impl Match {
    pub fn new(policy: GameModePolicy) -> Self {
        Self {
            entities: HashMap::new(),
            policy,
            next_entity_id: 1,
            tick: 0,
            last_applied: HashMap::new(),
            started: false,
            flagged_for_end: false,
        }
    }

    pub fn policy(&self) -> &GameModePolicy {
        &self.policy
    }

    pub fn entities(&self) -> impl Iterator<Item = &EntityState> {
        self.entities.values()
    }

    pub fn entity(&self, entity_id: u64) -> Option<&EntityState> {
        self.entities.get(&entity_id)
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    /// Spawns a fresh aircraft at a randomized ingress point.
    pub fn spawn_entity(&mut self, aircraft: AircraftKind) -> u64 {
        let entity_id = self.next_entity_id;
        self.next_entity_id += 1;

        let mut rng = rand::thread_rng();
        let position = Vec3::new(
            rng.gen_range(-2000.0..2000.0),
            rng.gen_range(800.0..1500.0),
            rng.gen_range(-2000.0..2000.0),
        );

        let mut state = EntityState::new(entity_id, position, aircraft);
        state.linear_velocity = state.rotation * Vec3::NEG_Z * sim::MIN_SPEED;

        info!("spawned entity {} at {:?}", entity_id, position);
        self.entities.insert(entity_id, state);
        entity_id
    }

    /// Replaces an entity's authoritative state outright, the way game
    /// rules do on respawns and teleports.
    pub fn set_entity_state(&mut self, state: EntityState) {
        self.entities.insert(state.entity_id, state);
    }

    pub fn remove_entity(&mut self, entity_id: u64) {
        if self.entities.remove(&entity_id).is_some() {
            self.last_applied.remove(&entity_id);
            info!("removed entity {}", entity_id);
        }
    }

    pub fn last_applied_sequence(&self, entity_id: u64) -> u32 {
        self.last_applied.get(&entity_id).copied().unwrap_or(0)
    }

    /// Advances the authoritative simulation by one tick.
    ///
    /// `inputs` holds at most one input per entity, already selected
    /// most-recent-wins by the session layer; anything with a sequence at or
    /// below the last applied one is dropped here as a final guard. Entities
    /// with no fresh input coast on their held controls.
    pub fn tick(&mut self, inputs: &[(u64, TimedInput)], server_time: u64) {
        let mut applied_this_tick: HashSet<u64> = HashSet::new();

        for (entity_id, input) in inputs {
            if applied_this_tick.contains(entity_id) {
                warn!("entity {}: second input in one tick dropped", entity_id);
                continue;
            }
            let last = self.last_applied_sequence(*entity_id);
            if input.sequence <= last {
                warn!(
                    "entity {}: input sequence {} not after {}, dropped",
                    entity_id, input.sequence, last
                );
                continue;
            }
            if let Some(state) = self.entities.get_mut(entity_id) {
                state.inputs = input.inputs.clamped();
                self.last_applied.insert(*entity_id, input.sequence);
                applied_this_tick.insert(*entity_id);
            }
        }

        for state in self.entities.values_mut() {
            let inputs = state.inputs;
            let mut next = sim::apply_input(state, &inputs, SIM_DT);
            next.sequence = state.sequence + 1;
            next.timestamp = server_time;
            *state = next;
        }

        self.tick += 1;
    }

    /// Policy hook run after lifecycle changes: once the match has started,
    /// dropping below the mode's minimum flags it for ending rather than
    /// letting it keep running with an invalid player count.
    pub fn review_player_count(&mut self, players: usize) {
        if players >= self.policy.min_players {
            self.started = true;
        } else if self.started && !self.flagged_for_end {
            warn!(
                "player count {} below minimum {}, flagging match for ending",
                players, self.policy.min_players
            );
            self.flagged_for_end = true;
        }
    }

    pub fn is_flagged_for_end(&self) -> bool {
        self.flagged_for_end
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::ControlInputs;

    fn full_throttle(sequence: u32) -> TimedInput {
        TimedInput {
            sequence,
            timestamp: sequence as u64 * 16,
            inputs: ControlInputs {
                throttle: 1.0,
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_spawn_and_remove() {
        let mut game = Match::new(GameModePolicy::default());
        let id = game.spawn_entity(AircraftKind::Fighter);
        assert_eq!(game.entity_count(), 1);
        assert!(game.entity(id).is_some());

        game.remove_entity(id);
        assert_eq!(game.entity_count(), 0);
    }

    #[test]
    fn test_tick_advances_all_entities() {
        let mut game = Match::new(GameModePolicy::default());
        let a = game.spawn_entity(AircraftKind::Fighter);
        let b = game.spawn_entity(AircraftKind::Bomber);
        let pos_a = game.entity(a).unwrap().position;
        let pos_b = game.entity(b).unwrap().position;

        game.tick(&[], 1000);

        assert_ne!(game.entity(a).unwrap().position, pos_a);
        assert_ne!(game.entity(b).unwrap().position, pos_b);
        assert_eq!(game.tick, 1);
        assert_eq!(game.entity(a).unwrap().timestamp, 1000);
    }

    #[test]
    fn test_sequence_never_goes_backward() {
        let mut game = Match::new(GameModePolicy::default());
        let id = game.spawn_entity(AircraftKind::Fighter);

        game.tick(&[(id, full_throttle(5))], 1000);
        assert_eq!(game.last_applied_sequence(id), 5);

        // An older sequence arriving later must not be applied.
        let with_pitch = TimedInput {
            sequence: 3,
            timestamp: 48,
            inputs: ControlInputs {
                pitch: 1.0,
                ..Default::default()
            },
        };
        game.tick(&[(id, with_pitch)], 1016);
        assert_eq!(game.last_applied_sequence(id), 5);
        assert_eq!(game.entity(id).unwrap().inputs.pitch, 0.0);
    }

    #[test]
    fn test_one_input_per_entity_per_tick() {
        let mut game = Match::new(GameModePolicy::default());
        let id = game.spawn_entity(AircraftKind::Fighter);

        game.tick(&[(id, full_throttle(1)), (id, full_throttle(2))], 1000);
        // The second entry for the same entity within one tick is dropped.
        assert_eq!(game.last_applied_sequence(id), 1);
    }

    #[test]
    fn test_held_inputs_coast_between_ticks() {
        let mut game = Match::new(GameModePolicy::default());
        let id = game.spawn_entity(AircraftKind::Fighter);

        game.tick(&[(id, full_throttle(1))], 1000);
        let speed_after_one = game.entity(id).unwrap().linear_velocity.length();

        // No new input: the held throttle keeps accelerating the aircraft.
        game.tick(&[], 1016);
        let speed_after_two = game.entity(id).unwrap().linear_velocity.length();
        assert!(speed_after_two > speed_after_one);
    }

    #[test]
    fn test_entity_sequence_increases_each_tick() {
        let mut game = Match::new(GameModePolicy::default());
        let id = game.spawn_entity(AircraftKind::Fighter);

        game.tick(&[], 1000);
        game.tick(&[], 1016);
        assert_eq!(game.entity(id).unwrap().sequence, 2);
    }

    #[test]
    fn test_min_players_policy_hook() {
        let mut game = Match::new(GameModePolicy {
            min_players: 2,
            ..Default::default()
        });

        game.review_player_count(1);
        assert!(!game.is_flagged_for_end()); // never started

        game.review_player_count(2);
        assert!(!game.is_flagged_for_end());

        game.review_player_count(1);
        assert!(game.is_flagged_for_end());
    }
}
