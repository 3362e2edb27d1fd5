//! # Authoritative Match Server Library
//!
//! This library implements the authoritative side of the flight sync core.
//! The server owns the canonical aircraft state for one match, consumes
//! sequenced client inputs, runs the shared flight model at a fixed tick
//! rate, and broadcasts corrections and delta snapshots back to clients.
//!
//! ## Core Responsibilities
//!
//! ### Authoritative Simulation
//! The server runs the definitive flight simulation with the same
//! deterministic step clients use for prediction. Inputs are applied at
//! most once per entity per tick, strictly in sequence order, so a client
//! replaying its unacknowledged inputs on top of a correction lands on the
//! same state the server computed.
//!
//! ### Session Lifecycle
//! Connections run through authentication, join, transport loss and either
//! reconnection inside a grace window (keeping their aircraft alive) or
//! final teardown. One failed connection never affects another.
//!
//! ### State Broadcasting
//! At the broadcast rate, each client receives its own aircraft's full
//! corrected state tagged with the last acknowledged input sequence, plus
//! delta-encoded snapshots of every other aircraft against per-client
//! baselines.
//!
//! ## Architecture
//!
//! The main loop is the single owner of all match and session state. A
//! receiver task feeds decoded packets onto a channel, a sender task drains
//! the outbound queue, and one `select!` interleaves inbound handling with
//! the tick, broadcast and liveness-sweep intervals. No locks, no shared
//! mutable state.
//!
//! ## Module Organization
//!
//! - [`session`]: connection lifecycle, input queuing and the registry
//! - [`match_state`]: authoritative entities, tick application and the
//!   game-mode policy hooks
//! - [`network`]: UDP transport and the coordinating server loop

pub mod match_state;
pub mod network;
pub mod session;
