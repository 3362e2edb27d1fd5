//! # Flight-Combat Client Library
//!
//! Client side of the state synchronization core: prediction for the local
//! aircraft, reconciliation against server corrections and delayed
//! interpolation of remote aircraft.
//!
//! ## Client-Side Prediction
//! The client applies its own control inputs immediately through the shared
//! deterministic flight model instead of waiting for server confirmation,
//! recording every tick in a bounded history ring.
//!
//! ## Server Reconciliation
//! When an authoritative correction arrives for an earlier input sequence,
//! the recorded inputs issued after it are replayed from the corrected
//! state, so the newest prediction always agrees with the server plus all
//! unconfirmed local inputs. Negligible drift is blended instead of snapped.
//!
//! ## Interpolation
//! Remote aircraft are rendered a fixed delay behind the newest snapshot,
//! with slerped rotation, so bursty snapshot arrival turns into smooth
//! motion.
//!
//! ## Module Organization
//!
//! - [`prediction`]: the prediction record ring and reconciliation.
//! - [`interpolation`]: per-remote-entity delayed sampling buffers.
//! - [`engine`]: the per-frame synchronization engine tying the above to
//!   the delta codec and clock estimate; fully synchronous.
//! - [`network`]: the async UDP shell driving the engine.
//!
//! The presentation layer reads [`engine::SyncEngine::local_state`] and
//! [`engine::SyncEngine::sample_remotes`] each frame; it never writes into
//! the core's buffers.

pub mod engine;
pub mod interpolation;
pub mod network;
pub mod prediction;
