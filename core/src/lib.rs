//! TimeSpine: speculative timeline branching for a host simulation.
//!
//! The engine keeps one authoritative main timeline plus any number of
//! speculative branches forked from it. Branches advance in lock-step
//! with the main timeline, freeze when they drift too far or run too
//! long, can be compared entity-by-entity, and can be merged back.

pub mod arena;
pub mod branch;
pub mod clock;
pub mod command;
pub mod comparator;
pub mod config;
pub mod divergence;
pub mod engine;
pub mod error;
pub mod event;
pub mod host;
pub mod lifecycle;
pub mod merge;
pub mod modification;
pub mod registry;
pub mod rng;
pub mod sandbox;
pub mod scenario;
pub mod snapshot;
pub mod state;
pub mod store;
pub mod types;
