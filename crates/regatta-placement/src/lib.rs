//! Placement: worker-pool engine plus pluggable strategies.

pub mod engine;
pub mod strategy;

pub use engine::{EngineConfig, PlacementEngine};
pub use strategy::{strategy_for, BatchStrategy, PlacementStrategy, ScoredStrategy};
