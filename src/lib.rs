//! Distributed genetic algorithm evolving crawling worm actuators.
//!
//! A population of articulated worms is evaluated on an external physics
//! collaborator through a narrow interface, fanned out across a tree of
//! concurrent workers, and bred toward faster forward locomotion one
//! generation at a time. Branches merge their children's sorted results and
//! re-emit the event sequence a single local engine would have produced, so
//! callers never see the tree.

pub mod config;
pub mod engine;
pub mod error;
pub mod gene;
pub mod physics;
pub mod protocol;
pub mod simulation;
mod worker;
pub mod worm;

pub use config::SimulationOptions;
pub use error::{Result, WormerError};
pub use gene::Gene;
pub use physics::{PhysicsEngine, PhysicsWorld, RapierPhysics};
pub use simulation::{Simulation, SimulationEvent, SimulationSnapshot, SimulationStatus};
pub use worm::Worm;
