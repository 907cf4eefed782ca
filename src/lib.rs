//! Batch simulation of food-web biomass dynamics under the allometric
//! trophic network model, with early stopping at constant or oscillating
//! steady states.

pub mod batch;
pub mod config;
pub mod detector;
pub mod events;
pub mod foodweb;
pub mod model;
pub mod sampler;
pub mod simulation;
pub mod solver;
pub mod system;
