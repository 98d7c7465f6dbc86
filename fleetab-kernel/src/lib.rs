//! FleetAB kernel : plan de contrôle des expériences A/B de configurations de télémétrie.
//!
//! Le binaire `fleetab-kernel` assemble ces modules ; la bibliothèque est exposée pour les
//! tests d'intégration et pour embarquer le plan de contrôle ailleurs.

pub mod agents;
pub mod analysis;
pub mod config;
pub mod controller;
pub mod coordinator;
pub mod events;
pub mod health;
pub mod http;
pub mod metrics;
pub mod models;
pub mod mqtt;
pub mod state;
pub mod store;
