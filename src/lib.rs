//! plazasim: live simulation core of a shared 3D social world
//! (local movement, collisions, rooms, NPCs, props, network reconciliation)

pub mod types;
pub mod api;
pub mod config;
pub mod error;
pub mod logging;
pub mod narrowphase;
pub mod catalog;
pub mod resolver;
pub mod movement;
pub mod room;
pub mod entity;
pub mod npc;
pub mod prop;
pub mod net;
pub mod sim;

pub use crate::types::*;
pub use crate::api::*;
pub use crate::config::SimConfig;
pub use crate::error::{SimError, SimResult};
pub use crate::sim::{Simulation, TickReport};
