//! Edge control core for a CAN-bus relay cabinet: SocketCAN transport,
//! relay protocol codec, device state, control job queue, batch optimizer,
//! sensor value table and automation strategy engine.
//!
//! This crate owns everything up to (but not including) the JSON-RPC/MQTT
//! wire surface, config persistence and logging sink — those are external
//! collaborators wired up by the `agent` binary.

pub mod can;
pub mod clock;
pub mod config;
pub mod context;
pub mod devices;
pub mod error;
pub mod queue;
pub mod sensors;
pub mod strategy;

pub use clock::Clock;
pub use context::CoreContext;
pub use error::{CoreError, CoreResult};
