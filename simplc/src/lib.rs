//! A simulated PLC: named process variables mirrored into a Modbus register bank
//! and an OPC UA address space, built on [tokio-modbus](https://github.com/slowtec/tokio-modbus).

//! ## Overview
//!
//! Each variable has one canonical value. A change made through the
//! [`api::VariableApi`], by an external Modbus master or by an external OPC UA
//! client is committed to the canonical value and then pushed to every other bound
//! store, never back to the one it came from.
//!
//! - [`registry::VariableRegistry`] owns the variables and rejects colliding bindings,
//! - [`codec`] converts canonical values to Modbus words under a configurable byte and word order,
//! - [`sync::SyncEngine`] serializes the changes of each variable in arrival order.
//!
//! Variables are declared in a YAML document, see [`config`].
//!
//! See `examples/tank.rs` for a tank simulation.

/// Canonical value types
pub mod value;
/// Utilities for encoding values to and decoding them from Modbus registers
pub mod codec;
pub mod variable;
pub mod registry;
/// Register bank interface, in-memory data store and Modbus TCP slave
pub mod modbus;
/// Address space interface and in-memory address space
pub mod opcua;
pub mod sync;
pub mod api;
pub mod config;
/// REST endpoints
pub mod rest;
/// Periodic simulation tasks
pub mod scheduler;
pub mod error;

pub use api::{VariableApi, VariableView};
pub use error::{Error, Result};
pub use sync::{SyncEngine, WriteOutcome};
pub use value::{Value, ValueType};
