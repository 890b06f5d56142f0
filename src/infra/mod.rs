//! Infrastructure adapters and runtime bootstrap.

pub mod builder;
pub mod error;
pub mod memory;
pub mod policy;
pub mod remote;
pub mod telemetry;
pub mod uploads;
