//! Image map creation: validation, placeholder reservation, single-flight admission per owner,
//! background building and compensating rollback.

pub mod application;
pub mod config;
pub mod domain;
pub mod infra;
pub mod util;
