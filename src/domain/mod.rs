//! Domain types for image maps and their creation requests.

pub mod entities;
pub mod error;
pub mod source;
pub mod types;
