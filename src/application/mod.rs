//! Creation pipeline services and the collaborator seams they drive.

pub mod collaborators;
pub mod creation;
pub mod error;
pub mod reservation;
pub mod tasks;
pub mod validator;
