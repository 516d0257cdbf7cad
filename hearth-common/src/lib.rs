//! Hearth Common - Shared configuration and management protocol types

pub mod config;
pub mod messages;

pub use config::*;
pub use messages::*;
