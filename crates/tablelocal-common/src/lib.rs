//! tablelocal Common - Shared types and utilities
//!
//! This crate provides the entity data model, error definitions and
//! configuration used across all tablelocal components.

pub mod config;
pub mod entity;
pub mod error;
pub mod types;

pub use config::Config;
pub use entity::{EdmType, Entity, EntityData, Properties, PropertyValue};
pub use error::{Error, ErrorKind, Result};
pub use types::*;
