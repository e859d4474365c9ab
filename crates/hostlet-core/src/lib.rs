//! hostlet-core: Core types for the hostlet coordinator
//!
//! This crate provides the fundamental types shared by every hostlet crate:
//! - PCI passthrough devices and host device probing
//! - VM descriptors, cluster records and ownership identities
//! - Configuration types
//! - Configuration-time conflict detection
//! - Error handling

pub mod config;
pub mod conflict;
pub mod device;
pub mod error;
pub mod model;

pub use config::*;
pub use conflict::*;
pub use device::*;
pub use error::*;
pub use model::*;
