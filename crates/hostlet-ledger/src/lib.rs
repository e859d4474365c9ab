//! hostlet-ledger: Device ownership for hostlet
//!
//! This crate owns the only state shared between hostlet processes:
//! - The ledger file and its host-wide lock
//! - Atomic allocation, release and handover of passthrough devices

pub mod allocator;
pub mod ledger;

pub use allocator::{AllocationConflict, AllocationError, ResourceAllocator};
pub use ledger::{Ledger, LedgerEntry, LedgerError, LedgerState, LEDGER_VERSION};
